//! OpenAI-style videos API adapter.

mod client;
mod dto;

pub use client::OpenAiVideoClient;
