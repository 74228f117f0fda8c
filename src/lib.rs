//! Promoreel - Book promotion video pipeline
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (request, segments, prompt, jobs, session)
//! - ports/: Trait definitions (provider, snapshot store, clock, concat tool)
//! - adapters/: Concrete implementations (OpenAI videos API, filesystem, ffmpeg)
//! - application/: Generic services (job client, orchestrator, assembler, pipeline)
//! - config: Environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

// Re-exports for convenience
pub use application::pipeline::PromoPipeline;
pub use config::AppConfig;
pub use error::{PipelineError, Result};
