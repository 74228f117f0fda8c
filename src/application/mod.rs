//! Application layer - Generic services that use ports.

// Provider interaction with bounded polling
pub mod job_client;

// Per-segment job driving and checkpointing
pub mod orchestrator;

// Final concatenation with fallback
pub mod assembler;

// Caller-facing entry points
pub mod pipeline;
