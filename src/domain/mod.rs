//! Domain layer - Pure business logic.

// Caller input
pub mod request;

// Narration partitioning
pub mod segments;

// Provider instruction text
pub mod prompt;

// Job definitions and state machine
pub mod jobs;

// Resumable run state
pub mod session;
