//! Error taxonomy for the generation pipeline.

use crate::domain::jobs::JobState;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed request, empty narration, empty path list. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The provider rejected a generation request.
    #[error("submission rejected{}: {message}", fmt_status(.status))]
    Submission { status: Option<u16>, message: String },

    /// A status check could not be completed or returned an unreadable body.
    #[error("status check failed{}: {message}", fmt_status(.status))]
    Poll { status: Option<u16>, message: String },

    /// The job did not reach a terminal state within the wait budget.
    #[error("job {job_id} still running after {waited_secs}s")]
    PollTimeout { job_id: String, waited_secs: u64 },

    /// The artifact of a completed job could not be fetched.
    #[error("download failed{}: {message}", fmt_status(.status))]
    Download { status: Option<u16>, message: String },

    /// Every concatenation strategy failed.
    #[error("assembly failed after all strategies:\n{diagnostics}")]
    Assembly { diagnostics: String },

    #[error("no session found for book {0}")]
    SessionNotFound(String),

    #[error("a run for book {0} is already in progress")]
    RunInProgress(String),

    #[error("illegal job transition {from:?} -> {to:?} for segment {segment}")]
    InvalidTransition {
        segment: u32,
        from: JobState,
        to: JobState,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Errors a caller may reasonably retry (with backoff) without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Submission { .. }
                | PipelineError::Poll { .. }
                | PipelineError::PollTimeout { .. }
                | PipelineError::Download { .. }
        )
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}
