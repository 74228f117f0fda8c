use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of one segment's remote generation attempt.
///
/// `pending -> submitted -> in_progress* -> {completed | failed | timed_out}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;
        match (self, target) {
            (Pending, Submitted) | (Pending, Failed) => true,

            (Submitted, InProgress)
            | (Submitted, Completed)
            | (Submitted, Failed)
            | (Submitted, TimedOut) => true,

            (InProgress, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, TimedOut) => true,

            // Re-attaching to a remote job that outlived our wait budget
            (TimedOut, InProgress)
            | (TimedOut, Completed)
            | (TimedOut, Failed)
            | (TimedOut, TimedOut) => true,

            // Retry paths: fresh submission, or re-download of a finished remote job
            (Failed, Pending) | (TimedOut, Pending) | (Failed, InProgress) => true,

            _ => false,
        }
    }
}

/// What went wrong, used to pick the cheapest retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Submission,
    Poll,
    Remote,
    Download,
    Timeout,
    Storage,
}

/// Reference to a job accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Point-in-time view of a remote job as reported by the job client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress { progress: Option<u8> },
    Completed,
    Failed { reason: String },
    TimedOut { waited: Duration },
}

impl JobStatus {
    /// Terminal from the provider's point of view. `TimedOut` is a local verdict.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub segment_index: u32,
    pub provider_job_id: Option<String>,
    pub state: JobState,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub progress: Option<u8>,
    pub waited_secs: u64,
}

impl Job {
    pub fn pending(segment_index: u32) -> Self {
        Self {
            segment_index,
            provider_job_id: None,
            state: JobState::Pending,
            artifact_path: None,
            error: None,
            failure: None,
            progress: None,
            waited_secs: 0,
        }
    }

    pub fn handle(&self) -> Option<JobHandle> {
        self.provider_job_id.as_deref().map(JobHandle::new)
    }

    fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                segment: self.segment_index,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn mark_submitted(&mut self, handle: &JobHandle) -> Result<()> {
        self.transition(JobState::Submitted)?;
        self.provider_job_id = Some(handle.id.clone());
        self.error = None;
        self.failure = None;
        Ok(())
    }

    pub fn mark_in_progress(&mut self, progress: Option<u8>) -> Result<()> {
        self.transition(JobState::InProgress)?;
        if progress.is_some() {
            self.progress = progress;
        }
        self.error = None;
        self.failure = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, artifact_path: PathBuf) -> Result<()> {
        self.transition(JobState::Completed)?;
        self.artifact_path = Some(artifact_path);
        self.progress = Some(100);
        self.error = None;
        self.failure = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, kind: FailureKind, reason: impl Into<String>) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.failure = Some(kind);
        self.error = Some(reason.into());
        self.artifact_path = None;
        Ok(())
    }

    pub fn mark_timed_out(&mut self, waited: Duration) -> Result<()> {
        self.transition(JobState::TimedOut)?;
        self.waited_secs += waited.as_secs();
        self.failure = Some(FailureKind::Timeout);
        self.error = Some(
            PipelineError::PollTimeout {
                job_id: self.provider_job_id.clone().unwrap_or_default(),
                waited_secs: waited.as_secs(),
            }
            .to_string(),
        );
        Ok(())
    }

    /// A completed job whose file has gone missing. The remote job is kept so the
    /// artifact can be fetched again.
    pub fn invalidate_artifact(&mut self) {
        if self.state != JobState::Completed {
            return;
        }
        let missing = self
            .artifact_path
            .take()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.state = JobState::Failed;
        self.failure = Some(FailureKind::Storage);
        self.error = Some(format!("artifact {} no longer exists", missing));
    }

    /// Forget the remote attempt so the next run submits afresh.
    pub fn reset(&mut self) -> Result<()> {
        self.transition(JobState::Pending)?;
        *self = Job::pending(self.segment_index);
        Ok(())
    }

    /// Whether the next run can reuse the remote job instead of submitting again.
    pub fn can_reattach(&self) -> bool {
        if self.provider_job_id.is_none() {
            return false;
        }
        match self.state {
            JobState::Submitted | JobState::InProgress | JobState::TimedOut => true,
            JobState::Failed => matches!(
                self.failure,
                Some(FailureKind::Download) | Some(FailureKind::Storage)
            ),
            _ => false,
        }
    }
}
