use super::jobs::{Job, JobState};
use super::request::GenerationRequest;
use super::segments::Segment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssemblyMethod {
    FastCopy,
    ReEncode,
}

impl AssemblyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyMethod::FastCopy => "fast-copy",
            AssemblyMethod::ReEncode => "re-encode",
        }
    }
}

/// The concatenated output of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyResult {
    pub segment_paths: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub total_duration_secs: u32,
    pub method: AssemblyMethod,
}

/// Everything needed to resume a run for one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub book_id: String,
    pub request: GenerationRequest,
    pub segments: Vec<Segment>,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub assembly: Option<AssemblyResult>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(request: GenerationRequest, segments: Vec<Segment>) -> Self {
        let jobs = segments.iter().map(|s| Job::pending(s.index)).collect();
        Self {
            version: SNAPSHOT_VERSION,
            book_id: request.book_id.clone(),
            request,
            segments,
            jobs,
            assembly: None,
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn segment(&self, index: u32) -> Option<&Segment> {
        self.segments.iter().find(|s| s.index == index)
    }

    pub fn job(&self, index: u32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.segment_index == index)
    }

    pub fn job_mut(&mut self, index: u32) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.segment_index == index)
    }

    /// Replaces the stored job for the same segment.
    pub fn apply(&mut self, job: Job) {
        if let Some(slot) = self.job_mut(job.segment_index) {
            *slot = job;
        }
        self.touch();
    }

    pub fn all_completed(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(|j| j.state == JobState::Completed)
    }

    /// Artifact paths of completed jobs, ordinal order.
    pub fn ordered_artifacts(&self) -> Vec<PathBuf> {
        let mut jobs: Vec<&Job> = self.jobs.iter().collect();
        jobs.sort_by_key(|j| j.segment_index);
        jobs.into_iter()
            .filter(|j| j.state == JobState::Completed)
            .filter_map(|j| j.artifact_path.clone())
            .collect()
    }

    pub fn total_duration_secs(&self) -> u32 {
        self.segments.iter().map(|s| s.duration.secs()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedSegment {
    pub index: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFailure {
    pub index: u32,
    pub state: JobState,
    pub reason: String,
}

/// Outcome of one pipeline invocation, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub book_id: String,
    pub completed_segments: Vec<CompletedSegment>,
    pub failed_segments: Vec<SegmentFailure>,
    pub undispatched_segments: Vec<u32>,
    pub final_artifact: Option<AssemblyResult>,
    pub assembly_error: Option<String>,
    pub cancelled: bool,
}

impl RunResult {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        let mut jobs: Vec<&Job> = snapshot.jobs.iter().collect();
        jobs.sort_by_key(|j| j.segment_index);

        let mut completed_segments = Vec::new();
        let mut failed_segments = Vec::new();
        let mut undispatched_segments = Vec::new();

        for job in jobs {
            match job.state {
                JobState::Completed => {
                    if let Some(path) = &job.artifact_path {
                        completed_segments.push(CompletedSegment {
                            index: job.segment_index,
                            path: path.clone(),
                        });
                    }
                }
                JobState::Failed | JobState::TimedOut => failed_segments.push(SegmentFailure {
                    index: job.segment_index,
                    state: job.state,
                    reason: job.error.clone().unwrap_or_default(),
                }),
                JobState::Pending => undispatched_segments.push(job.segment_index),
                // Left in flight by a cancelled or exhausted run
                JobState::Submitted | JobState::InProgress => {
                    undispatched_segments.push(job.segment_index)
                }
            }
        }

        Self {
            book_id: snapshot.book_id.clone(),
            completed_segments,
            failed_segments,
            undispatched_segments,
            final_artifact: snapshot.assembly.clone(),
            assembly_error: None,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.final_artifact.is_some()
    }
}
