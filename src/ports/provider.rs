use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Remote job status as reported by the videos API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoJobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoJobError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl VideoJobError {
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => String::from("unknown provider error"),
        }
    }
}

/// Video job object returned by create and retrieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoJob {
    pub id: String,
    pub status: VideoJobStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<VideoJobError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCreateRequest {
    pub model: String,
    pub prompt: String,
    /// "4", "8" or "12"
    pub seconds: String,
    /// e.g. "1280x720"
    pub size: String,
    /// First-frame image for image-to-video
    pub input_reference: Option<PathBuf>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// Submit a generation request. Returns the freshly created job.
    async fn create_video(&self, request: &VideoCreateRequest) -> Result<VideoJob>;

    /// Fetch the current state of a job.
    async fn retrieve_video(&self, video_id: &str) -> Result<VideoJob>;

    /// Fetch the rendered video of a completed job.
    async fn download_content(&self, video_id: &str) -> Result<Bytes>;
}
