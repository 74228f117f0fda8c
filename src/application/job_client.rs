use crate::domain::jobs::{JobHandle, JobStatus};
use crate::domain::request::AspectRatio;
use crate::domain::segments::SegmentDuration;
use crate::error::{PipelineError, Result};
use crate::ports::clock::Clock;
use crate::ports::provider::{VideoCreateRequest, VideoJob, VideoJobStatus, VideoProvider};
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Submits, polls and downloads generation jobs. Never retries on its own.
pub struct JobClient<P, C> {
    provider: P,
    clock: C,
    model: String,
}

impl<P, C> JobClient<P, C>
where
    P: VideoProvider,
    C: Clock,
{
    pub fn new(provider: P, clock: C, model: impl Into<String>) -> Self {
        Self {
            provider,
            clock,
            model: model.into(),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Frame size the provider expects for the model and aspect ratio.
    pub fn size_for(&self, aspect: AspectRatio) -> &'static str {
        let pro = self.model.ends_with("-pro");
        match (aspect, pro) {
            (AspectRatio::Wide, false) => "1280x720",
            (AspectRatio::Tall, false) | (AspectRatio::Square, false) => "720x1280",
            (AspectRatio::Wide, true) => "1792x1024",
            (AspectRatio::Tall, true) | (AspectRatio::Square, true) => "1024x1792",
        }
    }

    #[instrument(skip(self, prompt, reference_image), fields(model = %self.model))]
    pub async fn submit(
        &self,
        prompt: &str,
        duration_secs: u32,
        aspect: AspectRatio,
        reference_image: Option<&Path>,
    ) -> Result<JobHandle> {
        let duration = SegmentDuration::nearest(duration_secs as f64);
        if duration.secs() != duration_secs {
            debug!(requested = duration_secs, coerced = duration.secs(), "Coerced clip duration");
        }

        let request = VideoCreateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            seconds: duration.secs().to_string(),
            size: self.size_for(aspect).to_string(),
            input_reference: reference_image.map(Path::to_path_buf),
        };

        let job = self.provider.create_video(&request).await?;
        if job.status == VideoJobStatus::Failed {
            return Err(PipelineError::Submission {
                status: None,
                message: failure_reason(&job),
            });
        }

        info!(job_id = %job.id, size = %request.size, seconds = %request.seconds, "Job submitted");
        Ok(JobHandle::new(job.id))
    }

    /// One status request. Never sleeps.
    pub async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let job = self.provider.retrieve_video(&handle.id).await?;
        if job.id != handle.id {
            return Err(PipelineError::Poll {
                status: None,
                message: format!("asked for {} but provider answered for {}", handle.id, job.id),
            });
        }

        Ok(match job.status {
            VideoJobStatus::Queued => JobStatus::Queued,
            VideoJobStatus::InProgress => JobStatus::InProgress {
                progress: job.progress,
            },
            VideoJobStatus::Completed => JobStatus::Completed,
            VideoJobStatus::Failed => JobStatus::Failed {
                reason: failure_reason(&job),
            },
        })
    }

    pub async fn await_completion(
        &self,
        handle: &JobHandle,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<JobStatus> {
        self.await_completion_with(handle, max_wait, poll_interval, |_| {})
            .await
    }

    /// Polls every `poll_interval` until the job is terminal. Gives up with
    /// `TimedOut` once the next poll would land at or past `max_wait`.
    /// `on_status` sees every non-terminal status.
    #[instrument(skip(self, on_status), fields(job_id = %handle.id))]
    pub async fn await_completion_with<F>(
        &self,
        handle: &JobHandle,
        max_wait: Duration,
        poll_interval: Duration,
        mut on_status: F,
    ) -> Result<JobStatus>
    where
        F: FnMut(&JobStatus) + Send,
    {
        let start = self.clock.now();
        let mut polls = 0u32;

        loop {
            let status = self.poll(handle).await?;
            polls += 1;
            if status.is_terminal() {
                debug!(polls, "Job reached terminal status");
                return Ok(status);
            }
            on_status(&status);

            let elapsed = self.clock.now().saturating_sub(start);
            if elapsed + poll_interval >= max_wait {
                warn!(polls, waited_secs = elapsed.as_secs(), "Giving up waiting for job");
                return Ok(JobStatus::TimedOut { waited: elapsed });
            }
            self.clock.sleep(poll_interval).await;
        }
    }

    #[instrument(skip(self), fields(job_id = %handle.id))]
    pub async fn download(&self, handle: &JobHandle) -> Result<Bytes> {
        self.provider.download_content(&handle.id).await
    }
}

fn failure_reason(job: &VideoJob) -> String {
    job.error
        .as_ref()
        .map(|e| e.describe())
        .unwrap_or_else(|| String::from("generation failed"))
}
