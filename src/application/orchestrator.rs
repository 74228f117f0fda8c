use crate::application::job_client::JobClient;
use crate::config::OrchestratorConfig;
use crate::domain::jobs::{FailureKind, Job, JobState, JobStatus};
use crate::domain::prompt::PromptCompiler;
use crate::domain::request::{safe_name, GenerationRequest};
use crate::domain::segments::Segment;
use crate::domain::session::SessionSnapshot;
use crate::error::Result;
use crate::ports::clock::Clock;
use crate::ports::provider::VideoProvider;
use crate::ports::repository::SnapshotStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What happened to the dispatch queue during one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Jobs after the run, ordinal order
    pub jobs: Vec<Job>,
    /// Selected segments never started
    pub undispatched: Vec<u32>,
    pub cancelled: bool,
    pub budget_exhausted: bool,
}

/// Drives one generation job per segment and checkpoints after every job event.
pub struct SegmentOrchestrator<P, C, S> {
    client: JobClient<P, C>,
    compiler: PromptCompiler,
    store: Arc<S>,
    config: OrchestratorConfig,
}

impl<P, C, S> SegmentOrchestrator<P, C, S>
where
    P: VideoProvider,
    C: Clock,
    S: SnapshotStore,
{
    pub fn new(
        client: JobClient<P, C>,
        compiler: PromptCompiler,
        store: Arc<S>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            compiler,
            store,
            config,
        }
    }

    pub fn book_dir(&self, book_id: &str) -> PathBuf {
        self.config.output_dir.join(safe_name(book_id))
    }

    /// Runs every unfinished segment, or only `selection` when given.
    #[instrument(skip_all, fields(book_id = %snapshot.book_id))]
    pub async fn run(
        &self,
        snapshot: &mut SessionSnapshot,
        selection: Option<&[u32]>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let book_dir = self.book_dir(&snapshot.book_id);
        tokio::fs::create_dir_all(&book_dir).await?;

        let mut queue = self.prepare(snapshot, selection)?;
        self.store.save(snapshot).await?;
        info!(queued = queue.len(), concurrency = self.config.max_concurrency, "Dispatching segments");

        let request = Arc::new(snapshot.request.clone());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Job>();
        let mut in_flight = FuturesUnordered::new();
        let started = self.client.clock().now();
        let mut halted = false;
        let mut budget_exhausted = false;

        loop {
            while in_flight.len() < self.config.max_concurrency.max(1)
                && !halted
                && !cancel.is_cancelled()
            {
                let Some(index) = queue.front().copied() else {
                    break;
                };
                let elapsed = self.client.clock().now().saturating_sub(started);
                let remaining = self.config.run_ceiling.saturating_sub(elapsed);
                if remaining.is_zero() {
                    warn!(segment = index, "Run ceiling reached, not dispatching further segments");
                    budget_exhausted = true;
                    break;
                }
                queue.pop_front();

                let (Some(segment), Some(job)) = (snapshot.segment(index), snapshot.job(index)) else {
                    continue;
                };
                debug!(segment = index, state = ?job.state, "Dispatching segment");
                in_flight.push(self.drive_segment(
                    &book_dir,
                    segment.clone(),
                    request.clone(),
                    job.clone(),
                    self.config.max_wait.min(remaining),
                    cancel.clone(),
                    events_tx.clone(),
                ));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(job) = events_rx.recv() => {
                    snapshot.apply(job);
                    self.store.save(snapshot).await?;
                }
                Some(finished) = in_flight.next() => {
                    let job = finished?;
                    // Updates sent before the job finished still get their own checkpoint
                    while let Ok(update) = events_rx.try_recv() {
                        snapshot.apply(update);
                        self.store.save(snapshot).await?;
                    }
                    let failed = matches!(job.state, JobState::Failed | JobState::TimedOut);
                    if failed && !halted {
                        warn!(
                            segment = job.segment_index,
                            state = ?job.state,
                            error = job.error.as_deref().unwrap_or_default(),
                            "Segment failed, halting dispatch"
                        );
                        halted = true;
                    }
                    snapshot.apply(job);
                    self.store.save(snapshot).await?;
                }
            }
        }

        let mut jobs = snapshot.jobs.clone();
        jobs.sort_by_key(|j| j.segment_index);

        Ok(RunOutcome {
            jobs,
            undispatched: queue.into_iter().collect(),
            cancelled: cancel.is_cancelled(),
            budget_exhausted,
        })
    }

    /// Picks the segments to dispatch and puts their jobs in a dispatchable state.
    fn prepare(&self, snapshot: &mut SessionSnapshot, selection: Option<&[u32]>) -> Result<VecDeque<u32>> {
        let mut indices: Vec<u32> = snapshot.segments.iter().map(|s| s.index).collect();
        indices.sort_unstable();

        let mut queue = VecDeque::new();
        for index in indices {
            if selection.is_some_and(|selected| !selected.contains(&index)) {
                continue;
            }
            let Some(job) = snapshot.job_mut(index) else {
                continue;
            };

            if job.state == JobState::Completed {
                let present = job.artifact_path.as_deref().is_some_and(Path::is_file);
                if present {
                    debug!(segment = index, "Artifact present, skipping");
                    continue;
                }
                warn!(segment = index, "Artifact missing, fetching again");
                job.invalidate_artifact();
            }

            if matches!(job.state, JobState::Failed | JobState::TimedOut) && !job.can_reattach() {
                job.reset()?;
            }
            queue.push_back(index);
        }
        snapshot.touch();
        Ok(queue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_segment(
        &self,
        book_dir: &Path,
        segment: Segment,
        request: Arc<GenerationRequest>,
        mut job: Job,
        wait: Duration,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<Job>,
    ) -> Result<Job> {
        let index = segment.index;

        let handle = match job.handle().filter(|_| job.can_reattach()) {
            Some(handle) => {
                info!(segment = index, job_id = %handle.id, "Re-attaching to existing job");
                if job.state == JobState::Failed {
                    job.mark_in_progress(None)?;
                    let _ = events.send(job.clone());
                }
                handle
            }
            None => {
                let prompt = self.compiler.compile(&segment, &request);
                let submitted = self
                    .client
                    .submit(
                        &prompt,
                        segment.duration.secs(),
                        segment.style.aspect_ratio,
                        request.reference_image.as_deref(),
                    )
                    .await;
                match submitted {
                    Ok(handle) => {
                        job.mark_submitted(&handle)?;
                        let _ = events.send(job.clone());
                        handle
                    }
                    Err(e) => {
                        error!(segment = index, error = %e, "Submission failed");
                        job.mark_failed(FailureKind::Submission, e.to_string())?;
                        return Ok(job);
                    }
                }
            }
        };

        let awaited = {
            let mut last_progress = job.progress;
            let waiting = self.client.await_completion_with(
                &handle,
                wait,
                self.config.poll_interval,
                |status| {
                    let JobStatus::InProgress { progress } = status else {
                        return;
                    };
                    if job.state == JobState::InProgress && *progress == last_progress {
                        return;
                    }
                    last_progress = *progress;
                    if job.mark_in_progress(*progress).is_ok() {
                        let _ = events.send(job.clone());
                    }
                },
            );
            tokio::select! {
                awaited = waiting => Some(awaited),
                _ = cancel.cancelled() => None,
            }
        };

        let Some(awaited) = awaited else {
            info!(segment = index, job_id = %handle.id, "Cancelled while waiting");
            return Ok(job);
        };

        match awaited {
            Ok(JobStatus::Completed) => {
                if cancel.is_cancelled() {
                    info!(segment = index, "Completed after cancellation, discarding");
                    return Ok(job);
                }
                let bytes = match self.client.download(&handle).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(segment = index, job_id = %handle.id, error = %e, "Download failed");
                        job.mark_failed(FailureKind::Download, e.to_string())?;
                        return Ok(job);
                    }
                };
                if cancel.is_cancelled() {
                    info!(segment = index, "Downloaded after cancellation, discarding");
                    return Ok(job);
                }
                let path = book_dir.join(format!("segment_{}.mp4", index));
                match write_artifact(&path, &bytes).await {
                    Ok(()) => {
                        info!(segment = index, path = %path.display(), bytes = bytes.len(), "Segment ready");
                        job.mark_completed(path)?;
                    }
                    Err(e) => {
                        error!(segment = index, error = %e, "Could not store artifact");
                        job.mark_failed(FailureKind::Storage, e.to_string())?;
                    }
                }
            }
            Ok(JobStatus::Failed { reason }) => {
                error!(segment = index, job_id = %handle.id, reason = %reason, "Provider reported failure");
                job.mark_failed(FailureKind::Remote, reason)?;
            }
            Ok(JobStatus::TimedOut { waited }) => {
                job.mark_timed_out(waited)?;
            }
            Ok(other) => {
                warn!(segment = index, status = ?other, "Wait ended on a non-terminal status");
                job.mark_timed_out(wait)?;
            }
            Err(e) => {
                error!(segment = index, job_id = %handle.id, error = %e, "Status check failed");
                job.mark_failed(FailureKind::Poll, e.to_string())?;
            }
        }
        Ok(job)
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let partial = path.with_extension("mp4.part");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::{ManualClock, MemorySnapshotStore};
    use crate::domain::jobs::JobHandle;
    use crate::domain::request::{AspectRatio, SegmentationMode};
    use crate::domain::segments::{PlannerConfig, SegmentPlanner};
    use crate::error::PipelineError;
    use crate::ports::provider::{MockVideoProvider, VideoJob, VideoJobStatus};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const NARRATION: &str = "一つ目の場面。二つ目の場面。三つ目の場面。";

    fn snapshot() -> SessionSnapshot {
        let request = GenerationRequest::new(
            "book-1",
            NARRATION,
            36,
            AspectRatio::Wide,
            SegmentationMode::Parts,
        );
        let segments = SegmentPlanner::new(PlannerConfig::default())
            .unwrap()
            .plan_request(&request)
            .unwrap();
        SessionSnapshot::new(request, segments)
    }

    fn config(dir: &TempDir, max_concurrency: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            output_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(60),
            run_ceiling: Duration::from_secs(600),
            max_concurrency,
        }
    }

    fn orchestrator(
        provider: MockVideoProvider,
        store: Arc<MemorySnapshotStore>,
        config: OrchestratorConfig,
    ) -> SegmentOrchestrator<MockVideoProvider, ManualClock, MemorySnapshotStore> {
        SegmentOrchestrator::new(
            JobClient::new(provider, ManualClock::new(), "sora-2"),
            PromptCompiler::default(),
            store,
            config,
        )
    }

    fn video(id: &str, status: VideoJobStatus) -> VideoJob {
        VideoJob {
            id: id.to_string(),
            status,
            progress: None,
            error: None,
        }
    }

    /// Provider whose job ids follow the segment ordinal in the prompt.
    fn happy_provider(submitted: Arc<Mutex<Vec<String>>>) -> MockVideoProvider {
        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().returning(move |request| {
            let id = format!("video_{}", submitted.lock().unwrap().len() + 1);
            submitted.lock().unwrap().push(request.prompt.clone());
            Ok(video(&id, VideoJobStatus::Queued))
        });
        provider
            .expect_retrieve_video()
            .returning(|id| Ok(video(&id.to_string(), VideoJobStatus::Completed)));
        provider
            .expect_download_content()
            .returning(|id| Ok(Bytes::from(format!("mp4:{}", id))));
        provider
    }

    #[tokio::test]
    async fn test_sequential_run_completes_all_segments() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemorySnapshotStore::new());
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = orchestrator(happy_provider(submitted.clone()), store.clone(), config(&dir, 1));

        let mut snapshot = snapshot();
        let outcome = orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.jobs.iter().all(|j| j.state == JobState::Completed));
        assert!(outcome.undispatched.is_empty());
        assert!(!outcome.cancelled);

        let prompts = submitted.lock().unwrap();
        assert!(prompts[0].contains("Part 1 of 3"));
        assert!(prompts[2].contains("Part 3 of 3"));

        let artifacts = snapshot.ordered_artifacts();
        assert_eq!(
            artifacts,
            vec![
                dir.path().join("book-1").join("segment_1.mp4"),
                dir.path().join("book-1").join("segment_2.mp4"),
                dir.path().join("book-1").join("segment_3.mp4"),
            ]
        );
        assert_eq!(std::fs::read(&artifacts[0]).unwrap(), b"mp4:video_1");

        // Initial save plus submission and completion for each segment
        assert_eq!(store.save_count(), 7);
        let saved = store.load_latest("book-1").await.unwrap().unwrap();
        assert!(saved.all_completed());
    }

    #[tokio::test]
    async fn test_resume_dispatches_only_pending_segment() {
        let dir = TempDir::new().unwrap();
        let book_dir = dir.path().join("book-1");
        std::fs::create_dir_all(&book_dir).unwrap();

        let mut snapshot = snapshot();
        for index in [1, 2] {
            let path = book_dir.join(format!("segment_{}.mp4", index));
            std::fs::write(&path, b"done").unwrap();
            let job = snapshot.job_mut(index).unwrap();
            job.mark_submitted(&JobHandle::new(format!("old_{}", index))).unwrap();
            job.mark_completed(path).unwrap();
        }

        let submitted = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MemorySnapshotStore::new());
        let orchestrator = orchestrator(happy_provider(submitted.clone()), store, config(&dir, 1));

        orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        let prompts = submitted.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Part 3 of 3"));
        assert_eq!(snapshot.ordered_artifacts().len(), 3);
        assert_eq!(std::fs::read(book_dir.join("segment_1.mp4")).unwrap(), b"done");
    }

    #[tokio::test]
    async fn test_failure_halts_further_dispatch() {
        let dir = TempDir::new().unwrap();
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();

        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(video(&format!("video_{}", n), VideoJobStatus::Queued))
        });
        provider.expect_retrieve_video().returning(|id| {
            if id.to_string() == "video_2" {
                Ok(VideoJob {
                    id: id.to_string(),
                    status: VideoJobStatus::Failed,
                    progress: None,
                    error: None,
                })
            } else {
                Ok(video(&id.to_string(), VideoJobStatus::Completed))
            }
        });
        provider
            .expect_download_content()
            .returning(|_| Ok(Bytes::from_static(b"mp4")));

        let store = Arc::new(MemorySnapshotStore::new());
        let orchestrator = orchestrator(provider, store, config(&dir, 1));
        let mut snapshot = snapshot();
        let outcome = orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.jobs[0].state, JobState::Completed);
        assert_eq!(outcome.jobs[1].state, JobState::Failed);
        assert_eq!(outcome.jobs[1].failure, Some(FailureKind::Remote));
        assert_eq!(outcome.jobs[2].state, JobState::Pending);
        assert_eq!(outcome.undispatched, vec![3]);
    }

    #[tokio::test]
    async fn test_submission_error_becomes_failed_job() {
        let dir = TempDir::new().unwrap();
        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().times(1).returning(|_| {
            Err(PipelineError::Submission {
                status: Some(400),
                message: "bad prompt".to_string(),
            })
        });

        let orchestrator = orchestrator(provider, Arc::new(MemorySnapshotStore::new()), config(&dir, 1));
        let mut snapshot = snapshot();
        let outcome = orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.jobs[0].state, JobState::Failed);
        assert_eq!(outcome.jobs[0].failure, Some(FailureKind::Submission));
        assert!(outcome.jobs[0].provider_job_id.is_none());
        assert_eq!(outcome.undispatched, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_timed_out_job_is_reattached_not_resubmitted() {
        let dir = TempDir::new().unwrap();
        let mut snapshot = snapshot();
        for index in [1, 2] {
            let path = dir.path().join(format!("segment_{}.mp4", index));
            std::fs::write(&path, b"done").unwrap();
            let job = snapshot.job_mut(index).unwrap();
            job.mark_submitted(&JobHandle::new(format!("old_{}", index))).unwrap();
            job.mark_completed(path).unwrap();
        }
        let job = snapshot.job_mut(3).unwrap();
        job.mark_submitted(&JobHandle::new("slow_3")).unwrap();
        job.mark_timed_out(Duration::from_secs(60)).unwrap();

        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().never();
        provider
            .expect_retrieve_video()
            .returning(|id| Ok(video(&id.to_string(), VideoJobStatus::Completed)));
        provider
            .expect_download_content()
            .times(1)
            .returning(|_| Ok(Bytes::from_static(b"late")));

        let orchestrator = orchestrator(provider, Arc::new(MemorySnapshotStore::new()), config(&dir, 1));
        let outcome = orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.jobs[2].state, JobState::Completed);
        assert_eq!(outcome.jobs[2].provider_job_id.as_deref(), Some("slow_3"));
    }

    #[tokio::test]
    async fn test_parallel_run_keeps_ordinal_artifacts() {
        let dir = TempDir::new().unwrap();
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MemorySnapshotStore::new());
        let orchestrator = orchestrator(happy_provider(submitted), store.clone(), config(&dir, 3));

        let mut snapshot = snapshot();
        orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<String> = snapshot
            .ordered_artifacts()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["segment_1.mp4", "segment_2.mp4", "segment_3.mp4"]);
        assert_eq!(store.save_count(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let dir = TempDir::new().unwrap();
        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().never();

        let orchestrator = orchestrator(provider, Arc::new(MemorySnapshotStore::new()), config(&dir, 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut snapshot = snapshot();
        let outcome = orchestrator.run(&mut snapshot, None, &cancel).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.undispatched, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_completion_after_cancel_is_discarded() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let mut provider = MockVideoProvider::new();
        provider
            .expect_create_video()
            .times(1)
            .returning(|_| Ok(video("video_1", VideoJobStatus::Queued)));
        provider.expect_retrieve_video().returning(move |id| {
            trigger.cancel();
            Ok(video(&id.to_string(), VideoJobStatus::Completed))
        });
        provider.expect_download_content().never();

        let orchestrator = orchestrator(provider, Arc::new(MemorySnapshotStore::new()), config(&dir, 1));
        let mut snapshot = snapshot();
        let outcome = orchestrator.run(&mut snapshot, None, &cancel).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.jobs[0].state, JobState::Submitted);
        assert_eq!(outcome.jobs[0].provider_job_id.as_deref(), Some("video_1"));
        assert!(!dir.path().join("book-1").join("segment_1.mp4").exists());
        assert_eq!(outcome.undispatched, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_stuck_job_times_out_within_job_budget() {
        let dir = TempDir::new().unwrap();
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let mut provider = MockVideoProvider::new();
        provider
            .expect_create_video()
            .times(1)
            .returning(|_| Ok(video("video_1", VideoJobStatus::Queued)));
        provider.expect_retrieve_video().returning(move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(video(&id.to_string(), VideoJobStatus::InProgress))
        });

        let orchestrator = orchestrator(provider, Arc::new(MemorySnapshotStore::new()), config(&dir, 1));
        let mut snapshot = snapshot();
        let outcome = orchestrator
            .run(&mut snapshot, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 6);
        assert_eq!(outcome.jobs[0].state, JobState::TimedOut);
        assert_eq!(outcome.undispatched, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_selection_limits_dispatch() {
        let dir = TempDir::new().unwrap();
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = orchestrator(
            happy_provider(submitted.clone()),
            Arc::new(MemorySnapshotStore::new()),
            config(&dir, 1),
        );

        let mut snapshot = snapshot();
        let outcome = orchestrator
            .run(&mut snapshot, Some(&[2][..]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(submitted.lock().unwrap().len(), 1);
        assert_eq!(outcome.jobs[1].state, JobState::Completed);
        assert_eq!(outcome.jobs[0].state, JobState::Pending);
    }
}
