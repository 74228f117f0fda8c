use crate::application::assembler::VideoAssembler;
use crate::application::orchestrator::SegmentOrchestrator;
use crate::domain::jobs::JobState;
use crate::domain::request::{safe_name, GenerationRequest};
use crate::domain::segments::SegmentPlanner;
use crate::domain::session::{AssemblyResult, RunResult, SessionSnapshot};
use crate::error::{PipelineError, Result};
use crate::ports::clock::Clock;
use crate::ports::media::ConcatExecutor;
use crate::ports::provider::VideoProvider;
use crate::ports::repository::SnapshotStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Entry point for callers: plan, generate, assemble, resume.
pub struct PromoPipeline<P, C, S, E> {
    planner: SegmentPlanner,
    orchestrator: SegmentOrchestrator<P, C, S>,
    assembler: VideoAssembler<E>,
    store: Arc<S>,
    output_dir: PathBuf,
    active: Mutex<HashMap<String, CancellationToken>>,
}

/// Holds the per-book run slot until dropped.
struct RunSlot<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    key: String,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.key);
    }
}

fn lock(active: &Mutex<HashMap<String, CancellationToken>>) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<P, C, S, E> PromoPipeline<P, C, S, E>
where
    P: VideoProvider,
    C: Clock,
    S: SnapshotStore,
    E: ConcatExecutor,
{
    pub fn new(
        planner: SegmentPlanner,
        orchestrator: SegmentOrchestrator<P, C, S>,
        assembler: VideoAssembler<E>,
        store: Arc<S>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            planner,
            orchestrator,
            assembler,
            store,
            output_dir: output_dir.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    // Runs are keyed by the on-disk name, the same key the store and output use.
    fn acquire(&self, book_id: &str, cancel: &CancellationToken) -> Result<RunSlot<'_>> {
        let key = safe_name(book_id);
        let mut active = lock(&self.active);
        if active.contains_key(&key) {
            return Err(PipelineError::RunInProgress(book_id.to_string()));
        }
        active.insert(key.clone(), cancel.clone());
        Ok(RunSlot {
            active: &self.active,
            key,
        })
    }

    pub fn is_running(&self, book_id: &str) -> bool {
        lock(&self.active).contains_key(&safe_name(book_id))
    }

    /// Cancels the book's active run. Returns false when nothing was running.
    pub fn cancel(&self, book_id: &str) -> bool {
        match lock(&self.active).get(&safe_name(book_id)) {
            Some(token) => {
                info!(book_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self, book_id: &str) -> Result<Option<SessionSnapshot>> {
        self.store.load_latest(book_id).await
    }

    pub async fn clear(&self, book_id: &str) -> Result<()> {
        if self.is_running(book_id) {
            return Err(PipelineError::RunInProgress(book_id.to_string()));
        }
        self.store.clear(book_id).await
    }

    pub async fn tool_available(&self) -> bool {
        self.assembler.tool_available().await
    }

    #[instrument(skip(self, request, cancel), fields(book_id = %request.book_id, mode = ?request.mode))]
    pub async fn plan_and_run(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        request.validate()?;
        let _slot = self.acquire(&request.book_id, &cancel)?;

        let segments = self.planner.plan_request(&request)?;
        info!(
            segments = segments.len(),
            total_secs = request.total_duration_secs,
            "Planned segments"
        );
        let snapshot = SessionSnapshot::new(request, segments);
        self.store.save(&snapshot).await?;

        self.drive(snapshot, None, &cancel).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn resume(&self, book_id: &str, cancel: CancellationToken) -> Result<RunResult> {
        let _slot = self.acquire(book_id, &cancel)?;
        let mut snapshot = self
            .store
            .load_latest(book_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(book_id.to_string()))?;

        if let Some(assembly) = &snapshot.assembly {
            if assembly.output_path.is_file() {
                info!(output = %assembly.output_path.display(), "Already assembled");
                return Ok(RunResult::from_snapshot(&snapshot));
            }
            warn!(output = %assembly.output_path.display(), "Assembled file missing, assembling again");
            snapshot.assembly = None;
        }

        self.drive(snapshot, None, &cancel).await
    }

    /// Re-runs only the listed segments, reusing remote jobs where possible.
    #[instrument(skip(self, cancel))]
    pub async fn retry_segments(
        &self,
        book_id: &str,
        indices: &[u32],
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        if indices.is_empty() {
            return Err(PipelineError::InvalidInput("no segments to retry".into()));
        }
        let _slot = self.acquire(book_id, &cancel)?;
        let mut snapshot = self
            .store
            .load_latest(book_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(book_id.to_string()))?;

        let mut selected = Vec::new();
        for &index in indices {
            let Some(job) = snapshot.job_mut(index) else {
                return Err(PipelineError::InvalidInput(format!(
                    "segment {} does not exist",
                    index
                )));
            };
            match job.state {
                JobState::Failed | JobState::TimedOut => {
                    if !job.can_reattach() {
                        job.reset()?;
                    }
                    selected.push(index);
                }
                other => warn!(segment = index, state = ?other, "Not failed, leaving as is"),
            }
        }
        if selected.is_empty() {
            return Ok(RunResult::from_snapshot(&snapshot));
        }
        snapshot.assembly = None;
        snapshot.touch();

        self.drive(snapshot, Some(selected.as_slice()), &cancel).await
    }

    async fn drive(
        &self,
        mut snapshot: SessionSnapshot,
        selection: Option<&[u32]>,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let outcome = self.orchestrator.run(&mut snapshot, selection, cancel).await?;

        let mut assembly_error = None;
        if !outcome.cancelled && snapshot.all_completed() {
            let paths = snapshot.ordered_artifacts();
            let output = self.final_output_path(&snapshot.book_id);
            match self.assembler.assemble(&paths, &output).await {
                Ok(assembled) => {
                    info!(output = %assembled.output.display(), method = assembled.method.as_str(), "Final video ready");
                    snapshot.assembly = Some(AssemblyResult {
                        segment_paths: paths,
                        output_path: assembled.output,
                        total_duration_secs: snapshot.total_duration_secs(),
                        method: assembled.method,
                    });
                    snapshot.touch();
                    self.store.save(&snapshot).await?;
                }
                Err(e) => {
                    error!(error = %e, "Assembly failed");
                    assembly_error = Some(e.to_string());
                }
            }
        }

        let mut result = RunResult::from_snapshot(&snapshot);
        result.assembly_error = assembly_error;
        result.cancelled = outcome.cancelled;
        info!(
            completed = result.completed_segments.len(),
            failed = result.failed_segments.len(),
            undispatched = result.undispatched_segments.len(),
            assembled = result.final_artifact.is_some(),
            cancelled = result.cancelled,
            "Run finished"
        );
        Ok(result)
    }

    fn final_output_path(&self, book_id: &str) -> PathBuf {
        self.output_dir
            .join(safe_name(book_id))
            .join(format!("final_{}.mp4", chrono::Utc::now().timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::{ManualClock, MemorySnapshotStore};
    use crate::application::job_client::JobClient;
    use crate::config::OrchestratorConfig;
    use crate::domain::jobs::{FailureKind, JobHandle};
    use crate::domain::prompt::PromptCompiler;
    use crate::domain::request::{AspectRatio, SegmentationMode};
    use crate::domain::segments::PlannerConfig;
    use crate::domain::session::AssemblyMethod;
    use crate::ports::media::MockConcatExecutor;
    use crate::ports::provider::{MockVideoProvider, VideoJob, VideoJobStatus};
    use bytes::Bytes;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    type TestPipeline =
        PromoPipeline<MockVideoProvider, ManualClock, MemorySnapshotStore, MockConcatExecutor>;

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "book-1",
            "あ".repeat(40) + "。" + &"い".repeat(34) + "。" + &"う".repeat(40) + "。" + &"え".repeat(32) + "。",
            24,
            AspectRatio::Wide,
            SegmentationMode::Parts,
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

    fn ok_output() -> std::io::Result<Output> {
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    fn happy_provider(created: Arc<AtomicU32>) -> MockVideoProvider {
        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().returning(move |_| {
            let n = created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(video(&format!("video_{}", n), VideoJobStatus::Queued))
        });
        provider
            .expect_retrieve_video()
            .returning(|id| Ok(video(&id.to_string(), VideoJobStatus::Completed)));
        provider
            .expect_download_content()
            .returning(|_| Ok(Bytes::from_static(b"mp4")));
        provider
    }

    fn concat_that_writes_output() -> MockConcatExecutor {
        let mut executor = MockConcatExecutor::new();
        executor.expect_run_concat().returning(|_, output, _| {
            std::fs::write(output, b"final").unwrap();
            ok_output()
        });
        executor
    }

    fn pipeline(
        dir: &TempDir,
        provider: MockVideoProvider,
        executor: MockConcatExecutor,
        store: Arc<MemorySnapshotStore>,
    ) -> TestPipeline {
        let config = OrchestratorConfig {
            output_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(60),
            run_ceiling: Duration::from_secs(600),
            max_concurrency: 1,
        };
        PromoPipeline::new(
            SegmentPlanner::new(PlannerConfig::default()).unwrap(),
            SegmentOrchestrator::new(
                JobClient::new(provider, ManualClock::new(), "sora-2"),
                PromptCompiler::default(),
                store.clone(),
                config,
            ),
            VideoAssembler::new(executor),
            store,
            dir.path(),
        )
    }

    #[tokio::test]
    async fn test_plan_and_run_assembles_final_video() {
        let dir = TempDir::new().unwrap();
        let created = Arc::new(AtomicU32::new(0));
        let store = Arc::new(MemorySnapshotStore::new());
        let pipeline = pipeline(&dir, happy_provider(created.clone()), concat_that_writes_output(), store.clone());

        let result = pipeline
            .plan_and_run(request(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(result.completed_segments.len(), 2);
        assert!(result.failed_segments.is_empty());
        assert!(result.assembly_error.is_none());

        let final_artifact = result.final_artifact.unwrap();
        assert_eq!(final_artifact.method, AssemblyMethod::FastCopy);
        assert_eq!(final_artifact.total_duration_secs, 24);
        assert_eq!(final_artifact.segment_paths.len(), 2);
        assert!(final_artifact.output_path.starts_with(dir.path().join("book-1")));

        let saved = store.load_latest("book-1").await.unwrap().unwrap();
        assert_eq!(saved.assembly, Some(final_artifact));
        assert!(!pipeline.is_running("book-1"));
    }

    #[tokio::test]
    async fn test_resume_of_assembled_session_does_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemorySnapshotStore::new());
        let created = Arc::new(AtomicU32::new(0));
        let first = pipeline(&dir, happy_provider(created.clone()), concat_that_writes_output(), store.clone());
        let done = first
            .plan_and_run(request(), CancellationToken::new())
            .await
            .unwrap();

        let mut provider = MockVideoProvider::new();
        provider.expect_create_video().never();
        provider.expect_retrieve_video().never();
        let mut executor = MockConcatExecutor::new();
        executor.expect_run_concat().never();

        let second = pipeline(&dir, provider, executor, store);
        let resumed = second
            .resume("book-1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.final_artifact, done.final_artifact);
    }

    #[tokio::test]
    async fn test_resume_without_session() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            MockVideoProvider::new(),
            MockConcatExecutor::new(),
            Arc::new(MemorySnapshotStore::new()),
        );
        let err = pipeline
            .resume("nobody", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_runs_only_remaining_segment() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemorySnapshotStore::new());

        let request = GenerationRequest::new(
            "book-1",
            "一つ目。二つ目。三つ目。",
            36,
            AspectRatio::Wide,
            SegmentationMode::Parts,
        );
        let segments = SegmentPlanner::new(PlannerConfig::default())
            .unwrap()
            .plan_request(&request)
            .unwrap();
        let mut snapshot = SessionSnapshot::new(request, segments);
        let book_dir = dir.path().join("book-1");
        std::fs::create_dir_all(&book_dir).unwrap();
        for index in [1, 2] {
            let path = book_dir.join(format!("segment_{}.mp4", index));
            std::fs::write(&path, b"done").unwrap();
            let job = snapshot.job_mut(index).unwrap();
            job.mark_submitted(&JobHandle::new(format!("old_{}", index))).unwrap();
            job.mark_completed(path).unwrap();
        }
        store.save(&snapshot).await.unwrap();

        let created = Arc::new(AtomicU32::new(0));
        let pipeline = pipeline(&dir, happy_provider(created.clone()), concat_that_writes_output(), store);
        let result = pipeline
            .resume("book-1", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        let indices: Vec<u32> = result.completed_segments.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(result.final_artifact.is_some());
    }

    #[tokio::test]
    async fn test_assembly_failure_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let mut executor = MockConcatExecutor::new();
        executor.expect_run_concat().times(2).returning(|_, _, _| {
            Ok(Output {
                status: ExitStatus::from_raw(1 << 8),
                stdout: Vec::new(),
                stderr: b"Invalid data found".to_vec(),
            })
        });

        let pipeline = pipeline(
            &dir,
            happy_provider(Arc::new(AtomicU32::new(0))),
            executor,
            Arc::new(MemorySnapshotStore::new()),
        );
        let result = pipeline
            .plan_and_run(request(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.completed_segments.len(), 2);
        assert!(result.final_artifact.is_none());
        assert!(result.assembly_error.unwrap().contains("Invalid data found"));
    }

    #[tokio::test]
    async fn test_retry_resubmits_failed_segment_only() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemorySnapshotStore::new());

        let mut provider = MockVideoProvider::new();
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();
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

        let pipeline = pipeline(&dir, provider, concat_that_writes_output(), store);
        let first = pipeline
            .plan_and_run(request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.failed_segments.len(), 1);
        assert_eq!(first.failed_segments[0].index, 2);
        assert!(first.final_artifact.is_none());

        let retried = pipeline
            .retry_segments("book-1", &[1, 2], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert!(retried.failed_segments.is_empty());
        assert_eq!(retried.completed_segments.len(), 2);
        assert!(retried.final_artifact.is_some());

        let snapshot = pipeline.snapshot("book-1").await.unwrap().unwrap();
        assert_eq!(snapshot.job(2).unwrap().provider_job_id.as_deref(), Some("video_3"));
        assert_eq!(snapshot.job(1).unwrap().provider_job_id.as_deref(), Some("video_1"));
    }

    #[tokio::test]
    async fn test_concurrent_run_for_same_book_is_rejected() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            MockVideoProvider::new(),
            MockConcatExecutor::new(),
            Arc::new(MemorySnapshotStore::new()),
        );

        let token = CancellationToken::new();
        let _slot = pipeline.acquire("book-1", &token).unwrap();
        let err = pipeline
            .plan_and_run(request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RunInProgress(_)));
        assert!(matches!(
            pipeline.clear("book-1").await,
            Err(PipelineError::RunInProgress(_))
        ));

        assert!(pipeline.cancel("book-1"));
        assert!(token.is_cancelled());
        assert!(!pipeline.cancel("other"));
    }

    #[tokio::test]
    async fn test_similar_book_ids_hold_separate_run_slots() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            MockVideoProvider::new(),
            MockConcatExecutor::new(),
            Arc::new(MemorySnapshotStore::new()),
        );

        let _first = pipeline.acquire("a/b", &CancellationToken::new()).unwrap();
        let _second = pipeline.acquire("a_b", &CancellationToken::new()).unwrap();
        assert!(pipeline.is_running("a/b"));
        assert!(pipeline.is_running("a_b"));
        assert!(!pipeline.is_running("a b"));
        assert!(matches!(
            pipeline.acquire("a/b", &CancellationToken::new()),
            Err(PipelineError::RunInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_planning() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(
            &dir,
            MockVideoProvider::new(),
            MockConcatExecutor::new(),
            Arc::new(MemorySnapshotStore::new()),
        );
        let mut bad = request();
        bad.narration = "   ".to_string();
        let err = pipeline
            .plan_and_run(bad, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(!pipeline.is_running("book-1"));
    }

    #[tokio::test]
    async fn test_download_failure_is_retried_by_redownload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemorySnapshotStore::new());
        let downloads = Arc::new(AtomicU32::new(0));
        let counter = downloads.clone();

        let mut provider = MockVideoProvider::new();
        let created = Arc::new(AtomicU32::new(0));
        let submitted = created.clone();
        provider.expect_create_video().returning(move |_| {
            let n = submitted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(video(&format!("video_{}", n), VideoJobStatus::Queued))
        });
        provider
            .expect_retrieve_video()
            .returning(|id| Ok(video(&id.to_string(), VideoJobStatus::Completed)));
        provider.expect_download_content().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PipelineError::Download {
                    status: Some(502),
                    message: "bad gateway".to_string(),
                })
            } else {
                Ok(Bytes::from_static(b"mp4"))
            }
        });

        let pipeline = pipeline(&dir, provider, concat_that_writes_output(), store);
        let first = pipeline
            .plan_and_run(request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.failed_segments.len(), 1);

        let snapshot = pipeline.snapshot("book-1").await.unwrap().unwrap();
        assert_eq!(snapshot.job(1).unwrap().failure, Some(FailureKind::Download));

        let resumed = pipeline
            .resume("book-1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(resumed.final_artifact.is_some());
    }
}
