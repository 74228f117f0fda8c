use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use promoreel::adapters::local::{FfmpegConcat, FileSnapshotStore, TokioClock};
use promoreel::adapters::openai::OpenAiVideoClient;
use promoreel::application::assembler::VideoAssembler;
use promoreel::application::job_client::JobClient;
use promoreel::application::orchestrator::SegmentOrchestrator;
use promoreel::domain::prompt::PromptCompiler;
use promoreel::domain::request::GenerationRequest;
use promoreel::domain::segments::SegmentPlanner;
use promoreel::domain::session::RunResult;
use promoreel::{AppConfig, PipelineError, PromoPipeline};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type Pipeline = PromoPipeline<OpenAiVideoClient, TokioClock, FileSnapshotStore, FfmpegConcat>;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    let pipeline = Arc::new(build_pipeline(&config)?);

    if !pipeline.tool_available().await {
        warn!("ffmpeg not found on PATH; runs will finish without a final video");
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/runs", post(start_run))
        .route("/runs/:book_id", get(get_run).delete(clear_run))
        .route("/runs/:book_id/resume", post(resume_run))
        .route("/runs/:book_id/retry", post(retry_run))
        .route("/runs/:book_id/cancel", post(cancel_run))
        .with_state(AppState { pipeline });

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port)).await?;
    info!("Listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_pipeline(config: &AppConfig) -> promoreel::Result<Pipeline> {
    let store = Arc::new(FileSnapshotStore::new(&config.session_dir));
    let client = JobClient::new(
        OpenAiVideoClient::new(&config.provider)?,
        TokioClock::new(),
        config.provider.model.clone(),
    );
    let orchestrator = SegmentOrchestrator::new(
        client,
        PromptCompiler::new(config.strict_timing),
        store.clone(),
        config.orchestrator.clone(),
    );

    Ok(PromoPipeline::new(
        SegmentPlanner::new(config.planner.clone())?,
        orchestrator,
        VideoAssembler::new(FfmpegConcat::new()),
        store,
        config.orchestrator.output_dir.clone(),
    ))
}

struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::RunInProgress(_) => StatusCode::CONFLICT,
            err if err.is_retryable() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn log_outcome(book_id: &str, outcome: promoreel::Result<RunResult>) {
    match outcome {
        Ok(result) => info!(
            book_id,
            completed = result.completed_segments.len(),
            failed = result.failed_segments.len(),
            assembled = result.final_artifact.is_some(),
            "Background run finished"
        ),
        Err(e) => error!(book_id, error = %e, "Background run failed"),
    }
}

fn accepted(book_id: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "book_id": book_id, "status": "accepted" })),
    )
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ffmpeg = state.pipeline.tool_available().await;
    Json(json!({ "status": "ok", "ffmpeg": ffmpeg }))
}

async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;
    let book_id = request.book_id.clone();
    if state.pipeline.is_running(&book_id) {
        return Err(PipelineError::RunInProgress(book_id).into());
    }

    let pipeline = state.pipeline.clone();
    let id = book_id.clone();
    tokio::spawn(async move {
        let outcome = pipeline.plan_and_run(request, CancellationToken::new()).await;
        log_outcome(&id, outcome);
    });
    Ok(accepted(&book_id))
}

async fn get_run(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .pipeline
        .snapshot(&book_id)
        .await?
        .ok_or_else(|| PipelineError::SessionNotFound(book_id.clone()))?;
    let running = state.pipeline.is_running(&book_id);
    let result = RunResult::from_snapshot(&snapshot);
    Ok(Json(json!({
        "running": running,
        "result": result,
        "snapshot": snapshot,
    })))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.pipeline.snapshot(&book_id).await?.is_none() {
        return Err(PipelineError::SessionNotFound(book_id).into());
    }
    if state.pipeline.is_running(&book_id) {
        return Err(PipelineError::RunInProgress(book_id).into());
    }

    let pipeline = state.pipeline.clone();
    let id = book_id.clone();
    tokio::spawn(async move {
        let outcome = pipeline.resume(&id, CancellationToken::new()).await;
        log_outcome(&id, outcome);
    });
    Ok(accepted(&book_id))
}

#[derive(Debug, Deserialize)]
struct RetryBody {
    segments: Vec<u32>,
}

async fn retry_run(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Json(body): Json<RetryBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.segments.is_empty() {
        return Err(PipelineError::InvalidInput("segments must not be empty".into()).into());
    }
    if state.pipeline.snapshot(&book_id).await?.is_none() {
        return Err(PipelineError::SessionNotFound(book_id).into());
    }
    if state.pipeline.is_running(&book_id) {
        return Err(PipelineError::RunInProgress(book_id).into());
    }

    let pipeline = state.pipeline.clone();
    let id = book_id.clone();
    tokio::spawn(async move {
        let outcome = pipeline
            .retry_segments(&id, &body.segments, CancellationToken::new())
            .await;
        log_outcome(&id, outcome);
    });
    Ok(accepted(&book_id))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = state.pipeline.cancel(&book_id);
    Json(json!({ "book_id": book_id, "cancelled": cancelled }))
}

async fn clear_run(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pipeline.clear(&book_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
