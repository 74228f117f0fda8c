//! Configuration loaded from the environment.

use crate::domain::segments::PlannerConfig;
use crate::error::{PipelineError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Video generation provider settings.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Bearer token for the videos API
    pub api_key: String,
    /// API root, e.g. https://api.openai.com/v1
    pub base_url: String,
    /// Model name; `-pro` models get the larger frame sizes
    pub model: String,
    /// Per-request HTTP timeout
    pub http_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Where segment artifacts and final videos are written
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    /// Wait budget for one job
    pub max_wait: Duration,
    /// Wait budget for a whole run
    pub run_ceiling: Duration,
    /// Segments generated in parallel; 1 means sequential
    pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/output"),
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(600),
            run_ceiling: Duration::from_secs(2400),
            max_concurrency: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Directory holding per-book session snapshots
    pub session_dir: PathBuf,
    /// Ask the provider to hold the exact clip length
    pub strict_timing: bool,
    pub planner: PlannerConfig,
    pub provider: ProviderConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Load configuration from `.env` and environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("OPENAI_API_KEY env var required".into()))?;

        let planner = PlannerConfig {
            chars_per_12s: parse(&lookup, "NARRATION_CHARS_PER_12S", 50)?,
            sentence_terminators: var("SENTENCE_TERMINATORS", "。.!?！？"),
            max_parts: parse(&lookup, "MAX_PARTS", 4)?,
        };
        if planner.chars_per_12s == 0 || planner.max_parts == 0 {
            return Err(PipelineError::Config(
                "NARRATION_CHARS_PER_12S and MAX_PARTS must be positive".into(),
            ));
        }

        let provider = ProviderConfig {
            api_key,
            base_url: var("VIDEO_API_BASE", "https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            model: var("VIDEO_MODEL", "sora-2"),
            http_timeout: Duration::from_secs(parse(&lookup, "HTTP_TIMEOUT_SECS", 60)?),
        };

        let orchestrator = OrchestratorConfig {
            output_dir: PathBuf::from(var("OUTPUT_DIR", "./data/output")),
            poll_interval: Duration::from_secs(parse(&lookup, "POLL_INTERVAL_SECS", 10)?),
            max_wait: Duration::from_secs(parse(&lookup, "MAX_WAIT_SECS", 600)?),
            run_ceiling: Duration::from_secs(parse(&lookup, "RUN_CEILING_SECS", 2400)?),
            max_concurrency: parse(&lookup, "MAX_CONCURRENT_SEGMENTS", 1)?,
        };
        if orchestrator.poll_interval.is_zero() || orchestrator.max_concurrency == 0 {
            return Err(PipelineError::Config(
                "POLL_INTERVAL_SECS and MAX_CONCURRENT_SEGMENTS must be positive".into(),
            ));
        }

        Ok(Self {
            addr: var("ADDR", "127.0.0.1"),
            port: var("PORT", "3000"),
            session_dir: PathBuf::from(var("SESSION_DIR", "./data/sessions")),
            strict_timing: parse(&lookup, "STRICT_TIMING", false)?,
            planner,
            provider,
            orchestrator,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PipelineError::Config(format!("{} = {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
