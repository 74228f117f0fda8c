use crate::domain::session::AssemblyMethod;
use crate::error::{PipelineError, Result};
use crate::ports::media::ConcatExecutor;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Tried in order until one succeeds.
const STRATEGIES: [AssemblyMethod; 2] = [AssemblyMethod::FastCopy, AssemblyMethod::ReEncode];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub output: PathBuf,
    pub method: AssemblyMethod,
}

#[derive(Debug)]
enum StrategyOutcome {
    Succeeded,
    Failed { diagnostics: String },
}

/// Concatenates ordered segment files into one video.
pub struct VideoAssembler<E> {
    executor: E,
}

impl<E> VideoAssembler<E>
where
    E: ConcatExecutor,
{
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub async fn tool_available(&self) -> bool {
        self.executor.tool_available().await
    }

    #[instrument(skip(self, paths), fields(segments = paths.len(), output = %output.display()))]
    pub async fn assemble(&self, paths: &[PathBuf], output: &Path) -> Result<Assembled> {
        if paths.is_empty() {
            return Err(PipelineError::InvalidInput("no segment files to assemble".into()));
        }
        if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
            return Err(PipelineError::InvalidInput(format!(
                "segment file {} does not exist",
                missing.display()
            )));
        }

        let dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;

        // Removed when dropped, whichever way we leave this function
        let manifest = write_manifest(&dir, paths)?;

        let mut diagnostics = Vec::new();
        for method in STRATEGIES {
            match self.attempt(manifest.path(), output, method).await {
                StrategyOutcome::Succeeded => {
                    info!(method = method.as_str(), "Assembly succeeded");
                    return Ok(Assembled {
                        output: output.to_path_buf(),
                        method,
                    });
                }
                StrategyOutcome::Failed { diagnostics: detail } => {
                    warn!(method = method.as_str(), detail = %detail, "Assembly strategy failed");
                    let _ = tokio::fs::remove_file(output).await;
                    diagnostics.push(format!("[{}] {}", method.as_str(), detail));
                }
            }
        }

        Err(PipelineError::Assembly {
            diagnostics: diagnostics.join("\n"),
        })
    }

    async fn attempt(&self, manifest: &Path, output: &Path, method: AssemblyMethod) -> StrategyOutcome {
        match self.executor.run_concat(manifest, output, method).await {
            Ok(out) if out.status.success() => StrategyOutcome::Succeeded,
            Ok(out) => StrategyOutcome::Failed {
                diagnostics: format!(
                    "{}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            },
            Err(e) => StrategyOutcome::Failed {
                diagnostics: format!("could not launch: {}", e),
            },
        }
    }
}

fn manifest_line(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    });
    let quoted = absolute.to_string_lossy().replace('\'', "'\\''");
    format!("file '{}'", quoted)
}

fn write_manifest(dir: &Path, paths: &[PathBuf]) -> Result<tempfile::NamedTempFile> {
    let mut manifest = tempfile::Builder::new()
        .prefix("concat_list_")
        .suffix(".txt")
        .tempfile_in(dir)?;
    for path in paths {
        writeln!(manifest, "{}", manifest_line(path))?;
    }
    manifest.flush()?;
    Ok(manifest)
}
