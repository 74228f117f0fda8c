use crate::domain::session::AssemblyMethod;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Output;

/// Runs the external concatenation tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConcatExecutor: Send + Sync {
    /// Concatenate the files listed in `manifest` into `output` using `method`.
    async fn run_concat(
        &self,
        manifest: &Path,
        output: &Path,
        method: AssemblyMethod,
    ) -> io::Result<Output>;

    /// Whether the tool can be launched at all
    async fn tool_available(&self) -> bool;
}
