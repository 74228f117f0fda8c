use crate::domain::session::AssemblyMethod;
use crate::ports::media::ConcatExecutor;
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::Output;
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Runs the ffmpeg binary's concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    binary: String,
}

impl FfmpegConcat {
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegConcat {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn concat_args(manifest: &Path, output: &Path, method: AssemblyMethod) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(manifest.as_os_str().to_owned());

    let codec: &[&str] = match method {
        AssemblyMethod::FastCopy => &["-c", "copy"],
        AssemblyMethod::ReEncode => &[
            "-c:v", "libx264", "-preset", "fast", "-crf", "23", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart",
        ],
    };
    args.extend(codec.iter().map(OsString::from));
    args.push(OsString::from("-y"));
    args.push(output.as_os_str().to_owned());
    args
}

#[async_trait]
impl ConcatExecutor for FfmpegConcat {
    async fn run_concat(
        &self,
        manifest: &Path,
        output: &Path,
        method: AssemblyMethod,
    ) -> io::Result<Output> {
        debug!(method = method.as_str(), output = %output.display(), "Running ffmpeg concat");
        TokioCommand::new(&self.binary)
            .args(concat_args(manifest, output, method))
            .kill_on_drop(true)
            .output()
            .await
    }

    async fn tool_available(&self) -> bool {
        TokioCommand::new(&self.binary)
            .arg("-version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}
