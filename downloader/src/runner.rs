/// Subprocess execution for the external tools (yt-dlp, ffmpeg, ffprobe).
///
/// Every invocation takes an explicit argument vector and a wall-clock
/// timeout. A child that outlives its timeout is killed.
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use vidbot_shared::errors::ToolError;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        debug!("Running {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        // On timeout the future is dropped, which drops and kills the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::WaitFailed {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                warn!("{} timed out after {}s, killed", program, timeout.as_secs());
                return Err(ToolError::Timeout {
                    program: program.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };

        Ok(ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
