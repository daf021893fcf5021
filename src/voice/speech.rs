//! Text-to-speech through the host's speak command
//!
//! Text is written to a temporary file and handed to the command as
//! `<program> [args..] -f <file>`. The file lives as long as the job and is
//! removed on completion, cancellation or drop.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Bytes of speak-command stderr kept for the failure log
const STDERR_TAIL: usize = 4096;

/// OS speech command and its leading arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SpeechCommand {
    /// Create a command
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `say` on macOS, `espeak` elsewhere
    #[must_use]
    pub fn platform_default() -> Self {
        let program = if cfg!(target_os = "macos") {
            "say"
        } else {
            "espeak"
        };
        Self::new(program, Vec::new())
    }
}

/// Starts speech jobs
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Begin speaking `text`
    ///
    /// Returns once playback has started; the handle reports completion.
    async fn speak(&self, text: &str) -> Result<Box<dyn SpeechHandle>>;
}

/// One in-flight speech job
#[async_trait]
pub trait SpeechHandle: Send {
    /// Wait for playback to finish
    async fn wait(&mut self) -> Result<()>;

    /// Stop playback, forcibly if it does not end within the grace period
    async fn cancel(&mut self) -> Result<()>;
}

/// Runs the configured speak command
#[derive(Debug, Clone)]
pub struct SpeechDispatcher {
    command: SpeechCommand,
    executable: PathBuf,
    grace: Duration,
}

impl SpeechDispatcher {
    /// Resolve the speak command on `PATH`
    ///
    /// # Errors
    ///
    /// Returns `SpeechDispatch` if the program cannot be found
    pub fn new(command: SpeechCommand, grace: Duration) -> Result<Self> {
        let executable = which::which(&command.program).map_err(|e| {
            Error::SpeechDispatch(format!("speak command '{}' unavailable: {e}", command.program))
        })?;

        tracing::debug!(program = %executable.display(), "speech command resolved");

        Ok(Self {
            command,
            executable,
            grace,
        })
    }

    /// Write `text` to a temporary file and launch the speak command on it
    ///
    /// # Errors
    ///
    /// Returns `SpeechDispatch` if the file cannot be written or the process
    /// cannot be spawned
    pub fn spawn(&self, text: &str) -> Result<SpeechJob> {
        let mut file = tempfile::Builder::new()
            .prefix("bible-voice-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| Error::SpeechDispatch(format!("failed to create text file: {e}")))?;
        file.write_all(text.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| Error::SpeechDispatch(format!("failed to write text file: {e}")))?;
        let text_file = file.into_temp_path();

        let mut child = Command::new(&self.executable)
            .args(&self.command.args)
            .arg("-f")
            .arg(&*text_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SpeechDispatch(format!("failed to run '{}': {e}", self.command.program))
            })?;

        tracing::debug!(pid = child.id(), chars = text.len(), "speech started");

        // Drained while the command runs so a chatty command never blocks on a full pipe
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_tail(pipe)));

        Ok(SpeechJob {
            child,
            stderr,
            text_file: Some(text_file),
            grace: self.grace,
            cancelled: false,
        })
    }
}

#[async_trait]
impl Speaker for SpeechDispatcher {
    async fn speak(&self, text: &str) -> Result<Box<dyn SpeechHandle>> {
        Ok(Box::new(self.spawn(text)?))
    }
}

/// A running speak command and the text file it reads
pub struct SpeechJob {
    child: Child,
    stderr: Option<JoinHandle<String>>,
    text_file: Option<TempPath>,
    grace: Duration,
    cancelled: bool,
}

impl SpeechJob {
    /// Process id while the command is running
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Path of the text file, until cleanup
    #[must_use]
    pub fn text_path(&self) -> Option<&Path> {
        self.text_file.as_deref()
    }

    /// Whether `cancel` has been called
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn cleanup(&mut self) {
        if let Some(reader) = self.stderr.take() {
            reader.abort();
        }
        if let Some(path) = self.text_file.take() {
            if let Err(e) = path.close() {
                tracing::warn!(error = %e, "failed to remove speech text file");
            }
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let sent = Command::new("kill")
                    .args(["-TERM", &pid.to_string()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;

                if sent.is_ok_and(|status| status.success()) {
                    if tokio::time::timeout(self.grace, self.child.wait()).await.is_ok() {
                        tracing::debug!(pid, "speech terminated");
                        return Ok(());
                    }
                    tracing::debug!(pid, grace_ms = self.grace.as_millis(), "speech ignored SIGTERM");
                }
            }
        }

        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::SpeechDispatch(format!("failed to kill speech process: {e}"))),
        }
    }
}

#[async_trait]
impl SpeechHandle for SpeechJob {
    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await;

        let failed = status.as_ref().is_ok_and(|s| !s.success()) && !self.cancelled;
        let mut detail = String::new();
        if failed {
            if let Some(reader) = self.stderr.as_mut() {
                // A grandchild may still hold the pipe open
                if let Ok(Ok(tail)) = tokio::time::timeout(self.grace, reader).await {
                    detail = tail;
                }
            }
        }
        self.cleanup();

        let status = status?;
        if failed {
            tracing::warn!(status = %status, stderr = %detail.trim(), "speak command failed");
        }
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.cancelled = true;

        let result = match self.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => self.terminate().await,
        };
        self.cleanup();
        result
    }
}

impl Drop for SpeechJob {
    fn drop(&mut self) {
        // kill_on_drop handles the process; the TempPath removes the file
        if let Some(reader) = self.stderr.take() {
            reader.abort();
        }
        if self.child.id().is_some() {
            tracing::debug!("speech job dropped while running");
        }
    }
}

/// Read a pipe to the end, keeping only the last [`STDERR_TAIL`] bytes
async fn read_tail(mut pipe: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
        }
    }

    String::from_utf8_lossy(&tail).into_owned()
}

/// Kill speak processes left over from a previous run
///
/// Best effort: failures are logged and ignored.
pub async fn sweep_orphans(program: &str) {
    #[cfg(unix)]
    {
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);

        match Command::new("pkill")
            .args(["-x", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {
                tracing::info!(program = name, "stopped leftover speech processes");
            }
            Ok(_) => tracing::debug!(program = name, "no leftover speech processes"),
            Err(e) => tracing::debug!(error = %e, "orphan sweep unavailable"),
        }
    }

    #[cfg(not(unix))]
    tracing::debug!(program, "orphan sweep not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_default_supports_file_input() {
        let command = SpeechCommand::platform_default();
        assert!(command.program == "say" || command.program == "espeak");
        assert!(command.args.is_empty());
    }

    #[test]
    fn missing_program_is_dispatch_error() {
        let result = SpeechDispatcher::new(
            SpeechCommand::new("bible-voice-no-such-speaker", Vec::new()),
            Duration::from_millis(100),
        );

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::SpeechDispatch(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn text_is_written_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("spoken.txt");
        let script = format!("cp \"$1\" {}", out.display());

        let dispatcher = SpeechDispatcher::new(
            SpeechCommand::new("sh", vec!["-c".to_string(), script]),
            Duration::from_millis(200),
        )
        .unwrap();

        let mut job = dispatcher.spawn("In the beginning").unwrap();
        let path = job.text_path().unwrap().to_path_buf();
        job.wait().await.unwrap();

        assert_eq!(std::fs::read_to_string(out).unwrap(), "In the beginning");
        assert!(!path.exists());
        assert!(job.text_path().is_none());
    }
}
