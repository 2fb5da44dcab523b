//! Encoder process management.
//!
//! Owns the external ffmpeg subprocess for one transcoding session: spawns
//! it with stdout piped into the streaming pipeline and stderr collected for
//! diagnostics, and guarantees the process is terminated and reaped on every
//! exit path, including early cancellation.

mod args;

pub use args::build_args;

use crate::policy::TranscodeParams;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use uuid::Uuid;

/// Bytes read from the encoder per chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Cap on retained stderr, enough for ffmpeg's failure banner.
const MAX_STDERR_BYTES: usize = 16 * 1024;

/// Errors surfaced by the encoder process manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder: {0}")]
    SpawnFailed(String),

    #[error("encoder exited with status {0}")]
    ExitNonZero(i32),

    #[error("encoder terminated by signal")]
    Signaled,

    #[error("encoder did not exit within the cancellation grace period")]
    TimedOutOnCancel,
}

/// Why an encode stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Still running.
    None,
    /// Process exited cleanly and all output was consumed.
    Completed,
    /// The client went away mid-stream.
    ClientClosed,
    /// The process failed.
    EncoderError,
    /// Canceled from outside the data path.
    Canceled,
}

/// Spawns and cancels encoder processes with a bounded grace period.
#[derive(Debug, Clone)]
pub struct EncoderManager {
    ffmpeg_bin: PathBuf,
    grace_period: Duration,
}

impl EncoderManager {
    pub fn new(ffmpeg_bin: PathBuf, grace_period: Duration) -> Self {
        Self {
            ffmpeg_bin,
            grace_period,
        }
    }

    /// Start one encode. The returned job owns the process; its stdout is
    /// the progressively-playable output stream.
    pub fn start(
        &self,
        params: &TranscodeParams,
        source: &Path,
    ) -> Result<EncodeJob, EncoderError> {
        let args = build_args(params, source);
        EncodeJob::spawn(&self.ffmpeg_bin, args, self.grace_period)
    }
}

/// One running or completed encoder invocation.
#[derive(Debug)]
pub struct EncodeJob {
    id: Uuid,
    args: Vec<String>,
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<tokio::task::JoinHandle<String>>,
    cause: TerminationCause,
    grace_period: Duration,
}

impl EncodeJob {
    fn spawn(
        bin: &Path,
        args: Vec<String>,
        grace_period: Duration,
    ) -> Result<Self, EncoderError> {
        let id = Uuid::new_v4();
        tracing::debug!(job_id = %id, "Encoder command: {:?} {}", bin, args.join(" "));

        let mut child = Command::new(bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EncoderError::SpawnFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncoderError::SpawnFailed("encoder stdout not captured".into()))?;

        // Drain stderr concurrently so the encoder can never block on it;
        // the collected tail is logged on failure, never sent to the client.
        let stderr = child.stderr.take();
        let stderr_task = stderr.map(|mut stderr| {
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if collected.len() < MAX_STDERR_BYTES {
                                collected.extend_from_slice(&buf[..n]);
                            }
                        }
                    }
                }
                collected.truncate(MAX_STDERR_BYTES);
                String::from_utf8_lossy(&collected).into_owned()
            })
        });

        Ok(Self {
            id,
            args,
            child,
            stdout,
            stderr_task,
            cause: TerminationCause::None,
            grace_period,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cause(&self) -> TerminationCause {
        self.cause
    }

    /// Read the next chunk of encoder output. `None` means the encoder
    /// closed its stdout; call [`finish`](Self::finish) to reap it.
    pub async fn read_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    /// Reap the process after its output ended.
    ///
    /// A non-zero exit is reported even when bytes were already delivered;
    /// the caller marks the session aborted but cannot retract the stream.
    pub async fn finish(&mut self) -> Result<(), EncoderError> {
        let status = self.child.wait().await.map_err(|e| {
            self.cause = TerminationCause::EncoderError;
            EncoderError::SpawnFailed(e.to_string())
        })?;

        if status.success() {
            self.cause = TerminationCause::Completed;
            return Ok(());
        }

        self.cause = TerminationCause::EncoderError;
        let stderr = self.collect_stderr().await;
        tracing::error!(
            job_id = %self.id,
            "Encoder failed with {}: {}",
            status,
            stderr.trim()
        );

        match status.code() {
            Some(code) => Err(EncoderError::ExitNonZero(code)),
            None => Err(EncoderError::Signaled),
        }
    }

    /// Terminate the process: graceful signal first, then a forced kill
    /// after the grace period. Always reaps.
    pub async fn cancel(&mut self, cause: TerminationCause) -> Result<(), EncoderError> {
        self.cause = cause;

        if self.child.try_wait().ok().flatten().is_some() {
            // Already exited; nothing to signal.
            return Ok(());
        }

        tracing::debug!(job_id = %self.id, ?cause, "Canceling encoder");
        self.send_term();

        match tokio::time::timeout(self.grace_period, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(EncoderError::SpawnFailed(e.to_string())),
            Err(_) => {
                tracing::warn!(job_id = %self.id, "Encoder ignored termination, killing");
                let _ = self.child.kill().await;
                Err(EncoderError::TimedOutOnCancel)
            }
        }
    }

    #[cfg(unix)]
    fn send_term(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn send_term(&self) {
        // No graceful signal available; the grace-period wait below falls
        // straight through to the forced kill.
    }

    async fn collect_stderr(&mut self) -> String {
        match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl Drop for EncodeJob {
    fn drop(&mut self) {
        // Last-resort backstop; ordinary paths reap via finish/cancel.
        if self.cause == TerminationCause::None {
            let _ = self.child.start_kill();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Instant;

    fn sh(script: &str, grace: Duration) -> EncodeJob {
        EncodeJob::spawn(
            Path::new("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
            grace,
        )
        .unwrap()
    }

    async fn read_all(job: &mut EncodeJob) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = job.read_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_streams_stdout_and_completes() {
        let mut job = sh("printf 'encoded output'", Duration::from_secs(5));
        let out = read_all(&mut job).await;
        assert_eq!(out, b"encoded output");

        job.finish().await.unwrap();
        assert_eq!(job.cause(), TerminationCause::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported_after_output() {
        let mut job = sh("printf 'partial'; exit 3", Duration::from_secs(5));
        let out = read_all(&mut job).await;
        assert_eq!(out, b"partial");

        let err = job.finish().await.unwrap_err();
        assert_matches!(err, EncoderError::ExitNonZero(3));
        assert_eq!(job.cause(), TerminationCause::EncoderError);
    }

    #[tokio::test]
    async fn test_cancel_terminates_within_grace() {
        let mut job = sh("sleep 30", Duration::from_secs(5));

        let start = Instant::now();
        job.cancel(TerminationCause::ClientClosed).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(job.cause(), TerminationCause::ClientClosed);
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let mut job = sh("trap '' TERM; sleep 30", Duration::from_millis(300));
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = job.cancel(TerminationCause::Canceled).await.unwrap_err();
        assert_matches!(err, EncoderError::TimedOutOnCancel);
    }

    #[tokio::test]
    async fn test_cancel_after_exit_is_noop() {
        let mut job = sh("exit 0", Duration::from_secs(5));
        read_all(&mut job).await;
        // Let the process exit before canceling.
        tokio::time::sleep(Duration::from_millis(50)).await;

        job.cancel(TerminationCause::Canceled).await.unwrap();
        assert_eq!(job.cause(), TerminationCause::Canceled);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let manager = EncoderManager::new(
            PathBuf::from("/nonexistent/ffmpeg-binary"),
            Duration::from_secs(5),
        );
        let params = crate::policy::TranscodeParams {
            video_codec: "mpeg2video".to_string(),
            audio_codec: "ac3".to_string(),
            video_kbps: 4096,
            max_video_kbps: 30000,
            buffer_kb: 4096,
            frame_rate: None,
            scaling: crate::policy::Scaling::Fit {
                aspect: crate::policy::AspectRatio::new(16, 9),
                width: 1920,
                height: 1080,
            },
            audio_kbps: 448,
            audio_sample_rate: 48000,
            audio_channels: None,
        };

        let err = manager.start(&params, Path::new("/media/a.mkv")).unwrap_err();
        assert_matches!(err, EncoderError::SpawnFailed(_));
    }

    #[tokio::test]
    async fn test_manager_runs_configured_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nprintf 'MPEGDATA'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manager = EncoderManager::new(script, Duration::from_secs(5));
        let params = crate::policy::TranscodeParams {
            video_codec: "mpeg2video".to_string(),
            audio_codec: "ac3".to_string(),
            video_kbps: 4096,
            max_video_kbps: 30000,
            buffer_kb: 4096,
            frame_rate: None,
            scaling: crate::policy::Scaling::Fit {
                aspect: crate::policy::AspectRatio::new(16, 9),
                width: 1920,
                height: 1080,
            },
            audio_kbps: 448,
            audio_sample_rate: 48000,
            audio_channels: None,
        };

        let mut job = manager.start(&params, Path::new("/media/a.mkv")).unwrap();
        let out = read_all(&mut job).await;
        assert_eq!(out, b"MPEGDATA");
        job.finish().await.unwrap();
    }
}
