//! External process execution with cancellation.
//!
//! The child's stdout and stderr are drained by their own tasks while the
//! runner waits for exit, so a chatty transcoder can never fill a pipe and
//! stall. Cancellation kills the child outright.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error type for process execution
#[derive(Debug, Error)]
pub enum RunError {
    /// The executable does not exist or is not on `PATH`
    #[error("executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    /// The cancellation token fired; the child was killed
    #[error("process cancelled")]
    Cancelled,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, or `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The last `max_bytes` of stderr, trimmed, cut on a char boundary.
    pub fn stderr_tail(&self, max_bytes: usize) -> &str {
        let s = self.stderr.trim();
        if s.len() <= max_bytes {
            return s;
        }
        let mut start = s.len() - max_bytes;
        while !s.is_char_boundary(start) {
            start += 1;
        }
        &s[start..]
    }
}

/// Find the executable to run.
///
/// A bare name is looked up on `PATH`; anything with a directory part must
/// point at an existing file.
pub fn resolve_executable(program: &Path) -> Result<PathBuf, RunError> {
    if program.components().count() > 1 {
        return if program.is_file() {
            Ok(program.to_path_buf())
        } else {
            Err(RunError::ExecutableNotFound(program.to_path_buf()))
        };
    }
    which::which(program).map_err(|_| RunError::ExecutableNotFound(program.to_path_buf()))
}

fn drain<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            // A read error just truncates what we captured.
            let _ = stream.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run `program` with `args` to completion or until `cancel` fires.
///
/// A non-zero exit is returned as a normal [`ProcessOutput`]; only failing to
/// start, failing to wait, or being cancelled are errors.
pub async fn run_process(
    program: &Path,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<ProcessOutput, RunError> {
    let exe = resolve_executable(program)?;

    let mut cmd = Command::new(&exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => RunError::ExecutableNotFound(exe.clone()),
        _ => RunError::Spawn {
            program: exe.clone(),
            source,
        },
    })?;
    debug!(program = %exe.display(), pid = ?child.id(), "process started");

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = tokio::select! {
        res = child.wait() => res,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            stdout.abort();
            stderr.abort();
            debug!(program = %exe.display(), "process killed on cancellation");
            return Err(RunError::Cancelled);
        }
    };

    let status = match status {
        Ok(status) => status,
        Err(source) => {
            let _ = child.kill().await;
            stdout.abort();
            stderr.abort();
            return Err(RunError::Wait {
                program: exe,
                source,
            });
        }
    };

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout: stdout.await.unwrap_or_default(),
        stderr: stderr.await.unwrap_or_default(),
    })
}
