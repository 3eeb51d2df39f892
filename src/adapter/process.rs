//! Child-process plumbing for the external engine adapters.
//!
//! yt-dlp and gallery-dl run as child processes with piped output. The
//! runner here streams their stdout/stderr line by line into a callback,
//! kills the child promptly on cancellation, and reports the exit status.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::download::CancelToken;

/// Which stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    /// The child's stdout.
    Stdout,
    /// The child's stderr.
    Stderr,
}

/// Errors from running an external engine.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The engine binary could not be started (usually: not installed).
    #[error("failed to launch {program}: {source}")]
    Spawn {
        /// The binary that failed to launch.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Reading the child's output failed.
    #[error("error reading {program} output: {source}")]
    Io {
        /// The binary whose output failed.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled; the child was killed.
    #[error("{program} cancelled")]
    Cancelled {
        /// The binary that was killed.
        program: String,
    },

    /// The child exited with a non-zero status.
    #[error("{program} exited with status {code:?}")]
    Failed {
        /// The binary that failed.
        program: String,
        /// Its exit code, when one exists.
        code: Option<i32>,
    },
}

/// Runs `program` with `args`, feeding each output line to `on_line`.
///
/// The child is killed (and `Cancelled` returned) as soon as the token
/// fires, and killed on drop as a safety net.
///
/// # Errors
///
/// Returns [`ProcessError::Spawn`] when the binary is missing,
/// [`ProcessError::Cancelled`] on cancellation, and
/// [`ProcessError::Failed`] for a non-zero exit.
#[instrument(skip(args, cancel, on_line))]
pub async fn run_engine(
    program: &str,
    args: &[String],
    cancel: &CancelToken,
    mut on_line: impl FnMut(LineSource, &str) + Send,
) -> Result<(), ProcessError> {
    debug!(?args, "launching external engine");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    // The handles exist because both streams were piped above.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

    let mut stdout_open = stdout_lines.is_some();
    let mut stderr_open = stderr_lines.is_some();

    let status = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                warn!(program, "cancellation requested; killing engine process");
                if let Err(e) = child.kill().await {
                    warn!(program, error = %e, "failed to kill engine process");
                }
                return Err(ProcessError::Cancelled {
                    program: program.to_string(),
                });
            }
            line = next_line(&mut stdout_lines), if stdout_open => {
                match line {
                    Some(Ok(text)) => on_line(LineSource::Stdout, &text),
                    Some(Err(source)) => {
                        return Err(ProcessError::Io { program: program.to_string(), source });
                    }
                    None => stdout_open = false,
                }
            }
            line = next_line(&mut stderr_lines), if stderr_open => {
                match line {
                    Some(Ok(text)) => on_line(LineSource::Stderr, &text),
                    Some(Err(source)) => {
                        return Err(ProcessError::Io { program: program.to_string(), source });
                    }
                    None => stderr_open = false,
                }
            }
            status = child.wait(), if !stdout_open && !stderr_open => {
                break status.map_err(|source| ProcessError::Io {
                    program: program.to_string(),
                    source,
                })?;
            }
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::Failed {
            program: program.to_string(),
            code: status.code(),
        })
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<Result<String, std::io::Error>> {
    match lines {
        Some(lines) => lines.next_line().await.transpose(),
        None => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_engine_collects_lines() {
        let cancel = CancelToken::new();
        let mut collected = Vec::new();

        run_engine(
            "sh",
            &["-c".to_string(), "echo one; echo two 1>&2; echo three".to_string()],
            &cancel,
            |source, line| collected.push((source, line.to_string())),
        )
        .await
        .unwrap();

        let stdout: Vec<&str> = collected
            .iter()
            .filter(|(s, _)| *s == LineSource::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(
            collected
                .iter()
                .any(|(s, l)| *s == LineSource::Stderr && l == "two")
        );
    }

    #[tokio::test]
    async fn test_run_engine_missing_binary_is_spawn_error() {
        let cancel = CancelToken::new();
        let result = run_engine(
            "definitely-not-installed-binary",
            &[],
            &cancel,
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_run_engine_nonzero_exit_is_failed() {
        let cancel = CancelToken::new();
        let result = run_engine(
            "sh",
            &["-c".to_string(), "exit 3".to_string()],
            &cancel,
            |_, _| {},
        )
        .await;
        assert!(matches!(
            result,
            Err(ProcessError::Failed { code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_run_engine_cancel_kills_child() {
        let cancel = CancelToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            killer.cancel();
        });

        let started = std::time::Instant::now();
        let result = run_engine(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &cancel,
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(ProcessError::Cancelled { .. })));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(2),
            "kill must be prompt"
        );
    }
}
