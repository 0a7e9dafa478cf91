//! External process invocation.
//!
//! The downloader and the transform are opaque external programs. This
//! module runs one to completion, forwarding the parent's termination
//! signals to the child so no child outlives an intentional shutdown.
//! Retrying is the caller's business; one failed run is one failed run.

use crate::error::{ImportError, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

pub struct RunOptions {
    /// Connect the child's stdout to ours instead of discarding it.
    pub forward_stdout: bool,
    /// Environment overlay applied on top of the inherited environment.
    pub envs: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            forward_stdout: true,
            envs: Vec::new(),
        }
    }
}

/// Run an external program to completion.
///
/// Resolves on exit code 0, fails with [`ImportError::ExternalProcess`]
/// otherwise. While the child runs, SIGINT/SIGTERM received by this
/// process are forwarded to it as a kill; the listeners are dropped as
/// soon as the call returns.
pub async fn run(path: &Path, args: &[String], opts: RunOptions) -> Result<()> {
    let mut command = Command::new(path);
    command
        .args(args)
        .envs(opts.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::inherit())
        .stdout(if opts.forward_stdout {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = sigint.recv() => {
                    let _ = child.start_kill();
                }
                _ = sigterm.recv() => {
                    let _ = child.start_kill();
                }
            }
        };
        check_status(path, status)
    }

    #[cfg(not(unix))]
    {
        let status = child.wait().await?;
        check_status(path, status)
    }
}

fn check_status(path: &Path, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    Err(ImportError::ExternalProcess {
        path: path.to_path_buf(),
        exit_code: status.code(),
        signal,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_run_success() {
        let result = run(
            Path::new("/bin/sh"),
            &sh_args("exit 0"),
            RunOptions {
                forward_stdout: false,
                ..Default::default()
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let err = run(
            Path::new("/bin/sh"),
            &sh_args("exit 3"),
            RunOptions {
                forward_stdout: false,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        match err {
            ImportError::ExternalProcess {
                exit_code, signal, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(signal, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_env_overlay_reaches_child() {
        let result = run(
            Path::new("/bin/sh"),
            &sh_args("test \"$DATASET_IMPORT_SCHEMA\" = dataset_123"),
            RunOptions {
                forward_stdout: false,
                envs: vec![(
                    "DATASET_IMPORT_SCHEMA".to_string(),
                    "dataset_123".to_string(),
                )],
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_executable_is_io_error() {
        let err = run(
            Path::new("/nonexistent/download.sh"),
            &[],
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImportError::Io(_)));
    }
}
