//! Subprocess invocation with explicit argv, cwd, environment and timeout.
//!
//! A timed-out child is first asked to terminate (SIGTERM), given a short
//! grace period, then killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::BackendError;

/// How long a terminated child gets to exit before SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub(crate) fn args_slice(&self) -> &[String] {
        &self.args
    }

    /// Run to completion, capturing output. Non-zero exits are *not* an
    /// error here; callers decide what a status means.
    pub async fn output(&self) -> Result<CommandOutput, BackendError> {
        debug!(
            "running `{} {}`",
            self.program.display(),
            self.args.join(" ")
        );
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr is piped");
        let stdout_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buffer).await;
            buffer
        });
        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buffer).await;
            buffer
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "`{}` exceeded its {}s deadline, terminating",
                    self.program_name(),
                    self.timeout.as_secs()
                );
                terminate(&mut child).await;
                return Err(BackendError::Timeout {
                    program: self.program_name(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(CommandOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Like [`CommandSpec::output`], but a non-zero exit becomes an error
    /// carrying the captured streams.
    pub async fn output_checked(&self) -> Result<CommandOutput, BackendError> {
        let output = self.output().await?;
        if output.success() {
            Ok(output)
        } else {
            Err(BackendError::from_command_output(self, &output))
        }
    }
}

/// SIGTERM, grace period, SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        #[allow(clippy::cast_possible_wrap)]
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(TERMINATION_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when the child died to a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let output = CommandSpec::new("/bin/sh")
            .args(["-c", "echo hello"])
            .output()
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_captured_not_an_error() {
        let output = CommandSpec::new("/bin/sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn checked_output_carries_streams() {
        let err = CommandSpec::new("/bin/sh")
            .args(["-c", "echo bad >&2; exit 1"])
            .output_checked()
            .await
            .unwrap_err();
        match err {
            BackendError::ExecutionFailed { stderr, code, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = std::time::Instant::now();
        let err = CommandSpec::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .timeout(Duration::from_millis(200))
            .output()
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn env_and_cwd_are_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let output = CommandSpec::new("/bin/sh")
            .args(["-c", "echo $DEMO_VAR; pwd"])
            .env("DEMO_VAR", "42")
            .current_dir(dir.path())
            .output()
            .await
            .unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("42"));
        let pwd = lines.next().unwrap();
        assert!(pwd.contains(
            dir.path()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        ));
    }
}
