//! Argv-only subprocess execution with a sanitized environment.
//!
//! Commands are spawned directly (never through a shell) in their own
//! process group. When the timeout fires, or the future is dropped because
//! the evaluation was cancelled, the whole group is killed.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::{SandboxError, SandboxResult};

/// What one command invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// stdout followed by stderr, for classifiers that scan both.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Environment passed to sandboxed commands: only the named variables that
/// are set in the parent.
pub fn sanitized_env(passthrough: &[String]) -> Vec<(String, OsString)> {
    passthrough
        .iter()
        .filter_map(|key| std::env::var_os(key).map(|v| (key.clone(), v)))
        .collect()
}

/// Kills the child's process group on drop unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    debug!(pgid, "killing process group");
    // SAFETY: killpg only sends a signal; the group was created for this child.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Run `argv` in `cwd` with the given environment and timeout.
///
/// A timeout is not an error: it yields `timed_out = true` and exit code -1.
pub async fn run_argv(
    cwd: &Path,
    argv: &[String],
    env: &[(String, OsString)],
    timeout: Duration,
    stdin: Option<&[u8]>,
) -> SandboxResult<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SandboxError::InvalidCommand("empty argv".into()))?;
    if program.trim().is_empty() {
        return Err(SandboxError::InvalidCommand("empty program name".into()));
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn {
        program: program.clone(),
        reason: e.to_string(),
    })?;
    let mut guard = ProcessGroupGuard { pgid: child.id() };

    // stdin is fed concurrently with output collection, inside the timeout
    let input = stdin.zip(child.stdin.take());
    let feed = async move {
        if let Some((input, mut pipe)) = input {
            use tokio::io::AsyncWriteExt;
            if let Err(e) = pipe.write_all(input).await {
                // the child may exit without reading its input
                debug!(error = %e, "stdin write failed");
            }
        }
    };
    let finished = async {
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    match tokio::time::timeout(timeout, finished).await {
        Ok(Ok(output)) => {
            guard.disarm();
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
            })
        }
        Ok(Err(e)) => Err(SandboxError::Io(e)),
        Err(_) => {
            drop(guard);
            let limit_ms = timeout.as_millis() as u64;
            warn!(program = %program, limit_ms, "command timed out");
            Ok(CommandOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {limit_ms}ms"),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: true,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn env() -> Vec<(String, OsString)> {
        sanitized_env(&["PATH".to_string()])
    }

    #[tokio::test]
    async fn runs_without_shell() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_argv(
            dir.path(),
            &argv(&["echo", "$HOME", "&&", "ls"]),
            &env(),
            Duration::from_secs(10),
            None,
        )
        .await
        .unwrap();
        assert!(out.success());
        // no expansion, no chaining
        assert_eq!(out.stdout.trim(), "$HOME && ls");
    }

    #[tokio::test]
    async fn environment_is_sanitized() {
        std::env::set_var("PATCHLOOP_TEST_SECRET", "hunter2");
        let dir = tempfile::tempdir().unwrap();
        let out = run_argv(dir.path(), &argv(&["env"]), &env(), Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(!out.stdout.contains("hunter2"));
        assert!(out.stdout.contains("PATH="));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_argv(
            dir.path(),
            &argv(&["sleep", "30"]),
            &env(),
            Duration::from_millis(200),
            None,
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_argv(
            dir.path(),
            &argv(&["cat"]),
            &env(),
            Duration::from_secs(10),
            Some(b"hello"),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn unread_stdin_does_not_outlive_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        // far larger than a pipe buffer, and never read
        let input = vec![b'x'; 4 * 1024 * 1024];
        let started = Instant::now();
        let out = run_argv(
            dir.path(),
            &argv(&["sleep", "30"]),
            &env(),
            Duration::from_millis(300),
            Some(&input),
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_argv(dir.path(), &[], &env(), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidCommand(_)));
    }
}
