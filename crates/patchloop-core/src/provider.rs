//! Model provider seam.
//!
//! A provider turns a [`RepairContext`] into a [`Candidate`] or a
//! [`ProviderFailure`]. How it produces the diff is opaque to the engine.
//! Cancellation is by dropping the `propose` future.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Candidate, ErrorType};
use crate::memory::RepairAction;
use crate::sandbox::run_argv;

/// Everything a provider is told about the failure it should fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairContext {
    pub run_id: String,
    pub goal_intent: String,
    pub step_id: String,
    pub step_intent: String,
    pub action: RepairAction,
    pub action_hint: String,
    pub error_type: ErrorType,
    pub failing_tests: Vec<String>,
    /// Tail of the failing test output.
    pub failure_excerpt: String,
    /// Short reasons earlier candidates for this step were rejected.
    pub previous_rejections: Vec<String>,
    pub cycle: u32,
    /// Globs the step suggests looking at.
    pub file_hints: Vec<String>,
}

/// Limits a proposed patch must respect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchConstraints {
    pub allowed_paths: Vec<String>,
    pub forbidden_patterns: Vec<String>,
    pub max_files: u32,
    pub max_lines: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderFailure {
    #[error("provider '{provider}' failed: {reason}")]
    Failed { provider: String, reason: String },

    #[error("provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("provider '{provider}' returned an empty patch")]
    EmptyPatch { provider: String },
}

impl ProviderFailure {
    pub fn provider(&self) -> &str {
        match self {
            Self::Failed { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::EmptyPatch { provider } => provider,
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderFailure>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn propose(
        &self,
        context: &RepairContext,
        constraints: &PatchConstraints,
    ) -> ProviderResult<Candidate>;
}

/// Rough token estimate used for budget accounting.
pub fn estimate_tokens(text_len: usize) -> u64 {
    (text_len as u64).div_ceil(4)
}

// ---------------------------------------------------------------------------
// CommandProvider
// ---------------------------------------------------------------------------

/// Request document written to a provider command's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
enum CommandRequest<'a> {
    Repair {
        context: &'a RepairContext,
        constraints: &'a PatchConstraints,
    },
    Decompose {
        prompt: &'a str,
    },
}

/// Provider backed by an external command.
///
/// The request is written to stdin as JSON. A zero exit with non-empty
/// stdout is the unified diff (or, for decomposition, the raw response).
pub struct CommandProvider {
    id: String,
    argv: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, OsString)>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(id: impl Into<String>, argv: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            argv,
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, OsString)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke(&self, request: &CommandRequest<'_>) -> ProviderResult<(String, u64)> {
        let input = serde_json::to_vec(request).map_err(|e| ProviderFailure::Failed {
            provider: self.id.clone(),
            reason: format!("request serialization: {e}"),
        })?;
        let output = run_argv(&self.cwd, &self.argv, &self.env, self.timeout, Some(&input))
            .await
            .map_err(|e| ProviderFailure::Failed {
                provider: self.id.clone(),
                reason: e.to_string(),
            })?;
        if output.timed_out {
            return Err(ProviderFailure::Timeout {
                provider: self.id.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        if !output.success() {
            let tail: String = output.stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(ProviderFailure::Failed {
                provider: self.id.clone(),
                reason: format!("exit code {}: {tail}", output.exit_code),
            });
        }
        let tokens = estimate_tokens(input.len() + output.stdout.len());
        Ok((output.stdout, tokens))
    }

    /// Send a free-form prompt and return the raw response.
    pub async fn complete(&self, prompt: &str) -> ProviderResult<String> {
        let (text, _) = self.invoke(&CommandRequest::Decompose { prompt }).await?;
        Ok(text)
    }
}

#[async_trait]
impl ModelProvider for CommandProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(
        &self,
        context: &RepairContext,
        constraints: &PatchConstraints,
    ) -> ProviderResult<Candidate> {
        let (diff, tokens) = self
            .invoke(&CommandRequest::Repair {
                context,
                constraints,
            })
            .await?;
        if diff.trim().is_empty() {
            warn!(provider = %self.id, "provider produced no diff");
            return Err(ProviderFailure::EmptyPatch {
                provider: self.id.clone(),
            });
        }
        debug!(provider = %self.id, tokens, "provider produced a diff");
        Ok(Candidate::new(&context.step_id, &self.id, diff).with_tokens_used(tokens))
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// One scripted response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Patch { diff: String, delay_ms: u64 },
    Fail { reason: String },
    /// Never answers; only the caller's timeout ends the call.
    Hang,
}

impl ScriptedReply {
    pub fn patch(diff: impl Into<String>) -> Self {
        Self::Patch {
            diff: diff.into(),
            delay_ms: 0,
        }
    }

    pub fn delayed(diff: impl Into<String>, delay_ms: u64) -> Self {
        Self::Patch {
            diff: diff.into(),
            delay_ms,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }
}

/// Deterministic provider for tests: replays its script in order and
/// repeats the last reply once the script runs out.
pub struct ScriptedProvider {
    id: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>, replies: Vec<ScriptedReply>) -> Self {
        Self {
            id: id.into(),
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let mut replies = self.replies.lock().ok()?;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(
        &self,
        context: &RepairContext,
        _constraints: &PatchConstraints,
    ) -> ProviderResult<Candidate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            Some(ScriptedReply::Patch { diff, delay_ms }) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                let tokens = estimate_tokens(diff.len());
                Ok(Candidate::new(&context.step_id, &self.id, diff).with_tokens_used(tokens))
            }
            Some(ScriptedReply::Fail { reason }) => Err(ProviderFailure::Failed {
                provider: self.id.clone(),
                reason,
            }),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            None => Err(ProviderFailure::EmptyPatch {
                provider: self.id.clone(),
            }),
        }
    }
}
