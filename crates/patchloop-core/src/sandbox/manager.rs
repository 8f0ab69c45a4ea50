//! Sandbox instances: ephemeral copies of a read-only base snapshot.
//!
//! At most `max_live` instances exist at once; `acquire` waits for a permit.
//! An instance owns its temporary directory and its permit, so dropping it
//! (normal release, error, or task cancellation) deletes the tree and frees
//! the slot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::command::{run_argv, sanitized_env, CommandOutput};
use super::error::{SandboxError, SandboxResult};
use crate::budget::BudgetGate;
use crate::metrics::Metrics;

/// Configuration for sandbox creation and command execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum number of live sandbox instances.
    pub max_live: usize,
    /// Retries after a failed setup before `SetupFailure` is surfaced.
    pub setup_retries: u32,
    /// Base delay between setup retries (milliseconds), doubled each retry.
    pub backoff_base_ms: u64,
    /// Directory under which instances are created. System temp if unset.
    pub root_dir: Option<PathBuf>,
    /// Environment variables passed through to sandboxed commands.
    pub env_passthrough: Vec<String>,
    /// Top-level directory names not copied from the snapshot.
    pub excluded_dirs: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_live: 3,
            setup_retries: 2,
            backoff_base_ms: 100,
            root_dir: None,
            env_passthrough: [
                "PATH",
                "HOME",
                "LANG",
                "CARGO_HOME",
                "RUSTUP_HOME",
                "GOPATH",
                "GOCACHE",
                "GOMODCACHE",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            excluded_dirs: vec![".git".into(), "target".into()],
        }
    }
}

/// An isolated working copy. Exclusively owned by one evaluation.
#[derive(Debug)]
pub struct SandboxInstance {
    id: String,
    workdir: PathBuf,
    // drop order: directory first, then the permit
    root: TempDir,
    _permit: OwnedSemaphorePermit,
    live: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl SandboxInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the repository the commands run in.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Scratch space next to (not inside) the work tree.
    pub fn scratch_dir(&self) -> &Path {
        self.root.path()
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.metrics.inc_sandbox_released();
        debug!(sandbox = %self.id, "sandbox released");
    }
}

pub struct SandboxManager {
    base: PathBuf,
    config: SandboxConfig,
    permits: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    peak: AtomicUsize,
    budget: Arc<BudgetGate>,
    metrics: Arc<Metrics>,
}

impl SandboxManager {
    pub fn new(
        base: impl Into<PathBuf>,
        config: SandboxConfig,
        budget: Arc<BudgetGate>,
        metrics: Arc<Metrics>,
    ) -> SandboxResult<Self> {
        if config.max_live == 0 {
            return Err(SandboxError::InvalidConfig("max_live must be >= 1".into()));
        }
        Ok(Self {
            base: base.into(),
            permits: Arc::new(Semaphore::new(config.max_live)),
            config,
            live: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            budget,
            metrics,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live instances seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.config.max_live
    }

    /// Allocate an instance cloned from the base snapshot, retrying setup up
    /// to `setup_retries` times.
    pub async fn acquire(&self) -> SandboxResult<SandboxInstance> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::SetupFailure {
                attempts: 0,
                reason: "sandbox manager closed".into(),
            })?;

        let max_attempts = self.config.setup_retries + 1;
        let mut attempt = 0;
        let root = loop {
            attempt += 1;
            match self.create_tree().await {
                Ok(root) => break root,
                Err(e) if attempt < max_attempts => {
                    let backoff = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
                    warn!(attempt, error = %e, backoff_ms = backoff, "sandbox setup failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    return Err(SandboxError::SetupFailure {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        };

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        self.metrics.inc_sandbox_acquired();

        let id = uuid::Uuid::new_v4().to_string();
        info!(sandbox = %id, live, "sandbox acquired");
        Ok(SandboxInstance {
            workdir: root.path().join("work"),
            id,
            root,
            _permit: permit,
            live: self.live.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Run `argv` inside the instance's work tree. Counts one subprocess
    /// against the budget before spawning.
    pub async fn run(
        &self,
        instance: &SandboxInstance,
        argv: &[String],
        timeout: Duration,
    ) -> SandboxResult<CommandOutput> {
        self.budget.consume_subprocess()?;
        let env = sanitized_env(&self.config.env_passthrough);
        debug!(sandbox = %instance.id, argv = ?argv, "running command");
        run_argv(instance.workdir(), argv, &env, timeout, None).await
    }

    /// Explicit release. Dropping the instance has the same effect.
    pub fn release(&self, instance: SandboxInstance) {
        drop(instance);
    }

    async fn create_tree(&self) -> SandboxResult<TempDir> {
        if !self.base.is_dir() {
            return Err(SandboxError::SnapshotMissing(self.base.clone()));
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("patchloop-sbx-");
        let root = match &self.config.root_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };

        let base = self.base.clone();
        let dest = root.path().join("work");
        let excluded = self.config.excluded_dirs.clone();
        tokio::task::spawn_blocking(move || copy_tree(&base, &dest, &excluded))
            .await
            .map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))??;
        Ok(root)
    }
}

fn copy_tree(base: &Path, dest: &Path, excluded: &[String]) -> SandboxResult<()> {
    fs::create_dir_all(dest)?;
    let resolved_base = base.canonicalize()?;
    let walker = WalkDir::new(base).follow_links(false).into_iter();
    let entries = walker.filter_entry(|e| {
        e.depth() != 1 || !excluded.iter().any(|x| e.file_name() == x.as_str())
    });
    for entry in entries {
        let entry = entry.map_err(|e| SandboxError::Io(std::io::Error::other(e.to_string())))?;
        let rel = match entry.path().strip_prefix(base) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dest.join(rel);
        let kind = entry.file_type();
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if kind.is_symlink() {
            copy_symlink(entry.path(), &resolved_base, dest, &target)?;
        }
    }
    Ok(())
}

/// Links resolving inside the snapshot are re-pointed into the copy. Links
/// to outside files are copied as regular files; anything else is skipped.
fn copy_symlink(src: &Path, base: &Path, dest: &Path, target: &Path) -> SandboxResult<()> {
    let Ok(resolved) = src.canonicalize() else {
        debug!(link = %src.display(), "skipping dangling symlink");
        return Ok(());
    };
    match resolved.strip_prefix(base) {
        Ok(rel) => relink(&resolved, &dest.join(rel), target)?,
        Err(_) if resolved.is_file() => {
            fs::copy(&resolved, target)?;
        }
        Err(_) => warn!(link = %src.display(), "skipping symlink that leaves the snapshot"),
    }
    Ok(())
}

#[cfg(unix)]
fn relink(_resolved: &Path, inside: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(inside, target)
}

#[cfg(not(unix))]
fn relink(resolved: &Path, _inside: &Path, target: &Path) -> std::io::Result<()> {
    if resolved.is_file() {
        fs::copy(resolved, target)?;
    }
    Ok(())
}
