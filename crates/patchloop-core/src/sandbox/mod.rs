//! Sandbox: isolated, ephemeral execution environments.
//!
//! # Modules
//!
//! - [`manager`] - `SandboxManager` (bounded acquire/run/release) and `SandboxInstance`
//! - [`command`] - argv-only execution, sanitized environment, process-group kill
//! - [`error`]   - `SandboxError` / `SandboxResult`

pub mod command;
pub mod error;
pub mod manager;

pub use command::{run_argv, sanitized_env, CommandOutput};
pub use error::{SandboxError, SandboxResult};
pub use manager::{SandboxConfig, SandboxInstance, SandboxManager};
