//! Interfaces to the container manager.
//!
//! Lifecycle, configuration storage, and the container database live
//! elsewhere in the daemon; these traits are the narrow views of them
//! that the exec and devlxd subsystems consume.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container backend failure: {0}")]
    Backend(String),
}

/// Stdio and environment for a process attached inside a container.
///
/// The attach call duplicates the three descriptors into the child, so
/// once it has spawned, dropping these closes the host-side copies. That
/// close is what lets output bridges observe EOF when the child exits.
#[derive(Debug)]
pub struct AttachOptions {
    pub clear_env: bool,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// A container as seen by the exec and devlxd subsystems.
pub trait Instance: Send + Sync {
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Snapshot of the container's config map. Taken per request; devlxd
    /// never caches values across requests.
    fn config(&self) -> HashMap<String, String>;

    /// PID of the container's init process, when running.
    fn init_pid(&self) -> Option<i32>;

    /// Host-side uid/gid that uid 0 maps to inside the container's user
    /// namespace, or `(0, 0)` when the container runs unshifted. Used to
    /// chown the subordinate side of an exec PTY.
    fn root_ids(&self) -> (u32, u32);
}

/// The container registry backing devlxd identity resolution.
pub trait Instances: Send + Sync {
    fn names(&self) -> Result<Vec<String>, InstanceError>;

    fn get(&self, name: &str) -> Result<Arc<dyn Instance>, InstanceError>;
}

/// Launches a process inside a container and waits for it.
#[async_trait]
pub trait InstanceExec: Send + Sync {
    /// Runs `command` attached inside the container with the given stdio
    /// and environment, blocking until the process exits. Returns the raw
    /// wait status, wide enough for callers to distinguish exit codes
    /// from termination signals.
    async fn run_command(
        &self,
        command: &[String],
        options: AttachOptions,
    ) -> Result<i64, InstanceError>;
}
