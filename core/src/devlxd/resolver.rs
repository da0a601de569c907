//! Maps the PID on the other end of a devlxd connection to a container.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::instance::Instance;
use crate::instance::InstanceError;
use crate::instance::Instances;

/// Command-line prefix of a container monitor process. The container
/// name is the final whitespace-separated token of the monitor's command
/// line; container names cannot contain whitespace, so the split is
/// unambiguous.
pub const MONITOR_SENTINEL: &str = "[lxc monitor]";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("pid not in container")]
    NotInContainer,
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Resolves peer PIDs to containers via `/proc`.
///
/// The ancestry walk is the fast path: it finds the container monitor in
/// the caller's parent chain without touching any other container's
/// state. Processes reparented away from the monitor (an exec'd shell,
/// say) fall back to comparing PID-namespace identity against every
/// container's init.
pub struct PidResolver {
    proc_root: PathBuf,
}

impl Default for PidResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PidResolver {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Resolution against a different proc mount; tests stage fake trees.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn resolve(
        &self,
        pid: i32,
        instances: &dyn Instances,
    ) -> Result<Arc<dyn Instance>, ResolveError> {
        if let Some(name) = self.monitor_ancestor(pid) {
            return Ok(instances.get(&name)?);
        }
        self.match_pid_namespace(pid, instances)
    }

    /// Walks the parent chain from `pid` towards init, looking for a
    /// container monitor; returns the container name from its command
    /// line. Processes that vanish mid-walk just end the walk.
    fn monitor_ancestor(&self, mut pid: i32) -> Option<String> {
        while pid > 1 {
            let cmdline = match fs::read(self.proc_path(pid, "cmdline")) {
                Ok(bytes) => cmdline_text(&bytes),
                Err(err) => {
                    debug!("failed to read cmdline of pid {pid}: {err}");
                    return None;
                }
            };
            if cmdline.starts_with(MONITOR_SENTINEL) {
                return cmdline.split_whitespace().last().map(str::to_string);
            }
            pid = self.parent_pid(pid)?;
        }
        None
    }

    fn parent_pid(&self, pid: i32) -> Option<i32> {
        let status = match fs::read_to_string(self.proc_path(pid, "status")) {
            Ok(status) => status,
            Err(err) => {
                debug!("failed to read status of pid {pid}: {err}");
                return None;
            }
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("PPid:"))
            .and_then(|rest| rest.trim().parse().ok())
    }

    /// Fallback for callers with no monitor in their ancestry: the first
    /// container whose init shares the caller's PID namespace.
    fn match_pid_namespace(
        &self,
        pid: i32,
        instances: &dyn Instances,
    ) -> Result<Arc<dyn Instance>, ResolveError> {
        let target = self
            .pid_namespace(pid)
            .ok_or(ResolveError::NotInContainer)?;

        for name in instances.names()? {
            let instance = instances.get(&name)?;
            let Some(init_pid) = instance.init_pid() else {
                continue;
            };
            if self.pid_namespace(init_pid).as_deref() == Some(target.as_path()) {
                return Ok(instance);
            }
        }
        Err(ResolveError::NotInContainer)
    }

    fn pid_namespace(&self, pid: i32) -> Option<PathBuf> {
        let link = self.proc_root.join(pid.to_string()).join("ns").join("pid");
        match fs::read_link(&link) {
            Ok(target) => Some(target),
            Err(err) => {
                debug!("failed to read pid namespace of pid {pid}: {err}");
                None
            }
        }
    }

    fn proc_path(&self, pid: i32, entry: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(entry)
    }
}

/// Renders a `/proc/<pid>/cmdline` blob as one line: argv strings are
/// NUL-separated there, and the monitor's sentinel and container name
/// live in a single argv entry with real spaces.
fn cmdline_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\0', " ")
        .trim_end()
        .to_string()
}
