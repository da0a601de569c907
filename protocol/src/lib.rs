//! Wire types shared by the daemon, its clients, and the guest-facing
//! metadata socket.
//!
//! Everything here is plain serde data: the exec POST body, the
//! out-of-band control messages carried on an exec session's control
//! WebSocket, the advertised descriptor-secret metadata, and the devlxd
//! API payloads.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Descriptor index of the out-of-band control channel.
pub const CONTROL_FD: i64 = -1;

/// Key under which the control channel's secret is advertised.
pub const CONTROL_FD_NAME: &str = "control";

/// The only control command recognized in this revision.
pub const WINDOW_RESIZE_COMMAND: &str = "window-resize";

/// devlxd API compatibility level reported on `GET /1.0`.
pub const DEVLXD_API_COMPAT: u32 = 0;

/// Body of `POST /1.0/containers/{name}/exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPost {
    /// Argv of the process to run inside the container.
    pub command: Vec<String>,
    /// Extra environment for the process. A `HOME` entry also sets the
    /// working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    /// When true, the response advertises per-descriptor secrets and the
    /// process only starts once every stdio WebSocket has attached.
    #[serde(rename = "wait-for-websocket", default)]
    pub wait_for_websocket: bool,
    /// PTY semantics (one combined stdio stream) instead of three pipes.
    #[serde(default)]
    pub interactive: bool,
}

/// A message on an exec session's control channel.
///
/// Unknown commands are ignored by the daemon, so clients can probe for
/// newer commands without breaking older servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecControl {
    pub command: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// Terminal metadata of an exec operation: the raw wait status of the
/// process, wide enough to carry both exit codes and signal terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    #[serde(rename = "return")]
    pub ret: i64,
}

/// The advertised descriptor secrets of an exec session, as published in
/// the async operation's metadata.
///
/// Secrets are keyed by descriptor index rendered as a decimal string,
/// except the control channel which is keyed `"control"`. A `BTreeMap`
/// keeps the serialized form stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecWsMetadata {
    pub fds: BTreeMap<String, String>,
}

impl ExecWsMetadata {
    pub fn from_indexed(secrets: &HashMap<i64, String>) -> Self {
        let fds = secrets
            .iter()
            .map(|(fd, secret)| {
                let key = if *fd == CONTROL_FD {
                    CONTROL_FD_NAME.to_string()
                } else {
                    fd.to_string()
                };
                (key, secret.clone())
            })
            .collect();
        Self { fds }
    }

    /// Inverse of [`Self::from_indexed`]. Keys that are neither
    /// `"control"` nor a decimal index are dropped.
    pub fn to_indexed(&self) -> HashMap<i64, String> {
        self.fds
            .iter()
            .filter_map(|(key, secret)| {
                let fd = if key == CONTROL_FD_NAME {
                    CONTROL_FD
                } else {
                    key.parse().ok()?
                };
                Some((fd, secret.clone()))
            })
            .collect()
    }
}

/// Body of `GET /1.0` on the devlxd socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevLxdApi {
    pub api_compat: u32,
}
