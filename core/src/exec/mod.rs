//! Exec sessions streamed over WebSockets.
//!
//! Responsibilities
//! - Validates exec POST bodies against a container and prepares either an
//!   advertised WebSocket session or a detached null-device run.
//! - Manages the session lifecycle: per-descriptor secrets, WebSocket
//!   admission, PTY/pipe wiring, the out-of-band control channel, and the
//!   terminal wait status.
//! - Bridges bytes between WebSocket connections and descriptors without
//!   reordering within a stream, and only reports the result after every
//!   output bridge has drained.
//!
//! Flow at a glance (wait-for-websocket)
//! 1) `exec_post` builds an [`ExecSession`] and the caller publishes its
//!    `metadata()` (the secret table) on the async operation.
//! 2) The client opens one WebSocket per descriptor with
//!    `?secret=<secret>`; `connect()` upgrades each only after its secret
//!    matches.
//! 3) Once the stdio descriptors are attached, `run()` allocates a PTY
//!    (interactive) or three pipes (batch), hands the child ends to the
//!    container attach facility, and wires the host ends to the sockets.
//! 4) The control channel is optional throughout; it carries
//!    window-resize requests in interactive mode and never blocks the
//!    session.
//!
//! The split mirrors the subsystem boundaries: `session.rs` owns the
//! lifecycle and wiring, `bridge.rs` the socket/descriptor copies.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use vessel_protocol::ExecPost;
use vessel_protocol::ExecResult;

use crate::instance::AttachOptions;
use crate::instance::Instance;
use crate::instance::InstanceExec;

mod bridge;
mod errors;
mod session;

pub use errors::ExecError;
pub use session::ExecSession;
pub use session::ExecSessionArgs;

/// What an exec POST resolves to.
pub enum ExecAction {
    /// Advertised session: publish `metadata()`, route attach requests to
    /// `connect()`, then await `run()`.
    WaitForWebsocket(Arc<ExecSession>),
    /// Immediate run with all stdio on the null device; only the exit
    /// status is reported.
    Detached(DetachedExec),
}

/// A run that nobody watches: stdio wired to `/dev/null`.
pub struct DetachedExec {
    exec: Arc<dyn InstanceExec>,
    command: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl DetachedExec {
    pub async fn run(&self) -> Result<ExecResult, ExecError> {
        let options = AttachOptions {
            clear_env: true,
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            stdin: open_null()?,
            stdout: open_null()?,
            stderr: open_null()?,
        };
        let status = self.exec.run_command(&self.command, options).await?;
        Ok(ExecResult { ret: status })
    }
}

fn open_null() -> Result<OwnedFd, ExecError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map(OwnedFd::from)
        .map_err(ExecError::Stdio)
}

/// Validates an exec request against a container and prepares the
/// resulting action.
pub fn exec_post(
    instance: &dyn Instance,
    exec: Arc<dyn InstanceExec>,
    post: ExecPost,
) -> Result<ExecAction, ExecError> {
    if !instance.is_running() {
        return Err(ExecError::NotRunning);
    }
    if post.command.is_empty() {
        return Err(ExecError::MissingCommand);
    }

    let mut env = Vec::new();
    let mut cwd = None;
    if let Some(environment) = &post.environment {
        for (key, value) in environment {
            if key == "HOME" {
                cwd = Some(PathBuf::from(value));
            }
            env.push((key.clone(), value.clone()));
        }
    }

    if post.wait_for_websocket {
        let (root_uid, root_gid) = instance.root_ids();
        let session = ExecSession::create(
            exec,
            ExecSessionArgs {
                command: post.command,
                interactive: post.interactive,
                env,
                cwd,
                root_uid,
                root_gid,
            },
        );
        return Ok(ExecAction::WaitForWebsocket(session));
    }

    Ok(ExecAction::Detached(DetachedExec {
        exec,
        command: post.command,
        env,
        cwd,
    }))
}
