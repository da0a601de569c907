use std::io;

use thiserror::Error;

use crate::instance::InstanceError;

/// Errors from exec session creation, attachment, and execution.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("container is not running")]
    NotRunning,
    #[error("no command specified")]
    MissingCommand,
    #[error("attach secret does not match any descriptor")]
    InvalidSecret,
    #[error("descriptor is already attached")]
    AlreadyAttached,
    #[error("exec session is already over")]
    SessionDone,
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("failed to allocate stdio: {0}")]
    Stdio(#[source] io::Error),
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

impl ExecError {
    /// HTTP status used when this error surfaces on the attach endpoint
    /// or the exec POST handler.
    pub fn http_status(&self) -> u16 {
        match self {
            ExecError::NotRunning | ExecError::MissingCommand => 400,
            ExecError::InvalidSecret => 403,
            ExecError::AlreadyAttached => 409,
            ExecError::SessionDone => 410,
            ExecError::Handshake(_) | ExecError::Stdio(_) | ExecError::Instance(_) => 500,
        }
    }
}
