#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Container-facing control surfaces of the vessel daemon.
//!
//! Two subsystems live here, one on each side of the container boundary:
//!
//! - [`exec`]: launches a process inside a running container and streams
//!   its standard descriptors (plus an out-of-band control channel) over
//!   WebSocket connections, with PTY or three-pipe semantics.
//! - [`devlxd`]: an HTTP service on a UNIX socket bind-mounted into every
//!   container, identifying callers from kernel peer credentials and
//!   serving container-scoped configuration and cloud-init metadata.
//!
//! Container lifecycle, config storage, and the daemon's outer HTTP
//! routing are external; their interfaces are the traits in [`instance`].

pub mod devlxd;
pub mod exec;
pub mod instance;
