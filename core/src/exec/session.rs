use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use futures::StreamExt;
use rand::Rng;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::handshake::server::Response;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vessel_protocol::CONTROL_FD;
use vessel_protocol::ExecControl;
use vessel_protocol::ExecResult;
use vessel_protocol::ExecWsMetadata;
use vessel_protocol::WINDOW_RESIZE_COMMAND;
use vessel_utils_pty::open_pipe;
use vessel_utils_pty::open_pty;
use vessel_utils_pty::set_nonblocking;
use vessel_utils_pty::set_window_size;

use crate::exec::ExecError;
use crate::exec::bridge;
use crate::exec::bridge::AttachStream;
use crate::exec::bridge::WsConn;
use crate::instance::AttachOptions;
use crate::instance::InstanceExec;

/// Lifecycle of an exec session. Attach events, process exit, and drain
/// completion drive the transitions; `Done` invalidates every secret and
/// closes whatever the session still owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Advertised,
    Attached,
    Running,
    Draining,
    Done,
}

struct SessionInner {
    state: SessionState,
    /// Per-descriptor attach secrets. Keys always mirror `conns`.
    fds: HashMap<i64, String>,
    /// Parked connections, `None` until attached, taken again by wiring.
    conns: HashMap<i64, Option<WsConn>>,
    /// Indices with a handshake in flight; a failed upgrade clears the
    /// entry so the secret stays usable.
    pending: HashSet<i64>,
    /// Indices that have completed an attach, ever.
    attached: HashSet<i64>,
}

pub struct ExecSessionArgs {
    pub command: Vec<String>,
    pub interactive: bool,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Host-side uid/gid of the container's root, for the PTY chown.
    pub root_uid: u32,
    pub root_gid: u32,
}

/// One exec request: advertised descriptor secrets, the WebSockets that
/// claimed them, and the process wired between them.
///
/// Created by the exec POST handler, driven by the operation layer:
/// `metadata()` is published to the client, attach requests are routed to
/// `connect()`, and `run()` is awaited for the terminal result.
pub struct ExecSession {
    command: Vec<String>,
    interactive: bool,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    root_uid: u32,
    root_gid: u32,
    exec: Arc<dyn InstanceExec>,
    inner: StdMutex<SessionInner>,
    all_connected: Notify,
    control_connected: Notify,
    session_end: CancellationToken,
}

impl ExecSession {
    pub fn create(exec: Arc<dyn InstanceExec>, args: ExecSessionArgs) -> Arc<Self> {
        let mut indices = vec![CONTROL_FD, 0];
        if !args.interactive {
            indices.push(1);
            indices.push(2);
        }

        let mut fds = HashMap::new();
        let mut conns = HashMap::new();
        for fd in indices {
            fds.insert(fd, attach_secret());
            conns.insert(fd, None);
        }

        Arc::new(Self {
            command: args.command,
            interactive: args.interactive,
            env: args.env,
            cwd: args.cwd,
            root_uid: args.root_uid,
            root_gid: args.root_gid,
            exec,
            inner: StdMutex::new(SessionInner {
                state: SessionState::Advertised,
                fds,
                conns,
                pending: HashSet::new(),
                attached: HashSet::new(),
            }),
            all_connected: Notify::new(),
            control_connected: Notify::new(),
            session_end: CancellationToken::new(),
        })
    }

    /// The advertised descriptor secrets, published as the operation's
    /// metadata.
    pub fn metadata(&self) -> ExecWsMetadata {
        ExecWsMetadata::from_indexed(&self.inner().fds)
    }

    /// Admits one WebSocket attachment.
    ///
    /// The handshake request must carry a `secret` query parameter; the
    /// upgrade is only completed once the secret has matched an
    /// unattached descriptor. Mismatches are rejected during the
    /// handshake with the HTTP status of the failure: 403 for a bad
    /// secret, 409 for a descriptor that is already attached, 410 once
    /// the session is over. A handshake that fails after the secret
    /// matched does not consume the secret.
    pub async fn connect<S>(&self, stream: S) -> Result<(), ExecError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut claimed_fd: Option<i64> = None;
        let mut rejection: Option<ExecError> = None;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let secret = request.uri().query().and_then(secret_in_query);
            match self.claim(secret) {
                Ok(fd) => {
                    claimed_fd = Some(fd);
                    Ok(response)
                }
                Err(err) => {
                    let status = err.http_status();
                    let body = err.to_string();
                    rejection = Some(err);
                    Err(reject_handshake(status, body))
                }
            }
        };

        let accepted =
            tokio_tungstenite::accept_hdr_async(AttachStream::new(stream), callback).await;

        match accepted {
            Ok(ws) => {
                let Some(fd) = claimed_fd else {
                    return Err(ExecError::InvalidSecret);
                };
                self.finish_attach(fd, ws);
                Ok(())
            }
            Err(err) => {
                if let Some(fd) = claimed_fd {
                    self.inner().pending.remove(&fd);
                }
                match rejection {
                    Some(rejection) => Err(rejection),
                    None => Err(ExecError::Handshake(err)),
                }
            }
        }
    }

    /// Waits for every stdio WebSocket, launches the process, bridges the
    /// streams, and resolves once the process has exited and the output
    /// bridges have drained. The control channel is optional: the session
    /// makes progress whether or not it ever attaches.
    pub async fn run(self: Arc<Self>) -> Result<ExecResult, ExecError> {
        // Unblocks the control reader even if this future is dropped
        // before the session finishes cleanly.
        let _end_guard = self.session_end.clone().drop_guard();

        self.all_connected.notified().await;

        let result = if self.interactive {
            Self::run_interactive(&self).await
        } else {
            Self::run_batch(&self).await
        };

        self.finish();
        result
    }

    async fn run_interactive(session: &Arc<Self>) -> Result<ExecResult, ExecError> {
        let pty = open_pty(session.root_uid, session.root_gid).map_err(ExecError::Stdio)?;
        // The master is polled by a reader that must notice stop requests
        // between reads.
        set_nonblocking(pty.master.as_fd()).map_err(ExecError::Stdio)?;

        let read_half = File::from(pty.master.try_clone().map_err(ExecError::Stdio)?);
        let write_half = Arc::new(File::from(pty.master));
        tokio::spawn(Self::control_reader(
            Arc::clone(session),
            Arc::downgrade(&write_half),
        ));

        let ws = session.take_conn(0).ok_or_else(missing_stdio)?;
        let handles = bridge::mirror(ws, read_half, write_half);

        let options = AttachOptions {
            clear_env: true,
            env: session.env.clone(),
            cwd: session.cwd.clone(),
            stdin: pty.subordinate.try_clone().map_err(ExecError::Stdio)?,
            stdout: pty.subordinate.try_clone().map_err(ExecError::Stdio)?,
            stderr: pty.subordinate,
        };

        session.set_state(SessionState::Running);
        let status = session.exec.run_command(&session.command, options).await?;
        session.set_state(SessionState::Draining);

        // Every byte the child emitted before its terminal closed is on
        // the socket once the send half completes.
        let _ = handles.send_done.await;
        handles.recv_abort.abort();

        Ok(ExecResult { ret: status })
    }

    async fn run_batch(session: &Arc<Self>) -> Result<ExecResult, ExecError> {
        let stdin_pipe = open_pipe().map_err(ExecError::Stdio)?;
        let stdout_pipe = open_pipe().map_err(ExecError::Stdio)?;
        let stderr_pipe = open_pipe().map_err(ExecError::Stdio)?;

        let stdin_ws = session.take_conn(0).ok_or_else(missing_stdio)?;
        let stdout_ws = session.take_conn(1).ok_or_else(missing_stdio)?;
        let stderr_ws = session.take_conn(2).ok_or_else(missing_stdio)?;

        let (_, stdin_frames) = stdin_ws.split();
        let (_, stdin_abort) =
            bridge::recv_stream(File::from(stdin_pipe.write_end), stdin_frames);

        let (stdout_sink, _) = stdout_ws.split();
        let stdout_done =
            bridge::send_stream(stdout_sink, File::from(stdout_pipe.read_end), None);
        let (stderr_sink, _) = stderr_ws.split();
        let stderr_done =
            bridge::send_stream(stderr_sink, File::from(stderr_pipe.read_end), None);

        let options = AttachOptions {
            clear_env: true,
            env: session.env.clone(),
            cwd: session.cwd.clone(),
            stdin: stdin_pipe.read_end,
            stdout: stdout_pipe.write_end,
            stderr: stderr_pipe.write_end,
        };

        session.set_state(SessionState::Running);
        let status = session.exec.run_command(&session.command, options).await?;
        session.set_state(SessionState::Draining);

        // Both output bridges have to drain before the result becomes
        // observable, so clients never lose trailing bytes.
        let _ = stdout_done.await;
        let _ = stderr_done.await;
        stdin_abort.abort();

        Ok(ExecResult { ret: status })
    }

    /// Waits for the control channel and consumes its messages. Unblocked
    /// by session end when the channel never attaches; the session never
    /// waits on this task.
    async fn control_reader(session: Arc<ExecSession>, resize: Weak<File>) {
        tokio::select! {
            _ = session.control_connected.notified() => {}
            _ = session.session_end.cancelled() => return,
        }
        let Some(mut conn) = session.take_conn(CONTROL_FD) else {
            return;
        };

        loop {
            let message = tokio::select! {
                message = conn.next() => message,
                _ = session.session_end.cancelled() => return,
            };
            let Some(message) = message else {
                break;
            };

            let payload = match message {
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Binary(payload)) => payload.to_vec(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    debug!("control channel receive error: {err}");
                    break;
                }
            };

            let control: ExecControl = match serde_json::from_slice(&payload) {
                Ok(control) => control,
                Err(err) => {
                    debug!("failed to decode control message: {err}");
                    continue;
                }
            };

            if control.command != WINDOW_RESIZE_COMMAND {
                debug!(command = control.command.as_str(), "ignoring unknown control command");
                continue;
            }
            let Some(width) = control.args.get("width").and_then(|v| v.parse::<u16>().ok())
            else {
                debug!("window-resize width missing or not an integer");
                continue;
            };
            let Some(height) = control.args.get("height").and_then(|v| v.parse::<u16>().ok())
            else {
                debug!("window-resize height missing or not an integer");
                continue;
            };

            match resize.upgrade() {
                Some(master) => {
                    if let Err(err) = set_window_size(master.as_fd(), width, height) {
                        debug!("failed to set window size to {width}x{height}: {err}");
                    }
                }
                None => debug!("window-resize after stdio closed"),
            }
        }
    }

    fn claim(&self, secret: Option<&str>) -> Result<i64, ExecError> {
        let mut inner = self.inner();
        if inner.state == SessionState::Done {
            return Err(ExecError::SessionDone);
        }
        let Some(secret) = secret else {
            return Err(ExecError::InvalidSecret);
        };
        let fd = inner
            .fds
            .iter()
            .find_map(|(fd, expected)| (expected == secret).then_some(*fd))
            .ok_or(ExecError::InvalidSecret)?;
        if inner.attached.contains(&fd) || inner.pending.contains(&fd) {
            return Err(ExecError::AlreadyAttached);
        }
        inner.pending.insert(fd);
        Ok(fd)
    }

    fn finish_attach(&self, fd: i64, ws: WsConn) {
        let mut inner = self.inner();
        inner.pending.remove(&fd);
        inner.attached.insert(fd);
        inner.conns.insert(fd, Some(ws));

        if fd == CONTROL_FD {
            drop(inner);
            self.control_connected.notify_one();
            return;
        }

        let all_stdio_attached = inner
            .fds
            .keys()
            .filter(|fd| **fd != CONTROL_FD)
            .all(|fd| inner.attached.contains(fd));
        if all_stdio_attached {
            inner.state = SessionState::Attached;
            drop(inner);
            self.all_connected.notify_one();
        }
    }

    fn take_conn(&self, fd: i64) -> Option<WsConn> {
        self.inner().conns.get_mut(&fd).and_then(Option::take)
    }

    fn set_state(&self, state: SessionState) {
        self.inner().state = state;
    }

    fn finish(&self) {
        let mut inner = self.inner();
        inner.state = SessionState::Done;
        // Anything parked and never wired is dropped here, closing its
        // transport; late attachers get 410.
        for conn in inner.conns.values_mut() {
            conn.take();
        }
        drop(inner);
        self.session_end.cancel();
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-descriptor attach token: 32 random bytes, hex-encoded.
fn attach_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn secret_in_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("secret="))
}

fn reject_handshake(status: u16, body: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body));
    if let Ok(status) = StatusCode::from_u16(status) {
        *response.status_mut() = status;
    }
    response
}

fn missing_stdio() -> ExecError {
    ExecError::Stdio(io::Error::other("stdio websocket not attached"))
}
