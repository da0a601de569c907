//! Shared fixtures: a host-backed exec facility standing in for the
//! container attach call, stub containers, and small protocol clients.

use std::collections::HashMap;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use vessel_core::devlxd::MONITOR_SENTINEL;
use vessel_core::exec::ExecSession;
use vessel_core::instance::AttachOptions;
use vessel_core::instance::Instance;
use vessel_core::instance::InstanceError;
use vessel_core::instance::InstanceExec;
use vessel_core::instance::Instances;

pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Honors `RUST_LOG` when a test needs bridge-level debug output.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Runs the command on the host with the provided stdio descriptors,
/// standing in for the container attach facility. Returns the raw wait
/// status, like the real backend.
pub struct HostExec;

#[async_trait]
impl InstanceExec for HostExec {
    async fn run_command(
        &self,
        command: &[String],
        options: AttachOptions,
    ) -> Result<i64, InstanceError> {
        let program = command
            .first()
            .ok_or_else(|| InstanceError::Backend("empty command".to_string()))?;

        let mut child = tokio::process::Command::new(program);
        child.args(&command[1..]);
        if options.clear_env {
            child.env_clear();
        }
        child.envs(options.env.iter().map(|(key, value)| (key, value)));
        if let Some(cwd) = &options.cwd {
            child.current_dir(cwd);
        }
        child.stdin(Stdio::from(options.stdin));
        child.stdout(Stdio::from(options.stdout));
        child.stderr(Stdio::from(options.stderr));

        let status = child
            .status()
            .await
            .map_err(|err| InstanceError::Backend(err.to_string()))?;
        Ok(i64::from(status.into_raw()))
    }
}

pub struct StubInstance {
    pub name: String,
    pub running: bool,
    pub config: HashMap<String, String>,
    pub init_pid: Option<i32>,
}

impl StubInstance {
    pub fn running(name: &str, config: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            running: true,
            config,
            init_pid: None,
        })
    }
}

impl Instance for StubInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn config(&self) -> HashMap<String, String> {
        self.config.clone()
    }

    fn init_pid(&self) -> Option<i32> {
        self.init_pid
    }

    fn root_ids(&self) -> (u32, u32) {
        // The tests run unprivileged; chowning the PTY subordinate to
        // ourselves mirrors an unshifted container.
        unsafe { (libc::getuid(), libc::getgid()) }
    }
}

pub struct StubInstances {
    pub instances: Vec<Arc<StubInstance>>,
}

impl Instances for StubInstances {
    fn names(&self) -> Result<Vec<String>, InstanceError> {
        Ok(self
            .instances
            .iter()
            .map(|instance| instance.name.clone())
            .collect())
    }

    fn get(&self, name: &str) -> Result<Arc<dyn Instance>, InstanceError> {
        self.instances
            .iter()
            .find(|instance| instance.name == name)
            .cloned()
            .map(|instance| instance as Arc<dyn Instance>)
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))
    }
}

/// Stages a fake `/proc` in which the current process is a container
/// monitor for `name`, so a devlxd connection from this test resolves to
/// that container via the ancestry walk.
pub fn stage_self_as_monitor(proc_root: &Path, name: &str) {
    let pid = std::process::id();
    let dir = proc_root.join(pid.to_string());
    fs::create_dir_all(&dir).expect("staging the proc entry should succeed");
    let mut cmdline = format!("{MONITOR_SENTINEL} /var/lib/vessel/containers {name}").into_bytes();
    cmdline.push(0);
    fs::write(dir.join("cmdline"), cmdline).expect("staging cmdline should succeed");
}

/// Opens a WebSocket attachment to an exec session over an in-memory
/// duplex transport, the way the operation layer hands hijacked
/// connections to `connect()`.
pub async fn attach(
    session: &Arc<ExecSession>,
    secret: &str,
) -> Result<WebSocketStream<tokio::io::DuplexStream>, tungstenite::Error> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = Arc::clone(session);
    let server_task = tokio::spawn(async move { session.connect(server).await });
    let result =
        tokio_tungstenite::client_async(format!("ws://vessel/exec?secret={secret}"), client).await;
    let _ = server_task.await;
    result.map(|(ws, _response)| ws)
}

/// Collects binary frames until the peer sends a close frame or the
/// stream ends.
pub async fn collect_until_close(
    ws: &mut WebSocketStream<tokio::io::DuplexStream>,
) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    loop {
        let message = timeout(READ_TIMEOUT, ws.next())
            .await
            .context("timed out waiting for a frame")?;
        match message {
            Some(Ok(Message::Binary(payload))) => collected.extend_from_slice(&payload),
            Some(Ok(Message::Close(_))) | None => return Ok(collected),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err).context("websocket receive failed"),
        }
    }
}

/// Reads frames until the collected bytes contain `needle`.
pub async fn read_until_contains(
    ws: &mut WebSocketStream<tokio::io::DuplexStream>,
    needle: &[u8],
) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    loop {
        if collected
            .windows(needle.len().max(1))
            .any(|window| window == needle)
        {
            return Ok(collected);
        }
        let message = timeout(READ_TIMEOUT, ws.next())
            .await
            .context("timed out waiting for output")?;
        match message {
            Some(Ok(Message::Binary(payload))) => collected.extend_from_slice(&payload),
            Some(Ok(Message::Close(_))) | None => {
                anyhow::bail!("stream closed before the expected bytes arrived")
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err).context("websocket receive failed"),
        }
    }
}

/// Minimal HTTP/1.1 GET over a UNIX socket; returns the status code and
/// body. `Connection: close` keeps the exchange to one read-to-EOF.
pub async fn http_get(sock: &Path, path: &str) -> Result<(u16, String)> {
    let mut stream = UnixStream::connect(sock)
        .await
        .context("connecting to the devlxd socket failed")?;
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: devlxd\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await?;

    let mut raw = Vec::new();
    timeout(READ_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .context("timed out reading the response")??;

    let text = String::from_utf8(raw).context("response was not UTF-8")?;
    let (head, body) = text
        .split_once("\r\n\r\n")
        .context("malformed HTTP response")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .context("missing status code")?
        .parse()
        .context("unparsable status code")?;
    Ok((status, body.to_string()))
}
