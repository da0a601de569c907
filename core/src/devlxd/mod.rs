//! The guest metadata socket (`devlxd`).
//!
//! An HTTP/1.1 service on a UNIX socket that is bind-mounted into every
//! container at `/dev/lxd`. The caller's container identity comes from
//! the kernel's peer credentials, captured once per accepted connection;
//! nothing a guest sends can influence which container it is served as.
//!
//! Structured responses are `application/json`; raw values and every
//! non-200 are `application/octet-stream` with the error text as body.

mod resolver;

pub use resolver::MONITOR_SENTINEL;
pub use resolver::PidResolver;
pub use resolver::ResolveError;

use std::fs;
use std::io;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::Path as RoutePath;
use axum::extract::State;
use axum::extract::connect_info::Connected;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::serve::IncomingStream;
use serde_json::json;
use tokio::net::UnixListener;
use tracing::debug;
use vessel_protocol::DEVLXD_API_COMPAT;

use crate::instance::Instance;
use crate::instance::Instances;

/// Config keys a guest may read are namespaced under this prefix.
const USER_CONFIG_PREFIX: &str = "user.";

/// Config key appended verbatim to the cloud-init meta-data document.
const META_DATA_KEY: &str = "user.meta-data";

/// Directory under the daemon's var path holding the guest socket; this
/// is what gets bind-mounted into containers at `/dev/lxd`.
pub fn socket_directory(var_path: &Path) -> PathBuf {
    var_path.join("devlxd")
}

/// Value for a container's `lxc.mount.entry` config key that mounts the
/// socket directory at `/dev/lxd`.
pub fn mount_entry(var_path: &Path) -> String {
    format!(
        "{} dev/lxd none bind,create=dir 0 0",
        socket_directory(var_path).display()
    )
}

/// Creates the devlxd listening socket under `var_path`.
///
/// A stale socket left behind by a previous daemon is removed; by the
/// time we get here the old daemon is known to be dead. The socket is
/// world-accessible because every container user may talk to it;
/// authorization happens per connection via peer credentials.
pub fn bind_socket(var_path: &Path) -> io::Result<UnixListener> {
    let directory = socket_directory(var_path);
    fs::create_dir_all(&directory)?;
    fs::set_permissions(&directory, fs::Permissions::from_mode(0o777))?;

    let sock = directory.join("sock");
    match fs::remove_file(&sock) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let listener = UnixListener::bind(&sock)?;
    fs::set_permissions(&sock, fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

/// Peer identity of one accepted connection, captured at accept time.
/// A later exec inside the guest cannot change it.
#[derive(Clone, Debug)]
pub struct ConnectionCredentials {
    pid: Option<i32>,
}

impl Connected<IncomingStream<'_, UnixListener>> for ConnectionCredentials {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        match stream.io().peer_cred() {
            Ok(cred) => Self { pid: cred.pid() },
            Err(err) => {
                debug!("failed to read peer credentials: {err}");
                Self { pid: None }
            }
        }
    }
}

#[derive(Clone)]
pub struct DevLxdState {
    instances: Arc<dyn Instances>,
    resolver: Arc<PidResolver>,
}

impl DevLxdState {
    pub fn new(instances: Arc<dyn Instances>, resolver: PidResolver) -> Self {
        Self {
            instances,
            resolver: Arc::new(resolver),
        }
    }
}

/// Serves the devlxd API on an already-bound listener.
pub async fn serve(listener: UnixListener, state: DevLxdState) -> io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<ConnectionCredentials>(),
    )
    .await
}

fn router(state: DevLxdState) -> Router {
    Router::new()
        .route("/", get(api_listing))
        .route("/1.0", get(api_version))
        .route("/1.0/config", get(config_listing))
        .route("/1.0/config/{key}", get(config_key))
        .route("/1.0/meta-data", get(meta_data))
        .with_state(state)
}

enum DevLxdResponse {
    Json(serde_json::Value),
    Raw(String),
    Error(StatusCode, String),
}

impl IntoResponse for DevLxdResponse {
    fn into_response(self) -> Response {
        match self {
            DevLxdResponse::Json(value) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                value.to_string(),
            )
                .into_response(),
            DevLxdResponse::Raw(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                body,
            )
                .into_response(),
            DevLxdResponse::Error(status, message) => (
                status,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                message,
            )
                .into_response(),
        }
    }
}

/// Resolves the connection's peer PID to a container, or produces the
/// 500 the request has to end with: an unidentified caller cannot be
/// authorized for anything.
fn resolve(
    state: &DevLxdState,
    creds: &ConnectionCredentials,
) -> Result<Arc<dyn Instance>, DevLxdResponse> {
    let Some(pid) = creds.pid else {
        return Err(DevLxdResponse::Error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no peer credentials for connection".to_string(),
        ));
    };
    state
        .resolver
        .resolve(pid, state.instances.as_ref())
        .map_err(|err| {
            DevLxdResponse::Error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })
}

async fn api_listing(
    State(state): State<DevLxdState>,
    ConnectInfo(creds): ConnectInfo<ConnectionCredentials>,
) -> DevLxdResponse {
    match resolve(&state, &creds) {
        Ok(_) => DevLxdResponse::Json(json!(["/1.0"])),
        Err(response) => response,
    }
}

async fn api_version(
    State(state): State<DevLxdState>,
    ConnectInfo(creds): ConnectInfo<ConnectionCredentials>,
) -> DevLxdResponse {
    match resolve(&state, &creds) {
        Ok(_) => DevLxdResponse::Json(json!({ "api_compat": DEVLXD_API_COMPAT })),
        Err(response) => response,
    }
}

async fn config_listing(
    State(state): State<DevLxdState>,
    ConnectInfo(creds): ConnectInfo<ConnectionCredentials>,
) -> DevLxdResponse {
    let instance = match resolve(&state, &creds) {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    let mut paths: Vec<String> = instance
        .config()
        .keys()
        .filter(|key| key.starts_with(USER_CONFIG_PREFIX))
        .map(|key| format!("/1.0/config/{key}"))
        .collect();
    // Stable bodies: repeated reads of unchanged config are
    // byte-identical.
    paths.sort_unstable();
    DevLxdResponse::Json(json!(paths))
}

async fn config_key(
    RoutePath(key): RoutePath<String>,
    State(state): State<DevLxdState>,
    ConnectInfo(creds): ConnectInfo<ConnectionCredentials>,
) -> DevLxdResponse {
    let instance = match resolve(&state, &creds) {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    if !key.starts_with(USER_CONFIG_PREFIX) {
        return DevLxdResponse::Error(StatusCode::FORBIDDEN, "not authorized".to_string());
    }
    match instance.config().get(&key) {
        Some(value) => DevLxdResponse::Raw(value.clone()),
        None => DevLxdResponse::Error(StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

async fn meta_data(
    State(state): State<DevLxdState>,
    ConnectInfo(creds): ConnectInfo<ConnectionCredentials>,
) -> DevLxdResponse {
    let instance = match resolve(&state, &creds) {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    let name = instance.name().to_string();
    let config = instance.config();
    let value = config.get(META_DATA_KEY).map(String::as_str).unwrap_or_default();
    DevLxdResponse::Raw(format!(
        "#cloud-config\ninstance-id: {name}\nlocal-hostname: {name}\n{value}"
    ))
}
