//! Admin HTTP endpoint
//!
//! TCP clients authenticate with a bearer key: the server key grants full
//! access, an application key grants access to that application's groups.
//! Clients on the admin Unix socket are identified by their peer uid.

use crate::pool::{AuthContext, DisableResult, PoolError, PoolSnapshot};
use crate::server::Server;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the supervisor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Request bodies above this are rejected
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

fn pool_error_response(err: PoolError) -> Response<Full<Bytes>> {
    match err {
        PoolError::Unauthorized => error_json(StatusCode::UNAUTHORIZED, "unauthorized"),
        PoolError::NoSuchGroup(name) => {
            error_json(StatusCode::NOT_FOUND, &format!("no such application group: {}", name))
        }
    }
}

/// Where an admin connection came from
#[derive(Debug, Clone, Copy)]
enum AdminPeer {
    Tcp,
    Unix { uid: Option<u32> },
}

/// Admin API server
pub struct AdminServer {
    bind_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
    server: Arc<Server>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: Option<SocketAddr>,
        socket_path: Option<PathBuf>,
        server: Arc<Server>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            socket_path,
            server,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let tcp = match self.bind_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!(addr = %addr, "Admin API listening");
                Some(listener)
            }
            None => None,
        };

        let unix = match &self.socket_path {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                let listener = tokio::net::UnixListener::bind(path)?;
                info!(path = %path.display(), "Admin API listening on Unix socket");
                Some(listener)
            }
            None => None,
        };

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = accept_tcp(tcp.as_ref()) => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self.server);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, AdminPeer::Tcp, server).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                result = accept_unix(unix.as_ref()) => {
                    match result {
                        Ok(stream) => {
                            let uid = stream.peer_cred().ok().map(|cred| cred.uid());
                            let server = Arc::clone(&self.server);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, AdminPeer::Unix { uid }, server).await {
                                    debug!(?uid, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_unix(listener: Option<&tokio::net::UnixListener>) -> std::io::Result<tokio::net::UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

async fn serve_admin_connection<S>(stream: S, peer: AdminPeer, server: Arc<Server>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let server = Arc::clone(&server);
        async move { handle_admin_request(req, peer, server).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Who the request is from, as far as the pool is concerned
fn authenticate<B>(req: &Request<B>, peer: AdminPeer, server: &Server) -> AuthContext {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).trim().to_string())
        .filter(|key| !key.is_empty());

    if let Some(key) = bearer {
        if server.api_key().as_deref() == Some(key.as_str()) {
            return AuthContext::Admin;
        }
        let known_app_key = server
            .apps()
            .read()
            .values()
            .any(|options| options.api_key.as_deref() == Some(key.as_str()));
        if known_app_key {
            return AuthContext::ApiKey(key);
        }
    }

    match peer {
        AdminPeer::Unix { uid: Some(uid) } if uid == 0 || uid == crate::os::current_uid() => AuthContext::Admin,
        AdminPeer::Unix { uid: Some(uid) } => AuthContext::Uid(uid),
        _ => AuthContext::Anonymous,
    }
}

async fn read_json_object(body: Incoming) -> Result<Map<String, Value>, Response<Full<Bytes>>> {
    let bytes = Limited::new(body, MAX_BODY_SIZE)
        .collect()
        .await
        .map_err(|_| error_json(StatusCode::BAD_REQUEST, "unreadable or oversized request body"))?
        .to_bytes();
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(error_json(StatusCode::BAD_REQUEST, "request body must be a JSON object")),
    }
}

/// Find the gupid of a process visible in `snapshot` by gupid or pid
fn find_gupid(snapshot: &PoolSnapshot, params: &Map<String, Value>) -> Option<String> {
    let processes = || snapshot.groups.iter().flat_map(|g| g.processes.iter());
    if let Some(gupid) = params.get("gupid").and_then(Value::as_str) {
        return processes().find(|p| p.gupid == gupid).map(|p| p.gupid.clone());
    }
    let pid = params.get("pid").and_then(Value::as_u64)?;
    processes().find(|p| u64::from(p.pid) == pid).map(|p| p.gupid.clone())
}

async fn handle_admin_request(
    req: Request<Incoming>,
    peer: AdminPeer,
    server: Arc<Server>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Health and version need no authentication
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            return Ok(json_response(
                StatusCode::OK,
                &json!({ "name": PKG_NAME, "version": VERSION }),
            ));
        }
        _ => {}
    }

    let auth = authenticate(&req, peer, &server);
    if auth == AuthContext::Anonymous {
        warn!(path = %path, "Unauthorized admin API request");
        return Ok(error_json(StatusCode::UNAUTHORIZED, "unauthorized"));
    }
    let pool = server.pool();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/pool.json") => match pool.inspect(&auth) {
            Ok(snapshot) => json_response(StatusCode::OK, &json!(snapshot)),
            Err(e) => pool_error_response(e),
        },

        (&Method::GET, "/pool.txt") => match pool.inspect_text(&auth) {
            Ok(text) => response(StatusCode::OK, text),
            Err(e) => pool_error_response(e),
        },

        (&Method::GET, "/server.json") => {
            if auth == AuthContext::Admin {
                json_response(StatusCode::OK, &server.inspect())
            } else {
                error_json(StatusCode::UNAUTHORIZED, "unauthorized")
            }
        }

        (&Method::POST, "/pool/restart_app_group") | (&Method::POST, "/pool/restart_app_root") => {
            let params = match read_json_object(req.into_body()).await {
                Ok(params) => params,
                Err(resp) => return Ok(resp),
            };
            let field = if path == "/pool/restart_app_group" { "name" } else { "app_root" };
            match params.get(field).and_then(Value::as_str) {
                None => error_json(StatusCode::BAD_REQUEST, &format!("missing '{}'", field)),
                Some(name) => match pool.restart_by_name(name, &auth) {
                    Ok(restarted) => {
                        info!(group = name, restarted, "Application restart requested via admin API");
                        json_response(StatusCode::OK, &json!({ "restarted": restarted }))
                    }
                    Err(e) => pool_error_response(e),
                },
            }
        }

        (&Method::POST, "/pool/detach_process")
        | (&Method::POST, "/pool/disable_process")
        | (&Method::POST, "/pool/enable_process") => {
            let params = match read_json_object(req.into_body()).await {
                Ok(params) => params,
                Err(resp) => return Ok(resp),
            };
            let visible = match pool.inspect(&auth) {
                Ok(snapshot) => snapshot,
                Err(e) => return Ok(pool_error_response(e)),
            };
            match find_gupid(&visible, &params) {
                None => error_json(StatusCode::NOT_FOUND, "no such process"),
                Some(gupid) => match path.as_str() {
                    "/pool/detach_process" => {
                        let detached = pool.detach_process(&gupid);
                        info!(gupid = %gupid, detached, "Process detach requested via admin API");
                        json_response(StatusCode::OK, &json!({ "detached": detached }))
                    }
                    "/pool/enable_process" => {
                        let enabled = pool.enable_process(&gupid);
                        json_response(StatusCode::OK, &json!({ "enabled": enabled }))
                    }
                    _ => {
                        let result = pool.disable_process(&gupid).await;
                        let status = match result {
                            DisableResult::Drained | DisableResult::AlreadyDisabled => StatusCode::OK,
                            DisableResult::NotFound | DisableResult::GroupGone => StatusCode::NOT_FOUND,
                            DisableResult::Canceled => StatusCode::CONFLICT,
                        };
                        json_response(status, &json!({ "result": result }))
                    }
                },
            }
        }

        (&Method::PUT, "/config") => {
            if auth != AuthContext::Admin {
                error_json(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let updates = match read_json_object(req.into_body()).await {
                    Ok(updates) => updates,
                    Err(resp) => return Ok(resp),
                };
                match server.update_settings(&updates) {
                    Ok(result) => {
                        info!(keys = updates.len(), "Configuration updated via admin API");
                        json_response(StatusCode::OK, &json!({ "status": "ok", "apps": result }))
                    }
                    Err(errors) => {
                        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                        warn!(errors = ?messages, "Rejected configuration update");
                        json_response(StatusCode::UNPROCESSABLE_ENTITY, &json!({ "errors": messages }))
                    }
                }
            }
        }

        // 404 for everything else
        _ => error_json(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::{Context, SpawningKitConfig};
    use crate::spawning::{DummyConfig, SpawnerFactory};

    fn server() -> Arc<Server> {
        let config: Config = toml::from_str(
            r#"
[server]
api_key = "admin-key"

[apps."a.test"]
app_root = "/srv/a"
start_command = "./a"
api_key = "app-key"
"#,
        )
        .unwrap();
        let ctx = Context::new(tokio::runtime::Handle::current(), SpawningKitConfig::default());
        Server::with_factory(config, SpawnerFactory::dummy(ctx, DummyConfig::default())).unwrap()
    }

    fn request(auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/pool.json");
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    fn tcp_peer() -> AdminPeer {
        AdminPeer::Tcp
    }

    #[tokio::test]
    async fn test_bearer_keys() {
        let server = server();
        assert_eq!(
            authenticate(&request(Some("Bearer admin-key")), tcp_peer(), &server),
            AuthContext::Admin
        );
        assert_eq!(
            authenticate(&request(Some("Bearer app-key")), tcp_peer(), &server),
            AuthContext::ApiKey("app-key".into())
        );
        assert_eq!(
            authenticate(&request(Some("Bearer nope")), tcp_peer(), &server),
            AuthContext::Anonymous
        );
        assert_eq!(authenticate(&request(None), tcp_peer(), &server), AuthContext::Anonymous);
    }

    #[tokio::test]
    async fn test_unix_peer_uid() {
        let server = server();
        let own = crate::os::current_uid();
        assert_eq!(
            authenticate(&request(None), AdminPeer::Unix { uid: Some(own) }, &server),
            AuthContext::Admin
        );
        let other = if own == 4242 { 4343 } else { 4242 };
        assert_eq!(
            authenticate(&request(None), AdminPeer::Unix { uid: Some(other) }, &server),
            AuthContext::Uid(other)
        );
        assert_eq!(
            authenticate(&request(None), AdminPeer::Unix { uid: None }, &server),
            AuthContext::Anonymous
        );
    }

    #[tokio::test]
    async fn test_find_gupid_by_pid_or_gupid() {
        let server = server();
        let options = server.apps().read()["a.test"].clone();
        let session = server.pool().get(options, None).await.unwrap();
        let gupid = session.gupid().to_string();
        let pid = session.pid();
        drop(session);

        let snapshot = server.pool().inspect(&AuthContext::Admin).unwrap();
        let mut by_pid = Map::new();
        by_pid.insert("pid".into(), Value::from(pid));
        assert_eq!(find_gupid(&snapshot, &by_pid), Some(gupid.clone()));

        let mut by_gupid = Map::new();
        by_gupid.insert("gupid".into(), Value::from(gupid.clone()));
        assert_eq!(find_gupid(&snapshot, &by_gupid), Some(gupid));

        let mut unknown = Map::new();
        unknown.insert("gupid".into(), Value::from("nope"));
        assert_eq!(find_gupid(&snapshot, &unknown), None);
    }
}
