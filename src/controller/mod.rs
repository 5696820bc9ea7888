//! Request controller
//!
//! One controller runs per event-loop thread and owns everything that is
//! private to that loop: its client connections, its worker keep-alive
//! connections and its response cache. The pool is the only state shared
//! between controllers.
//!
//! A request moves through these stages:
//!
//! 1. resolve the application from the Host header and consult the cache
//! 2. buffer the body when it has no known length or the app asks for it
//! 3. check out a session from the pool (the request parks until one is free)
//! 4. connect to the worker and send the header in its dialect
//! 5. forward the body
//! 6. parse the response head and stream the body back
//! 7. release the session; keep-alive worker connections are kept for reuse

pub mod body_buffer;
pub mod forward_response;
pub mod request;
pub mod send_request;

use crate::conn_pool::{ConnectionPool, Endpoint, PoolConfig, WorkerBody, WorkerSender};
use crate::error::{full_body, html_error_response, json_error_response, ErrorCode, ResponseBody};
use crate::pool::{GetError, Options, Pool, Session};
use crate::response_cache::{CacheStats, ResponseCache, DEFAULT_FRESHNESS, MAX_BODY_SIZE};
use crate::spawning::error_page::{render_friendly, render_terse};
use body_buffer::BufferedBody;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use forward_response::{read_session_head, strip_hop_by_hop, AppBody, AppResponseError, SessionBody};
use futures::channel::mpsc;
use futures::{future, stream, SinkExt, StreamExt};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::{Mutex, RwLock};
use request::{ConnectionTrust, Framing, Peer};
use send_request::{ForwardInfo, OutgoingBody, SendError, X_REQUEST_ID};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Applications by hostname, shared by all controllers and swapped on reload
pub type SharedApps = Arc<RwLock<HashMap<String, Options>>>;

const SESSION_RETRY_DELAY: Duration = Duration::from_millis(10);
const RESPONSE_CHANNEL_SIZE: usize = 8;

/// Controller tunables taken from the configuration store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub turbocaching: bool,
    pub heuristic_freshness_floor: Duration,
    /// Lifetime of cached responses that carry no freshness information
    pub default_freshness: Duration,
    /// Connection attempts to a checked-out worker before giving up
    pub max_session_checkout_try: u32,
    /// Request bodies larger than this are buffered on disk
    pub body_buffer_threshold: usize,
    pub sticky_sessions_cookie_name: String,
    pub secure_headers_password: Option<String>,
    pub server_software: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            turbocaching: true,
            heuristic_freshness_floor: Duration::from_secs(1),
            default_freshness: DEFAULT_FRESHNESS,
            max_session_checkout_try: 10,
            body_buffer_threshold: 128 * 1024,
            sticky_sessions_cookie_name: "_appgate_route".to_string(),
            secure_headers_password: None,
            server_software: format!("appgate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ControllerSettings {
    /// Read settings from effective store values; missing keys keep their defaults
    pub fn from_values(values: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let uint = |key: &str| values.get(key).and_then(Value::as_u64);
        let string = |key: &str| values.get(key).and_then(Value::as_str).map(String::from);

        Self {
            turbocaching: values
                .get("turbocaching")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.turbocaching),
            heuristic_freshness_floor: uint("heuristic_freshness_floor")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heuristic_freshness_floor),
            default_freshness: uint("default_freshness")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_freshness),
            max_session_checkout_try: uint("max_session_checkout_try")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_session_checkout_try),
            body_buffer_threshold: uint("body_buffer_threshold")
                .map(|n| n as usize)
                .unwrap_or(defaults.body_buffer_threshold),
            sticky_sessions_cookie_name: string("sticky_sessions_cookie_name")
                .unwrap_or(defaults.sticky_sessions_cookie_name),
            secure_headers_password: string("secure_headers_password"),
            server_software: string("server_software").unwrap_or(defaults.server_software),
        }
    }

    fn new_cache(&self) -> ResponseCache {
        let mut cache = ResponseCache::new(self.heuristic_freshness_floor);
        cache.set_default_freshness(self.default_freshness);
        cache
    }
}

/// Where a request is on its way through the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Begin,
    BufferingBody,
    CheckingOutSession,
    SendingHeaderToApp,
    ForwardingBodyToApp,
    WaitingForAppResponse,
    ForwardingResponse,
    WritingSimpleResponse,
    Ended,
}

/// A request in flight
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: u64,
    pub state: RequestState,
    pub method: String,
    pub path: String,
    pub hostname: Option<String>,
    pub request_id: Option<String>,
    /// Process serving the request, once a session is checked out
    pub gupid: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ControllerStats {
    requests: AtomicU64,
    active: AtomicUsize,
    cache_hits: AtomicU64,
    app_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub thread: usize,
    pub requests: u64,
    pub active_requests: usize,
    pub cache_hits: u64,
    pub app_errors: u64,
    pub cache: CacheStats,
    pub cache_entries: usize,
    pub worker_connects: u64,
    pub worker_reuses: u64,
    pub idle_worker_connections: usize,
    pub requests_in_flight: Vec<RequestRecord>,
}

/// Registers a request while it (or its response stream) lives
struct ActiveRequest {
    controller: Arc<Controller>,
    id: u64,
}

impl ActiveRequest {
    fn new(controller: &Arc<Controller>, parts: &Parts) -> Self {
        controller.stats.active.fetch_add(1, Ordering::Relaxed);
        let id = controller.next_request.fetch_add(1, Ordering::Relaxed);
        controller.requests.insert(
            id,
            RequestRecord {
                id,
                state: RequestState::Begin,
                method: parts.method.to_string(),
                path: parts.uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_else(|| "/".into()),
                hostname: None,
                request_id: None,
                gupid: None,
                started_at: Utc::now(),
            },
        );
        Self {
            controller: Arc::clone(controller),
            id,
        }
    }

    fn update(&self, f: impl FnOnce(&mut RequestRecord)) {
        if let Some(mut record) = self.controller.requests.get_mut(&self.id) {
            f(record.value_mut());
        }
    }

    fn set_state(&self, state: RequestState) {
        self.controller.set_request_state(self.id, state);
    }

    fn simple(&self, response: Response<ResponseBody>) -> Response<ResponseBody> {
        self.set_state(RequestState::WritingSimpleResponse);
        response
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.controller.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.controller.requests.remove(&self.id);
    }
}

/// What a worker answered, in either dialect
struct AppResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: AppBody,
    /// HTTP connection to park once the body has been read to the end
    recycle: Option<(WorkerSender, Endpoint)>,
}

/// Everything needed to talk to the worker behind a checked-out session
struct Outbound<'a> {
    session: &'a Session,
    endpoint: &'a Endpoint,
    parts: &'a Parts,
    info: &'a ForwardInfo,
    active: &'a ActiveRequest,
    max_tries: u32,
}

pub struct Controller {
    thread_number: usize,
    pool: Arc<Pool>,
    apps: SharedApps,
    settings: RwLock<Arc<ControllerSettings>>,
    cache: Mutex<ResponseCache>,
    conn_pool: ConnectionPool,
    stats: ControllerStats,
    requests: DashMap<u64, RequestRecord>,
    next_request: AtomicU64,
}

impl Controller {
    pub fn new(thread_number: usize, pool: Arc<Pool>, apps: SharedApps, settings: ControllerSettings) -> Arc<Self> {
        Arc::new(Self {
            thread_number,
            pool,
            apps,
            cache: Mutex::new(settings.new_cache()),
            settings: RwLock::new(Arc::new(settings)),
            conn_pool: ConnectionPool::new(PoolConfig::default()),
            stats: ControllerStats::default(),
            requests: DashMap::new(),
            next_request: AtomicU64::new(1),
        })
    }

    pub fn thread_number(&self) -> usize {
        self.thread_number
    }

    pub fn settings(&self) -> Arc<ControllerSettings> {
        Arc::clone(&self.settings.read())
    }

    /// Swap in new settings. Requests already running keep the old ones.
    pub fn apply_settings(&self, settings: ControllerSettings) {
        let mut cache = self.cache.lock();
        if settings.turbocaching {
            cache.set_heuristic_floor(settings.heuristic_freshness_floor);
            cache.set_default_freshness(settings.default_freshness);
        } else {
            *cache = settings.new_cache();
        }
        *self.settings.write() = Arc::new(settings);
    }

    pub fn active_requests(&self) -> usize {
        self.stats.active.load(Ordering::Relaxed)
    }

    /// Close idle worker connections past their idle timeout
    pub fn evict_idle_connections(&self) -> usize {
        self.conn_pool.evict_expired()
    }

    fn set_request_state(&self, id: u64, state: RequestState) {
        if let Some(mut record) = self.requests.get_mut(&id) {
            record.state = state;
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let mut requests_in_flight: Vec<RequestRecord> =
            self.requests.iter().map(|r| r.value().clone()).collect();
        requests_in_flight.sort_by_key(|r| r.id);

        let cache = self.cache.lock();
        let conn_stats = self.conn_pool.stats();
        ControllerSnapshot {
            thread: self.thread_number,
            requests: self.stats.requests.load(Ordering::Relaxed),
            active_requests: self.active_requests(),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            app_errors: self.stats.app_errors.load(Ordering::Relaxed),
            cache: cache.stats(),
            cache_entries: cache.len(),
            worker_connects: conn_stats.get_connects(),
            worker_reuses: conn_stats.get_reuses(),
            idle_worker_connections: self.conn_pool.idle_count(),
            requests_in_flight,
        }
    }

    /// Serve one client connection until it closes
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: Peer) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let trust = Arc::new(ConnectionTrust::new());
        let service = service_fn(move |req: Request<Incoming>| {
            let controller = Arc::clone(&self);
            let trust = Arc::clone(&trust);
            async move { controller.handle_request(req, peer, &trust).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: Peer,
        trust: &ConnectionTrust,
    ) -> Result<Response<ResponseBody>, hyper::Error> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();
        let (mut parts, body) = req.into_parts();
        let active = ActiveRequest::new(&self, &parts);

        let secure = match request::take_secure_headers(
            &mut parts.headers,
            &peer,
            settings.secure_headers_password.as_deref(),
            trust,
        ) {
            Ok(secure) => secure,
            Err(code) => {
                warn!(?peer, "Secure headers from an untrusted peer");
                return Ok(active.simple(json_error_response(
                    code,
                    "Secure headers are only accepted from trusted peers",
                )));
            }
        };

        let framing = match request::request_framing(&parts.headers) {
            Ok(framing) => framing,
            Err(code) => {
                return Ok(active.simple(json_error_response(code, "Conflicting or invalid request body framing")));
            }
        };

        let Some(hostname) = request::extract_hostname(&parts.headers) else {
            return Ok(active.simple(json_error_response(
                ErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            )));
        };

        let Some(options) = self.apps.read().get(&hostname).cloned() else {
            return Ok(active.simple(json_error_response(
                ErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            )));
        };

        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        active.update(|record| {
            record.hostname = Some(hostname.clone());
            record.request_id = Some(request_id.clone());
        });
        let scheme = if secure.https { "https" } else { "http" };
        let (remote_addr, remote_port) = match (&secure.remote_addr, peer) {
            (Some(addr), _) => (addr.clone(), 0),
            (None, Peer::Tcp(addr)) => (addr.ip().to_string(), addr.port()),
            (None, Peer::Unix) => ("127.0.0.1".to_string(), 0),
        };

        debug!(hostname, method = %parts.method, uri = %parts.uri, request_id, "Incoming request");

        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let cache_key = if settings.turbocaching {
            ResponseCache::key_for(scheme, &hostname, path)
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if parts.method == Method::GET && ResponseCache::request_allows_fetch(&parts.method, &parts.headers) {
                let now = self.pool.context().wall_now();
                let hit = self.cache.lock().fetch(key, now);
                if let Some(cached) = hit {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(hostname, path, "Served from response cache");
                    active.set_state(RequestState::Ended);
                    return Ok(cached_response(cached.status, cached.headers, cached.body));
                }
            }
        }

        let outgoing = match framing {
            Framing::Empty => OutgoingBody::Empty,
            Framing::Length(0) => OutgoingBody::Buffered(BufferedBody::empty()),
            Framing::Length(length) if !options.buffer_request_body => OutgoingBody::Streaming { body, length },
            _ => {
                active.set_state(RequestState::BufferingBody);
                match BufferedBody::collect(body, settings.body_buffer_threshold).await {
                    Ok(buffered) => OutgoingBody::Buffered(buffered),
                    Err(e) => {
                        debug!(hostname, error = %e, "Could not buffer request body");
                        return Ok(active.simple(json_error_response(
                            ErrorCode::RequestBodyError,
                            "Could not read request body",
                        )));
                    }
                }
            }
        };

        let sticky = if options.sticky_sessions {
            request::cookie_value(&parts.headers, &settings.sticky_sessions_cookie_name)
        } else {
            None
        };

        active.set_state(RequestState::CheckingOutSession);
        let checkout = self.pool.get(options.clone(), sticky.clone());
        let checked_out = if options.max_request_queue_time.is_zero() {
            checkout.await
        } else {
            match tokio::time::timeout(options.max_request_queue_time, checkout).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        hostname,
                        waited_ms = options.max_request_queue_time.as_millis() as u64,
                        "Request spent too long in the queue"
                    );
                    return Ok(active.simple(json_error_response(
                        ErrorCode::RequestQueueTimeout,
                        "Timed out waiting for an application process",
                    )));
                }
            }
        };
        let session = match checked_out {
            Ok(session) => session,
            Err(e) => return Ok(active.simple(checkout_error_response(&options, e))),
        };
        active.update(|record| record.gupid = Some(session.gupid().to_string()));

        let Some(endpoint) = session.endpoint() else {
            error!(gupid = session.gupid(), address = %session.socket().address, "Worker advertised an unusable socket");
            session.close(true);
            return Ok(active.simple(json_error_response(
                ErrorCode::AppConnectFailed,
                "Failed to connect to application",
            )));
        };
        let server_port = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.rsplit_once(':'))
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let info = ForwardInfo {
            request_id: request_id.clone(),
            remote_addr,
            remote_port,
            scheme,
            server_name: hostname.clone(),
            server_port,
            server_software: settings.server_software.clone(),
        };

        let outbound = Outbound {
            session: &session,
            endpoint: &endpoint,
            parts: &parts,
            info: &info,
            active: &active,
            max_tries: settings.max_session_checkout_try,
        };
        let exchanged = if session.uses_session_protocol() {
            self.exchange_session(&outbound, outgoing).await
        } else {
            self.exchange_http(&outbound, outgoing).await
        };
        drop(outbound);

        let AppResponse {
            status,
            headers,
            body,
            recycle,
        } = match exchanged {
            Ok(response) => response,
            Err(Exchange::Connect) => {
                warn!(
                    hostname,
                    gupid = session.gupid(),
                    endpoint = %endpoint,
                    attempts = settings.max_session_checkout_try,
                    "Could not connect to worker"
                );
                self.conn_pool.forget_process(session.gupid());
                session.close(true);
                self.stats.app_errors.fetch_add(1, Ordering::Relaxed);
                return Ok(active.simple(json_error_response(
                    ErrorCode::AppConnectFailed,
                    "Failed to connect to application",
                )));
            }
            Err(Exchange::Send(SendError::Client(e))) => {
                debug!(hostname, gupid = session.gupid(), error = %e, "Client body ended early");
                drop(session);
                return Ok(active.simple(json_error_response(
                    ErrorCode::RequestBodyError,
                    "Could not read request body",
                )));
            }
            Err(e) => {
                warn!(hostname, gupid = session.gupid(), pid = session.pid(), error = %e, "Worker failed to respond");
                session.close(true);
                self.stats.app_errors.fetch_add(1, Ordering::Relaxed);
                return Ok(active.simple(json_error_response(
                    ErrorCode::AppResponseError,
                    "The application sent an invalid response",
                )));
            }
        };

        if let Some(key) = cache_key.as_deref().filter(|_| parts.method != Method::GET) {
            self.cache.lock().invalidate(key, scheme, &hostname, &headers);
        }
        let cache_target = cache_key.filter(|_| {
            parts.method == Method::GET
                && ResponseCache::request_allows_store(&parts.method, &parts.headers)
                && ResponseCache::response_storable(status, &headers)
        });

        let mut response_headers = headers.clone();
        if !response_headers.contains_key("x-powered-by") {
            if let Ok(value) = HeaderValue::from_str(&settings.server_software) {
                response_headers.insert("x-powered-by", value);
            }
        }
        if options.sticky_sessions && sticky.as_deref() != Some(session.gupid()) {
            if let Some(cookie) = request::sticky_cookie(&settings.sticky_sessions_cookie_name, session.gupid()) {
                response_headers.append(hyper::header::SET_COOKIE, cookie);
            }
        }

        active.set_state(RequestState::ForwardingResponse);
        let finished = body.is_end_stream();
        let forwarding = Forwarding {
            controller: Arc::clone(&self),
            body,
            recycle,
            cache: cache_target.map(|key| CacheTee {
                key,
                status,
                headers,
                body: Vec::new(),
                overflowed: false,
            }),
            session,
            active,
        };

        if finished {
            forwarding.finish(None).await;
            return Ok(cached_response(status, response_headers, Bytes::new()));
        }

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        tokio::spawn(forwarding.run(tx));

        let mut response = Response::new(StreamBody::new(rx).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    /// Send the request through a hyper client connection. A parked
    /// connection that turns out to be dead before the request went out is
    /// replaced and the request sent again.
    async fn exchange_http(self: &Arc<Self>, out: &Outbound<'_>, outgoing: OutgoingBody) -> Result<AppResponse, Exchange> {
        let content_length = outgoing.content_length();
        let has_body = content_length.is_some_and(|n| n > 0);
        let mut body = outgoing.into_worker_body();
        if has_body {
            body = self.mark_body_sent(out.active.id, body);
        }
        let mut request = send_request::http_request(out.parts, body, content_length, out.info);
        let gupid = out.session.gupid();

        loop {
            let (mut sender, reused) = retry_connect(gupid, out.endpoint, out.max_tries, || {
                self.conn_pool.checkout(gupid, out.endpoint)
            })
            .await
            .ok_or(Exchange::Connect)?;

            out.active.set_state(if has_body {
                RequestState::ForwardingBodyToApp
            } else {
                RequestState::WaitingForAppResponse
            });
            match sender.try_send_request(request).await {
                Ok(response) => {
                    let (head, body) = response.into_parts();
                    let mut headers = head.headers;
                    strip_hop_by_hop(&mut headers);
                    return Ok(AppResponse {
                        status: head.status,
                        headers,
                        body: AppBody::Http(body),
                        recycle: Some((sender, out.endpoint.clone())),
                    });
                }
                Err(mut e) => {
                    if reused {
                        if let Some(unsent) = e.take_message() {
                            debug!(gupid, error = %e.error(), "Stale worker connection, retrying");
                            request = unsent;
                            continue;
                        }
                    }
                    let error = e.into_error();
                    return Err(if error.is_user() {
                        Exchange::Send(SendError::Client(error.to_string()))
                    } else {
                        Exchange::Response(error.into())
                    });
                }
            }
        }
    }

    /// Write the session header and body, half-close, then read the head
    async fn exchange_session(&self, out: &Outbound<'_>, mut outgoing: OutgoingBody) -> Result<AppResponse, Exchange> {
        let header = send_request::session_header(out.parts, outgoing.content_length(), out.info);
        let mut stream = retry_connect(out.session.gupid(), out.endpoint, out.max_tries, || out.endpoint.connect())
            .await
            .ok_or(Exchange::Connect)?;

        out.active.set_state(RequestState::SendingHeaderToApp);
        stream.write_all(&header).await?;
        out.active.set_state(RequestState::ForwardingBodyToApp);
        send_request::send_body(&mut stream, &mut outgoing).await?;
        stream.shutdown().await?;

        out.active.set_state(RequestState::WaitingForAppResponse);
        let mut leftover = Vec::new();
        let head = read_session_head(&mut stream, &mut leftover, out.parts.method == Method::HEAD)
            .await
            .map_err(Exchange::Response)?;
        Ok(AppResponse {
            status: head.status,
            headers: head.headers,
            body: AppBody::Session(SessionBody::new(stream, head.framing, leftover)),
            recycle: None,
        })
    }

    /// Moves the request to WaitingForAppResponse once hyper has sent the whole body
    fn mark_body_sent(self: &Arc<Self>, id: u64, body: WorkerBody) -> WorkerBody {
        let controller = Arc::clone(self);
        let end = stream::once(async move {
            controller.set_request_state(id, RequestState::WaitingForAppResponse);
            None::<Result<Frame<Bytes>, io::Error>>
        });
        let frames = BodyStream::new(body).map(Some).chain(end).filter_map(future::ready);
        StreamBody::new(frames).boxed_unsync()
    }
}

/// Connect to a checked-out worker, retrying while it is not listening yet
async fn retry_connect<T, F, Fut>(gupid: &str, endpoint: &Endpoint, max_tries: u32, mut connect: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    for attempt in 1..=max_tries.max(1) {
        match connect().await {
            Ok(connected) => return Some(connected),
            Err(e) => {
                debug!(gupid, endpoint = %endpoint, attempt, error = %e, "Worker connect failed");
                if attempt < max_tries {
                    tokio::time::sleep(SESSION_RETRY_DELAY).await;
                }
            }
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
enum Exchange {
    #[error("could not connect to the worker")]
    Connect,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Response(AppResponseError),
}

impl From<io::Error> for Exchange {
    fn from(e: io::Error) -> Self {
        Exchange::Send(SendError::App(e))
    }
}

/// Copy of a response body kept for the cache while it streams
struct CacheTee {
    key: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    overflowed: bool,
}

impl CacheTee {
    fn push(&mut self, data: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.body.len() + data.len() > MAX_BODY_SIZE {
            self.overflowed = true;
            self.body = Vec::new();
        } else {
            self.body.extend_from_slice(data);
        }
    }
}

/// A response body on its way from a worker to a client
struct Forwarding {
    controller: Arc<Controller>,
    session: Session,
    body: AppBody,
    recycle: Option<(WorkerSender, Endpoint)>,
    cache: Option<CacheTee>,
    active: ActiveRequest,
}

type FrameSender = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

impl Forwarding {
    async fn run(mut self, mut tx: FrameSender) {
        // the last piece is held back until the response is stored and the
        // session released, so a client never sees the end before the pool does
        let mut pending: Option<Bytes> = None;
        loop {
            match self.body.next_chunk().await {
                Ok(Some(data)) => {
                    if let Some(tee) = &mut self.cache {
                        tee.push(&data);
                    }
                    if let Some(previous) = pending.replace(data) {
                        if tx.send(Ok(Frame::data(previous))).await.is_err() {
                            debug!(gupid = self.session.gupid(), "Client went away mid-response");
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(gupid = self.session.gupid(), pid = self.session.pid(), error = %e, "Worker response broke off");
                    self.controller.stats.app_errors.fetch_add(1, Ordering::Relaxed);
                    let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))).await;
                    self.session.close(true);
                    return;
                }
            }
        }
        self.finish(pending.take().map(|last| (last, tx))).await;
    }

    /// Store, recycle the connection, release the session, then send the final piece
    async fn finish(self, last: Option<(Bytes, FrameSender)>) {
        let Forwarding {
            controller,
            session,
            body,
            recycle,
            cache,
            active,
        } = self;
        active.set_state(RequestState::Ended);

        if let Some(tee) = cache.filter(|t| !t.overflowed) {
            let now = controller.pool.context().wall_now();
            let stored = controller
                .cache
                .lock()
                .store(&tee.key, tee.status, &tee.headers, Bytes::from(tee.body), now);
            debug!(key = %tee.key, stored, "Response cache store");
        }

        if let Some((sender, endpoint)) = recycle {
            if body.is_end_stream() {
                controller.conn_pool.checkin(session.gupid(), endpoint, sender);
            }
        }
        drop(body);
        drop(session);

        if let Some((data, mut tx)) = last {
            let _ = tx.send(Ok(Frame::data(data))).await;
        }
        drop(active);
    }
}

fn cached_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn queue_full_page(limit: usize) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Service Unavailable</title></head><body>\n\
<h1>This website is under heavy load</h1>\n\
<p>The request queue is full ({} requests waiting). Please try again later.</p>\n</body></html>\n",
        limit
    )
}

/// Error response for a failed checkout
fn checkout_error_response(options: &Options, err: GetError) -> Response<ResponseBody> {
    let app = options.identity().name();
    match err {
        GetError::RequestQueueFull { limit, status_code } => {
            warn!(app = %app, limit, status_code, "Request queue full");
            let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
            html_error_response(ErrorCode::RequestQueueFull, status, queue_full_page(limit))
        }
        GetError::Spawn(err) => {
            error!(
                app = %app,
                error_id = %err.id,
                category = %err.category,
                summary = %err.summary,
                "Could not spawn application"
            );
            let code = if err.is_timeout() {
                ErrorCode::SpawnTimeout
            } else {
                ErrorCode::SpawnFailed
            };
            let html = if options.friendly_error_pages_enabled() {
                render_friendly(&err, &app)
            } else {
                render_terse(&err)
            };
            html_error_response(code, StatusCode::INTERNAL_SERVER_ERROR, html)
        }
        GetError::ShuttingDown => json_error_response(ErrorCode::ShuttingDown, "Server is shutting down"),
        GetError::GroupGone => {
            info!(app = %app, "Application removed while the request waited");
            json_error_response(ErrorCode::ShuttingDown, "Application is no longer available")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, SpawningKitConfig};
    use crate::pool::{AuthContext, PoolTuning};
    use crate::spawning::{DummyConfig, SpawnerFactory};
    use http_body_util::Full;
    use hyper::server::conn::http1 as server_http1;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn controller_with(dummy: DummyConfig, options: Options) -> Arc<Controller> {
        let ctx = Context::new(tokio::runtime::Handle::current(), SpawningKitConfig::default());
        let pool = Pool::new(
            SpawnerFactory::dummy(ctx, dummy),
            PoolTuning {
                max: 1,
                ..PoolTuning::default()
            },
        );
        let apps: SharedApps = Arc::new(RwLock::new(HashMap::from([("app.test".to_string(), options)])));
        Controller::new(0, pool, apps, ControllerSettings::default())
    }

    fn app_options() -> Options {
        let mut options = Options::new("/srv/app", "true");
        options.max_processes = 1;
        options
    }

    /// Accept client connections for `controller` on a local port
    async fn listen(controller: Arc<Controller>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                tokio::spawn(Arc::clone(&controller).serve_connection(stream, Peer::Tcp(addr)));
            }
        });
        endpoint
    }

    async fn send(endpoint: Endpoint, method: &'static str, body: &'static str) -> (StatusCode, HeaderMap, Bytes) {
        let mut sender = endpoint.handshake().await.unwrap();
        let body = Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync();
        let request = Request::builder()
            .method(method)
            .uri("/things?page=2")
            .header("host", "app.test")
            .body(body)
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let (head, body) = response.into_parts();
        let data = body.collect().await.unwrap().to_bytes();
        (head.status, head.headers, data)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn waitlist(controller: &Controller) -> usize {
        controller
            .pool
            .inspect(&AuthContext::Admin)
            .unwrap()
            .groups
            .iter()
            .map(|g| g.get_waitlist)
            .sum()
    }

    #[test]
    fn test_settings_from_values() {
        let values = json!({
            "turbocaching": false,
            "heuristic_freshness_floor": 5,
            "default_freshness": 30,
            "max_session_checkout_try": 3,
            "body_buffer_threshold": 4096,
            "sticky_sessions_cookie_name": "route",
            "secure_headers_password": "pw",
            "server_software": "appgate/test"
        });
        let settings = ControllerSettings::from_values(values.as_object().unwrap());
        assert!(!settings.turbocaching);
        assert_eq!(settings.heuristic_freshness_floor, Duration::from_secs(5));
        assert_eq!(settings.default_freshness, Duration::from_secs(30));
        assert_eq!(settings.max_session_checkout_try, 3);
        assert_eq!(settings.body_buffer_threshold, 4096);
        assert_eq!(settings.sticky_sessions_cookie_name, "route");
        assert_eq!(settings.secure_headers_password.as_deref(), Some("pw"));

        let defaults = ControllerSettings::from_values(&Map::new());
        assert_eq!(defaults, ControllerSettings::default());
        assert_eq!(defaults.default_freshness, DEFAULT_FRESHNESS);
    }

    #[tokio::test]
    async fn test_request_state_is_tracked_while_queued() {
        let controller = controller_with(DummyConfig::default(), app_options());
        let endpoint = listen(Arc::clone(&controller)).await;
        let busy = controller.pool.get(app_options(), None).await.unwrap();

        let client = tokio::spawn(send(endpoint, "GET", ""));
        wait_until(|| {
            controller
                .snapshot()
                .requests_in_flight
                .iter()
                .any(|r| r.state == RequestState::CheckingOutSession)
        })
        .await;
        let snapshot = controller.snapshot();
        let record = &snapshot.requests_in_flight[0];
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/things?page=2");
        assert_eq!(record.hostname.as_deref(), Some("app.test"));
        assert!(record.request_id.is_some());
        assert!(record.gupid.is_none());
        assert_eq!(snapshot.active_requests, 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["requests_in_flight"][0]["state"], "checking_out_session");

        // the dummy worker listens nowhere, so the request fails once it gets a session
        drop(busy);
        let (status, headers, _) = client.await.unwrap();
        assert_eq!(status, ErrorCode::AppConnectFailed.status_code());
        assert_eq!(headers[crate::error::ERROR_HEADER], "APP_CONNECT_FAILED");
        wait_until(|| controller.active_requests() == 0).await;
        assert!(controller.snapshot().requests_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_queue_wait_is_bounded() {
        let mut options = app_options();
        options.max_request_queue_time = Duration::from_millis(50);
        let controller = controller_with(DummyConfig::default(), options.clone());
        let endpoint = listen(Arc::clone(&controller)).await;
        let _busy = controller.pool.get(options, None).await.unwrap();

        let (status, headers, _) = send(endpoint, "GET", "").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(headers[crate::error::ERROR_HEADER], "REQUEST_QUEUE_TIMEOUT");
        wait_until(|| waitlist(&controller) == 0).await;
        assert!(controller.snapshot().requests_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_http_worker_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let forwarded = req.headers().get("x-forwarded-host").cloned();
                        let uri = req.uri().to_string();
                        let body = req.into_body().collect().await?.to_bytes();
                        let mut response = Response::new(Full::new(Bytes::from(format!(
                            "{} {}",
                            uri,
                            String::from_utf8_lossy(&body)
                        ))));
                        if let Some(host) = forwarded {
                            response.headers_mut().insert("x-seen-host", host);
                        }
                        response.headers_mut().insert("cache-control", HeaderValue::from_static("no-store"));
                        Ok::<_, hyper::Error>(response)
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let dummy = DummyConfig {
            address: format!("tcp://{}", worker_addr),
            protocol: "http".to_string(),
            ..DummyConfig::default()
        };
        let controller = controller_with(dummy, app_options());
        let endpoint = listen(Arc::clone(&controller)).await;

        let (status, headers, body) = send(endpoint.clone(), "POST", "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"/things?page=2 hello");
        assert_eq!(headers["x-seen-host"], "app.test");
        assert!(headers.contains_key("x-powered-by"));

        let (status, _, body) = send(endpoint, "GET", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"/things?page=2 ");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.worker_connects, 1);
        assert_eq!(snapshot.worker_reuses, 1);
        assert_eq!(snapshot.app_errors, 0);
    }

    #[tokio::test]
    async fn test_session_worker_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            stream
                .write_all(b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\ncreated")
                .await
                .unwrap();
            let _ = seen_tx.send(request);
        });

        let dummy = DummyConfig {
            address: format!("tcp://{}", worker_addr),
            ..DummyConfig::default()
        };
        let controller = controller_with(dummy, app_options());
        let endpoint = listen(Arc::clone(&controller)).await;

        let (status, headers, body) = send(endpoint, "PUT", "data").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(&body[..], b"created");

        let request = seen_rx.await.unwrap();
        let header_len = u32::from_be_bytes([request[0], request[1], request[2], request[3]]) as usize;
        let header = &request[4..4 + header_len];
        assert!(header.windows(19).any(|w| w == b"REQUEST_METHOD\0PUT\0"));
        assert_eq!(&request[4 + header_len..], b"data");
    }

    #[test]
    fn test_cache_tee_overflow() {
        let mut tee = CacheTee {
            key: "http|x|/".into(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            overflowed: false,
        };
        tee.push(&vec![0u8; MAX_BODY_SIZE]);
        assert!(!tee.overflowed);
        tee.push(b"x");
        assert!(tee.overflowed);
        assert!(tee.body.is_empty());
    }

    #[test]
    fn test_queue_full_response_uses_configured_status() {
        let options = Options::new("/srv/app", "true");
        let response = checkout_error_response(
            &options,
            GetError::RequestQueueFull {
                limit: 1,
                status_code: 529,
            },
        );
        assert_eq!(response.status().as_u16(), 529);
        assert_eq!(
            response.headers().get(crate::error::ERROR_HEADER).unwrap(),
            "REQUEST_QUEUE_FULL"
        );
    }
}
