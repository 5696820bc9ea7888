//! Connection pool for worker sockets
//!
//! Workers listen on TCP or Unix sockets. HTTP-speaking workers are talked to
//! through hyper's HTTP/1 client; between requests their request senders are
//! parked here per process (keyed by gupid) and handed back out to the next
//! session for the same process.

use dashmap::DashMap;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

/// Request body type sent to HTTP workers
pub type WorkerBody = UnsyncBoxBody<Bytes, io::Error>;

/// Sending half of an HTTP/1 connection to a worker
pub type WorkerSender = http1::SendRequest<WorkerBody>;

/// Where a worker listens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `tcp://host:port` or `unix:/path`
    pub fn parse(address: &str) -> Option<Self> {
        if let Some(rest) = address.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':')?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            Some(Endpoint::Tcp(rest.to_string()))
        } else if let Some(path) = address.strip_prefix("unix:") {
            if path.is_empty() {
                return None;
            }
            Some(Endpoint::Unix(PathBuf::from(path)))
        } else {
            None
        }
    }

    pub async fn connect(&self) -> io::Result<WorkerStream> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(WorkerStream::Tcp(stream))
            }
            Endpoint::Unix(path) => Ok(WorkerStream::Unix(UnixStream::connect(path).await?)),
        }
    }

    /// Open an HTTP/1 client connection. The connection is driven on its own
    /// task until the worker or the last sender closes it.
    pub async fn handshake(&self) -> io::Result<WorkerSender> {
        let stream = self.connect().await?;
        let (sender, connection) = http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;
        let endpoint = self.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(endpoint = %endpoint, error = %e, "Worker connection ended with an error");
            }
        });
        Ok(sender)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A connection to a worker
#[derive(Debug)]
pub enum WorkerStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for WorkerStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            WorkerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WorkerStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WorkerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            WorkerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            WorkerStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            WorkerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Connections opened to workers
    pub connects: AtomicU64,
    /// Checkouts served from a parked connection
    pub reuses: AtomicU64,
}

impl PoolStats {
    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reuse(&self) {
        self.reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn get_reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum parked connections per worker process
    pub max_idle_per_process: usize,
    /// Parked connections older than this are closed instead of reused
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_process: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct IdleConnection {
    endpoint: Endpoint,
    sender: WorkerSender,
    parked_at: Instant,
}

/// Parked keep-alive connections, per worker process
pub struct ConnectionPool {
    idle: DashMap<String, Vec<IdleConnection>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        debug!(
            max_idle = config.max_idle_per_process,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );
        Self {
            idle: DashMap::new(),
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// A connection to `endpoint` of process `gupid`, reused when possible.
    /// The flag tells whether the connection was reused.
    pub async fn checkout(&self, gupid: &str, endpoint: &Endpoint) -> io::Result<(WorkerSender, bool)> {
        while let Some(mut sender) = self.take_idle(gupid, endpoint) {
            if sender.ready().await.is_ok() {
                self.stats.record_reuse();
                return Ok((sender, true));
            }
        }
        let sender = endpoint.handshake().await?;
        self.stats.record_connect();
        Ok((sender, false))
    }

    fn take_idle(&self, gupid: &str, endpoint: &Endpoint) -> Option<WorkerSender> {
        let mut entry = self.idle.get_mut(gupid)?;
        while let Some(pos) = entry.iter().rposition(|c| &c.endpoint == endpoint) {
            let conn = entry.swap_remove(pos);
            if conn.parked_at.elapsed() < self.config.idle_timeout && !conn.sender.is_closed() {
                return Some(conn.sender);
            }
        }
        None
    }

    /// Park a connection whose last response was read to the end
    pub fn checkin(&self, gupid: &str, endpoint: Endpoint, sender: WorkerSender) {
        if self.config.max_idle_per_process == 0 || sender.is_closed() {
            return;
        }
        let mut entry = self.idle.entry(gupid.to_string()).or_default();
        if entry.len() >= self.config.max_idle_per_process {
            entry.remove(0);
        }
        entry.push(IdleConnection {
            endpoint,
            sender,
            parked_at: Instant::now(),
        });
    }

    /// Close everything parked for a process
    pub fn forget_process(&self, gupid: &str) {
        self.idle.remove(gupid);
    }

    /// Close connections parked for longer than the idle timeout
    pub fn evict_expired(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let mut evicted = 0;
        self.idle.retain(|_, conns| {
            let before = conns.len();
            conns.retain(|c| c.parked_at.elapsed() < timeout && !c.sender.is_closed());
            evicted += before - conns.len();
            !conns.is_empty()
        });
        evicted
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::server::conn::http1 as server_http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn empty() -> WorkerBody {
        Empty::new().map_err(|never| match never {}).boxed_unsync()
    }

    /// HTTP worker answering `pong`; counts accepted connections
    async fn pong_worker() -> (Endpoint, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"pong"))))
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (endpoint, accepted)
    }

    async fn ping(sender: &mut WorkerSender) -> Bytes {
        let request = Request::builder().uri("/ping").body(empty()).unwrap();
        let response = sender.send_request(request).await.unwrap();
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:3000"),
            Some(Endpoint::Tcp("127.0.0.1:3000".into()))
        );
        assert_eq!(
            Endpoint::parse("unix:/tmp/app.sock"),
            Some(Endpoint::Unix(PathBuf::from("/tmp/app.sock")))
        );
        assert_eq!(Endpoint::parse("tcp://127.0.0.1"), None);
        assert_eq!(Endpoint::parse("tcp://:80"), None);
        assert_eq!(Endpoint::parse("tcp://host:99999"), None);
        assert_eq!(Endpoint::parse("unix:"), None);
        assert_eq!(Endpoint::parse("http://x:1"), None);
        assert_eq!(
            Endpoint::parse("unix:/a.sock").unwrap().to_string(),
            "unix:/a.sock"
        );
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_process, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_checkout_reuses_parked_connection() {
        let (endpoint, accepted) = pong_worker().await;
        let pool = ConnectionPool::new(PoolConfig::default());

        let (mut sender, reused) = pool.checkout("g1", &endpoint).await.unwrap();
        assert!(!reused);
        assert_eq!(ping(&mut sender).await, &b"pong"[..]);
        pool.checkin("g1", endpoint.clone(), sender);
        assert_eq!(pool.idle_count(), 1);

        let (mut sender, reused) = pool.checkout("g1", &endpoint).await.unwrap();
        assert!(reused);
        assert_eq!(ping(&mut sender).await, &b"pong"[..]);

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().get_connects(), 1);
        assert_eq!(pool.stats().get_reuses(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = ConnectionPool::new(PoolConfig::default());
        let endpoint = Endpoint::Tcp(addr.to_string());

        let (sender, _) = pool.checkout("g1", &endpoint).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        pool.checkin("g1", endpoint.clone(), sender);
        drop(server_side);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let (_sender, reused) = pool.checkout("g1", &endpoint).await.unwrap();
        assert!(!reused);
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forget_process_and_limits() {
        let (endpoint, _) = pong_worker().await;
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_process: 1,
            idle_timeout: Duration::from_secs(30),
        });

        for _ in 0..2 {
            let sender = endpoint.handshake().await.unwrap();
            pool.checkin("g1", endpoint.clone(), sender);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.evict_expired(), 0);

        pool.forget_process("g1");
        assert_eq!(pool.idle_count(), 0);
    }
}
