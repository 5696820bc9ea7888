//! Accept threads
//!
//! Every thread runs a current-thread tokio runtime with its own
//! [`Controller`] and accepts from clones of the same listening sockets, so
//! the kernel spreads connections across threads. Nothing a client touches
//! is shared between threads except the pool.

use crate::config::ServerConfig;
use crate::controller::request::Peer;
use crate::controller::Controller;
use crate::server::Server;
use std::net::SocketAddr;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Listening sockets shared by every accept thread
pub struct Listeners {
    tcp: Option<std::net::TcpListener>,
    unix: Option<(StdUnixListener, PathBuf)>,
}

impl Listeners {
    pub fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        let tcp = if config.port > 0 {
            let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
            let listener = std::net::TcpListener::bind(addr)
                .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
            listener.set_nonblocking(true)?;
            info!(addr = %addr, "Listening for HTTP");
            Some(listener)
        } else {
            None
        };

        let unix = match &config.unix_socket {
            Some(path) => {
                let path = PathBuf::from(path);
                let _ = std::fs::remove_file(&path);
                let listener = StdUnixListener::bind(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", path.display(), e))?;
                listener.set_nonblocking(true)?;
                info!(path = %path.display(), "Listening for HTTP on Unix socket");
                Some((listener, path))
            }
            None => None,
        };

        Ok(Self { tcp, unix })
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        if let Some((_, path)) = &self.unix {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Running accept threads
pub struct EventLoops {
    threads: Vec<JoinHandle<()>>,
}

impl EventLoops {
    /// Start one accept thread per configured controller thread
    pub fn start(
        server: &Arc<Server>,
        listeners: &Listeners,
        shutdown_rx: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let count = server.controller_threads();
        let mut threads = Vec::with_capacity(count);

        for n in 0..count {
            let tcp = listeners.tcp.as_ref().map(|l| l.try_clone()).transpose()?;
            let unix = listeners.unix.as_ref().map(|(l, _)| l.try_clone()).transpose()?;
            let controller = server.create_controller(n);
            let shutdown_rx = shutdown_rx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("appgate-loop-{}", n))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!(thread = n, error = %e, "Failed to start event loop");
                            return;
                        }
                    };
                    runtime.block_on(run_loop(controller, tcp, unix, shutdown_rx, drain_timeout));
                })?;
            threads.push(handle);
        }

        info!(threads = count, "Event loops started");
        Ok(Self { threads })
    }

    /// Wait for every thread to finish; call after shutdown was signalled
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> std::io::Result<tokio::net::UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

async fn run_loop(
    controller: Arc<Controller>,
    tcp: Option<std::net::TcpListener>,
    unix: Option<StdUnixListener>,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    let thread = controller.thread_number();
    let tcp = match tcp.map(TcpListener::from_std).transpose() {
        Ok(tcp) => tcp,
        Err(e) => {
            error!(thread, error = %e, "Failed to register TCP listener");
            return;
        }
    };
    let unix = match unix.map(UnixListener::from_std).transpose() {
        Ok(unix) => unix,
        Err(e) => {
            error!(thread, error = %e, "Failed to register Unix listener");
            return;
        }
    };

    loop {
        tokio::select! {
            result = accept_tcp(tcp.as_ref()) => {
                match result {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            if let Err(e) = controller.serve_connection(stream, Peer::Tcp(addr)).await {
                                debug!(addr = %addr, error = %e, "Client connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(thread, error = %e, "Failed to accept connection");
                    }
                }
            }
            result = accept_unix(unix.as_ref()) => {
                match result {
                    Ok(stream) => {
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            if let Err(e) = controller.serve_connection(stream, Peer::Unix).await {
                                debug!(error = %e, "Client connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(thread, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Stop accepting, then give running requests a chance to finish
    drop(tcp);
    drop(unix);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while controller.active_requests() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(thread, active = controller.active_requests(), "Event loop stopped with requests in flight");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    debug!(thread, "Event loop stopped");
}
