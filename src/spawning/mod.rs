//! Spawning Kit
//!
//! Starts application processes and waits for them to declare readiness.
//! A [`Spawner`] is one of three strategies:
//!
//! - `Direct`: fork and exec the env-setupper, which in turn execs the app
//! - `Smart`: keep a preloader per application and ask it to fork workers
//! - `Dummy`: no processes at all; used by pool tests
//!
//! Shared pieces (work-directory handshake, journey bookkeeping) live in
//! [`handshake`] and take the [`Context`] explicitly.

pub mod direct;
pub mod dummy;
pub mod env_setupper;
pub mod error;
pub mod error_page;
pub mod handshake;
pub mod smart;

pub use direct::DirectSpawner;
pub use dummy::{DummyConfig, DummySpawner};
pub use error::{ErrorCategory, SpawnError};
pub use smart::SmartSpawner;

use crate::conn_pool::Endpoint;
use crate::context::Context;
use crate::journey::Journey;
use crate::pool::options::{Options, SpawnMethod};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// A listen socket advertised by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketInfo {
    /// `tcp://host:port` or `unix:/path`
    pub address: String,
    /// `session`, `http`, or anything else (opaque)
    pub protocol: String,
    /// Maximum concurrent sessions; 0 means unlimited
    #[serde(default)]
    pub concurrency: usize,
}

impl SocketInfo {
    pub fn endpoint(&self) -> Option<Endpoint> {
        Endpoint::parse(&self.address)
    }
}

/// Handle on the OS process behind a worker
#[derive(Debug)]
pub enum OsProcess {
    /// Spawned by us
    Child(Child),
    /// Forked by a preloader, not our child
    Forked(u32),
    /// No real process (dummy spawner)
    Dummy(u32),
}

impl OsProcess {
    pub fn pid(&self) -> u32 {
        match self {
            OsProcess::Child(child) => child.id().unwrap_or(0),
            OsProcess::Forked(pid) | OsProcess::Dummy(pid) => *pid,
        }
    }

    /// SIGTERM, wait up to `grace_period`, then SIGKILL
    pub async fn terminate(self, grace_period: Duration) {
        match self {
            OsProcess::Child(mut child) => {
                let Some(pid) = child.id() else {
                    return;
                };
                debug!(pid, "Sending SIGTERM to application process");
                let _ = crate::os::kill_group(pid, libc::SIGTERM);

                match tokio::time::timeout(grace_period, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(pid, ?status, "Application process exited");
                    }
                    Ok(Err(e)) => {
                        warn!(pid, error = %e, "Error waiting for application process to exit");
                    }
                    Err(_) => {
                        warn!(
                            pid,
                            grace_period_secs = grace_period.as_secs(),
                            "Grace period exceeded, sending SIGKILL"
                        );
                        let _ = crate::os::kill_group(pid, libc::SIGKILL);
                        let _ = child.kill().await;
                    }
                }
            }
            OsProcess::Forked(pid) => {
                if pid == 0 {
                    return;
                }
                if !crate::os::terminate_pid(pid, grace_period).await {
                    warn!(pid, "Grace period exceeded, sent SIGKILL");
                }
            }
            OsProcess::Dummy(_) => {}
        }
    }
}

/// A successfully spawned worker, not yet attached to a group
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub gupid: String,
    pub sockets: Vec<SocketInfo>,
    pub journey: Journey,
    pub spawn_start: Duration,
    pub spawn_end: Duration,
    pub os: OsProcess,
}

impl SpawnedProcess {
    /// Throw away a process that will never be attached
    pub async fn discard(self, grace_period: Duration) {
        debug!(pid = self.pid, gupid = %self.gupid, "Discarding spawned process");
        self.os.terminate(grace_period).await;
    }
}

pub enum Spawner {
    Direct(DirectSpawner),
    Smart(SmartSpawner),
    Dummy(DummySpawner),
}

impl Spawner {
    pub async fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError> {
        match self {
            Spawner::Direct(s) => s.spawn(options).await,
            Spawner::Smart(s) => s.spawn(options).await,
            Spawner::Dummy(s) => s.spawn(options).await,
        }
    }

    /// Release long-lived resources (the preloader)
    pub async fn cleanup(&self) {
        match self {
            Spawner::Smart(s) => s.stop_preloader().await,
            Spawner::Dummy(s) => s.cleanup(),
            Spawner::Direct(_) => {}
        }
    }

    /// Stop the preloader if it has been idle for longer than `max_idle`.
    /// Returns whether something was stopped.
    pub async fn cleanup_if_idle(&self, max_idle: Duration) -> bool {
        match self {
            Spawner::Smart(s) => s.stop_preloader_if_idle(max_idle).await,
            _ => false,
        }
    }

    pub fn preloader_pid(&self) -> Option<u32> {
        match self {
            Spawner::Smart(s) => s.preloader_pid(),
            _ => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Spawner::Direct(_) => "direct",
            Spawner::Smart(_) => "smart",
            Spawner::Dummy(_) => "dummy",
        }
    }
}

/// Builds spawners for groups
pub struct SpawnerFactory {
    ctx: Arc<Context>,
    dummy: Option<DummyConfig>,
}

impl SpawnerFactory {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, dummy: None }
    }

    /// Factory whose spawners never start real processes
    pub fn dummy(ctx: Arc<Context>, config: DummyConfig) -> Self {
        Self {
            ctx,
            dummy: Some(config),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn create(&self, options: &Options) -> Arc<Spawner> {
        let spawner = match (&self.dummy, options.spawn_method) {
            (Some(config), _) => Spawner::Dummy(DummySpawner::new(self.ctx.clone(), config.clone())),
            (None, SpawnMethod::Direct) => Spawner::Direct(DirectSpawner::new(self.ctx.clone())),
            (None, SpawnMethod::Smart) => Spawner::Smart(SmartSpawner::new(self.ctx.clone(), options.clone())),
        };
        Arc::new(spawner)
    }
}
