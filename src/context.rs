//! Injected process-wide context
//!
//! One `Context` is built at start-up and handed to every subsystem. Tests
//! build their own with a [`ManualClock`] to make time-dependent behaviour
//! deterministic.

use parking_lot::Mutex;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Time source
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary epoch (CLOCK_MONOTONIC for the system clock)
    fn monotonic(&self) -> Duration;

    fn wall(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        crate::os::monotonic_now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    monotonic: Mutex<Duration>,
    wall_base: SystemTime,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            monotonic: Mutex::new(Duration::from_secs(1_000)),
            wall_base: SystemTime::now(),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.monotonic.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        *self.monotonic.lock()
    }

    fn wall(&self) -> SystemTime {
        self.wall_base + *self.monotonic.lock()
    }
}

/// Settings shared by every spawner
#[derive(Debug, Clone)]
pub struct SpawningKitConfig {
    /// Executable that implements the `spawn-env-setupper` sub-command
    pub env_setupper: PathBuf,
    /// Where per-spawn work directories are created (system temp dir if unset)
    pub work_dir_root: Option<PathBuf>,
    /// Upper bound on captured child stdout/stderr kept for diagnostics
    pub output_capture_limit: usize,
    /// Keep work directories after the spawn attempt, for debugging
    pub keep_work_dirs: bool,
    /// Time between SIGTERM and SIGKILL when stopping an app or preloader process
    pub shutdown_grace_period: Duration,
    /// Preloaders idle for longer than this are stopped by the garbage collector
    pub max_preloader_idle_time: Duration,
}

impl Default for SpawningKitConfig {
    fn default() -> Self {
        Self {
            env_setupper: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("appgate")),
            work_dir_root: None,
            output_capture_limit: 64 * 1024,
            keep_work_dirs: false,
            shutdown_grace_period: Duration::from_secs(5),
            max_preloader_idle_time: Duration::from_secs(300),
        }
    }
}

pub struct Context {
    clock: Arc<dyn Clock>,
    pub spawning_kit: SpawningKitConfig,
    /// Runtime that runs pool background work (spawn loops, process shutdown)
    runtime: tokio::runtime::Handle,
}

impl Context {
    pub fn new(runtime: tokio::runtime::Handle, spawning_kit: SpawningKitConfig) -> Arc<Self> {
        Arc::new(Self {
            clock: Arc::new(SystemClock),
            spawning_kit,
            runtime,
        })
    }

    pub fn with_clock(
        runtime: tokio::runtime::Handle,
        spawning_kit: SpawningKitConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            spawning_kit,
            runtime,
        })
    }

    /// Monotonic "now"
    pub fn now(&self) -> Duration {
        self.clock.monotonic()
    }

    pub fn wall_now(&self) -> SystemTime {
        self.clock.wall()
    }

    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Short random identifier used to correlate error pages with log lines
    pub fn new_error_id(&self) -> String {
        let bytes: [u8; 4] = rand::thread_rng().gen();
        hex::encode(bytes)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("spawning_kit", &self.spawning_kit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.monotonic();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.monotonic() - start, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_error_id_format() {
        let ctx = Context::new(tokio::runtime::Handle::current(), SpawningKitConfig::default());
        let id = ctx.new_error_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, ctx.new_error_id());
    }

    #[tokio::test]
    async fn test_context_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new());
        let ctx = Context::with_clock(
            tokio::runtime::Handle::current(),
            SpawningKitConfig::default(),
            clock.clone(),
        );
        let before = ctx.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(ctx.now() - before, Duration::from_millis(250));
    }
}
