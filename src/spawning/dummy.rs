use super::error::{ErrorCategory, SpawnError};
use super::{OsProcess, SocketInfo, SpawnedProcess};
use crate::context::Context;
use crate::journey::{Journey, JourneyStep, JourneyType, StepState};
use crate::pool::options::Options;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pids handed out by dummy spawners start here so they never collide with real ones in tests
const DUMMY_PID_BASE: u32 = 1_000_000;

static NEXT_DUMMY_PID: AtomicU32 = AtomicU32::new(DUMMY_PID_BASE);

#[derive(Debug, Clone)]
pub struct DummyConfig {
    pub spawn_time: Duration,
    /// Concurrency the fake worker advertises
    pub concurrency: usize,
    pub fail: bool,
    /// Socket the fake worker advertises
    pub address: String,
    pub protocol: String,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            spawn_time: Duration::ZERO,
            concurrency: 1,
            fail: false,
            address: "tcp://127.0.0.1:1".to_string(),
            protocol: "session".to_string(),
        }
    }
}

/// Produces process records without starting anything
pub struct DummySpawner {
    ctx: Arc<Context>,
    config: DummyConfig,
    spawn_count: AtomicU64,
    cleanup_count: AtomicU64,
}

impl DummySpawner {
    pub fn new(ctx: Arc<Context>, config: DummyConfig) -> Self {
        Self {
            ctx,
            config,
            spawn_count: AtomicU64::new(0),
            cleanup_count: AtomicU64::new(0),
        }
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::Relaxed)
    }

    pub fn cleanup_count(&self) -> u64 {
        self.cleanup_count.load(Ordering::Relaxed)
    }

    pub fn cleanup(&self) {
        self.cleanup_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError> {
        let start = self.ctx.now();
        if !self.config.spawn_time.is_zero() {
            tokio::time::sleep(self.config.spawn_time).await;
        }
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        let mut journey = Journey::new(JourneyType::SpawnDirectly);
        let now = self.ctx.now();
        let steps: Vec<JourneyStep> = journey.steps().map(|(step, _)| step).collect();
        for step in steps {
            let _ = journey.force_state(step, StepState::Performed, Some(start), Some(now));
        }

        if self.config.fail {
            let _ = journey.fail_at(JourneyStep::SubprocessAppLoadOrExec, now);
            return Err(SpawnError::new(
                &self.ctx,
                ErrorCategory::UserAppCodeError,
                journey,
                format!("Dummy spawn of {} failed.", options.app_root.display()),
            ));
        }

        let pid = NEXT_DUMMY_PID.fetch_add(1, Ordering::Relaxed);
        Ok(SpawnedProcess {
            pid,
            gupid: format!("dummy-{}", pid),
            sockets: vec![SocketInfo {
                address: self.config.address.clone(),
                protocol: self.config.protocol.clone(),
                concurrency: self.config.concurrency,
            }],
            journey,
            spawn_start: start,
            spawn_end: now,
            os: OsProcess::Dummy(pid),
        })
    }
}
