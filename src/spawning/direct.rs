//! Direct spawning: one fork/exec per worker

use super::error::SpawnError;
use super::handshake::{Failure, Handshake, OutputCapture, Watch};
use super::{OsProcess, SpawnedProcess};
use crate::context::Context;
use crate::guards::ChildGuard;
use crate::journey::{JourneyStep, JourneyType};
use crate::pool::options::Options;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// How long to wait for a dead child's output pipes to drain
pub(crate) const OUTPUT_DRAIN_TIME: Duration = Duration::from_millis(500);

pub struct DirectSpawner {
    ctx: Arc<Context>,
}

impl DirectSpawner {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub async fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError> {
        let hs = Handshake::prepare(&self.ctx, options, JourneyType::SpawnDirectly, None)?;
        spawn_with_env_setupper(&self.ctx, hs, options).await
    }
}

/// Fork the env-setupper on `hs`'s work directory and run the handshake.
/// Used for direct workers and for preloaders.
pub(crate) async fn spawn_with_env_setupper(
    ctx: &Arc<Context>,
    mut hs: Handshake,
    options: &Options,
) -> Result<SpawnedProcess, SpawnError> {
    hs.begin_step(JourneyStep::SpawningKitForkSubprocess);

    let mut cmd = Command::new(&ctx.spawning_kit.env_setupper);
    cmd.arg("spawn-env-setupper")
        .arg(hs.work_dir())
        .arg("--before")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // SAFETY: prepare_child_after_fork only calls async-signal-safe functions
    unsafe {
        cmd.pre_exec(crate::os::prepare_child_after_fork);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            let failure = Failure::Io {
                step: JourneyStep::SpawningKitForkSubprocess,
                error,
            };
            return Err(hs.into_error(failure, None, String::new()));
        }
    };
    let pid = child.id().unwrap_or(0);
    let capture = OutputCapture::start(&mut child, pid, ctx.spawning_kit.output_capture_limit);
    let mut guard = ChildGuard::new(child);
    hs.complete_step(JourneyStep::SpawningKitForkSubprocess);
    debug!(pid, app_root = %options.app_root.display(), "Forked env-setupper, waiting for handshake");

    let result = match guard.child_mut() {
        Some(child) => hs.perform(Watch::Child(child)).await,
        None => Err(Failure::Exited { status: None }),
    };

    match (result, guard.commit()) {
        (Ok(sockets), Some(child)) => {
            capture.detach();
            let process = hs.finish(pid, sockets, OsProcess::Child(child));
            info!(
                pid,
                gupid = %process.gupid,
                app_root = %options.app_root.display(),
                spawn_time_ms = process.spawn_end.saturating_sub(process.spawn_start).as_millis() as u64,
                "Application process spawned"
            );
            Ok(process)
        }
        (result, child) => {
            if let Some(child) = child {
                OsProcess::Child(child)
                    .terminate(ctx.spawning_kit.shutdown_grace_period)
                    .await;
            }
            let failure = result.err().unwrap_or(Failure::Exited { status: None });
            let output = capture.collect(OUTPUT_DRAIN_TIME).await;
            Err(hs.into_error(failure, Some(pid), output))
        }
    }
}
