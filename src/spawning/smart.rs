//! Preloader-based spawning
//!
//! The first spawn starts a preloader through the env-setupper, like a
//! direct spawn but with `"preloader": true` in `args.json`. The preloader
//! advertises a socket with protocol `preloader`. Each later spawn sends it
//! one JSON line:
//!
//! ```text
//! {"command":"spawn","work_dir":"/tmp/appgate-spawn.XXXX"}
//! ```
//!
//! and reads back `{"result":"ok","pid":N}` or
//! `{"result":"error","message":"..."}`. The forked worker then performs the
//! regular handshake in the given work directory.

use super::direct::spawn_with_env_setupper;
use super::error::{ErrorCategory, SpawnError};
use super::handshake::{Failure, Handshake, Watch};
use super::{OsProcess, SpawnedProcess};
use crate::conn_pool::Endpoint;
use crate::context::Context;
use crate::guards::WorkDir;
use crate::journey::{Journey, JourneyStep, JourneyType};
use crate::pool::options::Options;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{info, warn};

/// Upper bound on one reply line from the preloader
pub const MAX_RESPONSE_SIZE: usize = 10240;

struct Preloader {
    process: SpawnedProcess,
    socket: PathBuf,
    /// Holds the directory the preloader's socket lives in
    _socket_dir: WorkDir,
}

#[derive(Debug, Deserialize)]
struct PreloaderReply {
    result: String,
    pid: Option<i64>,
    message: Option<String>,
    category: Option<String>,
}

/// Why a fork request did not yield a pid
enum ForkError {
    /// The preloader is unreachable or hung up; worth one restart
    Io { step: JourneyStep, error: io::Error },
    Failed(Failure),
}

pub struct SmartSpawner {
    ctx: Arc<Context>,
    options: Options,
    preloader: tokio::sync::Mutex<Option<Preloader>>,
    preloader_pid: AtomicU32,
    last_used: parking_lot::Mutex<Duration>,
}

impl SmartSpawner {
    pub fn new(ctx: Arc<Context>, options: Options) -> Self {
        let now = ctx.now();
        Self {
            ctx,
            options,
            preloader: tokio::sync::Mutex::new(None),
            preloader_pid: AtomicU32::new(0),
            last_used: parking_lot::Mutex::new(now),
        }
    }

    pub fn preloader_pid(&self) -> Option<u32> {
        match self.preloader_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub async fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError> {
        *self.last_used.lock() = self.ctx.now();
        let mut preloader = self.preloader.lock().await;

        let mut restarted = false;
        loop {
            if preloader.is_none() {
                *preloader = Some(self.start_preloader().await?);
            }
            let socket = match preloader.as_ref() {
                Some(p) => p.socket.clone(),
                None => continue,
            };

            let mut hs = Handshake::prepare(&self.ctx, options, JourneyType::SpawnThroughPreloader, None)?;
            let deadline = hs.deadline();
            let forked = match tokio::time::timeout_at(deadline, request_fork(&mut hs, &socket)).await {
                Ok(result) => result,
                Err(_) => Err(ForkError::Failed(Failure::Timeout)),
            };

            match forked {
                Ok(pid) => return self.finish_forked(hs, pid).await,
                Err(ForkError::Io { step, error }) if !restarted => {
                    warn!(
                        app_root = %self.options.app_root.display(),
                        step = %step,
                        error = %error,
                        "Preloader unreachable, restarting it"
                    );
                    restarted = true;
                    if let Some(old) = preloader.take() {
                        self.stop(old).await;
                    }
                }
                Err(ForkError::Io { step, error }) => {
                    return Err(hs.into_error(Failure::Io { step, error }, self.preloader_pid(), String::new()))
                }
                Err(ForkError::Failed(failure)) => {
                    return Err(hs.into_error(failure, self.preloader_pid(), String::new()))
                }
            }
        }
    }

    async fn finish_forked(&self, mut hs: Handshake, pid: u32) -> Result<SpawnedProcess, SpawnError> {
        match hs.perform(Watch::Pid(pid)).await {
            Ok(sockets) => {
                let process = hs.finish(pid, sockets, OsProcess::Forked(pid));
                info!(
                    pid,
                    gupid = %process.gupid,
                    preloader_pid = self.preloader_pid(),
                    "Application process forked by preloader"
                );
                Ok(process)
            }
            Err(failure) => {
                OsProcess::Forked(pid)
                    .terminate(self.ctx.spawning_kit.shutdown_grace_period)
                    .await;
                Err(hs.into_error(failure, Some(pid), String::new()))
            }
        }
    }

    async fn start_preloader(&self) -> Result<Preloader, SpawnError> {
        let socket_dir = WorkDir::create(self.ctx.spawning_kit.work_dir_root.as_deref()).map_err(|e| {
            let mut journey = Journey::new(JourneyType::StartPreloader);
            let _ = journey.fail_at(JourneyStep::SpawningKitPreparation, self.ctx.now());
            SpawnError::new(
                &self.ctx,
                ErrorCategory::from_io(&e),
                journey,
                "Could not create the preloader socket directory.",
            )
            .with_details(e.to_string())
        })?;
        let suggested = socket_dir.path().join("preloader.sock");

        let extra = serde_json::json!({
            "preloader": true,
            "preloader_socket": suggested,
        });
        let hs = Handshake::prepare(&self.ctx, &self.options, JourneyType::StartPreloader, Some(extra))?;
        let process = spawn_with_env_setupper(&self.ctx, hs, &self.options).await?;

        let socket = process
            .sockets
            .iter()
            .find(|s| s.protocol == "preloader")
            .and_then(|s| s.endpoint())
            .and_then(|e| match e {
                Endpoint::Unix(path) => Some(path),
                Endpoint::Tcp(_) => None,
            });
        let Some(socket) = socket else {
            let mut journey = process.journey.clone();
            let _ = journey.fail_at(JourneyStep::SpawningKitHandshakePerform, self.ctx.now());
            let pid = process.pid;
            process.discard(self.ctx.spawning_kit.shutdown_grace_period).await;
            return Err(SpawnError::new(
                &self.ctx,
                ErrorCategory::InternalError,
                journey,
                "The preloader did not advertise a Unix socket with protocol \"preloader\".",
            )
            .with_pid(Some(pid)));
        };

        self.preloader_pid.store(process.pid, Ordering::Relaxed);
        info!(
            pid = process.pid,
            app_root = %self.options.app_root.display(),
            socket = %socket.display(),
            "Preloader started"
        );
        Ok(Preloader {
            process,
            socket,
            _socket_dir: socket_dir,
        })
    }

    async fn stop(&self, preloader: Preloader) {
        self.preloader_pid.store(0, Ordering::Relaxed);
        info!(pid = preloader.process.pid, "Stopping preloader");
        preloader
            .process
            .discard(self.ctx.spawning_kit.shutdown_grace_period)
            .await;
    }

    pub async fn stop_preloader(&self) {
        let preloader = self.preloader.lock().await.take();
        if let Some(preloader) = preloader {
            self.stop(preloader).await;
        }
    }

    /// Skips the check while a spawn is using the preloader
    pub async fn stop_preloader_if_idle(&self, max_idle: Duration) -> bool {
        let Ok(mut guard) = self.preloader.try_lock() else {
            return false;
        };
        let idle = self.ctx.now().saturating_sub(*self.last_used.lock());
        if guard.is_none() || idle < max_idle {
            return false;
        }
        let Some(preloader) = guard.take() else {
            return false;
        };
        drop(guard);
        info!(idle_secs = idle.as_secs(), "Preloader idle for too long");
        self.stop(preloader).await;
        true
    }
}

/// Ask the preloader to fork; walks the SPAWNING_KIT_*_PRELOADER steps
async fn request_fork(hs: &mut Handshake, socket: &std::path::Path) -> Result<u32, ForkError> {
    let step = JourneyStep::SpawningKitConnectToPreloader;
    hs.begin_step(step);
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|error| ForkError::Io { step, error })?;
    hs.complete_step(step);

    let step = JourneyStep::SpawningKitSendCommandToPreloader;
    hs.begin_step(step);
    let (read_half, mut write_half) = stream.into_split();
    let mut command = serde_json::to_vec(&serde_json::json!({
        "command": "spawn",
        "work_dir": hs.work_dir(),
    }))
    .map_err(|e| ForkError::Io {
        step,
        error: io::Error::other(e),
    })?;
    command.push(b'\n');
    write_half
        .write_all(&command)
        .await
        .map_err(|error| ForkError::Io { step, error })?;
    hs.complete_step(step);

    let step = JourneyStep::SpawningKitReadResponseFromPreloader;
    hs.begin_step(step);
    let mut line = Vec::new();
    let mut reader = BufReader::new(read_half).take(MAX_RESPONSE_SIZE as u64 + 1);
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|error| ForkError::Io { step, error })?;
    if n == 0 {
        return Err(ForkError::Io {
            step,
            error: io::Error::new(io::ErrorKind::UnexpectedEof, "preloader closed the connection"),
        });
    }
    if line.len() > MAX_RESPONSE_SIZE {
        return Err(ForkError::Failed(Failure::Invalid {
            step,
            category: ErrorCategory::InternalError,
            summary: format!("The preloader sent a response larger than {} bytes.", MAX_RESPONSE_SIZE),
            details: None,
        }));
    }
    hs.complete_step(step);

    let step = JourneyStep::SpawningKitParseResponseFromPreloader;
    hs.begin_step(step);
    let reply: PreloaderReply = serde_json::from_slice(&line).map_err(|e| {
        ForkError::Failed(Failure::Invalid {
            step,
            category: ErrorCategory::InternalError,
            summary: "The preloader sent an unparseable response.".into(),
            details: Some(e.to_string()),
        })
    })?;
    hs.complete_step(step);

    let step = JourneyStep::SpawningKitProcessResponseFromPreloader;
    hs.begin_step(step);
    match reply.result.as_str() {
        "ok" => match reply.pid {
            Some(pid) if pid >= 1 && pid <= u32::MAX as i64 => {
                hs.complete_step(step);
                Ok(pid as u32)
            }
            other => Err(ForkError::Failed(Failure::Invalid {
                step,
                category: ErrorCategory::InternalError,
                summary: format!("The preloader reported an invalid pid: {:?}", other),
                details: None,
            })),
        },
        "error" => Err(ForkError::Failed(Failure::Invalid {
            step,
            category: reply
                .category
                .as_deref()
                .and_then(ErrorCategory::parse)
                .unwrap_or(ErrorCategory::InternalError),
            summary: format!(
                "The preloader could not fork a worker process: {}",
                reply.message.as_deref().unwrap_or("unknown error")
            ),
            details: None,
        })),
        other => Err(ForkError::Failed(Failure::Invalid {
            step,
            category: ErrorCategory::InternalError,
            summary: format!("The preloader sent an unknown result: {}", other),
            details: None,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpawningKitConfig;
    use crate::journey::StepState;
    use tokio::net::UnixListener;

    fn context() -> Arc<Context> {
        Context::new(tokio::runtime::Handle::current(), SpawningKitConfig::default())
    }

    /// Fake preloader that answers one command with `reply`
    fn serve_once(listener: UnixListener, reply: &'static str) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            write.write_all(reply.as_bytes()).await.unwrap();
            line
        })
    }

    fn prepare(ctx: &Arc<Context>) -> Handshake {
        let mut options = Options::new("/tmp", "true");
        options.start_timeout = Duration::from_secs(5);
        Handshake::prepare(ctx, &options, JourneyType::SpawnThroughPreloader, None).unwrap()
    }

    #[tokio::test]
    async fn test_request_fork_ok() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preloader.sock");
        let server = serve_once(UnixListener::bind(&path).unwrap(), "{\"result\":\"ok\",\"pid\":4242}\n");

        let mut hs = prepare(&ctx);
        let pid = request_fork(&mut hs, &path).await.ok().unwrap();
        assert_eq!(pid, 4242);

        let command: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(command["command"], "spawn");
        assert_eq!(command["work_dir"], hs.work_dir().to_str().unwrap());
        assert_eq!(
            hs.journey.state(JourneyStep::SpawningKitProcessResponseFromPreloader),
            Some(StepState::Performed)
        );
    }

    #[tokio::test]
    async fn test_request_fork_error_reply() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preloader.sock");
        let _server = serve_once(
            UnixListener::bind(&path).unwrap(),
            "{\"result\":\"error\",\"message\":\"fork failed\",\"category\":\"operating_system_error\"}\n",
        );

        let mut hs = prepare(&ctx);
        let Err(ForkError::Failed(failure)) = request_fork(&mut hs, &path).await else {
            panic!("expected a failed fork");
        };
        let err = hs.into_error(failure, None, String::new());
        assert_eq!(err.category, ErrorCategory::OperatingSystemError);
        assert!(err.summary.contains("fork failed"));
        assert_eq!(
            err.failed_step(),
            Some(JourneyStep::SpawningKitProcessResponseFromPreloader)
        );
    }

    #[tokio::test]
    async fn test_request_fork_rejects_bad_pid() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preloader.sock");
        let _server = serve_once(UnixListener::bind(&path).unwrap(), "{\"result\":\"ok\",\"pid\":0}\n");

        let mut hs = prepare(&ctx);
        assert!(matches!(
            request_fork(&mut hs, &path).await,
            Err(ForkError::Failed(Failure::Invalid { .. }))
        ));
    }

    #[tokio::test]
    async fn test_request_fork_oversized_reply() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preloader.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = stream.write_all(&vec![b'x'; MAX_RESPONSE_SIZE + 100]).await;
        });

        let mut hs = prepare(&ctx);
        assert!(matches!(
            request_fork(&mut hs, &path).await,
            Err(ForkError::Failed(Failure::Invalid { .. }))
        ));
    }

    #[tokio::test]
    async fn test_request_fork_unreachable_is_io() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let mut hs = prepare(&ctx);
        let result = request_fork(&mut hs, &dir.path().join("missing.sock")).await;
        assert!(matches!(
            result,
            Err(ForkError::Io {
                step: JourneyStep::SpawningKitConnectToPreloader,
                ..
            })
        ));
    }
}
