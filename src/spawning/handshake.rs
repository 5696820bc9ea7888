//! Work-directory handshake
//!
//! Every spawn attempt gets a fresh work directory:
//!
//! ```text
//! args.json                      options for the env-setupper and the app
//! response/finish                FIFO, the child writes one byte when ready
//! response/properties.json       sockets the child listens on
//! response/error/{summary,category,advanced_problem_details}
//! response/steps/<step>/{state,begin_time,end_time}
//! envdump/{envvars,user_info,ulimits}
//! ```
//!
//! Generic apps know nothing about this layout; for them readiness means the
//! `PORT` we exported accepts TCP connections.

use super::error::{EnvDump, ErrorCategory, SpawnError};
use super::{OsProcess, SocketInfo, SpawnedProcess};
use crate::conn_pool::Endpoint;
use crate::context::Context;
use crate::guards::{FdGuard, WorkDir};
use crate::journey::{Journey, JourneyStep, JourneyType, StepState};
use crate::pool::options::{AppProtocol, Options};
use parking_lot::Mutex;
use serde::Deserialize;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the handshake watches for premature exit
pub enum Watch<'a> {
    /// Our own child: reaped through `wait()`
    Child(&'a mut Child),
    /// Forked by a preloader: polled with `kill(pid, 0)`
    Pid(u32),
}

/// Why a handshake did not produce a process
#[derive(Debug)]
pub enum Failure {
    Io {
        step: JourneyStep,
        error: io::Error,
    },
    Exited {
        status: Option<ExitStatus>,
    },
    Timeout,
    Invalid {
        step: JourneyStep,
        category: ErrorCategory,
        summary: String,
        details: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct Properties {
    #[serde(default)]
    sockets: Vec<SocketInfo>,
}

/// One spawn attempt's handshake state: its work directory, journey and deadline
pub struct Handshake {
    ctx: Arc<Context>,
    pub journey: Journey,
    work_dir: WorkDir,
    pub gupid: String,
    generic_port: Option<u16>,
    app_protocol: AppProtocol,
    spawn_start: Duration,
    deadline: tokio::time::Instant,
}

impl Handshake {
    /// Create the work directory and write `args.json`. Covers SPAWNING_KIT_PREPARATION.
    pub fn prepare(
        ctx: &Arc<Context>,
        options: &Options,
        journey_type: JourneyType,
        extra_args: Option<serde_json::Value>,
    ) -> Result<Self, SpawnError> {
        let mut journey = Journey::new(journey_type);
        let spawn_start = ctx.now();
        let _ = journey.begin(JourneyStep::SpawningKitPreparation, spawn_start);

        let gupid = generate_gupid(ctx);
        // Preloaders always speak the handshake protocol
        let app_protocol = match journey_type {
            JourneyType::SpawnDirectly => options.app_protocol,
            _ => AppProtocol::Handshake,
        };

        let prepared = (|| -> io::Result<(WorkDir, Option<u16>)> {
            let work_dir = WorkDir::create(ctx.spawning_kit.work_dir_root.as_deref())?;
            let root = work_dir.path();
            std::fs::create_dir_all(root.join("response/steps"))?;
            std::fs::create_dir_all(root.join("response/error"))?;
            std::fs::create_dir_all(root.join("envdump"))?;
            crate::os::mkfifo(&root.join("response/finish"), 0o600)?;

            let port = match app_protocol {
                AppProtocol::Generic => Some(find_free_port()?),
                AppProtocol::Handshake => None,
            };

            let mut args = options.spawn_args();
            if let Some(obj) = args.as_object_mut() {
                obj.insert("work_dir".into(), serde_json::json!(root));
                obj.insert("gupid".into(), serde_json::json!(gupid));
                obj.insert("app_protocol".into(), serde_json::json!(app_protocol));
                obj.insert("port".into(), serde_json::json!(port));
                obj.insert("journey_type".into(), serde_json::json!(journey_type));
                if let Some(serde_json::Value::Object(extra)) = &extra_args {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
            let content = serde_json::to_vec_pretty(&args).map_err(io::Error::other)?;
            std::fs::write(root.join("args.json"), content)?;
            Ok((work_dir, port))
        })();

        match prepared {
            Ok((work_dir, generic_port)) => {
                let _ = journey.complete(JourneyStep::SpawningKitPreparation, ctx.now());
                debug!(work_dir = %work_dir.path().display(), gupid = %gupid, "Prepared spawn work directory");
                Ok(Self {
                    ctx: ctx.clone(),
                    journey,
                    work_dir,
                    gupid,
                    generic_port,
                    app_protocol,
                    spawn_start,
                    deadline: tokio::time::Instant::now() + options.start_timeout,
                })
            }
            Err(e) => {
                let _ = journey.fail_at(JourneyStep::SpawningKitPreparation, ctx.now());
                Err(SpawnError::new(
                    ctx,
                    ErrorCategory::from_io(&e),
                    journey,
                    "Could not prepare the spawn work directory.",
                )
                .with_details(e.to_string()))
            }
        }
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn response_dir(&self) -> PathBuf {
        self.work_dir.path().join("response")
    }

    pub fn steps_dir(&self) -> PathBuf {
        self.response_dir().join("steps")
    }

    pub fn generic_port(&self) -> Option<u16> {
        self.generic_port
    }

    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    pub fn begin_step(&mut self, step: JourneyStep) {
        if let Err(e) = self.journey.begin(step, self.ctx.now()) {
            error!(error = %e, "Journey bookkeeping error");
        }
    }

    pub fn complete_step(&mut self, step: JourneyStep) {
        if let Err(e) = self.journey.complete(step, self.ctx.now()) {
            error!(error = %e, "Journey bookkeeping error");
        }
    }

    /// Wait for the child to report readiness, then validate its sockets.
    /// Covers SPAWNING_KIT_HANDSHAKE_PERFORM.
    pub async fn perform(&mut self, mut watch: Watch<'_>) -> Result<Vec<SocketInfo>, Failure> {
        let step = JourneyStep::SpawningKitHandshakePerform;
        self.begin_step(step);

        let mut fifo = open_finish_fifo(&self.response_dir().join("finish"))
            .map_err(|error| Failure::Io { step, error })?;
        let mut byte = [0u8; 1];
        let port = self.generic_port;
        let deadline = self.deadline;

        tokio::select! {
            result = fifo.read(&mut byte) => {
                if let Err(error) = result {
                    return Err(Failure::Io { step, error });
                }
            }
            _ = wait_for_port(port) => {}
            status = wait_for_exit(&mut watch) => {
                return Err(Failure::Exited { status });
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Failure::Timeout);
            }
        }

        let sockets = self.read_sockets()?;
        self.validate_sockets(&sockets).await?;

        self.journey.load_step_files(&self.steps_dir());
        self.mark_child_steps_performed();
        self.complete_step(step);
        Ok(sockets)
    }

    fn read_sockets(&self) -> Result<Vec<SocketInfo>, Failure> {
        let path = self.response_dir().join("properties.json");
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return match (self.app_protocol, self.generic_port) {
                    (AppProtocol::Generic, Some(port)) => Ok(vec![SocketInfo {
                        address: format!("tcp://127.0.0.1:{}", port),
                        protocol: "http".into(),
                        concurrency: 0,
                    }]),
                    _ => Err(Failure::Invalid {
                        step: JourneyStep::SpawningKitHandshakePerform,
                        category: ErrorCategory::InternalError,
                        summary: "The application process signalled readiness without writing response/properties.json.".into(),
                        details: None,
                    }),
                };
            }
            Err(error) => {
                return Err(Failure::Io {
                    step: JourneyStep::SpawningKitHandshakePerform,
                    error,
                })
            }
        };

        let properties: Properties = serde_json::from_slice(&content).map_err(|e| Failure::Invalid {
            step: JourneyStep::SpawningKitHandshakePerform,
            category: ErrorCategory::InternalError,
            summary: "The application process wrote an invalid response/properties.json.".into(),
            details: Some(e.to_string()),
        })?;

        if properties.sockets.is_empty() {
            return Err(Failure::Invalid {
                step: JourneyStep::SpawningKitHandshakePerform,
                category: ErrorCategory::UserError,
                summary: "The application process does not listen on any socket.".into(),
                details: None,
            });
        }
        if let Some(bad) = properties.sockets.iter().find(|s| s.endpoint().is_none()) {
            return Err(Failure::Invalid {
                step: JourneyStep::SpawningKitHandshakePerform,
                category: ErrorCategory::InternalError,
                summary: format!("The application process advertised an unsupported socket address: {}", bad.address),
                details: None,
            });
        }
        Ok(properties.sockets)
    }

    /// Connect to every advertised socket; the child may not be listening yet.
    /// Giving up happens only at the start deadline and counts as a timeout.
    async fn validate_sockets(&self, sockets: &[SocketInfo]) -> Result<(), Failure> {
        for socket in sockets {
            let Some(endpoint) = socket.endpoint() else {
                continue;
            };
            loop {
                match tokio::time::timeout_at(self.deadline, endpoint.connect()).await {
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) if tokio::time::Instant::now() + POLL_INTERVAL < self.deadline => {
                        debug!(address = %socket.address, error = %e, "Socket not connectable yet");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Ok(Err(e)) => {
                        warn!(address = %socket.address, error = %e, "Advertised socket never became connectable");
                        return Err(Failure::Timeout);
                    }
                    Err(_) => {
                        warn!(address = %socket.address, "Connecting to advertised socket hit the start deadline");
                        return Err(Failure::Timeout);
                    }
                }
            }
        }
        Ok(())
    }

    /// Children of successful spawns may skip recording their later steps
    fn mark_child_steps_performed(&mut self) {
        let now = self.ctx.now();
        let states: Vec<(JourneyStep, StepState)> =
            self.journey.steps().map(|(step, info)| (step, info.state)).collect();
        for (step, state) in states {
            if !(step.is_subprocess() || step.is_preloader()) {
                continue;
            }
            let implied = step.is_preloader()
                || matches!(
                    step,
                    JourneyStep::SubprocessAppLoadOrExec
                        | JourneyStep::SubprocessPrepareAfterForkingFromPreloader
                        | JourneyStep::SubprocessListen
                        | JourneyStep::SubprocessFinish
                );
            if state == StepState::InProgress || (state == StepState::NotStarted && implied) {
                let _ = self.journey.force_state(step, StepState::Performed, None, Some(now));
            }
        }
    }

    /// Complete the journey and build the spawned process record
    pub fn finish(mut self, pid: u32, sockets: Vec<SocketInfo>, os: OsProcess) -> SpawnedProcess {
        let step = JourneyStep::SpawningKitFinish;
        self.begin_step(step);
        self.complete_step(step);
        if self.ctx.spawning_kit.keep_work_dirs {
            self.work_dir.commit();
        }
        SpawnedProcess {
            pid,
            gupid: self.gupid,
            sockets,
            journey: self.journey,
            spawn_start: self.spawn_start,
            spawn_end: self.ctx.now(),
            os,
        }
    }

    /// Turn a failed handshake into a SpawnError with exactly one failed step
    pub fn into_error(mut self, failure: Failure, pid: Option<u32>, output: String) -> SpawnError {
        let now = self.ctx.now();
        self.journey.load_step_files(&self.steps_dir());

        let error_dir = self.response_dir().join("error");
        let read = |name: &str| {
            std::fs::read_to_string(error_dir.join(name))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let reported_category = read("category").and_then(|c| ErrorCategory::parse(&c));
        let reported_summary = read("summary");
        let reported_details = read("advanced_problem_details");

        let mut timed_out_step = None;
        let (step, category, summary, details) = match failure {
            Failure::Io { step, error } => (
                step,
                ErrorCategory::from_io(&error),
                "An I/O error occurred while communicating with the application process.".to_string(),
                Some(error.to_string()),
            ),
            Failure::Exited { status } => (
                self.child_failed_step(),
                reported_category.unwrap_or(ErrorCategory::InternalError),
                reported_summary.unwrap_or_else(|| "The application process exited prematurely.".into()),
                reported_details.or_else(|| status.map(describe_exit_status)),
            ),
            Failure::Timeout => {
                let step = self
                    .in_progress_supervisor_step()
                    .unwrap_or_else(|| self.child_failed_step());
                timed_out_step = Some(step);
                (
                    step,
                    ErrorCategory::TimeoutError,
                    "A timeout occurred while spawning an application process.".to_string(),
                    reported_details,
                )
            }
            Failure::Invalid {
                step,
                category,
                summary,
                details,
            } => (step, category, summary, details),
        };

        if let Err(e) = self.journey.fail_at(step, now) {
            error!(error = %e, "Journey bookkeeping error");
        }

        let mut err = SpawnError::new(&self.ctx, category, self.journey.clone(), summary)
            .with_pid(pid)
            .with_output(output)
            .with_envdump(EnvDump::load(&self.work_dir.path().join("envdump")));
        err.details = details;
        err.timed_out_step = timed_out_step;

        warn!(
            error_id = %err.id,
            category = %err.category,
            step = %step,
            pid,
            summary = %err.summary,
            "Could not spawn application process"
        );

        if self.ctx.spawning_kit.keep_work_dirs {
            self.work_dir.commit();
        }
        err
    }

    /// A supervisor-side step other than the handshake wait that was cut short
    fn in_progress_supervisor_step(&self) -> Option<JourneyStep> {
        self.journey
            .steps()
            .find(|(step, info)| {
                info.state == StepState::InProgress
                    && !step.is_subprocess()
                    && !step.is_preloader()
                    && *step != JourneyStep::SpawningKitHandshakePerform
            })
            .map(|(step, _)| step)
    }

    /// The step a child reported as errored, or a guess from its progress
    fn child_failed_step(&self) -> JourneyStep {
        if let Some(step) = self.journey.first_failed_step() {
            return step;
        }
        if self.journey.state(JourneyStep::SubprocessFinish) == Some(StepState::Performed) {
            return JourneyStep::SpawningKitHandshakePerform;
        }
        self.journey.guess_failed_subprocess_step()
    }
}

/// Globally unique process id: spawn time in hex plus randomness
fn generate_gupid(ctx: &Context) -> String {
    let nanos = ctx.wall_now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    format!("{:x}-{}", nanos, ctx.new_error_id())
}

fn find_free_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Open the finish FIFO read-write so opening never blocks and we never see EOF
fn open_finish_fifo(path: &Path) -> io::Result<tokio::net::unix::pipe::Receiver> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just opened and is owned by nothing else
    let guard = unsafe { FdGuard::from_raw(fd) };
    let file = std::fs::File::from(guard.commit()?);
    tokio::net::unix::pipe::Receiver::from_file(file)
}

async fn wait_for_port(port: Option<u16>) {
    let Some(port) = port else {
        return std::future::pending().await;
    };
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_exit(watch: &mut Watch<'_>) -> Option<ExitStatus> {
    match watch {
        Watch::Child(child) => match child.wait().await {
            Ok(status) => Some(status),
            Err(_) => std::future::pending().await,
        },
        Watch::Pid(pid) => {
            while crate::os::process_alive(*pid) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            None
        }
    }
}

pub fn describe_exit_status(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("The process exited with status {}.", code),
        (None, Some(signal)) => format!("The process was terminated by signal {}.", signal),
        _ => "The process exited.".to_string(),
    }
}

/// Tees a child's stdout and stderr into the log (target `app`) and, while
/// capturing, into a bounded buffer used for spawn diagnostics.
pub struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    capturing: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    pub fn start(child: &mut Child, pid: u32, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let capturing = Arc::new(AtomicBool::new(true));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                pid,
                "stdout",
                buffer.clone(),
                capturing.clone(),
                limit,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                pid,
                "stderr",
                buffer.clone(),
                capturing.clone(),
                limit,
            )));
        }
        Self {
            buffer,
            capturing,
            readers,
        }
    }

    /// Captured output, after giving the readers up to `wait` to drain closed pipes
    pub async fn collect(mut self, wait: Duration) -> String {
        let readers = std::mem::take(&mut self.readers);
        let _ = tokio::time::timeout(wait, futures::future::join_all(readers)).await;
        self.capturing.store(false, Ordering::Relaxed);
        let buffer = self.buffer.lock();
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Stop capturing; lines keep going to the log for the life of the process
    pub fn detach(self) {
        self.capturing.store(false, Ordering::Relaxed);
        self.buffer.lock().clear();
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    pid: u32,
    stream: &'static str,
    buffer: Arc<Mutex<Vec<u8>>>,
    capturing: Arc<AtomicBool>,
    limit: usize,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let text = String::from_utf8_lossy(&line);
        info!(target: "app", pid, stream, "{}", text.trim_end());

        if capturing.load(Ordering::Relaxed) {
            let mut buf = buffer.lock();
            let room = limit.saturating_sub(buf.len());
            buf.extend_from_slice(&line[..line.len().min(room)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpawningKitConfig;
    use crate::journey::write_step_file;

    fn context() -> Arc<Context> {
        Context::new(tokio::runtime::Handle::current(), SpawningKitConfig::default())
    }

    fn handshake_options(timeout: Duration) -> Options {
        let mut options = Options::new("/tmp", "true");
        options.app_protocol = AppProtocol::Handshake;
        options.start_timeout = timeout;
        options
    }

    /// Opening a FIFO for writing blocks until a reader shows up
    fn signal_finish(path: PathBuf) {
        std::thread::spawn(move || {
            let mut fifo = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            std::io::Write::write_all(&mut fifo, b"1").unwrap();
        });
    }

    #[tokio::test]
    async fn test_prepare_layout() {
        let ctx = context();
        let mut options = Options::new("/srv/app", "node app.js");
        options.app_protocol = AppProtocol::Generic;
        let hs = Handshake::prepare(&ctx, &options, JourneyType::SpawnDirectly, None).unwrap();

        let root = hs.work_dir().to_path_buf();
        assert!(root.join("response/steps").is_dir());
        assert!(root.join("response/error").is_dir());
        assert!(root.join("envdump").is_dir());
        use std::os::unix::fs::FileTypeExt;
        assert!(std::fs::metadata(root.join("response/finish")).unwrap().file_type().is_fifo());

        let args: serde_json::Value =
            serde_json::from_slice(&std::fs::read(root.join("args.json")).unwrap()).unwrap();
        assert_eq!(args["start_command"], "node app.js");
        assert_eq!(args["gupid"], hs.gupid.as_str());
        assert_eq!(args["port"], hs.generic_port().unwrap());
        assert_eq!(
            hs.journey.state(JourneyStep::SpawningKitPreparation),
            Some(StepState::Performed)
        );

        drop(hs);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_perform_reads_properties_after_fifo_signal() {
        let ctx = context();
        let mut hs = Handshake::prepare(
            &ctx,
            &handshake_options(Duration::from_secs(5)),
            JourneyType::SpawnDirectly,
            None,
        )
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let response = hs.response_dir();
        std::fs::write(
            response.join("properties.json"),
            format!(
                r#"{{"sockets":[{{"address":"tcp://127.0.0.1:{}","protocol":"http","concurrency":1}}]}}"#,
                port
            ),
        )
        .unwrap();
        write_step_file(
            &response.join("steps"),
            JourneyStep::SubprocessBeforeFirstExec,
            StepState::Performed,
            Duration::from_secs(1),
        )
        .unwrap();
        signal_finish(response.join("finish"));

        let sockets = hs.perform(Watch::Pid(std::process::id())).await.unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].protocol, "http");
        assert_eq!(sockets[0].concurrency, 1);

        let process = hs.finish(1234, sockets, OsProcess::Dummy(1234));
        assert_eq!(
            process.journey.state(JourneyStep::SpawningKitFinish),
            Some(StepState::Performed)
        );
        assert_eq!(
            process.journey.state(JourneyStep::SubprocessListen),
            Some(StepState::Performed)
        );
    }

    #[tokio::test]
    async fn test_timeout_produces_single_errored_step() {
        let ctx = context();
        let mut hs = Handshake::prepare(
            &ctx,
            &handshake_options(Duration::from_millis(100)),
            JourneyType::SpawnDirectly,
            None,
        )
        .unwrap();
        hs.begin_step(JourneyStep::SpawningKitForkSubprocess);
        hs.complete_step(JourneyStep::SpawningKitForkSubprocess);
        write_step_file(
            &hs.steps_dir(),
            JourneyStep::SubprocessBeforeFirstExec,
            StepState::Performed,
            Duration::from_secs(1),
        )
        .unwrap();
        write_step_file(
            &hs.steps_dir(),
            JourneyStep::SubprocessAppLoadOrExec,
            StepState::InProgress,
            Duration::from_secs(1),
        )
        .unwrap();

        let failure = hs.perform(Watch::Pid(std::process::id())).await.unwrap_err();
        assert!(matches!(failure, Failure::Timeout));

        let err = hs.into_error(failure, None, String::new());
        assert_eq!(err.category, ErrorCategory::TimeoutError);
        assert_eq!(err.timed_out_step, Some(JourneyStep::SubprocessAppLoadOrExec));
        let errored: Vec<_> = err
            .journey
            .steps()
            .filter(|(_, info)| info.state == StepState::Errored)
            .collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(
            err.journey.state(JourneyStep::SpawningKitHandshakePerform),
            Some(StepState::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_unconnectable_socket_times_out() {
        let ctx = context();
        let mut hs = Handshake::prepare(
            &ctx,
            &handshake_options(Duration::from_millis(300)),
            JourneyType::SpawnDirectly,
            None,
        )
        .unwrap();

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let response = hs.response_dir();
        std::fs::write(
            response.join("properties.json"),
            format!(
                r#"{{"sockets":[{{"address":"tcp://127.0.0.1:{}","protocol":"http","concurrency":1}}]}}"#,
                port
            ),
        )
        .unwrap();
        signal_finish(response.join("finish"));

        let failure = hs.perform(Watch::Pid(std::process::id())).await.unwrap_err();
        assert!(matches!(failure, Failure::Timeout));

        let err = hs.into_error(failure, None, String::new());
        assert_eq!(err.category, ErrorCategory::TimeoutError);
        assert!(err.is_timeout());
        assert_eq!(err.timed_out_step, Some(JourneyStep::SpawningKitHandshakePerform));
        assert_eq!(
            err.journey.state(JourneyStep::SpawningKitHandshakePerform),
            Some(StepState::Errored)
        );
    }

    #[tokio::test]
    async fn test_child_reported_error_is_used() {
        let ctx = context();
        let hs = Handshake::prepare(
            &ctx,
            &handshake_options(Duration::from_secs(1)),
            JourneyType::SpawnDirectly,
            None,
        )
        .unwrap();
        let error_dir = hs.response_dir().join("error");
        std::fs::write(error_dir.join("summary"), "Gemfile not found\n").unwrap();
        std::fs::write(error_dir.join("category"), "user_error").unwrap();
        write_step_file(
            &hs.steps_dir(),
            JourneyStep::SubprocessAppLoadOrExec,
            StepState::Errored,
            Duration::from_secs(2),
        )
        .unwrap();

        let err = hs.into_error(Failure::Exited { status: None }, Some(77), "boom\n".into());
        assert_eq!(err.category, ErrorCategory::UserError);
        assert_eq!(err.summary, "Gemfile not found");
        assert_eq!(err.failed_step(), Some(JourneyStep::SubprocessAppLoadOrExec));
        assert_eq!(err.subprocess_pid, Some(77));
        assert_eq!(err.stdout_and_err, "boom\n");
    }

    #[tokio::test]
    async fn test_missing_properties_is_invalid_for_handshake_apps() {
        let ctx = context();
        let mut hs = Handshake::prepare(
            &ctx,
            &handshake_options(Duration::from_secs(5)),
            JourneyType::SpawnDirectly,
            None,
        )
        .unwrap();
        signal_finish(hs.response_dir().join("finish"));
        let failure = hs.perform(Watch::Pid(std::process::id())).await.unwrap_err();
        assert!(matches!(failure, Failure::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_output_capture_is_bounded() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo hello; echo world 1>&2; printf '%0200d\\n' 0")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let capture = OutputCapture::start(&mut child, pid, 64);
        child.wait().await.unwrap();
        let output = capture.collect(Duration::from_secs(2)).await;
        assert!(output.contains("hello"));
        assert!(output.len() <= 64);
    }

    #[test]
    fn test_describe_exit_status() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(
            describe_exit_status(ExitStatus::from_raw(1 << 8)),
            "The process exited with status 1."
        );
        assert_eq!(
            describe_exit_status(ExitStatus::from_raw(9)),
            "The process was terminated by signal 9."
        );
    }
}
