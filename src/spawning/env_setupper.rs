//! Child side of a spawn: the `spawn-env-setupper` sub-command
//!
//! Runs inside the freshly forked child, before the application. `--before`
//! dumps diagnostics, applies limits, drops privileges and execs either the
//! user's login shell or directly `--after`; `--after` sets up the working
//! directory and environment and execs the start command. Each phase records
//! its journey steps into the work directory.

use super::error::ErrorCategory;
use crate::journey::{write_atomically, write_step_file, JourneyStep, StepState};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

impl Phase {
    pub fn parse(flag: &str) -> Option<Self> {
        match flag {
            "--before" => Some(Phase::Before),
            "--after" => Some(Phase::After),
            _ => None,
        }
    }
}

/// The parts of `args.json` the env-setupper needs
#[derive(Debug, Clone, Deserialize)]
pub struct SpawnArgs {
    pub app_root: PathBuf,
    #[serde(default)]
    pub environment: String,
    pub start_command: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub load_shell_envvars: bool,
    #[serde(default)]
    pub file_descriptor_ulimit: Option<u64>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub gupid: Option<String>,
}

struct StepFailure {
    step: JourneyStep,
    category: ErrorCategory,
    message: String,
}

impl StepFailure {
    fn new(step: JourneyStep, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            step,
            category,
            message: message.into(),
        }
    }
}

struct Setupper {
    work_dir: PathBuf,
    args: SpawnArgs,
}

/// Entry point. Only returns on failure; the return value is the exit code.
pub fn run(work_dir: &Path, phase: Phase) -> i32 {
    let args = match load_args(work_dir) {
        Ok(args) => args,
        Err(message) => {
            report_error(
                work_dir,
                JourneyStep::SubprocessBeforeFirstExec,
                ErrorCategory::InternalError,
                &message,
            );
            return 1;
        }
    };

    let setupper = Setupper {
        work_dir: work_dir.to_path_buf(),
        args,
    };
    let failure = match phase {
        Phase::Before => setupper.before(),
        Phase::After => setupper.after(),
    };
    report_error(work_dir, failure.step, failure.category, &failure.message);
    1
}

pub fn load_args(work_dir: &Path) -> Result<SpawnArgs, String> {
    let path = work_dir.join("args.json");
    let content = std::fs::read(&path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    serde_json::from_slice(&content).map_err(|e| format!("Cannot parse {}: {}", path.display(), e))
}

impl Setupper {
    fn steps_dir(&self) -> PathBuf {
        self.work_dir.join("response/steps")
    }

    fn record(&self, step: JourneyStep, state: StepState) {
        if let Err(e) = write_step_file(&self.steps_dir(), step, state, crate::os::monotonic_now()) {
            eprintln!("appgate: cannot record step {}: {}", step, e);
        }
    }

    fn step_state(&self, step: JourneyStep) -> Option<StepState> {
        std::fs::read_to_string(self.steps_dir().join(step.dir_name()).join("state"))
            .ok()
            .and_then(|s| StepState::parse(&s))
    }

    fn dump(&self, name: &str, content: &str) {
        let path = self.work_dir.join("envdump").join(name);
        if let Err(e) = write_atomically(&path, content.as_bytes()) {
            eprintln!("appgate: cannot write {}: {}", path.display(), e);
        }
    }

    fn dump_envvars(&self) {
        let envvars: String = std::env::vars_os()
            .map(|(k, v)| format!("{}={}\n", k.to_string_lossy(), v.to_string_lossy()))
            .collect();
        self.dump("envvars", &envvars);
    }

    fn setupper_command(&self) -> Command {
        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("appgate"));
        let mut cmd = Command::new(exe);
        cmd.arg("spawn-env-setupper").arg(&self.work_dir).arg("--after");
        cmd
    }

    fn before(&self) -> StepFailure {
        self.record(JourneyStep::SubprocessBeforeFirstExec, StepState::Performed);

        let step = JourneyStep::SubprocessSpawnEnvSetupperBeforeShell;
        self.record(step, StepState::InProgress);

        self.dump_envvars();
        self.dump("ulimits", &crate::os::dump_ulimits());
        match crate::os::lookup_uid(crate::os::current_uid()) {
            Ok(Some(user)) => self.dump("user_info", &user.describe()),
            _ => self.dump("user_info", &format!("uid={}", crate::os::current_uid())),
        }

        if let Some(limit) = self.args.file_descriptor_ulimit {
            if let Err(e) = crate::os::set_file_descriptor_limit(limit) {
                return StepFailure::new(
                    step,
                    ErrorCategory::OperatingSystemError,
                    format!("Cannot set the file descriptor limit to {}: {}", limit, e),
                );
            }
        }

        let mut shell = String::from("/bin/sh");
        if let Some(name) = self.args.user.as_deref().filter(|_| crate::os::is_root()) {
            let user = match crate::os::lookup_user(name) {
                Ok(Some(user)) => user,
                Ok(None) => {
                    return StepFailure::new(
                        step,
                        ErrorCategory::UserError,
                        format!("The user '{}' does not exist.", name),
                    )
                }
                Err(e) => {
                    return StepFailure::new(
                        step,
                        ErrorCategory::OperatingSystemError,
                        format!("Cannot look up user '{}': {}", name, e),
                    )
                }
            };
            if let Err(e) = crate::os::switch_user(&user) {
                return StepFailure::new(
                    step,
                    ErrorCategory::OperatingSystemError,
                    format!("Cannot switch to user '{}': {}", name, e),
                );
            }
            std::env::set_var("USER", &user.name);
            std::env::set_var("LOGNAME", &user.name);
            std::env::set_var("HOME", &user.home);
            shell = user.shell.clone();
            self.dump("user_info", &user.describe());
        } else if let Ok(Some(user)) = crate::os::lookup_uid(crate::os::current_uid()) {
            if !user.shell.is_empty() {
                shell = user.shell;
            }
        }
        self.record(step, StepState::Performed);

        if self.args.load_shell_envvars {
            let step = JourneyStep::SubprocessOsShell;
            self.record(step, StepState::InProgress);
            let inner = self.setupper_command();
            let mut cmd = Command::new(&shell);
            cmd.arg("-lc")
                .arg("exec \"$0\" \"$@\"")
                .arg(inner.get_program())
                .args(inner.get_args());
            let error = cmd.exec();
            return StepFailure::new(
                step,
                ErrorCategory::OperatingSystemError,
                format!("Cannot execute the login shell {}: {}", shell, error),
            );
        }

        let error = self.setupper_command().exec();
        StepFailure::new(
            JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
            ErrorCategory::OperatingSystemError,
            format!("Cannot execute the env-setupper: {}", error),
        )
    }

    fn after(&self) -> StepFailure {
        if self.step_state(JourneyStep::SubprocessOsShell) == Some(StepState::InProgress) {
            self.record(JourneyStep::SubprocessOsShell, StepState::Performed);
        }

        let step = JourneyStep::SubprocessSpawnEnvSetupperAfterShell;
        self.record(step, StepState::InProgress);

        if let Err(e) = std::env::set_current_dir(&self.args.app_root) {
            return StepFailure::new(
                step,
                ErrorCategory::UserError,
                format!(
                    "The application root {} does not exist or is not accessible: {}",
                    self.args.app_root.display(),
                    e
                ),
            );
        }

        for (key, value) in self.environment() {
            std::env::set_var(key, value);
        }
        self.dump_envvars();
        self.record(step, StepState::Performed);

        let step = JourneyStep::SubprocessAppLoadOrExec;
        self.record(step, StepState::InProgress);
        let error = Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("exec {}", self.args.start_command))
            .exec();
        StepFailure::new(
            step,
            ErrorCategory::OperatingSystemError,
            format!("Cannot execute the start command '{}': {}", self.args.start_command, error),
        )
    }

    /// Variables exported to the application; `env` from the config wins over derived ones
    fn environment(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if !self.args.environment.is_empty() {
            for key in ["APPGATE_APP_ENV", "RAILS_ENV", "RACK_ENV", "NODE_ENV"] {
                vars.insert(key.to_string(), self.args.environment.clone());
            }
        }
        if let Some(port) = self.args.port {
            vars.insert("PORT".into(), port.to_string());
        }
        if let Some(gupid) = &self.args.gupid {
            vars.insert("APPGATE_GUPID".into(), gupid.clone());
        }
        vars.insert(
            "APPGATE_SPAWN_WORK_DIR".into(),
            self.work_dir.to_string_lossy().into_owned(),
        );
        vars.insert("IN_APPGATE".into(), "1".into());
        for (key, value) in &self.args.env {
            vars.insert(key.clone(), value.clone());
        }
        vars
    }
}

/// Record a failure where the supervisor will find it
fn report_error(work_dir: &Path, step: JourneyStep, category: ErrorCategory, message: &str) {
    eprintln!("appgate: {}", message);
    let steps_dir = work_dir.join("response/steps");
    let _ = write_step_file(&steps_dir, step, StepState::Errored, crate::os::monotonic_now());
    let error_dir = work_dir.join("response/error");
    let _ = std::fs::create_dir_all(&error_dir);
    let _ = write_atomically(&error_dir.join("summary"), message.as_bytes());
    let _ = write_atomically(&error_dir.join("category"), category.as_str().as_bytes());
}
