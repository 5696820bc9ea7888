//! Spawn journeys
//!
//! A journey is the ordered list of steps one spawn attempt goes through. Each
//! step carries a state and begin/end timestamps. Some steps are recorded by the
//! supervisor, others by the child through files in the handshake work directory
//! (`response/steps/<step>/{state,begin_time,end_time}`).

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Every step that can appear in a journey, in journey order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JourneyStep {
    SpawningKitPreparation,
    SpawningKitForkSubprocess,
    SpawningKitConnectToPreloader,
    SpawningKitSendCommandToPreloader,
    SpawningKitReadResponseFromPreloader,
    SpawningKitParseResponseFromPreloader,
    SpawningKitProcessResponseFromPreloader,

    PreloaderPreparation,
    PreloaderForkSubprocess,
    PreloaderSendResponse,
    PreloaderFinish,

    SubprocessBeforeFirstExec,
    SubprocessSpawnEnvSetupperBeforeShell,
    SubprocessOsShell,
    SubprocessSpawnEnvSetupperAfterShell,
    SubprocessExecWrapper,
    SubprocessWrapperPreparation,
    SubprocessAppLoadOrExec,
    SubprocessPrepareAfterForkingFromPreloader,
    SubprocessListen,
    SubprocessFinish,

    SpawningKitHandshakePerform,
    SpawningKitFinish,
}

impl JourneyStep {
    pub const ALL: [JourneyStep; 23] = [
        JourneyStep::SpawningKitPreparation,
        JourneyStep::SpawningKitForkSubprocess,
        JourneyStep::SpawningKitConnectToPreloader,
        JourneyStep::SpawningKitSendCommandToPreloader,
        JourneyStep::SpawningKitReadResponseFromPreloader,
        JourneyStep::SpawningKitParseResponseFromPreloader,
        JourneyStep::SpawningKitProcessResponseFromPreloader,
        JourneyStep::PreloaderPreparation,
        JourneyStep::PreloaderForkSubprocess,
        JourneyStep::PreloaderSendResponse,
        JourneyStep::PreloaderFinish,
        JourneyStep::SubprocessBeforeFirstExec,
        JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
        JourneyStep::SubprocessOsShell,
        JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
        JourneyStep::SubprocessExecWrapper,
        JourneyStep::SubprocessWrapperPreparation,
        JourneyStep::SubprocessAppLoadOrExec,
        JourneyStep::SubprocessPrepareAfterForkingFromPreloader,
        JourneyStep::SubprocessListen,
        JourneyStep::SubprocessFinish,
        JourneyStep::SpawningKitHandshakePerform,
        JourneyStep::SpawningKitFinish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStep::SpawningKitPreparation => "SPAWNING_KIT_PREPARATION",
            JourneyStep::SpawningKitForkSubprocess => "SPAWNING_KIT_FORK_SUBPROCESS",
            JourneyStep::SpawningKitConnectToPreloader => "SPAWNING_KIT_CONNECT_TO_PRELOADER",
            JourneyStep::SpawningKitSendCommandToPreloader => "SPAWNING_KIT_SEND_COMMAND_TO_PRELOADER",
            JourneyStep::SpawningKitReadResponseFromPreloader => "SPAWNING_KIT_READ_RESPONSE_FROM_PRELOADER",
            JourneyStep::SpawningKitParseResponseFromPreloader => "SPAWNING_KIT_PARSE_RESPONSE_FROM_PRELOADER",
            JourneyStep::SpawningKitProcessResponseFromPreloader => "SPAWNING_KIT_PROCESS_RESPONSE_FROM_PRELOADER",
            JourneyStep::PreloaderPreparation => "PRELOADER_PREPARATION",
            JourneyStep::PreloaderForkSubprocess => "PRELOADER_FORK_SUBPROCESS",
            JourneyStep::PreloaderSendResponse => "PRELOADER_SEND_RESPONSE",
            JourneyStep::PreloaderFinish => "PRELOADER_FINISH",
            JourneyStep::SubprocessBeforeFirstExec => "SUBPROCESS_BEFORE_FIRST_EXEC",
            JourneyStep::SubprocessSpawnEnvSetupperBeforeShell => "SUBPROCESS_SPAWN_ENV_SETUPPER_BEFORE_SHELL",
            JourneyStep::SubprocessOsShell => "SUBPROCESS_OS_SHELL",
            JourneyStep::SubprocessSpawnEnvSetupperAfterShell => "SUBPROCESS_SPAWN_ENV_SETUPPER_AFTER_SHELL",
            JourneyStep::SubprocessExecWrapper => "SUBPROCESS_EXEC_WRAPPER",
            JourneyStep::SubprocessWrapperPreparation => "SUBPROCESS_WRAPPER_PREPARATION",
            JourneyStep::SubprocessAppLoadOrExec => "SUBPROCESS_APP_LOAD_OR_EXEC",
            JourneyStep::SubprocessPrepareAfterForkingFromPreloader => {
                "SUBPROCESS_PREPARE_AFTER_FORKING_FROM_PRELOADER"
            }
            JourneyStep::SubprocessListen => "SUBPROCESS_LISTEN",
            JourneyStep::SubprocessFinish => "SUBPROCESS_FINISH",
            JourneyStep::SpawningKitHandshakePerform => "SPAWNING_KIT_HANDSHAKE_PERFORM",
            JourneyStep::SpawningKitFinish => "SPAWNING_KIT_FINISH",
        }
    }

    /// Directory name under `response/steps/`
    pub fn dir_name(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    pub fn parse(s: &str) -> Option<JourneyStep> {
        let upper = s.trim().to_ascii_uppercase();
        JourneyStep::ALL.into_iter().find(|step| step.as_str() == upper)
    }

    /// Steps recorded by the child process itself
    pub fn is_subprocess(&self) -> bool {
        self.as_str().starts_with("SUBPROCESS_")
    }

    /// Steps recorded by the preloader on behalf of the supervisor
    pub fn is_preloader(&self) -> bool {
        self.as_str().starts_with("PRELOADER_")
    }
}

impl std::fmt::Display for JourneyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    NotStarted,
    InProgress,
    Performed,
    Errored,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::NotStarted => "STEP_NOT_STARTED",
            StepState::InProgress => "STEP_IN_PROGRESS",
            StepState::Performed => "STEP_PERFORMED",
            StepState::Errored => "STEP_ERRORED",
        }
    }

    /// Parse the content of a `state` file; accepts both `STEP_PERFORMED` and `PERFORMED`
    pub fn parse(s: &str) -> Option<StepState> {
        let s = s.trim();
        let s = s.strip_prefix("STEP_").unwrap_or(s);
        match s {
            "NOT_STARTED" => Some(StepState::NotStarted),
            "IN_PROGRESS" => Some(StepState::InProgress),
            "PERFORMED" => Some(StepState::Performed),
            "ERRORED" => Some(StepState::Errored),
            _ => None,
        }
    }
}

/// The three journey shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyType {
    SpawnDirectly,
    StartPreloader,
    SpawnThroughPreloader,
}

impl JourneyType {
    fn steps(&self) -> &'static [JourneyStep] {
        use JourneyStep::*;
        match self {
            JourneyType::SpawnDirectly => &[
                SpawningKitPreparation,
                SpawningKitForkSubprocess,
                SubprocessBeforeFirstExec,
                SubprocessSpawnEnvSetupperBeforeShell,
                SubprocessOsShell,
                SubprocessSpawnEnvSetupperAfterShell,
                SubprocessExecWrapper,
                SubprocessWrapperPreparation,
                SubprocessAppLoadOrExec,
                SubprocessListen,
                SubprocessFinish,
                SpawningKitHandshakePerform,
                SpawningKitFinish,
            ],
            JourneyType::StartPreloader => &[
                SpawningKitPreparation,
                SpawningKitForkSubprocess,
                SubprocessBeforeFirstExec,
                SubprocessSpawnEnvSetupperBeforeShell,
                SubprocessOsShell,
                SubprocessSpawnEnvSetupperAfterShell,
                SubprocessExecWrapper,
                SubprocessWrapperPreparation,
                SubprocessAppLoadOrExec,
                SubprocessListen,
                SubprocessFinish,
                SpawningKitHandshakePerform,
                SpawningKitFinish,
            ],
            JourneyType::SpawnThroughPreloader => &[
                SpawningKitPreparation,
                SpawningKitConnectToPreloader,
                SpawningKitSendCommandToPreloader,
                SpawningKitReadResponseFromPreloader,
                SpawningKitParseResponseFromPreloader,
                SpawningKitProcessResponseFromPreloader,
                PreloaderPreparation,
                PreloaderForkSubprocess,
                PreloaderSendResponse,
                PreloaderFinish,
                SubprocessPrepareAfterForkingFromPreloader,
                SubprocessListen,
                SubprocessFinish,
                SpawningKitHandshakePerform,
                SpawningKitFinish,
            ],
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JourneyError {
    #[error("step {0} is not part of this journey")]
    UnknownStep(JourneyStep),

    #[error("invalid transition for step {step}: {from:?} -> {to:?}")]
    InvalidTransition {
        step: JourneyStep,
        from: StepState,
        to: StepState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInfo {
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_nanos")]
    pub begin_time: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_nanos")]
    pub end_time: Option<Duration>,
}

fn serialize_nanos<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_u64(d.as_nanos() as u64),
        None => s.serialize_none(),
    }
}

impl StepInfo {
    fn not_started() -> Self {
        Self {
            state: StepState::NotStarted,
            begin_time: None,
            end_time: None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.begin_time, self.end_time) {
            (Some(begin), Some(end)) => Some(end.saturating_sub(begin)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journey {
    journey_type: JourneyType,
    steps: BTreeMap<JourneyStep, StepInfo>,
}

impl Journey {
    pub fn new(journey_type: JourneyType) -> Self {
        let steps = journey_type
            .steps()
            .iter()
            .map(|step| (*step, StepInfo::not_started()))
            .collect();
        Self {
            journey_type,
            steps,
        }
    }

    pub fn journey_type(&self) -> JourneyType {
        self.journey_type
    }

    pub fn has_step(&self, step: JourneyStep) -> bool {
        self.steps.contains_key(&step)
    }

    pub fn state(&self, step: JourneyStep) -> Option<StepState> {
        self.steps.get(&step).map(|info| info.state)
    }

    pub fn info(&self, step: JourneyStep) -> Option<&StepInfo> {
        self.steps.get(&step)
    }

    pub fn steps(&self) -> impl Iterator<Item = (JourneyStep, &StepInfo)> {
        self.steps.iter().map(|(step, info)| (*step, info))
    }

    /// NOT_STARTED -> IN_PROGRESS
    pub fn begin(&mut self, step: JourneyStep, now: Duration) -> Result<(), JourneyError> {
        let info = self.step_mut(step)?;
        if info.state != StepState::NotStarted {
            return Err(JourneyError::InvalidTransition {
                step,
                from: info.state,
                to: StepState::InProgress,
            });
        }
        info.state = StepState::InProgress;
        info.begin_time = Some(now);
        Ok(())
    }

    /// IN_PROGRESS -> PERFORMED
    pub fn complete(&mut self, step: JourneyStep, now: Duration) -> Result<(), JourneyError> {
        self.finish(step, StepState::Performed, now)
    }

    /// IN_PROGRESS -> ERRORED
    pub fn fail(&mut self, step: JourneyStep, now: Duration) -> Result<(), JourneyError> {
        self.finish(step, StepState::Errored, now)
    }

    fn finish(&mut self, step: JourneyStep, to: StepState, now: Duration) -> Result<(), JourneyError> {
        let info = self.step_mut(step)?;
        if info.state != StepState::InProgress {
            return Err(JourneyError::InvalidTransition {
                step,
                from: info.state,
                to,
            });
        }
        info.state = to;
        info.end_time = Some(now);
        Ok(())
    }

    /// Record a state observed elsewhere (the child's step files)
    pub fn force_state(
        &mut self,
        step: JourneyStep,
        state: StepState,
        begin_time: Option<Duration>,
        end_time: Option<Duration>,
    ) -> Result<(), JourneyError> {
        let info = self.step_mut(step)?;
        info.state = state;
        if begin_time.is_some() {
            info.begin_time = begin_time;
        }
        if end_time.is_some() {
            info.end_time = end_time;
        }
        Ok(())
    }

    /// Mark `step` as the single failed step of this journey. Any other ERRORED
    /// step becomes NOT_STARTED again, as does every later step that had started.
    pub fn fail_at(&mut self, step: JourneyStep, now: Duration) -> Result<(), JourneyError> {
        if !self.has_step(step) {
            return Err(JourneyError::UnknownStep(step));
        }
        for (other, info) in self.steps.iter_mut() {
            let reset = (*other > step && info.state != StepState::NotStarted)
                || (*other < step && info.state == StepState::Errored);
            if reset {
                *info = StepInfo::not_started();
            }
        }

        let info = self.step_mut(step)?;
        if info.begin_time.is_none() {
            info.begin_time = Some(now);
        }
        info.state = StepState::Errored;
        info.end_time = Some(now);
        Ok(())
    }

    pub fn first_failed_step(&self) -> Option<JourneyStep> {
        self.steps
            .iter()
            .find(|(_, info)| info.state == StepState::Errored)
            .map(|(step, _)| *step)
    }

    /// Best guess at which child-side step failed when the child died or timed
    /// out without saying so itself.
    pub fn guess_failed_subprocess_step(&self) -> JourneyStep {
        let subprocess: Vec<(JourneyStep, StepState)> = self
            .steps
            .iter()
            .filter(|(step, _)| step.is_subprocess())
            .map(|(step, info)| (*step, info.state))
            .collect();

        let Some(&(first, _)) = subprocess.first() else {
            return JourneyStep::SpawningKitHandshakePerform;
        };

        if let Some((step, _)) = subprocess.iter().find(|(_, s)| *s == StepState::InProgress) {
            return *step;
        }

        let last_performed = subprocess.iter().rposition(|(_, s)| *s == StepState::Performed);
        match last_performed {
            None => first,
            Some(index) if index + 1 == subprocess.len() => subprocess[index].0,
            Some(index) => subprocess[index + 1].0,
        }
    }

    /// Load the child's step records from `<response_dir>/steps`
    pub fn load_step_files(&mut self, steps_dir: &Path) {
        for step in JourneyStep::ALL {
            if !self.has_step(step) || !(step.is_subprocess() || step.is_preloader()) {
                continue;
            }
            let dir = steps_dir.join(step.dir_name());
            let Some(state) = std::fs::read_to_string(dir.join("state"))
                .ok()
                .and_then(|s| StepState::parse(&s))
            else {
                continue;
            };
            let read_time = |name: &str| {
                std::fs::read_to_string(dir.join(name))
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_nanos)
            };
            let _ = self.force_state(step, state, read_time("begin_time"), read_time("end_time"));
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let steps: serde_json::Map<String, serde_json::Value> = self
            .steps
            .iter()
            .map(|(step, info)| {
                let mut value = serde_json::to_value(info).unwrap_or(serde_json::Value::Null);
                if let (Some(obj), Some(duration)) = (value.as_object_mut(), info.duration()) {
                    obj.insert("duration_ms".into(), serde_json::json!(duration.as_millis() as u64));
                }
                (step.as_str().to_string(), value)
            })
            .collect();
        serde_json::json!({
            "type": self.journey_type,
            "steps": steps,
        })
    }

    fn step_mut(&mut self, step: JourneyStep) -> Result<&mut StepInfo, JourneyError> {
        self.steps
            .get_mut(&step)
            .ok_or(JourneyError::UnknownStep(step))
    }
}

/// Write one step record the way the child does: each file written to a
/// temporary name and renamed into place.
pub fn write_step_file(
    steps_dir: &Path,
    step: JourneyStep,
    state: StepState,
    time: Duration,
) -> std::io::Result<()> {
    let dir = steps_dir.join(step.dir_name());
    std::fs::create_dir_all(&dir)?;

    let time_file = match state {
        StepState::InProgress => Some("begin_time"),
        StepState::Performed | StepState::Errored => Some("end_time"),
        StepState::NotStarted => None,
    };
    if let Some(name) = time_file {
        if state != StepState::InProgress && !dir.join("begin_time").exists() {
            write_atomically(&dir.join("begin_time"), time.as_nanos().to_string().as_bytes())?;
        }
        write_atomically(&dir.join(name), time.as_nanos().to_string().as_bytes())?;
    }
    write_atomically(&dir.join("state"), state.as_str().as_bytes())
}

pub fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
