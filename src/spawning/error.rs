//! Spawn failure reporting

use crate::context::Context;
use crate::journey::{Journey, JourneyStep};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Failure classification, also written by the child into `response/error/category`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InternalError,
    OperatingSystemError,
    IoError,
    TimeoutError,
    /// Bad configuration or a broken application setup
    UserError,
    /// The application loaded but raised during startup
    UserAppCodeError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InternalError => "internal_error",
            ErrorCategory::OperatingSystemError => "operating_system_error",
            ErrorCategory::IoError => "io_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::UserError => "user_error",
            ErrorCategory::UserAppCodeError => "user_app_code_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "internal_error" => Some(ErrorCategory::InternalError),
            "operating_system_error" => Some(ErrorCategory::OperatingSystemError),
            "io_error" => Some(ErrorCategory::IoError),
            "timeout_error" => Some(ErrorCategory::TimeoutError),
            "user_error" => Some(ErrorCategory::UserError),
            "user_app_code_error" => Some(ErrorCategory::UserAppCodeError),
            _ => None,
        }
    }

    /// Classify an I/O failure on the supervisor side
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut => ErrorCategory::TimeoutError,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::InvalidData => ErrorCategory::IoError,
            _ if error.raw_os_error().is_some() => ErrorCategory::OperatingSystemError,
            _ => ErrorCategory::IoError,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics the child's env-setupper dumped into `envdump/`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvDump {
    pub envvars: Option<String>,
    pub user_info: Option<String>,
    pub ulimits: Option<String>,
}

impl EnvDump {
    pub fn load(dir: &Path) -> Self {
        let read = |name: &str| std::fs::read_to_string(dir.join(name)).ok();
        Self {
            envvars: read("envvars"),
            user_info: read("user_info"),
            ulimits: read("ulimits"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.envvars.is_none() && self.user_info.is_none() && self.ulimits.is_none()
    }
}

/// A failed spawn attempt. Carries the journey so the failing step can be
/// reported after the attempt's resources are gone.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{summary} [{category}, error id {id}]")]
pub struct SpawnError {
    pub id: String,
    pub category: ErrorCategory,
    #[serde(skip)]
    pub journey: Journey,
    pub summary: String,
    pub details: Option<String>,
    pub stdout_and_err: String,
    pub subprocess_pid: Option<u32>,
    pub envdump: EnvDump,
    /// Set when the attempt hit its deadline
    pub timed_out_step: Option<JourneyStep>,
}

impl SpawnError {
    pub fn new(ctx: &Context, category: ErrorCategory, journey: Journey, summary: impl Into<String>) -> Self {
        Self {
            id: ctx.new_error_id(),
            category,
            journey,
            summary: summary.into(),
            details: None,
            stdout_and_err: String::new(),
            subprocess_pid: None,
            envdump: EnvDump::default(),
            timed_out_step: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.stdout_and_err = output;
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.subprocess_pid = pid;
        self
    }

    pub fn with_envdump(mut self, envdump: EnvDump) -> Self {
        self.envdump = envdump;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.category == ErrorCategory::TimeoutError
    }

    pub fn failed_step(&self) -> Option<JourneyStep> {
        self.journey.first_failed_step()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("journey".into(), self.journey.to_json());
            obj.insert(
                "failed_step".into(),
                serde_json::json!(self.failed_step().map(|s| s.as_str())),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpawningKitConfig;
    use crate::journey::JourneyType;
    use std::time::Duration;

    #[test]
    fn test_category_round_trip_names() {
        for category in [
            ErrorCategory::InternalError,
            ErrorCategory::OperatingSystemError,
            ErrorCategory::IoError,
            ErrorCategory::TimeoutError,
            ErrorCategory::UserError,
            ErrorCategory::UserAppCodeError,
        ] {
            assert_eq!(ErrorCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(ErrorCategory::parse("user_error\n"), Some(ErrorCategory::UserError));
        assert_eq!(ErrorCategory::parse("bogus"), None);
    }

    #[test]
    fn test_category_from_io() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(ErrorCategory::from_io(&eof), ErrorCategory::IoError);
        let enoent = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(ErrorCategory::from_io(&enoent), ErrorCategory::OperatingSystemError);
    }

    #[tokio::test]
    async fn test_spawn_error_json() {
        let ctx = Context::new(tokio::runtime::Handle::current(), SpawningKitConfig::default());
        let mut journey = Journey::new(JourneyType::SpawnDirectly);
        journey
            .fail_at(JourneyStep::SubprocessAppLoadOrExec, Duration::from_secs(1))
            .unwrap();
        let err = SpawnError::new(&ctx, ErrorCategory::UserAppCodeError, journey, "boom")
            .with_details("stack trace")
            .with_pid(Some(42));

        let json = err.to_json();
        assert_eq!(json["category"], "user_app_code_error");
        assert_eq!(json["summary"], "boom");
        assert_eq!(json["subprocess_pid"], 42);
        assert_eq!(json["failed_step"], "SUBPROCESS_APP_LOAD_OR_EXEC");
        assert_eq!(json["id"].as_str().unwrap().len(), 8);
        assert!(err.to_string().contains("user_app_code_error"));
    }

    #[test]
    fn test_envdump_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EnvDump::load(dir.path()).is_empty());
        std::fs::write(dir.path().join("envvars"), "A=1\n").unwrap();
        let dump = EnvDump::load(dir.path());
        assert_eq!(dump.envvars.as_deref(), Some("A=1\n"));
        assert!(dump.ulimits.is_none());
    }
}
