//! Per-application spawn and routing options

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How worker processes are started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMethod {
    /// Fork and exec a fresh process for every worker
    Direct,
    /// Keep a preloader around and ask it to fork workers
    Smart,
}

impl SpawnMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(SpawnMethod::Direct),
            "smart" => Some(SpawnMethod::Smart),
            _ => None,
        }
    }
}

/// How a worker announces readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppProtocol {
    /// Any HTTP server: listens on `$PORT`, ready once that port accepts connections
    Generic,
    /// Writes `response/properties.json` and signals the finish FIFO
    Handshake,
}

impl AppProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generic" => Some(AppProtocol::Generic),
            "handshake" => Some(AppProtocol::Handshake),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendlyErrorPages {
    /// On for development-like environments only
    Auto,
    On,
    Off,
}

impl FriendlyErrorPages {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(FriendlyErrorPages::Auto),
            "true" | "on" | "yes" => Some(FriendlyErrorPages::On),
            "false" | "off" | "no" => Some(FriendlyErrorPages::Off),
            _ => None,
        }
    }

    pub fn enabled_for(&self, environment: &str) -> bool {
        match self {
            FriendlyErrorPages::On => true,
            FriendlyErrorPages::Off => false,
            FriendlyErrorPages::Auto => matches!(environment, "development" | "dev" | "test"),
        }
    }
}

/// The tuple that decides whether two requests may share workers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ApplicationIdentity {
    pub app_root: PathBuf,
    pub environment: String,
    pub app_type: String,
    pub start_command: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl ApplicationIdentity {
    /// Group name as shown in pool dumps and accepted by the admin endpoint
    pub fn name(&self) -> String {
        format!("{} ({})", self.app_root.display(), self.environment)
    }
}

/// Everything a group needs to spawn and route for one application
#[derive(Debug, Clone, Serialize)]
pub struct Options {
    pub app_root: PathBuf,
    pub environment: String,
    pub app_type: String,
    pub start_command: String,
    pub startup_file: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub spawn_method: SpawnMethod,
    pub app_protocol: AppProtocol,
    pub env: BTreeMap<String, String>,

    pub min_processes: usize,
    /// 0 means no per-group limit
    pub max_processes: usize,
    /// 0 means unbounded
    pub max_request_queue_size: usize,
    /// How long a request may wait for a session; zero waits forever
    #[serde(with = "duration_secs")]
    pub max_request_queue_time: Duration,
    /// Detach a process after it served this many requests; 0 disables
    pub max_requests: u64,
    #[serde(with = "duration_secs")]
    pub start_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub stat_throttle_rate: Duration,
    pub sticky_sessions: bool,
    pub friendly_error_pages: FriendlyErrorPages,
    pub request_queue_overflow_status_code: u16,
    pub buffer_request_body: bool,
    pub load_shell_envvars: bool,
    pub file_descriptor_ulimit: Option<u64>,
    /// Overrides the concurrency a worker advertises; 0 means unlimited
    pub max_concurrent_requests_per_process: Option<usize>,
    /// Lets holders of this key inspect and restart this application
    #[serde(skip)]
    pub api_key: Option<String>,
}

mod duration_secs {
    pub fn serialize<S: serde::Serializer>(d: &std::time::Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

impl Options {
    pub fn new(app_root: impl Into<PathBuf>, start_command: &str) -> Self {
        Self {
            app_root: app_root.into(),
            environment: "production".to_string(),
            app_type: "generic".to_string(),
            start_command: start_command.to_string(),
            startup_file: None,
            user: None,
            group: None,
            spawn_method: SpawnMethod::Direct,
            app_protocol: AppProtocol::Generic,
            env: BTreeMap::new(),
            min_processes: 1,
            max_processes: 0,
            max_request_queue_size: 100,
            max_request_queue_time: Duration::ZERO,
            max_requests: 0,
            start_timeout: Duration::from_secs(90),
            stat_throttle_rate: Duration::from_secs(10),
            sticky_sessions: false,
            friendly_error_pages: FriendlyErrorPages::Auto,
            request_queue_overflow_status_code: 503,
            buffer_request_body: false,
            load_shell_envvars: false,
            file_descriptor_ulimit: None,
            max_concurrent_requests_per_process: None,
            api_key: None,
        }
    }

    pub fn identity(&self) -> ApplicationIdentity {
        ApplicationIdentity {
            app_root: self.app_root.clone(),
            environment: self.environment.clone(),
            app_type: self.app_type.clone(),
            start_command: self.start_command.clone(),
            user: self.user.clone(),
            group: self.group.clone(),
        }
    }

    pub fn friendly_error_pages_enabled(&self) -> bool {
        self.friendly_error_pages.enabled_for(&self.environment)
    }

    /// `args.json` content handed to the env-setupper and the app
    pub fn spawn_args(&self) -> serde_json::Value {
        serde_json::json!({
            "app_root": self.app_root,
            "app_type": self.app_type,
            "environment": self.environment,
            "start_command": self.start_command,
            "startup_file": self.startup_file,
            "user": self.user,
            "group": self.group,
            "app_protocol": self.app_protocol,
            "env": self.env,
            "load_shell_envvars": self.load_shell_envvars,
            "file_descriptor_ulimit": self.file_descriptor_ulimit,
            "start_timeout_ms": self.start_timeout.as_millis() as u64,
        })
    }
}
