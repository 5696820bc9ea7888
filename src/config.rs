use crate::context::SpawningKitConfig;
use crate::pool::options::{AppProtocol, FriendlyErrorPages, SpawnMethod};
use crate::pool::Options;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Defaults for every application
    #[serde(default)]
    pub defaults: AppDefaults,

    /// Applications by hostname
    #[serde(default)]
    pub apps: HashMap<String, AppConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the TCP listener (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// TCP port (default: 3000, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Unix socket for a local front-end; its peers are trusted
    pub unix_socket: Option<String>,

    /// Port for the admin API (default: 9999, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Unix socket for the admin API, authenticated by peer uid
    pub admin_socket: Option<String>,

    /// Bearer key for the admin API.
    /// If not set, a random key is generated at startup and logged
    pub api_key: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Event-loop threads (default: available parallelism)
    pub controller_threads: Option<u64>,

    /// Maximum number of worker processes across all applications
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u64,

    /// Idle processes above their group minimum are stopped after this many seconds
    #[serde(default = "default_pool_idle_time")]
    pub pool_idle_time_secs: u64,

    /// Busy detached processes are killed after this many seconds
    #[serde(default = "default_detach_grace_period")]
    pub detach_grace_period_secs: u64,

    #[serde(default = "default_true")]
    pub turbocaching: bool,

    /// TCP peers presenting this in `!~secure-headers-password` become trusted
    pub secure_headers_password: Option<String>,

    /// "debug" (default) or any tracing level
    pub log_level: Option<String>,

    /// Seconds to wait for sessions to drain on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL for workers
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Preloaders idle this long are stopped
    #[serde(default = "default_max_preloader_idle_time")]
    pub max_preloader_idle_time_secs: u64,

    /// Where spawn work directories go (default: system temp dir)
    pub work_dir_root: Option<String>,

    #[serde(default)]
    pub keep_work_dirs: bool,

    // Live tunables; unset means the store default
    pub body_buffer_threshold: Option<u64>,
    pub max_session_checkout_try: Option<u64>,
    pub heuristic_freshness_floor_secs: Option<u64>,
    /// How long the turbocache keeps responses that carry no freshness information
    pub default_freshness_secs: Option<u64>,
    pub sticky_sessions_cookie_name: Option<String>,
    pub stat_throttle_rate_secs: Option<u64>,
    pub default_friendly_error_pages: Option<String>,
    #[serde(default)]
    pub self_checking: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            unix_socket: None,
            admin_port: default_admin_port(),
            admin_socket: None,
            api_key: None,
            pid_file: None,
            controller_threads: None,
            max_pool_size: default_max_pool_size(),
            pool_idle_time_secs: default_pool_idle_time(),
            detach_grace_period_secs: default_detach_grace_period(),
            turbocaching: true,
            secure_headers_password: None,
            log_level: None,
            drain_timeout_secs: default_drain_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            max_preloader_idle_time_secs: default_max_preloader_idle_time(),
            work_dir_root: None,
            keep_work_dirs: false,
            body_buffer_threshold: None,
            max_session_checkout_try: None,
            heuristic_freshness_floor_secs: None,
            default_freshness_secs: None,
            sticky_sessions_cookie_name: None,
            stat_throttle_rate_secs: None,
            default_friendly_error_pages: None,
            self_checking: false,
        }
    }
}

impl ServerConfig {
    /// Value of the read-only `listen_address` store key
    pub fn listen_address(&self) -> String {
        match (&self.unix_socket, self.port) {
            (Some(path), 0) => format!("unix:{}", path),
            (Some(path), port) => format!("tcp://{}:{},unix:{}", self.bind, port, path),
            (None, port) => format!("tcp://{}:{}", self.bind, port),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn spawning_kit(&self) -> SpawningKitConfig {
        SpawningKitConfig {
            work_dir_root: self.work_dir_root.as_ref().map(PathBuf::from),
            keep_work_dirs: self.keep_work_dirs,
            shutdown_grace_period: Duration::from_secs(self.shutdown_grace_period_secs),
            max_preloader_idle_time: Duration::from_secs(self.max_preloader_idle_time_secs),
            ..SpawningKitConfig::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_app_type")]
    pub app_type: String,

    /// "direct" (default) or "smart"
    #[serde(default = "default_spawn_method")]
    pub spawn_method: String,

    /// "generic" (default) or "handshake"
    #[serde(default = "default_app_protocol")]
    pub app_protocol: String,

    #[serde(default = "default_min_processes")]
    pub min_processes: usize,

    /// 0 = unlimited
    #[serde(default)]
    pub max_processes: usize,

    /// 0 = unbounded
    #[serde(default = "default_max_request_queue_size")]
    pub max_request_queue_size: usize,

    /// Seconds a request may wait for a worker before getting a 504; 0 = forever
    #[serde(default)]
    pub max_request_queue_time_secs: u64,

    /// 0 = never recycle
    #[serde(default)]
    pub max_requests: u64,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Falls back to the server's `stat_throttle_rate`
    pub stat_throttle_rate_secs: Option<u64>,

    #[serde(default)]
    pub sticky_sessions: bool,

    /// "auto" | "true" | "false"; falls back to the server's `default_friendly_error_pages`
    pub friendly_error_pages: Option<String>,

    #[serde(default = "default_overflow_status")]
    pub request_queue_overflow_status_code: u16,

    #[serde(default)]
    pub buffer_request_body: bool,

    #[serde(default)]
    pub load_shell_envvars: bool,

    pub file_descriptor_ulimit: Option<u64>,

    pub max_concurrent_requests_per_process: Option<usize>,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            app_type: default_app_type(),
            spawn_method: default_spawn_method(),
            app_protocol: default_app_protocol(),
            min_processes: default_min_processes(),
            max_processes: 0,
            max_request_queue_size: default_max_request_queue_size(),
            max_request_queue_time_secs: 0,
            max_requests: 0,
            start_timeout_secs: default_start_timeout(),
            stat_throttle_rate_secs: None,
            sticky_sessions: false,
            friendly_error_pages: None,
            request_queue_overflow_status_code: default_overflow_status(),
            buffer_request_body: false,
            load_shell_envvars: false,
            file_descriptor_ulimit: None,
            max_concurrent_requests_per_process: None,
        }
    }
}

/// Configuration for a single application
///
/// # Security Warning
///
/// `start_command` is run through `/bin/sh`. Configuration files must be
/// protected with appropriate file permissions; whoever can write them can
/// run arbitrary code as the supervisor (or as `user`, when running as root).
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub app_root: String,
    pub start_command: String,
    pub startup_file: Option<String>,
    pub app_type: Option<String>,
    pub app_protocol: Option<String>,
    /// Only honoured when the supervisor runs as root
    pub user: Option<String>,
    pub group: Option<String>,
    /// Lets this key inspect and restart this application through the admin API
    pub api_key: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub environment: Option<String>,
    pub spawn_method: Option<String>,
    pub min_processes: Option<usize>,
    pub max_processes: Option<usize>,
    pub max_request_queue_size: Option<usize>,
    pub max_request_queue_time_secs: Option<u64>,
    pub max_requests: Option<u64>,
    pub start_timeout_secs: Option<u64>,
    pub stat_throttle_rate_secs: Option<u64>,
    pub sticky_sessions: Option<bool>,
    pub friendly_error_pages: Option<String>,
    pub request_queue_overflow_status_code: Option<u16>,
    pub buffer_request_body: Option<bool>,
    pub load_shell_envvars: Option<bool>,
    pub file_descriptor_ulimit: Option<u64>,
    pub max_concurrent_requests_per_process: Option<usize>,
}

impl AppConfig {
    pub fn new(app_root: &str, start_command: &str) -> Self {
        Self {
            app_root: app_root.to_string(),
            start_command: start_command.to_string(),
            startup_file: None,
            app_type: None,
            app_protocol: None,
            user: None,
            group: None,
            api_key: None,
            env: BTreeMap::new(),
            environment: None,
            spawn_method: None,
            min_processes: None,
            max_processes: None,
            max_request_queue_size: None,
            max_request_queue_time_secs: None,
            max_requests: None,
            start_timeout_secs: None,
            stat_throttle_rate_secs: None,
            sticky_sessions: None,
            friendly_error_pages: None,
            request_queue_overflow_status_code: None,
            buffer_request_body: None,
            load_shell_envvars: None,
            file_descriptor_ulimit: None,
            max_concurrent_requests_per_process: None,
        }
    }

    pub fn environment<'a>(&'a self, defaults: &'a AppDefaults) -> &'a str {
        self.environment.as_deref().unwrap_or(&defaults.environment)
    }

    pub fn spawn_method<'a>(&'a self, defaults: &'a AppDefaults) -> &'a str {
        self.spawn_method.as_deref().unwrap_or(&defaults.spawn_method)
    }

    pub fn app_protocol<'a>(&'a self, defaults: &'a AppDefaults) -> &'a str {
        self.app_protocol.as_deref().unwrap_or(&defaults.app_protocol)
    }

    pub fn min_processes(&self, defaults: &AppDefaults) -> usize {
        self.min_processes.unwrap_or(defaults.min_processes)
    }

    pub fn max_processes(&self, defaults: &AppDefaults) -> usize {
        self.max_processes.unwrap_or(defaults.max_processes)
    }

    pub fn start_timeout(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_secs(self.start_timeout_secs.unwrap_or(defaults.start_timeout_secs))
    }

    pub fn request_queue_overflow_status_code(&self, defaults: &AppDefaults) -> u16 {
        self.request_queue_overflow_status_code
            .unwrap_or(defaults.request_queue_overflow_status_code)
    }

    pub fn friendly_error_pages<'a>(&'a self, defaults: &'a AppDefaults) -> Option<&'a str> {
        self.friendly_error_pages
            .as_deref()
            .or(defaults.friendly_error_pages.as_deref())
    }

    /// Resolve against the file defaults and the live store values
    pub fn to_options(&self, defaults: &AppDefaults, store: &Map<String, Value>) -> Options {
        let store_uint = |key: &str| store.get(key).and_then(Value::as_u64);

        let mut options = Options::new(&self.app_root, &self.start_command);
        options.environment = self.environment(defaults).to_string();
        options.app_type = self
            .app_type
            .clone()
            .unwrap_or_else(|| defaults.app_type.clone());
        options.startup_file = self.startup_file.clone();
        options.user = self.user.clone();
        options.group = self.group.clone();
        options.spawn_method = SpawnMethod::parse(self.spawn_method(defaults)).unwrap_or(SpawnMethod::Direct);
        options.app_protocol = AppProtocol::parse(self.app_protocol(defaults)).unwrap_or(AppProtocol::Generic);
        options.env = self.env.clone();
        options.min_processes = self.min_processes(defaults);
        options.max_processes = self.max_processes(defaults);
        options.max_request_queue_size = self
            .max_request_queue_size
            .unwrap_or(defaults.max_request_queue_size);
        options.max_request_queue_time = Duration::from_secs(
            self.max_request_queue_time_secs
                .unwrap_or(defaults.max_request_queue_time_secs),
        );
        options.max_requests = self.max_requests.unwrap_or(defaults.max_requests);
        options.start_timeout = self.start_timeout(defaults);
        options.stat_throttle_rate = Duration::from_secs(
            self.stat_throttle_rate_secs
                .or(defaults.stat_throttle_rate_secs)
                .or_else(|| store_uint("stat_throttle_rate"))
                .unwrap_or(10),
        );
        options.sticky_sessions = self.sticky_sessions.unwrap_or(defaults.sticky_sessions);
        options.friendly_error_pages = self
            .friendly_error_pages(defaults)
            .or_else(|| store.get("default_friendly_error_pages").and_then(Value::as_str))
            .and_then(FriendlyErrorPages::parse)
            .unwrap_or(FriendlyErrorPages::Auto);
        options.request_queue_overflow_status_code = self.request_queue_overflow_status_code(defaults);
        options.buffer_request_body = self.buffer_request_body.unwrap_or(defaults.buffer_request_body);
        options.load_shell_envvars = self.load_shell_envvars.unwrap_or(defaults.load_shell_envvars);
        options.file_descriptor_ulimit = self.file_descriptor_ulimit.or(defaults.file_descriptor_ulimit);
        options.max_concurrent_requests_per_process = self
            .max_concurrent_requests_per_process
            .or(defaults.max_concurrent_requests_per_process);
        options.api_key = self.api_key.clone();
        options
    }

    /// Validate the application configuration
    pub fn validate(&self, hostname: &str, defaults: &AppDefaults) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_root.trim().is_empty() {
            errors.push(format!("App '{}': 'app_root' must not be empty", hostname));
        }
        if self.start_command.trim().is_empty() {
            errors.push(format!("App '{}': 'start_command' must not be empty", hostname));
        } else if let Err(e) = shell_words::split(&self.start_command) {
            errors.push(format!("App '{}': 'start_command' cannot be parsed: {}", hostname, e));
        }
        if SpawnMethod::parse(self.spawn_method(defaults)).is_none() {
            errors.push(format!(
                "App '{}': unknown spawn_method '{}' (expected direct or smart)",
                hostname,
                self.spawn_method(defaults)
            ));
        }
        if AppProtocol::parse(self.app_protocol(defaults)).is_none() {
            errors.push(format!(
                "App '{}': unknown app_protocol '{}' (expected generic or handshake)",
                hostname,
                self.app_protocol(defaults)
            ));
        }
        if let Some(value) = self.friendly_error_pages(defaults) {
            if FriendlyErrorPages::parse(value).is_none() {
                errors.push(format!(
                    "App '{}': friendly_error_pages must be auto, true or false",
                    hostname
                ));
            }
        }
        let max = self.max_processes(defaults);
        if max > 0 && self.min_processes(defaults) > max {
            errors.push(format!(
                "App '{}': min_processes ({}) exceeds max_processes ({})",
                hostname,
                self.min_processes(defaults),
                max
            ));
        }
        if StatusCode::from_u16(self.request_queue_overflow_status_code(defaults)).is_err() {
            errors.push(format!(
                "App '{}': request_queue_overflow_status_code is not a valid HTTP status",
                hostname
            ));
        }
        if self.start_timeout(defaults).is_zero() {
            errors.push(format!("App '{}': 'start_timeout_secs' must be greater than 0", hostname));
        }

        errors
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_admin_port() -> u16 {
    9999
}

fn default_max_pool_size() -> u64 {
    6
}

fn default_pool_idle_time() -> u64 {
    300 // 5 minutes
}

fn default_detach_grace_period() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5 // SIGTERM, then SIGKILL after 5 seconds
}

fn default_max_preloader_idle_time() -> u64 {
    300
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_app_type() -> String {
    "generic".to_string()
}

fn default_spawn_method() -> String {
    "direct".to_string()
}

fn default_app_protocol() -> String {
    "generic".to_string()
}

fn default_min_processes() -> usize {
    1
}

fn default_max_request_queue_size() -> usize {
    100
}

fn default_start_timeout() -> u64 {
    90
}

fn default_overflow_status() -> u16 {
    503
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.max_pool_size == 0 {
            errors.push("Server: 'max_pool_size' must be at least 1".to_string());
        }
        if self.server.controller_threads == Some(0) {
            errors.push("Server: 'controller_threads' must be at least 1".to_string());
        }
        if self.server.port == 0 && self.server.unix_socket.is_none() {
            errors.push("Server: either 'port' or 'unix_socket' must be set".to_string());
        }
        if let Some(level) = &self.server.log_level {
            if level.parse::<tracing::Level>().is_err() {
                errors.push(format!("Server: unknown log_level '{}'", level));
            }
        }

        for (hostname, app) in &self.apps {
            if hostname.is_empty()
                || !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                errors.push(format!("App '{}': not a valid hostname", hostname));
            }
            errors.extend(app.validate(hostname, &self.defaults));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Store updates for the server-level tunables. Unset optional keys are
    /// sent as null so that a reload reverts them to their defaults.
    pub fn store_updates(&self) -> Map<String, Value> {
        let server = &self.server;
        let optional = |v: Option<Value>| v.unwrap_or(Value::Null);

        let mut updates = Map::new();
        updates.insert("listen_address".into(), Value::from(server.listen_address()));
        if let Some(threads) = server.controller_threads {
            updates.insert("controller_threads".into(), Value::from(threads));
        }
        updates.insert("max_pool_size".into(), Value::from(server.max_pool_size));
        updates.insert("pool_idle_time".into(), Value::from(server.pool_idle_time_secs));
        updates.insert("detach_grace_period".into(), Value::from(server.detach_grace_period_secs));
        updates.insert("turbocaching".into(), Value::Bool(server.turbocaching));
        updates.insert("self_checking".into(), Value::Bool(server.self_checking));
        updates.insert("api_key".into(), optional(server.api_key.clone().map(Value::from)));
        updates.insert(
            "secure_headers_password".into(),
            optional(server.secure_headers_password.clone().map(Value::from)),
        );
        updates.insert(
            "body_buffer_threshold".into(),
            optional(server.body_buffer_threshold.map(Value::from)),
        );
        updates.insert(
            "max_session_checkout_try".into(),
            optional(server.max_session_checkout_try.map(Value::from)),
        );
        updates.insert(
            "heuristic_freshness_floor".into(),
            optional(server.heuristic_freshness_floor_secs.map(Value::from)),
        );
        updates.insert(
            "default_freshness".into(),
            optional(server.default_freshness_secs.map(Value::from)),
        );
        updates.insert(
            "sticky_sessions_cookie_name".into(),
            optional(server.sticky_sessions_cookie_name.clone().map(Value::from)),
        );
        updates.insert(
            "stat_throttle_rate".into(),
            optional(server.stat_throttle_rate_secs.map(Value::from)),
        );
        updates.insert(
            "default_friendly_error_pages".into(),
            optional(server.default_friendly_error_pages.clone().map(Value::from)),
        );
        updates
    }

    /// Resolved options for every application, keyed by lower-cased hostname
    pub fn app_options(&self, store: &Map<String, Value>) -> HashMap<String, Options> {
        self.apps
            .iter()
            .map(|(hostname, app)| (hostname.to_lowercase(), app.to_options(&self.defaults, store)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{server_schema, ConfigStore};

    fn store_values(config: &Config) -> Map<String, Value> {
        let store = ConfigStore::new(server_schema());
        store.prepare(&config.store_updates()).unwrap().effective().clone()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
max_pool_size = 4
secure_headers_password = "front"

[defaults]
environment = "staging"
max_processes = 3

[apps."example.com"]
app_root = "/srv/example"
start_command = "ruby start.rb"
startup_file = "start.rb"
env = { RAILS_ENV = "production" }

[apps."api.example.com"]
app_root = "/srv/api"
start_command = "./server"
spawn_method = "smart"
app_protocol = "handshake"
max_processes = 1
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_pool_size, 4);
        assert_eq!(config.defaults.environment, "staging");
        assert_eq!(config.apps.len(), 2);

        let apps = config.app_options(&store_values(&config));
        let example = &apps["example.com"];
        assert_eq!(example.environment, "staging");
        assert_eq!(example.max_processes, 3);
        assert_eq!(example.startup_file.as_deref(), Some("start.rb"));
        assert_eq!(example.env.get("RAILS_ENV").map(String::as_str), Some("production"));

        let api = &apps["api.example.com"];
        assert_eq!(api.spawn_method, SpawnMethod::Smart);
        assert_eq!(api.app_protocol, AppProtocol::Handshake);
        assert_eq!(api.max_processes, 1);
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.admin_port, 9999);
        assert_eq!(config.max_pool_size, 6);
        assert_eq!(config.pool_idle_time_secs, 300);
        assert!(config.turbocaching);
        assert_eq!(config.listen_address(), "tcp://127.0.0.1:3000");
    }

    #[test]
    fn test_listen_address_with_unix_socket() {
        let mut server = ServerConfig {
            unix_socket: Some("/run/appgate.sock".into()),
            ..ServerConfig::default()
        };
        assert_eq!(
            server.listen_address(),
            "tcp://127.0.0.1:3000,unix:/run/appgate.sock"
        );
        server.port = 0;
        assert_eq!(server.listen_address(), "unix:/run/appgate.sock");
    }

    #[test]
    fn test_app_uses_defaults() {
        let defaults = AppDefaults::default();
        let app = AppConfig::new("/srv/app", "./run");
        let options = app.to_options(&defaults, &Map::new());

        assert_eq!(options.environment, "production");
        assert_eq!(options.min_processes, 1);
        assert_eq!(options.max_processes, 0);
        assert_eq!(options.max_request_queue_size, 100);
        assert_eq!(options.max_request_queue_time, Duration::ZERO);
        assert_eq!(options.start_timeout, Duration::from_secs(90));
        assert_eq!(options.stat_throttle_rate, Duration::from_secs(10));
        assert_eq!(options.request_queue_overflow_status_code, 503);
        assert_eq!(options.friendly_error_pages, FriendlyErrorPages::Auto);
    }

    #[test]
    fn test_app_overrides_defaults() {
        let defaults = AppDefaults::default();
        let app: AppConfig = toml::from_str(
            r#"
app_root = "/srv/app"
start_command = "./run"
environment = "development"
min_processes = 0
max_request_queue_size = 1
max_request_queue_time_secs = 20
stat_throttle_rate_secs = 0
friendly_error_pages = "false"
request_queue_overflow_status_code = 529
sticky_sessions = true
"#,
        )
        .unwrap();
        let options = app.to_options(&defaults, &Map::new());

        assert_eq!(options.environment, "development");
        assert_eq!(options.min_processes, 0);
        assert_eq!(options.max_request_queue_size, 1);
        assert_eq!(options.max_request_queue_time, Duration::from_secs(20));
        assert_eq!(options.stat_throttle_rate, Duration::ZERO);
        assert_eq!(options.friendly_error_pages, FriendlyErrorPages::Off);
        assert_eq!(options.request_queue_overflow_status_code, 529);
        assert!(options.sticky_sessions);
    }

    #[test]
    fn test_store_values_fill_unset_app_settings() {
        let config: Config = toml::from_str(
            r#"
[server]
stat_throttle_rate_secs = 3
default_friendly_error_pages = "TRUE"

[apps."a.test"]
app_root = "/srv/a"
start_command = "./a"
"#,
        )
        .unwrap();
        let apps = config.app_options(&store_values(&config));
        assert_eq!(apps["a.test"].stat_throttle_rate, Duration::from_secs(3));
        assert_eq!(apps["a.test"].friendly_error_pages, FriendlyErrorPages::On);
    }

    #[test]
    fn test_store_updates_accepted_by_schema() {
        let config: Config = toml::from_str(
            r#"
[server]
api_key = "k"
controller_threads = 2
"#,
        )
        .unwrap();
        let values = store_values(&config);
        assert_eq!(values["listen_address"], "tcp://127.0.0.1:3000");
        assert_eq!(values["controller_threads"], 2);
        assert_eq!(values["api_key"], "k");
        assert_eq!(values["max_session_checkout_try"], 10);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.apps.is_empty());
        assert_eq!(config.server.port, 3000);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_multiple_errors() {
        let config: Config = toml::from_str(
            r#"
[server]
max_pool_size = 0
log_level = "loud"

[apps."bad_host"]
app_root = ""
start_command = "./run 'unterminated"
spawn_method = "forky"

[apps."ok.test"]
app_root = "/srv/ok"
start_command = "./run"
min_processes = 5
max_processes = 2
request_queue_overflow_status_code = 42
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_pool_size"));
        assert!(err.contains("log_level"));
        assert!(err.contains("not a valid hostname"));
        assert!(err.contains("'app_root' must not be empty"));
        assert!(err.contains("'start_command' cannot be parsed"));
        assert!(err.contains("unknown spawn_method 'forky'"));
        assert!(err.contains("min_processes (5) exceeds max_processes (2)"));
        assert!(err.contains("not a valid HTTP status"));
    }

    #[test]
    fn test_spawning_kit_settings() {
        let server = ServerConfig {
            shutdown_grace_period_secs: 2,
            keep_work_dirs: true,
            ..ServerConfig::default()
        };
        let kit = server.spawning_kit();
        assert_eq!(kit.shutdown_grace_period, Duration::from_secs(2));
        assert!(kit.keep_work_dirs);
        assert_eq!(kit.max_preloader_idle_time, Duration::from_secs(300));
    }
}
