use appgate::admin::{AdminServer, PKG_NAME, VERSION};
use appgate::config::Config;
use appgate::event_loop::{EventLoops, Listeners};
use appgate::server::Server;
use appgate::spawning::env_setupper::{self, Phase};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;

const USAGE: &str = "usage: appgate [config.toml]\n       appgate spawn-env-setupper <work_dir> --before|--after";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Runs inside a spawned child; must not start a runtime or touch logging
    if args.get(1).map(String::as_str) == Some("spawn-env-setupper") {
        let code = match (args.get(2), args.get(3).and_then(|flag| Phase::parse(flag))) {
            (Some(work_dir), Some(phase)) => env_setupper::run(Path::new(work_dir), phase),
            _ => {
                eprintln!("{}", USAGE);
                1
            }
        };
        std::process::exit(code);
    }

    if matches!(args.get(1).map(String::as_str), Some("-h") | Some("--help")) {
        println!("{}", USAGE);
        return;
    }

    let config_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // The log level lives in the configuration file, so load it first
    let config = Config::load(&config_path);
    let level = config
        .as_ref()
        .ok()
        .and_then(|c| c.server.log_level.clone())
        .unwrap_or_else(|| "debug".to_string());

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("appgate={}", level)
                    .parse::<Directive>()
                    .unwrap_or_else(|_| "appgate=debug".parse().expect("valid log directive")),
            ),
        )
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(path = %config_path.display(), "Configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(supervise(config_path, config)) {
        error!(error = %e, "Supervisor failed");
        std::process::exit(1);
    }
}

async fn supervise(config_path: PathBuf, mut config: Config) -> anyhow::Result<()> {
    appgate::os::ignore_sigpipe();

    // Generate or use configured admin key
    let generated_key = if config.server.api_key.is_none() {
        let key = uuid::Uuid::new_v4().simple().to_string();
        info!(api_key = %key, "Generated admin API key (configure api_key to set a fixed value)");
        config.server.api_key = Some(key.clone());
        Some(key)
    } else {
        None
    };

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let drain_timeout = config.server.drain_timeout();
    let listeners = Listeners::bind(&config.server)?;
    let admin_addr = if config.server.admin_port > 0 {
        let addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;
        Some(addr)
    } else {
        None
    };
    let admin_socket = config.server.admin_socket.as_ref().map(PathBuf::from);

    let server = Server::new(config)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let event_loops = EventLoops::start(&server, &listeners, shutdown_rx.clone(), drain_timeout)?;

    let admin_handle = if admin_addr.is_some() || admin_socket.is_some() {
        let admin = AdminServer::new(admin_addr, admin_socket, Arc::clone(&server), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    tokio::spawn(Arc::clone(&server).gc_loop(shutdown_rx.clone()));

    wait_for_shutdown(&server, &config_path, generated_key.as_deref()).await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    server.shutdown(drain_timeout).await;

    let _ = tokio::task::spawn_blocking(move || event_loops.join()).await;
    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    drop(listeners);

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, reloading the configuration on SIGHUP
async fn wait_for_shutdown(server: &Server, config_path: &Path, generated_key: Option<&str>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sighup.recv() => {
                info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                reload_config(server, config_path, generated_key);
            }
        }
    }
}

fn reload_config(server: &Server, config_path: &Path, generated_key: Option<&str>) {
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };
    if config.server.api_key.is_none() {
        config.server.api_key = generated_key.map(String::from);
    }

    match server.reload(config) {
        Ok(result) => {
            info!(
                added = result.added.len(),
                removed = result.removed.len(),
                updated = result.updated.len(),
                "Configuration reloaded successfully"
            );
            if !result.added.is_empty() {
                info!(apps = ?result.added, "New applications available");
            }
            if !result.removed.is_empty() {
                info!(apps = ?result.removed, "Applications removed");
            }
        }
        Err(errors) => {
            for e in errors {
                error!(error = %e, "Configuration rejected; keeping the previous one");
            }
        }
    }
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting application supervisor");
    info!(
        listen = %config.server.listen_address(),
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        admin_socket = ?config.server.admin_socket,
        controller_threads = ?config.server.controller_threads,
        "Server configuration"
    );
    info!(
        max_pool_size = config.server.max_pool_size,
        pool_idle_time_secs = config.server.pool_idle_time_secs,
        detach_grace_period_secs = config.server.detach_grace_period_secs,
        turbocaching = config.server.turbocaching,
        "Pool settings"
    );
    info!(
        environment = %config.defaults.environment,
        spawn_method = %config.defaults.spawn_method,
        min_processes = config.defaults.min_processes,
        max_request_queue_size = config.defaults.max_request_queue_size,
        start_timeout_secs = config.defaults.start_timeout_secs,
        "Application defaults"
    );
    info!(
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        "Shutdown settings"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.keys().collect::<Vec<_>>(),
        "Configured applications"
    );
}
