//! Supervisor wiring
//!
//! Owns the configuration store, the pool, the host table and every
//! controller. Configuration changes, from a reloaded file or from the
//! admin endpoint, go through the store's two-phase protocol: the change is
//! validated and every derived value computed before anything is swapped in.

use crate::config::Config;
use crate::config_store::{server_schema, ConfigError, ConfigStore, PreparedChange};
use crate::context::Context;
use crate::controller::{Controller, ControllerSettings, ControllerSnapshot, SharedApps};
use crate::pool::{Options, Pool, PoolTuning};
use crate::spawning::SpawnerFactory;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the garbage collector runs
const GC_INTERVAL: Duration = Duration::from_secs(10);

/// Result of applying a configuration change
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

/// A configuration change that passed validation
struct PreparedReload {
    change: PreparedChange,
    apps: HashMap<String, Options>,
    tuning: PoolTuning,
    settings: ControllerSettings,
}

pub struct Server {
    store: Mutex<ConfigStore>,
    /// Last loaded configuration file; app options are resolved against it
    config: Mutex<Config>,
    pool: Arc<Pool>,
    apps: SharedApps,
    controllers: RwLock<Vec<Arc<Controller>>>,
}

/// Pool tuning from effective store values
pub fn pool_tuning(values: &Map<String, Value>) -> PoolTuning {
    let defaults = PoolTuning::default();
    let secs = |key: &str, default: Duration| {
        values
            .get(key)
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(default)
    };

    PoolTuning {
        max: values
            .get("max_pool_size")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(defaults.max),
        max_idle_time: secs("pool_idle_time", defaults.max_idle_time),
        detach_grace_period: secs("detach_grace_period", defaults.detach_grace_period),
        group_quiet_period: secs("group_quiet_period", defaults.group_quiet_period),
        self_checking: values
            .get("self_checking")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.self_checking),
    }
}

fn config_errors(errors: Vec<ConfigError>) -> anyhow::Error {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    anyhow::anyhow!("Configuration errors:\n  - {}", messages.join("\n  - "))
}

/// Options differ in a way a running group should pick up
fn options_changed(old: &Options, new: &Options) -> bool {
    old.api_key != new.api_key
        || serde_json::to_value(old).ok() != serde_json::to_value(new).ok()
}

impl Server {
    /// Build the store, the pool and the host table from a loaded configuration.
    /// Must be called inside the runtime that runs pool background work.
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let ctx = Context::new(tokio::runtime::Handle::current(), config.server.spawning_kit());
        Self::with_factory(config, SpawnerFactory::new(ctx))
    }

    pub fn with_factory(config: Config, factory: SpawnerFactory) -> anyhow::Result<Arc<Self>> {
        let mut store = ConfigStore::new(server_schema());
        let prepared = Self::prepare_with(&store, &config, &config.store_updates()).map_err(config_errors)?;

        let pool = Pool::new(factory, prepared.tuning.clone());
        let apps: SharedApps = Arc::new(RwLock::new(prepared.apps));
        store.commit(prepared.change);

        Ok(Arc::new(Self {
            store: Mutex::new(store),
            config: Mutex::new(config),
            pool,
            apps,
            controllers: RwLock::new(Vec::new()),
        }))
    }

    fn prepare_with(
        store: &ConfigStore,
        config: &Config,
        updates: &Map<String, Value>,
    ) -> Result<PreparedReload, Vec<ConfigError>> {
        let change = store.prepare(updates)?;
        let effective = change.effective();
        Ok(PreparedReload {
            apps: config.app_options(effective),
            tuning: pool_tuning(effective),
            settings: ControllerSettings::from_values(effective),
            change,
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn apps(&self) -> &SharedApps {
        &self.apps
    }

    /// Number of event-loop threads to run
    pub fn controller_threads(&self) -> usize {
        self.store
            .lock()
            .get_u64("controller_threads")
            .map(|n| n.max(1) as usize)
            .unwrap_or(1)
    }

    /// The admin bearer key
    pub fn api_key(&self) -> Option<String> {
        self.store.lock().get_string("api_key")
    }

    /// Create and register the controller for one event-loop thread
    pub fn create_controller(&self, thread_number: usize) -> Arc<Controller> {
        let settings = {
            let store = self.store.lock();
            ControllerSettings::from_values(&store.effective())
        };
        let controller = Controller::new(thread_number, Arc::clone(&self.pool), Arc::clone(&self.apps), settings);
        self.controllers.write().push(Arc::clone(&controller));
        controller
    }

    pub fn controller_snapshots(&self) -> Vec<ControllerSnapshot> {
        self.controllers.read().iter().map(|c| c.snapshot()).collect()
    }

    pub fn active_requests(&self) -> usize {
        self.controllers.read().iter().map(|c| c.active_requests()).sum()
    }

    /// Apply a freshly loaded configuration file
    pub fn reload(&self, config: Config) -> Result<ReloadResult, Vec<ConfigError>> {
        let mut current = self.config.lock();
        let result = {
            let store = self.store.lock();
            Self::prepare_with(&store, &config, &config.store_updates())?
        };
        *current = config;
        Ok(self.apply(result))
    }

    /// Apply store updates submitted through the admin endpoint
    pub fn update_settings(&self, updates: &Map<String, Value>) -> Result<ReloadResult, Vec<ConfigError>> {
        let current = self.config.lock();
        let prepared = {
            let store = self.store.lock();
            Self::prepare_with(&store, &current, updates)?
        };
        Ok(self.apply(prepared))
    }

    /// Commit a validated change. Nothing in here can fail.
    fn apply(&self, prepared: PreparedReload) -> ReloadResult {
        let PreparedReload {
            change,
            apps,
            tuning,
            settings,
        } = prepared;

        self.store.lock().commit(change);
        self.pool.set_tuning(tuning);
        for controller in self.controllers.read().iter() {
            controller.apply_settings(settings.clone());
        }

        let old = std::mem::replace(&mut *self.apps.write(), apps.clone());
        let mut result = ReloadResult::default();

        for (host, old_options) in &old {
            match apps.get(host) {
                Some(new_options) if new_options.identity() == old_options.identity() => {
                    if options_changed(old_options, new_options) {
                        self.pool.reconfigure_group(new_options);
                        result.updated.push(host.clone());
                    }
                }
                other => {
                    // No longer routed here: let the garbage collector retire the group
                    let mut retired = old_options.clone();
                    retired.min_processes = 0;
                    self.pool.reconfigure_group(&retired);
                    if other.is_some() {
                        result.updated.push(host.clone());
                    } else {
                        result.removed.push(host.clone());
                    }
                }
            }
        }
        result.added = apps.keys().filter(|h| !old.contains_key(*h)).cloned().collect();
        result.added.sort();
        result.removed.sort();
        result.updated.sort();
        result
    }

    /// `/server.json`: store contents (secrets masked), hosts and controller counters
    pub fn inspect(&self) -> Value {
        let mut hosts: Vec<String> = self.apps.read().keys().cloned().collect();
        hosts.sort();
        serde_json::json!({
            "config": self.store.lock().inspect(),
            "apps": hosts,
            "controllers": self.controller_snapshots(),
        })
    }

    /// Periodic pool maintenance until shutdown
    pub async fn gc_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(GC_INTERVAL) => {
                    self.pool.garbage_collect().await;
                    let evicted: usize = self
                        .controllers
                        .read()
                        .iter()
                        .map(|c| c.evict_idle_connections())
                        .sum();
                    if evicted > 0 {
                        debug!(evicted, "Closed idle worker connections");
                    }
                    if self.pool.tuning().self_checking {
                        let violations = self.pool.verify_invariants();
                        if !violations.is_empty() {
                            warn!(count = violations.len(), "Pool self-check found violations");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Stop the pool, letting open sessions drain for up to `drain_timeout`
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!(active_requests = self.active_requests(), "Stopping application pool");
        self.pool.shutdown(drain_timeout).await;
    }
}
