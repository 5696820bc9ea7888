//! Per-application process groups

use super::options::{ApplicationIdentity, Options};
use super::process::{EnabledStatus, Process, ProcessSnapshot};
use super::{DisableCallback, DisableResult, GetCallback};
use crate::spawning::{SocketInfo, SpawnError, Spawner};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupLife {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// A request waiting for a session
pub(crate) struct GetWaiter {
    /// Lets a caller that stopped waiting take its entry back out of the queue
    pub id: u64,
    pub options: Options,
    pub sticky: Option<String>,
    pub callback: GetCallback,
}

pub(crate) struct DisableWaiter {
    pub gupid: String,
    pub callback: DisableCallback,
}

/// What a new session needs to know about the process it was opened on
pub(crate) struct Checkout {
    pub gupid: String,
    pub pid: u32,
    pub socket: SocketInfo,
}

/// All processes of one application plus the requests waiting for them
pub struct Group {
    pub(crate) identity: ApplicationIdentity,
    pub(crate) options: Options,
    pub(crate) spawner: Arc<Spawner>,
    pub(crate) life: GroupLife,

    pub(crate) enabled: Vec<Process>,
    pub(crate) disabling: Vec<Process>,
    pub(crate) disabled: Vec<Process>,
    pub(crate) detached: Vec<Process>,

    pub(crate) get_waitlist: VecDeque<GetWaiter>,
    pub(crate) disable_waitlist: Vec<DisableWaiter>,

    pub(crate) restarts_initiated: u64,
    pub(crate) restarting: bool,
    pub(crate) processes_being_spawned: usize,
    pub(crate) spawn_task: Option<JoinHandle<()>>,
    pub(crate) last_spawn_error: Option<Arc<SpawnError>>,
    pub(crate) processes_spawned: u64,
    pub(crate) spawn_failures: u64,
    pub(crate) empty_since: Option<Duration>,
}

impl Group {
    pub(crate) fn new(options: Options, spawner: Arc<Spawner>) -> Self {
        Self {
            identity: options.identity(),
            options,
            spawner,
            life: GroupLife::Alive,
            enabled: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            detached: Vec::new(),
            get_waitlist: VecDeque::new(),
            disable_waitlist: Vec::new(),
            restarts_initiated: 0,
            restarting: false,
            processes_being_spawned: 0,
            spawn_task: None,
            last_spawn_error: None,
            processes_spawned: 0,
            spawn_failures: 0,
            empty_since: None,
        }
    }

    pub fn name(&self) -> String {
        self.identity.name()
    }

    /// Processes counted against the pool's maximum, including the one being spawned
    pub fn capacity_used(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.disabled.len() + self.processes_being_spawned
    }

    pub fn is_spawning(&self) -> bool {
        self.processes_being_spawned > 0
    }

    pub fn upper_limit_reached(&self) -> bool {
        self.options.max_processes != 0 && self.capacity_used() >= self.options.max_processes
    }

    pub fn all_enabled_at_full_capacity(&self) -> bool {
        !self.enabled.is_empty() && self.enabled.iter().all(|p| p.at_full_capacity())
    }

    /// Below the minimum, requests waiting, or every worker busy
    pub fn wants_more_processes(&self) -> bool {
        self.life == GroupLife::Alive
            && !self.restarting
            && (self.capacity_used() < self.options.min_processes
                || !self.get_waitlist.is_empty()
                || self.all_enabled_at_full_capacity())
            && !self.upper_limit_reached()
    }

    /// Nothing left worth keeping the group around for
    pub fn is_quiet(&self) -> bool {
        self.enabled.is_empty()
            && self.disabling.is_empty()
            && self.disabled.is_empty()
            && self.detached.is_empty()
            && self.get_waitlist.is_empty()
            && self.disable_waitlist.is_empty()
            && !self.is_spawning()
            && !self.restarting
    }

    pub(crate) fn find_process(&self, gupid: &str) -> Option<&Process> {
        self.enabled
            .iter()
            .chain(self.disabling.iter())
            .chain(self.disabled.iter())
            .chain(self.detached.iter())
            .find(|p| p.gupid == gupid)
    }

    pub(crate) fn find_process_mut(&mut self, gupid: &str) -> Option<&mut Process> {
        self.enabled
            .iter_mut()
            .chain(self.disabling.iter_mut())
            .chain(self.disabled.iter_mut())
            .chain(self.detached.iter_mut())
            .find(|p| p.gupid == gupid)
    }

    fn list_mut(&mut self, status: EnabledStatus) -> &mut Vec<Process> {
        match status {
            EnabledStatus::Enabled => &mut self.enabled,
            EnabledStatus::Disabling => &mut self.disabling,
            EnabledStatus::Disabled => &mut self.disabled,
            EnabledStatus::Detached => &mut self.detached,
        }
    }

    /// Remove a process from whichever list holds it
    pub(crate) fn take_process(&mut self, gupid: &str) -> Option<Process> {
        for status in [
            EnabledStatus::Enabled,
            EnabledStatus::Disabling,
            EnabledStatus::Disabled,
            EnabledStatus::Detached,
        ] {
            let list = self.list_mut(status);
            if let Some(pos) = list.iter().position(|p| p.gupid == gupid) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    /// Move a process to the list for `status`
    pub(crate) fn set_status(&mut self, gupid: &str, status: EnabledStatus) -> bool {
        let Some(mut process) = self.take_process(gupid) else {
            return false;
        };
        process.enabled = status;
        self.list_mut(status).push(process);
        true
    }

    /// Gupids of every process that is not already detached
    pub(crate) fn attached_gupids(&self) -> Vec<String> {
        self.enabled
            .iter()
            .chain(self.disabling.iter())
            .chain(self.disabled.iter())
            .map(|p| p.gupid.clone())
            .collect()
    }

    /// Pick a process and open a session on it.
    ///
    /// A sticky gupid that names a live enabled process pins the choice; if
    /// that process is busy the caller has to wait. Otherwise the enabled
    /// process with the fewest sessions wins. Disabling processes are only
    /// used when nothing is enabled.
    pub(crate) fn checkout(&mut self, sticky: Option<&str>, now: Duration) -> Option<Checkout> {
        let index = match sticky.and_then(|g| self.enabled.iter().position(|p| p.gupid == g)) {
            Some(i) if self.enabled[i].can_accept_session() => Some((EnabledStatus::Enabled, i)),
            Some(_) => return None,
            None => least_busy(&self.enabled)
                .map(|i| (EnabledStatus::Enabled, i))
                .or_else(|| {
                    if self.enabled.is_empty() {
                        least_busy(&self.disabling).map(|i| (EnabledStatus::Disabling, i))
                    } else {
                        None
                    }
                }),
        }?;

        let process = &mut self.list_mut(index.0)[index.1];
        let socket = process.session_socket()?.clone();
        process.sessions += 1;
        process.last_used = now;
        Some(Checkout {
            gupid: process.gupid.clone(),
            pid: process.pid,
            socket,
        })
    }

    pub(crate) fn take_disable_waiters(&mut self, gupid: &str) -> Vec<DisableWaiter> {
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .disable_waitlist
            .drain(..)
            .partition(|w| w.gupid == gupid);
        self.disable_waitlist = rest;
        matching
    }

    pub fn snapshot(&self, now: Duration) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name(),
            app_root: self.identity.app_root.display().to_string(),
            environment: self.identity.environment.clone(),
            user: self.identity.user.clone(),
            spawn_method: self.spawner.method(),
            life: self.life,
            restarting: self.restarting,
            spawning: self.is_spawning(),
            restarts_initiated: self.restarts_initiated,
            capacity_used: self.capacity_used(),
            min_processes: self.options.min_processes,
            max_processes: self.options.max_processes,
            get_waitlist: self.get_waitlist.len(),
            disable_waitlist: self.disable_waitlist.len(),
            processes_spawned: self.processes_spawned,
            spawn_failures: self.spawn_failures,
            preloader_pid: self.spawner.preloader_pid(),
            last_spawn_error: self.last_spawn_error.as_ref().map(|e| e.to_json()),
            processes: self
                .enabled
                .iter()
                .chain(self.disabling.iter())
                .chain(self.disabled.iter())
                .chain(self.detached.iter())
                .map(|p| p.snapshot(now))
                .collect(),
        }
    }
}

fn least_busy(processes: &[Process]) -> Option<usize> {
    processes
        .iter()
        .enumerate()
        .filter(|(_, p)| p.can_accept_session() && p.session_socket().is_some())
        .min_by_key(|(_, p)| p.sessions)
        .map(|(i, _)| i)
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub app_root: String,
    pub environment: String,
    pub user: Option<String>,
    pub spawn_method: &'static str,
    pub life: GroupLife,
    pub restarting: bool,
    pub spawning: bool,
    pub restarts_initiated: u64,
    pub capacity_used: usize,
    pub min_processes: usize,
    pub max_processes: usize,
    pub get_waitlist: usize,
    pub disable_waitlist: usize,
    pub processes_spawned: u64,
    pub spawn_failures: u64,
    pub preloader_pid: Option<u32>,
    pub last_spawn_error: Option<serde_json::Value>,
    pub processes: Vec<ProcessSnapshot>,
}

/// Watches `tmp/restart.txt` and `tmp/always_restart.txt` under an app root
#[derive(Debug, Default)]
pub struct RestartFileCheck {
    last_check: Option<Duration>,
    initialized: bool,
    restart_mtime: Option<SystemTime>,
    always_restart: bool,
}

impl RestartFileCheck {
    /// Whether the application should be restarted. The file system is
    /// consulted at most once per `throttle`; in between the last answer
    /// about `always_restart.txt` is reused and `restart.txt` counts as unchanged.
    pub fn check(&mut self, app_root: &Path, throttle: Duration, now: Duration) -> bool {
        if let Some(last) = self.last_check {
            if now.saturating_sub(last) < throttle {
                return self.always_restart;
            }
        }
        self.last_check = Some(now);

        let tmp = app_root.join("tmp");
        self.always_restart = tmp.join("always_restart.txt").exists();
        let mtime = std::fs::metadata(tmp.join("restart.txt"))
            .and_then(|m| m.modified())
            .ok();

        if !self.initialized {
            self.initialized = true;
            self.restart_mtime = mtime;
            return self.always_restart;
        }
        if mtime != self.restart_mtime {
            self.restart_mtime = mtime;
            return true;
        }
        self.always_restart
    }
}

pub(crate) fn resolve_disable(waiters: Vec<DisableWaiter>, result: DisableResult, actions: &mut super::Actions) {
    for waiter in waiters {
        let callback = waiter.callback;
        actions.push(move || callback(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::{Journey, JourneyType};
    use crate::spawning::{DummyConfig, DummySpawner, OsProcess, SpawnedProcess};

    fn process(gupid: &str, concurrency: usize) -> Process {
        Process::new(
            SpawnedProcess {
                pid: 1,
                gupid: gupid.into(),
                sockets: vec![SocketInfo {
                    address: "tcp://127.0.0.1:1".into(),
                    protocol: "session".into(),
                    concurrency,
                }],
                journey: Journey::new(JourneyType::SpawnDirectly),
                spawn_start: Duration::ZERO,
                spawn_end: Duration::ZERO,
                os: OsProcess::Dummy(1),
            },
            Duration::ZERO,
            SystemTime::now(),
            None,
        )
    }

    fn group() -> Group {
        let ctx = crate::context::Context::new(
            tokio::runtime::Handle::current(),
            crate::context::SpawningKitConfig::default(),
        );
        let spawner = Arc::new(Spawner::Dummy(DummySpawner::new(ctx, DummyConfig::default())));
        Group::new(Options::new("/srv/app", "true"), spawner)
    }

    #[tokio::test]
    async fn test_checkout_prefers_least_busy() {
        let mut g = group();
        g.enabled.push(process("a", 4));
        g.enabled.push(process("b", 4));
        g.enabled[0].sessions = 2;

        let c = g.checkout(None, Duration::from_secs(1)).unwrap();
        assert_eq!(c.gupid, "b");
        assert_eq!(g.enabled[1].sessions, 1);
        assert_eq!(g.enabled[1].last_used, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_checkout_sticky() {
        let mut g = group();
        g.enabled.push(process("a", 1));
        g.enabled.push(process("b", 1));

        assert_eq!(g.checkout(Some("b"), Duration::ZERO).unwrap().gupid, "b");
        // Pinned process is busy: wait rather than go elsewhere
        assert!(g.checkout(Some("b"), Duration::ZERO).is_none());
        // Unknown gupid falls back to normal selection
        assert_eq!(g.checkout(Some("zzz"), Duration::ZERO).unwrap().gupid, "a");
        assert!(g.all_enabled_at_full_capacity());
    }

    #[tokio::test]
    async fn test_disabling_used_only_without_enabled() {
        let mut g = group();
        g.enabled.push(process("a", 1));
        g.set_status("a", EnabledStatus::Disabling);
        assert_eq!(g.checkout(None, Duration::ZERO).unwrap().gupid, "a");

        g.enabled.push(process("b", 1));
        g.enabled[0].sessions = 1;
        assert!(g.checkout(None, Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn test_capacity_and_limits() {
        let mut g = group();
        g.options.min_processes = 2;
        g.options.max_processes = 2;
        assert!(g.wants_more_processes());
        g.enabled.push(process("a", 1));
        g.processes_being_spawned = 1;
        assert_eq!(g.capacity_used(), 2);
        assert!(g.upper_limit_reached());
        assert!(!g.wants_more_processes());

        g.processes_being_spawned = 0;
        g.set_status("a", EnabledStatus::Detached);
        assert_eq!(g.capacity_used(), 0);
        assert!(!g.is_quiet());
        assert_eq!(g.take_process("a").unwrap().enabled, EnabledStatus::Detached);
        assert!(g.is_quiet());
    }

    #[test]
    fn test_restart_file_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        let mut check = RestartFileCheck::default();
        let throttle = Duration::from_secs(10);

        // First observation only records a baseline
        assert!(!check.check(dir.path(), throttle, Duration::from_secs(0)));

        std::fs::write(dir.path().join("tmp/restart.txt"), "").unwrap();
        // Throttled: not looked at yet
        assert!(!check.check(dir.path(), throttle, Duration::from_secs(5)));
        assert!(check.check(dir.path(), throttle, Duration::from_secs(10)));
        assert!(!check.check(dir.path(), throttle, Duration::from_secs(20)));

        // Disappearing counts as a change, once
        std::fs::remove_file(dir.path().join("tmp/restart.txt")).unwrap();
        assert!(check.check(dir.path(), throttle, Duration::from_secs(22)));
        assert!(!check.check(dir.path(), throttle, Duration::from_secs(24)));

        std::fs::write(dir.path().join("tmp/always_restart.txt"), "").unwrap();
        assert!(check.check(dir.path(), throttle, Duration::from_secs(30)));
        assert!(check.check(dir.path(), throttle, Duration::from_secs(31)));
    }
}
