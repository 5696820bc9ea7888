//! Process pool
//!
//! The pool owns every application [`Group`] and every worker [`Process`].
//! All state sits behind one mutex. Callbacks produced while holding it are
//! collected in [`Actions`] and run only after it has been released, so a
//! callback may call straight back into the pool.
//!
//! Spawning happens on background tasks: a group runs at most one spawn
//! loop at a time, and the loop re-checks after every spawn whether the
//! group still wants more processes.

pub mod group;
pub mod options;
pub mod process;
pub mod session;

pub use group::{Group, GroupLife, GroupSnapshot};
pub use options::{ApplicationIdentity, Options};
pub use process::{EnabledStatus, Process, ProcessSnapshot};
pub use session::Session;

use crate::context::Context;
use crate::journey::{Journey, JourneyStep, JourneyType};
use crate::spawning::{ErrorCategory, SpawnError, SpawnedProcess, Spawner, SpawnerFactory};
use dashmap::DashMap;
use group::{resolve_disable, DisableWaiter, GetWaiter, RestartFileCheck};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub type GetCallback = Box<dyn FnOnce(Result<Session, GetError>) + Send>;
pub type DisableCallback = Box<dyn FnOnce(DisableResult) + Send>;

#[derive(Debug, Clone, Error)]
pub enum GetError {
    #[error("request queue is full (limit {limit})")]
    RequestQueueFull { limit: usize, status_code: u16 },
    #[error(transparent)]
    Spawn(Arc<SpawnError>),
    #[error("the pool is shutting down")]
    ShuttingDown,
    #[error("the application group has been removed")]
    GroupGone,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("not authorized")]
    Unauthorized,
    #[error("no such application group: {0}")]
    NoSuchGroup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableResult {
    /// The process is disabled and has no sessions left
    Drained,
    AlreadyDisabled,
    /// The process was re-enabled or detached before it drained
    Canceled,
    GroupGone,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolLife {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// Who is asking to look at or act on the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    Admin,
    /// Sees applications running as this uid
    Uid(u32),
    /// Sees applications configured with this API key
    ApiKey(String),
    Anonymous,
}

impl AuthContext {
    fn can_access(&self, options: &Options) -> bool {
        match self {
            AuthContext::Admin => true,
            AuthContext::Uid(uid) => app_uid(options) == Some(*uid),
            AuthContext::ApiKey(key) => options.api_key.as_deref() == Some(key.as_str()),
            AuthContext::Anonymous => false,
        }
    }
}

fn app_uid(options: &Options) -> Option<u32> {
    match &options.user {
        Some(name) => crate::os::lookup_user(name).ok().flatten().map(|u| u.uid),
        None => Some(crate::os::current_uid()),
    }
}

/// Pool-wide knobs, changeable at runtime
#[derive(Debug, Clone)]
pub struct PoolTuning {
    /// Maximum number of processes across all groups
    pub max: usize,
    /// Idle processes above their group's minimum are detached after this; zero disables
    pub max_idle_time: Duration,
    /// Detached processes still serving sessions are killed after this
    pub detach_grace_period: Duration,
    /// Groups without processes are removed after being empty this long
    pub group_quiet_period: Duration,
    /// Verify invariants after every state change (logs violations)
    pub self_checking: bool,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            max: 6,
            max_idle_time: Duration::from_secs(300),
            detach_grace_period: Duration::from_secs(60),
            group_quiet_period: Duration::from_secs(60),
            self_checking: false,
        }
    }
}

type Action = Box<dyn FnOnce() + Send>;

/// Work deferred until the pool lock is released
#[derive(Default)]
pub(crate) struct Actions(Vec<Action>);

impl Actions {
    pub(crate) fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(action));
    }

    fn run(self) {
        for action in self.0 {
            action();
        }
    }
}

struct PoolState {
    life: PoolLife,
    groups: HashMap<ApplicationIdentity, Group>,
    get_waitlist: VecDeque<GetWaiter>,
    tuning: PoolTuning,
}

impl PoolState {
    fn capacity_used(&self) -> usize {
        self.groups.values().map(|g| g.capacity_used()).sum()
    }

    fn at_full_capacity(&self) -> bool {
        self.capacity_used() >= self.tuning.max
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub life: PoolLife,
    pub max: usize,
    pub capacity_used: usize,
    pub process_count: usize,
    pub get_waitlist: usize,
    pub groups: Vec<GroupSnapshot>,
}

pub struct Pool {
    ctx: Arc<Context>,
    factory: SpawnerFactory,
    state: Mutex<PoolState>,
    restart_checks: DashMap<ApplicationIdentity, Arc<Mutex<RestartFileCheck>>>,
    injected_failures: AtomicUsize,
    next_waiter_id: AtomicU64,
}

/// Withdraws a queued [`Pool::get`] whose future is dropped before it resolves
struct PendingGet<'a> {
    pool: &'a Arc<Pool>,
    id: u64,
    armed: bool,
}

impl Drop for PendingGet<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_get(self.id);
        }
    }
}

fn resolve(waiter: GetWaiter, result: Result<Session, GetError>, actions: &mut Actions) {
    let callback = waiter.callback;
    actions.push(move || callback(result));
}

impl Pool {
    pub fn new(factory: SpawnerFactory, tuning: PoolTuning) -> Arc<Self> {
        info!(max = tuning.max, max_idle_secs = tuning.max_idle_time.as_secs(), "Pool initialized");
        Arc::new(Self {
            ctx: factory.context().clone(),
            factory,
            state: Mutex::new(PoolState {
                life: PoolLife::Alive,
                groups: HashMap::new(),
                get_waitlist: VecDeque::new(),
                tuning,
            }),
            restart_checks: DashMap::new(),
            injected_failures: AtomicUsize::new(0),
            next_waiter_id: AtomicU64::new(1),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn tuning(&self) -> PoolTuning {
        self.state.lock().tuning.clone()
    }

    /// Apply new tuning; a larger maximum admits pool-level waiters right away
    pub fn set_tuning(self: &Arc<Self>, tuning: PoolTuning) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            state.tuning = tuning;
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();
    }

    /// Make the next `n` spawns fail without starting anything
    pub fn inject_spawn_failures(&self, n: usize) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Ask for a session. `callback` runs exactly once, possibly before this
    /// returns, and never with the pool lock held.
    pub fn async_get(self: &Arc<Self>, options: Options, sticky: Option<String>, callback: GetCallback) {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.enqueue_get(id, options, sticky, callback);
    }

    fn enqueue_get(self: &Arc<Self>, id: u64, options: Options, sticky: Option<String>, callback: GetCallback) {
        let identity = options.identity();
        if self.restart_file_changed(&identity, &options) && self.restart_group(&identity) {
            info!(app = %identity.name(), "Restart requested through restart file");
        }

        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            self.get_locked(
                &mut state,
                GetWaiter {
                    id,
                    options,
                    sticky,
                    callback,
                },
                &mut actions,
            );
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();
    }

    /// Wait for a session. Dropping the future before it resolves takes the
    /// request out of whichever queue it sits in.
    pub async fn get(self: &Arc<Self>, options: Options, sticky: Option<String>) -> Result<Session, GetError> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = PendingGet {
            pool: self,
            id,
            armed: true,
        };
        self.enqueue_get(
            id,
            options,
            sticky,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.await.unwrap_or(Err(GetError::ShuttingDown));
        pending.armed = false;
        result
    }

    /// Drop a queued request without calling its callback
    fn cancel_get(self: &Arc<Self>, id: u64) {
        let mut actions = Actions::default();
        let cancelled = {
            let mut state = self.state.lock();
            let before = state.get_waitlist.len();
            state.get_waitlist.retain(|w| w.id != id);
            let mut cancelled = state.get_waitlist.len() != before;
            if !cancelled {
                for group in state.groups.values_mut() {
                    let before = group.get_waitlist.len();
                    group.get_waitlist.retain(|w| w.id != id);
                    if group.get_waitlist.len() != before {
                        debug!(app = %group.name(), "Queued request went away");
                        cancelled = true;
                        break;
                    }
                }
            }
            if cancelled {
                self.finish_locked(&mut state, &mut actions);
            }
            cancelled
        };
        actions.run();
        if !cancelled {
            debug!(id, "Request was no longer queued");
        }
    }

    fn restart_file_changed(&self, identity: &ApplicationIdentity, options: &Options) -> bool {
        let check = self
            .restart_checks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RestartFileCheck::default())))
            .clone();
        let now = self.ctx.now();
        let changed = check.lock().check(&options.app_root, options.stat_throttle_rate, now);
        changed
    }

    fn get_locked(self: &Arc<Self>, state: &mut PoolState, waiter: GetWaiter, actions: &mut Actions) {
        if state.life != PoolLife::Alive {
            resolve(waiter, Err(GetError::ShuttingDown), actions);
            return;
        }

        let identity = waiter.options.identity();
        if !state.groups.contains_key(&identity) {
            if state.at_full_capacity() && !self.force_free_capacity(state, None, actions) {
                let limit = waiter.options.max_request_queue_size;
                if limit > 0 && state.get_waitlist.len() >= limit {
                    let status_code = waiter.options.request_queue_overflow_status_code;
                    resolve(waiter, Err(GetError::RequestQueueFull { limit, status_code }), actions);
                } else {
                    debug!(app = %identity.name(), "Pool is full, request waits for capacity");
                    state.get_waitlist.push_back(waiter);
                }
                return;
            }
            self.create_group(state, &waiter.options);
        }
        self.group_get(state, &identity, waiter, actions);
    }

    fn create_group(&self, state: &mut PoolState, options: &Options) {
        let spawner = self.factory.create(options);
        let group = Group::new(options.clone(), spawner);
        info!(
            app = %group.name(),
            spawn_method = group.spawner.method(),
            min_processes = options.min_processes,
            "Created application group"
        );
        state.groups.insert(group.identity.clone(), group);
    }

    fn group_get(
        self: &Arc<Self>,
        state: &mut PoolState,
        identity: &ApplicationIdentity,
        waiter: GetWaiter,
        actions: &mut Actions,
    ) {
        let now = self.ctx.now();
        let Some(group) = state.groups.get_mut(identity) else {
            resolve(waiter, Err(GetError::GroupGone), actions);
            return;
        };
        group.empty_since = None;

        let checkout = if group.restarting {
            None
        } else {
            group.checkout(waiter.sticky.as_deref(), now)
        };
        match checkout {
            Some(c) => {
                let session = Session::new(Arc::clone(self), identity.clone(), c.gupid, c.pid, c.socket);
                resolve(waiter, Ok(session), actions);
            }
            None => {
                let limit = waiter.options.max_request_queue_size;
                if limit > 0 && group.get_waitlist.len() >= limit {
                    let status_code = waiter.options.request_queue_overflow_status_code;
                    warn!(app = %group.name(), limit, "Request queue full");
                    resolve(waiter, Err(GetError::RequestQueueFull { limit, status_code }), actions);
                } else {
                    group.get_waitlist.push_back(waiter);
                }
            }
        }
        self.maybe_spawn(state, identity, actions);
    }

    /// Hand sessions to waiters of one group while processes have room
    fn assign_group_waiters(self: &Arc<Self>, group: &mut Group, actions: &mut Actions) {
        if group.restarting || group.get_waitlist.is_empty() {
            return;
        }
        let now = self.ctx.now();
        let mut remaining = VecDeque::with_capacity(group.get_waitlist.len());
        while let Some(waiter) = group.get_waitlist.pop_front() {
            match group.checkout(waiter.sticky.as_deref(), now) {
                Some(c) => {
                    let session = Session::new(Arc::clone(self), group.identity.clone(), c.gupid, c.pid, c.socket);
                    resolve(waiter, Ok(session), actions);
                }
                None => remaining.push_back(waiter),
            }
        }
        group.get_waitlist = remaining;
    }

    /// Admit pool-level waiters while there is (or can be made) room for their group
    fn assign_pool_waiters(self: &Arc<Self>, state: &mut PoolState, actions: &mut Actions) {
        while let Some(front) = state.get_waitlist.front() {
            if state.life != PoolLife::Alive {
                break;
            }
            let options = front.options.clone();
            let identity = options.identity();
            if !state.groups.contains_key(&identity) {
                if state.at_full_capacity() && !self.force_free_capacity(state, None, actions) {
                    break;
                }
                self.create_group(state, &options);
            }
            if let Some(waiter) = state.get_waitlist.pop_front() {
                self.group_get(state, &identity, waiter, actions);
            }
        }
    }

    /// Start a spawn loop for the group if it wants more processes and none is running
    fn maybe_spawn(self: &Arc<Self>, state: &mut PoolState, identity: &ApplicationIdentity, actions: &mut Actions) {
        if state.life != PoolLife::Alive {
            return;
        }
        let pool_full = state.at_full_capacity();
        let Some(group) = state.groups.get(identity) else {
            return;
        };
        if group.is_spawning() || !group.wants_more_processes() {
            return;
        }
        if pool_full {
            // Only worth evicting someone else for a request that is actually waiting
            if group.get_waitlist.is_empty() || !self.force_free_capacity(state, Some(identity), actions) {
                return;
            }
        }
        if let Some(group) = state.groups.get_mut(identity) {
            self.start_spawn_loop(group);
        }
    }

    fn start_spawn_loop(self: &Arc<Self>, group: &mut Group) {
        group.processes_being_spawned = 1;
        let pool = Arc::clone(self);
        let identity = group.identity.clone();
        let spawner = Arc::clone(&group.spawner);
        let options = group.options.clone();
        let restarts = group.restarts_initiated;
        debug!(app = %group.name(), "Starting spawn loop");
        group.spawn_task = Some(
            self.ctx
                .runtime()
                .spawn(async move { pool.spawn_loop(identity, spawner, options, restarts).await }),
        );
    }

    async fn spawn_loop(
        self: Arc<Self>,
        identity: ApplicationIdentity,
        spawner: Arc<Spawner>,
        options: Options,
        restarts: u64,
    ) {
        loop {
            let result = if self.take_injected_failure() {
                Err(self.injected_spawn_error(&options))
            } else {
                spawner.spawn(&options).await
            };

            let mut actions = Actions::default();
            let mut discard = None;
            let keep_going = {
                let mut state = self.state.lock();
                let keep_going = self.spawn_finished(&mut state, &identity, restarts, result, &mut discard, &mut actions);
                self.finish_locked(&mut state, &mut actions);
                keep_going
            };
            actions.run();

            if let Some(spawned) = discard {
                spawned.discard(self.ctx.spawning_kit.shutdown_grace_period).await;
            }
            if !keep_going {
                break;
            }
        }
    }

    fn injected_spawn_error(&self, options: &Options) -> SpawnError {
        let mut journey = Journey::new(JourneyType::SpawnDirectly);
        let _ = journey.fail_at(JourneyStep::SpawningKitPreparation, self.ctx.now());
        SpawnError::new(
            &self.ctx,
            ErrorCategory::InternalError,
            journey,
            format!("Injected spawn failure for {}", options.app_root.display()),
        )
    }

    /// Attach the outcome of one spawn. Returns whether the loop should spawn again.
    fn spawn_finished(
        self: &Arc<Self>,
        state: &mut PoolState,
        identity: &ApplicationIdentity,
        restarts: u64,
        result: Result<SpawnedProcess, SpawnError>,
        discard: &mut Option<SpawnedProcess>,
        actions: &mut Actions,
    ) -> bool {
        let alive = state.life == PoolLife::Alive;
        let group = state
            .groups
            .get_mut(identity)
            .filter(|g| alive && g.life == GroupLife::Alive && g.restarts_initiated == restarts);
        let Some(group) = group else {
            // Group removed, shutting down or restarted since the spawn began
            if let Ok(spawned) = result {
                *discard = Some(spawned);
            }
            return false;
        };
        group.processes_being_spawned = 0;

        match result {
            Ok(spawned) => {
                info!(
                    app = %group.name(),
                    pid = spawned.pid,
                    gupid = %spawned.gupid,
                    spawn_time_ms = spawned.spawn_end.saturating_sub(spawned.spawn_start).as_millis() as u64,
                    "Attached application process"
                );
                let process = Process::new(
                    spawned,
                    self.ctx.now(),
                    self.ctx.wall_now(),
                    group.options.max_concurrent_requests_per_process,
                );
                group.enabled.push(process);
                group.processes_spawned += 1;
                group.last_spawn_error = None;
                self.assign_group_waiters(group, actions);
            }
            Err(err) => {
                error!(
                    app = %group.name(),
                    error_id = %err.id,
                    category = %err.category,
                    step = ?err.failed_step(),
                    summary = %err.summary,
                    "Could not spawn application process"
                );
                let err = Arc::new(err);
                group.spawn_failures += 1;
                group.last_spawn_error = Some(Arc::clone(&err));

                // Nothing enabled: take disabling processes back rather than serve nobody
                if group.enabled.is_empty() {
                    for gupid in group.disabling.iter().map(|p| p.gupid.clone()).collect::<Vec<_>>() {
                        group.set_status(&gupid, EnabledStatus::Enabled);
                        let waiters = group.take_disable_waiters(&gupid);
                        resolve_disable(waiters, DisableResult::Canceled, actions);
                    }
                }
                self.assign_group_waiters(group, actions);
                for waiter in group.get_waitlist.drain(..) {
                    resolve(waiter, Err(GetError::Spawn(Arc::clone(&err))), actions);
                }
                group.spawn_task = None;
                return false;
            }
        }

        let pool_full = state.at_full_capacity();
        let Some(group) = state.groups.get_mut(identity) else {
            return false;
        };
        let keep_going = group.wants_more_processes() && !pool_full;
        if keep_going {
            group.processes_being_spawned = 1;
        } else {
            group.spawn_task = None;
        }
        keep_going
    }

    /// Detach the oldest idle process of some other group to make room for a
    /// waiting request. Groups above their minimum give up a process first.
    /// Returns whether capacity was freed.
    fn force_free_capacity(
        self: &Arc<Self>,
        state: &mut PoolState,
        exclude: Option<&ApplicationIdentity>,
        actions: &mut Actions,
    ) -> bool {
        let victim = state
            .groups
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .flat_map(|(id, g)| {
                let at_minimum = g.enabled.len() <= g.options.min_processes;
                g.enabled
                    .iter()
                    .filter(|p| p.is_idle())
                    .map(move |p| (id, p.gupid.clone(), (at_minimum, p.last_used)))
            })
            .min_by_key(|(_, _, rank)| *rank)
            .map(|(id, gupid, _)| (id.clone(), gupid));

        let Some((identity, gupid)) = victim else {
            return false;
        };
        let grace = state.tuning.detach_grace_period;
        match state.groups.get_mut(&identity) {
            Some(group) => {
                info!(app = %group.name(), gupid = %gupid, "Evicting idle process to free pool capacity");
                self.detach_locked(group, &gupid, grace, actions)
            }
            None => false,
        }
    }

    /// Take a process out of rotation. Idle processes are shut down right
    /// away; busy ones keep serving their sessions until they drain or the
    /// grace period runs out.
    fn detach_locked(
        self: &Arc<Self>,
        group: &mut Group,
        gupid: &str,
        grace_period: Duration,
        actions: &mut Actions,
    ) -> bool {
        let Some(process) = group.find_process(gupid) else {
            return false;
        };
        if process.enabled == EnabledStatus::Detached {
            return false;
        }
        let waiters = group.take_disable_waiters(gupid);
        resolve_disable(waiters, DisableResult::Canceled, actions);

        let Some(mut process) = group.take_process(gupid) else {
            return false;
        };
        process.enabled = EnabledStatus::Detached;
        process.detached_at = Some(self.ctx.now());
        debug!(app = %group.name(), pid = process.pid, gupid, sessions = process.sessions, "Detached process");

        if process.is_idle() {
            self.shutdown_process(process);
        } else {
            let pool = Arc::clone(self);
            let identity = group.identity.clone();
            let gupid = gupid.to_string();
            self.ctx.runtime().spawn(async move {
                tokio::time::sleep(grace_period).await;
                pool.kill_detached(&identity, &gupid);
            });
            group.detached.push(process);
        }
        true
    }

    fn shutdown_process(&self, mut process: Process) {
        if let Some(os) = process.take_os() {
            info!(pid = process.pid, gupid = %process.gupid, "Shutting down application process");
            let grace = self.ctx.spawning_kit.shutdown_grace_period;
            self.ctx.runtime().spawn(os.terminate(grace));
        }
    }

    fn kill_detached(self: &Arc<Self>, identity: &ApplicationIdentity, gupid: &str) {
        let mut state = self.state.lock();
        let Some(group) = state.groups.get_mut(identity) else {
            return;
        };
        let Some(pos) = group.detached.iter().position(|p| p.gupid == gupid) else {
            return;
        };
        let process = group.detached.remove(pos);
        warn!(
            app = %group.name(),
            pid = process.pid,
            sessions = process.sessions,
            "Detached process did not drain within the grace period"
        );
        self.shutdown_process(process);
    }

    /// Release a session. Called from [`Session`]'s drop.
    pub(crate) fn session_closed(self: &Arc<Self>, identity: &ApplicationIdentity, gupid: &str, detach_process: bool) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            let now = self.ctx.now();
            let grace = state.tuning.detach_grace_period;
            if let Some(group) = state.groups.get_mut(identity) {
                self.release_session(group, gupid, detach_process, now, grace, &mut actions);
                self.assign_group_waiters(group, &mut actions);
            }
            self.maybe_spawn(&mut state, identity, &mut actions);
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();
    }

    fn release_session(
        self: &Arc<Self>,
        group: &mut Group,
        gupid: &str,
        detach_process: bool,
        now: Duration,
        grace: Duration,
        actions: &mut Actions,
    ) {
        let max_requests = group.options.max_requests;
        let Some(process) = group.find_process_mut(gupid) else {
            return;
        };
        process.sessions = process.sessions.saturating_sub(1);
        process.processed += 1;
        process.last_used = now;
        let status = process.enabled;
        let idle = process.is_idle();
        let exhausted = max_requests > 0 && process.processed >= max_requests;

        if status != EnabledStatus::Detached && (detach_process || exhausted) {
            if exhausted {
                info!(app = %group.name(), gupid, max_requests, "Process reached its request limit");
            } else {
                warn!(app = %group.name(), gupid, "Detaching process that could not be reached");
            }
            self.detach_locked(group, gupid, grace, actions);
            return;
        }

        match status {
            EnabledStatus::Detached if idle => {
                if let Some(pos) = group.detached.iter().position(|p| p.gupid == gupid) {
                    let process = group.detached.remove(pos);
                    self.shutdown_process(process);
                }
            }
            EnabledStatus::Disabling if idle => {
                group.set_status(gupid, EnabledStatus::Disabled);
                let waiters = group.take_disable_waiters(gupid);
                resolve_disable(waiters, DisableResult::Drained, actions);
            }
            _ => {}
        }
    }

    /// Bookkeeping after every state change
    fn finish_locked(self: &Arc<Self>, state: &mut PoolState, actions: &mut Actions) {
        self.assign_pool_waiters(state, actions);
        self.spawn_for_waiting_groups(state, actions);
        if state.tuning.self_checking {
            for violation in check_invariants(state) {
                error!(violation = %violation, "Pool invariant violated");
            }
        }
    }

    /// Capacity freed anywhere in the pool goes to groups with queued
    /// requests, evicting an idle process elsewhere if the pool is full
    fn spawn_for_waiting_groups(self: &Arc<Self>, state: &mut PoolState, actions: &mut Actions) {
        if state.life != PoolLife::Alive {
            return;
        }
        let waiting: Vec<ApplicationIdentity> = state
            .groups
            .iter()
            .filter(|(_, g)| !g.get_waitlist.is_empty() && !g.is_spawning() && g.wants_more_processes())
            .map(|(id, _)| id.clone())
            .collect();
        for identity in waiting {
            self.maybe_spawn(state, &identity, actions);
        }
    }

    /// Restart a group: detach every process and replace the spawner once
    /// the old one has been cleaned up. Waiting requests stay queued.
    pub fn restart_group(self: &Arc<Self>, identity: &ApplicationIdentity) -> bool {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            let grace = state.tuning.detach_grace_period;
            let Some(group) = state.groups.get_mut(identity) else {
                return false;
            };
            if group.life != GroupLife::Alive {
                return false;
            }
            group.restarts_initiated += 1;
            group.restarting = true;
            if let Some(task) = group.spawn_task.take() {
                task.abort();
            }
            group.processes_being_spawned = 0;
            info!(app = %group.name(), restarts = group.restarts_initiated, "Restarting application");

            for gupid in group.attached_gupids() {
                self.detach_locked(group, &gupid, grace, &mut actions);
            }

            let old_spawner = Arc::clone(&group.spawner);
            let restarts = group.restarts_initiated;
            let pool = Arc::clone(self);
            let identity = identity.clone();
            self.ctx.runtime().spawn(async move {
                old_spawner.cleanup().await;
                pool.finish_restart(&identity, restarts);
            });
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();
        true
    }

    fn finish_restart(self: &Arc<Self>, identity: &ApplicationIdentity, restarts: u64) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            let Some(group) = state.groups.get_mut(identity) else {
                return;
            };
            if group.restarts_initiated != restarts || group.life != GroupLife::Alive {
                return;
            }
            group.spawner = self.factory.create(&group.options);
            group.restarting = false;
            info!(app = %group.name(), "Application restarted");
            self.maybe_spawn(&mut state, identity, &mut actions);
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();
    }

    /// Restart every group matching `name` (group name or app root) that `auth` may see
    pub fn restart_by_name(self: &Arc<Self>, name: &str, auth: &AuthContext) -> Result<usize, PoolError> {
        if *auth == AuthContext::Anonymous {
            return Err(PoolError::Unauthorized);
        }
        let candidates: Vec<(ApplicationIdentity, Options)> = {
            let state = self.state.lock();
            state
                .groups
                .values()
                .filter(|g| g.name() == name || g.identity.app_root.to_string_lossy() == name)
                .map(|g| (g.identity.clone(), g.options.clone()))
                .collect()
        };
        if candidates.is_empty() {
            return Err(PoolError::NoSuchGroup(name.to_string()));
        }
        let allowed: Vec<_> = candidates
            .into_iter()
            .filter(|(_, options)| auth.can_access(options))
            .collect();
        if allowed.is_empty() {
            return Err(PoolError::Unauthorized);
        }
        Ok(allowed.iter().filter(|(id, _)| self.restart_group(id)).count())
    }

    /// Update the options of a running group; applies to future spawns and limits
    pub fn reconfigure_group(self: &Arc<Self>, options: &Options) -> bool {
        let mut actions = Actions::default();
        let found = {
            let mut state = self.state.lock();
            let identity = options.identity();
            let found = match state.groups.get_mut(&identity) {
                Some(group) => {
                    group.options = options.clone();
                    true
                }
                None => false,
            };
            self.maybe_spawn(&mut state, &identity, &mut actions);
            self.finish_locked(&mut state, &mut actions);
            found
        };
        actions.run();
        found
    }

    /// Stop routing to a process; `callback` learns when it has drained
    pub fn async_disable_process(self: &Arc<Self>, gupid: &str, callback: DisableCallback) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            let identity = state
                .groups
                .values()
                .find(|g| g.find_process(gupid).is_some())
                .map(|g| g.identity.clone());
            match identity.as_ref().and_then(|id| state.groups.get_mut(id)) {
                None => actions.push(move || callback(DisableResult::NotFound)),
                Some(group) => {
                    let process = group.find_process(gupid).map(|p| (p.enabled, p.is_idle()));
                    match process {
                        Some((EnabledStatus::Enabled, true)) => {
                            group.set_status(gupid, EnabledStatus::Disabled);
                            info!(app = %group.name(), gupid, "Disabled process");
                            actions.push(move || callback(DisableResult::Drained));
                        }
                        Some((EnabledStatus::Enabled, false)) => {
                            group.set_status(gupid, EnabledStatus::Disabling);
                            info!(app = %group.name(), gupid, "Disabling process, waiting for it to drain");
                            group.disable_waitlist.push(DisableWaiter {
                                gupid: gupid.to_string(),
                                callback,
                            });
                        }
                        Some((EnabledStatus::Disabling, _)) => {
                            group.disable_waitlist.push(DisableWaiter {
                                gupid: gupid.to_string(),
                                callback,
                            });
                        }
                        Some((EnabledStatus::Disabled, _)) => {
                            actions.push(move || callback(DisableResult::AlreadyDisabled))
                        }
                        Some((EnabledStatus::Detached, _)) | None => {
                            actions.push(move || callback(DisableResult::NotFound))
                        }
                    }
                }
            }
            if let Some(identity) = identity {
                self.maybe_spawn(&mut state, &identity, &mut actions);
            }
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();
    }

    pub async fn disable_process(self: &Arc<Self>, gupid: &str) -> DisableResult {
        let (tx, rx) = oneshot::channel();
        self.async_disable_process(
            gupid,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(DisableResult::GroupGone)
    }

    /// Put a disabling or disabled process back into rotation
    pub fn enable_process(self: &Arc<Self>, gupid: &str) -> bool {
        let mut actions = Actions::default();
        let enabled = {
            let mut state = self.state.lock();
            let mut enabled = false;
            for group in state.groups.values_mut() {
                let status = group.find_process(gupid).map(|p| p.enabled);
                if let Some(EnabledStatus::Disabling | EnabledStatus::Disabled) = status {
                    group.set_status(gupid, EnabledStatus::Enabled);
                    let waiters = group.take_disable_waiters(gupid);
                    resolve_disable(waiters, DisableResult::Canceled, &mut actions);
                    info!(app = %group.name(), gupid, "Enabled process");
                    self.assign_group_waiters(group, &mut actions);
                    enabled = true;
                    break;
                }
            }
            self.finish_locked(&mut state, &mut actions);
            enabled
        };
        actions.run();
        enabled
    }

    /// Detach a process by gupid
    pub fn detach_process(self: &Arc<Self>, gupid: &str) -> bool {
        let mut actions = Actions::default();
        let detached = {
            let mut state = self.state.lock();
            let grace = state.tuning.detach_grace_period;
            let identity = state
                .groups
                .values()
                .find(|g| g.find_process(gupid).is_some())
                .map(|g| g.identity.clone());
            let detached = match identity.as_ref().and_then(|id| state.groups.get_mut(id)) {
                Some(group) => self.detach_locked(group, gupid, grace, &mut actions),
                None => false,
            };
            if let Some(identity) = identity {
                self.maybe_spawn(&mut state, &identity, &mut actions);
            }
            self.finish_locked(&mut state, &mut actions);
            detached
        };
        actions.run();
        detached
    }

    /// Periodic maintenance: detach long-idle processes (keeping each
    /// group's minimum), remove groups that stayed empty, stop idle preloaders.
    pub async fn garbage_collect(self: &Arc<Self>) {
        let mut actions = Actions::default();
        let mut removed_spawners = Vec::new();
        let mut live_spawners = Vec::new();
        {
            let mut state = self.state.lock();
            let now = self.ctx.now();
            let tuning = state.tuning.clone();
            let identities: Vec<ApplicationIdentity> = state.groups.keys().cloned().collect();

            for identity in identities {
                let Some(group) = state.groups.get_mut(&identity) else {
                    continue;
                };

                if !tuning.max_idle_time.is_zero() {
                    let mut idle: Vec<(String, Duration)> = group
                        .enabled
                        .iter()
                        .filter(|p| p.is_idle() && now.saturating_sub(p.last_used) >= tuning.max_idle_time)
                        .map(|p| (p.gupid.clone(), p.last_used))
                        .collect();
                    idle.sort_by_key(|(_, last_used)| *last_used);
                    let allowed = group.enabled.len().saturating_sub(group.options.min_processes);
                    for (gupid, _) in idle.into_iter().take(allowed) {
                        info!(app = %group.name(), gupid = %gupid, "Detaching idle process");
                        self.detach_locked(group, &gupid, tuning.detach_grace_period, &mut actions);
                    }
                }

                if group.is_quiet() {
                    let since = *group.empty_since.get_or_insert(now);
                    if now.saturating_sub(since) >= tuning.group_quiet_period {
                        if let Some(group) = state.groups.remove(&identity) {
                            info!(app = %group.name(), "Removing idle application group");
                            self.restart_checks.remove(&identity);
                            removed_spawners.push(group.spawner);
                        }
                        continue;
                    }
                } else {
                    group.empty_since = None;
                }
                live_spawners.push(Arc::clone(&group.spawner));
            }
            self.finish_locked(&mut state, &mut actions);
        }
        actions.run();

        for spawner in removed_spawners {
            spawner.cleanup().await;
        }
        let max_preloader_idle = self.ctx.spawning_kit.max_preloader_idle_time;
        for spawner in live_spawners {
            if spawner.cleanup_if_idle(max_preloader_idle).await {
                info!("Stopped idle preloader");
            }
        }
    }

    /// Refuse new work, let sessions drain for up to `drain_timeout`, then
    /// stop every process and preloader.
    pub async fn shutdown(self: &Arc<Self>, drain_timeout: Duration) {
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            if state.life != PoolLife::Alive {
                return;
            }
            state.life = PoolLife::ShuttingDown;
            info!(groups = state.groups.len(), "Pool shutting down");
            for waiter in state.get_waitlist.drain(..) {
                resolve(waiter, Err(GetError::ShuttingDown), &mut actions);
            }
            for group in state.groups.values_mut() {
                group.life = GroupLife::ShuttingDown;
                if let Some(task) = group.spawn_task.take() {
                    task.abort();
                }
                group.processes_being_spawned = 0;
                for waiter in group.get_waitlist.drain(..) {
                    resolve(waiter, Err(GetError::ShuttingDown), &mut actions);
                }
            }
        }
        actions.run();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            let sessions = self.total_sessions();
            if sessions == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(sessions, "Drain timeout reached with sessions still open");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut actions = Actions::default();
        let groups: Vec<Group> = {
            let mut state = self.state.lock();
            state.life = PoolLife::ShutDown;
            state.groups.drain().map(|(_, g)| g).collect()
        };

        let grace = self.ctx.spawning_kit.shutdown_grace_period;
        let mut terminations = Vec::new();
        let mut spawners = Vec::new();
        for mut group in groups {
            group.life = GroupLife::ShutDown;
            let waiters: Vec<DisableWaiter> = group.disable_waitlist.drain(..).collect();
            resolve_disable(waiters, DisableResult::GroupGone, &mut actions);
            for mut process in group
                .enabled
                .drain(..)
                .chain(group.disabling.drain(..))
                .chain(group.disabled.drain(..))
                .chain(group.detached.drain(..))
            {
                if let Some(os) = process.take_os() {
                    terminations.push(os.terminate(grace));
                }
            }
            spawners.push(group.spawner);
        }
        actions.run();

        futures::future::join_all(terminations).await;
        futures::future::join_all(spawners.iter().map(|s| s.cleanup())).await;
        info!("Pool shut down");
    }

    fn total_sessions(&self) -> usize {
        let state = self.state.lock();
        state
            .groups
            .values()
            .flat_map(|g| {
                g.enabled
                    .iter()
                    .chain(g.disabling.iter())
                    .chain(g.disabled.iter())
                    .chain(g.detached.iter())
            })
            .map(|p| p.sessions)
            .sum()
    }

    pub fn life(&self) -> PoolLife {
        self.state.lock().life
    }

    pub fn capacity_used(&self) -> usize {
        self.state.lock().capacity_used()
    }

    /// State of the pool as seen by `auth`
    pub fn inspect(&self, auth: &AuthContext) -> Result<PoolSnapshot, PoolError> {
        if *auth == AuthContext::Anonymous {
            return Err(PoolError::Unauthorized);
        }
        let (mut snapshot, options) = {
            let state = self.state.lock();
            let now = self.ctx.now();
            let mut groups: Vec<(Options, GroupSnapshot)> = state
                .groups
                .values()
                .map(|g| (g.options.clone(), g.snapshot(now)))
                .collect();
            groups.sort_by(|a, b| a.1.name.cmp(&b.1.name));
            let process_count = state
                .groups
                .values()
                .map(|g| g.enabled.len() + g.disabling.len() + g.disabled.len())
                .sum();
            let snapshot = PoolSnapshot {
                life: state.life,
                max: state.tuning.max,
                capacity_used: state.capacity_used(),
                process_count,
                get_waitlist: state.get_waitlist.len(),
                groups: Vec::new(),
            };
            (snapshot, groups)
        };
        // User lookups happen outside the lock
        snapshot.groups = options
            .into_iter()
            .filter(|(options, _)| auth.can_access(options))
            .map(|(_, group)| group)
            .collect();
        Ok(snapshot)
    }

    /// Human-readable dump of the pool for the admin interface
    pub fn inspect_text(&self, auth: &AuthContext) -> Result<String, PoolError> {
        let snapshot = self.inspect(auth)?;
        let mut out = format!(
            "----------- General information -----------\n\
             Max pool size : {}\nApp groups    : {}\nProcesses     : {}\nRequests in top-level queue : {}\n\n\
             ----------- Application groups -----------\n",
            snapshot.max,
            snapshot.groups.len(),
            snapshot.process_count,
            snapshot.get_waitlist
        );
        for group in &snapshot.groups {
            out.push_str(&format!(
                "{}:\n  App root: {}\n  Requests in queue: {}\n",
                group.name, group.app_root, group.get_waitlist
            ));
            for p in &group.processes {
                out.push_str(&format!(
                    "  * PID: {:<7} Sessions: {:<3} Processed: {:<6} Status: {:?}\n",
                    p.pid, p.sessions, p.processed, p.enabled
                ));
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Check the pool's structural invariants; returns a description of every violation
    pub fn verify_invariants(&self) -> Vec<String> {
        check_invariants(&self.state.lock())
    }
}

fn check_invariants(state: &PoolState) -> Vec<String> {
    let mut violations = Vec::new();
    let pool_full = state.at_full_capacity();

    if !state.get_waitlist.is_empty() && !pool_full {
        violations.push(format!(
            "{} pool-level waiters but capacity {}/{} is not exhausted",
            state.get_waitlist.len(),
            state.capacity_used(),
            state.tuning.max
        ));
    }

    for group in state.groups.values() {
        let name = group.name();
        let lists = [
            (EnabledStatus::Enabled, &group.enabled),
            (EnabledStatus::Disabling, &group.disabling),
            (EnabledStatus::Disabled, &group.disabled),
            (EnabledStatus::Detached, &group.detached),
        ];
        let mut seen = std::collections::HashSet::new();
        for (status, list) in lists {
            for p in list.iter() {
                if p.enabled != status {
                    violations.push(format!("{}: process {} is {:?} but listed as {:?}", name, p.gupid, p.enabled, status));
                }
                if !seen.insert(p.gupid.as_str()) {
                    violations.push(format!("{}: process {} is listed more than once", name, p.gupid));
                }
            }
        }
        for p in &group.disabling {
            if p.is_idle() {
                violations.push(format!("{}: disabling process {} has no sessions", name, p.gupid));
            }
        }
        for p in &group.detached {
            if p.is_idle() {
                violations.push(format!("{}: detached process {} has no sessions", name, p.gupid));
            }
        }

        let has_sticky_waiter = group.get_waitlist.iter().any(|w| w.sticky.is_some());
        if !group.get_waitlist.is_empty()
            && !has_sticky_waiter
            && !group.restarting
            && !group.is_spawning()
            && !group.upper_limit_reached()
            && !pool_full
            && group.enabled.iter().any(|p| p.can_accept_session())
        {
            violations.push(format!(
                "{}: {} waiters while an enabled process has room and nothing is spawning",
                name,
                group.get_waitlist.len()
            ));
        }
    }
    violations
}
