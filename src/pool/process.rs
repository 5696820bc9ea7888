//! Worker process records

use crate::spawning::{OsProcess, SocketInfo, SpawnedProcess};
use serde::Serialize;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnabledStatus {
    Enabled,
    /// Accepts no new sessions; becomes DISABLED once drained
    Disabling,
    /// Drained, kept alive as a warm standby
    Disabled,
    /// Leaving the group; shut down once drained or after the grace period
    Detached,
}

#[derive(Debug)]
pub struct Process {
    pub pid: u32,
    pub gupid: String,
    pub sockets: Vec<SocketInfo>,
    pub sessions: usize,
    pub processed: u64,
    pub enabled: EnabledStatus,
    pub last_used: Duration,
    pub spawn_start: Duration,
    pub spawn_end: Duration,
    pub spawned_at: SystemTime,
    pub detached_at: Option<Duration>,
    /// Per-process session ceiling; 0 means unlimited
    pub concurrency: usize,
    pub(crate) os: Option<OsProcess>,
}

impl Process {
    pub fn new(
        spawned: SpawnedProcess,
        now: Duration,
        wall_now: SystemTime,
        concurrency_override: Option<usize>,
    ) -> Self {
        let concurrency = concurrency_override.unwrap_or_else(|| {
            preferred_socket(&spawned.sockets)
                .map(|s| s.concurrency)
                .unwrap_or(1)
        });
        Self {
            pid: spawned.pid,
            gupid: spawned.gupid,
            sockets: spawned.sockets,
            sessions: 0,
            processed: 0,
            enabled: EnabledStatus::Enabled,
            last_used: now,
            spawn_start: spawned.spawn_start,
            spawn_end: spawned.spawn_end,
            spawned_at: wall_now,
            detached_at: None,
            concurrency,
            os: Some(spawned.os),
        }
    }

    /// The socket sessions are opened on
    pub fn session_socket(&self) -> Option<&SocketInfo> {
        preferred_socket(&self.sockets)
    }

    pub fn is_idle(&self) -> bool {
        self.sessions == 0
    }

    pub fn at_full_capacity(&self) -> bool {
        self.concurrency != 0 && self.sessions >= self.concurrency
    }

    pub fn can_accept_session(&self) -> bool {
        matches!(self.enabled, EnabledStatus::Enabled | EnabledStatus::Disabling) && !self.at_full_capacity()
    }

    /// Take the OS handle for shutdown; later calls return None
    pub(crate) fn take_os(&mut self) -> Option<OsProcess> {
        self.os.take()
    }

    pub fn snapshot(&self, now: Duration) -> ProcessSnapshot {
        ProcessSnapshot {
            pid: self.pid,
            gupid: self.gupid.clone(),
            enabled: self.enabled,
            sessions: self.sessions,
            processed: self.processed,
            concurrency: self.concurrency,
            idle_secs: now.saturating_sub(self.last_used).as_secs_f64(),
            spawn_time_ms: self.spawn_end.saturating_sub(self.spawn_start).as_millis() as u64,
            spawned_at: chrono::DateTime::<chrono::Utc>::from(self.spawned_at).to_rfc3339(),
            sockets: self.sockets.clone(),
        }
    }
}

/// `session` beats `http`; anything else is only used when it is all there is
pub fn preferred_socket(sockets: &[SocketInfo]) -> Option<&SocketInfo> {
    sockets
        .iter()
        .find(|s| s.protocol == "session")
        .or_else(|| sockets.iter().find(|s| s.protocol == "http"))
        .or_else(|| sockets.iter().find(|s| s.protocol != "preloader"))
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub gupid: String,
    pub enabled: EnabledStatus,
    pub sessions: usize,
    pub processed: u64,
    pub concurrency: usize,
    pub idle_secs: f64,
    pub spawn_time_ms: u64,
    pub spawned_at: String,
    pub sockets: Vec<SocketInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::{Journey, JourneyType};

    fn socket(protocol: &str, concurrency: usize) -> SocketInfo {
        SocketInfo {
            address: format!("unix:/tmp/{}.sock", protocol),
            protocol: protocol.into(),
            concurrency,
        }
    }

    fn spawned(sockets: Vec<SocketInfo>) -> SpawnedProcess {
        SpawnedProcess {
            pid: 10,
            gupid: "g-10".into(),
            sockets,
            journey: Journey::new(JourneyType::SpawnDirectly),
            spawn_start: Duration::from_secs(1),
            spawn_end: Duration::from_secs(2),
            os: OsProcess::Dummy(10),
        }
    }

    #[test]
    fn test_preferred_socket_order() {
        let sockets = vec![socket("http", 4), socket("session", 1)];
        assert_eq!(preferred_socket(&sockets).unwrap().protocol, "session");
        let sockets = vec![socket("preloader", 1), socket("websocket", 1)];
        assert_eq!(preferred_socket(&sockets).unwrap().protocol, "websocket");
        assert!(preferred_socket(&[]).is_none());
    }

    #[test]
    fn test_concurrency_from_socket_or_override() {
        let p = Process::new(spawned(vec![socket("http", 4)]), Duration::ZERO, SystemTime::now(), None);
        assert_eq!(p.concurrency, 4);
        let p = Process::new(spawned(vec![socket("http", 0)]), Duration::ZERO, SystemTime::now(), Some(1));
        assert_eq!(p.concurrency, 1);
    }

    #[test]
    fn test_capacity() {
        let mut p = Process::new(spawned(vec![socket("session", 2)]), Duration::ZERO, SystemTime::now(), None);
        assert!(p.can_accept_session());
        p.sessions = 2;
        assert!(p.at_full_capacity());
        assert!(!p.can_accept_session());

        let mut unlimited = Process::new(spawned(vec![socket("http", 0)]), Duration::ZERO, SystemTime::now(), None);
        unlimited.sessions = 1000;
        assert!(!unlimited.at_full_capacity());
        unlimited.enabled = EnabledStatus::Detached;
        assert!(!unlimited.can_accept_session());
    }

    #[test]
    fn test_snapshot() {
        let p = Process::new(spawned(vec![socket("session", 1)]), Duration::from_secs(5), SystemTime::now(), None);
        let snap = p.snapshot(Duration::from_secs(8));
        assert_eq!(snap.idle_secs, 3.0);
        assert_eq!(snap.spawn_time_ms, 1000);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["enabled"], "ENABLED");
    }
}
