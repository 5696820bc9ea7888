//! Checked-out request slots

use super::options::ApplicationIdentity;
use super::Pool;
use crate::conn_pool::Endpoint;
use crate::spawning::SocketInfo;
use std::sync::Arc;

/// The right to send one request to one process.
///
/// Holds the process by identity and dereferences through the [`Pool`] when
/// it is closed, so a session outliving its process (detached, or its group
/// removed) is harmless. Dropping a session releases it.
pub struct Session {
    pool: Arc<Pool>,
    identity: ApplicationIdentity,
    gupid: String,
    pid: u32,
    socket: SocketInfo,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        pool: Arc<Pool>,
        identity: ApplicationIdentity,
        gupid: String,
        pid: u32,
        socket: SocketInfo,
    ) -> Self {
        Self {
            pool,
            identity,
            gupid,
            pid,
            socket,
            closed: false,
        }
    }

    pub fn gupid(&self) -> &str {
        &self.gupid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn identity(&self) -> &ApplicationIdentity {
        &self.identity
    }

    pub fn socket(&self) -> &SocketInfo {
        &self.socket
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.socket.endpoint()
    }

    /// Whether requests go out in the length-prefixed session protocol rather than HTTP
    pub fn uses_session_protocol(&self) -> bool {
        self.socket.protocol == "session"
    }

    /// Release the session. With `detach_process` the process is taken out
    /// of rotation; used when it could not be talked to at all.
    pub fn close(mut self, detach_process: bool) {
        self.release(detach_process);
    }

    fn release(&mut self, detach_process: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pool.session_closed(&self.identity, &self.gupid, detach_process);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release(false);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("app", &self.identity.name())
            .field("gupid", &self.gupid)
            .field("pid", &self.pid)
            .field("socket", &self.socket.address)
            .finish()
    }
}
