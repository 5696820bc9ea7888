//! Scoped resources
//!
//! Each guard releases its resource on scope exit unless explicitly committed:
//! child processes are SIGKILLed, file descriptors closed, work directories removed.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Child;
use tracing::{debug, warn};

/// Owns a freshly spawned child process. Dropping an uncommitted guard kills
/// the child's whole process group.
pub struct ChildGuard {
    child: Option<Child>,
    pid: Option<u32>,
}

impl ChildGuard {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Release ownership; the caller becomes responsible for the child
    pub fn commit(mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Some(pid) = self.pid {
            debug!(pid, "Killing uncommitted child process");
            let _ = crate::os::kill_group(pid, libc::SIGKILL);
        }
        if let Err(e) = child.start_kill() {
            debug!(pid = self.pid, error = %e, "Failed to kill child process");
        }
    }
}

/// Owns a raw file descriptor until committed
pub struct FdGuard {
    fd: Option<OwnedFd>,
}

impl FdGuard {
    /// Take ownership of `fd`
    ///
    /// # Safety
    /// `fd` must be an open descriptor not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: Some(OwnedFd::from_raw_fd(fd)),
        }
    }

    pub fn raw(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn commit(mut self) -> io::Result<OwnedFd> {
        self.fd
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file descriptor already committed"))
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            debug!(fd = fd.as_raw_fd(), "Closing uncommitted file descriptor");
        }
    }
}

/// A spawn attempt's work directory, removed on drop unless committed
pub struct WorkDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl WorkDir {
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("appgate-spawn.");
            b
        };
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory on disk after the guard is dropped
    pub fn commit(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.into_path();
            debug!(path = %path.display(), "Keeping spawn work directory");
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove spawn work directory");
            }
        }
    }
}
