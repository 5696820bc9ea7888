//! Process primitives
//!
//! Thin wrappers around the libc calls the supervisor and the env-setupper need:
//! monotonic time, signalling, rlimits, user lookup and switching, FIFOs.
//!
//! Functions in the "between fork and exec" section run inside `pre_exec`
//! callbacks. They only call async-signal-safe primitives: no allocation, no
//! locks, no stdio. Errors are written with `write(2)` from stack buffers.

use std::ffi::{CStr, CString};
use std::io;
use std::path::Path;
use std::time::Duration;

/// Monotonic clock reading (CLOCK_MONOTONIC), comparable across processes on the same host
pub fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available on the platforms we build for
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Ignore SIGPIPE process-wide so broken sockets surface as EPIPE errors
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

pub fn current_gid() -> u32 {
    unsafe { libc::getgid() }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

// === Signalling ===

/// Send a signal to a pid
pub fn kill(pid: u32, signal: i32) -> io::Result<()> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send a signal to every process in the group led by `pgid`
pub fn kill_group(pgid: u32, signal: i32) -> io::Result<()> {
    let ret = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether a pid still refers to a live (or unreaped) process
pub fn process_alive(pid: u32) -> bool {
    match kill(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// Terminate a process that is not our child: SIGTERM, poll for exit, SIGKILL
/// after `grace_period`. Returns true if it exited within the grace period.
pub async fn terminate_pid(pid: u32, grace_period: Duration) -> bool {
    if kill(pid, libc::SIGTERM).is_err() {
        return true;
    }

    let deadline = tokio::time::Instant::now() + grace_period;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = kill(pid, libc::SIGKILL);
    false
}

// === Filesystem ===

pub fn mkfifo(path: &Path, mode: u32) -> io::Result<()> {
    let c_path = path_to_cstring(path)?;
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
}

// === Users ===

/// Passwd entry for a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

impl UserInfo {
    /// Human-readable dump used in spawn diagnostics
    pub fn describe(&self) -> String {
        format!(
            "uid={}({}) gid={} home={} shell={}",
            self.uid, self.name, self.gid, self.home, self.shell
        )
    }
}

pub fn lookup_user(name: &str) -> io::Result<Option<UserInfo>> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL byte"))?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 16 * 1024];

    let ret = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    if result.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { passwd_to_user_info(&pwd) }))
}

pub fn lookup_uid(uid: u32) -> io::Result<Option<UserInfo>> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 16 * 1024];

    let ret = unsafe {
        libc::getpwuid_r(
            uid as libc::uid_t,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    if result.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { passwd_to_user_info(&pwd) }))
}

unsafe fn passwd_to_user_info(pwd: &libc::passwd) -> UserInfo {
    let field = |ptr: *const libc::c_char| {
        if ptr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    };
    UserInfo {
        name: field(pwd.pw_name),
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        home: field(pwd.pw_dir),
        shell: field(pwd.pw_shell),
    }
}

/// Drop privileges to `user`: supplementary groups, then gid, then uid
pub fn switch_user(user: &UserInfo) -> io::Result<()> {
    let c_name = CString::new(user.name.as_str())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL byte"))?;
    unsafe {
        if libc::initgroups(c_name.as_ptr(), user.gid as _) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setgid(user.gid as libc::gid_t) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(user.uid as libc::uid_t) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// === Resource limits ===

pub fn set_file_descriptor_limit(limit: u64) -> io::Result<()> {
    let rl = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `ulimit -a` style dump of the limits that matter for app processes
pub fn dump_ulimits() -> String {
    let limits: [(&str, _); 5] = [
        ("open files", libc::RLIMIT_NOFILE),
        ("core file size", libc::RLIMIT_CORE),
        ("stack size", libc::RLIMIT_STACK),
        ("max user processes", libc::RLIMIT_NPROC),
        ("virtual memory", libc::RLIMIT_AS),
    ];

    let mut out = String::new();
    for (name, resource) in limits {
        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(resource, &mut rl) } != 0 {
            continue;
        }
        let fmt = |v: libc::rlim_t| {
            if v == libc::RLIM_INFINITY {
                "unlimited".to_string()
            } else {
                v.to_string()
            }
        };
        out.push_str(&format!("{:<20} {} (hard {})\n", name, fmt(rl.rlim_cur), fmt(rl.rlim_max)));
    }
    out
}

// === Between fork and exec ===

/// Child-side preparation run from `pre_exec`: default signal dispositions,
/// empty signal mask, own process group.
pub fn prepare_child_after_fork() -> io::Result<()> {
    unsafe {
        for signal in [
            libc::SIGPIPE,
            libc::SIGINT,
            libc::SIGTERM,
            libc::SIGHUP,
            libc::SIGQUIT,
            libc::SIGCHLD,
        ] {
            libc::signal(signal, libc::SIG_DFL);
        }

        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());

        if libc::setpgid(0, 0) != 0 {
            let errno = *errno_location();
            write_error(b"appgate: setpgid() failed", errno);
            return Err(io::Error::from_raw_os_error(errno));
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// Write `"<message>: errno=<n>\n"` to stderr without allocating
pub fn write_error(message: &[u8], errno: i32) {
    let mut buf = [0u8; 256];
    let mut len = 0;

    for &b in message.iter().take(200) {
        buf[len] = b;
        len += 1;
    }
    for &b in b": errno=" {
        buf[len] = b;
        len += 1;
    }
    len += format_decimal(errno.unsigned_abs() as u64, &mut buf[len..]);
    buf[len] = b'\n';
    len += 1;

    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, len);
    }
}

/// Format `value` into `out`, returning the number of bytes written
fn format_decimal(mut value: u64, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 20];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (value % 10) as u8;
        n += 1;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    let n = n.min(out.len());
    for i in 0..n {
        out[i] = digits[n - 1 - i];
    }
    n
}
