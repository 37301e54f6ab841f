//! POSIX "run as user" launch: resolve the account, fork, switch the
//! child's identity, then exec.  There is no portable password check at
//! this layer (that belongs to PAM, alongside credential storage); the
//! secret is accepted and discarded, and switching identity is what
//! requires privilege.

use crate::credential::Secret;
use crate::error::LaunchError;
use crate::launcher::{ProcessCreator, SpawnSpec};
use std::cell::Cell;
use std::ffi::{CString, OsStr};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, Instant};

pub(crate) struct NativeCreator;

struct Account {
    uid: libc::uid_t,
    gid: libc::gid_t,
}

// Which step in the child failed, reported over the exec-status pipe
const STEP_SETGID: u8 = 1;
const STEP_INITGROUPS: u8 = 2;
const STEP_SETUID: u8 = 3;
const STEP_CHDIR: u8 = 4;
const STEP_EXEC: u8 = 5;

fn step_name(step: u8) -> &'static str {
    match step {
        STEP_SETGID => "setgid",
        STEP_INITGROUPS => "initgroups",
        STEP_SETUID => "setuid",
        STEP_CHDIR => "chdir",
        STEP_EXEC => "execv",
        _ => "child",
    }
}

fn errno_platform(call: &'static str) -> LaunchError {
    let code = IoError::last_os_error().raw_os_error().unwrap_or(0) as u32;
    LaunchError::Platform { call, code }
}

fn classify_errno(call: &'static str, errno: i32) -> LaunchError {
    match errno {
        libc::EPERM | libc::EACCES => LaunchError::PermissionDenied { code: errno as u32 },
        _ => LaunchError::Platform {
            call,
            code: errno as u32,
        },
    }
}

// NUL bytes cannot cross the exec boundary
fn cstr(s: &OsStr) -> Result<CString, LaunchError> {
    CString::new(s.as_bytes()).map_err(|_| LaunchError::Platform {
        call: "CString::new",
        code: libc::EINVAL as u32,
    })
}

/// Look the account up in the user database.  An unknown name is an
/// authentication failure: the credential does not correspond to a
/// real account.
fn resolve_account(username: &str) -> Result<(CString, Account), LaunchError> {
    let name = CString::new(username).map_err(|_| LaunchError::AuthenticationFailed { code: 0 })?;
    let mut buf = vec![0u8; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            let grown = buf.len() * 2;
            buf.resize(grown, 0);
            continue;
        }
        if rc != 0 {
            return Err(LaunchError::Platform {
                call: "getpwnam_r",
                code: rc as u32,
            });
        }
        if result.is_null() {
            return Err(LaunchError::AuthenticationFailed { code: 0 });
        }
        return Ok((
            name,
            Account {
                uid: pwd.pw_uid,
                gid: pwd.pw_gid,
            },
        ));
    }
}

fn cloexec_pipe() -> Result<(libc::c_int, libc::c_int), LaunchError> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(errno_platform("pipe"));
    }
    for fd in &fds {
        if unsafe { libc::fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            let err = errno_platform("fcntl");
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Child-side failure report: one tag byte plus the errno.  Only
/// async-signal-safe calls are allowed here.
unsafe fn report_and_exit(fd: libc::c_int, step: u8) -> ! {
    let errno = IoError::last_os_error().raw_os_error().unwrap_or(0);
    let mut buf = [0u8; 5];
    buf[0] = step;
    buf[1..5].copy_from_slice(&errno.to_ne_bytes());
    libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
    libc::_exit(127);
}

/// Drain the child's failure report.  `None` means the pipe closed
/// empty: the exec happened.
fn read_child_report(fd: libc::c_int) -> Option<(u8, i32)> {
    let mut buf = [0u8; 5];
    let mut got = 0usize;
    while got < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
            )
        };
        if n == 0 {
            break;
        }
        if n < 0 {
            if IoError::last_os_error().kind() == ErrorKind::Interrupted {
                continue;
            }
            break;
        }
        got += n as usize;
    }
    if got == buf.len() {
        let mut errno = [0u8; 4];
        errno.copy_from_slice(&buf[1..5]);
        Some((buf[0], i32::from_ne_bytes(errno)))
    } else {
        None
    }
}

fn reap(pid: libc::pid_t) {
    let mut status = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc != -1 || IoError::last_os_error().kind() != ErrorKind::Interrupted {
            return;
        }
    }
}

impl ProcessCreator for NativeCreator {
    type Process = Process;

    fn create_as_user(&self, spec: &SpawnSpec, _secret: &Secret) -> Result<Process, LaunchError> {
        let (name, account) = resolve_account(&spec.username)?;

        let exe = cstr(spec.executable.as_os_str())?;
        let mut argv = Vec::with_capacity(spec.args.len() + 1);
        argv.push(exe.clone());
        for arg in &spec.args {
            argv.push(cstr(arg)?);
        }
        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let cwd = match &spec.cwd {
            Some(dir) => Some(cstr(dir.as_os_str())?),
            None => None,
        };

        let (read_fd, write_fd) = cloexec_pipe()?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = errno_platform("fork");
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(err);
        }

        if pid == 0 {
            // Child.  Group identity must change while we still hold
            // the privilege to change it; supplementary groups need
            // root and are skipped when we already are the target.
            unsafe {
                libc::close(read_fd);
                if libc::setgid(account.gid) != 0 {
                    report_and_exit(write_fd, STEP_SETGID);
                }
                if libc::geteuid() == 0 && libc::initgroups(name.as_ptr(), account.gid as _) != 0 {
                    report_and_exit(write_fd, STEP_INITGROUPS);
                }
                if libc::setuid(account.uid) != 0 {
                    report_and_exit(write_fd, STEP_SETUID);
                }
                if let Some(dir) = &cwd {
                    if libc::chdir(dir.as_ptr()) != 0 {
                        report_and_exit(write_fd, STEP_CHDIR);
                    }
                }
                libc::execv(exe.as_ptr(), argv_ptrs.as_ptr());
                report_and_exit(write_fd, STEP_EXEC);
            }
        }

        // Parent
        unsafe { libc::close(write_fd) };
        let outcome = read_child_report(read_fd);
        unsafe { libc::close(read_fd) };

        match outcome {
            None => Ok(Process::new(pid)),
            Some((step, errno)) => {
                // The child never became the requested program; collect
                // it so it cannot linger as a zombie.
                reap(pid);
                Err(classify_errno(step_name(step), errno))
            }
        }
    }
}

/// Owns a child process launched under another account.
///
/// POSIX hands back no separate thread handle; the initial thread
/// shares the process id, and the only resource to release is our
/// interest in the child's exit status.
#[derive(Debug)]
pub struct Process {
    pid: libc::pid_t,
    status: Cell<Option<libc::c_int>>,
    closed: Cell<bool>,
}

impl Process {
    fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            status: Cell::new(None),
            closed: Cell::new(false),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.pid as u32
    }

    pub fn thread_id(&self) -> u32 {
        self.pid as u32
    }

    /// Wait for the process to exit.  `None` blocks indefinitely;
    /// with a timeout, `Ok(false)` means it is still running.
    pub fn wait_for(&self, timeout: Option<Duration>) -> IoResult<bool> {
        if self.closed.get() {
            return Err(closed_error());
        }
        if self.status.get().is_some() {
            return Ok(true);
        }
        match timeout {
            None => loop {
                let mut status = 0;
                let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
                if rc == self.pid {
                    self.status.set(Some(status));
                    return Ok(true);
                }
                if rc == -1 {
                    let err = IoError::last_os_error();
                    if err.kind() == ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
            },
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    let mut status = 0;
                    let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
                    if rc == self.pid {
                        self.status.set(Some(status));
                        return Ok(true);
                    }
                    if rc == -1 {
                        let err = IoError::last_os_error();
                        if err.kind() == ErrorKind::Interrupted {
                            continue;
                        }
                        return Err(err);
                    }
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Exit status of the process: its exit code, or 128 plus the
    /// signal number if it was killed by a signal.
    pub fn exit_code(&self) -> IoResult<u32> {
        if self.closed.get() {
            return Err(closed_error());
        }
        let status = match self.status.get() {
            Some(status) => status,
            None => {
                let mut status = 0;
                let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
                if rc != self.pid {
                    return Err(IoError::new(
                        ErrorKind::WouldBlock,
                        "process is still running",
                    ));
                }
                self.status.set(Some(status));
                status
            }
        };
        if libc::WIFEXITED(status) {
            Ok(libc::WEXITSTATUS(status) as u32)
        } else if libc::WIFSIGNALED(status) {
            Ok(128 + libc::WTERMSIG(status) as u32)
        } else {
            Err(IoError::new(ErrorKind::Other, "unrecognized wait status"))
        }
    }

    /// Forcibly end the process.
    pub fn terminate(&self) -> IoResult<()> {
        if self.closed.get() {
            return Err(closed_error());
        }
        if self.status.get().is_some() {
            // already exited and collected
            return Ok(());
        }
        if unsafe { libc::kill(self.pid, libc::SIGKILL) } != 0 {
            let err = IoError::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Release interest in the child.  Safe to call more than once;
    /// later calls do nothing.  An unreaped child is collected
    /// opportunistically so it does not linger as a zombie.
    pub fn close(&mut self) {
        if self.closed.get() {
            return;
        }
        if self.status.get().is_none() {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
            if rc == self.pid {
                self.status.set(Some(status));
            }
        }
        self.closed.set(true);
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> IoError {
    IoError::new(ErrorKind::InvalidInput, "process handle has been closed")
}
