use crate::credential::Secret;
use crate::error::LaunchError;
use crate::launcher::{ProcessCreator, SpawnSpec};
use crate::{os_str_to_null_terminated_vec, win32_error_with_context};
use crate::{LogonFlags, WindowVisibility};
use std::ffi::OsStr;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::ptr::{null, null_mut};
use std::time::Duration;
use winapi::shared::minwindef::DWORD;
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{
    GetExitCodeProcess, TerminateProcess, PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    CREATE_DEFAULT_ERROR_MODE, CREATE_NEW_CONSOLE, CREATE_NEW_PROCESS_GROUP,
    CREATE_UNICODE_ENVIRONMENT, INFINITE, STARTF_USESHOWWINDOW, WAIT_OBJECT_0,
};
use winapi::um::winnt::{HANDLE, LPCWSTR, LPWSTR};
use winapi::um::winuser::{SW_HIDE, SW_SHOWMINNOACTIVE, SW_SHOWNORMAL};

use winapi::shared::minwindef::{BOOL, LPVOID};

extern "system" {
    /// Not present in all published versions of the winapi crate.
    fn CreateProcessWithLogonW(
        lpUsername: LPCWSTR,
        lpDomain: LPCWSTR,
        lpPassword: LPCWSTR,
        dwLogonFlags: DWORD,
        lpApplicationName: LPCWSTR,
        lpCommandLine: LPWSTR,
        dwCreationFlags: DWORD,
        lpEnvironment: LPVOID,
        lpCurrentDirectory: LPCWSTR,
        lpStartupInfo: *mut STARTUPINFOW,
        lpProcessInformation: *mut PROCESS_INFORMATION,
    ) -> BOOL;
}

const LOGON_WITH_PROFILE: DWORD = 0x1;
const LOGON_NETCREDENTIALS_ONLY: DWORD = 0x2;
const STILL_ACTIVE: DWORD = 259;

/// UTF-16 staging buffer for the password; cleared before the memory
/// is released.
struct ZeroedWide(Vec<u16>);

impl ZeroedWide {
    fn new(s: &OsStr) -> Self {
        ZeroedWide(os_str_to_null_terminated_vec(s))
    }
}

impl Drop for ZeroedWide {
    fn drop(&mut self) {
        for unit in self.0.iter_mut() {
            unsafe { std::ptr::write_volatile(unit, 0) };
        }
    }
}

/// Helper for ensuring that handles from a spawned process are closed,
/// including when the launch errors out part-way.
struct ProcInfo(PROCESS_INFORMATION);

impl Drop for ProcInfo {
    fn drop(&mut self) {
        unsafe {
            if !self.0.hProcess.is_null() {
                CloseHandle(self.0.hProcess);
            }
            if !self.0.hThread.is_null() {
                CloseHandle(self.0.hThread);
            }
        }
    }
}

impl ProcInfo {
    fn new() -> Self {
        Self(unsafe { std::mem::zeroed() })
    }

    /// Take ownership of both handles
    fn into_process(mut self) -> Process {
        let proc = Process {
            process: self.0.hProcess,
            thread: self.0.hThread,
            process_id: self.0.dwProcessId,
            thread_id: self.0.dwThreadId,
        };
        self.0.hProcess = null_mut();
        self.0.hThread = null_mut();
        proc
    }
}

fn show_window(window: WindowVisibility) -> u16 {
    let sw = match window {
        WindowVisibility::Normal => SW_SHOWNORMAL,
        WindowVisibility::Hidden => SW_HIDE,
        WindowVisibility::Minimized => SW_SHOWMINNOACTIVE,
    };
    sw as u16
}

fn logon_flags_dword(logon: LogonFlags) -> DWORD {
    let mut flags = 0;
    if logon.loads_profile() {
        flags |= LOGON_WITH_PROFILE;
    }
    if logon.network_only() {
        flags |= LOGON_NETCREDENTIALS_ONLY;
    }
    flags
}

pub(crate) struct NativeCreator;

impl ProcessCreator for NativeCreator {
    type Process = Process;

    fn create_as_user(&self, spec: &SpawnSpec, secret: &Secret) -> Result<Process, LaunchError> {
        let username = os_str_to_null_terminated_vec(OsStr::new(&spec.username));
        let domain = os_str_to_null_terminated_vec(OsStr::new(&spec.domain));
        let password = ZeroedWide::new(OsStr::new(secret.as_str()));
        let exe = os_str_to_null_terminated_vec(spec.executable.as_os_str());
        // The command line buffer must be mutable: the call rewrites it
        let mut command_line = os_str_to_null_terminated_vec(&spec.command_line);
        let cwd: Option<Vec<u16>> = spec
            .cwd
            .as_ref()
            .map(|p| os_str_to_null_terminated_vec(p.as_os_str()));

        let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
        si.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        si.dwFlags = STARTF_USESHOWWINDOW;
        si.wShowWindow = show_window(spec.window);

        let mut pi = ProcInfo::new();

        let res = unsafe {
            CreateProcessWithLogonW(
                username.as_ptr(),
                domain.as_ptr(),
                password.0.as_ptr(),
                logon_flags_dword(spec.logon),
                exe.as_ptr(),
                command_line.as_mut_ptr(),
                CREATE_UNICODE_ENVIRONMENT|
                // Note that these flags are unconditionally or'd
                // in by CreateProcessWithLogonW: they're included
                // here to make it more obvious that these apply:
                CREATE_DEFAULT_ERROR_MODE|
                CREATE_NEW_CONSOLE|
                CREATE_NEW_PROCESS_GROUP,
                null_mut(),
                cwd.as_ref().map(|c| c.as_ptr()).unwrap_or(null()),
                &mut si,
                &mut pi.0,
            )
        };
        if res != 1 {
            // Read the failure code before anything else can clobber it
            let code = unsafe { GetLastError() };
            Err(LaunchError::from_win32("CreateProcessWithLogonW", code))
        } else {
            Ok(pi.into_process())
        }
    }
}

/// Owns the process and thread handles of a launched process.  Both are
/// released together, exactly once: by [`close`](Process::close) or by
/// dropping the value.
pub struct Process {
    process: HANDLE,
    thread: HANDLE,
    process_id: u32,
    thread_id: u32,
}

/// The compiler thinks it isn't Send because HANDLE is a pointer
/// type.  We happen to know that moving the handles between threads
/// is totally fine, hence this impl.
unsafe impl Send for Process {}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
    }
}

impl Process {
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Release both underlying handles.  Safe to call more than once;
    /// later calls do nothing.
    pub fn close(&mut self) {
        unsafe {
            if !self.process.is_null() {
                CloseHandle(self.process);
                self.process = null_mut();
            }
            if !self.thread.is_null() {
                CloseHandle(self.thread);
                self.thread = null_mut();
            }
        }
    }

    /// Wait for the process to exit.  `None` blocks indefinitely;
    /// with a timeout, `Ok(false)` means it is still running.
    pub fn wait_for(&self, timeout: Option<Duration>) -> IoResult<bool> {
        if self.process.is_null() {
            return Err(closed_error());
        }
        let millis = match timeout {
            Some(timeout) => {
                let millis = timeout.as_millis();
                if millis >= u128::from(INFINITE) {
                    INFINITE - 1
                } else {
                    millis as DWORD
                }
            }
            None => INFINITE,
        };
        match unsafe { WaitForSingleObject(self.process, millis) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(win32_error_with_context(
                "WaitForSingleObject",
                IoError::last_os_error(),
            )),
        }
    }

    pub fn exit_code(&self) -> IoResult<u32> {
        if self.process.is_null() {
            return Err(closed_error());
        }
        let mut exit_code: DWORD = 0;
        let res = unsafe { GetExitCodeProcess(self.process, &mut exit_code) };
        if res != 1 {
            Err(win32_error_with_context(
                "GetExitCodeProcess",
                IoError::last_os_error(),
            ))
        } else if exit_code == STILL_ACTIVE {
            Err(IoError::new(
                ErrorKind::WouldBlock,
                "process is still running",
            ))
        } else {
            Ok(exit_code)
        }
    }

    /// Forcibly end the process.
    pub fn terminate(&self) -> IoResult<()> {
        if self.process.is_null() {
            return Err(closed_error());
        }
        if unsafe { TerminateProcess(self.process, 1) } != 1 {
            Err(win32_error_with_context(
                "TerminateProcess",
                IoError::last_os_error(),
            ))
        } else {
            Ok(())
        }
    }
}

fn closed_error() -> IoError {
    IoError::new(ErrorKind::InvalidInput, "process handle has been closed")
}
