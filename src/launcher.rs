//! The portable half of a launch: validate the request, normalize it
//! into a [`SpawnSpec`], and hand it to a platform [`ProcessCreator`].

use crate::command::{build_command_line, Command, LogonFlags, WindowVisibility};
use crate::credential::{Credential, Secret};
use crate::error::LaunchError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A fully validated and normalized launch request, ready for the
/// platform.  The executable is known to exist, the domain has already
/// been defaulted, and the command line is assembled; the secret does
/// not travel with the spec.
pub(crate) struct SpawnSpec {
    pub executable: PathBuf,
    pub command_line: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub window: WindowVisibility,
    pub logon: LogonFlags,
    pub username: String,
    pub domain: String,
}

/// The platform seam.  Exactly one implementation is compiled in per
/// target; tests substitute a recording stub.
pub(crate) trait ProcessCreator {
    type Process;

    fn create_as_user(
        &self,
        spec: &SpawnSpec,
        secret: &Secret,
    ) -> Result<Self::Process, LaunchError>;
}

pub(crate) fn launch(
    command: &Command,
    credential: Credential,
) -> Result<crate::platform::Process, LaunchError> {
    launch_with(&crate::platform::NativeCreator, command, credential)
}

/// `credential` is consumed: it is dropped (and its secret cleared) on
/// every path out of this function.
pub(crate) fn launch_with<C: ProcessCreator>(
    creator: &C,
    command: &Command,
    credential: Credential,
) -> Result<C::Process, LaunchError> {
    let executable = resolve_executable(command.executable())?;
    let spec = SpawnSpec {
        command_line: build_command_line(&executable, command.argv(), command.cmdline_override()),
        args: command.argv().to_vec(),
        cwd: command.cwd().map(|p| p.to_path_buf()),
        window: command.window_visibility(),
        logon: command.logon(),
        username: credential.username().to_string(),
        domain: credential.domain_for_logon().to_string(),
        executable,
    };

    log::debug!(
        "spawning {:?} as {}\\{}",
        spec.executable,
        spec.domain,
        spec.username
    );

    let result = creator.create_as_user(&spec, credential.secret());
    if let Err(err) = &result {
        log::warn!("spawn of {:?} failed: {}", spec.executable, err);
    }
    result
}

/// Establish that the request names something runnable before we go
/// anywhere near the platform, so a bad path is reported as a bad path
/// rather than as whatever the OS call turns it into.
fn resolve_executable(path: &Path) -> Result<PathBuf, LaunchError> {
    let invalid = || LaunchError::InvalidExecutable {
        path: path.to_path_buf(),
    };

    if path.components().count() == 1 && !path.is_absolute() {
        // A bare program name: search PATH
        return pathsearch::find_executable_in_path(path.as_os_str()).ok_or_else(invalid);
    }

    let metadata = std::fs::metadata(path).map_err(|_| invalid())?;
    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(invalid());
    }
    Ok(path.to_path_buf())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazy_static::lazy_static;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicIsize, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const LOGON_FAILURE: u32 = 1326;

    /// What the stub saw for one create call.  The secret itself is
    /// deliberately not recorded, only its length.
    #[derive(Clone)]
    struct RecordedCall {
        executable: PathBuf,
        command_line: OsString,
        window: WindowVisibility,
        logon: LogonFlags,
        username: String,
        domain: String,
        secret_len: usize,
    }

    /// Stands in for the platform process creator: records every call
    /// and models the two kernel handles a real launch produces with a
    /// shared open-handle counter.
    struct RecordingCreator {
        calls: Mutex<Vec<RecordedCall>>,
        next_pid: AtomicU32,
        open_handles: Arc<AtomicIsize>,
        fail_with: Option<u32>,
    }

    impl RecordingCreator {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                next_pid: AtomicU32::new(100),
                open_handles: Arc::new(AtomicIsize::new(0)),
                fail_with: None,
            }
        }

        fn failing_with(code: u32) -> Self {
            let mut creator = Self::new();
            creator.fail_with = Some(code);
            creator
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        fn outstanding_handles(&self) -> isize {
            self.open_handles.load(Ordering::SeqCst)
        }
    }

    /// Mirrors the drop-guard the real creators keep over the raw
    /// platform handles: anything allocated is released on the error
    /// path as well.
    struct HandleGuard {
        open_handles: Arc<AtomicIsize>,
        count: isize,
    }

    impl Drop for HandleGuard {
        fn drop(&mut self) {
            self.open_handles.fetch_sub(self.count, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct StubProcess {
        pid: u32,
        remaining: isize,
        open_handles: Arc<AtomicIsize>,
    }

    impl StubProcess {
        fn close(&mut self) {
            if self.remaining > 0 {
                self.open_handles
                    .fetch_sub(self.remaining, Ordering::SeqCst);
                self.remaining = 0;
            }
        }
    }

    impl Drop for StubProcess {
        fn drop(&mut self) {
            self.close();
        }
    }

    impl ProcessCreator for RecordingCreator {
        type Process = StubProcess;

        fn create_as_user(
            &self,
            spec: &SpawnSpec,
            secret: &Secret,
        ) -> Result<StubProcess, LaunchError> {
            self.calls.lock().unwrap().push(RecordedCall {
                executable: spec.executable.clone(),
                command_line: spec.command_line.clone(),
                window: spec.window,
                logon: spec.logon,
                username: spec.username.clone(),
                domain: spec.domain.clone(),
                // the stub sees the real secret but keeps only its length
                secret_len: secret.as_str().len(),
            });

            // Model the platform allocating its process/thread pair
            self.open_handles.fetch_add(2, Ordering::SeqCst);
            let guard = HandleGuard {
                open_handles: Arc::clone(&self.open_handles),
                count: 2,
            };

            if let Some(code) = self.fail_with {
                return Err(LaunchError::from_win32("CreateProcessWithLogonW", code));
            }

            std::mem::forget(guard);
            Ok(StubProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                remaining: 2,
                open_handles: Arc::clone(&self.open_handles),
            })
        }
    }

    fn this_binary() -> PathBuf {
        std::env::current_exe().unwrap()
    }

    fn cred(username: &str, domain: Option<&str>, secret: &str) -> Credential {
        Credential::new(username, domain, Secret::new(secret)).unwrap()
    }

    #[test]
    fn missing_executable_never_reaches_the_platform() {
        let creator = RecordingCreator::new();

        let absolute = Command::new("/definitely/not/here/asuser-test");
        let err = launch_with(&creator, &absolute, cred("user", None, "pw")).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidExecutable { .. }));

        let bare = Command::new("asuser-no-such-program");
        let err = launch_with(&creator, &bare, cred("user", None, "pw")).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidExecutable { .. }));

        assert_eq!(creator.call_count(), 0);
    }

    #[test]
    fn domain_is_defaulted_to_local_machine() {
        let creator = RecordingCreator::new();
        let command = Command::new(this_binary());

        launch_with(&creator, &command, cred("user", None, "pw")).unwrap();
        launch_with(&creator, &command, cred("user", Some(""), "pw")).unwrap();
        launch_with(&creator, &command, cred("user", Some("CORP"), "pw")).unwrap();

        let calls = creator.calls();
        assert_eq!(calls[0].domain, ".");
        assert_eq!(calls[1].domain, ".");
        assert_eq!(calls[2].domain, "CORP");
    }

    #[test]
    fn window_and_logon_flags_reach_the_platform() {
        let creator = RecordingCreator::new();
        let mut command = Command::new(this_binary());
        command
            .hide_window()
            .logon_flags(LogonFlags::new().with_profile());

        launch_with(&creator, &command, cred("user", None, "pw")).unwrap();

        let call = &creator.calls()[0];
        assert_eq!(call.window, WindowVisibility::Hidden);
        assert_eq!(call.logon, LogonFlags::new().with_profile());
    }

    #[test]
    fn auth_failure_code_maps_to_authentication_failed() {
        let creator = RecordingCreator::failing_with(LOGON_FAILURE);
        let command = Command::new(this_binary());

        let err = launch_with(&creator, &command, cred("user", None, "pw")).unwrap_err();
        match err {
            LaunchError::AuthenticationFailed { code } => assert_eq!(code, LOGON_FAILURE),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(creator.call_count(), 1);
    }

    #[test]
    fn successful_launch_releases_both_handles_exactly_once() {
        let creator = RecordingCreator::new();
        let command = Command::new(this_binary());

        let mut proc = launch_with(&creator, &command, cred("user", None, "pw")).unwrap();
        assert_eq!(creator.outstanding_handles(), 2);

        proc.close();
        assert_eq!(creator.outstanding_handles(), 0);

        // second close is a no-op, and drop must not release again
        proc.close();
        drop(proc);
        assert_eq!(creator.outstanding_handles(), 0);
    }

    #[test]
    fn dropping_without_close_also_releases() {
        let creator = RecordingCreator::new();
        let command = Command::new(this_binary());

        let proc = launch_with(&creator, &command, cred("user", None, "pw")).unwrap();
        drop(proc);
        assert_eq!(creator.outstanding_handles(), 0);
    }

    #[test]
    fn failed_launch_leaks_no_handles() {
        let creator = RecordingCreator::failing_with(LOGON_FAILURE);
        let command = Command::new(this_binary());

        let _ = launch_with(&creator, &command, cred("user", None, "pw")).unwrap_err();
        assert_eq!(creator.outstanding_handles(), 0);
    }

    #[test]
    fn concurrent_launches_do_not_interleave() {
        let creator = Arc::new(RecordingCreator::new());
        let exe = this_binary();

        let mut workers = Vec::new();
        for i in 0..100 {
            let creator = Arc::clone(&creator);
            let exe = exe.clone();
            workers.push(std::thread::spawn(move || {
                let mut command = Command::new(exe);
                command.arg(format!("payload-{}", i));
                let credential = cred(&format!("user{}", i), None, "pw");
                launch_with(creator.as_ref(), &command, credential)
                    .unwrap()
                    .pid
            }));
        }

        let pids: HashSet<u32> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(pids.len(), 100, "every launch got its own process");

        let calls = creator.calls();
        assert_eq!(calls.len(), 100);
        for call in calls {
            // each recorded request is internally consistent: the
            // command line carries the payload that was issued with
            // this username
            let index: usize = call.username.trim_start_matches("user").parse().unwrap();
            let line = call.command_line.to_string_lossy().into_owned();
            assert!(line.contains(&format!("payload-{}", index)), "{}", line);
            assert_eq!(call.domain, ".");
            assert_eq!(call.secret_len, 2);
            assert_eq!(call.executable, this_binary());
        }
    }

    // --- secret hygiene ----------------------------------------------

    lazy_static! {
        static ref CAPTURED_LOGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
    }

    struct CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            CAPTURED_LOGS
                .lock()
                .unwrap()
                .push(format!("{}", record.args()));
        }

        fn flush(&self) {}
    }

    static LOGGER: CaptureLogger = CaptureLogger;

    #[test]
    fn secret_never_appears_in_logs_or_messages() {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Debug);

        let secret = "hunter2-chocolate-teapot";
        let creator = RecordingCreator::failing_with(LOGON_FAILURE);
        let mut command = Command::new(this_binary());
        command.arg("--verbose");
        let credential = cred("audited-user", Some("CORP"), secret);

        // neither the request nor the credential render the secret
        assert!(!format!("{:?}", command).contains(secret));
        assert!(!format!("{:?}", credential).contains(secret));

        let err = launch_with(&creator, &command, credential).unwrap_err();
        assert!(!format!("{}", err).contains(secret));
        assert!(!format!("{:?}", err).contains(secret));

        let logs = CAPTURED_LOGS.lock().unwrap();
        assert!(
            !logs.is_empty(),
            "the launch path is expected to log the failure"
        );
        for line in logs.iter() {
            assert!(!line.contains(secret), "secret leaked into: {}", line);
        }
    }

    #[test]
    fn resolve_rejects_directories() {
        let dir = std::env::temp_dir();
        assert!(matches!(
            resolve_executable(&dir),
            Err(LaunchError::InvalidExecutable { .. })
        ));
    }

    #[test]
    fn resolve_finds_bare_names_on_path() {
        // the shell is a reasonable thing to expect on PATH everywhere
        let name = if cfg!(windows) { "cmd" } else { "sh" };
        let found = resolve_executable(Path::new(name)).unwrap();
        assert!(found.is_absolute());
    }
}
