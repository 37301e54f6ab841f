use crate::credential::Credential;
use crate::error::LaunchError;
use crate::platform::Process;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// How the new process' window (if it creates one) is initially shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVisibility {
    Normal,
    Hidden,
    Minimized,
}

impl Default for WindowVisibility {
    fn default() -> Self {
        WindowVisibility::Normal
    }
}

/// Options for how the platform performs the logon.
///
/// `with_profile` loads the target user's profile before the process
/// starts; `net_credentials_only` uses the credential for outbound
/// network access only.  Both map directly onto the flags of the
/// Windows logon-spawn call and are ignored by the POSIX spawn path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogonFlags {
    with_profile: bool,
    net_credentials_only: bool,
}

impl LogonFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self) -> Self {
        self.with_profile = true;
        self
    }

    pub fn net_credentials_only(mut self) -> Self {
        self.net_credentials_only = true;
        self
    }

    #[cfg(windows)]
    pub(crate) fn loads_profile(self) -> bool {
        self.with_profile
    }

    #[cfg(windows)]
    pub(crate) fn network_only(self) -> bool {
        self.net_credentials_only
    }
}

/// Describes the process to be launched: the executable, its arguments
/// and working directory, and how its window and logon behave.
///
/// ```no_run
/// use asuser::{Command, Credential, Secret, WindowVisibility};
///
/// let cred = Credential::new("build", None, Secret::new("pw"))?;
/// let mut cmd = Command::new("C:\\tools\\build.exe");
/// cmd.arg("--release")
///     .current_dir("C:\\src")
///     .window(WindowVisibility::Hidden);
/// let proc = cmd.spawn_as_user(cred)?;
/// # Ok::<(), asuser::LaunchError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    executable: PathBuf,
    args: Vec<OsString>,
    cmdline: Option<OsString>,
    cwd: Option<PathBuf>,
    window: WindowVisibility,
    logon: LogonFlags,
}

impl Command {
    /// Describe a launch of `executable`.  A bare program name is
    /// resolved through `PATH` at spawn time; anything with a path
    /// component is used as given.
    pub fn new<P: Into<PathBuf>>(executable: P) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            cmdline: None,
            cwd: None,
            window: WindowVisibility::default(),
            logon: LogonFlags::default(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Replace the generated command line with a verbatim one.  The
    /// line must include the program name as its first token; no
    /// quoting is applied.
    pub fn set_cmdline<S: Into<OsString>>(&mut self, cmdline: S) -> &mut Self {
        self.cmdline = Some(cmdline.into());
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(&mut self, dir: P) -> &mut Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn window(&mut self, window: WindowVisibility) -> &mut Self {
        self.window = window;
        self
    }

    /// Shorthand for `window(WindowVisibility::Hidden)`.
    pub fn hide_window(&mut self) -> &mut Self {
        self.window(WindowVisibility::Hidden)
    }

    pub fn logon_flags(&mut self, logon: LogonFlags) -> &mut Self {
        self.logon = logon;
        self
    }

    /// Start the process under `credential`'s identity.
    ///
    /// The credential is consumed; its secret is cleared when this call
    /// returns, whether or not the launch succeeded.  On success the
    /// returned [`Process`] owns the platform handles and releases them
    /// when closed or dropped.
    pub fn spawn_as_user(&self, credential: Credential) -> Result<Process, LaunchError> {
        crate::launcher::launch(self, credential)
    }

    pub(crate) fn executable(&self) -> &Path {
        &self.executable
    }

    pub(crate) fn argv(&self) -> &[OsString] {
        &self.args
    }

    pub(crate) fn cmdline_override(&self) -> Option<&OsStr> {
        self.cmdline.as_deref()
    }

    pub(crate) fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub(crate) fn window_visibility(&self) -> WindowVisibility {
        self.window
    }

    pub(crate) fn logon(&self) -> LogonFlags {
        self.logon
    }
}

/// Join the executable and argument list into a single command line
/// using the Windows quoting convention, so the spawned program's
/// runtime splits it back into the same argv.
pub(crate) fn build_command_line(
    executable: &Path,
    args: &[OsString],
    override_line: Option<&OsStr>,
) -> OsString {
    if let Some(line) = override_line {
        return line.to_os_string();
    }
    let mut line = String::new();
    append_quoted(&executable.to_string_lossy(), &mut line);
    for arg in args {
        line.push(' ');
        append_quoted(&arg.to_string_lossy(), &mut line);
    }
    line.into()
}

fn append_quoted(arg: &str, out: &mut String) {
    if !arg.is_empty() && !arg.contains(|c: char| c == ' ' || c == '\t' || c == '"') {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut chars = arg.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let mut count = 1;
            while chars.peek() == Some(&'\\') {
                chars.next();
                count += 1;
            }
            // Backslashes only need doubling when they precede a quote
            // (including the closing quote we add below).
            let doubled = match chars.peek() {
                Some('"') | None => count * 2,
                _ => count,
            };
            for _ in 0..doubled {
                out.push('\\');
            }
        } else if c == '"' {
            out.push('\\');
            out.push('"');
        } else {
            out.push(c);
        }
    }
    out.push('"');
}
