mod command;
mod credential;
mod error;
mod launcher;
mod platform;

pub use command::{Command, LogonFlags, WindowVisibility};
pub use credential::{Credential, Secret};
pub use error::LaunchError;
pub use platform::Process;

#[cfg(windows)]
fn win32_error_with_context(context: &str, err: std::io::Error) -> std::io::Error {
    std::io::Error::new(err.kind(), format!("{}: {}", context, err))
}

#[cfg(windows)]
fn os_str_to_null_terminated_vec(s: &std::ffi::OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().chain(std::iter::once(0)).collect()
}
