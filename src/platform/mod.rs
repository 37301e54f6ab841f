#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::NativeCreator;
#[cfg(unix)]
pub use unix::Process;

#[cfg(windows)]
pub(crate) use windows::NativeCreator;
#[cfg(windows)]
pub use windows::Process;
