use std::path::PathBuf;
use thiserror::Error;

const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_INVALID_PASSWORD: u32 = 86;
const ERROR_PRIVILEGE_NOT_HELD: u32 = 1314;
const ERROR_LOGON_FAILURE: u32 = 1326;
const ERROR_ACCOUNT_RESTRICTION: u32 = 1327;
const ERROR_LOGON_TYPE_NOT_GRANTED: u32 = 1385;

/// Why a launch attempt failed.
///
/// Precondition failures (`InvalidExecutable`, `InvalidCredential`) are
/// reported without ever reaching the platform; the remaining variants
/// carry the platform's failure code, captured at the point of failure.
/// None of the messages contain the secret.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The executable path or command line does not resolve to a
    /// runnable file.  Checked before the platform call is made.
    #[error("{path:?} does not resolve to an executable file")]
    InvalidExecutable { path: PathBuf },

    /// The credential is malformed and was rejected before the
    /// platform call.
    #[error("invalid credential: {reason}")]
    InvalidCredential { reason: &'static str },

    /// The platform rejected the username/domain/secret combination.
    #[error("the credential was rejected (os error {code})")]
    AuthenticationFailed { code: u32 },

    /// The caller lacks the rights to log on as the requested user, or
    /// the target account is not allowed to log on.
    #[error("not permitted to log on as the requested user (os error {code})")]
    PermissionDenied { code: u32 },

    /// Any other platform-reported failure, with the failing call and
    /// the raw code for diagnostics.
    #[error("{call} failed (os error {code})")]
    Platform { call: &'static str, code: u32 },
}

impl LaunchError {
    /// Sort a win32 failure code from the process-creation call into
    /// the taxonomy above.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn from_win32(call: &'static str, code: u32) -> Self {
        match code {
            ERROR_INVALID_PASSWORD | ERROR_LOGON_FAILURE | ERROR_ACCOUNT_RESTRICTION => {
                LaunchError::AuthenticationFailed { code }
            }
            ERROR_ACCESS_DENIED | ERROR_PRIVILEGE_NOT_HELD | ERROR_LOGON_TYPE_NOT_GRANTED => {
                LaunchError::PermissionDenied { code }
            }
            _ => LaunchError::Platform { call, code },
        }
    }
}
