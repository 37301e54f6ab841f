//! Credential types.
//!
//! The secret is never revealed by `Debug` output and its memory is
//! cleared when the value is dropped.

use crate::error::LaunchError;
use std::fmt;

/// The domain value passed to the platform when the caller did not name
/// one: on Windows, "." selects the local account database.
pub(crate) const LOCAL_DOMAIN: &str = ".";

/// A secret that zeros its memory on drop.
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Secret(secret.into())
    }

    /// The secret itself.  Only the platform spawn call should need this.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Secret(self.0.clone())
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        // SAFETY: we own this String and are zeroing it before drop
        unsafe {
            for byte in self.0.as_bytes_mut() {
                std::ptr::write_volatile(byte, 0);
            }
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(*** {} bytes ***)", self.0.len())
    }
}

/// The identity to launch a process as: an account name, an optional
/// domain (absent or empty means the local machine) and the secret.
///
/// A `Credential` is immutable once constructed and is consumed by
/// [`Command::spawn_as_user`](crate::Command::spawn_as_user), so the
/// secret's lifetime ends with the launch attempt.
#[derive(Debug, Clone)]
pub struct Credential {
    username: String,
    domain: Option<String>,
    secret: Secret,
}

impl Credential {
    pub fn new(
        username: impl Into<String>,
        domain: Option<&str>,
        secret: Secret,
    ) -> Result<Self, LaunchError> {
        let username = username.into();
        if username.is_empty() {
            return Err(LaunchError::InvalidCredential {
                reason: "username must not be empty",
            });
        }
        Ok(Self {
            username,
            domain: domain.map(|d| d.to_string()),
            secret,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The domain exactly as the platform wants it: the caller's value,
    /// or the local-machine marker when none was given.
    pub(crate) fn domain_for_logon(&self) -> &str {
        match self.domain.as_deref() {
            Some(d) if !d.is_empty() => d,
            _ => LOCAL_DOMAIN,
        }
    }

    pub(crate) fn secret(&self) -> &Secret {
        &self.secret
    }
}
