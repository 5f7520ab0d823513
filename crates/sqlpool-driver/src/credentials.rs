//! Database credentials.

use std::fmt;

/// Optional username/password pair used when opening raw connections.
///
/// When [`has_credentials`](Self::has_credentials) is false the pool calls
/// [`DataSource::connect`](crate::DataSource::connect), otherwise
/// [`DataSource::connect_with`](crate::DataSource::connect_with).
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Credentials {
    /// Login name.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
}

impl Credentials {
    /// Credentials with both a username and a password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// No credentials; the data source decides how to authenticate.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether a username was supplied.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
