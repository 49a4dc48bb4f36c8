//! RADIUS wire types used by the load generator.
//!
//! Only the Access-Request side of the exchange is built here; replies are
//! parsed just far enough to verify them against the request.

pub mod packet;

pub use packet::*;

use serde::Deserialize;
use std::fmt;

/// Shared secret between the load generator and the RADIUS server.
///
/// Configured once per run and shared by reference with every client.
/// `Debug` output never contains the secret bytes.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(from = "String")]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SharedSecret {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&str> for SharedSecret {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes redacted>)", self.0.len())
    }
}

/// Identity and plaintext password sent in every Access-Request.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SharedSecret::from("testing123");
        let shown = format!("{:?}", secret);
        assert!(!shown.contains("testing123"));
        assert!(shown.contains("10 bytes"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("testuser", "testpassword");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("testuser"));
        assert!(!shown.contains("testpassword"));
    }
}
