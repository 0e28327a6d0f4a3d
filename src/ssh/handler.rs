//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to handle SSH connection events.

use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, warn};

/// SSH client handler for russh
///
/// Accepts every server key unless an expected `SHA256:` fingerprint was
/// configured, in which case the server key must match it.
#[derive(Debug, Clone, Default)]
pub struct SshHandler {
    expected_fingerprint: Option<String>,
}

impl SshHandler {
    /// Create a handler that accepts all server keys
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler that only accepts a key with this fingerprint
    pub fn with_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            expected_fingerprint: Some(fingerprint.into()),
        }
    }

    fn accepts(&self, actual: &str) -> bool {
        match self.expected_fingerprint {
            None => true,
            Some(ref expected) => {
                let expected = expected.trim();
                let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
                let actual = actual.strip_prefix("SHA256:").unwrap_or(actual);
                expected.trim_end_matches('=') == actual.trim_end_matches('=')
            }
        }
    }
}

impl russh::client::Handler for SshHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if self.accepts(&fingerprint) {
            debug!("Accepted server key {}", fingerprint);
            Ok(true)
        } else {
            warn!(
                "Server key {} does not match the expected fingerprint {}",
                fingerprint,
                self.expected_fingerprint.as_deref().unwrap_or_default()
            );
            Ok(false)
        }
    }
}
