//! SMTP AUTH LOGIN
//!
//! Username and password arrive on separate lines, each base64 encoded.
//! Verification is delegated to the [`Directory`]; a user that does not
//! resolve fails closed without touching the credential store.

use crate::directory::Directory;
use crate::error::{RelayError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checks AUTH LOGIN credentials against the directory
#[derive(Clone)]
pub struct Authenticator {
    directory: Arc<dyn Directory>,
}

impl Authenticator {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Decode one AUTH LOGIN line (username or password)
    pub fn decode_login_credential(credential: &str) -> Result<String> {
        let decoded = BASE64
            .decode(credential.trim())
            .map_err(|e| RelayError::Decode(format!("Invalid base64: {}", e)))?;

        String::from_utf8(decoded).map_err(|e| RelayError::Decode(format!("Invalid UTF-8: {}", e)))
    }

    /// True only if the user resolves and the password verifies
    ///
    /// Directory failures count as a failed attempt.
    pub async fn authenticate(&self, username: &str, password: &str) -> bool {
        debug!("Authentication attempt for {}", username);

        match self.check(username, password).await {
            Ok(true) => {
                info!("Authentication successful for {}", username);
                true
            }
            Ok(false) => {
                warn!("Authentication failed for {}", username);
                false
            }
            Err(e) => {
                warn!("Authentication failed for {}: {}", username, e);
                false
            }
        }
    }

    async fn check(&self, username: &str, password: &str) -> Result<bool> {
        if self.directory.resolve_user_inbox(username).await?.is_none() {
            return Ok(false);
        }
        self.directory.verify_credential(username, password).await
    }
}
