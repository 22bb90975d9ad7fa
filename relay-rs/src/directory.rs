//! User/group directory consumed by the SMTP core
//!
//! The directory itself (records, admin API, storage) lives outside this
//! crate. The core only needs four things from it:
//! - resolve a mailbox (inbox address) by address
//! - resolve a group (manager + members) by address
//! - verify a credential
//! - fetch a site-wide configuration secret
//!
//! [`MemoryDirectory`] is a read-only implementation loaded from a TOML file,
//! enough to run the server standalone and to drive tests.
//!
//! ```toml
//! [[users]]
//! address = "alice@example.com"
//! inbox = "alice@inbox.example.net"
//! password_hash = "$argon2id$v=19$..."
//!
//! [[groups]]
//! address = "team@example.com"
//! manager = "alice@example.com"
//! members = ["alice@example.com", "bob@example.com"]
//! ```

use crate::error::{RelayError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the secret used to key password hashes
pub const PASSWORD_SALT_SECRET: &str = "PASSWORD_SALT";

/// A mailing group: a manager plus an ordered set of member addresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub manager: String,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl Group {
    pub fn is_member(&self, address: &str) -> bool {
        self.manager == address || self.members.contains(address)
    }

    /// Returns false if the address was already a member
    pub fn add_member(&mut self, address: impl Into<String>) -> bool {
        self.members.insert(address.into())
    }

    /// Returns false if the address was not a member
    pub fn remove_member(&mut self, address: &str) -> bool {
        self.members.remove(address)
    }
}

#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    /// Inbox address of the user registered under `address`
    async fn resolve_user_inbox(&self, address: &str) -> Result<Option<String>>;

    /// Group registered under `address`
    async fn resolve_group_members(&self, address: &str) -> Result<Option<Group>>;

    /// Check a plaintext password against the user's stored credential
    async fn verify_credential(&self, username: &str, password: &str) -> Result<bool>;

    /// Site-wide secret by name
    fn config_secret(&self, name: &str) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct UserRecord {
    address: String,
    inbox: String,
    #[serde(default)]
    password_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct GroupRecord {
    address: String,
    manager: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    groups: Vec<GroupRecord>,
}

/// Read-only directory held in memory
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: HashMap<String, UserRecord>,
    groups: HashMap<String, Group>,
    secrets: HashMap<String, Vec<u8>>,
}

fn key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Argon2 keyed with the site-wide secret when there is one
fn hasher(secret: Option<&[u8]>) -> Result<Argon2<'_>> {
    match secret {
        Some(secret) => Argon2::new_with_secret(
            secret,
            Algorithm::Argon2id,
            Version::V0x13,
            Params::default(),
        )
        .map_err(|e| RelayError::Directory(format!("Invalid password secret: {}", e))),
        None => Ok(Argon2::default()),
    }
}

/// Produce a PHC hash string suitable for `password_hash`
pub fn hash_password(secret: Option<&[u8]>, password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = hasher(secret)?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| RelayError::Directory(format!("Failed to hash password: {}", e)))?;

    Ok(password_hash.to_string())
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::Config(format!("Failed to read directory file: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: DirectoryFile = toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse directory file: {}", e)))?;

        let mut directory = Self::new();
        for user in file.users {
            directory.users.insert(key(&user.address), user);
        }
        for group in file.groups {
            directory.groups.insert(
                key(&group.address),
                Group {
                    manager: group.manager,
                    members: group.members.into_iter().collect(),
                },
            );
        }

        info!(
            "Directory loaded: {} users, {} groups",
            directory.users.len(),
            directory.groups.len()
        );
        Ok(directory)
    }

    pub fn with_user(mut self, address: &str, inbox: &str, password_hash: Option<String>) -> Self {
        self.users.insert(
            key(address),
            UserRecord {
                address: address.to_string(),
                inbox: inbox.to_string(),
                password_hash,
            },
        );
        self
    }

    pub fn with_group(mut self, address: &str, group: Group) -> Self {
        self.groups.insert(key(address), group);
        self
    }

    pub fn with_secret(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(name.to_string(), value.into());
        self
    }
}

#[async_trait::async_trait]
impl Directory for MemoryDirectory {
    async fn resolve_user_inbox(&self, address: &str) -> Result<Option<String>> {
        Ok(self.users.get(&key(address)).map(|user| user.inbox.clone()))
    }

    async fn resolve_group_members(&self, address: &str) -> Result<Option<Group>> {
        Ok(self.groups.get(&key(address)).cloned())
    }

    async fn verify_credential(&self, username: &str, password: &str) -> Result<bool> {
        let Some(stored) = self
            .users
            .get(&key(username))
            .and_then(|user| user.password_hash.as_deref())
        else {
            debug!("No credential stored for {}", username);
            return Ok(false);
        };

        let parsed = match PasswordHash::new(stored) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unreadable credential for {}: {}", username, e);
                return Ok(false);
            }
        };

        let secret = self.config_secret(PASSWORD_SALT_SECRET);
        let argon2 = hasher(secret.as_deref())?;
        Ok(argon2.verify_password(password.as_bytes(), &parsed).is_ok())
    }

    /// Explicit secrets first, then `RELAY_<NAME>` (base64) from the environment
    fn config_secret(&self, name: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.secrets.get(name) {
            return Some(value.clone());
        }

        let encoded = std::env::var(format!("RELAY_{}", name)).ok()?;
        match BASE64.decode(encoded.trim()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Error while decoding config value {}: {}", name, e);
                None
            }
        }
    }
}
