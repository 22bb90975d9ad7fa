use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A message accepted for one recipient, as persisted in the durable queue
///
/// `from` and `to` hold the envelope strings exactly as the client sent them;
/// they are parsed again at delivery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub data: String,
    pub subject: String,
    pub username: String,
    #[serde(rename = "auth")]
    pub authenticated: bool,
}

impl Envelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// Identifier reported back as `queued as <hash>`
pub fn content_hash(to: &str, from: &str, subject: &str) -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1000);

    let mut hasher = Sha256::new();
    hasher.update(to.as_bytes());
    hasher.update(from.as_bytes());
    hasher.update(subject.as_bytes());
    hasher.update(nanos.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
