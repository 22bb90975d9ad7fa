//! Envelope address extraction and hostname validation

use crate::error::{RelayError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// A parsed `local@host` mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub local: String,
    pub host: String,
}

impl Address {
    /// Case-insensitive check against a set of lowercased domains
    pub fn host_in(&self, domains: &std::collections::HashSet<String>) -> bool {
        domains.contains(&self.host.to_ascii_lowercase())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.host)
    }
}

fn angle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(.+?)@(.+?)>").expect("valid regex"))
}

fn host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*",
            r"([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
        ))
        .expect("valid regex")
    })
}

/// Whether `host` is a syntactically valid DNS name (letters, digits, inner hyphens)
pub fn valid_host(host: &str) -> bool {
    host_regex().is_match(host.trim())
}

/// Extract `local@host` from either `<user@host>` or bare `user@host`
///
/// # Examples
/// ```
/// use relay_rs::utils::extract_address;
///
/// let addr = extract_address("<user@example.com>").unwrap();
/// assert_eq!(addr.local, "user");
/// assert_eq!(addr.host, "example.com");
/// ```
pub fn extract_address(input: &str) -> Result<Address> {
    let (local, host) = match angle_regex().captures(input) {
        Some(caps) => (caps[1].to_string(), caps[2].trim().to_string()),
        None => match input.trim().split_once('@') {
            Some((local, host)) => (local.to_string(), host.trim().to_string()),
            None => (String::new(), String::new()),
        },
    };

    if local.is_empty() || !valid_host(&host) {
        return Err(RelayError::InvalidAddress(format!(
            "[{}@{}] address: {}",
            local, host, input
        )));
    }

    Ok(Address { local, host })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_angle_and_bare_forms() {
        let expected = Address {
            local: "user".to_string(),
            host: "example.com".to_string(),
        };
        assert_eq!(extract_address("<user@example.com>").unwrap(), expected);
        assert_eq!(extract_address("user@example.com").unwrap(), expected);
        assert_eq!(extract_address(" <user@example.com> SIZE=100").unwrap(), expected);
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(matches!(
            extract_address("user@@bad host"),
            Err(RelayError::InvalidAddress(_))
        ));
        assert!(extract_address("").is_err());
        assert!(extract_address("no-at-sign").is_err());
        assert!(extract_address("@example.com").is_err());
        assert!(extract_address("<>").is_err());
        assert!(extract_address("user@-bad.com").is_err());
    }

    #[test]
    fn test_valid_host() {
        assert!(valid_host("example.com"));
        assert!(valid_host("mail-1.sub.example.co.uk"));
        assert!(valid_host("localhost"));
        assert!(!valid_host("bad host"));
        assert!(!valid_host("@bad"));
        assert!(!valid_host("trailing-.com"));
        assert!(!valid_host(""));
    }

    #[test]
    fn test_display_and_domain_membership() {
        let addr = extract_address("Alice@Example.COM").unwrap();
        assert_eq!(addr.to_string(), "Alice@Example.COM");

        let domains: HashSet<String> = ["example.com".to_string()].into_iter().collect();
        assert!(addr.host_in(&domains));
    }
}
