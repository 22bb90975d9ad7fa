//! Security module
//!
//! - [`auth`]: AUTH LOGIN decoding and credential checks
//! - [`tls`]: TLS material for STARTTLS

pub mod auth;
pub mod tls;

pub use auth::Authenticator;
pub use tls::TlsConfig;
