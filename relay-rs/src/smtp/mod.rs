//! SMTP front end and delivery pipeline
//!
//! - [`server`]: accept loop and concurrency limiter
//! - [`session`]: per-connection state machine
//! - [`commands`]: command line parsing
//! - [`delivery`]: queue-draining delivery engine
//! - [`client`]: outbound SMTP used to relay to remote exchanges

pub mod client;
pub mod commands;
pub mod delivery;
pub mod server;
pub mod session;

pub use client::{MailRelay, SmtpClient};
pub use commands::SmtpCommand;
pub use delivery::DeliveryEngine;
pub use server::SmtpServer;
pub use session::{SessionContext, SessionState, SmtpSession};
