//! relay-rs: SMTP front end with a durable queue and MX relay
//!
//! Accepts inbound SMTP, authenticates senders with AUTH LOGIN, queues each
//! accepted message durably, and delivers from the queue in the background:
//! recipients in a local domain are resolved through the [`directory`] to
//! their inbox (or to every member of a group); everything else is relayed
//! to the recipient's mail exchanger.
//!
//! # Pipeline
//!
//! ```text
//! client --> SmtpSession --> EnqueuePool --> DurableQueue --> DeliveryEngine --> MX
//! ```
//!
//! Sessions wait for their message to be persisted before answering, so a
//! `250 OK : queued as <hash>` means the envelope is in the queue. Delivery
//! is a single attempt per envelope.
//!
//! # Example
//!
//! ```no_run
//! use relay_rs::config::Config;
//! use relay_rs::directory::MemoryDirectory;
//! use relay_rs::queue::SqliteQueue;
//! use relay_rs::smtp::SmtpServer;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let queue = Arc::new(SqliteQueue::new(&config.queue.database_url).await?);
//!     let directory = Arc::new(MemoryDirectory::from_file("directory.toml")?);
//!
//!     let server = SmtpServer::new(config, directory, queue);
//!     server.run(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`directory`]: User/group directory interface
//! - [`queue`]: Envelope, durable queue, enqueue worker pool
//! - [`smtp`]: Sessions, accept loop, delivery engine, relay client
//! - [`security`]: TLS and AUTH LOGIN
//! - [`utils`]: Address extraction, MIME header decoding, MX lookup

pub mod config;
pub mod directory;
pub mod error;
pub mod queue;
pub mod security;
pub mod smtp;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
