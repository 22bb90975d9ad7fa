//! Envelope persistence between acceptance and delivery

pub mod envelope;
pub mod pool;
pub mod store;

pub use envelope::{content_hash, Envelope};
pub use pool::{EnqueueHandle, EnqueuePool};
pub use store::{DurableQueue, MemoryQueue, QueuedRecord, SqliteQueue};
