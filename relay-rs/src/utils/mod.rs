//! Utility modules
//!
//! - [`address`]: envelope address extraction and hostname validation
//! - [`dns`]: MX lookup
//! - [`mime`]: encoded-word header decoding

pub mod address;
pub mod dns;
pub mod mime;

pub use address::{extract_address, valid_host, Address};
pub use dns::{DnsMxResolver, MxRecord, MxResolver};
pub use mime::decode_header;
