// memmeta-common - Shared types and the meta protocol codec for memmeta
//
// This crate defines the wire codec and error taxonomy used by the client

pub mod error;
pub mod types;
pub mod protocol;

// Re-export for convenience
pub use error::*;
pub use types::*;
pub use protocol::*;
