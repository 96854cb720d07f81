//! RESP frame types.
//!
//! Replies are exposed to callers as [`Frame`] values; commands are
//! encoded as arrays of bulk strings.

/// Frame type definitions.
pub mod types;

pub use types::Frame;
