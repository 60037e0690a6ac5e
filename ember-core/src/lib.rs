//! Ember Core - Shared vocabulary for the ember memcached client.
//!
//! This crate holds the types every other ember crate speaks: strongly-typed
//! node identifiers, the `(flags, bytes)` payload pair that travels between
//! the transcoder and the wire, protocol key validation, and explicit limits.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a node index with a cas token
//! - **Explicit limits**: Every buffer and queue has a bounded maximum
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod payload;
mod types;

pub use error::{Error, Result};
pub use limits::{
    Limits, HEADER_BYTES, MAX_KEY_BYTES, MAX_SASL_STEPS, MAX_VALUE_BYTES, RING_POINTS_PER_NODE,
};
pub use payload::{validate_key, Payload};
pub use types::NodeId;
