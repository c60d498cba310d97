//! # agentsync FFI
//!
//! Stable C ABI for embedding the agentsync protocol in a host process.
//!
//! This crate provides:
//! - `asp_create` / `asp_destroy` handle lifecycle
//! - `asp_persist_diff`, `asp_sync_module`, `asp_parse_response_buffer`
//!   and `asp_reset_module`
//! - Log forwarding from `tracing` to the host's logger callback
//!
//! ## Conventions
//!
//! - Handles are opaque pointers owned by the caller until `asp_destroy`
//! - Strings are null-terminated UTF-8; the library copies what it keeps
//! - Failures are logged and reported as null, `false` or `-1`
//! - Integer values: mode `0` full, `1` delta; operation `0` upsert,
//!   `1` delete; log level `0` debug to `3` error

#![warn(missing_docs)]

mod logging;
mod protocol;
mod queues;
mod types;

pub use protocol::{
    asp_create, asp_destroy, asp_parse_response_buffer, asp_persist_diff, asp_reset_module,
    asp_sync_module,
};
pub use types::{AspHandle, AspLogLevel, AspLogger, AspMqFunctions, MqSendBinaryFn, MqStartFn};
