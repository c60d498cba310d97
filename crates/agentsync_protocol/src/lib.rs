//! # agentsync protocol
//!
//! Wire frames exchanged between an agent module and the manager.
//!
//! This crate provides:
//! - [`Mode`], [`Operation`] and [`Status`] with their integer mappings
//! - the six protocol messages ([`Start`], [`Data`], [`End`] from the agent,
//!   [`StartAck`], [`EndAck`], [`ReqRet`] from the manager)
//! - the versioned frame envelope ([`Message::encode`], [`Message::decode`])
//! - inclusive [`SeqRange`] lists used for acknowledgments
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Frame layout
//!
//! ```text
//! | magic "AS" (2) | version (1) | message type (1) | CBOR body |
//! ```
//!
//! The envelope is validated before the body is interpreted, and a frame
//! with bytes left over after the body is rejected.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod ranges;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Data, End, EndAck, Message, MessageType, ReqRet, Start, StartAck, FRAME_MAGIC,
    PROTOCOL_VERSION,
};
pub use ranges::{compress_seqs, SeqRange};
pub use types::{Mode, Operation, Status};
