//! CLI command implementations.

pub mod compact;
pub mod inspect;
pub mod purge;
pub mod simulate;
pub mod verify;
