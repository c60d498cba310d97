//! Append-only journal of queue mutations.
//!
//! Every mutation of the queue is one framed record:
//!
//! ```text
//! | magic "ASPJ" (4) | version (2) | type (1) | payload length (4) | payload | CRC32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers the header and payload.

mod reader;
mod record;

pub use reader::{summarize, JournalReader, JournalSummary};
pub use record::{
    compute_crc32, JournalRecord, RecordType, CRC_SIZE, HEADER_SIZE, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
