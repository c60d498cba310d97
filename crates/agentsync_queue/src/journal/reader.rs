//! Journal record reader.
//!
//! Walks a journal image record by record. A record that runs past the end
//! of the image (incomplete header or payload) marks a torn tail: iteration
//! stops cleanly and [`JournalReader::valid_len`] reports where the last
//! complete record ended. Damage before the tail is an error.

use crate::error::{QueueError, QueueResult};
use crate::journal::record::{
    compute_crc32, JournalRecord, RecordType, CRC_SIZE, HEADER_SIZE, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};

/// Iterator over `(offset, record)` pairs of a journal image.
///
/// # Error Handling
///
/// - truncated records end iteration without an error
/// - invalid magic, unsupported version, unknown record type and CRC
///   mismatches yield a [`QueueError::Corruption`] and end iteration
#[derive(Debug)]
pub struct JournalReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> JournalReader<'a> {
    /// Creates a reader over a complete journal image.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            finished: false,
        }
    }

    /// Length of the prefix made of complete records read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset as u64
    }

    /// Bytes after the last complete record.
    #[must_use]
    pub fn torn_len(&self) -> u64 {
        (self.bytes.len() - self.offset) as u64
    }

    fn read_next(&mut self) -> QueueResult<Option<(u64, JournalRecord)>> {
        let start = self.offset;
        let remaining = &self.bytes[start..];
        let at = start as u64;

        if remaining.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = &remaining[..HEADER_SIZE];
        if header[0..4] != JOURNAL_MAGIC {
            return Err(QueueError::corruption(at, "invalid magic"));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > JOURNAL_VERSION {
            return Err(QueueError::corruption(
                at,
                format!("unsupported version {version}"),
            ));
        }

        let type_byte = header[6];
        let record_type = RecordType::from_byte(type_byte).ok_or_else(|| {
            QueueError::corruption(at, format!("unknown record type {type_byte}"))
        })?;

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining.len() < total_len {
            return Ok(None);
        }

        let payload_end = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            remaining[payload_end],
            remaining[payload_end + 1],
            remaining[payload_end + 2],
            remaining[payload_end + 3],
        ]);
        let computed_crc = compute_crc32(&remaining[..payload_end]);
        if stored_crc != computed_crc {
            return Err(QueueError::corruption(
                at,
                format!("checksum mismatch: expected {stored_crc:08x}, got {computed_crc:08x}"),
            ));
        }

        let record =
            JournalRecord::decode_payload(record_type, &remaining[HEADER_SIZE..payload_end], at)?;
        self.offset += total_len;
        Ok(Some((at, record)))
    }
}

impl Iterator for JournalReader<'_> {
    type Item = QueueResult<(u64, JournalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Counts gathered by walking a journal without applying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalSummary {
    /// Total complete records.
    pub records: usize,
    /// `Put` records.
    pub puts: usize,
    /// `Remove` records.
    pub removes: usize,
    /// `RemoveAll` records.
    pub remove_alls: usize,
    /// `Watermark` records.
    pub watermarks: usize,
    /// Bytes covered by complete records.
    pub valid_len: u64,
    /// Bytes of an incomplete final record.
    pub torn_len: u64,
}

/// Walks a journal image and counts its records.
///
/// # Errors
///
/// Returns [`QueueError::Corruption`] if a record before the tail is damaged.
pub fn summarize(bytes: &[u8]) -> QueueResult<JournalSummary> {
    let mut reader = JournalReader::new(bytes);
    let mut summary = JournalSummary::default();

    for item in reader.by_ref() {
        let (_, record) = item?;
        summary.records += 1;
        match record.record_type() {
            RecordType::Put => summary.puts += 1,
            RecordType::Remove => summary.removes += 1,
            RecordType::RemoveAll => summary.remove_alls += 1,
            RecordType::Watermark => summary.watermarks += 1,
        }
    }

    summary.valid_len = reader.valid_len();
    summary.torn_len = reader.torn_len();
    Ok(summary)
}
