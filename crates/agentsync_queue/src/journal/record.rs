//! Journal record types and serialization.

use crate::error::{QueueError, QueueResult};
use crate::types::PersistedDiff;
use agentsync_protocol::Operation;

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"ASPJ";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + type (1) + length (4).
pub const HEADER_SIZE: usize = 11;

/// CRC size.
pub const CRC_SIZE: usize = 4;

/// Type of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A row was inserted.
    Put = 1,
    /// A row was removed.
    Remove = 2,
    /// Every row of a module was removed.
    RemoveAll = 3,
    /// Seq floor for a module, written by compaction.
    Watermark = 4,
}

impl RecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Remove),
            3 => Some(Self::RemoveAll),
            4 => Some(Self::Watermark),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One journalled mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// A row was inserted.
    Put {
        /// Module owning the row.
        module: String,
        /// The row, with its assigned seq.
        diff: PersistedDiff,
    },

    /// A row was removed.
    Remove {
        /// Module owning the row.
        module: String,
        /// Seq of the removed row.
        seq: u64,
    },

    /// Every row of a module was removed.
    RemoveAll {
        /// Module being reset.
        module: String,
    },

    /// The next seq a module may assign is at least `next_seq`.
    Watermark {
        /// Module name.
        module: String,
        /// Seq floor.
        next_seq: u64,
    },
}

impl JournalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Put { .. } => RecordType::Put,
            Self::Remove { .. } => RecordType::Remove,
            Self::RemoveAll { .. } => RecordType::RemoveAll,
            Self::Watermark { .. } => RecordType::Watermark,
        }
    }

    /// Returns the module the record belongs to.
    #[must_use]
    pub fn module(&self) -> &str {
        match self {
            Self::Put { module, .. }
            | Self::Remove { module, .. }
            | Self::RemoveAll { module }
            | Self::Watermark { module, .. } => module,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a string field does not fit a 4-byte length.
    pub fn encode_payload(&self) -> QueueResult<Vec<u8>> {
        let mut buf = Vec::new();
        put_str(&mut buf, self.module())?;

        match self {
            Self::Put { diff, .. } => {
                buf.extend_from_slice(&diff.seq.to_le_bytes());
                buf.push(diff.operation.as_u8());
                put_str(&mut buf, &diff.id)?;
                put_str(&mut buf, &diff.index)?;
                put_str(&mut buf, &diff.data)?;
            }
            Self::Remove { seq, .. } => {
                buf.extend_from_slice(&seq.to_le_bytes());
            }
            Self::RemoveAll { .. } => {}
            Self::Watermark { next_seq, .. } => {
                buf.extend_from_slice(&next_seq.to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// `offset` is only used to label errors.
    pub fn decode_payload(
        record_type: RecordType,
        payload: &[u8],
        offset: u64,
    ) -> QueueResult<Self> {
        let mut reader = PayloadReader {
            payload,
            cursor: 0,
            offset,
        };
        let module = reader.string()?;

        let record = match record_type {
            RecordType::Put => {
                let seq = reader.u64()?;
                let op_byte = reader.u8()?;
                let operation = Operation::try_from(op_byte).map_err(|_| {
                    QueueError::corruption(offset, format!("invalid operation {op_byte}"))
                })?;
                let id = reader.string()?;
                let index = reader.string()?;
                let data = reader.string()?;
                Self::Put {
                    module,
                    diff: PersistedDiff {
                        seq,
                        id,
                        index,
                        operation,
                        data,
                    },
                }
            }
            RecordType::Remove => Self::Remove {
                module,
                seq: reader.u64()?,
            },
            RecordType::RemoveAll => Self::RemoveAll { module },
            RecordType::Watermark => Self::Watermark {
                module,
                next_seq: reader.u64()?,
            },
        };

        if reader.cursor != payload.len() {
            return Err(QueueError::corruption(
                offset,
                format!(
                    "trailing bytes in {:?} record: expected {} bytes, got {}",
                    record_type,
                    reader.cursor,
                    payload.len()
                ),
            ));
        }
        Ok(record)
    }

    /// Encodes the full framed record: header, payload and CRC.
    pub fn encode_frame(&self) -> QueueResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| QueueError::invalid_argument("journal record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        // CRC32 over everything before it
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str) -> QueueResult<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        QueueError::invalid_argument(format!("field too large: {} bytes", value.len()))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
    offset: u64,
}

impl PayloadReader<'_> {
    fn take(&mut self, n: usize) -> QueueResult<&[u8]> {
        let end = self
            .cursor
            .checked_add(n)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| QueueError::corruption(self.offset, "unexpected end of payload"))?;
        let bytes = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> QueueResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> QueueResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> QueueResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn string(&mut self) -> QueueResult<String> {
        let len = self.u32()? as usize;
        let offset = self.offset;
        let bytes = self.take(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| QueueError::corruption(offset, "invalid UTF-8"))
    }
}

/// Computes CRC32 checksum (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(seq: u64) -> JournalRecord {
        JournalRecord::Put {
            module: "FIM".into(),
            diff: PersistedDiff::new("a", "fim_file", Operation::Upsert, "{\"v\":1}").with_seq(seq),
        }
    }

    #[test]
    fn crc32_known_value() {
        // Standard check value for "123456789".
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frame_layout() {
        let frame = put(1).encode_frame().unwrap();
        assert_eq!(&frame[0..4], b"ASPJ");
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), JOURNAL_VERSION);
        assert_eq!(frame[6], RecordType::Put.as_byte());

        let len = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]) as usize;
        assert_eq!(frame.len(), HEADER_SIZE + len + CRC_SIZE);

        let body_end = frame.len() - CRC_SIZE;
        let crc = u32::from_le_bytes(frame[body_end..].try_into().unwrap());
        assert_eq!(crc, compute_crc32(&frame[..body_end]));
    }

    #[test]
    fn payload_decodes_back() {
        for record in [
            put(7),
            JournalRecord::Remove {
                module: "FIM".into(),
                seq: 7,
            },
            JournalRecord::RemoveAll {
                module: "syscollector".into(),
            },
            JournalRecord::Watermark {
                module: "FIM".into(),
                next_seq: 99,
            },
        ] {
            let payload = record.encode_payload().unwrap();
            let decoded = JournalRecord::decode_payload(record.record_type(), &payload, 0).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn trailing_payload_bytes_are_corruption() {
        let mut payload = JournalRecord::RemoveAll {
            module: "FIM".into(),
        }
        .encode_payload()
        .unwrap();
        payload.push(0);

        let result = JournalRecord::decode_payload(RecordType::RemoveAll, &payload, 40);
        assert!(matches!(result, Err(QueueError::Corruption { offset: 40, .. })));
    }

    #[test]
    fn short_payload_is_corruption() {
        let payload = put(1).encode_payload().unwrap();
        let result = JournalRecord::decode_payload(RecordType::Put, &payload[..6], 0);
        assert!(matches!(result, Err(QueueError::Corruption { .. })));
    }

    #[test]
    fn unknown_operation_is_corruption() {
        let mut payload = put(1).encode_payload().unwrap();
        // module "FIM" (4 + 3 bytes) then seq (8 bytes) then the operation byte
        payload[15] = 9;
        let result = JournalRecord::decode_payload(RecordType::Put, &payload, 0);
        assert!(matches!(result, Err(QueueError::Corruption { .. })));
    }
}
