//! Protocol messages and the frame envelope.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ranges::SeqRange;
use crate::types::{Mode, Operation, Status};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 2] = *b"AS";

/// Protocol version written into every frame.
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 4;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Agent opens a round.
    Start = 1,
    /// Agent streams one diff.
    Data = 2,
    /// Agent closes the stream.
    End = 3,
    /// Manager answers Start.
    StartAck = 4,
    /// Manager answers End with the acknowledgment set.
    EndAck = 5,
    /// Manager asks for seqs it did not receive.
    ReqRet = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Start),
            2 => Ok(Self::Data),
            3 => Ok(Self::End),
            4 => Ok(Self::StartAck),
            5 => Ok(Self::EndAck),
            6 => Ok(Self::ReqRet),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Opens a synchronization round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    /// Round identifier chosen by the agent.
    pub session: u64,
    /// Module being synchronized.
    pub module: String,
    /// Full or delta round.
    pub mode: Mode,
    /// Number of Data frames that will follow.
    pub size: u64,
}

/// One pending diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// Round identifier.
    pub session: u64,
    /// Storage sequence number, the acknowledgment key.
    pub seq: u64,
    /// Logical identifier of the changed entity.
    pub id: String,
    /// Destination collection.
    pub index: String,
    /// Upsert or delete.
    pub operation: Operation,
    /// Opaque serialized document.
    pub data: String,
}

/// Closes the Data stream of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct End {
    /// Round identifier.
    pub session: u64,
}

/// Manager reply to [`Start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAck {
    /// Whether the manager accepted the round.
    pub status: Status,
    /// Round identifier being answered.
    pub session: u64,
    /// Module of the round.
    pub module: String,
}

/// Manager reply to [`End`], carrying the reconciliation set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndAck {
    /// Whether the manager accepted the round.
    pub status: Status,
    /// Round identifier being answered.
    pub session: u64,
    /// Module of the round.
    pub module: String,
    /// Seqs applied by the manager.
    pub acknowledged: Vec<SeqRange>,
    /// Seqs the manager refused; they stay pending.
    pub rejected: Vec<SeqRange>,
}

/// Manager request to resend seqs it is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqRet {
    /// Round identifier.
    pub session: u64,
    /// Module of the round.
    pub module: String,
    /// Seqs to resend.
    pub ranges: Vec<SeqRange>,
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// See [`Start`].
    Start(Start),
    /// See [`Data`].
    Data(Data),
    /// See [`End`].
    End(End),
    /// See [`StartAck`].
    StartAck(StartAck),
    /// See [`EndAck`].
    EndAck(EndAck),
    /// See [`ReqRet`].
    ReqRet(ReqRet),
}

impl Message {
    /// Returns the message type code.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Start(_) => MessageType::Start,
            Message::Data(_) => MessageType::Data,
            Message::End(_) => MessageType::End,
            Message::StartAck(_) => MessageType::StartAck,
            Message::EndAck(_) => MessageType::EndAck,
            Message::ReqRet(_) => MessageType::ReqRet,
        }
    }

    /// Returns the round identifier the frame belongs to.
    #[must_use]
    pub fn session(&self) -> u64 {
        match self {
            Message::Start(m) => m.session,
            Message::Data(m) => m.session,
            Message::End(m) => m.session,
            Message::StartAck(m) => m.session,
            Message::EndAck(m) => m.session,
            Message::ReqRet(m) => m.session,
        }
    }

    /// Returns the module named by a manager response, `None` for agent frames.
    #[must_use]
    pub fn response_module(&self) -> Option<&str> {
        match self {
            Message::StartAck(m) => Some(&m.module),
            Message::EndAck(m) => Some(&m.module),
            Message::ReqRet(m) => Some(&m.module),
            Message::Start(_) | Message::Data(_) | Message::End(_) => None,
        }
    }

    /// Encodes the message into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if the body cannot be serialized.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(64);
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(PROTOCOL_VERSION);
        frame.push(self.message_type() as u8);

        match self {
            Message::Start(m) => write_body(m, &mut frame)?,
            Message::Data(m) => write_body(m, &mut frame)?,
            Message::End(m) => write_body(m, &mut frame)?,
            Message::StartAck(m) => write_body(m, &mut frame)?,
            Message::EndAck(m) => write_body(m, &mut frame)?,
            Message::ReqRet(m) => write_body(m, &mut frame)?,
        }
        Ok(frame)
    }

    /// Decodes a frame.
    ///
    /// The envelope (length, magic, version, type) is checked before the body
    /// is read, and the body must consume the rest of the frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing the first violation found.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                len: frame.len(),
                needed: HEADER_LEN,
            });
        }

        let magic = [frame[0], frame[1]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidMagic { found: magic });
        }
        if frame[2] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: frame[2],
                expected: PROTOCOL_VERSION,
            });
        }
        let message_type = MessageType::try_from(frame[3])?;

        let body = &frame[HEADER_LEN..];
        let mut cursor = Cursor::new(body);
        let message = match message_type {
            MessageType::Start => Message::Start(read_body(&mut cursor)?),
            MessageType::Data => Message::Data(read_body(&mut cursor)?),
            MessageType::End => Message::End(read_body(&mut cursor)?),
            MessageType::StartAck => Message::StartAck(read_body(&mut cursor)?),
            MessageType::EndAck => Message::EndAck(read_body(&mut cursor)?),
            MessageType::ReqRet => Message::ReqRet(read_body(&mut cursor)?),
        };

        let consumed = usize::try_from(cursor.position()).unwrap_or(body.len());
        if consumed < body.len() {
            return Err(ProtocolError::TrailingBytes(body.len() - consumed));
        }
        Ok(message)
    }
}

fn write_body<T: Serialize>(body: &T, frame: &mut Vec<u8>) -> ProtocolResult<()> {
    ciborium::into_writer(body, frame).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn read_body<T: DeserializeOwned>(cursor: &mut Cursor<&[u8]>) -> ProtocolResult<T> {
    ciborium::from_reader(cursor).map_err(|e| ProtocolError::malformed(e.to_string()))
}
