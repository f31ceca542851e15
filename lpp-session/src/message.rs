//! LPP message model and the codec seam.
//!
//! The session layer only ever looks at four things in an LPP message: the
//! transaction id (initiator + number), the end-transaction flag, the
//! sequence number and an opaque body.  [`LppMessage`] carries exactly those;
//! everything else about the message lives inside [`MessageBody::Payload`]
//! and is produced and consumed by the application.
//!
//! [`LppCodec`] turns messages into bytes and back.  [`EnvelopeCodec`] is a
//! compact length-delimited framing used by the bundled tools and tests; a
//! UPER codec plugs in behind the same trait.
//!
//! # Envelope format
//!
//! Multi-byte integers are big-endian.
//!
//! ```text
//!  0               1               2               3               4
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |  Transaction  |   Sequence    |          Body Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              Body ...                                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Header size: [`HEADER_LEN`] = 5 bytes.

use std::fmt;

use thiserror::Error;

/// Bit-flag constants for the envelope `flags` byte.
pub mod flags {
    /// The transaction number byte is valid.
    pub const TRANSACTION: u8 = 0b0000_0001;
    /// The transaction was initiated by the location server.
    pub const SERVER_INITIATED: u8 = 0b0000_0010;
    /// endTransaction is set.
    pub const END: u8 = 0b0000_0100;
    /// The sequence number byte is valid.
    pub const SEQUENCE: u8 = 0b0000_1000;
    /// A message body follows.
    pub const BODY: u8 = 0b0001_0000;
    /// The body is an abort.
    pub const ABORT: u8 = 0b0010_0000;

    pub(super) const ALL: u8 = TRANSACTION | SERVER_INITIATED | END | SEQUENCE | BODY | ABORT;
}

pub const HEADER_LEN: usize = 5;

/// Largest body the envelope can describe.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

const OFF_FLAGS: usize = 0;
const OFF_TRANSACTION: usize = 1;
const OFF_SEQUENCE: usize = 2;
const OFF_BODY_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// Which side opened a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    TargetDevice,
    LocationServer,
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::TargetDevice => f.write_str("C"),
            Initiator::LocationServer => f.write_str("S"),
        }
    }
}

/// `LPP-TransactionID` as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub initiator: Initiator,
    pub number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Application-defined message contents, forwarded unexamined.
    Payload(Vec<u8>),
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LppMessage {
    pub transaction_id: Option<TransactionId>,
    pub end_transaction: bool,
    pub sequence_number: Option<u8>,
    pub body: Option<MessageBody>,
}

impl LppMessage {
    /// An unstamped message ready to be handed to a session.
    pub fn new(body: MessageBody) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn payload(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageBody::Payload(bytes.into()))
    }

    pub fn abort() -> Self {
        Self::new(MessageBody::Abort)
    }

    /// Name of the first transaction-framing field that is already set.
    pub fn stamped_field(&self) -> Option<&'static str> {
        if self.transaction_id.is_some() {
            Some("transactionID")
        } else if self.end_transaction {
            Some("endTransaction")
        } else if self.sequence_number.is_some() {
            Some("sequenceNumber")
        } else {
            None
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self.body, Some(MessageBody::Abort))
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("body length field does not match remaining bytes")]
    LengthMismatch,
    #[error("body of {0} bytes does not fit the envelope")]
    BodyTooLarge(usize),
    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),
}

/// Encoder/decoder for LPP messages.
pub trait LppCodec {
    fn encode(&self, message: &LppMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<LppMessage, CodecError>;
}

/// Length-delimited framing; see the module docs for the layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl LppCodec for EnvelopeCodec {
    fn encode(&self, message: &LppMessage) -> Result<Vec<u8>, CodecError> {
        let body: &[u8] = match &message.body {
            Some(MessageBody::Payload(bytes)) => bytes,
            _ => &[],
        };
        if body.len() > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLarge(body.len()));
        }

        let mut flag_bits = 0u8;
        let mut transaction = 0u8;
        if let Some(id) = message.transaction_id {
            flag_bits |= flags::TRANSACTION;
            if id.initiator == Initiator::LocationServer {
                flag_bits |= flags::SERVER_INITIATED;
            }
            transaction = id.number;
        }
        if message.end_transaction {
            flag_bits |= flags::END;
        }
        if message.sequence_number.is_some() {
            flag_bits |= flags::SEQUENCE;
        }
        match message.body {
            Some(MessageBody::Payload(_)) => flag_bits |= flags::BODY,
            Some(MessageBody::Abort) => flag_bits |= flags::BODY | flags::ABORT,
            None => {}
        }

        let mut buf = vec![0u8; HEADER_LEN + body.len()];
        buf[OFF_FLAGS] = flag_bits;
        buf[OFF_TRANSACTION] = transaction;
        buf[OFF_SEQUENCE] = message.sequence_number.unwrap_or(0);
        buf[OFF_BODY_LEN..OFF_BODY_LEN + 2].copy_from_slice(&(body.len() as u16).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(body);
        Ok(buf)
    }

    fn decode(&self, buf: &[u8]) -> Result<LppMessage, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::BufferTooShort);
        }

        let flag_bits = buf[OFF_FLAGS];
        if flag_bits & !flags::ALL != 0 {
            return Err(CodecError::UnknownFlags(flag_bits & !flags::ALL));
        }
        let body_len = u16::from_be_bytes([buf[OFF_BODY_LEN], buf[OFF_BODY_LEN + 1]]) as usize;
        if buf.len() != HEADER_LEN + body_len {
            return Err(CodecError::LengthMismatch);
        }

        let transaction_id = (flag_bits & flags::TRANSACTION != 0).then(|| TransactionId {
            initiator: if flag_bits & flags::SERVER_INITIATED != 0 {
                Initiator::LocationServer
            } else {
                Initiator::TargetDevice
            },
            number: buf[OFF_TRANSACTION],
        });
        let sequence_number = (flag_bits & flags::SEQUENCE != 0).then_some(buf[OFF_SEQUENCE]);
        let body = if flag_bits & flags::ABORT != 0 {
            Some(MessageBody::Abort)
        } else if flag_bits & flags::BODY != 0 {
            Some(MessageBody::Payload(buf[HEADER_LEN..].to_vec()))
        } else {
            None
        };

        Ok(LppMessage {
            transaction_id,
            end_transaction: flag_bits & flags::END != 0,
            sequence_number,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(body: MessageBody) -> LppMessage {
        LppMessage {
            transaction_id: Some(TransactionId {
                initiator: Initiator::LocationServer,
                number: 200,
            }),
            end_transaction: true,
            sequence_number: Some(17),
            body: Some(body),
        }
    }

    #[test]
    fn stamped_message_survives_the_envelope() {
        let message = stamped(MessageBody::Payload(b"provide-assistance-data".to_vec()));
        let bytes = EnvelopeCodec.encode(&message).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 23);
        assert_eq!(EnvelopeCodec.decode(&bytes).unwrap(), message);
    }

    #[test]
    fn abort_has_no_body_bytes() {
        let bytes = EnvelopeCodec.encode(&stamped(MessageBody::Abort)).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[OFF_FLAGS] & flags::ABORT, flags::ABORT);
        assert!(EnvelopeCodec.decode(&bytes).unwrap().is_abort());
    }

    #[test]
    fn unstamped_message_keeps_optional_fields_empty() {
        let decoded = EnvelopeCodec
            .decode(&EnvelopeCodec.encode(&LppMessage::payload(vec![1, 2, 3])).unwrap())
            .unwrap();
        assert_eq!(decoded.transaction_id, None);
        assert_eq!(decoded.sequence_number, None);
        assert!(!decoded.end_transaction);
        assert_eq!(decoded.stamped_field(), None);
    }

    #[test]
    fn stamped_field_reports_first_set_field() {
        let mut message = LppMessage::payload(vec![]);
        message.sequence_number = Some(3);
        assert_eq!(message.stamped_field(), Some("sequenceNumber"));
        message.end_transaction = true;
        assert_eq!(message.stamped_field(), Some("endTransaction"));
    }

    #[test]
    fn decode_rejects_short_and_mismatched_buffers() {
        assert_eq!(EnvelopeCodec.decode(&[0, 0]), Err(CodecError::BufferTooShort));

        let mut bytes = EnvelopeCodec.encode(&LppMessage::payload(vec![9; 4])).unwrap();
        bytes.pop();
        assert_eq!(EnvelopeCodec.decode(&bytes), Err(CodecError::LengthMismatch));
    }

    #[test]
    fn decode_rejects_unknown_flags() {
        let bytes = [0b1000_0000, 0, 0, 0, 0];
        assert_eq!(EnvelopeCodec.decode(&bytes), Err(CodecError::UnknownFlags(0x80)));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let message = LppMessage::payload(vec![0; MAX_BODY_LEN + 1]);
        assert_eq!(
            EnvelopeCodec.encode(&message),
            Err(CodecError::BodyTooLarge(MAX_BODY_LEN + 1))
        );
    }
}
