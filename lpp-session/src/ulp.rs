//! ULP PDU envelope: how SUPL messages are framed on the TCP stream.
//!
//! Every PDU starts with its own total length, so a receiver can tell a
//! partial PDU from a complete one without decoding it.  [`UlpCodec`] is the
//! seam for a real UPER codec; [`UlpEnvelope`] is the compact framing the
//! bundled transport uses.
//!
//! # Envelope format
//!
//! Multi-byte integers are big-endian.
//!
//! ```text
//!  +--------+---------------+----------------+----------+---------+--------+------+
//!  | length | version (3 B) | SET session id | identity | SLP id  | type   | body |
//!  | u16    | maj min servi | u16            | t, l, v  | 0 | 1+4 | u8     | ...  |
//!  +--------+---------------+----------------+----------+---------+--------+------+
//! ```
//!
//! `length` covers the whole PDU including itself.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::supl::{
    ApplicationId, Cell, End, Identity, LppVersion, Payload, PayloadKind, Pos, PosInit,
    PrefMethod, Response, SetCapabilities, Start, Version,
};

/// Smallest possible PDU: length, version, SET id, empty identity, no SLP id, type.
pub const MIN_PDU_LEN: usize = 2 + 3 + 2 + 2 + 1 + 1;

/// Largest PDU the length field can describe.
pub const MAX_PDU_LEN: usize = u16::MAX as usize;

mod message_type {
    pub const START: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const POS_INIT: u8 = 3;
    pub const POS: u8 = 4;
    pub const END: u8 = 5;
}

mod identity_type {
    pub const UNKNOWN: u8 = 0;
    pub const MSISDN: u8 = 1;
    pub const IMSI: u8 = 2;
    pub const IPV4: u8 = 3;
    pub const IPV6: u8 = 4;
    pub const FQDN: u8 = 5;
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UlpError {
    #[error("PDU truncated")]
    Truncated,
    #[error("length field {0} is smaller than the fixed header")]
    BadLength(usize),
    #[error("{0} trailing bytes after the message body")]
    TrailingBytes(usize),
    #[error("PDU of {0} bytes exceeds the length field")]
    TooLarge(usize),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown identity type {0}")]
    UnknownIdentityType(u8),
    #[error("unknown cell type {0}")]
    UnknownCellType(u8),
    #[error("unknown preferred method {0}")]
    UnknownPrefMethod(u8),
    #[error("string field is not valid UTF-8")]
    InvalidString,
    #[error("field of {0} bytes does not fit its length prefix")]
    FieldTooLong(usize),
}

// ---------------------------------------------------------------------------
// PDU model
// ---------------------------------------------------------------------------

/// SET side of the session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSessionId {
    pub id: u16,
    pub identity: Identity,
}

/// SLP side of the session id, assigned by the server in its first reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlpSessionId(pub [u8; 4]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UlpBody {
    Start(Start),
    Response(Response),
    PosInit(PosInit),
    Pos(Pos),
    End(End),
}

impl UlpBody {
    pub fn name(&self) -> &'static str {
        match self {
            UlpBody::Start(_) => "START",
            UlpBody::Response(_) => "RESPONSE",
            UlpBody::PosInit(_) => "POSINIT",
            UlpBody::Pos(_) => "POS",
            UlpBody::End(_) => "END",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UlpMessage {
    pub version: Version,
    pub set_session: SetSessionId,
    pub slp_session: Option<SlpSessionId>,
    pub body: UlpBody,
}

/// Outcome of looking for one PDU at the front of a receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// More bytes are needed.
    Incomplete,
    Complete(UlpMessage, usize),
    /// The first `usize` bytes cannot be decoded and should be dropped.
    Invalid(UlpError, usize),
}

/// Encoder/decoder for ULP PDUs.
pub trait UlpCodec {
    fn encode(&self, message: &UlpMessage) -> Result<Vec<u8>, UlpError>;
    fn decode(&self, buf: &[u8]) -> Frame;
}

// ---------------------------------------------------------------------------
// Envelope codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct UlpEnvelope;

impl UlpCodec for UlpEnvelope {
    fn encode(&self, message: &UlpMessage) -> Result<Vec<u8>, UlpError> {
        let mut buf = vec![0u8, 0u8];
        buf.extend_from_slice(&[
            message.version.major,
            message.version.minor,
            message.version.service_indicator,
        ]);
        buf.extend_from_slice(&message.set_session.id.to_be_bytes());
        put_identity(&mut buf, &message.set_session.identity)?;
        match message.slp_session {
            Some(SlpSessionId(id)) => {
                buf.push(1);
                buf.extend_from_slice(&id);
            }
            None => buf.push(0),
        }

        match &message.body {
            UlpBody::Start(start) => {
                buf.push(message_type::START);
                put_capabilities(&mut buf, &start.capabilities);
                put_application(&mut buf, &start.application)?;
                put_cell(&mut buf, &start.cell);
            }
            UlpBody::Response(response) => {
                buf.push(message_type::RESPONSE);
                buf.push(response.pos_method);
            }
            UlpBody::PosInit(posinit) => {
                buf.push(message_type::POS_INIT);
                put_capabilities(&mut buf, &posinit.capabilities);
                put_cell(&mut buf, &posinit.cell);
            }
            UlpBody::Pos(pos) => {
                buf.push(message_type::POS);
                put_pos(&mut buf, pos)?;
            }
            UlpBody::End(end) => {
                buf.push(message_type::END);
                match end.status {
                    Some(status) => buf.extend_from_slice(&[1, status]),
                    None => buf.extend_from_slice(&[0, 0]),
                }
            }
        }

        if buf.len() > MAX_PDU_LEN {
            return Err(UlpError::TooLarge(buf.len()));
        }
        let len = (buf.len() as u16).to_be_bytes();
        buf[..2].copy_from_slice(&len);
        Ok(buf)
    }

    fn decode(&self, buf: &[u8]) -> Frame {
        if buf.len() < 2 {
            return Frame::Incomplete;
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len < MIN_PDU_LEN {
            // Nothing after a bad length field can be trusted.
            return Frame::Invalid(UlpError::BadLength(len), buf.len());
        }
        if buf.len() < len {
            return Frame::Incomplete;
        }

        match decode_pdu(&buf[2..len]) {
            Ok(message) => Frame::Complete(message, len),
            Err(e) => Frame::Invalid(e, len),
        }
    }
}

fn decode_pdu(buf: &[u8]) -> Result<UlpMessage, UlpError> {
    let mut r = Reader::new(buf);
    let version = Version {
        major: r.u8()?,
        minor: r.u8()?,
        service_indicator: r.u8()?,
    };
    let set_session = SetSessionId {
        id: r.u16()?,
        identity: read_identity(&mut r)?,
    };
    let slp_session = match r.u8()? {
        0 => None,
        _ => {
            let mut id = [0u8; 4];
            id.copy_from_slice(r.bytes(4)?);
            Some(SlpSessionId(id))
        }
    };

    let body = match r.u8()? {
        message_type::START => UlpBody::Start(Start {
            capabilities: read_capabilities(&mut r)?,
            application: read_application(&mut r)?,
            cell: read_cell(&mut r)?,
        }),
        message_type::RESPONSE => UlpBody::Response(Response { pos_method: r.u8()? }),
        message_type::POS_INIT => UlpBody::PosInit(PosInit {
            capabilities: read_capabilities(&mut r)?,
            cell: read_cell(&mut r)?,
        }),
        message_type::POS => UlpBody::Pos(read_pos(&mut r)?),
        message_type::END => {
            let present = r.u8()?;
            let status = r.u8()?;
            UlpBody::End(End {
                status: (present != 0).then_some(status),
            })
        }
        other => return Err(UlpError::UnknownMessageType(other)),
    };

    if r.remaining() != 0 {
        return Err(UlpError::TrailingBytes(r.remaining()));
    }
    Ok(UlpMessage {
        version,
        set_session,
        slp_session,
        body,
    })
}

// ---------------------------------------------------------------------------
// Field encoders
// ---------------------------------------------------------------------------

fn put_short_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), UlpError> {
    let len = u8::try_from(bytes.len()).map_err(|_| UlpError::FieldTooLong(bytes.len()))?;
    buf.push(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_identity(buf: &mut Vec<u8>, identity: &Identity) -> Result<(), UlpError> {
    match identity {
        Identity::Unknown => {
            buf.extend_from_slice(&[identity_type::UNKNOWN, 0]);
            Ok(())
        }
        Identity::Msisdn(v) => {
            buf.push(identity_type::MSISDN);
            put_short_bytes(buf, &v.to_be_bytes())
        }
        Identity::Imsi(v) => {
            buf.push(identity_type::IMSI);
            put_short_bytes(buf, &v.to_be_bytes())
        }
        Identity::Ipv4(addr) => {
            buf.push(identity_type::IPV4);
            put_short_bytes(buf, &addr.octets())
        }
        Identity::Ipv6(addr) => {
            buf.push(identity_type::IPV6);
            put_short_bytes(buf, &addr.octets())
        }
        Identity::Fqdn(name) => {
            buf.push(identity_type::FQDN);
            put_short_bytes(buf, name.as_bytes())
        }
    }
}

fn put_capabilities(buf: &mut Vec<u8>, caps: &SetCapabilities) {
    buf.extend_from_slice(&caps.pos_technology.to_be_bytes());
    buf.push(match caps.pref_method {
        PrefMethod::AgpsSetAssistedPreferred => 0,
        PrefMethod::AgpsSetBasedPreferred => 1,
        PrefMethod::NoPreference => 2,
    });
    match caps.lpp {
        Some(v) => buf.extend_from_slice(&[1, v.major, v.technical, v.editorial]),
        None => buf.extend_from_slice(&[0, 0, 0, 0]),
    }
}

fn put_application(buf: &mut Vec<u8>, app: &ApplicationId) -> Result<(), UlpError> {
    put_short_bytes(buf, app.name.as_bytes())?;
    put_short_bytes(buf, app.provider.as_bytes())?;
    put_short_bytes(buf, app.version.as_bytes())
}

fn put_cell(buf: &mut Vec<u8>, cell: &Cell) {
    let (kind, mcc, mnc, area, ci) = match *cell {
        Cell::Gsm { mcc, mnc, lac, ci } => (0u8, mcc, mnc, lac, ci),
        Cell::Lte { mcc, mnc, tac, ci } => (1u8, mcc, mnc, tac, ci),
        Cell::Nr { mcc, mnc, tac, ci } => (2u8, mcc, mnc, tac, ci),
    };
    buf.push(kind);
    buf.extend_from_slice(&mcc.to_be_bytes());
    buf.extend_from_slice(&mnc.to_be_bytes());
    buf.extend_from_slice(&area.to_be_bytes());
    buf.extend_from_slice(&ci.to_be_bytes());
}

fn put_pos(buf: &mut Vec<u8>, pos: &Pos) -> Result<(), UlpError> {
    let count = u8::try_from(pos.payloads.len())
        .map_err(|_| UlpError::FieldTooLong(pos.payloads.len()))?;
    buf.push(count);
    for payload in &pos.payloads {
        match payload.kind {
            PayloadKind::Lpp => buf.extend_from_slice(&[0, 0]),
            PayloadKind::Other(code) => buf.extend_from_slice(&[1, code]),
        }
        let len = u16::try_from(payload.data.len())
            .map_err(|_| UlpError::FieldTooLong(payload.data.len()))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&payload.data);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Field decoders
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], UlpError> {
        if self.remaining() < n {
            return Err(UlpError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, UlpError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, UlpError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, UlpError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, UlpError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn short_bytes(&mut self) -> Result<&'a [u8], UlpError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    fn string(&mut self) -> Result<String, UlpError> {
        let bytes = self.short_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| UlpError::InvalidString)
    }
}

fn read_identity(r: &mut Reader<'_>) -> Result<Identity, UlpError> {
    let kind = r.u8()?;
    let value = r.short_bytes()?;
    Ok(match kind {
        identity_type::UNKNOWN => Identity::Unknown,
        identity_type::MSISDN | identity_type::IMSI => {
            let mut b = [0u8; 8];
            b.copy_from_slice(fixed(value, 8)?);
            let v = u64::from_be_bytes(b);
            if kind == identity_type::MSISDN {
                Identity::Msisdn(v)
            } else {
                Identity::Imsi(v)
            }
        }
        identity_type::IPV4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(fixed(value, 4)?);
            Identity::Ipv4(Ipv4Addr::from(b))
        }
        identity_type::IPV6 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(fixed(value, 16)?);
            Identity::Ipv6(Ipv6Addr::from(b))
        }
        identity_type::FQDN => Identity::Fqdn(
            String::from_utf8(value.to_vec()).map_err(|_| UlpError::InvalidString)?,
        ),
        other => return Err(UlpError::UnknownIdentityType(other)),
    })
}

fn fixed(value: &[u8], n: usize) -> Result<&[u8], UlpError> {
    if value.len() == n {
        Ok(value)
    } else {
        Err(UlpError::Truncated)
    }
}

fn read_capabilities(r: &mut Reader<'_>) -> Result<SetCapabilities, UlpError> {
    let pos_technology = r.u16()?;
    let pref_method = match r.u8()? {
        0 => PrefMethod::AgpsSetAssistedPreferred,
        1 => PrefMethod::AgpsSetBasedPreferred,
        2 => PrefMethod::NoPreference,
        other => return Err(UlpError::UnknownPrefMethod(other)),
    };
    let present = r.u8()?;
    let version = LppVersion {
        major: r.u8()?,
        technical: r.u8()?,
        editorial: r.u8()?,
    };
    Ok(SetCapabilities {
        pos_technology,
        pref_method,
        lpp: (present != 0).then_some(version),
    })
}

fn read_application(r: &mut Reader<'_>) -> Result<ApplicationId, UlpError> {
    Ok(ApplicationId {
        name: r.string()?,
        provider: r.string()?,
        version: r.string()?,
    })
}

fn read_cell(r: &mut Reader<'_>) -> Result<Cell, UlpError> {
    let kind = r.u8()?;
    let mcc = r.u16()?;
    let mnc = r.u16()?;
    let area = r.u32()?;
    let ci = r.u64()?;
    match kind {
        0 => Ok(Cell::gsm(mcc, mnc, area, ci)),
        1 => Ok(Cell::lte(mcc, mnc, area, ci)),
        2 => Ok(Cell::nr(mcc, mnc, area, ci)),
        other => Err(UlpError::UnknownCellType(other)),
    }
}

fn read_pos(r: &mut Reader<'_>) -> Result<Pos, UlpError> {
    let count = r.u8()?;
    let mut payloads = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = r.u8()?;
        let code = r.u8()?;
        let len = r.u16()? as usize;
        let data = r.bytes(len)?.to_vec();
        let kind = if tag == 0 {
            PayloadKind::Lpp
        } else {
            PayloadKind::Other(code)
        };
        payloads.push(Payload { kind, data });
    }
    Ok(Pos { payloads })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
