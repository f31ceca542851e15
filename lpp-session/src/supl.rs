//! SUPL message model and the transport seam the session drives.
//!
//! A SUPL session carries LPP messages inside `SUPL POS` containers after a
//! `SUPL START` / `SUPL RESPONSE` handshake and a `SUPL POS INIT`; either side
//! ends it with `SUPL END`.  The session state machine only needs the
//! non-blocking operations of [`SuplTransport`]; how the messages are framed
//! on the wire is the transport's business (see [`crate::ulp`] and
//! [`crate::transport`]).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;

use thiserror::Error;

use crate::ulp::UlpError;

// ---------------------------------------------------------------------------
// Identity and location
// ---------------------------------------------------------------------------

/// SET identity sent in the SET session id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Unknown,
    Msisdn(u64),
    Imsi(u64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Fqdn(String),
}

/// Serving cell reported as the location id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Gsm { mcc: u16, mnc: u16, lac: u32, ci: u64 },
    Lte { mcc: u16, mnc: u16, tac: u32, ci: u64 },
    Nr { mcc: u16, mnc: u16, tac: u32, ci: u64 },
}

impl Cell {
    pub fn gsm(mcc: u16, mnc: u16, lac: u32, ci: u64) -> Self {
        Self::Gsm { mcc, mnc, lac, ci }
    }

    pub fn lte(mcc: u16, mnc: u16, tac: u32, ci: u64) -> Self {
        Self::Lte { mcc, mnc, tac, ci }
    }

    pub fn nr(mcc: u16, mnc: u16, tac: u32, ci: u64) -> Self {
        Self::Nr { mcc, mnc, tac, ci }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::lte(240, 1, 1, 0)
    }
}

// ---------------------------------------------------------------------------
// Versions and capabilities
// ---------------------------------------------------------------------------

/// SUPL protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub service_indicator: u8,
}

impl Version {
    pub const V2_0: Version = Version {
        major: 2,
        minor: 0,
        service_indicator: 0,
    };
}

impl Default for Version {
    fn default() -> Self {
        Self::V2_0
    }
}

/// LPP version advertised in the SET capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LppVersion {
    pub major: u8,
    pub technical: u8,
    pub editorial: u8,
}

impl Default for LppVersion {
    fn default() -> Self {
        Self {
            major: 16,
            technical: 4,
            editorial: 0,
        }
    }
}

/// Bit constants for [`SetCapabilities::pos_technology`].
pub mod pos_technology {
    pub const AGPS_SET_ASSISTED: u16 = 0b0000_0001;
    pub const AGPS_SET_BASED: u16 = 0b0000_0010;
    pub const AUTONOMOUS_GPS: u16 = 0b0000_0100;
    pub const AFLT: u16 = 0b0000_1000;
    pub const ECID: u16 = 0b0001_0000;
    pub const EOTD: u16 = 0b0010_0000;
    pub const OTDOA: u16 = 0b0100_0000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefMethod {
    AgpsSetAssistedPreferred,
    AgpsSetBasedPreferred,
    #[default]
    NoPreference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetCapabilities {
    pub pos_technology: u16,
    pub pref_method: PrefMethod,
    /// `None` when LPP is not offered.
    pub lpp: Option<LppVersion>,
}

impl SetCapabilities {
    pub fn lpp(version: LppVersion) -> Self {
        Self {
            pos_technology: 0,
            pref_method: PrefMethod::NoPreference,
            lpp: Some(version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationId {
    pub name: String,
    pub provider: String,
    pub version: String,
}

impl Default for ApplicationId {
    fn default() -> Self {
        Self {
            name: "lpp-client".into(),
            provider: "lpp-session".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// `SUPL START`: opens the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    pub capabilities: SetCapabilities,
    pub application: ApplicationId,
    pub cell: Cell,
}

/// `SUPL RESPONSE`: the server's answer to START.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub pos_method: u8,
}

/// `SUPL POS INIT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosInit {
    pub capabilities: SetCapabilities,
    pub cell: Cell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Lpp,
    /// Any positioning protocol the session does not handle.
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn lpp(data: Vec<u8>) -> Self {
        Self {
            kind: PayloadKind::Lpp,
            data,
        }
    }
}

/// `SUPL POS`: one or more positioning payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pos {
    pub payloads: Vec<Payload>,
}

/// `SUPL END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct End {
    pub status: Option<u8>,
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Progress of the START/RESPONSE exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ok,
    /// The response has not arrived yet.
    NoData,
    Error,
}

/// Result of pulling one message out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Not enough buffered bytes for a full message.
    NoData,
    Pos(Pos),
    End(End),
    /// A decodable message this session does not accept here.
    Unexpected,
    /// A message for another SET or SLP session.
    InvalidSession,
    /// Bytes that could not be decoded; they have been skipped.
    Malformed,
    /// The transport is gone.
    Terminated,
}

#[derive(Debug, Error)]
pub enum SuplError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("operation not valid in transport state {0}")]
    InvalidState(&'static str),
    #[error("connection closed by peer")]
    Closed,
    #[error("outgoing buffer full ({pending} bytes pending)")]
    OutputFull { pending: usize },
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Socket(#[from] event_scheduler::socket::SocketError),
    #[error(transparent)]
    Ulp(#[from] UlpError),
}

/// Non-blocking SUPL transport driven by [`crate::session::Session`].
///
/// No method may block.  Sends are buffered: whatever the socket does not
/// accept immediately stays queued until [`SuplTransport::flush`] pushes it
/// out, and [`SuplTransport::has_pending_output`] tells the session to wait
/// for write readiness.
pub trait SuplTransport {
    /// Start a non-blocking connect.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), SuplError>;

    /// Finish the connect once the socket reports readiness.
    fn handle_connection(&mut self) -> Result<(), SuplError>;

    /// Descriptor to poll, if a socket exists.
    fn raw_fd(&self) -> Option<RawFd>;

    fn is_disconnected(&self) -> bool;

    /// Send START and wait for the response.
    fn handshake(&mut self, start: &Start) -> Result<(), SuplError>;

    fn handle_handshake(&mut self) -> Handshake;

    fn send_posinit(&mut self, posinit: &PosInit) -> Result<(), SuplError>;

    fn send_pos(&mut self, pos: &Pos) -> Result<(), SuplError>;

    /// Read everything the socket has.  Returns the number of bytes added;
    /// end of stream marks the transport disconnected.
    fn fill_receive_buffer(&mut self) -> Result<usize, SuplError>;

    fn try_receive(&mut self) -> Received;

    fn flush(&mut self) -> Result<(), SuplError>;

    fn has_pending_output(&self) -> bool;
}
