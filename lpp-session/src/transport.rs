//! Non-blocking SUPL transport over TCP.
//!
//! ```text
//!  Unknown ──connect()──▶ Connecting ──handle_connection()──▶ Connected
//!                                                                │ handshake(START)
//!                              Connected ◀──RESPONSE── WaitForHandshake
//! ```
//!
//! Outgoing PDUs are appended to an output buffer and written as far as the
//! socket allows; the rest goes out on [`SuplTransport::flush`].  Incoming
//! bytes accumulate in a receive buffer until a whole PDU is present.
//!
//! Every received PDU must name our SET session.  The SLP session id is
//! adopted from the first PDU the server sends and enforced afterwards.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use event_scheduler::socket::resolve_first;
use mio::net::TcpStream;

use crate::supl::{
    Handshake, Identity, Pos, PosInit, Received, Start, SuplError, SuplTransport, Version,
};
use crate::ulp::{Frame, SetSessionId, SlpSessionId, UlpBody, UlpCodec, UlpEnvelope, UlpMessage};

/// Receive buffer limit; one maximal PDU always fits.
pub const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Output that may be queued before sends start failing.
pub const OUTPUT_BUFFER_LIMIT: usize = 1024 * 1024;

pub const DEFAULT_SET_SESSION_ID: u16 = 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Unknown,
    Connecting,
    Connected,
    WaitForHandshake,
    Disconnected,
}

impl TransportState {
    fn name(self) -> &'static str {
        match self {
            TransportState::Unknown => "unknown",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::WaitForHandshake => "wait-for-handshake",
            TransportState::Disconnected => "disconnected",
        }
    }
}

pub struct TcpSuplTransport {
    version: Version,
    set_session: SetSessionId,
    slp_session: Option<SlpSessionId>,
    state: TransportState,
    stream: Option<TcpStream>,
    codec: Box<dyn UlpCodec>,
    receive: Vec<u8>,
    output: Vec<u8>,
}

impl TcpSuplTransport {
    pub fn new(version: Version, identity: Identity) -> Self {
        Self::with_codec(version, identity, UlpEnvelope)
    }

    pub fn with_codec<C: UlpCodec + 'static>(version: Version, identity: Identity, codec: C) -> Self {
        Self {
            version,
            set_session: SetSessionId {
                id: DEFAULT_SET_SESSION_ID,
                identity,
            },
            slp_session: None,
            state: TransportState::Unknown,
            stream: None,
            codec: Box::new(codec),
            receive: Vec::with_capacity(RECEIVE_BUFFER_SIZE),
            output: Vec::new(),
        }
    }

    pub fn slp_session(&self) -> Option<SlpSessionId> {
        self.slp_session
    }

    pub fn buffered_input(&self) -> usize {
        self.receive.len()
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            TransportState::Connected | TransportState::WaitForHandshake
        )
    }

    fn send(&mut self, body: UlpBody) -> Result<(), SuplError> {
        if !self.is_connected() {
            log::warn!("[supl] {} while not connected", body.name());
            return Err(SuplError::NotConnected);
        }
        let message = UlpMessage {
            version: self.version,
            set_session: self.set_session.clone(),
            slp_session: self.slp_session,
            body,
        };
        let bytes = self.codec.encode(&message)?;
        if self.output.len() + bytes.len() > OUTPUT_BUFFER_LIMIT {
            return Err(SuplError::OutputFull {
                pending: self.output.len(),
            });
        }
        log::trace!("[supl] send {} ({} bytes)", message.body.name(), bytes.len());
        self.output.extend_from_slice(&bytes);
        self.flush()
    }

    /// The socket stays open until the transport is dropped so the owner
    /// can deregister it first.
    fn disconnect(&mut self) {
        self.state = TransportState::Disconnected;
        self.output.clear();
    }

    /// Pull the next PDU and check it belongs to this session.
    fn next_message(&mut self) -> Result<Option<UlpMessage>, Received> {
        let (message, consumed) = match self.codec.decode(&self.receive) {
            Frame::Incomplete => return Ok(None),
            Frame::Invalid(e, consumed) => {
                log::warn!("[supl] dropping {consumed} undecodable bytes: {e}");
                self.receive.drain(..consumed.min(self.receive.len()));
                return Err(Received::Malformed);
            }
            Frame::Complete(message, consumed) => (message, consumed),
        };
        self.receive.drain(..consumed);
        log::trace!("[supl] received {} ({consumed} bytes)", message.body.name());

        if message.set_session != self.set_session {
            log::warn!("[supl] message for another SET session");
            return Err(Received::InvalidSession);
        }
        match (self.slp_session, message.slp_session) {
            (None, Some(slp)) => self.slp_session = Some(slp),
            (Some(ours), theirs) if theirs != Some(ours) => {
                log::warn!("[supl] message for another SLP session");
                return Err(Received::InvalidSession);
            }
            _ => {}
        }
        Ok(Some(message))
    }
}

impl SuplTransport for TcpSuplTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), SuplError> {
        if self.state != TransportState::Unknown {
            return Err(SuplError::InvalidState(self.state.name()));
        }
        let addr = resolve_first(host, port)?;
        log::debug!("[supl] connecting to {host}:{port} ({addr})");
        let stream = TcpStream::connect(addr).map_err(SuplError::Connect)?;
        self.stream = Some(stream);
        self.state = TransportState::Connecting;
        Ok(())
    }

    fn handle_connection(&mut self) -> Result<(), SuplError> {
        if self.state != TransportState::Connecting {
            return Err(SuplError::InvalidState(self.state.name()));
        }
        let Some(stream) = self.stream.as_ref() else {
            return Err(SuplError::NotConnected);
        };

        let result = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => stream.peer_addr().map(|_| ()),
        };
        match result {
            Ok(()) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("[supl] TCP_NODELAY: {e}");
                }
                self.state = TransportState::Connected;
                Ok(())
            }
            Err(e) => {
                self.disconnect();
                Err(SuplError::Connect(e))
            }
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn is_disconnected(&self) -> bool {
        self.state == TransportState::Disconnected
    }

    fn handshake(&mut self, start: &Start) -> Result<(), SuplError> {
        if self.state != TransportState::Connected {
            return Err(SuplError::InvalidState(self.state.name()));
        }
        self.send(UlpBody::Start(start.clone()))?;
        self.state = TransportState::WaitForHandshake;
        Ok(())
    }

    fn handle_handshake(&mut self) -> Handshake {
        if self.state != TransportState::WaitForHandshake {
            log::warn!("[supl] handshake response in state {}", self.state.name());
            return Handshake::Error;
        }
        if let Err(e) = self.fill_receive_buffer() {
            log::warn!("[supl] handshake receive failed: {e}");
            return Handshake::Error;
        }

        match self.next_message() {
            Ok(None) if self.is_disconnected() => Handshake::Error,
            Ok(None) => Handshake::NoData,
            Ok(Some(UlpMessage {
                body: UlpBody::Response(response),
                ..
            })) => {
                log::debug!("[supl] RESPONSE pos_method={}", response.pos_method);
                self.state = TransportState::Connected;
                Handshake::Ok
            }
            Ok(Some(other)) => {
                log::warn!("[supl] expected RESPONSE, got {}", other.body.name());
                Handshake::Error
            }
            Err(_) => Handshake::Error,
        }
    }

    fn send_posinit(&mut self, posinit: &PosInit) -> Result<(), SuplError> {
        self.send(UlpBody::PosInit(posinit.clone()))
    }

    fn send_pos(&mut self, pos: &Pos) -> Result<(), SuplError> {
        self.send(UlpBody::Pos(pos.clone()))
    }

    fn fill_receive_buffer(&mut self) -> Result<usize, SuplError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(SuplError::NotConnected);
        };

        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let room = RECEIVE_BUFFER_SIZE.saturating_sub(self.receive.len());
            if room == 0 {
                // Leave the rest in the socket until a PDU has been consumed.
                break;
            }
            let want = room.min(chunk.len());
            match stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    log::debug!("[supl] peer closed the connection");
                    self.state = TransportState::Disconnected;
                    break;
                }
                Ok(n) => {
                    self.receive.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect();
                    return Err(SuplError::Io(e));
                }
            }
        }
        log::trace!("[supl] received {total} bytes ({} buffered)", self.receive.len());
        Ok(total)
    }

    fn try_receive(&mut self) -> Received {
        let message = match self.next_message() {
            Ok(Some(message)) => message,
            Ok(None) if self.is_disconnected() => return Received::Terminated,
            Ok(None) => return Received::NoData,
            Err(received) => return received,
        };
        match message.body {
            UlpBody::Pos(pos) => Received::Pos(pos),
            UlpBody::End(end) => Received::End(end),
            other => {
                log::warn!("[supl] unexpected {} in session", other.name());
                Received::Unexpected
            }
        }
    }

    fn flush(&mut self) -> Result<(), SuplError> {
        while !self.output.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Err(SuplError::NotConnected);
            };
            match stream.write(&self.output) {
                Ok(0) => {
                    self.disconnect();
                    return Err(SuplError::Closed);
                }
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect();
                    return Err(SuplError::Io(e));
                }
            }
        }
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }
}

impl std::fmt::Debug for TcpSuplTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSuplTransport")
            .field("state", &self.state)
            .field("set_session", &self.set_session.id)
            .field("slp_session", &self.slp_session)
            .field("buffered_input", &self.receive.len())
            .field("pending_output", &self.output.len())
            .finish()
    }
}
