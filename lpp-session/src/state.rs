//! Session states and the resume directive handlers return.

use std::fmt;

use event_scheduler::Readiness;
use mio::Interest;

/// Protocol state of a [`crate::session::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Unknown,
    Connect,
    Connecting,
    Connected,
    ConnectionFailed,
    SuplHandshakeSend,
    SuplHandshakeRecv,
    SuplPosInit,
    Established,
    Message,
    Disconnected,
    Error,
    Exit,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unknown => "UNKNOWN",
            SessionState::Connect => "CONNECT",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::ConnectionFailed => "CONNECTION_FAILED",
            SessionState::SuplHandshakeSend => "SUPL_HANDSHAKE_SEND",
            SessionState::SuplHandshakeRecv => "SUPL_HANDSHAKE_RECV",
            SessionState::SuplPosInit => "SUPL_POSINIT",
            SessionState::Established => "ESTABLISHED",
            SessionState::Message => "MESSAGE",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Error => "ERROR",
            SessionState::Exit => "EXIT",
        };
        f.write_str(name)
    }
}

/// What a state handler wants to happen next.
///
/// Either an immediate transition (`next`) or a wait on the transport fd
/// with one resume state per readiness kind:
///
/// ```text
///   NextState::next(Connected)                         → loop again now
///   NextState::wait().read(Message).error(Disconnected) → return to scheduler
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NextState {
    pub next: Option<SessionState>,
    pub read: Option<SessionState>,
    pub write: Option<SessionState>,
    pub error: Option<SessionState>,
}

impl NextState {
    pub fn next(state: SessionState) -> Self {
        Self {
            next: Some(state),
            ..Self::default()
        }
    }

    /// An empty wait; add resume states with the builder methods.
    pub fn wait() -> Self {
        Self::default()
    }

    pub fn read(mut self, state: SessionState) -> Self {
        self.read = Some(state);
        self
    }

    pub fn write(mut self, state: SessionState) -> Self {
        self.write = Some(state);
        self
    }

    pub fn write_if(self, condition: bool, state: SessionState) -> Self {
        if condition {
            self.write(state)
        } else {
            self
        }
    }

    pub fn error(mut self, state: SessionState) -> Self {
        self.error = Some(state);
        self
    }

    pub fn is_wait(&self) -> bool {
        self.read.is_some() || self.write.is_some() || self.error.is_some()
    }

    /// Poll interest for a wait.  Errors are always reported, so an
    /// error-only wait still listens for readability to learn about hangups.
    pub fn interest(&self) -> Interest {
        match (self.read.is_some(), self.write.is_some()) {
            (_, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (true, true) => Interest::READABLE | Interest::WRITABLE,
        }
    }

    /// The first resume state matching `readiness`, checked in the order
    /// read, write, error.
    pub fn resume(&self, readiness: Readiness) -> Option<SessionState> {
        if readiness.readable {
            if let Some(state) = self.read {
                return Some(state);
            }
        }
        if readiness.writable {
            if let Some(state) = self.write {
                return Some(state);
            }
        }
        let unexpected = self.read.is_none() && self.write.is_none();
        if readiness.is_failure() || readiness.read_closed || unexpected {
            return self.error;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readiness(readable: bool, writable: bool, error: bool) -> Readiness {
        Readiness {
            readable,
            writable,
            error,
            ..Readiness::default()
        }
    }

    #[test]
    fn read_wins_over_write_and_error() {
        let wait = NextState::wait()
            .read(SessionState::Message)
            .write(SessionState::SuplHandshakeRecv)
            .error(SessionState::Disconnected);
        assert_eq!(wait.resume(readiness(true, true, true)), Some(SessionState::Message));
        assert_eq!(
            wait.resume(readiness(false, true, true)),
            Some(SessionState::SuplHandshakeRecv)
        );
        assert_eq!(
            wait.resume(readiness(false, false, true)),
            Some(SessionState::Disconnected)
        );
    }

    #[test]
    fn unmatched_readiness_keeps_waiting() {
        let wait = NextState::wait()
            .read(SessionState::Message)
            .error(SessionState::Disconnected);
        assert_eq!(wait.resume(readiness(false, true, false)), None);
    }

    #[test]
    fn error_only_wait_resumes_on_anything() {
        let wait = NextState::wait().error(SessionState::Disconnected);
        assert!(wait.is_wait());
        assert_eq!(wait.interest(), Interest::READABLE);
        assert_eq!(
            wait.resume(readiness(true, false, false)),
            Some(SessionState::Disconnected)
        );
    }

    #[test]
    fn immediate_transition_is_not_a_wait() {
        let next = NextState::next(SessionState::Connected);
        assert!(!next.is_wait());
        assert_eq!(next.next, Some(SessionState::Connected));
    }

    #[test]
    fn interest_follows_resume_states() {
        let both = NextState::wait()
            .read(SessionState::Connecting)
            .write(SessionState::Connecting);
        assert_eq!(both.interest(), Interest::READABLE | Interest::WRITABLE);
        let write_only = NextState::wait().write_if(true, SessionState::Message);
        assert_eq!(write_only.interest(), Interest::WRITABLE);
        assert_eq!(NextState::wait().write_if(false, SessionState::Message).write, None);
    }

    #[test]
    fn names_match_protocol_spelling() {
        assert_eq!(SessionState::SuplHandshakeSend.to_string(), "SUPL_HANDSHAKE_SEND");
        assert_eq!(SessionState::default(), SessionState::Unknown);
    }
}
