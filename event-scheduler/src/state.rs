//! Lifecycle states shared by streams and connect tasks.
//!
//! ```text
//!  Unscheduled ──schedule──▶ Connecting ──ready──▶ Connected
//!                               │                     │
//!                               │ error               │ error / hangup / EOF
//!                               ▼                     ▼
//!                             Error              Disconnected
//!                               │                     │
//!                               └──── reconnect ──────┘──▶ Connecting
//! ```
//!
//! Only a [`crate::connect::ConnectTask`] (and the TCP client stream built on
//! it) ever leaves `Disconnected`/`Error` again; every other stream treats
//! them as terminal.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Constructed but not yet handed to a scheduler.
    #[default]
    Unscheduled,
    /// Waiting for an outbound connection to complete.
    Connecting,
    /// Ready for I/O.
    Connected,
    /// The peer closed, EOF was reached, or the task was cancelled.
    Disconnected,
    /// An OS-level error ended the stream.
    Error,
}

impl StreamState {
    /// `true` for `Disconnected` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unscheduled => "unscheduled",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
