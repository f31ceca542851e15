//! `lpp-session` is an LPP-over-SUPL client built on `event-scheduler`.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────┐
//!  │ Session  (state machine, callbacks)           │
//!  │   ├── TransactionManager   ids, end rules     │
//!  │   ├── LppCodec             LPP envelope       │
//!  │   └── SuplTransport        START/POSINIT/POS  │
//!  │          └── UlpCodec      length-prefixed PDU│
//!  └──────────┬───────────────────────────────────┘
//!             │ one readiness task per wait
//!  ┌──────────▼──────────┐   ┌──────────────────────┐
//!  │ event_scheduler     │◀──│ PeriodicDelivery     │
//!  │ Scheduler           │   │ (PeriodicTask)       │
//!  └─────────────────────┘   └──────────────────────┘
//! ```
//!
//! - [`session`]:      connect, handshake and message loop
//! - [`state`]:        session states and resume directives
//! - [`transaction`]:  transaction ids and end-of-transaction rules
//! - [`message`]:      LPP messages and their codec seam
//! - [`supl`]:         SUPL message types and the transport trait
//! - [`ulp`]:          ULP PDU framing
//! - [`transport`]:    non-blocking TCP SUPL transport
//! - [`delivery`]:     periodic sends on a transaction
//! - [`ephemeris`]:    ephemeris store and cache file

pub mod delivery;
pub mod ephemeris;
pub mod message;
pub mod session;
pub mod state;
pub mod supl;
pub mod transaction;
pub mod transport;
pub mod ulp;

pub use message::{EnvelopeCodec, Initiator, LppCodec, LppMessage, MessageBody, TransactionId};
pub use session::{Session, SessionConfig, SessionError};
pub use state::SessionState;
pub use transaction::{TransactionError, TransactionHandle};
