//! `event-scheduler` is a single-threaded, edge-triggered I/O reactor with a
//! uniform byte-stream layer on top.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────┐
//!  │                        Stream                            │
//!  │  fd · stdio · tcp client/server · udp client/server ·   │
//!  │  serial · pty · file (read buffering, bounded writes)    │
//!  └────┬──────────────┬──────────────────┬───────────────────┘
//!       │              │                  │
//!  ┌────▼─────┐  ┌─────▼──────┐    ┌──────▼──────┐
//!  │ Connect  │  │ Listener   │    │ Periodic    │
//!  │ Task     │  │ Tasks      │    │ Task        │
//!  └────┬─────┘  └─────┬──────┘    └──────┬──────┘
//!       │ fd callbacks │                  │ timers
//!  ┌────▼──────────────▼──────────────────▼──────┐
//!  │                 Scheduler                    │
//!  │   mio::Poll · timer queue · deferred calls   │
//!  └──────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on the thread that owns the [`scheduler::Scheduler`];
//! only [`scheduler::Interrupter`] crosses threads.
//!
//! - [`scheduler`]:  fd registry, timers, deferred calls, run loop
//! - [`timer`]:      ordered one-shot timer queue
//! - [`periodic`]:   fixed-interval callbacks
//! - [`socket`]:     endpoints, resolution, non-blocking helpers
//! - [`listener`]:   TCP/Unix accept loops, UDP receive loops
//! - [`connect`]:    outbound connections with fixed-delay reconnect
//! - [`stream`]:     buffered byte streams over every backend
//! - [`serial`]:     termios line settings
//! - [`pty`]:        pseudo-terminal pairs
//! - [`file`]:       file and FIFO open options, rate limits
//! - [`state`]:      lifecycle states

pub mod connect;
pub mod file;
pub mod listener;
pub mod periodic;
pub mod pty;
pub mod scheduler;
pub mod serial;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timer;

pub use scheduler::{Interrupter, Readiness, Scheduler, SchedulerError};
pub use state::StreamState;
pub use stream::{ReadConfig, ReadHandle, StdioConfig, Stream, StreamError, WriteConfig};
