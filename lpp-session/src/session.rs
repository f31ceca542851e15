//! LPP-over-SUPL client session.
//!
//! The session is a resumable state machine driven by the scheduler.  Each
//! state handler either names the next state (handled immediately, without
//! returning to the scheduler) or asks to wait on the transport fd with one
//! resume state per readiness kind.  A wait registers exactly one readiness
//! task; the task deregisters itself before the session resumes.
//!
//! ```text
//!  Unknown ─connect()─▶ Connect ─▶ Connecting ─▶ Connected ─▶ SuplHandshakeSend
//!                          │           │                            │
//!                          │           ▼                            ▼
//!                          │   ConnectionFailed            SuplHandshakeRecv
//!                          │           │                            │
//!                          ▼           ▼                            ▼
//!  Exit ◀── Disconnected ◀─────────── Error                   SuplPosInit
//!               ▲                                                   │
//!               └──── END / hangup ──── Message (loop) ◀── Established
//! ```
//!
//! Transactions are tracked by [`TransactionManager`]; see
//! [`crate::transaction`] for the end-of-transaction rules.  The session
//! never reconnects on its own: after `Disconnected` it exits.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use event_scheduler::{Readiness, Scheduler, SchedulerError};
use thiserror::Error;

use crate::message::{CodecError, Initiator, LppCodec, LppMessage};
use crate::state::{NextState, SessionState};
use crate::supl::{
    ApplicationId, Cell, Handshake, Identity, LppVersion, Payload, PayloadKind, Pos, PosInit,
    PrefMethod, Received, SetCapabilities, Start, SuplError, SuplTransport, Version,
};
use crate::transaction::{EndOutcome, TransactionError, TransactionHandle, TransactionManager};
use crate::transport::TcpSuplTransport;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// What the session advertises during the SUPL handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub supl_version: Version,
    pub lpp_version: LppVersion,
    pub identity: Identity,
    pub cell: Cell,
    pub application: ApplicationId,
    pub pos_technology: u16,
    pub pref_method: PrefMethod,
}

impl SessionConfig {
    pub fn new(identity: Identity, cell: Cell) -> Self {
        Self {
            identity,
            cell,
            ..Self::default()
        }
    }

    pub fn capabilities(&self) -> SetCapabilities {
        SetCapabilities {
            pos_technology: self.pos_technology,
            pref_method: self.pref_method,
            lpp: Some(self.lpp_version),
        }
    }

    pub fn start(&self) -> Start {
        Start {
            capabilities: self.capabilities(),
            application: self.application.clone(),
            cell: self.cell,
        }
    }

    pub fn posinit(&self) -> PosInit {
        PosInit {
            capabilities: self.capabilities(),
            cell: self.cell,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message already has '{0}' set")]
    AlreadyStamped(&'static str),
    #[error("transaction {0} was already ended by this side")]
    Ended(TransactionHandle),
    #[error("session has no transport")]
    NoTransport,
    #[error("operation not valid in state {0}")]
    InvalidState(SessionState),
    #[error("session is already scheduled")]
    AlreadyScheduled,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Supl(#[from] SuplError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Builds a fresh transport for every connection attempt.
pub type TransportFactory = Box<dyn FnMut(&SessionConfig) -> Box<dyn SuplTransport>>;

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

type SessionCallback = Rc<RefCell<dyn FnMut(&Session)>>;
type TransactionCallback = Rc<RefCell<dyn FnMut(&Session, &TransactionHandle)>>;
type MessageCallback = Rc<RefCell<dyn FnMut(&Session, &TransactionHandle, LppMessage)>>;

#[derive(Default)]
struct Callbacks {
    on_connected: Option<SessionCallback>,
    on_disconnected: Option<SessionCallback>,
    on_established: Option<SessionCallback>,
    on_begin_transaction: Option<TransactionCallback>,
    on_server_end_transaction: Option<TransactionCallback>,
    on_end_transaction: Option<TransactionCallback>,
    on_message: Option<MessageCallback>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionInner {
    id: u64,
    config: SessionConfig,
    state: SessionState,
    target: Option<(String, u16)>,
    transport: Option<Box<dyn SuplTransport>>,
    factory: Option<TransportFactory>,
    codec: Box<dyn LppCodec>,
    transactions: TransactionManager,
    sequence_number: u64,
    scheduler: Option<Scheduler>,
    task_fd: Option<RawFd>,
    resume: NextState,
    callbacks: Callbacks,
}

/// One LPP session with a location server.
///
/// Cloning is cheap; clones share the session.  Callbacks may call back
/// into the session (send, create or delete transactions, cancel).
#[derive(Clone)]
pub struct Session {
    inner: Rc<RefCell<SessionInner>>,
}

/// Non-owning reference for timers and tasks that must not keep a session
/// alive.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<RefCell<SessionInner>>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub fn new<C: LppCodec + 'static>(config: SessionConfig, codec: C) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Rc::new(RefCell::new(SessionInner {
                id,
                config,
                state: SessionState::Unknown,
                target: None,
                transport: None,
                factory: None,
                codec: Box::new(codec),
                transactions: TransactionManager::new(id),
                sequence_number: 0,
                scheduler: None,
                task_fd: None,
                resume: NextState::default(),
                callbacks: Callbacks::default(),
            })),
        }
    }

    /// Replace the default TCP transport.
    pub fn with_transport_factory<F>(self, factory: F) -> Self
    where
        F: FnMut(&SessionConfig) -> Box<dyn SuplTransport> + 'static,
    {
        self.inner.borrow_mut().factory = Some(Box::new(factory));
        self
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    pub fn on_connected<F: FnMut(&Session) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_connected = Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_disconnected<F: FnMut(&Session) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_disconnected = Some(Rc::new(RefCell::new(callback)));
    }

    /// The SUPL handshake is done and LPP messages can flow.
    pub fn on_established<F: FnMut(&Session) + 'static>(&self, callback: F) {
        self.inner.borrow_mut().callbacks.on_established = Some(Rc::new(RefCell::new(callback)));
    }

    /// A transaction was created locally or opened by the server.
    pub fn on_begin_transaction<F>(&self, callback: F)
    where
        F: FnMut(&Session, &TransactionHandle) + 'static,
    {
        self.inner.borrow_mut().callbacks.on_begin_transaction =
            Some(Rc::new(RefCell::new(callback)));
    }

    /// The server ended a transaction that is not single-side-endable; the
    /// owner has to end it with [`Session::delete_transaction`].
    pub fn on_server_end_transaction<F>(&self, callback: F)
    where
        F: FnMut(&Session, &TransactionHandle) + 'static,
    {
        self.inner.borrow_mut().callbacks.on_server_end_transaction =
            Some(Rc::new(RefCell::new(callback)));
    }

    pub fn on_end_transaction<F>(&self, callback: F)
    where
        F: FnMut(&Session, &TransactionHandle) + 'static,
    {
        self.inner.borrow_mut().callbacks.on_end_transaction =
            Some(Rc::new(RefCell::new(callback)));
    }

    /// An LPP message arrived on a transaction.  A peer endTransaction is
    /// applied only after this returns.
    pub fn on_message<F>(&self, callback: F)
    where
        F: FnMut(&Session, &TransactionHandle, LppMessage) + 'static,
    {
        self.inner.borrow_mut().callbacks.on_message = Some(Rc::new(RefCell::new(callback)));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn state(&self) -> SessionState {
        self.inner.borrow().state
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Established | SessionState::Message
        )
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.borrow().transactions.len()
    }

    pub fn has_transaction(&self, handle: &TransactionHandle) -> bool {
        self.inner.borrow().transactions.contains(handle)
    }

    pub fn transactions(&self) -> Vec<TransactionHandle> {
        self.inner.borrow().transactions.handles()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Record the server address and move to `Connect`.  Only valid once,
    /// from `Unknown`; the connection starts when the session is scheduled.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), SessionError> {
        let scheduled = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != SessionState::Unknown {
                log::error!("[session] connect in state {}", inner.state);
                return Err(SessionError::InvalidState(inner.state));
            }
            inner.target = Some((host.into(), port));
            inner.scheduler.is_some()
        };
        self.switch_state(SessionState::Connect);
        if scheduled {
            self.process();
        }
        Ok(())
    }

    pub fn schedule(&self, scheduler: &Scheduler) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.scheduler.is_some() {
                return Err(SessionError::AlreadyScheduled);
            }
            inner.scheduler = Some(scheduler.clone());
        }
        self.process();
        Ok(())
    }

    /// Stop the session, drop the transport and forget all transactions.
    /// Fires no callbacks; calling it again does nothing.
    pub fn cancel(&self) {
        if self.state() == SessionState::Exit {
            return;
        }
        self.switch_state(SessionState::Exit);
        self.release_task();
        let transport = {
            let mut inner = self.inner.borrow_mut();
            inner.transactions.clear();
            inner.scheduler = None;
            inner.transport.take()
        };
        drop(transport);
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Open a client-initiated transaction.
    ///
    /// With `single_side_endable` the transaction closes as soon as either
    /// side ends it; otherwise both sides must, and a server end is reported
    /// through `on_server_end_transaction`.
    pub fn create_transaction(
        &self,
        single_side_endable: bool,
    ) -> Result<TransactionHandle, SessionError> {
        let handle = {
            let mut inner = self.inner.borrow_mut();
            let handle = inner.transactions.allocate();
            if !handle.is_valid() {
                log::error!("[session] failed to allocate transaction id");
                return Err(TransactionError::Exhausted.into());
            }
            inner.transactions.add(handle, single_side_endable)?;
            handle
        };
        self.fire_transaction(|c| c.on_begin_transaction.clone(), &handle);
        Ok(handle)
    }

    /// End a transaction from this side.
    pub fn delete_transaction(&self, handle: &TransactionHandle) -> Result<(), SessionError> {
        let outcome = self.inner.borrow_mut().transactions.client_end(handle);
        match outcome {
            Ok(outcome) => {
                if outcome.removed {
                    self.fire_transaction(|c| c.on_end_transaction.clone(), handle);
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("[session] delete: {e}");
                Err(e.into())
            }
        }
    }

    /// Stamp `message` with the transaction id and the next sequence number
    /// and send it.  The message must not carry any of those fields yet.
    pub fn send(&self, handle: &TransactionHandle, message: LppMessage) -> Result<(), SessionError> {
        let result = self.send_stamped(handle, message);
        match &result {
            Ok(Some(outcome)) if outcome.removed => {
                self.fire_transaction(|c| c.on_end_transaction.clone(), handle);
            }
            Ok(_) => {}
            Err(e) => log::warn!("[session] send on {handle}: {e}"),
        }
        self.after_transport_use();
        result.map(|_| ())
    }

    /// Send `message` with endTransaction set, then end the transaction on
    /// this side.
    pub fn send_with_end(
        &self,
        handle: &TransactionHandle,
        message: LppMessage,
    ) -> Result<(), SessionError> {
        self.set_should_send_end(handle, true)?;
        let result = self.send(handle, message);
        if result.is_err() {
            let _ = self.set_should_send_end(handle, false);
        }
        result
    }

    /// Send an abort with endTransaction.
    pub fn abort(&self, handle: &TransactionHandle) -> Result<(), SessionError> {
        self.send_with_end(handle, LppMessage::abort())
    }

    /// Handle one LPP payload received from the server.
    ///
    /// Unknown server-initiated transactions are created on the fly;
    /// messages for unknown client-initiated transactions are dropped.
    pub fn process_lpp_payload(&self, data: &[u8]) {
        let decoded = self.inner.borrow().codec.decode(data);
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[session] failed to decode LPP message: {e}");
                return;
            }
        };
        let Some(transaction_id) = message.transaction_id else {
            log::warn!("[session] LPP message without transaction id");
            return;
        };
        if message.body.is_none() {
            log::warn!("[session] LPP message without body");
            return;
        }

        let number = u32::from(transaction_id.number);
        let found = self
            .inner
            .borrow()
            .transactions
            .find(number, transaction_id.initiator);
        let handle = match found {
            Some(handle) => handle,
            None if transaction_id.initiator == Initiator::TargetDevice => {
                log::warn!("[session] message for unknown transaction C{number}");
                return;
            }
            None => {
                let observed = self.inner.borrow_mut().transactions.observe_server(number);
                match observed {
                    Ok(handle) => {
                        self.fire_transaction(|c| c.on_begin_transaction.clone(), &handle);
                        handle
                    }
                    Err(e) => {
                        log::warn!("[session] cannot track server transaction: {e}");
                        return;
                    }
                }
            }
        };

        let server_ended = message.end_transaction;
        log::debug!(
            "[session] message on {handle} seq={:?} end={server_ended}",
            message.sequence_number
        );
        self.fire_message(&handle, message);

        // The callback may have ended or deleted the transaction.
        if server_ended {
            let outcome = self.inner.borrow_mut().transactions.server_end(&handle);
            match outcome {
                Ok(outcome) => {
                    if outcome.notify_server_end {
                        self.fire_transaction(|c| c.on_server_end_transaction.clone(), &handle);
                    }
                    if outcome.removed {
                        self.fire_transaction(|c| c.on_end_transaction.clone(), &handle);
                    }
                }
                Err(e) => log::debug!("[session] server end after callback: {e}"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    fn switch_state(&self, state: SessionState) {
        let mut inner = self.inner.borrow_mut();
        log::debug!("[session:{}] {} -> {state}", inner.id, inner.state);
        inner.state = state;
    }

    fn process(&self) {
        loop {
            let state = self.state();
            match state {
                SessionState::Exit => return,
                SessionState::Unknown => {
                    log::debug!("[session] nothing to do before connect()");
                    return;
                }
                _ => {}
            }

            let result = match state {
                SessionState::Connect => self.state_connect(),
                SessionState::Connecting => self.state_connecting(),
                SessionState::Connected => self.state_connected(),
                SessionState::ConnectionFailed => self.state_connection_failed(),
                SessionState::SuplHandshakeSend => self.state_handshake_send(),
                SessionState::SuplHandshakeRecv => self.state_handshake_recv(),
                SessionState::SuplPosInit => self.state_posinit(),
                SessionState::Established => self.state_established(),
                SessionState::Message => self.state_message(),
                SessionState::Disconnected => self.state_disconnected(),
                SessionState::Error => self.state_error(),
                SessionState::Unknown | SessionState::Exit => unreachable!("dispatching {state}"),
            };

            // A callback cancelled the session.
            if self.state() == SessionState::Exit {
                return;
            }

            if let Some(next) = result.next {
                self.switch_state(next);
                continue;
            }
            if !result.is_wait() {
                unreachable!("state {state} returned neither a transition nor a wait");
            }
            if let Err(e) = self.wait(result) {
                log::error!("[session] cannot wait on transport: {e}");
                self.switch_state(SessionState::Disconnected);
                continue;
            }
            return;
        }
    }

    fn wait(&self, directive: NextState) -> Result<(), SessionError> {
        self.release_task();

        let (scheduler, fd) = {
            let inner = self.inner.borrow();
            let fd = inner
                .transport
                .as_ref()
                .filter(|t| !t.is_disconnected())
                .and_then(|t| t.raw_fd());
            (inner.scheduler.clone(), fd)
        };
        let (Some(scheduler), Some(fd)) = (scheduler, fd) else {
            return Err(SessionError::NoTransport);
        };

        log::trace!(
            "[session] wait fd={fd} read={:?} write={:?} error={:?}",
            directive.read,
            directive.write,
            directive.error
        );
        let weak = Rc::downgrade(&self.inner);
        scheduler.add_fd(fd, directive.interest(), move |_, readiness| {
            if let Some(session) = upgrade(&weak) {
                session.handle_readiness(readiness);
            }
        })?;

        let mut inner = self.inner.borrow_mut();
        inner.task_fd = Some(fd);
        inner.resume = directive;
        Ok(())
    }

    fn handle_readiness(&self, readiness: Readiness) {
        let resume = self.inner.borrow().resume.resume(readiness);
        let Some(state) = resume else {
            log::trace!("[session] ignoring {readiness:?}");
            return;
        };
        self.release_task();
        self.switch_state(state);
        self.process();
    }

    fn release_task(&self) {
        let (scheduler, fd) = {
            let mut inner = self.inner.borrow_mut();
            inner.resume = NextState::default();
            (inner.scheduler.clone(), inner.task_fd.take())
        };
        if let (Some(scheduler), Some(fd)) = (scheduler, fd) {
            if let Err(e) = scheduler.remove_fd(fd) {
                log::debug!("[session] release fd={fd}: {e}");
            }
        }
    }

    fn state_connect(&self) -> NextState {
        if self.inner.borrow().transport.is_some() {
            return NextState::next(SessionState::Disconnected);
        }
        let Some((host, port)) = self.inner.borrow().target.clone() else {
            log::error!("[session] no server address");
            return NextState::next(SessionState::Disconnected);
        };

        let mut transport = self.make_transport();
        if let Err(e) = transport.connect(&host, port) {
            log::error!("[session] failed to connect to {host}:{port}: {e}");
            return NextState::next(SessionState::Disconnected);
        }
        log::info!("[session] connecting to {host}:{port}");
        self.inner.borrow_mut().transport = Some(transport);

        NextState::wait()
            .read(SessionState::Connecting)
            .write(SessionState::Connecting)
            .error(SessionState::Error)
    }

    fn state_connecting(&self) -> NextState {
        match self.with_transport(|t| t.handle_connection()) {
            Some(Ok(())) => NextState::next(SessionState::Connected),
            Some(Err(e)) => {
                log::error!("[session] connection failed: {e}");
                NextState::next(SessionState::ConnectionFailed)
            }
            None => NextState::next(SessionState::ConnectionFailed),
        }
    }

    fn state_connection_failed(&self) -> NextState {
        NextState::next(SessionState::Disconnected)
    }

    fn state_connected(&self) -> NextState {
        log::info!("[session] connected");
        self.fire(|c| c.on_connected.clone());
        NextState::next(SessionState::SuplHandshakeSend)
    }

    fn state_handshake_send(&self) -> NextState {
        let start = self.inner.borrow().config.start();
        match self.with_transport(|t| t.handshake(&start).map(|()| t.has_pending_output())) {
            Some(Ok(pending)) => NextState::wait()
                .read(SessionState::SuplHandshakeRecv)
                .write_if(pending, SessionState::SuplHandshakeRecv)
                .error(SessionState::Disconnected),
            Some(Err(e)) => {
                log::error!("[session] failed to send SUPL START: {e}");
                NextState::next(SessionState::Disconnected)
            }
            None => NextState::next(SessionState::Disconnected),
        }
    }

    fn state_handshake_recv(&self) -> NextState {
        let result = self.with_transport(|t| {
            t.flush()?;
            Ok::<_, SuplError>((t.handle_handshake(), t.has_pending_output()))
        });
        match result {
            Some(Ok((Handshake::Ok, _))) => NextState::next(SessionState::SuplPosInit),
            Some(Ok((Handshake::NoData, pending))) => NextState::wait()
                .read(SessionState::SuplHandshakeRecv)
                .write_if(pending, SessionState::SuplHandshakeRecv)
                .error(SessionState::Disconnected),
            Some(Ok((Handshake::Error, _))) => {
                log::error!("[session] SUPL handshake failed");
                NextState::next(SessionState::Disconnected)
            }
            Some(Err(e)) => {
                log::error!("[session] SUPL handshake failed: {e}");
                NextState::next(SessionState::Disconnected)
            }
            None => NextState::next(SessionState::Disconnected),
        }
    }

    fn state_posinit(&self) -> NextState {
        let posinit = self.inner.borrow().config.posinit();
        match self.with_transport(|t| t.send_posinit(&posinit)) {
            Some(Ok(())) => NextState::next(SessionState::Established),
            Some(Err(e)) => {
                log::error!("[session] failed to send SUPL POSINIT: {e}");
                NextState::next(SessionState::Disconnected)
            }
            None => NextState::next(SessionState::Disconnected),
        }
    }

    fn state_established(&self) -> NextState {
        log::info!("[session] established");
        self.fire(|c| c.on_established.clone());
        // Messages that arrived together with the handshake response are
        // already buffered, so go straight to draining.
        NextState::next(SessionState::Message)
    }

    fn state_message(&self) -> NextState {
        let filled = self.with_transport(|t| {
            t.flush()?;
            t.fill_receive_buffer()
        });
        match filled {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("[session] receive failed: {e}");
                return NextState::next(SessionState::Disconnected);
            }
            None => return NextState::next(SessionState::Disconnected),
        }

        loop {
            let Some(received) = self.with_transport(|t| t.try_receive()) else {
                return NextState::next(SessionState::Disconnected);
            };
            match received {
                Received::NoData => break,
                Received::Pos(pos) => self.process_supl_pos(&pos),
                Received::End(end) => {
                    log::info!("[session] server ended the session (status {:?})", end.status);
                    return NextState::next(SessionState::Disconnected);
                }
                Received::Terminated => return NextState::next(SessionState::Disconnected),
                other => log::warn!("[session] problem receiving SUPL message: {other:?}"),
            }
        }

        match self.with_transport(|t| (t.is_disconnected(), t.has_pending_output())) {
            Some((false, pending)) => NextState::wait()
                .read(SessionState::Message)
                .write_if(pending, SessionState::Message)
                .error(SessionState::Disconnected),
            _ => NextState::next(SessionState::Disconnected),
        }
    }

    fn state_disconnected(&self) -> NextState {
        self.release_task();
        let transport = self.inner.borrow_mut().transport.take();
        if transport.is_some() {
            log::info!("[session] disconnected");
        }
        drop(transport);
        self.fire(|c| c.on_disconnected.clone());
        NextState::next(SessionState::Exit)
    }

    fn state_error(&self) -> NextState {
        NextState::next(SessionState::Disconnected)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn make_transport(&self) -> Box<dyn SuplTransport> {
        let (factory, config) = {
            let mut inner = self.inner.borrow_mut();
            (inner.factory.take(), inner.config.clone())
        };
        match factory {
            Some(mut factory) => {
                let transport = factory(&config);
                self.inner.borrow_mut().factory = Some(factory);
                transport
            }
            None => Box::new(TcpSuplTransport::new(config.supl_version, config.identity)),
        }
    }

    /// Run `f` on the transport.  Transports never call back into the
    /// session, so holding the borrow is fine.
    fn with_transport<R>(&self, f: impl FnOnce(&mut dyn SuplTransport) -> R) -> Option<R> {
        let mut inner = self.inner.borrow_mut();
        inner.transport.as_mut().map(|transport| f(&mut **transport))
    }

    fn process_supl_pos(&self, pos: &Pos) {
        for payload in &pos.payloads {
            match payload {
                Payload {
                    kind: PayloadKind::Lpp,
                    data,
                } => {
                    log::debug!("[session] LPP payload: {} bytes", data.len());
                    self.process_lpp_payload(data);
                }
                Payload {
                    kind: PayloadKind::Other(code),
                    ..
                } => log::warn!("[session] unsupported payload type {code}"),
            }
        }
    }

    fn set_should_send_end(
        &self,
        handle: &TransactionHandle,
        value: bool,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.borrow_mut();
        let data = inner
            .transactions
            .get_mut(handle)
            .ok_or(TransactionError::NotFound(*handle))?;
        data.client_should_send_end = value;
        Ok(())
    }

    fn send_stamped(
        &self,
        handle: &TransactionHandle,
        mut message: LppMessage,
    ) -> Result<Option<EndOutcome>, SessionError> {
        if let Some(field) = message.stamped_field() {
            return Err(SessionError::AlreadyStamped(field));
        }

        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let data = inner
            .transactions
            .get(handle)
            .ok_or(TransactionError::NotFound(*handle))?;
        if data.client_has_sent_end {
            return Err(SessionError::Ended(*handle));
        }
        let should_end = data.client_should_send_end;

        message.transaction_id = handle.transaction_id();
        message.end_transaction = should_end;
        message.sequence_number = Some((inner.sequence_number % 255) as u8);
        inner.sequence_number += 1;

        let bytes = inner.codec.encode(&message)?;
        let transport = inner.transport.as_mut().ok_or(SessionError::NoTransport)?;
        transport.send_pos(&Pos {
            payloads: vec![Payload::lpp(bytes)],
        })?;

        if !should_end {
            return Ok(None);
        }
        if let Some(data) = inner.transactions.get_mut(handle) {
            data.client_should_send_end = false;
        }
        Ok(Some(inner.transactions.client_end(handle)?))
    }

    /// React to a send made outside the state machine: wait for write
    /// readiness while output is queued, or tear down a dead transport.
    fn after_transport_use(&self) {
        let Some((failed, pending)) =
            self.with_transport(|t| (t.is_disconnected(), t.has_pending_output()))
        else {
            return;
        };
        let waiting = self.inner.borrow().task_fd.is_some();
        if !waiting {
            // The state machine is running and will look at the transport.
            return;
        }

        if failed {
            self.release_task();
            let scheduler = self.inner.borrow().scheduler.clone();
            if let Some(scheduler) = scheduler {
                let weak = Rc::downgrade(&self.inner);
                scheduler.defer(move |_| {
                    if let Some(session) = upgrade(&weak) {
                        if session.state() != SessionState::Exit {
                            session.switch_state(SessionState::Disconnected);
                            session.process();
                        }
                    }
                });
            }
        } else if pending {
            self.want_write();
        }
    }

    fn want_write(&self) {
        let update = {
            let mut inner = self.inner.borrow_mut();
            match (inner.task_fd, inner.resume.read) {
                (Some(fd), Some(read)) if inner.resume.write.is_none() => {
                    inner.resume.write = Some(read);
                    inner.scheduler.clone().map(|s| (s, fd, inner.resume.interest()))
                }
                _ => None,
            }
        };
        if let Some((scheduler, fd, interest)) = update {
            if let Err(e) = scheduler.update_fd(fd, interest) {
                log::warn!("[session] cannot enable write interest: {e}");
            }
        }
    }

    fn fire<S>(&self, select: S)
    where
        S: FnOnce(&Callbacks) -> Option<SessionCallback>,
    {
        let callback = select(&self.inner.borrow().callbacks);
        if let Some(cb) = callback {
            match cb.try_borrow_mut() {
                Ok(mut cb) => cb(self),
                Err(_) => log::warn!("[session] callback re-entered"),
            }
        }
    }

    fn fire_transaction<S>(&self, select: S, handle: &TransactionHandle)
    where
        S: FnOnce(&Callbacks) -> Option<TransactionCallback>,
    {
        let callback = select(&self.inner.borrow().callbacks);
        if let Some(cb) = callback {
            match cb.try_borrow_mut() {
                Ok(mut cb) => cb(self, handle),
                Err(_) => log::warn!("[session] transaction callback re-entered"),
            }
        }
    }

    fn fire_message(&self, handle: &TransactionHandle, message: LppMessage) {
        let callback = self.inner.borrow().callbacks.on_message.clone();
        match callback {
            Some(cb) => match cb.try_borrow_mut() {
                Ok(mut cb) => cb(self, handle, message),
                Err(_) => log::warn!("[session] message callback re-entered, dropping message"),
            },
            None => log::debug!("[session] no message handler for {handle}"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Session")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("target", &inner.target)
            .field("transactions", &inner.transactions.len())
            .finish()
    }
}

fn upgrade(weak: &Weak<RefCell<SessionInner>>) -> Option<Session> {
    weak.upgrade().map(|inner| Session { inner })
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let (Some(scheduler), Some(fd)) = (self.scheduler.take(), self.task_fd.take()) {
            let _ = scheduler.remove_fd(fd);
        }
    }
}
