//! Transaction bookkeeping for one LPP session.
//!
//! LPP multiplexes request/response exchanges over a session by tagging each
//! message with `(initiator, number)`.  The number space is tiny, so numbers
//! are reused; a [`TransactionHandle`] additionally carries a generation
//! that is bumped on every allocation, which keeps a stale handle from ever
//! matching a newer transaction that happens to reuse its number.
//!
//! ```text
//!  transactions: TransactionHandle ──▶ TransactionData     (owning)
//!  lookup:       (number, initiator) ──▶ TransactionHandle (index)
//! ```
//!
//! A transaction is removed once both sides have sent endTransaction, or
//! once either side has when it is single-side-endable.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::message::{Initiator, TransactionId};

/// Client-initiated numbers come from `0..CLIENT_ID_SPACE`.
pub const CLIENT_ID_SPACE: u32 = 255;

/// Largest number the wire format can carry.
pub const MAX_TRANSACTION_ID: u32 = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction id {0} is out of range")]
    InvalidId(u32),
    #[error("transaction handle is invalid")]
    InvalidHandle,
    #[error("transaction {0} already exists")]
    AlreadyExists(TransactionHandle),
    #[error("transaction {0} not found")]
    NotFound(TransactionHandle),
    #[error("no free transaction id")]
    Exhausted,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Identifies one transaction of one session.
///
/// Equality and hashing cover all four fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    session: u64,
    id: u32,
    generation: u64,
    initiator: Initiator,
}

impl TransactionHandle {
    pub fn new(session: u64, id: u32, generation: u64, initiator: Initiator) -> Self {
        Self {
            session,
            id,
            generation,
            initiator,
        }
    }

    /// The handle returned when no transaction could be allocated.
    pub fn invalid() -> Self {
        Self {
            session: 0,
            id: 0,
            generation: 0,
            initiator: Initiator::TargetDevice,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.session != 0
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn initiator(&self) -> Initiator {
        self.initiator
    }

    pub fn is_client(&self) -> bool {
        self.initiator == Initiator::TargetDevice
    }

    pub fn lookup(&self) -> (u32, Initiator) {
        (self.id, self.initiator)
    }

    /// Wire form; `None` when the id does not fit.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        u8::try_from(self.id).ok().map(|number| TransactionId {
            initiator: self.initiator,
            number,
        })
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("<invalid>");
        }
        write!(f, "{}{}/{}", self.initiator, self.id, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionData {
    pub handle: TransactionHandle,
    pub client_has_sent_end: bool,
    pub server_has_sent_end: bool,
    pub single_side_endable: bool,
    /// The next send on this transaction carries endTransaction.
    pub client_should_send_end: bool,
}

impl TransactionData {
    fn new(handle: TransactionHandle, single_side_endable: bool) -> Self {
        Self {
            handle,
            client_has_sent_end: false,
            server_has_sent_end: false,
            single_side_endable,
            client_should_send_end: false,
        }
    }

    fn is_finished(&self) -> bool {
        let ended_by_both = self.client_has_sent_end && self.server_has_sent_end;
        let ended_by_someone = self.client_has_sent_end || self.server_has_sent_end;
        ended_by_both || (self.single_side_endable && ended_by_someone)
    }
}

/// What marking one side's end did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndOutcome {
    /// The transaction is gone; `on_end_transaction` should fire.
    pub removed: bool,
    /// Set only when the server ends a two-sided transaction the client has
    /// not ended yet; the owner is expected to close it.
    pub notify_server_end: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TransactionManager {
    session: u64,
    cursor: u32,
    generation: u64,
    transactions: HashMap<TransactionHandle, TransactionData>,
    lookup: HashMap<(u32, Initiator), TransactionHandle>,
}

impl TransactionManager {
    pub fn new(session: u64) -> Self {
        Self {
            session,
            cursor: 1,
            generation: 1,
            transactions: HashMap::new(),
            lookup: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, handle: &TransactionHandle) -> bool {
        self.transactions.contains_key(handle)
    }

    pub fn get(&self, handle: &TransactionHandle) -> Option<&TransactionData> {
        self.transactions.get(handle)
    }

    pub fn get_mut(&mut self, handle: &TransactionHandle) -> Option<&mut TransactionData> {
        self.transactions.get_mut(handle)
    }

    /// Resolve a wire-level id to the live handle.
    pub fn find(&self, id: u32, initiator: Initiator) -> Option<TransactionHandle> {
        self.lookup.get(&(id, initiator)).copied()
    }

    pub fn handles(&self) -> Vec<TransactionHandle> {
        self.transactions.keys().copied().collect()
    }

    /// Pick the next free client-initiated number.
    ///
    /// Probes from a rotating cursor so recently freed numbers are not reused
    /// straight away.  Returns [`TransactionHandle::invalid`] when every
    /// number is in use.  The handle is not tracked until [`Self::add`].
    pub fn allocate(&mut self) -> TransactionHandle {
        for i in 0..CLIENT_ID_SPACE {
            let id = (self.cursor + i) % CLIENT_ID_SPACE;
            if self.lookup.contains_key(&(id, Initiator::TargetDevice)) {
                continue;
            }
            self.cursor = (id + 1) % CLIENT_ID_SPACE;
            let handle =
                TransactionHandle::new(self.session, id, self.generation, Initiator::TargetDevice);
            self.generation += 1;
            log::debug!("[transaction] alloc {handle}");
            return handle;
        }

        log::warn!("[transaction] all {CLIENT_ID_SPACE} client ids in use");
        TransactionHandle::invalid()
    }

    pub fn add(
        &mut self,
        handle: TransactionHandle,
        single_side_endable: bool,
    ) -> Result<(), TransactionError> {
        if !handle.is_valid() {
            return Err(TransactionError::InvalidHandle);
        }
        if handle.id > MAX_TRANSACTION_ID {
            return Err(TransactionError::InvalidId(handle.id));
        }
        if self.transactions.contains_key(&handle) || self.lookup.contains_key(&handle.lookup()) {
            return Err(TransactionError::AlreadyExists(handle));
        }

        log::debug!("[transaction] new {handle} sse={single_side_endable}");
        self.lookup.insert(handle.lookup(), handle);
        self.transactions
            .insert(handle, TransactionData::new(handle, single_side_endable));
        Ok(())
    }

    /// Track a transaction the server opened.  Server-opened transactions
    /// are single-side-endable.
    pub fn observe_server(&mut self, id: u32) -> Result<TransactionHandle, TransactionError> {
        let handle =
            TransactionHandle::new(self.session, id, self.generation, Initiator::LocationServer);
        self.add(handle, true)?;
        self.generation += 1;
        Ok(handle)
    }

    pub fn client_end(
        &mut self,
        handle: &TransactionHandle,
    ) -> Result<EndOutcome, TransactionError> {
        let data = self
            .transactions
            .get_mut(handle)
            .ok_or(TransactionError::NotFound(*handle))?;
        if data.client_has_sent_end {
            log::warn!("[transaction] client ending {handle} more than once");
        }
        data.client_has_sent_end = true;

        Ok(EndOutcome {
            removed: self.remove_if_finished(handle),
            notify_server_end: false,
        })
    }

    pub fn server_end(
        &mut self,
        handle: &TransactionHandle,
    ) -> Result<EndOutcome, TransactionError> {
        let data = self
            .transactions
            .get_mut(handle)
            .ok_or(TransactionError::NotFound(*handle))?;
        if data.server_has_sent_end {
            log::warn!("[transaction] server ending {handle} more than once");
        }
        data.server_has_sent_end = true;
        let notify_server_end = !data.single_side_endable && !data.client_has_sent_end;

        Ok(EndOutcome {
            removed: self.remove_if_finished(handle),
            notify_server_end,
        })
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.lookup.clear();
    }

    fn remove_if_finished(&mut self, handle: &TransactionHandle) -> bool {
        let finished = self
            .transactions
            .get(handle)
            .is_some_and(TransactionData::is_finished);
        if !finished {
            return false;
        }

        log::debug!("[transaction] del {handle}");
        self.transactions.remove(handle);
        if self.lookup.get(&handle.lookup()) == Some(handle) {
            self.lookup.remove(&handle.lookup());
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
