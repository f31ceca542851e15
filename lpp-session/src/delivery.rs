//! Periodic sends on one transaction.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use event_scheduler::periodic::PeriodicTask;
use event_scheduler::Scheduler;

use crate::message::{LppMessage, MessageBody};
use crate::session::{Session, WeakSession};
use crate::transaction::TransactionHandle;

type Provider = Rc<RefCell<dyn FnMut() -> Option<MessageBody>>>;

/// Sends whatever `provider` returns on `handle` every `interval`.
///
/// A tick where the provider returns `None` sends nothing.  Delivery stops
/// by itself once the session is dropped or the transaction has ended.  The
/// delivery holds only a weak reference to the session.
pub struct PeriodicDelivery {
    task: PeriodicTask,
    deliveries: Rc<RefCell<u64>>,
}

impl PeriodicDelivery {
    pub fn new<F>(
        session: &Session,
        handle: TransactionHandle,
        interval: Duration,
        provider: F,
    ) -> Self
    where
        F: FnMut() -> Option<MessageBody> + 'static,
    {
        let task = PeriodicTask::new(interval);
        let deliveries = Rc::new(RefCell::new(0u64));
        let provider: Provider = Rc::new(RefCell::new(provider));

        let weak = session.downgrade();
        let counter = Rc::clone(&deliveries);
        task.set_callback(move |task| {
            tick(&weak, &handle, &provider, &counter, task);
        });

        Self { task, deliveries }
    }

    pub fn schedule(&self, scheduler: &Scheduler) -> bool {
        self.task.schedule(scheduler)
    }

    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.is_scheduled()
    }

    /// Messages handed to the session so far.
    pub fn deliveries(&self) -> u64 {
        *self.deliveries.borrow()
    }
}

fn tick(
    weak: &WeakSession,
    handle: &TransactionHandle,
    provider: &Provider,
    counter: &Rc<RefCell<u64>>,
    task: &PeriodicTask,
) {
    let Some(session) = weak.upgrade() else {
        log::debug!("[delivery] session gone, stopping");
        task.cancel();
        return;
    };
    if !session.has_transaction(handle) {
        log::debug!("[delivery] {handle} ended, stopping");
        task.cancel();
        return;
    }

    let body = match provider.try_borrow_mut() {
        Ok(mut provider) => provider(),
        Err(_) => return,
    };
    let Some(body) = body else {
        log::trace!("[delivery] nothing to send on {handle}");
        return;
    };

    match session.send(handle, LppMessage::new(body)) {
        Ok(()) => *counter.borrow_mut() += 1,
        Err(e) => log::warn!("[delivery] send on {handle} failed: {e}"),
    }
}

impl std::fmt::Debug for PeriodicDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicDelivery")
            .field("interval", &self.task.interval())
            .field("deliveries", &self.deliveries())
            .field("scheduled", &self.task.is_scheduled())
            .finish()
    }
}
