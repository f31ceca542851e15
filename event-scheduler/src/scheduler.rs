//! Single-threaded readiness reactor.
//!
//! [`Scheduler`] owns one `mio::Poll` (epoll on Linux, edge-triggered) and a
//! table of registered file descriptors.  Every registration gets a fresh
//! [`mio::Token`] that is never handed out again, so an event that was
//! already collected for an fd that has since been removed (and possibly
//! re-added) can never reach the wrong callback.
//!
//! ```text
//!   execute_once()
//!     ├── run deferred callbacks queued before the pass
//!     ├── run tick callbacks
//!     ├── epoll_wait(min(limit, next timer, 0 if deferred pending))
//!     ├── dispatch readiness → fd callbacks
//!     ├── fire expired timers
//!     └── run deferred callbacks queued during the pass
//! ```
//!
//! Callbacks receive `&Scheduler` and may freely add, update or remove
//! registrations (including their own) while being dispatched.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use thiserror::Error;

use crate::timer::{TimerId, TimerQueue};

/// Token reserved for the cross-thread [`Interrupter`].
const WAKER_TOKEN: Token = Token(0);

/// Maximum number of readiness events collected per `epoll_wait`.
const EVENT_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `add_fd` on a descriptor that already has a callback.
    #[error("file descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),
    /// `remove_fd` or `update_fd` on a descriptor nobody registered.
    #[error("file descriptor {0} is not registered")]
    NotRegistered(RawFd),
    /// epoll, waker or registry failure from the OS.
    #[error("scheduler I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Readiness reported for one registered fd in one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl Readiness {
    /// `true` for `EPOLLERR` or a full hangup.
    pub fn is_failure(&self) -> bool {
        self.error || (self.read_closed && self.write_closed)
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Callback invoked with the readiness of a registered fd.
pub type EventCallback = Box<dyn FnMut(&Scheduler, Readiness)>;

type Deferred = Box<dyn FnOnce(&Scheduler)>;
type TickCallback = Box<dyn FnMut(&Scheduler)>;

/// Identifies a per-iteration tick callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickId(u64);

/// Wakes a blocked [`Scheduler`] from any thread and asks its run loop to stop.
#[derive(Clone)]
pub struct Interrupter {
    waker: Arc<Waker>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if let Err(e) = self.waker.wake() {
            log::warn!("[scheduler] failed to wake poll: {e}");
        }
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Interrupter")
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    /// Taken out while the callback runs so it can touch the registry.
    callback: Option<EventCallback>,
}

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    registry: Registry,
    waker: Arc<Waker>,
    next_token: Cell<usize>,
    fds: RefCell<HashMap<RawFd, Token>>,
    registrations: RefCell<HashMap<Token, Registration>>,
    deferred: RefCell<VecDeque<Deferred>>,
    timers: RefCell<TimerQueue<Deferred>>,
    ticks: RefCell<Vec<(TickId, Option<TickCallback>)>>,
    next_tick: Cell<u64>,
    interrupted: Cell<bool>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Handle to a single-threaded event loop.
///
/// Cloning is cheap and every clone drives the same loop; tasks keep a clone
/// so they can update their registrations from inside callbacks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registered", &self.registered_count())
            .field("timers", &self.inner.timers.borrow().len())
            .field("deferred", &self.inner.deferred.borrow().len())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Result<Self, SchedulerError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        log::debug!("[scheduler] created");
        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(EVENT_CAPACITY)),
                registry,
                waker,
                next_token: Cell::new(WAKER_TOKEN.0 + 1),
                fds: RefCell::new(HashMap::new()),
                registrations: RefCell::new(HashMap::new()),
                deferred: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerQueue::new()),
                ticks: RefCell::new(Vec::new()),
                next_tick: Cell::new(1),
                interrupted: Cell::new(false),
            }),
        })
    }

    // -----------------------------------------------------------------------
    // File descriptor registry
    // -----------------------------------------------------------------------

    /// Start delivering readiness events for `fd` to `callback`.
    ///
    /// At most one registration per fd may exist at a time.
    pub fn add_fd<F>(&self, fd: RawFd, interest: Interest, callback: F) -> Result<(), SchedulerError>
    where
        F: FnMut(&Scheduler, Readiness) + 'static,
    {
        if self.inner.fds.borrow().contains_key(&fd) {
            log::warn!("[scheduler] fd={fd} already registered");
            return Err(SchedulerError::AlreadyRegistered(fd));
        }

        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);

        self.inner
            .registry
            .register(&mut SourceFd(&fd), token, interest)?;

        self.inner.fds.borrow_mut().insert(fd, token);
        self.inner.registrations.borrow_mut().insert(
            token,
            Registration {
                fd,
                interest,
                callback: Some(Box::new(callback)),
            },
        );
        log::trace!("[scheduler] add fd={fd} token={} {interest:?}", token.0);
        Ok(())
    }

    /// Stop delivering events for `fd`.
    ///
    /// Events for `fd` that were already collected in the current pass are
    /// discarded.  Must be called before the fd is closed.
    pub fn remove_fd(&self, fd: RawFd) -> Result<(), SchedulerError> {
        let token = self
            .inner
            .fds
            .borrow_mut()
            .remove(&fd)
            .ok_or(SchedulerError::NotRegistered(fd))?;
        self.inner.registrations.borrow_mut().remove(&token);

        // The kernel drops closed fds from the epoll set on its own, so a
        // failure here only means the fd is already gone.
        if let Err(e) = self.inner.registry.deregister(&mut SourceFd(&fd)) {
            log::debug!("[scheduler] deregister fd={fd}: {e}");
        }
        log::trace!("[scheduler] remove fd={fd} token={}", token.0);
        Ok(())
    }

    /// Change the interest mask of an already registered fd.
    pub fn update_fd(&self, fd: RawFd, interest: Interest) -> Result<(), SchedulerError> {
        let token = *self
            .inner
            .fds
            .borrow()
            .get(&fd)
            .ok_or(SchedulerError::NotRegistered(fd))?;

        {
            let registrations = self.inner.registrations.borrow();
            if let Some(reg) = registrations.get(&token) {
                if reg.interest == interest {
                    return Ok(());
                }
            }
        }

        self.inner
            .registry
            .reregister(&mut SourceFd(&fd), token, interest)?;
        if let Some(reg) = self.inner.registrations.borrow_mut().get_mut(&token) {
            debug_assert_eq!(reg.fd, fd);
            reg.interest = interest;
        }
        log::trace!("[scheduler] update fd={fd} {interest:?}");
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.fds.borrow().contains_key(&fd)
    }

    pub fn registered_count(&self) -> usize {
        self.inner.fds.borrow().len()
    }

    // -----------------------------------------------------------------------
    // Deferred calls, timers, ticks
    // -----------------------------------------------------------------------

    /// Run `callback` after the current dispatch, never from inside it.
    pub fn defer<F>(&self, callback: F)
    where
        F: FnOnce(&Scheduler) + 'static,
    {
        self.inner.deferred.borrow_mut().push_back(Box::new(callback));
    }

    /// Arm a one-shot timer.
    pub fn add_timer<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&Scheduler) + 'static,
    {
        let id = self
            .inner
            .timers
            .borrow_mut()
            .insert(Instant::now(), delay, Box::new(callback));
        log::trace!("[scheduler] arm {id} in {delay:?}");
        id
    }

    /// Cancel a pending timer.  Returns `false` if it already fired.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().cancel(id).is_some()
    }

    pub fn is_timer_pending(&self, id: TimerId) -> bool {
        self.inner.timers.borrow().contains(id)
    }

    /// Register a callback that runs at the start of every loop iteration.
    pub fn add_tick<F>(&self, callback: F) -> TickId
    where
        F: FnMut(&Scheduler) + 'static,
    {
        let id = TickId(self.inner.next_tick.get());
        self.inner.next_tick.set(id.0 + 1);
        self.inner
            .ticks
            .borrow_mut()
            .push((id, Some(Box::new(callback))));
        id
    }

    pub fn remove_tick(&self, id: TickId) -> bool {
        let mut ticks = self.inner.ticks.borrow_mut();
        let before = ticks.len();
        ticks.retain(|(tick, _)| *tick != id);
        ticks.len() != before
    }

    // -----------------------------------------------------------------------
    // Interruption
    // -----------------------------------------------------------------------

    /// A `Send + Sync` handle that stops [`Scheduler::execute`] from any thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            waker: Arc::clone(&self.inner.waker),
        }
    }

    /// Stop the run loop after the current pass.
    pub fn interrupt(&self) {
        self.inner.interrupted.set(true);
    }

    fn take_interrupt(&self) -> bool {
        self.inner.interrupted.replace(false)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// One wait-and-dispatch pass; blocks until something is ready.
    pub fn execute_once(&self) -> Result<(), SchedulerError> {
        self.pass(None)
    }

    /// Keep dispatching until `duration` has elapsed or the loop is interrupted.
    pub fn execute_timeout(&self, duration: Duration) -> Result<(), SchedulerError> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.pass(Some(deadline - now))?;
            if self.take_interrupt() {
                return Ok(());
            }
        }
    }

    /// Keep dispatching while `condition` holds.
    pub fn execute_while<F>(&self, mut condition: F) -> Result<(), SchedulerError>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            self.pass(None)?;
            if self.take_interrupt() {
                break;
            }
        }
        Ok(())
    }

    /// Run until interrupted.
    pub fn execute(&self) -> Result<(), SchedulerError> {
        log::debug!("[scheduler] running");
        loop {
            self.pass(None)?;
            if self.take_interrupt() {
                log::debug!("[scheduler] interrupted");
                return Ok(());
            }
        }
    }

    fn pass(&self, limit: Option<Duration>) -> Result<(), SchedulerError> {
        self.run_deferred();
        self.run_ticks();

        let timeout = self.poll_timeout(limit);
        for (token, readiness) in self.wait(timeout)? {
            if token == WAKER_TOKEN {
                self.inner.interrupted.set(true);
                continue;
            }
            self.dispatch(token, readiness);
        }

        self.run_timers();
        self.run_deferred();
        Ok(())
    }

    fn poll_timeout(&self, limit: Option<Duration>) -> Option<Duration> {
        if !self.inner.deferred.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        let next_timer = self.inner.timers.borrow().time_until_next(Instant::now());
        match (limit, next_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(Token, Readiness)>, SchedulerError> {
        let mut poll = self.inner.poll.borrow_mut();
        let mut events = self.inner.events.borrow_mut();
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        Ok(events
            .iter()
            .map(|event| (event.token(), Readiness::from(event)))
            .collect())
    }

    fn dispatch(&self, token: Token, readiness: Readiness) {
        let callback = self
            .inner
            .registrations
            .borrow_mut()
            .get_mut(&token)
            .and_then(|reg| reg.callback.take());

        let Some(mut callback) = callback else {
            log::trace!("[scheduler] stale event for token={}", token.0);
            return;
        };

        callback(self, readiness);

        // Put the callback back unless the registration was removed (or
        // replaced) while it ran.
        if let Some(reg) = self.inner.registrations.borrow_mut().get_mut(&token) {
            if reg.callback.is_none() {
                reg.callback = Some(callback);
            }
        }
    }

    fn run_timers(&self) {
        let now = Instant::now();
        loop {
            // Pop one at a time: a timer callback may cancel another timer
            // that is due in the same pass.
            let next = self.inner.timers.borrow_mut().pop_next_expired(now);
            match next {
                Some((id, callback)) => {
                    log::trace!("[scheduler] fire {id}");
                    callback(self);
                }
                None => break,
            }
        }
    }

    fn run_deferred(&self) {
        let batch = std::mem::take(&mut *self.inner.deferred.borrow_mut());
        for callback in batch {
            callback(self);
        }
    }

    fn run_ticks(&self) {
        let ids: Vec<TickId> = self.inner.ticks.borrow().iter().map(|(id, _)| *id).collect();
        for id in ids {
            let callback = self
                .inner
                .ticks
                .borrow_mut()
                .iter_mut()
                .find(|(tick, _)| *tick == id)
                .and_then(|(_, cb)| cb.take());
            let Some(mut callback) = callback else {
                continue;
            };
            callback(self);
            if let Some((_, slot)) = self
                .inner
                .ticks
                .borrow_mut()
                .iter_mut()
                .find(|(tick, _)| *tick == id)
            {
                *slot = Some(callback);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn duplicate_registration_fails() {
        let sched = Scheduler::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        sched.add_fd(fd, Interest::READABLE, |_, _| {}).unwrap();
        assert!(matches!(
            sched.add_fd(fd, Interest::READABLE, |_, _| {}),
            Err(SchedulerError::AlreadyRegistered(_))
        ));
        assert_eq!(sched.registered_count(), 1);
    }

    #[test]
    fn remove_unknown_fd_fails() {
        let sched = Scheduler::new().unwrap();
        assert!(matches!(
            sched.remove_fd(12345),
            Err(SchedulerError::NotRegistered(12345))
        ));
        assert!(matches!(
            sched.update_fd(12345, Interest::READABLE),
            Err(SchedulerError::NotRegistered(12345))
        ));
    }

    #[test]
    fn readable_event_reaches_callback() {
        let sched = Scheduler::new().unwrap();
        let (a, mut b) = pair();
        let hits = Rc::new(Cell::new(0));
        let seen = Rc::clone(&hits);
        sched
            .add_fd(a.as_raw_fd(), Interest::READABLE, move |_, r| {
                assert!(r.readable);
                seen.set(seen.get() + 1);
            })
            .unwrap();

        b.write_all(b"ping").unwrap();
        sched.execute_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn callback_may_remove_itself() {
        let sched = Scheduler::new().unwrap();
        let (a, mut b) = pair();
        let fd = a.as_raw_fd();
        let hits = Rc::new(Cell::new(0));
        let seen = Rc::clone(&hits);
        sched
            .add_fd(fd, Interest::READABLE, move |s, _| {
                seen.set(seen.get() + 1);
                s.remove_fd(fd).unwrap();
            })
            .unwrap();

        b.write_all(b"x").unwrap();
        sched.execute_timeout(Duration::from_millis(20)).unwrap();
        b.write_all(b"y").unwrap();
        sched.execute_timeout(Duration::from_millis(20)).unwrap();
        assert_eq!(hits.get(), 1);
        assert!(!sched.is_registered(fd));
    }

    #[test]
    fn deferred_runs_after_dispatch_not_inside() {
        let sched = Scheduler::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        sched.defer(move |s| {
            log.borrow_mut().push("first");
            let inner = Rc::clone(&log);
            s.defer(move |_| inner.borrow_mut().push("second"));
            log.borrow_mut().push("first-done");
        });

        sched.execute_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "first-done", "second"]);
    }

    #[test]
    fn timer_fires_once_and_cancel_is_safe() {
        let sched = Scheduler::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = Rc::clone(&fired);
        let id = sched.add_timer(Duration::from_millis(5), move |_| f.set(f.get() + 1));
        assert!(sched.is_timer_pending(id));

        sched.execute_timeout(Duration::from_millis(30)).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!sched.cancel_timer(id));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let sched = Scheduler::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        let id = sched.add_timer(Duration::from_millis(5), move |_| f.set(true));
        assert!(sched.cancel_timer(id));
        sched.execute_timeout(Duration::from_millis(20)).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn ticks_run_every_pass_until_removed() {
        let sched = Scheduler::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let id = sched.add_tick(move |_| c.set(c.get() + 1));

        sched.add_timer(Duration::ZERO, |_| {});
        sched.execute_timeout(Duration::from_millis(5)).unwrap();
        assert!(count.get() >= 1);

        assert!(sched.remove_tick(id));
        let before = count.get();
        sched.execute_timeout(Duration::from_millis(5)).unwrap();
        assert_eq!(count.get(), before);
    }

    #[test]
    fn interrupter_stops_execute_from_another_thread() {
        let sched = Scheduler::new().unwrap();
        let interrupter = sched.interrupter();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });
        sched.execute().unwrap();
        handle.join().unwrap();
    }
}
