//! Fixed-interval callbacks on top of the scheduler's one-shot timers.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::scheduler::Scheduler;
use crate::timer::TimerId;

type PeriodicCallback = Rc<RefCell<dyn FnMut(&PeriodicTask)>>;

struct PeriodicInner {
    interval: Duration,
    scheduler: Option<Scheduler>,
    timer: Option<TimerId>,
    callback: Option<PeriodicCallback>,
    ticks: u64,
}

/// Invokes a callback every `interval` until cancelled.
///
/// The next tick is armed only after the callback returns, so a slow
/// callback stretches the period instead of queueing ticks.
#[derive(Clone)]
pub struct PeriodicTask {
    inner: Rc<RefCell<PeriodicInner>>,
}

impl PeriodicTask {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PeriodicInner {
                interval,
                scheduler: None,
                timer: None,
                callback: None,
                ticks: 0,
            })),
        }
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&PeriodicTask) + 'static,
    {
        self.inner.borrow_mut().callback = Some(Rc::new(RefCell::new(callback)));
    }

    /// Takes effect from the next arming.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.borrow_mut().interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.inner.borrow().interval
    }

    /// Number of callbacks delivered so far.
    pub fn ticks(&self) -> u64 {
        self.inner.borrow().ticks
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.borrow().scheduler.is_some()
    }

    /// Start ticking.  Returns `false` if the task is already scheduled.
    pub fn schedule(&self, scheduler: &Scheduler) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.scheduler.is_some() {
                log::warn!("[periodic] already scheduled");
                return false;
            }
            inner.scheduler = Some(scheduler.clone());
        }
        self.arm();
        true
    }

    /// Stop ticking.  Safe to call from inside the callback.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(scheduler) = inner.scheduler.take() else {
            return false;
        };
        if let Some(timer) = inner.timer.take() {
            scheduler.cancel_timer(timer);
        }
        true
    }

    fn arm(&self) {
        let mut inner = self.inner.borrow_mut();
        let Some(scheduler) = inner.scheduler.clone() else {
            return;
        };
        let weak: Weak<RefCell<PeriodicInner>> = Rc::downgrade(&self.inner);
        let timer = scheduler.add_timer(inner.interval, move |_| {
            if let Some(inner) = weak.upgrade() {
                PeriodicTask { inner }.fire();
            }
        });
        inner.timer = Some(timer);
    }

    fn fire(&self) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            inner.timer = None;
            if inner.scheduler.is_none() {
                return;
            }
            inner.ticks += 1;
            inner.callback.clone()
        };

        if let Some(callback) = callback {
            match callback.try_borrow_mut() {
                Ok(mut cb) => cb(self),
                Err(_) => log::warn!("[periodic] callback re-entered, skipping tick"),
            }
        }

        // The callback may have cancelled (or cancelled and rescheduled) us.
        let rearm = {
            let inner = self.inner.borrow();
            inner.scheduler.is_some() && inner.timer.is_none()
        };
        if rearm {
            self.arm();
        }
    }
}

impl Drop for PeriodicInner {
    fn drop(&mut self) {
        if let (Some(scheduler), Some(timer)) = (self.scheduler.take(), self.timer.take()) {
            scheduler.cancel_timer(timer);
        }
    }
}
