use std::{
    cell::{Cell, RefCell},
    ops::Deref,
    rc::Rc,
};

use axon_signal::Signal;
use axon_timing::{Clock, Timespan, next_tick};

use crate::{Selector, SelectorRef, selector::SelectorShared};

/// Shared timer state; reachable through [`Timer`]'s `Deref`.
pub struct TimerShared {
    /// Fires on the selector thread with the monotonic time of the tick.
    pub timeout: Signal<Timespan>,
    interval: Cell<Timespan>,
    due: Cell<Timespan>,
    periodic: Cell<bool>,
    active: Cell<bool>,
    key: Cell<Option<(Timespan, u64)>>,
    selector: RefCell<Option<SelectorRef>>,
}

impl TimerShared {
    /// Advances or deactivates after a tick. Runs before the timeout
    /// signal so slots observe the post-fire schedule.
    pub(crate) fn reschedule_after_fire(this: &Rc<Self>, shared: &SelectorShared, now: Timespan) {
        this.key.set(None);
        if this.periodic.get() {
            // However many periods elapsed, one tick fires and the next
            // due time lands after now.
            let due = next_tick(this.due.get(), this.interval.get(), now);
            this.due.set(due);
            this.key.set(Some(shared.insert_timer(due, this)));
        } else {
            this.active.set(false);
        }
    }

    pub(crate) fn fire(&self, now: Timespan) {
        self.timeout.send(&now);
    }
}

/// A deadline source registered with at most one selector.
///
/// `start` arms periodic ticks, `after`/`at` one-shots. All scheduling is
/// in the selector's monotonic time base.
#[derive(Clone)]
pub struct Timer {
    shared: Rc<TimerShared>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Timer {
    type Target = TimerShared;

    fn deref(&self) -> &TimerShared {
        &self.shared
    }
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            shared: Rc::new(TimerShared {
                timeout: Signal::new(),
                interval: Cell::new(Timespan::ZERO),
                due: Cell::new(Timespan::ZERO),
                periodic: Cell::new(false),
                active: Cell::new(false),
                key: Cell::new(None),
                selector: RefCell::new(None),
            }),
        }
    }

    /// Attaches to `selector`. A timer registers with at most one selector;
    /// attaching to another one moves it.
    pub fn set_selector(&self, selector: &Selector) {
        self.unschedule();
        *self.shared.selector.borrow_mut() = Some(selector.selector_ref());
        if self.shared.active.get() {
            self.schedule();
        }
    }

    pub fn detach(&self) {
        self.unschedule();
        *self.shared.selector.borrow_mut() = None;
    }

    /// Arms a periodic tick every `interval`, first due one interval from
    /// now.
    pub fn start(&self, interval: Timespan) {
        self.start_at(Clock::monotonic() + interval, interval);
    }

    /// Arms a periodic tick with an absolute first deadline.
    pub fn start_at(&self, first_due: Timespan, interval: Timespan) {
        self.unschedule();
        self.shared.interval.set(interval);
        self.shared.due.set(first_due);
        self.shared.periodic.set(true);
        self.shared.active.set(true);
        self.schedule();
    }

    /// Arms a single tick `delay` from now.
    pub fn after(&self, delay: Timespan) {
        self.at(Clock::monotonic() + delay);
    }

    /// Arms a single tick at an absolute monotonic deadline.
    pub fn at(&self, due: Timespan) {
        self.unschedule();
        self.shared.interval.set(Timespan::ZERO);
        self.shared.due.set(due);
        self.shared.periodic.set(false);
        self.shared.active.set(true);
        self.schedule();
    }

    pub fn stop(&self) {
        self.unschedule();
        self.shared.active.set(false);
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.shared.active.get()
    }

    #[inline]
    pub fn interval(&self) -> Timespan {
        self.shared.interval.get()
    }

    /// Next deadline, if armed.
    pub fn due(&self) -> Option<Timespan> {
        self.shared.active.get().then(|| self.shared.due.get())
    }

    fn schedule(&self) {
        let selector = self.shared.selector.borrow();
        if let Some(sel) = selector.as_ref().and_then(SelectorRef::upgrade) {
            self.shared.key.set(Some(sel.insert_timer(self.shared.due.get(), &self.shared)));
        }
    }

    fn unschedule(&self) {
        if let Some(key) = self.shared.key.take() {
            let selector = self.shared.selector.borrow();
            if let Some(sel) = selector.as_ref().and_then(SelectorRef::upgrade) {
                sel.remove_timer(key);
            }
        }
    }
}

impl Drop for TimerShared {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let selector = self.selector.borrow();
            if let Some(sel) = selector.as_ref().and_then(SelectorRef::upgrade) {
                sel.remove_timer(key);
            }
        }
    }
}
