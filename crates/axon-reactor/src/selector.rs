use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    io,
    rc::{Rc, Weak},
    sync::Arc,
};

use axon_timing::{Clock, Timespan};
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::debug;

use crate::{ReactorError, Selectable, timer::TimerShared};

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 128;

pub(crate) struct SelectorShared {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    waker: Arc<Waker>,
    sources: RefCell<HashMap<Token, Weak<dyn Selectable>>>,
    changed: RefCell<Vec<Token>>,
    avail: RefCell<Vec<Token>>,
    timers: RefCell<BTreeMap<(Timespan, u64), Weak<TimerShared>>>,
    next_token: Cell<usize>,
    next_timer_seq: Cell<u64>,
}

impl SelectorShared {
    fn sync_changes(&self) {
        loop {
            let token = match self.changed.borrow_mut().pop() {
                Some(t) => t,
                None => break,
            };
            let weak = match self.sources.borrow().get(&token) {
                Some(w) => w.clone(),
                None => continue,
            };
            match weak.upgrade() {
                Some(dev) => {
                    let poll = self.poll.borrow();
                    if let Err(err) = dev.sync(poll.registry(), token) {
                        debug!(?err, ?token, "interest sync failed");
                    }
                }
                None => {
                    self.sources.borrow_mut().remove(&token);
                }
            }
        }
    }

    fn nearest_timer(&self) -> Option<Timespan> {
        self.timers.borrow().keys().next().map(|(due, _)| *due)
    }

    /// Fires every timer due at `now`, in strict deadline order. Returns
    /// true if at least one fired.
    fn fire_due_timers(&self, now: Timespan) -> bool {
        let mut fired = false;
        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.keys().next().copied() {
                    Some(key) if key.0 <= now => {
                        let weak = timers.remove(&key).unwrap();
                        Some(weak)
                    }
                    _ => None,
                }
            };
            let Some(weak) = entry else { break };
            let Some(timer) = weak.upgrade() else { continue };
            // Reschedule before the callback so a slot observing the timer
            // sees the next deadline, and so a slot may stop/restart it.
            TimerShared::reschedule_after_fire(&timer, self, now);
            fired = true;
            timer.fire(now);
        }
        fired
    }

    pub(crate) fn insert_timer(&self, due: Timespan, timer: &Rc<TimerShared>) -> (Timespan, u64) {
        let seq = self.next_timer_seq.get();
        self.next_timer_seq.set(seq + 1);
        let key = (due, seq);
        self.timers.borrow_mut().insert(key, Rc::downgrade(timer));
        key
    }

    pub(crate) fn remove_timer(&self, key: (Timespan, u64)) {
        self.timers.borrow_mut().remove(&key);
    }
}

/// Cloneable weak reference devices keep to their selector.
#[derive(Clone)]
pub struct SelectorRef {
    inner: Weak<SelectorShared>,
}

impl SelectorRef {
    pub fn mark_changed(&self, token: Token) {
        if let Some(shared) = self.inner.upgrade() {
            shared.changed.borrow_mut().push(token);
        }
    }

    pub fn remove(&self, token: Token) {
        if let Some(shared) = self.inner.upgrade() {
            shared.sources.borrow_mut().remove(&token);
        }
    }

    /// Queues a device whose transfer completed eagerly for delivery on
    /// the next wait.
    pub fn push_avail(&self, token: Token) {
        if let Some(shared) = self.inner.upgrade() {
            shared.avail.borrow_mut().push(token);
        }
    }

    /// Runs `f` with the poll registry, if the selector is still alive.
    pub fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> Option<R> {
        let shared = self.inner.upgrade()?;
        let poll = shared.poll.borrow();
        Some(f(poll.registry()))
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<SelectorShared>> {
        self.inner.upgrade()
    }
}

/// Thread-safe handle that interrupts a running
/// [`Selector::wait`](Selector::wait).
///
/// This is the only selector operation that may be used from another
/// thread.
#[derive(Clone)]
pub struct WakeHandle {
    waker: Arc<Waker>,
}

impl WakeHandle {
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// Multiplexes readiness of registered devices, timer deadlines and an
/// external wake, delivering each by running its owner's callbacks.
///
/// Single-threaded: `wait` and everything it dispatches into run on the
/// calling thread. Cross-thread interaction goes through [`WakeHandle`].
/// Clones are handles to the same selector, for slots that need to attach
/// devices.
#[derive(Clone)]
pub struct Selector {
    shared: Rc<SelectorShared>,
}

impl Selector {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Selector {
            shared: Rc::new(SelectorShared {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(EVENT_CAPACITY)),
                waker,
                sources: RefCell::new(HashMap::new()),
                changed: RefCell::new(Vec::new()),
                avail: RefCell::new(Vec::new()),
                timers: RefCell::new(BTreeMap::new()),
                next_token: Cell::new(1),
                next_timer_seq: Cell::new(0),
            }),
        })
    }

    /// Registers a device and returns its attachment link.
    ///
    /// The device's change flag starts set, so the first wait builds its
    /// OS registration.
    pub fn add(&self, device: Weak<dyn Selectable>) -> (SelectorRef, Token) {
        let token = Token(self.shared.next_token.get());
        self.shared.next_token.set(token.0 + 1);
        self.shared.sources.borrow_mut().insert(token, device);
        self.shared.changed.borrow_mut().push(token);
        (self.selector_ref(), token)
    }

    pub fn selector_ref(&self) -> SelectorRef {
        SelectorRef { inner: Rc::downgrade(&self.shared) }
    }

    /// Returns a cloneable, thread-safe wake handle.
    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle { waker: Arc::clone(&self.shared.waker) }
    }

    /// Wakes a wait in progress (or makes the next wait return at once).
    pub fn wake(&self) -> io::Result<()> {
        self.shared.waker.wake()
    }

    /// Waits for activity at most `timeout` (`None` waits indefinitely).
    ///
    /// Ready devices are handled before timers; timers fire in deadline
    /// order. Returns `Ok(true)` when at least one event fired, `Ok(false)`
    /// on a pure timeout.
    pub fn wait(&self, timeout: Option<Timespan>) -> Result<bool, ReactorError> {
        self.wait_deadline(timeout.map(|t| Clock::monotonic() + t))
    }

    /// Like [`wait`](Self::wait) with an absolute monotonic deadline.
    pub fn wait_until(&self, deadline: Timespan) -> Result<bool, ReactorError> {
        self.wait_deadline(Some(deadline))
    }

    /// Fires the timers that are already due without blocking and returns
    /// the time remaining until the next timer, or `None` when no timer is
    /// pending.
    pub fn wait_timer(&self) -> Option<Timespan> {
        let now = Clock::monotonic();
        self.shared.fire_due_timers(now);
        self.shared.nearest_timer().map(|due| due.saturating_sub(Clock::monotonic()))
    }

    fn wait_deadline(&self, deadline: Option<Timespan>) -> Result<bool, ReactorError> {
        loop {
            self.shared.sync_changes();

            let now = Clock::monotonic();
            let timer_due = self.shared.nearest_timer();
            let effective = match (deadline, timer_due) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let have_avail = !self.shared.avail.borrow().is_empty();
            let poll_timeout = if have_avail {
                Some(std::time::Duration::ZERO)
            } else {
                effective.map(|d| d.saturating_sub(now).to_std())
            };

            let mut ready: Vec<(Token, bool, bool)> = Vec::new();
            {
                let mut poll = self.shared.poll.borrow_mut();
                let mut events = self.shared.events.borrow_mut();
                match poll.poll(&mut events, poll_timeout) {
                    Ok(()) => {
                        for ev in events.iter() {
                            ready.push((
                                ev.token(),
                                ev.is_readable() || ev.is_read_closed() || ev.is_error(),
                                ev.is_writable() || ev.is_write_closed() || ev.is_error(),
                            ));
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let mut fired = false;
            for (token, readable, writable) in ready {
                if token == WAKE_TOKEN {
                    fired = true;
                    continue;
                }
                let weak = self.shared.sources.borrow().get(&token).cloned();
                if let Some(dev) = weak.and_then(|w| w.upgrade()) {
                    dev.on_ready(readable, writable);
                    fired = true;
                }
            }

            // Eagerly completed transfers count as ready devices and are
            // delivered before any timer.
            let avail = std::mem::take(&mut *self.shared.avail.borrow_mut());
            for token in avail {
                let weak = self.shared.sources.borrow().get(&token).cloned();
                if let Some(dev) = weak.and_then(|w| w.upgrade()) {
                    dev.on_avail();
                    fired = true;
                }
            }

            if self.shared.fire_due_timers(Clock::monotonic()) {
                fired = true;
            }

            if fired {
                return Ok(true);
            }
            if let Some(d) = deadline
                && Clock::monotonic() >= d
            {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, thread, time::Instant};

    use axon_timing::Timespan;

    use super::*;
    use crate::Timer;

    #[test]
    fn pure_timeout_returns_false() {
        let selector = Selector::new().unwrap();
        let before = Instant::now();
        let fired = selector.wait(Some(Timespan::from_millis(20))).unwrap();
        assert!(!fired);
        assert!(before.elapsed() >= std::time::Duration::from_millis(20));
    }

    #[test]
    fn wake_from_other_thread() {
        let selector = Selector::new().unwrap();
        let handle = selector.wake_handle();

        let waker = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            handle.wake().unwrap();
        });

        let before = Instant::now();
        let fired = selector.wait(Some(Timespan::from_secs(5))).unwrap();
        waker.join().unwrap();

        assert!(fired);
        let elapsed = before.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(10));
        assert!(elapsed < std::time::Duration::from_millis(100));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let selector = Selector::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        // Inserted out of deadline order on purpose.
        let slow = Timer::new();
        slow.set_selector(&selector);
        {
            let order = Rc::clone(&order);
            slow.timeout.connect(move |_| order.borrow_mut().push("slow"));
        }
        slow.after(Timespan::from_millis(30));

        let fast = Timer::new();
        fast.set_selector(&selector);
        {
            let order = Rc::clone(&order);
            fast.timeout.connect(move |_| order.borrow_mut().push("fast"));
        }
        fast.after(Timespan::from_millis(5));

        while order.borrow().len() < 2 {
            selector.wait(Some(Timespan::from_millis(100))).unwrap();
        }
        assert_eq!(*order.borrow(), vec!["fast", "slow"]);
    }

    #[test]
    fn periodic_timer_repeats() {
        let selector = Selector::new().unwrap();
        let count = Rc::new(RefCell::new(0u32));

        let timer = Timer::new();
        timer.set_selector(&selector);
        {
            let count = Rc::clone(&count);
            timer.timeout.connect(move |_| *count.borrow_mut() += 1);
        }
        timer.start(Timespan::from_millis(5));

        while *count.borrow() < 3 {
            assert!(selector.wait(Some(Timespan::from_secs(1))).unwrap());
        }
        assert!(timer.active());
    }

    #[test]
    fn slot_may_stop_its_own_timer() {
        let selector = Selector::new().unwrap();
        let count = Rc::new(RefCell::new(0u32));

        let timer = Timer::new();
        timer.set_selector(&selector);
        {
            let count = Rc::clone(&count);
            let timer2 = timer.clone();
            timer.timeout.connect(move |_| {
                *count.borrow_mut() += 1;
                timer2.stop();
            });
        }
        timer.start(Timespan::from_millis(5));

        selector.wait(Some(Timespan::from_millis(50))).unwrap();
        let fired = selector.wait(Some(Timespan::from_millis(20))).unwrap();
        assert_eq!(*count.borrow(), 1);
        assert!(!fired);
        assert!(!timer.active());
    }

    #[test]
    fn wait_timer_reports_remaining() {
        let selector = Selector::new().unwrap();
        assert!(selector.wait_timer().is_none());

        let timer = Timer::new();
        timer.set_selector(&selector);
        timer.after(Timespan::from_secs(60));

        let remaining = selector.wait_timer().unwrap();
        assert!(remaining > Timespan::from_secs(59));
        assert!(remaining <= Timespan::from_secs(60));
    }
}
