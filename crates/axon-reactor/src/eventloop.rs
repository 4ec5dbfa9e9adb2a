use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use axon_signal::Signal;
use axon_timing::Timespan;

use crate::{ReactorError, Selector, WakeHandle};

/// A queued cross-thread event. Handlers downcast to the concrete type
/// they understand.
pub type Event = Box<dyn Any + Send>;

struct QueueShared {
    normal: Mutex<VecDeque<Event>>,
    priority: Mutex<VecDeque<Event>>,
    exit: AtomicBool,
}

/// Thread-safe producer half of an [`EventLoop`].
#[derive(Clone)]
pub struct EventSender {
    queue: Arc<QueueShared>,
    wake: WakeHandle,
}

impl EventSender {
    /// Enqueues an event and wakes the loop.
    pub fn commit(&self, event: Event) {
        self.queue.normal.lock().unwrap().push_back(event);
        let _ = self.wake.wake();
    }

    /// Enqueues an event ahead of all normal events of the next batch.
    pub fn commit_priority(&self, event: Event) {
        self.queue.priority.lock().unwrap().push_back(event);
        let _ = self.wake.wake();
    }

    /// Asks the loop to leave [`EventLoop::run`] after the current batch.
    pub fn exit(&self) {
        self.queue.exit.store(true, Ordering::Release);
        let _ = self.wake.wake();
    }
}

/// A selector paired with a cross-thread event queue.
///
/// Other threads commit events through an [`EventSender`]; the loop thread
/// dispatches them through [`event_received`](Self::event_received) in
/// submission order, priority events first within a batch.
pub struct EventLoop {
    selector: Selector,
    queue: Arc<QueueShared>,
    /// Dispatches each queued event on the loop thread.
    pub event_received: Signal<dyn Any>,
}

impl EventLoop {
    pub fn new() -> Result<Self, ReactorError> {
        let selector = Selector::new()?;
        Ok(EventLoop {
            selector,
            queue: Arc::new(QueueShared {
                normal: Mutex::new(VecDeque::new()),
                priority: Mutex::new(VecDeque::new()),
                exit: AtomicBool::new(false),
            }),
            event_received: Signal::new(),
        })
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender { queue: Arc::clone(&self.queue), wake: self.selector.wake_handle() }
    }

    /// Dispatches the events queued so far. Events committed while the
    /// batch runs are kept for the next batch.
    pub fn process_events(&self) {
        let mut batch: VecDeque<Event> = std::mem::take(&mut *self.queue.priority.lock().unwrap());
        batch.append(&mut self.queue.normal.lock().unwrap());
        for event in batch {
            self.event_received.send(&*event);
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.queue.exit.load(Ordering::Acquire)
    }

    /// Runs until [`EventSender::exit`] is called.
    pub fn run(&self) -> Result<(), ReactorError> {
        while !self.exit_requested() {
            self.selector.wait(None)?;
            self.process_events();
        }
        Ok(())
    }

    /// Runs one iteration with a timeout; used by tests and by callers
    /// embedding the loop.
    pub fn run_once(&self, timeout: Option<Timespan>) -> Result<bool, ReactorError> {
        let fired = self.selector.wait(timeout)?;
        self.process_events();
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, thread};

    use super::*;

    #[test]
    fn events_in_submission_order() {
        let lp = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            lp.event_received.connect(move |ev: &dyn Any| {
                if let Some(n) = ev.downcast_ref::<u32>() {
                    seen.borrow_mut().push(*n);
                }
            });
        }

        let tx = lp.event_sender();
        tx.commit(Box::new(1u32));
        tx.commit(Box::new(2u32));
        tx.commit(Box::new(3u32));

        lp.run_once(Some(Timespan::from_millis(100))).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn priority_events_precede_normal() {
        let lp = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            lp.event_received.connect(move |ev: &dyn Any| {
                if let Some(s) = ev.downcast_ref::<&str>() {
                    seen.borrow_mut().push(*s);
                }
            });
        }

        let tx = lp.event_sender();
        tx.commit(Box::new("normal"));
        tx.commit_priority(Box::new("urgent"));

        lp.run_once(Some(Timespan::from_millis(100))).unwrap();
        assert_eq!(*seen.borrow(), vec!["urgent", "normal"]);
    }

    #[test]
    fn run_exits_on_request() {
        let lp = EventLoop::new().unwrap();
        let tx = lp.event_sender();

        let t = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            tx.exit();
        });

        lp.run().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn commit_from_other_thread_wakes_loop() {
        let lp = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(0u32));
        {
            let seen = Rc::clone(&seen);
            lp.event_received.connect(move |ev: &dyn Any| {
                if ev.downcast_ref::<u32>().is_some() {
                    *seen.borrow_mut() += 1;
                }
            });
        }

        let tx = lp.event_sender();
        let t = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            tx.commit(Box::new(9u32));
        });

        let fired = lp.run_once(Some(Timespan::from_secs(5))).unwrap();
        t.join().unwrap();
        assert!(fired);
        assert_eq!(*seen.borrow(), 1);
    }
}
