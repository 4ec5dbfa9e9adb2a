//! Typed many-to-many notification.
//!
//! A [`Signal`] owns an ordered list of slots. Sending invokes every slot
//! that is still connected, in connection order. Slots are free to
//! disconnect themselves or other slots of the same signal while a send is
//! in progress; the signal defers list compaction until the outermost send
//! has returned, so the dispatch iterator stays valid.
//!
//! Signals are single-threaded. They live on the selector thread together
//! with the devices that emit them.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

/// Shared state of one connection: a validity flag plus a back reference
/// to the sender used for eager removal when no dispatch is running.
struct ConnectionNode {
    valid: Cell<bool>,
    sender: RefCell<Weak<dyn Sender>>,
}

impl ConnectionNode {
    fn new() -> Rc<Self> {
        let unset: Weak<dyn Sender> = Weak::<Never>::new();
        Rc::new(ConnectionNode { valid: Cell::new(true), sender: RefCell::new(unset) })
    }
}

// Weak::new() needs a sized type to start from; this one is never
// instantiated.
struct Never;
impl Sender for Never {
    fn dispatching(&self) -> bool {
        false
    }
    fn compact(&self) {}
    fn mark_dirty(&self) {}
}

trait Sender {
    fn dispatching(&self) -> bool;
    fn compact(&self);
    fn mark_dirty(&self);
}

/// Handle to one signal/slot link.
///
/// The handle is reference counted; the link stays identifiable as long as
/// either the signal or any handle clone exists. [`close`](Connection::close)
/// is idempotent.
#[derive(Clone)]
pub struct Connection {
    node: Rc<ConnectionNode>,
}

impl Connection {
    /// True while the slot will still be invoked by sends.
    #[inline]
    pub fn valid(&self) -> bool {
        self.node.valid.get()
    }

    /// Invalidates the link.
    ///
    /// When no send is in progress on the sender, the slot is removed from
    /// the sender's list immediately; otherwise the sender compacts after
    /// the running dispatch completes.
    pub fn close(&self) {
        if !self.node.valid.replace(false) {
            return;
        }
        if let Some(sender) = self.node.sender.borrow().upgrade() {
            if sender.dispatching() {
                sender.mark_dirty();
            } else {
                sender.compact();
            }
        }
    }
}

struct SlotEntry<T: ?Sized> {
    node: Rc<ConnectionNode>,
    func: Rc<RefCell<dyn FnMut(&T)>>,
}

impl<T: ?Sized> Clone for SlotEntry<T> {
    fn clone(&self) -> Self {
        SlotEntry { node: Rc::clone(&self.node), func: Rc::clone(&self.func) }
    }
}

struct SignalInner<T: ?Sized> {
    slots: RefCell<Vec<SlotEntry<T>>>,
    // Recursion depth of send(); compaction only runs at depth zero.
    depth: Cell<u32>,
    dirty: Cell<bool>,
}

impl<T: ?Sized + 'static> Sender for SignalInner<T> {
    fn dispatching(&self) -> bool {
        self.depth.get() > 0
    }

    fn compact(&self) {
        self.slots.borrow_mut().retain(|s| s.node.valid.get());
        self.dirty.set(false);
    }

    fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

/// A typed notification source.
///
/// `T` is the argument type passed by reference to every slot. Devices
/// expose their signals as public fields, e.g.
/// `pub input_ready: Signal<BufferedSocket>`.
pub struct Signal<T: ?Sized> {
    inner: Rc<SignalInner<T>>,
}

impl<T: ?Sized + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Signal<T> {
    pub fn new() -> Self {
        Signal {
            inner: Rc::new(SignalInner {
                slots: RefCell::new(Vec::new()),
                depth: Cell::new(0),
                dirty: Cell::new(false),
            }),
        }
    }

    /// Appends a slot and returns its connection handle.
    ///
    /// Slots connected while a send is running do not see the running
    /// send; they participate from the next one.
    pub fn connect<F>(&self, f: F) -> Connection
    where
        F: FnMut(&T) + 'static,
    {
        let node = ConnectionNode::new();
        let weak_inner: Weak<SignalInner<T>> = Rc::downgrade(&self.inner);
        let sender: Weak<dyn Sender> = weak_inner;
        *node.sender.borrow_mut() = sender;
        self.inner
            .slots
            .borrow_mut()
            .push(SlotEntry { node: Rc::clone(&node), func: Rc::new(RefCell::new(f)) });
        Connection { node }
    }

    /// Closes one connection. Equivalent to `connection.close()`.
    pub fn disconnect(&self, connection: &Connection) {
        connection.close();
    }

    /// Closes every connection.
    pub fn clear(&self) {
        for slot in self.inner.slots.borrow().iter() {
            slot.node.valid.set(false);
        }
        if self.inner.dispatching() {
            self.inner.mark_dirty();
        } else {
            self.inner.compact();
        }
    }

    /// Number of live connections.
    pub fn slot_count(&self) -> usize {
        self.inner.slots.borrow().iter().filter(|s| s.node.valid.get()).count()
    }

    pub fn connected(&self) -> bool {
        self.slot_count() > 0
    }

    /// Invokes every valid slot with `arg`, in connection order.
    ///
    /// Slots invalidated by an earlier slot of the same send are skipped.
    /// Recursive sends are allowed; the list is compacted once the
    /// outermost send returns. The `Rc` clone held for the duration of the
    /// call keeps the slot list alive even if the last external `Signal`
    /// handle is dropped from inside a slot.
    pub fn send(&self, arg: &T) {
        let inner = Rc::clone(&self.inner);
        inner.depth.set(inner.depth.get() + 1);

        // Length snapshot: slots appended during dispatch run next time.
        let count = inner.slots.borrow().len();
        for idx in 0..count {
            let entry = {
                let slots = inner.slots.borrow();
                match slots.get(idx) {
                    Some(e) if e.node.valid.get() => e.clone(),
                    _ => continue,
                }
            };
            // No borrow is held here, so the slot may connect, disconnect
            // or send recursively.
            (entry.func.borrow_mut())(arg);
        }

        let depth = inner.depth.get() - 1;
        inner.depth.set(depth);
        if depth == 0 && inner.dirty.get() {
            inner.compact();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_in_connection_order() {
        let sig: Signal<u32> = Signal::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let calls = Rc::clone(&calls);
            sig.connect(move |v: &u32| calls.borrow_mut().push((tag, *v)));
        }

        sig.send(&7);
        assert_eq!(*calls.borrow(), vec![("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn close_is_idempotent_and_removes() {
        let sig: Signal<()> = Signal::new();
        let conn = sig.connect(|_| {});
        assert!(conn.valid());
        assert_eq!(sig.slot_count(), 1);

        conn.close();
        conn.close();
        assert!(!conn.valid());
        assert_eq!(sig.slot_count(), 0);
    }

    #[test]
    fn slot_disconnects_itself_runs_once() {
        let sig: Signal<()> = Signal::new();
        let count = Rc::new(Cell::new(0u32));

        let conn: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
        let c = {
            let count = Rc::clone(&count);
            let conn = Rc::clone(&conn);
            sig.connect(move |_| {
                count.set(count.get() + 1);
                conn.borrow().as_ref().unwrap().close();
            })
        };
        *conn.borrow_mut() = Some(c);

        sig.send(&());
        sig.send(&());
        assert_eq!(count.get(), 1);
        assert_eq!(sig.slot_count(), 0);
    }

    #[test]
    fn middle_slot_disconnects_first() {
        // Three slots a, b, c; b closes a. Expected: a, b, c all run in the
        // first send, only b and c in the second.
        let sig: Signal<()> = Signal::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let conn_a = {
            let calls = Rc::clone(&calls);
            sig.connect(move |_| calls.borrow_mut().push("a"))
        };
        {
            let calls = Rc::clone(&calls);
            let conn_a = conn_a.clone();
            sig.connect(move |_| {
                calls.borrow_mut().push("b");
                conn_a.close();
            });
        }
        {
            let calls = Rc::clone(&calls);
            sig.connect(move |_| calls.borrow_mut().push("c"));
        }

        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["a", "b", "c"]);

        calls.borrow_mut().clear();
        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["b", "c"]);
    }

    #[test]
    fn later_slot_closed_mid_send_is_skipped() {
        let sig: Signal<()> = Signal::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let conn_c: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
        {
            let calls = Rc::clone(&calls);
            let conn_c = Rc::clone(&conn_c);
            sig.connect(move |_| {
                calls.borrow_mut().push("a");
                conn_c.borrow().as_ref().unwrap().close();
            });
        }
        let c = {
            let calls = Rc::clone(&calls);
            sig.connect(move |_| calls.borrow_mut().push("c"))
        };
        *conn_c.borrow_mut() = Some(c);

        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["a"]);
    }

    #[test]
    fn connect_during_send_runs_next_time() {
        let sig: Rc<Signal<()>> = Rc::new(Signal::new());
        let calls = Rc::new(RefCell::new(Vec::new()));

        {
            let sig2 = Rc::clone(&sig);
            let calls = Rc::clone(&calls);
            let hooked = Cell::new(false);
            sig.connect(move |_| {
                calls.borrow_mut().push("a");
                if !hooked.replace(true) {
                    let calls = Rc::clone(&calls);
                    sig2.connect(move |_| calls.borrow_mut().push("late"));
                }
            });
        }

        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["a"]);

        calls.borrow_mut().clear();
        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["a", "late"]);
    }

    #[test]
    fn recursive_send() {
        let a: Rc<Signal<u32>> = Rc::new(Signal::new());
        let b: Rc<Signal<u32>> = Rc::new(Signal::new());
        let calls = Rc::new(RefCell::new(Vec::new()));

        {
            let calls = Rc::clone(&calls);
            let b = Rc::clone(&b);
            a.connect(move |v: &u32| {
                calls.borrow_mut().push(("a", *v));
                if *v == 0 {
                    b.send(&1);
                }
            });
        }
        {
            let calls = Rc::clone(&calls);
            let a2 = Rc::clone(&a);
            b.connect(move |v: &u32| {
                calls.borrow_mut().push(("b", *v));
                a2.send(&2);
            });
        }

        a.send(&0);
        assert_eq!(*calls.borrow(), vec![("a", 0), ("b", 1), ("a", 2)]);
    }

    #[test]
    fn clear_during_send() {
        let sig: Rc<Signal<()>> = Rc::new(Signal::new());
        let calls = Rc::new(RefCell::new(Vec::new()));

        {
            let calls = Rc::clone(&calls);
            let sig2 = Rc::clone(&sig);
            sig.connect(move |_| {
                calls.borrow_mut().push("a");
                sig2.clear();
            });
        }
        {
            let calls = Rc::clone(&calls);
            sig.connect(move |_| calls.borrow_mut().push("b"));
        }

        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["a"]);
        assert_eq!(sig.slot_count(), 0);

        sig.send(&());
        assert_eq!(*calls.borrow(), vec!["a"]);
    }

    #[test]
    fn signal_dropped_from_slot() {
        let sig: Rc<RefCell<Option<Signal<()>>>> = Rc::new(RefCell::new(Some(Signal::new())));
        let ran = Rc::new(Cell::new(false));

        let handle = {
            let sig = Rc::clone(&sig);
            let ran = Rc::clone(&ran);
            let inner = {
                let s = sig.borrow();
                Rc::clone(&s.as_ref().unwrap().inner)
            };
            Signal { inner: Rc::clone(&inner) }.connect(move |_| {
                ran.set(true);
                // Drop the last external handle mid-dispatch.
                *sig.borrow_mut() = None;
            });
            Signal { inner }
        };

        handle.send(&());
        assert!(ran.get());
    }
}
