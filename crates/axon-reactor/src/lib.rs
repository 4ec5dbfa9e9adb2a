//! Single-threaded readiness multiplexing.
//!
//! A [`Selector`] waits on OS-level readiness of registered devices, on
//! timer deadlines, and on an external wake, and delivers each to its
//! owner by running callbacks on the selector thread. This is the
//! concurrency contract of the whole stack: everything above the selector
//! is single-threaded and lock-free; [`WakeHandle`] is the one cross-thread
//! entry point.

mod error;
mod eventloop;
mod iocore;
mod selectable;
mod selector;
mod timer;

pub use error::ReactorError;
pub use eventloop::{Event, EventLoop, EventSender};
pub use iocore::{IoCore, IoState};
pub use mio::{Interest, Registry, Token};
pub use selectable::{Attachment, Selectable};
pub use selector::{Selector, SelectorRef, WakeHandle};
pub use timer::{Timer, TimerShared};
