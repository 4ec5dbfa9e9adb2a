use mio::{Registry, Token};

use crate::SelectorRef;

/// The contract of everything a [`Selector`](crate::Selector) can wait on.
///
/// A device is attached to at most one selector at a time. The selector
/// keeps a weak reference; the device keeps an [`Attachment`] and is
/// responsible for removing itself on drop, before its OS handle is
/// released.
pub trait Selectable {
    /// Applies the device's current interest set to the OS registration.
    ///
    /// Called by the selector before each wait for devices that flagged a
    /// change. The device registers, reregisters or deregisters its `mio`
    /// source depending on its state.
    fn sync(&self, registry: &Registry, token: Token) -> std::io::Result<()>;

    /// Readiness delivery; runs the device's state-specific handler.
    fn on_ready(&self, readable: bool, writable: bool);

    /// Delivery of a transfer that completed eagerly, without an OS event.
    ///
    /// Devices queue themselves with [`SelectorRef::push_avail`] when a
    /// begin call finishes immediately; the selector reports them on the
    /// next wait, before any timer fires.
    fn on_avail(&self) {}
}

/// A device's link back to its selector.
#[derive(Clone)]
pub struct Attachment {
    selector: SelectorRef,
    token: Token,
}

impl Attachment {
    pub fn new(selector: SelectorRef, token: Token) -> Self {
        Attachment { selector, token }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn selector(&self) -> &SelectorRef {
        &self.selector
    }

    /// Flags this device as needing an interest-set sync before the next
    /// wait.
    #[inline]
    pub fn mark_changed(&self) {
        self.selector.mark_changed(self.token);
    }
}
