use std::{
    cell::{Cell, RefCell},
    io,
    net::{SocketAddr, ToSocketAddrs},
    ops::Deref,
    rc::{Rc, Weak},
};

use axon_reactor::{Attachment, Interest, Registry, Selectable, Selector, Token};
use axon_signal::Signal;
use tracing::{debug, info};

use crate::NetError;

pub struct TcpServerSignals {
    /// At least one connection waits in the accept queue. Call
    /// [`TcpServer::accept`] until it returns `None`.
    pub connection_pending: Signal<TcpServer>,
}

pub(crate) struct ServerShared {
    sigs: TcpServerSignals,
    listener: RefCell<Option<mio::net::TcpListener>>,
    attachment: RefCell<Option<Attachment>>,
    registered: Cell<bool>,
    self_weak: Weak<ServerShared>,
}

impl ServerShared {
    fn handle(&self) -> TcpServer {
        TcpServer { shared: self.self_weak.upgrade().expect("self weak while alive") }
    }

    fn detach_device(&self) {
        let att = self.attachment.borrow_mut().take();
        if let Some(att) = att {
            if self.registered.get() {
                att.selector().with_registry(|reg| {
                    if let Some(listener) = self.listener.borrow_mut().as_mut() {
                        let _ = reg.deregister(listener);
                    }
                });
                self.registered.set(false);
            }
            att.selector().remove(att.token());
        }
    }
}

impl Selectable for ServerShared {
    fn sync(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut listener = self.listener.borrow_mut();
        let Some(listener) = listener.as_mut() else {
            self.registered.set(false);
            return Ok(());
        };
        if !self.registered.get() {
            registry.register(listener, token, Interest::READABLE)?;
            self.registered.set(true);
        }
        Ok(())
    }

    fn on_ready(&self, readable: bool, _writable: bool) {
        if readable {
            self.sigs.connection_pending.send(&self.handle());
        }
    }
}

impl Drop for ServerShared {
    fn drop(&mut self) {
        self.detach_device();
    }
}

/// A listening socket device.
///
/// Accepting is non-blocking; the `connection_pending` signal reports
/// readiness and [`accept`](Self::accept) drains the queue.
#[derive(Clone)]
pub struct TcpServer {
    shared: Rc<ServerShared>,
}

impl Deref for TcpServer {
    type Target = TcpServerSignals;

    fn deref(&self) -> &TcpServerSignals {
        &self.shared.sigs
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpServer {
    pub fn new() -> Self {
        let shared = Rc::new_cyclic(|weak: &Weak<ServerShared>| ServerShared {
            sigs: TcpServerSignals { connection_pending: Signal::new() },
            listener: RefCell::new(None),
            attachment: RefCell::new(None),
            registered: Cell::new(false),
            self_weak: weak.clone(),
        });
        TcpServer { shared }
    }

    /// Binds and starts listening.
    pub fn listen<A: ToSocketAddrs>(&self, addrs: A) -> Result<SocketAddr, NetError> {
        let mut last: Option<io::Error> = None;
        for addr in addrs.to_socket_addrs()? {
            match mio::net::TcpListener::bind(addr) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    info!(%local, "listening");
                    *self.shared.listener.borrow_mut() = Some(listener);
                    self.shared.registered.set(false);
                    if let Some(att) = self.shared.attachment.borrow().as_ref() {
                        att.mark_changed();
                    }
                    return Ok(local);
                }
                Err(e) => {
                    debug!(?addr, ?e, "bind");
                    last = Some(e);
                }
            }
        }
        Err(match last {
            Some(e) => NetError::Io(e),
            None => NetError::AddressResolution,
        })
    }

    pub fn set_selector(&self, selector: &Selector) {
        self.shared.detach_device();
        let weak_shared: Weak<ServerShared> = Rc::downgrade(&self.shared);
        let weak: Weak<dyn Selectable> = weak_shared;
        let (selref, token) = selector.add(weak);
        *self.shared.attachment.borrow_mut() = Some(Attachment::new(selref, token));
        self.shared.registered.set(false);
        if self.shared.listener.borrow().is_some() {
            self.shared.attachment.borrow().as_ref().unwrap().mark_changed();
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        let listener = self.shared.listener.borrow();
        Ok(listener.as_ref().ok_or(NetError::NotConnected)?.local_addr()?)
    }

    /// Accepts one pending connection; `None` when the queue is drained.
    pub fn accept(&self) -> Result<Option<(mio::net::TcpStream, SocketAddr)>, NetError> {
        let listener = self.shared.listener.borrow();
        let listener = listener.as_ref().ok_or(NetError::NotConnected)?;
        match listener.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stops listening and releases the fd.
    pub fn close(&self) {
        self.shared.detach_device();
        self.shared.listener.borrow_mut().take();
    }
}
