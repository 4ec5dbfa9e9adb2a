use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
    ops::Deref,
    os::fd::AsRawFd,
    rc::{Rc, Weak},
};

use axon_reactor::{Attachment, Interest, IoCore, IoState, Registry, Selectable, Selector, Token};
use axon_signal::Signal;
use axon_timing::{Clock, Timespan};
use tracing::debug;

use crate::{NetError, set_socket_buf_size};

/// Signals of a [`TcpSocket`]; reachable through its `Deref`.
pub struct TcpSignals {
    /// Deferred connect completed.
    pub connected: Signal<TcpSocket>,
    /// Deferred connect failed on every resolved address.
    pub connect_failed: Signal<NetError>,
    /// A pending read finished; collect it with `end_read`.
    pub input_ready: Signal<TcpSocket>,
    /// A pending write finished; collect it with `end_write`.
    pub output_ready: Signal<TcpSocket>,
}

pub(crate) struct TcpShared {
    sigs: TcpSignals,
    stream: RefCell<Option<mio::net::TcpStream>>,
    io: IoCore,
    connecting: Cell<bool>,
    connected: Cell<bool>,
    pending_addrs: RefCell<VecDeque<SocketAddr>>,
    error: RefCell<Option<io::Error>>,
    attachment: RefCell<Option<Attachment>>,
    registered: Cell<bool>,
    self_weak: Weak<TcpShared>,
}

impl TcpShared {
    fn handle(&self) -> TcpSocket {
        TcpSocket { shared: self.self_weak.upgrade().expect("self weak while alive") }
    }

    fn mark_changed(&self) {
        if let Some(att) = self.attachment.borrow().as_ref() {
            att.mark_changed();
        }
    }

    /// Queue completion delivery: through the selector when attached,
    /// otherwise the caller collects the Avail state directly.
    fn queue_avail(&self) {
        if let Some(att) = self.attachment.borrow().as_ref() {
            att.selector().push_avail(att.token());
        }
    }

    fn wanted_interest(&self) -> Option<Interest> {
        if self.connecting.get() {
            return Some(Interest::WRITABLE);
        }
        match self.io.state() {
            IoState::Reading => Some(Interest::READABLE),
            IoState::Writing => Some(Interest::WRITABLE),
            _ => None,
        }
    }

    fn do_read(&self) {
        let result = {
            let mut stream = self.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else { return };
            self.io.with_buf(|buf| stream.read(buf))
        };
        match result {
            Ok(n) => {
                self.io.complete_read(n, n == 0);
                self.mark_changed();
                self.sigs.input_ready.send(&self.handle());
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(?e, "tcp: read");
                *self.error.borrow_mut() = Some(e);
                self.io.complete_read(0, false);
                self.mark_changed();
                self.sigs.input_ready.send(&self.handle());
            }
        }
    }

    fn do_write(&self) {
        let result = {
            let mut stream = self.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else { return };
            self.io.with_buf(|buf| stream.write(buf))
        };
        match result {
            Ok(0) => {
                *self.error.borrow_mut() = Some(io::Error::from(io::ErrorKind::WriteZero));
                self.io.complete_write(0);
                self.mark_changed();
                self.sigs.output_ready.send(&self.handle());
            }
            Ok(n) => {
                self.io.complete_write(n);
                self.mark_changed();
                self.sigs.output_ready.send(&self.handle());
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(?e, "tcp: write");
                *self.error.borrow_mut() = Some(e);
                self.io.complete_write(0);
                self.mark_changed();
                self.sigs.output_ready.send(&self.handle());
            }
        }
    }

    fn try_next_addr(&self) -> Result<(), NetError> {
        let mut last: Option<io::Error> = None;
        loop {
            let next = self.pending_addrs.borrow_mut().pop_front();
            let Some(addr) = next else {
                return Err(match last {
                    Some(e) => NetError::ConnectFailed(e),
                    None => NetError::AddressResolution,
                });
            };
            match mio::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    self.install_stream(stream);
                    self.connecting.set(true);
                    self.mark_changed();
                    return Ok(());
                }
                Err(e) => {
                    debug!(?addr, ?e, "tcp: connect");
                    last = Some(e);
                }
            }
        }
    }

    fn install_stream(&self, stream: mio::net::TcpStream) {
        self.drop_stream();
        *self.stream.borrow_mut() = Some(stream);
    }

    /// Deregister (if needed) and close the current stream.
    fn drop_stream(&self) {
        let old = self.stream.borrow_mut().take();
        if let Some(mut old) = old {
            if self.registered.get() {
                if let Some(att) = self.attachment.borrow().as_ref() {
                    att.selector().with_registry(|reg| {
                        let _ = reg.deregister(&mut old);
                    });
                }
                self.registered.set(false);
            }
        }
    }

    fn finish_connect(&self) {
        let check = {
            let mut s = self.stream.borrow_mut();
            let Some(stream) = s.as_mut() else { return };
            match stream.take_error() {
                Ok(Some(e)) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        };
        match check {
            Ok(true) => {
                self.connecting.set(false);
                self.connected.set(true);
                self.mark_changed();
                self.sigs.connected.send(&self.handle());
            }
            Ok(false) => {}
            Err(e) => {
                debug!(?e, "tcp: deferred connect failed");
                self.connecting.set(false);
                self.drop_stream();
                if let Err(err) = self.try_next_addr() {
                    self.sigs.connect_failed.send(&err);
                }
            }
        }
    }

    fn detach_device(&self) {
        let att = self.attachment.borrow_mut().take();
        if let Some(att) = att {
            if self.registered.get() {
                att.selector().with_registry(|reg| {
                    if let Some(stream) = self.stream.borrow_mut().as_mut() {
                        let _ = reg.deregister(stream);
                    }
                });
                self.registered.set(false);
            }
            att.selector().remove(att.token());
        }
    }

    /// Blocks on the raw fd until it is ready in the wanted direction.
    fn poll_fd(&self, want_read: bool, deadline: Option<Timespan>) -> Result<(), NetError> {
        let fd = {
            let stream = self.stream.borrow();
            stream.as_ref().ok_or(NetError::NotConnected)?.as_raw_fd()
        };
        let mut pfd = libc::pollfd {
            fd,
            events: if want_read { libc::POLLIN } else { libc::POLLOUT },
            revents: 0,
        };
        loop {
            let ms: libc::c_int = match deadline {
                None => -1,
                Some(d) => {
                    let left = d.saturating_sub(Clock::monotonic());
                    if left <= Timespan::ZERO {
                        return Err(NetError::Timeout);
                    }
                    // round up so we never spin on a sub-millisecond rest
                    ((left.total_micros() + 999) / 1_000) as libc::c_int
                }
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            if rc == 0 {
                continue;
            }
            return Ok(());
        }
    }
}

impl Selectable for TcpShared {
    fn sync(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut stream = self.stream.borrow_mut();
        let Some(stream) = stream.as_mut() else {
            self.registered.set(false);
            return Ok(());
        };
        match (self.wanted_interest(), self.registered.get()) {
            (Some(interest), false) => {
                registry.register(stream, token, interest)?;
                self.registered.set(true);
            }
            (Some(interest), true) => registry.reregister(stream, token, interest)?,
            (None, true) => {
                registry.deregister(stream)?;
                self.registered.set(false);
            }
            (None, false) => {}
        }
        Ok(())
    }

    fn on_ready(&self, readable: bool, writable: bool) {
        if self.connecting.get() {
            if writable {
                self.finish_connect();
            }
            return;
        }
        if readable && self.io.reading() {
            self.do_read();
        }
        if writable && self.io.writing() {
            self.do_write();
        }
    }

    fn on_avail(&self) {
        if self.io.read_avail() {
            self.sigs.input_ready.send(&self.handle());
        } else if self.io.write_avail() {
            self.sigs.output_ready.send(&self.handle());
        }
    }
}

impl Drop for TcpShared {
    fn drop(&mut self) {
        // Detach before the fd is released.
        self.detach_device();
    }
}

/// A non-blocking TCP connection device.
///
/// Attached to a selector it follows the begin/end transfer contract:
/// `begin_read`/`begin_write` arm a transfer (completing it eagerly when
/// the OS allows), the selector reports completion through the
/// `input_ready`/`output_ready` signals, and `end_read`/`end_write`
/// collect the result. The `read`/`write` helpers drive the same state
/// machine synchronously for unattached sockets.
#[derive(Clone)]
pub struct TcpSocket {
    shared: Rc<TcpShared>,
}

impl Deref for TcpSocket {
    type Target = TcpSignals;

    fn deref(&self) -> &TcpSignals {
        &self.shared.sigs
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocket {
    pub fn new() -> Self {
        let shared = Rc::new_cyclic(|weak: &Weak<TcpShared>| TcpShared {
            sigs: TcpSignals {
                connected: Signal::new(),
                connect_failed: Signal::new(),
                input_ready: Signal::new(),
                output_ready: Signal::new(),
            },
            stream: RefCell::new(None),
            io: IoCore::new(),
            connecting: Cell::new(false),
            connected: Cell::new(false),
            pending_addrs: RefCell::new(VecDeque::new()),
            error: RefCell::new(None),
            attachment: RefCell::new(None),
            registered: Cell::new(false),
            self_weak: weak.clone(),
        });
        TcpSocket { shared }
    }

    /// Wraps a stream accepted from a [`TcpServer`](crate::TcpServer).
    pub fn from_accepted(stream: mio::net::TcpStream) -> Self {
        let socket = Self::new();
        *socket.shared.stream.borrow_mut() = Some(stream);
        socket.shared.connected.set(true);
        socket
    }

    /// Attaches to `selector`; a socket is attached to at most one.
    pub fn set_selector(&self, selector: &Selector) {
        self.shared.detach_device();
        let weak_shared: Weak<TcpShared> = Rc::downgrade(&self.shared);
        let weak: Weak<dyn Selectable> = weak_shared;
        let (selref, token) = selector.add(weak);
        *self.shared.attachment.borrow_mut() = Some(Attachment::new(selref, token));
        self.shared.registered.set(false);
        self.shared.mark_changed();
    }

    /// Starts a deferred connect; completion arrives through the
    /// `connected` or `connect_failed` signal. On failure the remaining
    /// resolved addresses are tried before giving up.
    pub fn begin_connect<A: ToSocketAddrs>(&self, addrs: A) -> Result<(), NetError> {
        let list: VecDeque<SocketAddr> = addrs.to_socket_addrs()?.collect();
        if list.is_empty() {
            return Err(NetError::AddressResolution);
        }
        *self.shared.pending_addrs.borrow_mut() = list;
        self.shared.try_next_addr()
    }

    /// Connects synchronously, walking the resolved address list.
    pub fn connect<A: ToSocketAddrs>(
        &self,
        addrs: A,
        timeout: Option<Timespan>,
    ) -> Result<(), NetError> {
        let mut last: Option<io::Error> = None;
        for addr in addrs.to_socket_addrs()? {
            let result = match timeout {
                Some(t) => std::net::TcpStream::connect_timeout(&addr, t.to_std()),
                None => std::net::TcpStream::connect(addr),
            };
            match result {
                Ok(std_stream) => {
                    std_stream.set_nonblocking(true)?;
                    self.shared.install_stream(mio::net::TcpStream::from_std(std_stream));
                    self.shared.connected.set(true);
                    self.shared.connecting.set(false);
                    self.shared.mark_changed();
                    return Ok(());
                }
                Err(e) => {
                    debug!(?addr, ?e, "tcp: connect");
                    last = Some(e);
                }
            }
        }
        Err(match last {
            Some(e) => NetError::ConnectFailed(e),
            None => NetError::AddressResolution,
        })
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.shared.connected.get()
    }

    #[inline]
    pub fn connecting(&self) -> bool {
        self.shared.connecting.get()
    }

    #[inline]
    pub fn state(&self) -> IoState {
        self.shared.io.state()
    }

    #[inline]
    pub fn reading(&self) -> bool {
        self.shared.io.reading()
    }

    #[inline]
    pub fn writing(&self) -> bool {
        self.shared.io.writing()
    }

    #[inline]
    pub fn read_avail(&self) -> bool {
        self.shared.io.read_avail()
    }

    #[inline]
    pub fn write_avail(&self) -> bool {
        self.shared.io.write_avail()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, NetError> {
        let stream = self.shared.stream.borrow();
        Ok(stream.as_ref().ok_or(NetError::NotConnected)?.peer_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        let stream = self.shared.stream.borrow();
        Ok(stream.as_ref().ok_or(NetError::NotConnected)?.local_addr()?)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<(), NetError> {
        let stream = self.shared.stream.borrow();
        stream.as_ref().ok_or(NetError::NotConnected)?.set_nodelay(nodelay)?;
        Ok(())
    }

    /// Sets kernel SO_SNDBUF and SO_RCVBUF.
    pub fn set_kernel_buffer_size(&self, size: usize) -> Result<(), NetError> {
        let stream = self.shared.stream.borrow();
        set_socket_buf_size(stream.as_ref().ok_or(NetError::NotConnected)?.as_raw_fd(), size);
        Ok(())
    }

    /// Arms a read into `buf`; Idle → Reading (or Avail on eager
    /// completion).
    pub fn begin_read(&self, buf: Vec<u8>) -> Result<(), NetError> {
        if !self.connected() {
            return Err(NetError::NotConnected);
        }
        self.shared.io.start_read(buf)?;
        let result = {
            let mut stream = self.shared.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else {
                self.shared.io.cancel();
                return Err(NetError::NotConnected);
            };
            self.shared.io.with_buf(|b| stream.read(b))
        };
        match result {
            Ok(n) => {
                self.shared.io.complete_read(n, n == 0);
                self.shared.queue_avail();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.shared.mark_changed(),
            Err(e) => {
                debug!(?e, "tcp: eager read");
                *self.shared.error.borrow_mut() = Some(e);
                self.shared.io.complete_read(0, false);
                self.shared.queue_avail();
            }
        }
        Ok(())
    }

    /// Collects a finished read: Avail → Idle. Returns the buffer, the
    /// byte count and the EOF flag.
    pub fn end_read(&self) -> Result<(Vec<u8>, usize, bool), NetError> {
        if let Some(e) = self.shared.error.borrow_mut().take() {
            self.shared.io.cancel();
            return Err(e.into());
        }
        Ok(self.shared.io.end_read()?)
    }

    /// Arms a write of `buf`; Idle → Writing (or Avail on eager
    /// completion). A single transfer may move fewer bytes than `buf`
    /// holds; `end_write` reports the count.
    pub fn begin_write(&self, buf: Vec<u8>) -> Result<(), NetError> {
        if !self.connected() {
            return Err(NetError::NotConnected);
        }
        self.shared.io.start_write(buf)?;
        let result = {
            let mut stream = self.shared.stream.borrow_mut();
            let Some(stream) = stream.as_mut() else {
                self.shared.io.cancel();
                return Err(NetError::NotConnected);
            };
            self.shared.io.with_buf(|b| stream.write(b))
        };
        match result {
            Ok(n) => {
                self.shared.io.complete_write(n);
                self.shared.queue_avail();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.shared.mark_changed(),
            Err(e) => {
                debug!(?e, "tcp: eager write");
                *self.shared.error.borrow_mut() = Some(e);
                self.shared.io.complete_write(0);
                self.shared.queue_avail();
            }
        }
        Ok(())
    }

    /// Collects a finished write: Avail → Idle. Returns the buffer and
    /// the bytes transferred.
    pub fn end_write(&self) -> Result<(Vec<u8>, usize), NetError> {
        if let Some(e) = self.shared.error.borrow_mut().take() {
            self.shared.io.cancel();
            return Err(e.into());
        }
        Ok(self.shared.io.end_write()?)
    }

    /// Synchronous read for unattached sockets: blocks on the fd until
    /// data (or EOF) arrives or `timeout` expires.
    pub fn read(
        &self,
        buf: Vec<u8>,
        timeout: Option<Timespan>,
    ) -> Result<(Vec<u8>, usize, bool), NetError> {
        let deadline = timeout.map(|t| Clock::monotonic() + t);
        self.begin_read(buf)?;
        while self.shared.io.reading() {
            if let Err(e) = self.shared.poll_fd(true, deadline) {
                self.shared.io.cancel();
                return Err(e);
            }
            self.shared.do_read();
        }
        self.end_read()
    }

    /// Synchronous write for unattached sockets: blocks until the whole
    /// buffer is on the wire or `timeout` expires.
    pub fn write_all(&self, buf: Vec<u8>, timeout: Option<Timespan>) -> Result<(), NetError> {
        let deadline = timeout.map(|t| Clock::monotonic() + t);
        let mut rest = buf;
        while !rest.is_empty() {
            self.begin_write(rest)?;
            while self.shared.io.writing() {
                if let Err(e) = self.shared.poll_fd(false, deadline) {
                    self.shared.io.cancel();
                    return Err(e);
                }
                self.shared.do_write();
            }
            let (mut b, count) = self.end_write()?;
            b.drain(..count);
            rest = b;
        }
        Ok(())
    }

    /// Drives a pending write to completion by blocking on the fd.
    pub(crate) fn drive_pending_write(&self, deadline: Option<Timespan>) -> Result<(), NetError> {
        while self.shared.io.writing() {
            self.shared.poll_fd(false, deadline)?;
            self.shared.do_write();
        }
        Ok(())
    }

    /// Forces Idle, discarding any pending transfer.
    pub fn cancel(&self) {
        self.shared.io.cancel();
        self.shared.error.borrow_mut().take();
        self.shared.connecting.set(false);
        self.shared.mark_changed();
    }

    /// Shuts the connection down and releases the fd.
    pub fn close(&self) {
        self.cancel();
        self.shared.detach_device();
        if let Some(stream) = self.shared.stream.borrow_mut().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.shared.connected.set(false);
    }
}
