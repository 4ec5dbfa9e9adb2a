use std::{
    cell::{Cell, RefCell},
    net::ToSocketAddrs,
    ops::Deref,
    rc::{Rc, Weak},
};

use axon_reactor::Selector;
use axon_signal::Signal;
use axon_timing::Timespan;
use tracing::debug;

use crate::{NetError, TcpSocket};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Signals of a [`BufferedSocket`]; reachable through its `Deref`.
pub struct BufferedSignals {
    /// New bytes were appended to the input buffer (or EOF was seen).
    pub input_ready: Signal<BufferedSocket>,
    /// All buffered output reached the wire. Fires exactly once per drain
    /// cycle.
    pub output_buffer_empty: Signal<BufferedSocket>,
    /// Background writing failed; the error is passed by reference so the
    /// handler may decide to tear the connection down.
    pub output_failed: Signal<NetError>,
    /// Background reading failed.
    pub input_failed: Signal<NetError>,
    /// Deferred connect completed.
    pub connected: Signal<BufferedSocket>,
    /// Deferred connect failed.
    pub connect_failed: Signal<NetError>,
}

struct BufShared {
    sigs: BufferedSignals,
    socket: TcpSocket,
    buffer_size: Cell<usize>,
    /// Accumulated unread input; the user consumes from here.
    input: RefCell<Vec<u8>>,
    /// Spare capacity reused as the next fill target.
    spare: RefCell<Vec<u8>>,
    /// Output collected while no write is in flight.
    output: RefCell<Vec<u8>>,
    /// Output collected while a write is in flight; swapped in on
    /// completion.
    output_next: RefCell<Vec<u8>>,
    /// Bytes currently owned by the device.
    in_flight: Cell<usize>,
    /// Reading was requested while the device was busy writing; armed
    /// again once the output drains.
    want_read: Cell<bool>,
    eof: Cell<bool>,
    self_weak: Weak<BufShared>,
}

impl BufShared {
    fn handle(&self) -> BufferedSocket {
        BufferedSocket { shared: self.self_weak.upgrade().expect("self weak while alive") }
    }

    fn write_pending(&self) -> bool {
        self.in_flight.get() > 0
    }

    /// Moves a completed device read into the input buffer.
    fn collect_input(&self) -> Result<(), NetError> {
        let (buf, count, eof) = self.socket.end_read()?;
        if count > 0 {
            self.input.borrow_mut().extend_from_slice(&buf[..count]);
        }
        *self.spare.borrow_mut() = buf;
        if eof {
            self.eof.set(true);
        }
        debug!(available = self.input.borrow().len(), eof, "buffered input");
        Ok(())
    }

    fn on_input(&self) {
        match self.collect_input() {
            Ok(()) => self.sigs.input_ready.send(&self.handle()),
            Err(e) => {
                debug!(?e, "buffered read failed");
                self.sigs.input_failed.send(&e);
            }
        }
    }

    /// Arms the device read if one was requested and the device is free.
    fn maybe_arm_read(&self) -> Result<(), NetError> {
        if !self.want_read.get() || self.write_pending() {
            return Ok(());
        }
        self.want_read.set(false);
        self.arm_read()
    }

    fn arm_read(&self) -> Result<(), NetError> {
        let mut buf = std::mem::take(&mut *self.spare.borrow_mut());
        buf.resize(self.buffer_size.get(), 0);
        self.socket.begin_read(buf)
    }

    /// Collects a finished device write and merges the queues, exactly
    /// like the drain step of the async path.
    fn collect_write(&self) -> Result<(), NetError> {
        let (mut buf, count) = match self.socket.end_write() {
            Ok(r) => r,
            Err(e) => {
                self.in_flight.set(0);
                return Err(e);
            }
        };
        self.in_flight.set(0);
        buf.drain(..count);

        let mut next = self.output_next.borrow_mut();
        let mut output = self.output.borrow_mut();
        if buf.is_empty() {
            if next.is_empty() && output.is_empty() {
                drop(output);
                drop(next);
                self.sigs.output_buffer_empty.send(&self.handle());
                return Ok(());
            }
            buf = std::mem::take(&mut *next);
        } else if !next.is_empty() {
            buf.extend_from_slice(&next);
            next.clear();
        }
        // Anything put while the write was in flight lands in front of
        // data put afterwards.
        if output.is_empty() {
            *output = buf;
        } else {
            buf.extend_from_slice(&output);
            *output = buf;
        }
        Ok(())
    }

    fn start_device_write(&self) -> Result<(), NetError> {
        if self.write_pending() {
            return Ok(());
        }
        if self.output.borrow().is_empty() {
            return Ok(());
        }
        // the device carries one transfer at a time; a pending read
        // yields to the write and is re-armed when the output drains
        if self.socket.read_avail() {
            self.collect_input()?;
        }
        if self.socket.reading() {
            self.socket.cancel();
            self.want_read.set(true);
        }
        let buf = std::mem::take(&mut *self.output.borrow_mut());
        self.in_flight.set(buf.len());
        if let Err(e) = self.socket.begin_write(buf) {
            self.in_flight.set(0);
            return Err(e);
        }
        Ok(())
    }

    fn on_output(&self) {
        if let Err(e) = self.collect_write() {
            self.sigs.output_failed.send(&e);
            return;
        }
        if !self.output.borrow().is_empty() {
            if let Err(e) = self.start_device_write() {
                self.sigs.output_failed.send(&e);
                return;
            }
        }
        if let Err(e) = self.maybe_arm_read() {
            self.sigs.output_failed.send(&e);
        }
    }
}

/// A TCP socket with owned read and write queues.
///
/// Reading accumulates into an input buffer the user consumes at their own
/// pace; writing drains in the background, with `put` always legal. The
/// double write buffer means data queued during an in-flight write is
/// never interleaved into it.
#[derive(Clone)]
pub struct BufferedSocket {
    shared: Rc<BufShared>,
}

impl Deref for BufferedSocket {
    type Target = BufferedSignals;

    fn deref(&self) -> &BufferedSignals {
        &self.shared.sigs
    }
}

impl BufferedSocket {
    fn wrap(socket: TcpSocket) -> Self {
        let shared = Rc::new_cyclic(|weak: &Weak<BufShared>| BufShared {
            sigs: BufferedSignals {
                input_ready: Signal::new(),
                output_buffer_empty: Signal::new(),
                output_failed: Signal::new(),
                input_failed: Signal::new(),
                connected: Signal::new(),
                connect_failed: Signal::new(),
            },
            socket,
            buffer_size: Cell::new(DEFAULT_BUFFER_SIZE),
            input: RefCell::new(Vec::new()),
            spare: RefCell::new(Vec::new()),
            output: RefCell::new(Vec::new()),
            output_next: RefCell::new(Vec::new()),
            in_flight: Cell::new(0),
            want_read: Cell::new(false),
            eof: Cell::new(false),
            self_weak: weak.clone(),
        });

        {
            let weak = Rc::downgrade(&shared);
            shared.socket.input_ready.connect(move |_| {
                if let Some(s) = weak.upgrade() {
                    s.on_input();
                }
            });
        }
        {
            let weak = Rc::downgrade(&shared);
            shared.socket.output_ready.connect(move |_| {
                if let Some(s) = weak.upgrade() {
                    s.on_output();
                }
            });
        }
        {
            let weak = Rc::downgrade(&shared);
            shared.socket.connected.connect(move |_| {
                if let Some(s) = weak.upgrade() {
                    s.sigs.connected.send(&s.handle());
                }
            });
        }
        {
            let weak = Rc::downgrade(&shared);
            shared.socket.connect_failed.connect(move |e: &NetError| {
                if let Some(s) = weak.upgrade() {
                    // The original error stays with the device; report a
                    // fresh handle to it.
                    s.sigs.connect_failed.send(e);
                }
            });
        }

        BufferedSocket { shared }
    }

    /// A buffered socket attached to `selector`, not yet connected.
    pub fn new(selector: &Selector) -> Self {
        let socket = TcpSocket::new();
        socket.set_selector(selector);
        Self::wrap(socket)
    }

    /// Wraps a stream accepted from a [`TcpServer`](crate::TcpServer).
    pub fn from_accepted(selector: &Selector, stream: mio::net::TcpStream) -> Self {
        let socket = TcpSocket::from_accepted(stream);
        socket.set_selector(selector);
        Self::wrap(socket)
    }

    /// An unattached buffered socket for synchronous use.
    pub fn unattached() -> Self {
        Self::wrap(TcpSocket::new())
    }

    pub fn socket(&self) -> &TcpSocket {
        &self.shared.socket
    }

    pub fn begin_connect<A: ToSocketAddrs>(&self, addrs: A) -> Result<(), NetError> {
        self.shared.socket.begin_connect(addrs)
    }

    pub fn connect<A: ToSocketAddrs>(
        &self,
        addrs: A,
        timeout: Option<Timespan>,
    ) -> Result<(), NetError> {
        self.shared.socket.connect(addrs, timeout)
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.shared.socket.connected()
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size.get()
    }

    pub fn set_buffer_size(&self, size: usize) {
        self.shared.buffer_size.set(size);
    }

    /// Arms background reading if no read is pending. While a write is in
    /// flight the request is remembered and the read arms once the output
    /// has drained.
    pub fn begin_read(&self) -> Result<(), NetError> {
        if self.shared.socket.reading() || self.shared.socket.read_avail() {
            return Ok(());
        }
        if self.shared.write_pending()
            || self.shared.socket.writing()
            || self.shared.socket.write_avail()
        {
            self.shared.want_read.set(true);
            return Ok(());
        }
        self.shared.arm_read()
    }

    /// Performs one synchronous read into the input buffer; returns the
    /// number of bytes appended (0 at EOF).
    pub fn read(&self, timeout: Option<Timespan>) -> Result<usize, NetError> {
        let mut buf = std::mem::take(&mut *self.shared.spare.borrow_mut());
        buf.resize(self.shared.buffer_size.get(), 0);
        let (buf, count, eof) = self.shared.socket.read(buf, timeout)?;
        if count > 0 {
            self.shared.input.borrow_mut().extend_from_slice(&buf[..count]);
        }
        *self.shared.spare.borrow_mut() = buf;
        if eof {
            self.shared.eof.set(true);
        }
        Ok(count)
    }

    /// Appends to the output buffer without starting a write.
    pub fn put(&self, data: &[u8]) -> &Self {
        if self.shared.write_pending() {
            self.shared.output_next.borrow_mut().extend_from_slice(data);
        } else {
            self.shared.output.borrow_mut().extend_from_slice(data);
        }
        self
    }

    /// Appends to the output buffer and starts writing if not already
    /// pending.
    pub fn write(&self, data: &[u8]) -> Result<(), NetError> {
        self.put(data);
        self.begin_write()
    }

    /// Starts the background write if output is buffered and none is in
    /// flight.
    pub fn begin_write(&self) -> Result<(), NetError> {
        self.shared.start_device_write()
    }

    /// Blocks until every buffered byte is on the wire.
    pub fn flush(&self, timeout: Option<Timespan>) -> Result<(), NetError> {
        let deadline = timeout.map(|t| axon_timing::Clock::monotonic() + t);
        loop {
            if self.shared.write_pending() {
                self.shared.socket.drive_pending_write(deadline)?;
                // The output_ready slot collects on the async path; when
                // the write finished eagerly it is still ours to collect.
                if self.shared.write_pending() {
                    self.shared.collect_write()?;
                }
            } else if !self.shared.output.borrow().is_empty() {
                self.shared.start_device_write()?;
            } else {
                return self.shared.maybe_arm_read();
            }
        }
    }

    /// Bytes buffered for output and not yet written.
    pub fn output_size(&self) -> usize {
        self.shared.output.borrow().len()
            + self.shared.output_next.borrow().len()
            + self.shared.in_flight.get()
    }

    /// Bytes accumulated and not yet consumed.
    pub fn input_size(&self) -> usize {
        self.shared.input.borrow().len()
    }

    /// Access to the accumulated input. The user may consume all of it, a
    /// prefix, or nothing.
    pub fn with_input<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.shared.input.borrow_mut())
    }

    /// Takes the whole accumulated input.
    pub fn take_input(&self) -> Vec<u8> {
        self.shared.input.take()
    }

    /// Removes the first `n` consumed bytes from the input buffer.
    pub fn consume_input(&self, n: usize) {
        self.shared.input.borrow_mut().drain(..n);
    }

    /// True once the peer closed its side; the input buffer may still
    /// hold unread data.
    #[inline]
    pub fn eof(&self) -> bool {
        self.shared.eof.get()
    }

    /// Cancels pending transfers and discards all buffers.
    pub fn cancel(&self) {
        self.shared.socket.cancel();
        self.shared.in_flight.set(0);
        self.shared.want_read.set(false);
        self.shared.input.borrow_mut().clear();
        self.shared.output.borrow_mut().clear();
        self.shared.output_next.borrow_mut().clear();
    }

    pub fn close(&self) {
        self.cancel();
        self.shared.socket.close();
    }
}
