use std::{
    cell::{Cell, RefCell},
    ops::Deref,
    rc::{Rc, Weak},
};

use axon_net::{BufferedSocket, NetError};
use axon_reactor::Selector;
use axon_signal::Signal;
use axon_timing::{Clock, Timespan};
use tracing::debug;

use crate::{BodyReader, HeaderParser, HttpError, MessageHeader};

const DEFAULT_MAX_BODY: usize = 64 * 1024 * 1024;

/// A request to send.
pub struct ClientRequest {
    pub method: String,
    pub url: String,
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl ClientRequest {
    pub fn get(url: impl Into<String>) -> Self {
        ClientRequest {
            method: "GET".to_string(),
            url: url.into(),
            header: MessageHeader::new(),
            body: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        ClientRequest {
            method: "POST".to_string(),
            url: url.into(),
            header: MessageHeader::new(),
            body,
        }
    }

    fn to_bytes(&self, host: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.url).as_bytes());
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
        if !self.body.is_empty() || self.method == "POST" || self.method == "PUT" {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        for (key, value) in self.header.iter() {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// A received response.
pub struct ClientResponse {
    pub status_code: u16,
    pub status_text: String,
    pub version: (u8, u8),
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Signals of an [`HttpClient`]; reachable through its `Deref`.
pub struct HttpClientSignals {
    /// An async request completed; collect it with
    /// [`HttpClient::end_reply`].
    pub reply_ready: Signal<HttpClient>,
    /// An async request failed.
    pub error_occurred: Signal<HttpError>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting,
    Receiving,
    Done,
}

struct ClientCore {
    sigs: HttpClientSignals,
    socket: BufferedSocket,
    addr: RefCell<String>,
    parser: RefCell<HeaderParser>,
    body: RefCell<Option<BodyReader>>,
    state: Cell<ClientState>,
    response: RefCell<Option<ClientResponse>>,
    pending: RefCell<Option<Vec<u8>>>,
    self_weak: Weak<ClientCore>,
}

impl ClientCore {
    fn handle(&self) -> HttpClient {
        HttpClient { core: self.self_weak.upgrade().expect("self weak while alive") }
    }

    fn fail(&self, error: HttpError) {
        self.state.set(ClientState::Idle);
        self.socket.close();
        self.sigs.error_occurred.send(&error);
    }

    /// Parses whatever sits in the input buffer; fires `reply_ready` when
    /// the response is complete.
    fn process_response(&self) {
        if self.state.get() != ClientState::Receiving {
            return;
        }
        loop {
            let header_done = self.parser.borrow().end();
            if !header_done {
                let consumed = self.socket.with_input(|input| self.parser.borrow_mut().advance(input));
                self.socket.consume_input(consumed);
                let parser = self.parser.borrow();
                if parser.fail() {
                    drop(parser);
                    self.fail(HttpError::Protocol("malformed response"));
                    return;
                }
                if !parser.end() {
                    if self.socket.eof() {
                        drop(parser);
                        self.fail(HttpError::ConnectionClosed);
                        return;
                    }
                    self.rearm_read();
                    return;
                }
                *self.body.borrow_mut() =
                    Some(BodyReader::for_header(&parser.header, true, DEFAULT_MAX_BODY));
                continue;
            }

            let result = self.socket.with_input(|input| {
                self.body.borrow_mut().as_mut().expect("body reader set").feed(input)
            });
            match result {
                Ok(consumed) => self.socket.consume_input(consumed),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
            let (done, until_close) = {
                let body = self.body.borrow();
                let body = body.as_ref().expect("body reader set");
                (body.done(), body.runs_until_close())
            };
            if done || (until_close && self.socket.eof()) {
                self.finish_response();
                return;
            }
            if self.socket.eof() {
                self.fail(HttpError::ConnectionClosed);
                return;
            }
            self.rearm_read();
            return;
        }
    }

    fn rearm_read(&self) {
        if let Err(e) = self.socket.begin_read() {
            self.fail(e.into());
        }
    }

    fn finish_response(&self) {
        let mut parser = self.parser.borrow_mut();
        let body = self.body.borrow_mut().take().expect("body reader set").body;
        let response = ClientResponse {
            status_code: parser.status_code,
            status_text: std::mem::take(&mut parser.status_text),
            version: parser.version,
            header: std::mem::take(&mut parser.header),
            body,
        };
        let keep = response.header.keep_alive(response.version);
        parser.reset();
        drop(parser);

        if !keep {
            self.socket.close();
        }
        *self.response.borrow_mut() = Some(response);
        self.state.set(ClientState::Done);
        self.sigs.reply_ready.send(&self.handle());
    }

    fn send_pending(&self) {
        let Some(bytes) = self.pending.borrow_mut().take() else { return };
        self.state.set(ClientState::Receiving);
        if let Err(e) = self.socket.write(&bytes) {
            self.fail(e.into());
            return;
        }
        self.rearm_read();
    }
}

/// An HTTP/1.1 client over a buffered socket.
///
/// One request is in flight at a time. [`execute`](Self::execute) drives
/// the exchange synchronously; [`begin_execute`](Self::begin_execute)
/// sends through the selector and completion arrives via `reply_ready`.
/// Connections are kept alive and reused when the server allows it.
#[derive(Clone)]
pub struct HttpClient {
    core: Rc<ClientCore>,
}

impl Deref for HttpClient {
    type Target = HttpClientSignals;

    fn deref(&self) -> &HttpClientSignals {
        &self.core.sigs
    }
}

impl HttpClient {
    fn build(socket: BufferedSocket, addr: String) -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<ClientCore>| ClientCore {
            sigs: HttpClientSignals { reply_ready: Signal::new(), error_occurred: Signal::new() },
            socket,
            addr: RefCell::new(addr),
            parser: RefCell::new(HeaderParser::new_response()),
            body: RefCell::new(None),
            state: Cell::new(ClientState::Idle),
            response: RefCell::new(None),
            pending: RefCell::new(None),
            self_weak: weak.clone(),
        });

        {
            let weak = Rc::downgrade(&core);
            core.socket.input_ready.connect(move |_| {
                if let Some(core) = weak.upgrade() {
                    core.process_response();
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.connected.connect(move |_| {
                if let Some(core) = weak.upgrade()
                    && core.state.get() == ClientState::Connecting
                {
                    core.send_pending();
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.connect_failed.connect(move |e: &NetError| {
                if let Some(core) = weak.upgrade() {
                    core.fail(HttpError::Connect(e.to_string()));
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.input_failed.connect(move |e: &NetError| {
                if let Some(core) = weak.upgrade() {
                    debug!(error = %e, "client read failed");
                    core.fail(HttpError::ConnectionClosed);
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.output_failed.connect(move |e: &NetError| {
                if let Some(core) = weak.upgrade() {
                    debug!(error = %e, "client write failed");
                    core.fail(HttpError::ConnectionClosed);
                }
            });
        }

        HttpClient { core }
    }

    /// A client driven by a selector; completion arrives via signals.
    pub fn new(selector: &Selector, addr: impl Into<String>) -> Self {
        Self::build(BufferedSocket::new(selector), addr.into())
    }

    /// A client for synchronous use, no selector required.
    pub fn new_sync(addr: impl Into<String>) -> Self {
        Self::build(BufferedSocket::unattached(), addr.into())
    }

    pub fn addr(&self) -> String {
        self.core.addr.borrow().clone()
    }

    /// Starts an async request; the connection is established on demand.
    pub fn begin_execute(&self, request: &ClientRequest) -> Result<(), HttpError> {
        if self.core.state.get() == ClientState::Receiving {
            return Err(HttpError::Protocol("request already in flight"));
        }
        let host = self.core.addr.borrow().clone();
        *self.core.pending.borrow_mut() = Some(request.to_bytes(&host));
        self.core.response.borrow_mut().take();
        self.core.parser.borrow_mut().reset();

        if self.core.socket.connected() {
            self.core.send_pending();
        } else {
            self.core.state.set(ClientState::Connecting);
            let addr = self.core.addr.borrow().clone();
            self.core.socket.begin_connect(addr.as_str())?;
        }
        Ok(())
    }

    /// Collects the response of a completed async request.
    pub fn end_reply(&self) -> Result<ClientResponse, HttpError> {
        match self.core.response.borrow_mut().take() {
            Some(response) => {
                self.core.state.set(ClientState::Idle);
                Ok(response)
            }
            None => Err(HttpError::Protocol("no reply ready")),
        }
    }

    /// Aborts the in-flight request and drops the connection.
    pub fn cancel(&self) {
        self.core.pending.borrow_mut().take();
        self.core.response.borrow_mut().take();
        self.core.parser.borrow_mut().reset();
        self.core.state.set(ClientState::Idle);
        self.core.socket.close();
    }

    /// Synchronous exchange with an overall deadline.
    ///
    /// A reused keep-alive connection that turns out dead is retried once
    /// on a fresh connection.
    pub fn execute(
        &self,
        request: &ClientRequest,
        timeout: Option<Timespan>,
    ) -> Result<ClientResponse, HttpError> {
        let deadline = timeout.map(|t| Clock::monotonic() + t);
        let reused = self.core.socket.connected();
        match self.execute_once(request, deadline) {
            Err(e) if reused && Self::worth_retry(&e) => {
                debug!(error = %e, "stale keep-alive connection, retrying");
                self.core.socket.close();
                self.execute_once(request, deadline)
            }
            other => other,
        }
    }

    fn worth_retry(error: &HttpError) -> bool {
        matches!(error, HttpError::ConnectionClosed | HttpError::Net(_))
    }

    fn execute_once(
        &self,
        request: &ClientRequest,
        deadline: Option<Timespan>,
    ) -> Result<ClientResponse, HttpError> {
        let core = &self.core;
        let remaining =
            |deadline: Option<Timespan>| deadline.map(|d| d.saturating_sub(Clock::monotonic()));

        if !core.socket.connected() {
            let addr = core.addr.borrow().clone();
            core.socket.connect(addr.as_str(), remaining(deadline))?;
        }
        core.parser.borrow_mut().reset();
        core.body.borrow_mut().take();

        let host = core.addr.borrow().clone();
        core.socket.put(&request.to_bytes(&host));
        core.socket.flush(remaining(deadline)).map_err(net_to_http)?;

        // head
        loop {
            let consumed = core.socket.with_input(|input| core.parser.borrow_mut().advance(input));
            core.socket.consume_input(consumed);
            let (end, fail) = {
                let p = core.parser.borrow();
                (p.end(), p.fail())
            };
            if fail {
                return Err(HttpError::Protocol("malformed response"));
            }
            if end {
                break;
            }
            if core.socket.read(remaining(deadline)).map_err(net_to_http)? == 0 {
                return Err(HttpError::ConnectionClosed);
            }
        }

        let mut reader = {
            let parser = core.parser.borrow();
            BodyReader::for_header(&parser.header, true, DEFAULT_MAX_BODY)
        };
        loop {
            let consumed = core.socket.with_input(|input| reader.feed(input))?;
            core.socket.consume_input(consumed);
            if reader.done() {
                break;
            }
            let n = core.socket.read(remaining(deadline)).map_err(net_to_http)?;
            if n == 0 {
                if reader.runs_until_close() {
                    break;
                }
                return Err(HttpError::ConnectionClosed);
            }
        }

        let mut parser = core.parser.borrow_mut();
        let response = ClientResponse {
            status_code: parser.status_code,
            status_text: std::mem::take(&mut parser.status_text),
            version: parser.version,
            header: std::mem::take(&mut parser.header),
            body: reader.body,
        };
        parser.reset();
        drop(parser);

        if !response.header.keep_alive(response.version) {
            core.socket.close();
        }
        Ok(response)
    }
}

fn net_to_http(e: NetError) -> HttpError {
    match e {
        NetError::Timeout => HttpError::Timeout,
        other => HttpError::Net(other),
    }
}
