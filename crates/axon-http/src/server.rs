use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    rc::{Rc, Weak},
};

use axon_net::{BufferedSocket, NetError, TcpServer};
use axon_reactor::{Selector, Timer};
use axon_timing::{Clock, Timespan, format_rfc1123};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{BodyReader, HeaderParser, HttpError, MessageHeader};

/// Server tuning knobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Inactivity limit while a request head or body is being received.
    pub read_timeout: Timespan,
    /// Inactivity limit while a reply drains.
    pub write_timeout: Timespan,
    /// Idle limit between requests on a kept-alive connection.
    pub keep_alive_timeout: Timespan,
    pub max_body_size: usize,
    pub server_name: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            read_timeout: Timespan::from_secs(20),
            write_timeout: Timespan::from_secs(20),
            keep_alive_timeout: Timespan::from_secs(30),
            max_body_size: 8 * 1024 * 1024,
            server_name: "axon-http".to_string(),
        }
    }
}

/// A parsed request as handed to a responder.
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub query_string: String,
    pub version: (u8, u8),
    pub header: MessageHeader,
    pub body: Vec<u8>,
    pub peer: SocketAddr,
}

/// Reply under construction.
pub struct Reply {
    status: u16,
    status_text: Option<String>,
    pub header: MessageHeader,
    body: Vec<u8>,
}

impl Default for Reply {
    fn default() -> Self {
        Self::new()
    }
}

impl Reply {
    pub fn new() -> Self {
        Reply { status: 200, status_text: None, header: MessageHeader::new(), body: Vec::new() }
    }

    pub fn set_status(&mut self, code: u16) -> &mut Self {
        self.status = code;
        self
    }

    pub fn set_status_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.status_text = Some(text.into());
        self
    }

    pub fn set_content_type(&mut self, value: &str) -> &mut Self {
        let _ = self.header.set("Content-Type", value);
        self
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Serializes status line, automatic headers, custom headers and
    /// body.
    fn to_bytes(&self, server_name: &str, keep_alive: bool) -> Vec<u8> {
        let text = self
            .status_text
            .clone()
            .unwrap_or_else(|| status_text(self.status).to_string());
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, text).as_bytes());
        out.extend_from_slice(format!("Server: {server_name}\r\n").as_bytes());
        out.extend_from_slice(format!("Date: {}\r\n", format_rfc1123(Clock::wall())).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(
            if keep_alive { b"Connection: keep-alive\r\n".as_slice() } else { b"Connection: close\r\n" },
        );
        for (key, value) in self.header.iter() {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub(crate) fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "-",
    }
}

/// Produces the reply for one request. A fresh responder is created per
/// request by the owning service.
pub trait Responder {
    /// Called when the request head is complete, before the body arrives.
    fn begin_request(&mut self, _request: &HttpRequest) {}

    /// Builds the reply once the body is complete.
    fn reply(&mut self, request: &HttpRequest, reply: &mut Reply) -> Result<(), HttpError>;

    /// Builds the reply for a failed `reply` call. The connection closes
    /// afterwards.
    fn reply_error(&mut self, reply: &mut Reply, error: &HttpError) {
        default_error_reply(reply, 500, &error.to_string());
    }
}

fn default_error_reply(reply: &mut Reply, code: u16, message: &str) {
    reply.set_status(code);
    reply.header.clear();
    reply.set_content_type("text/plain");
    let body = format!("{} {}\n{message}\n", code, status_text(code));
    reply.write(body.as_bytes());
}

/// Creates responders for the URLs its registration pattern matches.
pub trait HttpService {
    fn create_responder(&self, request_url: &str) -> Box<dyn Responder>;
}

/// A pattern matches exactly, or as a prefix when it ends in `*`. The
/// empty pattern matches everything.
fn pattern_matches(pattern: &str, url: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => url.starts_with(prefix),
        None => pattern == url,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
    Writing,
    Closed,
}

struct Connection {
    id: usize,
    socket: BufferedSocket,
    peer: SocketAddr,
    parser: RefCell<HeaderParser>,
    body: RefCell<Option<BodyReader>>,
    phase: Cell<Phase>,
    keep_alive: Cell<bool>,
    timer: Timer,
    server: Weak<ServerCore>,
}

impl Connection {
    fn close(&self) {
        if self.phase.replace(Phase::Closed) == Phase::Closed {
            return;
        }
        self.timer.stop();
        self.socket.close();
        if let Some(server) = self.server.upgrade() {
            server.connections.borrow_mut().remove(&self.id);
        }
    }

    fn arm_timer(&self, interval: Timespan) {
        self.timer.after(interval);
    }

    fn config(&self) -> Option<HttpConfig> {
        self.server.upgrade().map(|s| s.config.clone())
    }

    /// Drains the socket's input buffer through the request state
    /// machine.
    fn process_input(&self) {
        loop {
            match self.phase.get() {
                Phase::Header => {
                    let consumed = self.socket.with_input(|input| {
                        let mut parser = self.parser.borrow_mut();
                        parser.advance(input)
                    });
                    self.socket.consume_input(consumed);

                    let (end, fail) = {
                        let parser = self.parser.borrow();
                        (parser.end(), parser.fail())
                    };
                    if !end {
                        if self.socket.eof() {
                            self.close();
                        }
                        return;
                    }
                    if fail {
                        debug!(peer = %self.peer, "bad request");
                        self.keep_alive.set(false);
                        let mut reply = Reply::new();
                        let code =
                            if self.parser.borrow().header_overflow() { 413 } else { 400 };
                        default_error_reply(&mut reply, code, "malformed request");
                        self.send_reply(reply);
                        return;
                    }
                    let Some(config) = self.config() else {
                        self.close();
                        return;
                    };
                    let reader = {
                        let parser = self.parser.borrow();
                        self.keep_alive.set(parser.header.keep_alive(parser.version));
                        BodyReader::for_header(&parser.header, false, config.max_body_size)
                    };
                    *self.body.borrow_mut() = Some(reader);
                    self.phase.set(Phase::Body);
                }
                Phase::Body => {
                    let result = self.socket.with_input(|input| {
                        let mut body = self.body.borrow_mut();
                        body.as_mut().expect("body reader in Body phase").feed(input)
                    });
                    match result {
                        Ok(consumed) => self.socket.consume_input(consumed),
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "request body rejected");
                            self.keep_alive.set(false);
                            let mut reply = Reply::new();
                            let code = if matches!(e, HttpError::BodyTooLarge) { 413 } else { 400 };
                            default_error_reply(&mut reply, code, &e.to_string());
                            self.send_reply(reply);
                            return;
                        }
                    }
                    if self.body.borrow().as_ref().is_some_and(BodyReader::done) {
                        self.dispatch();
                        return;
                    }
                    if self.socket.eof() {
                        self.close();
                        return;
                    }
                    return;
                }
                Phase::Writing | Phase::Closed => return,
            }
        }
    }

    /// Runs the responder and queues the reply.
    fn dispatch(&self) {
        let Some(server) = self.server.upgrade() else {
            self.close();
            return;
        };
        let request = {
            let mut parser = self.parser.borrow_mut();
            let body = self.body.borrow_mut().take().expect("body complete").body;
            let request = HttpRequest {
                method: std::mem::take(&mut parser.method),
                url: std::mem::take(&mut parser.url),
                query_string: std::mem::take(&mut parser.query_string),
                version: parser.version,
                header: std::mem::take(&mut parser.header),
                body,
                peer: self.peer,
            };
            parser.reset();
            request
        };

        let mut reply = Reply::new();
        match server.find_service(&request.url) {
            None => {
                default_error_reply(&mut reply, 404, &request.url);
            }
            Some(service) => {
                let mut responder = service.create_responder(&request.url);
                responder.begin_request(&request);
                if let Err(e) = responder.reply(&request, &mut reply) {
                    warn!(url = %request.url, error = %e, "responder failed");
                    reply = Reply::new();
                    responder.reply_error(&mut reply, &e);
                    self.keep_alive.set(false);
                }
            }
        }
        debug!(peer = %self.peer, method = %request.method, url = %request.url, status = reply.status, "request served");
        self.send_reply(reply);
    }

    fn send_reply(&self, reply: Reply) {
        let Some(config) = self.config() else {
            self.close();
            return;
        };
        let bytes = reply.to_bytes(&config.server_name, self.keep_alive.get());
        self.phase.set(Phase::Writing);
        self.arm_timer(config.write_timeout);
        if let Err(e) = self.socket.write(&bytes) {
            debug!(peer = %self.peer, error = %e, "reply write failed");
            self.close();
        }
    }

    /// Reply fully drained: either recycle for keep-alive or close.
    fn on_drained(&self) {
        if self.phase.get() != Phase::Writing {
            return;
        }
        if !self.keep_alive.get() {
            self.close();
            return;
        }
        let Some(config) = self.config() else {
            self.close();
            return;
        };
        self.phase.set(Phase::Header);
        self.arm_timer(config.keep_alive_timeout);
        // a pipelined request may already sit in the input buffer
        if self.socket.input_size() > 0 {
            self.process_input();
        }
        if self.phase.get() == Phase::Header || self.phase.get() == Phase::Body {
            if let Err(e) = self.socket.begin_read() {
                debug!(error = %e, "re-arm read");
                self.close();
            }
        }
    }
}

struct ServerCore {
    selector: Selector,
    tcp: TcpServer,
    services: RefCell<Vec<(String, Rc<dyn HttpService>)>>,
    connections: RefCell<HashMap<usize, Rc<Connection>>>,
    next_id: Cell<usize>,
    config: HttpConfig,
}

impl ServerCore {
    fn find_service(&self, url: &str) -> Option<Rc<dyn HttpService>> {
        self.services
            .borrow()
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, url))
            .map(|(_, svc)| Rc::clone(svc))
    }

    fn accept_pending(this: &Rc<Self>) {
        loop {
            match this.tcp.accept() {
                Ok(Some((stream, peer))) => Self::add_connection(this, stream, peer),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn add_connection(this: &Rc<Self>, stream: mio::net::TcpStream, peer: SocketAddr) {
        let id = this.next_id.get();
        this.next_id.set(id + 1);

        let socket = BufferedSocket::from_accepted(&this.selector, stream);
        let timer = Timer::new();
        timer.set_selector(&this.selector);

        let conn = Rc::new(Connection {
            id,
            socket,
            peer,
            parser: RefCell::new(HeaderParser::new_request()),
            body: RefCell::new(None),
            phase: Cell::new(Phase::Header),
            keep_alive: Cell::new(false),
            timer,
            server: Rc::downgrade(this),
        });

        {
            let weak = Rc::downgrade(&conn);
            conn.socket.input_ready.connect(move |_| {
                if let Some(conn) = weak.upgrade() {
                    if let Some(cfg) = conn.config()
                        && conn.phase.get() != Phase::Writing
                    {
                        conn.arm_timer(cfg.read_timeout);
                    }
                    conn.process_input();
                    if matches!(conn.phase.get(), Phase::Header | Phase::Body) {
                        if let Err(e) = conn.socket.begin_read() {
                            debug!(error = %e, "re-arm read");
                            conn.close();
                        }
                    }
                }
            });
        }
        {
            let weak = Rc::downgrade(&conn);
            conn.socket.output_buffer_empty.connect(move |_| {
                if let Some(conn) = weak.upgrade() {
                    conn.on_drained();
                }
            });
        }
        {
            let weak = Rc::downgrade(&conn);
            conn.socket.output_failed.connect(move |e: &NetError| {
                if let Some(conn) = weak.upgrade() {
                    debug!(peer = %conn.peer, error = %e, "write failed");
                    conn.close();
                }
            });
        }
        {
            let weak = Rc::downgrade(&conn);
            conn.socket.input_failed.connect(move |e: &NetError| {
                if let Some(conn) = weak.upgrade() {
                    debug!(peer = %conn.peer, error = %e, "read failed");
                    conn.close();
                }
            });
        }
        {
            let weak = Rc::downgrade(&conn);
            conn.timer.timeout.connect(move |_| {
                if let Some(conn) = weak.upgrade() {
                    debug!(peer = %conn.peer, phase = ?conn.phase.get(), "connection timed out");
                    conn.close();
                }
            });
        }

        conn.arm_timer(this.config.read_timeout);
        if let Err(e) = conn.socket.begin_read() {
            debug!(error = %e, "initial read");
            conn.close();
            return;
        }
        debug!(%peer, id, "connection accepted");
        this.connections.borrow_mut().insert(id, conn);
    }
}

/// An HTTP/1.1 server on a selector.
///
/// Services register under URL patterns; each accepted connection parses
/// requests incrementally as bytes arrive and writes replies back through
/// its buffered socket, honoring keep-alive.
pub struct HttpServer {
    core: Rc<ServerCore>,
}

impl HttpServer {
    pub fn new(selector: &Selector, config: HttpConfig) -> Self {
        let tcp = TcpServer::new();
        tcp.set_selector(selector);
        let core = Rc::new(ServerCore {
            selector: selector.clone(),
            tcp,
            services: RefCell::new(Vec::new()),
            connections: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            config,
        });
        {
            let weak = Rc::downgrade(&core);
            core.tcp.connection_pending.connect(move |_| {
                if let Some(core) = weak.upgrade() {
                    ServerCore::accept_pending(&core);
                }
            });
        }
        HttpServer { core }
    }

    pub fn listen<A: ToSocketAddrs>(&self, addrs: A) -> Result<SocketAddr, HttpError> {
        let addr = self.core.tcp.listen(addrs)?;
        info!(%addr, "http server listening");
        Ok(addr)
    }

    /// Registers a service for a URL pattern; earlier registrations win.
    pub fn add_service(&self, pattern: impl Into<String>, service: Rc<dyn HttpService>) {
        self.core.services.borrow_mut().push((pattern.into(), service));
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.borrow().len()
    }

    /// Closes the listener and every open connection.
    pub fn close(&self) {
        self.core.tcp.close();
        let conns: Vec<Rc<Connection>> =
            self.core.connections.borrow_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns() {
        assert!(pattern_matches("", "/anything"));
        assert!(pattern_matches("/rpc", "/rpc"));
        assert!(!pattern_matches("/rpc", "/rpc2"));
        assert!(pattern_matches("/api/*", "/api/v1/x"));
        assert!(!pattern_matches("/api/*", "/v1/x"));
    }

    #[test]
    fn reply_serialization() {
        let mut reply = Reply::new();
        reply.set_content_type("text/plain");
        reply.write(b"hi");
        let bytes = reply.to_bytes("test-server", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: test-server\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn error_reply_closes() {
        let mut reply = Reply::new();
        default_error_reply(&mut reply, 404, "/missing");
        let text = String::from_utf8(reply.to_bytes("s", false)).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }
}
