use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    rc::{Rc, Weak},
};

use axon_net::{BufferedSocket, NetError, TcpServer};
use axon_reactor::Selector;
use axon_ser::{Category, SerializationInfo, parse_json, to_json};
use axon_signal::Signal;
use axon_timing::{Clock, Timespan};
use tracing::{debug, info, warn};

use crate::{RemoteClient, RemoteError, RpcError, Service, dispatch};

/// Builds a JSON-RPC 2.0 request body.
pub fn encode_request(method: &str, args: &[SerializationInfo], id: u64) -> String {
    let mut si = SerializationInfo::object();
    si.add_member("jsonrpc").set_value("2.0");
    si.add_member("method").set_value(method);
    let params = si.add_member("params");
    params.set_category(Category::Array);
    for arg in args {
        let mut arg = arg.clone();
        arg.set_name("");
        params.push_member(arg);
    }
    si.add_member("id").set_value(id);
    to_json(&si, false).expect("request tree serializes")
}

/// Decodes a request body into `(method, params, id)`.
pub fn decode_request(
    body: &[u8],
) -> Result<(String, Vec<SerializationInfo>, SerializationInfo), RemoteError> {
    let text =
        std::str::from_utf8(body).map_err(|_| RemoteError::parse_error("body is not utf-8"))?;
    let si = parse_json(text).map_err(|e| RemoteError::parse_error(e.to_string()))?;
    if si.category() != Category::Object {
        return Err(RemoteError::invalid_request("request is not an object"));
    }
    match si.member("jsonrpc") {
        Some(v) if v.as_str() == "2.0" => {}
        _ => return Err(RemoteError::invalid_request("missing jsonrpc version")),
    }
    let method = si
        .member("method")
        .filter(|m| m.category() == Category::Value)
        .map(|m| m.as_str())
        .ok_or_else(|| RemoteError::invalid_request("missing method"))?;
    let params = match si.member("params") {
        None => Vec::new(),
        Some(p) if p.category() == Category::Array => p.members().to_vec(),
        Some(_) => return Err(RemoteError::invalid_request("params must be an array")),
    };
    let id = si.member("id").cloned().unwrap_or_default();
    Ok((method, params, id))
}

/// Builds a success response body.
pub fn encode_response(result: &SerializationInfo, id: &SerializationInfo) -> String {
    let mut si = SerializationInfo::object();
    si.add_member("jsonrpc").set_value("2.0");
    let mut result = result.clone();
    result.set_name("result");
    si.push_member(result);
    let mut id = id.clone();
    id.set_name("id");
    si.push_member(id);
    to_json(&si, false).expect("response tree serializes")
}

/// Builds an error response body.
pub fn encode_error(error: &RemoteError, id: Option<&SerializationInfo>) -> String {
    let mut si = SerializationInfo::object();
    si.add_member("jsonrpc").set_value("2.0");
    let err = si.add_member("error");
    err.add_member("code").set_value(i64::from(error.code));
    err.add_member("message").set_value(error.message.as_str());
    let mut id = id.cloned().unwrap_or_default();
    id.set_name("id");
    si.push_member(id);
    to_json(&si, false).expect("error tree serializes")
}

/// Decodes a response body into the call outcome.
pub fn decode_response(body: &[u8]) -> Result<SerializationInfo, RemoteError> {
    let text =
        std::str::from_utf8(body).map_err(|_| RemoteError::parse_error("body is not utf-8"))?;
    let si = parse_json(text).map_err(|e| RemoteError::parse_error(e.to_string()))?;
    if let Some(error) = si.member("error") {
        let code = error
            .member("code")
            .and_then(|c| c.as_i64().ok())
            .unwrap_or(i64::from(crate::INTERNAL_ERROR));
        let message =
            error.member("message").map(|m| m.as_str()).unwrap_or_else(|| "unknown".to_string());
        return Err(RemoteError::remote(code as i32, message));
    }
    si.member("result")
        .cloned()
        .ok_or_else(|| RemoteError::parse_error("response carries neither result nor error"))
}

/// Serves one request body; always returns a response body.
pub(crate) fn serve_body(service: &Service, body: &[u8]) -> String {
    match decode_request(body) {
        Ok((method, params, id)) => match dispatch(service, &method, &params) {
            Ok(result) => encode_response(&result, &id),
            Err(e) => {
                debug!(method, code = e.code, "procedure failed");
                encode_error(&e, Some(&id))
            }
        },
        Err(e) => encode_error(&e, None),
    }
}

// ---------------------------------------------------------------------------
// newline-framed TCP transport

struct JsonConnection {
    id: usize,
    socket: BufferedSocket,
    server: Weak<JsonServerCore>,
}

impl JsonConnection {
    fn close(&self) {
        self.socket.close();
        if let Some(server) = self.server.upgrade() {
            server.connections.borrow_mut().remove(&self.id);
        }
    }

    /// One request per line; a reply line goes back for each.
    fn process_input(&self) {
        let Some(server) = self.server.upgrade() else {
            self.close();
            return;
        };
        loop {
            let line = self.socket.with_input(|input| {
                input.iter().position(|&b| b == b'\n').map(|n| input[..n].to_vec())
            });
            let Some(line) = line else { break };
            self.socket.consume_input(line.len() + 1);

            let mut reply = serve_body(&server.service.borrow(), &line);
            reply.push('\n');
            if let Err(e) = self.socket.write(reply.as_bytes()) {
                debug!(error = %e, "reply write failed");
                self.close();
                return;
            }
        }
        if self.socket.eof() {
            self.close();
            return;
        }
        if let Err(e) = self.socket.begin_read() {
            debug!(error = %e, "re-arm read");
            self.close();
        }
    }
}

struct JsonServerCore {
    selector: Selector,
    tcp: TcpServer,
    service: RefCell<Service>,
    connections: RefCell<HashMap<usize, Rc<JsonConnection>>>,
    next_id: Cell<usize>,
}

impl JsonServerCore {
    fn accept_pending(this: &Rc<Self>) {
        while let Ok(Some((stream, peer))) = this.tcp.accept() {
            debug!(%peer, "jsonrpc client connected");
            let id = this.next_id.get();
            this.next_id.set(id + 1);
            let socket = BufferedSocket::from_accepted(&this.selector, stream);
            let conn = Rc::new(JsonConnection { id, socket, server: Rc::downgrade(this) });
            {
                let weak = Rc::downgrade(&conn);
                conn.socket.input_ready.connect(move |_| {
                    if let Some(conn) = weak.upgrade() {
                        conn.process_input();
                    }
                });
            }
            {
                let weak = Rc::downgrade(&conn);
                conn.socket.input_failed.connect(move |e: &NetError| {
                    if let Some(conn) = weak.upgrade() {
                        debug!(error = %e, "read failed");
                        conn.close();
                    }
                });
            }
            {
                let weak = Rc::downgrade(&conn);
                conn.socket.output_failed.connect(move |e: &NetError| {
                    if let Some(conn) = weak.upgrade() {
                        debug!(error = %e, "write failed");
                        conn.close();
                    }
                });
            }
            if let Err(e) = conn.socket.begin_read() {
                warn!(error = %e, "initial read");
                conn.close();
                continue;
            }
            this.connections.borrow_mut().insert(id, conn);
        }
    }
}

/// Serves a [`Service`] as newline-framed JSON-RPC 2.0 over raw TCP.
pub struct JsonRpcTcpServer {
    core: Rc<JsonServerCore>,
}

impl JsonRpcTcpServer {
    pub fn new(selector: &Selector, service: Service) -> Self {
        let tcp = TcpServer::new();
        tcp.set_selector(selector);
        let core = Rc::new(JsonServerCore {
            selector: selector.clone(),
            tcp,
            service: RefCell::new(service),
            connections: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        });
        {
            let weak = Rc::downgrade(&core);
            core.tcp.connection_pending.connect(move |_| {
                if let Some(core) = weak.upgrade() {
                    JsonServerCore::accept_pending(&core);
                }
            });
        }
        JsonRpcTcpServer { core }
    }

    pub fn listen<A: ToSocketAddrs>(&self, addrs: A) -> Result<SocketAddr, RpcError> {
        let addr = self.core.tcp.listen(addrs)?;
        info!(%addr, "jsonrpc tcp server listening");
        Ok(addr)
    }

    pub fn with_service<R>(&self, f: impl FnOnce(&mut Service) -> R) -> R {
        f(&mut self.core.service.borrow_mut())
    }

    pub fn close(&self) {
        self.core.tcp.close();
        let conns: Vec<Rc<JsonConnection>> =
            self.core.connections.borrow_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close();
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum CallState {
    Idle,
    Connecting,
    Pending,
    Done,
}

struct JsonClientCore {
    finished: Signal<()>,
    socket: BufferedSocket,
    addr: String,
    next_id: Cell<u64>,
    pending: RefCell<Option<Vec<u8>>>,
    state: Cell<CallState>,
    result: RefCell<Option<Result<SerializationInfo, RemoteError>>>,
}

impl JsonClientCore {
    fn complete(&self, result: Result<SerializationInfo, RemoteError>) {
        *self.result.borrow_mut() = Some(result);
        self.state.set(CallState::Done);
        self.finished.send(&());
    }

    fn send_pending(&self) {
        let Some(frame) = self.pending.borrow_mut().take() else { return };
        self.state.set(CallState::Pending);
        if let Err(e) = self.socket.write(&frame) {
            self.complete(Err(e.into()));
            return;
        }
        if let Err(e) = self.socket.begin_read() {
            self.complete(Err(e.into()));
        }
    }

    fn process_input(&self) {
        if self.state.get() != CallState::Pending {
            return;
        }
        let line = self.socket.with_input(|input| {
            input.iter().position(|&b| b == b'\n').map(|n| input[..n].to_vec())
        });
        match line {
            Some(line) => {
                self.socket.consume_input(line.len() + 1);
                self.complete(decode_response(&line));
            }
            None => {
                if self.socket.eof() {
                    self.socket.close();
                    self.complete(Err(RemoteError::transport("connection closed mid-reply")));
                    return;
                }
                if let Err(e) = self.socket.begin_read() {
                    self.complete(Err(e.into()));
                }
            }
        }
    }
}

/// Client for newline-framed JSON-RPC 2.0 over raw TCP.
pub struct JsonRpcTcpClient {
    core: Rc<JsonClientCore>,
}

impl JsonRpcTcpClient {
    fn build(socket: BufferedSocket, addr: String) -> Self {
        let core = Rc::new(JsonClientCore {
            finished: Signal::new(),
            socket,
            addr,
            next_id: Cell::new(1),
            pending: RefCell::new(None),
            state: Cell::new(CallState::Idle),
            result: RefCell::new(None),
        });
        {
            let weak = Rc::downgrade(&core);
            core.socket.input_ready.connect(move |_| {
                if let Some(core) = weak.upgrade() {
                    core.process_input();
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.connected.connect(move |_| {
                if let Some(core) = weak.upgrade()
                    && core.state.get() == CallState::Connecting
                {
                    core.send_pending();
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.connect_failed.connect(move |e: &NetError| {
                if let Some(core) = weak.upgrade() {
                    core.complete(Err(RemoteError::transport(e.to_string())));
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.input_failed.connect(move |e: &NetError| {
                if let Some(core) = weak.upgrade() {
                    core.socket.close();
                    core.complete(Err(RemoteError::transport(e.to_string())));
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.socket.output_failed.connect(move |e: &NetError| {
                if let Some(core) = weak.upgrade() {
                    core.socket.close();
                    core.complete(Err(RemoteError::transport(e.to_string())));
                }
            });
        }
        JsonRpcTcpClient { core }
    }

    pub fn new(selector: &Selector, addr: impl Into<String>) -> Self {
        Self::build(BufferedSocket::new(selector), addr.into())
    }

    pub fn new_sync(addr: impl Into<String>) -> Self {
        Self::build(BufferedSocket::unattached(), addr.into())
    }

    fn frame(&self, method: &str, args: &[SerializationInfo]) -> Vec<u8> {
        let id = self.core.next_id.get();
        self.core.next_id.set(id + 1);
        let mut body = encode_request(method, args, id);
        body.push('\n');
        body.into_bytes()
    }
}

impl RemoteClient for JsonRpcTcpClient {
    fn call(
        &self,
        method: &str,
        args: &[SerializationInfo],
        timeout: Option<Timespan>,
    ) -> Result<SerializationInfo, RemoteError> {
        let core = &self.core;
        let deadline = timeout.map(|t| Clock::monotonic() + t);
        let remaining =
            |deadline: Option<Timespan>| deadline.map(|d| d.saturating_sub(Clock::monotonic()));

        if !core.socket.connected() {
            core.socket.connect(core.addr.as_str(), remaining(deadline))?;
        }
        core.socket.put(&self.frame(method, args));
        core.socket.flush(remaining(deadline))?;

        loop {
            let line = core.socket.with_input(|input| {
                input.iter().position(|&b| b == b'\n').map(|n| input[..n].to_vec())
            });
            if let Some(line) = line {
                core.socket.consume_input(line.len() + 1);
                return decode_response(&line);
            }
            if core.socket.read(remaining(deadline))? == 0 {
                core.socket.close();
                return Err(RemoteError::transport("connection closed mid-reply"));
            }
        }
    }

    fn begin(&self, method: &str, args: &[SerializationInfo]) -> Result<(), RemoteError> {
        if self.core.state.get() == CallState::Pending {
            return Err(RemoteError::invalid_request("a call is already in flight"));
        }
        self.core.result.borrow_mut().take();
        *self.core.pending.borrow_mut() = Some(self.frame(method, args));
        if self.core.socket.connected() {
            self.core.send_pending();
        } else {
            self.core.state.set(CallState::Connecting);
            self.core.socket.begin_connect(self.core.addr.as_str())?;
        }
        Ok(())
    }

    fn end(&self) -> Result<SerializationInfo, RemoteError> {
        match self.core.result.borrow_mut().take() {
            Some(outcome) => {
                self.core.state.set(CallState::Idle);
                outcome
            }
            None => Err(RemoteError::invalid_request("no reply ready")),
        }
    }

    fn finished(&self) -> &Signal<()> {
        &self.core.finished
    }

    fn cancel(&self) {
        self.core.pending.borrow_mut().take();
        self.core.socket.close();
        self.core.complete(Err(RemoteError::cancelled()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_ser::to_si;

    #[test]
    fn request_body_shape() {
        let body = encode_request("add", &[to_si(&5i64), to_si(&6i64)], 1);
        assert_eq!(body, r#"{"jsonrpc":"2.0","method":"add","params":[5,6],"id":1}"#);
    }

    #[test]
    fn response_body_shape() {
        let id = to_si(&1u64);
        let body = encode_response(&to_si(&11i64), &id);
        assert_eq!(body, r#"{"jsonrpc":"2.0","result":11,"id":1}"#);
    }

    #[test]
    fn serve_add() {
        let mut service = Service::new();
        service.register_fn2("add", |a: i64, b: i64| Ok(a + b)).unwrap();
        let reply =
            serve_body(&service, br#"{"jsonrpc":"2.0","method":"add","params":[5,6],"id":1}"#);
        assert_eq!(reply, r#"{"jsonrpc":"2.0","result":11,"id":1}"#);
    }

    #[test]
    fn serve_unknown_method() {
        let service = Service::new();
        let reply =
            serve_body(&service, br#"{"jsonrpc":"2.0","method":"nope","params":[],"id":7}"#);
        let parsed = parse_json(&reply).unwrap();
        assert_eq!(
            parsed.member("error").unwrap().member("code").unwrap().as_i64().unwrap(),
            i64::from(crate::METHOD_NOT_FOUND)
        );
        assert_eq!(parsed.member("id").unwrap().as_i64().unwrap(), 7);
    }

    #[test]
    fn serve_parse_error() {
        let service = Service::new();
        let reply = serve_body(&service, b"{ not json");
        let parsed = parse_json(&reply).unwrap();
        assert_eq!(
            parsed.member("error").unwrap().member("code").unwrap().as_i64().unwrap(),
            i64::from(crate::PARSE_ERROR)
        );
    }

    #[test]
    fn serve_invalid_request() {
        let service = Service::new();
        let reply = serve_body(&service, br#"{"method":"x"}"#);
        let parsed = parse_json(&reply).unwrap();
        assert_eq!(
            parsed.member("error").unwrap().member("code").unwrap().as_i64().unwrap(),
            i64::from(crate::INVALID_REQUEST)
        );
    }

    #[test]
    fn decode_error_response() {
        let err = decode_response(br#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"nope"},"id":1}"#)
            .unwrap_err();
        assert_eq!(err.code, crate::METHOD_NOT_FOUND);
        assert_eq!(err.message, "nope");
    }
}
