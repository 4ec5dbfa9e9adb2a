use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    rc::{Rc, Weak},
};

use axon_net::{BufferedSocket, NetError, TcpServer};
use axon_reactor::Selector;
use axon_ser::{BinFormatter, BinParser, BinStatus, SerializationInfo, Tag, format_si};
use axon_signal::Signal;
use axon_timing::{Clock, Timespan};
use tracing::{debug, info, warn};

use crate::{RemoteClient, RemoteError, RpcError, Service, dispatch};

/// Encodes one request frame:
/// `RpcRequest` method`\0` argument-nodes `Eod`.
pub fn encode_request(method: &str, args: &[SerializationInfo]) -> Result<Vec<u8>, RemoteError> {
    let mut out = vec![Tag::RpcRequest as u8];
    out.extend_from_slice(method.as_bytes());
    out.push(0);
    let mut formatter = BinFormatter::new(out);
    for arg in args {
        format_si(arg, &mut formatter)?;
    }
    let mut out = formatter.into_inner();
    out.push(Tag::Eod as u8);
    Ok(out)
}

/// Encodes a success reply: `RpcResponse` result-node `Eod`.
pub fn encode_response(result: &SerializationInfo) -> Result<Vec<u8>, RemoteError> {
    let mut formatter = BinFormatter::new(vec![Tag::RpcResponse as u8]);
    format_si(result, &mut formatter)?;
    let mut out = formatter.into_inner();
    out.push(Tag::Eod as u8);
    Ok(out)
}

/// Encodes a failure reply:
/// `RpcException` code(i32 LE) message`\0` `Eod`.
pub fn encode_exception(error: &RemoteError) -> Vec<u8> {
    let mut out = vec![Tag::RpcException as u8];
    out.extend_from_slice(&error.code.to_le_bytes());
    out.extend_from_slice(error.message.as_bytes());
    out.push(0);
    out.push(Tag::Eod as u8);
    out
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ReqState {
    Tag,
    Method,
    Args,
    ArgsBoundary,
}

/// Incremental request-frame decoder; one per server connection.
///
/// The argument parser's name dictionary spans the whole frame, matching
/// the formatter side.
pub struct RequestDecoder {
    state: ReqState,
    method: Vec<u8>,
    args: Vec<SerializationInfo>,
    parser: BinParser,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDecoder {
    pub fn new() -> Self {
        RequestDecoder {
            state: ReqState::Tag,
            method: Vec::new(),
            args: Vec::new(),
            parser: BinParser::new(),
        }
    }

    /// Feeds bytes; returns `(consumed, Some((method, args)))` when a
    /// complete request frame was read.
    #[allow(clippy::type_complexity)]
    pub fn feed(
        &mut self,
        input: &[u8],
    ) -> Result<(usize, Option<(String, Vec<SerializationInfo>)>), RemoteError> {
        let mut i = 0;
        while i < input.len() {
            match self.state {
                ReqState::Tag => {
                    if input[i] != Tag::RpcRequest as u8 {
                        return Err(RemoteError::invalid_request(format!(
                            "expected a request frame, got tag {:#04x}",
                            input[i]
                        )));
                    }
                    self.state = ReqState::Method;
                    i += 1;
                }
                ReqState::Method => {
                    if input[i] == 0 {
                        self.state = ReqState::ArgsBoundary;
                    } else {
                        self.method.push(input[i]);
                    }
                    i += 1;
                }
                ReqState::ArgsBoundary => {
                    if input[i] == Tag::Eod as u8 {
                        i += 1;
                        let method = String::from_utf8(std::mem::take(&mut self.method))
                            .map_err(|_| RemoteError::invalid_request("method name not utf-8"))?;
                        let args = std::mem::take(&mut self.args);
                        self.parser = BinParser::new();
                        self.state = ReqState::Tag;
                        return Ok((i, Some((method, args))));
                    }
                    self.state = ReqState::Args;
                }
                ReqState::Args => match self.parser.advance(&input[i..])? {
                    BinStatus::Complete { consumed } => {
                        i += consumed;
                        self.args.push(self.parser.take()?);
                        self.parser.reset();
                        self.state = ReqState::ArgsBoundary;
                    }
                    BinStatus::NeedMore => {
                        i = input.len();
                    }
                },
            }
        }
        Ok((i, None))
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum RespState {
    Tag,
    Value,
    ValueEod,
    ExcCode,
    ExcMessage,
    ExcEod,
}

/// Incremental response-frame decoder; one per client.
pub struct ResponseDecoder {
    state: RespState,
    parser: BinParser,
    value: Option<SerializationInfo>,
    code_bytes: [u8; 4],
    code_have: usize,
    message: Vec<u8>,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        ResponseDecoder {
            state: RespState::Tag,
            parser: BinParser::new(),
            value: None,
            code_bytes: [0; 4],
            code_have: 0,
            message: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feeds bytes; returns `(consumed, Some(result))` when a complete
    /// reply frame was read.
    #[allow(clippy::type_complexity)]
    pub fn feed(
        &mut self,
        input: &[u8],
    ) -> Result<(usize, Option<Result<SerializationInfo, RemoteError>>), RemoteError> {
        let mut i = 0;
        while i < input.len() {
            match self.state {
                RespState::Tag => {
                    self.state = match input[i] {
                        t if t == Tag::RpcResponse as u8 => RespState::Value,
                        t if t == Tag::RpcException as u8 => RespState::ExcCode,
                        t => {
                            return Err(RemoteError::parse_error(format!(
                                "expected a reply frame, got tag {t:#04x}"
                            )));
                        }
                    };
                    i += 1;
                }
                RespState::Value => match self.parser.advance(&input[i..])? {
                    BinStatus::Complete { consumed } => {
                        i += consumed;
                        self.value = Some(self.parser.take()?);
                        self.state = RespState::ValueEod;
                    }
                    BinStatus::NeedMore => {
                        i = input.len();
                    }
                },
                RespState::ValueEod => {
                    if input[i] != Tag::Eod as u8 {
                        return Err(RemoteError::parse_error("reply frame not terminated"));
                    }
                    i += 1;
                    let value = self.value.take().expect("value parsed");
                    self.reset();
                    return Ok((i, Some(Ok(value))));
                }
                RespState::ExcCode => {
                    self.code_bytes[self.code_have] = input[i];
                    self.code_have += 1;
                    i += 1;
                    if self.code_have == 4 {
                        self.state = RespState::ExcMessage;
                    }
                }
                RespState::ExcMessage => {
                    if input[i] == 0 {
                        self.state = RespState::ExcEod;
                    } else {
                        self.message.push(input[i]);
                    }
                    i += 1;
                }
                RespState::ExcEod => {
                    if input[i] != Tag::Eod as u8 {
                        return Err(RemoteError::parse_error("exception frame not terminated"));
                    }
                    i += 1;
                    let code = i32::from_le_bytes(self.code_bytes);
                    let message = String::from_utf8_lossy(&self.message).into_owned();
                    self.reset();
                    return Ok((i, Some(Err(RemoteError::remote(code, message)))));
                }
            }
        }
        Ok((i, None))
    }
}

struct BinConnection {
    id: usize,
    socket: BufferedSocket,
    decoder: RefCell<RequestDecoder>,
    server: Weak<BinServerCore>,
}

impl BinConnection {
    fn close(&self) {
        self.socket.close();
        if let Some(server) = self.server.upgrade() {
            server.connections.borrow_mut().remove(&self.id);
        }
    }

    fn process_input(&self) {
        let Some(server) = self.server.upgrade() else {
            self.close();
            return;
        };
        loop {
            let result = self.socket.with_input(|input| self.decoder.borrow_mut().feed(input));
            match result {
                Ok((consumed, complete)) => {
                    self.socket.consume_input(consumed);
                    match complete {
                        Some((method, args)) => {
                            let reply = match dispatch(&server.service.borrow(), &method, &args) {
                                Ok(result) => encode_response(&result)
                                    .unwrap_or_else(|e| encode_exception(&e)),
                                Err(e) => {
                                    debug!(method, code = e.code, "procedure failed");
                                    encode_exception(&e)
                                }
                            };
                            if let Err(e) = self.socket.write(&reply) {
                                debug!(error = %e, "reply write failed");
                                self.close();
                                return;
                            }
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "bad request frame");
                    self.socket.put(&encode_exception(&e));
                    let _ = self.socket.begin_write();
                    self.close();
                    return;
                }
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

struct BinServerCore {
    selector: Selector,
    tcp: TcpServer,
    service: RefCell<Service>,
    connections: RefCell<HashMap<usize, Rc<BinConnection>>>,
    next_id: Cell<usize>,
}

impl BinServerCore {
    fn accept_pending(this: &Rc<Self>) {
        loop {
            match this.tcp.accept() {
                Ok(Some((stream, peer))) => {
                    debug!(%peer, "rpc client connected");
                    Self::add_connection(this, stream);
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn add_connection(this: &Rc<Self>, stream: mio::net::TcpStream) {
        let id = this.next_id.get();
        this.next_id.set(id + 1);
        let socket = BufferedSocket::from_accepted(&this.selector, stream);
        let conn = Rc::new(BinConnection {
            id,
            socket,
            decoder: RefCell::new(RequestDecoder::new()),
            server: Rc::downgrade(this),
        });
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
            debug!(error = %e, "initial read");
            conn.close();
            return;
        }
        this.connections.borrow_mut().insert(id, conn);
    }
}

/// Serves a [`Service`] over the proprietary binary protocol on raw TCP.
pub struct BinRpcServer {
    core: Rc<BinServerCore>,
}

impl BinRpcServer {
    pub fn new(selector: &Selector, service: Service) -> Self {
        let tcp = TcpServer::new();
        tcp.set_selector(selector);
        let core = Rc::new(BinServerCore {
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
                    BinServerCore::accept_pending(&core);
                }
            });
        }
        BinRpcServer { core }
    }

    pub fn listen<A: ToSocketAddrs>(&self, addrs: A) -> Result<SocketAddr, RpcError> {
        let addr = self.core.tcp.listen(addrs)?;
        info!(%addr, "binary rpc server listening");
        Ok(addr)
    }

    /// Access to the registry, e.g. to add procedures after start.
    pub fn with_service<R>(&self, f: impl FnOnce(&mut Service) -> R) -> R {
        f(&mut self.core.service.borrow_mut())
    }

    pub fn close(&self) {
        self.core.tcp.close();
        let conns: Vec<Rc<BinConnection>> =
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

struct BinClientCore {
    finished: Signal<()>,
    socket: BufferedSocket,
    addr: String,
    decoder: RefCell<ResponseDecoder>,
    pending: RefCell<Option<Vec<u8>>>,
    state: Cell<CallState>,
    result: RefCell<Option<Result<SerializationInfo, RemoteError>>>,
}

impl BinClientCore {
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
        let result = self.socket.with_input(|input| self.decoder.borrow_mut().feed(input));
        match result {
            Ok((consumed, complete)) => {
                self.socket.consume_input(consumed);
                if let Some(outcome) = complete {
                    self.complete(outcome);
                    return;
                }
                if self.socket.eof() {
                    self.socket.close();
                    self.complete(Err(RemoteError::transport("connection closed mid-reply")));
                    return;
                }
                if let Err(e) = self.socket.begin_read() {
                    self.complete(Err(e.into()));
                }
            }
            Err(e) => {
                self.socket.close();
                self.complete(Err(e));
            }
        }
    }
}

/// Client for the binary protocol.
///
/// `call` blocks the calling thread; `begin`/`end` run through the
/// selector the socket is attached to, with completion reported by the
/// `finished` signal.
pub struct BinRpcClient {
    core: Rc<BinClientCore>,
}

impl BinRpcClient {
    fn build(socket: BufferedSocket, addr: String) -> Self {
        let core = Rc::new(BinClientCore {
            finished: Signal::new(),
            socket,
            addr,
            decoder: RefCell::new(ResponseDecoder::new()),
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
        BinRpcClient { core }
    }

    /// A selector-driven client for `begin`/`end` calls.
    pub fn new(selector: &Selector, addr: impl Into<String>) -> Self {
        Self::build(BufferedSocket::new(selector), addr.into())
    }

    /// A synchronous client.
    pub fn new_sync(addr: impl Into<String>) -> Self {
        Self::build(BufferedSocket::unattached(), addr.into())
    }
}

impl RemoteClient for BinRpcClient {
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
        core.decoder.borrow_mut().reset();
        let frame = encode_request(method, args)?;
        core.socket.put(&frame);
        core.socket.flush(remaining(deadline))?;

        loop {
            let (consumed, complete) = {
                let result = core.socket.with_input(|input| core.decoder.borrow_mut().feed(input));
                match result {
                    Ok(r) => r,
                    Err(e) => {
                        core.socket.close();
                        return Err(e);
                    }
                }
            };
            core.socket.consume_input(consumed);
            if let Some(outcome) = complete {
                return outcome;
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
        self.core.decoder.borrow_mut().reset();
        self.core.result.borrow_mut().take();
        *self.core.pending.borrow_mut() = Some(encode_request(method, args)?);
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
        self.core.decoder.borrow_mut().reset();
        self.core.complete(Err(RemoteError::cancelled()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_ser::to_si;

    #[test]
    fn echo_request_wire_shape() {
        // RpcRequest 'echo\0' PlainString "hello\0" Eod
        let frame = encode_request("echo", &[to_si("hello")]).unwrap();
        assert_eq!(frame, b"\xc0echo\0\x43hello\0\xff");
    }

    #[test]
    fn echo_response_wire_shape() {
        // RpcResponse PlainString "hello\0" Eod
        let frame = encode_response(&to_si("hello")).unwrap();
        assert_eq!(frame, b"\xc1\x43hello\0\xff");
    }

    #[test]
    fn request_decoder_roundtrip() {
        let frame = encode_request("add", &[to_si(&5i64), to_si(&6i64)]).unwrap();
        let mut decoder = RequestDecoder::new();
        let (consumed, complete) = decoder.feed(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        let (method, args) = complete.unwrap();
        assert_eq!(method, "add");
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].as_i64().unwrap(), 5);
        assert_eq!(args[1].as_i64().unwrap(), 6);
    }

    #[test]
    fn request_decoder_byte_at_a_time() {
        let frame = encode_request("echo", &[to_si("hi")]).unwrap();
        let mut decoder = RequestDecoder::new();
        let mut complete = None;
        for b in &frame {
            let (_, c) = decoder.feed(std::slice::from_ref(b)).unwrap();
            if c.is_some() {
                complete = c;
            }
        }
        let (method, args) = complete.unwrap();
        assert_eq!(method, "echo");
        assert_eq!(args[0].as_str(), "hi");
    }

    #[test]
    fn response_decoder_exception() {
        let err = RemoteError::remote(42, "kaboom");
        let frame = encode_exception(&err);
        let mut decoder = ResponseDecoder::new();
        let (consumed, complete) = decoder.feed(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        let outcome = complete.unwrap().unwrap_err();
        assert_eq!(outcome.code, 42);
        assert_eq!(outcome.message, "kaboom");
    }

    #[test]
    fn two_pipelined_requests() {
        let mut wire = encode_request("a", &[]).unwrap();
        wire.extend(encode_request("b", &[to_si(&1i64)]).unwrap());
        let mut decoder = RequestDecoder::new();

        let (consumed, first) = decoder.feed(&wire).unwrap();
        assert_eq!(first.unwrap().0, "a");
        let (_, second) = decoder.feed(&wire[consumed..]).unwrap();
        assert_eq!(second.unwrap().0, "b");
    }

    #[test]
    fn bad_leading_tag_is_an_error() {
        let mut decoder = RequestDecoder::new();
        assert!(decoder.feed(&[0x55]).is_err());
    }
}
