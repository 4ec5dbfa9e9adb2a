use std::{
    cell::{Cell, RefCell},
    marker::PhantomData,
    rc::Rc,
};

use axon_http::{
    ClientRequest, HttpClient, HttpError, HttpRequest, HttpServer, HttpService, Reply, Responder,
};
use axon_reactor::Selector;
use axon_ser::SerializationInfo;
use axon_signal::Signal;
use axon_timing::Timespan;

use crate::{RemoteClient, RemoteError, Service, jsonrpc, xmlrpc};

/// Body encoding of an RPC-over-HTTP binding.
pub trait HttpBodyCodec: 'static {
    const CONTENT_TYPE: &'static str;

    fn encode_request(method: &str, args: &[SerializationInfo], id: u64) -> Vec<u8>;

    /// Serves one request body, producing a complete response body.
    fn serve(service: &Service, body: &[u8]) -> Vec<u8>;

    fn decode_response(body: &[u8]) -> Result<SerializationInfo, RemoteError>;
}

/// JSON-RPC 2.0 bodies.
pub struct JsonBodyCodec;

impl HttpBodyCodec for JsonBodyCodec {
    const CONTENT_TYPE: &'static str = "application/json";

    fn encode_request(method: &str, args: &[SerializationInfo], id: u64) -> Vec<u8> {
        jsonrpc::encode_request(method, args, id).into_bytes()
    }

    fn serve(service: &Service, body: &[u8]) -> Vec<u8> {
        jsonrpc::serve_body(service, body).into_bytes()
    }

    fn decode_response(body: &[u8]) -> Result<SerializationInfo, RemoteError> {
        jsonrpc::decode_response(body)
    }
}

/// XML-RPC bodies.
pub struct XmlBodyCodec;

impl HttpBodyCodec for XmlBodyCodec {
    const CONTENT_TYPE: &'static str = "text/xml";

    fn encode_request(method: &str, args: &[SerializationInfo], _id: u64) -> Vec<u8> {
        xmlrpc::encode_method_call(method, args).into_bytes()
    }

    fn serve(service: &Service, body: &[u8]) -> Vec<u8> {
        xmlrpc::serve_body(service, body).into_bytes()
    }

    fn decode_response(body: &[u8]) -> Result<SerializationInfo, RemoteError> {
        xmlrpc::decode_method_response(body)
    }
}

struct CodecResponder<C: HttpBodyCodec> {
    service: Rc<RefCell<Service>>,
    marker: PhantomData<C>,
}

impl<C: HttpBodyCodec> Responder for CodecResponder<C> {
    fn reply(&mut self, request: &HttpRequest, reply: &mut Reply) -> Result<(), HttpError> {
        let body = C::serve(&self.service.borrow(), &request.body);
        reply.set_content_type(C::CONTENT_TYPE);
        reply.write(&body);
        Ok(())
    }
}

/// Exposes a [`Service`] through an [`HttpServer`] with bodies encoded by
/// `C`. Protocol-level failures are reported in-band, so the HTTP status
/// is always 200.
pub struct HttpRpcService<C: HttpBodyCodec> {
    service: Rc<RefCell<Service>>,
    marker: PhantomData<C>,
}

impl<C: HttpBodyCodec> HttpRpcService<C> {
    pub fn new(service: Service) -> Rc<Self> {
        Rc::new(HttpRpcService { service: Rc::new(RefCell::new(service)), marker: PhantomData })
    }

    /// Registers this binding on `server` under `pattern`.
    pub fn attach(self: Rc<Self>, server: &HttpServer, pattern: &str) {
        let service: Rc<dyn HttpService> = self;
        server.add_service(pattern, service);
    }

    pub fn with_service<R>(&self, f: impl FnOnce(&mut Service) -> R) -> R {
        f(&mut self.service.borrow_mut())
    }
}

impl<C: HttpBodyCodec> HttpService for HttpRpcService<C> {
    fn create_responder(&self, _url: &str) -> Box<dyn Responder> {
        Box::new(CodecResponder::<C> { service: Rc::clone(&self.service), marker: PhantomData })
    }
}

pub type JsonRpcHttpService = HttpRpcService<JsonBodyCodec>;
pub type XmlRpcHttpService = HttpRpcService<XmlBodyCodec>;

#[derive(Copy, Clone, PartialEq, Eq)]
enum CallState {
    Idle,
    Pending,
    Done,
}

struct HttpCallCore {
    finished: Signal<()>,
    http: HttpClient,
    url: String,
    next_id: Cell<u64>,
    state: Cell<CallState>,
    result: RefCell<Option<Result<SerializationInfo, RemoteError>>>,
    decode: fn(&[u8]) -> Result<SerializationInfo, RemoteError>,
}

impl HttpCallCore {
    fn complete(&self, result: Result<SerializationInfo, RemoteError>) {
        *self.result.borrow_mut() = Some(result);
        self.state.set(CallState::Done);
        self.finished.send(&());
    }
}

/// RPC-over-HTTP client with bodies encoded by `C`.
///
/// Wraps an [`HttpClient`]; keep-alive connection reuse and the
/// sync/async split come from there.
pub struct HttpRpcClient<C: HttpBodyCodec> {
    core: Rc<HttpCallCore>,
    marker: PhantomData<C>,
}

impl<C: HttpBodyCodec> HttpRpcClient<C> {
    fn build(http: HttpClient, url: String) -> Self {
        let core = Rc::new(HttpCallCore {
            finished: Signal::new(),
            http,
            url,
            next_id: Cell::new(1),
            state: Cell::new(CallState::Idle),
            result: RefCell::new(None),
            decode: C::decode_response,
        });
        {
            let weak = Rc::downgrade(&core);
            core.http.reply_ready.connect(move |client: &HttpClient| {
                if let Some(core) = weak.upgrade() {
                    let outcome = match client.end_reply() {
                        Ok(response) if response.ok() => (core.decode)(&response.body),
                        Ok(response) => Err(RemoteError::transport(format!(
                            "http error {} {}",
                            response.status_code, response.status_text
                        ))),
                        Err(e) => Err(e.into()),
                    };
                    core.complete(outcome);
                }
            });
        }
        {
            let weak = Rc::downgrade(&core);
            core.http.error_occurred.connect(move |e: &HttpError| {
                if let Some(core) = weak.upgrade() {
                    core.complete(Err(RemoteError::transport(e.to_string())));
                }
            });
        }
        HttpRpcClient { core, marker: PhantomData }
    }

    /// A selector-driven client posting to `url` on `addr`.
    pub fn new(selector: &Selector, addr: impl Into<String>, url: impl Into<String>) -> Self {
        Self::build(HttpClient::new(selector, addr), url.into())
    }

    /// A synchronous client.
    pub fn new_sync(addr: impl Into<String>, url: impl Into<String>) -> Self {
        Self::build(HttpClient::new_sync(addr), url.into())
    }

    fn request(&self, method: &str, args: &[SerializationInfo]) -> ClientRequest {
        let id = self.core.next_id.get();
        self.core.next_id.set(id + 1);
        let mut request =
            ClientRequest::post(self.core.url.clone(), C::encode_request(method, args, id));
        let _ = request.header.add("Content-Type", C::CONTENT_TYPE);
        request
    }
}

impl<C: HttpBodyCodec> RemoteClient for HttpRpcClient<C> {
    fn call(
        &self,
        method: &str,
        args: &[SerializationInfo],
        timeout: Option<Timespan>,
    ) -> Result<SerializationInfo, RemoteError> {
        let response = self.core.http.execute(&self.request(method, args), timeout)?;
        if !response.ok() {
            return Err(RemoteError::transport(format!(
                "http error {} {}",
                response.status_code, response.status_text
            )));
        }
        C::decode_response(&response.body)
    }

    fn begin(&self, method: &str, args: &[SerializationInfo]) -> Result<(), RemoteError> {
        if self.core.state.get() == CallState::Pending {
            return Err(RemoteError::invalid_request("a call is already in flight"));
        }
        self.core.result.borrow_mut().take();
        self.core.state.set(CallState::Pending);
        self.core.http.begin_execute(&self.request(method, args)).map_err(|e| {
            self.core.state.set(CallState::Idle);
            RemoteError::from(e)
        })
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
        self.core.http.cancel();
        self.core.complete(Err(RemoteError::cancelled()));
    }
}

pub type JsonRpcHttpClient = HttpRpcClient<JsonBodyCodec>;
pub type XmlRpcHttpClient = HttpRpcClient<XmlBodyCodec>;
