use std::{
    io::{Read, Write},
    rc::Rc,
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use axon_http::{
    ClientRequest, HttpClient, HttpConfig, HttpError, HttpRequest, HttpServer, HttpService, Reply,
    Responder,
};
use axon_reactor::Selector;
use axon_timing::Timespan;

struct EchoResponder;

impl Responder for EchoResponder {
    fn reply(&mut self, request: &HttpRequest, reply: &mut Reply) -> Result<(), HttpError> {
        reply.set_content_type("text/plain");
        if request.method == "POST" {
            let body = request.body.clone();
            reply.write(&body);
        } else {
            reply.write(format!("peer:{}", request.peer.port()).as_bytes());
        }
        Ok(())
    }
}

struct EchoService;

impl HttpService for EchoService {
    fn create_responder(&self, _url: &str) -> Box<dyn Responder> {
        Box::new(EchoResponder)
    }
}

struct FailingService;

impl HttpService for FailingService {
    fn create_responder(&self, _url: &str) -> Box<dyn Responder> {
        struct R;
        impl Responder for R {
            fn reply(&mut self, _: &HttpRequest, _: &mut Reply) -> Result<(), HttpError> {
                Err(HttpError::Protocol("boom"))
            }
        }
        Box::new(R)
    }
}

fn spawn_server(stop: Arc<AtomicBool>, port_tx: mpsc::Sender<u16>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let selector = Selector::new().unwrap();
        let server = HttpServer::new(&selector, HttpConfig::default());
        server.add_service("/fail", Rc::new(FailingService));
        server.add_service("/", Rc::new(EchoService));
        server.add_service("/echo", Rc::new(EchoService));
        let addr = server.listen("127.0.0.1:0").unwrap();
        port_tx.send(addr.port()).unwrap();

        while !stop.load(Ordering::Acquire) {
            selector.wait(Some(Timespan::from_millis(50))).unwrap();
        }
        server.close();
    })
}

fn start() -> (Arc<AtomicBool>, thread::JoinHandle<()>, u16) {
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let handle = spawn_server(Arc::clone(&stop), tx);
    let port = rx.recv().unwrap();
    (stop, handle, port)
}

#[test]
fn get_and_keep_alive_reuses_the_connection() {
    let (stop, handle, port) = start();

    let client = HttpClient::new_sync(format!("127.0.0.1:{port}"));
    let first = client.execute(&ClientRequest::get("/"), Some(Timespan::from_secs(5))).unwrap();
    assert_eq!(first.status_code, 200);
    let second = client.execute(&ClientRequest::get("/"), Some(Timespan::from_secs(5))).unwrap();
    assert_eq!(second.status_code, 200);

    // the body carries the server-observed peer port; identical bodies
    // mean both requests travelled the same socket
    assert_eq!(first.body, second.body);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn post_echoes_the_body() {
    let (stop, handle, port) = start();

    let client = HttpClient::new_sync(format!("127.0.0.1:{port}"));
    let response = client
        .execute(
            &ClientRequest::post("/echo", b"some payload".to_vec()),
            Some(Timespan::from_secs(5)),
        )
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"some payload");

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn unknown_url_is_404() {
    let (stop, handle, port) = start();

    // the echo service is registered at "/" and "/echo" only
    let client = HttpClient::new_sync(format!("127.0.0.1:{port}"));
    let response =
        client.execute(&ClientRequest::get("/missing"), Some(Timespan::from_secs(5))).unwrap();
    assert_eq!(response.status_code, 404);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn responder_failure_becomes_500_and_close() {
    let (stop, handle, port) = start();

    let client = HttpClient::new_sync(format!("127.0.0.1:{port}"));
    let response =
        client.execute(&ClientRequest::get("/fail"), Some(Timespan::from_secs(5))).unwrap();
    assert_eq!(response.status_code, 500);
    assert_eq!(response.header.get("Connection"), Some("close"));

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn malformed_request_gets_400() {
    let (stop, handle, port) = start();

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"THIS IS NOT HTTP\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "{response}");
    assert!(response.contains("Connection: close"));

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn chunked_request_body_is_decoded() {
    let (stop, handle, port) = start();

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
4\r\nWiki\r\n4\r\npedi\r\n1\r\na\r\n0\r\n\r\n",
        )
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("Wikipedia"), "{response}");

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn async_client_roundtrip() {
    let (stop, handle, port) = start();

    let selector = Selector::new().unwrap();
    let client = HttpClient::new(&selector, format!("127.0.0.1:{port}"));

    let done = Rc::new(std::cell::Cell::new(false));
    {
        let done = Rc::clone(&done);
        client.reply_ready.connect(move |_| done.set(true));
    }
    client.error_occurred.connect(|e: &HttpError| panic!("async request failed: {e}"));

    client.begin_execute(&ClientRequest::get("/")).unwrap();
    while !done.get() {
        assert!(selector.wait(Some(Timespan::from_secs(5))).unwrap());
    }
    let response = client.end_reply().unwrap();
    assert_eq!(response.status_code, 200);
    assert!(response.body.starts_with(b"peer:"));

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}
