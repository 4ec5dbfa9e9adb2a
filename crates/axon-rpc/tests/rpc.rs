use std::{
    rc::Rc,
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use axon_http::{HttpConfig, HttpServer};
use axon_reactor::Selector;
use axon_rpc::{
    BinRpcClient, BinRpcServer, ErrorKind, JsonRpcHttpClient, JsonRpcHttpService,
    JsonRpcTcpClient, JsonRpcTcpServer, RemoteClient, RemoteError, RemoteProcedure, Service,
    XmlRpcHttpClient, XmlRpcHttpService,
};
use axon_ser::to_si;
use axon_timing::Timespan;

fn test_service() -> Service {
    let mut service = Service::new();
    service.register_fn1("echo", |s: String| Ok(s)).unwrap();
    service.register_fn2("add", |a: i64, b: i64| Ok(a + b)).unwrap();
    service
        .register_fn2("div", |a: f64, b: f64| {
            if b == 0.0 {
                Err(RemoteError::remote(17, "division by zero"))
            } else {
                Ok(a / b)
            }
        })
        .unwrap();
    service
}

enum Transport {
    Bin,
    JsonTcp,
    JsonHttp,
    XmlHttp,
}

fn spawn_server(
    transport: Transport,
    stop: Arc<AtomicBool>,
    port_tx: mpsc::Sender<u16>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let selector = Selector::new().unwrap();
        // servers stay alive until the end of the scope
        let mut _bin = None;
        let mut _json = None;
        let mut _http = None;
        let port = match transport {
            Transport::Bin => {
                let server = BinRpcServer::new(&selector, test_service());
                let addr = server.listen("127.0.0.1:0").unwrap();
                _bin = Some(server);
                addr.port()
            }
            Transport::JsonTcp => {
                let server = JsonRpcTcpServer::new(&selector, test_service());
                let addr = server.listen("127.0.0.1:0").unwrap();
                _json = Some(server);
                addr.port()
            }
            Transport::JsonHttp => {
                let server = HttpServer::new(&selector, HttpConfig::default());
                let addr = server.listen("127.0.0.1:0").unwrap();
                JsonRpcHttpService::new(test_service()).attach(&server, "/jsonrpc");
                _http = Some(server);
                addr.port()
            }
            Transport::XmlHttp => {
                let server = HttpServer::new(&selector, HttpConfig::default());
                let addr = server.listen("127.0.0.1:0").unwrap();
                XmlRpcHttpService::new(test_service()).attach(&server, "/xmlrpc");
                _http = Some(server);
                addr.port()
            }
        };
        port_tx.send(port).unwrap();

        while !stop.load(Ordering::Acquire) {
            selector.wait(Some(Timespan::from_millis(50))).unwrap();
        }
    })
}

fn start(transport: Transport) -> (Arc<AtomicBool>, thread::JoinHandle<()>, u16) {
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let handle = spawn_server(transport, Arc::clone(&stop), tx);
    let port = rx.recv().unwrap();
    (stop, handle, port)
}

const TIMEOUT: Option<Timespan> = Some(Timespan::from_secs(5));

#[test]
fn binary_echo_sync() {
    let (stop, handle, port) = start(Transport::Bin);

    let client = BinRpcClient::new_sync(format!("127.0.0.1:{port}"));
    let result = client.call("echo", &[to_si("hello")], TIMEOUT).unwrap();
    assert_eq!(result.as_str(), "hello");

    // a second call reuses the connection
    let result = client.call("add", &[to_si(&2i64), to_si(&3i64)], TIMEOUT).unwrap();
    assert_eq!(result.as_i64().unwrap(), 5);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn binary_async_remote_procedure() {
    let (stop, handle, port) = start(Transport::Bin);

    let selector = Selector::new().unwrap();
    let client: Rc<dyn RemoteClient> =
        Rc::new(BinRpcClient::new(&selector, format!("127.0.0.1:{port}")));
    let echo: RemoteProcedure<String> = RemoteProcedure::new(Rc::clone(&client), "echo");

    let done = Rc::new(std::cell::Cell::new(false));
    {
        let done = Rc::clone(&done);
        echo.finished().connect(move |_| done.set(true));
    }

    echo.begin(&[to_si("roundabout")]).unwrap();
    while !done.get() {
        assert!(selector.wait(TIMEOUT).unwrap());
    }
    assert_eq!(echo.end().unwrap(), "roundabout");

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn binary_remote_error() {
    let (stop, handle, port) = start(Transport::Bin);

    let client = BinRpcClient::new_sync(format!("127.0.0.1:{port}"));
    let err = client.call("div", &[to_si(&1.0f64), to_si(&0.0f64)], TIMEOUT).unwrap_err();
    assert_eq!(err.code, 17);
    assert_eq!(err.kind, ErrorKind::Remote);
    assert_eq!(err.message, "division by zero");

    // errors are not sticky
    let result = client.call("div", &[to_si(&1.0f64), to_si(&2.0f64)], TIMEOUT).unwrap();
    assert_eq!(result.as_f64().unwrap(), 0.5);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn json_tcp_sync() {
    let (stop, handle, port) = start(Transport::JsonTcp);

    let client = JsonRpcTcpClient::new_sync(format!("127.0.0.1:{port}"));
    let result = client.call("add", &[to_si(&5i64), to_si(&6i64)], TIMEOUT).unwrap();
    assert_eq!(result.as_i64().unwrap(), 11);

    let err = client.call("missing", &[], TIMEOUT).unwrap_err();
    assert_eq!(err.code, axon_rpc::METHOD_NOT_FOUND);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn json_http_add() {
    let (stop, handle, port) = start(Transport::JsonHttp);

    let client = JsonRpcHttpClient::new_sync(format!("127.0.0.1:{port}"), "/jsonrpc");
    let result = client.call("add", &[to_si(&5i64), to_si(&6i64)], TIMEOUT).unwrap();
    assert_eq!(result.as_i64().unwrap(), 11);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn json_http_async() {
    let (stop, handle, port) = start(Transport::JsonHttp);

    let selector = Selector::new().unwrap();
    let client: Rc<dyn RemoteClient> = Rc::new(JsonRpcHttpClient::new(
        &selector,
        format!("127.0.0.1:{port}"),
        "/jsonrpc",
    ));
    let add: RemoteProcedure<i64> = RemoteProcedure::new(Rc::clone(&client), "add");

    let done = Rc::new(std::cell::Cell::new(false));
    {
        let done = Rc::clone(&done);
        add.finished().connect(move |_| done.set(true));
    }

    add.begin(&[to_si(&20i64), to_si(&22i64)]).unwrap();
    while !done.get() {
        assert!(selector.wait(TIMEOUT).unwrap());
    }
    assert_eq!(add.end().unwrap(), 42);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn xml_http_roundtrip() {
    let (stop, handle, port) = start(Transport::XmlHttp);

    let client = XmlRpcHttpClient::new_sync(format!("127.0.0.1:{port}"), "/xmlrpc");
    let result = client.call("echo", &[to_si("xml says <hi>")], TIMEOUT).unwrap();
    assert_eq!(result.as_str(), "xml says <hi>");

    let err = client.call("div", &[to_si(&1.0f64), to_si(&0.0f64)], TIMEOUT).unwrap_err();
    assert_eq!(err.code, 17);
    assert_eq!(err.kind, ErrorKind::Remote);

    stop.store(true, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn cancellation_completes_with_cancelled() {
    // no server: connect will never finish, cancel must still complete
    let selector = Selector::new().unwrap();
    let client: Rc<dyn RemoteClient> =
        Rc::new(BinRpcClient::new(&selector, "127.0.0.1:1".to_string()));
    let echo: RemoteProcedure<String> = RemoteProcedure::new(Rc::clone(&client), "echo");

    let outcomes = Rc::new(std::cell::Cell::new(0u32));
    {
        let outcomes = Rc::clone(&outcomes);
        echo.finished().connect(move |_| outcomes.set(outcomes.get() + 1));
    }

    if echo.begin(&[to_si("never")]).is_err() {
        // connect failed synchronously on this host; that also cancels
        return;
    }
    echo.cancel();
    let err = echo.end().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert!(outcomes.get() >= 1);
}

#[test]
fn timeout_is_reported() {
    // a listener that never answers
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = BinRpcClient::new_sync(format!("127.0.0.1:{port}"));
    let err = client
        .call("echo", &[to_si("void")], Some(Timespan::from_millis(100)))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}
