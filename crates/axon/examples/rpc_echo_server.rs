//! Binary-RPC echo server. Run the client from `rpc_echo_client.rs`
//! against it.

use axon::{
    reactor::Selector,
    rpc::{BinRpcServer, RemoteError, Service},
    timing::Timespan,
};

fn main() {
    tracing_subscriber::fmt().init();

    let mut service = Service::new();
    service.register_fn1("echo", |msg: String| Ok(msg)).unwrap();
    service.register_fn2("add", |a: i64, b: i64| Ok(a + b)).unwrap();
    service
        .register_fn2("div", |a: f64, b: f64| {
            if b == 0.0 {
                Err(RemoteError::remote(1, "division by zero"))
            } else {
                Ok(a / b)
            }
        })
        .unwrap();

    let selector = Selector::new().expect("selector");
    let server = BinRpcServer::new(&selector, service);
    server.listen("0.0.0.0:7002").expect("listen");

    loop {
        selector.wait(Some(Timespan::from_secs(10))).expect("wait");
    }
}
