//! Minimal HTTP server answering every URL with a text page.

use std::rc::Rc;

use axon::{
    http::{HttpConfig, HttpError, HttpRequest, HttpServer, HttpService, Reply, Responder},
    reactor::Selector,
    timing::Timespan,
};

struct HelloResponder;

impl Responder for HelloResponder {
    fn reply(&mut self, request: &HttpRequest, reply: &mut Reply) -> Result<(), HttpError> {
        reply.set_content_type("text/plain");
        reply.write(format!("hello from {}\n", request.url).as_bytes());
        Ok(())
    }
}

struct HelloService;

impl HttpService for HelloService {
    fn create_responder(&self, _url: &str) -> Box<dyn Responder> {
        Box::new(HelloResponder)
    }
}

fn main() {
    tracing_subscriber::fmt().init();

    let selector = Selector::new().expect("selector");
    let server = HttpServer::new(&selector, HttpConfig::default());
    server.add_service("", Rc::new(HelloService));
    server.listen("0.0.0.0:8001").expect("listen");

    loop {
        selector.wait(Some(Timespan::from_secs(10))).expect("wait");
    }
}
