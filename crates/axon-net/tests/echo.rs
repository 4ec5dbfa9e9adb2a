use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::mpsc,
    thread,
};

use axon_net::{BufferedSocket, TcpServer};
use axon_reactor::Selector;
use axon_timing::Timespan;

/// Echo server on its own thread and selector; stops after serving one
/// connection to EOF.
fn spawn_echo_server(port_tx: mpsc::Sender<u16>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let selector = Selector::new().unwrap();
        let server = TcpServer::new();
        server.set_selector(&selector);
        let addr = server.listen("127.0.0.1:0").unwrap();
        port_tx.send(addr.port()).unwrap();

        let conns: Rc<RefCell<Vec<BufferedSocket>>> = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(Cell::new(false));

        {
            let selector = selector.clone();
            let conns = Rc::clone(&conns);
            let done = Rc::clone(&done);
            server.connection_pending.connect(move |srv: &TcpServer| {
                while let Some((stream, _peer)) = srv.accept().unwrap() {
                    let sock = BufferedSocket::from_accepted(&selector, stream);
                    {
                        let done = Rc::clone(&done);
                        sock.input_ready.connect(move |s: &BufferedSocket| {
                            let data = s.take_input();
                            if !data.is_empty() {
                                s.write(&data).unwrap();
                            }
                            if s.eof() {
                                done.set(true);
                            } else {
                                s.begin_read().unwrap();
                            }
                        });
                    }
                    sock.begin_read().unwrap();
                    conns.borrow_mut().push(sock);
                }
            });
        }

        while !done.get() {
            selector.wait(Some(Timespan::from_secs(5))).unwrap();
        }
    })
}

#[test]
fn sync_client_roundtrip() {
    let (tx, rx) = mpsc::channel();
    let server = spawn_echo_server(tx);
    let port = rx.recv().unwrap();

    let client = BufferedSocket::unattached();
    client.connect(("127.0.0.1", port), Some(Timespan::from_secs(5))).unwrap();
    client.write(b"hello").unwrap();
    client.flush(Some(Timespan::from_secs(5))).unwrap();

    while client.input_size() < 5 {
        client.read(Some(Timespan::from_secs(5))).unwrap();
    }
    assert_eq!(client.take_input(), b"hello");

    client.close();
    server.join().unwrap();
}

#[test]
fn async_client_roundtrip() {
    let (tx, rx) = mpsc::channel();
    let server = spawn_echo_server(tx);
    let port = rx.recv().unwrap();

    let selector = Selector::new().unwrap();
    let client = BufferedSocket::new(&selector);
    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    client.connected.connect(move |c: &BufferedSocket| {
        c.write(b"ping pong").unwrap();
        c.begin_read().unwrap();
    });
    client.connect_failed.connect(|e| panic!("connect failed: {e}"));
    {
        let got = Rc::clone(&got);
        client.input_ready.connect(move |c: &BufferedSocket| {
            got.borrow_mut().extend_from_slice(&c.take_input());
            c.begin_read().unwrap();
        });
    }

    client.begin_connect(("127.0.0.1", port)).unwrap();
    while got.borrow().len() < 9 {
        assert!(selector.wait(Some(Timespan::from_secs(5))).unwrap());
    }
    assert_eq!(*got.borrow(), b"ping pong");

    client.close();
    server.join().unwrap();
}

#[test]
fn output_buffer_empty_fires_once_per_drain() {
    let (tx, rx) = mpsc::channel();
    let server = spawn_echo_server(tx);
    let port = rx.recv().unwrap();

    let selector = Selector::new().unwrap();
    let client = BufferedSocket::new(&selector);
    let drains = Rc::new(Cell::new(0u32));
    let echoed: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    client.connected.connect(move |c: &BufferedSocket| {
        c.put(b"abc");
        c.put(b"def");
        c.write(b"ghi").unwrap();
        c.begin_read().unwrap();
    });
    {
        let drains = Rc::clone(&drains);
        client.output_buffer_empty.connect(move |_| drains.set(drains.get() + 1));
    }
    {
        let echoed = Rc::clone(&echoed);
        client.input_ready.connect(move |c: &BufferedSocket| {
            echoed.borrow_mut().extend_from_slice(&c.take_input());
            c.begin_read().unwrap();
        });
    }

    client.begin_connect(("127.0.0.1", port)).unwrap();
    while echoed.borrow().len() < 9 {
        selector.wait(Some(Timespan::from_secs(5))).unwrap();
    }

    assert_eq!(*echoed.borrow(), b"abcdefghi");
    assert_eq!(drains.get(), 1);
    assert_eq!(client.output_size(), 0);

    client.close();
    server.join().unwrap();
}
