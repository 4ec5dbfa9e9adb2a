//! Calls `echo` on the binary-RPC echo server.

use axon::{
    rpc::{BinRpcClient, RemoteClient},
    ser::to_si,
    timing::Timespan,
};

fn main() {
    tracing_subscriber::fmt().init();

    let client = BinRpcClient::new_sync("127.0.0.1:7002");
    let msg = std::env::args().nth(1).unwrap_or_else(|| "hello".to_string());

    match client.call("echo", &[to_si(msg.as_str())], Some(Timespan::from_secs(5))) {
        Ok(reply) => println!("{}", reply.as_str()),
        Err(e) => {
            eprintln!("call failed: {e}");
            std::process::exit(1);
        }
    }
}
