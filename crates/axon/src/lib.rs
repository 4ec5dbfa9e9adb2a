extern crate self as axon;

pub use axon_http as http;
pub use axon_net as net;
pub use axon_pool as pool;
pub use axon_reactor as reactor;
pub use axon_rpc as rpc;
pub use axon_ser as ser;
pub use axon_signal as signal;
pub use axon_timing as timing;
pub use tracing;
