//! HTTP/1.1 for the selector stack.
//!
//! The header parser is an incremental byte-at-a-time state machine, so a
//! connection can be fed as bytes arrive and produces the same result as
//! parsing the full message at once. The server dispatches requests to
//! registered services per connection and handles keep-alive; the client
//! drives the same parser in response mode.

mod chunked;
mod client;
mod error;
mod header;
mod parser;
mod server;

pub use chunked::{BodyReader, ChunkedDecoder};
pub use client::{ClientRequest, ClientResponse, HttpClient, HttpClientSignals};
pub use error::HttpError;
pub use header::MessageHeader;
pub use parser::HeaderParser;
pub use server::{HttpConfig, HttpRequest, HttpServer, HttpService, Reply, Responder};
