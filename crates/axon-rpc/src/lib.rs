//! Remote procedure calls over four transports.
//!
//! A [`Service`] maps procedure names to typed callables. The same
//! registry serves over the binary protocol on raw TCP, JSON-RPC 2.0 on
//! raw TCP or HTTP, and XML-RPC on HTTP, with identical application-level
//! semantics. Clients expose the unified [`RemoteClient`] surface:
//! synchronous calls with timeouts, or selector-driven `begin`/`end`
//! with cancellation.

pub mod binrpc;
mod client;
mod error;
mod httprpc;
pub mod jsonrpc;
mod service;
pub mod xmlrpc;

pub use binrpc::{BinRpcClient, BinRpcServer};
pub use client::{RemoteClient, RemoteProcedure};
pub use error::{
    ErrorKind, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    RemoteError, RpcError,
};
pub use httprpc::{
    HttpBodyCodec, HttpRpcClient, HttpRpcService, JsonBodyCodec, JsonRpcHttpClient,
    JsonRpcHttpService, XmlBodyCodec, XmlRpcHttpClient, XmlRpcHttpService,
};
pub use jsonrpc::{JsonRpcTcpClient, JsonRpcTcpServer};
pub use service::{Service, ServiceProcedure, dispatch};
