use thiserror::Error;

/// JSON-RPC 2.0 protocol error codes, shared by every transport.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Where a call failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connecting, reading or writing the transport failed.
    Transport,
    /// The peer sent bytes that do not form a valid message.
    Protocol,
    /// Arguments or result did not convert.
    Serialization,
    /// The remote procedure reported an error.
    Remote,
    Timeout,
    Cancelled,
}

/// The error type of every RPC call.
///
/// Carries the protocol-level code (negative for the reserved JSON-RPC
/// range, positive for application errors), a message, and the [`kind`]
/// distinguishing transport, protocol, serialization, remote, timeout and
/// cancellation failures.
///
/// [`kind`]: RemoteError::kind
#[derive(Error, Debug, Clone)]
#[error("rpc error {code} ({kind:?}): {message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
    pub kind: ErrorKind,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>, kind: ErrorKind) -> Self {
        RemoteError { code, message: message.into(), kind }
    }

    /// An application-level error raised by a procedure.
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message, ErrorKind::Remote)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message, ErrorKind::Protocol)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message, ErrorKind::Protocol)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method \"{method}\" not found"), ErrorKind::Remote)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message, ErrorKind::Serialization)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message, ErrorKind::Remote)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message, ErrorKind::Transport)
    }

    pub fn timeout() -> Self {
        Self::new(0, "operation timed out", ErrorKind::Timeout)
    }

    pub fn cancelled() -> Self {
        Self::new(0, "operation cancelled", ErrorKind::Cancelled)
    }
}

impl From<axon_net::NetError> for RemoteError {
    fn from(e: axon_net::NetError) -> Self {
        match e {
            axon_net::NetError::Timeout => Self::timeout(),
            axon_net::NetError::Cancelled => Self::cancelled(),
            other => Self::transport(other.to_string()),
        }
    }
}

impl From<axon_http::HttpError> for RemoteError {
    fn from(e: axon_http::HttpError) -> Self {
        match e {
            axon_http::HttpError::Timeout => Self::timeout(),
            axon_http::HttpError::Net(axon_net::NetError::Timeout) => Self::timeout(),
            axon_http::HttpError::Protocol(m) => Self::parse_error(m),
            other => Self::transport(other.to_string()),
        }
    }
}

impl From<axon_ser::SerError> for RemoteError {
    fn from(e: axon_ser::SerError) -> Self {
        match e {
            axon_ser::SerError::Parse { .. } | axon_ser::SerError::UnexpectedEnd(_) => {
                Self::parse_error(e.to_string())
            }
            other => Self::new(INVALID_PARAMS, other.to_string(), ErrorKind::Serialization),
        }
    }
}

/// Service-side registration errors.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("procedure \"{0}\" is already registered")]
    DuplicateProcedure(String),
    #[error(transparent)]
    Net(#[from] axon_net::NetError),
    #[error(transparent)]
    Http(#[from] axon_http::HttpError),
}
