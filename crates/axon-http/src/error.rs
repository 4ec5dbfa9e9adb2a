use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("malformed message: {0}")]
    Protocol(&'static str),
    #[error("header block exceeds the size limit")]
    HeaderTooLarge,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("http error {code} {text}")]
    Status { code: u16, text: String },
    #[error(transparent)]
    Net(#[from] axon_net::NetError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
