use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not connect: {0}")]
    ConnectFailed(std::io::Error),
    #[error("address did not resolve")]
    AddressResolution,
    #[error("socket is not connected")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Reactor(#[from] axon_reactor::ReactorError),
}
