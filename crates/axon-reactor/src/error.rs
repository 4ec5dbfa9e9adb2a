use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("selector io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Logic(&'static str),
}
