use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },
    #[error("member \"{0}\" not found")]
    MissingMember(String),
    #[error("value \"{value}\" is not convertible to {target}")]
    NotConvertible { value: String, target: &'static str },
    #[error("{format} parse error at byte {offset}: {message}")]
    Parse { format: &'static str, offset: usize, message: String },
    #[error("unexpected end of {0} input")]
    UnexpectedEnd(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SerError {
    pub fn parse(format: &'static str, offset: usize, message: impl Into<String>) -> Self {
        SerError::Parse { format, offset, message: message.into() }
    }
}
