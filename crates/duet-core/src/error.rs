use thiserror::Error;

/// Errors produced by the duet protocol and server layers.
#[derive(Debug, Error)]
pub enum DuetError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for DuetError {
    fn from(e: serde_json::Error) -> Self {
        DuetError::Codec(e.to_string())
    }
}

pub type DuetResult<T> = Result<T, DuetError>;
