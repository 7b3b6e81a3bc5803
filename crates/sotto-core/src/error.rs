use thiserror::Error;

/// Errors produced by the sotto protocol layer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("admission denied: {0}")]
    Admission(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
