use shoal_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server error {code} ({state}): {message}")]
    Server {
        code: i32,
        state: String,
        message: String,
        kind: String,
    },
    #[error("connection closed")]
    Closed,
    #[error("unexpected response status {0}")]
    UnexpectedStatus(i32),
}

impl ClientError {
    /// Server error code, if the server reported one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ClientError::Server { message, .. } => Some(message),
            _ => None,
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
