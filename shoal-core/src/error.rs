use shoal_protocol::error_codes;
use shoal_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unsupported client protocol version {client}; server supports {min}..={max}")]
    ProtocolVersionMismatch { client: i32, min: i32, max: i32 },
    #[error("session not found")]
    SessionNotFound,
    #[error("{message}")]
    Sql {
        code: i32,
        state: String,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("lock timeout on map {map}")]
    LockTimeout { map: String },
    #[error("distributed transaction failure: {0}")]
    DistributedTransactionFailure(String),
    #[error("statement was canceled")]
    Cancelled,
    #[error("object {0} is closed or does not exist")]
    ObjectClosed(i32),
    #[error("wrong user name or password")]
    AuthenticationFailed,
    #[error("feature not supported: {0}")]
    Unsupported(String),
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn sql(code: i32, message: impl Into<String>) -> Self {
        ServerError::Sql {
            code,
            state: error_codes::sql_state(code),
            message: message.into(),
        }
    }

    /// Numeric code written into ERROR responses.
    pub fn code(&self) -> i32 {
        match self {
            ServerError::ProtocolVersionMismatch { .. } => error_codes::DRIVER_VERSION_ERROR_2,
            ServerError::SessionNotFound => error_codes::CONNECTION_BROKEN_1,
            ServerError::Sql { code, .. } => *code,
            ServerError::LockTimeout { .. } => error_codes::LOCK_TIMEOUT_1,
            ServerError::DistributedTransactionFailure(_) => {
                error_codes::TRANSACTION_NOT_VALIDATED
            }
            ServerError::Cancelled => error_codes::STATEMENT_WAS_CANCELED,
            ServerError::ObjectClosed(_) => error_codes::OBJECT_CLOSED,
            ServerError::AuthenticationFailed => error_codes::WRONG_USER_OR_PASSWORD,
            ServerError::Unsupported(_) => error_codes::FEATURE_NOT_SUPPORTED_1,
            ServerError::DuckDb(err) if is_parser_error(err) => error_codes::SYNTAX_ERROR_1,
            ServerError::Storage(_)
            | ServerError::DuckDb(_)
            | ServerError::Protocol(_)
            | ServerError::Io(_)
            | ServerError::Internal(_) => error_codes::GENERAL_ERROR_1,
        }
    }

    pub fn sql_state(&self) -> String {
        match self {
            ServerError::Sql { state, .. } => state.clone(),
            other => error_codes::sql_state(other.code()),
        }
    }

    /// Variant name reported to clients in place of an exception class.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::ProtocolVersionMismatch { .. } => "ProtocolVersionMismatch",
            ServerError::SessionNotFound => "SessionNotFound",
            ServerError::Sql { .. } => "SqlError",
            ServerError::Storage(_) => "StorageError",
            ServerError::LockTimeout { .. } => "LockTimeout",
            ServerError::DistributedTransactionFailure(_) => "DistributedTransactionFailure",
            ServerError::Cancelled => "Cancelled",
            ServerError::ObjectClosed(_) => "ObjectClosed",
            ServerError::AuthenticationFailed => "AuthenticationFailed",
            ServerError::Unsupported(_) => "Unsupported",
            ServerError::DuckDb(_) => "DuckDbError",
            ServerError::Protocol(_) => "ProtocolError",
            ServerError::Io(_) => "IoError",
            ServerError::Internal(_) => "Internal",
        }
    }
}

fn is_parser_error(err: &duckdb::Error) -> bool {
    err.to_string().contains("Parser Error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_message_is_stable() {
        let err = ServerError::SessionNotFound;
        assert_eq!(err.to_string(), "session not found");
        assert_eq!(err.kind(), "SessionNotFound");
    }

    #[test]
    fn cancelled_maps_to_statement_canceled_state() {
        let err = ServerError::Cancelled;
        assert_eq!(err.code(), error_codes::STATEMENT_WAS_CANCELED);
        assert_eq!(err.sql_state(), "57014");
    }

    #[test]
    fn explicit_sql_error_keeps_code_and_state() {
        let err = ServerError::sql(error_codes::DRIVER_VERSION_ERROR_2, "too old");
        assert_eq!(err.code(), 90047);
        assert_eq!(err.sql_state(), "90047");
        assert_eq!(err.to_string(), "too old");
    }
}
