//! Numeric error codes carried in ERROR responses.
//!
//! The SQL state of a code is its five-digit zero padded decimal form.

pub const SYNTAX_ERROR_1: i32 = 42000;
pub const WRONG_USER_OR_PASSWORD: i32 = 28000;
pub const GENERAL_ERROR_1: i32 = 50000;
pub const LOCK_TIMEOUT_1: i32 = 50200;
pub const STATEMENT_WAS_CANCELED: i32 = 57014;
pub const FEATURE_NOT_SUPPORTED_1: i32 = 50100;
pub const OBJECT_CLOSED: i32 = 90007;
pub const DRIVER_VERSION_ERROR_2: i32 = 90047;
pub const CONNECTION_BROKEN_1: i32 = 90067;
pub const TRANSACTION_NOT_VALIDATED: i32 = 90131;

pub fn sql_state(code: i32) -> String {
    format!("{:05}", code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_state_is_zero_padded() {
        assert_eq!(sql_state(STATEMENT_WAS_CANCELED), "57014");
        assert_eq!(sql_state(42), "00042");
    }
}
