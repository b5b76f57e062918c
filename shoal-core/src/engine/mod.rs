//! SQL engine seam.
//!
//! This module provides:
//! - `SqlEngine` / `SqlConnection` / `PreparedStatement`: the interfaces sessions consume
//! - `DuckDbEngine`: pooled DuckDB implementation
//! - `LocalResult`: materialized query results with a cursor

mod connection;
mod factory;
mod result;

use std::sync::Arc;

use shoal_protocol::Value;

pub use connection::{DuckDbConnection, DuckDbStatement};
pub use factory::DuckDbEngine;
pub use result::{ColumnMeta, LocalResult};

use crate::error::ServerError;
use crate::sql_parser::TransactionControl;

/// Parameter metadata reported by `COMMAND_PREPARE_READ_PARAMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMeta {
    pub value_type: i32,
    pub precision: i64,
    pub scale: i32,
    pub nullable: i32,
}

/// Nullability is not known before execution.
pub const NULLABLE_UNKNOWN: i32 = 2;

pub trait SqlEngine: Send + Sync {
    /// Open a connection for a new session.
    fn connect(&self) -> Result<Arc<dyn SqlConnection>, ServerError>;
}

pub trait SqlConnection: Send + Sync {
    fn prepare(
        self: Arc<Self>,
        sql: &str,
        fetch_size: i32,
    ) -> Result<Arc<dyn PreparedStatement>, ServerError>;

    fn begin(&self) -> Result<(), ServerError>;

    fn commit(&self) -> Result<(), ServerError>;

    fn rollback(&self) -> Result<(), ServerError>;
}

pub trait PreparedStatement: Send + Sync {
    fn sql(&self) -> &str;

    fn is_query(&self) -> bool;

    /// `Some` for BEGIN/COMMIT/ROLLBACK/SAVEPOINT, which the session executes itself.
    fn transaction_control(&self) -> Option<TransactionControl>;

    fn parameters(&self) -> Vec<ParameterMeta>;

    fn set_parameters(&self, values: Vec<Value>) -> Result<(), ServerError>;

    fn fetch_size(&self) -> i32;

    fn set_fetch_size(&self, fetch_size: i32);

    /// Run the statement and materialize at most `max_rows` rows (0 = unlimited).
    fn execute_query(&self, max_rows: i32, scrollable: bool) -> Result<LocalResult, ServerError>;

    fn execute_update(&self) -> Result<i32, ServerError>;

    /// Result columns of a query statement; empty for updates.
    fn metadata(&self) -> Result<Vec<ColumnMeta>, ServerError>;

    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    fn close(&self);

    fn is_closed(&self) -> bool;
}
