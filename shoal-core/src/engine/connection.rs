//! DuckDB connection and prepared statement.
//!
//! A `DuckDbConnection` is owned by one session. `duckdb::Connection` holds a
//! `RefCell` internally, so it is kept behind a `Mutex` and every statement
//! goes through `with_conn`.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use duckdb::types::Value as DuckValue;
use duckdb::{params_from_iter, Connection, Statement};
use r2d2::PooledConnection;
use shoal_protocol::{Value, ValueType};
use tracing::{debug, instrument};

use crate::engine::factory::DuckDbManager;
use crate::engine::result::{ColumnMeta, LocalResult};
use crate::engine::{ParameterMeta, PreparedStatement, SqlConnection, NULLABLE_UNKNOWN};
use crate::error::ServerError;
use crate::sql_parser::{ParsedStatement, TransactionControl};
use crate::types;

pub struct DuckDbConnection {
    conn: Mutex<PooledConnection<DuckDbManager>>,
}

impl DuckDbConnection {
    pub fn new(conn: PooledConnection<DuckDbManager>) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| ServerError::Internal("connection mutex poisoned".to_string()))?;
        f(&mut guard)
    }

    fn execute_batch(&self, sql: &str) -> Result<(), ServerError> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }
}

impl SqlConnection for DuckDbConnection {
    #[instrument(skip(self), fields(sql = %sql))]
    fn prepare(
        self: Arc<Self>,
        sql: &str,
        fetch_size: i32,
    ) -> Result<Arc<dyn PreparedStatement>, ServerError> {
        if sql.contains('\0') {
            return Err(ServerError::Unsupported(
                "SQL contains null bytes".to_string(),
            ));
        }
        let parsed = ParsedStatement::parse(sql);
        let tx_control = parsed.transaction_control();
        let param_count = if tx_control.is_some() {
            0
        } else {
            self.with_conn(|conn| Ok(conn.prepare(sql)?.parameter_count()))?
        };
        debug!(param_count, is_query = parsed.is_query(), "prepared statement");

        Ok(Arc::new(DuckDbStatement {
            connection: self,
            sql: sql.to_string(),
            is_query: parsed.is_query(),
            tx_control,
            param_count,
            params: Mutex::new(Vec::new()),
            columns: Mutex::new(None),
            fetch_size: AtomicI32::new(fetch_size),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn begin(&self) -> Result<(), ServerError> {
        self.execute_batch("BEGIN TRANSACTION;")
    }

    fn commit(&self) -> Result<(), ServerError> {
        self.execute_batch("COMMIT;")
    }

    fn rollback(&self) -> Result<(), ServerError> {
        match self.execute_batch("ROLLBACK;") {
            Err(ServerError::DuckDb(err)) if err.to_string().contains("no transaction is active") => {
                Ok(())
            }
            other => other,
        }
    }
}

pub struct DuckDbStatement {
    connection: Arc<DuckDbConnection>,
    sql: String,
    is_query: bool,
    tx_control: Option<TransactionControl>,
    param_count: usize,
    params: Mutex<Vec<DuckValue>>,
    columns: Mutex<Option<Vec<ColumnMeta>>>,
    fetch_size: AtomicI32,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl DuckDbStatement {
    fn check_open(&self) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::sql(
                shoal_protocol::error_codes::OBJECT_CLOSED,
                "statement is closed",
            ));
        }
        if self.cancelled.load(Ordering::Acquire) {
            return Err(ServerError::Cancelled);
        }
        Ok(())
    }

    fn bound_params(&self) -> Result<Vec<DuckValue>, ServerError> {
        let params = self
            .params
            .lock()
            .map_err(|_| ServerError::Internal("parameter mutex poisoned".to_string()))?;
        if params.is_empty() && self.param_count > 0 {
            return Ok(vec![DuckValue::Null; self.param_count]);
        }
        Ok(params.clone())
    }

    fn remember_columns(&self, columns: &[ColumnMeta]) {
        if let Ok(mut cached) = self.columns.lock() {
            *cached = Some(columns.to_vec());
        }
    }
}

fn describe_columns(stmt: &Statement<'_>) -> Vec<ColumnMeta> {
    stmt.column_names()
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            let (value_type, precision, scale) = types::column_type(&stmt.column_type(idx));
            ColumnMeta {
                alias: name.clone(),
                schema_name: String::new(),
                table_name: String::new(),
                column_name: name,
                value_type: value_type as i32,
                precision,
                scale,
                display_size: precision.clamp(0, i64::from(i32::MAX)) as i32,
                auto_increment: false,
                nullable: NULLABLE_UNKNOWN,
            }
        })
        .collect()
}

impl PreparedStatement for DuckDbStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn is_query(&self) -> bool {
        self.is_query
    }

    fn transaction_control(&self) -> Option<TransactionControl> {
        self.tx_control.clone()
    }

    fn parameters(&self) -> Vec<ParameterMeta> {
        (0..self.param_count)
            .map(|_| ParameterMeta {
                value_type: shoal_protocol::value::UNKNOWN_TYPE,
                precision: 0,
                scale: 0,
                nullable: NULLABLE_UNKNOWN,
            })
            .collect()
    }

    fn set_parameters(&self, values: Vec<Value>) -> Result<(), ServerError> {
        if values.len() != self.param_count {
            return Err(ServerError::sql(
                shoal_protocol::error_codes::GENERAL_ERROR_1,
                format!(
                    "expected {} parameters, got {}",
                    self.param_count,
                    values.len()
                ),
            ));
        }
        let converted = values
            .iter()
            .map(types::to_duckdb)
            .collect::<Result<Vec<_>, _>>()?;
        let mut params = self
            .params
            .lock()
            .map_err(|_| ServerError::Internal("parameter mutex poisoned".to_string()))?;
        *params = converted;
        Ok(())
    }

    fn fetch_size(&self) -> i32 {
        self.fetch_size.load(Ordering::Relaxed)
    }

    fn set_fetch_size(&self, fetch_size: i32) {
        self.fetch_size.store(fetch_size, Ordering::Relaxed);
    }

    #[instrument(skip(self), fields(sql = %self.sql))]
    fn execute_query(&self, max_rows: i32, scrollable: bool) -> Result<LocalResult, ServerError> {
        self.check_open()?;
        let params = self.bound_params()?;
        let limit = usize::try_from(max_rows).unwrap_or(0);

        let (columns, rows) = self.connection.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            let mut rows_out = Vec::new();
            {
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                let column_count = rows.as_ref().map(|s| s.column_count()).unwrap_or(0);
                while let Some(row) = rows.next()? {
                    if limit > 0 && rows_out.len() >= limit {
                        break;
                    }
                    let mut values = Vec::with_capacity(column_count);
                    for idx in 0..column_count {
                        values.push(types::from_duckdb(row.get::<_, DuckValue>(idx)?));
                    }
                    rows_out.push(values);
                }
            }
            Ok((describe_columns(&stmt), rows_out))
        })?;

        debug!(rows = rows.len(), "executed query");
        self.remember_columns(&columns);
        Ok(LocalResult::new(columns, rows, scrollable))
    }

    #[instrument(skip(self), fields(sql = %self.sql))]
    fn execute_update(&self) -> Result<i32, ServerError> {
        self.check_open()?;
        let params = self.bound_params()?;
        let affected = self.connection.with_conn(|conn| {
            if params.is_empty() {
                conn.execute_batch(&self.sql)?;
                return Ok(0usize);
            }
            let mut stmt = conn.prepare_cached(&self.sql)?;
            Ok(stmt.execute(params_from_iter(params.iter()))?)
        })?;
        debug!(affected, "executed update");
        Ok(i32::try_from(affected).unwrap_or(i32::MAX))
    }

    fn metadata(&self) -> Result<Vec<ColumnMeta>, ServerError> {
        if !self.is_query {
            return Ok(Vec::new());
        }
        if let Ok(cached) = self.columns.lock() {
            if let Some(columns) = cached.as_ref() {
                return Ok(columns.clone());
            }
        }
        let nulls = vec![DuckValue::Null; self.param_count];
        let columns = self.connection.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.sql)?;
            {
                let _rows = stmt.query(params_from_iter(nulls.iter()))?;
            }
            Ok(describe_columns(&stmt))
        })?;
        self.remember_columns(&columns);
        Ok(columns)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DuckDbStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbStatement")
            .field("sql", &self.sql)
            .field("is_query", &self.is_query)
            .field("param_count", &self.param_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::{DuckDbEngine, SqlEngine};

    fn connection() -> anyhow::Result<Arc<dyn SqlConnection>> {
        Ok(DuckDbEngine::new(&ServerConfig::default())?.connect()?)
    }

    #[test]
    fn query_reports_columns_and_rows() -> anyhow::Result<()> {
        let conn = connection()?;
        let stmt = conn.prepare("SELECT 1 AS one, 'a' AS letter", 10)?;
        assert!(stmt.is_query());
        let mut result = stmt.execute_query(0, false)?;
        let names: Vec<_> = result.columns().iter().map(|c| c.column_name.clone()).collect();
        assert_eq!(names, vec!["one", "letter"]);
        assert_eq!(result.columns()[0].value_type, ValueType::Int as i32);
        assert_eq!(
            result.next_row(),
            Some(&[Value::Int(1), Value::String("a".to_string())][..])
        );
        Ok(())
    }

    #[test]
    fn parameters_bind_and_limit_rows() -> anyhow::Result<()> {
        let conn = connection()?;
        conn.clone()
            .prepare("CREATE TABLE p_t AS SELECT range AS id FROM range(10)", 10)?
            .execute_update()?;
        let stmt = conn.prepare("SELECT id FROM p_t WHERE id >= ? ORDER BY id", 10)?;
        assert_eq!(stmt.parameters().len(), 1);
        stmt.set_parameters(vec![Value::Long(4)])?;
        let result = stmt.execute_query(3, false)?;
        assert_eq!(result.row_count(), 3);
        Ok(())
    }

    #[test]
    fn wrong_parameter_count_is_rejected() -> anyhow::Result<()> {
        let conn = connection()?;
        let stmt = conn.prepare("SELECT ?::INTEGER", 10)?;
        assert!(stmt.set_parameters(Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn transaction_control_is_not_prepared_in_duckdb() -> anyhow::Result<()> {
        let conn = connection()?;
        let stmt = conn.prepare("SAVEPOINT sp1", 10)?;
        assert_eq!(
            stmt.transaction_control(),
            Some(TransactionControl::Savepoint("sp1".to_string()))
        );
        Ok(())
    }

    #[test]
    fn cancelled_statement_refuses_to_run() -> anyhow::Result<()> {
        let conn = connection()?;
        let stmt = conn.prepare("SELECT 1", 10)?;
        stmt.cancel();
        assert!(matches!(
            stmt.execute_query(0, false),
            Err(ServerError::Cancelled)
        ));
        Ok(())
    }

    #[test]
    fn syntax_errors_surface_at_prepare() -> anyhow::Result<()> {
        let conn = connection()?;
        let err = match conn.prepare("SELEC 1", 10) {
            Err(err) => err,
            Ok(_) => anyhow::bail!("expected a parse failure"),
        };
        assert_eq!(err.code(), shoal_protocol::error_codes::SYNTAX_ERROR_1);
        Ok(())
    }
}
