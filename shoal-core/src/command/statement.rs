use std::sync::Arc;

use crate::command::{Slice, Yieldable};
use crate::engine::{LocalResult, PreparedStatement};
use crate::error::ServerError;
use crate::session::Session;

pub struct YieldableQuery {
    statement: Arc<dyn PreparedStatement>,
    max_rows: i32,
    scrollable: bool,
}

impl Yieldable for YieldableQuery {
    type Output = LocalResult;

    fn run_slice(&mut self, session: &mut Session) -> Result<Slice<LocalResult>, ServerError> {
        if self.statement.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        if session.awaiting_validation() {
            return Ok(Slice::Pending);
        }
        session.before_statement()?;
        let result = self.statement.execute_query(self.max_rows, self.scrollable)?;
        Ok(Slice::Done(result))
    }
}

pub struct YieldableUpdate {
    statement: Arc<dyn PreparedStatement>,
}

impl Yieldable for YieldableUpdate {
    type Output = i32;

    fn run_slice(&mut self, session: &mut Session) -> Result<Slice<i32>, ServerError> {
        if self.statement.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        if session.awaiting_validation() {
            return Ok(Slice::Pending);
        }
        if let Some(control) = self.statement.transaction_control() {
            session.execute_transaction_control(&control)?;
            return Ok(Slice::Done(0));
        }
        session.before_statement()?;
        Ok(Slice::Done(self.statement.execute_update()?))
    }
}

/// Builds yieldable commands from a prepared statement.
pub trait YieldableStatement {
    fn create_yieldable_query(&self, max_rows: i32, scrollable: bool) -> YieldableQuery;

    fn create_yieldable_update(&self) -> YieldableUpdate;
}

impl YieldableStatement for Arc<dyn PreparedStatement> {
    fn create_yieldable_query(&self, max_rows: i32, scrollable: bool) -> YieldableQuery {
        YieldableQuery {
            statement: self.clone(),
            max_rows,
            scrollable,
        }
    }

    fn create_yieldable_update(&self) -> YieldableUpdate {
        YieldableUpdate {
            statement: self.clone(),
        }
    }
}
