//! Lightweight statement classification.
//!
//! The engine executes SQL itself; the server only needs to know whether a
//! statement produces rows and whether it is a transaction control statement
//! that must be routed through the session instead of the engine.

use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Transaction control statements handled by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionControl {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
}

/// Represents a parsed SQL statement with extracted metadata.
pub struct ParsedStatement {
    statement: Option<Statement>,
    leading_keyword: String,
}

impl ParsedStatement {
    /// Parse a SQL statement.
    ///
    /// For multi-statement SQL the last statement determines the result type.
    /// SQL the generic dialect cannot parse falls back to keyword inspection.
    pub fn parse(sql: &str) -> Self {
        let dialect = GenericDialect {};
        let statement = Parser::parse_sql(&dialect, sql)
            .ok()
            .and_then(|statements| statements.into_iter().last());
        let leading_keyword = sql
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        Self {
            statement,
            leading_keyword,
        }
    }

    /// Check if this is a query statement (returns results).
    pub fn is_query(&self) -> bool {
        match &self.statement {
            Some(statement) => matches!(
                statement,
                Statement::Query(_)
                    | Statement::ShowTables { .. }
                    | Statement::ShowColumns { .. }
                    | Statement::ShowCreate { .. }
                    | Statement::ShowVariable { .. }
                    | Statement::ShowVariables { .. }
                    | Statement::Explain { .. }
                    | Statement::ExplainTable { .. }
                    | Statement::Pragma { .. }
            ),
            None => matches!(
                self.leading_keyword.as_str(),
                "SELECT"
                    | "WITH"
                    | "VALUES"
                    | "FROM"
                    | "TABLE"
                    | "SHOW"
                    | "DESCRIBE"
                    | "SUMMARIZE"
                    | "EXPLAIN"
                    | "PRAGMA"
            ),
        }
    }

    pub fn transaction_control(&self) -> Option<TransactionControl> {
        match &self.statement {
            Some(Statement::StartTransaction { .. }) => Some(TransactionControl::Begin),
            Some(Statement::Commit { .. }) => Some(TransactionControl::Commit),
            Some(Statement::Rollback {
                savepoint: Some(name),
                ..
            }) => Some(TransactionControl::RollbackToSavepoint(name.value.clone())),
            Some(Statement::Rollback { .. }) => Some(TransactionControl::Rollback),
            Some(Statement::Savepoint { name }) => {
                Some(TransactionControl::Savepoint(name.value.clone()))
            }
            Some(_) => None,
            None => match self.leading_keyword.as_str() {
                "BEGIN" => Some(TransactionControl::Begin),
                "COMMIT" | "END" => Some(TransactionControl::Commit),
                "ROLLBACK" | "ABORT" => Some(TransactionControl::Rollback),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_and_show_are_queries() {
        assert!(ParsedStatement::parse("SELECT id FROM t").is_query());
        assert!(ParsedStatement::parse("  with x as (select 1) select * from x").is_query());
        assert!(ParsedStatement::parse("SHOW TABLES").is_query());
        assert!(!ParsedStatement::parse("INSERT INTO t VALUES (1)").is_query());
        assert!(!ParsedStatement::parse("CREATE TABLE t(id INT PRIMARY KEY)").is_query());
    }

    #[test]
    fn duckdb_only_syntax_uses_keyword_fallback() {
        assert!(ParsedStatement::parse("SUMMARIZE t").is_query());
        assert!(ParsedStatement::parse("FROM t SELECT id").is_query());
    }

    #[test]
    fn transaction_statements_are_classified() {
        assert_eq!(
            ParsedStatement::parse("BEGIN TRANSACTION").transaction_control(),
            Some(TransactionControl::Begin)
        );
        assert_eq!(
            ParsedStatement::parse("COMMIT").transaction_control(),
            Some(TransactionControl::Commit)
        );
        assert_eq!(
            ParsedStatement::parse("ROLLBACK").transaction_control(),
            Some(TransactionControl::Rollback)
        );
        assert_eq!(
            ParsedStatement::parse("SAVEPOINT sp1").transaction_control(),
            Some(TransactionControl::Savepoint("sp1".to_string()))
        );
        assert_eq!(
            ParsedStatement::parse("ROLLBACK TO SAVEPOINT sp1").transaction_control(),
            Some(TransactionControl::RollbackToSavepoint("sp1".to_string()))
        );
        assert_eq!(
            ParsedStatement::parse("SELECT 1").transaction_control(),
            None
        );
    }
}
