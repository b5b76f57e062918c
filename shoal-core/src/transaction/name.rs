//! Local transaction names: `<host>:<port>:<txid>`.

use std::fmt;

use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionName {
    pub host: String,
    pub port: u16,
    pub transaction_id: u64,
}

impl TransactionName {
    pub fn new(endpoint: &str, transaction_id: u64) -> Result<Self, ServerError> {
        Self::parse(&format!("{endpoint}:{transaction_id}"))
    }

    pub fn parse(name: &str) -> Result<Self, ServerError> {
        let invalid = || ServerError::Internal(format!("invalid transaction name '{name}'"));
        let mut parts = name.trim().rsplitn(3, ':');
        let transaction_id = parts
            .next()
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        let port = parts
            .next()
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        Ok(Self {
            host: host.to_string(),
            port,
            transaction_id,
        })
    }

    /// `host:port` of the node owning this transaction.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for TransactionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.transaction_id)
    }
}

/// Split a comma separated name list, skipping blanks.
pub fn split_names(all: &str) -> impl Iterator<Item = &str> {
    all.split(',').map(str::trim).filter(|name| !name.is_empty())
}

/// True when `name` belongs to the node advertising `endpoint`.
pub fn is_local(name: &str, endpoint: &str) -> bool {
    name.strip_prefix(endpoint)
        .is_some_and(|rest| rest.starts_with(':'))
}
