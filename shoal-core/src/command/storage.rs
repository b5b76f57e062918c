use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::command::{Slice, Yieldable};
use crate::error::ServerError;
use crate::session::Session;
use crate::storage::Access;

#[derive(Debug, Clone)]
pub enum StorageOp {
    Get { map: String, key: Bytes },
    Put { map: String, key: Bytes, value: Bytes },
    Append { map: String, value: Bytes },
}

impl StorageOp {
    pub fn map(&self) -> &str {
        match self {
            StorageOp::Get { map, .. } | StorageOp::Put { map, .. } | StorageOp::Append { map, .. } => map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageReply {
    /// Value read, or the value a put replaced.
    Value(Option<Vec<u8>>),
    /// Key allocated by an append.
    Key(i64),
}

/// A storage access that yields while another transaction holds the key.
pub struct YieldableStorage {
    op: StorageOp,
    lock_timeout: Duration,
    waiting_since: Option<Instant>,
}

impl YieldableStorage {
    pub fn new(op: StorageOp, lock_timeout: Duration) -> Self {
        Self {
            op,
            lock_timeout,
            waiting_since: None,
        }
    }
}

impl Yieldable for YieldableStorage {
    type Output = StorageReply;

    fn run_slice(&mut self, session: &mut Session) -> Result<Slice<StorageReply>, ServerError> {
        if session.awaiting_validation() {
            return Ok(Slice::Pending);
        }
        let access = match &self.op {
            StorageOp::Get { map, key } => session.storage_get(map, key)?.map(StorageReply::Value),
            StorageOp::Put { map, key, value } => {
                session.storage_put(map, key, value)?.map(StorageReply::Value)
            }
            StorageOp::Append { map, value } => {
                session.storage_append(map, value)?.map(StorageReply::Key)
            }
        };
        match access {
            Access::Ready(reply) => Ok(Slice::Done(reply)),
            Access::Locked { holder } => {
                let since = *self.waiting_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.lock_timeout {
                    return Err(ServerError::LockTimeout {
                        map: self.op.map().to_string(),
                    });
                }
                debug!(map = self.op.map(), holder, "storage access waiting for lock");
                Ok(Slice::Pending)
            }
        }
    }
}
