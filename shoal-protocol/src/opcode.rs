use crate::error::ProtocolError;

macro_rules! opcodes {
    ($($name:ident = $value:literal),+ $(,)?) => {
        /// Request operation codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum Opcode {
            $($name = $value),+
        }

        impl TryFrom<i32> for Opcode {
            type Error = ProtocolError;

            fn try_from(value: i32) -> Result<Self, ProtocolError> {
                match value {
                    $($value => Ok(Opcode::$name),)+
                    other => Err(ProtocolError::UnknownOpcode(other)),
                }
            }
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),+];
        }
    };
}

opcodes! {
    SessionInit = 0,
    SessionClose = 1,
    SessionCancelStatement = 2,
    SessionSetAutoCommit = 3,

    CommandPrepare = 10,
    CommandPrepareReadParams = 11,
    CommandClose = 12,
    CommandGetMetaData = 13,

    CommandQuery = 20,
    CommandPreparedQuery = 21,
    CommandUpdate = 22,
    CommandPreparedUpdate = 23,

    CommandDistributedTransactionQuery = 30,
    CommandDistributedTransactionPreparedQuery = 31,
    CommandDistributedTransactionUpdate = 32,
    CommandDistributedTransactionPreparedUpdate = 33,
    CommandDistributedTransactionCommit = 34,
    CommandDistributedTransactionRollback = 35,
    CommandDistributedTransactionAddSavepoint = 36,
    CommandDistributedTransactionRollbackSavepoint = 37,
    CommandDistributedTransactionValidate = 38,

    CommandReplicationUpdate = 40,
    CommandReplicationPreparedUpdate = 41,
    CommandReplicationCommit = 42,
    CommandReplicationRollback = 43,

    CommandStorageGet = 50,
    CommandStoragePut = 51,
    CommandStorageAppend = 52,
    CommandStorageReplicationPut = 53,
    CommandStorageDistributedTransactionGet = 54,
    CommandStorageDistributedTransactionPut = 55,
    CommandStorageDistributedTransactionAppend = 56,
    CommandStoragePrepareMoveLeafPage = 57,
    CommandStorageMoveLeafPage = 58,
    CommandStorageReplicateRootPages = 59,
    CommandStorageReadPage = 60,
    CommandStorageRemoveLeafPage = 61,

    CommandBatchStatementUpdate = 70,
    CommandBatchStatementPreparedUpdate = 71,

    CommandReadLob = 80,

    ResultFetchRows = 90,
    ResultReset = 91,
    ResultChangeId = 92,
    ResultClose = 93,
}

impl Opcode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Operations that run inside the session's distributed transaction and
    /// prefix their response with the transaction's local names.
    pub fn is_distributed(self) -> bool {
        matches!(
            self,
            Opcode::CommandDistributedTransactionQuery
                | Opcode::CommandDistributedTransactionPreparedQuery
                | Opcode::CommandDistributedTransactionUpdate
                | Opcode::CommandDistributedTransactionPreparedUpdate
                | Opcode::CommandStorageDistributedTransactionGet
                | Opcode::CommandStorageDistributedTransactionPut
                | Opcode::CommandStorageDistributedTransactionAppend
        )
    }

    /// Operations the server never answers.
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Opcode::SessionClose
                | Opcode::SessionCancelStatement
                | Opcode::CommandClose
                | Opcode::CommandDistributedTransactionCommit
                | Opcode::CommandDistributedTransactionRollback
                | Opcode::CommandDistributedTransactionAddSavepoint
                | Opcode::CommandDistributedTransactionRollbackSavepoint
                | Opcode::CommandReplicationCommit
                | Opcode::CommandReplicationRollback
                | Opcode::CommandStorageMoveLeafPage
                | Opcode::CommandStorageReplicateRootPages
                | Opcode::ResultReset
                | Opcode::ResultChangeId
                | Opcode::ResultClose
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_round_trips_through_its_code() -> anyhow::Result<()> {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(op.code())?, *op);
        }
        Ok(())
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(
            Opcode::try_from(4242),
            Err(ProtocolError::UnknownOpcode(4242))
        ));
    }

    #[test]
    fn fire_and_forget_operations_have_no_response() {
        assert!(!Opcode::CommandDistributedTransactionCommit.expects_response());
        assert!(!Opcode::CommandStorageMoveLeafPage.expects_response());
        assert!(Opcode::CommandDistributedTransactionValidate.expects_response());
        assert!(Opcode::SessionInit.expects_response());
    }
}
