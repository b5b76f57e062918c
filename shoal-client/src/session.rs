//! One logical session: a method per opcode.

use std::sync::Arc;

use bytes::Bytes;
use shoal_protocol::{
    LeafPageMovePlan, Opcode, PacketReader, PacketWriter, PageKey, Value, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
use tracing::debug;

use crate::connection::{ClientConnection, PendingResponse};
use crate::error::Result;
use crate::result::{read_columns, ClientColumn, ClientResult};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub min_version: i32,
    pub max_version: i32,
    pub db_name: String,
    pub url: String,
    pub user: String,
    pub password: Vec<u8>,
    pub properties: Vec<(String, String)>,
    /// Rows requested per fetch.
    pub fetch_size: i32,
    /// The server's object cache capacity; drives result id remapping.
    pub server_cached_objects: i32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            min_version: PROTOCOL_VERSION_MIN,
            max_version: PROTOCOL_VERSION_MAX,
            db_name: "shoal".to_string(),
            url: "shoal://localhost".to_string(),
            user: "sa".to_string(),
            password: Vec::new(),
            properties: Vec::new(),
            fetch_size: 100,
            server_cached_objects: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    pub value_type: i32,
    pub precision: i64,
    pub scale: i32,
    pub nullable: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatement {
    pub id: i32,
    pub is_query: bool,
    pub parameters: Vec<ParameterInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub local_names: Option<String>,
    pub update_count: i32,
    pub last_row_key: i64,
}

/// A reply to a distributed operation, prefixed with the participant's local names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distributed<T> {
    pub local_names: String,
    pub value: T,
}

pub struct ClientSession {
    conn: Arc<ClientConnection>,
    session_id: i32,
    version: i32,
    auto_commit: bool,
    fetch_size: i32,
    server_cached_objects: i32,
}

enum Source<'a> {
    Sql(&'a str),
    Prepared(i32, &'a [Value]),
}

impl Source<'_> {
    fn write(&self, out: &mut PacketWriter) {
        match self {
            Source::Sql(sql) => {
                out.write_str(sql);
            }
            Source::Prepared(id, values) => {
                out.write_i32(*id).write_values(values);
            }
        }
    }
}

impl ClientSession {
    pub(crate) async fn init(conn: Arc<ClientConnection>, session_id: i32, options: SessionOptions) -> Result<Self> {
        let mut input = conn
            .request(Opcode::SessionInit, session_id, |out| {
                out.write_i32(options.min_version)
                    .write_i32(options.max_version)
                    .write_str(&options.db_name)
                    .write_str(&options.url)
                    .write_str(&options.user)
                    .write_bytes(Some(options.password.as_slice()))
                    .write_i32(options.properties.len() as i32);
                for (key, value) in &options.properties {
                    out.write_str(key).write_str(value);
                }
            })
            .await?;
        let version = input.read_i32()?;
        conn.set_version(version);
        input.set_version(version);
        let auto_commit = input.read_bool()?;
        let target_endpoints = input.read_string()?;
        let run_mode = input.read_str()?;
        let _invalid = input.read_bool()?;
        debug!(session_id, version, %run_mode, ?target_endpoints, "session initialized");
        Ok(Self {
            conn,
            session_id,
            version,
            auto_commit,
            fetch_size: options.fetch_size,
            server_cached_objects: options.server_cached_objects,
        })
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.conn
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Auto-commit state reported by `SESSION_INIT`.
    pub fn initial_auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Send a raw request on this session without waiting for the response.
    pub fn start(&self, opcode: Opcode, build: impl FnOnce(&mut PacketWriter)) -> Result<PendingResponse> {
        self.conn.start(opcode, self.session_id, build)
    }

    async fn request(&self, opcode: Opcode, build: impl FnOnce(&mut PacketWriter)) -> Result<PacketReader> {
        self.conn.request(opcode, self.session_id, build).await
    }

    fn send(&self, opcode: Opcode, build: impl FnOnce(&mut PacketWriter)) -> Result<i32> {
        self.conn.send(opcode, self.session_id, build)
    }

    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.request(Opcode::SessionSetAutoCommit, |out| {
            out.write_bool(auto_commit);
        })
        .await?;
        Ok(())
    }

    pub fn cancel_statement(&self, statement_id: i32) -> Result<()> {
        self.send(Opcode::SessionCancelStatement, |out| {
            out.write_i32(statement_id);
        })?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.send(Opcode::SessionClose, |_| {})?;
        Ok(())
    }

    async fn prepare_with(&self, opcode: Opcode, sql: &str) -> Result<ClientStatement> {
        let pending = self.start(opcode, |out| {
            out.write_str(sql);
        })?;
        let id = pending.packet_id();
        let mut input = pending.wait().await?;
        let is_query = input.read_bool()?;
        let mut parameters = Vec::new();
        if opcode == Opcode::CommandPrepareReadParams {
            let count = input.read_count()?;
            for _ in 0..count {
                parameters.push(ParameterInfo {
                    value_type: input.read_i32()?,
                    precision: input.read_i64()?,
                    scale: input.read_i32()?,
                    nullable: input.read_i32()?,
                });
            }
        }
        Ok(ClientStatement {
            id,
            is_query,
            parameters,
        })
    }

    pub async fn prepare(&self, sql: &str) -> Result<ClientStatement> {
        self.prepare_with(Opcode::CommandPrepare, sql).await
    }

    pub async fn prepare_read_params(&self, sql: &str) -> Result<ClientStatement> {
        self.prepare_with(Opcode::CommandPrepareReadParams, sql).await
    }

    pub fn close_statement(&self, statement_id: i32) -> Result<()> {
        self.send(Opcode::CommandClose, |out| {
            out.write_i32(statement_id);
        })?;
        Ok(())
    }

    pub async fn get_meta_data(&self, statement_id: i32) -> Result<Vec<ClientColumn>> {
        let object_id = self.conn.next_id();
        let mut input = self
            .request(Opcode::CommandGetMetaData, |out| {
                out.write_i32(statement_id).write_i32(object_id);
            })
            .await?;
        let column_count = input.read_count()?;
        let _row_count = input.read_i32()?;
        read_columns(&mut input, column_count)
    }

    async fn query_with(&self, opcode: Opcode, source: Source<'_>, max_rows: i32) -> Result<ClientResult> {
        let result_id = self.conn.next_id();
        let fetch_size = self.fetch_size;
        let mut input = self
            .request(opcode, |out| {
                out.write_i32(result_id)
                    .write_i32(max_rows)
                    .write_i32(fetch_size)
                    .write_bool(false);
                source.write(out);
                out.write_page_keys(None);
            })
            .await?;
        let local_names = if opcode.is_distributed() {
            Some(input.read_str()?)
        } else {
            None
        };
        ClientResult::read(
            self.conn.clone(),
            self.session_id,
            result_id,
            fetch_size,
            self.server_cached_objects,
            local_names,
            &mut input,
        )
    }

    pub async fn query(&self, sql: &str) -> Result<ClientResult> {
        self.query_with(Opcode::CommandQuery, Source::Sql(sql), 0).await
    }

    pub async fn query_limited(&self, sql: &str, max_rows: i32) -> Result<ClientResult> {
        self.query_with(Opcode::CommandQuery, Source::Sql(sql), max_rows).await
    }

    pub async fn prepared_query(&self, statement_id: i32, params: &[Value]) -> Result<ClientResult> {
        self.query_with(Opcode::CommandPreparedQuery, Source::Prepared(statement_id, params), 0)
            .await
    }

    pub async fn dt_query(&self, sql: &str) -> Result<ClientResult> {
        self.query_with(Opcode::CommandDistributedTransactionQuery, Source::Sql(sql), 0)
            .await
    }

    pub async fn dt_prepared_query(&self, statement_id: i32, params: &[Value]) -> Result<ClientResult> {
        self.query_with(
            Opcode::CommandDistributedTransactionPreparedQuery,
            Source::Prepared(statement_id, params),
            0,
        )
        .await
    }

    async fn update_with(
        &self,
        opcode: Opcode,
        replication_name: Option<&str>,
        source: Source<'_>,
    ) -> Result<UpdateResult> {
        let mut input = self
            .request(opcode, |out| {
                if let Some(name) = replication_name {
                    out.write_str(name);
                }
                source.write(out);
                out.write_page_keys(None);
            })
            .await?;
        let local_names = if opcode.is_distributed() {
            Some(input.read_str()?)
        } else {
            None
        };
        Ok(UpdateResult {
            local_names,
            update_count: input.read_i32()?,
            last_row_key: input.read_i64()?,
        })
    }

    pub async fn update(&self, sql: &str) -> Result<UpdateResult> {
        self.update_with(Opcode::CommandUpdate, None, Source::Sql(sql)).await
    }

    pub async fn prepared_update(&self, statement_id: i32, params: &[Value]) -> Result<UpdateResult> {
        self.update_with(
            Opcode::CommandPreparedUpdate,
            None,
            Source::Prepared(statement_id, params),
        )
        .await
    }

    pub async fn dt_update(&self, sql: &str) -> Result<UpdateResult> {
        self.update_with(Opcode::CommandDistributedTransactionUpdate, None, Source::Sql(sql))
            .await
    }

    pub async fn dt_prepared_update(&self, statement_id: i32, params: &[Value]) -> Result<UpdateResult> {
        self.update_with(
            Opcode::CommandDistributedTransactionPreparedUpdate,
            None,
            Source::Prepared(statement_id, params),
        )
        .await
    }

    pub async fn replication_update(&self, replication_name: &str, sql: &str) -> Result<UpdateResult> {
        self.update_with(
            Opcode::CommandReplicationUpdate,
            Some(replication_name),
            Source::Sql(sql),
        )
        .await
    }

    pub async fn replication_prepared_update(
        &self,
        replication_name: &str,
        statement_id: i32,
        params: &[Value],
    ) -> Result<UpdateResult> {
        self.update_with(
            Opcode::CommandReplicationPreparedUpdate,
            Some(replication_name),
            Source::Prepared(statement_id, params),
        )
        .await
    }

    /// Commit with every participant's local names. No response is sent.
    pub fn dt_commit(&self, all_local_names: &str) -> Result<()> {
        self.send(Opcode::CommandDistributedTransactionCommit, |out| {
            out.write_str(all_local_names);
        })?;
        Ok(())
    }

    pub fn dt_rollback(&self) -> Result<()> {
        self.send(Opcode::CommandDistributedTransactionRollback, |_| {})?;
        Ok(())
    }

    pub fn dt_add_savepoint(&self, name: &str) -> Result<()> {
        self.send(Opcode::CommandDistributedTransactionAddSavepoint, |out| {
            out.write_str(name);
        })?;
        Ok(())
    }

    pub fn dt_rollback_savepoint(&self, name: &str) -> Result<()> {
        self.send(Opcode::CommandDistributedTransactionRollbackSavepoint, |out| {
            out.write_str(name);
        })?;
        Ok(())
    }

    /// Ask the node whether its local transaction `name` is committed or committing.
    pub async fn dt_validate(&self, local_name: &str) -> Result<bool> {
        let mut input = self
            .request(Opcode::CommandDistributedTransactionValidate, |out| {
                out.write_str(local_name);
            })
            .await?;
        Ok(input.read_bool()?)
    }

    pub fn replication_commit(&self, valid_key: i64, auto_commit: bool) -> Result<()> {
        self.send(Opcode::CommandReplicationCommit, |out| {
            out.write_i64(valid_key).write_bool(auto_commit);
        })?;
        Ok(())
    }

    pub fn replication_rollback(&self) -> Result<()> {
        self.send(Opcode::CommandReplicationRollback, |_| {})?;
        Ok(())
    }

    async fn storage_request(&self, opcode: Opcode, build: impl FnOnce(&mut PacketWriter)) -> Result<(Option<String>, PacketReader)> {
        let mut input = self.request(opcode, build).await?;
        let local_names = if opcode.is_distributed() {
            Some(input.read_str()?)
        } else {
            None
        };
        Ok((local_names, input))
    }

    fn write_put(out: &mut PacketWriter, map: &str, key: &[u8], value: &[u8], replication_name: Option<&str>) {
        out.write_str(map)
            .write_bytes(Some(key))
            .write_bytes(Some(value))
            .write_string(replication_name)
            .write_bool(false);
    }

    pub async fn storage_get(&self, map: &str, key: &[u8]) -> Result<Option<Bytes>> {
        let (_, mut input) = self
            .storage_request(Opcode::CommandStorageGet, |out| {
                out.write_str(map).write_bytes(Some(key));
            })
            .await?;
        Ok(input.read_bytes()?)
    }

    /// Returns the value the put replaced.
    pub async fn storage_put(&self, map: &str, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        let (_, mut input) = self
            .storage_request(Opcode::CommandStoragePut, |out| {
                Self::write_put(out, map, key, value, None);
            })
            .await?;
        Ok(input.read_bytes()?)
    }

    pub async fn storage_replication_put(
        &self,
        map: &str,
        key: &[u8],
        value: &[u8],
        replication_name: &str,
    ) -> Result<Option<Bytes>> {
        let (_, mut input) = self
            .storage_request(Opcode::CommandStorageReplicationPut, |out| {
                Self::write_put(out, map, key, value, Some(replication_name));
            })
            .await?;
        Ok(input.read_bytes()?)
    }

    /// Returns the key allocated for the value.
    pub async fn storage_append(&self, map: &str, value: &[u8]) -> Result<i64> {
        let (_, mut input) = self
            .storage_request(Opcode::CommandStorageAppend, |out| {
                out.write_str(map).write_bytes(Some(value)).write_string(None);
            })
            .await?;
        Ok(input.read_i64()?)
    }

    pub async fn dt_storage_get(&self, map: &str, key: &[u8]) -> Result<Distributed<Option<Bytes>>> {
        let (names, mut input) = self
            .storage_request(Opcode::CommandStorageDistributedTransactionGet, |out| {
                out.write_str(map).write_bytes(Some(key));
            })
            .await?;
        Ok(Distributed {
            local_names: names.unwrap_or_default(),
            value: input.read_bytes()?,
        })
    }

    pub async fn dt_storage_put(&self, map: &str, key: &[u8], value: &[u8]) -> Result<Distributed<Option<Bytes>>> {
        let (names, mut input) = self
            .storage_request(Opcode::CommandStorageDistributedTransactionPut, |out| {
                Self::write_put(out, map, key, value, None);
            })
            .await?;
        Ok(Distributed {
            local_names: names.unwrap_or_default(),
            value: input.read_bytes()?,
        })
    }

    pub async fn dt_storage_append(&self, map: &str, value: &[u8]) -> Result<Distributed<i64>> {
        let (names, mut input) = self
            .storage_request(Opcode::CommandStorageDistributedTransactionAppend, |out| {
                out.write_str(map).write_bytes(Some(value)).write_string(None);
            })
            .await?;
        Ok(Distributed {
            local_names: names.unwrap_or_default(),
            value: input.read_i64()?,
        })
    }

    /// Propose a leaf page move; returns the plan the node settled on.
    pub async fn prepare_move_leaf_page(&self, map: &str, plan: &LeafPageMovePlan) -> Result<LeafPageMovePlan> {
        let mut input = self
            .request(Opcode::CommandStoragePrepareMoveLeafPage, |out| {
                out.write_str(map);
                plan.serialize(out);
            })
            .await?;
        Ok(LeafPageMovePlan::deserialize(&mut input)?)
    }

    pub fn move_leaf_page(&self, map: &str, page_key: &PageKey, page: &[u8], add_page: bool) -> Result<()> {
        self.send(Opcode::CommandStorageMoveLeafPage, |out| {
            out.write_str(map)
                .write_page_key(page_key)
                .write_bytes(Some(page))
                .write_bool(add_page);
        })?;
        Ok(())
    }

    pub fn replicate_root_pages(&self, db_name: &str, bundle: &[u8]) -> Result<()> {
        self.send(Opcode::CommandStorageReplicateRootPages, |out| {
            out.write_str(db_name).write_bytes(Some(bundle));
        })?;
        Ok(())
    }

    pub async fn read_page(&self, map: &str, page_key: &PageKey) -> Result<Bytes> {
        let mut input = self
            .request(Opcode::CommandStorageReadPage, |out| {
                out.write_str(map).write_page_key(page_key);
            })
            .await?;
        Ok(input.read_bytes()?.unwrap_or_default())
    }

    pub async fn remove_leaf_page(&self, map: &str, page_key: &PageKey) -> Result<()> {
        self.request(Opcode::CommandStorageRemoveLeafPage, |out| {
            out.write_str(map).write_page_key(page_key);
        })
        .await?;
        Ok(())
    }

    fn read_counts(input: &mut PacketReader) -> Result<Vec<i32>> {
        let count = input.read_count()?;
        let mut counts = Vec::with_capacity(input.capacity_hint(count));
        for _ in 0..count {
            counts.push(input.read_i32()?);
        }
        Ok(counts)
    }

    /// Per-statement update counts; failed entries report `EXECUTE_FAILED`.
    pub async fn batch_update(&self, statements: &[&str]) -> Result<Vec<i32>> {
        let mut input = self
            .request(Opcode::CommandBatchStatementUpdate, |out| {
                out.write_i32(statements.len() as i32);
                for sql in statements {
                    out.write_str(sql);
                }
            })
            .await?;
        Self::read_counts(&mut input)
    }

    pub async fn batch_prepared_update(&self, statement_id: i32, rows: &[Vec<Value>]) -> Result<Vec<i32>> {
        let mut input = self
            .request(Opcode::CommandBatchStatementPreparedUpdate, |out| {
                out.write_i32(statement_id).write_i32(rows.len() as i32);
                for row in rows {
                    out.write_values(row);
                }
            })
            .await?;
        Self::read_counts(&mut input)
    }

    pub async fn read_lob(&self, lob_id: i64, hmac: &[u8], offset: i64, length: i32) -> Result<Bytes> {
        let mut input = self
            .request(Opcode::CommandReadLob, |out| {
                out.write_i64(lob_id)
                    .write_bytes(Some(hmac))
                    .write_i64(offset)
                    .write_i32(length);
            })
            .await?;
        Ok(input.read_bytes()?.unwrap_or_default())
    }
}
