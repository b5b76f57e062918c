use std::collections::VecDeque;
use std::sync::Arc;

use shoal_protocol::{Opcode, PacketReader, Value};
use tracing::debug;

use crate::connection::ClientConnection;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientColumn {
    pub alias: String,
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub value_type: i32,
    pub precision: i64,
    pub scale: i32,
    pub display_size: i32,
    pub auto_increment: bool,
    pub nullable: i32,
}

pub(crate) fn read_columns(input: &mut PacketReader, count: usize) -> Result<Vec<ClientColumn>> {
    let mut columns = Vec::with_capacity(input.capacity_hint(count));
    for _ in 0..count {
        columns.push(ClientColumn {
            alias: input.read_str()?,
            schema_name: input.read_str()?,
            table_name: input.read_str()?,
            column_name: input.read_str()?,
            value_type: input.read_i32()?,
            precision: input.read_i64()?,
            scale: input.read_i32()?,
            display_size: input.read_i32()?,
            auto_increment: input.read_bool()?,
            nullable: input.read_i32()?,
        });
    }
    Ok(columns)
}

fn read_rows(input: &mut PacketReader, column_count: usize, into: &mut VecDeque<Vec<Value>>) -> Result<usize> {
    let mut read = 0;
    while input.read_bool()? {
        let mut row = Vec::with_capacity(input.capacity_hint(column_count));
        for _ in 0..column_count {
            row.push(input.read_value()?);
        }
        into.push_back(row);
        read += 1;
    }
    Ok(read)
}

/// A server-side result fetched in batches of `fetch_size` rows.
pub struct ClientResult {
    conn: Arc<ClientConnection>,
    session_id: i32,
    result_id: i32,
    local_names: Option<String>,
    columns: Vec<ClientColumn>,
    row_count: i32,
    fetch_size: i32,
    cached_objects: i32,
    fetched: i32,
    rows: VecDeque<Vec<Value>>,
}

impl ClientResult {
    /// Parse a query response: column count, row count, columns, first batch.
    pub(crate) fn read(
        conn: Arc<ClientConnection>,
        session_id: i32,
        result_id: i32,
        fetch_size: i32,
        cached_objects: i32,
        local_names: Option<String>,
        input: &mut PacketReader,
    ) -> Result<Self> {
        let column_count = input.read_count()?;
        let row_count = input.read_i32()?;
        let columns = read_columns(input, column_count)?;
        let mut rows = VecDeque::new();
        let fetched = read_rows(input, column_count, &mut rows)? as i32;
        Ok(Self {
            conn,
            session_id,
            result_id,
            local_names,
            columns,
            row_count,
            fetch_size,
            cached_objects,
            fetched,
            rows,
        })
    }

    pub fn result_id(&self) -> i32 {
        self.result_id
    }

    pub fn columns(&self) -> &[ClientColumn] {
        &self.columns
    }

    pub fn row_count(&self) -> i32 {
        self.row_count
    }

    /// Local transaction names returned by distributed queries.
    pub fn local_names(&self) -> Option<&str> {
        self.local_names.as_deref()
    }

    pub async fn next(&mut self) -> Result<Option<Vec<Value>>> {
        if self.rows.is_empty() && self.fetched < self.row_count {
            self.fetch().await?;
        }
        Ok(self.rows.pop_front())
    }

    /// Drain every remaining row.
    pub async fn collect(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut all = Vec::new();
        while let Some(row) = self.next().await? {
            all.push(row);
        }
        Ok(all)
    }

    async fn fetch(&mut self) -> Result<()> {
        self.remap_if_old()?;
        let result_id = self.result_id;
        let count = self.fetch_size;
        let mut input = self
            .conn
            .request(Opcode::ResultFetchRows, self.session_id, |out| {
                out.write_i32(result_id).write_i32(count);
            })
            .await?;
        let read = read_rows(&mut input, self.columns.len(), &mut self.rows)?;
        self.fetched += read as i32;
        if read == 0 {
            self.fetched = self.row_count;
        }
        Ok(())
    }

    /// Renumber the result once its id falls half a cache behind the newest id,
    /// so the server's LRU keeps it.
    pub fn remap_if_old(&mut self) -> Result<bool> {
        let current = self.conn.current_id();
        if self.result_id > current - self.cached_objects / 2 {
            return Ok(false);
        }
        let new_id = self.conn.next_id();
        let old_id = self.result_id;
        self.conn.send(Opcode::ResultChangeId, self.session_id, |out| {
            out.write_i32(old_id).write_i32(new_id);
        })?;
        debug!(old_id, new_id, "remapped result id");
        self.result_id = new_id;
        Ok(true)
    }

    /// Rewind to the first row.
    pub fn reset(&mut self) -> Result<()> {
        let result_id = self.result_id;
        self.conn.send(Opcode::ResultReset, self.session_id, |out| {
            out.write_i32(result_id);
        })?;
        self.rows.clear();
        self.fetched = 0;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let result_id = self.result_id;
        self.conn.send(Opcode::ResultClose, self.session_id, |out| {
            out.write_i32(result_id);
        })?;
        Ok(())
    }
}
