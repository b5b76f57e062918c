//! Opcode dispatch.
//!
//! `dispatch` runs on the connection's read task and only routes: INIT goes to
//! a round-robin scheduler, cancel is applied in place, close and rollbacks run
//! as MAX priority tasks, and everything else is submitted to the session's
//! scheduler. There `submit_or_defer` either handles the request at once or,
//! when earlier commands are still queued, defers it behind them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use shoal_protocol::{
    negotiate_version, LeafPageMovePlan, Opcode, PacketReader, EXECUTE_FAILED,
    PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
use tracing::{debug, info, warn};

use crate::command::{
    CommandKind, PreparedCommand, StorageOp, StorageReply, YieldableStatement, YieldableStorage,
};
use crate::engine::{LocalResult, PreparedStatement};
use crate::error::ServerError;
use crate::metrics::OperationKind;
use crate::net::response::{self, LobSink};
use crate::net::{ConnectionContext, Request};
use crate::scheduler::{AsyncTask, Priority, SchedulerWaker};
use crate::session::{Registration, Session, SessionInfo};

pub enum Outcome {
    /// The request was answered (or needs no answer).
    Done,
    /// The request became a yieldable command that must be queued.
    Command(PreparedCommand),
}

/// Route a decoded request. Runs on the connection's read task.
pub fn dispatch(conn: &Arc<ConnectionContext>, request: Request) {
    if request.opcode == Opcode::SessionInit {
        init_session(conn, request);
        return;
    }
    let info = match conn.sessions().get(request.session_id) {
        Some(info) if !info.is_closed() => info,
        _ => {
            debug!(
                session_id = request.session_id,
                packet_id = request.packet_id,
                opcode = ?request.opcode,
                "session not found"
            );
            conn.send_error(request.packet_id, &ServerError::SessionNotFound);
            return;
        }
    };
    info.touch();
    if request.opcode == Opcode::SessionCancelStatement {
        cancel_statement(conn, &info, request);
    } else if request.bypasses_queue() {
        let scheduler_id = info.scheduler_id();
        let task_conn = conn.clone();
        conn.server().schedulers.submit(
            scheduler_id,
            AsyncTask::new(Priority::Max, move |_| run_bypass(&task_conn, &info, request)),
        );
    } else {
        info.begin_request(request.packet_id);
        let scheduler_id = info.scheduler_id();
        let task_conn = conn.clone();
        conn.server().schedulers.submit(
            scheduler_id,
            AsyncTask::new(Priority::Norm, move |_| submit_or_defer(&task_conn, &info, request)),
        );
    }
}

/// Handle a request now if nothing is queued ahead of it, otherwise queue it.
fn submit_or_defer(conn: &Arc<ConnectionContext>, info: &Arc<SessionInfo>, request: Request) {
    if info.is_closed() {
        return;
    }
    if info.queue_len() > 0 {
        info.enqueue(PreparedCommand::deferred(request));
        return;
    }
    let mut session = info.session();
    if session.awaiting_validation() {
        drop(session);
        info.enqueue(PreparedCommand::deferred(request));
        return;
    }
    let packet_id = request.packet_id;
    if info.take_cancelled(packet_id) {
        drop(session);
        info.finish_request(packet_id);
        report(conn, packet_id, request.opcode, &ServerError::Cancelled);
        return;
    }
    let outcome = handle(conn, &mut session, request);
    drop(session);
    match outcome {
        Outcome::Command(command) => info.enqueue(command),
        Outcome::Done => info.finish_request(packet_id),
    }
}

/// Close and rollbacks, run ahead of the session queue on its scheduler.
fn run_bypass(conn: &Arc<ConnectionContext>, info: &Arc<SessionInfo>, request: Request) {
    match request.opcode {
        Opcode::SessionClose => {
            debug!(session = info.key(), "session close requested");
            conn.close_session(info);
        }
        Opcode::CommandDistributedTransactionRollback | Opcode::CommandReplicationRollback => {
            if info.is_closed() {
                return;
            }
            let mut session = info.session();
            if let Err(err) = session.rollback() {
                warn!(session = info.key(), error = %err, "rollback failed");
            }
        }
        other => warn!(opcode = ?other, "not a bypass opcode"),
    }
}

fn cancel_statement(conn: &Arc<ConnectionContext>, info: &Arc<SessionInfo>, mut request: Request) {
    let statement_id = match request.payload.read_i32() {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "malformed cancel request");
            return;
        }
    };
    let queued = info.mark_cancelled(statement_id);
    {
        let mut cache = conn.cache();
        if let Some(statement) = cache.statement(statement_id) {
            statement.cancel();
            cache.remove(statement_id);
        }
    }
    debug!(session = info.key(), statement_id, queued, "statement cancelled");
    conn.server().schedulers.wakeup(info.scheduler_id());
}

fn report(conn: &ConnectionContext, packet_id: i32, opcode: Opcode, err: &ServerError) {
    if opcode.expects_response() {
        conn.send_error(packet_id, err);
    } else {
        warn!(packet_id, opcode = ?opcode, error = %err, "request without response failed");
    }
}

fn init_session(conn: &Arc<ConnectionContext>, request: Request) {
    let schedulers = conn.server().schedulers.clone();
    let scheduler_id = schedulers.next_round_robin();
    let task_conn = conn.clone();
    schedulers.submit(
        scheduler_id,
        AsyncTask::new(Priority::Max, move |_| {
            let packet_id = request.packet_id;
            if let Err(err) = create_session(&task_conn, request) {
                warn!(connection = task_conn.id(), error = %err, "session init failed");
                task_conn.send_error(packet_id, &err);
            }
        }),
    );
}

fn create_session(conn: &Arc<ConnectionContext>, mut request: Request) -> Result<(), ServerError> {
    let server = conn.server().clone();
    let input = &mut request.payload;
    let min_version = input.read_i32()?;
    let max_version = input.read_i32()?;
    let version =
        negotiate_version(min_version, max_version).ok_or(ServerError::ProtocolVersionMismatch {
            client: min_version,
            min: PROTOCOL_VERSION_MIN,
            max: PROTOCOL_VERSION_MAX,
        })?;
    conn.set_version(version);
    input.set_version(version);

    let db_name = input.read_str()?;
    let url = input.read_str()?;
    let user = input.read_str()?;
    let password = input.read_bytes()?.unwrap_or_default();
    let count = input.read_count()?;
    let mut properties = HashMap::with_capacity(input.capacity_hint(count));
    for _ in 0..count {
        let key = input.read_str()?;
        let value = input.read_string()?;
        properties.insert(key, value);
    }
    debug!(db = %db_name, %url, properties = properties.len(), "session init");
    if conn.is_closed() {
        debug!(connection = conn.id(), "connection closed before session init");
        return Ok(());
    }

    server.authenticator.authenticate(&user, &password[..])?;
    let permit = server.try_acquire_session()?;
    let key = server.next_session_key();
    let scheduler_id = server.schedulers.scheduler_for(key);
    let engine_connection = server.engine.connect()?;
    let mut session = Session::new(
        key,
        user.clone(),
        engine_connection,
        server.coordinator.clone(),
        server.storage.clone(),
        server.lobs.clone(),
    );
    session.add_transaction_listener(Arc::new(SchedulerWaker::new(&server.schedulers, scheduler_id)));
    let auto_commit = session.auto_commit();

    let info = Arc::new(SessionInfo::new(
        request.session_id,
        scheduler_id,
        session,
        server.config.session_timeout(),
        Arc::downgrade(conn),
        Some(permit),
    ));
    match conn.sessions().insert(info.clone()) {
        Registration::Added => {}
        Registration::Replaced(replaced) => {
            warn!(session_id = request.session_id, "session id reused; closing previous session");
            conn.close_session(&replaced);
        }
        Registration::Rejected => {
            debug!(connection = conn.id(), session = key, "connection closed during session init");
            info.mark_closed();
            info.shutdown();
            return Ok(());
        }
    }
    let bound = info.clone();
    server
        .schedulers
        .submit(scheduler_id, AsyncTask::new(Priority::Max, move |ctx| ctx.bind(bound)));

    let mut out = response::ok(version, request.packet_id);
    out.write_i32(version)
        .write_bool(auto_commit)
        .write_string(None)
        .write_str("CLIENT_SERVER")
        .write_bool(false);
    conn.send(out.finish());
    info!(
        connection = conn.id(),
        session_id = request.session_id,
        session = key,
        scheduler = scheduler_id,
        user = %user,
        version,
        "session created"
    );
    Ok(())
}

/// Handle one request for a session. Called with the session locked, either
/// straight from the scheduler task or when a deferred command reaches the head.
pub fn handle(
    conn: &Arc<ConnectionContext>,
    session: &mut Session,
    mut request: Request,
) -> Outcome {
    request.payload.set_version(conn.version());
    let packet_id = request.packet_id;
    let opcode = request.opcode;
    if opcode.is_distributed() {
        session.enter_distributed();
    }
    match handle_opcode(conn, session, &mut request) {
        Ok(outcome) => outcome,
        Err(err) => {
            report(conn, packet_id, opcode, &err);
            Outcome::Done
        }
    }
}

fn handle_opcode(
    conn: &Arc<ConnectionContext>,
    session: &mut Session,
    request: &mut Request,
) -> Result<Outcome, ServerError> {
    let packet_id = request.packet_id;
    let opcode = request.opcode;
    let version = conn.version();
    let input = &mut request.payload;
    match opcode {
        Opcode::SessionSetAutoCommit => {
            session.set_auto_commit(input.read_bool()?)?;
            conn.send(response::ok_empty(version, packet_id));
        }
        Opcode::CommandPrepare | Opcode::CommandPrepareReadParams => {
            let sql = input.read_str()?;
            let statement = session.prepare(&sql, conn.server().config.result_fetch_size)?;
            let mut out = response::ok(version, packet_id);
            out.write_bool(statement.is_query());
            if opcode == Opcode::CommandPrepareReadParams {
                let parameters = statement.parameters();
                out.write_i32(parameters.len() as i32);
                for parameter in &parameters {
                    out.write_i32(parameter.value_type)
                        .write_i64(parameter.precision)
                        .write_i32(parameter.scale)
                        .write_i32(parameter.nullable);
                }
            }
            conn.cache().put_statement(packet_id, session.key(), statement);
            conn.send(out.finish());
        }
        Opcode::CommandClose => {
            let statement_id = input.read_i32()?;
            conn.cache().remove(statement_id);
        }
        Opcode::CommandGetMetaData => {
            let statement_id = input.read_i32()?;
            let object_id = input.read_i32()?;
            let statement = cached_statement(conn, statement_id)?;
            let result = LocalResult::new(statement.metadata()?, Vec::new(), false);
            let mut out = response::ok(version, packet_id);
            response::write_result_header(&mut out, &result);
            conn.cache().put_result(object_id, session.key(), result);
            conn.send(out.finish());
        }

        Opcode::CommandQuery
        | Opcode::CommandPreparedQuery
        | Opcode::CommandDistributedTransactionQuery
        | Opcode::CommandDistributedTransactionPreparedQuery => {
            return query(conn, session, packet_id, opcode, input).map(Outcome::Command);
        }
        Opcode::CommandUpdate
        | Opcode::CommandPreparedUpdate
        | Opcode::CommandDistributedTransactionUpdate
        | Opcode::CommandDistributedTransactionPreparedUpdate
        | Opcode::CommandReplicationUpdate
        | Opcode::CommandReplicationPreparedUpdate => {
            return update(conn, session, packet_id, opcode, input).map(Outcome::Command);
        }

        Opcode::CommandDistributedTransactionCommit => {
            let names = input.read_string()?.unwrap_or_default();
            session.commit_distributed(&names)?;
        }
        Opcode::CommandDistributedTransactionRollback | Opcode::CommandReplicationRollback => {
            session.rollback()?;
        }
        Opcode::CommandDistributedTransactionAddSavepoint => {
            session.add_savepoint(&input.read_str()?)?;
        }
        Opcode::CommandDistributedTransactionRollbackSavepoint => {
            session.rollback_to_savepoint(&input.read_str()?)?;
        }
        Opcode::CommandDistributedTransactionValidate => {
            let name = input.read_str()?;
            let valid = session.coordinator().validate(&name)?;
            debug!(%name, valid, "validated local transaction");
            let mut out = response::ok(version, packet_id);
            out.write_bool(valid);
            conn.send(out.finish());
        }
        Opcode::CommandReplicationCommit => {
            let valid_key = input.read_i64()?;
            let auto_commit = input.read_bool()?;
            session.replication_commit(valid_key, auto_commit)?;
        }

        Opcode::CommandStorageGet
        | Opcode::CommandStoragePut
        | Opcode::CommandStorageAppend
        | Opcode::CommandStorageReplicationPut
        | Opcode::CommandStorageDistributedTransactionGet
        | Opcode::CommandStorageDistributedTransactionPut
        | Opcode::CommandStorageDistributedTransactionAppend => {
            return storage(conn, session, packet_id, opcode, input).map(Outcome::Command);
        }
        Opcode::CommandStoragePrepareMoveLeafPage => {
            let map = input.read_str()?;
            let plan = LeafPageMovePlan::deserialize(input)?;
            let winner = session.storage().map(&map).prepare_move_leaf_page(plan)?;
            let mut out = response::ok(version, packet_id);
            winner.serialize(&mut out);
            conn.send(out.finish());
        }
        Opcode::CommandStorageMoveLeafPage => {
            let map = session.storage().map(&input.read_str()?);
            let page_key = input.read_page_key()?;
            let page = input.read_bytes()?.unwrap_or_default();
            let add_page = input.read_bool()?;
            conn.server().runtime.spawn_blocking(move || {
                if let Err(err) = map.add_leaf_page(&page_key, page, add_page) {
                    warn!(map = map.name(), error = %err, "move leaf page failed");
                }
            });
        }
        Opcode::CommandStorageReplicateRootPages => {
            let db_name = input.read_str()?;
            let bundle = input.read_bytes()?.unwrap_or_default();
            let storage = session.storage().clone();
            conn.server().runtime.spawn_blocking(move || {
                if let Err(err) = storage.replicate_root_pages(&db_name, bundle) {
                    warn!(db = %db_name, error = %err, "replicate root pages failed");
                }
            });
        }
        Opcode::CommandStorageReadPage => {
            let map = input.read_str()?;
            let page_key = input.read_page_key()?;
            let page = session.storage().map(&map).read_page(&page_key)?;
            let mut out = response::ok(version, packet_id);
            out.write_bytes(Some(page.as_ref()));
            conn.send(out.finish());
        }
        Opcode::CommandStorageRemoveLeafPage => {
            let map = input.read_str()?;
            let page_key = input.read_page_key()?;
            let removed = session.storage().map(&map).remove_leaf_page(&page_key)?;
            debug!(%map, removed, "removed leaf page");
            conn.send(response::ok_empty(version, packet_id));
        }

        Opcode::CommandBatchStatementUpdate => {
            let count = input.read_count()?;
            let mut statements = Vec::with_capacity(input.capacity_hint(count));
            for _ in 0..count {
                statements.push(input.read_str()?);
            }
            let started = Instant::now();
            let _in_flight = conn.server().metrics.start(OperationKind::Update);
            let counts: Vec<i32> = statements
                .iter()
                .map(|sql| {
                    session
                        .prepare(sql, 0)
                        .and_then(|statement| execute_update(session, &statement))
                        .unwrap_or_else(|err| {
                            debug!(error = %err, "batch entry failed");
                            EXECUTE_FAILED
                        })
                })
                .collect();
            conn.server().metrics.record_success(
                OperationKind::Update,
                &statements.join("; "),
                started.elapsed(),
                Some(counts.len() as u64),
            );
            send_batch(conn, version, packet_id, &counts);
        }
        Opcode::CommandBatchStatementPreparedUpdate => {
            let statement_id = input.read_i32()?;
            let count = input.read_count()?;
            let mut rows = Vec::with_capacity(input.capacity_hint(count));
            for _ in 0..count {
                rows.push(input.read_values()?);
            }
            let statement = cached_statement(conn, statement_id)?;
            let started = Instant::now();
            let _in_flight = conn.server().metrics.start(OperationKind::Update);
            let counts: Vec<i32> = rows
                .into_iter()
                .map(|values| {
                    statement
                        .set_parameters(values)
                        .and_then(|()| execute_update(session, &statement))
                        .unwrap_or_else(|err| {
                            debug!(error = %err, "batch entry failed");
                            EXECUTE_FAILED
                        })
                })
                .collect();
            conn.server().metrics.record_success(
                OperationKind::Update,
                statement.sql(),
                started.elapsed(),
                Some(counts.len() as u64),
            );
            send_batch(conn, version, packet_id, &counts);
        }

        Opcode::CommandReadLob => {
            let lob_id = input.read_i64()?;
            let hmac = input.read_bytes()?.unwrap_or_default();
            let offset = input.read_i64()?;
            let length = input.read_i32()?;
            let chunk = conn.read_lob(session.lobs(), lob_id, &hmac, offset, length)?;
            let mut out = response::ok(version, packet_id);
            out.write_bytes(Some(chunk.as_ref()));
            conn.send(out.finish());
        }

        Opcode::ResultFetchRows => {
            let result_id = input.read_i32()?;
            let count = input.read_i32()?.max(0) as usize;
            let sink = LobSink {
                store: session.lobs(),
                owner: session.key(),
                inline_limit: conn.server().config.lob_inline_limit,
            };
            let mut out = response::ok(version, packet_id);
            {
                let mut cache = conn.cache();
                let result = cache
                    .result_mut(result_id)
                    .ok_or(ServerError::ObjectClosed(result_id))?;
                response::write_rows(&mut out, result, count, &sink);
            }
            conn.send(out.finish());
        }
        Opcode::ResultReset => {
            let result_id = input.read_i32()?;
            conn.cache()
                .result_mut(result_id)
                .ok_or(ServerError::ObjectClosed(result_id))?
                .reset();
        }
        Opcode::ResultChangeId => {
            let old_id = input.read_i32()?;
            let new_id = input.read_i32()?;
            if !conn.cache().change_id(old_id, new_id) {
                return Err(ServerError::ObjectClosed(old_id));
            }
        }
        Opcode::ResultClose => {
            let result_id = input.read_i32()?;
            conn.cache().remove(result_id);
        }

        Opcode::SessionInit | Opcode::SessionClose | Opcode::SessionCancelStatement => {
            return Err(ServerError::Internal(format!(
                "{opcode:?} must not reach the session queue"
            )));
        }
    }
    Ok(Outcome::Done)
}

fn cached_statement(
    conn: &ConnectionContext,
    statement_id: i32,
) -> Result<Arc<dyn PreparedStatement>, ServerError> {
    conn.cache()
        .statement(statement_id)
        .ok_or(ServerError::ObjectClosed(statement_id))
}

/// A statement for QUERY/UPDATE variants: prepared from SQL and cached under
/// the packet id, or looked up by id with fresh parameters. Returns the id to
/// evict on completion for one-shot statements.
fn resolve_statement(
    conn: &ConnectionContext,
    session: &Session,
    packet_id: i32,
    prepared: bool,
    fetch_size: i32,
    input: &mut PacketReader,
) -> Result<(Arc<dyn PreparedStatement>, Option<i32>), ServerError> {
    if prepared {
        let statement_id = input.read_i32()?;
        let values = input.read_values()?;
        let statement = cached_statement(conn, statement_id)?;
        statement.set_parameters(values)?;
        if fetch_size > 0 {
            statement.set_fetch_size(fetch_size);
        }
        return Ok((statement, None));
    }
    let sql = input.read_str()?;
    let fetch_size = if fetch_size > 0 {
        fetch_size
    } else {
        conn.server().config.result_fetch_size
    };
    let statement = session.prepare(&sql, fetch_size)?;
    conn.cache()
        .put_statement(packet_id, session.key(), statement.clone());
    Ok((statement, Some(packet_id)))
}

fn query(
    conn: &Arc<ConnectionContext>,
    session: &Session,
    packet_id: i32,
    opcode: Opcode,
    input: &mut PacketReader,
) -> Result<PreparedCommand, ServerError> {
    let result_id = input.read_i32()?;
    let max_rows = input.read_i32()?;
    let fetch_size = input.read_i32()?;
    let scrollable = input.read_bool()?;
    let prepared = matches!(
        opcode,
        Opcode::CommandPreparedQuery | Opcode::CommandDistributedTransactionPreparedQuery
    );
    let (statement, one_shot) =
        resolve_statement(conn, session, packet_id, prepared, fetch_size, input)?;
    input.read_page_keys()?;

    let fetch = if fetch_size > 0 {
        fetch_size
    } else {
        conn.server().config.result_fetch_size
    };
    let fetch = usize::try_from(fetch).unwrap_or(0);
    let inline_limit = conn.server().config.lob_inline_limit;
    let metrics = conn.server().metrics.clone();
    let in_flight = metrics.start(OperationKind::Query);
    let started = Instant::now();
    let sql = statement.sql().to_string();
    let weak = Arc::downgrade(conn);
    let yieldable = statement.create_yieldable_query(max_rows, scrollable);
    Ok(PreparedCommand::new(
        packet_id,
        CommandKind::Query,
        yieldable,
        move |session: &mut Session, result: Result<LocalResult, ServerError>| {
            let _in_flight = in_flight;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if let Some(id) = one_shot {
                conn.cache().remove(id);
            }
            match result {
                Ok(mut result) => {
                    let total = result.row_count();
                    let mut out = response::ok(conn.version(), packet_id);
                    if opcode.is_distributed() {
                        out.write_str(&session.local_names());
                    }
                    response::write_result_header(&mut out, &result);
                    let sink = LobSink {
                        store: session.lobs(),
                        owner: session.key(),
                        inline_limit,
                    };
                    response::write_rows(&mut out, &mut result, fetch, &sink);
                    conn.cache().put_result(result_id, session.key(), result);
                    conn.send(out.finish());
                    metrics.record_success(
                        OperationKind::Query,
                        &sql,
                        started.elapsed(),
                        Some(total.max(0) as u64),
                    );
                }
                Err(err) => {
                    metrics.record_error(OperationKind::Query, &sql, started.elapsed(), err.to_string());
                    conn.send_error(packet_id, &err);
                }
            }
        },
    ))
}

fn update(
    conn: &Arc<ConnectionContext>,
    session: &mut Session,
    packet_id: i32,
    opcode: Opcode,
    input: &mut PacketReader,
) -> Result<PreparedCommand, ServerError> {
    if matches!(
        opcode,
        Opcode::CommandReplicationUpdate | Opcode::CommandReplicationPreparedUpdate
    ) {
        let replication_name = input.read_str()?;
        session.enter_replication(replication_name);
    }
    let prepared = matches!(
        opcode,
        Opcode::CommandPreparedUpdate
            | Opcode::CommandDistributedTransactionPreparedUpdate
            | Opcode::CommandReplicationPreparedUpdate
    );
    let (statement, one_shot) =
        resolve_statement(conn, session, packet_id, prepared, 0, input)?;
    input.read_page_keys()?;

    let metrics = conn.server().metrics.clone();
    let in_flight = metrics.start(OperationKind::Update);
    let started = Instant::now();
    let sql = statement.sql().to_string();
    let weak = Arc::downgrade(conn);
    let yieldable = statement.create_yieldable_update();
    Ok(PreparedCommand::new(
        packet_id,
        CommandKind::Update,
        yieldable,
        move |session: &mut Session, result: Result<i32, ServerError>| {
            let _in_flight = in_flight;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if let Some(id) = one_shot {
                conn.cache().remove(id);
            }
            match result {
                Ok(update_count) => {
                    let mut out = response::ok(conn.version(), packet_id);
                    if opcode.is_distributed() {
                        out.write_str(&session.local_names());
                    }
                    out.write_i32(update_count).write_i64(session.last_row_key());
                    conn.send(out.finish());
                    metrics.record_success(
                        OperationKind::Update,
                        &sql,
                        started.elapsed(),
                        Some(update_count.max(0) as u64),
                    );
                }
                Err(err) => {
                    metrics.record_error(OperationKind::Update, &sql, started.elapsed(), err.to_string());
                    conn.send_error(packet_id, &err);
                }
            }
        },
    ))
}

fn storage(
    conn: &Arc<ConnectionContext>,
    session: &mut Session,
    packet_id: i32,
    opcode: Opcode,
    input: &mut PacketReader,
) -> Result<PreparedCommand, ServerError> {
    let map = input.read_str()?;
    let op = match opcode {
        Opcode::CommandStorageGet | Opcode::CommandStorageDistributedTransactionGet => {
            let key = input.read_bytes()?.unwrap_or_default();
            StorageOp::Get { map, key }
        }
        Opcode::CommandStorageAppend | Opcode::CommandStorageDistributedTransactionAppend => {
            let value = input.read_bytes()?.unwrap_or_default();
            let replication_name = input.read_string()?;
            if replication_name.is_some() {
                session.set_replication_name(replication_name);
            }
            StorageOp::Append { map, value }
        }
        _ => {
            let key = input.read_bytes()?.unwrap_or_default();
            let value = input.read_bytes()?.unwrap_or_default();
            let replication_name = input.read_string()?;
            let _raw = input.read_bool()?;
            if replication_name.is_some() {
                session.set_replication_name(replication_name);
            }
            StorageOp::Put { map, key, value }
        }
    };

    let metrics = conn.server().metrics.clone();
    let in_flight = metrics.start(OperationKind::Storage);
    let started = Instant::now();
    let text = format!("{opcode:?} {}", op.map());
    let weak: Weak<ConnectionContext> = Arc::downgrade(conn);
    let yieldable = YieldableStorage::new(op, conn.server().config.lock_timeout());
    Ok(PreparedCommand::new(
        packet_id,
        CommandKind::StorageOp(opcode),
        yieldable,
        move |session: &mut Session, result: Result<StorageReply, ServerError>| {
            let _in_flight = in_flight;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(reply) => {
                    let mut out = response::ok(conn.version(), packet_id);
                    if opcode.is_distributed() {
                        out.write_str(&session.local_names());
                    }
                    match reply {
                        StorageReply::Value(value) => {
                            out.write_bytes(value.as_deref());
                        }
                        StorageReply::Key(key) => {
                            out.write_i64(key);
                        }
                    }
                    conn.send(out.finish());
                    metrics.record_success(OperationKind::Storage, &text, started.elapsed(), None);
                }
                Err(err) => {
                    metrics.record_error(OperationKind::Storage, &text, started.elapsed(), err.to_string());
                    conn.send_error(packet_id, &err);
                }
            }
        },
    ))
}

/// Batch entries run synchronously; transaction control goes through the session.
fn execute_update(session: &mut Session, statement: &Arc<dyn PreparedStatement>) -> Result<i32, ServerError> {
    if let Some(control) = statement.transaction_control() {
        session.execute_transaction_control(&control)?;
        return Ok(0);
    }
    session.before_statement()?;
    statement.execute_update()
}

fn send_batch(conn: &ConnectionContext, version: i32, packet_id: i32, counts: &[i32]) {
    let mut out = response::ok(version, packet_id);
    out.write_i32(counts.len() as i32);
    for count in counts {
        out.write_i32(*count);
    }
    conn.send(out.finish());
}
