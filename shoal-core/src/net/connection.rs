//! One TCP connection: framing, the session registry and per-connection caches.
//!
//! The read half runs on the tokio runtime and hands every packet to
//! `handler::dispatch`, which routes it onto the owning session's scheduler.
//! Responses from any thread go through an unbounded channel to the writer task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use shoal_protocol::{PacketCodec, ProtocolError, PROTOCOL_VERSION_CURRENT};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::net::cache::ObjectCache;
use crate::net::{handler, response, Request};
use crate::session::{SessionInfo, SessionRegistry};
use crate::storage::lob::{LobCursorCache, LobStore};

pub struct ConnectionContext {
    id: u64,
    peer: SocketAddr,
    server: Arc<ServerContext>,
    sessions: SessionRegistry,
    version: AtomicI32,
    cache: Mutex<ObjectCache>,
    lob_cursors: Mutex<Option<LobCursorCache>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

impl ConnectionContext {
    /// Serve one accepted socket until the peer disconnects or sends garbage.
    pub async fn serve(server: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, PacketCodec);
        let mut sink = FramedWrite::new(write_half, PacketCodec);
        let (outbound, mut responses) = mpsc::unbounded_channel::<Bytes>();

        let conn = Arc::new(Self {
            id: server.next_connection_id(),
            peer,
            cache: Mutex::new(ObjectCache::new(server.config.server_cached_objects)),
            server: server.clone(),
            sessions: SessionRegistry::new(),
            version: AtomicI32::new(PROTOCOL_VERSION_CURRENT),
            lob_cursors: Mutex::new(None),
            outbound,
            closed: AtomicBool::new(false),
        });
        server.register_connection(&conn);
        info!(connection = conn.id, %peer, "connection opened");

        let writer = tokio::spawn(async move {
            while let Some(frame) = responses.recv().await {
                if let Err(err) = sink.send(frame).await {
                    debug!(%peer, error = %err, "write failed");
                    break;
                }
            }
        });

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    if !conn.on_packet(frame) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(connection = conn.id, %peer, error = %err, "read failed");
                    break;
                }
            }
        }

        let closing = conn.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || closing.close_all()).await {
            warn!(connection = conn.id, error = %err, "connection close task failed");
        }
        writer.abort();
        server.unregister_connection(conn.id);
        info!(connection = conn.id, %peer, "connection closed");
    }

    /// Returns false when the connection must be closed.
    pub fn on_packet(self: &Arc<Self>, frame: Bytes) -> bool {
        match Request::decode(frame, self.version()) {
            Ok(request) => {
                handler::dispatch(self, request);
                true
            }
            Err(ProtocolError::UnknownOpcode(code)) => {
                warn!(connection = self.id, code, "unknown opcode; closing connection");
                false
            }
            Err(err) => {
                warn!(connection = self.id, error = %err, "malformed packet; closing connection");
                false
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: i32) {
        self.version.store(version, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cache(&self) -> MutexGuard<'_, ObjectCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn send(&self, frame: Bytes) {
        if self.is_closed() {
            return;
        }
        if self.outbound.send(frame).is_err() {
            debug!(connection = self.id, "writer gone; response dropped");
        }
    }

    pub fn send_error(&self, packet_id: i32, err: &ServerError) {
        debug!(connection = self.id, packet_id, error = %err, "sending error response");
        self.send(response::error(self.version(), packet_id, err));
    }

    /// Read a LOB chunk through this connection's cursor cache, created on first use.
    pub fn read_lob(
        &self,
        store: &LobStore,
        id: i64,
        hmac: &[u8],
        offset: i64,
        length: i32,
    ) -> Result<Bytes, ServerError> {
        let mut cursors = self
            .lob_cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let capacity = self
            .server
            .config
            .server_cached_objects
            .max(5 * self.server.config.result_fetch_size.max(0) as usize);
        cursors
            .get_or_insert_with(|| LobCursorCache::new(capacity))
            .read(store, id, hmac, offset, length)
    }

    /// Close one session: drop its queue, roll back, evict its cached objects
    /// and unregister it. Must not be called while the session lock is held.
    #[instrument(skip_all, fields(connection = self.id, session = info.key()))]
    pub fn close_session(&self, info: &Arc<SessionInfo>) {
        if !info.mark_closed() {
            return;
        }
        info.shutdown();
        let evicted = self.cache().evict_session(info.key());
        self.sessions.remove(info);
        debug!(evicted, "session removed");
    }

    /// Close every session on this connection.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let sessions = self.sessions.drain();
        for info in &sessions {
            if info.mark_closed() {
                info.shutdown();
            }
            self.cache().evict_session(info.key());
        }
        if !sessions.is_empty() {
            info!(connection = self.id, sessions = sessions.len(), "closed connection sessions");
        }
    }
}
