use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use shoal_protocol::{Opcode, PacketCodec, PacketReader, PacketWriter, Status, PROTOCOL_VERSION_CURRENT};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::session::{ClientSession, SessionOptions};

type PendingMap = Mutex<HashMap<i32, oneshot::Sender<Bytes>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<i32, oneshot::Sender<Bytes>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A multiplexed connection to one server.
pub struct ClientConnection {
    addr: String,
    next_id: AtomicI32,
    next_session_id: AtomicI32,
    version: Arc<AtomicI32>,
    pending: Arc<PendingMap>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// A request whose response has not arrived yet.
pub struct PendingResponse {
    packet_id: i32,
    version: Arc<AtomicI32>,
    rx: oneshot::Receiver<Bytes>,
}

impl ClientConnection {
    pub async fn connect(addr: &str) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, PacketCodec);
        let mut sink = FramedWrite::new(write_half, PacketCodec);
        let (outbound, mut requests) = mpsc::unbounded_channel::<Bytes>();
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(frame) = requests.recv().await {
                if let Err(err) = sink.send(frame).await {
                    debug!(error = %err, "client write failed");
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) if frame.len() >= 4 => {
                        let packet_id = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                        match lock(&reader_pending).remove(&packet_id) {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => debug!(packet_id, "response for unknown packet"),
                        }
                    }
                    Ok(_) => warn!("short response frame"),
                    Err(err) => {
                        warn!(error = %err, "client read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            lock(&reader_pending).clear();
        });

        Ok(Arc::new(Self {
            addr: addr.to_string(),
            next_id: AtomicI32::new(1),
            next_session_id: AtomicI32::new(1),
            version: Arc::new(AtomicI32::new(PROTOCOL_VERSION_CURRENT)),
            pending,
            outbound,
            closed,
            reader,
            writer,
        }))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn set_version(&self, version: i32) {
        self.version.store(version, Ordering::Release);
    }

    /// Allocate an id. Packet ids and result ids share one counter.
    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The most recently allocated id.
    pub fn current_id(&self) -> i32 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    pub fn next_session_id(&self) -> i32 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn create_session(self: &Arc<Self>, options: SessionOptions) -> Result<ClientSession> {
        let session_id = self.next_session_id();
        ClientSession::init(self.clone(), session_id, options).await
    }

    /// Send a request and register for its response.
    pub fn start(
        &self,
        opcode: Opcode,
        session_id: i32,
        build: impl FnOnce(&mut PacketWriter),
    ) -> Result<PendingResponse> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let packet_id = self.next_id();
        let mut out = PacketWriter::request(self.version(), packet_id, opcode, session_id);
        build(&mut out);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(packet_id, tx);
        if self.outbound.send(out.finish()).is_err() {
            lock(&self.pending).remove(&packet_id);
            return Err(ClientError::Closed);
        }
        Ok(PendingResponse {
            packet_id,
            version: self.version.clone(),
            rx,
        })
    }

    /// Send a request the server never answers. Returns its packet id.
    pub fn send(&self, opcode: Opcode, session_id: i32, build: impl FnOnce(&mut PacketWriter)) -> Result<i32> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let packet_id = self.next_id();
        let mut out = PacketWriter::request(self.version(), packet_id, opcode, session_id);
        build(&mut out);
        self.outbound
            .send(out.finish())
            .map_err(|_| ClientError::Closed)?;
        Ok(packet_id)
    }

    pub async fn request(
        &self,
        opcode: Opcode,
        session_id: i32,
        build: impl FnOnce(&mut PacketWriter),
    ) -> Result<PacketReader> {
        self.start(opcode, session_id, build)?.wait().await
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
        lock(&self.pending).clear();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl PendingResponse {
    pub fn packet_id(&self) -> i32 {
        self.packet_id
    }

    /// Wait for the response and position the reader at its body.
    pub async fn wait(self) -> Result<PacketReader> {
        let frame = self.rx.await.map_err(|_| ClientError::Closed)?;
        parse_response(frame, self.version.load(Ordering::Acquire))
    }

    /// Like `wait`, but gives up after `timeout` and returns `None`.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<PacketReader>> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(frame)) => parse_response(frame, self.version.load(Ordering::Acquire)).map(Some),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Ok(None),
        }
    }
}

fn parse_response(frame: Bytes, version: i32) -> Result<PacketReader> {
    let mut reader = PacketReader::new(frame, version);
    reader.read_i32()?;
    let status = reader.read_i32()?;
    match Status::try_from(status)? {
        Status::Ok => Ok(reader),
        Status::Error => {
            let code = reader.read_i32()?;
            let state = reader.read_str()?;
            let message = reader.read_str()?;
            let kind = reader.read_str()?;
            Err(ClientError::Server {
                code,
                state,
                message,
                kind,
            })
        }
        other => Err(ClientError::UnexpectedStatus(other as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_responses_become_server_errors() -> anyhow::Result<()> {
        let mut out = PacketWriter::response(PROTOCOL_VERSION_CURRENT, 4, Status::Error);
        out.write_i32(90067)
            .write_str("90067")
            .write_str("session not found")
            .write_str("SessionNotFound")
            .write_str("");
        match parse_response(out.finish(), PROTOCOL_VERSION_CURRENT) {
            Err(ClientError::Server { code, message, .. }) => {
                assert_eq!(code, 90067);
                assert_eq!(message, "session not found");
            }
            other => anyhow::bail!("unexpected {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn ok_response_is_positioned_at_body() -> anyhow::Result<()> {
        let mut out = PacketWriter::response(PROTOCOL_VERSION_CURRENT, 4, Status::Ok);
        out.write_bool(true);
        let mut reader = parse_response(out.finish(), PROTOCOL_VERSION_CURRENT)?;
        assert!(reader.read_bool()?);
        Ok(())
    }
}
