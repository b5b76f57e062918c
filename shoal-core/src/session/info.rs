//! Scheduler-facing wrapper around a session.
//!
//! `SessionInfo` pairs a `Session` with its FIFO command queue and the id of
//! the scheduler that owns it. The scheduler id never changes after bind.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::command::{CommandQueue, CommandState, PreparedCommand};
use crate::net::ConnectionContext;
use crate::scheduler::Priority;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Nothing queued.
    Idle,
    /// The head command finished.
    Progress,
    /// The head command yielded and stays at the head.
    Pending,
    /// The session waits for a validation outcome; a transaction listener
    /// wakes the scheduler when it arrives.
    Waiting,
}

/// Packet ids queued or running on a session, and the ones cancelled among them.
#[derive(Default)]
struct Requests {
    in_flight: HashSet<i32>,
    cancelled: HashSet<i32>,
}

pub struct SessionInfo {
    key: u64,
    client_session_id: i32,
    scheduler_id: usize,
    session: Mutex<Session>,
    queue: Mutex<CommandQueue>,
    last_touched: Mutex<Instant>,
    timeout: Duration,
    connection: Weak<ConnectionContext>,
    closed: AtomicBool,
    requests: Mutex<Requests>,
    _permit: Option<OwnedSemaphorePermit>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionInfo {
    pub fn new(
        client_session_id: i32,
        scheduler_id: usize,
        session: Session,
        timeout: Duration,
        connection: Weak<ConnectionContext>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            key: session.key(),
            client_session_id,
            scheduler_id,
            session: Mutex::new(session),
            queue: Mutex::new(CommandQueue::new()),
            last_touched: Mutex::new(Instant::now()),
            timeout,
            connection,
            closed: AtomicBool::new(false),
            requests: Mutex::new(Requests::default()),
            _permit: permit,
        }
    }

    /// Node-wide session key.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn client_session_id(&self) -> i32 {
        self.client_session_id
    }

    pub fn scheduler_id(&self) -> usize {
        self.scheduler_id
    }

    pub fn connection(&self) -> Option<Arc<ConnectionContext>> {
        self.connection.upgrade()
    }

    pub fn session(&self) -> MutexGuard<'_, Session> {
        guard(&self.session)
    }

    pub fn touch(&self) {
        *guard(&self.last_touched) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        guard(&self.last_touched).elapsed()
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(*guard(&self.last_touched)) > self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns false if the session was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn enqueue(&self, command: PreparedCommand) {
        guard(&self.queue).push_back(command);
    }

    pub fn queue_len(&self) -> usize {
        guard(&self.queue).len()
    }

    pub fn has_work(&self) -> bool {
        !self.is_closed() && !guard(&self.queue).is_empty()
    }

    pub fn head_priority(&self) -> Option<Priority> {
        guard(&self.queue).head_priority()
    }

    /// Track a request from dispatch until it completes.
    pub fn begin_request(&self, packet_id: i32) {
        guard(&self.requests).in_flight.insert(packet_id);
    }

    pub fn finish_request(&self, packet_id: i32) {
        let mut requests = guard(&self.requests);
        requests.in_flight.remove(&packet_id);
        requests.cancelled.remove(&packet_id);
    }

    /// Record a cancel for an in-flight request. Returns false for ids that
    /// finished already or were never sent on this session.
    pub fn mark_cancelled(&self, packet_id: i32) -> bool {
        let mut requests = guard(&self.requests);
        if !requests.in_flight.contains(&packet_id) {
            return false;
        }
        requests.cancelled.insert(packet_id)
    }

    pub fn take_cancelled(&self, packet_id: i32) -> bool {
        guard(&self.requests).cancelled.remove(&packet_id)
    }

    pub fn in_flight(&self) -> usize {
        guard(&self.requests).in_flight.len()
    }

    /// Run one slice of the head command.
    pub fn run_head_slice(self: &Arc<Self>) -> SliceOutcome {
        if self.is_closed() {
            return SliceOutcome::Idle;
        }
        let mut session = guard(&self.session);
        let Some(mut command) = guard(&self.queue).pop_front() else {
            return SliceOutcome::Idle;
        };
        if session.awaiting_validation() {
            guard(&self.queue).push_front(command);
            return SliceOutcome::Waiting;
        }
        let state = command.run_slice(self, &mut session);
        drop(session);
        match state {
            CommandState::Pending => {
                guard(&self.queue).push_front(command);
                SliceOutcome::Pending
            }
            _ => {
                self.finish_request(command.packet_id());
                self.touch();
                SliceOutcome::Progress
            }
        }
    }

    /// Close through the owning connection so caches and registry are cleaned too.
    pub fn close(self: &Arc<Self>) {
        match self.connection() {
            Some(conn) => conn.close_session(self),
            None => {
                self.mark_closed();
                self.shutdown();
            }
        }
    }

    /// Drop queued commands without responses, then roll back and close the session.
    pub(crate) fn shutdown(&self) {
        let dropped = guard(&self.queue).drain();
        if !dropped.is_empty() {
            debug!(session = self.key, dropped = dropped.len(), "dropped queued commands");
        }
        if let Err(err) = guard(&self.session).close() {
            warn!(session = self.key, error = %err, "session close failed");
        }
    }
}
