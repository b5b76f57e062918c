//! Cooperative scheduler pool.
//!
//! Each scheduler is a dedicated thread with a priority inbox of tasks and a
//! set of bound sessions. One loop iteration:
//! 1. runs every task in the inbox, highest priority first;
//! 2. gives each session with queued work exactly one slice, ordering ready
//!    sessions by head priority after a rotating start;
//! 3. closes sessions idle past their timeout;
//! 4. parks until a task arrives, briefly when a command is pending.
//!
//! Sessions waiting on a validation outcome do not shorten the park: the
//! `SchedulerWaker` on their transaction wakes the scheduler when it ends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::session::{SessionInfo, SliceOutcome};
use crate::transaction::{Transaction, TransactionListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Min = 0,
    Norm = 1,
    Max = 2,
}

type TaskFn = Box<dyn FnOnce(&mut WorkerContext) + Send>;

pub struct AsyncTask {
    priority: Priority,
    run: TaskFn,
}

impl AsyncTask {
    pub fn new(priority: Priority, run: impl FnOnce(&mut WorkerContext) + Send + 'static) -> Self {
        Self {
            priority,
            run: Box::new(run),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// State owned by one scheduler thread.
pub struct WorkerContext {
    id: usize,
    sessions: Vec<Arc<SessionInfo>>,
    rotation: usize,
}

impl WorkerContext {
    fn new(id: usize) -> Self {
        Self {
            id,
            sessions: Vec::new(),
            rotation: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Take ownership of a session's queue.
    pub fn bind(&mut self, info: Arc<SessionInfo>) {
        if !self.sessions.iter().any(|bound| Arc::ptr_eq(bound, &info)) {
            debug!(scheduler = self.id, session = info.key(), "bound session");
            self.sessions.push(info);
        }
    }

    pub fn bound_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Default)]
struct Inbox {
    tasks: [VecDeque<AsyncTask>; 3],
    notified: bool,
}

impl Inbox {
    fn take_all(&mut self) -> Vec<AsyncTask> {
        let mut drained = Vec::new();
        for queue in self.tasks.iter_mut().rev() {
            drained.extend(queue.drain(..));
        }
        drained
    }

    fn is_empty(&self) -> bool {
        self.tasks.iter().all(VecDeque::is_empty)
    }
}

#[derive(Default)]
struct WorkerStats {
    bound_sessions: AtomicUsize,
    queued_commands: AtomicUsize,
    tasks_run: AtomicU64,
    slices_run: AtomicU64,
    sessions_timed_out: AtomicU64,
}

struct Worker {
    id: usize,
    inbox: Mutex<Inbox>,
    wake: Condvar,
    stats: WorkerStats,
}

impl Worker {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.inbox().notified = true;
        self.wake.notify_one();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub id: usize,
    pub bound_sessions: usize,
    pub queued_commands: usize,
    pub tasks_run: u64,
    pub slices_run: u64,
    pub sessions_timed_out: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub count: usize,
    /// Park timeout while some command is pending.
    pub pending_poll: Duration,
    /// Park timeout when idle; also bounds how late a session timeout is noticed.
    pub idle_park: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            count: 4,
            pending_poll: Duration::from_millis(5),
            idle_park: Duration::from_secs(1),
        }
    }
}

pub struct SchedulerPool {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
    stopped: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerPool {
    pub fn start(options: SchedulerOptions) -> Result<Arc<Self>, ServerError> {
        let count = options.count.max(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let worker = Arc::new(Worker {
                id,
                inbox: Mutex::new(Inbox::default()),
                wake: Condvar::new(),
                stats: WorkerStats::default(),
            });
            let thread_worker = worker.clone();
            let thread_stopped = stopped.clone();
            let thread_options = options.clone();
            let handle = std::thread::Builder::new()
                .name(format!("scheduler-{id}"))
                .spawn(move || run_loop(thread_worker, thread_stopped, thread_options))?;
            workers.push(worker);
            handles.push(handle);
        }
        info!(count, "scheduler pool started");
        Ok(Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
            stopped,
            handles: Mutex::new(handles),
        }))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Round-robin pick, used for session creation before a session has a home.
    pub fn next_round_robin(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// The scheduler a session key is bound to for its lifetime.
    pub fn scheduler_for(&self, session_key: u64) -> usize {
        (session_key % self.workers.len() as u64) as usize
    }

    pub fn submit(&self, scheduler_id: usize, task: AsyncTask) {
        let Some(worker) = self.workers.get(scheduler_id % self.workers.len().max(1)) else {
            return;
        };
        {
            let mut inbox = worker.inbox();
            inbox.tasks[task.priority as usize].push_back(task);
            inbox.notified = true;
        }
        worker.wake.notify_one();
    }

    pub fn wakeup(&self, scheduler_id: usize) {
        if let Some(worker) = self.workers.get(scheduler_id) {
            worker.notify();
        }
    }

    pub fn snapshot(&self) -> Vec<SchedulerSnapshot> {
        self.workers
            .iter()
            .map(|worker| SchedulerSnapshot {
                id: worker.id,
                bound_sessions: worker.stats.bound_sessions.load(Ordering::Relaxed),
                queued_commands: worker.stats.queued_commands.load(Ordering::Relaxed),
                tasks_run: worker.stats.tasks_run.load(Ordering::Relaxed),
                slices_run: worker.stats.slices_run.load(Ordering::Relaxed),
                sessions_timed_out: worker.stats.sessions_timed_out.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.workers {
            worker.notify();
        }
        let handles: Vec<_> = self
            .handles
            .lock()
            .map(|mut handles| handles.drain(..).collect())
            .unwrap_or_default();
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        info!("scheduler pool stopped");
    }
}

impl Drop for SchedulerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wakes a scheduler when a transaction it may be waiting on ends.
pub struct SchedulerWaker {
    pool: std::sync::Weak<SchedulerPool>,
    scheduler_id: usize,
}

impl SchedulerWaker {
    pub fn new(pool: &Arc<SchedulerPool>, scheduler_id: usize) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            scheduler_id,
        }
    }

    fn wake(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.wakeup(self.scheduler_id);
        }
    }
}

impl TransactionListener for SchedulerWaker {
    fn on_commit(&self, _transaction: &Transaction) -> Result<(), ServerError> {
        self.wake();
        Ok(())
    }

    fn on_rollback(&self, _transaction: &Transaction) -> Result<(), ServerError> {
        self.wake();
        Ok(())
    }
}

fn run_loop(worker: Arc<Worker>, stopped: Arc<AtomicBool>, options: SchedulerOptions) {
    let mut ctx = WorkerContext::new(worker.id);
    debug!(scheduler = worker.id, "scheduler started");
    while !stopped.load(Ordering::Acquire) {
        let tasks = worker.inbox().take_all();
        for task in tasks {
            (task.run)(&mut ctx);
            worker.stats.tasks_run.fetch_add(1, Ordering::Relaxed);
        }

        ctx.sessions.retain(|info| !info.is_closed());
        let (progressed, pending) = run_ready_sessions(&mut ctx, &worker.stats);
        sweep_timeouts(&mut ctx, &worker.stats);

        worker
            .stats
            .bound_sessions
            .store(ctx.sessions.len(), Ordering::Relaxed);
        worker.stats.queued_commands.store(
            ctx.sessions.iter().map(|info| info.queue_len()).sum(),
            Ordering::Relaxed,
        );

        if progressed {
            continue;
        }
        let park = if pending {
            options.pending_poll
        } else {
            options.idle_park
        };
        let mut inbox = worker.inbox();
        if inbox.is_empty() && !inbox.notified && !stopped.load(Ordering::Acquire) {
            inbox = worker
                .wake
                .wait_timeout(inbox, park)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        inbox.notified = false;
    }
    debug!(scheduler = worker.id, "scheduler stopped");
}

/// One slice for every session with queued work. Returns (progressed, pending).
fn run_ready_sessions(ctx: &mut WorkerContext, stats: &WorkerStats) -> (bool, bool) {
    let count = ctx.sessions.len();
    if count == 0 {
        return (false, false);
    }
    let start = ctx.rotation % count;
    ctx.rotation = ctx.rotation.wrapping_add(1);
    let mut ready: Vec<(Priority, Arc<SessionInfo>)> = (0..count)
        .map(|offset| &ctx.sessions[(start + offset) % count])
        .filter_map(|info| info.head_priority().map(|p| (p, info.clone())))
        .collect();
    ready.sort_by(|a, b| b.0.cmp(&a.0));

    let mut progressed = false;
    let mut pending = false;
    for (_, info) in ready {
        match info.run_head_slice() {
            SliceOutcome::Progress => progressed = true,
            SliceOutcome::Pending => pending = true,
            SliceOutcome::Waiting | SliceOutcome::Idle => {}
        }
        stats.slices_run.fetch_add(1, Ordering::Relaxed);
    }
    (progressed, pending)
}

fn sweep_timeouts(ctx: &mut WorkerContext, stats: &WorkerStats) {
    let now = Instant::now();
    let expired: Vec<Arc<SessionInfo>> = ctx
        .sessions
        .iter()
        .filter(|info| info.is_timed_out(now))
        .cloned()
        .collect();
    for info in expired {
        info!(session = info.key(), idle = ?info.idle_for(), "closing timed out session");
        info.close();
        stats.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
    }
    ctx.sessions.retain(|info| !info.is_closed());
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Weak;

    use super::*;
    use crate::command::{CommandKind, PreparedCommand, Slice, Yieldable};
    use crate::config::ServerConfig;
    use crate::engine::{DuckDbEngine, SqlEngine};
    use crate::session::{Registration, Session, SessionRegistry};
    use crate::storage::lob::LobStore;
    use crate::storage::Storage;
    use crate::transaction::{ParticipantValidator, TransactionCoordinator, TransactionState};
    use shoal_protocol::Opcode;

    /// Yields `pending` times, then finishes.
    struct CountDown {
        pending: usize,
    }

    impl Yieldable for CountDown {
        type Output = ();

        fn run_slice(&mut self, _: &mut Session) -> Result<Slice<()>, ServerError> {
            if self.pending == 0 {
                return Ok(Slice::Done(()));
            }
            self.pending -= 1;
            Ok(Slice::Pending)
        }
    }

    /// Yields until the flag is set.
    struct WaitFor(Arc<AtomicBool>);

    impl Yieldable for WaitFor {
        type Output = ();

        fn run_slice(&mut self, _: &mut Session) -> Result<Slice<()>, ServerError> {
            if self.0.load(Ordering::Acquire) {
                Ok(Slice::Done(()))
            } else {
                Ok(Slice::Pending)
            }
        }
    }

    struct Fixture {
        engine: DuckDbEngine,
        coordinator: Arc<TransactionCoordinator>,
        pool: Arc<SchedulerPool>,
    }

    impl Fixture {
        fn new(count: usize) -> anyhow::Result<Self> {
            Self::with(count, Duration::from_millis(20), None)
        }

        fn with(
            count: usize,
            idle_park: Duration,
            validator: Option<Arc<dyn ParticipantValidator>>,
        ) -> anyhow::Result<Self> {
            Ok(Self {
                engine: DuckDbEngine::new(&ServerConfig::default())?,
                coordinator: TransactionCoordinator::start("127.0.0.1:9210", validator, 16)?,
                pool: SchedulerPool::start(SchedulerOptions {
                    count,
                    pending_poll: Duration::from_millis(1),
                    idle_park,
                })?,
            })
        }

        fn session(&self, key: u64, timeout: Duration) -> anyhow::Result<Arc<SessionInfo>> {
            let scheduler_id = self.pool.scheduler_for(key);
            let mut session = Session::new(
                key,
                "sa",
                self.engine.connect()?,
                self.coordinator.clone(),
                Arc::new(Storage::new()),
                Arc::new(LobStore::new()),
            );
            session.add_transaction_listener(Arc::new(SchedulerWaker::new(&self.pool, scheduler_id)));
            let info = Arc::new(SessionInfo::new(
                key as i32,
                scheduler_id,
                session,
                timeout,
                Weak::new(),
                None,
            ));
            let bound = info.clone();
            self.pool.submit(
                info.scheduler_id(),
                AsyncTask::new(Priority::Max, move |ctx| ctx.bind(bound)),
            );
            Ok(info)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.pool.shutdown();
            self.coordinator.shutdown();
        }
    }

    fn reporting<Y>(id: i32, yieldable: Y, done: mpsc::Sender<i32>) -> PreparedCommand
    where
        Y: Yieldable<Output = ()> + 'static,
    {
        PreparedCommand::new(id, CommandKind::Deferred(Opcode::CommandUpdate), yieldable, move |_, result| {
            if result.is_ok() {
                let _ = done.send(id);
            }
        })
    }

    #[test]
    fn commands_complete_in_submission_order() -> anyhow::Result<()> {
        let fixture = Fixture::new(1)?;
        let info = fixture.session(1, Duration::from_secs(60))?;
        let (tx, rx) = mpsc::channel();
        info.enqueue(reporting(1, CountDown { pending: 3 }, tx.clone()));
        info.enqueue(reporting(2, CountDown { pending: 0 }, tx.clone()));
        info.enqueue(reporting(3, CountDown { pending: 1 }, tx));
        fixture.pool.wakeup(info.scheduler_id());

        let order: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)))
            .collect::<Result<_, _>>()?;
        assert_eq!(order, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn pending_session_does_not_starve_others() -> anyhow::Result<()> {
        let fixture = Fixture::new(1)?;
        let blocked = fixture.session(1, Duration::from_secs(60))?;
        let other = fixture.session(2, Duration::from_secs(60))?;
        let gate = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        blocked.enqueue(reporting(10, WaitFor(gate.clone()), tx.clone()).with_priority(Priority::Max));
        other.enqueue(reporting(20, CountDown { pending: 2 }, tx.clone()).with_priority(Priority::Min));
        fixture.pool.wakeup(0);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 20);
        gate.store(true, Ordering::Release);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 10);
        Ok(())
    }

    #[test]
    fn cancels_only_apply_to_requests_in_flight() -> anyhow::Result<()> {
        let fixture = Fixture::new(1)?;
        let info = fixture.session(1, Duration::from_secs(60))?;
        assert!(!info.mark_cancelled(7));

        info.begin_request(7);
        info.begin_request(8);
        assert!(info.mark_cancelled(8));

        let (tx, rx) = mpsc::channel();
        for id in [7, 8] {
            let tx = tx.clone();
            info.enqueue(PreparedCommand::new(
                id,
                CommandKind::Deferred(Opcode::CommandUpdate),
                CountDown { pending: 0 },
                move |_, result| {
                    let _ = tx.send((id, result.is_ok()));
                },
            ));
        }
        fixture.pool.wakeup(info.scheduler_id());

        let outcomes: Vec<(i32, bool)> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)))
            .collect::<Result<_, _>>()?;
        assert_eq!(outcomes, vec![(7, true), (8, false)]);
        assert_eq!(info.in_flight(), 0);
        assert!(!info.mark_cancelled(8));
        Ok(())
    }

    #[test]
    fn drained_registry_refuses_new_sessions() -> anyhow::Result<()> {
        let fixture = Fixture::new(1)?;
        let registry = SessionRegistry::new();
        let first = fixture.session(1, Duration::from_secs(60))?;
        assert!(matches!(registry.insert(first.clone()), Registration::Added));

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_closed());

        let late = fixture.session(2, Duration::from_secs(60))?;
        assert!(matches!(registry.insert(late), Registration::Rejected));
        assert!(registry.is_empty());
        Ok(())
    }

    struct Rejecting;

    impl ParticipantValidator for Rejecting {
        fn validate(&self, _name: &str) -> Result<bool, ServerError> {
            Ok(false)
        }
    }

    #[test]
    fn session_waiting_on_validation_parks_until_rollback() -> anyhow::Result<()> {
        let fixture = Fixture::with(1, Duration::from_secs(30), Some(Arc::new(Rejecting)))?;
        let info = fixture.session(1, Duration::from_secs(60))?;
        let tx = {
            let mut session = info.session();
            session.enter_distributed();
            let tx = session.transaction()?;
            session.commit_distributed(&format!("{},10.0.0.9:9999:7", tx.local_name()))?;
            tx
        };
        assert_eq!(tx.state(), TransactionState::PendingValidate);

        let (done, rx) = mpsc::channel();
        info.enqueue(reporting(5, CountDown { pending: 0 }, done));
        fixture.pool.wakeup(info.scheduler_id());
        std::thread::sleep(Duration::from_millis(200));

        assert!(rx.try_recv().is_err());
        assert_eq!(info.queue_len(), 1);
        assert!(fixture.pool.snapshot()[0].slices_run < 10);

        info.session().rollback()?;
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 5);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        Ok(())
    }

    #[test]
    fn inbox_drains_highest_priority_first() {
        let mut inbox = Inbox::default();
        for priority in [Priority::Min, Priority::Norm, Priority::Max, Priority::Norm] {
            inbox.tasks[priority as usize].push_back(AsyncTask::new(priority, |_| {}));
        }
        let order: Vec<Priority> = inbox.take_all().iter().map(AsyncTask::priority).collect();
        assert_eq!(
            order,
            vec![Priority::Max, Priority::Norm, Priority::Norm, Priority::Min]
        );
        assert!(inbox.is_empty());
    }

    #[test]
    fn idle_sessions_are_closed_after_timeout() -> anyhow::Result<()> {
        let fixture = Fixture::new(1)?;
        let info = fixture.session(1, Duration::from_millis(10))?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !info.is_closed() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(info.is_closed());
        assert!(info.session().is_closed());
        assert_eq!(fixture.pool.snapshot()[0].sessions_timed_out, 1);
        Ok(())
    }

    #[test]
    fn sessions_bind_by_key() -> anyhow::Result<()> {
        let pool = SchedulerPool::start(SchedulerOptions {
            count: 3,
            ..SchedulerOptions::default()
        })?;
        assert_eq!(pool.scheduler_for(7), 1);
        assert_eq!(pool.scheduler_for(9), 0);
        let picks: Vec<usize> = (0..4).map(|_| pool.next_round_robin()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
        pool.shutdown();
        Ok(())
    }
}
