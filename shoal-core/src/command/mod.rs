//! Yieldable commands.
//!
//! A command runs in slices on its session's scheduler. Each slice either
//! finishes (`Done`, the completion callback writes the response) or yields
//! (`Pending`, the scheduler puts it back at the head of the session queue).

pub mod queue;
mod statement;
mod storage;

use std::sync::Arc;

pub use queue::CommandQueue;
pub use statement::{YieldableQuery, YieldableStatement, YieldableUpdate};
pub use storage::{StorageOp, StorageReply, YieldableStorage};

use crate::error::ServerError;
use crate::net::handler::{self, Outcome};
use crate::net::Request;
use crate::scheduler::Priority;
use crate::session::{Session, SessionInfo};
use shoal_protocol::Opcode;

pub enum Slice<T> {
    Pending,
    Done(T),
}

pub trait Yieldable: Send {
    type Output;

    fn run_slice(&mut self, session: &mut Session) -> Result<Slice<Self::Output>, ServerError>;
}

trait Step: Send {
    /// Returns true once the completion callback has run.
    fn step(&mut self, session: &mut Session) -> bool;

    /// Complete with an error without running another slice.
    fn fail(&mut self, session: &mut Session, err: ServerError);
}

/// Pairs a yieldable with the callback that consumes its result.
pub struct WithCompletion<Y, F> {
    inner: Y,
    on_complete: Option<F>,
}

impl<Y, F> Step for WithCompletion<Y, F>
where
    Y: Yieldable,
    F: FnOnce(&mut Session, Result<Y::Output, ServerError>) + Send,
{
    fn step(&mut self, session: &mut Session) -> bool {
        let outcome = match self.inner.run_slice(session) {
            Ok(Slice::Pending) => return false,
            Ok(Slice::Done(output)) => Ok(output),
            Err(err) => Err(err),
        };
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(session, outcome);
        }
        true
    }

    fn fail(&mut self, session: &mut Session, err: ServerError) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(session, Err(err));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Query,
    Update,
    StorageOp(Opcode),
    /// A request that arrived while the session was busy; decoded when it reaches the head.
    Deferred(Opcode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Ready,
    Running,
    Pending,
    Done,
}

enum Body {
    Deferred(Option<Request>),
    Step(Box<dyn Step>),
}

pub struct PreparedCommand {
    packet_id: i32,
    priority: Priority,
    kind: CommandKind,
    state: CommandState,
    body: Body,
}

impl PreparedCommand {
    pub fn new<Y, F>(packet_id: i32, kind: CommandKind, yieldable: Y, on_complete: F) -> Self
    where
        Y: Yieldable + 'static,
        F: FnOnce(&mut Session, Result<Y::Output, ServerError>) + Send + 'static,
    {
        Self {
            packet_id,
            priority: Priority::Norm,
            kind,
            state: CommandState::Ready,
            body: Body::Step(Box::new(WithCompletion {
                inner: yieldable,
                on_complete: Some(on_complete),
            })),
        }
    }

    pub fn deferred(request: Request) -> Self {
        Self {
            packet_id: request.packet_id,
            priority: Priority::Norm,
            kind: CommandKind::Deferred(request.opcode),
            state: CommandState::Ready,
            body: Body::Deferred(Some(request)),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn packet_id(&self) -> i32 {
        self.packet_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Run one slice. A deferred request is decoded and handled here; if the
    /// handler produces a yieldable command it continues in place.
    pub fn run_slice(&mut self, info: &Arc<SessionInfo>, session: &mut Session) -> CommandState {
        self.state = CommandState::Running;
        loop {
            match &mut self.body {
                Body::Step(step) => {
                    if info.take_cancelled(self.packet_id) {
                        step.fail(session, ServerError::Cancelled);
                        self.state = CommandState::Done;
                        return self.state;
                    }
                    self.state = if step.step(session) {
                        CommandState::Done
                    } else {
                        CommandState::Pending
                    };
                    return self.state;
                }
                Body::Deferred(request) => {
                    let Some(conn) = info.connection() else {
                        self.state = CommandState::Done;
                        return self.state;
                    };
                    if info.take_cancelled(self.packet_id) {
                        conn.send_error(self.packet_id, &ServerError::Cancelled);
                        self.state = CommandState::Done;
                        return self.state;
                    }
                    if session.awaiting_validation() {
                        self.state = CommandState::Pending;
                        return self.state;
                    }
                    let Some(request) = request.take() else {
                        self.state = CommandState::Done;
                        return self.state;
                    };
                    match handler::handle(&conn, session, request) {
                        Outcome::Done => {
                            self.state = CommandState::Done;
                            return self.state;
                        }
                        Outcome::Command(next) => {
                            self.kind = next.kind;
                            self.body = next.body;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PreparedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCommand")
            .field("packet_id", &self.packet_id)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}
