use std::collections::VecDeque;

use crate::command::PreparedCommand;
use crate::scheduler::Priority;

/// Strict FIFO of a session's commands.
#[derive(Default)]
pub struct CommandQueue {
    commands: VecDeque<PreparedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, command: PreparedCommand) {
        self.commands.push_back(command);
    }

    /// Return a command that yielded to the head so it runs next.
    pub fn push_front(&mut self, command: PreparedCommand) {
        self.commands.push_front(command);
    }

    pub fn pop_front(&mut self) -> Option<PreparedCommand> {
        self.commands.pop_front()
    }

    pub fn head_priority(&self) -> Option<Priority> {
        self.commands.front().map(|command| command.priority())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn drain(&mut self) -> Vec<PreparedCommand> {
        self.commands.drain(..).collect()
    }
}
