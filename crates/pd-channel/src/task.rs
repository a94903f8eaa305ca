//! Tasks an actor posts to itself for the next turn of the event loop.

use crate::ActorKey;
use pd_core::NetError;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorTask {
    StartDiversion,
    FailDiversion { error: NetError, skip_resume: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedTask {
    pub actor: ActorKey,
    pub task: ActorTask,
}

/// FIFO of posted tasks. Never run from inside the call that posts them.
#[derive(Debug, Default)]
pub struct TaskQueue {
    queue: VecDeque<PostedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, actor: ActorKey, task: ActorTask) {
        self.queue.push_back(PostedTask { actor, task });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Takes the tasks posted so far; anything posted while they run waits
    /// for the following turn.
    pub fn take_turn(&mut self) -> Vec<PostedTask> {
        self.queue.drain(..).collect()
    }

    /// Drops tasks of an actor that no longer exists.
    pub fn forget(&mut self, actor: ActorKey) {
        self.queue.retain(|posted| posted.actor != actor);
    }
}

#[cfg(test)]
mod tests {
    use super::ActorTask;
    use super::TaskQueue;
    use crate::ActorKey;
    use crate::ProcessId;
    use pd_ipc::ActorId;

    #[test]
    fn turn_excludes_tasks_posted_later() {
        let key = ActorKey::new(ProcessId(1), ActorId(1));
        let mut tasks = TaskQueue::new();
        tasks.post(key, ActorTask::StartDiversion);
        let turn = tasks.take_turn();
        tasks.post(key, ActorTask::StartDiversion);
        assert_eq!(turn.len(), 1);
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn forget_drops_only_that_actor() {
        let first = ActorKey::new(ProcessId(1), ActorId(1));
        let second = ActorKey::new(ProcessId(2), ActorId(1));
        let mut tasks = TaskQueue::new();
        tasks.post(first, ActorTask::StartDiversion);
        tasks.post(second, ActorTask::StartDiversion);
        tasks.forget(first);
        assert_eq!(tasks.take_turn()[0].actor, second);
        assert!(tasks.is_empty());
    }
}
