//! Task lifecycle: start, resolve, cancel, exit and end.

use super::{ComponentInstanceIndex, ConcurrentState, TaskId};
use crate::abi::Val;
use crate::error::{ProtocolError, Unsupported};
use anyhow::Result;
use futures::channel::oneshot;

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initial,
    /// A cancellation arrived during an uncancellable wait and has not yet
    /// been observed by the task.
    CancelPending,
    /// A pending cancellation was handed to the task at a cancellable wait.
    CancelDelivered,
    /// The task was cancelled out of a cancellable wait.
    Cancelled,
    Resolved,
}

/// How a task settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Returned(Vec<Val>),
    Cancelled,
}

/// A nested call made while servicing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtask {
    pub task: TaskId,
    pub entry: String,
}

/// One invocation crossing the host/guest boundary.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    instance: ComponentInstanceIndex,
    is_async: bool,
    pub(super) state: TaskState,
    entry: String,
    subtasks: Vec<Subtask>,
    context: [u32; 2],
    completion: Option<oneshot::Sender<TaskOutcome>>,
    receiver: Option<oneshot::Receiver<TaskOutcome>>,
    outcome: Option<TaskOutcome>,
    borrowed: Vec<u32>,
    pub(super) blocked_on: Option<u32>,
    exited: bool,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn instance(&self) -> ComponentInstanceIndex {
        self.instance
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    /// The stored outcome once the task has settled.
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_on.is_some()
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    pub fn borrowed_handles(&self) -> &[u32] {
        &self.borrowed
    }

    fn check_no_borrows(&self) -> Result<()> {
        if self.borrowed.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::BorrowedHandles {
                task: self.id,
                count: self.borrowed.len(),
            }
            .into())
        }
    }

    fn invalid(&self, op: &'static str) -> anyhow::Error {
        ProtocolError::InvalidState {
            task: self.id,
            op,
            state: self.state,
        }
        .into()
    }

    fn settle(&mut self, outcome: TaskOutcome) {
        if let Some(tx) = self.completion.take() {
            // Nobody waiting on completion is fine.
            let _ = tx.send(outcome.clone());
        }
        self.outcome = Some(outcome);
    }

    /// Records that a cancellable wait was rejected.
    pub(super) fn cancelled_while_blocked(&mut self) {
        self.state = TaskState::Cancelled;
        self.settle(TaskOutcome::Cancelled);
    }
}

impl ConcurrentState {
    pub fn task(&self, id: TaskId) -> Result<&Task> {
        Ok(self.tasks.get(&id).ok_or(ProtocolError::UnknownTask(id))?)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        Ok(self.tasks.get_mut(&id).ok_or(ProtocolError::UnknownTask(id))?)
    }

    /// The most recently started task of `instance` that has not ended.
    pub fn current_task(&self, instance: ComponentInstanceIndex) -> Result<Option<TaskId>> {
        Ok(self.instance(instance)?.task_stack.last().copied())
    }

    /// Starts a new task on `instance` and pushes it onto its task stack.
    pub fn start_task(
        &mut self,
        instance: ComponentInstanceIndex,
        is_async: bool,
        entry: &str,
    ) -> Result<TaskId> {
        let state = self.instance(instance)?;
        if state.backpressure && state.task_stack.is_empty() {
            return Err(Unsupported("queueing a task behind backpressure").into());
        }
        let id = TaskId(self.next_task_id);
        self.next_task_id = self
            .next_task_id
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("task ids exhausted"))?;

        let (tx, rx) = oneshot::channel();
        self.tasks.insert(
            id,
            Task {
                id,
                instance,
                is_async,
                state: TaskState::Initial,
                entry: entry.to_string(),
                subtasks: Vec::new(),
                context: [0; 2],
                completion: Some(tx),
                receiver: Some(rx),
                outcome: None,
                borrowed: Vec::new(),
                blocked_on: None,
                exited: false,
            },
        );
        let state = self.instance_mut(instance)?;
        state.task_stack.push(id);
        if !is_async {
            state.sync_calls += 1;
        }
        tracing::debug!(%instance, task = %id, entry, is_async, "task started");
        Ok(id)
    }

    /// Pops the most recent task of `instance`.
    ///
    /// If `expected` is given it must name that task, otherwise nothing is
    /// popped and a stack-discipline error is returned.
    pub fn end_task(
        &mut self,
        instance: ComponentInstanceIndex,
        expected: Option<TaskId>,
    ) -> Result<Task> {
        let state = self.instance(instance)?;
        let top = *state
            .task_stack
            .last()
            .ok_or(ProtocolError::EmptyTaskStack { instance })?;
        if let Some(expected) = expected {
            if expected != top {
                return Err(ProtocolError::TaskStackMismatch {
                    instance,
                    expected,
                    found: top,
                }
                .into());
            }
        }
        if !self.task(top)?.subtasks.is_empty() {
            return Err(ProtocolError::LiveSubtasks(top).into());
        }
        let task = self
            .tasks
            .remove(&top)
            .ok_or(ProtocolError::UnknownTask(top))?;
        let state = self.instance_mut(instance)?;
        state.task_stack.pop();
        // A sync task ended without exiting still holds its sync call.
        if !task.is_async && !task.exited {
            state.sync_calls = state.sync_calls.saturating_sub(1);
        }
        tracing::debug!(%instance, task = %top, exited = task.exited, "task ended");
        Ok(task)
    }

    /// Resolves `id` with its results. A task resolves at most once.
    pub fn resolve_task(&mut self, id: TaskId, results: Vec<Val>) -> Result<()> {
        let task = self.task_mut(id)?;
        task.check_no_borrows()?;
        if task.outcome.is_some() {
            return Err(ProtocolError::DoubleResolve(id).into());
        }
        match task.state {
            TaskState::Initial | TaskState::CancelPending => {}
            _ => return Err(task.invalid("resolve")),
        }
        task.state = TaskState::Resolved;
        task.settle(TaskOutcome::Returned(results));
        tracing::debug!(task = %id, "task resolved");
        Ok(())
    }

    /// Acknowledges a delivered cancellation, settling the task as
    /// cancelled.
    pub fn cancel_task(&mut self, id: TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.state != TaskState::CancelDelivered || task.outcome.is_some() {
            return Err(task.invalid("cancel"));
        }
        task.check_no_borrows()?;
        task.settle(TaskOutcome::Cancelled);
        tracing::debug!(task = %id, "task cancelled");
        Ok(())
    }

    /// Marks a settled task as exited.
    pub fn exit_task(&mut self, id: TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.outcome.is_none() || task.exited {
            return Err(task.invalid("exit"));
        }
        task.check_no_borrows()?;
        task.exited = true;
        let (instance, is_async) = (task.instance, task.is_async);
        if !is_async {
            let state = self.instance_mut(instance)?;
            state.sync_calls = state.sync_calls.saturating_sub(1);
        }
        tracing::debug!(task = %id, "task exited");
        Ok(())
    }

    /// Takes the receiver that fires when `id` settles. It can be taken once.
    pub fn take_completion(&mut self, id: TaskId) -> Result<oneshot::Receiver<TaskOutcome>> {
        self.task_mut(id)?
            .receiver
            .take()
            .ok_or_else(|| anyhow::anyhow!("completion of task {id} already taken"))
    }

    pub fn push_subtask(&mut self, parent: TaskId, child: TaskId) -> Result<()> {
        let entry = self.task(child)?.entry.clone();
        self.task_mut(parent)?.subtasks.push(Subtask { task: child, entry });
        Ok(())
    }

    /// Pops `child`, which must be the most recent subtask of `parent`.
    pub fn pop_subtask(&mut self, parent: TaskId, child: TaskId) -> Result<Subtask> {
        let task = self.task_mut(parent)?;
        match task.subtasks.last() {
            Some(top) if top.task == child => {}
            _ => return Err(ProtocolError::SubtaskMismatch { task: parent }.into()),
        }
        Ok(task.subtasks.pop().ok_or(ProtocolError::SubtaskMismatch { task: parent })?)
    }

    pub fn borrow_handle(&mut self, id: TaskId, handle: u32) -> Result<()> {
        self.task_mut(id)?.borrowed.push(handle);
        Ok(())
    }

    pub fn release_handle(&mut self, id: TaskId, handle: u32) -> Result<()> {
        let task = self.task_mut(id)?;
        let pos = task
            .borrowed
            .iter()
            .position(|h| *h == handle)
            .ok_or(ProtocolError::NotBorrowed { task: id, handle })?;
        task.borrowed.swap_remove(pos);
        Ok(())
    }

    pub fn context_get(&self, id: TaskId, slot: u32) -> Result<u32> {
        let task = self.task(id)?;
        Ok(*task
            .context
            .get(slot as usize)
            .ok_or(ProtocolError::InvalidContextSlot(slot))?)
    }

    pub fn context_set(&mut self, id: TaskId, slot: u32, value: u32) -> Result<()> {
        let task = self.task_mut(id)?;
        *task
            .context
            .get_mut(slot as usize)
            .ok_or(ProtocolError::InvalidContextSlot(slot))? = value;
        Ok(())
    }
}
