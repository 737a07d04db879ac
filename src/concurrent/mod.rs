//! Per-instance task and concurrency state.
//!
//! All state lives in a single [`ConcurrentState`] holding an arena of
//! [`ComponentAsyncState`] records indexed by [`ComponentInstanceIndex`] and
//! the table of live [`Task`]s. It is shared behind a mutex through the
//! cloneable [`Concurrent`] handle. The mutex is never held across an await
//! point or a call into the guest.
//!
//! Tasks only suspend in two places: [`Concurrent::block_on`], which parks a
//! task on a waitable until it is woken or rejected, and
//! [`Concurrent::exclusive_lock`], which waits for the instance's ticket lock.

mod lock;
mod task;
mod waitable;

pub use self::lock::LockAcquire;
pub use self::task::{Subtask, Task, TaskOutcome, TaskState};
pub use self::waitable::{Event, EventCode};

use self::lock::TicketLock;
use self::waitable::{Park, Parked, Wake, WaitableEntry};
use crate::error::ProtocolError;
use crate::table::ResourceTable;
use anyhow::Result;
use futures::channel::oneshot;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Index of a component instance in the [`ConcurrentState`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentInstanceIndex(u32);

impl ComponentInstanceIndex {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ComponentInstanceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a task. Ids strictly increase and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Flags guarding entry into and exit out of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceFlags {
    /// Whether the host may call into the instance.
    pub may_enter: bool,
    /// Whether the instance may call out to imports. Cleared while the host
    /// reads a return area and runs post-return.
    pub may_leave: bool,
    /// Set between lifting an export's result and running its post-return.
    pub needs_post_return: bool,
}

impl Default for InstanceFlags {
    fn default() -> Self {
        InstanceFlags {
            may_enter: true,
            may_leave: true,
            needs_post_return: false,
        }
    }
}

/// Concurrency state of one component instance.
#[derive(Default)]
pub struct ComponentAsyncState {
    backpressure: bool,
    sync_calls: u32,
    flags: InstanceFlags,
    lock: TicketLock,
    table: ResourceTable<WaitableEntry>,
    parked: HashMap<u32, VecDeque<Parked>>,
    task_stack: Vec<TaskId>,
}

impl ComponentAsyncState {
    pub fn backpressure(&self) -> bool {
        self.backpressure
    }

    /// Whether a synchronous import or export call is in flight.
    pub fn in_sync_call(&self) -> bool {
        self.sync_calls > 0
    }

    pub fn flags(&self) -> InstanceFlags {
        self.flags
    }

    /// Ids on the task stack, oldest first.
    pub fn task_stack(&self) -> &[TaskId] {
        &self.task_stack
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Arena of per-instance state plus all live tasks.
pub struct ConcurrentState {
    next_task_id: u64,
    instances: Vec<ComponentAsyncState>,
    tasks: HashMap<TaskId, Task>,
}

impl Default for ConcurrentState {
    fn default() -> Self {
        ConcurrentState::new()
    }
}

impl ConcurrentState {
    pub fn new() -> ConcurrentState {
        ConcurrentState {
            // Task ids start at 1 so that 0 never names a task.
            next_task_id: 1,
            instances: Vec::new(),
            tasks: HashMap::new(),
        }
    }

    pub fn add_component_instance(&mut self) -> Result<ComponentInstanceIndex> {
        let index = ComponentInstanceIndex(u32::try_from(self.instances.len())?);
        self.instances.push(ComponentAsyncState::default());
        Ok(index)
    }

    pub fn instance(&self, index: ComponentInstanceIndex) -> Result<&ComponentAsyncState> {
        Ok(self
            .instances
            .get(index.0 as usize)
            .ok_or(ProtocolError::UnknownInstance(index))?)
    }

    pub fn instance_mut(&mut self, index: ComponentInstanceIndex) -> Result<&mut ComponentAsyncState> {
        Ok(self
            .instances
            .get_mut(index.0 as usize)
            .ok_or(ProtocolError::UnknownInstance(index))?)
    }

    pub fn backpressure_set(&mut self, instance: ComponentInstanceIndex, enabled: bool) -> Result<()> {
        self.instance_mut(instance)?.backpressure = enabled;
        tracing::debug!(%instance, enabled, "backpressure set");
        Ok(())
    }

    pub fn set_may_leave(&mut self, instance: ComponentInstanceIndex, may_leave: bool) -> Result<()> {
        self.instance_mut(instance)?.flags.may_leave = may_leave;
        Ok(())
    }

    pub fn set_may_enter(&mut self, instance: ComponentInstanceIndex, may_enter: bool) -> Result<()> {
        self.instance_mut(instance)?.flags.may_enter = may_enter;
        Ok(())
    }

    pub fn set_needs_post_return(
        &mut self,
        instance: ComponentInstanceIndex,
        needs_post_return: bool,
    ) -> Result<()> {
        self.instance_mut(instance)?.flags.needs_post_return = needs_post_return;
        Ok(())
    }

    /// Takes a ticket for the exclusive lock of `instance`.
    pub fn exclusive_lock(&mut self, instance: ComponentInstanceIndex) -> Result<LockAcquire> {
        let acquire = self.instance_mut(instance)?.lock.acquire();
        if let LockAcquire::Queued(ticket, _) = &acquire {
            tracing::trace!(%instance, ticket, "waiting for exclusive lock");
        }
        Ok(acquire)
    }

    /// Releases the exclusive lock of `instance`, handing it to the next
    /// waiting ticket. Does nothing if the lock is not held.
    pub fn exclusive_release(&mut self, instance: ComponentInstanceIndex) -> Result<Option<u64>> {
        let next = self.instance_mut(instance)?.lock.release();
        if let Some(ticket) = next {
            tracing::trace!(%instance, ticket, "exclusive lock handed off");
        }
        Ok(next)
    }

    /// Withdraws `ticket` from the exclusive lock of `instance`, releasing
    /// the lock if it had already been handed to that ticket.
    pub fn exclusive_abandon(
        &mut self,
        instance: ComponentInstanceIndex,
        ticket: u64,
    ) -> Result<Option<u64>> {
        let next = self.instance_mut(instance)?.lock.abandon(ticket);
        tracing::trace!(%instance, ticket, ?next, "exclusive lock ticket abandoned");
        Ok(next)
    }
}

/// How a call to [`Concurrent::block_on`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Resumed(Event),
    Cancelled,
}

/// Shared handle to a [`ConcurrentState`].
#[derive(Clone)]
pub struct Concurrent(Arc<Mutex<ConcurrentState>>);

impl Default for Concurrent {
    fn default() -> Self {
        Concurrent::new()
    }
}

impl Concurrent {
    pub fn new() -> Concurrent {
        Concurrent(Arc::new(Mutex::new(ConcurrentState::new())))
    }

    /// Runs `f` with exclusive access to the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut ConcurrentState) -> Result<R>) -> Result<R> {
        let mut state = self.0.lock().map_err(|_| ProtocolError::Poisoned)?;
        f(&mut state)
    }

    /// Waits for the exclusive lock of `instance`, returning the ticket that
    /// was served.
    pub async fn exclusive_lock(&self, instance: ComponentInstanceIndex) -> Result<u64> {
        match self.with(|s| s.exclusive_lock(instance))? {
            LockAcquire::Granted(ticket) => Ok(ticket),
            LockAcquire::Queued(ticket, rx) => {
                let mut queued = QueuedTicket {
                    concurrent: self,
                    instance,
                    ticket,
                    served: false,
                };
                rx.await.map_err(|_| ProtocolError::LockAbandoned(instance))?;
                queued.served = true;
                Ok(ticket)
            }
        }
    }

    pub fn exclusive_release(&self, instance: ComponentInstanceIndex) -> Result<Option<u64>> {
        self.with(|s| s.exclusive_release(instance))
    }

    /// Blocks `task` on `waitable` until the waitable is signalled or the
    /// wait is rejected.
    ///
    /// A rejected cancellable wait cancels the task. A rejected
    /// uncancellable wait leaves the cancellation pending and waits once
    /// more, uncancellably; rejecting that wait too is an error.
    pub async fn block_on(
        &self,
        task: TaskId,
        waitable: u32,
        cancellable: bool,
        for_callback: bool,
    ) -> Result<BlockOutcome> {
        let rx = match self.with(|s| s.park(task, waitable, cancellable, for_callback))? {
            Park::Ready(event) => return Ok(BlockOutcome::Resumed(event)),
            Park::CancelDelivered => return Ok(BlockOutcome::Cancelled),
            Park::Parked(rx) => rx,
        };
        let mut wait = ParkedWait::new(self, task, waitable, rx);
        if let Some(Wake::Resumed(event)) = wait.wait().await {
            return Ok(BlockOutcome::Resumed(event));
        }

        if cancellable {
            self.with(|s| {
                s.task_mut(task)?.cancelled_while_blocked();
                Ok(())
            })?;
            tracing::debug!(%task, "cancellable wait rejected");
            return Ok(BlockOutcome::Cancelled);
        }

        let park = self.with(|s| {
            s.task_mut(task)?.state = TaskState::CancelPending;
            s.park(task, waitable, false, for_callback)
        })?;
        tracing::debug!(%task, "uncancellable wait rejected, cancellation pending");
        let rx = match park {
            Park::Ready(event) => return Ok(BlockOutcome::Resumed(event)),
            Park::Parked(rx) => rx,
            Park::CancelDelivered => unreachable!("uncancellable waits never deliver"),
        };
        let mut wait = ParkedWait::new(self, task, waitable, rx);
        match wait.wait().await {
            Some(Wake::Resumed(event)) => Ok(BlockOutcome::Resumed(event)),
            _ => Err(ProtocolError::DoubleCancel(task).into()),
        }
    }
}

/// A task parked on a waitable. Dropping it before the wake arrives takes
/// the task off the waitable again.
struct ParkedWait<'a> {
    concurrent: &'a Concurrent,
    task: TaskId,
    waitable: u32,
    rx: Option<oneshot::Receiver<Wake>>,
}

impl<'a> ParkedWait<'a> {
    fn new(
        concurrent: &'a Concurrent,
        task: TaskId,
        waitable: u32,
        rx: oneshot::Receiver<Wake>,
    ) -> ParkedWait<'a> {
        ParkedWait {
            concurrent,
            task,
            waitable,
            rx: Some(rx),
        }
    }

    /// Waits for the wake. A dropped sender reads as `None`.
    async fn wait(&mut self) -> Option<Wake> {
        let wake = self.rx.as_mut()?.await.ok();
        self.rx = None;
        wake
    }
}

impl Drop for ParkedWait<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let delivered = rx.try_recv().ok().flatten();
        let (task, waitable) = (self.task, self.waitable);
        // The task may already be gone, leaving nothing to undo.
        let _ = self
            .concurrent
            .with(|s| s.abandon_wait(task, waitable, delivered));
    }
}

/// A ticket waiting in an exclusive lock queue. Dropping it before the
/// handoff is observed gives the ticket back.
struct QueuedTicket<'a> {
    concurrent: &'a Concurrent,
    instance: ComponentInstanceIndex,
    ticket: u64,
    served: bool,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if self.served {
            return;
        }
        let (instance, ticket) = (self.instance, self.ticket);
        // A poisoned state has no lock left to hand on.
        let _ = self
            .concurrent
            .with(|s| s.exclusive_abandon(instance, ticket));
    }
}
