//! Waitables, waitable sets and the tasks parked on them.

use super::{ComponentAsyncState, ComponentInstanceIndex, ConcurrentState, TaskId, TaskState};
use crate::error::{ProtocolError, Unsupported};
use anyhow::Result;
use futures::channel::oneshot;
use std::collections::{BTreeSet, VecDeque};

/// Event codes delivered to a waiting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    None = 0,
    Subtask = 1,
    StreamRead = 2,
    StreamWrite = 3,
    FutureRead = 4,
    FutureWrite = 5,
    Cancelled = 6,
}

/// An event recorded on a waitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub code: EventCode,
    pub payload: u32,
}

impl Event {
    pub fn new(code: EventCode, payload: u32) -> Event {
        Event { code, payload }
    }

    /// The `(code, payload)` pair handed to guests.
    pub fn parts(self) -> (u32, u32) {
        (self.code as u32, self.payload)
    }
}

pub(super) enum WaitableEntry {
    Waitable(Waitable),
    Set(WaitableSet),
}

#[derive(Default)]
pub(super) struct Waitable {
    event: Option<Event>,
    set: Option<u32>,
}

#[derive(Default)]
pub(super) struct WaitableSet {
    members: BTreeSet<u32>,
}

/// What a parked task is told when it is resumed.
#[derive(Debug)]
pub(super) enum Wake {
    Resumed(Event),
    Rejected,
}

pub(super) struct Parked {
    pub task: TaskId,
    pub tx: oneshot::Sender<Wake>,
}

/// Outcome of an attempt to park a task.
pub(super) enum Park {
    /// The waitable already had an event; nothing was parked.
    Ready(Event),
    /// A pending cancellation was delivered instead of blocking.
    CancelDelivered,
    Parked(oneshot::Receiver<Wake>),
}

impl ComponentAsyncState {
    fn waitable_mut(&mut self, handle: u32) -> Result<&mut Waitable> {
        match self.table.get_mut(handle)? {
            WaitableEntry::Waitable(w) => Ok(w),
            WaitableEntry::Set(_) => Err(ProtocolError::NotAWaitable(handle).into()),
        }
    }

    fn set_mut(&mut self, handle: u32) -> Result<&mut WaitableSet> {
        match self.table.get_mut(handle)? {
            WaitableEntry::Set(s) => Ok(s),
            WaitableEntry::Waitable(_) => Err(ProtocolError::NotAWaitableSet(handle).into()),
        }
    }

    /// Number of tasks parked on `waitable`.
    pub fn parked_count(&self, waitable: u32) -> usize {
        self.parked.get(&waitable).map_or(0, VecDeque::len)
    }

    fn pop_parked(&mut self, waitable: u32) -> Option<Parked> {
        let queue = self.parked.get_mut(&waitable)?;
        let parked = queue.pop_front();
        if queue.is_empty() {
            self.parked.remove(&waitable);
        }
        parked
    }
}

impl ConcurrentState {
    /// Allocates a new waitable in `instance`'s table.
    pub fn waitable_new(&mut self, instance: ComponentInstanceIndex) -> Result<u32> {
        let handle = self
            .instance_mut(instance)?
            .table
            .insert(WaitableEntry::Waitable(Waitable::default()))?;
        tracing::trace!(%instance, waitable = handle, "new waitable");
        Ok(handle)
    }

    pub fn waitable_set_new(&mut self, instance: ComponentInstanceIndex) -> Result<u32> {
        let handle = self
            .instance_mut(instance)?
            .table
            .insert(WaitableEntry::Set(WaitableSet::default()))?;
        tracing::trace!(%instance, set = handle, "new waitable set");
        Ok(handle)
    }

    /// Moves `waitable` into `set`, or out of any set when `set` is `None`.
    pub fn waitable_join(
        &mut self,
        instance: ComponentInstanceIndex,
        waitable: u32,
        set: Option<u32>,
    ) -> Result<()> {
        let state = self.instance_mut(instance)?;
        if let Some(set) = set {
            state.set_mut(set)?;
        }
        let old = std::mem::replace(&mut state.waitable_mut(waitable)?.set, set);
        if let Some(old) = old {
            state.set_mut(old)?.members.remove(&waitable);
        }
        if let Some(set) = set {
            state.set_mut(set)?.members.insert(waitable);
        }
        Ok(())
    }

    /// Removes `waitable`, which must not have any tasks parked on it.
    pub fn waitable_drop(&mut self, instance: ComponentInstanceIndex, waitable: u32) -> Result<()> {
        let state = self.instance_mut(instance)?;
        state.waitable_mut(waitable)?;
        if state.parked_count(waitable) != 0 {
            return Err(ProtocolError::WaitableBusy(waitable).into());
        }
        if let WaitableEntry::Waitable(w) = state.table.remove(waitable)? {
            if let Some(set) = w.set {
                state.set_mut(set)?.members.remove(&waitable);
            }
        }
        Ok(())
    }

    /// Removes an empty waitable set.
    pub fn waitable_set_drop(&mut self, instance: ComponentInstanceIndex, set: u32) -> Result<()> {
        let state = self.instance_mut(instance)?;
        if !state.set_mut(set)?.members.is_empty() {
            return Err(ProtocolError::WaitableSetNotEmpty(set).into());
        }
        state.table.remove(set)?;
        Ok(())
    }

    /// Takes the first pending event among the members of `set`, returning
    /// the member it was recorded on.
    pub fn waitable_set_pending_event(
        &mut self,
        instance: ComponentInstanceIndex,
        set: u32,
    ) -> Result<Option<(u32, Event)>> {
        let state = self.instance_mut(instance)?;
        let members = state.set_mut(set)?.members.iter().copied().collect::<Vec<_>>();
        for member in members {
            if let Some(event) = state.waitable_mut(member)?.event.take() {
                return Ok(Some((member, event)));
            }
        }
        Ok(None)
    }

    pub fn waitable_set_poll(&mut self, instance: ComponentInstanceIndex, set: u32) -> Result<()> {
        self.instance_mut(instance)?.set_mut(set)?;
        Err(Unsupported("waitable-set.poll").into())
    }

    pub fn waitable_set_wait(&mut self, instance: ComponentInstanceIndex, set: u32) -> Result<()> {
        self.instance_mut(instance)?.set_mut(set)?;
        Err(Unsupported("waitable-set.wait").into())
    }

    /// Parks `task` on `waitable`, behind any tasks already parked there.
    pub(super) fn park(
        &mut self,
        task: TaskId,
        waitable: u32,
        cancellable: bool,
        for_callback: bool,
    ) -> Result<Park> {
        let t = self.task(task)?;
        let instance = t.instance();
        if t.blocked_on.is_some() {
            return Err(ProtocolError::AlreadyBlocked(task).into());
        }
        if for_callback && !t.is_async() {
            return Err(ProtocolError::SyncCallbackBlock(task).into());
        }
        match t.state() {
            TaskState::Initial => {}
            TaskState::CancelPending if cancellable => {
                self.task_mut(task)?.state = TaskState::CancelDelivered;
                tracing::debug!(%task, "delivering pending cancellation");
                return Ok(Park::CancelDelivered);
            }
            TaskState::CancelPending => {}
            state => {
                return Err(ProtocolError::InvalidState {
                    task,
                    op: "block",
                    state,
                }
                .into());
            }
        }

        let state = self.instance_mut(instance)?;
        if let Some(event) = state.waitable_mut(waitable)?.event.take() {
            return Ok(Park::Ready(event));
        }
        let (tx, rx) = oneshot::channel();
        state
            .parked
            .entry(waitable)
            .or_default()
            .push_back(Parked { task, tx });
        self.task_mut(task)?.blocked_on = Some(waitable);
        tracing::trace!(%task, waitable, cancellable, "task parked");
        Ok(Park::Parked(rx))
    }

    /// Signals `waitable`, resuming the task parked on it longest.
    ///
    /// When no task is parked the event is recorded on the waitable and
    /// handed to the next task that blocks on it.
    pub fn wake(
        &mut self,
        instance: ComponentInstanceIndex,
        waitable: u32,
        event: Event,
    ) -> Result<Option<TaskId>> {
        self.instance_mut(instance)?.waitable_mut(waitable)?;
        while let Some(parked) = self.instance_mut(instance)?.pop_parked(waitable) {
            self.task_mut(parked.task)?.blocked_on = None;
            if parked.tx.send(Wake::Resumed(event)).is_ok() {
                tracing::trace!(task = %parked.task, waitable, "task resumed");
                return Ok(Some(parked.task));
            }
        }
        self.instance_mut(instance)?.waitable_mut(waitable)?.event = Some(event);
        Ok(None)
    }

    /// Rejects the wait of the task parked longest on `waitable`, which the
    /// task observes as a cancellation.
    pub fn reject(
        &mut self,
        instance: ComponentInstanceIndex,
        waitable: u32,
    ) -> Result<Option<TaskId>> {
        self.instance_mut(instance)?.waitable_mut(waitable)?;
        while let Some(parked) = self.instance_mut(instance)?.pop_parked(waitable) {
            self.task_mut(parked.task)?.blocked_on = None;
            if parked.tx.send(Wake::Rejected).is_ok() {
                tracing::debug!(task = %parked.task, waitable, "wait rejected");
                return Ok(Some(parked.task));
            }
        }
        Ok(None)
    }

    /// Takes `task` off the queue it is parked in, if any.
    fn unpark(&mut self, task: TaskId) -> Result<Option<(u32, Parked)>> {
        let t = self.task(task)?;
        let instance = t.instance();
        let Some(waitable) = t.blocked_on else {
            return Ok(None);
        };
        let state = self.instance_mut(instance)?;
        let parked = state.parked.get_mut(&waitable).and_then(|queue| {
            let pos = queue.iter().position(|p| p.task == task)?;
            queue.remove(pos)
        });
        if state.parked.get(&waitable).is_some_and(VecDeque::is_empty) {
            state.parked.remove(&waitable);
        }
        self.task_mut(task)?.blocked_on = None;
        Ok(parked.map(|p| (waitable, p)))
    }

    /// Cleans up after a wait of `task` on `waitable` that went away before
    /// it was resumed. An event that was already delivered to the wait is
    /// passed on as if it had just been signalled.
    pub(super) fn abandon_wait(
        &mut self,
        task: TaskId,
        waitable: u32,
        delivered: Option<Wake>,
    ) -> Result<()> {
        let instance = self.task(task)?.instance();
        if self.task(task)?.blocked_on == Some(waitable) {
            self.unpark(task)?;
        }
        tracing::trace!(%task, waitable, "wait abandoned");
        if let Some(Wake::Resumed(event)) = delivered {
            self.wake(instance, waitable, event)?;
        }
        Ok(())
    }

    /// Cancels `task` out of whatever wait it is currently blocked in.
    pub fn cancel_blocked(&mut self, task: TaskId) -> Result<()> {
        let (waitable, parked) = self
            .unpark(task)?
            .ok_or(ProtocolError::NotBlocked(task))?;
        // A dropped receiver means the wait already went away.
        let _ = parked.tx.send(Wake::Rejected);
        tracing::debug!(%task, waitable, "blocked task cancelled");
        Ok(())
    }
}
