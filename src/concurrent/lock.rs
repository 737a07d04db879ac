use futures::channel::oneshot;
use std::collections::VecDeque;

/// Result of asking for the exclusive lock of a component instance.
#[derive(Debug)]
pub enum LockAcquire {
    /// The lock was free and now belongs to this ticket.
    Granted(u64),
    /// The lock is held; the receiver fires once this ticket is served.
    Queued(u64, oneshot::Receiver<()>),
}

/// A fair mutex handing out strictly increasing tickets.
#[derive(Default)]
pub(super) struct TicketLock {
    next_ticket: u64,
    serving: Option<u64>,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

impl TicketLock {
    pub fn acquire(&mut self) -> LockAcquire {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        if self.serving.is_none() {
            debug_assert!(self.waiters.is_empty());
            self.serving = Some(ticket);
            return LockAcquire::Granted(ticket);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back((ticket, tx));
        LockAcquire::Queued(ticket, rx)
    }

    /// Releases the lock, handing it to the oldest waiter still listening.
    /// Returns the ticket now being served, if any. Releasing an unlocked
    /// lock does nothing.
    pub fn release(&mut self) -> Option<u64> {
        self.serving?;
        while let Some((ticket, tx)) = self.waiters.pop_front() {
            if tx.send(()).is_ok() {
                self.serving = Some(ticket);
                return Some(ticket);
            }
        }
        self.serving = None;
        None
    }

    /// Gives up `ticket`. If the lock was already handed to it, the lock
    /// moves on to the next waiter; otherwise the ticket leaves the queue.
    /// Returns the ticket now being served.
    pub fn abandon(&mut self, ticket: u64) -> Option<u64> {
        if self.serving == Some(ticket) {
            return self.release();
        }
        self.waiters.retain(|(t, _)| *t != ticket);
        self.serving
    }

    pub fn is_locked(&self) -> bool {
        self.serving.is_some()
    }

    pub fn serving(&self) -> Option<u64> {
        self.serving
    }
}
