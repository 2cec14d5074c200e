//! At most one in-flight request per mutating action class.

use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Classes of outbound requests that must not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Join,
    ChangeRole,
    ConfigureRounds,
    StartGame,
    NextRound,
    ResetGame,
    /// Coins are guarded one by one so distinct coins can flip concurrently.
    FlipCoin(usize),
    SendBatch,
}

/// Bookkeeping for one pending request.
#[derive(Debug, Clone, Copy)]
pub struct PendingAction {
    pub id: Uuid,
    pub since: Instant,
}

impl PendingAction {
    /// Time spent waiting on the server so far.
    pub fn elapsed(&self) -> Duration {
        self.since.elapsed()
    }
}

/// Pending-action flags, one per [`ActionClass`].
#[derive(Debug, Default)]
pub struct ActionGuard {
    pending: DashMap<ActionClass, PendingAction>,
}

impl ActionGuard {
    /// Create a guard with no pending actions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag for `class`; `false` when it is already raised.
    pub fn try_begin(&self, class: ActionClass) -> bool {
        self.begin(class).is_some()
    }

    /// Raise the flag for `class` and return its ticket.
    pub fn begin(&self, class: ActionClass) -> Option<PendingAction> {
        match self.pending.entry(class) {
            Entry::Occupied(_) => {
                debug!(?class, "action already pending");
                None
            }
            Entry::Vacant(slot) => {
                let ticket = PendingAction {
                    id: Uuid::new_v4(),
                    since: Instant::now(),
                };
                slot.insert(ticket);
                Some(ticket)
            }
        }
    }

    /// Lower the flag for `class`. Returns whether it was raised.
    pub fn end(&self, class: ActionClass) -> bool {
        released(class, self.pending.remove(&class))
    }

    /// Lower the flag only if it still belongs to `ticket`.
    fn end_ticket(&self, class: ActionClass, ticket: Uuid) -> bool {
        released(
            class,
            self.pending
                .remove_if(&class, |_, pending| pending.id == ticket),
        )
    }

    /// How long the request of `class` has been in flight.
    pub fn pending_for(&self, class: ActionClass) -> Option<Duration> {
        self.pending.get(&class).map(|pending| pending.elapsed())
    }

    /// Raise the flag and lower it when the returned scope is dropped, on
    /// success and error paths alike.
    pub fn scoped(&self, class: ActionClass) -> Option<PendingScope<'_>> {
        self.begin(class).map(|ticket| PendingScope {
            guard: self,
            class,
            ticket: ticket.id,
        })
    }

    /// Whether a request of `class` is in flight.
    pub fn is_pending(&self, class: ActionClass) -> bool {
        self.pending.contains_key(&class)
    }

    /// Whether any request is in flight.
    pub fn any_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop every flag (disconnect, reset). Returns how many were raised.
    pub fn clear(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

fn released(class: ActionClass, removed: Option<(ActionClass, PendingAction)>) -> bool {
    match removed {
        Some((_, pending)) => {
            debug!(
                ?class,
                elapsed_ms = pending.elapsed().as_millis() as u64,
                "action settled"
            );
            true
        }
        None => false,
    }
}

/// Keeps an action class flagged until dropped.
#[derive(Debug)]
pub struct PendingScope<'a> {
    guard: &'a ActionGuard,
    class: ActionClass,
    ticket: Uuid,
}

impl PendingScope<'_> {
    /// Class this scope holds.
    pub fn class(&self) -> ActionClass {
        self.class
    }
}

impl Drop for PendingScope<'_> {
    fn drop(&mut self) {
        self.guard.end_ticket(self.class, self.ticket);
    }
}
