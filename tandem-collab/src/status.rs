//! Connection status state machine.
//!
//! ```text
//! Idle ─► Negotiating ─► Connecting ─► Connected
//!   │          │             ▲  │          │
//!   │          ▼             │  ▼          ▼
//!   │     Reconnecting ◄─────┴──┴──── Reconnecting
//!   │          │
//!   ▼          ▼
//! Disconnected / Failed
//! ```
//!
//! Only the session task drives transitions; everything else observes through
//! [`StatusTracker::subscribe`] or [`StatusTracker::current`]. Out-of-order
//! transitions are dropped and logged rather than propagated.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Client connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Negotiating,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    /// Retries exhausted. Carries the last known failure reason.
    Failed { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn same_variant(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Whether the state machine permits `self -> next`. `Failed -> Idle` is
    /// reachable only through [`StatusTracker::reset`].
    pub fn can_transition_to(&self, next: &ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Negotiating | Connecting | Disconnected)
                | (Negotiating, Connecting | Reconnecting | Disconnected | Failed { .. })
                | (Connecting, Connected | Reconnecting | Disconnected | Failed { .. })
                | (Connected, Reconnecting | Disconnected)
                | (Reconnecting, Negotiating | Connecting | Disconnected | Failed { .. })
                | (Disconnected, Negotiating | Connecting | Idle)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

type Callback = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

struct TrackerState {
    status: ConnectionStatus,
    subscribers: BTreeMap<u64, Callback>,
    /// Changes not yet delivered to subscribers, oldest first
    pending: VecDeque<ConnectionStatus>,
    /// Some caller is draining `pending`
    dispatching: bool,
}

struct TrackerShared {
    state: Mutex<TrackerState>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, cloneable view of one adapter's connection status.
#[derive(Clone)]
pub struct StatusTracker {
    shared: Arc<TrackerShared>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("status", &self.current())
            .finish()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                state: Mutex::new(TrackerState {
                    status: ConnectionStatus::Idle,
                    subscribers: BTreeMap::new(),
                    pending: VecDeque::new(),
                    dispatching: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        lock(&self.shared.state).status.clone()
    }

    /// Register `callback` for every future status change. Dropping the
    /// returned guard unsubscribes.
    ///
    /// Callbacks run on the task that made the change. They may read
    /// [`Self::current`] and may call back into the adapter (for example
    /// `reset` on `Failed`); changes made from a callback are delivered after
    /// the current one. Callbacks must not block.
    pub fn subscribe<F>(&self, callback: F) -> StatusSubscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.state)
            .subscribers
            .insert(id, Arc::new(callback));
        StatusSubscription {
            id,
            tracker: Arc::downgrade(&self.shared),
        }
    }

    /// Apply `next` if the state machine allows it and notify subscribers.
    ///
    /// Returns `true` when the status actually changed. Repeating the current
    /// variant is a silent no-op; a disallowed transition is logged as an
    /// invariant violation and ignored.
    pub(crate) fn transition(&self, next: ConnectionStatus) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.status.same_variant(&next) {
                return false;
            }
            if !state.status.can_transition_to(&next) {
                log::warn!(
                    "invariant violation: rejected status transition {} -> {}",
                    state.status,
                    next
                );
                return false;
            }
            log::debug!("status {} -> {}", state.status, next);
            state.status = next.clone();
            state.pending.push_back(next);
        }
        self.dispatch();
        true
    }

    /// Leave a terminal `Failed` state. Also accepted from `Disconnected`;
    /// anything else is left alone.
    pub(crate) fn reset(&self) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if !matches!(
                state.status,
                ConnectionStatus::Failed { .. } | ConnectionStatus::Disconnected
            ) {
                return false;
            }
            state.status = ConnectionStatus::Idle;
            state.pending.push_back(ConnectionStatus::Idle);
        }
        self.dispatch();
        true
    }

    /// Deliver queued changes in order. Only one caller drains at a time; a
    /// change queued meanwhile (including from inside a callback) is picked
    /// up by the active drainer, so no lock is held while callbacks run.
    fn dispatch(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        let _unwind = DispatchGuard(&self.shared);
        loop {
            let (status, callbacks) = {
                let mut state = lock(&self.shared.state);
                match state.pending.pop_front() {
                    Some(status) => {
                        let callbacks = state.subscribers.values().cloned().collect::<Vec<_>>();
                        (status, callbacks)
                    }
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            for callback in callbacks {
                callback(&status);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock(&self.shared.state).subscribers.len()
    }
}

/// Clears the dispatching flag if a callback panics.
struct DispatchGuard<'a>(&'a TrackerShared);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(&self.0.state).dispatching = false;
        }
    }
}

/// Live status subscription; unsubscribes on drop.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct StatusSubscription {
    id: u64,
    tracker: Weak<TrackerShared>,
}

impl StatusSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.tracker.upgrade() {
            lock(&shared.state).subscribers.remove(&self.id);
        }
    }
}
