//! Composition root: the object an editor session holds.
//!
//! The adapter selects the transport from configuration, owns the connection
//! status, and hands out at most one [`SessionHandle`] at a time. One adapter
//! per `(room, client)` pair is assumed; two adapters for the same pair are
//! not detected.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{CollabConfig, TransportConfig};
use crate::error::{CallerError, CollabError};
use crate::identity::{IdentityProvider, SessionIdentity};
use crate::negotiate::{HttpNegotiator, Negotiator};
use crate::session::{OfflineQueue, SessionHandle, SessionSlot, SessionTask};
use crate::status::{ConnectionStatus, StatusSubscription, StatusTracker};
use crate::transport::{TransportBinding, TransportStrategy};
use crate::undo::UndoBatcher;

pub struct CollabAdapter {
    config: CollabConfig,
    strategy: TransportStrategy,
    identity: Arc<dyn IdentityProvider>,
    status: StatusTracker,
    retries: Arc<AtomicU32>,
    slot: Arc<SessionSlot>,
}

impl fmt::Debug for CollabAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollabAdapter")
            .field("strategy", &self.strategy)
            .field("status", &self.status.current())
            .field("open", &self.slot.is_open())
            .finish_non_exhaustive()
    }
}

impl CollabAdapter {
    /// Build an adapter from configuration. The managed transport negotiates
    /// over HTTP against `negotiate_url`.
    pub fn new(
        config: CollabConfig,
        identity: impl IdentityProvider + 'static,
    ) -> Result<Self, CollabError> {
        config.validate()?;
        let strategy = match &config.transport {
            TransportConfig::Direct { ws_base } => TransportStrategy::Direct {
                ws_base: ws_base.clone(),
            },
            TransportConfig::Managed { negotiate_url } => TransportStrategy::Managed {
                negotiator: Arc::new(HttpNegotiator::new(negotiate_url.clone())),
            },
        };
        Ok(Self::from_parts(config, strategy, Arc::new(identity)))
    }

    /// Build a managed-transport adapter around a custom negotiation
    /// capability. The transport section of `config` is ignored; every other
    /// setting is validated as in [`CollabAdapter::new`].
    pub fn with_negotiator(
        config: CollabConfig,
        identity: impl IdentityProvider + 'static,
        negotiator: impl Negotiator + 'static,
    ) -> Result<Self, CollabError> {
        config.validate_limits()?;
        let strategy = TransportStrategy::Managed {
            negotiator: Arc::new(negotiator),
        };
        Ok(Self::from_parts(config, strategy, Arc::new(identity)))
    }

    fn from_parts(
        config: CollabConfig,
        strategy: TransportStrategy,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        log::debug!("collaboration adapter using {} transport", strategy.kind());
        Self {
            config,
            strategy,
            identity,
            status: StatusTracker::new(),
            retries: Arc::new(AtomicU32::new(0)),
            slot: Arc::new(SessionSlot::default()),
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn strategy(&self) -> &TransportStrategy {
        &self.strategy
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current()
    }

    pub fn subscribe<F>(&self, callback: F) -> StatusSubscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(callback)
    }

    /// Consecutive failed retries of the current session.
    pub fn retry_attempts(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.slot.is_open()
    }

    /// Open a session on `room_id` and start connecting in the background.
    ///
    /// Fails with [`CallerError::AlreadyOpen`] while another handle is live
    /// and with [`CallerError::ResetRequired`] after the previous session
    /// ended in `Failed`. Waits for a dropped handle's teardown to finish
    /// before starting.
    pub async fn open(&self, room_id: impl Into<String>) -> Result<SessionHandle, CollabError> {
        let claim = self.slot.claim()?;
        if self.status.current().is_failed() {
            return Err(CallerError::ResetRequired.into());
        }
        if let Some(previous) = claim.take_teardown() {
            if let Err(e) = previous.await {
                log::warn!("previous session task ended abnormally: {e}");
            }
        }

        let identity = SessionIdentity::new(room_id, self.identity.get_user()?);
        log::info!(
            "opening room {} as {}/{}",
            identity.room_id,
            identity.user_id,
            identity.client_id
        );

        self.retries.store(0, Ordering::SeqCst);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            binding: TransportBinding::new(
                self.strategy.clone(),
                self.config.connect_timeout(),
                self.status.clone(),
            ),
            identity: identity.clone(),
            backoff: self.config.backoff(),
            max_retry_attempts: self.config.max_retry_attempts,
            retries: self.retries.clone(),
            commands: commands_rx,
            events: events_tx,
            outbox: OfflineQueue::new(self.config.offline_queue_capacity),
            seq: 0,
        };
        let undo = UndoBatcher::new(self.config.capture_timeout());
        let task = tokio::spawn(task.run());

        Ok(SessionHandle::new(
            identity,
            self.status.clone(),
            commands_tx,
            events_rx,
            undo,
            task,
            claim.commit(),
        ))
    }

    /// Leave the `Failed` state so the adapter can be opened again, and clear
    /// retry counters. Returns `false` (touching nothing) if there was nothing
    /// to reset, for example while a session is still retrying.
    ///
    /// Safe to call from a status callback.
    pub fn reset(&self) -> bool {
        if !self.status.reset() {
            return false;
        }
        self.retries.store(0, Ordering::SeqCst);
        log::info!("collaboration adapter reset");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectError;
    use crate::identity::{IdentityError, StaticIdentity, UserIdentity};
    use crate::negotiate::ConnectionDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct RefusingNegotiator;

    #[async_trait]
    impl Negotiator for RefusingNegotiator {
        async fn negotiate(&self, _: &str, _: &str) -> Result<ConnectionDescriptor, ConnectError> {
            Err(ConnectError::NegotiationFailed("HTTP 500".into()))
        }
    }

    fn user() -> StaticIdentity {
        StaticIdentity(UserIdentity::new("alice", "client-a"))
    }

    fn quick_config(max_retry_attempts: u32) -> CollabConfig {
        CollabConfig {
            max_retry_attempts,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
            connect_timeout_ms: 200,
            ..CollabConfig::managed("http://unused.invalid/negotiate")
        }
    }

    fn refusing(max_retry_attempts: u32) -> CollabAdapter {
        CollabAdapter::with_negotiator(quick_config(max_retry_attempts), user(), RefusingNegotiator)
            .unwrap()
    }

    fn record(adapter: &CollabAdapter) -> (StatusSubscription, Arc<Mutex<Vec<ConnectionStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = adapter.subscribe(move |s| sink.lock().unwrap().push(s.clone()));
        (sub, seen)
    }

    async fn wait_for_failed(adapter: &CollabAdapter) {
        while !adapter.status().is_failed() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_new_selects_strategy_from_config() {
        let direct = CollabAdapter::new(CollabConfig::direct("ws://localhost:9"), user()).unwrap();
        assert_eq!(direct.strategy().kind(), "direct");

        let managed =
            CollabAdapter::new(CollabConfig::managed("http://localhost:9/negotiate"), user()).unwrap();
        assert_eq!(managed.strategy().kind(), "managed");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = CollabAdapter::new(CollabConfig::direct("localhost:9"), user()).unwrap_err();
        assert!(matches!(err, CollabError::Config(_)));
    }

    #[test]
    fn test_with_negotiator_validates_limits() {
        let empty_queue = CollabConfig {
            offline_queue_capacity: 0,
            ..quick_config(3)
        };
        let err = CollabAdapter::with_negotiator(empty_queue, user(), RefusingNegotiator).unwrap_err();
        assert!(matches!(err, CollabError::Config(_)));

        let inverted_backoff = CollabConfig {
            backoff_base_ms: 5_000,
            backoff_max_ms: 100,
            ..quick_config(3)
        };
        let err =
            CollabAdapter::with_negotiator(inverted_backoff, user(), RefusingNegotiator).unwrap_err();
        assert!(matches!(err, CollabError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_500_exhausts_retries() {
        let adapter = refusing(3);
        let (_sub, seen) = record(&adapter);

        let _handle = adapter.open("room-1").await.unwrap();
        wait_for_failed(&adapter).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ConnectionStatus::Negotiating,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Negotiating,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Negotiating,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Negotiating,
                ConnectionStatus::Failed {
                    reason: "negotiation failed: HTTP 500".into()
                },
            ]
        );
        assert!(!seen.contains(&ConnectionStatus::Connected));
        assert_eq!(adapter.retry_attempts(), 3);

        // No further automatic retries once failed.
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert_eq!(adapter.status(), seen.last().unwrap().clone());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_open_is_caller_error() {
        let adapter = refusing(1_000);
        let handle = adapter.open("room-1").await.unwrap();
        let before = adapter.status();

        let err = adapter.open("room-1").await.unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::AlreadyOpen));
        assert!(adapter.is_open());
        assert_eq!(handle.identity().room_id, "room-1");
        assert_eq!(adapter.status(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requires_reset() {
        let adapter = refusing(0);
        let handle = adapter.open("room-1").await.unwrap();
        wait_for_failed(&adapter).await;
        handle.close().await;

        let err = adapter.open("room-1").await.unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::ResetRequired));
        assert!(!adapter.is_open());

        assert!(adapter.reset());
        assert_eq!(adapter.status(), ConnectionStatus::Idle);
        assert_eq!(adapter.retry_attempts(), 0);
        let _handle = adapter.open("room-1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_disconnects_and_allows_reopen() {
        let adapter = refusing(1_000);
        let handle = adapter.open("room-1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        handle.close().await;
        assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
        assert!(!adapter.is_open());

        let (_sub, seen) = record(&adapter);
        let _handle = adapter.open("room-2").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(seen.lock().unwrap().first(), Some(&ConnectionStatus::Negotiating));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_flushes_and_releases() {
        let adapter = refusing(1_000);
        let mut handle = adapter.open("room-1").await.unwrap();
        let mut units = handle.take_undo_units().unwrap();

        handle.record_operation(vec![1]).unwrap();
        handle.record_operation(vec![2]).unwrap();
        drop(handle);

        let unit = units.recv().await.unwrap();
        assert_eq!(unit.ops, vec![vec![1], vec![2]]);
        assert!(!adapter.is_open());

        // Reopen waits for the dropped session's teardown.
        let _handle = adapter.open("room-1").await.unwrap();
        assert!(adapter.is_open());
    }

    #[tokio::test]
    async fn test_identity_failure_releases_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(IdentityError("not signed in".into()))
            } else {
                Ok(UserIdentity::new("alice", "client-a"))
            }
        };
        let adapter =
            CollabAdapter::with_negotiator(quick_config(1_000), provider, RefusingNegotiator).unwrap();

        let err = adapter.open("room-1").await.unwrap_err();
        assert!(matches!(err, CollabError::Identity(_)));
        assert!(!adapter.is_open());

        let handle = adapter.open("room-1").await.unwrap();
        assert_eq!(handle.identity().user_id, "alice");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refused_while_retrying_keeps_budget() {
        let adapter = refusing(1_000);
        let _handle = adapter.open("room-1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let retries = adapter.retry_attempts();
        assert!(retries > 0);
        assert!(!adapter.reset());
        assert_eq!(adapter.retry_attempts(), retries);
        assert!(!adapter.status().is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_from_status_callback() {
        let adapter = Arc::new(refusing(0));
        let (_rec, seen) = record(&adapter);
        let weak = Arc::downgrade(&adapter);
        let _auto_reset = adapter.subscribe(move |status| {
            if status.is_failed() {
                if let Some(adapter) = weak.upgrade() {
                    adapter.reset();
                }
            }
        });

        let handle = adapter.open("room-1").await.unwrap();
        while !seen.lock().unwrap().contains(&ConnectionStatus::Idle) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.close())
            .await
            .expect("close hung after reset from callback");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatus::Negotiating,
                ConnectionStatus::Failed {
                    reason: "negotiation failed: HTTP 500".into()
                },
                ConnectionStatus::Idle,
            ]
        );
        assert_eq!(adapter.status(), ConnectionStatus::Idle);
        let _reopened = adapter.open("room-1").await.unwrap();
    }
}
