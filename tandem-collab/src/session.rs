//! Session task and the handle the editor holds.
//!
//! Provides:
//! - Connection lifecycle (connect, retry with backoff, teardown)
//! - Operation send/receive over the room channel
//! - Offline queue for operations made while not connected
//! - Undo batching of local operations
//!
//! The session task is the only writer of connection status. It makes one
//! attempt through the [`TransportBinding`], pumps frames while connected,
//! and on an unexpected close schedules the next attempt:
//!
//! ```text
//!            ┌──────────── attempt ok ───────────┐
//!            │                                   ▼
//! connect ───┤                               Connected ── pump ── closed/protocol error
//!    ▲       │                                                         │
//!    │       └── attempt failed ──┐  ┌─────────────────────────────────┘
//!    │                            ▼  ▼
//!    └──── backoff ◄──── Reconnecting   (retries > max ─► Failed)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::backoff::Backoff;
use crate::error::{CallerError, CollabError};
use crate::identity::SessionIdentity;
use crate::protocol::{Frame, FrameKind, PeerPresence, ProtocolError};
use crate::status::{ConnectionStatus, StatusSubscription, StatusTracker};
use crate::transport::{ActiveChannel, TransportBinding, WsStream};
use crate::undo::{UndoBatcher, UndoUnit};

/// Events delivered to the editor, in the order they were received.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A channel opened and the join frame went out
    Connected { url: String },
    /// Operation from a remote peer
    RemoteUpdate {
        client_id: String,
        seq: u64,
        payload: Vec<u8>,
    },
    /// Ephemeral state from a remote peer
    RemoteAwareness { client_id: String, payload: Vec<u8> },
    PeerJoined(PeerPresence),
    PeerLeft { client_id: String },
    /// The channel delivered malformed data; it is being reconnected
    ProtocolError(ProtocolError),
    /// Offline queue was full; the operation was not sent
    OperationDropped { bytes: usize },
}

/// Offline queue for operations made while disconnected.
///
/// Queued operations are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Drain all queued operations for replay, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

pub(crate) enum Command {
    Update(Vec<u8>),
    Awareness(Vec<u8>),
    Shutdown,
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

type Writer = SplitSink<WsStream, Message>;

pub(crate) struct SessionTask {
    pub(crate) binding: TransportBinding,
    pub(crate) identity: SessionIdentity,
    pub(crate) backoff: Backoff,
    pub(crate) max_retry_attempts: u32,
    pub(crate) retries: Arc<AtomicU32>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) outbox: OfflineQueue,
    pub(crate) seq: u64,
}

impl SessionTask {
    fn status(&self) -> &StatusTracker {
        self.binding.status()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn run(mut self) {
        let room = self.identity.room_id.clone();
        loop {
            let binding = self.binding.clone();
            let identity = self.identity.clone();
            let attempt = match self.until_shutdown(binding.connect(&identity)).await {
                Some(attempt) => attempt,
                None => return self.finish(),
            };

            let reason = match attempt {
                Ok(channel) => {
                    self.status().transition(ConnectionStatus::Connected);
                    self.retries.store(0, Ordering::SeqCst);
                    log::info!("room {room}: connected via {}", binding.strategy().kind());
                    match self.pump(channel).await {
                        PumpExit::Shutdown => return self.finish(),
                        PumpExit::Lost(reason) => {
                            // Connected cannot go straight to Failed.
                            self.status().transition(ConnectionStatus::Reconnecting);
                            reason
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            let retry = self.retries.load(Ordering::SeqCst) + 1;
            if retry > self.max_retry_attempts {
                log::warn!(
                    "room {room}: giving up after {} retries: {reason}",
                    self.max_retry_attempts
                );
                self.status().transition(ConnectionStatus::Failed { reason });
                return;
            }
            self.retries.store(retry, Ordering::SeqCst);
            self.status().transition(ConnectionStatus::Reconnecting);

            let delay = self.backoff.delay(retry);
            log::info!(
                "room {room}: {reason}; retry {retry}/{} in {}ms",
                self.max_retry_attempts,
                delay.as_millis()
            );
            if self.until_shutdown(tokio::time::sleep(delay)).await.is_none() {
                return self.finish();
            }
        }
    }

    fn finish(&self) {
        self.status().transition(ConnectionStatus::Disconnected);
        log::info!("room {}: disconnected", self.identity.room_id);
    }

    /// Drive `fut` while servicing commands. Returns `None` if shutdown was
    /// requested first; `fut` is dropped, cancelling it.
    async fn until_shutdown<F: std::future::Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Update(op)) => self.queue_offline(op),
                    Some(Command::Awareness(_)) => {}
                    Some(Command::Shutdown) | None => return None,
                },
                out = &mut fut => return Some(out),
            }
        }
    }

    fn queue_offline(&mut self, op: Vec<u8>) {
        let bytes = op.len();
        if !self.outbox.enqueue(op) {
            log::warn!(
                "room {}: offline queue full, dropping {bytes}-byte operation",
                self.identity.room_id
            );
            self.emit(SessionEvent::OperationDropped { bytes });
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn pump(&mut self, channel: ActiveChannel) -> PumpExit {
        let ActiveChannel { stream, url, .. } = channel;
        let (mut writer, mut reader) = stream.split();

        let join = match Frame::join(&self.identity) {
            Ok(frame) => frame,
            Err(e) => return PumpExit::Lost(e.to_string()),
        };
        if let Err(reason) = write_frame(&mut writer, &join).await {
            return PumpExit::Lost(reason);
        }
        self.emit(SessionEvent::Connected { url });

        let queued = self.outbox.drain();
        if !queued.is_empty() {
            log::info!("replaying {} queued operations", queued.len());
        }
        let mut queued = queued.into_iter();
        while let Some(op) = queued.next() {
            if let Err(reason) = self.send_update(&mut writer, op).await {
                for rest in queued {
                    self.queue_offline(rest);
                }
                return PumpExit::Lost(reason);
            }
        }

        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Update(op)) => {
                        if let Err(reason) = self.send_update(&mut writer, op).await {
                            return PumpExit::Lost(reason);
                        }
                    }
                    Some(Command::Awareness(state)) => {
                        let seq = self.next_seq();
                        let frame = Frame::awareness(&self.identity, seq, state);
                        if let Err(reason) = write_frame(&mut writer, &frame).await {
                            return PumpExit::Lost(reason);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = write_frame(&mut writer, &Frame::leave(&self.identity)).await;
                        let _ = writer.send(Message::Close(None)).await;
                        return PumpExit::Shutdown;
                    }
                },
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let handled = match Frame::decode(&data) {
                            Ok(frame) => self.dispatch(frame, &mut writer).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = handled {
                            return self.protocol_error(e);
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        return self.protocol_error(ProtocolError::UnexpectedText);
                    }
                    Some(Ok(Message::Close(_))) => {
                        return PumpExit::Lost("channel closed by remote".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpExit::Lost(format!("channel error: {e}")),
                    None => return PumpExit::Lost("channel ended".to_string()),
                },
            }
        }
    }

    /// Send an operation; on write failure it goes back to the offline queue.
    async fn send_update(&mut self, writer: &mut Writer, op: Vec<u8>) -> Result<(), String> {
        let seq = self.next_seq();
        let frame = Frame::update(&self.identity, seq, op);
        match write_frame(writer, &frame).await {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.queue_offline(frame.payload);
                Err(reason)
            }
        }
    }

    fn protocol_error(&self, e: ProtocolError) -> PumpExit {
        log::warn!("room {}: {e}; tearing down channel", self.identity.room_id);
        self.emit(SessionEvent::ProtocolError(e.clone()));
        PumpExit::Lost(format!("protocol error: {e}"))
    }

    async fn dispatch(&mut self, frame: Frame, writer: &mut Writer) -> Result<(), ProtocolError> {
        // Skip our own messages echoed back by the room.
        if frame.client_id == self.identity.client_id {
            return Ok(());
        }
        log::debug!("frame {:?} seq {} from {}", frame.kind, frame.seq, frame.client_id);
        match frame.kind {
            FrameKind::Update => self.emit(SessionEvent::RemoteUpdate {
                client_id: frame.client_id,
                seq: frame.seq,
                payload: frame.payload,
            }),
            FrameKind::Awareness => self.emit(SessionEvent::RemoteAwareness {
                client_id: frame.client_id,
                payload: frame.payload,
            }),
            FrameKind::Join => {
                let presence = frame.presence()?;
                self.emit(SessionEvent::PeerJoined(presence));
            }
            FrameKind::Leave => self.emit(SessionEvent::PeerLeft {
                client_id: frame.client_id,
            }),
            FrameKind::Ping => {
                // A failed pong surfaces as a read error on the next poll.
                let _ = write_frame(writer, &Frame::pong(&self.identity)).await;
            }
            FrameKind::Pong => {}
        }
        Ok(())
    }
}

async fn write_frame(writer: &mut Writer, frame: &Frame) -> Result<(), String> {
    let encoded = frame.encode().map_err(|e| e.to_string())?;
    writer
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| format!("channel write failed: {e}"))
}

/// The adapter's single session slot. At most one handle holds it.
#[derive(Default)]
pub(crate) struct SessionSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    open: bool,
    /// Task of a dropped handle that may still be tearing down
    teardown: Option<JoinHandle<()>>,
}

impl SessionSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn claim(self: &Arc<Self>) -> Result<SlotClaim, CallerError> {
        let mut state = self.state();
        if state.open {
            return Err(CallerError::AlreadyOpen);
        }
        state.open = true;
        Ok(SlotClaim {
            slot: self.clone(),
            committed: false,
        })
    }

    /// Hand back the slot, leaving `teardown` for the next `open` to await.
    pub(crate) fn release(&self, teardown: Option<JoinHandle<()>>) {
        let mut state = self.state();
        state.open = false;
        if teardown.is_some() {
            state.teardown = teardown;
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state().open
    }
}

/// Claimed slot during `open`. Released on drop unless committed, so every
/// early return or panic in `open` frees the slot.
pub(crate) struct SlotClaim {
    slot: Arc<SessionSlot>,
    committed: bool,
}

impl SlotClaim {
    pub(crate) fn take_teardown(&self) -> Option<JoinHandle<()>> {
        self.slot.state().teardown.take()
    }

    pub(crate) fn commit(mut self) -> Arc<SessionSlot> {
        self.committed = true;
        self.slot.clone()
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        if !self.committed {
            self.slot.release(None);
        }
    }
}

/// An open collaboration session.
///
/// Dropping the handle flushes the pending undo batch and disconnects; use
/// [`SessionHandle::close`] to also wait for the teardown to finish.
pub struct SessionHandle {
    identity: SessionIdentity,
    status: StatusTracker,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    undo: UndoBatcher<Vec<u8>>,
    task: Option<JoinHandle<()>>,
    slot: Arc<SessionSlot>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.identity)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        identity: SessionIdentity,
        status: StatusTracker,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        undo: UndoBatcher<Vec<u8>>,
        task: JoinHandle<()>,
        slot: Arc<SessionSlot>,
    ) -> Self {
        Self {
            identity,
            status,
            commands,
            events: Some(events),
            undo,
            task: Some(task),
            slot,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
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

    /// Take the inbound event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Take the sealed undo-unit receiver (can only be called once).
    pub fn take_undo_units(&mut self) -> Option<mpsc::UnboundedReceiver<UndoUnit<Vec<u8>>>> {
        self.undo.take_units()
    }

    /// Record a local document operation: it joins the open undo batch and
    /// is sent to the room (queued while offline).
    ///
    /// The operation enters undo history even when the session has ended;
    /// the error only reports that it will not reach peers.
    pub fn record_operation(&self, op: Vec<u8>) -> Result<(), CollabError> {
        self.undo.record(op.clone());
        self.commands
            .send(Command::Update(op))
            .map_err(|_| CollabError::SessionEnded)
    }

    /// Send ephemeral state (cursor, selection). Not undoable, not queued.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), CollabError> {
        self.commands
            .send(Command::Awareness(payload))
            .map_err(|_| CollabError::SessionEnded)
    }

    /// Seal the open undo batch now. `false` if nothing was pending.
    pub fn flush(&self) -> bool {
        self.undo.flush()
    }

    /// Flush, disconnect, and wait for the channel to be torn down.
    pub async fn close(mut self) {
        self.undo.flush();
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("session task ended abnormally: {e}");
            }
        }
        self.slot.release(None);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // `close` already released the slot.
        if let Some(task) = self.task.take() {
            self.undo.flush();
            let _ = self.commands.send(Command::Shutdown);
            self.slot.release(Some(task));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);

        assert!(queue.enqueue(vec![1]));
        assert!(queue.enqueue(vec![2]));
        assert!(queue.enqueue(vec![3]));
        assert!(!queue.enqueue(vec![4]));

        assert_eq!(queue.len(), 3);
    }
}
