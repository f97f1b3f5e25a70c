//! Undo batching.
//!
//! Rapid local edits (typing, dragging) coalesce into a single undo unit.
//! Each recorded operation re-arms a `capture_timeout` deadline; when the
//! deadline passes with no new operation the batch is sealed. `flush` seals
//! immediately and is used before teardown so a pending batch is never lost.
//!
//! The timer runs on the tokio clock, so tests drive it with
//! `#[tokio::test(start_paused = true)]` instead of wall-clock sleeps.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealCause {
    /// The capture window elapsed without new operations.
    Timeout,
    /// An explicit flush.
    Flush,
}

/// One entry in the undo history.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoUnit<T> {
    /// Operations in the order they were recorded
    pub ops: Vec<T>,
    pub opened_at: Instant,
    pub sealed_at: Instant,
    pub cause: SealCause,
}

struct Batch<T> {
    pending: Vec<T>,
    opened_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl<T> Batch<T> {
    fn seal(&mut self, cause: SealCause) -> Option<UndoUnit<T>> {
        self.deadline = None;
        let opened_at = self.opened_at.take()?;
        if self.pending.is_empty() {
            return None;
        }
        Some(UndoUnit {
            ops: std::mem::take(&mut self.pending),
            opened_at,
            sealed_at: Instant::now(),
            cause,
        })
    }
}

struct Shared<T> {
    batch: Mutex<Batch<T>>,
    rearm: Notify,
    units_tx: mpsc::UnboundedSender<UndoUnit<T>>,
    capture_timeout: Duration,
}

impl<T> Shared<T> {
    fn batch(&self) -> MutexGuard<'_, Batch<T>> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, unit: UndoUnit<T>) {
        log::debug!("undo unit sealed ({:?}, {} ops)", unit.cause, unit.ops.len());
        // Receiver gone means nobody tracks history anymore.
        let _ = self.units_tx.send(unit);
    }
}

/// Coalesces operations into undo units.
pub struct UndoBatcher<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    units_rx: Option<mpsc::UnboundedReceiver<UndoUnit<T>>>,
    timer: JoinHandle<()>,
}

impl<T: Send + 'static> UndoBatcher<T> {
    /// Create a batcher and start its timer task. Must be called from within
    /// a tokio runtime.
    pub fn new(capture_timeout: Duration) -> Self {
        let (units_tx, units_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            batch: Mutex::new(Batch {
                pending: Vec::new(),
                opened_at: None,
                deadline: None,
            }),
            rearm: Notify::new(),
            units_tx,
            capture_timeout,
        });
        let timer = tokio::spawn(run_timer(shared.clone()));
        Self {
            shared,
            units_rx: Some(units_rx),
            timer,
        }
    }

    /// Take the sealed-unit receiver (can only be called once).
    pub fn take_units(&mut self) -> Option<mpsc::UnboundedReceiver<UndoUnit<T>>> {
        self.units_rx.take()
    }

    /// Append `op` to the open batch, opening one if needed, and restart the
    /// capture window.
    pub fn record(&self, op: T) {
        let now = Instant::now();
        {
            let mut batch = self.shared.batch();
            if batch.opened_at.is_none() {
                batch.opened_at = Some(now);
            }
            batch.pending.push(op);
            batch.deadline = Some(now + self.shared.capture_timeout);
        }
        self.shared.rearm.notify_one();
    }

    /// Seal the open batch now. Returns `false` (and emits nothing) when no
    /// operations are pending.
    pub fn flush(&self) -> bool {
        let unit = self.shared.batch().seal(SealCause::Flush);
        match unit {
            Some(unit) => {
                self.shared.emit(unit);
                self.shared.rearm.notify_one();
                true
            }
            None => false,
        }
    }

    /// Number of operations in the open batch.
    pub fn pending_len(&self) -> usize {
        self.shared.batch().pending.len()
    }
}

impl<T: Send + 'static> Drop for UndoBatcher<T> {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

async fn run_timer<T>(shared: Arc<Shared<T>>) {
    loop {
        let deadline = shared.batch().deadline;
        match deadline {
            None => shared.rearm.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let unit = {
                            let mut batch = shared.batch();
                            // A record() may have pushed the deadline out
                            // between waking and taking the lock.
                            match batch.deadline {
                                Some(current) if current <= Instant::now() => {
                                    batch.seal(SealCause::Timeout)
                                }
                                _ => None,
                            }
                        };
                        if let Some(unit) = unit {
                            shared.emit(unit);
                        }
                    }
                    _ = shared.rearm.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    const WINDOW: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_burst_becomes_single_unit() {
        let mut batcher = UndoBatcher::new(WINDOW);
        let mut units = batcher.take_units().unwrap();
        let start = Instant::now();

        batcher.record("op0");
        sleep(Duration::from_millis(100)).await;
        batcher.record("op1");
        sleep(Duration::from_millis(100)).await;
        batcher.record("op2");

        let unit = units.recv().await.unwrap();
        assert_eq!(unit.ops, vec!["op0", "op1", "op2"]);
        assert_eq!(unit.cause, SealCause::Timeout);
        assert_eq!(unit.opened_at, start);
        assert_eq!(unit.sealed_at - start, Duration::from_millis(700));
        assert!(units.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_ops_become_separate_units() {
        let mut batcher = UndoBatcher::new(WINDOW);
        let mut units = batcher.take_units().unwrap();

        for op in 0..3 {
            batcher.record(op);
            sleep(Duration::from_millis(600)).await;
        }

        for expected in 0..3 {
            let unit = units.recv().await.unwrap();
            assert_eq!(unit.ops, vec![expected]);
        }
        assert!(units.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_seals_immediately() {
        let mut batcher = UndoBatcher::new(WINDOW);
        let mut units = batcher.take_units().unwrap();

        batcher.record(1);
        batcher.record(2);
        assert_eq!(batcher.pending_len(), 2);
        assert!(batcher.flush());
        assert_eq!(batcher.pending_len(), 0);

        let unit = units.try_recv().unwrap();
        assert_eq!(unit.ops, vec![1, 2]);
        assert_eq!(unit.cause, SealCause::Flush);

        // The cancelled window must not fire an empty unit later.
        sleep(WINDOW * 2).await;
        assert!(units.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_emits_nothing() {
        let mut batcher = UndoBatcher::<u8>::new(WINDOW);
        let mut units = batcher.take_units().unwrap();

        assert!(!batcher.flush());
        assert!(units.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_after_seal() {
        let mut batcher = UndoBatcher::new(WINDOW);
        let mut units = batcher.take_units().unwrap();

        batcher.record('a');
        assert!(batcher.flush());
        batcher.record('b');

        assert_eq!(units.recv().await.unwrap().ops, vec!['a']);
        let second = units.recv().await.unwrap();
        assert_eq!(second.ops, vec!['b']);
        assert_eq!(second.cause, SealCause::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_recorders_lose_nothing() {
        let mut batcher = UndoBatcher::new(WINDOW);
        let mut units = batcher.take_units().unwrap();
        let batcher = Arc::new(batcher);

        let mut tasks = Vec::new();
        for source in 0..4u32 {
            let batcher = batcher.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    batcher.record(source * 100 + i);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let unit = units.recv().await.unwrap();
        assert_eq!(unit.ops.len(), 100);
        for source in 0..4u32 {
            let from_source: Vec<u32> = unit
                .ops
                .iter()
                .copied()
                .filter(|op| op / 100 == source)
                .collect();
            let expected: Vec<u32> = (0..25).map(|i| source * 100 + i).collect();
            assert_eq!(from_source, expected);
        }
    }
}
