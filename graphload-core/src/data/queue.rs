//! Bounded slot queue between producer and consumer
//!
//! A semaphore caps the number of undelivered slots at the queue capacity;
//! each slot carries its permit through the channel and releases it once
//! the consumer has taken it out. A full queue therefore suspends the
//! producer and an empty one suspends the consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use super::batch::Batch;
use crate::error::LoaderError;
use crate::metrics::LoaderStats;

/// One queue entry, carrying a delivered item of type `T`
#[derive(Debug)]
pub enum Slot<T = Batch> {
    Batch(T),
    /// A partition failed; `fatal` ends the pass
    Failed { error: LoaderError, fatal: bool },
    /// End-of-stream marker
    End,
}

/// Permit that tracks a pending slot
struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    pending: Arc<AtomicUsize>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Create a queue holding at most `capacity` undelivered slots
pub fn bounded<T>(capacity: usize, stats: Option<Arc<LoaderStats>>) -> (SlotSender<T>, SlotReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let semaphore = Arc::new(Semaphore::new(capacity));

    let sender = SlotSender {
        tx,
        semaphore: semaphore.clone(),
        pending: pending.clone(),
        stats,
    };
    let receiver = SlotReceiver {
        rx,
        semaphore,
        pending,
    };
    (sender, receiver)
}

/// Producer half
pub struct SlotSender<T = Batch> {
    tx: mpsc::Sender<(Slot<T>, SlotPermit)>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    /// Receives the queue depth high-water mark
    stats: Option<Arc<LoaderStats>>,
}

impl<T> SlotSender<T> {
    /// Push a slot, waiting while the queue is full.
    ///
    /// Hands the slot back when the consumer is gone.
    pub async fn send(&self, slot: Slot<T>) -> Result<(), Slot<T>> {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(slot),
        };
        let depth = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(stats) = &self.stats {
            stats.queue_high_water.set_max(depth as i64);
        }

        let permit = SlotPermit {
            _permit: permit,
            pending: self.pending.clone(),
        };
        self.tx.send((slot, permit)).await.map_err(|e| (e.0).0)
    }

    /// Slots pushed but not yet taken by the consumer
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer half is dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer half
pub struct SlotReceiver<T = Batch> {
    rx: mpsc::Receiver<(Slot<T>, SlotPermit)>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
}

impl<T> SlotReceiver<T> {
    /// Pop the next slot; `None` once every sender is gone and the queue is drained
    pub async fn recv(&mut self) -> Option<Slot<T>> {
        self.rx.recv().await.map(|(slot, _permit)| slot)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Close the queue and drop everything buffered.
    ///
    /// A producer waiting for capacity wakes up with its slot handed back.
    pub fn discard(&mut self) -> usize {
        self.semaphore.close();
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl<T> Drop for SlotReceiver<T> {
    fn drop(&mut self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn batch(partition: u32) -> Slot {
        Slot::Batch(Batch {
            partition: Some(partition),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_full_queue_suspends_producer() {
        let stats = LoaderStats::new();
        let (sender, mut receiver) = bounded(2, Some(stats.clone()));

        sender.send(batch(0)).await.unwrap();
        sender.send(batch(1)).await.unwrap();
        assert_eq!(sender.pending(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), sender.send(batch(2))).await;
        assert!(blocked.is_err());

        assert!(matches!(receiver.recv().await, Some(Slot::Batch(b)) if b.partition == Some(0)));
        assert_eq!(receiver.pending(), 1);

        sender.send(batch(3)).await.unwrap();
        assert_eq!(stats.queue_high_water.get(), 2);
    }

    #[tokio::test]
    async fn test_dropped_consumer_returns_slot() {
        let (sender, receiver) = bounded::<Batch>(1, None);
        drop(receiver);
        assert!(sender.is_closed());
        assert!(matches!(sender.send(Slot::End).await, Err(Slot::End)));
    }

    #[tokio::test]
    async fn test_discard_wakes_blocked_producer() {
        let (sender, mut receiver) = bounded(1, None);
        sender.send(batch(0)).await.unwrap();

        let sender = Arc::new(sender);
        let blocked = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(batch(1)).await.is_err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        receiver.discard();
        assert!(blocked.await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_releases_capacity() {
        let (sender, mut receiver) = bounded(2, None);
        sender.send(batch(0)).await.unwrap();
        sender.send(batch(1)).await.unwrap();

        assert_eq!(receiver.discard(), 2);
        assert_eq!(receiver.pending(), 0);
        assert!(sender.send(batch(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_after_senders_drop() {
        let (sender, mut receiver) = bounded::<Batch>(1, None);
        sender.send(Slot::End).await.unwrap();
        drop(sender);
        assert!(matches!(receiver.recv().await, Some(Slot::End)));
        assert!(receiver.recv().await.is_none());
    }
}
