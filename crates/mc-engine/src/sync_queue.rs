//! Sync Queue
//!
//! Bounded FIFO of dirty sector indices between the protocol machine and the
//! background context. Sized to the card's sector count so a full resync
//! fits. Duplicates are not coalesced: a sector written twice is persisted
//! twice.
//!
//! The real-time side blocks when the queue is full. That back-pressure is
//! the only unbounded wait it performs besides waiting for the next byte.

use mc_card::SECTOR_COUNT;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::EngineError;

/// Queue capacity: one entry per sector
pub const SYNC_QUEUE_CAPACITY: usize = SECTOR_COUNT as usize;

/// A dirty sector already counted against the swap predicate
///
/// Obtained from [`SharedCard::reserve_sync`](crate::SharedCard) under the
/// transaction lock and handed to [`SyncSender::enqueue`] after the lock is
/// released.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reserved sector blocks card swaps until it is enqueued"]
pub struct SyncTicket {
    index: u16,
}

impl SyncTicket {
    pub(crate) fn new(index: u16) -> Self {
        Self { index }
    }

    pub fn index(&self) -> u16 {
        self.index
    }
}

/// Create a sync queue with the given capacity
pub fn sync_queue(capacity: usize) -> (SyncSender, SyncReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SyncSender { tx }, SyncReceiver { rx })
}

/// Producer end, owned by the protocol machine
#[derive(Debug)]
pub struct SyncSender {
    tx: mpsc::Sender<u16>,
}

impl SyncSender {
    /// Queue a dirty sector, blocking while the queue is full
    ///
    /// Must not be called from inside an async runtime.
    pub fn enqueue(&self, ticket: SyncTicket) -> Result<(), EngineError> {
        trace!("Queueing sector {} for sync", ticket.index);
        self.tx
            .blocking_send(ticket.index)
            .map_err(|_| EngineError::SyncClosed)
    }
}

/// Consumer end, owned by the background context
#[derive(Debug)]
pub struct SyncReceiver {
    rx: mpsc::Receiver<u16>,
}

impl SyncReceiver {
    /// Wait for the next dirty sector; `None` once the producer is gone
    /// and the queue is empty
    pub async fn recv(&mut self) -> Option<u16> {
        self.rx.recv().await
    }

    /// Take the next dirty sector without waiting
    pub fn try_recv(&mut self) -> Option<u16> {
        self.rx.try_recv().ok()
    }
}
