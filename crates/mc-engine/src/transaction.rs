//! The transaction lock
//!
//! [`SharedCard`] holds the live card image and its name behind a single
//! mutex. The protocol machine takes it for every tick; the background
//! context takes it only for the in-memory predicate check, sector snapshots
//! and the handle swap itself.
//!
//! Two counters live beside the lock so the "safe to switch" predicate can be
//! polled without it: whether a write transaction is open, and how many
//! dirty sectors have been queued but not yet persisted.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use mc_card::{CardImage, CardName};
use parking_lot::{Mutex, MutexGuard};

use crate::sync_queue::SyncTicket;

/// State guarded by the transaction lock
#[derive(Debug)]
pub struct CardSession {
    /// The live card image
    pub card: CardImage,
    /// File the image is persisted to; also the "last used" pointer
    pub name: CardName,
}

/// Live card image shared by the real-time and background contexts
#[derive(Debug)]
pub struct SharedCard {
    session: Mutex<CardSession>,
    write_in_progress: CachePadded<AtomicBool>,
    pending_sync: CachePadded<AtomicUsize>,
}

impl SharedCard {
    pub fn new(name: CardName, card: CardImage) -> Self {
        Self {
            session: Mutex::new(CardSession { card, name }),
            write_in_progress: CachePadded::new(AtomicBool::new(false)),
            pending_sync: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire the transaction lock
    pub fn lock(&self) -> MutexGuard<'_, CardSession> {
        self.session.lock()
    }

    /// Name of the live card
    pub fn name(&self) -> CardName {
        self.session.lock().name.clone()
    }

    /// No write transaction open and every queued sector persisted
    ///
    /// Only authoritative while the transaction lock is held.
    pub fn is_safe_to_switch(&self) -> bool {
        !self.write_in_progress() && self.pending_sync() == 0
    }

    pub fn write_in_progress(&self) -> bool {
        self.write_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_in_progress(&self, open: bool) {
        self.write_in_progress.store(open, Ordering::Release);
    }

    /// Sectors queued for persistence and not yet completed
    pub fn pending_sync(&self) -> usize {
        self.pending_sync.load(Ordering::Acquire)
    }

    /// Count a dirty sector against the predicate before it is queued
    ///
    /// Must be called with the transaction lock held, so a swap that has
    /// re-checked the predicate under the lock cannot miss it.
    pub(crate) fn reserve_sync(&self, index: u16) -> SyncTicket {
        self.pending_sync.fetch_add(1, Ordering::AcqRel);
        SyncTicket::new(index)
    }

    /// A queued sector has been persisted or given up on
    pub(crate) fn complete_sync(&self) {
        // Never wraps: every completion pairs with an earlier reservation
        let _ = self
            .pending_sync
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
