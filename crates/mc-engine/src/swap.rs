//! Swap Coordinator
//!
//! Services the pending request slot from the background context:
//!
//! 1. debounce (per [`DebouncePolicy`])
//! 2. directory walks are answered straight from the live card
//! 3. swaps resolve and validate the target off the lock, stage it, then
//!    swap under the lock once the "safe to switch" predicate holds
//! 4. a completed swap persists the last-used pointer and simulates an
//!    unplug so the host re-enumerates the card
//!
//! A swap that finds the predicate false is deferred, not dropped; the slot
//! stays occupied until it goes through.

use std::sync::Arc;
use std::time::Duration;

use mc_card::{
    CardError, CardImage, CardName, CardSummary, Catalog, DirectoryEntry, StorageMedium,
    TitleLookup, DIRECTORY_SLOTS,
};
use mc_protocol::SwapRequest;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus_reset::BusResetHandler;
use crate::config::{DebouncePolicy, EngineConfig};
use crate::error::EngineError;
use crate::events::{StatusEvent, SwapRejectReason};
use crate::request::RequestSlot;
use crate::transaction::SharedCard;

/// Result of one pass over the request slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Nothing pending
    Idle,
    /// Target staged, waiting for the card to be safe to switch
    Deferred,
    /// The live card is now the named one
    Swapped(CardName),
    /// Request dropped
    Rejected(SwapRejectReason),
    /// Directory frame shown
    Shown(DirectoryEntry),
}

/// A resolved and validated swap target
struct StagedSwap {
    request: SwapRequest,
    name: CardName,
    card: CardImage,
}

/// Cursor over the live card's directory frames
///
/// Starts before the first slot and wraps at both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryCursor(Option<usize>);

impl DirectoryCursor {
    pub fn step(&mut self, request: SwapRequest) -> usize {
        let last = DIRECTORY_SLOTS - 1;
        let slot = match (request, self.0) {
            (SwapRequest::ShowPreviousCatalogEntry, None | Some(0)) => last,
            (SwapRequest::ShowPreviousCatalogEntry, Some(n)) => n - 1,
            (_, Some(n)) if n < last => n + 1,
            _ => 0,
        };
        self.0 = Some(slot);
        slot
    }

    pub fn reset(&mut self) {
        self.0 = None;
    }
}

pub struct SwapCoordinator {
    shared: Arc<SharedCard>,
    storage: Arc<dyn StorageMedium>,
    titles: Arc<dyn TitleLookup>,
    bus: Arc<BusResetHandler>,
    requests: Arc<RequestSlot>,
    events: broadcast::Sender<StatusEvent>,
    debounce: DebouncePolicy,
    debounce_interval: Duration,
    last_accepted: Option<Instant>,
    staged: Option<StagedSwap>,
    cursor: DirectoryCursor,
}

impl SwapCoordinator {
    pub fn new(
        shared: Arc<SharedCard>,
        storage: Arc<dyn StorageMedium>,
        titles: Arc<dyn TitleLookup>,
        bus: Arc<BusResetHandler>,
        requests: Arc<RequestSlot>,
        events: broadcast::Sender<StatusEvent>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            shared,
            storage,
            titles,
            bus,
            requests,
            events,
            debounce: config.debounce,
            debounce_interval: config.debounce_interval(),
            last_accepted: None,
            staged: None,
            cursor: DirectoryCursor::default(),
        }
    }

    /// Whether a swap is waiting for the card to become safe to switch
    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Handle the pending request, if any
    pub async fn service(&mut self) -> SwapOutcome {
        let Some(request) = self.requests.peek() else {
            return SwapOutcome::Idle;
        };

        if let Some(staged) = self.staged.take() {
            return self.try_swap(staged).await;
        }

        if self.debounced(request) {
            debug!("{:?} debounced", request);
            return self.reject(request, SwapRejectReason::Debounced);
        }

        if request.is_catalog_walk() {
            let outcome = self.show_entry(request);
            self.requests.clear();
            return outcome;
        }

        match self.resolve(request).await {
            Ok(staged) => self.try_swap(staged).await,
            Err(reason) => self.reject(request, reason),
        }
    }

    fn debounced(&mut self, request: SwapRequest) -> bool {
        let applies = match self.debounce {
            DebouncePolicy::CatalogOnly => request.is_catalog_walk(),
            DebouncePolicy::AllRequests => true,
        };
        if !applies {
            return false;
        }

        let now = Instant::now();
        if let Some(last) = self.last_accepted {
            if now.duration_since(last) < self.debounce_interval {
                return true;
            }
        }
        self.last_accepted = Some(now);
        false
    }

    fn reject(&self, request: SwapRequest, reason: SwapRejectReason) -> SwapOutcome {
        self.requests.clear();
        let _ = self
            .events
            .send(StatusEvent::SwapRejected { request, reason });
        SwapOutcome::Rejected(reason)
    }

    fn show_entry(&mut self, request: SwapRequest) -> SwapOutcome {
        let slot = self.cursor.step(request);
        let (card, entry) = {
            let session = self.shared.lock();
            (session.name.clone(), session.card.directory_entry(slot))
        };
        let Some(entry) = entry else {
            return SwapOutcome::Idle;
        };

        let title = entry
            .product_code()
            .and_then(|code| self.titles.lookup(code));
        debug!("{} block {}: {:?} {:?}", card, slot + 1, entry.kind, title);

        let _ = self.events.send(StatusEvent::CatalogEntry {
            card,
            entry: entry.clone(),
            title,
        });
        SwapOutcome::Shown(entry)
    }

    /// Find, check and load the swap target without holding the lock
    async fn resolve(&self, request: SwapRequest) -> Result<StagedSwap, SwapRejectReason> {
        let current = self.shared.name();
        let storage = Arc::clone(&self.storage);

        let resolved = tokio::task::spawn_blocking(move || {
            let catalog = Catalog::new(storage.as_ref());
            let name = match request {
                SwapRequest::Next => catalog.next(&current)?,
                SwapRequest::Previous => catalog.previous(&current)?,
                _ => catalog.create_new()?,
            };
            storage.check(&name)?;
            let card = storage.import(&name)?;
            Ok::<_, CardError>((name, card))
        })
        .await
        .map_err(EngineError::from)
        .and_then(|r| r.map_err(EngineError::from));

        match resolved {
            Ok((name, card)) => {
                if request == SwapRequest::New {
                    info!("Created new card {}", name);
                    let _ = self.events.send(StatusEvent::NewCardCreated(name.clone()));
                }
                Ok(StagedSwap {
                    request,
                    name,
                    card,
                })
            }
            Err(e) => {
                warn!("{:?} rejected: {}", request, e);
                let _ = self.events.send(StatusEvent::Error {
                    code: e.code(),
                    message: e.to_string(),
                });
                Err(reject_reason(&e))
            }
        }
    }

    /// Swap in a staged card if the predicate holds under the lock
    async fn try_swap(&mut self, mut staged: StagedSwap) -> SwapOutcome {
        // Cheap poll first; the answer is only trusted under the lock
        if !self.shared.is_safe_to_switch() {
            debug!("Swap to {} deferred", staged.name);
            self.staged = Some(staged);
            return SwapOutcome::Deferred;
        }

        let Some(summary) = self.commit_swap(&mut staged) else {
            debug!("Swap to {} deferred after lock", staged.name);
            self.staged = Some(staged);
            return SwapOutcome::Deferred;
        };

        // `staged` now holds the outgoing card, released off the lock
        let StagedSwap {
            request,
            name: previous,
            card: outgoing,
        } = staged;
        drop(outgoing);
        let current = self.shared.name();
        info!("{:?}: swapped {} for {}", request, previous, current);

        self.requests.clear();
        self.cursor.reset();
        self.record_last_used(&current).await;

        let _ = self.events.send(StatusEvent::CardChanged {
            card: current.clone(),
            summary,
        });
        self.bus.settle_and_reconnect().await;
        SwapOutcome::Swapped(current)
    }

    /// Exchange the live card with the staged one under the transaction lock
    ///
    /// Re-checks the predicate with the lock held; on success `staged` holds
    /// the outgoing card and the bus is already disconnected.
    fn commit_swap(&self, staged: &mut StagedSwap) -> Option<CardSummary> {
        let mut session = self.shared.lock();
        if !self.shared.is_safe_to_switch() {
            return None;
        }
        self.bus.disconnect();
        std::mem::swap(&mut session.card, &mut staged.card);
        std::mem::swap(&mut session.name, &mut staged.name);
        Some(session.card.summary())
    }

    async fn record_last_used(&self, name: &CardName) {
        let storage = Arc::clone(&self.storage);
        let name = name.clone();
        let written = tokio::task::spawn_blocking(move || storage.write_last_used(&name))
            .await
            .map_err(EngineError::from)
            .and_then(|r| r.map_err(EngineError::from));
        if let Err(e) = written {
            warn!("Failed to record last used card: {}", e);
            let _ = self.events.send(StatusEvent::Error {
                code: e.code(),
                message: e.to_string(),
            });
        }
    }
}

fn reject_reason(error: &EngineError) -> SwapRejectReason {
    match error {
        EngineError::Storage(CardError::CatalogExhausted) => SwapRejectReason::CatalogExhausted,
        EngineError::Storage(CardError::CatalogFull) => SwapRejectReason::CatalogFull,
        EngineError::Storage(CardError::InvalidSize { .. } | CardError::BadHeader) => {
            SwapRejectReason::InvalidImage
        }
        _ => SwapRejectReason::Storage,
    }
}
