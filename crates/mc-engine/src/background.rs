//! Background context
//!
//! One tokio task that owns the consumer end of the sync queue and the
//! [`SwapCoordinator`]. Its `select!` loop:
//! - persists dirty sectors as they arrive
//! - services the request slot when the protocol machine offers a request
//! - on a retry tick, re-attempts failed sectors and deferred swaps
//!
//! The loop ends once the protocol machine is gone and the sync queue has
//! been drained, so stopping the real-time context flushes every dirty
//! sector before the task returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use mc_card::{CardName, StorageMedium, TitleLookup};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::bus_reset::BusResetHandler;
use crate::config::{EngineConfig, PersistFailurePolicy};
use crate::error::EngineError;
use crate::events::StatusEvent;
use crate::request::RequestSlot;
use crate::swap::{SwapCoordinator, SwapOutcome};
use crate::sync_queue::SyncReceiver;
use crate::transaction::SharedCard;

/// Result of persisting one queued sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted(u16),
    Failed { sector: u16, retrying: bool },
}

/// A sector waiting for another persistence attempt
#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    sector: u16,
    attempts: u32,
}

pub struct BackgroundWorker {
    shared: Arc<SharedCard>,
    storage: Arc<dyn StorageMedium>,
    requests: Arc<RequestSlot>,
    sync: SyncReceiver,
    coordinator: SwapCoordinator,
    events: broadcast::Sender<StatusEvent>,
    policy: PersistFailurePolicy,
    retry_period: Duration,
    retries: VecDeque<RetryEntry>,
    sync_active: bool,
}

impl BackgroundWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<SharedCard>,
        storage: Arc<dyn StorageMedium>,
        titles: Arc<dyn TitleLookup>,
        bus: Arc<BusResetHandler>,
        requests: Arc<RequestSlot>,
        sync: SyncReceiver,
        events: broadcast::Sender<StatusEvent>,
        config: &EngineConfig,
    ) -> Self {
        let coordinator = SwapCoordinator::new(
            shared.clone(),
            storage.clone(),
            titles,
            bus,
            requests.clone(),
            events.clone(),
            config,
        );
        Self {
            shared,
            storage,
            requests,
            sync,
            coordinator,
            events,
            policy: config.persist_failure,
            retry_period: config.swap_retry(),
            retries: VecDeque::new(),
            sync_active: false,
        }
    }

    /// Persist the next queued sector, if one is waiting
    pub async fn drain_one(&mut self) -> Option<PersistOutcome> {
        let sector = self.sync.try_recv()?;
        Some(self.persist(sector, 1).await)
    }

    /// Handle the pending swap or catalog request
    pub async fn service_request(&mut self) -> SwapOutcome {
        self.coordinator.service().await
    }

    /// Sectors waiting for another attempt
    pub fn retry_backlog(&self) -> usize {
        self.retries.len()
    }

    /// Run until the sync queue closes, then flush retries
    pub async fn run(mut self) -> Result<(), EngineError> {
        info!("Background worker running");
        let requests = Arc::clone(&self.requests);
        let mut retry = interval(self.retry_period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let waiting = self.coordinator.has_staged() || !self.retries.is_empty();

            tokio::select! {
                sector = self.sync.recv() => match sector {
                    Some(sector) => {
                        self.persist(sector, 1).await;
                    }
                    None => {
                        debug!("Sync queue closed");
                        break;
                    }
                },

                _ = requests.notified() => {
                    self.service_request().await;
                }

                _ = retry.tick(), if waiting => {
                    self.retry_failed().await;
                    self.service_request().await;
                }
            }
        }

        self.flush_retries().await;
        info!("Background worker stopped");
        Ok(())
    }

    /// Write one sector to the medium
    async fn persist(&mut self, sector: u16, attempt: u32) -> PersistOutcome {
        self.set_sync_active(true);

        let snapshot = {
            let mut session = self.shared.lock();
            session
                .card
                .snapshot_sector(sector)
                .map(|bytes| (session.name.clone(), bytes))
        };
        let (name, bytes) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Dropping queued sector {}: {}", sector, e);
                self.shared.complete_sync();
                self.report_error(&EngineError::from(e));
                self.settle_sync_indicator();
                return PersistOutcome::Failed {
                    sector,
                    retrying: false,
                };
            }
        };

        let storage = Arc::clone(&self.storage);
        let target = name.clone();
        let written =
            tokio::task::spawn_blocking(move || storage.persist_sector(&target, sector, &bytes))
                .await
                .map_err(EngineError::from)
                .and_then(|r| r.map_err(EngineError::from));

        let outcome = match written {
            Ok(()) => {
                trace!("{}: sector {} persisted", name, sector);
                self.shared.complete_sync();
                PersistOutcome::Persisted(sector)
            }
            Err(e) => self.persist_failed(&name, sector, attempt, &e),
        };
        self.settle_sync_indicator();
        outcome
    }

    fn persist_failed(
        &mut self,
        name: &CardName,
        sector: u16,
        attempt: u32,
        error: &EngineError,
    ) -> PersistOutcome {
        // The in-memory copy is still newer than the medium
        if let Err(e) = self.shared.lock().card.mark_dirty(sector) {
            warn!("{}: {}", name, e);
        }

        let retrying = match self.policy {
            PersistFailurePolicy::Retry { max_attempts } if attempt < max_attempts => {
                self.retries.push_back(RetryEntry {
                    sector,
                    attempts: attempt,
                });
                true
            }
            _ => {
                self.shared.complete_sync();
                false
            }
        };

        warn!(
            "{}: failed to persist sector {} (attempt {}, {}): {}",
            name,
            sector,
            attempt,
            if retrying { "will retry" } else { "left dirty" },
            error
        );
        let _ = self.events.send(StatusEvent::SectorPersistFailed {
            card: name.clone(),
            sector,
            retrying,
            message: error.to_string(),
        });
        self.report_error(error);

        PersistOutcome::Failed { sector, retrying }
    }

    /// One more attempt for every sector currently in the retry backlog
    async fn retry_failed(&mut self) {
        for _ in 0..self.retries.len() {
            let Some(entry) = self.retries.pop_front() else {
                break;
            };
            self.persist(entry.sector, entry.attempts + 1).await;
        }
    }

    /// Keep retrying until every sector is persisted or out of attempts
    async fn flush_retries(&mut self) {
        while !self.retries.is_empty() {
            self.retry_failed().await;
        }
    }

    fn set_sync_active(&mut self, active: bool) {
        if self.sync_active != active {
            self.sync_active = active;
            let _ = self.events.send(StatusEvent::SyncActive(active));
        }
    }

    fn settle_sync_indicator(&mut self) {
        if self.shared.pending_sync() == 0 {
            self.set_sync_active(false);
        }
    }

    fn report_error(&self, error: &EngineError) {
        let _ = self.events.send(StatusEvent::Error {
            code: error.code(),
            message: error.to_string(),
        });
    }
}
