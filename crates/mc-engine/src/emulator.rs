//! Emulator bootstrap
//!
//! Wires the card store, the two execution contexts and the status channel
//! together: the protocol machine on a dedicated OS thread, the background
//! worker as a tokio task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mc_card::{Catalog, CardName, StorageMedium, TitleIndex, TitleLookup};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::background::BackgroundWorker;
use crate::bus_reset::{BusResetHandler, DeselectSignal};
use crate::channel::ByteChannel;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::StatusEvent;
use crate::machine::ProtocolMachine;
use crate::request::RequestSlot;
use crate::sync_queue::{sync_queue, SYNC_QUEUE_CAPACITY};
use crate::transaction::SharedCard;

pub struct Emulator;

impl Emulator {
    /// Start emulating with no title names for the directory view
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: ByteChannel>(
        storage: Arc<dyn StorageMedium>,
        channel: C,
        config: EngineConfig,
    ) -> Result<EmulatorHandle, EngineError> {
        Self::start_with_titles(storage, Arc::new(TitleIndex::new()), channel, config)
    }

    /// Start emulating
    ///
    /// Loads the startup card (last used, else first in the catalog, else a
    /// new blank card). Any storage error here is fatal and returned.
    pub fn start_with_titles<C: ByteChannel>(
        storage: Arc<dyn StorageMedium>,
        titles: Arc<dyn TitleLookup>,
        channel: C,
        config: EngineConfig,
    ) -> Result<EmulatorHandle, EngineError> {
        let runtime = Handle::try_current().map_err(|e| EngineError::Task(e.to_string()))?;

        let (name, card) = Catalog::new(storage.as_ref())
            .startup_card()
            .and_then(|name| storage.import(&name).map(|card| (name, card)))
            .map_err(|e| {
                error!("Unable to load startup card: {}", e);
                e
            })?;
        info!(
            "Inserted {} ({} of 15 blocks used)",
            name,
            card.summary().used_blocks
        );

        let shared = Arc::new(SharedCard::new(name, card));
        let deselect = channel.deselect_signal();
        let bus = Arc::new(BusResetHandler::new(
            deselect.clone(),
            config.reconnect_settle(),
        ));
        let requests = Arc::new(RequestSlot::new());
        let (sync_tx, sync_rx) = sync_queue(SYNC_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(config.status_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));

        let worker = BackgroundWorker::new(
            shared.clone(),
            storage,
            titles,
            bus.clone(),
            requests.clone(),
            sync_rx,
            events.clone(),
            &config,
        );
        let background = runtime.spawn(worker.run());

        let mut machine = ProtocolMachine::new(channel, shared.clone(), sync_tx, requests.clone(), bus);
        let protocol = thread::Builder::new()
            .name("mc-protocol".to_string())
            .spawn({
                let running = running.clone();
                move || machine.run(&running)
            })
            .map_err(|e| EngineError::Task(e.to_string()))?;

        Ok(EmulatorHandle {
            shared,
            deselect,
            requests,
            events,
            running,
            protocol,
            background,
        })
    }
}

/// Handle to a running emulator
pub struct EmulatorHandle {
    shared: Arc<SharedCard>,
    deselect: DeselectSignal,
    requests: Arc<RequestSlot>,
    events: broadcast::Sender<StatusEvent>,
    running: Arc<AtomicBool>,
    protocol: thread::JoinHandle<Result<(), EngineError>>,
    background: JoinHandle<Result<(), EngineError>>,
}

impl EmulatorHandle {
    /// Signal the signal layer raises when the host deselects the card
    pub fn deselect_signal(&self) -> DeselectSignal {
        self.deselect.clone()
    }

    /// Pending swap request slot
    pub fn requests(&self) -> &Arc<RequestSlot> {
        &self.requests
    }

    /// The live card, behind the transaction lock
    pub fn shared(&self) -> &Arc<SharedCard> {
        &self.shared
    }

    /// Name of the live card
    pub fn card_name(&self) -> CardName {
        self.shared.name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Stop both contexts, persisting every queued sector first
    pub async fn shutdown(self) -> Result<(), EngineError> {
        info!("Shutting down emulator");
        self.running.store(false, Ordering::Release);

        let protocol = self.protocol;
        let protocol_result = tokio::task::spawn_blocking(move || protocol.join())
            .await?
            .map_err(|_| EngineError::Task("protocol thread panicked".to_string()))?;

        // The machine's sync sender is gone now, so the worker drains and exits
        let background_result = self.background.await?;

        protocol_result?;
        background_result
    }
}
