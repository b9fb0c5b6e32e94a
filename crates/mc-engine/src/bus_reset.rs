//! Bus Reset Handler
//!
//! Two ways a transaction can end abruptly:
//!
//! - the host raises the select line (deselect). The signal layer flags it
//!   through a [`DeselectSignal`] and the protocol machine hard-resets before
//!   its next tick, or as soon as its wait for a byte times out.
//! - the background context swaps the card image. The bus is silenced for a
//!   settle interval so the host sees the card removed and re-inserted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

/// Latching deselect flag shared between the signal layer and the machine
#[derive(Debug, Clone, Default)]
pub struct DeselectSignal(Arc<AtomicBool>);

impl DeselectSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a deselect; safe to call from any context
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume a pending deselect
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Deselect handling and simulated unplug
#[derive(Debug)]
pub struct BusResetHandler {
    deselect: DeselectSignal,
    connected: AtomicBool,
    settle: Duration,
}

impl BusResetHandler {
    pub fn new(deselect: DeselectSignal, settle: Duration) -> Self {
        Self {
            deselect,
            connected: AtomicBool::new(true),
            settle,
        }
    }

    /// The deselect signal this handler listens to
    pub fn deselect_signal(&self) -> &DeselectSignal {
        &self.deselect
    }

    /// Consume a pending reset request
    pub fn take_reset(&self) -> bool {
        self.deselect.take()
    }

    /// Whether the card is currently visible on the bus
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Silence the card and abort whatever transaction is in flight
    pub fn disconnect(&self) {
        debug!("Card disconnected from bus");
        self.connected.store(false, Ordering::Release);
        self.deselect.raise();
    }

    /// Make the card visible again
    pub fn reconnect(&self) {
        self.deselect.raise();
        self.connected.store(true, Ordering::Release);
        debug!("Card reconnected to bus");
    }

    /// Second half of a simulated unplug: wait out the settle interval,
    /// then reconnect
    ///
    /// The first half is [`disconnect`](Self::disconnect), which a swap
    /// issues while it still holds the transaction lock.
    pub async fn settle_and_reconnect(&self) {
        info!("Simulating reconnection ({} ms)", self.settle.as_millis());
        tokio::time::sleep(self.settle).await;
        self.reconnect();
    }
}
