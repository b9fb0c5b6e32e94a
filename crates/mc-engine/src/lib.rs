//! Memory Card Emulation Engine
//!
//! This crate runs the emulated card as two cooperating contexts:
//!
//! - **Real-time context**: [`ProtocolMachine`] consumes one command byte per
//!   tick from a [`ByteChannel`] and answers within the bus's byte budget.
//!   Completed writes are queued on the sync queue; controller hot keys are
//!   offered to the [`RequestSlot`].
//! - **Background context**: [`BackgroundWorker`] persists queued sectors
//!   and runs the [`SwapCoordinator`], which replaces the live card only when
//!   no write is open and every queued sector is persisted.
//!
//! Both share the live card through [`SharedCard`], the transaction lock.
//! Deselects and simulated unplugs go through the [`BusResetHandler`].
//!
//! # Architecture
//!
//! ```text
//!  host bytes ──▶ ProtocolMachine ──▶ response bytes
//!                   │        │
//!          dirty sector    hot key
//!                   ▼        ▼
//!            SyncQueue    RequestSlot
//!                   │        │
//!                   ▼        ▼
//!             BackgroundWorker ──▶ StorageMedium
//!                   │
//!                   └──▶ SharedCard swap ──▶ BusResetHandler (unplug)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mc_card::DirectoryStorage;
//! use mc_engine::{EngineConfig, Emulator, MemoryBus};
//!
//! # async fn example() -> Result<(), mc_engine::EngineError> {
//! let storage = Arc::new(DirectoryStorage::open("/media/sd")?);
//! let config = EngineConfig::load("/media/sd/engine.json")?;
//! let (host, device) = MemoryBus::pair();
//!
//! let emulator = Emulator::start(storage, device, config)?;
//! let mut status = emulator.subscribe();
//! // ... drive `host` ...
//! # drop((host, &mut status));
//! emulator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod bus_reset;
pub mod channel;
pub mod config;
pub mod emulator;
pub mod error;
pub mod events;
pub mod machine;
pub mod request;
pub mod swap;
pub mod sync_queue;
pub mod transaction;

pub use background::{BackgroundWorker, PersistOutcome};
pub use bus_reset::{BusResetHandler, DeselectSignal};
pub use channel::{BusError, ByteChannel, DevicePort, HostPort, MemoryBus};
pub use config::{DebouncePolicy, EngineConfig, PersistFailurePolicy};
pub use emulator::{Emulator, EmulatorHandle};
pub use error::EngineError;
pub use events::{StatusEvent, SwapRejectReason};
pub use machine::ProtocolMachine;
pub use request::RequestSlot;
pub use swap::{DirectoryCursor, SwapCoordinator, SwapOutcome};
pub use sync_queue::{sync_queue, SyncReceiver, SyncSender, SyncTicket, SYNC_QUEUE_CAPACITY};
pub use transaction::{CardSession, SharedCard};
