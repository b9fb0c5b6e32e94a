//! Protocol State Machine
//!
//! Consumes one command byte per [`ProtocolMachine::tick`] and answers on the
//! response side of the [`ByteChannel`]. The machine's `state` always names
//! the handler for the *next* byte.
//!
//! Each tick runs under the transaction lock. A completed write reserves its
//! sync ticket while the lock is held and hands it to the sync queue only
//! after the lock is released, so back-pressure from a full queue never
//! blocks the background context out of the card.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mc_card::{SECTOR_SIZE, WRITE_TEST_SECTOR};
use mc_protocol::{
    address_checksum, Command, PadButtons, ProtocolState, ACK1, ACK2, ADDRESS_FILLER, CARD_SELECT,
    END_BAD_CHECKSUM, END_GOOD, ID1, ID2, IDENTIFY_PAYLOAD, PAD_READ, PAD_SELECT, SENTINEL,
};
use tracing::{debug, info, trace, warn};

use crate::bus_reset::BusResetHandler;
use crate::channel::{BusError, ByteChannel};
use crate::error::EngineError;
use crate::request::RequestSlot;
use crate::sync_queue::{SyncSender, SyncTicket};
use crate::transaction::{CardSession, SharedCard};

/// Byte offset of the first payload byte in a read response
const READ_PAYLOAD_START: usize = 3;

/// Transaction-scoped counters, cleared on every Idle entry and bus reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Transaction {
    command: Option<Command>,
    counter: usize,
    address: u16,
    checksum: u8,
    recv_checksum: u8,
    switch_status: u16,
}

/// The card's byte-at-a-time protocol engine
pub struct ProtocolMachine<C> {
    channel: C,
    shared: Arc<SharedCard>,
    sync: SyncSender,
    requests: Arc<RequestSlot>,
    bus: Arc<BusResetHandler>,
    state: ProtocolState,
    txn: Transaction,
}

impl<C: ByteChannel> ProtocolMachine<C> {
    pub fn new(
        channel: C,
        shared: Arc<SharedCard>,
        sync: SyncSender,
        requests: Arc<RequestSlot>,
        bus: Arc<BusResetHandler>,
    ) -> Self {
        Self {
            channel,
            shared,
            sync,
            requests,
            bus,
            state: ProtocolState::Idle,
            txn: Transaction::default(),
        }
    }

    /// Handler for the next byte
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Hard reset after a deselect: back to Idle with counters cleared
    pub fn reset(&mut self) {
        if self.state != ProtocolState::Idle {
            debug!("Bus reset in state {}", self.state.name());
        }
        self.state = ProtocolState::Idle;
        self.txn = Transaction::default();
        self.channel.reset();
        self.shared.set_write_in_progress(false);
    }

    /// Process one command byte
    pub fn tick(&mut self, byte: u8) -> Result<(), EngineError> {
        self.poll_reset();
        if !self.bus.is_connected() {
            self.channel.cancel_ack();
            return Ok(());
        }

        trace!("tick {:02X} in {}", byte, self.state.name());
        let shared = Arc::clone(&self.shared);
        let ticket = {
            let mut session = shared.lock();
            // A swap may have disconnected the bus while this tick waited
            self.poll_reset();
            if !self.bus.is_connected() {
                self.channel.cancel_ack();
                return Ok(());
            }
            let ticket = self.step(&mut session, byte)?;
            shared.set_write_in_progress(self.write_open());
            ticket
        };

        if let Some(ticket) = ticket {
            if let Err(e) = self.sync.enqueue(ticket) {
                self.shared.complete_sync();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Apply a pending deselect without waiting for the next byte
    ///
    /// Returns true if the machine was reset.
    pub fn poll_reset(&mut self) -> bool {
        if self.bus.take_reset() {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Serve bytes until the channel closes or `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), EngineError> {
        info!("Protocol machine running");
        while running.load(Ordering::Acquire) {
            let byte = match self.channel.recv_byte() {
                Ok(byte) => byte,
                Err(BusError::Timeout) => {
                    self.poll_reset();
                    continue;
                }
                Err(BusError::Closed) => break,
            };
            match self.tick(byte) {
                Err(EngineError::Bus(BusError::Closed)) => break,
                other => other?,
            }
        }
        info!("Protocol machine stopped");
        Ok(())
    }

    /// A write transaction is open from its opcode until its terminator
    fn write_open(&self) -> bool {
        self.txn.command == Some(Command::Write)
            && matches!(
                self.state,
                ProtocolState::SendingId
                    | ProtocolState::ReceivingAddress
                    | ProtocolState::ExecutingWrite
                    | ProtocolState::Ending
            )
    }

    fn step(
        &mut self,
        session: &mut CardSession,
        byte: u8,
    ) -> Result<Option<SyncTicket>, EngineError> {
        let mut ticket = None;

        match self.state {
            ProtocolState::Idle => {
                self.txn = Transaction::default();
                match byte {
                    CARD_SELECT => {
                        self.channel.send_byte(session.card.flag_byte())?;
                        self.state = ProtocolState::ReceivingCommand;
                    }
                    PAD_SELECT => {
                        self.state = ProtocolState::PadPassthrough;
                        self.channel.cancel_ack();
                    }
                    _ => self.channel.cancel_ack(),
                }
            }

            ProtocolState::PadPassthrough => {
                self.channel.cancel_ack();
                self.state = if byte == PAD_READ {
                    ProtocolState::PadSniffing
                } else {
                    ProtocolState::Idle
                };
            }

            ProtocolState::PadSniffing => {
                self.channel.cancel_ack();
                self.sniff_pad();
            }

            ProtocolState::ReceivingCommand => match Command::try_from(byte) {
                Ok(command) => {
                    self.txn.command = Some(command);
                    self.channel.send_byte(ID1)?;
                    self.state = ProtocolState::SendingId;
                }
                Err(e) => {
                    trace!("{}", e);
                    self.state = ProtocolState::Idle;
                }
            },

            ProtocolState::SendingId => {
                self.channel.send_byte(ID2)?;
                self.state = match self.txn.command {
                    Some(command) if command.takes_address() => ProtocolState::ReceivingAddress,
                    Some(command) => command.execute_state(),
                    None => ProtocolState::Idle,
                };
            }

            ProtocolState::ReceivingAddress => self.receive_address(byte)?,

            ProtocolState::ExecutingIdentify => {
                match IDENTIFY_PAYLOAD.get(self.txn.counter) {
                    Some(&b) => {
                        self.channel.send_byte(b)?;
                        self.txn.counter += 1;
                    }
                    None => self.state = ProtocolState::Idle,
                }
            }

            ProtocolState::ExecutingRead => self.execute_read(session)?,

            ProtocolState::ExecutingWrite => ticket = self.execute_write(session, byte)?,

            ProtocolState::Aborting => {
                self.channel.send_byte(SENTINEL)?;
                self.state = ProtocolState::Idle;
            }

            ProtocolState::Ending => {
                let good = self.txn.recv_checksum == self.txn.checksum;
                self.channel
                    .send_byte(if good { END_GOOD } else { END_BAD_CHECKSUM })?;
                match self.txn.command {
                    Some(Command::Write) if !good => warn!(
                        "{}: bad checksum writing sector {} (got {:02X}, expected {:02X})",
                        session.name, self.txn.address, self.txn.recv_checksum, self.txn.checksum
                    ),
                    Some(command) => debug!(
                        "{}: {:?} sector {} complete",
                        session.name, command, self.txn.address
                    ),
                    None => {}
                }
                self.state = ProtocolState::Idle;
            }
        }

        Ok(ticket)
    }

    /// Listen to the controller's switch report on the data line
    fn sniff_pad(&mut self) {
        match self.txn.counter {
            0 => self.channel.discard_data_line(),
            1 => match self.channel.sniff_data_byte() {
                Ok(low) => self.txn.switch_status = u16::from(low),
                Err(_) => self.state = ProtocolState::Idle,
            },
            _ => {
                if let Ok(high) = self.channel.sniff_data_byte() {
                    self.txn.switch_status |= u16::from(high) << 8;
                    self.offer_hotkey();
                }
                self.state = ProtocolState::Idle;
            }
        }
        self.txn.counter += 1;
    }

    fn offer_hotkey(&self) {
        let Some(request) = PadButtons::from_raw(self.txn.switch_status).hotkey() else {
            return;
        };
        if self.requests.offer(request) {
            info!("Hot key {:?}", request);
        } else {
            trace!("Hot key {:?} ignored, request pending", request);
        }
    }

    fn receive_address(&mut self, byte: u8) -> Result<(), EngineError> {
        match self.txn.counter {
            0 => {
                self.channel.send_byte(ADDRESS_FILLER)?;
                self.txn.counter = 1;
            }
            1 => {
                self.txn.address = u16::from(byte) << 8;
                self.channel.send_byte(byte)?;
                self.txn.counter = 2;
            }
            _ => {
                self.txn.address |= u16::from(byte);
                let Some(command) = self.txn.command else {
                    self.state = ProtocolState::Idle;
                    return Ok(());
                };
                let reply = if command == Command::Read { ACK1 } else { byte };
                self.channel.send_byte(reply)?;
                self.state = command.execute_state();
                self.txn.counter = 0;
            }
        }
        Ok(())
    }

    fn execute_read(&mut self, session: &CardSession) -> Result<(), EngineError> {
        let [high, low] = self.txn.address.to_be_bytes();

        match self.txn.counter {
            0 => {
                self.channel.send_byte(ACK2)?;
                self.txn.checksum = address_checksum(self.txn.address);
            }
            1 | 2 => {
                if session.card.is_valid_sector(self.txn.address) {
                    let echo = if self.txn.counter == 1 { high } else { low };
                    self.channel.send_byte(echo)?;
                } else {
                    warn!(
                        "{}: read of invalid sector {}",
                        session.name, self.txn.address
                    );
                    self.channel.send_byte(SENTINEL)?;
                    self.state = ProtocolState::Aborting;
                }
            }
            n => {
                let offset = n - READ_PAYLOAD_START;
                if offset < SECTOR_SIZE {
                    let b = session
                        .card
                        .sector(self.txn.address)
                        .map_or(SENTINEL, |sector| sector[offset]);
                    self.channel.send_byte(b)?;
                    self.txn.checksum ^= b;
                } else {
                    self.channel.send_byte(self.txn.checksum)?;
                    // Nothing is received on a read, so Ending compares 0 with 0
                    self.txn.checksum = 0;
                    self.state = ProtocolState::Ending;
                }
            }
        }
        self.txn.counter += 1;
        Ok(())
    }

    fn execute_write(
        &mut self,
        session: &mut CardSession,
        byte: u8,
    ) -> Result<Option<SyncTicket>, EngineError> {
        let address = self.txn.address;
        let mut ticket = None;

        if !session.card.is_valid_sector(address) {
            warn!("{}: write to invalid sector {}", session.name, address);
            self.channel.send_byte(SENTINEL)?;
            self.state = ProtocolState::Aborting;
            self.txn.counter += 1;
            return Ok(None);
        }

        if self.txn.counter == 0 {
            self.txn.checksum = address_checksum(address);
        }

        if self.txn.counter < SECTOR_SIZE {
            if let Some(sector) = session.card.sector_mut(address) {
                sector[self.txn.counter] = byte;
            }
            self.txn.checksum ^= byte;
            self.channel.send_byte(byte)?;
        } else if self.txn.counter == SECTOR_SIZE {
            self.txn.recv_checksum = byte;
            self.channel.send_byte(ACK1)?;
        } else {
            self.channel.send_byte(ACK2)?;
            session.card.reset_seen_flag();
            if address != WRITE_TEST_SECTOR {
                session.card.mark_dirty(address)?;
                ticket = Some(self.shared.reserve_sync(address));
            }
            self.state = ProtocolState::Ending;
        }

        self.txn.counter += 1;
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use mc_card::{CardImage, CardName, FLAG_NOT_SEEN, FLAG_SEEN};
    use mc_protocol::{fold_checksum, SwapRequest, OP_IDENTIFY, OP_READ, OP_WRITE};
    use proptest::prelude::*;

    use super::*;
    use crate::bus_reset::DeselectSignal;
    use crate::sync_queue::{sync_queue, SyncReceiver};

    /// Channel that records everything the machine does
    #[derive(Default)]
    struct RecordingChannel {
        sent: Vec<u8>,
        data_line: VecDeque<u8>,
        cancelled: usize,
        resets: usize,
        deselect: DeselectSignal,
    }

    impl ByteChannel for RecordingChannel {
        fn recv_byte(&mut self) -> Result<u8, BusError> {
            Err(BusError::Closed)
        }

        fn send_byte(&mut self, byte: u8) -> Result<(), BusError> {
            self.sent.push(byte);
            Ok(())
        }

        fn sniff_data_byte(&mut self) -> Result<u8, BusError> {
            self.data_line.pop_front().ok_or(BusError::Timeout)
        }

        fn discard_data_line(&mut self) {
            // Keeps the switch report queued by tests; only framing is dropped
            while self.data_line.len() > 2 {
                self.data_line.pop_front();
            }
        }

        fn cancel_ack(&mut self) {
            self.cancelled += 1;
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn deselect_signal(&self) -> DeselectSignal {
            self.deselect.clone()
        }
    }

    struct Rig {
        machine: ProtocolMachine<RecordingChannel>,
        shared: Arc<SharedCard>,
        sync_rx: SyncReceiver,
        requests: Arc<RequestSlot>,
        bus: Arc<BusResetHandler>,
    }

    impl Rig {
        fn new() -> Self {
            let channel = RecordingChannel::default();
            let bus = Arc::new(BusResetHandler::new(
                channel.deselect_signal(),
                Duration::ZERO,
            ));
            let shared = Arc::new(SharedCard::new(
                CardName::new("TEST.MCR").unwrap(),
                CardImage::blank(),
            ));
            let (sync_tx, sync_rx) = sync_queue(16);
            let requests = Arc::new(RequestSlot::new());
            let machine =
                ProtocolMachine::new(channel, shared.clone(), sync_tx, requests.clone(), bus.clone());
            Self {
                machine,
                shared,
                sync_rx,
                requests,
                bus,
            }
        }

        /// Feed bytes and return what the card answered
        fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
            for &b in bytes {
                self.machine.tick(b).unwrap();
            }
            std::mem::take(&mut self.machine.channel_mut().sent)
        }

        fn fill_sector(&self, index: u16, payload: &[u8]) {
            let mut session = self.shared.lock();
            session
                .card
                .sector_mut(index)
                .unwrap()
                .copy_from_slice(payload);
        }
    }

    fn read_request(address: u16) -> Vec<u8> {
        let [high, low] = address.to_be_bytes();
        let mut bytes = vec![CARD_SELECT, OP_READ, 0x00, 0x00, high, low];
        bytes.extend(std::iter::repeat(0x00).take(3 + SECTOR_SIZE + 2));
        bytes
    }

    fn write_request(address: u16, payload: &[u8], checksum: u8) -> Vec<u8> {
        let [high, low] = address.to_be_bytes();
        let mut bytes = vec![CARD_SELECT, OP_WRITE, 0x00, 0x00, high, low];
        bytes.extend_from_slice(payload);
        bytes.extend([checksum, 0x00, 0x00]);
        bytes
    }

    fn pad_poll(rig: &mut Rig, switches: PadButtons) -> Vec<u8> {
        let [low, high] = (!switches.bits()).to_le_bytes();
        rig.machine
            .channel_mut()
            .data_line
            .extend([0xFF, 0x41, 0x5A, low, high]);
        rig.feed(&[PAD_SELECT, PAD_READ, 0x00, 0x00, 0x00])
    }

    // =========================================================================
    // Read
    // =========================================================================

    #[test]
    fn test_read_sector() {
        let mut rig = Rig::new();
        let response = rig.feed(&read_request(5));

        let mut expected = vec![FLAG_NOT_SEEN, ID1, ID2, 0x00, 0x00, ACK1, ACK2, 0x00, 0x05];
        expected.extend([0u8; SECTOR_SIZE]);
        expected.extend([0x05, END_GOOD]);
        assert_eq!(response, expected);
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
    }

    #[test]
    fn test_read_checksum_covers_payload() {
        let mut rig = Rig::new();
        let payload: Vec<u8> = (0..SECTOR_SIZE as u8).collect();
        rig.fill_sector(0x0203, &payload);

        let response = rig.feed(&read_request(0x0203));
        let chk = response[response.len() - 2];
        assert_eq!(chk, fold_checksum(0x02 ^ 0x03, &payload));
        assert_eq!(&response[9..9 + SECTOR_SIZE], &payload[..]);
        assert_eq!(response.last(), Some(&END_GOOD));
    }

    #[test]
    fn test_read_invalid_sector_aborts() {
        let mut rig = Rig::new();
        let response = rig.feed(&[CARD_SELECT, OP_READ, 0x00, 0x00, 0x27, 0x0F, 0x00]);
        assert_eq!(
            response,
            vec![FLAG_NOT_SEEN, ID1, ID2, 0x00, 0x27, ACK1, ACK2]
        );

        assert_eq!(rig.feed(&[0x00]), vec![SENTINEL]);
        assert_eq!(rig.machine.state(), ProtocolState::Aborting);
        assert_eq!(rig.feed(&[0x00]), vec![SENTINEL]);
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
    }

    // =========================================================================
    // Write
    // =========================================================================

    #[test]
    fn test_write_sector_queues_sync() {
        let mut rig = Rig::new();
        let payload = [0xA5u8; SECTOR_SIZE];
        let chk = fold_checksum(address_checksum(0x0100), &payload);

        let response = rig.feed(&write_request(0x0100, &payload, chk));
        let mut expected = vec![FLAG_NOT_SEEN, ID1, ID2, 0x00, 0x01, 0x00];
        expected.extend(payload);
        expected.extend([ACK1, ACK2, END_GOOD]);
        assert_eq!(response, expected);

        let session = rig.shared.lock();
        assert_eq!(session.card.sector(0x0100).unwrap(), &payload);
        assert_eq!(session.card.flag_byte(), FLAG_SEEN);
        assert!(session.card.is_dirty(0x0100));
        drop(session);

        assert_eq!(rig.sync_rx.try_recv(), Some(0x0100));
        assert_eq!(rig.shared.pending_sync(), 1);
        assert!(!rig.shared.write_in_progress());
    }

    #[test]
    fn test_write_bad_checksum() {
        let mut rig = Rig::new();
        let payload = [0x11u8; SECTOR_SIZE];
        let chk = fold_checksum(address_checksum(7), &payload) ^ 0x01;

        let response = rig.feed(&write_request(7, &payload, chk));
        assert_eq!(response.last(), Some(&END_BAD_CHECKSUM));
        // Data is kept and synced regardless, as on the real card
        assert_eq!(rig.sync_rx.try_recv(), Some(7));
    }

    #[test]
    fn test_write_test_sector_not_queued() {
        let mut rig = Rig::new();
        let payload = [0x42u8; SECTOR_SIZE];
        let chk = fold_checksum(address_checksum(WRITE_TEST_SECTOR), &payload);

        let response = rig.feed(&write_request(WRITE_TEST_SECTOR, &payload, chk));
        assert_eq!(response.last(), Some(&END_GOOD));
        assert_eq!(rig.sync_rx.try_recv(), None);
        assert_eq!(rig.shared.pending_sync(), 0);
        assert_eq!(rig.shared.lock().card.flag_byte(), FLAG_SEEN);
    }

    #[test]
    fn test_write_invalid_sector_aborts() {
        let mut rig = Rig::new();
        let response = rig.feed(&[CARD_SELECT, OP_WRITE, 0x00, 0x00, 0x04, 0x00]);
        assert_eq!(response, vec![FLAG_NOT_SEEN, ID1, ID2, 0x00, 0x04, 0x00]);
        assert_eq!(rig.machine.state(), ProtocolState::ExecutingWrite);

        assert_eq!(rig.feed(&[0xAA]), vec![SENTINEL]);
        assert_eq!(rig.feed(&[0xAA]), vec![SENTINEL]);
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
        assert_eq!(rig.shared.lock().card.flag_byte(), FLAG_NOT_SEEN);
    }

    #[test]
    fn test_write_in_progress_tracks_transaction() {
        let mut rig = Rig::new();
        rig.feed(&[CARD_SELECT]);
        assert!(!rig.shared.write_in_progress());

        rig.feed(&[OP_WRITE]);
        assert!(rig.shared.write_in_progress());

        rig.feed(&[0x00, 0x00, 0x00, 0x09, 0x01, 0x02]);
        assert_eq!(rig.machine.state(), ProtocolState::ExecutingWrite);
        assert!(rig.shared.write_in_progress());
        assert!(!rig.shared.is_safe_to_switch());
    }

    // =========================================================================
    // Identify and top level
    // =========================================================================

    #[test]
    fn test_identify() {
        let mut rig = Rig::new();
        let response = rig.feed(&[CARD_SELECT, OP_IDENTIFY, 0, 0, 0, 0, 0, 0, 0]);
        let mut expected = vec![FLAG_NOT_SEEN, ID1, ID2];
        expected.extend(IDENTIFY_PAYLOAD);
        assert_eq!(response, expected);
        assert_eq!(rig.machine.state(), ProtocolState::ExecutingIdentify);

        assert!(rig.feed(&[0x00]).is_empty());
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
    }

    #[test]
    fn test_unknown_opcode_returns_to_idle() {
        let mut rig = Rig::new();
        assert_eq!(rig.feed(&[CARD_SELECT, 0x99]), vec![FLAG_NOT_SEEN]);
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
    }

    #[test]
    fn test_idle_noise_cancels_ack() {
        let mut rig = Rig::new();
        assert!(rig.feed(&[0x00, 0x33, 0xFF]).is_empty());
        assert_eq!(rig.machine.channel().cancelled, 3);
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
    }

    // =========================================================================
    // Bus reset
    // =========================================================================

    #[test]
    fn test_deselect_resets_mid_write() {
        let mut rig = Rig::new();
        rig.feed(&[CARD_SELECT, OP_WRITE, 0x00, 0x00, 0x00, 0x20, 0x01, 0x02]);
        assert_eq!(rig.machine.state(), ProtocolState::ExecutingWrite);

        rig.bus.deselect_signal().raise();
        let response = rig.feed(&read_request(0x20));

        assert_eq!(rig.machine.channel().resets, 1);
        assert_eq!(&response[..3], &[FLAG_NOT_SEEN, ID1, ID2]);
        assert_eq!(response.last(), Some(&END_GOOD));
        assert_eq!(rig.sync_rx.try_recv(), None);
        assert!(!rig.shared.write_in_progress());
    }

    #[test]
    fn test_disconnected_card_is_silent() {
        let mut rig = Rig::new();
        rig.bus.disconnect();
        assert!(rig.feed(&read_request(1)).is_empty());
        assert_eq!(rig.machine.state(), ProtocolState::Idle);

        rig.bus.reconnect();
        assert_eq!(rig.feed(&[CARD_SELECT]), vec![FLAG_NOT_SEEN]);
    }

    #[test]
    fn test_deselect_applied_while_host_is_quiet() {
        let mut rig = Rig::new();
        rig.feed(&[CARD_SELECT, OP_WRITE, 0x00, 0x00, 0x00, 0x20, 0x01]);
        assert!(rig.shared.write_in_progress());
        assert!(!rig.machine.poll_reset());

        rig.bus.deselect_signal().raise();
        assert!(rig.machine.poll_reset());

        assert_eq!(rig.machine.state(), ProtocolState::Idle);
        assert!(!rig.shared.write_in_progress());
        assert!(rig.shared.is_safe_to_switch());
    }

    #[test]
    fn test_disconnect_while_waiting_for_lock_is_silent() {
        let mut rig = Rig::new();
        assert_eq!(rig.feed(&[CARD_SELECT]), vec![FLAG_NOT_SEEN]);
        let Rig {
            mut machine,
            shared,
            bus,
            ..
        } = rig;

        // Hold the lock the way a swap does, disconnecting before release
        let guard = shared.lock();
        let ticker = std::thread::spawn(move || {
            let result = machine.tick(OP_WRITE);
            (machine, result)
        });
        std::thread::sleep(Duration::from_millis(50));
        bus.disconnect();
        drop(guard);

        let (machine, result) = ticker.join().unwrap();
        result.unwrap();
        assert!(machine.channel().sent.is_empty());
        assert_eq!(machine.channel().cancelled, 1);
        assert_eq!(machine.state(), ProtocolState::Idle);
        assert!(!shared.write_in_progress());
    }

    #[test]
    fn test_closed_sync_queue_releases_reservation() {
        let mut rig = Rig::new();
        drop(rig.sync_rx);

        let payload = [0x44u8; SECTOR_SIZE];
        let checksum = fold_checksum(address_checksum(0x0100), &payload);
        let bytes = write_request(0x0100, &payload, checksum);
        let (last, body) = bytes.split_last().unwrap();
        let (ack2, body) = body.split_last().unwrap();
        for &b in body {
            rig.machine.tick(b).unwrap();
        }

        let result = rig.machine.tick(*ack2);
        assert!(matches!(result, Err(EngineError::SyncClosed)));
        assert_eq!(rig.shared.pending_sync(), 0);
        assert!(rig.shared.lock().card.is_dirty(0x0100));

        rig.machine.tick(*last).unwrap();
        assert!(rig.shared.is_safe_to_switch());
    }

    // =========================================================================
    // Controller sniffing
    // =========================================================================

    #[test]
    fn test_pad_hotkey_offers_request() {
        let mut rig = Rig::new();
        let response = pad_poll(
            &mut rig,
            PadButtons::START | PadButtons::SELECT | PadButtons::UP,
        );
        assert_eq!(rig.requests.peek(), Some(SwapRequest::Next));
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
        // Every controller byte has its ack withheld
        assert!(response.is_empty());
        assert_eq!(rig.machine.channel().cancelled, 5);
    }

    #[test]
    fn test_pad_hotkey_dropped_while_pending() {
        let mut rig = Rig::new();
        pad_poll(
            &mut rig,
            PadButtons::START | PadButtons::SELECT | PadButtons::DOWN,
        );
        pad_poll(
            &mut rig,
            PadButtons::START | PadButtons::SELECT | PadButtons::TRIANGLE,
        );
        assert_eq!(rig.requests.peek(), Some(SwapRequest::Previous));
    }

    #[test]
    fn test_pad_without_hotkey() {
        let mut rig = Rig::new();
        pad_poll(&mut rig, PadButtons::START | PadButtons::UP);
        assert_eq!(rig.requests.peek(), None);
    }

    #[test]
    fn test_pad_other_opcode_returns_to_idle() {
        let mut rig = Rig::new();
        rig.feed(&[PAD_SELECT, 0x43]);
        assert_eq!(rig.machine.state(), ProtocolState::Idle);
    }

    // =========================================================================
    // Properties
    // =========================================================================

    proptest! {
        #[test]
        fn prop_write_then_read_round_trips(
            address in 0u16..1024,
            payload in proptest::collection::vec(any::<u8>(), SECTOR_SIZE),
        ) {
            let mut rig = Rig::new();
            let chk = fold_checksum(address_checksum(address), &payload);

            let write = rig.feed(&write_request(address, &payload, chk));
            prop_assert_eq!(write.last(), Some(&END_GOOD));

            let read = rig.feed(&read_request(address));
            prop_assert_eq!(&read[9..9 + SECTOR_SIZE], &payload[..]);
            prop_assert_eq!(read[read.len() - 2], chk);
            prop_assert_eq!(read.last(), Some(&END_GOOD));
        }

        #[test]
        fn prop_invalid_address_aborts_with_one_sentinel(
            address in 1024u16..=u16::MAX,
            write in any::<bool>(),
        ) {
            let mut rig = Rig::new();
            let [high, low] = address.to_be_bytes();
            let opcode = if write { OP_WRITE } else { OP_READ };
            rig.feed(&[CARD_SELECT, opcode, 0x00, 0x00, high, low]);
            if !write {
                rig.feed(&[0x00]);
            }

            prop_assert_eq!(rig.feed(&[0x00]), vec![SENTINEL]);
            prop_assert_eq!(rig.machine.state(), ProtocolState::Aborting);
            prop_assert_eq!(rig.feed(&[0x00]), vec![SENTINEL]);
            prop_assert_eq!(rig.machine.state(), ProtocolState::Idle);
            prop_assert_eq!(rig.sync_rx.try_recv(), None);
        }

        #[test]
        fn prop_deselect_always_restarts_from_idle(
            prefix in proptest::collection::vec(any::<u8>(), 0..200),
        ) {
            let mut rig = Rig::new();
            rig.feed(&prefix);
            rig.bus.deselect_signal().raise();

            let response = rig.feed(&[CARD_SELECT]);
            prop_assert_eq!(rig.machine.state(), ProtocolState::ReceivingCommand);
            prop_assert_eq!(response.len(), 1);
            prop_assert!(!rig.shared.write_in_progress());
        }
    }
}
