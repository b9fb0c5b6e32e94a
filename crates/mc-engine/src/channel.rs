//! Byte channel abstraction and an in-memory bus
//!
//! The protocol machine talks to the host through [`ByteChannel`]: one
//! blocking receive per command byte, zero or more response bytes, plus the
//! side controls the signal layer provides (data line sniffing for the
//! controller sharing the bus, acknowledge cancellation, buffer reset).
//!
//! [`MemoryBus`] implements the device end over `crossbeam` channels so the
//! whole emulator can be driven by a simulated host in tests.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::trace;

use crate::bus_reset::DeselectSignal;

/// How long the device end waits for a command byte before reporting idle
const DEVICE_POLL: Duration = Duration::from_millis(20);

/// How long the device end waits for a data line byte while sniffing
const SNIFF_TIMEOUT: Duration = Duration::from_millis(50);

/// Byte channel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// The other end of the channel is gone
    #[error("bus closed")]
    Closed,
    /// Nothing arrived within the polling interval
    #[error("bus timeout")]
    Timeout,
}

/// Command/response byte channel as seen by the card
pub trait ByteChannel: Send + 'static {
    /// Block until the next command byte arrives
    fn recv_byte(&mut self) -> Result<u8, BusError>;

    /// Queue a response byte for the host
    fn send_byte(&mut self, byte: u8) -> Result<(), BusError>;

    /// Read the next byte another peripheral drove onto the data line
    fn sniff_data_byte(&mut self) -> Result<u8, BusError>;

    /// Drop everything buffered from the data line
    fn discard_data_line(&mut self);

    /// Withhold the acknowledge for the current byte
    fn cancel_ack(&mut self);

    /// Clear buffered signal layer state after a deselect
    fn reset(&mut self);

    /// Out-of-band deselect notification raised by the signal layer
    fn deselect_signal(&self) -> DeselectSignal;
}

/// Items travelling from host to card on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Byte(u8),
    Deselect,
}

/// Items travelling from card to host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Byte(u8),
    NoAck,
}

/// In-memory duplex bus
pub struct MemoryBus;

impl MemoryBus {
    /// Create a connected host/device pair
    pub fn pair() -> (HostPort, DevicePort) {
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (data_tx, data_rx) = channel::unbounded();
        let (reply_tx, reply_rx) = channel::unbounded();
        let deselect = DeselectSignal::new();

        let host = HostPort {
            cmd_tx,
            data_tx,
            reply_rx,
        };
        let device = DevicePort {
            cmd_rx,
            data_rx,
            reply_tx,
            deselect,
            answered: true,
        };
        (host, device)
    }
}

/// Host end of a [`MemoryBus`]
pub struct HostPort {
    cmd_tx: Sender<Wire>,
    data_tx: Sender<u8>,
    reply_rx: Receiver<Reply>,
}

impl HostPort {
    /// Send one command byte and wait for the card's answer
    ///
    /// Returns `None` when the card withheld its acknowledge or did not
    /// answer in time.
    pub fn exchange(&self, byte: u8, timeout: Duration) -> Option<u8> {
        self.cmd_tx.send(Wire::Byte(byte)).ok()?;
        match self.reply_rx.recv_timeout(timeout) {
            Ok(Reply::Byte(b)) => Some(b),
            Ok(Reply::NoAck) | Err(_) => None,
        }
    }

    /// Exchange a whole command sequence, stopping at the first missing reply
    pub fn transfer(&self, bytes: &[u8], timeout: Duration) -> Vec<u8> {
        bytes
            .iter()
            .map_while(|&b| self.exchange(b, timeout))
            .collect()
    }

    /// Send a command byte to the controller while it drives `data`
    ///
    /// Returns the card's reply, which must be `None`: the card has to stay
    /// silent on controller traffic.
    pub fn send_pad(&self, cmd: u8, data: u8, timeout: Duration) -> Option<u8> {
        self.data_tx.send(data).ok()?;
        self.exchange(cmd, timeout)
    }

    /// Raise the select line, ending the current transaction
    ///
    /// Replies still in flight from the previous transaction are dropped.
    pub fn deselect(&self) {
        let _ = self.cmd_tx.send(Wire::Deselect);
        while self.reply_rx.try_recv().is_ok() {}
    }
}

/// Device end of a [`MemoryBus`]
pub struct DevicePort {
    cmd_rx: Receiver<Wire>,
    data_rx: Receiver<u8>,
    reply_tx: Sender<Reply>,
    deselect: DeselectSignal,
    /// Whether the last command byte got a reply or a cancelled ack
    answered: bool,
}

impl ByteChannel for DevicePort {
    fn recv_byte(&mut self) -> Result<u8, BusError> {
        // A byte left unanswered times out on the host side as a missing ack
        if !self.answered {
            self.cancel_ack();
        }
        loop {
            match self.cmd_rx.recv_timeout(DEVICE_POLL) {
                Ok(Wire::Byte(b)) => {
                    self.answered = false;
                    return Ok(b);
                }
                Ok(Wire::Deselect) => self.deselect.raise(),
                Err(RecvTimeoutError::Timeout) => return Err(BusError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(BusError::Closed),
            }
        }
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), BusError> {
        self.answered = true;
        self.reply_tx
            .send(Reply::Byte(byte))
            .map_err(|_| BusError::Closed)
    }

    fn sniff_data_byte(&mut self) -> Result<u8, BusError> {
        self.data_rx.recv_timeout(SNIFF_TIMEOUT).map_err(|e| match e {
            RecvTimeoutError::Timeout => BusError::Timeout,
            RecvTimeoutError::Disconnected => BusError::Closed,
        })
    }

    fn discard_data_line(&mut self) {
        while self.data_rx.try_recv().is_ok() {}
    }

    fn cancel_ack(&mut self) {
        self.answered = true;
        let _ = self.reply_tx.send(Reply::NoAck);
    }

    fn reset(&mut self) {
        trace!("Clearing data line buffer");
        self.discard_data_line();
    }

    fn deselect_signal(&self) -> DeselectSignal {
        self.deselect.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn test_bytes_flow_both_ways() {
        let (host, mut device) = MemoryBus::pair();
        let responder = std::thread::spawn(move || {
            let b = device.recv_byte().unwrap();
            device.send_byte(b.wrapping_add(1)).unwrap();
            device
        });
        assert_eq!(host.exchange(0x41, TIMEOUT), Some(0x42));
        responder.join().unwrap();
    }

    #[test]
    fn test_cancelled_ack_ends_exchange() {
        let (host, mut device) = MemoryBus::pair();
        device.cancel_ack();
        assert_eq!(host.exchange(0x01, TIMEOUT), None);
    }

    #[test]
    fn test_unanswered_byte_reads_as_missing_ack() {
        let (host, mut device) = MemoryBus::pair();
        let responder = std::thread::spawn(move || {
            device.recv_byte().unwrap();
            // No reply; the next receive releases the host
            let _ = device.recv_byte();
        });
        assert_eq!(host.exchange(0x99, TIMEOUT), None);
        responder.join().unwrap();
    }

    #[test]
    fn test_deselect_raised_in_stream_order() {
        let (host, mut device) = MemoryBus::pair();
        let signal = device.deselect_signal();
        host.cmd_tx.send(Wire::Byte(0x01)).unwrap();
        host.deselect();
        host.cmd_tx.send(Wire::Byte(0x42)).unwrap();

        assert_eq!(device.recv_byte(), Ok(0x01));
        assert!(!signal.is_raised());
        assert_eq!(device.recv_byte(), Ok(0x42));
        assert!(signal.take());
    }

    #[test]
    fn test_data_line_sniffing() {
        let (host, mut device) = MemoryBus::pair();
        host.data_tx.send(0xFF).unwrap();
        host.data_tx.send(0x41).unwrap();
        device.discard_data_line();
        host.data_tx.send(0xF7).unwrap();
        assert_eq!(device.sniff_data_byte(), Ok(0xF7));
        assert_eq!(device.sniff_data_byte(), Err(BusError::Timeout));
    }

    #[test]
    fn test_closed_when_host_dropped() {
        let (host, mut device) = MemoryBus::pair();
        drop(host);
        assert_eq!(device.recv_byte(), Err(BusError::Closed));
        assert_eq!(device.send_byte(0x00), Err(BusError::Closed));
    }
}
