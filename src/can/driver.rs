//! Hardware side of a CAN bus: mailbox filters, receive FIFO and transmit queue.

use super::frame::{id_matches, CanFrame};
use super::CanError;
use crate::config::{CAN_NUM_MAILBOXES, CAN_TX_MAILBOX};
use heapless::Deque;
use serde::{Deserialize, Serialize};

const VIRTUAL_RX_FIFO_SIZE: usize = 32;
const VIRTUAL_TX_QUEUE_SIZE: usize = 16;

/// A frame together with the mailbox whose filter accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub mailbox: u8,
    pub frame: CanFrame,
}

/// Acceptance filter programmed into a receive mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl MailboxFilter {
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        self.extended == frame.extended && id_matches(frame.id, self.id, self.mask)
    }
}

/// Register-level access to one CAN controller.
///
/// Implementations must not block: `receive` returns `None` when the FIFO is
/// empty and `transmit` reports a full queue as `nb::Error::WouldBlock`.
pub trait CanDriver {
    fn init(&mut self, baud_rate: u32) -> Result<(), CanError>;
    fn configure_rx_mailbox(&mut self, mailbox: u8, filter: MailboxFilter);
    fn disable_rx_mailbox(&mut self, mailbox: u8);
    fn configure_tx_mailbox(&mut self, mailbox: u8);
    fn receive(&mut self) -> Option<ReceivedFrame>;
    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), CanError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VirtualBusStats {
    pub frames_injected: u32,
    pub frames_filtered_out: u32,
    pub rx_overruns: u32,
    pub frames_transmitted: u32,
}

/// In-memory controller used by the simulator and the tests.
///
/// Frames injected with [`VirtualCanDriver::inject`] only reach the receive
/// FIFO when an enabled mailbox filter accepts them, like on the real part.
#[derive(Debug)]
pub struct VirtualCanDriver {
    baud_rate: Option<u32>,
    filters: [Option<MailboxFilter>; CAN_NUM_MAILBOXES],
    tx_mailbox: Option<u8>,
    rx_fifo: Deque<ReceivedFrame, VIRTUAL_RX_FIFO_SIZE>,
    tx_queue: Deque<CanFrame, VIRTUAL_TX_QUEUE_SIZE>,
    stats: VirtualBusStats,
}

impl VirtualCanDriver {
    pub fn new() -> Self {
        Self {
            baud_rate: None,
            filters: [None; CAN_NUM_MAILBOXES],
            tx_mailbox: None,
            rx_fifo: Deque::new(),
            tx_queue: Deque::new(),
            stats: VirtualBusStats::default(),
        }
    }

    /// Put a frame on the wire as if a remote node had sent it.
    ///
    /// Returns `false` when no mailbox accepted the frame or the FIFO overran.
    pub fn inject(&mut self, frame: CanFrame) -> bool {
        self.stats.frames_injected = self.stats.frames_injected.wrapping_add(1);

        let mailbox = self
            .filters
            .iter()
            .position(|filter| filter.is_some_and(|f| f.accepts(&frame)));

        let Some(mailbox) = mailbox else {
            self.stats.frames_filtered_out = self.stats.frames_filtered_out.wrapping_add(1);
            return false;
        };

        let received = ReceivedFrame { mailbox: mailbox as u8, frame };
        if self.rx_fifo.push_back(received).is_err() {
            self.stats.rx_overruns = self.stats.rx_overruns.wrapping_add(1);
            return false;
        }
        true
    }

    /// Take the oldest frame the board transmitted.
    pub fn pop_transmitted(&mut self) -> Option<CanFrame> {
        self.tx_queue.pop_front()
    }

    pub fn transmitted_len(&self) -> usize {
        self.tx_queue.len()
    }

    pub fn filter(&self, mailbox: u8) -> Option<MailboxFilter> {
        self.filters.get(usize::from(mailbox)).copied().flatten()
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    pub fn stats(&self) -> &VirtualBusStats {
        &self.stats
    }
}

impl Default for VirtualCanDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CanDriver for VirtualCanDriver {
    fn init(&mut self, baud_rate: u32) -> Result<(), CanError> {
        if baud_rate == 0 {
            return Err(CanError::InvalidBaudRate(baud_rate));
        }
        self.baud_rate = Some(baud_rate);
        self.filters = [None; CAN_NUM_MAILBOXES];
        self.rx_fifo.clear();
        self.tx_queue.clear();
        Ok(())
    }

    fn configure_rx_mailbox(&mut self, mailbox: u8, filter: MailboxFilter) {
        if mailbox == CAN_TX_MAILBOX {
            return;
        }
        if let Some(slot) = self.filters.get_mut(usize::from(mailbox)) {
            *slot = Some(filter);
        }
    }

    fn disable_rx_mailbox(&mut self, mailbox: u8) {
        if let Some(slot) = self.filters.get_mut(usize::from(mailbox)) {
            *slot = None;
        }
    }

    fn configure_tx_mailbox(&mut self, mailbox: u8) {
        self.tx_mailbox = Some(mailbox);
    }

    fn receive(&mut self) -> Option<ReceivedFrame> {
        self.rx_fifo.pop_front()
    }

    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<(), CanError> {
        if self.baud_rate.is_none() || self.tx_mailbox.is_none() {
            return Err(nb::Error::Other(CanError::NotInitialized));
        }
        if self.tx_queue.push_back(*frame).is_err() {
            return Err(nb::Error::WouldBlock);
        }
        self.stats.frames_transmitted = self.stats.frames_transmitted.wrapping_add(1);
        Ok(())
    }
}
