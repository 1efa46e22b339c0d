//! Observer registry and mailbox allocator of one CAN bus.
//!
//! Devices subscribe with an id/mask pair. Every subscription is backed by its
//! own hardware receive mailbox, so on the seven-mailbox controller the mailbox
//! pool runs out before the ten-entry observer table does. The table keeps the
//! observer limit of the device layer; `ObserverTableFull` only surfaces on a
//! controller with more receive mailboxes than observers.
//!
//! Received frames are polled from the main loop and fanned out to every
//! observer whose filter matches the frame itself, in registration order. The
//! mailbox a frame arrived through is not trusted: it may have been reassigned
//! while the frame sat in the receive FIFO.

use super::driver::{CanDriver, MailboxFilter};
use super::frame::{CanFrame, MAX_EXTENDED_ID};
use super::{CanBus, CanError};
use crate::config::{CAN_NUM_OBSERVERS, CAN_NUM_RX_MAILBOXES, CAN_TX_MAILBOX};
use crate::device::DeviceId;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub observer: DeviceId,
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
    pub mailbox: u8,
}

impl Subscription {
    fn accepts(&self, frame: &CanFrame) -> bool {
        self.extended == frame.extended && frame.matches(self.id, self.mask)
    }
}

/// One received frame and the observers it has to be delivered to.
#[derive(Debug, Clone)]
pub struct Reception {
    pub frame: CanFrame,
    pub mailbox: u8,
    pub observers: Vec<DeviceId, CAN_NUM_OBSERVERS>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CanStats {
    pub frames_received: u32,
    pub frames_delivered: u32,
    pub frames_unmatched: u32,
    pub frames_sent: u32,
    pub send_failures: u32,
    pub attach_failures: u32,
    pub active_subscriptions: u8,
}

/// What a device may do with a bus while it handles an event.
pub trait CanPort {
    fn bus(&self) -> CanBus;
    fn attach(&mut self, observer: DeviceId, id: u32, mask: u32, extended: bool) -> Result<u8, CanError>;
    fn detach(&mut self, observer: DeviceId, id: u32, mask: u32) -> bool;
    fn detach_all(&mut self, observer: DeviceId) -> usize;
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CanError>;
    fn prepare_output_frame(&self, id: u32) -> CanFrame {
        CanFrame::output(id)
    }
}

#[derive(Debug)]
pub struct CanHandler<D: CanDriver> {
    bus: CanBus,
    driver: D,
    subscriptions: Vec<Subscription, CAN_NUM_OBSERVERS>,
    initialized: bool,
    stats: CanStats,
}

impl<D: CanDriver> CanHandler<D> {
    pub fn new(bus: CanBus, driver: D) -> Self {
        Self {
            bus,
            driver,
            subscriptions: Vec::new(),
            initialized: false,
            stats: CanStats::default(),
        }
    }

    /// Bring up the controller: set the speed, close all receive mailboxes and
    /// reserve the transmit mailbox. Existing subscriptions are re-programmed.
    pub fn initialize(&mut self, baud_rate: u32) -> Result<(), CanError> {
        self.driver.init(baud_rate)?;

        for mailbox in 0..CAN_NUM_RX_MAILBOXES as u8 {
            self.driver.disable_rx_mailbox(mailbox);
        }
        self.driver.configure_tx_mailbox(CAN_TX_MAILBOX);

        for sub in &self.subscriptions {
            self.driver.configure_rx_mailbox(
                sub.mailbox,
                MailboxFilter { id: sub.id, mask: sub.mask, extended: sub.extended },
            );
        }

        self.initialized = true;
        debug!(bus = self.bus.name(), baud_rate, "CAN bus initialized");
        Ok(())
    }

    /// Register `observer` for frames whose masked id equals `id & mask`.
    ///
    /// Returns the receive mailbox backing the subscription. Attaching the
    /// same (observer, id, mask) twice returns the mailbox of the first call.
    pub fn attach(&mut self, observer: DeviceId, id: u32, mask: u32, extended: bool) -> Result<u8, CanError> {
        if id > MAX_EXTENDED_ID {
            self.stats.attach_failures = self.stats.attach_failures.wrapping_add(1);
            error!(bus = self.bus.name(), %observer, "invalid id {:#x} for subscription", id);
            return Err(CanError::InvalidIdentifier(id));
        }

        if let Some(existing) = self
            .subscriptions
            .iter()
            .find(|s| s.observer == observer && s.id == id && s.mask == mask)
        {
            debug!(bus = self.bus.name(), %observer, mailbox = existing.mailbox, "observer already attached");
            return Ok(existing.mailbox);
        }

        let Some(mailbox) = self.find_free_mailbox() else {
            self.stats.attach_failures = self.stats.attach_failures.wrapping_add(1);
            error!(bus = self.bus.name(), %observer, "unable to attach observer, no free mailbox");
            return Err(CanError::NoFreeMailbox);
        };

        let subscription = Subscription { observer, id, mask, extended, mailbox };
        if self.subscriptions.push(subscription).is_err() {
            self.stats.attach_failures = self.stats.attach_failures.wrapping_add(1);
            error!(bus = self.bus.name(), %observer, "unable to attach observer, observer table full");
            return Err(CanError::ObserverTableFull);
        }

        self.driver.configure_rx_mailbox(mailbox, MailboxFilter { id, mask, extended });
        self.stats.active_subscriptions = self.subscriptions.len() as u8;

        debug!(
            bus = self.bus.name(),
            %observer,
            mailbox,
            "attached observer for id {:#x} mask {:#x} extended {}",
            id,
            mask,
            extended
        );
        Ok(mailbox)
    }

    /// Remove the matching subscription and free its mailbox.
    ///
    /// Returns whether a subscription was removed; a miss is not an error.
    pub fn detach(&mut self, observer: DeviceId, id: u32, mask: u32) -> bool {
        let Some(index) = self
            .subscriptions
            .iter()
            .position(|s| s.observer == observer && s.id == id && s.mask == mask)
        else {
            return false;
        };

        let removed = self.subscriptions.remove(index);
        self.driver.disable_rx_mailbox(removed.mailbox);
        self.stats.active_subscriptions = self.subscriptions.len() as u8;

        debug!(bus = self.bus.name(), %observer, mailbox = removed.mailbox, "detached observer");
        true
    }

    /// Remove every subscription held by `observer`.
    pub fn detach_all(&mut self, observer: DeviceId) -> usize {
        let mut removed = 0;
        while let Some(index) = self.subscriptions.iter().position(|s| s.observer == observer) {
            let sub = self.subscriptions.remove(index);
            self.driver.disable_rx_mailbox(sub.mailbox);
            removed += 1;
        }
        self.stats.active_subscriptions = self.subscriptions.len() as u8;
        removed
    }

    /// Poll the controller for one frame and resolve its observers.
    ///
    /// Each observer appears at most once, in registration order, even when
    /// several of its subscriptions match.
    pub fn receive(&mut self) -> Option<Reception> {
        let received = self.driver.receive()?;
        self.stats.frames_received = self.stats.frames_received.wrapping_add(1);
        log_frame(self.bus, &received.frame);

        let mut observers: Vec<DeviceId, CAN_NUM_OBSERVERS> = Vec::new();
        for sub in &self.subscriptions {
            if sub.accepts(&received.frame) && !observers.contains(&sub.observer) {
                // capacity equals the table size, so this cannot overflow
                let _ = observers.push(sub.observer);
            }
        }

        if observers.is_empty() {
            self.stats.frames_unmatched = self.stats.frames_unmatched.wrapping_add(1);
            debug!(bus = self.bus.name(), "no observer for frame id {:#x}", received.frame.id);
        } else {
            self.stats.frames_delivered = self.stats.frames_delivered.wrapping_add(observers.len() as u32);
        }

        Some(Reception { frame: received.frame, mailbox: received.mailbox, observers })
    }

    /// Drain the controller, handing every (observer, frame) pair to `deliver`.
    ///
    /// Returns the number of frames taken from the hardware.
    pub fn process<F>(&mut self, mut deliver: F) -> usize
    where
        F: FnMut(DeviceId, &CanFrame),
    {
        let mut frames = 0;
        while let Some(reception) = self.receive() {
            frames += 1;
            for observer in &reception.observers {
                deliver(*observer, &reception.frame);
            }
        }
        frames
    }

    /// Queue a frame on the transmit mailbox. Delivery is not confirmed.
    pub fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        if !self.initialized {
            self.stats.send_failures = self.stats.send_failures.wrapping_add(1);
            return Err(CanError::NotInitialized);
        }

        match self.driver.transmit(frame) {
            Ok(()) => {
                self.stats.frames_sent = self.stats.frames_sent.wrapping_add(1);
                log_frame(self.bus, frame);
                Ok(())
            }
            Err(nb::Error::WouldBlock) => {
                self.stats.send_failures = self.stats.send_failures.wrapping_add(1);
                warn!(bus = self.bus.name(), "transmit queue full, dropping frame {:#x}", frame.id);
                Err(CanError::TxQueueFull)
            }
            Err(nb::Error::Other(e)) => {
                self.stats.send_failures = self.stats.send_failures.wrapping_add(1);
                error!(bus = self.bus.name(), "unable to send frame {:#x}: {}", frame.id, e);
                Err(e)
            }
        }
    }

    pub fn prepare_output_frame(&self, id: u32) -> CanFrame {
        CanFrame::output(id)
    }

    pub fn bus(&self) -> CanBus {
        self.bus
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn stats(&self) -> &CanStats {
        &self.stats
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn find_free_mailbox(&self) -> Option<u8> {
        (0..CAN_NUM_RX_MAILBOXES as u8).find(|mailbox| !self.subscriptions.iter().any(|s| s.mailbox == *mailbox))
    }
}

impl<D: CanDriver> CanPort for CanHandler<D> {
    fn bus(&self) -> CanBus {
        self.bus
    }

    fn attach(&mut self, observer: DeviceId, id: u32, mask: u32, extended: bool) -> Result<u8, CanError> {
        CanHandler::attach(self, observer, id, mask, extended)
    }

    fn detach(&mut self, observer: DeviceId, id: u32, mask: u32) -> bool {
        CanHandler::detach(self, observer, id, mask)
    }

    fn detach_all(&mut self, observer: DeviceId) -> usize {
        CanHandler::detach_all(self, observer)
    }

    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        CanHandler::send_frame(self, frame)
    }
}

fn log_frame(bus: CanBus, frame: &CanFrame) {
    trace!(
        bus = bus.name(),
        "frame id={:#x} ext={} len={} data={:02x?}",
        frame.id,
        frame.extended,
        frame.length,
        frame.payload()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::driver::VirtualCanDriver;

    const OBSERVER_A: DeviceId = DeviceId(0x0101);
    const OBSERVER_B: DeviceId = DeviceId(0x0102);

    fn handler() -> CanHandler<VirtualCanDriver> {
        let mut handler = CanHandler::new(CanBus::Ev, VirtualCanDriver::new());
        handler.initialize(500_000).unwrap();
        handler
    }

    #[test]
    fn test_attach_programs_mailbox() {
        let mut handler = handler();
        let mailbox = handler.attach(OBSERVER_A, 0x724, 0x7fe, false).unwrap();

        let filter = handler.driver().filter(mailbox).unwrap();
        assert_eq!(filter.id, 0x724);
        assert_eq!(filter.mask, 0x7fe);
        assert!(!filter.extended);
    }

    #[test]
    fn test_reattach_is_idempotent() {
        let mut handler = handler();
        let first = handler.attach(OBSERVER_A, 0x724, 0x7fe, false).unwrap();
        let second = handler.attach(OBSERVER_A, 0x724, 0x7fe, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(handler.subscriptions().len(), 1);
    }

    #[test]
    fn test_mailbox_pool_exhaustion() {
        let mut handler = handler();
        for i in 0..CAN_NUM_RX_MAILBOXES as u32 {
            handler.attach(OBSERVER_A, 0x100 + i, 0x7ff, false).unwrap();
        }
        assert_eq!(handler.attach(OBSERVER_B, 0x200, 0x7ff, false), Err(CanError::NoFreeMailbox));
        assert_eq!(handler.stats().attach_failures, 1);
        assert_eq!(handler.subscriptions().len(), CAN_NUM_RX_MAILBOXES);
    }

    #[test]
    fn test_detach_releases_mailbox() {
        let mut handler = handler();
        let mailbox = handler.attach(OBSERVER_A, 0x724, 0x7fe, false).unwrap();
        assert!(handler.detach(OBSERVER_A, 0x724, 0x7fe));
        assert!(handler.driver().filter(mailbox).is_none());

        let reused = handler.attach(OBSERVER_B, 0x300, 0x7ff, false).unwrap();
        assert_eq!(reused, mailbox);
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let mut handler = handler();
        let result = handler.attach(OBSERVER_A, 0x2000_0000, 0x7ff, true);
        assert_eq!(result, Err(CanError::InvalidIdentifier(0x2000_0000)));
    }

    #[test]
    fn test_send_requires_initialization() {
        let mut handler = CanHandler::new(CanBus::Car, VirtualCanDriver::new());
        let frame = handler.prepare_output_frame(0x100);
        assert_eq!(handler.send_frame(&frame), Err(CanError::NotInitialized));
    }

    #[test]
    fn test_observer_with_two_matching_subscriptions_gets_one_delivery() {
        let mut handler = handler();
        handler.attach(OBSERVER_A, 0x724, 0x7fe, false).unwrap();
        handler.attach(OBSERVER_A, 0x724, 0x7ff, false).unwrap();

        handler.driver_mut().inject(CanFrame::new(0x724, &[0; 8]));
        let reception = handler.receive().unwrap();
        assert_eq!(reception.observers.as_slice(), &[OBSERVER_A]);
    }

    #[test]
    fn test_extended_flag_separates_subscriptions() {
        let mut handler = handler();
        handler.attach(OBSERVER_A, 0x100, 0x7ff, false).unwrap();
        handler.attach(OBSERVER_B, 0x100, 0x7ff, true).unwrap();

        let extended = CanFrame { extended: true, ..CanFrame::new(0x100, &[0; 8]) };
        assert!(handler.driver_mut().inject(extended));
        let reception = handler.receive().unwrap();
        assert_eq!(reception.observers.as_slice(), &[OBSERVER_B]);

        assert!(handler.driver_mut().inject(CanFrame::new(0x100, &[0; 8])));
        let reception = handler.receive().unwrap();
        assert_eq!(reception.observers.as_slice(), &[OBSERVER_A]);
    }
}
