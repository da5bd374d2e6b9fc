//! Interrupt cause handling and the dispatch state machine.
//!
//! [`Can::interrupt`] is the single entry point the platform's vector routes
//! into. It drains every pending cause bit, acknowledges the snapshot via the
//! write-to-clear `INT_STAT` register and re-reads until no enabled cause
//! remains (new causes may appear while earlier ones are processed). Wake
//! events for blocked readers/writers are posted at most once per dispatch,
//! however many frames were moved.
//!
//! All hardware-reported error conditions are observational: they only feed
//! [`crate::statistics::Statistics`]. The one exception is bus-off, which
//! forces the device closed synchronously from interrupt context; the session
//! is over until the application reopens the device.

use crate::bus::{events, Can};
use crate::reg::{self, cmd, rx_stat, status};
use bitfield::bitfield;
use canfd_core::{Dependencies, EventGroup, Registers};

bitfield! {
    /// A set of interrupt cause bits, mirroring `INT_STAT`/`INT_MASK`.
    #[derive(Copy, Clone)]
    pub struct CauseSet(u32);
    /// Hardware RX FIFO is non-empty (or full).
    pub rx_pending, set_rx_pending: 0;
    /// Transmit buffer completed a frame.
    pub tx_done, set_tx_done: 1;
    /// An error counter crossed the warning level.
    pub error_warning, set_error_warning: 2;
    /// Hardware RX buffer overflowed.
    pub rx_overflow, set_rx_overflow: 3;
    /// Arbitration was lost while transmitting.
    pub arbitration_lost, set_arbitration_lost: 4;
    /// A bus error was captured.
    pub bus_error, set_bus_error: 5;
    /// A transmit buffer command completed.
    pub command_done, set_command_done: 6;
    /// An overload frame was observed.
    pub overload, set_overload: 7;
}

/// Every cause the dispatcher services.
pub(crate) const ALL_CAUSES: u32 = 0xFF;

/// Field of the arbitration sequence where arbitration was lost, decoded
/// from the capture register's bit position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArbitrationLossKind {
    /// Within the 11-bit base identifier.
    BaseId,
    /// At the SRR/RTR bit.
    SrrRtr,
    /// At the IDE bit.
    Ide,
    /// Within the 18-bit identifier extension.
    ExtendedId,
    /// At the RTR bit of an extended frame.
    ExtendedRtr,
}

impl ArbitrationLossKind {
    /// Number of variants, for statistics indexing.
    pub const COUNT: usize = 5;

    /// Classifies a captured arbitration-field bit position.
    pub fn classify(bit: u8) -> Self {
        match bit {
            0..=10 => Self::BaseId,
            11 => Self::SrrRtr,
            12 => Self::Ide,
            13..=30 => Self::ExtendedId,
            _ => Self::ExtendedRtr,
        }
    }

    /// Statistics bucket index.
    pub fn index(self) -> usize {
        match self {
            Self::BaseId => 0,
            Self::SrrRtr => 1,
            Self::Ide => 2,
            Self::ExtendedId => 3,
            Self::ExtendedRtr => 4,
        }
    }

    /// True for the identifier-segment kinds that additionally bucket by
    /// captured bit position.
    pub fn tracks_bit_position(self) -> bool {
        matches!(self, Self::BaseId | Self::ExtendedId)
    }
}

/// Bus error class captured by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusErrorKind {
    /// Dominant/recessive mismatch on a transmitted bit.
    Bit,
    /// Fixed-form field violation.
    Form,
    /// Stuffing rule violation.
    Stuff,
    /// CRC mismatch.
    Crc,
    /// Missing acknowledgement.
    Ack,
    /// Anything the hardware could not classify.
    Other,
}

impl BusErrorKind {
    /// Number of variants, for statistics indexing.
    pub const COUNT: usize = 6;

    /// Decodes the type field of the error capture register.
    pub fn from_capture(code: u32) -> Self {
        match code & 0x7 {
            0 => Self::Bit,
            1 => Self::Form,
            2 => Self::Stuff,
            3 => Self::Crc,
            4 => Self::Ack,
            _ => Self::Other,
        }
    }

    /// Statistics bucket index.
    pub fn index(self) -> usize {
        match self {
            Self::Bit => 0,
            Self::Form => 1,
            Self::Stuff => 2,
            Self::Crc => 3,
            Self::Ack => 4,
            Self::Other => 5,
        }
    }
}

fn position_bucket(position: u32) -> usize {
    (position as usize / 3).min(crate::statistics::ERROR_POSITION_BUCKETS - 1)
}

impl<R: Registers, D: Dependencies> Can<R, D> {
    /// Interrupt dispatch entry point.
    ///
    /// Must be invoked by the handler installed through
    /// [`Dependencies::install_interrupt_handler`], with the unit's own
    /// interrupt source masked for the duration of the call (the usual
    /// hardware behavior for a non-reentrant vector).
    pub fn interrupt(&mut self) {
        self.stats.interrupts += 1;
        let mut wake = 0;
        loop {
            let enabled = self.regs.read(reg::INT_MASK);
            let pending = CauseSet(self.regs.read(reg::INT_STAT) & enabled);
            if pending.0 == 0 {
                break;
            }
            if pending.rx_pending() {
                self.drain_rx();
                wake |= events::RX_AVAILABLE;
            }
            if pending.tx_done() {
                self.refill_tx();
                wake |= events::TX_SPACE;
            }
            if pending.error_warning() {
                self.stats.error_warnings += 1;
                self.regs.write(reg::CMD, cmd::ERRC_RESET);
            }
            if pending.rx_overflow() {
                self.stats.overruns += 1;
                self.regs.write(reg::CMD, cmd::RX_RELEASE);
            }
            if pending.overload() {
                self.stats.overloads += 1;
            }
            if pending.arbitration_lost() {
                self.record_arbitration_loss();
            }
            if pending.command_done() {
                self.regs.write(reg::CMD, cmd::ACK);
            }
            let fatal = pending.bus_error() && self.record_bus_error();
            // Acknowledge exactly the snapshot we processed; causes raised
            // meanwhile survive for the re-read.
            self.regs.ack(reg::INT_STAT, pending.0);
            if fatal {
                self.close_from_interrupt();
                wake |= events::FAULT;
                break;
            }
        }
        if wake != 0 {
            if let Some(events) = &self.events {
                events.post(wake);
            }
        }
    }

    fn drain_rx(&mut self) {
        let count = self.regs.read(reg::RX_STAT) & rx_stat::FRAME_COUNT;
        for _ in 0..count {
            self.receive_one();
        }
    }

    fn record_arbitration_loss(&mut self) {
        let bit = (self.regs.read(reg::ARB_CAP) & 0x1F) as u8;
        let kind = ArbitrationLossKind::classify(bit);
        self.stats.arbitration_lost += 1;
        self.stats.arbitration_lost_kinds[kind.index()] += 1;
        if kind.tracks_bit_position() {
            self.stats.arbitration_lost_bits[bit as usize] += 1;
        }
    }

    /// Records a captured bus error. Returns true if the controller went
    /// bus-off, in which case the error-counter reset is skipped and the
    /// caller must tear the session down.
    fn record_bus_error(&mut self) -> bool {
        let capture = self.regs.read(reg::ERR_CAP);
        let kind = BusErrorKind::from_capture(capture);
        let position = (capture >> 3) & 0x1F;
        self.stats.bus_errors += 1;
        self.stats.bus_error_kinds[kind.index()] += 1;
        self.stats.bus_error_positions[position_bucket(position)] += 1;
        if self.regs.is_set(reg::STATUS, status::BUS_OFF) {
            self.stats.bus_off += 1;
            true
        } else {
            self.regs.write(reg::CMD, cmd::ERRC_RESET);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitration_capture_positions_map_to_fields() {
        assert_eq!(
            ArbitrationLossKind::classify(0),
            ArbitrationLossKind::BaseId
        );
        assert_eq!(
            ArbitrationLossKind::classify(10),
            ArbitrationLossKind::BaseId
        );
        assert_eq!(
            ArbitrationLossKind::classify(11),
            ArbitrationLossKind::SrrRtr
        );
        assert_eq!(ArbitrationLossKind::classify(12), ArbitrationLossKind::Ide);
        assert_eq!(
            ArbitrationLossKind::classify(13),
            ArbitrationLossKind::ExtendedId
        );
        assert_eq!(
            ArbitrationLossKind::classify(30),
            ArbitrationLossKind::ExtendedId
        );
        assert_eq!(
            ArbitrationLossKind::classify(31),
            ArbitrationLossKind::ExtendedRtr
        );
    }

    #[test]
    fn only_identifier_segments_track_bit_positions() {
        assert!(ArbitrationLossKind::BaseId.tracks_bit_position());
        assert!(ArbitrationLossKind::ExtendedId.tracks_bit_position());
        assert!(!ArbitrationLossKind::SrrRtr.tracks_bit_position());
        assert!(!ArbitrationLossKind::Ide.tracks_bit_position());
        assert!(!ArbitrationLossKind::ExtendedRtr.tracks_bit_position());
    }

    #[test]
    fn error_capture_decodes_kind_and_position() {
        assert_eq!(BusErrorKind::from_capture(0), BusErrorKind::Bit);
        assert_eq!(BusErrorKind::from_capture(4), BusErrorKind::Ack);
        assert_eq!(BusErrorKind::from_capture(7), BusErrorKind::Other);
        assert_eq!(position_bucket(0), 0);
        assert_eq!(position_bucket(26), 8);
        // Everything past the ninth bucket collapses into the catch-all.
        assert_eq!(position_bucket(27), 9);
        assert_eq!(position_bucket(31), 9);
    }
}
