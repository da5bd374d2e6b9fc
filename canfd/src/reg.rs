//! Register map of the CAN controller unit and a thin access wrapper.
//!
//! The driver never touches `canfd_core::Registers` directly; everything goes
//! through [`RegisterFile`] so that the interrupt logic reads as intent
//! (`read_and_ack`, `set_bits`) while preserving the read-then-write ordering
//! the write-to-clear registers require.

use canfd_core::Registers;

/// Work mode register. Writable only while the controller is disabled.
pub const MODE: usize = 0x00;
/// Controller enable/reset register.
pub const CTRL: usize = 0x04;
/// Live controller status.
pub const STATUS: usize = 0x08;
/// One-shot command strobes.
pub const CMD: usize = 0x0C;
/// Packed bit-timing image, see [`crate::config::BitTiming::register_image`].
pub const BTIME: usize = 0x10;
/// Fractional prescaler correction, in 1/256 time quanta.
pub const BFRAC: usize = 0x14;
/// Timestamp counter prescaler.
pub const TSPRESC: usize = 0x18;
/// Free-running timestamp counter.
pub const TIMESTAMP: usize = 0x1C;
/// Interrupt cause register, write-to-clear.
pub const INT_STAT: usize = 0x20;
/// Interrupt enable mask.
pub const INT_MASK: usize = 0x24;
/// Error counter pair, REC in \[15:8\], TEC in \[7:0\].
pub const ERR_CNT: usize = 0x28;
/// Bus error capture, type in \[2:0\], bit position in \[7:3\].
pub const ERR_CAP: usize = 0x2C;
/// Arbitration lost capture, bit position in \[4:0\].
pub const ARB_CAP: usize = 0x30;
/// RX FIFO status, frame count in \[6:0\], MORE in bit 8.
pub const RX_STAT: usize = 0x34;
/// RX FIFO read port; each read pops one word of the oldest frame.
pub const RX_PORT: usize = 0x38;
/// Transmit buffer slot select.
pub const TX_SEL: usize = 0x3C;
/// Transmit buffer write port; each write pushes one word.
pub const TX_PORT: usize = 0x40;
/// Acceptance filter format control bits, see [`crate::filter`].
pub const FILTER_CTRL: usize = 0x50;
/// Acceptance filter mask registers, one per filter, stride 8.
pub const FILTER_MASK: [usize; 3] = [0x54, 0x5C, 0x64];
/// Acceptance filter value registers, one per filter, stride 8.
pub const FILTER_VALUE: [usize; 3] = [0x58, 0x60, 0x68];
/// Range filter lower bound.
pub const RANGE_LOW: usize = 0x6C;
/// Range filter upper bound.
pub const RANGE_HIGH: usize = 0x70;
/// Automatic retransmission threshold.
pub const RETRY: usize = 0x74;

/// `MODE` register bits.
pub mod mode {
    /// CAN FD operation enable.
    pub const FDEN: u32 = 1 << 0;
    /// Acceptance filtering active (master filter enable).
    pub const AFM: u32 = 1 << 1;
    /// Internal loopback.
    pub const LBACK: u32 = 1 << 2;
    /// Bus monitoring (listen only).
    pub const MON: u32 = 1 << 3;
    /// Self test (no ACK required for own frames).
    pub const STM: u32 = 1 << 4;
    /// Ignore missing acknowledgement.
    pub const ACKIGN: u32 = 1 << 5;
    /// Ignore remote transmission requests.
    pub const RTRIGN: u32 = 1 << 6;
    /// Protocol exception handling.
    pub const PEX: u32 = 1 << 7;
    /// Non-ISO FD frame format.
    pub const NISO: u32 = 1 << 8;
    /// Time triggered transmission.
    pub const TTX: u32 = 1 << 9;
    /// Append timestamp to received frames.
    pub const TSEN: u32 = 1 << 10;
    /// Route received frames through DMA. Unused by this core.
    pub const RXDMA: u32 = 1 << 11;
}

/// `CTRL` register bits.
pub mod ctrl {
    /// Controller enable. Clear holds the unit in reset/configuration mode.
    pub const EN: u32 = 1 << 0;
}

/// `STATUS` register bits.
pub mod status {
    /// Hardware RX FIFO holds at least one frame.
    pub const RX_NONEMPTY: u32 = 1 << 0;
    /// Transmit buffer is idle and may be (re)filled.
    pub const TX_IDLE: u32 = 1 << 1;
    /// An error counter crossed the warning level.
    pub const EWARN: u32 = 1 << 2;
    /// The controller is in the error passive state.
    pub const EPASS: u32 = 1 << 3;
    /// The controller is bus-off.
    pub const BUS_OFF: u32 = 1 << 4;
}

/// `CMD` register strobes.
pub mod cmd {
    /// Request transmission of the selected buffer.
    pub const TX_REQ: u32 = 1 << 0;
    /// Reset both hardware error counters.
    pub const ERRC_RESET: u32 = 1 << 1;
    /// Release the hardware RX buffer after a data overflow.
    pub const RX_RELEASE: u32 = 1 << 2;
    /// Acknowledge completion of a transmit buffer command.
    pub const ACK: u32 = 1 << 3;
}

/// `RX_STAT` register fields.
pub mod rx_stat {
    /// Number of complete frames held by the hardware RX FIFO.
    pub const FRAME_COUNT: u32 = 0x7F;
    /// More data words of the current frame remain to be read.
    pub const MORE: u32 = 1 << 8;
}

/// Intent-level access wrapper over a raw register file.
pub struct RegisterFile<R: Registers> {
    raw: R,
}

impl<R: Registers> RegisterFile<R> {
    /// Wraps a raw register file.
    pub fn new(raw: R) -> Self {
        Self { raw }
    }

    /// Reads the register at `offset`.
    pub fn read(&self, offset: usize) -> u32 {
        self.raw.read(offset)
    }

    /// Writes the register at `offset`.
    pub fn write(&self, offset: usize, value: u32) {
        self.raw.write(offset, value)
    }

    /// Read-modify-write: sets `mask` bits in the register at `offset`.
    pub fn set_bits(&self, offset: usize, mask: u32) {
        self.raw.write(offset, self.raw.read(offset) | mask)
    }

    /// Read-modify-write: clears `mask` bits in the register at `offset`.
    pub fn clear_bits(&self, offset: usize, mask: u32) {
        self.raw.write(offset, self.raw.read(offset) & !mask)
    }

    /// True if any bit of `mask` is set in the register at `offset`.
    pub fn is_set(&self, offset: usize, mask: u32) -> bool {
        self.raw.read(offset) & mask != 0
    }

    /// Acknowledges a previously read snapshot of a write-to-clear register
    /// by writing it back. Must only be used on registers with W1C semantics.
    pub fn ack(&self, offset: usize, snapshot: u32) {
        self.raw.write(offset, snapshot)
    }
}
