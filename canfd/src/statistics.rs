//! Diagnostic counters maintained by the interrupt dispatcher.
//!
//! All counters are written from interrupt context only; task-level code
//! reads them as a racy snapshot through [`crate::bus::Can::statistics`],
//! which is acceptable for diagnostics. The block is zeroed at every
//! hardware start and survives `read`/`write` untouched.

use crate::interrupt::{ArbitrationLossKind, BusErrorKind};

/// Number of bus-error position buckets; the last bucket is the catch-all.
pub const ERROR_POSITION_BUCKETS: usize = 10;

/// Number of tracked arbitration-field bit positions.
pub const ARBITRATION_BITS: usize = 32;

/// Monotonic counters for one controller unit.
#[derive(Copy, Clone, Debug, Default)]
pub struct Statistics {
    /// Interrupt dispatches serviced.
    pub interrupts: u32,
    /// Frames handed to the hardware transmit buffer.
    pub tx_frames: u32,
    /// Frames drained from the hardware RX FIFO.
    pub rx_frames: u32,
    /// Bus errors of any kind.
    pub bus_errors: u32,
    /// Bus errors by kind, indexed by [`BusErrorKind`].
    pub bus_error_kinds: [u32; BusErrorKind::COUNT],
    /// Bus errors by captured bit position bucket.
    pub bus_error_positions: [u32; ERROR_POSITION_BUCKETS],
    /// Arbitration losses of any kind.
    pub arbitration_lost: u32,
    /// Arbitration losses by field, indexed by [`ArbitrationLossKind`].
    pub arbitration_lost_kinds: [u32; ArbitrationLossKind::COUNT],
    /// Arbitration losses by captured bit position, for the identifier
    /// segment kinds.
    pub arbitration_lost_bits: [u32; ARBITRATION_BITS],
    /// Error-warning level crossings.
    pub error_warnings: u32,
    /// Hardware RX buffer data overflows.
    pub overruns: u32,
    /// Overload frames observed on the bus.
    pub overloads: u32,
    /// Bus-off events (each one closed the session).
    pub bus_off: u32,
    /// Frames evicted from the software RX ring because it was full.
    pub rx_ring_drops: u32,
    /// Enqueue attempts that found the software TX ring full.
    pub tx_ring_full: u32,
    /// Encode failures while refilling the hardware transmit buffer,
    /// counted up to [`crate::bus::TX_BUFFER_ERROR_REPORT_CAP`].
    pub tx_buffer_errors: u32,
}

/// Live snapshot of the hardware error counter pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Transmit error counter.
    pub transmit: u8,
    /// Receive error counter.
    pub receive: u8,
}

impl ErrorCounters {
    pub(crate) fn from_register(value: u32) -> Self {
        Self {
            transmit: (value & 0xFF) as u8,
            receive: ((value >> 8) & 0xFF) as u8,
        }
    }
}
