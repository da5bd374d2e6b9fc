//! Controller configuration: work mode flags and bit-timing parameters.
//!
//! [`BitTiming::solve`] is the bit-rate solver: it maps a requested rate to
//! the five hardware timing fields (plus the fractional prescaler
//! correction), minimizing the error against the achievable rate within the
//! register field widths.

use bitfield::bitfield;
use fugit::HertzU32;

/// Slowest supported bit rate; requests below are clamped.
pub const MIN_BITRATE: u32 = 10_000;
/// Fastest supported bit rate; requests above are clamped.
pub const MAX_BITRATE: u32 = 10_000_000;
/// Upper clamp for the RX/TX blocking timeouts, in milliseconds.
pub const MAX_TIMEOUT_MS: u32 = 1000;

const PRESCALER_MIN: u64 = 2;
const PRESCALER_MAX: u64 = 255;
const PROP_MAX: u64 = 127;
const PHASE_MIN: u64 = 2;
const PHASE_MAX: u64 = 31;
const QUANTA_MIN: u64 = 8;
const QUANTA_MAX: u64 = 128;
const SJW_MAX: u64 = 4;

/// Work mode flag set, applied to the `MODE` register at start.
///
/// The acceptance-filter bit is not part of the work mode; it is derived
/// from the filter configuration (see [`crate::filter`]).
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub struct WorkMode {
    /// Enable CAN FD frames (up to 64 byte payloads).
    pub fd: bool,
    /// Internal loopback.
    pub loopback: bool,
    /// Bus monitoring (listen only, no ACK, no TX).
    pub monitor: bool,
    /// Self test: own frames complete without acknowledgement.
    pub self_test: bool,
    /// Ignore missing acknowledgements.
    pub ignore_ack: bool,
    /// Drop remote transmission requests in hardware.
    pub ignore_rtr: bool,
    /// Time triggered transmission.
    pub timed_transmission: bool,
    /// Protocol exception handling.
    pub protocol_exception: bool,
    /// Non-ISO FD frame format.
    pub non_iso: bool,
    /// Append the capture timestamp to received frames.
    pub timestamp: bool,
    /// Route RX through DMA. Accepted but unused by this core.
    pub rx_dma: bool,
}

impl WorkMode {
    pub(crate) fn mode_bits(&self) -> u32 {
        use crate::reg::mode;
        let mut bits = 0;
        let flags = [
            (self.fd, mode::FDEN),
            (self.loopback, mode::LBACK),
            (self.monitor, mode::MON),
            (self.self_test, mode::STM),
            (self.ignore_ack, mode::ACKIGN),
            (self.ignore_rtr, mode::RTRIGN),
            (self.timed_transmission, mode::TTX),
            (self.protocol_exception, mode::PEX),
            (self.non_iso, mode::NISO),
            (self.timestamp, mode::TSEN),
            (self.rx_dma, mode::RXDMA),
        ];
        for (enabled, bit) in flags {
            if enabled {
                bits |= bit;
            }
        }
        bits
    }
}

/// Configuration for one controller unit.
///
/// Setters on [`crate::bus::Can`] mutate this between `initialize` and
/// `open`; the values are applied to hardware at the next start.
#[derive(Copy, Clone, Debug)]
pub struct CanConfig {
    /// Work mode flag set.
    pub workmode: WorkMode,
    /// Nominal bit rate of the bus.
    pub bitrate: HertzU32,
    /// Desired sample point, percent of the bit time.
    pub sample_point: u8,
    /// One-way propagation delay hint used to size the propagation segment.
    pub prop_delay_ns: u32,
    /// Timestamp counter prescaler, bit times per tick.
    pub timestamp_prescaler: u8,
    /// Abort transmission after this many failed attempts; 0 keeps the
    /// hardware retrying indefinitely.
    pub retransmit_threshold: u8,
    /// `read` blocking timeout in milliseconds, at most [`MAX_TIMEOUT_MS`].
    pub rx_timeout_ms: u32,
    /// `write` blocking timeout in milliseconds, at most [`MAX_TIMEOUT_MS`].
    pub tx_timeout_ms: u32,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            workmode: WorkMode::default(),
            bitrate: HertzU32::from_raw(500_000),
            sample_point: 75,
            prop_delay_ns: 150,
            timestamp_prescaler: 0,
            retransmit_threshold: 0,
            rx_timeout_ms: 100,
            tx_timeout_ms: 100,
        }
    }
}

bitfield! {
    /// Packed image of the `BTIME` register.
    #[derive(Copy, Clone)]
    pub struct BitTimeImage(u32);
    /// Baud rate prescaler.
    pub prescaler, set_prescaler: 7, 0;
    /// Propagation segment, in time quanta.
    pub prop_seg, set_prop_seg: 14, 8;
    /// Phase segment before the sample point.
    pub phase_seg_1, set_phase_seg_1: 19, 15;
    /// Phase segment after the sample point.
    pub phase_seg_2, set_phase_seg_2: 24, 20;
    /// Synchronization jump width.
    pub sjw, set_sjw: 28, 25;
}

/// No prescaler/quantum combination lands inside the hardware field widths
/// for this clock/rate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoValidPrescaler {
    /// Clock feeding the bit-timing logic.
    pub can_clock: HertzU32,
    /// Requested (clamped) bit rate.
    pub bitrate: HertzU32,
}

/// Bit-timing parameters in hardware units.
///
/// Invariant: `prescaler * (1 + prop_seg + phase_seg_1 + phase_seg_2 +
/// frac/256)` equals `can_clock / bitrate` within the best achievable
/// rounding error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitTiming {
    /// Baud rate prescaler, `[2, 255]`.
    pub prescaler: u8,
    /// Propagation segment length in quanta, `[1, 127]`.
    pub prop_seg: u8,
    /// Phase segment 1 length in quanta, `[2, 31]`.
    pub phase_seg_1: u8,
    /// Phase segment 2 length in quanta, `[2, 31]`.
    pub phase_seg_2: u8,
    /// Synchronization jump width, at most 4.
    pub sjw: u8,
    /// Fractional prescaler correction, in 1/256 quanta.
    pub frac: u8,
}

impl BitTiming {
    /// Number of time quanta in one bit time, ignoring the fractional
    /// correction.
    pub fn time_quanta_per_bit(&self) -> u32 {
        1 + u32::from(self.prop_seg) + u32::from(self.phase_seg_1) + u32::from(self.phase_seg_2)
    }

    /// The rate these parameters achieve for `can_clock`, including the
    /// fractional correction.
    pub fn bitrate(&self, can_clock: HertzU32) -> HertzU32 {
        let quanta_256 = u64::from(self.time_quanta_per_bit()) * 256 + u64::from(self.frac);
        let divisor = u64::from(self.prescaler) * quanta_256;
        HertzU32::from_raw((u64::from(can_clock.to_Hz()) * 256 / divisor) as u32)
    }

    /// Packs the five fields into the `BTIME` register image.
    pub fn register_image(&self) -> u32 {
        let mut image = BitTimeImage(0);
        image.set_prescaler(self.prescaler.into());
        image.set_prop_seg(self.prop_seg.into());
        image.set_phase_seg_1(self.phase_seg_1.into());
        image.set_phase_seg_2(self.phase_seg_2.into());
        image.set_sjw(self.sjw.into());
        image.0
    }

    /// Solves for the timing parameters closest to `bitrate`.
    ///
    /// The rate is clamped to the supported band first. The search scans the
    /// plausible total-quantum counts, derives the rounded prescaler for
    /// each, and keeps the pair with the smallest rate error (preferring
    /// more quanta per bit on ties). The fractional correction then absorbs
    /// the residual division error. The propagation segment is sized from
    /// the `prop_delay_ns` hint, capped at 30% of the bit time; the
    /// remaining quanta are split to put the sample point at `sample_point`
    /// percent, spilling into the propagation segment when phase segment 1
    /// saturates.
    pub fn solve(
        bitrate: HertzU32,
        can_clock: HertzU32,
        sample_point: u8,
        prop_delay_ns: u32,
    ) -> Result<Self, NoValidPrescaler> {
        let clock = u64::from(can_clock.to_Hz());
        let target = u64::from(bitrate.to_Hz().clamp(MIN_BITRATE, MAX_BITRATE));

        let mut best: Option<(u64, u64, u64)> = None;
        for quanta in (QUANTA_MIN..=QUANTA_MAX).rev() {
            let divisor = target * quanta;
            let prescaler = (clock + divisor / 2) / divisor;
            if !(PRESCALER_MIN..=PRESCALER_MAX).contains(&prescaler) {
                continue;
            }
            let actual = clock / (prescaler * quanta);
            let err = actual.abs_diff(target);
            if best.map_or(true, |(_, _, best_err)| err < best_err) {
                best = Some((quanta, prescaler, err));
            }
        }
        let (quanta, prescaler, _) = best.ok_or(NoValidPrescaler {
            can_clock,
            bitrate: HertzU32::from_raw(target as u32),
        })?;

        // Fractional correction towards the exact target rate.
        let divisor = target * prescaler;
        let scaled_quanta = (clock * 256 + divisor / 2) / divisor;
        let frac = scaled_quanta.saturating_sub(quanta * 256).min(255);

        // Propagation segment from the delay hint, leaving room for the sync
        // segment and the minimal phase segments.
        let quanta_rate = clock / prescaler;
        let mut prop = ((u64::from(prop_delay_ns) * quanta_rate + 999_999_999) / 1_000_000_000)
            .max(1)
            .min(quanta * 3 / 10)
            .min(quanta - 1 - 2 * PHASE_MIN)
            .min(PROP_MAX);

        // Very short bit times sample later in the bit.
        let point = if quanta <= 10 {
            u64::from(sample_point.max(85))
        } else {
            u64::from(sample_point)
        };
        let sample_quanta = (quanta * point + 50) / 100;
        let budget = quanta - 1 - prop;
        let phase_2 = (quanta - sample_quanta.min(quanta - PHASE_MIN))
            .clamp(PHASE_MIN, PHASE_MAX)
            .min(budget - PHASE_MIN);
        let mut phase_1 = budget - phase_2;
        if phase_1 > PHASE_MAX {
            prop += phase_1 - PHASE_MAX;
            phase_1 = PHASE_MAX;
        }
        let sjw = phase_1.min(phase_2).min(SJW_MAX);

        Ok(Self {
            prescaler: prescaler as u8,
            prop_seg: prop as u8,
            phase_seg_1: phase_1 as u8,
            phase_seg_2: phase_2 as u8,
            sjw: sjw as u8,
            frac: frac as u8,
        })
    }
}
