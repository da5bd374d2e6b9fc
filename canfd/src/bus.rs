//! The controller device: lifecycle, blocking data paths and runtime
//! reconfiguration.
//!
//! A [`Can`] owns one controller unit's register file plus the platform glue
//! behind [`Dependencies`]. Its lifecycle is uninitialized, initialized,
//! opened: [`Can::initialize`] resolves bit timing and allocates the wake
//! event group once, [`Can::open`] allocates the software rings on first use
//! and starts the hardware, [`Can::close`] stops it while keeping the ring
//! storage for the next session. Configuration setters apply between
//! `initialize` and `open`; the values reach the hardware at the next start.
//!
//! `read` and `write` move whole frames through the software rings and block
//! on the event group only when they cannot make progress, so partial
//! transfers complete without waiting.

use crate::config::{BitTiming, CanConfig, WorkMode, MAX_TIMEOUT_MS};
use crate::filter::{AcceptanceFilter, FilterConfig, RangeFilter, FILTER_COUNT};
use crate::interrupt::ALL_CAUSES;
use crate::message::{Message, CLASSIC_MAX_PAYLOAD, MAX_DATA_WORDS};
use crate::reg::{self, cmd, ctrl, mode, rx_stat, status, RegisterFile};
use crate::ring::{CapacityError, MessageRing};
use crate::statistics::{ErrorCounters, Statistics};
use canfd_core::{Dependencies, EventGroup, OutOfMemory, Registers};
use fugit::HertzU32;

/// Wake event bits posted by the interrupt dispatcher.
pub mod events {
    /// At least one frame was pushed into the RX ring.
    pub const RX_AVAILABLE: u32 = 1 << 0;
    /// Space opened up in the TX ring.
    pub const TX_SPACE: u32 = 1 << 1;
    /// The session was torn down from interrupt context.
    pub const FAULT: u32 = 1 << 2;
}

/// Ring capacity used unless [`Can::set_ring_capacity`] changes it.
pub const DEFAULT_RING_CAPACITY: usize = 64;

/// Ceiling on the reported TX encode-failure count per session; the sticky
/// [`Status::buffer_error`] flag remains authoritative past it.
pub const TX_BUFFER_ERROR_REPORT_CAP: u32 = 16;

/// Driver error taxonomy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The device has not been initialized.
    NotInitialized,
    /// The device is not open.
    NotOpened,
    /// The operation cannot run in the current state.
    Busy,
    /// A parameter is out of its valid domain.
    InvalidArgument,
    /// An allocation failed.
    OutOfMemory,
    /// The controller is bus-off; the session is unusable.
    NetworkDown,
    /// A fault ended the transfer while it was blocked.
    Io,
    /// An index addressed a nonexistent filter or transmit buffer.
    OutOfBounds,
}

impl From<OutOfMemory> for Error {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

impl From<CapacityError> for Error {
    fn from(error: CapacityError) -> Self {
        match error {
            CapacityError::Zero => Self::InvalidArgument,
            CapacityError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// Snapshot of the controller's live status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// The hardware RX FIFO holds at least one frame.
    pub rx_pending: bool,
    /// The transmit buffer is idle.
    pub tx_idle: bool,
    /// An error counter crossed the warning level.
    pub warning: bool,
    /// The controller is error passive.
    pub error_passive: bool,
    /// The controller is bus-off.
    pub bus_off: bool,
    /// A queued frame failed to encode for the transmit buffer at some
    /// point since the last start.
    pub buffer_error: bool,
    /// The hardware error counter pair.
    pub counters: ErrorCounters,
}

/// Last values written to the static configuration registers, kept to skip
/// redundant writes at start.
#[derive(Default)]
struct ConfigCache {
    mode: Option<u32>,
    btime: Option<u32>,
    bfrac: Option<u32>,
    tsprescaler: Option<u32>,
    retry: Option<u32>,
    filter_ctrl: Option<u32>,
}

/// One CAN FD controller unit.
pub struct Can<R: Registers, D: Dependencies> {
    pub(crate) regs: RegisterFile<R>,
    deps: D,
    config: CanConfig,
    timing: Option<BitTiming>,
    filters: FilterConfig,
    range: RangeFilter,
    filters_dirty: bool,
    cache: ConfigCache,
    buffer_error: bool,
    pub(crate) events: Option<D::Events>,
    pub(crate) rx: Option<MessageRing>,
    pub(crate) tx: Option<MessageRing>,
    pub(crate) stats: Statistics,
    ring_capacity: usize,
    initialized: bool,
    opened: bool,
}

impl<R: Registers, D: Dependencies> Can<R, D> {
    /// Wraps a register file and its platform dependencies.
    ///
    /// No hardware access happens until [`Can::initialize`].
    pub fn new(registers: R, dependencies: D) -> Self {
        Self {
            regs: RegisterFile::new(registers),
            deps: dependencies,
            config: CanConfig::default(),
            timing: None,
            filters: FilterConfig::default(),
            range: RangeFilter::default(),
            filters_dirty: true,
            cache: ConfigCache::default(),
            buffer_error: false,
            events: None,
            rx: None,
            tx: None,
            stats: Statistics::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            initialized: false,
            opened: false,
        }
    }

    /// One-time setup: puts the hardware into its base reset state, resolves
    /// bit timing for the current configuration, creates the wake event group
    /// and installs the interrupt handler.
    ///
    /// Idempotent; a second call on an initialized device does nothing.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        // Base reset state: controller disabled, all causes masked and
        // cleared.
        self.regs.clear_bits(reg::CTRL, ctrl::EN);
        self.regs.write(reg::INT_MASK, 0);
        self.regs.ack(reg::INT_STAT, ALL_CAUSES);
        self.resolve_timing()?;
        if self.events.is_none() {
            self.events = Some(self.deps.create_events()?);
        }
        self.deps.install_interrupt_handler();
        self.initialized = true;
        Ok(())
    }

    /// Starts a session: allocates the software rings on first open (the
    /// storage is reused afterwards) and brings the hardware up with the
    /// current configuration.
    ///
    /// A no-op on an already open device.
    pub fn open(&mut self) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if self.opened {
            return Ok(());
        }
        if self
            .rx
            .as_ref()
            .map_or(true, |ring| ring.capacity() != self.ring_capacity)
        {
            // Allocate both before keeping either, so a failed second
            // allocation leaves the device without half a ring pair.
            let rx = MessageRing::with_capacity(self.ring_capacity)?;
            let tx = MessageRing::with_capacity(self.ring_capacity)?;
            self.rx = Some(rx);
            self.tx = Some(tx);
        }
        self.start()?;
        self.opened = true;
        Ok(())
    }

    /// Ends the session: stops the hardware and empties the rings. The ring
    /// storage and the statistics survive until the next [`Can::open`].
    ///
    /// A no-op on a device that is not open.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.opened {
            self.teardown();
        }
        Ok(())
    }

    /// Reads up to `frames.len()` received frames.
    ///
    /// Returns as soon as at least one frame was copied. With an empty ring
    /// the call blocks for the configured RX timeout; expiry yields
    /// `Ok(0)`. A fault raised while blocked aborts with [`Error::Io`].
    pub fn read(&mut self, frames: &mut [Message]) -> Result<usize, Error> {
        if frames.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut count = 0;
        loop {
            if !self.opened {
                return Err(Error::NotOpened);
            }
            if let Some(rx) = self.rx.as_mut() {
                while count < frames.len() {
                    match rx.claim_for_read() {
                        Some(message) => {
                            frames[count] = *message;
                            rx.commit_read();
                            count += 1;
                        }
                        None => break,
                    }
                }
            }
            if count > 0 {
                return Ok(count);
            }
            let waiter = self.events.as_ref().ok_or(Error::NotInitialized)?;
            let woken = waiter.wait(events::RX_AVAILABLE | events::FAULT, self.config.rx_timeout_ms);
            if woken & events::FAULT != 0 {
                return Err(Error::Io);
            }
            if woken == 0 {
                return Ok(0);
            }
        }
    }

    /// Queues `frames` for transmission.
    ///
    /// Frames go straight to the idle hardware buffer when the TX ring is
    /// empty; otherwise they are ring-buffered and sent from interrupt
    /// context. When the ring fills, the call blocks for the configured TX
    /// timeout and then returns the number of frames it accepted, possibly
    /// zero. A fault raised while blocked aborts with [`Error::Io`].
    pub fn write(&mut self, frames: &[Message]) -> Result<usize, Error> {
        if frames.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if !self.opened {
            return Err(Error::NotOpened);
        }
        if self.regs.is_set(reg::STATUS, status::BUS_OFF) {
            return Err(Error::NetworkDown);
        }
        if !self.config.workmode.fd
            && frames.iter().any(|f| f.len() > CLASSIC_MAX_PAYLOAD)
        {
            return Err(Error::InvalidArgument);
        }
        let mut count = 0;
        loop {
            if !self.opened {
                // Torn down while blocked.
                return if count > 0 {
                    Ok(count)
                } else {
                    Err(Error::NetworkDown)
                };
            }
            while count < frames.len() {
                let ring_empty = self.tx.as_ref().map_or(true, MessageRing::is_empty);
                if ring_empty && self.regs.is_set(reg::STATUS, status::TX_IDLE) {
                    self.send_one(0, &frames[count])?;
                    count += 1;
                    continue;
                }
                let Some(tx) = self.tx.as_mut() else {
                    return Err(Error::NotOpened);
                };
                match tx.claim_for_write(false) {
                    Some(slot) => {
                        *slot = frames[count];
                        tx.commit_write();
                        count += 1;
                    }
                    None => {
                        self.stats.tx_ring_full += 1;
                        break;
                    }
                }
            }
            if count == frames.len() {
                return Ok(count);
            }
            let waiter = self.events.as_ref().ok_or(Error::NotInitialized)?;
            let woken = waiter.wait(events::TX_SPACE | events::FAULT, self.config.tx_timeout_ms);
            if woken & events::FAULT != 0 {
                return Err(Error::Io);
            }
            if woken == 0 {
                return Ok(count);
            }
        }
    }

    /// Non-blocking read of a single frame from the RX ring.
    pub fn try_read(&mut self) -> nb::Result<Message, Error> {
        if !self.opened {
            return Err(nb::Error::Other(Error::NotOpened));
        }
        let rx = self
            .rx
            .as_mut()
            .ok_or(nb::Error::Other(Error::NotOpened))?;
        match rx.claim_for_read() {
            Some(message) => {
                let message = *message;
                rx.commit_read();
                Ok(message)
            }
            None => Err(nb::Error::WouldBlock),
        }
    }

    /// Non-blocking enqueue of a single frame.
    ///
    /// Goes straight to the idle hardware buffer when the TX ring is empty,
    /// otherwise ring-buffers the frame; a full ring yields `WouldBlock`.
    pub fn try_write(&mut self, message: &Message) -> nb::Result<(), Error> {
        if !self.opened {
            return Err(nb::Error::Other(Error::NotOpened));
        }
        if self.regs.is_set(reg::STATUS, status::BUS_OFF) {
            return Err(nb::Error::Other(Error::NetworkDown));
        }
        if !self.config.workmode.fd && message.len() > CLASSIC_MAX_PAYLOAD {
            return Err(nb::Error::Other(Error::InvalidArgument));
        }
        let ring_empty = self.tx.as_ref().map_or(true, MessageRing::is_empty);
        if ring_empty && self.regs.is_set(reg::STATUS, status::TX_IDLE) {
            self.send_one(0, message).map_err(nb::Error::Other)?;
            return Ok(());
        }
        let Some(tx) = self.tx.as_mut() else {
            return Err(nb::Error::Other(Error::NotOpened));
        };
        match tx.claim_for_write(false) {
            Some(slot) => {
                *slot = *message;
                tx.commit_write();
                Ok(())
            }
            None => {
                self.stats.tx_ring_full += 1;
                Err(nb::Error::WouldBlock)
            }
        }
    }

    /// Replaces the work mode flag set. Takes effect at the next start.
    pub fn set_workmode(&mut self, workmode: WorkMode) -> Result<(), Error> {
        self.configure(|config| config.workmode = workmode)
    }

    /// Sets the nominal bit rate. The rate is clamped to the supported band
    /// and resolved to timing parameters immediately.
    pub fn set_bitrate(&mut self, bitrate: HertzU32) -> Result<(), Error> {
        self.configure(|config| config.bitrate = bitrate)?;
        self.resolve_timing()
    }

    /// Sets the desired sample point in percent of the bit time.
    pub fn set_sample_point(&mut self, percent: u8) -> Result<(), Error> {
        if !(50..=95).contains(&percent) {
            return Err(Error::InvalidArgument);
        }
        self.configure(|config| config.sample_point = percent)?;
        self.resolve_timing()
    }

    /// Sets the one-way propagation delay hint in nanoseconds.
    pub fn set_propagation_delay(&mut self, nanoseconds: u32) -> Result<(), Error> {
        self.configure(|config| config.prop_delay_ns = nanoseconds)?;
        self.resolve_timing()
    }

    /// Installs or reverts one acceptance filter. `None` restores the inert
    /// accept-all default.
    pub fn set_filter(
        &mut self,
        index: usize,
        filter: Option<AcceptanceFilter>,
    ) -> Result<(), Error> {
        if index >= FILTER_COUNT {
            return Err(Error::OutOfBounds);
        }
        self.configure(|_| ())?;
        self.filters.filters[index] = filter.unwrap_or_default();
        self.filters_dirty = true;
        Ok(())
    }

    /// Installs or reverts the identifier range filter.
    pub fn set_range(&mut self, range: Option<RangeFilter>) -> Result<(), Error> {
        if let Some(range) = range {
            if range.low > range.high {
                return Err(Error::InvalidArgument);
            }
        }
        self.configure(|_| ())?;
        self.range = range.unwrap_or_default();
        self.filters_dirty = true;
        Ok(())
    }

    /// Sets the timestamp counter prescaler in bit times per tick.
    pub fn set_timestamp_prescaler(&mut self, prescaler: u8) -> Result<(), Error> {
        self.configure(|config| config.timestamp_prescaler = prescaler)
    }

    /// Sets the retransmission attempt limit; 0 retries indefinitely.
    pub fn set_retransmit_threshold(&mut self, attempts: u8) -> Result<(), Error> {
        self.configure(|config| config.retransmit_threshold = attempts)
    }

    /// Sets the `read` blocking timeout, clamped to [`MAX_TIMEOUT_MS`].
    /// Usable in any state.
    pub fn set_rx_timeout(&mut self, milliseconds: u32) {
        self.config.rx_timeout_ms = milliseconds.min(MAX_TIMEOUT_MS);
    }

    /// Sets the `write` blocking timeout, clamped to [`MAX_TIMEOUT_MS`].
    /// Usable in any state.
    pub fn set_tx_timeout(&mut self, milliseconds: u32) {
        self.config.tx_timeout_ms = milliseconds.min(MAX_TIMEOUT_MS);
    }

    /// Sets the capacity used when the rings are (re)allocated at the next
    /// open.
    pub fn set_ring_capacity(&mut self, capacity: usize) -> Result<(), Error> {
        if capacity == 0 {
            return Err(Error::InvalidArgument);
        }
        self.configure(|_| ())?;
        self.ring_capacity = capacity;
        Ok(())
    }

    /// The current configuration.
    pub fn config(&self) -> &CanConfig {
        &self.config
    }

    /// The resolved bit-timing parameters, once initialized.
    pub fn bit_timing(&self) -> Option<BitTiming> {
        self.timing
    }

    /// The free-running timestamp counter.
    pub fn timestamp(&self) -> u32 {
        self.regs.read(reg::TIMESTAMP)
    }

    /// Snapshot of the diagnostic counters.
    pub fn statistics(&self) -> Statistics {
        self.stats
    }

    /// Snapshot of the live controller status.
    pub fn status(&self) -> Status {
        let bits = self.regs.read(reg::STATUS);
        Status {
            rx_pending: bits & status::RX_NONEMPTY != 0,
            tx_idle: bits & status::TX_IDLE != 0,
            warning: bits & status::EWARN != 0,
            error_passive: bits & status::EPASS != 0,
            bus_off: bits & status::BUS_OFF != 0,
            buffer_error: self.buffer_error,
            counters: ErrorCounters::from_register(self.regs.read(reg::ERR_CNT)),
        }
    }

    /// Capacity the rings use (or will use at the next open).
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// True once [`Can::initialize`] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True while a session is running.
    pub fn is_opened(&self) -> bool {
        self.opened
    }

    /// Applies a configuration mutation, rejected while a session runs.
    fn configure(&mut self, apply: impl FnOnce(&mut CanConfig)) -> Result<(), Error> {
        if self.opened {
            return Err(Error::Busy);
        }
        apply(&mut self.config);
        Ok(())
    }

    fn resolve_timing(&mut self) -> Result<(), Error> {
        let timing = BitTiming::solve(
            self.config.bitrate,
            self.deps.can_clock(),
            self.config.sample_point,
            self.config.prop_delay_ns,
        )
        .map_err(|_| Error::InvalidArgument)?;
        self.timing = Some(timing);
        Ok(())
    }

    /// Programs the hardware with the current configuration and enables it.
    ///
    /// Configuration registers are shadowed; values unchanged since the last
    /// start are not rewritten.
    fn start(&mut self) -> Result<(), Error> {
        let timing = self.timing.ok_or(Error::NotInitialized)?;
        self.stats = Statistics::default();
        self.buffer_error = false;

        let fd = self.config.workmode.fd;
        let filtering = !(self.filters.is_default() && self.range.is_default());
        let mut mode_bits = self.config.workmode.mode_bits();
        if filtering {
            mode_bits |= mode::AFM;
        }
        Self::write_cached(&self.regs, &mut self.cache.mode, reg::MODE, mode_bits);
        Self::write_cached(
            &self.regs,
            &mut self.cache.btime,
            reg::BTIME,
            timing.register_image(),
        );
        Self::write_cached(
            &self.regs,
            &mut self.cache.bfrac,
            reg::BFRAC,
            timing.frac.into(),
        );
        Self::write_cached(
            &self.regs,
            &mut self.cache.tsprescaler,
            reg::TSPRESC,
            self.config.timestamp_prescaler.into(),
        );
        Self::write_cached(
            &self.regs,
            &mut self.cache.retry,
            reg::RETRY,
            self.config.retransmit_threshold.into(),
        );
        if self.filters_dirty {
            for (index, filter) in self.filters.filters.iter().enumerate() {
                self.regs.write(reg::FILTER_MASK[index], filter.mask);
                self.regs.write(reg::FILTER_VALUE[index], filter.value);
            }
            self.regs.write(reg::RANGE_LOW, self.range.low);
            self.regs.write(reg::RANGE_HIGH, self.range.high);
            self.filters_dirty = false;
        }
        Self::write_cached(
            &self.regs,
            &mut self.cache.filter_ctrl,
            reg::FILTER_CTRL,
            self.filters.control_bits(fd) | self.range.control_bits(fd),
        );

        // Wake bits posted by a previous session (in particular the fault
        // wake from a bus-off teardown) must not satisfy waits in this one.
        if let Some(waiter) = &self.events {
            let _ = waiter.wait(events::RX_AVAILABLE | events::TX_SPACE | events::FAULT, 0);
        }

        // Stale causes from the previous session must not fire on enable.
        self.regs.ack(reg::INT_STAT, ALL_CAUSES);
        self.regs.write(reg::INT_MASK, ALL_CAUSES);
        self.regs.set_bits(reg::CTRL, ctrl::EN);
        self.deps.enable_interrupt();
        Ok(())
    }

    fn teardown(&mut self) {
        self.deps.disable_interrupt();
        self.regs.write(reg::INT_MASK, 0);
        self.regs.clear_bits(reg::CTRL, ctrl::EN);
        if let Some(rx) = self.rx.as_mut() {
            rx.clear();
        }
        if let Some(tx) = self.tx.as_mut() {
            tx.clear();
        }
        self.opened = false;
    }

    /// Tears the session down from interrupt context after bus-off.
    pub(crate) fn close_from_interrupt(&mut self) {
        self.teardown();
    }

    /// Loads `message` into transmit buffer `index` and requests
    /// transmission. Only buffer 0 exists on this core.
    ///
    /// Fails without touching the buffer if the index is out of range or the
    /// frame needs the FD format while the hardware runs classic-only.
    pub(crate) fn send_one(&mut self, index: usize, message: &Message) -> Result<(), Error> {
        if index != 0 {
            return Err(Error::OutOfBounds);
        }
        if message.len() > CLASSIC_MAX_PAYLOAD && !self.regs.is_set(reg::MODE, mode::FDEN) {
            return Err(Error::InvalidArgument);
        }
        self.regs.write(reg::TX_SEL, index as u32);
        for word in message.header_words() {
            self.regs.write(reg::TX_PORT, word);
        }
        for i in 0..message.data_word_count() {
            self.regs.write(reg::TX_PORT, message.data_word(i));
        }
        self.regs.write(reg::CMD, cmd::TX_REQ);
        self.stats.tx_frames += 1;
        Ok(())
    }

    /// Pops one frame from the hardware RX FIFO into the RX ring. A full
    /// ring drops its oldest frame; the hardware cannot be made to wait.
    pub(crate) fn receive_one(&mut self) {
        let header = [self.regs.read(reg::RX_PORT), self.regs.read(reg::RX_PORT)];
        let mut message = Message::from_header(header);
        let mut index = 0;
        while self.regs.is_set(reg::RX_STAT, rx_stat::MORE) && index < MAX_DATA_WORDS {
            message.set_data_word(index, self.regs.read(reg::RX_PORT));
            index += 1;
        }
        self.stats.rx_frames += 1;
        if let Some(rx) = self.rx.as_mut() {
            let overwrites = rx.overwrites();
            if let Some(slot) = rx.claim_for_write(true) {
                *slot = message;
                rx.commit_write();
            }
            self.stats.rx_ring_drops += rx.overwrites() - overwrites;
        }
    }

    /// Moves queued frames into the hardware transmit buffer while it is
    /// idle.
    pub(crate) fn refill_tx(&mut self) {
        while self.regs.is_set(reg::STATUS, status::TX_IDLE) {
            let Some(message) = self
                .tx
                .as_ref()
                .and_then(|tx| tx.claim_for_read().copied())
            else {
                break;
            };
            if self.send_one(0, &message).is_err() {
                self.buffer_error = true;
                if self.stats.tx_buffer_errors < TX_BUFFER_ERROR_REPORT_CAP {
                    self.stats.tx_buffer_errors += 1;
                }
            }
            // The frame is consumed either way.
            if let Some(tx) = self.tx.as_mut() {
                tx.commit_read();
            }
        }
    }

    fn write_cached(regs: &RegisterFile<R>, shadow: &mut Option<u32>, offset: usize, value: u32) {
        if *shadow != Some(value) {
            regs.write(offset, value);
            *shadow = Some(value);
        }
    }
}
