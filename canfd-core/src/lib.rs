#![no_std]
#![warn(missing_docs)]

//! `canfd-core` provides a set of essential abstractions that serve as a thin
//! integration layer between the platform independent [`canfd`] driver crate
//! and platform specific BSP/HAL crates (in documentation also referred to as
//! _target HALs_).
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by target HALs.
//! The one exception is test code, where a scripted implementation of
//! [`Registers`] and [`EventGroup`] stands in for the hardware.
//!
//! Integrators of this crate into any given target HAL are responsible for
//! soundness of trait implementations and conforming to their respective
//! safety prerequisites.
//!
//! [`canfd`]: <https://docs.rs/crate/canfd/>

pub use fugit;

use vcell::VolatileCell;

/// Raw word access to the register file of one CAN controller unit.
///
/// Offsets are in bytes from the unit's base address and are always
/// word-aligned. The driver performs all hardware interaction through this
/// trait so that it can be exercised against a software register model.
///
/// # Safety
/// Implementations must perform volatile, word-atomic accesses (or a faithful
/// software equivalent) and must tolerate reads/writes at every offset the
/// driver's register map defines.
pub unsafe trait Registers {
    /// Reads the 32-bit register at `offset`.
    fn read(&self, offset: usize) -> u32;
    /// Writes the 32-bit register at `offset`.
    fn write(&self, offset: usize, value: u32);
}

/// Memory-mapped register file at a fixed base address.
///
/// This is the implementation real targets use; a [`Dependencies`] provider
/// constructs one per physical unit.
pub struct MemoryMapped {
    base: *mut u32,
}

impl MemoryMapped {
    /// Creates a register file rooted at `base`.
    ///
    /// # Safety
    /// `base` must point to the start of a valid, clocked CAN controller
    /// register block and the caller must guarantee exclusive driver
    /// ownership of that block.
    pub const unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }

    fn cell(&self, offset: usize) -> &VolatileCell<u32> {
        // Safety: offset validity is part of the `Registers` contract and the
        // base pointer validity is part of the `new` contract.
        unsafe { &*((self.base as *const u8).add(offset) as *const VolatileCell<u32>) }
    }
}

// Safety: accesses are volatile word reads/writes which are atomic at the bus
// level.
unsafe impl Registers for MemoryMapped {
    fn read(&self, offset: usize) -> u32 {
        self.cell(offset).get()
    }

    fn write(&self, offset: usize, value: u32) {
        self.cell(offset).set(value)
    }
}

// Safety: the register block is a hardware resource; moving the handle
// between contexts does not affect its validity.
unsafe impl Send for MemoryMapped {}

/// Event/wake primitive used to park a task on "RX data available" /
/// "TX space available" and wake it from interrupt context.
///
/// Semantically a lightweight event-flag group: [`EventGroup::post`] is
/// callable from interrupt context, [`EventGroup::wait`] only from task
/// context.
pub trait EventGroup {
    /// Posts `events` (a bitmask) to the group, waking any waiter whose wait
    /// mask intersects it.
    fn post(&self, events: u32);

    /// Waits until any bit of `events` is posted or `timeout_ms` elapses.
    ///
    /// Returns the satisfied subset (which is consumed), or `0` on timeout.
    /// A zero timeout consumes already-posted events without waiting.
    fn wait(&self, events: u32, timeout_ms: u32) -> u32;
}

/// Allocation failure reported by [`Dependencies::create_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Trait representing the platform dependencies of one CAN controller unit.
///
/// A value implementing `Dependencies` stands for the unit's interrupt vector
/// and clock wiring; exactly one instance per physical unit may exist.
///
/// # Safety
/// While a `Dependencies` instance exists
/// - the CAN related clocks must not change
/// - the unit's interrupt vector must not be rerouted by other code
/// - the unit's register block must not be accessed outside the driver
pub unsafe trait Dependencies {
    /// Event primitive type produced by [`Self::create_events`].
    type Events: EventGroup;

    /// Frequency of the clock feeding the CAN bit-timing logic.
    fn can_clock(&self) -> fugit::HertzU32;

    /// Creates the event group used for RX/TX wake signalling.
    ///
    /// Called once, from `initialize`. Fails if the host cannot allocate the
    /// primitive.
    fn create_events(&mut self) -> Result<Self::Events, OutOfMemory>;

    /// Installs the unit's interrupt handler at the interrupt controller,
    /// leaving the line disabled.
    ///
    /// The handler is expected to forward into the driver's dispatch entry
    /// point for this unit.
    fn install_interrupt_handler(&mut self);

    /// Enables the unit's interrupt line at the interrupt controller.
    fn enable_interrupt(&mut self);

    /// Disables the unit's interrupt line at the interrupt controller.
    fn disable_interrupt(&mut self);
}
