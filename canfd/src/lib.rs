#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//! # CAN FD controller driver
//!
//! ## Overview
//! This crate provides a platform-agnostic driver for a word-ported CAN FD
//! controller unit.
//!
//! It provides the following features:
//!
//! - classical CAN and CAN FD frames with payloads up to 64 bytes
//! - a bit-rate solver that maps a requested rate and sample point to the
//!   hardware timing fields, including the fractional prescaler correction
//! - blocking `read`/`write` with configurable timeouts, decoupled from the
//!   hardware by software message rings
//! - three mask/value acceptance filters and an identifier range filter
//! - interrupt-driven operation with detailed bus-error and
//!   arbitration-loss diagnostics
//!
//! The controller is embedded in the MCU like any other peripheral. The
//! interface between them consists of a clock line, one interrupt line and a
//! single memory-mapped register block; frames move through word-oriented
//! RX/TX ports rather than a shared message RAM.
//!
//! For the abstractions here to be operational this interface has to be
//! configured by the platform, which is expressed through the safety
//! requirements of the [`canfd_core`] traits that platform-specific HALs
//! implement. A [`Can`](bus::Can) is constructed from a register file and a
//! [`Dependencies`](canfd_core::Dependencies) instance, initialized once,
//! and then opened for a session.
//!
//! ## Usage example
//!
//! ```no_run
//! # struct Events;
//! # impl canfd::core::EventGroup for Events {
//! #     fn post(&self, _events: u32) {}
//! #     fn wait(&self, _events: u32, _timeout_ms: u32) -> u32 { 0 }
//! # }
//! # struct Platform;
//! # unsafe impl canfd::core::Dependencies for Platform {
//! #     type Events = Events;
//! #     fn can_clock(&self) -> canfd::core::fugit::HertzU32 {
//! #         canfd::core::fugit::HertzU32::from_raw(80_000_000)
//! #     }
//! #     fn create_events(&mut self) -> Result<Events, canfd::core::OutOfMemory> {
//! #         Ok(Events)
//! #     }
//! #     fn install_interrupt_handler(&mut self) {}
//! #     fn enable_interrupt(&mut self) {}
//! #     fn disable_interrupt(&mut self) {}
//! # }
//! use canfd::bus::Can;
//! use canfd::core::MemoryMapped;
//! use canfd::embedded_can::StandardId;
//! use canfd::message::Message;
//!
//! let regs = unsafe { MemoryMapped::new(0x4000_8000 as *mut u32) };
//! let mut can = Can::new(regs, Platform);
//! can.initialize().unwrap();
//! can.open().unwrap();
//!
//! let frame = Message::new(StandardId::new(0x123).unwrap(), &[1, 2, 3, 4]).unwrap();
//! can.write(core::slice::from_ref(&frame)).unwrap();
//!
//! let mut inbox = [Message::default(); 4];
//! let received = can.read(&mut inbox).unwrap();
//! for frame in &inbox[..received] {
//!     let _ = frame.payload();
//! }
//! ```

extern crate alloc;

pub mod bus;
pub mod config;
pub mod filter;
pub mod interrupt;
pub mod message;
pub mod reg;
pub mod ring;
pub mod statistics;

pub use embedded_can;
pub use canfd_core as core;
