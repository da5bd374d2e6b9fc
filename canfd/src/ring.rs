//! Fixed-capacity software message FIFO with a claim/commit protocol.
//!
//! One ring per direction sits between the interrupt dispatcher and the
//! task-level `read`/`write` paths. The two-phase protocol (claim a slot,
//! fill or copy it, then commit) means an entry is never simultaneously
//! available for reuse and still owned by the consumer, so single-producer/
//! single-consumer access per ring needs no lock. The `full` flag
//! disambiguates the `head == tail` case that is otherwise either empty or
//! full.
//!
//! The receive side claims with `force = true`: the hardware cannot be made
//! to wait, so a full ring silently evicts the oldest frame and counts the
//! overwrite. The transmit side claims without force and leaves backpressure
//! to the blocking `write` path.

use crate::message::Message;
use alloc::vec::Vec;

/// Ring creation failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CapacityError {
    /// A zero-capacity ring cannot hold messages.
    Zero,
    /// The backing allocation failed.
    OutOfMemory,
}

/// Circular buffer of decoded CAN messages.
pub struct MessageRing {
    slots: Vec<Message>,
    read: usize,
    write: usize,
    full: bool,
    overwrites: u32,
}

impl MessageRing {
    /// Allocates a ring of `capacity` message slots. Capacity must be
    /// nonzero.
    ///
    /// Capacity is fixed for the lifetime of the ring; the backing storage is
    /// never reallocated.
    pub fn with_capacity(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError::Zero);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| CapacityError::OutOfMemory)?;
        slots.resize(capacity, Message::default());
        Ok(Self {
            slots,
            read: 0,
            write: 0,
            full: false,
            overwrites: 0,
        })
    }

    /// Number of message slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of unconsumed messages.
    pub fn len(&self) -> usize {
        if self.full {
            self.capacity()
        } else {
            (self.write + self.capacity() - self.read) % self.capacity()
        }
    }

    /// True if no unconsumed messages exist.
    pub fn is_empty(&self) -> bool {
        !self.full && self.read == self.write
    }

    /// True if the ring holds exactly `capacity` unconsumed messages.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Count of entries lost to forced claims.
    pub fn overwrites(&self) -> u32 {
        self.overwrites
    }

    /// Claims the next free slot for writing.
    ///
    /// Returns `None` if the ring is full and `force` is not set. With
    /// `force`, a full ring evicts its oldest entry (counted in
    /// [`Self::overwrites`]) and hands out the reclaimed slot.
    ///
    /// The slot contents only become visible to the reader once
    /// [`Self::commit_write`] is called.
    pub fn claim_for_write(&mut self, force: bool) -> Option<&mut Message> {
        if self.full {
            if !force {
                return None;
            }
            self.read = self.advance(self.read);
            self.full = false;
            self.overwrites += 1;
        }
        Some(&mut self.slots[self.write])
    }

    /// Publishes the slot previously claimed for writing.
    pub fn commit_write(&mut self) {
        self.write = self.advance(self.write);
        if self.write == self.read {
            self.full = true;
        }
    }

    /// Returns the oldest unconsumed entry without removing it.
    ///
    /// Removal is a separate step ([`Self::commit_read`]) so that a failed
    /// downstream copy does not lose the message.
    pub fn claim_for_read(&self) -> Option<&Message> {
        if self.is_empty() {
            None
        } else {
            Some(&self.slots[self.read])
        }
    }

    /// Consumes the entry previously claimed for reading.
    pub fn commit_read(&mut self) {
        self.read = self.advance(self.read);
        self.full = false;
    }

    /// Resets cursors and counters. The storage is kept.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.full = false;
        self.overwrites = 0;
    }

    fn advance(&self, cursor: usize) -> usize {
        (cursor + 1) % self.capacity()
    }
}
