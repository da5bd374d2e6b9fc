//! CAN messages and their wire representation.
//!
//! The controller exchanges frames as a two-word header followed by the
//! payload in 32-bit words. Extended identifiers occupy the full 29-bit field
//! of the first header word; standard identifiers are stored left-shifted
//! into its upper bits. The logical payload length is carried as a DLC code
//! and preserved exactly even though the word-oriented ports round transfers
//! up to 4-byte multiples.

use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Largest payload of a CAN FD frame.
pub const MAX_PAYLOAD: usize = 64;
/// Largest payload of a classic CAN frame.
pub const CLASSIC_MAX_PAYLOAD: usize = 8;

/// Number of payload words moved through the TX/RX ports per frame, at most.
pub(crate) const MAX_DATA_WORDS: usize = MAX_PAYLOAD / 4;

const XTD: u32 = 1 << 30;
const RTR: u32 = 1 << 29;
const FDF: u32 = 1 << 21;
const STANDARD_SHIFT: u32 = 18;

/// Data does not fit in the requested frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooMuchData;

/// A decoded CAN frame.
///
/// The payload buffer is always sized for the FD maximum; `len` bounds the
/// valid prefix. Remote frames carry no payload bytes, their `len` is the
/// requested data length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Standard or extended identifier.
    pub id: Id,
    /// Remote transmission request.
    pub remote: bool,
    pub(crate) len: u8,
    pub(crate) data: [u8; MAX_PAYLOAD],
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: Id::Standard(StandardId::ZERO),
            remote: false,
            len: 0,
            data: [0; MAX_PAYLOAD],
        }
    }
}

impl Message {
    /// Creates a data frame. Fails if `data` exceeds the FD maximum.
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Result<Self, TooMuchData> {
        if data.len() > MAX_PAYLOAD {
            return Err(TooMuchData);
        }
        let mut message = Self {
            id: id.into(),
            len: data.len() as u8,
            ..Self::default()
        };
        message.data[..data.len()].copy_from_slice(data);
        Ok(message)
    }

    /// Creates a remote frame requesting `desired_len` bytes.
    ///
    /// Remote frames exist only in the classic format, so `desired_len` is
    /// bounded by 8.
    pub fn new_remote(id: impl Into<Id>, desired_len: usize) -> Result<Self, TooMuchData> {
        if desired_len > CLASSIC_MAX_PAYLOAD {
            return Err(TooMuchData);
        }
        Ok(Self {
            id: id.into(),
            remote: true,
            len: desired_len as u8,
            ..Self::default()
        })
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len.into()
    }

    /// True for zero-length payloads.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Valid payload bytes. Empty for remote frames.
    pub fn payload(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.len()]
        }
    }

    /// True if the frame uses a 29-bit identifier.
    pub fn extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    /// Encodes the two-word hardware header.
    pub(crate) fn header_words(&self) -> [u32; 2] {
        let id_field = match self.id {
            Id::Standard(id) => u32::from(id.as_raw()) << STANDARD_SHIFT,
            Id::Extended(id) => id.as_raw(),
        };
        let fd = self.len() > CLASSIC_MAX_PAYLOAD;
        let w0 = id_field
            | if self.remote { RTR } else { 0 }
            | if self.extended() { XTD } else { 0 };
        let w1 = u32::from(len_to_dlc(self.len(), fd)) << 16 | if fd { FDF } else { 0 };
        [w0, w1]
    }

    /// Decodes a header into a message with an all-zero payload.
    pub(crate) fn from_header(words: [u32; 2]) -> Self {
        let extended = words[0] & XTD != 0;
        let id = if extended {
            // The mask keeps the value in range for a 29-bit identifier.
            Id::Extended(unsafe {
                ExtendedId::new_unchecked(words[0] & ExtendedId::MAX.as_raw())
            })
        } else {
            // The mask keeps the value in range for an 11-bit identifier.
            Id::Standard(unsafe {
                StandardId::new_unchecked(
                    (words[0] >> STANDARD_SHIFT) as u16 & StandardId::MAX.as_raw(),
                )
            })
        };
        let fd = words[1] & FDF != 0;
        let dlc = ((words[1] >> 16) & 0xF) as u8;
        Self {
            id,
            remote: words[0] & RTR != 0,
            len: dlc_to_len(dlc, fd) as u8,
            data: [0; MAX_PAYLOAD],
        }
    }

    /// Number of payload words the ports move for this frame.
    pub(crate) fn data_word_count(&self) -> usize {
        if self.remote {
            0
        } else {
            (self.len() + 3) / 4
        }
    }

    /// Payload word `index`, little endian, zero padded past `len`.
    pub(crate) fn data_word(&self, index: usize) -> u32 {
        let mut bytes = [0; 4];
        let offset = index * 4;
        let avail = self.len().saturating_sub(offset).min(4);
        bytes[..avail].copy_from_slice(&self.data[offset..offset + avail]);
        u32::from_le_bytes(bytes)
    }

    /// Stores payload word `index` as read from the RX port.
    pub(crate) fn set_data_word(&mut self, index: usize, word: u32) {
        self.data[index * 4..index * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
}

impl Frame for Message {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::new(id, data).ok()
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        Self::new_remote(id, dlc).ok()
    }

    fn is_extended(&self) -> bool {
        self.extended()
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.len()
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}

/// Finds the smallest data length code that encodes at least `len` bytes.
pub(crate) fn len_to_dlc(len: usize, fd_format: bool) -> u8 {
    if fd_format {
        match len {
            0..=8 => len as u8,
            9..=12 => 9,
            13..=16 => 10,
            17..=20 => 11,
            21..=24 => 12,
            25..=32 => 13,
            33..=48 => 14,
            _ => 15,
        }
    } else {
        (len as u8).min(8)
    }
}

/// Converts a data length code to a length in bytes.
pub(crate) fn dlc_to_len(dlc: u8, fd_format: bool) -> usize {
    if fd_format {
        match dlc {
            0..=8 => dlc.into(),
            9 => 12,
            10 => 16,
            11 => 20,
            12 => 24,
            13 => 32,
            14 => 48,
            _ => 64,
        }
    } else {
        dlc.min(8).into()
    }
}
