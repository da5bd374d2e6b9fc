//! Acceptance and range filtering.
//!
//! The controller offers three parallel mask/value acceptance filters and one
//! identifier range filter. A filter is inert (accept all) until its format
//! flags enable it; enabling any filter or the range makes the driver set the
//! master acceptance-filtering mode bit at start, and reverting everything to
//! the defaults clears it again.
//!
//! The `FILTER_CTRL` register carries one format nibble per filter (the range
//! occupies a fourth nibble). Each nibble has separate classic-format and
//! FD-format bit positions for standard and extended acceptance; which pair
//! is written depends on whether the controller currently runs with FD
//! enabled.

const STANDARD_CLASSIC: u32 = 1 << 0;
const EXTENDED_CLASSIC: u32 = 1 << 1;
const STANDARD_FD: u32 = 1 << 2;
const EXTENDED_FD: u32 = 1 << 3;

/// Number of parallel mask/value acceptance filters.
pub const FILTER_COUNT: usize = 3;

const RANGE_NIBBLE: u32 = FILTER_COUNT as u32 * 4;

/// One mask/value acceptance filter.
///
/// A set mask bit marks the identifier bit as "don't care". The default
/// (full mask, zero value, no acceptance flags) accepts everything and keeps
/// the filter inert.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AcceptanceFilter {
    /// Don't-care mask over the 29-bit identifier field.
    pub mask: u32,
    /// Identifier match value.
    pub value: u32,
    /// Accept standard (11-bit) frames.
    pub standard: bool,
    /// Accept extended (29-bit) frames.
    pub extended: bool,
}

impl Default for AcceptanceFilter {
    fn default() -> Self {
        Self {
            mask: u32::MAX,
            value: 0,
            standard: false,
            extended: false,
        }
    }
}

impl AcceptanceFilter {
    /// True for the inert accept-all configuration.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    fn control_nibble(&self, fd_capable: bool) -> u32 {
        let (standard, extended) = if fd_capable {
            (STANDARD_FD, EXTENDED_FD)
        } else {
            (STANDARD_CLASSIC, EXTENDED_CLASSIC)
        };
        let mut bits = 0;
        if self.standard {
            bits |= standard;
        }
        if self.extended {
            bits |= extended;
        }
        bits
    }
}

/// The full set of acceptance filters.
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub struct FilterConfig {
    /// The three parallel filters.
    pub filters: [AcceptanceFilter; FILTER_COUNT],
}

impl FilterConfig {
    /// True if every filter is inert.
    pub fn is_default(&self) -> bool {
        self.filters.iter().all(AcceptanceFilter::is_default)
    }

    /// Format control bits for the `FILTER_CTRL` register, excluding the
    /// range nibble.
    pub(crate) fn control_bits(&self, fd_capable: bool) -> u32 {
        self.filters
            .iter()
            .enumerate()
            .fold(0, |bits, (index, filter)| {
                bits | filter.control_nibble(fd_capable) << (index as u32 * 4)
            })
    }
}

/// Identifier range filter with inclusive bounds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RangeFilter {
    /// Lowest accepted identifier.
    pub low: u32,
    /// Highest accepted identifier.
    pub high: u32,
    /// Accept standard (11-bit) frames.
    pub standard: bool,
    /// Accept extended (29-bit) frames.
    pub extended: bool,
}

impl Default for RangeFilter {
    fn default() -> Self {
        Self {
            low: 0,
            high: 0,
            standard: false,
            extended: false,
        }
    }
}

impl RangeFilter {
    /// True for the inert configuration.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Format control bits for the range nibble of `FILTER_CTRL`.
    pub(crate) fn control_bits(&self, fd_capable: bool) -> u32 {
        let filter = AcceptanceFilter {
            standard: self.standard,
            extended: self.extended,
            ..AcceptanceFilter::default()
        };
        filter.control_nibble(fd_capable) << RANGE_NIBBLE
    }
}
