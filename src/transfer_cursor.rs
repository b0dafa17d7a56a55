/// Number of significant bits in the device's total transfer count.
///
/// Cursors are kept modulo `2^width`, so a counter that wraps in hardware keeps
/// producing correct distances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterWidth {
    #[default]
    Bits32,
    Bits64,
}

impl CounterWidth {
    pub const fn mask(self) -> u64 {
        match self {
            CounterWidth::Bits32 => u32::MAX as u64,
            CounterWidth::Bits64 => u64::MAX,
        }
    }

    /// Half of the representable range, the boundary between "ahead" and "behind".
    const fn half_range(self) -> u64 {
        (self.mask() >> 1) + 1
    }
}

/// Logical byte offset into a transfer, monotonically increasing and wrapping
/// at the counter width. Never wrapped at the ring size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferCursor {
    value: u64,
    width: CounterWidth,
}

impl TransferCursor {
    pub const fn zero(width: CounterWidth) -> Self {
        Self { value: 0, width }
    }

    /// Cursor for a raw hardware transfer count, truncated to `width`.
    pub const fn from_count(count: u64, width: CounterWidth) -> Self {
        Self {
            value: count & width.mask(),
            width,
        }
    }

    pub const fn value(self) -> u64 {
        self.value
    }

    pub const fn width(self) -> CounterWidth {
        self.width
    }

    pub const fn advance(self, bytes: u32) -> Self {
        Self::from_count(self.value.wrapping_add(bytes as u64), self.width)
    }

    pub const fn rewind(self, bytes: u32) -> Self {
        Self::from_count(self.value.wrapping_sub(bytes as u64), self.width)
    }

    /// Bytes from `earlier` up to `self`, modulo `2^width`.
    ///
    /// If `earlier` is actually ahead of `self` the result is a large value,
    /// which callers compare against the ring size to detect overflow.
    pub fn distance_from(self, earlier: TransferCursor) -> u64 {
        debug_assert_eq!(self.width, earlier.width);
        self.value.wrapping_sub(earlier.value) & self.width.mask()
    }

    /// Whether `self`, observed after `last`, is a counter regression.
    ///
    /// The count must have gone down and must not be explainable as a wrap
    /// of the counter: a smaller value within half the range past `last` is
    /// taken as the counter wrapping forward.
    pub fn regressed_from(self, last: TransferCursor) -> bool {
        debug_assert_eq!(self.width, last.width);
        let forward = self.distance_from(last);
        self.value < last.value && forward >= self.width.half_range()
    }

    /// How far the position inside a ring of `size` bytes moves when going
    /// from `earlier` to `self`.
    ///
    /// Only the difference of the cursors is used, so the result stays right
    /// after the hardware count passed the counter width, whatever `size` is.
    pub fn ring_shift_from(self, earlier: TransferCursor, size: u32) -> u32 {
        debug_assert!(size != 0);
        (self.distance_from(earlier) % size as u64) as u32
    }
}
