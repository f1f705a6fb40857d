/// Fixed-capacity set of up to 32 indices, used for tags and command slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotBitmap(u32);

impl SlotBitmap {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Bitmap with indices `0..count` set.
    pub const fn with_first(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn set(&mut self, index: u8) {
        self.0 |= 1 << index;
    }

    pub fn clear(&mut self, index: u8) {
        self.0 &= !(1 << index);
    }

    pub fn set_to(&mut self, index: u8, value: bool) {
        if value {
            self.set(index);
        } else {
            self.clear(index);
        }
    }

    pub fn test(self, index: u8) -> bool {
        self.0 & (1 << index) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn lowest(self) -> Option<u8> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as u8)
    }

    /// Lowest set index strictly after `cursor`, wrapping around to the
    /// start. Spreads consecutive allocations across the whole ring.
    pub fn next_after(self, cursor: u8) -> Option<u8> {
        let after = match cursor {
            31.. => 0,
            c => self.0 & (u32::MAX << (c + 1)),
        };
        if after != 0 {
            Some(after.trailing_zeros() as u8)
        } else {
            self.lowest()
        }
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            let index = (bits != 0).then(|| bits.trailing_zeros() as u8)?;
            bits &= bits - 1;
            Some(index)
        })
    }
}
