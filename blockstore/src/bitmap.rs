use crate::store::{Result, StoreError};

/// Returns the number of bytes required to hold `bits` bits.
pub const fn bytes_for(bits: usize) -> usize {
    (bits + 7) / 8
}

/// A fixed capacity bit vector tracking one bit per block.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8`, least significant bit
/// first. This is also the layout the bitmap has on disk, which means a bitmap
/// can be read straight out of a device image without any decoding.
///
/// The backing bytes are either owned (`Bitmap<Vec<u8>>`, see [`Bitmap::new`])
/// or borrowed from some other buffer (`Bitmap<&mut [u8]>` or `Bitmap<&[u8]>`,
/// see [`Bitmap::overlay`]). Dropping an overlay leaves the borrowed bytes alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap<B = Vec<u8>> {
    bits: B,
    /// Number of addressable bits. Any bits past this in the final byte are
    /// ignored by every query.
    capacity: usize,
}

impl Bitmap<Vec<u8>> {
    /// Creates a zeroed bitmap owning enough storage for `capacity` bits.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OutOfMemory`] if the storage can't be allocated.
    pub fn new(capacity: usize) -> Result<Self> {
        let len = bytes_for(capacity);
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)
            .map_err(|_| StoreError::OutOfMemory(len))?;
        bits.resize(len, 0);
        Ok(Self { bits, capacity })
    }

    /// Gives back the owned storage.
    pub fn into_inner(self) -> Vec<u8> {
        self.bits
    }
}

impl<B: AsRef<[u8]>> Bitmap<B> {
    /// Views an existing byte region as a bitmap of `capacity` bits. Nothing is
    /// copied and the region keeps whatever bit values it already holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OverlayTooSmall`] if the region holds fewer than
    /// `ceil(capacity / 8)` bytes.
    pub fn overlay(capacity: usize, bits: B) -> Result<Self> {
        let needed = bytes_for(capacity);
        let len = bits.as_ref().len();
        if len < needed {
            return Err(StoreError::OverlayTooSmall { needed, len });
        }
        Ok(Self { bits, capacity })
    }

    /// Overlay constructor for callers that already sized the region.
    pub(crate) fn from_parts(bits: B, capacity: usize) -> Self {
        debug_assert!(bits.as_ref().len() >= bytes_for(capacity));
        Self { bits, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The bytes holding the bitmap, trimmed to `ceil(capacity / 8)`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits.as_ref()[..bytes_for(self.capacity)]
    }

    /// Returns the value of bit `i`, or `None` if `i` is out of range.
    pub fn test(&self, i: usize) -> Option<bool> {
        let (byte, mask) = self.locate(i)?;
        Some(self.bits.as_ref()[byte] & mask != 0)
    }

    /// Counts the set bits across the whole capacity.
    pub fn total_set(&self) -> usize {
        let bytes = self.as_bytes();
        let whole = self.capacity / 8;
        let mut count: usize = bytes[..whole].iter().map(|b| b.count_ones() as usize).sum();
        let tail = self.capacity % 8;
        if tail != 0 {
            count += (bytes[whole] & tail_mask(tail)).count_ones() as usize;
        }
        count
    }

    /// Lowest index holding a zero bit, scanning upwards from bit 0.
    pub fn find_first_zero(&self) -> Option<usize> {
        self.as_bytes()
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != u8::MAX)
            .map(|(pos, byte)| pos * 8 + byte.trailing_ones() as usize)
            // Only the last byte can carry bits past the capacity.
            .filter(|&i| i < self.capacity)
    }

    /// Lowest index holding a set bit, scanning upwards from bit 0.
    pub fn find_first_set(&self) -> Option<usize> {
        self.as_bytes()
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(pos, byte)| pos * 8 + byte.trailing_zeros() as usize)
            .filter(|&i| i < self.capacity)
    }

    /// Iterates over the indices of all set bits in ascending order.
    pub fn iter_set(&self) -> SetBits<'_> {
        SetBits::new(self.as_bytes(), self.capacity)
    }

    fn locate(&self, i: usize) -> Option<(usize, u8)> {
        if i >= self.capacity {
            return None;
        }
        Some((i / 8, 1 << (i % 8)))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bitmap<B> {
    /// Sets bit `i`. Returns `false` without touching anything if `i` is out
    /// of range.
    pub fn set(&mut self, i: usize) -> bool {
        match self.locate(i) {
            Some((byte, mask)) => {
                self.bits.as_mut()[byte] |= mask;
                true
            }
            None => false,
        }
    }

    /// Clears bit `i`. Returns `false` without touching anything if `i` is out
    /// of range.
    pub fn reset(&mut self, i: usize) -> bool {
        match self.locate(i) {
            Some((byte, mask)) => {
                self.bits.as_mut()[byte] &= !mask;
                true
            }
            None => false,
        }
    }

    /// Inverts bit `i`, returning its new value.
    pub fn flip(&mut self, i: usize) -> Option<bool> {
        let (byte, mask) = self.locate(i)?;
        let slot = &mut self.bits.as_mut()[byte];
        *slot ^= mask;
        Some(*slot & mask != 0)
    }

    /// Sets or clears every bit in the capacity. Bits past the capacity in the
    /// final byte keep their value.
    pub fn fill(&mut self, value: bool) {
        let whole = self.capacity / 8;
        let tail = self.capacity % 8;
        let bytes = self.bits.as_mut();
        for byte in &mut bytes[..whole] {
            *byte = if value { u8::MAX } else { 0 };
        }
        if tail != 0 {
            if value {
                bytes[whole] |= tail_mask(tail);
            } else {
                bytes[whole] &= !tail_mask(tail);
            }
        }
    }
}

/// Mask selecting the lowest `bits` bits of a byte.
fn tail_mask(bits: usize) -> u8 {
    debug_assert!(bits > 0 && bits < 8);
    (1u8 << bits) - 1
}

/// Iterator over set bit indices, returned by [`Bitmap::iter_set`].
pub struct SetBits<'a> {
    bytes: &'a [u8],
    capacity: usize,
    next: usize,
}

impl<'a> SetBits<'a> {
    pub(crate) fn new(bytes: &'a [u8], capacity: usize) -> Self {
        Self {
            bytes,
            capacity,
            next: 0,
        }
    }
}

impl<'a> Iterator for SetBits<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.capacity {
            let byte = self.bytes[self.next / 8];
            // Skip empty bytes whole when sitting on a byte boundary.
            if byte == 0 && self.next % 8 == 0 {
                self.next += 8;
                continue;
            }
            let i = self.next;
            self.next += 1;
            if byte & (1 << (i % 8)) != 0 {
                return Some(i);
            }
        }
        None
    }
}
