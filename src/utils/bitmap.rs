//! Compact endpoint-indexed bitmap, used for per-replica quorum accounting.

use std::fmt;

use crate::utils::CoordError;

use fixedbitset::FixedBitSet;

/// Fixed-size bitmap keyed by small endpoint indices. Response handlers use
/// one bit per cluster member to keep acknowledgement counting idempotent.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: FixedBitSet,
}

impl Bitmap {
    /// Creates a new bitmap of `size` slots, all initially `ones`.
    pub fn new(size: u8, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        let mut bits = FixedBitSet::with_capacity(size as usize);
        if ones {
            bits.set_range(.., true);
        }
        Bitmap { bits }
    }

    /// Creates a bitmap with exactly the given indices set.
    pub fn from(size: u8, ones: impl IntoIterator<Item = u8>) -> Self {
        let mut map = Self::new(size, false);
        for idx in ones {
            if let Err(e) = map.set(idx, true) {
                panic!("{}", e);
            }
        }
        map
    }

    /// Sets the bit at index.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), CoordError> {
        if idx as usize >= self.bits.len() {
            return Err(CoordError::msg(format!(
                "bitmap index {} out of bound {}",
                idx,
                self.bits.len()
            )));
        }
        self.bits.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit at index; out-of-bound indices read as `false`.
    #[inline]
    pub fn get(&self, idx: u8) -> bool {
        (idx as usize) < self.bits.len() && self.bits[idx as usize]
    }

    /// Number of slots.
    #[inline]
    pub fn size(&self) -> u8 {
        self.bits.len() as u8
    }

    /// Number of set bits.
    #[inline]
    pub fn count(&self) -> u8 {
        self.bits.count_ones(..) as u8
    }

    /// Iterates over the indices of set bits in ascending order.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        self.bits.ones().map(|i| i as u8)
    }
}

// Manual `Debug` listing only the set indices, for trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{};", self.size())?;
        for idx in self.ones() {
            write!(f, " {}", idx)?;
        }
        write!(f, "}}")
    }
}
