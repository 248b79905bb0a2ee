//! Bitmap data structure helper.

use std::fmt;

use crate::utils::MirrorlogError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for small index -> bool mapping, e.g. the free map of a
/// backup's frame pool.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: usize, ones: bool) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        let mut bitset = FixedBitSet::with_capacity(size);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(
        &mut self,
        idx: usize,
        flag: bool,
    ) -> Result<(), MirrorlogError> {
        if idx >= self.0.len() {
            return Err(MirrorlogError(format!("index {} out of bound", idx)));
        }
        self.0.set(idx, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: usize) -> Result<bool, MirrorlogError> {
        if idx >= self.0.len() {
            return Err(MirrorlogError(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx])
    }

    /// Returns the index of the first true bit, if any.
    #[inline]
    pub fn first_one(&self) -> Option<usize> {
        self.0.ones().next()
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }
}

/// Iterator over `Bitmap`, yielding `(id, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (usize, bool);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.idx;
        if idx < self.map.size() {
            self.idx += 1;
            Some((idx, self.map.get(idx).unwrap()))
        } else {
            None
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self
            .iter()
            .filter_map(|(i, flag)| if flag { Some(i) } else { None })
        {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}
