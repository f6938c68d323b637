//! Fixed-width core sets.

use core::fmt;

use crate::types::CoreId;

/// Maximum number of cores a mask can describe
pub const MAX_CPUS: usize = 1024;

const WORD_BITS: usize = 64;
const MASK_WORDS: usize = MAX_CPUS / WORD_BITS;

// ============================================================================
// CPU MASK
// ============================================================================

/// Set of cores, one bit per core id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask {
    words: [u64; MASK_WORDS],
}

impl CpuMask {
    /// Empty mask
    pub const fn empty() -> Self {
        Self {
            words: [0; MASK_WORDS],
        }
    }

    /// Mask with cores `0..count` set
    pub fn first_n(count: usize) -> Self {
        let mut mask = Self::empty();
        for core in 0..count.min(MAX_CPUS) {
            mask.words[core / WORD_BITS] |= 1 << (core % WORD_BITS);
        }
        mask
    }

    /// Mask holding a single core
    pub fn single(core: CoreId) -> Self {
        let mut mask = Self::empty();
        mask.set(core);
        mask
    }

    /// Add a core. Ids beyond [`MAX_CPUS`] are ignored.
    #[inline]
    pub fn set(&mut self, core: CoreId) {
        let idx = core.index();
        if idx < MAX_CPUS {
            self.words[idx / WORD_BITS] |= 1 << (idx % WORD_BITS);
        }
    }

    /// Remove a core
    #[inline]
    pub fn clear(&mut self, core: CoreId) {
        let idx = core.index();
        if idx < MAX_CPUS {
            self.words[idx / WORD_BITS] &= !(1 << (idx % WORD_BITS));
        }
    }

    /// Is the core in the set?
    #[inline]
    pub fn contains(&self, core: CoreId) -> bool {
        let idx = core.index();
        idx < MAX_CPUS && self.words[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    /// Number of cores in the set
    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Is the set empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Intersection
    #[inline]
    pub fn and(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.words.iter_mut().zip(other.words.iter()) {
            *dst &= *src;
        }
        out
    }

    /// Union
    #[inline]
    pub fn or(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
        out
    }

    /// Is every core of `self` also in `other`?
    #[inline]
    pub fn is_subset_of(&self, other: &CpuMask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Lowest core in the set
    pub fn first(&self) -> Option<CoreId> {
        self.iter().next()
    }

    /// Iterate cores in ascending id order
    pub fn iter(&self) -> CpuMaskIter<'_> {
        CpuMaskIter {
            mask: self,
            word: 0,
            bits: self.words[0],
        }
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<CoreId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CoreId>>(iter: I) -> Self {
        let mut mask = CpuMask::empty();
        for core in iter {
            mask.set(core);
        }
        mask
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.0)).finish()
    }
}

/// Iterator over the cores of a [`CpuMask`]
pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    word: usize,
    bits: u64,
}

impl Iterator for CpuMaskIter<'_> {
    type Item = CoreId;

    fn next(&mut self) -> Option<CoreId> {
        loop {
            if self.bits != 0 {
                let bit = self.bits.trailing_zeros() as usize;
                self.bits &= self.bits - 1;
                return Some(CoreId((self.word * WORD_BITS + bit) as u32));
            }
            self.word += 1;
            if self.word >= MASK_WORDS {
                return None;
            }
            self.bits = self.mask.words[self.word];
        }
    }
}
