//! A bit vector for register sets.
//!
//! Liveness, interference and the dead-code eliminator track sets of virtual registers.
//! Registers are small dense integers, so a word-packed bit vector is the natural
//! representation: unions and differences run 64 registers at a time.
//!
//! # Example
//!
//! ```rust
//! use dexopt::utils::BitSet;
//!
//! let mut live = BitSet::new(16);
//! live.insert(0);
//! live.insert(9);
//!
//! assert!(live.contains(9));
//! assert_eq!(live.count(), 2);
//! assert_eq!(live.iter().collect::<Vec<_>>(), vec![0, 9]);
//! ```

/// A fixed-capacity bit vector.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BitSet {
    /// The bits, stored as a vector of words.
    words: Vec<u64>,
    /// The number of bits in the set.
    len: usize,
}

impl BitSet {
    /// Creates a new empty bit set with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            len: capacity,
        }
    }

    /// Returns the capacity of this bit set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bit set has no bits set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Grows the capacity to at least `capacity` bits. Existing bits are kept.
    pub fn grow(&mut self, capacity: usize) {
        if capacity > self.len {
            self.words.resize(capacity.div_ceil(64), 0);
            self.len = capacity;
        }
    }

    /// Sets the bit at the given index, growing the set if needed.
    pub fn insert(&mut self, index: usize) {
        if index >= self.len {
            self.grow(index + 1);
        }
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    /// Clears the bit at the given index. Out-of-range indices are ignored.
    pub fn remove(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] &= !(1u64 << (index % 64));
        }
    }

    /// Returns `true` if the bit at the given index is set.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        index < self.len && (self.words[index / 64] & (1u64 << (index % 64))) != 0
    }

    /// Returns the number of bits set.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Clears all bits.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Computes the union with another bit set (in place).
    ///
    /// Returns `true` if `self` changed.
    pub fn union_with(&mut self, other: &Self) -> bool {
        self.grow(other.len);
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            let old = *a;
            *a |= *b;
            changed |= old != *a;
        }
        changed
    }

    /// Computes the intersection with another bit set (in place).
    ///
    /// Returns `true` if `self` changed.
    pub fn intersect_with(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (i, a) in self.words.iter_mut().enumerate() {
            let old = *a;
            *a &= other.words.get(i).copied().unwrap_or(0);
            changed |= old != *a;
        }
        changed
    }

    /// Removes all bits that are set in `other` from `self`.
    ///
    /// Returns `true` if `self` changed.
    pub fn difference_with(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            let old = *a;
            *a &= !*b;
            changed |= old != *a;
        }
        changed
    }

    /// Returns `true` if every bit of `self` is also set in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0) == 0)
    }

    /// Returns an iterator over the indices of set bits.
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            set: self,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = BitSet::default();
        for idx in iter {
            set.insert(idx);
        }
        set
    }
}

/// Iterator over the set bits in a [`BitSet`].
pub struct BitSetIter<'a> {
    set: &'a BitSet,
    word_idx: usize,
    current: u64,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * 64 + bit);
            }
            self.word_idx += 1;
            self.current = *self.set.words.get(self.word_idx)?;
        }
    }
}
