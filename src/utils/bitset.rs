//! A bit vector for efficient set operations.
//!
//! Compact bit set used by dataflow states that track sets of entities
//! identified by small integers (variables, definitions, blocks). 64 elements
//! per word; union/intersection/subset in word-parallel form.

/// A bit vector for efficient set operations.
///
/// Used by analyses that track sets of variables or definitions, where the
/// subset test doubles as the semilattice partial order.
#[derive(Clone, PartialEq, Eq, Hash)]
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
        let num_words = capacity.div_ceil(64);
        Self {
            words: vec![0; num_words],
            len: capacity,
        }
    }

    /// Creates a new bit set with all bits set.
    #[must_use]
    pub fn full(capacity: usize) -> Self {
        let num_words = capacity.div_ceil(64);
        let mut words = vec![u64::MAX; num_words];

        // Clear the excess bits in the last word
        if capacity % 64 != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << (capacity % 64)) - 1;
            }
        }

        Self {
            words,
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

    /// Sets the bit at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn insert(&mut self, index: usize) {
        assert!(index < self.len, "index out of bounds");
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    /// Clears the bit at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn remove(&mut self, index: usize) {
        assert!(index < self.len, "index out of bounds");
        self.words[index / 64] &= !(1u64 << (index % 64));
    }

    /// Returns `true` if the bit at the given index is set.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Returns the number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Unions another set into this one (`self |= other`).
    ///
    /// # Panics
    ///
    /// Panics if the sets have different capacities.
    pub fn union_with(&mut self, other: &Self) {
        assert_eq!(self.len, other.len, "bit set capacity mismatch");
        for (word, &other_word) in self.words.iter_mut().zip(&other.words) {
            *word |= other_word;
        }
    }

    /// Intersects another set into this one (`self &= other`).
    ///
    /// # Panics
    ///
    /// Panics if the sets have different capacities.
    pub fn intersect_with(&mut self, other: &Self) {
        assert_eq!(self.len, other.len, "bit set capacity mismatch");
        for (word, &other_word) in self.words.iter_mut().zip(&other.words) {
            *word &= other_word;
        }
    }

    /// Returns `true` if this set is a subset of `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .all(|(&a, &b)| a & !b == 0)
    }

    /// Iterates over the indices of set bits, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| word_idx * 64 + bit)
        })
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let mut set = BitSet::new(100);
        set.insert(0);
        set.insert(63);
        set.insert(64);
        set.insert(99);

        assert!(set.contains(0));
        assert!(set.contains(63));
        assert!(set.contains(64));
        assert!(set.contains(99));
        assert!(!set.contains(50));
        assert_eq!(set.count(), 4);

        set.remove(63);
        assert!(!set.contains(63));
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn test_full_clears_excess_bits() {
        let set = BitSet::full(70);
        assert_eq!(set.count(), 70);
        assert!(set.contains(69));
        assert!(!set.contains(70));
    }

    #[test]
    fn test_union_intersect_subset() {
        let mut a = BitSet::new(128);
        a.insert(1);
        a.insert(65);

        let mut b = BitSet::new(128);
        b.insert(1);
        b.insert(100);

        let mut union = a.clone();
        union.union_with(&b);
        assert_eq!(union.count(), 3);
        assert!(a.is_subset(&union));
        assert!(b.is_subset(&union));

        let mut inter = a.clone();
        inter.intersect_with(&b);
        assert_eq!(inter.count(), 1);
        assert!(inter.contains(1));
        assert!(inter.is_subset(&a));
    }

    #[test]
    fn test_iter_ascending() {
        let mut set = BitSet::new(200);
        for idx in [3, 64, 128, 199] {
            set.insert(idx);
        }
        let collected: Vec<_> = set.iter().collect();
        assert_eq!(collected, vec![3, 64, 128, 199]);
    }
}
