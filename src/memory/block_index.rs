use std::collections::BTreeMap;

/// Stable handle into the allocator's central block table.
pub(crate) type BlockId = usize;

/// Ordered index over the writable address ranges of all live blocks,
/// across all pools. Backs the O(log n) "which block owns this pointer"
/// lookup that `release` and `shrink` start with.
///
/// Invariant: the stored ranges are pairwise disjoint and correspond
/// exactly to the live blocks.
#[derive(Default)]
pub(crate) struct BlockIndex {
    ranges: BTreeMap<usize, (usize, BlockId)>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, base: usize, len: usize, id: BlockId) {
        debug_assert!(len > 0);
        debug_assert!(
            self.find_containing(base).is_none() && self.find_containing(base + len - 1).is_none(),
            "overlapping block range inserted"
        );
        self.ranges.insert(base, (len, id));
    }

    pub fn remove(&mut self, base: usize) -> Option<BlockId> {
        self.ranges.remove(&base).map(|(_, id)| id)
    }

    /// Block whose range contains `addr`, if any.
    pub fn find_containing(&self, addr: usize) -> Option<BlockId> {
        let (&base, &(len, id)) = self.ranges.range(..=addr).next_back()?;
        (addr < base + len).then_some(id)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_containing_hits_and_misses() {
        let mut index = BlockIndex::new();
        index.insert(0x1000, 0x1000, 7);
        index.insert(0x4000, 0x2000, 9);

        assert_eq!(index.find_containing(0x1000), Some(7)); // first byte
        assert_eq!(index.find_containing(0x1fff), Some(7)); // last byte
        assert_eq!(index.find_containing(0x2000), None); // one past the end
        assert_eq!(index.find_containing(0x0fff), None); // below
        assert_eq!(index.find_containing(0x4abc), Some(9));
        assert_eq!(index.find_containing(0x6000), None);
    }

    #[test]
    fn test_remove_makes_range_unreachable() {
        let mut index = BlockIndex::new();
        index.insert(0x8000, 0x1000, 3);
        assert_eq!(index.find_containing(0x8800), Some(3));

        assert_eq!(index.remove(0x8000), Some(3));
        assert_eq!(index.find_containing(0x8800), None);
        assert_eq!(index.remove(0x8000), None);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_lookup_between_ranges() {
        let mut index = BlockIndex::new();
        index.insert(0x1000, 0x100, 1);
        index.insert(0x3000, 0x100, 2);
        // Address past the first range but before the second.
        assert_eq!(index.find_containing(0x2000), None);
    }

    #[test]
    fn test_clear() {
        let mut index = BlockIndex::new();
        index.insert(0x1000, 0x100, 1);
        index.insert(0x3000, 0x100, 2);
        index.clear();
        assert_eq!(index.find_containing(0x1000), None);
        assert_eq!(index.len(), 0);
    }
}
