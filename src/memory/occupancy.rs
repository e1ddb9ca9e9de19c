use fixedbitset::FixedBitSet;

/// Per-block occupancy tracker: one bit per granularity-sized cell.
///
/// Two bitmaps are kept. `used` marks occupied cells; `stop` marks the last
/// cell of each allocation. The stop bit lets `release`/`shrink` recover an
/// allocation's length from its start cell alone — no side table maps
/// pointers to sizes, and none of this metadata lives inside the executable
/// mapping it describes.
pub(crate) struct OccupancyMap {
    used: FixedBitSet,
    stop: FixedBitSet,
    cells: usize,
    used_cells: usize,
}

impl OccupancyMap {
    pub fn new(cells: usize) -> Self {
        Self {
            used: FixedBitSet::with_capacity(cells),
            stop: FixedBitSet::with_capacity(cells),
            cells,
            used_cells: 0,
        }
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    pub fn used_cells(&self) -> usize {
        self.used_cells
    }

    pub fn free_cells(&self) -> usize {
        self.cells - self.used_cells
    }

    pub fn is_empty(&self) -> bool {
        self.used_cells == 0
    }

    /// Marks `[start, start + count)` as used and sets the stop bit on the
    /// final cell. The range must be free.
    pub fn reserve(&mut self, start: usize, count: usize) {
        debug_assert!(count > 0);
        debug_assert!(start + count <= self.cells);
        for cell in start..start + count {
            debug_assert!(!self.used.contains(cell), "cell {cell} already reserved");
            self.used.insert(cell);
        }
        self.stop.insert(start + count - 1);
        self.used_cells += count;
    }

    /// Length in cells of the live run beginning at `start`, or `None` if
    /// `start` is not the first cell of a live run (free cell, or a pointer
    /// into the middle of an allocation).
    pub fn run_len(&self, start: usize) -> Option<usize> {
        if start >= self.cells || !self.used.contains(start) {
            return None;
        }
        // A run starts at cell 0, after a free cell, or right after another
        // run's stop bit.
        if start > 0 && self.used.contains(start - 1) && !self.stop.contains(start - 1) {
            return None;
        }
        let mut end = start;
        while !self.stop.contains(end) {
            end += 1;
            debug_assert!(end < self.cells, "run without a stop bit");
        }
        Some(end - start + 1)
    }

    /// Clears the run beginning at `start` from both bitmaps and returns its
    /// cell count. `None` (with no state change) if `start` does not begin a
    /// live run.
    pub fn release(&mut self, start: usize) -> Option<usize> {
        let len = self.run_len(start)?;
        for cell in start..start + len {
            self.used.set(cell, false);
        }
        self.stop.set(start + len - 1, false);
        self.used_cells -= len;
        Some(len)
    }

    /// Truncates the run beginning at `start` to `keep` cells, clearing the
    /// tail. Returns the number of cells freed; 0 if `keep` already covers
    /// the whole run. `keep` must be at least 1 — shrinking to nothing is a
    /// release, which the caller handles.
    pub fn shrink(&mut self, start: usize, keep: usize) -> Option<usize> {
        debug_assert!(keep > 0);
        let len = self.run_len(start)?;
        if keep >= len {
            return Some(0);
        }
        for cell in start + keep..start + len {
            self.used.set(cell, false);
        }
        self.stop.set(start + len - 1, false);
        self.stop.insert(start + keep - 1);
        self.used_cells -= len - keep;
        Some(len - keep)
    }

    /// First-fit scan for `min` contiguous free cells.
    pub fn find_free_run(&self, min: usize) -> Option<usize> {
        debug_assert!(min > 0);
        let mut cell = 0;
        while cell < self.cells {
            if self.used.contains(cell) {
                cell += 1;
                continue;
            }
            let gap_start = cell;
            while cell < self.cells && !self.used.contains(cell) {
                cell += 1;
                if cell - gap_start >= min {
                    return Some(gap_start);
                }
            }
        }
        None
    }

    /// Exact length of the largest free run. Used to refresh a block's
    /// cached hint after a failed search.
    pub fn largest_free_run(&self) -> usize {
        let mut largest = 0;
        let mut gap = 0;
        for cell in 0..self.cells {
            if self.used.contains(cell) {
                gap = 0;
            } else {
                gap += 1;
                largest = largest.max(gap);
            }
        }
        largest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_release_round_trip() {
        let mut map = OccupancyMap::new(64);
        map.reserve(0, 2);
        assert_eq!(map.used_cells(), 2);
        assert_eq!(map.release(0), Some(2));
        assert_eq!(map.used_cells(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_run_len_via_stop_bit() {
        let mut map = OccupancyMap::new(64);
        map.reserve(0, 3);
        map.reserve(3, 1);
        map.reserve(4, 5);

        // Adjacent runs are distinguished only by stop bits.
        assert_eq!(map.run_len(0), Some(3));
        assert_eq!(map.run_len(3), Some(1));
        assert_eq!(map.run_len(4), Some(5));
    }

    #[test]
    fn test_mid_run_pointer_rejected() {
        let mut map = OccupancyMap::new(64);
        map.reserve(0, 4);
        assert_eq!(map.run_len(2), None);
        assert_eq!(map.release(2), None);
        // Nothing changed.
        assert_eq!(map.used_cells(), 4);
        assert_eq!(map.release(0), Some(4));
    }

    #[test]
    fn test_release_free_cell_rejected() {
        let mut map = OccupancyMap::new(64);
        map.reserve(8, 2);
        assert_eq!(map.release(0), None);
        assert_eq!(map.used_cells(), 2);
    }

    #[test]
    fn test_double_release_rejected() {
        let mut map = OccupancyMap::new(64);
        map.reserve(0, 2);
        assert_eq!(map.release(0), Some(2));
        assert_eq!(map.release(0), None);
        assert_eq!(map.used_cells(), 0);
    }

    #[test]
    fn test_find_free_run_first_fit() {
        let mut map = OccupancyMap::new(16);
        map.reserve(0, 2); // cells 0-1
        map.reserve(4, 4); // cells 4-7

        // Gap at 2..4 is 2 cells, gap at 8..16 is 8 cells.
        assert_eq!(map.find_free_run(1), Some(2));
        assert_eq!(map.find_free_run(2), Some(2));
        assert_eq!(map.find_free_run(3), Some(8));
        assert_eq!(map.find_free_run(8), Some(8));
        assert_eq!(map.find_free_run(9), None);
    }

    #[test]
    fn test_find_free_run_full() {
        let mut map = OccupancyMap::new(8);
        map.reserve(0, 8);
        assert_eq!(map.find_free_run(1), None);
        assert_eq!(map.free_cells(), 0);
    }

    #[test]
    fn test_shrink_clears_tail() {
        let mut map = OccupancyMap::new(32);
        map.reserve(0, 8);
        assert_eq!(map.shrink(0, 3), Some(5));
        assert_eq!(map.used_cells(), 3);

        // The shrunk run keeps its new stop bit: release frees exactly 3.
        assert_eq!(map.release(0), Some(3));
        assert!(map.is_empty());
    }

    #[test]
    fn test_shrink_noop_when_covering() {
        let mut map = OccupancyMap::new(32);
        map.reserve(0, 4);
        assert_eq!(map.shrink(0, 4), Some(0));
        assert_eq!(map.shrink(0, 10), Some(0));
        assert_eq!(map.used_cells(), 4);
    }

    #[test]
    fn test_shrink_frees_space_for_neighbor() {
        let mut map = OccupancyMap::new(8);
        map.reserve(0, 8);
        assert_eq!(map.find_free_run(1), None);
        map.shrink(0, 2);
        assert_eq!(map.find_free_run(6), Some(2));
    }

    #[test]
    fn test_largest_free_run() {
        let mut map = OccupancyMap::new(16);
        assert_eq!(map.largest_free_run(), 16);
        map.reserve(6, 2);
        assert_eq!(map.largest_free_run(), 8);
        map.reserve(0, 6);
        assert_eq!(map.largest_free_run(), 8);
        map.release(6);
        assert_eq!(map.largest_free_run(), 10);
    }

    #[test]
    fn test_adjacent_runs_release_independently() {
        let mut map = OccupancyMap::new(16);
        map.reserve(0, 4);
        map.reserve(4, 4);
        assert_eq!(map.release(0), Some(4));
        // Second run untouched.
        assert_eq!(map.run_len(4), Some(4));
        assert_eq!(map.used_cells(), 4);
    }
}
