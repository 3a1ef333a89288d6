//! A bounded set of dirty page addresses.
//!
//! The fault handler must not allocate, so the storage for dirty page
//! records is reserved up front when a range starts being tracked and only
//! ever reused afterwards. Draining hands the recorded addresses out and
//! frees the slots without releasing memory.

/// Pre-reserved storage for the addresses of dirty memory pages.
///
/// [`DirtyPageTable::record`] never allocates; it fails (returns `false`)
/// once all reserved slots are in use. Capacity management is explicit:
/// [`DirtyPageTable::reserve`] at track time, and
/// [`DirtyPageTable::recollect_if_possible`] to give capacity back when a
/// range is untracked.
#[derive(Debug, Default)]
pub struct DirtyPageTable {
    /// Slot storage. `slots[..stored]` holds live records.
    slots: Vec<usize>,
    /// Number of live records.
    stored: usize,
}

impl DirtyPageTable {
    /// Creates an empty table with no capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grows the backing storage by `num_new_pages` slots.
    ///
    /// Must never be called from the fault path.
    pub fn reserve(&mut self, num_new_pages: usize) {
        let new_len = self.slots.len() + num_new_pages;
        self.slots.resize(new_len, 0);
    }

    /// Records `page_addr` into the next free slot and returns `true`, or
    /// returns `false` without recording if all slots are in use.
    ///
    /// Does not check whether `page_addr` is already recorded: the hardware
    /// protection state guarantees a page cannot fault twice for the same
    /// permission without an intervening drain.
    pub fn record(&mut self, page_addr: usize) -> bool {
        if self.stored == self.slots.len() {
            return false;
        }
        self.slots[self.stored] = page_addr;
        self.stored += 1;
        true
    }

    /// Returns `true` if `page_addr` is recorded and not yet drained.
    #[must_use]
    pub fn has(&self, page_addr: usize) -> bool {
        self.slots[..self.stored].contains(&page_addr)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stored
    }

    /// Returns `true` if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stored == 0
    }

    /// Total number of slots, live or free.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Tries to release the storage of `num_stale_pages` slots.
    ///
    /// If fewer free slots than that remain, shrinks to exactly the live
    /// records instead, so capacity for recorded-but-undrained pages is
    /// never lost.
    pub fn recollect_if_possible(&mut self, num_stale_pages: usize) {
        let free = self.slots.len() - self.stored;
        if free > num_stale_pages {
            self.slots.truncate(self.slots.len() - num_stale_pages);
        } else {
            self.slots.truncate(self.stored);
        }
    }

    /// Removes and returns all records in `[start, start + size)`.
    ///
    /// Freed slots are kept for reuse.
    pub fn dump_and_clear_in_range(&mut self, start: usize, size: usize) -> Vec<usize> {
        let end = start.saturating_add(size);
        let mut dumped = Vec::with_capacity(self.stored);
        let mut kept = 0;
        for i in 0..self.stored {
            let addr = self.slots[i];
            if addr >= start && addr < end {
                dumped.push(addr);
            } else {
                self.slots[kept] = addr;
                kept += 1;
            }
        }
        self.stored = kept;
        dumped
    }

    /// Removes and returns all records. Freed slots are kept for reuse.
    pub fn dump_and_clear_all(&mut self) -> Vec<usize> {
        let dumped = self.slots[..self.stored].to_vec();
        self.stored = 0;
        dumped
    }
}

#[cfg(test)]
mod tests {
    use super::DirtyPageTable;

    const PAGE: usize = 4096;

    #[test]
    fn test_record_without_capacity_fails() {
        let mut table = DirtyPageTable::new();
        assert!(!table.record(PAGE));
        assert!(table.is_empty());
    }

    #[test]
    fn test_record_up_to_capacity() {
        let mut table = DirtyPageTable::new();
        table.reserve(3);
        assert!(table.record(PAGE));
        assert!(table.record(2 * PAGE));
        assert!(table.record(3 * PAGE));
        assert!(!table.record(4 * PAGE));
        assert_eq!(table.len(), 3);
        assert!(table.has(2 * PAGE));
        assert!(!table.has(4 * PAGE));
    }

    #[test]
    fn test_dump_and_clear_all_reuses_slots() {
        let mut table = DirtyPageTable::new();
        table.reserve(2);
        assert!(table.record(PAGE));
        assert!(table.record(2 * PAGE));

        let dumped = table.dump_and_clear_all();
        assert_eq!(dumped, [PAGE, 2 * PAGE]);
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 2);

        // The freed slots are usable again without a new reserve.
        assert!(table.record(5 * PAGE));
        assert!(table.record(6 * PAGE));
        assert!(!table.record(7 * PAGE));
    }

    #[test]
    fn test_dump_and_clear_in_range() {
        let mut table = DirtyPageTable::new();
        table.reserve(4);
        for addr in [PAGE, 2 * PAGE, 10 * PAGE, 3 * PAGE] {
            assert!(table.record(addr));
        }

        let dumped = table.dump_and_clear_in_range(PAGE, 3 * PAGE);
        assert_eq!(dumped, [PAGE, 2 * PAGE, 3 * PAGE]);
        assert_eq!(table.len(), 1);
        assert!(table.has(10 * PAGE));
        assert!(!table.has(PAGE));
        assert_eq!(table.capacity(), 4);
    }

    #[test]
    fn test_recollect_prefers_free_slots() {
        let mut table = DirtyPageTable::new();
        table.reserve(8);
        assert!(table.record(PAGE));
        assert!(table.record(2 * PAGE));

        // 6 free slots, asking for 4 back leaves the rest untouched.
        table.recollect_if_possible(4);
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.len(), 2);

        // Asking for more than is free shrinks down to the live records.
        table.recollect_if_possible(4);
        assert_eq!(table.capacity(), 2);
        assert!(table.has(PAGE));
        assert!(table.has(2 * PAGE));
    }
}
