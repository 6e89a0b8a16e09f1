use crate::error::{VmaError, VmaResult};
use crate::utils::align_up;
use std::collections::BTreeMap;

/// Identifier of the allocation that owns a suballocation.
pub type AllocationId = u64;

/// A contiguous unused byte range inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub offset: u64,
    pub size: u64,
}

impl FreeRegion {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A live range handed out from a block.
///
/// `offset` is the aligned address given to the user. The range taken from the
/// free list, `range_start..range_end`, also covers the alignment padding in
/// front of it and the tail that rounds `size` up to the alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suballocation {
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
    pub range_start: u64,
    pub range_end: u64,
    pub owner: AllocationId,
}

impl Suballocation {
    /// Bytes this suballocation removes from the free list.
    #[must_use]
    pub const fn occupied(&self) -> u64 {
        self.range_end - self.range_start
    }
}

/// Free-list bookkeeping for one memory block.
///
/// Free regions are kept in offset order and are always coalesced: after any
/// operation no two free regions touch. Placement is first-fit by offset.
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    size: u64,

    // Free ranges: Start Offset -> Size
    free: BTreeMap<u64, u64>,

    // Live ranges keyed by their aligned offset.
    used: BTreeMap<u64, Suballocation>,

    sum_free: u64,
}

impl BlockMetadata {
    #[must_use]
    pub fn new(size: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }

        Self {
            size,
            free,
            used: BTreeMap::new(),
            sum_free: size,
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn sum_free_size(&self) -> u64 {
        self.sum_free
    }

    /// Bytes removed from the free list, padding included.
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.size - self.sum_free
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.used.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn free_regions(&self) -> impl Iterator<Item = FreeRegion> + '_ {
        self.free
            .iter()
            .map(|(&offset, &size)| FreeRegion { offset, size })
    }

    pub fn suballocations(&self) -> impl Iterator<Item = &Suballocation> + '_ {
        self.used.values()
    }

    #[must_use]
    pub fn get(&self, offset: u64) -> Option<&Suballocation> {
        self.used.get(&offset)
    }

    #[must_use]
    pub fn largest_free_region(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// First-fit placement of `size` bytes at `alignment`.
    ///
    /// Scans free regions in offset order and takes the first one whose
    /// aligned start still leaves room for `size`. The matched region is
    /// removed or shrunk to the single remainder behind the new range.
    ///
    /// # Errors
    /// `OutOfBlockSpace` if no free region fits.
    pub fn allocate(&mut self, size: u64, alignment: u64, owner: AllocationId) -> VmaResult<u64> {
        let alignment = alignment.max(1);
        if size == 0 {
            return Err(VmaError::InvalidArgument(
                "zero-sized suballocation".to_string(),
            ));
        }

        let found = self.free.iter().find_map(|(&start, &len)| {
            let end = start + len;
            let aligned = align_up(start, alignment);
            let alloc_end = aligned.checked_add(size)?;
            (alloc_end <= end).then(|| {
                (start, end, aligned, align_up(alloc_end, alignment).min(end))
            })
        });

        let Some((start, end, aligned, taken_end)) = found else {
            return Err(VmaError::OutOfBlockSpace { size, alignment });
        };

        self.free.remove(&start);
        if taken_end < end {
            self.free.insert(taken_end, end - taken_end);
        }
        self.sum_free -= taken_end - start;

        self.used.insert(
            aligned,
            Suballocation {
                offset: aligned,
                size,
                alignment,
                range_start: start,
                range_end: taken_end,
                owner,
            },
        );

        debug_assert!(self.validate(), "block metadata corrupted by allocate");
        Ok(aligned)
    }

    /// Returns the suballocation at `offset` to the free list, merging it with
    /// free neighbours on both sides.
    pub fn free(&mut self, offset: u64) -> Option<Suballocation> {
        let Some(sub) = self.used.remove(&offset) else {
            tracing::warn!(offset, "free of untracked suballocation");
            return None;
        };

        let mut start = sub.range_start;
        let mut len = sub.occupied();

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        self.free.insert(start, len);
        self.sum_free += sub.occupied();

        debug_assert!(self.validate(), "block metadata corrupted by free");
        Some(sub)
    }

    /// Checks the non-overlap, coalescing and conservation invariants.
    #[must_use]
    pub fn validate(&self) -> bool {
        // (start, end, is_free) in offset order.
        let mut ranges: Vec<(u64, u64, bool)> = self
            .free
            .iter()
            .map(|(&start, &len)| (start, start + len, true))
            .chain(
                self.used
                    .values()
                    .map(|s| (s.range_start, s.range_end, false)),
            )
            .collect();
        ranges.sort_unstable_by_key(|r| r.0);

        let mut cursor = 0;
        let mut prev_free = false;
        let mut free_total = 0;
        for &(start, end, is_free) in &ranges {
            if start != cursor || end <= start {
                return false;
            }
            if is_free && prev_free {
                return false;
            }
            if is_free {
                free_total += end - start;
            }
            prev_free = is_free;
            cursor = end;
        }

        let subs_ok = self.used.iter().all(|(&key, s)| {
            key == s.offset
                && s.offset >= s.range_start
                && s.offset % s.alignment == 0
                && s.offset + s.size <= s.range_end
        });

        cursor == self.size && free_total == self.sum_free && subs_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(meta: &BlockMetadata) -> Vec<(u64, u64)> {
        meta.free_regions().map(|r| (r.offset, r.size)).collect()
    }

    #[test]
    fn aligned_first_fit_reuses_freed_range() {
        let mut meta = BlockMetadata::new(1024);
        let offsets: Vec<u64> = [100, 200, 300]
            .iter()
            .enumerate()
            .map(|(i, &size)| meta.allocate(size, 16, i as u64).unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 112, 320]);

        meta.free(112).unwrap();
        assert_eq!(regions(&meta), vec![(112, 208), (624, 400)]);

        assert_eq!(meta.allocate(150, 16, 9).unwrap(), 112);
        assert!(meta.validate());
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut meta = BlockMetadata::new(4096);
        let a = meta.allocate(256, 256, 1).unwrap();
        let b = meta.allocate(256, 256, 2).unwrap();
        let c = meta.allocate(256, 256, 3).unwrap();
        let _d = meta.allocate(256, 256, 4).unwrap();

        meta.free(a);
        meta.free(c);
        assert_eq!(regions(&meta), vec![(0, 256), (512, 256), (1024, 3072)]);

        meta.free(b);
        assert_eq!(regions(&meta), vec![(0, 768), (1024, 3072)]);
        assert_eq!(meta.sum_free_size(), 768 + 3072);
    }

    #[test]
    fn full_free_restores_single_region() {
        let mut meta = BlockMetadata::new(1000);
        let offsets: Vec<u64> = (0..5)
            .map(|i| meta.allocate(150, 8, i).unwrap())
            .collect();
        for offset in offsets.into_iter().rev() {
            meta.free(offset);
        }
        assert!(meta.is_empty());
        assert_eq!(regions(&meta), vec![(0, 1000)]);
    }

    #[test]
    fn padding_skips_regions_that_are_too_small() {
        let mut meta = BlockMetadata::new(1024);
        let a = meta.allocate(10, 1, 1).unwrap();
        let _b = meta.allocate(100, 1, 2).unwrap();
        meta.free(a);

        // The 10-byte hole at 0 takes `c`; `d` has to move on to the next 64-aligned start.
        let c = meta.allocate(8, 64, 3).unwrap();
        assert_eq!(c, 0);
        let d = meta.allocate(8, 64, 4).unwrap();
        assert_eq!(d, 128);
        assert!(meta.validate());
    }

    #[test]
    fn exhaustion_reports_out_of_block_space() {
        let mut meta = BlockMetadata::new(256);
        meta.allocate(200, 1, 1).unwrap();
        assert!(matches!(
            meta.allocate(100, 1, 2),
            Err(VmaError::OutOfBlockSpace { size: 100, .. })
        ));
        assert_eq!(meta.largest_free_region(), 56);
    }

    #[test]
    fn untracked_free_is_ignored() {
        let mut meta = BlockMetadata::new(256);
        meta.allocate(64, 1, 1).unwrap();
        assert!(meta.free(32).is_none());
        assert_eq!(meta.allocation_count(), 1);
    }

    #[test]
    fn conservation_holds_under_churn() {
        let mut meta = BlockMetadata::new(64 * 1024);
        let mut live = Vec::new();
        let mut seed = 0x2545_f491_u64;
        for step in 0..400u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if seed % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove((seed as usize / 3) % live.len());
                meta.free(victim).unwrap();
            } else {
                let size = 1 + seed % 700;
                let alignment = 1 << (seed % 8);
                if let Ok(offset) = meta.allocate(size, alignment, step) {
                    live.push(offset);
                }
            }
            let used: u64 = meta.suballocations().map(Suballocation::occupied).sum();
            assert_eq!(used + meta.sum_free_size(), meta.size());
            assert!(meta.validate());
        }
    }
}
