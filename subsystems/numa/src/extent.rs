//! Extent free list for one node's memory bank.

use alloc::collections::BTreeMap;

/// Free frames as `start -> length` extents, coalesced on free
#[derive(Debug, Clone, Default)]
pub struct ExtentFreeList {
    extents: BTreeMap<u64, u64>,
    free_pages: u64,
}

impl ExtentFreeList {
    /// List covering `[base, base + pages)`
    pub fn new(base: u64, pages: u64) -> Self {
        let mut extents = BTreeMap::new();
        if pages > 0 {
            extents.insert(base, pages);
        }
        Self {
            extents,
            free_pages: pages,
        }
    }

    /// Free frames
    #[inline(always)]
    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    /// Longest free run
    pub fn largest_extent(&self) -> u64 {
        self.extents.values().copied().max().unwrap_or(0)
    }

    /// Number of separate free runs
    pub fn fragments(&self) -> usize {
        self.extents.len()
    }

    /// True if no frame of `[start, start + pages)` is free
    pub fn is_allocated(&self, start: u64, pages: u64) -> bool {
        let end = start + pages;
        match self.extents.range(..end).next_back() {
            Some((&s, &l)) => s + l <= start,
            None => true,
        }
    }

    /// First-fit allocation of `pages` frames
    pub fn allocate(&mut self, pages: u64) -> Option<u64> {
        self.allocate_aligned(pages, 1)
    }

    /// First-fit allocation whose first frame is a multiple of `align`
    pub fn allocate_aligned(&mut self, pages: u64, align: u64) -> Option<u64> {
        if pages == 0 || pages > self.free_pages {
            return None;
        }
        let align = align.max(1);
        let (start, len, at) = self.extents.iter().find_map(|(&start, &len)| {
            let at = start.next_multiple_of(align);
            let skip = at - start;
            (len >= skip + pages).then_some((start, len, at))
        })?;

        self.extents.remove(&start);
        if at > start {
            self.extents.insert(start, at - start);
        }
        let tail = start + len - (at + pages);
        if tail > 0 {
            self.extents.insert(at + pages, tail);
        }
        self.free_pages -= pages;
        Some(at)
    }

    /// Take a specific run out of the list; false if any frame is not free
    pub fn reserve(&mut self, start: u64, pages: u64) -> bool {
        let Some((&ext_start, &ext_len)) = self.extents.range(..=start).next_back() else {
            return false;
        };
        if start + pages > ext_start + ext_len {
            return false;
        }
        self.extents.remove(&ext_start);
        if start > ext_start {
            self.extents.insert(ext_start, start - ext_start);
        }
        let tail = ext_start + ext_len - (start + pages);
        if tail > 0 {
            self.extents.insert(start + pages, tail);
        }
        self.free_pages -= pages;
        true
    }

    /// Return frames; false if any of them is already free
    pub fn free(&mut self, start: u64, pages: u64) -> bool {
        if pages == 0 {
            return false;
        }
        let end = start + pages;
        let prev = self.extents.range(..=start).next_back().map(|(&s, &l)| (s, l));
        let next = self.extents.range(start..).next().map(|(&s, &l)| (s, l));

        if let Some((s, l)) = prev {
            if s + l > start {
                return false;
            }
        }
        if let Some((s, _)) = next {
            if s < end {
                return false;
            }
        }

        let mut new_start = start;
        let mut new_len = pages;
        if let Some((s, l)) = prev {
            if s + l == start {
                self.extents.remove(&s);
                new_start = s;
                new_len += l;
            }
        }
        if let Some((s, l)) = next {
            if s == end {
                self.extents.remove(&s);
                new_len += l;
            }
        }
        self.extents.insert(new_start, new_len);
        self.free_pages += pages;
        true
    }
}
