//! Address-space region bookkeeping.
//!
//! A [`RegionSet`] records every logically allocated range of an address
//! space as `[start, end)` intervals sorted by start address. Regions
//! never overlap; insertion enforces this.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use quark_core::addr::VirtAddr;

use crate::VmmError;
use crate::mapper::MapFlags;

/// What a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Program text.
    Code,
    /// Initialized and zero-initialized data.
    Data,
    /// Heap pages below the break.
    Heap,
    /// Stack pages.
    Stack,
    /// Shared mappings (MAP_SHARED).
    Shared,
    /// Memory-mapped I/O.
    Mmio,
}

/// One contiguous allocated range inside an address space.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First byte of the range.
    pub start: VirtAddr,
    /// One past the last byte (page-aligned).
    pub end: VirtAddr,
    /// Classification.
    pub kind: RegionKind,
    /// Mapping flags for the pages of this region.
    pub flags: MapFlags,
    /// Pages are shared copy-on-write after a fork.
    pub cow: bool,
}

impl Region {
    /// Creates a region covering `[start, end)`.
    pub fn new(start: VirtAddr, end: VirtAddr, kind: RegionKind, flags: MapFlags) -> Self {
        Self {
            start,
            end,
            kind,
            flags,
            cow: false,
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of 4 KiB pages.
    pub fn page_count(&self) -> u64 {
        self.len() / crate::PAGE_SIZE as u64
    }

    /// Whether `addr` falls inside the region.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region({:#x}..{:#x} {:?}{})",
            self.start.as_u64(),
            self.end.as_u64(),
            self.kind,
            if self.cow { " cow" } else { "" },
        )
    }
}

/// Ordered, non-overlapping set of regions.
#[derive(Debug, Default)]
pub struct RegionSet {
    regions: Vec<Region>,
}

impl RegionSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Inserts a region, rejecting overlaps and empty/reversed ranges.
    pub fn insert(&mut self, region: Region) -> Result<(), VmmError> {
        if region.start >= region.end {
            return Err(VmmError::InvalidArgument);
        }
        let idx = self
            .regions
            .partition_point(|r| r.start < region.start);
        let clash = (idx > 0 && self.regions[idx - 1].overlaps(&region))
            || (idx < self.regions.len() && self.regions[idx].overlaps(&region));
        if clash {
            return Err(VmmError::RegionOverlap);
        }
        self.regions.insert(idx, region);
        Ok(())
    }

    /// Removes the region starting exactly at `start`, returning it.
    pub fn remove(&mut self, start: VirtAddr) -> Option<Region> {
        let idx = self.regions.iter().position(|r| r.start == start)?;
        Some(self.regions.remove(idx))
    }

    /// Finds the region containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.start <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &self.regions[idx - 1];
        candidate.contains(addr).then_some(candidate)
    }

    /// Finds the region containing `addr`, mutably.
    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Region> {
        let idx = self.regions.partition_point(|r| r.start <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &mut self.regions[idx - 1];
        candidate.contains(addr).then_some(candidate)
    }

    /// Iterates regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Iterates regions mutably in address order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.regions.iter_mut()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total pages across all regions.
    pub fn total_pages(&self) -> u64 {
        self.regions.iter().map(Region::page_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64) -> Region {
        Region::new(
            VirtAddr::new(start),
            VirtAddr::new(end),
            RegionKind::Data,
            MapFlags::USER_DATA,
        )
    }

    #[test]
    fn insert_keeps_order() {
        let mut set = RegionSet::new();
        set.insert(region(0x3000, 0x4000)).unwrap();
        set.insert(region(0x1000, 0x2000)).unwrap();
        set.insert(region(0x5000, 0x8000)).unwrap();

        let starts: Vec<u64> = set.iter().map(|r| r.start.as_u64()).collect();
        assert_eq!(starts, [0x1000, 0x3000, 0x5000]);
        assert_eq!(set.total_pages(), 1 + 1 + 3);
    }

    #[test]
    fn overlap_rejected() {
        let mut set = RegionSet::new();
        set.insert(region(0x1000, 0x3000)).unwrap();
        assert_eq!(
            set.insert(region(0x2000, 0x4000)),
            Err(VmmError::RegionOverlap)
        );
        assert_eq!(
            set.insert(region(0x0, 0x1001)),
            Err(VmmError::RegionOverlap)
        );
        // Touching is fine.
        set.insert(region(0x3000, 0x4000)).unwrap();
        set.insert(region(0x0, 0x1000)).unwrap();
    }

    #[test]
    fn empty_range_rejected() {
        let mut set = RegionSet::new();
        assert_eq!(
            set.insert(region(0x1000, 0x1000)),
            Err(VmmError::InvalidArgument)
        );
    }

    #[test]
    fn find_hits_and_misses() {
        let mut set = RegionSet::new();
        set.insert(region(0x1000, 0x3000)).unwrap();

        assert!(set.find(VirtAddr::new(0x1000)).is_some());
        assert!(set.find(VirtAddr::new(0x2fff)).is_some());
        assert!(set.find(VirtAddr::new(0x3000)).is_none());
        assert!(set.find(VirtAddr::new(0xfff)).is_none());
    }

    #[test]
    fn remove_by_start() {
        let mut set = RegionSet::new();
        set.insert(region(0x1000, 0x2000)).unwrap();
        set.insert(region(0x2000, 0x3000)).unwrap();

        let removed = set.remove(VirtAddr::new(0x1000)).unwrap();
        assert_eq!(removed.end.as_u64(), 0x2000);
        assert_eq!(set.len(), 1);
        assert!(set.remove(VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn find_mut_allows_cow_marking() {
        let mut set = RegionSet::new();
        set.insert(region(0x1000, 0x2000)).unwrap();
        set.find_mut(VirtAddr::new(0x1800)).unwrap().cow = true;
        assert!(set.find(VirtAddr::new(0x1000)).unwrap().cow);
    }
}
