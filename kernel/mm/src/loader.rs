//! Image loading into a user address space.
//!
//! Takes pre-validated load segments (produced by the ELF parser),
//! maps them page-by-page with flags derived from the segment
//! permissions, copies file bytes, and zeroes the BSS tail. The whole
//! load is all-or-nothing: any failure unmaps and frees everything
//! allocated so far. Afterwards the user stack is mapped and the
//! process break is set just past the highest segment.

extern crate alloc;

use alloc::vec::Vec;

use quark_core::addr::VirtAddr;

use crate::address_space::{AddressSpace, CowTracker};
use crate::mapper::MapFlags;
use crate::region::RegionKind;
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE, VmmError, layout};

/// One loadable segment, already validated by the binary parser.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment<'a> {
    /// Virtual load address (not necessarily page-aligned).
    pub vaddr: u64,
    /// File bytes to copy to `vaddr`.
    pub data: &'a [u8],
    /// Total in-memory size; the tail past `data.len()` is BSS.
    pub memsz: u64,
    /// Segment is writable.
    pub writable: bool,
    /// Segment is executable.
    pub executable: bool,
}

/// Result of a successful load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadedImage {
    /// Program entry point.
    pub entry: VirtAddr,
    /// Initial program break (page-aligned highest segment end).
    pub brk: VirtAddr,
    /// Initial user stack pointer.
    pub stack_top: VirtAddr,
}

/// Maps `segments` and the user stack into `space`.
///
/// On any failure every page and frame allocated by this call is
/// released again and the address space is exactly as before.
pub fn load_image(
    space: &mut AddressSpace,
    entry: VirtAddr,
    segments: &[LoadSegment<'_>],
    stack_pages: u64,
    alloc: &mut (impl FrameAllocator + FrameDeallocator),
) -> Result<LoadedImage, VmmError> {
    // Fresh process: no frame is shared, so a throwaway tracker is fine
    // for the rollback path.
    let mut cow = CowTracker::new();
    let mut mapped: Vec<VirtAddr> = Vec::new();
    let mut highest_end = 0u64;

    let outcome = (|| {
        for seg in segments {
            let start = VirtAddr::new(seg.vaddr).align_down(PAGE_SIZE as u64);
            let end = VirtAddr::new(seg.vaddr + seg.memsz).align_up(PAGE_SIZE as u64);
            let pages = (end - start) / PAGE_SIZE as u64;

            let mut flags = MapFlags::USER;
            if seg.writable {
                flags |= MapFlags::WRITABLE;
            }
            if seg.executable {
                flags |= MapFlags::EXECUTABLE;
            }
            let kind = if seg.executable {
                RegionKind::Code
            } else {
                RegionKind::Data
            };

            space.map_region(start, pages, kind, flags, alloc)?;
            mapped.push(start);

            // Copy file bytes; the rest of the range is already zeroed.
            copy_to_space(space, VirtAddr::new(seg.vaddr), seg.data)?;

            if end.as_u64() > highest_end {
                highest_end = end.as_u64();
            }
        }

        // Fixed-size stack ending at the canonical user stack top.
        let stack_bytes = stack_pages * PAGE_SIZE as u64;
        let stack_top = layout::user_stack_top();
        let stack_bottom = stack_top - stack_bytes;
        space.map_region(
            stack_bottom,
            stack_pages,
            RegionKind::Stack,
            MapFlags::USER_DATA,
            alloc,
        )?;
        mapped.push(stack_bottom);

        Ok(stack_top)
    })();

    match outcome {
        Ok(stack_top) => {
            space.set_heap_base(VirtAddr::new(highest_end));
            Ok(LoadedImage {
                entry,
                brk: space.brk(),
                stack_top,
            })
        }
        Err(e) => {
            for start in mapped {
                let _ = space.unmap_region(start, alloc, &mut cow);
            }
            Err(e)
        }
    }
}

/// Copies `bytes` into `space` at `va`, page by page through the HHDM.
///
/// Every touched page must already be mapped.
pub fn copy_to_space(
    space: &AddressSpace,
    va: VirtAddr,
    bytes: &[u8],
) -> Result<(), VmmError> {
    let mut copied = 0usize;
    while copied < bytes.len() {
        let dst_va = va + copied as u64;
        let page_rest = PAGE_SIZE - dst_va.page_offset() as usize;
        let chunk = page_rest.min(bytes.len() - copied);

        let phys = space.translate(dst_va).ok_or(VmmError::NotMapped)?;
        let dst = space.walker().phys_to_virt(phys);
        // SAFETY: The page is mapped in `space` and HHDM-visible; the
        // chunk does not cross the page boundary.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(copied), dst, chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Reads `buf.len()` bytes from `space` at `va`, page by page.
pub fn copy_from_space(
    space: &AddressSpace,
    va: VirtAddr,
    buf: &mut [u8],
) -> Result<(), VmmError> {
    let mut copied = 0usize;
    while copied < buf.len() {
        let src_va = va + copied as u64;
        let page_rest = PAGE_SIZE - src_va.page_offset() as usize;
        let chunk = page_rest.min(buf.len() - copied);

        let phys = space.translate(src_va).ok_or(VmmError::NotMapped)?;
        let src = space.walker().phys_to_virt(phys);
        // SAFETY: The page is mapped in `space` and HHDM-visible.
        unsafe {
            core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr().add(copied), chunk);
        }
        copied += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Arena, CountingAlloc};

    const PAGE: u64 = PAGE_SIZE as u64;

    fn fresh_space<'a>(arena: &'a Arena) -> (AddressSpace, CountingAlloc<'a>) {
        let mut alloc = CountingAlloc::new(arena);
        let space = AddressSpace::new_user(arena.walker(), None, &mut alloc).unwrap();
        (space, alloc)
    }

    #[test]
    fn load_copies_and_zeroes() {
        let arena = Arena::new(256);
        let (mut space, mut alloc) = fresh_space(&arena);

        let text = [0x90u8; 32]; // nops
        let seg = LoadSegment {
            vaddr: 0x40_0000,
            data: &text,
            memsz: 0x2000, // BSS tail past the file bytes
            writable: false,
            executable: true,
        };

        let image = load_image(
            &mut space,
            VirtAddr::new(0x40_0000),
            &[seg],
            4,
            &mut alloc,
        )
        .unwrap();

        assert_eq!(image.entry.as_u64(), 0x40_0000);
        assert_eq!(image.brk.as_u64(), 0x40_2000);
        assert_eq!(image.stack_top, layout::user_stack_top());

        let mut readback = [0u8; 40];
        copy_from_space(&space, VirtAddr::new(0x40_0000), &mut readback).unwrap();
        assert_eq!(&readback[..32], &text);
        assert_eq!(&readback[32..], &[0u8; 8]);

        // Stack mapped and zeroed.
        let stack_probe = layout::user_stack_top() - PAGE;
        assert!(space.is_mapped(stack_probe));
    }

    #[test]
    fn segment_flags_reach_the_region() {
        let arena = Arena::new(256);
        let (mut space, mut alloc) = fresh_space(&arena);

        let data = [1u8, 2, 3, 4];
        let segs = [
            LoadSegment {
                vaddr: 0x40_0000,
                data: &data,
                memsz: 4,
                writable: false,
                executable: true,
            },
            LoadSegment {
                vaddr: 0x40_2000,
                data: &data,
                memsz: 4,
                writable: true,
                executable: false,
            },
        ];
        load_image(&mut space, VirtAddr::new(0x40_0000), &segs, 4, &mut alloc).unwrap();

        let code = space.regions().find(VirtAddr::new(0x40_0000)).unwrap();
        assert_eq!(code.kind, RegionKind::Code);
        assert!(code.flags.contains(MapFlags::EXECUTABLE));
        assert!(!code.flags.contains(MapFlags::WRITABLE));

        let rw = space.regions().find(VirtAddr::new(0x40_2000)).unwrap();
        assert_eq!(rw.kind, RegionKind::Data);
        assert!(rw.flags.contains(MapFlags::WRITABLE));
        assert!(!rw.flags.contains(MapFlags::EXECUTABLE));
    }

    #[test]
    fn failed_load_leaves_no_mappings_or_frames() {
        // Big enough for the first segment but not the stack.
        let arena = Arena::new(16);
        let (mut space, mut alloc) = fresh_space(&arena);
        let live_before = alloc.live;

        let data = [0u8; 16];
        let seg = LoadSegment {
            vaddr: 0x40_0000,
            data: &data,
            memsz: 0x1000,
            writable: true,
            executable: false,
        };

        let result = load_image(
            &mut space,
            VirtAddr::new(0x40_0000),
            &[seg],
            64, // cannot fit in the arena
            &mut alloc,
        );
        assert!(result.is_err());
        assert!(space.regions().is_empty());
        assert!(!space.is_mapped(VirtAddr::new(0x40_0000)));
        // Only intermediate page tables may remain allocated.
        assert!(alloc.live <= live_before + 6);
    }

    #[test]
    fn overlapping_segments_rejected_and_rolled_back() {
        let arena = Arena::new(256);
        let (mut space, mut alloc) = fresh_space(&arena);

        let data = [0u8; 8];
        let segs = [
            LoadSegment {
                vaddr: 0x40_0000,
                data: &data,
                memsz: 0x2000,
                writable: true,
                executable: false,
            },
            // Same page range again: the region set refuses it.
            LoadSegment {
                vaddr: 0x40_1000,
                data: &data,
                memsz: 0x1000,
                writable: true,
                executable: false,
            },
        ];
        let result = load_image(
            &mut space,
            VirtAddr::new(0x40_0000),
            &segs,
            4,
            &mut alloc,
        );
        assert_eq!(result, Err(VmmError::RegionOverlap));
        assert!(space.regions().is_empty());
    }

    #[test]
    fn cross_page_copy_round_trips() {
        let arena = Arena::new(256);
        let (mut space, mut alloc) = fresh_space(&arena);

        let bytes: Vec<u8> = (0..=255u8).cycle().take(3 * PAGE as usize / 2).collect();
        let seg = LoadSegment {
            vaddr: 0x40_0800, // deliberately unaligned
            data: &bytes,
            memsz: bytes.len() as u64,
            writable: true,
            executable: false,
        };
        load_image(&mut space, VirtAddr::new(0x40_0800), &[seg], 4, &mut alloc).unwrap();

        let mut readback = vec![0u8; bytes.len()];
        copy_from_space(&space, VirtAddr::new(0x40_0800), &mut readback).unwrap();
        assert_eq!(readback, bytes);
    }
}
