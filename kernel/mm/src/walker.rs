//! 4-level page table walks through the higher-half direct map.
//!
//! [`PageTableWalker`] reads and writes page tables purely via
//! `hhdm_offset + phys`, so the identical code drives real hardware
//! tables and heap-backed tables in host tests. Only 4 KiB mappings are
//! ever created; huge-page entries encountered during a walk are
//! reported, never modified.

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::paging::{PhysFrame, Size4KiB};

use crate::PAGE_SIZE;
use crate::page_table::{PageTable, PageTableEntry, PageTableFlags};

/// PML4 entries 256..512 map the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Error from a page table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// No mapping exists for the address.
    NotMapped,
    /// A huge-page entry (2 MiB / 1 GiB) covers the address.
    HugePage,
    /// An intermediate table could not be allocated.
    OutOfMemory,
}

/// Outcome of translating one virtual address.
#[derive(Debug, Clone, Copy)]
pub enum TranslateResult {
    /// Mapped by a 4 KiB page table entry.
    Page4KiB {
        /// Backing frame.
        frame: PhysFrame<Size4KiB>,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Mapped by a 2 MiB PD entry.
    Page2MiB {
        /// Start of the 2 MiB physical range.
        phys_start: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Mapped by a 1 GiB PDPT entry.
    Page1GiB {
        /// Start of the 1 GiB physical range.
        phys_start: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Not mapped.
    NotMapped,
}

/// Walks and edits 4-level page tables via the HHDM.
#[derive(Debug, Clone, Copy)]
pub struct PageTableWalker {
    hhdm_offset: u64,
}

impl PageTableWalker {
    /// Creates a walker for the given HHDM offset.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    /// The HHDM offset this walker uses.
    pub const fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    /// HHDM alias of a physical address.
    pub fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.hhdm_offset.wrapping_add(phys.as_u64())) as *mut u8
    }

    /// Returns the [`PageTable`] at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must point at a valid, 4 KiB-aligned page table reachable
    /// through the HHDM, with no conflicting mutable access.
    pub(crate) unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures `table[index]` points at a next-level table, allocating
    /// and zeroing one if needed. Missing `intermediate` flags are OR'd
    /// into an existing entry so user walks can traverse shared subtrees.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> Result<PhysAddr, WalkError> {
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            return Ok(entry.address());
        }

        let frame = alloc().ok_or(WalkError::OutOfMemory)?;
        let phys = frame.start_address();
        // SAFETY: The frame was just allocated; zeroing prevents stale
        // bits being read as present entries.
        unsafe {
            core::ptr::write_bytes(self.phys_to_virt(phys), 0, PAGE_SIZE);
        }
        table.entries[index] = PageTableEntry::new(phys, intermediate);
        Ok(phys)
    }

    /// Maps one 4 KiB page, allocating intermediate tables on demand.
    ///
    /// Intermediate entries get PRESENT|WRITABLE, plus USER when the
    /// leaf flags carry USER. On allocation failure nothing was mapped:
    /// only empty intermediate tables may have been created, which is
    /// invisible to translation.
    ///
    /// # Safety
    ///
    /// - `root` must point at a valid PML4.
    /// - The caller must not create conflicting mappings.
    pub unsafe fn map_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> Result<(), WalkError> {
        let intermediate = Self::intermediate_flags(flags);
        // SAFETY: Per this function's contract.
        let pdpt = unsafe { self.ensure_table(root, virt.pml4_index(), intermediate, alloc)? };
        let pd = unsafe { self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc)? };
        let pt = unsafe { self.ensure_table(pd, virt.pd_index(), intermediate, alloc)? };

        let table = unsafe { self.table_at(pt) };
        table.entries[virt.pt_index()] = PageTableEntry::new(phys, flags);
        Ok(())
    }

    /// Clears the 4 KiB mapping for `virt`, returning the frame it held.
    ///
    /// Does not flush the TLB; the caller owns that.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid PML4.
    pub unsafe fn unmap_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
    ) -> Result<PhysFrame<Size4KiB>, WalkError> {
        // SAFETY: Per this function's contract.
        let pt_phys = unsafe { self.leaf_table(root, virt)? };
        let pt = unsafe { self.table_at(pt_phys) };
        let entry = pt.entries[virt.pt_index()];
        if !entry.is_present() {
            return Err(WalkError::NotMapped);
        }
        pt.entries[virt.pt_index()] = PageTableEntry::empty();
        Ok(PhysFrame::containing_address(entry.address()))
    }

    /// Rewrites the flags of an existing 4 KiB mapping, keeping the frame.
    ///
    /// Does not flush the TLB; the caller owns that.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid PML4.
    pub unsafe fn update_flags_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        flags: PageTableFlags,
    ) -> Result<(), WalkError> {
        // SAFETY: Per this function's contract.
        let pt_phys = unsafe { self.leaf_table(root, virt)? };
        let pt = unsafe { self.table_at(pt_phys) };
        let entry = pt.entries[virt.pt_index()];
        if !entry.is_present() {
            return Err(WalkError::NotMapped);
        }
        pt.entries[virt.pt_index()] = PageTableEntry::new(entry.address(), flags);
        Ok(())
    }

    /// Translates `virt`, describing whatever mapping is found.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid PML4.
    pub unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> TranslateResult {
        let pml4 = unsafe { self.table_at(root) };
        let pml4e = pml4.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return TranslateResult::NotMapped;
        }

        let pdpt = unsafe { self.table_at(pml4e.address()) };
        let pdpte = pdpt.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return TranslateResult::NotMapped;
        }
        if pdpte.is_huge() {
            return TranslateResult::Page1GiB {
                phys_start: pdpte.address(),
                flags: pdpte.flags(),
            };
        }

        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return TranslateResult::NotMapped;
        }
        if pde.is_huge() {
            return TranslateResult::Page2MiB {
                phys_start: pde.address(),
                flags: pde.flags(),
            };
        }

        let pt = unsafe { self.table_at(pde.address()) };
        let pte = pt.entries[virt.pt_index()];
        if !pte.is_present() {
            return TranslateResult::NotMapped;
        }

        TranslateResult::Page4KiB {
            frame: PhysFrame::containing_address(pte.address()),
            flags: pte.flags(),
        }
    }

    /// Translates `virt` to a physical address across all page sizes.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid PML4.
    pub unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Per this function's contract.
        match unsafe { self.translate(root, virt) } {
            TranslateResult::Page4KiB { frame, .. } => {
                Some(frame.start_address() + virt.page_offset())
            }
            TranslateResult::Page2MiB { phys_start, .. } => {
                Some(phys_start + (virt.as_u64() & 0x1F_FFFF))
            }
            TranslateResult::Page1GiB { phys_start, .. } => {
                Some(phys_start + (virt.as_u64() & 0x3FFF_FFFF))
            }
            TranslateResult::NotMapped => None,
        }
    }

    /// Frees every paging-structure frame reachable from the user half
    /// of `root` (PML4 entries 0..256), then the caller may free the
    /// PML4 itself. Leaf frames must already have been dealt with.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid PML4 that is not loaded on any CPU.
    pub unsafe fn free_user_tables(
        &self,
        root: PhysAddr,
        dealloc: &mut dyn FnMut(PhysFrame<Size4KiB>),
    ) {
        let pml4 = unsafe { self.table_at(root) };
        for pml4e in pml4.entries[..KERNEL_PML4_START].iter_mut() {
            if !pml4e.is_present() {
                continue;
            }
            let pdpt_phys = pml4e.address();
            let pdpt = unsafe { self.table_at(pdpt_phys) };
            for pdpte in pdpt.entries.iter_mut() {
                if !pdpte.is_present() || pdpte.is_huge() {
                    continue;
                }
                let pd_phys = pdpte.address();
                let pd = unsafe { self.table_at(pd_phys) };
                for pde in pd.entries.iter_mut() {
                    if !pde.is_present() || pde.is_huge() {
                        continue;
                    }
                    dealloc(PhysFrame::containing_address(pde.address()));
                    *pde = PageTableEntry::empty();
                }
                dealloc(PhysFrame::containing_address(pd_phys));
                *pdpte = PageTableEntry::empty();
            }
            dealloc(PhysFrame::containing_address(pdpt_phys));
            *pml4e = PageTableEntry::empty();
        }
    }

    /// Descends to the page table covering `virt`, erroring on holes
    /// and huge-page entries.
    unsafe fn leaf_table(&self, root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, WalkError> {
        let pml4 = unsafe { self.table_at(root) };
        let pml4e = pml4.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return Err(WalkError::NotMapped);
        }

        let pdpt = unsafe { self.table_at(pml4e.address()) };
        let pdpte = pdpt.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return Err(WalkError::NotMapped);
        }
        if pdpte.is_huge() {
            return Err(WalkError::HugePage);
        }

        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return Err(WalkError::NotMapped);
        }
        if pde.is_huge() {
            return Err(WalkError::HugePage);
        }

        Ok(pde.address())
    }

    fn intermediate_flags(leaf: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Arena;

    fn flags_rw() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE
    }

    #[test]
    fn map_then_translate() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        let virt = VirtAddr::new(0x40_0000);
        let phys = PhysAddr::new(0x20_0000);
        // SAFETY: root is a zeroed table inside the arena.
        unsafe {
            walker
                .map_4k(root, virt, phys, flags_rw(), &mut || arena.alloc_frame())
                .unwrap();
            assert_eq!(walker.translate_addr(root, virt), Some(phys));
            // In-page offsets carry through.
            assert_eq!(
                walker.translate_addr(root, virt + 0x123),
                Some(phys + 0x123)
            );
        }
    }

    #[test]
    fn unmap_clears_mapping() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        let virt = VirtAddr::new(0x40_0000);
        let phys = PhysAddr::new(0x20_0000);
        // SAFETY: root is a zeroed table inside the arena.
        unsafe {
            walker
                .map_4k(root, virt, phys, flags_rw(), &mut || arena.alloc_frame())
                .unwrap();
            let frame = walker.unmap_4k(root, virt).unwrap();
            assert_eq!(frame.start_address(), phys);
            assert_eq!(walker.translate_addr(root, virt), None);
            assert_eq!(walker.unmap_4k(root, virt), Err(WalkError::NotMapped));
        }
    }

    #[test]
    fn update_flags_keeps_frame() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        let virt = VirtAddr::new(0x1000);
        let phys = PhysAddr::new(0x8000);
        // SAFETY: root is a zeroed table inside the arena.
        unsafe {
            walker
                .map_4k(root, virt, phys, flags_rw(), &mut || arena.alloc_frame())
                .unwrap();
            walker
                .update_flags_4k(root, virt, PageTableFlags::PRESENT)
                .unwrap();
            match walker.translate(root, virt) {
                TranslateResult::Page4KiB { frame, flags } => {
                    assert_eq!(frame.start_address(), phys);
                    assert!(!flags.contains(PageTableFlags::WRITABLE));
                }
                other => panic!("unexpected translation: {other:?}"),
            }
        }
    }

    #[test]
    fn alloc_failure_is_reported() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        // SAFETY: root is a zeroed table inside the arena.
        let result = unsafe {
            walker.map_4k(
                root,
                VirtAddr::new(0x1000),
                PhysAddr::new(0x2000),
                flags_rw(),
                &mut || None,
            )
        };
        assert_eq!(result, Err(WalkError::OutOfMemory));
        // SAFETY: Same root.
        unsafe {
            assert_eq!(walker.translate_addr(root, VirtAddr::new(0x1000)), None);
        }
    }

    #[test]
    fn user_flag_propagates_to_intermediates() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        let virt = VirtAddr::new(0x40_0000);
        // SAFETY: root is a zeroed table inside the arena.
        unsafe {
            walker
                .map_4k(
                    root,
                    virt,
                    PhysAddr::new(0x3000),
                    flags_rw() | PageTableFlags::USER,
                    &mut || arena.alloc_frame(),
                )
                .unwrap();
            let pml4 = walker.table_at(root);
            let pml4e = pml4.entries[virt.pml4_index()];
            assert!(pml4e.flags().contains(PageTableFlags::USER));
        }
    }

    #[test]
    fn huge_entry_detected_not_modified() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        let virt = VirtAddr::new(0x20_0000);
        // Build PML4 -> PDPT -> PD with a 2 MiB huge entry by hand.
        // SAFETY: All tables live in the arena.
        unsafe {
            walker
                .map_4k(root, virt, PhysAddr::new(0x5000), flags_rw(), &mut || {
                    arena.alloc_frame()
                })
                .unwrap();
            walker.unmap_4k(root, virt).unwrap();

            // Find the PD and plant a huge entry.
            let pml4 = walker.table_at(root);
            let pdpt = walker.table_at(pml4.entries[virt.pml4_index()].address());
            let pd = walker.table_at(pdpt.entries[virt.pdpt_index()].address());
            pd.entries[virt.pd_index()] = PageTableEntry::new(
                PhysAddr::new(0x20_0000),
                flags_rw() | PageTableFlags::HUGE_PAGE,
            );

            match walker.translate(root, virt + 0x1234) {
                TranslateResult::Page2MiB { phys_start, .. } => {
                    assert_eq!(phys_start.as_u64(), 0x20_0000);
                }
                other => panic!("unexpected translation: {other:?}"),
            }
            assert_eq!(
                walker.translate_addr(root, virt + 0x1234),
                Some(PhysAddr::new(0x20_1234))
            );
            assert_eq!(walker.unmap_4k(root, virt), Err(WalkError::HugePage));
            assert_eq!(
                walker.update_flags_4k(root, virt, flags_rw()),
                Err(WalkError::HugePage)
            );
        }
    }

    #[test]
    fn free_user_tables_returns_structure_frames() {
        let arena = Arena::new(64);
        let walker = arena.walker();
        let root = arena.alloc_table();

        // SAFETY: root is a zeroed table inside the arena.
        unsafe {
            walker
                .map_4k(
                    root,
                    VirtAddr::new(0x40_0000),
                    PhysAddr::new(0x3000),
                    flags_rw() | PageTableFlags::USER,
                    &mut || arena.alloc_frame(),
                )
                .unwrap();

            let mut freed = 0;
            walker.free_user_tables(root, &mut |_| freed += 1);
            // One PDPT + one PD + one PT.
            assert_eq!(freed, 3);
            assert_eq!(walker.translate_addr(root, VirtAddr::new(0x40_0000)), None);
        }
    }
}
