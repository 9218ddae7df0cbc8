//! Per-process address spaces.
//!
//! An [`AddressSpace`] owns a PML4 (kernel upper half shared from a
//! template), the [`RegionSet`] describing every allocated range, and
//! the heap-break state. On top of the raw walker it provides demand
//! allocation, range mapping with rollback, `sbrk`, `fork` with
//! copy-on-write, the page-fault resolver, and teardown.
//!
//! COW sharing uses a per-frame share count ([`CowTracker`]) so the
//! last holder of a shared frame becomes writable without a copy and
//! teardown never frees a frame that a sibling still maps.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::paging::{PhysFrame, Size4KiB};

use crate::mapper::{MapFlags, MapFlush};
use crate::page_table::{PageFaultErrorCode, PageTableFlags};
use crate::region::{Region, RegionKind, RegionSet};
use crate::walker::{KERNEL_PML4_START, PageTableWalker, TranslateResult, WalkError};
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE, VmmError, layout};

/// Kernel or user address space; decides heap bounds and USER flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceKind {
    /// The kernel's own space (heap in the fixed high-half window).
    Kernel,
    /// A process space (heap between the image break and the stack reserve).
    User,
}

/// Per-frame share counts for copy-on-write frames.
///
/// A frame without an entry has exactly one holder. `fork` bumps the
/// count; a COW fault or teardown decrements it and only the last
/// holder actually frees the frame.
#[derive(Debug, Default)]
pub struct CowTracker {
    counts: BTreeMap<u64, u32>,
}

impl CowTracker {
    /// Creates an empty tracker.
    pub const fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }

    /// Records one more holder of `phys`.
    pub fn share(&mut self, phys: PhysAddr) {
        *self.counts.entry(phys.as_u64()).or_insert(1) += 1;
    }

    /// Whether `phys` currently has more than one holder.
    pub fn is_shared(&self, phys: PhysAddr) -> bool {
        self.counts.contains_key(&phys.as_u64())
    }

    /// Drops one holder of `phys`. Returns `true` if the caller was the
    /// last holder and must free the frame.
    pub fn release(&mut self, phys: PhysAddr) -> bool {
        match self.counts.get_mut(&phys.as_u64()) {
            None => true,
            Some(count) => {
                *count -= 1;
                if *count <= 1 {
                    self.counts.remove(&phys.as_u64());
                }
                false
            }
        }
    }

    /// Number of tracked shared frames.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no frame is currently shared.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Outcome of [`AddressSpace::handle_page_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The fault was a COW write and has been resolved; retry the access.
    Resolved,
    /// The fault cannot be handled; the task must be killed.
    Fatal,
}

/// A 4-level address space with region and heap bookkeeping.
pub struct AddressSpace {
    root: PhysAddr,
    walker: PageTableWalker,
    kind: AddressSpaceKind,
    regions: RegionSet,
    heap_start: VirtAddr,
    heap_ceiling: VirtAddr,
    brk: VirtAddr,
}

impl AddressSpace {
    /// Creates a fresh user address space.
    ///
    /// Allocates a PML4, zeroes the lower (user) half, and copies the
    /// upper half from `kernel_root` so every process shares the kernel
    /// mappings. Pass `None` for `kernel_root` to leave the upper half
    /// empty (boot-time template construction and host tests).
    pub fn new_user(
        walker: PageTableWalker,
        kernel_root: Option<PhysAddr>,
        alloc: &mut impl FrameAllocator,
    ) -> Result<Self, VmmError> {
        let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        let root = frame.start_address();

        // SAFETY: The frame was just allocated and the HHDM aliases it.
        unsafe {
            let new_pml4 = walker.phys_to_virt(root) as *mut u64;
            core::ptr::write_bytes(new_pml4, 0, KERNEL_PML4_START);
            match kernel_root {
                Some(kroot) => {
                    let kernel_pml4 = walker.phys_to_virt(kroot) as *const u64;
                    core::ptr::copy_nonoverlapping(
                        kernel_pml4.add(KERNEL_PML4_START),
                        new_pml4.add(KERNEL_PML4_START),
                        512 - KERNEL_PML4_START,
                    );
                }
                None => {
                    core::ptr::write_bytes(new_pml4.add(KERNEL_PML4_START), 0, 512 - KERNEL_PML4_START);
                }
            }
        }

        Ok(Self {
            root,
            walker,
            kind: AddressSpaceKind::User,
            regions: RegionSet::new(),
            heap_start: VirtAddr::new(layout::USER_HEAP_BASE),
            heap_ceiling: VirtAddr::new(layout::USER_HEAP_CEILING),
            brk: VirtAddr::new(layout::USER_HEAP_BASE),
        })
    }

    /// Wraps the kernel's own root table as an address space.
    ///
    /// # Safety
    ///
    /// `root` must be the live kernel PML4 and the walker's HHDM offset
    /// must be correct for it.
    pub unsafe fn from_kernel_root(walker: PageTableWalker, root: PhysAddr) -> Self {
        Self {
            root,
            walker,
            kind: AddressSpaceKind::Kernel,
            regions: RegionSet::new(),
            heap_start: VirtAddr::new(layout::KERNEL_HEAP_START),
            heap_ceiling: VirtAddr::new(layout::KERNEL_HEAP_START + layout::KERNEL_HEAP_SIZE),
            brk: VirtAddr::new(layout::KERNEL_HEAP_START),
        }
    }

    /// Physical address of the PML4 (the CR3 value).
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// Kernel or user.
    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    /// The walker bound to this space.
    pub fn walker(&self) -> &PageTableWalker {
        &self.walker
    }

    /// The region table.
    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }

    /// Current program break.
    pub fn brk(&self) -> VirtAddr {
        self.brk
    }

    /// Base of the heap.
    pub fn heap_start(&self) -> VirtAddr {
        self.heap_start
    }

    /// Moves the heap base and break (used after loading an image).
    ///
    /// `base` is rounded up to a page boundary.
    pub fn set_heap_base(&mut self, base: VirtAddr) {
        let base = base.align_up(PAGE_SIZE as u64);
        self.heap_start = base;
        self.brk = base;
    }

    /// Advances the break past a fixed placement (non-fixed `mmap`
    /// carves from the break region).
    pub fn bump_brk(&mut self, to: VirtAddr) {
        if to > self.brk {
            self.brk = to;
        }
    }

    // -----------------------------------------------------------------
    // Raw page operations
    // -----------------------------------------------------------------

    /// Maps one page without touching region bookkeeping.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator,
    ) -> Result<MapFlush, VmmError> {
        let flags = self.adjust_flags(flags);
        // SAFETY: The space owns its root table; intermediates come from
        // the caller's allocator.
        let result = unsafe {
            self.walker.map_4k(
                self.root,
                virt,
                frame.start_address(),
                flags.to_native(),
                &mut || alloc.allocate_frame(),
            )
        };
        match result {
            Ok(()) => Ok(MapFlush::new(virt)),
            Err(WalkError::OutOfMemory) => Err(VmmError::OutOfMemory),
            Err(WalkError::HugePage) => Err(VmmError::HugePage),
            Err(WalkError::NotMapped) => Err(VmmError::NotMapped),
        }
    }

    /// Unmaps one page and returns its frame; flushes the TLB entry.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysFrame<Size4KiB>, VmmError> {
        // SAFETY: The space owns its root table.
        let frame = unsafe { self.walker.unmap_4k(self.root, virt) }.map_err(|e| match e {
            WalkError::NotMapped => VmmError::NotMapped,
            WalkError::HugePage => VmmError::HugePage,
            WalkError::OutOfMemory => VmmError::OutOfMemory,
        })?;
        MapFlush::new(virt).flush();
        Ok(frame)
    }

    /// Translates a virtual address.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: The space owns its root table.
        unsafe { self.walker.translate_addr(self.root, virt) }
    }

    /// Whether a single page is mapped.
    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.translate(virt).is_some()
    }

    /// Maps `pages` consecutive pages starting at `virt` onto the
    /// physical range starting at `phys`. Rolls back on failure.
    pub fn map_range(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        pages: u64,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator,
    ) -> Result<(), VmmError> {
        for i in 0..pages {
            let va = virt + i * PAGE_SIZE as u64;
            let frame = PhysFrame::containing_address(phys + i * PAGE_SIZE as u64);
            match self.map_page(va, frame, flags, alloc) {
                Ok(flush) => flush.ignore(),
                Err(e) => {
                    for j in 0..i {
                        let _ = self.unmap_page(virt + j * PAGE_SIZE as u64);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Identity-maps `pages` pages starting at `phys`.
    pub fn identity_map(
        &mut self,
        phys: PhysAddr,
        pages: u64,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator,
    ) -> Result<(), VmmError> {
        self.map_range(VirtAddr::new(phys.as_u64()), phys, pages, flags, alloc)
    }

    /// Whether every page of `[virt, virt + pages * 4K)` is mapped.
    pub fn is_range_mapped(&self, virt: VirtAddr, pages: u64) -> bool {
        (0..pages).all(|i| self.is_mapped(virt + i * PAGE_SIZE as u64))
    }

    /// Rewrites the flags of `pages` mapped pages, keeping their frames.
    pub fn protect_range(
        &mut self,
        virt: VirtAddr,
        pages: u64,
        flags: MapFlags,
    ) -> Result<(), VmmError> {
        let flags = self.adjust_flags(flags);
        for i in 0..pages {
            let va = virt + i * PAGE_SIZE as u64;
            // SAFETY: The space owns its root table.
            unsafe { self.walker.update_flags_4k(self.root, va, flags.to_native()) }.map_err(
                |e| match e {
                    WalkError::NotMapped => VmmError::NotMapped,
                    WalkError::HugePage => VmmError::HugePage,
                    WalkError::OutOfMemory => VmmError::OutOfMemory,
                },
            )?;
            MapFlush::new(va).flush();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Region-level operations
    // -----------------------------------------------------------------

    /// Allocates frames for `[start, start + pages * 4K)`, zero-fills,
    /// maps them, and records a region. Fully rolls back on failure.
    pub fn map_region(
        &mut self,
        start: VirtAddr,
        pages: u64,
        kind: RegionKind,
        flags: MapFlags,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
    ) -> Result<(), VmmError> {
        if pages == 0 || !start.is_aligned(PAGE_SIZE as u64) {
            return Err(VmmError::InvalidArgument);
        }
        let end = start + pages * PAGE_SIZE as u64;
        let flags = self.adjust_flags(flags);
        self.regions
            .insert(Region::new(start, end, kind, flags))?;

        for i in 0..pages {
            let va = start + i * PAGE_SIZE as u64;
            let outcome = alloc
                .allocate_frame()
                .ok_or(VmmError::OutOfMemory)
                .and_then(|frame| {
                    self.zero_frame(frame);
                    match self.map_page(va, frame, flags, alloc) {
                        Ok(flush) => {
                            flush.ignore();
                            Ok(())
                        }
                        Err(e) => {
                            // SAFETY: The frame was never mapped.
                            unsafe { alloc.deallocate_frame(frame) };
                            Err(e)
                        }
                    }
                });

            if let Err(e) = outcome {
                for j in 0..i {
                    let va = start + j * PAGE_SIZE as u64;
                    if let Ok(frame) = self.unmap_page(va) {
                        // SAFETY: Just unmapped, no other holder exists yet.
                        unsafe { alloc.deallocate_frame(frame) };
                    }
                }
                self.regions.remove(start);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmaps a whole region starting at `start`, freeing frames the
    /// caller still owns (COW-shared frames are released, not freed).
    pub fn unmap_region(
        &mut self,
        start: VirtAddr,
        dealloc: &mut impl FrameDeallocator,
        cow: &mut CowTracker,
    ) -> Result<(), VmmError> {
        let region = self.regions.remove(start).ok_or(VmmError::NoRegion)?;
        for i in 0..region.page_count() {
            let va = start + i * PAGE_SIZE as u64;
            if let Ok(frame) = self.unmap_page(va) {
                if cow.release(frame.start_address()) {
                    // SAFETY: Last holder; the frame is unreferenced.
                    unsafe { dealloc.deallocate_frame(frame) };
                }
            }
        }
        Ok(())
    }

    /// Rewrites region flags and every present PTE of the region.
    pub fn protect_region(&mut self, start: VirtAddr, flags: MapFlags) -> Result<(), VmmError> {
        let flags = self.adjust_flags(flags);
        let (r_start, pages) = {
            let region = self
                .regions
                .find_mut(start)
                .ok_or(VmmError::NoRegion)?;
            region.flags = flags;
            (region.start, region.page_count())
        };
        for i in 0..pages {
            let va = r_start + i * PAGE_SIZE as u64;
            // Holes (lazy pages) are fine, skip them.
            // SAFETY: The space owns its root table.
            match unsafe { self.walker.update_flags_4k(self.root, va, flags.to_native()) } {
                Ok(()) => MapFlush::new(va).flush(),
                Err(WalkError::NotMapped) => {}
                Err(WalkError::HugePage) => return Err(VmmError::HugePage),
                Err(WalkError::OutOfMemory) => return Err(VmmError::OutOfMemory),
            }
        }
        Ok(())
    }

    /// Allocates `size` bytes (page-rounded) from the heap at the break.
    ///
    /// Returns the base of the new range. Rolls back fully on failure.
    pub fn alloc(
        &mut self,
        size: u64,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
    ) -> Result<VirtAddr, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidArgument);
        }
        let base = self.brk.align_up(PAGE_SIZE as u64);
        let pages = size.div_ceil(PAGE_SIZE as u64);
        let end = base + pages * PAGE_SIZE as u64;
        if end > self.heap_ceiling {
            return Err(VmmError::NoSpace);
        }

        self.map_region(base, pages, RegionKind::Heap, self.default_data_flags(), alloc)?;
        self.brk = end;
        Ok(base)
    }

    /// Allocates `size` bytes at a fixed address with explicit flags.
    pub fn alloc_at(
        &mut self,
        va: VirtAddr,
        size: u64,
        flags: MapFlags,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
    ) -> Result<VirtAddr, VmmError> {
        if size == 0 || !va.is_aligned(PAGE_SIZE as u64) {
            return Err(VmmError::InvalidArgument);
        }
        let pages = size.div_ceil(PAGE_SIZE as u64);
        self.map_region(va, pages, RegionKind::Data, flags, alloc)?;
        Ok(va)
    }

    /// Frees a range previously returned by [`alloc`](Self::alloc) /
    /// [`alloc_at`](Self::alloc_at). `size` must match the original
    /// request.
    pub fn free(
        &mut self,
        va: VirtAddr,
        size: u64,
        dealloc: &mut impl FrameDeallocator,
        cow: &mut CowTracker,
    ) -> Result<(), VmmError> {
        let pages = size.div_ceil(PAGE_SIZE as u64);
        match self.regions.find(va) {
            Some(region) if region.start == va && region.page_count() == pages => {}
            Some(_) => return Err(VmmError::InvalidArgument),
            None => return Err(VmmError::NoRegion),
        }
        self.unmap_region(va, dealloc, cow)?;
        if va + pages * PAGE_SIZE as u64 == self.brk {
            self.brk = va;
        }
        Ok(())
    }

    /// Classic break adjustment. Returns the previous break.
    ///
    /// Growth maps zero-filled pages; shrinking unmaps from the tail
    /// heap region. The break never crosses the stack reserve.
    pub fn sbrk(
        &mut self,
        delta: i64,
        alloc: &mut (impl FrameAllocator + FrameDeallocator),
        cow: &mut CowTracker,
    ) -> Result<VirtAddr, VmmError> {
        let old_brk = self.brk;
        if delta == 0 {
            return Ok(old_brk);
        }

        if delta > 0 {
            let base = old_brk.align_up(PAGE_SIZE as u64);
            let new_brk = old_brk + delta as u64;
            if new_brk > self.heap_ceiling {
                return Err(VmmError::NoSpace);
            }
            let new_end = new_brk.align_up(PAGE_SIZE as u64);
            let pages = (new_end - base) / PAGE_SIZE as u64;
            if pages > 0 {
                self.map_region(base, pages, RegionKind::Heap, self.default_data_flags(), alloc)?;
            }
            self.brk = new_brk;
        } else {
            let shrink = (-delta) as u64;
            if shrink > old_brk - self.heap_start {
                return Err(VmmError::InvalidArgument);
            }
            let new_brk = VirtAddr::new(old_brk.as_u64() - shrink);
            let keep_end = new_brk.align_up(PAGE_SIZE as u64);
            let drop_end = old_brk.align_up(PAGE_SIZE as u64);
            let mut va = keep_end;
            while va < drop_end {
                if let Ok(frame) = self.unmap_page(va) {
                    if cow.release(frame.start_address()) {
                        // SAFETY: Last holder of an unmapped frame.
                        unsafe { alloc.deallocate_frame(frame) };
                    }
                }
                va += PAGE_SIZE as u64;
            }
            self.trim_heap_regions(keep_end);
            self.brk = new_brk;
        }
        Ok(old_brk)
    }

    // -----------------------------------------------------------------
    // Fork and fault handling
    // -----------------------------------------------------------------

    /// Clones this space for a child process.
    ///
    /// Every region is copied. Present pages of private writable
    /// regions are remapped read-only in both spaces and marked COW
    /// with a bumped share count; shared and read-only regions simply
    /// map the same frames. The caller flushes the TLB afterwards
    /// (the remaps touched live parent mappings).
    pub fn fork(
        &mut self,
        kernel_root: Option<PhysAddr>,
        alloc: &mut impl FrameAllocator,
        cow: &mut CowTracker,
    ) -> Result<AddressSpace, VmmError> {
        let mut child = AddressSpace::new_user(self.walker, kernel_root, alloc)?;
        child.heap_start = self.heap_start;
        child.heap_ceiling = self.heap_ceiling;
        child.brk = self.brk;

        let regions: Vec<Region> = self.regions.iter().copied().collect();
        for mut region in regions {
            let make_cow = region.kind != RegionKind::Shared
                && region.flags.contains(MapFlags::WRITABLE);
            region.cow = make_cow || region.cow;
            child.regions.insert(region)?;
            if make_cow {
                if let Some(own) = self.regions.find_mut(region.start) {
                    own.cow = true;
                }
            }

            let ro_native = {
                let mut native = region.flags.to_native();
                if make_cow {
                    native.remove(PageTableFlags::WRITABLE);
                }
                native
            };

            for i in 0..region.page_count() {
                let va = region.start + i * PAGE_SIZE as u64;
                // SAFETY: The space owns its root table.
                let frame = match unsafe { self.walker.translate(self.root, va) } {
                    TranslateResult::Page4KiB { frame, .. } => frame,
                    _ => continue, // lazy page, nothing to share
                };

                if make_cow {
                    // SAFETY: The page is mapped; only flags change.
                    unsafe {
                        self.walker
                            .update_flags_4k(self.root, va, ro_native)
                            .map_err(|_| VmmError::NotMapped)?;
                    }
                }
                // Every frame now has two holders, COW candidates and
                // plain shared/read-only pages alike, so teardown
                // frees it exactly once.
                cow.share(frame.start_address());

                // SAFETY: Child root is fresh; intermediates from alloc.
                unsafe {
                    child
                        .walker
                        .map_4k(child.root, va, frame.start_address(), ro_native, &mut || {
                            alloc.allocate_frame()
                        })
                        .map_err(|_| VmmError::OutOfMemory)?;
                }
            }
        }

        Ok(child)
    }

    /// Resolves a page fault against this space (spec'd COW handling).
    ///
    /// Returns [`FaultResolution::Resolved`] only for a write to a
    /// present page of a COW region; every other fault is fatal to the
    /// task.
    pub fn handle_page_fault(
        &mut self,
        addr: VirtAddr,
        code: PageFaultErrorCode,
        alloc: &mut impl FrameAllocator,
        cow: &mut CowTracker,
    ) -> FaultResolution {
        let page = addr.align_down(PAGE_SIZE as u64);
        let (region_flags, is_cow) = match self.regions.find(addr) {
            Some(region) => (region.flags, region.cow),
            None => return FaultResolution::Fatal,
        };

        let cow_write = is_cow
            && code.contains(PageFaultErrorCode::WRITE)
            && code.contains(PageFaultErrorCode::PRESENT);
        if !cow_write {
            return FaultResolution::Fatal;
        }

        // SAFETY: The space owns its root table.
        let old_frame = match unsafe { self.walker.translate(self.root, page) } {
            TranslateResult::Page4KiB { frame, .. } => frame,
            _ => return FaultResolution::Fatal,
        };

        let writable_native = region_flags.to_native();

        if cow.is_shared(old_frame.start_address()) {
            let Some(new_frame) = alloc.allocate_frame() else {
                return FaultResolution::Fatal;
            };
            // SAFETY: Both frames are HHDM-visible; the new frame is
            // exclusively ours.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.walker.phys_to_virt(old_frame.start_address()),
                    self.walker.phys_to_virt(new_frame.start_address()),
                    PAGE_SIZE,
                );
                if self.walker.unmap_4k(self.root, page).is_err() {
                    return FaultResolution::Fatal;
                }
                if self
                    .walker
                    .map_4k(
                        self.root,
                        page,
                        new_frame.start_address(),
                        writable_native,
                        &mut || alloc.allocate_frame(),
                    )
                    .is_err()
                {
                    return FaultResolution::Fatal;
                }
            }
            cow.release(old_frame.start_address());
            MapFlush::new(page).flush();
        } else {
            // Last holder: make the page writable in place.
            // SAFETY: The page is mapped; only flags change.
            if unsafe { self.walker.update_flags_4k(self.root, page, writable_native) }.is_err() {
                return FaultResolution::Fatal;
            }
            MapFlush::new(page).flush();
        }

        FaultResolution::Resolved
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Destroys the space: unmaps every region (freeing frames the
    /// space owns), frees the user-half paging structures, and finally
    /// the PML4 itself.
    pub fn teardown(
        mut self,
        dealloc: &mut impl FrameDeallocator,
        cow: &mut CowTracker,
    ) {
        let starts: Vec<VirtAddr> = self.regions.iter().map(|r| r.start).collect();
        for start in starts {
            let _ = self.unmap_region(start, dealloc, cow);
        }
        // SAFETY: All leaf pages are gone and the root is not loaded.
        unsafe {
            self.walker
                .free_user_tables(self.root, &mut |frame| dealloc.deallocate_frame(frame));
            dealloc.deallocate_frame(PhysFrame::containing_address(self.root));
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn adjust_flags(&self, flags: MapFlags) -> MapFlags {
        match self.kind {
            AddressSpaceKind::User => flags | MapFlags::USER,
            AddressSpaceKind::Kernel => flags - MapFlags::USER,
        }
    }

    fn default_data_flags(&self) -> MapFlags {
        match self.kind {
            AddressSpaceKind::User => MapFlags::USER_DATA,
            AddressSpaceKind::Kernel => MapFlags::KERNEL_DATA,
        }
    }

    fn zero_frame(&self, frame: PhysFrame<Size4KiB>) {
        // SAFETY: Freshly allocated frame, HHDM-visible.
        unsafe {
            core::ptr::write_bytes(self.walker.phys_to_virt(frame.start_address()), 0, PAGE_SIZE);
        }
    }

    /// Drops or shrinks heap regions above `keep_end` after a shrink.
    fn trim_heap_regions(&mut self, keep_end: VirtAddr) {
        let starts: Vec<VirtAddr> = self
            .regions
            .iter()
            .filter(|r| r.kind == RegionKind::Heap && r.end > keep_end)
            .map(|r| r.start)
            .collect();
        for start in starts {
            if start >= keep_end {
                self.regions.remove(start);
            } else if let Some(region) = self.regions.find_mut(start) {
                region.end = keep_end;
            }
        }
    }
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

    fn write_byte(arena: &Arena, space: &AddressSpace, va: VirtAddr, value: u8) {
        let phys = space.translate(va).expect("page not mapped");
        let ptr = (arena.hhdm() + phys.as_u64()) as *mut u8;
        // SAFETY: The frame lives inside the arena.
        unsafe { ptr.write(value) };
    }

    fn read_byte(arena: &Arena, space: &AddressSpace, va: VirtAddr) -> u8 {
        let phys = space.translate(va).expect("page not mapped");
        let ptr = (arena.hhdm() + phys.as_u64()) as *const u8;
        // SAFETY: The frame lives inside the arena.
        unsafe { ptr.read() }
    }

    #[test]
    fn map_translate_unmap() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);

        let virt = VirtAddr::new(0x40_0000);
        let frame = PhysFrame::containing_address(PhysAddr::new(0x20_0000));
        space
            .map_page(virt, frame, MapFlags::USER_DATA, &mut alloc)
            .unwrap()
            .ignore();
        assert_eq!(space.translate(virt), Some(PhysAddr::new(0x20_0000)));

        space.unmap_page(virt).unwrap();
        assert!(!space.is_mapped(virt));
    }

    #[test]
    fn map_range_rolls_back_on_exhaustion() {
        // 4 frames: PML4 + PDPT + PD + one PT. The second page crosses
        // into the next 2 MiB window and needs a PT that cannot be
        // allocated any more.
        let arena = Arena::new(4);
        let (mut space, mut alloc) = fresh_space(&arena);

        let virt = VirtAddr::new(0x3F_F000);
        let result = space.map_range(
            virt,
            PhysAddr::new(0x10_0000),
            2,
            MapFlags::USER_DATA,
            &mut alloc,
        );
        assert_eq!(result, Err(VmmError::OutOfMemory));
        // The first page was rolled back.
        assert!(!space.is_mapped(virt));
    }

    #[test]
    fn map_region_rolls_back_on_exhaustion() {
        // Room for the paging structures plus a few leaf frames only.
        let arena = Arena::new(8);
        let (mut space, mut alloc) = fresh_space(&arena);

        let virt = VirtAddr::new(0x40_0000);
        let live_before = alloc.live;
        let result = space.map_region(
            virt,
            32,
            RegionKind::Data,
            MapFlags::USER_DATA,
            &mut alloc,
        );
        assert_eq!(result, Err(VmmError::OutOfMemory));
        assert!(space.regions().is_empty());
        assert!(!space.is_mapped(virt));
        // Leaf frames were returned; only intermediates stay allocated.
        assert_eq!(alloc.live, live_before + 3);
    }

    #[test]
    fn identity_map_and_range_check() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);

        space
            .identity_map(PhysAddr::new(0x10_0000), 4, MapFlags::KERNEL_DATA, &mut alloc)
            .unwrap();
        assert!(space.is_range_mapped(VirtAddr::new(0x10_0000), 4));
        assert!(!space.is_range_mapped(VirtAddr::new(0x10_0000), 5));
    }

    #[test]
    fn alloc_free_leaves_accounting_unchanged() {
        let arena = Arena::new(128);
        let (mut space, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        // Warm up: the first allocation also creates intermediate tables.
        let va = space.alloc(3 * PAGE, &mut alloc).unwrap();
        space.free(va, 3 * PAGE, &mut alloc, &mut cow).unwrap();

        let live_before = alloc.live;
        let regions_before = space.regions().len();

        let va = space.alloc(3 * PAGE, &mut alloc).unwrap();
        assert!(space.is_range_mapped(va, 3));
        space.free(va, 3 * PAGE, &mut alloc, &mut cow).unwrap();

        assert_eq!(alloc.live, live_before);
        assert_eq!(space.regions().len(), regions_before);
        assert!(!space.is_mapped(va));
    }

    #[test]
    fn alloc_zero_fills() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);

        let va = space.alloc(PAGE, &mut alloc).unwrap();
        for offset in [0u64, 1, 0xFFF] {
            assert_eq!(read_byte(&arena, &space, va + offset), 0);
        }
    }

    #[test]
    fn alloc_at_conflicts_with_existing_region() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);

        let va = VirtAddr::new(0x50_0000);
        space
            .alloc_at(va, 2 * PAGE, MapFlags::USER_DATA, &mut alloc)
            .unwrap();
        assert_eq!(
            space.alloc_at(va + PAGE, PAGE, MapFlags::USER_DATA, &mut alloc),
            Err(VmmError::RegionOverlap)
        );
    }

    #[test]
    fn sbrk_grow_and_shrink() {
        let arena = Arena::new(128);
        let (mut space, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let base = space.brk();
        let old = space.sbrk(2 * PAGE as i64, &mut alloc, &mut cow).unwrap();
        assert_eq!(old, base);
        assert_eq!(space.brk(), base + 2 * PAGE);
        assert!(space.is_range_mapped(base, 2));

        let old = space.sbrk(-(PAGE as i64), &mut alloc, &mut cow).unwrap();
        assert_eq!(old, base + 2 * PAGE);
        assert_eq!(space.brk(), base + PAGE);
        assert!(space.is_mapped(base));
        assert!(!space.is_mapped(base + PAGE));
    }

    #[test]
    fn sbrk_zero_reports_break() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let brk = space.brk();
        assert_eq!(space.sbrk(0, &mut alloc, &mut cow).unwrap(), brk);
    }

    #[test]
    fn sbrk_respects_stack_reserve() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let huge = (layout::USER_HEAP_CEILING - layout::USER_HEAP_BASE + PAGE) as i64;
        assert_eq!(
            space.sbrk(huge, &mut alloc, &mut cow),
            Err(VmmError::NoSpace)
        );
    }

    #[test]
    fn fork_preserves_contents() {
        let arena = Arena::new(256);
        let (mut parent, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let va = parent.alloc(PAGE, &mut alloc).unwrap();
        write_byte(&arena, &parent, va, 0xAA);

        let child = parent
            .fork(None, &mut alloc, &mut cow)
            .expect("fork failed");

        // Both spaces observe identical contents in every region.
        assert_eq!(read_byte(&arena, &child, va), 0xAA);
        assert_eq!(read_byte(&arena, &parent, va), 0xAA);
        // Same physical frame until one of them writes.
        assert_eq!(parent.translate(va), child.translate(va));
        assert!(child.regions().find(va).unwrap().cow);
        assert!(parent.regions().find(va).unwrap().cow);
    }

    #[test]
    fn cow_write_isolates_child_from_parent() {
        let arena = Arena::new(256);
        let (mut parent, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let va = parent.alloc(PAGE, &mut alloc).unwrap();
        write_byte(&arena, &parent, va, 0xAA);

        let mut child = parent.fork(None, &mut alloc, &mut cow).unwrap();

        // Child write: present-page write fault on a COW region.
        let code = PageFaultErrorCode::PRESENT
            | PageFaultErrorCode::WRITE
            | PageFaultErrorCode::USER;
        assert_eq!(
            child.handle_page_fault(va, code, &mut alloc, &mut cow),
            FaultResolution::Resolved
        );
        assert_ne!(parent.translate(va), child.translate(va));

        write_byte(&arena, &child, va, 0xBB);
        assert_eq!(read_byte(&arena, &child, va), 0xBB);
        assert_eq!(read_byte(&arena, &parent, va), 0xAA);
    }

    #[test]
    fn cow_last_holder_skips_copy() {
        let arena = Arena::new(256);
        let (mut parent, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let va = parent.alloc(PAGE, &mut alloc).unwrap();
        write_byte(&arena, &parent, va, 0x55);
        let original_phys = parent.translate(va);

        let mut child = parent.fork(None, &mut alloc, &mut cow).unwrap();
        let code = PageFaultErrorCode::PRESENT
            | PageFaultErrorCode::WRITE
            | PageFaultErrorCode::USER;

        // Child copies; parent is then the last holder.
        child.handle_page_fault(va, code, &mut alloc, &mut cow);
        assert_eq!(
            parent.handle_page_fault(va, code, &mut alloc, &mut cow),
            FaultResolution::Resolved
        );
        // Parent kept its frame, no second copy.
        assert_eq!(parent.translate(va), original_phys);
        assert_eq!(read_byte(&arena, &parent, va), 0x55);
    }

    #[test]
    fn fault_outside_any_region_is_fatal() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let code = PageFaultErrorCode::WRITE | PageFaultErrorCode::USER;
        assert_eq!(
            space.handle_page_fault(VirtAddr::new(0xdead_0000), code, &mut alloc, &mut cow),
            FaultResolution::Fatal
        );
    }

    #[test]
    fn non_cow_write_fault_is_fatal() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);
        let mut cow = CowTracker::new();

        let va = space.alloc(PAGE, &mut alloc).unwrap();
        let code = PageFaultErrorCode::PRESENT
            | PageFaultErrorCode::WRITE
            | PageFaultErrorCode::USER;
        // Region exists but is not COW: protection fault, fatal.
        assert_eq!(
            space.handle_page_fault(va, code, &mut alloc, &mut cow),
            FaultResolution::Fatal
        );
    }

    #[test]
    fn protect_range_strips_writable() {
        let arena = Arena::new(64);
        let (mut space, mut alloc) = fresh_space(&arena);

        let va = space.alloc(2 * PAGE, &mut alloc).unwrap();
        space.protect_range(va, 2, MapFlags::USER).unwrap();

        // SAFETY: The space owns its root.
        match unsafe { space.walker.translate(space.root, va) } {
            TranslateResult::Page4KiB { flags, .. } => {
                assert!(!flags.contains(PageTableFlags::WRITABLE));
                assert!(flags.contains(PageTableFlags::USER));
            }
            other => panic!("unexpected translation: {other:?}"),
        }
    }

    #[test]
    fn teardown_returns_every_frame() {
        let arena = Arena::new(256);
        let mut alloc = CountingAlloc::new(&arena);
        let mut cow = CowTracker::new();

        let mut space = AddressSpace::new_user(arena.walker(), None, &mut alloc).unwrap();
        space.alloc(4 * PAGE, &mut alloc).unwrap();
        space
            .alloc_at(
                VirtAddr::new(0x60_0000),
                2 * PAGE,
                MapFlags::USER_DATA,
                &mut alloc,
            )
            .unwrap();

        space.teardown(&mut alloc, &mut cow);
        assert_eq!(alloc.live, 0, "teardown leaked frames");
    }

    #[test]
    fn fork_then_teardown_frees_shared_frames_once() {
        let arena = Arena::new(256);
        let mut alloc = CountingAlloc::new(&arena);
        let mut cow = CowTracker::new();

        let mut parent = AddressSpace::new_user(arena.walker(), None, &mut alloc).unwrap();
        parent.alloc(2 * PAGE, &mut alloc).unwrap();

        let child = parent.fork(None, &mut alloc, &mut cow).unwrap();
        child.teardown(&mut alloc, &mut cow);
        parent.teardown(&mut alloc, &mut cow);

        assert_eq!(alloc.live, 0, "shared frames double-freed or leaked");
        assert!(cow.is_empty());
    }
}
