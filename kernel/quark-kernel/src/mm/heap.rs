//! Kernel heap.
//!
//! A linked-list allocator over a fixed window of the kernel address
//! space, mapped eagerly at boot. Everything `alloc` in the kernel
//! comes from here.

use quark_core::addr::VirtAddr;
use quark_mm::mapper::MapFlags;
use quark_mm::{PAGE_SIZE, layout};

/// Pages mapped for the heap at boot: 4 MiB.
const INITIAL_HEAP_PAGES: u64 = 1024;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Maps the heap window with fresh frames and returns `(base, bytes)`.
///
/// Runs before the kernel [`AddressSpace`](quark_mm::address_space)
/// object exists (that needs the heap), so it drives the walker
/// directly against the live boot page tables.
///
/// # Safety
///
/// Boot-time only: the PMM must be initialized and the boot page
/// tables active.
pub unsafe fn map_initial_heap() -> (VirtAddr, u64) {
    use crate::arch::x86_64::control::Cr3;
    use quark_mm::FrameAllocator;

    let walker = super::walker();
    let root = Cr3::read();
    let base = VirtAddr::new(layout::KERNEL_HEAP_START);
    let flags = MapFlags::KERNEL_DATA.to_native();
    let mut alloc = super::KernelFrameAlloc;

    for i in 0..INITIAL_HEAP_PAGES {
        let frame = alloc
            .allocate_frame()
            .expect("out of memory mapping the kernel heap");
        let virt = base + i * PAGE_SIZE as u64;
        // SAFETY: CR3 is the live root; the heap window is reserved
        // for exactly this use.
        unsafe {
            walker
                .map_4k(root, virt, frame.start_address(), flags, &mut || {
                    super::pmm_with(|pmm| pmm.alloc())
                })
                .expect("out of memory mapping the kernel heap");
            core::ptr::write_bytes(walker.phys_to_virt(frame.start_address()), 0, PAGE_SIZE);
        }
    }

    (base, INITIAL_HEAP_PAGES * PAGE_SIZE as u64)
}

/// Maps the heap window and hands it to the allocator.
///
/// # Safety
///
/// Boot-time only, once, after the PMM is up.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    // SAFETY: Per this function's contract.
    let (base, size) = unsafe { map_initial_heap() };
    // SAFETY: The window was just mapped and zeroed, and is unused.
    unsafe {
        ALLOCATOR.lock().init(base.as_mut_ptr(), size as usize);
    }
}

/// Host builds: the host allocator serves `alloc`; nothing to set up.
#[cfg(not(target_os = "none"))]
pub unsafe fn init() {}
