//! Global memory management state.
//!
//! Owns the HHDM offset, the global PMM instance, the kernel address
//! space, the COW share table, and the page-fault entry point. The
//! mechanisms all live in `quark-mm`; this module binds them to the
//! machine and to the `static`-plus-accessor pattern the rest of the
//! kernel uses.

pub mod heap;

use core::sync::atomic::{AtomicU64, Ordering};

use quark_core::paging::{PhysFrame, Size4KiB};
use quark_core::sync::SpinLock;
use quark_core::{kdebug, kerror, kinfo};
use quark_mm::address_space::{AddressSpace, CowTracker, FaultResolution};
use quark_mm::page_table::PageFaultErrorCode;
use quark_mm::pmm::{BitmapPmm, PmmStats};
use quark_mm::walker::PageTableWalker;
use quark_mm::{FrameAllocator, FrameDeallocator, PhysMemoryRegion, PmmError};

use crate::arch::x86_64::control::{Cr2, Cr3};
use crate::arch::x86_64::idt::TrapFrame;
use crate::boot::BootInfo;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Global physical memory manager.
static PMM: SpinLock<Option<BitmapPmm>> = SpinLock::new(None);

/// Global COW share counts, spanning all address spaces.
static COW: SpinLock<CowTracker> = SpinLock::new(CowTracker::new());

/// The kernel's own address space (the boot page tables).
static KERNEL_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

/// Initializes PMM, kernel heap, and the kernel address space.
///
/// # Safety
///
/// Must run once during boot with the boot page tables active.
pub unsafe fn init(boot: &BootInfo<'_>) {
    HHDM_OFFSET.store(boot.hhdm_offset, Ordering::Release);

    // SAFETY: The boot memory map describes physical memory and the
    // HHDM offset is live; called once.
    let pmm = unsafe {
        BitmapPmm::new(boot.memory_map, boot.hhdm_offset).expect("PMM init failed")
    };
    {
        let mut global = PMM.lock();
        assert!(global.is_none(), "PMM already initialized");
        *global = Some(pmm);
    }

    // Heap next: everything past this point may allocate.
    // SAFETY: Called once, PMM is up, boot tables are active.
    unsafe { heap::init() };

    let walker = PageTableWalker::new(boot.hhdm_offset);
    // SAFETY: CR3 holds the live kernel PML4.
    let kernel_space = unsafe { AddressSpace::from_kernel_root(walker, Cr3::read()) };
    *KERNEL_SPACE.lock() = Some(kernel_space);

    let stats = stats();
    kinfo!(
        "mm: {} MiB usable, {} MiB free",
        stats.usable_frames * 4 / 1024,
        stats.free_frames * 4 / 1024
    );
}

/// The higher-half direct map offset.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// A walker bound to the live HHDM offset.
pub fn walker() -> PageTableWalker {
    PageTableWalker::new(hhdm_offset())
}

/// Runs `f` with the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn pmm_with<R>(f: impl FnOnce(&mut BitmapPmm) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Runs `f` with the global COW share table.
pub fn cow_with<R>(f: impl FnOnce(&mut CowTracker) -> R) -> R {
    f(&mut COW.lock())
}

/// Runs `f` with the kernel address space.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    let mut space = KERNEL_SPACE.lock();
    f(space.as_mut().expect("kernel space not initialized"))
}

/// Physical root of the kernel page tables (shared into every process).
pub fn kernel_root() -> quark_core::addr::PhysAddr {
    with_kernel_space(|s| s.root_phys())
}

/// Frees bootloader-reclaimable regions once boot data is consumed.
pub fn reclaim_bootloader_memory(regions: &[PhysMemoryRegion]) {
    let reclaimed = pmm_with(|pmm| pmm.reclaim_bootloader_memory(regions));
    kinfo!("mm: reclaimed {reclaimed} bootloader frames");
}

/// PMM counter snapshot.
pub fn stats() -> PmmStats {
    pmm_with(|pmm| pmm.stats())
}

/// Frame allocator handle over the global PMM.
///
/// Locks the PMM per call, so it must not be used while the PMM lock
/// is already held.
pub struct KernelFrameAlloc;

unsafe impl FrameAllocator for KernelFrameAlloc {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        pmm_with(|pmm| pmm.alloc())
    }
}

unsafe impl FrameDeallocator for KernelFrameAlloc {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        pmm_with(|pmm| match pmm.free(frame) {
            Ok(()) => {}
            Err(PmmError::DoubleFree) => {
                kerror!("pmm: double free of frame {}", frame.start_address());
            }
            Err(_) => {
                kerror!("pmm: free of invalid frame {}", frame.start_address());
            }
        });
    }
}

/// Page-fault entry, called from the exception dispatcher.
///
/// A write to a present page of a COW region is repaired and the task
/// resumes; any other user-mode fault kills the task; a kernel-mode
/// fault is fatal.
pub fn page_fault(frame: &mut TrapFrame) {
    let addr = Cr2::read();
    let code = PageFaultErrorCode::from_bits_truncate(frame.error);

    let resolved = crate::proc::try_current_process(|process| {
        let mut space = process.space.lock();
        let Some(space) = space.as_mut() else {
            return FaultResolution::Fatal;
        };
        cow_with(|cow| space.handle_page_fault(addr, code, &mut KernelFrameAlloc, cow))
    });

    match resolved {
        Some(FaultResolution::Resolved) => {
            kdebug!("mm: resolved COW fault at {addr}");
        }
        _ if frame.from_user() => {
            kerror!(
                "mm: unhandled user page fault at {addr} (error {:#x}), killing task",
                frame.error
            );
            crate::sched::exit_current(-1);
        }
        _ => {
            crate::panic::fatal(
                format_args!("kernel page fault at {addr} (error {:#x})", frame.error),
                Some(frame),
            );
        }
    }
}
