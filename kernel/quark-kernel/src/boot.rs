//! Boot handoff.
//!
//! The bootloader (an external collaborator) parks the kernel in long
//! mode with a higher-half direct map and hands over a physical memory
//! map plus the HHDM offset. [`kernel_init`] consumes that and brings
//! the subsystems up in dependency order; [`kernel_start`] enters the
//! scheduler and never returns.

use arrayvec::ArrayVec;

use quark_core::kinfo;
use quark_mm::{MemoryRegionKind, PhysMemoryRegion};

/// Largest memory map the handoff can stage without a heap.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Everything the kernel needs from the bootloader.
pub struct BootInfo<'a> {
    /// The physical memory map, page-aligned entries.
    pub memory_map: &'a [PhysMemoryRegion],
    /// Offset of the higher-half direct map.
    pub hhdm_offset: u64,
}

/// A memory map staged into a fixed-capacity buffer, used by boot
/// shims that must build [`BootInfo`] before the heap exists.
pub type StagedMemoryMap = ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS>;

/// Copies a bootloader memory map into the staging buffer, dropping
/// entries past the capacity (and warning once the log is up).
pub fn stage_memory_map(
    entries: impl Iterator<Item = PhysMemoryRegion>,
) -> StagedMemoryMap {
    let mut staged = StagedMemoryMap::new();
    for entry in entries {
        if staged.try_push(entry).is_err() {
            break;
        }
    }
    staged
}

/// Brings the kernel up: CPU tables, memory, logging, VFS, scheduler.
///
/// The timer, console, and keyboard collaborators should already be
/// registered (or may be registered right after); everything degrades
/// to no-ops until they are.
///
/// # Safety
///
/// Must be called exactly once, on the boot CPU, with the boot page
/// tables active and interrupts disabled.
pub unsafe fn kernel_init(boot: &BootInfo<'_>) {
    // SAFETY: Single boot CPU, called once.
    unsafe {
        crate::arch::x86_64::cpu_init();
        crate::mm::init(boot);
    }
    crate::log::init();
    kinfo!("quark: cpu and memory online");

    crate::fs::init();
    crate::sched::init(crate::time::frequency());

    // The map itself has been consumed; give the loader's buffers back.
    crate::mm::reclaim_bootloader_memory(boot.memory_map);
    kinfo!("quark: boot complete");
}

/// Hands the CPU to the scheduler; never returns.
///
/// # Safety
///
/// [`kernel_init`] must have completed; the boot stack is abandoned.
pub unsafe fn kernel_start() -> ! {
    // SAFETY: Per this function's contract.
    unsafe { crate::sched::start() }
}

/// Convenience predicate used by boot shims translating foreign
/// memory-map types.
pub fn is_reclaimable(kind: MemoryRegionKind) -> bool {
    matches!(
        kind,
        MemoryRegionKind::BootloaderReclaimable | MemoryRegionKind::AcpiReclaimable
    )
}
