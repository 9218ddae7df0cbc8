//! Control register access.

use core::arch::asm;

use quark_core::addr::{PhysAddr, VirtAddr};

/// CR2: the faulting address of the last page fault.
pub struct Cr2;

impl Cr2 {
    /// Reads the faulting virtual address.
    pub fn read() -> VirtAddr {
        let value: u64;
        // SAFETY: Reading CR2 has no side effects.
        unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
        VirtAddr::new_truncate(value)
    }
}

/// CR3: the physical address of the active PML4.
pub struct Cr3;

impl Cr3 {
    /// Reads the active page table root.
    pub fn read() -> PhysAddr {
        let value: u64;
        // SAFETY: Reading CR3 has no side effects.
        unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
        PhysAddr::new(value & !0xFFF)
    }

    /// Loads a new page table root, flushing non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid PML4 whose kernel half matches the
    /// currently executing code's expectations.
    pub unsafe fn write(root: PhysAddr) {
        // SAFETY: Per this function's contract.
        unsafe { asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack)) };
    }
}
