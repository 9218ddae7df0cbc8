//! TLB maintenance.

use core::arch::asm;

use quark_core::addr::VirtAddr;

use super::control::Cr3;

/// Invalidates the TLB entry for one page.
pub fn flush_page(virt: VirtAddr) {
    // SAFETY: INVLPG only drops a TLB entry.
    unsafe { asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack)) };
}

/// Flushes all non-global TLB entries by reloading CR3.
pub fn flush_all() {
    // SAFETY: Writing back the current root is always valid.
    unsafe { Cr3::write(Cr3::read()) };
}
