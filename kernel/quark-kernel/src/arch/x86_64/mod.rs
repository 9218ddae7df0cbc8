//! x86-64 architecture layer.
//!
//! GDT/TSS, the IDT with exception and `int 0x80` gates, control
//! register access, TLB maintenance, the context-switch primitive, and
//! ring-3 entry.

pub mod context;
pub mod control;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod syscall_entry;
pub mod tlb;
pub mod userspace;

/// Initializes the CPU tables: GDT + TSS, then the IDT.
///
/// # Safety
///
/// Must run once on the boot CPU before interrupts are enabled.
pub unsafe fn cpu_init() {
    // SAFETY: Boot-time, single CPU, per this function's contract.
    unsafe {
        gdt::init();
        idt::init();
    }
    quark_mm::mapper::register_tlb_flush(tlb::flush_page);
}
