//! GDT and TSS.
//!
//! Five descriptors plus the 16-byte TSS descriptor: kernel code/data,
//! user data/code (SYSRET-compatible ordering is kept even though entry
//! is `int 0x80`), and the TSS whose RSP0 field selects the kernel
//! stack used when ring 3 traps.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::size_of;

/// Kernel code selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DS: u16 = 0x10;
/// User data selector (RPL 3).
pub const USER_DS: u16 = 0x18 | 3;
/// User code selector (RPL 3).
pub const USER_CS: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SEL: u16 = 0x28;

/// 64-bit TSS.
#[repr(C, packed)]
struct Tss {
    _reserved0: u32,
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb_offset: u16,
}

struct CpuTables {
    gdt: UnsafeCell<[u64; 7]>,
    tss: UnsafeCell<Tss>,
}

// SAFETY: Only touched during single-CPU boot and from the scheduler
// with interrupts disabled.
unsafe impl Sync for CpuTables {}

static TABLES: CpuTables = CpuTables {
    gdt: UnsafeCell::new([0; 7]),
    tss: UnsafeCell::new(Tss {
        _reserved0: 0,
        rsp0: 0,
        rsp1: 0,
        rsp2: 0,
        _reserved1: 0,
        ist: [0; 7],
        _reserved2: 0,
        _reserved3: 0,
        iopb_offset: size_of::<Tss>() as u16,
    }),
};

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Access byte + flags for a 64-bit code segment.
const CODE64: u64 = 0x00AF_9A00_0000_FFFF;
/// Access byte + flags for a data segment.
const DATA64: u64 = 0x00CF_9200_0000_FFFF;
/// DPL-3 variant of [`CODE64`].
const CODE64_USER: u64 = CODE64 | (3 << 45);
/// DPL-3 variant of [`DATA64`].
const DATA64_USER: u64 = DATA64 | (3 << 45);

/// Builds the GDT, loads it, reloads the segment registers, and loads
/// the TSS.
///
/// # Safety
///
/// Boot-time only, single CPU.
pub unsafe fn init() {
    let tss_base = TABLES.tss.get() as u64;
    let tss_limit = (size_of::<Tss>() - 1) as u64;

    // SAFETY: Single-threaded boot; nothing else references the tables.
    let gdt = unsafe { &mut *TABLES.gdt.get() };
    gdt[0] = 0;
    gdt[1] = CODE64;
    gdt[2] = DATA64;
    gdt[3] = DATA64_USER;
    gdt[4] = CODE64_USER;
    // TSS descriptor, low half.
    gdt[5] = tss_limit
        | ((tss_base & 0xFF_FFFF) << 16)
        | (0x89u64 << 40)
        | ((tss_base >> 24) & 0xFF) << 56;
    // TSS descriptor, high half.
    gdt[6] = tss_base >> 32;

    let pointer = DescriptorPointer {
        limit: (size_of::<[u64; 7]>() - 1) as u16,
        base: gdt.as_ptr() as u64,
    };

    // SAFETY: The pointer references a live, correctly formed GDT; the
    // far return reloads CS, the moves reload the data selectors, LTR
    // activates the TSS.
    unsafe {
        asm!(
            "lgdt [{ptr}]",
            "push {kcs}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {kds:x}",
            "mov es, {kds:x}",
            "mov ss, {kds:x}",
            "xor eax, eax",
            "mov fs, ax",
            "mov gs, ax",
            "ltr {tss:x}",
            ptr = in(reg) &pointer,
            kcs = const KERNEL_CS as u64,
            kds = in(reg) KERNEL_DS as u64,
            tss = in(reg) TSS_SEL,
            tmp = lateout(reg) _,
            out("rax") _,
        );
    }
}

/// Points TSS.RSP0 at `stack_top`; ring-3 traps will switch to it.
///
/// Called by the scheduler on every switch to a user thread.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: Field write of an always-valid static; the CPU reads it
    // only when taking an interrupt from ring 3.
    unsafe {
        (*TABLES.tss.get()).rsp0 = stack_top;
    }
}
