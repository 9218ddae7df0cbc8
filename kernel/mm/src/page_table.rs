//! x86-64 page table structures.
//!
//! Entry layout and flags for the 4-level tree (PML4 → PDPT → PD → PT).
//! The walking logic lives in [`crate::walker`].

use quark_core::addr::PhysAddr;

/// Physical address bits of a page table entry (bits 12..51).
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from ring 3.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY         = 1 << 6;
        /// PS bit: 2 MiB page in a PD entry, 1 GiB page in a PDPT entry.
        const HUGE_PAGE     = 1 << 7;
        /// Not flushed on CR3 switch (requires CR4.PGE).
        const GLOBAL        = 1 << 8;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Page fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT           = 1 << 0;
        /// The faulting access was a write.
        const WRITE             = 1 << 1;
        /// The fault happened in user mode.
        const USER              = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED_WRITE    = 1 << 3;
        /// The fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A single 64-bit page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// A cleared (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry pointing at `phys` with `flags`.
    pub const fn new(phys: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Whether the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Physical address this entry points at.
    pub const fn address(self) -> PhysAddr {
        // SAFETY: The masked value fits in 52 bits.
        unsafe { PhysAddr::new_unchecked(self.0 & ADDR_MASK) }
    }

    /// Flag bits of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Whether this entry maps a huge page (PS bit).
    pub const fn is_huge(self) -> bool {
        self.0 & (1 << 7) != 0
    }
}

/// A 4 KiB page table of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// Entry array.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_not_present() {
        let e = PageTableEntry::empty();
        assert!(!e.is_present());
        assert_eq!(e.address().as_u64(), 0);
    }

    #[test]
    fn address_and_flags_disjoint() {
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        let e = PageTableEntry::new(PhysAddr::new(0x1234_5000), flags);
        assert_eq!(e.address().as_u64(), 0x1234_5000);
        assert_eq!(e.flags(), flags);
        assert_eq!(e.flags().bits() & ADDR_MASK, 0);
    }

    #[test]
    fn huge_bit() {
        let e = PageTableEntry::new(
            PhysAddr::new(0x20_0000),
            PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
        );
        assert!(e.is_huge());
        assert!(!PageTableEntry::empty().is_huge());
    }

    #[test]
    fn fault_code_bits() {
        let code = PageFaultErrorCode::from_bits_truncate(0b111);
        assert!(code.contains(PageFaultErrorCode::PRESENT));
        assert!(code.contains(PageFaultErrorCode::WRITE));
        assert!(code.contains(PageFaultErrorCode::USER));
        assert!(!code.contains(PageFaultErrorCode::INSTRUCTION_FETCH));
    }

    #[test]
    fn table_is_page_sized() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
