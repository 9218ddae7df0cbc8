//! Architecture-independent mapping flags and TLB flush plumbing.
//!
//! [`MapFlags`] describe a mapping without x86 encoding details;
//! [`MapFlush`] is a pending single-page TLB invalidation. The actual
//! flush instruction is registered at boot via [`register_tlb_flush`];
//! before registration (and in host tests) flushes are no-ops.

use core::sync::atomic::{AtomicPtr, Ordering};

use quark_core::addr::VirtAddr;

use crate::page_table::PageTableFlags;

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Mapping is writable.
        const WRITABLE      = 1 << 0;
        /// Mapping is executable (unset implies no-execute).
        const EXECUTABLE    = 1 << 1;
        /// Mapping is accessible from user mode.
        const USER          = 1 << 2;
        /// Survives address-space switches.
        const GLOBAL        = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 5;
    }
}

impl MapFlags {
    /// Kernel code: global, read-only, executable.
    pub const KERNEL_CODE: Self = Self::GLOBAL.union(Self::EXECUTABLE);
    /// Kernel data: global, writable, never executable.
    pub const KERNEL_DATA: Self = Self::GLOBAL.union(Self::WRITABLE);
    /// User code: executable, read-only.
    pub const USER_CODE: Self = Self::USER.union(Self::EXECUTABLE);
    /// User data: writable, never executable.
    pub const USER_DATA: Self = Self::USER.union(Self::WRITABLE);
    /// Memory-mapped I/O registers.
    pub const MMIO: Self = Self::WRITABLE
        .union(Self::GLOBAL)
        .union(Self::CACHE_DISABLE)
        .union(Self::WRITE_THROUGH);
    /// Framebuffer memory.
    pub const FRAMEBUFFER: Self = Self::WRITABLE
        .union(Self::GLOBAL)
        .union(Self::CACHE_DISABLE);

    /// Converts to the x86-64 page table encoding.
    ///
    /// PRESENT is always set; NO_EXECUTE is set unless the mapping is
    /// executable.
    pub fn to_native(self) -> PageTableFlags {
        let mut native = PageTableFlags::PRESENT;
        if self.contains(Self::WRITABLE) {
            native |= PageTableFlags::WRITABLE;
        }
        if !self.contains(Self::EXECUTABLE) {
            native |= PageTableFlags::NO_EXECUTE;
        }
        if self.contains(Self::USER) {
            native |= PageTableFlags::USER;
        }
        if self.contains(Self::GLOBAL) {
            native |= PageTableFlags::GLOBAL;
        }
        if self.contains(Self::CACHE_DISABLE) {
            native |= PageTableFlags::CACHE_DISABLE;
        }
        if self.contains(Self::WRITE_THROUGH) {
            native |= PageTableFlags::WRITE_THROUGH;
        }
        native
    }

    /// Recovers map flags from a native entry (PRESENT is dropped).
    pub fn from_native(native: PageTableFlags) -> Self {
        let mut flags = Self::empty();
        if native.contains(PageTableFlags::WRITABLE) {
            flags |= Self::WRITABLE;
        }
        if !native.contains(PageTableFlags::NO_EXECUTE) {
            flags |= Self::EXECUTABLE;
        }
        if native.contains(PageTableFlags::USER) {
            flags |= Self::USER;
        }
        if native.contains(PageTableFlags::GLOBAL) {
            flags |= Self::GLOBAL;
        }
        if native.contains(PageTableFlags::CACHE_DISABLE) {
            flags |= Self::CACHE_DISABLE;
        }
        if native.contains(PageTableFlags::WRITE_THROUGH) {
            flags |= Self::WRITE_THROUGH;
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// Registered TLB flush
// ---------------------------------------------------------------------------

fn nop_flush(_virt: VirtAddr) {}

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as *mut ());

/// Registers the architecture TLB single-page flush (invlpg on x86-64).
///
/// Called once during early boot; until then flushes are no-ops, which
/// is sound because no stale entries can exist yet.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only `fn(VirtAddr)` values are ever stored.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// A pending TLB invalidation for one page.
///
/// Returned by every page-table mutation. The entry is flushed on drop
/// unless [`flush`](Self::flush) or [`ignore`](Self::ignore) is called
/// first; `ignore` is for fresh mappings that cannot be cached yet.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    pending: bool,
}

impl MapFlush {
    /// Creates a pending flush for `virt`.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            pending: true,
        }
    }

    /// Flushes the TLB entry now.
    pub fn flush(mut self) {
        self.pending = false;
        arch_flush_page(self.virt);
    }

    /// Discards the flush (fresh mapping, or batched elsewhere).
    pub fn ignore(mut self) {
        self.pending = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.pending {
            arch_flush_page(self.virt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_round_trip() {
        for flags in [
            MapFlags::USER_DATA,
            MapFlags::USER_CODE,
            MapFlags::KERNEL_DATA,
            MapFlags::MMIO,
            MapFlags::FRAMEBUFFER,
        ] {
            assert_eq!(MapFlags::from_native(flags.to_native()), flags);
        }
    }

    #[test]
    fn nx_follows_executable() {
        assert!(
            MapFlags::USER_DATA
                .to_native()
                .contains(PageTableFlags::NO_EXECUTE)
        );
        assert!(
            !MapFlags::USER_CODE
                .to_native()
                .contains(PageTableFlags::NO_EXECUTE)
        );
    }

    #[test]
    fn policy_constants() {
        assert!(MapFlags::KERNEL_CODE.contains(MapFlags::GLOBAL));
        assert!(!MapFlags::KERNEL_CODE.contains(MapFlags::WRITABLE));
        assert!(MapFlags::KERNEL_DATA.contains(MapFlags::WRITABLE));
        assert!(MapFlags::USER_DATA.contains(MapFlags::USER));
        assert!(MapFlags::MMIO.contains(MapFlags::CACHE_DISABLE));
        assert!(MapFlags::MMIO.contains(MapFlags::WRITE_THROUGH));
        assert!(MapFlags::FRAMEBUFFER.contains(MapFlags::CACHE_DISABLE));
        assert!(!MapFlags::FRAMEBUFFER.contains(MapFlags::WRITE_THROUGH));
    }

    #[test]
    fn flush_is_noop_without_registration() {
        // Must not crash: default flush fn is a no-op.
        MapFlush::new(VirtAddr::new(0x1000)).flush();
        MapFlush::new(VirtAddr::new(0x2000)).ignore();
        drop(MapFlush::new(VirtAddr::new(0x3000)));
    }
}
