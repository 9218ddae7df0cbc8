//! Fixed virtual address layout.
//!
//! The user half follows the classic arrangement: a NULL guard below the
//! image base, code/data/heap growing upward from the load address, and
//! a fixed-size stack ending just below the canonical boundary.
//!
//! ```text
//! 0x0000_0000_0000_1000 .. USER_HEAP_BASE    unmapped (NULL guard)
//! USER_HEAP_BASE        .. brk               code / data / heap
//! USER_STACK_TOP - USER_STACK_SIZE
//!                       .. USER_STACK_TOP    initial user stack
//! USER_STACK_TOP        .. 2^47              unmapped
//! ```

use quark_core::addr::VirtAddr;

/// Lowest address user images may occupy; everything below is the NULL guard.
pub const USER_IMAGE_FLOOR: u64 = 0x1000;

/// Default base of the user heap when no image sets a break.
pub const USER_HEAP_BASE: u64 = 0x0000_0000_0100_0000;

/// Top of the initial user stack (exclusive).
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Size of the initial user stack: 8 MiB.
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// The user heap may grow up to this address (base of the stack reserve).
pub const USER_HEAP_CEILING: u64 = USER_STACK_TOP - USER_STACK_SIZE;

/// Base of the kernel heap window.
pub const KERNEL_HEAP_START: u64 = 0xFFFF_FFFF_9000_0000;

/// Size of the kernel heap window: 64 MiB.
pub const KERNEL_HEAP_SIZE: u64 = 64 * 1024 * 1024;

/// Returns the lowest address of the user stack.
pub fn user_stack_bottom() -> VirtAddr {
    VirtAddr::new(USER_STACK_TOP - USER_STACK_SIZE)
}

/// Returns the top of the user stack.
pub fn user_stack_top() -> VirtAddr {
    VirtAddr::new(USER_STACK_TOP)
}
