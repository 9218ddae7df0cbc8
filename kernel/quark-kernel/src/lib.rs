//! The quark kernel runtime.
//!
//! Everything that needs a real machine under it: the x86-64 arch
//! layer (GDT/IDT, the `int 0x80` gate, context switching, ring-3
//! entry), boot handoff consumption, the global PMM / kernel heap /
//! address-space state, processes and threads, the scheduler runtime,
//! the console line discipline, and the syscall handlers.
//!
//! Policy and mechanism that do not require hardware live in the
//! sibling crates (`quark-mm`, `quark-fs`, `quark-sched`, `quark-elf`)
//! where they are exercised by host tests; this crate wires them to
//! the machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod console;
pub mod fs;
pub mod log;
pub mod mm;
pub mod panic;
pub mod proc;
pub mod sched;
pub mod syscall;
pub mod time;

pub use quark_core::log::LogLevel;
