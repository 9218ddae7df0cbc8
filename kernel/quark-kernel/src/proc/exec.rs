//! Loading user programs.
//!
//! Validates an ELF64 image, maps its segments and the user stack into
//! a fresh process's address space, and arms the main thread to enter
//! ring 3 at the image entry point.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use quark_core::id::Pid;
use quark_core::kinfo;
use quark_elf::{ElfError, ElfImage};
use quark_mm::loader::{LoadSegment, LoadedImage, load_image};
use quark_mm::{PAGE_SIZE, VmmError, layout};

use crate::mm::KernelFrameAlloc;
use crate::proc::{Process, process_alloc, proc_alloc, user_thread_entry};

/// Why an exec failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// The image failed ELF validation.
    Elf(ElfError),
    /// Mapping the image failed (out of memory, overlap).
    Vmm(VmmError),
}

impl From<ElfError> for ExecError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}

impl From<VmmError> for ExecError {
    fn from(e: VmmError) -> Self {
        Self::Vmm(e)
    }
}

/// Creates a process from a static ELF64 image and schedules its main
/// thread.
///
/// The load is all-or-nothing: on failure the fresh address space has
/// no new mappings and no frames are leaked.
pub fn spawn_user_process(name: &str, image: &[u8]) -> Result<Pid, ExecError> {
    let elf = ElfImage::parse(image)?;

    let process = process_alloc(name).map_err(ExecError::Vmm)?;
    let loaded = load_into(&process, &elf)?;

    let thread = proc_alloc(&process, name);
    thread.user_entry.store(loaded.entry.as_u64(), Ordering::Release);
    thread
        .user_stack
        .store(loaded.stack_top.as_u64(), Ordering::Release);
    thread.prepare_entry(user_thread_entry);
    crate::sched::add_thread(thread.tid, quark_sched::Priority::Normal);

    kinfo!(
        "exec: {} pid {} entry {} brk {}",
        name,
        process.pid,
        loaded.entry,
        loaded.brk
    );
    Ok(process.pid)
}

/// Maps the validated image and the user stack into `process`.
fn load_into(process: &Arc<Process>, elf: &ElfImage<'_>) -> Result<LoadedImage, ExecError> {
    let segments: Vec<LoadSegment<'_>> = elf
        .load_segments()
        .map(|seg| LoadSegment {
            vaddr: seg.vaddr,
            data: seg.data,
            memsz: seg.memsz,
            writable: seg.is_writable(),
            executable: seg.is_executable(),
        })
        .collect();

    let stack_pages = layout::USER_STACK_SIZE / PAGE_SIZE as u64;

    let mut space = process.space.lock();
    let space = space.as_mut().ok_or(ExecError::Vmm(VmmError::NoRegion))?;
    let loaded = load_image(
        space,
        quark_core::addr::VirtAddr::new(elf.entry_point()),
        &segments,
        stack_pages,
        &mut KernelFrameAlloc,
    )?;
    Ok(loaded)
}
