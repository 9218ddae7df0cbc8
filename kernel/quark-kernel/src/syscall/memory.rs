//! Memory syscall handlers: mmap, munmap, mprotect, brk.

use quark_core::addr::VirtAddr;
use quark_mm::mapper::MapFlags;
use quark_mm::region::RegionKind;
use quark_mm::{PAGE_SIZE, VmmError, layout};
use quark_syscall::{
    EFAULT, EINVAL, ENOMEM, MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, PROT_EXEC,
    PROT_WRITE,
};

use crate::mm::{KernelFrameAlloc, cow_with};
use crate::proc::current_process;

fn vmm_errno(e: VmmError) -> isize {
    match e {
        VmmError::OutOfMemory | VmmError::NoSpace => -ENOMEM,
        VmmError::NotMapped | VmmError::NoRegion => -EFAULT,
        _ => -EINVAL,
    }
}

fn prot_to_flags(prot: u64) -> MapFlags {
    let mut flags = MapFlags::USER;
    if prot & PROT_WRITE != 0 {
        flags |= MapFlags::WRITABLE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= MapFlags::EXECUTABLE;
    }
    flags
}

/// Runs `f` with the current process's address space.
fn with_space<R>(
    f: impl FnOnce(&mut quark_mm::address_space::AddressSpace) -> Result<R, isize>,
) -> Result<R, isize> {
    let process = current_process().ok_or(-EFAULT)?;
    let mut space = process.space.lock();
    let space = space.as_mut().ok_or(-EFAULT)?;
    f(space)
}

pub(super) fn sys_mmap(addr: usize, len: usize, prot: usize, flags: usize) -> isize {
    let flags = flags as u64;
    if len == 0 || flags & MAP_ANONYMOUS == 0 {
        return -EINVAL;
    }
    // Exactly one sharing mode.
    let shared = flags & MAP_SHARED != 0;
    let private = flags & MAP_PRIVATE != 0;
    if shared == private {
        return -EINVAL;
    }

    let map_flags = prot_to_flags(prot as u64);
    let kind = if shared {
        RegionKind::Shared
    } else {
        RegionKind::Data
    };
    let pages = (len as u64).div_ceil(PAGE_SIZE as u64);

    let result = with_space(|space| {
        let base = if flags & MAP_FIXED != 0 {
            let base = VirtAddr::new_truncate(addr as u64);
            if !base.is_aligned(PAGE_SIZE as u64)
                || !base.is_user()
                || base.as_u64() < layout::USER_IMAGE_FLOOR
            {
                return Err(-EINVAL);
            }
            base
        } else {
            // Non-fixed placements advance from the current break.
            space.brk().align_up(PAGE_SIZE as u64)
        };

        space
            .map_region(base, pages, kind, map_flags, &mut KernelFrameAlloc)
            .map_err(vmm_errno)?;
        if flags & MAP_FIXED == 0 {
            space.bump_brk(base + pages * PAGE_SIZE as u64);
        }
        Ok(base.as_u64() as isize)
    });

    match result {
        Ok(base) => base,
        Err(e) => e,
    }
}

pub(super) fn sys_munmap(addr: usize, len: usize) -> isize {
    let base = VirtAddr::new_truncate(addr as u64);
    if !base.is_aligned(PAGE_SIZE as u64) || len == 0 {
        return -EINVAL;
    }
    let result = with_space(|space| {
        cow_with(|cow| {
            space
                .free(base, len as u64, &mut KernelFrameAlloc, cow)
                .map_err(vmm_errno)
        })
    });
    match result {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_mprotect(addr: usize, len: usize, prot: usize) -> isize {
    let base = VirtAddr::new_truncate(addr as u64);
    if !base.is_aligned(PAGE_SIZE as u64) || len == 0 {
        return -EINVAL;
    }
    let flags = prot_to_flags(prot as u64);
    let pages = (len as u64).div_ceil(PAGE_SIZE as u64);

    let result = with_space(|space| {
        // Keep the region record in sync when the range is a whole
        // region; otherwise just rewrite the PTEs.
        match space.protect_region(base, flags) {
            Ok(()) => Ok(()),
            Err(VmmError::NoRegion) => space.protect_range(base, pages, flags).map_err(vmm_errno),
            Err(e) => Err(vmm_errno(e)),
        }
    });
    match result {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_brk(addr: usize) -> isize {
    let result = with_space(|space| {
        let current = space.brk().as_u64();
        if addr == 0 {
            return Ok(current as isize);
        }
        let target = addr as u64;
        if target >= layout::USER_HEAP_CEILING {
            return Err(-ENOMEM);
        }
        let delta = target as i64 - current as i64;
        cow_with(|cow| space.sbrk(delta, &mut KernelFrameAlloc, cow)).map_err(vmm_errno)?;
        Ok(space.brk().as_u64() as isize)
    });
    match result {
        Ok(v) => v,
        Err(e) => e,
    }
}
