//! Processes and threads.
//!
//! A process owns identity, an address space, the descriptor table,
//! the cwd, and one or more threads; a thread owns a kernel stack and
//! the saved context the scheduler switches between. The global PID
//! and TID tables live here, as do `fork` and the transition into
//! user mode.

pub mod exec;

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use alloc::collections::BTreeMap;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use quark_core::id::{Pid, Tid};
use quark_core::sync::SpinLock;
use quark_core::{kdebug, kinfo};
use quark_fs::file::FdTable;
use quark_mm::VmmError;
use quark_mm::address_space::AddressSpace;

use crate::arch::x86_64::context::{ArchContext, prepare_stack};
use crate::arch::x86_64::control::Cr3;
use crate::arch::x86_64::idt::TrapFrame;
use crate::arch::x86_64::syscall_entry::user_frame_return;
use crate::arch::x86_64::{gdt, interrupts, userspace};
use crate::mm::{KernelFrameAlloc, cow_with, kernel_root, walker};

/// PIDs wrap below this bound.
pub const PID_MAX: u32 = 32768;

/// TIDs are masked to 24 bits.
pub const TID_MASK: u32 = 0x00FF_FFFF;

/// Kernel stack size per thread: 64 KiB.
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Being constructed.
    Embryo,
    /// Normal execution.
    Active,
    /// Has entered user mode via exec.
    Exec,
    /// Last thread exited; identity retained for the parent.
    Zombie,
}

/// Placeholder credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Creds {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// A process: resources shared by its threads.
pub struct Process {
    /// Unique process id.
    pub pid: Pid,
    /// Debug name.
    pub name: String,
    /// Parent pid (`None` for the first process).
    pub parent: Option<Pid>,
    /// Child pids.
    pub children: SpinLock<Vec<Pid>>,
    /// The user address space; taken out on exit for teardown.
    pub space: SpinLock<Option<AddressSpace>>,
    /// Open file descriptors.
    pub fd_table: SpinLock<FdTable>,
    /// Current working directory (absolute path).
    pub cwd: SpinLock<String>,
    /// Owner credentials.
    pub creds: SpinLock<Creds>,
    /// Lifecycle state.
    pub state: SpinLock<ProcState>,
    /// Exit status once the process dies.
    pub exit_status: SpinLock<Option<i32>>,
    /// Threads belonging to this process.
    pub threads: SpinLock<Vec<Tid>>,
}

/// A thread: the scheduling unit.
pub struct Thread {
    /// Unique thread id.
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    /// Debug name.
    pub name: String,
    /// Kernel stack; `u128` elements keep it 16-aligned.
    kernel_stack: Box<[u128]>,
    /// Saved context; only the scheduler touches it, interrupts off.
    context: UnsafeCell<ArchContext>,
    /// Entry point for a fresh user thread.
    pub user_entry: AtomicU64,
    /// Initial user stack pointer for a fresh user thread.
    pub user_stack: AtomicU64,
    /// Saved parent register image for a fork child's first return.
    pub fork_frame: SpinLock<Option<TrapFrame>>,
}

// SAFETY: `context` is only accessed by the scheduler inside its
// interrupts-off critical section; everything else is Sync already.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Top of the kernel stack (16-aligned, grows down).
    pub fn kernel_stack_top(&self) -> u64 {
        let range = self.kernel_stack.as_ptr_range();
        range.end as u64
    }

    /// Pointer to the saved context, for the context switch.
    pub(crate) fn context_ptr(&self) -> *mut ArchContext {
        self.context.get()
    }

    /// Lays the initial frames on the kernel stack so the first switch
    /// lands in `entry`.
    pub fn prepare_entry(&self, entry: extern "C" fn()) {
        // SAFETY: The stack is owned by this thread, which has never
        // run; the context cell is unobserved.
        unsafe {
            *self.context.get() = prepare_stack(self.kernel_stack_top() as *mut u8, entry);
        }
    }
}

// ---------------------------------------------------------------------------
// Global tables
// ---------------------------------------------------------------------------

/// Live processes, keyed by pid (doubles as the PID hash).
static PROCESSES: SpinLock<BTreeMap<Pid, Arc<Process>>> = SpinLock::new(BTreeMap::new());

/// Zombie processes awaiting reaping.
static ZOMBIES: SpinLock<BTreeMap<Pid, Arc<Process>>> = SpinLock::new(BTreeMap::new());

/// All threads, keyed by tid (the TID hash).
static THREADS: SpinLock<BTreeMap<Tid, Arc<Thread>>> = SpinLock::new(BTreeMap::new());

static NEXT_PID: SpinLock<u32> = SpinLock::new(1);
static NEXT_TID: SpinLock<u32> = SpinLock::new(1);

fn alloc_pid() -> Pid {
    let mut next = NEXT_PID.lock();
    loop {
        let candidate = *next;
        *next += 1;
        if *next >= PID_MAX {
            *next = 1;
        }
        let pid = Pid::new(candidate);
        if !PROCESSES.lock().contains_key(&pid) && !ZOMBIES.lock().contains_key(&pid) {
            return pid;
        }
    }
}

fn alloc_tid() -> Tid {
    let mut next = NEXT_TID.lock();
    loop {
        let candidate = *next & TID_MASK;
        *next = (*next + 1) & TID_MASK;
        if *next == 0 {
            *next = 1;
        }
        if candidate == 0 {
            continue;
        }
        let tid = Tid::new(candidate);
        if !THREADS.lock().contains_key(&tid) {
            return tid;
        }
    }
}

/// Finds a live or zombie process by pid.
pub fn prfind(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES
        .lock()
        .get(&pid)
        .cloned()
        .or_else(|| ZOMBIES.lock().get(&pid).cloned())
}

/// Finds a thread by tid.
pub fn tfind(tid: Tid) -> Option<Arc<Thread>> {
    THREADS.lock().get(&tid).cloned()
}

/// Number of live processes.
pub fn process_count() -> usize {
    PROCESSES.lock().len()
}

// ---------------------------------------------------------------------------
// Creation and destruction
// ---------------------------------------------------------------------------

/// Allocates a new process with a fresh user address space.
///
/// The process starts Embryo with no threads, refcounted by the global
/// table, the root directory as cwd, and an empty descriptor table.
pub fn process_alloc(name: &str) -> Result<Arc<Process>, VmmError> {
    let space = AddressSpace::new_user(walker(), Some(kernel_root()), &mut KernelFrameAlloc)?;
    let pid = alloc_pid();
    let process = Arc::new(Process {
        pid,
        name: String::from(name),
        parent: None,
        children: SpinLock::new(Vec::new()),
        space: SpinLock::new(Some(space)),
        fd_table: SpinLock::new(FdTable::new()),
        cwd: SpinLock::new(String::from("/")),
        creds: SpinLock::new(Creds::default()),
        state: SpinLock::new(ProcState::Embryo),
        exit_status: SpinLock::new(None),
        threads: SpinLock::new(Vec::new()),
    });
    PROCESSES.lock().insert(pid, process.clone());
    kdebug!("proc: allocated process {} ({})", pid, name);
    Ok(process)
}

/// Allocates a thread under `process`; the first one is the main
/// thread.
pub fn proc_alloc(process: &Arc<Process>, name: &str) -> Arc<Thread> {
    let tid = alloc_tid();
    let thread = Arc::new(Thread {
        tid,
        pid: process.pid,
        name: String::from(name),
        kernel_stack: vec![0u128; KERNEL_STACK_SIZE / 16].into_boxed_slice(),
        context: UnsafeCell::new(ArchContext::empty()),
        user_entry: AtomicU64::new(0),
        user_stack: AtomicU64::new(0),
        fork_frame: SpinLock::new(None),
    });
    THREADS.lock().insert(tid, thread.clone());
    process.threads.lock().push(tid);
    thread
}

/// Removes a thread; when it was the process's last, the process
/// transitions to the zombie table.
pub fn proc_free(tid: Tid) {
    let Some(thread) = THREADS.lock().remove(&tid) else {
        return;
    };
    let Some(process) = prfind(thread.pid) else {
        return;
    };

    let last = {
        let mut threads = process.threads.lock();
        threads.retain(|&t| t != tid);
        threads.is_empty()
    };

    if last {
        *process.state.lock() = ProcState::Zombie;
        let removed = PROCESSES.lock().remove(&process.pid);
        if removed.is_some() {
            ZOMBIES.lock().insert(process.pid, process.clone());
        }
        kdebug!("proc: process {} is now a zombie", process.pid);
    }
}

/// Reaps a zombie: drops its identity entirely.
pub fn process_free(pid: Pid) {
    ZOMBIES.lock().remove(&pid);
}

// ---------------------------------------------------------------------------
// Current process
// ---------------------------------------------------------------------------

/// The running thread, if the scheduler has one.
pub fn current_thread() -> Option<Arc<Thread>> {
    crate::sched::current_tid().and_then(tfind)
}

/// The process of the running thread.
pub fn current_process() -> Option<Arc<Process>> {
    current_thread().and_then(|t| prfind(t.pid))
}

/// Runs `f` with the current process, if there is one.
pub fn try_current_process<R>(f: impl FnOnce(&Arc<Process>) -> R) -> Option<R> {
    current_process().map(|p| f(&p))
}

// ---------------------------------------------------------------------------
// Fork
// ---------------------------------------------------------------------------

/// Duplicates `parent`: address space (copy-on-write), descriptor
/// table (shared open files), cwd, and a child thread whose first
/// user-mode instruction is the parent's return site with `rax = 0`.
///
/// Returns the child pid for the parent's return value.
pub fn fork(parent: &Arc<Process>, frame: &TrapFrame) -> Result<Pid, VmmError> {
    let child_space = {
        let mut space = parent.space.lock();
        let space = space.as_mut().ok_or(VmmError::NoRegion)?;
        cow_with(|cow| space.fork(Some(kernel_root()), &mut KernelFrameAlloc, cow))?
    };
    // The fork remapped live parent pages read-only.
    crate::arch::x86_64::tlb::flush_all();

    let pid = alloc_pid();
    let child = Arc::new(Process {
        pid,
        name: parent.name.clone(),
        parent: Some(parent.pid),
        children: SpinLock::new(Vec::new()),
        space: SpinLock::new(Some(child_space)),
        fd_table: SpinLock::new(parent.fd_table.lock().duplicate()),
        cwd: SpinLock::new(parent.cwd.lock().clone()),
        creds: SpinLock::new(*parent.creds.lock()),
        state: SpinLock::new(ProcState::Active),
        exit_status: SpinLock::new(None),
        threads: SpinLock::new(Vec::new()),
    });
    PROCESSES.lock().insert(pid, child.clone());
    parent.children.lock().push(pid);

    let thread = proc_alloc(&child, &child.name);
    let mut child_frame = *frame;
    child_frame.rax = 0;
    *thread.fork_frame.lock() = Some(child_frame);
    thread.prepare_entry(fork_child_entry);

    crate::sched::add_thread(thread.tid, quark_sched::Priority::Normal);
    kinfo!("proc: forked {} -> {}", parent.pid, pid);
    Ok(pid)
}

/// First code a fork child runs: resume ring 3 from the copied frame.
extern "C" fn fork_child_entry() {
    let thread = current_thread().expect("fork child has no thread");
    let frame = thread
        .fork_frame
        .lock()
        .take()
        .expect("fork child has no saved frame");

    gdt::set_kernel_stack(thread.kernel_stack_top());
    interrupts::disable();
    // SAFETY: The frame is the parent's validated user register image
    // (rax forced to 0) and the scheduler installed this process's
    // address space before running us.
    unsafe { user_frame_return(&frame) };
}

// ---------------------------------------------------------------------------
// User-mode entry
// ---------------------------------------------------------------------------

/// First code an exec'd main thread runs: drop into ring 3 at the
/// image entry point.
pub extern "C" fn user_thread_entry() {
    let thread = current_thread().expect("user thread without record");
    let entry = thread.user_entry.load(Ordering::Acquire);
    let stack = thread.user_stack.load(Ordering::Acquire);
    enter_usermode(&thread, entry, stack);
}

/// Transfers a thread to user mode; one-way.
///
/// Flips the process Embryo → Exec, installs the thread's kernel
/// stack as the trap stack, and irets to ring 3 with zeroed registers.
pub fn enter_usermode(thread: &Arc<Thread>, entry: u64, stack_top: u64) -> ! {
    if let Some(process) = prfind(thread.pid) {
        let mut state = process.state.lock();
        if *state == ProcState::Embryo || *state == ProcState::Active {
            *state = ProcState::Exec;
        }
    }

    gdt::set_kernel_stack(thread.kernel_stack_top());
    interrupts::disable();
    // SAFETY: The scheduler installed this process's address space;
    // entry and stack were produced by the loader.
    unsafe { userspace::enter_user(entry, stack_top) };
}

// ---------------------------------------------------------------------------
// Exit
// ---------------------------------------------------------------------------

/// Tears down the current process and never returns.
///
/// Closes every descriptor, releases the cwd, frees every user page
/// and page-table frame (after moving CR3 off the dying tables), and
/// hands the thread to the scheduler's terminated list.
pub fn exit_current(status: i32) -> ! {
    let thread = current_thread().expect("exit without a current thread");
    let process = prfind(thread.pid).expect("exit without a process");

    kinfo!("proc: process {} exiting with status {}", process.pid, status);
    *process.exit_status.lock() = Some(status);

    process.fd_table.lock().close_all();
    *process.cwd.lock() = String::new();

    // The dying address space may be the active one; run the teardown
    // from the kernel tables.
    interrupts::disable();
    // SAFETY: The kernel root maps all kernel code and data.
    unsafe { Cr3::write(kernel_root()) };
    if let Some(space) = process.space.lock().take() {
        cow_with(|cow| space.teardown(&mut KernelFrameAlloc, cow));
    }

    crate::sched::finish_exit()
}
