//! Scheduler runtime.
//!
//! Wraps the host-tested policy core ([`quark_sched::SchedCore`]) in
//! the machine-level pieces it cannot carry: the interrupts-off
//! critical section, the idle task, CR3 installation, TSS stack
//! switching, and the context-switch primitive. The platform timer
//! driver calls [`timer_interrupt`] on every tick from an ISR that
//! saves and restores all general-purpose registers.

extern crate alloc;

use core::sync::atomic::{AtomicBool, Ordering};

use quark_core::id::{Pid, Tid};
use quark_core::sync::SpinLock;
use quark_core::{kdebug, kinfo};
use quark_sched::{Priority, SchedCore, SchedStats, Switch};

use crate::arch::x86_64::context::{context_jump, context_switch};
use crate::arch::x86_64::control::Cr3;
use crate::arch::x86_64::{gdt, interrupts};
use crate::proc;

static SCHED: SpinLock<Option<SchedCore>> = SpinLock::new(None);
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Runs `f` with the scheduler core.
///
/// # Panics
///
/// Panics if [`init`] has not run.
fn with_core<R>(f: impl FnOnce(&mut SchedCore) -> R) -> R {
    let mut core = SCHED.lock();
    f(core.as_mut().expect("scheduler not initialized"))
}

/// Creates the core, the idle task, and derives the time slice from
/// the timer frequency.
pub fn init(timer_hz: u64) {
    {
        let mut core = SCHED.lock();
        assert!(core.is_none(), "scheduler already initialized");
        *core = Some(SchedCore::new(timer_hz));
    }

    // The idle task is an ordinary thread at the lowest tier: always
    // runnable, picked only when nothing else is.
    let (pid, tid) = create_task("idle", idle_entry, Priority::Idle)
        .expect("failed to create the idle task");
    kinfo!(
        "sched: initialized ({timer_hz} Hz, slice {} ticks, idle pid {pid} tid {tid})",
        with_core(|c| c.slice_ticks()),
    );
}

/// Allocates a process + main thread around a kernel entry point and
/// makes it runnable.
pub fn create_task(
    name: &str,
    entry: extern "C" fn(),
    priority: Priority,
) -> Result<(Pid, Tid), quark_mm::VmmError> {
    let process = proc::process_alloc(name)?;
    *process.state.lock() = proc::ProcState::Active;
    let thread = proc::proc_alloc(&process, name);
    thread.prepare_entry(entry);
    add_thread(thread.tid, priority);
    Ok((process.pid, thread.tid))
}

/// Registers an existing thread with the scheduler.
pub fn add_thread(tid: Tid, priority: Priority) {
    interrupts::without(|| with_core(|core| core.add_thread(tid, priority)));
}

/// The running thread's tid.
pub fn current_tid() -> Option<Tid> {
    let core = SCHED.lock();
    core.as_ref().and_then(SchedCore::current)
}

/// Counter snapshot.
pub fn stats() -> SchedStats {
    with_core(|core| core.stats())
}

/// Marks the scheduler live and dispatches the first thread.
///
/// # Safety
///
/// Boot-time only: abandons the boot stack.
pub unsafe fn start() -> ! {
    RUNNING.store(true, Ordering::Release);
    interrupts::disable();

    let switch = with_core(|core| core.switch_to_next()).expect("nothing to schedule");
    let to = proc::tfind(switch.to).expect("scheduled thread has no record");
    install_thread_state(&to);

    kdebug!("sched: dispatching first thread {}", to.tid);
    // SAFETY: The context was prepared by `prepare_entry`; the boot
    // stack is never needed again.
    unsafe { context_jump(to.context_ptr()) }
}

/// Timer tick: housekeeping, then preemption when the slice is gone.
///
/// Must be called from the platform timer ISR with interrupts
/// disabled and full register state saved.
pub fn timer_interrupt() {
    if !RUNNING.load(Ordering::Acquire) {
        return;
    }

    let outcome = with_core(|core| core.tick());
    for tid in &outcome.reap {
        proc::proc_free(*tid);
    }
    if outcome.resched {
        reschedule();
    }
}

/// Voluntary yield.
pub fn yield_now() {
    if !RUNNING.load(Ordering::Acquire) {
        return;
    }
    interrupts::without(|| {
        let Some(me) = proc::current_thread() else {
            return;
        };
        let decision = with_core(|core| core.yield_current());
        perform(&me, decision);
    });
}

/// Blocks a thread; switches away when the caller blocks itself.
pub fn block(tid: Tid) {
    interrupts::without(|| {
        let me = proc::current_thread();
        let was_current = with_core(|core| core.block(tid));
        if was_current {
            let me = me.expect("blocking thread has no record");
            let decision = with_core(|core| core.switch_to_next());
            perform(&me, decision);
        }
    });
}

/// Returns a blocked thread to the ready queues.
pub fn unblock(tid: Tid) {
    interrupts::without(|| with_core(|core| core.unblock(tid)));
}

/// Puts the current thread to sleep for at least `ms` milliseconds.
pub fn sleep_current_ms(ms: u64) {
    interrupts::without(|| {
        let Some(me) = proc::current_thread() else {
            return;
        };
        let was_current = with_core(|core| core.sleep(me.tid, ms));
        if was_current {
            let decision = with_core(|core| core.switch_to_next());
            perform(&me, decision);
        }
    });
}

/// Changes a thread's priority.
pub fn set_priority(tid: Tid, priority: Priority) {
    interrupts::without(|| with_core(|core| core.set_priority(tid, priority)));
}

/// Kills the current task: tears the process down and switches away
/// forever.
pub fn exit_current(status: i32) -> ! {
    proc::exit_current(status)
}

/// Final step of process exit: the thread joins the terminated list
/// and the CPU moves on. The thread is destroyed on the next tick.
pub(crate) fn finish_exit() -> ! {
    interrupts::disable();
    with_core(|core| core.exit_current());
    let decision = with_core(|core| core.switch_to_next());
    jump_away(decision)
}

/// Kernel task entries return here when they fall off the end.
#[unsafe(no_mangle)]
extern "C" fn thread_exit_trampoline() {
    exit_current(0);
}

// ---------------------------------------------------------------------------
// The switch itself
// ---------------------------------------------------------------------------

/// Preemption path (timer ISR): the running thread is switched out.
fn reschedule() {
    let Some(me) = proc::current_thread() else {
        return;
    };
    let decision = with_core(|core| core.switch_to_next());
    perform(&me, decision);
}

/// Executes a switch decision, saving the outgoing context into `me`.
///
/// Interrupts must be disabled. The scheduler lock is already
/// released: on a single CPU with interrupts off nothing can intervene
/// between the decision and the switch.
fn perform(me: &alloc::sync::Arc<proc::Thread>, decision: Option<Switch>) {
    let Some(switch) = decision else {
        return;
    };
    debug_assert!(switch.to != me.tid);
    let to = proc::tfind(switch.to).expect("switch to an unknown thread");

    install_thread_state(&to);
    // SAFETY: Both contexts are valid (prepared or previously saved);
    // interrupts are off.
    unsafe { context_switch(me.context_ptr(), to.context_ptr()) };
    // Running again: another thread switched back to us.
}

/// Switch without an outgoing context (the caller's thread is gone).
fn jump_away(decision: Option<Switch>) -> ! {
    let switch = decision.expect("no runnable thread, not even idle");
    let to = proc::tfind(switch.to).expect("switch to an unknown thread");
    install_thread_state(&to);
    // SAFETY: The target context is valid; the current stack is dead.
    unsafe { context_jump(to.context_ptr()) }
}

/// Installs the incoming thread's trap stack and address space.
fn install_thread_state(to: &alloc::sync::Arc<proc::Thread>) {
    gdt::set_kernel_stack(to.kernel_stack_top());

    // Load the target address space only when it differs; the write
    // flushes all non-global TLB entries.
    if let Some(process) = proc::prfind(to.pid) {
        if let Some(space) = process.space.lock().as_ref() {
            let root = space.root_phys();
            if Cr3::read() != root {
                // SAFETY: The space's kernel half mirrors the kernel
                // root, so kernel execution continues seamlessly.
                unsafe { Cr3::write(root) };
            }
        }
    }
}

/// The idle loop: halt until the next interrupt, forever.
extern "C" fn idle_entry() {
    loop {
        interrupts::enable_and_hlt();
    }
}
