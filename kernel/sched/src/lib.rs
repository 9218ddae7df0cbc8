//! Scheduling policy for the quark kernel.
//!
//! The policy state machine lives here, host-testable: strict-priority
//! round-robin queues, the sleeping and blocked lists, time-slice
//! accounting, and the pick-next decision. The kernel crate wraps this
//! in an interrupts-off critical section and adds what cannot run on a
//! host: the idle task, CR3 switching, and the actual context switch.
//!
//! Thread state is authoritative in [`ThreadInfo`]; the queues are
//! indexed views over it. A thread is referenced by exactly one of:
//! a ready queue, the blocked list, the sleeping list, the terminated
//! list, or `current`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use quark_core::id::Tid;

/// Default time slice in milliseconds.
pub const SLICE_MS: u64 = 20;

/// Scheduling priority; higher runs first, 0 is the idle tier.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Only runs when nothing else can.
    Idle = 0,
    /// Background work.
    Low = 1,
    /// Default tier.
    Normal = 2,
    /// Latency-sensitive work.
    High = 3,
    /// Highest tier.
    Realtime = 4,
}

impl Priority {
    /// Number of priority tiers.
    pub const COUNT: usize = 5;

    /// Converts a raw value, defaulting to `Normal`.
    pub const fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Idle,
            1 => Self::Low,
            3 => Self::High,
            4 => Self::Realtime,
            _ => Self::Normal,
        }
    }
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never run.
    Idle,
    /// Waiting in a ready queue.
    Ready,
    /// On the CPU.
    Running,
    /// Waiting for a wake-up deadline.
    Sleeping,
    /// Waiting for an explicit unblock.
    Blocked,
    /// Exited; awaiting destruction on the next tick.
    Dead,
}

/// Scheduler-side record of one thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    /// Current priority tier.
    pub priority: Priority,
    /// Current state.
    pub state: ThreadState,
    /// Ticks consumed in the current slice.
    pub cpticks: u64,
    /// Lifetime ticks on the CPU.
    pub runtime: u64,
    /// Absolute wake-up time in ms (sleeping threads only).
    pub wake_at_ms: u64,
}

/// Counters exposed by [`SchedCore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Threads known to the scheduler.
    pub total_tasks: u64,
    /// Threads in the ready queues.
    pub ready_tasks: u64,
    /// Threads on the blocked list.
    pub blocked_tasks: u64,
    /// Ticks observed.
    pub total_ticks: u64,
    /// Context switches performed.
    pub context_switches: u64,
}

/// Strict-priority FIFO ready queues.
pub struct RunQueues {
    queues: [VecDeque<Tid>; Priority::COUNT],
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueues {
    /// Creates empty queues.
    pub fn new() -> Self {
        Self {
            queues: [const { VecDeque::new() }; Priority::COUNT],
        }
    }

    /// Appends a thread at the tail of its tier.
    pub fn push(&mut self, priority: Priority, tid: Tid) {
        self.queues[priority as usize].push_back(tid);
    }

    /// Pops the head of the highest non-empty tier (4 down to 0).
    pub fn pop(&mut self) -> Option<(Priority, Tid)> {
        for tier in (0..Priority::COUNT).rev() {
            if let Some(tid) = self.queues[tier].pop_front() {
                let priority = Priority::from_u8(tier as u8);
                return Some((priority, tid));
            }
        }
        None
    }

    /// Removes a specific thread from its tier's queue.
    pub fn remove(&mut self, priority: Priority, tid: Tid) -> bool {
        let queue = &mut self.queues[priority as usize];
        if let Some(pos) = queue.iter().position(|&t| t == tid) {
            queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Whether any tier has a ready thread.
    pub fn has_ready(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    /// Threads across all tiers.
    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Whether every tier is empty.
    pub fn is_empty(&self) -> bool {
        !self.has_ready()
    }
}

/// What a tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Threads whose deferred destruction is now due.
    pub reap: Vec<Tid>,
    /// The running thread exhausted its slice; switch.
    pub resched: bool,
}

/// Result of a pick-next decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// The thread that was running, if it was put back to ready.
    pub from: Option<Tid>,
    /// The thread to run next.
    pub to: Tid,
}

/// The scheduler policy core: thread table, queues, and transitions.
///
/// Single-CPU; the caller serializes access (interrupts off in the
/// kernel, plain ownership in tests). The idle task is the caller's:
/// when [`switch_to_next`](Self::switch_to_next) has no runnable
/// thread it reports `None` and the caller runs its idle loop.
pub struct SchedCore {
    threads: BTreeMap<Tid, ThreadInfo>,
    queues: RunQueues,
    sleeping: Vec<Tid>,
    blocked: Vec<Tid>,
    terminated: Vec<Tid>,
    current: Option<Tid>,
    slice_ticks: u64,
    ms_per_tick: u64,
    now_ms: u64,
    stats: SchedStats,
}

impl SchedCore {
    /// Creates a core for a timer of `timer_hz` ticks per second.
    pub fn new(timer_hz: u64) -> Self {
        let timer_hz = timer_hz.max(1);
        Self {
            threads: BTreeMap::new(),
            queues: RunQueues::new(),
            sleeping: Vec::new(),
            blocked: Vec::new(),
            terminated: Vec::new(),
            current: None,
            slice_ticks: (SLICE_MS * timer_hz / 1000).max(1),
            ms_per_tick: (1000 / timer_hz).max(1),
            now_ms: 0,
            stats: SchedStats::default(),
        }
    }

    /// Ticks one slice lasts.
    pub fn slice_ticks(&self) -> u64 {
        self.slice_ticks
    }

    /// The running thread.
    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// Scheduler-side info for a thread.
    pub fn thread(&self, tid: Tid) -> Option<&ThreadInfo> {
        self.threads.get(&tid)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedStats {
        let mut stats = self.stats;
        stats.total_tasks = self.threads.len() as u64;
        stats.ready_tasks = self.queues.len() as u64;
        stats.blocked_tasks = self.blocked.len() as u64;
        stats
    }

    /// Registers a new thread and makes it ready.
    pub fn add_thread(&mut self, tid: Tid, priority: Priority) {
        self.threads.insert(
            tid,
            ThreadInfo {
                priority,
                state: ThreadState::Ready,
                cpticks: 0,
                runtime: 0,
                wake_at_ms: 0,
            },
        );
        self.queues.push(priority, tid);
    }

    /// Removes a thread from every scheduler structure.
    pub fn remove_thread(&mut self, tid: Tid) {
        if let Some(info) = self.threads.remove(&tid) {
            match info.state {
                ThreadState::Ready => {
                    self.queues.remove(info.priority, tid);
                }
                ThreadState::Sleeping => self.sleeping.retain(|&t| t != tid),
                ThreadState::Blocked => self.blocked.retain(|&t| t != tid),
                ThreadState::Dead => self.terminated.retain(|&t| t != tid),
                ThreadState::Running => {
                    if self.current == Some(tid) {
                        self.current = None;
                    }
                }
                ThreadState::Idle => {}
            }
        }
    }

    /// Timer tick: reap the terminated, wake due sleepers, charge the
    /// running thread, and decide whether to reschedule.
    pub fn tick(&mut self) -> TickOutcome {
        self.stats.total_ticks += 1;
        self.now_ms += self.ms_per_tick;

        // Deferred destruction of exited threads.
        let reap: Vec<Tid> = core::mem::take(&mut self.terminated);
        for tid in &reap {
            self.threads.remove(tid);
        }

        // Wake sleepers whose deadline passed.
        let now = self.now_ms;
        let due: Vec<Tid> = self
            .sleeping
            .iter()
            .copied()
            .filter(|tid| {
                self.threads
                    .get(tid)
                    .is_some_and(|t| now >= t.wake_at_ms)
            })
            .collect();
        for tid in due {
            self.sleeping.retain(|&t| t != tid);
            if let Some(info) = self.threads.get_mut(&tid) {
                info.state = ThreadState::Ready;
                info.cpticks = 0;
                self.queues.push(info.priority, tid);
            }
        }

        // Charge the running thread and preempt on slice exhaustion.
        let mut resched = false;
        if let Some(tid) = self.current {
            if let Some(info) = self.threads.get_mut(&tid) {
                info.cpticks += 1;
                info.runtime += 1;
                if info.cpticks >= self.slice_ticks {
                    resched = true;
                }
            }
        } else if self.queues.has_ready() {
            // Idle CPU with runnable work.
            resched = true;
        }

        TickOutcome { reap, resched }
    }

    /// Monotonic scheduler clock in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Picks the next thread: strict priority, FIFO within a tier.
    ///
    /// The outgoing RUNNING thread is requeued at the tail of its tier
    /// first, so it competes fairly with its peers but still outranks
    /// every lower tier. When the pick lands on the thread already on
    /// the CPU the decision is `None`: reset its slice and keep going
    /// (no context switch is counted). `None` with no current thread
    /// means the caller idles.
    pub fn switch_to_next(&mut self) -> Option<Switch> {
        if let Some(prev) = self.current {
            if let Some(info) = self.threads.get_mut(&prev) {
                if info.state == ThreadState::Running {
                    info.state = ThreadState::Ready;
                    info.cpticks = 0;
                    self.queues.push(info.priority, prev);
                }
            }
        }

        let Some((_, next)) = self.queues.pop() else {
            return None;
        };

        if self.current == Some(next) {
            // The current thread is still the highest-priority runnable.
            if let Some(info) = self.threads.get_mut(&next) {
                info.state = ThreadState::Running;
                info.cpticks = 0;
            }
            return None;
        }

        let from = self.current;
        if let Some(info) = self.threads.get_mut(&next) {
            info.state = ThreadState::Running;
            info.cpticks = 0;
        }
        self.current = Some(next);
        self.stats.context_switches += 1;
        Some(Switch { from, to: next })
    }

    /// Voluntary yield: same as a preemption-driven switch.
    pub fn yield_current(&mut self) -> Option<Switch> {
        self.switch_to_next()
    }

    /// Moves a thread to the blocked list.
    ///
    /// Returns `true` when the blocked thread was running and the
    /// caller must switch away.
    pub fn block(&mut self, tid: Tid) -> bool {
        let Some(info) = self.threads.get_mut(&tid) else {
            return false;
        };
        if info.state == ThreadState::Blocked {
            return false;
        }

        let was_current = self.current == Some(tid);
        if info.state == ThreadState::Ready {
            let priority = info.priority;
            self.queues.remove(priority, tid);
        }
        info.state = ThreadState::Blocked;
        self.blocked.push(tid);
        if was_current {
            self.current = None;
        }
        was_current
    }

    /// Returns a blocked thread to its ready queue.
    pub fn unblock(&mut self, tid: Tid) {
        let Some(info) = self.threads.get_mut(&tid) else {
            return;
        };
        if info.state != ThreadState::Blocked {
            return;
        }
        self.blocked.retain(|&t| t != tid);
        info.state = ThreadState::Ready;
        info.cpticks = 0;
        self.queues.push(info.priority, tid);
    }

    /// Puts a thread to sleep for `ms` milliseconds.
    ///
    /// Returns `true` when the sleeping thread was running and the
    /// caller must switch away.
    pub fn sleep(&mut self, tid: Tid, ms: u64) -> bool {
        let now = self.now_ms;
        let Some(info) = self.threads.get_mut(&tid) else {
            return false;
        };

        let was_current = self.current == Some(tid);
        if info.state == ThreadState::Ready {
            let priority = info.priority;
            self.queues.remove(priority, tid);
        }
        info.state = ThreadState::Sleeping;
        info.wake_at_ms = now + ms;
        self.sleeping.push(tid);
        if was_current {
            self.current = None;
        }
        was_current
    }

    /// Marks the current thread dead; it is destroyed on the next tick.
    ///
    /// The caller must switch away afterwards and never return to the
    /// exited thread.
    pub fn exit_current(&mut self) -> Option<Tid> {
        let tid = self.current.take()?;
        if let Some(info) = self.threads.get_mut(&tid) {
            info.state = ThreadState::Dead;
        }
        self.terminated.push(tid);
        Some(tid)
    }

    /// Changes a thread's priority, requeueing if it is ready.
    pub fn set_priority(&mut self, tid: Tid, priority: Priority) {
        let Some(info) = self.threads.get_mut(&tid) else {
            return;
        };
        if info.priority == priority {
            return;
        }
        let old = info.priority;
        info.priority = priority;
        if info.state == ThreadState::Ready && self.queues.remove(old, tid) {
            self.queues.push(priority, tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> Tid {
        Tid::new(n)
    }

    // -- RunQueues ----------------------------------------------------

    #[test]
    fn fifo_within_tier() {
        let mut rq = RunQueues::new();
        rq.push(Priority::Normal, tid(1));
        rq.push(Priority::Normal, tid(2));
        rq.push(Priority::Normal, tid(3));

        assert_eq!(rq.pop(), Some((Priority::Normal, tid(1))));
        assert_eq!(rq.pop(), Some((Priority::Normal, tid(2))));
        assert_eq!(rq.pop(), Some((Priority::Normal, tid(3))));
        assert_eq!(rq.pop(), None);
    }

    #[test]
    fn higher_tier_always_first() {
        let mut rq = RunQueues::new();
        rq.push(Priority::Low, tid(1));
        rq.push(Priority::Realtime, tid(2));
        rq.push(Priority::Normal, tid(3));

        assert_eq!(rq.pop(), Some((Priority::Realtime, tid(2))));
        assert_eq!(rq.pop(), Some((Priority::Normal, tid(3))));
        assert_eq!(rq.pop(), Some((Priority::Low, tid(1))));
    }

    #[test]
    fn remove_specific_thread() {
        let mut rq = RunQueues::new();
        rq.push(Priority::Normal, tid(1));
        rq.push(Priority::Normal, tid(2));
        assert!(rq.remove(Priority::Normal, tid(1)));
        assert!(!rq.remove(Priority::Normal, tid(1)));
        assert_eq!(rq.pop(), Some((Priority::Normal, tid(2))));
    }

    // -- SchedCore basics --------------------------------------------

    #[test]
    fn first_switch_picks_highest_ready() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::High);

        let sw = core.switch_to_next().unwrap();
        assert_eq!(sw.to, tid(2));
        assert_eq!(sw.from, None);
        assert_eq!(core.current(), Some(tid(2)));
        assert_eq!(
            core.thread(tid(2)).unwrap().state,
            ThreadState::Running
        );
    }

    #[test]
    fn switch_requeues_running_at_tail() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::Normal);

        assert_eq!(core.switch_to_next().unwrap().to, tid(1));
        assert_eq!(core.switch_to_next().unwrap().to, tid(2));
        // Round robin back to 1.
        assert_eq!(core.switch_to_next().unwrap().to, tid(1));
    }

    #[test]
    fn no_ready_threads_keeps_current() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        assert_eq!(core.switch_to_next().unwrap().to, tid(1));
        // Only current remains; decision is to stay.
        assert!(core.switch_to_next().is_none());
        assert_eq!(core.current(), Some(tid(1)));
    }

    #[test]
    fn slice_exhaustion_requests_resched() {
        let mut core = SchedCore::new(1000); // 20 ticks per slice
        core.add_thread(tid(1), Priority::Normal);
        core.switch_to_next().unwrap();

        for _ in 0..core.slice_ticks() - 1 {
            assert!(!core.tick().resched);
        }
        assert!(core.tick().resched);
    }

    #[test]
    fn tick_reaps_terminated() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.switch_to_next().unwrap();
        assert_eq!(core.exit_current(), Some(tid(1)));

        let outcome = core.tick();
        assert_eq!(outcome.reap, [tid(1)]);
        assert!(core.thread(tid(1)).is_none());
    }

    #[test]
    fn sleep_and_timer_wakeup() {
        let mut core = SchedCore::new(1000); // 1 ms per tick
        core.add_thread(tid(1), Priority::Normal);
        core.switch_to_next().unwrap();

        assert!(core.sleep(tid(1), 5));
        assert_eq!(core.current(), None);
        assert_eq!(core.thread(tid(1)).unwrap().state, ThreadState::Sleeping);

        for _ in 0..4 {
            core.tick();
            assert_eq!(core.thread(tid(1)).unwrap().state, ThreadState::Sleeping);
        }
        core.tick();
        assert_eq!(core.thread(tid(1)).unwrap().state, ThreadState::Ready);
        assert_eq!(core.switch_to_next().unwrap().to, tid(1));
    }

    #[test]
    fn block_unblock_round_trip() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::Normal);
        core.switch_to_next().unwrap(); // 1 running

        // Blocking a ready thread does not force a switch.
        assert!(!core.block(tid(2)));
        assert_eq!(core.stats().blocked_tasks, 1);

        // Blocking the running thread does.
        assert!(core.block(tid(1)));
        assert_eq!(core.current(), None);

        core.unblock(tid(2));
        core.unblock(tid(1));
        // FIFO: 2 was unblocked first.
        assert_eq!(core.switch_to_next().unwrap().to, tid(2));
    }

    #[test]
    fn wake_resets_slice_counter() {
        let mut core = SchedCore::new(1000);
        core.add_thread(tid(1), Priority::Normal);
        core.switch_to_next().unwrap();
        for _ in 0..5 {
            core.tick();
        }
        assert!(core.thread(tid(1)).unwrap().cpticks > 0);

        core.block(tid(1));
        core.unblock(tid(1));
        assert_eq!(core.thread(tid(1)).unwrap().cpticks, 0);
    }

    #[test]
    fn set_priority_requeues_ready_thread() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::Normal);

        core.set_priority(tid(2), Priority::High);
        assert_eq!(core.switch_to_next().unwrap().to, tid(2));
    }

    // -- Invariants 7 and 8 ------------------------------------------

    #[test]
    fn ready_order_is_pick_order() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(10), Priority::Normal);
        core.add_thread(tid(11), Priority::Normal);
        core.add_thread(tid(12), Priority::Normal);

        assert_eq!(core.switch_to_next().unwrap().to, tid(10));
        assert_eq!(core.switch_to_next().unwrap().to, tid(11));
        assert_eq!(core.switch_to_next().unwrap().to, tid(12));
    }

    #[test]
    fn higher_priority_wins_next_resched() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.switch_to_next().unwrap();

        core.add_thread(tid(2), Priority::High);
        let sw = core.switch_to_next().unwrap();
        assert_eq!(sw.to, tid(2));
        // The preempted thread is ready again, not lost.
        assert_eq!(core.thread(tid(1)).unwrap().state, ThreadState::Ready);
    }

    // -- S6: fairness and priority scenarios --------------------------

    #[test]
    fn round_robin_fairness_over_300_yields() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::Normal);
        core.add_thread(tid(3), Priority::Normal);

        let mut order = Vec::new();
        for _ in 0..300 {
            let sw = core.yield_current().unwrap();
            order.push(sw.to.as_u32());
        }

        // Strict 1, 2, 3, 1, 2, 3, ... rotation.
        for (i, &t) in order.iter().enumerate() {
            assert_eq!(t, (i % 3) as u32 + 1, "rotation broke at step {i}");
        }
    }

    #[test]
    fn higher_priority_task_runs_to_completion_first() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::Normal);
        core.add_thread(tid(3), Priority::Normal);

        // Rotate a while at Normal.
        for _ in 0..10 {
            core.yield_current().unwrap();
        }

        core.add_thread(tid(4), Priority::High);
        let sw = core.yield_current().unwrap();
        assert_eq!(sw.to, tid(4));

        // As long as 4 stays runnable, yields keep picking it.
        for _ in 0..20 {
            assert!(core.yield_current().is_none(), "tid 4 must keep the CPU");
            assert_eq!(core.current(), Some(tid(4)));
        }

        // 4 exits; the Normal rotation resumes.
        core.exit_current();
        let next = core.yield_current().unwrap().to;
        assert!([1, 2, 3].contains(&next.as_u32()));
    }

    #[test]
    fn stats_track_queue_population() {
        let mut core = SchedCore::new(100);
        core.add_thread(tid(1), Priority::Normal);
        core.add_thread(tid(2), Priority::Low);
        assert_eq!(core.stats().total_tasks, 2);
        assert_eq!(core.stats().ready_tasks, 2);

        core.switch_to_next().unwrap();
        assert_eq!(core.stats().ready_tasks, 1);
        assert_eq!(core.stats().context_switches, 1);
    }
}
