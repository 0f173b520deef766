//! Scheduler core
//!
//! A [`Kernel`] owns every piece of mutable scheduler state: the task table,
//! the per-priority ready lists with their bitmap, the two delay-wheel lists,
//! the suspend list, the running-task pointer and the deferred-delete slot.
//! The port wraps one instance in its critical section and drives it from the
//! public API, the SysTick handler and the PendSV handler.
//!
//! Methods that can make a higher-priority task runnable return `bool`: the
//! caller must request a context switch when it is `true`. The kernel itself
//! never touches the CPU; picking a task only updates bookkeeping and hands
//! back the stack pointer to restore.

use core::marker::PhantomData;

use crate::arch::Arch;
use crate::bitmap::ReadyBitmap;
use crate::config;
use crate::error::KernelError;
use crate::list::{LinkKind, ListTag, TaskList};
#[cfg(any(
    feature = "semaphore",
    feature = "message-queue",
    feature = "task-notify"
))]
use crate::task::EventResult;
use crate::task::{Storage, TaskEntry, TaskId, TaskState, TaskTable, Tcb};

#[cfg(feature = "semaphore")]
use crate::sem::SemTable;

#[cfg(feature = "message-queue")]
use crate::queue::QueueTable;

/// The kernel singleton
///
/// # Generics
///
/// * `A`: the port, supplying the initial stack-frame layout
/// * `MAX_TASKS`: capacity of the task table, idle task included
pub struct Kernel<A: Arch, const MAX_TASKS: usize> {
    pub(crate) tasks: TaskTable<MAX_TASKS>,
    ready: [TaskList; config::PRIORITY_COUNT],
    /// The two delay-wheel lists; `live_wheel` indexes the one covering the
    /// current tick epoch, the other collects wake-ups past the wrap
    wheels: [TaskList; 2],
    live_wheel: usize,
    suspend: TaskList,
    bitmap: ReadyBitmap,
    tick: u32,
    /// Tick value seen by the previous tick interrupt, for wrap detection
    last_tick: u32,
    current: Option<TaskId>,
    idle: Option<TaskId>,
    /// TCB awaiting idle-task cleanup
    pending_delete: Option<TaskId>,
    /// Set by the tick handler when it wakes a task while idle is running
    idle_yield: bool,
    started: bool,
    #[cfg(feature = "stack-overflow-check")]
    overflow_hook: fn(TaskId),
    #[cfg(feature = "semaphore")]
    pub(crate) sems: SemTable,
    #[cfg(feature = "message-queue")]
    pub(crate) queues: QueueTable,
    _arch: PhantomData<A>,
}

#[cfg(feature = "stack-overflow-check")]
fn default_overflow_hook(_task: TaskId) {
    loop {}
}

impl<A: Arch, const MAX_TASKS: usize> Kernel<A, MAX_TASKS> {
    /// Create an empty, unstarted kernel
    pub fn new() -> Self {
        Kernel {
            tasks: TaskTable::new(),
            ready: core::array::from_fn(|p| {
                TaskList::new(LinkKind::State, ListTag::Ready(p as u8))
            }),
            wheels: [
                TaskList::new(LinkKind::State, ListTag::Blocked(0)),
                TaskList::new(LinkKind::State, ListTag::Blocked(1)),
            ],
            live_wheel: 0,
            suspend: TaskList::new(LinkKind::State, ListTag::Suspend),
            bitmap: ReadyBitmap::new(),
            tick: 0,
            last_tick: 0,
            current: None,
            idle: None,
            pending_delete: None,
            idle_yield: false,
            started: false,
            #[cfg(feature = "stack-overflow-check")]
            overflow_hook: default_overflow_hook,
            #[cfg(feature = "semaphore")]
            sems: SemTable::new(),
            #[cfg(feature = "message-queue")]
            queues: QueueTable::new(),
            _arch: PhantomData,
        }
    }

    /// Create the idle task and make the kernel startable
    ///
    /// The idle task is pinned at the lowest priority, is always ready, and
    /// must never block. Calling `init` twice is a no-op.
    pub fn init(
        &mut self,
        idle_stack: &'static mut [u8],
        idle_entry: TaskEntry,
    ) -> Result<TaskId, KernelError> {
        if let Some(idle) = self.idle {
            return Ok(idle);
        }
        let idle = self.spawn(
            Storage::Borrowed(idle_stack),
            idle_entry,
            0,
            (config::PRIORITY_COUNT - 1) as u8,
            false,
        )?;
        self.idle = Some(idle);
        Ok(idle)
    }

    /// Pick the first task and hand back its seeded stack pointer
    ///
    /// The port pops that frame into the CPU via the one-shot SVC exception;
    /// this call itself returns.
    pub fn start(&mut self) -> Result<usize, KernelError> {
        if self.idle.is_none() || self.started {
            return Err(KernelError::WrongContext);
        }
        self.started = true;
        let first = self.pick_next();
        self.current = Some(first);
        self.tasks.tcb_mut(first).state = TaskState::Running;
        Ok(self.tasks.tcb(first).saved_sp)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Create a task on a caller-provided stack
    pub fn create_static(
        &mut self,
        stack: &'static mut [u8],
        entry: TaskEntry,
        arg: usize,
        priority: u8,
    ) -> Result<TaskId, KernelError> {
        self.spawn(Storage::Borrowed(stack), entry, arg, priority, false)
    }

    /// Create a task on a heap-allocated stack
    ///
    /// The stack and TCB are released by the idle task after deletion. Both
    /// allocations are fallible; a partial allocation is released before the
    /// error is reported.
    pub fn create_dynamic(
        &mut self,
        entry: TaskEntry,
        arg: usize,
        priority: u8,
        stack_size: usize,
    ) -> Result<TaskId, KernelError> {
        let mut stack = alloc::vec::Vec::new();
        stack
            .try_reserve_exact(stack_size)
            .map_err(|_| KernelError::OutOfMemory)?;
        stack.resize(stack_size, config::STACK_FILL_PATTERN);
        self.spawn(
            Storage::Owned(stack.into_boxed_slice()),
            entry,
            arg,
            priority,
            true,
        )
    }

    fn spawn(
        &mut self,
        mut stack: Storage,
        entry: TaskEntry,
        arg: usize,
        priority: u8,
        dynamic: bool,
    ) -> Result<TaskId, KernelError> {
        if stack.len() < config::MIN_STACK_SIZE {
            return Err(KernelError::BadArgument);
        }
        let priority = if (priority as usize) >= config::PRIORITY_COUNT {
            (config::PRIORITY_COUNT - 1) as u8
        } else {
            priority
        };
        stack.as_mut_slice().fill(config::STACK_FILL_PATTERN);
        let sp = A::seed_stack(stack.as_mut_slice(), entry, arg);
        let mut tcb = Tcb::new(stack, priority, dynamic);
        tcb.saved_sp = sp;
        let id = self.tasks.insert(tcb)?;
        self.ready_push_back(id);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // State-list plumbing. All ready-list membership changes go through
    // these helpers so the bitmap can never drift from the lists.
    // ------------------------------------------------------------------

    pub(crate) fn ready_push_back(&mut self, id: TaskId) {
        let priority = self.tasks.tcb(id).priority;
        self.ready[priority as usize].push_back(&mut self.tasks, id);
        self.bitmap.set(priority);
    }

    pub(crate) fn ready_push_front(&mut self, id: TaskId) {
        let priority = self.tasks.tcb(id).priority;
        self.ready[priority as usize].push_front(&mut self.tasks, id);
        self.bitmap.set(priority);
    }

    /// Unlink a task from whichever state list it is on
    pub(crate) fn detach_state(&mut self, id: TaskId) {
        let Some(tag) = self.tasks.node(id, LinkKind::State).owner else {
            return;
        };
        match tag {
            ListTag::Ready(p) => {
                self.ready[p as usize].remove(&mut self.tasks, id);
                if self.ready[p as usize].is_empty() {
                    self.bitmap.clear(p);
                }
            }
            ListTag::Blocked(w) => self.wheels[w as usize].remove(&mut self.tasks, id),
            ListTag::Suspend => self.suspend.remove(&mut self.tasks, id),
            #[cfg(any(feature = "semaphore", feature = "message-queue"))]
            _ => debug_assert!(false, "state node on a waiter list"),
        }
    }

    /// Unlink a task's event node from whichever waiter list it is on
    #[cfg(any(feature = "semaphore", feature = "message-queue"))]
    pub(crate) fn detach_event(&mut self, id: TaskId) {
        let Some(tag) = self.tasks.node(id, LinkKind::Event).owner else {
            return;
        };
        match tag {
            #[cfg(feature = "semaphore")]
            ListTag::SemWaiters(sem) => {
                if let Some(sem) = self.sems.get_mut(sem) {
                    sem.waiters.remove(&mut self.tasks, id);
                }
            }
            #[cfg(feature = "message-queue")]
            ListTag::QueueSend(queue) => {
                if let Some(queue) = self.queues.get_mut(queue) {
                    queue.send_waiters.remove(&mut self.tasks, id);
                }
            }
            #[cfg(feature = "message-queue")]
            ListTag::QueueRecv(queue) => {
                if let Some(queue) = self.queues.get_mut(queue) {
                    queue.recv_waiters.remove(&mut self.tasks, id);
                }
            }
            _ => debug_assert!(false, "event node on a state list"),
        }
    }

    /// Move a task to its ready list; `front` preserves responsiveness for
    /// semaphore, notification and inheritance wake-ups
    pub(crate) fn make_ready(&mut self, id: TaskId, front: bool) {
        self.detach_state(id);
        self.tasks.tcb_mut(id).state = TaskState::Ready;
        if front {
            self.ready_push_front(id);
        } else {
            self.ready_push_back(id);
        }
    }

    /// If the task sits on a ready list, reinsert it at the head of the list
    /// matching its (possibly just changed) priority
    #[cfg(feature = "mutex-priority-inheritance")]
    pub(crate) fn requeue_ready_front(&mut self, id: TaskId) {
        if matches!(
            self.tasks.node(id, LinkKind::State).owner,
            Some(ListTag::Ready(_))
        ) {
            self.detach_state(id);
            self.ready_push_front(id);
        }
    }

    fn pick_next(&mut self) -> TaskId {
        let priority = self.bitmap.highest().expect("ready bitmap empty");
        self.ready[priority as usize]
            .head()
            .expect("ready list empty with bitmap bit set")
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Advance the kernel tick by one and wake expired delays
    ///
    /// Called from the tick interrupt inside the critical section. Returns
    /// `true` when a task with higher priority than the running one was
    /// woken, in which case the caller must pend a context switch.
    pub fn tick_update(&mut self) -> bool {
        self.tick = self.tick.wrapping_add(1);
        let mut preempt = false;

        let wheel = self.live_wheel;
        let mut at = self.wheels[wheel].head();
        while let Some(id) = at {
            let next = self.tasks.node(id, LinkKind::State).next;
            let wake_up = self.tasks.tcb(id).wake_up;
            // Permanently blocked tasks are only released by `wakeup`
            if wake_up == config::MAX_DELAY {
                at = next;
                continue;
            }
            // The wheel is sorted ascending; the first unexpired entry ends
            // the walk
            if self.tick < wake_up {
                break;
            }
            {
                let tcb = self.tasks.tcb_mut(id);
                #[cfg(any(
                    feature = "semaphore",
                    feature = "message-queue",
                    feature = "task-notify"
                ))]
                if tcb.event_result == EventResult::Pending {
                    // Still registered on an object: the deadline passed
                    tcb.event_result = EventResult::Timeout;
                }
                tcb.last_wake = self.tick;
            }
            self.make_ready(id, false);
            if self.current == self.idle {
                self.idle_yield = true;
            }
            if let Some(current) = self.current {
                if self.tasks.tcb(id).priority < self.tasks.tcb(current).priority {
                    preempt = true;
                }
            }
            at = next;
        }

        // The tick counter wrapped: the overflow wheel becomes live
        if self.last_tick > self.tick {
            self.live_wheel ^= 1;
        }
        self.last_tick = self.tick;
        preempt
    }

    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    // ------------------------------------------------------------------
    // Context switch
    // ------------------------------------------------------------------

    /// Record the outgoing task's stack pointer and pick the next task
    ///
    /// Called from the context-switch exception. The outgoing RUNNING task
    /// was already re-filed by whatever operation requested the switch (or
    /// stays at the head of its ready list when preempted); the picked task
    /// is left on its ready list. Returns the stack pointer to restore.
    pub fn switch_context(&mut self, saved_sp: Option<usize>) -> usize {
        if let Some(outgoing) = self.current {
            if let Some(tcb) = self.tasks.get_mut(outgoing) {
                if let Some(sp) = saved_sp {
                    tcb.saved_sp = sp;
                }
                if tcb.state == TaskState::Running {
                    tcb.state = TaskState::Ready;
                }
            }
            #[cfg(feature = "stack-overflow-check")]
            self.check_stack_overflow(outgoing);
            #[cfg(feature = "high-water-mark")]
            self.update_high_water_mark(outgoing);
        }
        let next = self.pick_next();
        self.current = Some(next);
        let tcb = self.tasks.tcb_mut(next);
        tcb.state = TaskState::Running;
        tcb.saved_sp
    }

    #[cfg(feature = "stack-overflow-check")]
    fn check_stack_overflow(&mut self, id: TaskId) {
        let Some(tcb) = self.tasks.get(id) else {
            return;
        };
        let base = tcb.stack.base();
        let top = base + tcb.stack.len();
        if tcb.saved_sp < base || tcb.saved_sp >= top {
            (self.overflow_hook)(id);
        }
    }

    /// Replace the stack-overflow hook (the default spins forever)
    #[cfg(feature = "stack-overflow-check")]
    pub fn set_stack_overflow_hook(&mut self, hook: fn(TaskId)) {
        self.overflow_hook = hook;
    }

    #[cfg(feature = "high-water-mark")]
    fn update_high_water_mark(&mut self, id: TaskId) {
        let Some(tcb) = self.tasks.get_mut(id) else {
            return;
        };
        let stack = tcb.stack.as_slice();
        let mut used = 0;
        for (i, byte) in stack.iter().enumerate() {
            if *byte != config::STACK_FILL_PATTERN {
                used = stack.len() - i;
                break;
            }
        }
        if used > tcb.high_water_mark {
            tcb.high_water_mark = used;
        }
    }

    // ------------------------------------------------------------------
    // Task operations
    // ------------------------------------------------------------------

    /// Move the running task to the tail of its priority's ready list
    ///
    /// Same-priority tasks rotate through this; a lone task at its priority
    /// is simply picked again.
    pub fn yield_current(&mut self) -> Result<bool, KernelError> {
        let current = self.current.ok_or(KernelError::WrongContext)?;
        self.make_ready(current, false);
        Ok(true)
    }

    /// Block the running task for `ticks` kernel ticks
    ///
    /// `0` degenerates to a yield; [`config::MAX_DELAY`] parks the task until
    /// [`Kernel::wakeup`] releases it. The wake-up tick is computed with
    /// wrapping arithmetic, and a sum that lands below the current tick goes
    /// on the overflow wheel so the wake stays monotonically comparable.
    pub fn delay_current(&mut self, ticks: u32) -> Result<bool, KernelError> {
        let current = self.current.ok_or(KernelError::WrongContext)?;
        if Some(current) == self.idle {
            return Err(KernelError::BadArgument);
        }
        if ticks == 0 {
            return self.yield_current();
        }
        if ticks == config::MAX_DELAY {
            self.tasks.tcb_mut(current).wake_up = config::MAX_DELAY;
            self.block_on_wheel(current, self.live_wheel);
            return Ok(true);
        }
        let mut wake_up = self.tick.wrapping_add(ticks);
        // A finite delay must not alias the park-forever sentinel
        if wake_up == config::MAX_DELAY {
            wake_up = wake_up.wrapping_add(1);
        }
        self.tasks.tcb_mut(current).wake_up = wake_up;
        let wheel = if wake_up < self.tick {
            self.live_wheel ^ 1
        } else {
            self.live_wheel
        };
        self.block_on_wheel(current, wheel);
        Ok(true)
    }

    fn block_on_wheel(&mut self, id: TaskId, wheel: usize) {
        self.detach_state(id);
        self.tasks.tcb_mut(id).state = TaskState::Blocked;
        self.wheels[wheel].insert_by_wake(&mut self.tasks, id);
    }

    /// Block the running task until one `period` past its last wake
    ///
    /// Keeps periodic tasks on a stable phase regardless of how long each
    /// iteration took. A deadline that has already passed (wrap-safe test)
    /// does not block; the phase reference still advances by one period.
    pub fn delay_until(&mut self, period: u32) -> Result<bool, KernelError> {
        if period == 0 {
            return Err(KernelError::BadArgument);
        }
        let current = self.current.ok_or(KernelError::WrongContext)?;
        if Some(current) == self.idle {
            return Err(KernelError::BadArgument);
        }
        let tick = self.tick;
        let tcb = self.tasks.tcb_mut(current);
        if tcb.last_wake == 0 {
            tcb.last_wake = tick;
        }
        let last_wake = tcb.last_wake;
        let wake_up = last_wake.wrapping_add(period);
        tcb.last_wake = wake_up;
        if tick.wrapping_sub(last_wake) >= period {
            // Deadline already missed: run immediately, keep the new phase
            return Ok(false);
        }
        tcb.wake_up = wake_up;
        let wheel = if wake_up < tick {
            self.live_wheel ^ 1
        } else {
            self.live_wheel
        };
        self.block_on_wheel(current, wheel);
        Ok(true)
    }

    /// Release a task parked with `delay(MAX_DELAY)`
    pub fn wakeup(&mut self, id: TaskId) -> Result<bool, KernelError> {
        let tcb = self.tasks.get(id).ok_or(KernelError::BadArgument)?;
        let on_wheel = matches!(
            self.tasks.node(id, LinkKind::State).owner,
            Some(ListTag::Blocked(_))
        );
        if !on_wheel || tcb.wake_up != config::MAX_DELAY {
            return Err(KernelError::BadArgument);
        }
        self.make_ready(id, false);
        if let Some(current) = self.current {
            if self.tasks.tcb(id).priority < self.tasks.tcb(current).priority {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove a task from scheduling; `None` suspends the caller
    pub fn suspend(&mut self, task: Option<TaskId>) -> Result<bool, KernelError> {
        let id = match task {
            Some(id) => id,
            None => self.current.ok_or(KernelError::WrongContext)?,
        };
        if Some(id) == self.idle {
            return Err(KernelError::BadArgument);
        }
        self.tasks.get(id).ok_or(KernelError::BadArgument)?;
        self.cancel_event_wait(id);
        self.detach_state(id);
        self.tasks.tcb_mut(id).state = TaskState::Suspended;
        self.suspend.push_back(&mut self.tasks, id);
        Ok(Some(id) == self.current)
    }

    /// Put a task back on the ready list at its priority
    pub fn resume(&mut self, id: TaskId) -> Result<(), KernelError> {
        if Some(id) == self.idle {
            return Err(KernelError::BadArgument);
        }
        self.tasks.get(id).ok_or(KernelError::BadArgument)?;
        self.cancel_event_wait(id);
        self.make_ready(id, false);
        Ok(())
    }

    /// Forget any event registration so a sidelined task cannot linger on a
    /// waiter list in a non-blocked state
    fn cancel_event_wait(&mut self, id: TaskId) {
        #[cfg(any(feature = "semaphore", feature = "message-queue"))]
        self.detach_event(id);
        #[cfg(any(
            feature = "semaphore",
            feature = "message-queue",
            feature = "task-notify"
        ))]
        {
            self.tasks.tcb_mut(id).event_result = EventResult::None;
        }
        #[cfg(feature = "task-notify")]
        {
            self.tasks.tcb_mut(id).waiting_notify = None;
        }
        #[cfg(not(any(
            feature = "semaphore",
            feature = "message-queue",
            feature = "task-notify"
        )))]
        let _ = id;
    }

    /// Delete a task; `None` deletes the caller
    ///
    /// Static tasks cannot release their memory and degrade to a suspend.
    /// Dynamic tasks are unlinked and parked in the deferred-delete slot for
    /// the idle task to free; a self-delete must be followed by a context
    /// switch and never runs again.
    pub fn delete(&mut self, task: Option<TaskId>) -> Result<bool, KernelError> {
        let id = match task {
            Some(id) => id,
            None => self.current.ok_or(KernelError::WrongContext)?,
        };
        if Some(id) == self.idle {
            return Err(KernelError::BadArgument);
        }
        let tcb = self.tasks.get(id).ok_or(KernelError::BadArgument)?;
        if !tcb.dynamic {
            return self.suspend(Some(id));
        }
        self.detach_state(id);
        #[cfg(any(feature = "semaphore", feature = "message-queue"))]
        self.detach_event(id);
        // A still-pending corpse cannot be the running task; reap it now
        // rather than leak it
        if let Some(previous) = self.pending_delete.take() {
            self.tasks.remove(previous);
        }
        self.pending_delete = Some(id);
        Ok(Some(id) == self.current)
    }

    /// Change a task's priority; `None` targets the caller
    pub fn set_priority(&mut self, task: Option<TaskId>, priority: u8) -> Result<(), KernelError> {
        let id = match task {
            Some(id) => id,
            None => self.current.ok_or(KernelError::WrongContext)?,
        };
        if Some(id) == self.idle {
            return Err(KernelError::BadArgument);
        }
        self.tasks.get(id).ok_or(KernelError::BadArgument)?;
        let priority = if (priority as usize) >= config::PRIORITY_COUNT {
            (config::PRIORITY_COUNT - 1) as u8
        } else {
            priority
        };
        let on_ready = matches!(
            self.tasks.node(id, LinkKind::State).owner,
            Some(ListTag::Ready(_))
        );
        let front = self.tasks.tcb(id).state == TaskState::Running;
        self.tasks.tcb_mut(id).priority = priority;
        if on_ready {
            self.detach_state(id);
            // The running task must stay at the head of its list
            if front {
                self.ready_push_front(id);
            } else {
                self.ready_push_back(id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Idle-task services
    // ------------------------------------------------------------------

    /// Free the TCB and stack parked in the deferred-delete slot
    ///
    /// Called by the idle task. Returns whether anything was reaped.
    pub fn reap_deleted(&mut self) -> bool {
        match self.pending_delete.take() {
            Some(id) => self.tasks.remove(id),
            None => false,
        }
    }

    /// Consume the tick handler's request for the idle task to yield
    pub fn take_idle_yield(&mut self) -> bool {
        core::mem::take(&mut self.idle_yield)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|t| t.state)
    }

    pub fn task_priority(&self, id: TaskId) -> Option<u8> {
        self.tasks.get(id).map(|t| t.priority)
    }

    /// Total stack size of a task in bytes; `None` targets the caller
    pub fn stack_size(&self, task: Option<TaskId>) -> Option<usize> {
        let id = task.or(self.current)?;
        self.tasks.get(id).map(|t| t.stack.len())
    }

    /// Deepest stack use observed so far, in bytes; `None` targets the caller
    #[cfg(feature = "high-water-mark")]
    pub fn high_water_mark(&self, task: Option<TaskId>) -> Option<usize> {
        let id = task.or(self.current)?;
        self.tasks.get(id).map(|t| t.high_water_mark)
    }

    #[cfg(test)]
    pub(crate) fn force_tick(&mut self, tick: u32) {
        self.tick = tick;
        self.last_tick = tick;
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        // Bitmap bit set iff the ready list is non-empty
        for p in 0..config::PRIORITY_COUNT {
            let expect = !self.ready[p].is_empty();
            let mut probe = self.bitmap;
            probe.clear(p as u8);
            assert_eq!(
                probe != self.bitmap,
                expect,
                "bitmap out of sync at priority {}",
                p
            );
        }
        // The running task is current and heads its ready list
        if let Some(current) = self.current {
            let tcb = self.tasks.tcb(current);
            if tcb.state == TaskState::Running {
                assert_eq!(self.ready[tcb.priority as usize].head(), Some(current));
            }
        }
    }
}
