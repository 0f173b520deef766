//! Semaphores, mutexes and recursive mutexes
//!
//! One object type covers all three: a counting value with a
//! priority-ordered waiter list, plus ownership tracking when it is a mutex.
//! Objects live in a fixed table inside the kernel and are addressed by
//! generation-tagged handles, so a handle outliving its object fails closed.
//!
//! Blocking take is split into a *step* (fast path or waiter registration)
//! and a *resume* (outcome decision after the task was woken); the port runs
//! the step under its critical section, context-switches while blocked, and
//! loops on the resume verdict.

use crate::arch::Arch;
use crate::config;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::list::{LinkKind, ListTag, TaskList};
use crate::task::EventResult;
#[cfg(feature = "mutex")]
use crate::task::TaskId;

/// Handle to a semaphore or mutex
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SemId {
    pub(crate) index: u8,
    pub(crate) generation: u8,
}

/// What flavour of synchronization object a [`SemId`] refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SemKind {
    /// Plain counting semaphore
    Counting,
    /// Ownership-tracking mutex; a self-reacquire is tolerated but not
    /// counted
    #[cfg(feature = "mutex")]
    Mutex,
    /// Mutex that counts self-reacquires and needs a matching give for each
    #[cfg(feature = "mutex")]
    RecursiveMutex,
}

impl SemKind {
    pub(crate) fn is_mutex(self) -> bool {
        #[cfg(feature = "mutex")]
        return matches!(self, SemKind::Mutex | SemKind::RecursiveMutex);
        #[cfg(not(feature = "mutex"))]
        false
    }
}

/// Outcome of one non-blocking slice of a take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemTake {
    /// The token (or mutex ownership) was obtained
    Acquired,
    /// The caller was registered as a waiter and blocked; switch contexts,
    /// then call [`Kernel::sem_take_resume`]
    Blocked,
}

pub(crate) struct Sem {
    count: u16,
    max: u16,
    kind: SemKind,
    pub(crate) waiters: TaskList,
    #[cfg(feature = "mutex")]
    holder: Option<TaskId>,
    #[cfg(feature = "mutex")]
    recursion: u16,
    /// Holder's pre-boost priority while inheritance is active
    #[cfg(feature = "mutex-priority-inheritance")]
    original_priority: Option<u8>,
}

struct Slot {
    generation: u8,
    sem: Option<Sem>,
}

pub(crate) struct SemTable {
    slots: heapless::Vec<Slot, { config::MAX_SEMS }>,
}

impl SemTable {
    pub(crate) fn new() -> Self {
        SemTable {
            slots: heapless::Vec::new(),
        }
    }

    fn insert(&mut self, make: impl FnOnce(SemId) -> Sem) -> Option<SemId> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.sem.is_none() {
                let id = SemId {
                    index: index as u8,
                    generation: slot.generation,
                };
                slot.sem = Some(make(id));
                return Some(id);
            }
        }
        let id = SemId {
            index: self.slots.len() as u8,
            generation: 0,
        };
        let sem = make(id);
        self.slots
            .push(Slot {
                generation: 0,
                sem: Some(sem),
            })
            .ok()?;
        Some(id)
    }

    fn remove(&mut self, id: SemId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.sem.is_some() => {
                slot.sem = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get(&self, id: SemId) -> Option<&Sem> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.sem.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: SemId) -> Option<&mut Sem> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.sem.as_mut())
    }
}

impl<A: Arch, const MAX_TASKS: usize> Kernel<A, MAX_TASKS> {
    /// Create a semaphore or mutex; the initial count is clamped to `max`
    pub fn sem_create(
        &mut self,
        initial: u16,
        max: u16,
        kind: SemKind,
    ) -> Result<SemId, KernelError> {
        if max == 0 {
            return Err(KernelError::BadArgument);
        }
        self.sems
            .insert(|id| Sem {
                count: initial.min(max),
                max,
                kind,
                waiters: TaskList::new(LinkKind::Event, ListTag::SemWaiters(id)),
                #[cfg(feature = "mutex")]
                holder: None,
                #[cfg(feature = "mutex")]
                recursion: 0,
                #[cfg(feature = "mutex-priority-inheritance")]
                original_priority: None,
            })
            .ok_or(KernelError::OutOfMemory)
    }

    /// Binary semaphore: max count 1, initially given or empty
    pub fn sem_create_binary(&mut self, available: bool) -> Result<SemId, KernelError> {
        self.sem_create(available as u16, 1, SemKind::Counting)
    }

    /// Mutex, initially free
    #[cfg(feature = "mutex")]
    pub fn mutex_create(&mut self, recursive: bool) -> Result<SemId, KernelError> {
        let kind = if recursive {
            SemKind::RecursiveMutex
        } else {
            SemKind::Mutex
        };
        self.sem_create(1, 1, kind)
    }

    pub fn sem_count(&self, id: SemId) -> Option<u16> {
        self.sems.get(id).map(|s| s.count)
    }

    /// Fast path or waiter registration of a take
    ///
    /// `Err(Empty)` reports a failed non-blocking attempt (`timeout == 0`);
    /// `Ok(Blocked)` means the caller is now blocked and must switch away,
    /// then ask [`Kernel::sem_take_resume`] whether to retry.
    pub fn sem_take_step(&mut self, id: SemId, timeout: u32) -> Result<SemTake, KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        if Some(current) == self.idle_task() {
            return Err(KernelError::BadArgument);
        }

        let taken = {
            let sem = self.sems.get_mut(id).ok_or(KernelError::BadArgument)?;
            #[cfg(feature = "mutex")]
            if sem.kind.is_mutex() && sem.holder == Some(current) {
                if sem.kind == SemKind::RecursiveMutex {
                    sem.recursion = sem.recursion.saturating_add(1);
                }
                return Ok(SemTake::Acquired);
            }
            if sem.count > 0 {
                sem.count -= 1;
                #[cfg(feature = "mutex")]
                if sem.kind.is_mutex() {
                    sem.holder = Some(current);
                    sem.recursion = 1;
                }
                true
            } else {
                false
            }
        };
        if taken {
            #[cfg(feature = "mutex-priority-inheritance")]
            self.inherit_priority(id);
            return Ok(SemTake::Acquired);
        }

        if timeout == 0 {
            return Err(KernelError::Empty);
        }

        self.tasks.tcb_mut(current).event_result = EventResult::Pending;
        let sem = self.sems.get_mut(id).ok_or(KernelError::BadArgument)?;
        sem.waiters.insert_by_priority(&mut self.tasks, current);
        // The new waiter may outrank the holder; boost before going to sleep
        #[cfg(feature = "mutex-priority-inheritance")]
        self.inherit_priority(id);
        self.delay_current(timeout)?;
        Ok(SemTake::Blocked)
    }

    /// Decide the outcome of a take after the blocked caller was woken
    ///
    /// `Ok(())` means retry the take; errors are final.
    pub fn sem_take_resume(&mut self, id: SemId) -> Result<(), KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        let result = self.tasks.tcb(current).event_result;
        self.tasks.tcb_mut(current).event_result = EventResult::None;
        match result {
            EventResult::Deleted => Err(KernelError::Deleted),
            EventResult::Timeout => {
                // The tick handler holds no object knowledge; the waiter
                // unregisters itself
                self.detach_event(current);
                let sem = self.sems.get(id).ok_or(KernelError::Deleted)?;
                if sem.count == 0 {
                    Err(KernelError::Timeout)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Release one token, waking the longest-waiting highest-priority waiter
    ///
    /// For a mutex the caller must be the holder; a recursive mutex stays
    /// held until its outermost give. Returns whether the woken task outranks
    /// the caller (the caller should yield then).
    pub fn sem_give(&mut self, id: SemId) -> Result<bool, KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;

        #[cfg(feature = "mutex")]
        {
            let (is_mutex, still_held) = {
                let sem = self.sems.get_mut(id).ok_or(KernelError::BadArgument)?;
                if sem.kind.is_mutex() {
                    if sem.holder != Some(current) {
                        return Err(KernelError::BadArgument);
                    }
                    if sem.kind == SemKind::RecursiveMutex && sem.recursion > 1 {
                        sem.recursion -= 1;
                        (true, true)
                    } else {
                        sem.recursion = 0;
                        (true, false)
                    }
                } else {
                    (false, false)
                }
            };
            if is_mutex {
                if still_held {
                    return Ok(false);
                }
                #[cfg(feature = "mutex-priority-inheritance")]
                self.restore_priority(id);
                self.sems.get_mut(id).ok_or(KernelError::BadArgument)?.holder = None;
            }
        }

        let sem = self.sems.get_mut(id).ok_or(KernelError::BadArgument)?;
        if sem.count < sem.max {
            sem.count += 1;
        }
        if let Some(waiter) = sem.waiters.pop_front(&mut self.tasks) {
            self.tasks.tcb_mut(waiter).event_result = EventResult::Ok;
            self.make_ready(waiter, true);
            let preempt =
                self.tasks.tcb(waiter).priority < self.tasks.tcb(current).priority;
            return Ok(preempt);
        }
        Ok(false)
    }

    /// Interrupt-context give: never blocks and skips priority inheritance
    ///
    /// Returns whether a task outranking the interrupted one was woken; the
    /// ISR epilogue pends a context switch on `true`.
    pub fn sem_give_from_isr(&mut self, id: SemId) -> Result<bool, KernelError> {
        #[cfg(feature = "mutex")]
        {
            let current = self.current_task();
            let sem = self.sems.get_mut(id).ok_or(KernelError::BadArgument)?;
            if sem.kind.is_mutex() {
                if current.is_none() || sem.holder != current {
                    return Err(KernelError::BadArgument);
                }
                if sem.kind == SemKind::RecursiveMutex && sem.recursion > 1 {
                    sem.recursion -= 1;
                    return Ok(false);
                }
                sem.recursion = 0;
                sem.holder = None;
            }
        }

        let sem = self.sems.get_mut(id).ok_or(KernelError::BadArgument)?;
        if sem.count < sem.max {
            sem.count += 1;
        }
        if let Some(waiter) = sem.waiters.pop_front(&mut self.tasks) {
            self.tasks.tcb_mut(waiter).event_result = EventResult::Ok;
            self.make_ready(waiter, true);
            if let Some(current) = self.current_task() {
                if self.tasks.tcb(waiter).priority < self.tasks.tcb(current).priority {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Drop all tokens and release every waiter with a timeout verdict
    ///
    /// Returns whether any waiter was woken (the caller should yield then).
    pub fn sem_clear(&mut self, id: SemId) -> Result<bool, KernelError> {
        self.sems.get_mut(id).ok_or(KernelError::BadArgument)?.count = 0;
        let mut woke = false;
        loop {
            let waiter = self
                .sems
                .get_mut(id)
                .ok_or(KernelError::BadArgument)?
                .waiters
                .pop_front(&mut self.tasks);
            let Some(waiter) = waiter else { break };
            self.tasks.tcb_mut(waiter).event_result = EventResult::Timeout;
            self.make_ready(waiter, true);
            woke = true;
        }
        Ok(woke)
    }

    /// Release every waiter with a deleted verdict and retire the handle
    pub fn sem_delete(&mut self, id: SemId) -> Result<bool, KernelError> {
        self.sems.get(id).ok_or(KernelError::BadArgument)?;
        let mut woke = false;
        loop {
            let waiter = self
                .sems
                .get_mut(id)
                .ok_or(KernelError::BadArgument)?
                .waiters
                .pop_front(&mut self.tasks);
            let Some(waiter) = waiter else { break };
            self.tasks.tcb_mut(waiter).event_result = EventResult::Deleted;
            self.make_ready(waiter, true);
            woke = true;
        }
        self.sems.remove(id);
        Ok(woke)
    }

    /// Promote the holder to the head waiter's priority when outranked
    #[cfg(feature = "mutex-priority-inheritance")]
    fn inherit_priority(&mut self, id: SemId) {
        let Some(sem) = self.sems.get(id) else {
            return;
        };
        if !sem.kind.is_mutex() {
            return;
        }
        let Some(holder) = sem.holder else {
            return;
        };
        let Some(head) = sem.waiters.head() else {
            return;
        };
        let head_priority = self.tasks.tcb(head).priority;
        let holder_priority = self.tasks.tcb(holder).priority;
        if head_priority < holder_priority {
            let sem = self.sems.get_mut(id).expect("sem vanished");
            if sem.original_priority.is_none() {
                sem.original_priority = Some(holder_priority);
            }
            self.tasks.tcb_mut(holder).priority = head_priority;
            self.requeue_ready_front(holder);
        }
    }

    /// Undo an active inheritance boost on the outermost give
    #[cfg(feature = "mutex-priority-inheritance")]
    fn restore_priority(&mut self, id: SemId) {
        let (holder, original) = {
            let Some(sem) = self.sems.get_mut(id) else {
                return;
            };
            let Some(holder) = sem.holder else {
                return;
            };
            let Some(original) = sem.original_priority.take() else {
                return;
            };
            (holder, original)
        };
        if self.tasks.tcb(holder).priority != original {
            self.tasks.tcb_mut(holder).priority = original;
            self.requeue_ready_front(holder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::kernel::tests::{leaked_stack, setup, switch, task_entry, TestKernel};
    use crate::task::TaskState;

    #[test]
    fn non_blocking_take_reports_empty() {
        let (mut kernel, _, _) = setup();
        let sem = kernel.sem_create(0, 2, SemKind::Counting).unwrap();
        assert_eq!(kernel.sem_take_step(sem, 0), Err(KernelError::Empty));
        assert!(!kernel.sem_give(sem).unwrap());
        assert_eq!(kernel.sem_take_step(sem, 0), Ok(SemTake::Acquired));
        assert_eq!(kernel.sem_count(sem), Some(0));
    }

    #[test]
    fn zero_max_count_is_rejected() {
        let (mut kernel, _, _) = setup();
        assert_eq!(
            kernel.sem_create(0, 0, SemKind::Counting),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn give_caps_at_max_count() {
        let (mut kernel, _, _) = setup();
        let sem = kernel.sem_create_binary(true).unwrap();
        assert!(!kernel.sem_give(sem).unwrap());
        assert_eq!(kernel.sem_count(sem), Some(1));
    }

    #[test]
    fn blocked_take_is_woken_by_give() {
        let (mut kernel, a, b) = setup();
        let sem = kernel.sem_create_binary(false).unwrap();
        // a blocks on the empty semaphore
        assert_eq!(
            kernel.sem_take_step(sem, config::MAX_DELAY),
            Ok(SemTake::Blocked)
        );
        assert_eq!(switch(&mut kernel), b);
        // b gives: a is woken to the head of its ready list and outranks b
        assert!(kernel.sem_give(sem).unwrap());
        assert_eq!(kernel.task_state(a), Some(TaskState::Ready));
        assert_eq!(switch(&mut kernel), a);
        // a retries and now wins the token
        assert_eq!(kernel.sem_take_resume(sem), Ok(()));
        assert_eq!(kernel.sem_take_step(sem, config::MAX_DELAY), Ok(SemTake::Acquired));
        assert_eq!(kernel.sem_count(sem), Some(0));
        kernel.check_invariants();
    }

    #[test]
    fn take_times_out_and_unregisters() {
        let (mut kernel, a, _) = setup();
        let sem = kernel.sem_create_binary(false).unwrap();
        assert_eq!(kernel.sem_take_step(sem, 3), Ok(SemTake::Blocked));
        switch(&mut kernel);
        for _ in 0..2 {
            assert!(!kernel.tick_update());
        }
        assert!(kernel.tick_update());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.sem_take_resume(sem), Err(KernelError::Timeout));
        // The waiter removed itself from the waiter list
        let give_woke = kernel.sem_give(sem).unwrap();
        assert!(!give_woke);
        assert_eq!(kernel.sem_count(sem), Some(1));
    }

    #[test]
    fn clear_releases_waiters_with_timeout() {
        let (mut kernel, a, _) = setup();
        let sem = kernel.sem_create_binary(false).unwrap();
        kernel.sem_take_step(sem, config::MAX_DELAY).unwrap();
        switch(&mut kernel);
        assert!(kernel.sem_clear(sem).unwrap());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.sem_take_resume(sem), Err(KernelError::Timeout));
    }

    #[test]
    fn delete_releases_waiters_and_retires_handle() {
        let (mut kernel, a, _) = setup();
        let sem = kernel.sem_create_binary(false).unwrap();
        kernel.sem_take_step(sem, config::MAX_DELAY).unwrap();
        switch(&mut kernel);
        assert!(kernel.sem_delete(sem).unwrap());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.sem_take_resume(sem), Err(KernelError::Deleted));
        assert_eq!(kernel.sem_take_step(sem, 0), Err(KernelError::BadArgument));
    }

    #[test]
    fn give_from_isr_reports_higher_priority_wake() {
        let (mut kernel, a, b) = setup();
        let sem = kernel.sem_create_binary(false).unwrap();
        kernel.sem_take_step(sem, config::MAX_DELAY).unwrap();
        assert_eq!(switch(&mut kernel), b);
        assert!(kernel.sem_give_from_isr(sem).unwrap());
        assert_eq!(kernel.task_state(a), Some(TaskState::Ready));
    }

    #[cfg(feature = "mutex")]
    #[test]
    fn recursive_mutex_needs_matching_gives() {
        let (mut kernel, _, _) = setup();
        let mx = kernel.mutex_create(true).unwrap();
        assert_eq!(kernel.sem_take_step(mx, 0), Ok(SemTake::Acquired));
        assert_eq!(kernel.sem_take_step(mx, 0), Ok(SemTake::Acquired));
        assert_eq!(kernel.sem_count(mx), Some(0));
        // Inner give keeps it held
        assert!(!kernel.sem_give(mx).unwrap());
        assert_eq!(kernel.sem_count(mx), Some(0));
        // Outer give releases it
        assert!(!kernel.sem_give(mx).unwrap());
        assert_eq!(kernel.sem_count(mx), Some(1));
    }

    #[cfg(feature = "mutex")]
    #[test]
    fn non_recursive_self_reacquire_is_tolerated() {
        let (mut kernel, _, _) = setup();
        let mx = kernel.mutex_create(false).unwrap();
        assert_eq!(kernel.sem_take_step(mx, 0), Ok(SemTake::Acquired));
        assert_eq!(kernel.sem_take_step(mx, 0), Ok(SemTake::Acquired));
        // A single give releases it; the re-take was not counted
        assert!(!kernel.sem_give(mx).unwrap());
        assert_eq!(kernel.sem_count(mx), Some(1));
    }

    #[cfg(feature = "mutex")]
    #[test]
    fn only_the_holder_may_give_a_mutex() {
        let (mut kernel, _, b) = setup();
        let mx = kernel.mutex_create(false).unwrap();
        kernel.sem_take_step(mx, 0).unwrap();
        // Switch to b, which does not hold mx
        kernel.suspend(None).unwrap();
        assert_eq!(switch(&mut kernel), b);
        assert_eq!(kernel.sem_give(mx), Err(KernelError::BadArgument));
    }

    #[cfg(feature = "mutex-priority-inheritance")]
    #[test]
    fn inheritance_boosts_and_reverts_the_holder() {
        let mut kernel = TestKernel::new();
        kernel
            .init(leaked_stack(config::IDLE_STACK_SIZE), task_entry)
            .unwrap();
        let low = kernel
            .create_static(leaked_stack(256), task_entry, 0, 10)
            .unwrap();
        kernel.start().unwrap();
        assert_eq!(kernel.current_task(), Some(low));

        let mx = kernel.mutex_create(false).unwrap();
        let gate = kernel.sem_create_binary(false).unwrap();
        assert_eq!(kernel.sem_take_step(mx, 0), Ok(SemTake::Acquired));

        let mid = kernel
            .create_static(leaked_stack(256), task_entry, 0, 5)
            .unwrap();
        let high = kernel
            .create_static(leaked_stack(256), task_entry, 0, 1)
            .unwrap();

        // low parks on the gate while holding mx
        assert_eq!(
            kernel.sem_take_step(gate, config::MAX_DELAY),
            Ok(SemTake::Blocked)
        );
        assert_eq!(switch(&mut kernel), high);

        // high blocks on mx: low inherits priority 1
        assert_eq!(
            kernel.sem_take_step(mx, config::MAX_DELAY),
            Ok(SemTake::Blocked)
        );
        assert_eq!(kernel.task_priority(low), Some(1));
        assert_eq!(switch(&mut kernel), mid);

        // mid opens the gate; boosted low outranks mid and runs
        assert!(kernel.sem_give(gate).unwrap());
        assert_eq!(switch(&mut kernel), low);
        assert_eq!(kernel.sem_take_resume(gate), Ok(()));
        assert_eq!(kernel.sem_take_step(gate, 0), Ok(SemTake::Acquired));

        // low gives mx: its priority reverts, high is woken and wins
        assert!(kernel.sem_give(mx).unwrap());
        assert_eq!(kernel.task_priority(low), Some(10));
        assert_eq!(switch(&mut kernel), high);
        assert_eq!(kernel.sem_take_resume(mx), Ok(()));
        assert_eq!(kernel.sem_take_step(mx, 0), Ok(SemTake::Acquired));
        kernel.check_invariants();
    }
}
