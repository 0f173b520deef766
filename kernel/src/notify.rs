//! Direct task notifications
//!
//! The lightest signalling primitive: every task carries a small set of
//! notification channels, each a pending bit plus a saturating count, living
//! inside the TCB rather than in a separate object. A sender targets a task
//! directly; no waiter list is involved, so the waker only has to flip the
//! target's state-list membership.

use crate::arch::Arch;
use crate::config;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::task::{EventResult, TaskId, TaskState};

/// Outcome of one non-blocking slice of a notification wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyWait {
    /// One pending notification was consumed
    Taken,
    /// The caller blocked waiting for the bit; switch contexts, then call
    /// [`Kernel::notify_wait_resume`]
    Blocked,
}

impl<A: Arch, const MAX_TASKS: usize> Kernel<A, MAX_TASKS> {
    /// Post one notification on `bit` to `target`
    ///
    /// Sets the pending bit and bumps its counter (saturating at 255). A
    /// target blocked in [`Kernel::notify_wait`] on that very bit is woken to
    /// the head of its ready list. Not allowed towards the idle task, the
    /// caller itself, or an out-of-range bit. Returns whether the woken
    /// target outranks the caller.
    pub fn notify_send(&mut self, target: TaskId, bit: u8) -> Result<bool, KernelError> {
        if bit as usize >= config::NOTIFY_CHANNELS {
            return Err(KernelError::BadArgument);
        }
        let current = self.current_task();
        if Some(target) == self.idle_task() || Some(target) == current {
            return Err(KernelError::BadArgument);
        }
        let woken = {
            let tcb = self.tasks.get_mut(target).ok_or(KernelError::BadArgument)?;
            tcb.notify_state |= 1 << bit;
            tcb.notify_counts[bit as usize] = tcb.notify_counts[bit as usize].saturating_add(1);
            if tcb.state == TaskState::Blocked && tcb.waiting_notify == Some(bit) {
                tcb.waiting_notify = None;
                tcb.event_result = EventResult::Ok;
                true
            } else {
                false
            }
        };
        if woken {
            self.make_ready(target, true);
            if let Some(current) = current {
                if self.tasks.tcb(target).priority < self.tasks.tcb(current).priority {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Fast path or blocking registration of a notification wait (self only)
    ///
    /// `Err(Empty)` reports a failed non-blocking attempt (`timeout == 0`).
    pub fn notify_wait_step(&mut self, bit: u8, timeout: u32) -> Result<NotifyWait, KernelError> {
        if bit as usize >= config::NOTIFY_CHANNELS {
            return Err(KernelError::BadArgument);
        }
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        if Some(current) == self.idle_task() {
            return Err(KernelError::BadArgument);
        }
        {
            let tcb = self.tasks.tcb_mut(current);
            if tcb.notify_state & (1 << bit) != 0 {
                tcb.notify_counts[bit as usize] = tcb.notify_counts[bit as usize].saturating_sub(1);
                if tcb.notify_counts[bit as usize] == 0 {
                    tcb.notify_state &= !(1 << bit);
                }
                return Ok(NotifyWait::Taken);
            }
            if timeout == 0 {
                return Err(KernelError::Empty);
            }
            tcb.waiting_notify = Some(bit);
            tcb.event_result = EventResult::Pending;
        }
        self.delay_current(timeout)?;
        Ok(NotifyWait::Blocked)
    }

    /// Decide the outcome of a notification wait after the wake
    ///
    /// `Ok(())` means a notification arrived (or the wake was spurious) and
    /// the wait should retry; `Err(Timeout)` is final.
    pub fn notify_wait_resume(&mut self) -> Result<(), KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        let tcb = self.tasks.tcb_mut(current);
        let result = tcb.event_result;
        tcb.event_result = EventResult::None;
        if result == EventResult::Timeout {
            tcb.waiting_notify = None;
            return Err(KernelError::Timeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::kernel::tests::{setup, switch};

    #[test]
    fn pending_notification_is_consumed_without_blocking() {
        let (mut kernel, a, b) = setup();
        // a hands the CPU to b so b can notify a
        kernel.suspend(None).unwrap();
        assert_eq!(switch(&mut kernel), b);
        kernel.resume(a).unwrap();
        // a is ready, not blocked in a wait: the notification is banked
        assert!(!kernel.notify_send(a, 2).unwrap());
        kernel.yield_current().unwrap();
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.notify_wait_step(2, 0), Ok(NotifyWait::Taken));
        assert_eq!(kernel.notify_wait_step(2, 0), Err(KernelError::Empty));
    }

    #[test]
    fn wait_blocks_until_send_and_wakes_at_head() {
        let (mut kernel, a, b) = setup();
        assert_eq!(
            kernel.notify_wait_step(0, config::MAX_DELAY),
            Ok(NotifyWait::Blocked)
        );
        assert_eq!(switch(&mut kernel), b);
        // The woken waiter outranks b, so send asks for a yield
        assert!(kernel.notify_send(a, 0).unwrap());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.notify_wait_resume(), Ok(()));
        assert_eq!(kernel.notify_wait_step(0, 0), Ok(NotifyWait::Taken));
    }

    #[test]
    fn send_on_a_different_bit_does_not_wake() {
        let (mut kernel, a, b) = setup();
        kernel.notify_wait_step(3, config::MAX_DELAY).unwrap();
        assert_eq!(switch(&mut kernel), b);
        assert!(!kernel.notify_send(a, 5).unwrap());
        assert_eq!(
            kernel.task_state(a),
            Some(crate::task::TaskState::Blocked)
        );
        // The bit-5 notification is banked for a later wait
        assert!(kernel.notify_send(a, 3).unwrap());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.notify_wait_resume(), Ok(()));
        assert_eq!(kernel.notify_wait_step(3, 0), Ok(NotifyWait::Taken));
        assert_eq!(kernel.notify_wait_step(5, 0), Ok(NotifyWait::Taken));
    }

    #[test]
    fn wait_times_out() {
        let (mut kernel, a, _) = setup();
        assert_eq!(kernel.notify_wait_step(1, 2), Ok(NotifyWait::Blocked));
        switch(&mut kernel);
        kernel.tick_update();
        assert!(kernel.tick_update());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.notify_wait_resume(), Err(KernelError::Timeout));
    }

    #[test]
    fn counters_saturate_at_255() {
        let (mut kernel, a, b) = setup();
        kernel.suspend(None).unwrap();
        assert_eq!(switch(&mut kernel), b);
        for _ in 0..300 {
            kernel.notify_send(a, 4).unwrap();
        }
        kernel.resume(a).unwrap();
        kernel.yield_current().unwrap();
        assert_eq!(switch(&mut kernel), a);
        for _ in 0..255 {
            assert_eq!(kernel.notify_wait_step(4, 0), Ok(NotifyWait::Taken));
        }
        assert_eq!(kernel.notify_wait_step(4, 0), Err(KernelError::Empty));
    }

    #[test]
    fn send_validates_target_and_bit() {
        let (mut kernel, a, b) = setup();
        let idle = kernel.idle_task().unwrap();
        assert_eq!(kernel.notify_send(idle, 0), Err(KernelError::BadArgument));
        assert_eq!(kernel.notify_send(a, 0), Err(KernelError::BadArgument));
        assert_eq!(
            kernel.notify_send(b, config::NOTIFY_CHANNELS as u8),
            Err(KernelError::BadArgument)
        );
    }
}
