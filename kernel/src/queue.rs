//! Bounded message queues with rendezvous
//!
//! Fixed-size records move through a byte ring buffer. A send finding a
//! parked receiver (or a receive finding a parked sender on an empty queue)
//! hands the payload over directly without touching the ring. Payloads of
//! blocked tasks stage through the TCB's bounded scratch buffer, so no
//! pointer into another task's stack frame is ever held.
//!
//! Like the semaphore module, blocking operations split into a *step* under
//! the critical section and a *resume* verdict after the wake.

use crate::arch::Arch;
use crate::config;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::list::{LinkKind, ListTag, TaskList};
use crate::task::{EventResult, Storage};

/// Handle to a message queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueId {
    pub(crate) index: u8,
    pub(crate) generation: u8,
}

/// How a send treats a full queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendMode {
    /// FIFO append; blocks (or reports no space) when full
    Back,
    /// Drop the oldest record to make room; never blocks
    Overwrite,
}

/// Outcome of one non-blocking slice of a send
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueSend {
    /// The payload was enqueued or handed to a receiver; `preempt` reports
    /// whether the woken receiver outranks the caller
    Delivered { preempt: bool },
    /// The caller was registered as a send waiter and blocked
    Blocked,
}

/// Outcome of one non-blocking slice of a receive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRecv {
    /// A record was copied into the caller's buffer; `preempt` reports
    /// whether a woken sender outranks the caller
    Received { preempt: bool },
    /// The caller was registered as a receive waiter and blocked
    Blocked,
}

pub(crate) struct MsgQueue {
    item_size: usize,
    capacity_bytes: usize,
    storage: Storage,
    /// Ring state in bytes; records never straddle the wrap because the
    /// capacity is a multiple of the item size
    front: usize,
    used: usize,
    pub(crate) send_waiters: TaskList,
    pub(crate) recv_waiters: TaskList,
}

impl MsgQueue {
    fn is_full(&self) -> bool {
        self.used + self.item_size > self.capacity_bytes
    }

    fn is_empty(&self) -> bool {
        self.used < self.item_size
    }

    fn enqueue(&mut self, payload: &[u8]) {
        debug_assert!(!self.is_full());
        let rear = (self.front + self.used) % self.capacity_bytes;
        self.storage.as_mut_slice()[rear..rear + payload.len()].copy_from_slice(payload);
        self.used += payload.len();
    }

    fn dequeue(&mut self, out: &mut [u8]) {
        debug_assert!(!self.is_empty());
        let n = out.len();
        out.copy_from_slice(&self.storage.as_slice()[self.front..self.front + n]);
        self.front = (self.front + n) % self.capacity_bytes;
        self.used -= n;
    }

    fn drop_oldest(&mut self) {
        debug_assert!(!self.is_empty());
        self.front = (self.front + self.item_size) % self.capacity_bytes;
        self.used -= self.item_size;
    }

    fn peek(&self, out: &mut [u8]) {
        debug_assert!(!self.is_empty());
        let n = out.len();
        out.copy_from_slice(&self.storage.as_slice()[self.front..self.front + n]);
    }
}

struct Slot {
    generation: u8,
    queue: Option<MsgQueue>,
}

pub(crate) struct QueueTable {
    slots: heapless::Vec<Slot, { config::MAX_QUEUES }>,
}

impl QueueTable {
    pub(crate) fn new() -> Self {
        QueueTable {
            slots: heapless::Vec::new(),
        }
    }

    fn insert(&mut self, make: impl FnOnce(QueueId) -> MsgQueue) -> Option<QueueId> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.queue.is_none() {
                let id = QueueId {
                    index: index as u8,
                    generation: slot.generation,
                };
                slot.queue = Some(make(id));
                return Some(id);
            }
        }
        let id = QueueId {
            index: self.slots.len() as u8,
            generation: 0,
        };
        let queue = make(id);
        self.slots
            .push(Slot {
                generation: 0,
                queue: Some(queue),
            })
            .ok()?;
        Some(id)
    }

    fn remove(&mut self, id: QueueId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.queue.is_some() => {
                slot.queue = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    fn get(&self, id: QueueId) -> Option<&MsgQueue> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.queue.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: QueueId) -> Option<&mut MsgQueue> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.queue.as_mut())
    }
}

impl<A: Arch, const MAX_TASKS: usize> Kernel<A, MAX_TASKS> {
    fn queue_insert(
        &mut self,
        storage: Storage,
        item_size: usize,
        capacity: usize,
    ) -> Result<QueueId, KernelError> {
        if item_size == 0 || capacity == 0 || item_size > config::MAX_MSG_ITEM {
            return Err(KernelError::BadArgument);
        }
        let capacity_bytes = item_size
            .checked_mul(capacity)
            .ok_or(KernelError::BadArgument)?;
        if storage.len() < capacity_bytes {
            return Err(KernelError::BadArgument);
        }
        self.queues
            .insert(|id| MsgQueue {
                item_size,
                capacity_bytes,
                storage,
                front: 0,
                used: 0,
                send_waiters: TaskList::new(LinkKind::Event, ListTag::QueueSend(id)),
                recv_waiters: TaskList::new(LinkKind::Event, ListTag::QueueRecv(id)),
            })
            .ok_or(KernelError::OutOfMemory)
    }

    /// Create a queue of `capacity` records of `item_size` bytes with
    /// heap-allocated storage
    pub fn queue_create(&mut self, item_size: usize, capacity: usize) -> Result<QueueId, KernelError> {
        if item_size == 0 || capacity == 0 || item_size > config::MAX_MSG_ITEM {
            return Err(KernelError::BadArgument);
        }
        let bytes = item_size
            .checked_mul(capacity)
            .ok_or(KernelError::BadArgument)?;
        let mut storage = alloc::vec::Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|_| KernelError::OutOfMemory)?;
        storage.resize(bytes, 0);
        self.queue_insert(
            Storage::Owned(storage.into_boxed_slice()),
            item_size,
            capacity,
        )
    }

    /// Create a queue over caller-provided storage
    ///
    /// The storage must hold at least `item_size * capacity` bytes.
    pub fn queue_create_static(
        &mut self,
        storage: &'static mut [u8],
        item_size: usize,
        capacity: usize,
    ) -> Result<QueueId, KernelError> {
        self.queue_insert(Storage::Borrowed(storage), item_size, capacity)
    }

    /// Records currently held in the ring
    pub fn queue_len(&self, id: QueueId) -> Option<usize> {
        self.queues.get(id).map(|q| q.used / q.item_size)
    }

    /// Fast path or waiter registration of a send
    ///
    /// `payload` must be exactly one record. `Err(InsufficientSpace)` reports
    /// a failed non-blocking FIFO send to a full queue; overwrite mode drops
    /// the oldest record instead and never blocks.
    pub fn queue_send_step(
        &mut self,
        id: QueueId,
        payload: &[u8],
        mode: SendMode,
        timeout: u32,
    ) -> Result<QueueSend, KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        {
            let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
            if payload.len() != queue.item_size {
                return Err(KernelError::BadArgument);
            }
        }

        // Rendezvous: hand the payload straight to the longest-waiting
        // receiver
        let receiver = self
            .queues
            .get_mut(id)
            .ok_or(KernelError::BadArgument)?
            .recv_waiters
            .pop_front(&mut self.tasks);
        if let Some(receiver) = receiver {
            let tcb = self.tasks.tcb_mut(receiver);
            tcb.msg_scratch.clear();
            let _ = tcb.msg_scratch.extend_from_slice(payload);
            tcb.event_result = EventResult::Ok;
            self.make_ready(receiver, false);
            let preempt =
                self.tasks.tcb(receiver).priority < self.tasks.tcb(current).priority;
            return Ok(QueueSend::Delivered { preempt });
        }

        {
            let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
            if !queue.is_full() {
                queue.enqueue(payload);
                return Ok(QueueSend::Delivered { preempt: false });
            }
            if mode == SendMode::Overwrite {
                queue.drop_oldest();
                queue.enqueue(payload);
                return Ok(QueueSend::Delivered { preempt: false });
            }
        }

        if timeout == 0 {
            return Err(KernelError::InsufficientSpace);
        }

        // Stage the payload and park on the send-waiter list
        {
            let tcb = self.tasks.tcb_mut(current);
            tcb.msg_scratch.clear();
            let _ = tcb.msg_scratch.extend_from_slice(payload);
            tcb.event_result = EventResult::Pending;
        }
        let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
        queue.send_waiters.insert_by_priority(&mut self.tasks, current);
        self.delay_current(timeout)?;
        Ok(QueueSend::Blocked)
    }

    /// Decide the outcome of a blocked send after the wake
    pub fn queue_send_resume(&mut self, _id: QueueId) -> Result<(), KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        let result = self.tasks.tcb(current).event_result;
        self.tasks.tcb_mut(current).event_result = EventResult::None;
        match result {
            EventResult::Ok => Ok(()),
            EventResult::Deleted => Err(KernelError::Deleted),
            _ => {
                // Timed out: unregister before reporting
                self.detach_event(current);
                Err(KernelError::Timeout)
            }
        }
    }

    /// Interrupt-context send: never blocks
    ///
    /// Returns whether a woken receiver outranks the interrupted task; the
    /// ISR epilogue pends a context switch on `true`.
    pub fn queue_send_from_isr(
        &mut self,
        id: QueueId,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<bool, KernelError> {
        {
            let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
            if payload.len() != queue.item_size {
                return Err(KernelError::BadArgument);
            }
        }
        let receiver = self
            .queues
            .get_mut(id)
            .ok_or(KernelError::BadArgument)?
            .recv_waiters
            .pop_front(&mut self.tasks);
        if let Some(receiver) = receiver {
            let tcb = self.tasks.tcb_mut(receiver);
            tcb.msg_scratch.clear();
            let _ = tcb.msg_scratch.extend_from_slice(payload);
            tcb.event_result = EventResult::Ok;
            self.make_ready(receiver, false);
            if let Some(current) = self.current_task() {
                if self.tasks.tcb(receiver).priority < self.tasks.tcb(current).priority {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
        if !queue.is_full() {
            queue.enqueue(payload);
            return Ok(false);
        }
        if mode == SendMode::Overwrite {
            queue.drop_oldest();
            queue.enqueue(payload);
            return Ok(false);
        }
        Err(KernelError::InsufficientSpace)
    }

    /// Fast path or waiter registration of a receive
    ///
    /// `out` must be exactly one record. `Err(Empty)` reports a failed
    /// non-blocking attempt.
    pub fn queue_recv_step(
        &mut self,
        id: QueueId,
        out: &mut [u8],
        timeout: u32,
    ) -> Result<QueueRecv, KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        {
            let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
            if out.len() != queue.item_size {
                return Err(KernelError::BadArgument);
            }
            if !queue.is_empty() {
                queue.dequeue(out);
                // A record left the ring: top it up from a parked sender
                let sender = queue.send_waiters.pop_front(&mut self.tasks);
                let mut preempt = false;
                if let Some(sender) = sender {
                    let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
                    let scratch =
                        core::mem::take(&mut self.tasks.tcb_mut(sender).msg_scratch);
                    queue.enqueue(&scratch);
                    self.tasks.tcb_mut(sender).event_result = EventResult::Ok;
                    self.make_ready(sender, false);
                    preempt = self.tasks.tcb(sender).priority
                        < self.tasks.tcb(current).priority;
                }
                return Ok(QueueRecv::Received { preempt });
            }
        }

        // Empty ring with a parked sender: direct rendezvous
        let sender = self
            .queues
            .get_mut(id)
            .ok_or(KernelError::BadArgument)?
            .send_waiters
            .pop_front(&mut self.tasks);
        if let Some(sender) = sender {
            let tcb = self.tasks.tcb_mut(sender);
            out.copy_from_slice(&tcb.msg_scratch);
            tcb.event_result = EventResult::Ok;
            self.make_ready(sender, false);
            let preempt =
                self.tasks.tcb(sender).priority < self.tasks.tcb(current).priority;
            return Ok(QueueRecv::Received { preempt });
        }

        if timeout == 0 {
            return Err(KernelError::Empty);
        }

        self.tasks.tcb_mut(current).event_result = EventResult::Pending;
        let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
        queue.recv_waiters.insert_by_priority(&mut self.tasks, current);
        self.delay_current(timeout)?;
        Ok(QueueRecv::Blocked)
    }

    /// Decide the outcome of a blocked receive after the wake, copying the
    /// handed-over record into `out` on success
    pub fn queue_recv_resume(&mut self, _id: QueueId, out: &mut [u8]) -> Result<(), KernelError> {
        let current = self.current_task().ok_or(KernelError::WrongContext)?;
        let result = self.tasks.tcb(current).event_result;
        self.tasks.tcb_mut(current).event_result = EventResult::None;
        match result {
            EventResult::Ok => {
                let tcb = self.tasks.tcb_mut(current);
                out.copy_from_slice(&tcb.msg_scratch);
                tcb.msg_scratch.clear();
                Ok(())
            }
            EventResult::Deleted => Err(KernelError::Deleted),
            _ => {
                self.detach_event(current);
                Err(KernelError::Timeout)
            }
        }
    }

    /// Copy the oldest record without removing it
    pub fn queue_peek(&mut self, id: QueueId, out: &mut [u8]) -> Result<(), KernelError> {
        let queue = self.queues.get(id).ok_or(KernelError::BadArgument)?;
        if out.len() != queue.item_size {
            return Err(KernelError::BadArgument);
        }
        if queue.is_empty() {
            return Err(KernelError::Empty);
        }
        queue.peek(out);
        Ok(())
    }

    /// Drop every record and release all waiters with a timeout verdict
    ///
    /// Returns whether any waiter was woken.
    pub fn queue_clear(&mut self, id: QueueId) -> Result<bool, KernelError> {
        {
            let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
            queue.front = 0;
            queue.used = 0;
        }
        let mut woke = false;
        for recv in [false, true] {
            loop {
                let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
                let waiter = if recv {
                    queue.recv_waiters.pop_front(&mut self.tasks)
                } else {
                    queue.send_waiters.pop_front(&mut self.tasks)
                };
                let Some(waiter) = waiter else { break };
                self.tasks.tcb_mut(waiter).event_result = EventResult::Timeout;
                self.make_ready(waiter, false);
                woke = true;
            }
        }
        Ok(woke)
    }

    /// Release all waiters with a deleted verdict, free owned storage and
    /// retire the handle
    pub fn queue_delete(&mut self, id: QueueId) -> Result<bool, KernelError> {
        self.queues.get(id).ok_or(KernelError::BadArgument)?;
        let mut woke = false;
        for recv in [false, true] {
            loop {
                let queue = self.queues.get_mut(id).ok_or(KernelError::BadArgument)?;
                let waiter = if recv {
                    queue.recv_waiters.pop_front(&mut self.tasks)
                } else {
                    queue.send_waiters.pop_front(&mut self.tasks)
                };
                let Some(waiter) = waiter else { break };
                self.tasks.tcb_mut(waiter).event_result = EventResult::Deleted;
                self.make_ready(waiter, false);
                woke = true;
            }
        }
        self.queues.remove(id);
        Ok(woke)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::kernel::tests::{setup, switch};
    use crate::task::TaskState;

    #[test]
    fn create_validates_geometry() {
        let (mut kernel, _, _) = setup();
        assert_eq!(kernel.queue_create(0, 4), Err(KernelError::BadArgument));
        assert_eq!(kernel.queue_create(4, 0), Err(KernelError::BadArgument));
        assert_eq!(
            kernel.queue_create(config::MAX_MSG_ITEM + 1, 1),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn send_then_recv_is_byte_identical() {
        let (mut kernel, _, _) = setup();
        let q = kernel.queue_create(4, 2).unwrap();
        let sent = 0xDEAD_BEEFu32.to_le_bytes();
        assert_eq!(
            kernel.queue_send_step(q, &sent, SendMode::Back, 0),
            Ok(QueueSend::Delivered { preempt: false })
        );
        let mut got = [0u8; 4];
        assert_eq!(
            kernel.queue_recv_step(q, &mut got, 0),
            Ok(QueueRecv::Received { preempt: false })
        );
        assert_eq!(got, sent);
        assert_eq!(kernel.queue_recv_step(q, &mut got, 0), Err(KernelError::Empty));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (mut kernel, _, _) = setup();
        let q = kernel.queue_create(1, 3).unwrap();
        for byte in [1u8, 2, 3] {
            kernel.queue_send_step(q, &[byte], SendMode::Back, 0).unwrap();
        }
        assert_eq!(
            kernel.queue_send_step(q, &[4], SendMode::Back, 0),
            Err(KernelError::InsufficientSpace)
        );
        let mut out = [0u8; 1];
        for expect in [1u8, 2, 3] {
            kernel.queue_recv_step(q, &mut out, 0).unwrap();
            assert_eq!(out[0], expect);
        }
    }

    #[test]
    fn overwrite_drops_the_oldest() {
        let (mut kernel, _, _) = setup();
        let q = kernel.queue_create(1, 1).unwrap();
        kernel.queue_send_step(q, &[7], SendMode::Back, 0).unwrap();
        assert_eq!(
            kernel.queue_send_step(q, &[8], SendMode::Overwrite, 0),
            Ok(QueueSend::Delivered { preempt: false })
        );
        let mut out = [0u8; 1];
        kernel.queue_recv_step(q, &mut out, 0).unwrap();
        assert_eq!(out[0], 8);
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut kernel, _, _) = setup();
        let q = kernel.queue_create(1, 2).unwrap();
        let mut out = [0u8; 1];
        assert_eq!(kernel.queue_peek(q, &mut out), Err(KernelError::Empty));
        kernel.queue_send_step(q, &[9], SendMode::Back, 0).unwrap();
        kernel.queue_peek(q, &mut out).unwrap();
        assert_eq!(out[0], 9);
        assert_eq!(kernel.queue_len(q), Some(1));
    }

    #[test]
    fn receiver_first_rendezvous_skips_the_ring() {
        let (mut kernel, a, b) = setup();
        let q = kernel.queue_create(4, 1).unwrap();
        let mut got = [0u8; 4];
        // a parks waiting for a record
        assert_eq!(
            kernel.queue_recv_step(q, &mut got, config::MAX_DELAY),
            Ok(QueueRecv::Blocked)
        );
        assert_eq!(switch(&mut kernel), b);
        // b's send goes straight to a; the ring stays empty
        let sent = 0x0102_0304u32.to_le_bytes();
        assert_eq!(
            kernel.queue_send_step(q, &sent, SendMode::Back, 0),
            Ok(QueueSend::Delivered { preempt: true })
        );
        assert_eq!(kernel.queue_len(q), Some(0));
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.queue_recv_resume(q, &mut got), Ok(()));
        assert_eq!(got, sent);
    }

    #[test]
    fn full_queue_blocks_sender_until_handoff() {
        let (mut kernel, a, b) = setup();
        let q = kernel.queue_create(1, 1).unwrap();
        kernel.queue_send_step(q, &[1], SendMode::Back, 0).unwrap();
        // a blocks trying to push a second record
        assert_eq!(
            kernel.queue_send_step(q, &[2], SendMode::Back, config::MAX_DELAY),
            Ok(QueueSend::Blocked)
        );
        assert_eq!(switch(&mut kernel), b);
        // b's receive frees a slot and completes a's send in the same step
        let mut out = [0u8; 1];
        assert_eq!(
            kernel.queue_recv_step(q, &mut out, 0),
            Ok(QueueRecv::Received { preempt: true })
        );
        assert_eq!(out[0], 1);
        assert_eq!(kernel.queue_len(q), Some(1));
        assert_eq!(kernel.task_state(a), Some(TaskState::Ready));
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.queue_send_resume(q), Ok(()));
        kernel.queue_recv_step(q, &mut out, 0).unwrap();
        assert_eq!(out[0], 2);
    }

    #[test]
    fn recv_timeout_unregisters_the_waiter() {
        let (mut kernel, a, _) = setup();
        let q = kernel.queue_create(1, 1).unwrap();
        let mut out = [0u8; 1];
        assert_eq!(
            kernel.queue_recv_step(q, &mut out, 2),
            Ok(QueueRecv::Blocked)
        );
        switch(&mut kernel);
        kernel.tick_update();
        assert!(kernel.tick_update());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(
            kernel.queue_recv_resume(q, &mut out),
            Err(KernelError::Timeout)
        );
        // A later send must enqueue rather than chase a stale waiter
        kernel.queue_send_step(q, &[5], SendMode::Back, 0).unwrap();
        assert_eq!(kernel.queue_len(q), Some(1));
    }

    #[test]
    fn send_from_isr_delivers_and_reports() {
        let (mut kernel, a, b) = setup();
        let q = kernel.queue_create(1, 1).unwrap();
        let mut out = [0u8; 1];
        kernel.queue_recv_step(q, &mut out, config::MAX_DELAY).unwrap();
        assert_eq!(switch(&mut kernel), b);
        assert_eq!(kernel.queue_send_from_isr(q, &[3], SendMode::Back), Ok(true));
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(kernel.queue_recv_resume(q, &mut out), Ok(()));
        assert_eq!(out[0], 3);
        // Full-queue FIFO send from an interrupt fails instead of blocking
        kernel.queue_send_from_isr(q, &[4], SendMode::Back).unwrap();
        assert_eq!(
            kernel.queue_send_from_isr(q, &[5], SendMode::Back),
            Err(KernelError::InsufficientSpace)
        );
        assert_eq!(kernel.queue_send_from_isr(q, &[6], SendMode::Overwrite), Ok(false));
    }

    #[test]
    fn clear_resets_and_releases_waiters() {
        let (mut kernel, a, _) = setup();
        let q = kernel.queue_create(1, 1).unwrap();
        let mut out = [0u8; 1];
        kernel.queue_recv_step(q, &mut out, config::MAX_DELAY).unwrap();
        switch(&mut kernel);
        assert!(kernel.queue_clear(q).unwrap());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(
            kernel.queue_recv_resume(q, &mut out),
            Err(KernelError::Timeout)
        );
    }

    #[test]
    fn delete_releases_waiters_and_retires_handle() {
        let (mut kernel, a, _) = setup();
        let q = kernel.queue_create(1, 1).unwrap();
        let mut out = [0u8; 1];
        kernel.queue_recv_step(q, &mut out, config::MAX_DELAY).unwrap();
        switch(&mut kernel);
        assert!(kernel.queue_delete(q).unwrap());
        assert_eq!(switch(&mut kernel), a);
        assert_eq!(
            kernel.queue_recv_resume(q, &mut out),
            Err(KernelError::Deleted)
        );
        assert_eq!(
            kernel.queue_send_step(q, &[0], SendMode::Back, 0),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn producer_consumer_sequence_arrives_in_order() {
        let (mut kernel, a, b) = setup();
        let q = kernel.queue_create(4, 2).unwrap();
        let mut received = alloc::vec::Vec::new();
        // a produces 1..=5, blocking when the ring is full; b consumes
        let mut next = 1u32;
        let mut blocked_on = None;
        while received.len() < 5 {
            if kernel.current_task() == Some(a) {
                if next <= 5 {
                    match kernel
                        .queue_send_step(q, &next.to_le_bytes(), SendMode::Back, config::MAX_DELAY)
                        .unwrap()
                    {
                        QueueSend::Delivered { .. } => next += 1,
                        QueueSend::Blocked => {
                            blocked_on = Some(next);
                            next += 1;
                            switch(&mut kernel);
                        }
                    }
                } else {
                    kernel.suspend(None).unwrap();
                    switch(&mut kernel);
                }
            } else {
                let mut out = [0u8; 4];
                match kernel.queue_recv_step(q, &mut out, 0) {
                    Ok(QueueRecv::Received { .. }) => {
                        received.push(u32::from_le_bytes(out));
                        if blocked_on.take().is_some() {
                            // The parked sender finished its send during the
                            // receive; let it run and settle the verdict
                            switch(&mut kernel);
                            assert_eq!(kernel.queue_send_resume(q), Ok(()));
                        }
                    }
                    Err(KernelError::Empty) => {
                        kernel.yield_current().unwrap();
                        switch(&mut kernel);
                    }
                    other => panic!("unexpected receive outcome: {:?}", other),
                }
            }
        }
        assert_eq!(received, [1, 2, 3, 4, 5]);
        kernel.check_invariants();
    }
}
