//! Task control blocks and the task table

use crate::config;
use crate::error::KernelError;
use crate::list::{LinkKind, ListNode};

use alloc::boxed::Box;

/// Task entry point: receives the creation argument and never returns
pub type TaskEntry = fn(usize) -> !;

/// Handle to a task
///
/// Generation-tagged index into the kernel's task table. A handle held after
/// the task was deleted stops resolving instead of aliasing the slot's next
/// occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId {
    pub(crate) index: u8,
    pub(crate) generation: u8,
}

/// Scheduling states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    /// Eligible to run, parked on a ready list
    Ready,
    /// Waiting on the delay wheel, possibly also on an object's waiter list
    Blocked,
    /// Currently executing; at most one task is in this state
    Running,
    /// Removed from scheduling until explicitly resumed
    Suspended,
}

/// Why a blocked task was released, written by the waker and read by the
/// wakee after it resumes
#[cfg(any(
    feature = "semaphore",
    feature = "message-queue",
    feature = "task-notify"
))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventResult {
    None,
    Pending,
    Ok,
    Timeout,
    Deleted,
}

/// Backing memory for a task stack or a queue ring
///
/// `Owned` storage comes from the heap and is released when the kernel drops
/// it (the idle task's deferred reap for stacks, `delete` for queues);
/// `Borrowed` storage belongs to the caller for the lifetime of the program.
pub(crate) enum Storage {
    Owned(Box<[u8]>),
    Borrowed(&'static mut [u8]),
}

impl Storage {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(b) => b,
            Storage::Borrowed(s) => s,
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(b) => b,
            Storage::Borrowed(s) => s,
        }
    }

    pub(crate) fn base(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Task control block
pub(crate) struct Tcb {
    /// Stack pointer saved while the task is not running
    pub(crate) saved_sp: usize,
    pub(crate) stack: Storage,
    pub(crate) state: TaskState,
    /// 0 = highest .. `PRIORITY_COUNT - 1` = lowest (idle)
    pub(crate) priority: u8,
    /// Whether the idle task may free this TCB and its stack on deletion
    pub(crate) dynamic: bool,
    /// Tick at which a timed block expires; `MAX_DELAY` parks forever
    pub(crate) wake_up: u32,
    /// Tick of the most recent wake, the phase reference for `delay_until`
    pub(crate) last_wake: u32,
    pub(crate) state_node: ListNode,
    #[cfg(any(feature = "semaphore", feature = "message-queue"))]
    pub(crate) event_node: ListNode,
    #[cfg(any(
        feature = "semaphore",
        feature = "message-queue",
        feature = "task-notify"
    ))]
    pub(crate) event_result: EventResult,
    /// Payload staging area for queue rendezvous and handoff
    #[cfg(feature = "message-queue")]
    pub(crate) msg_scratch: heapless::Vec<u8, { config::MAX_MSG_ITEM }>,
    /// Pending-notification bits
    #[cfg(feature = "task-notify")]
    pub(crate) notify_state: u32,
    /// Per-bit pending counters, saturating at 255
    #[cfg(feature = "task-notify")]
    pub(crate) notify_counts: [u8; config::NOTIFY_CHANNELS],
    /// Bit index this task is blocked on inside `notify_wait`, if any
    #[cfg(feature = "task-notify")]
    pub(crate) waiting_notify: Option<u8>,
    /// Deepest observed stack use in bytes
    #[cfg(feature = "high-water-mark")]
    pub(crate) high_water_mark: usize,
}

impl Tcb {
    pub(crate) fn new(stack: Storage, priority: u8, dynamic: bool) -> Self {
        Tcb {
            saved_sp: 0,
            stack,
            state: TaskState::Ready,
            priority,
            dynamic,
            wake_up: 0,
            last_wake: 0,
            state_node: ListNode::detached(),
            #[cfg(any(feature = "semaphore", feature = "message-queue"))]
            event_node: ListNode::detached(),
            #[cfg(any(
                feature = "semaphore",
                feature = "message-queue",
                feature = "task-notify"
            ))]
            event_result: EventResult::None,
            #[cfg(feature = "message-queue")]
            msg_scratch: heapless::Vec::new(),
            #[cfg(feature = "task-notify")]
            notify_state: 0,
            #[cfg(feature = "task-notify")]
            notify_counts: [0; config::NOTIFY_CHANNELS],
            #[cfg(feature = "task-notify")]
            waiting_notify: None,
            #[cfg(feature = "high-water-mark")]
            high_water_mark: 0,
        }
    }
}

struct Slot {
    generation: u8,
    tcb: Option<Tcb>,
}

/// Fixed-capacity slab of task control blocks
pub(crate) struct TaskTable<const N: usize> {
    slots: heapless::Vec<Slot, N>,
}

impl<const N: usize> TaskTable<N> {
    pub(crate) fn new() -> Self {
        debug_assert!(N <= 256, "task ids are 8-bit indices");
        TaskTable {
            slots: heapless::Vec::new(),
        }
    }

    /// Store a TCB, reusing a vacated slot when one exists
    pub(crate) fn insert(&mut self, tcb: Tcb) -> Result<TaskId, KernelError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.tcb.is_none() {
                slot.tcb = Some(tcb);
                return Ok(TaskId {
                    index: index as u8,
                    generation: slot.generation,
                });
            }
        }
        let index = self.slots.len() as u8;
        self.slots
            .push(Slot {
                generation: 0,
                tcb: Some(tcb),
            })
            .map_err(|_| KernelError::OutOfMemory)?;
        Ok(TaskId {
            index,
            generation: 0,
        })
    }

    /// Drop a TCB (releasing owned stack memory) and retire its handle
    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.tcb.is_some() => {
                slot.tcb = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&Tcb> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.tcb.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.tcb.as_mut())
    }

    /// Resolve a handle that is known-live by construction
    pub(crate) fn tcb(&self, id: TaskId) -> &Tcb {
        self.get(id).expect("stale task id")
    }

    pub(crate) fn tcb_mut(&mut self, id: TaskId) -> &mut Tcb {
        self.get_mut(id).expect("stale task id")
    }

    pub(crate) fn node(&self, id: TaskId, kind: LinkKind) -> &ListNode {
        let tcb = self.tcb(id);
        match kind {
            LinkKind::State => &tcb.state_node,
            #[cfg(any(feature = "semaphore", feature = "message-queue"))]
            LinkKind::Event => &tcb.event_node,
        }
    }

    pub(crate) fn node_mut(&mut self, id: TaskId, kind: LinkKind) -> &mut ListNode {
        let tcb = self.tcb_mut(id);
        match kind {
            LinkKind::State => &mut tcb.state_node,
            #[cfg(any(feature = "semaphore", feature = "message-queue"))]
            LinkKind::Event => &mut tcb.event_node,
        }
    }
}
