//! Intrusive task lists
//!
//! Every scheduler structure (ready lists, the delay wheel, the suspend
//! list, object waiter lists) is a doubly linked list threaded through the
//! task table. Nodes carry `Option<TaskId>` links plus an owner tag naming
//! the list they are on (`None` iff detached), which makes move and remove
//! operations safe without a lookup. Each TCB carries two independent link
//! sets: the state node for its scheduling state, and the event node for a
//! waiter-list registration held simultaneously with the blocked state.
//!
//! Head/tail insertion and removal are O(1). Ordered insertion (by wake-up
//! tick, by priority) walks from the head and stops at the first element
//! with a strictly greater key, so equal keys preserve FIFO order.
//!
//! Misuse (removing a node from a list it is not on, inserting an attached
//! node) is a programming error enforced with debug assertions, not a
//! runtime result.

#[cfg(feature = "message-queue")]
use crate::queue::QueueId;
#[cfg(feature = "semaphore")]
use crate::sem::SemId;
use crate::task::{TaskId, TaskTable};

/// Which of a TCB's two link sets a list threads through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// Scheduling-state membership: ready, delay wheel, or suspend list
    State,
    /// Event-wait membership: an object's waiter list
    #[cfg(any(feature = "semaphore", feature = "message-queue"))]
    Event,
}

/// Identity of a kernel list, stored in each attached node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListTag {
    /// Ready list for one priority
    Ready(u8),
    /// One of the two delay-wheel lists (physical index)
    Blocked(u8),
    /// The suspend list
    Suspend,
    /// A semaphore's waiter list
    #[cfg(feature = "semaphore")]
    SemWaiters(SemId),
    /// A message queue's send-waiter list
    #[cfg(feature = "message-queue")]
    QueueSend(QueueId),
    /// A message queue's receive-waiter list
    #[cfg(feature = "message-queue")]
    QueueRecv(QueueId),
}

/// Link fields embedded in each TCB, one set per [`LinkKind`]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ListNode {
    pub(crate) next: Option<TaskId>,
    pub(crate) prev: Option<TaskId>,
    pub(crate) owner: Option<ListTag>,
}

impl ListNode {
    pub(crate) const fn detached() -> Self {
        ListNode {
            next: None,
            prev: None,
            owner: None,
        }
    }
}

/// A doubly linked list of tasks threaded through the task table
#[derive(Debug)]
pub(crate) struct TaskList {
    kind: LinkKind,
    tag: ListTag,
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: u16,
}

impl TaskList {
    pub(crate) const fn new(kind: LinkKind, tag: ListTag) -> Self {
        TaskList {
            kind,
            tag,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn head(&self) -> Option<TaskId> {
        self.head
    }

    pub(crate) fn len(&self) -> u16 {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append to the tail (FIFO order within a priority)
    pub(crate) fn push_back<const N: usize>(&mut self, tasks: &mut TaskTable<N>, id: TaskId) {
        debug_assert!(tasks.node(id, self.kind).owner.is_none());
        let node = tasks.node_mut(id, self.kind);
        node.prev = self.tail;
        node.next = None;
        node.owner = Some(self.tag);
        match self.tail {
            Some(t) => tasks.node_mut(t, self.kind).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Insert at the head
    pub(crate) fn push_front<const N: usize>(&mut self, tasks: &mut TaskTable<N>, id: TaskId) {
        debug_assert!(tasks.node(id, self.kind).owner.is_none());
        let node = tasks.node_mut(id, self.kind);
        node.prev = None;
        node.next = self.head;
        node.owner = Some(self.tag);
        match self.head {
            Some(h) => tasks.node_mut(h, self.kind).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Insert keeping the list sorted ascending by `key`; FIFO among equals
    fn insert_sorted<const N: usize>(
        &mut self,
        tasks: &mut TaskTable<N>,
        id: TaskId,
        key: impl Fn(&TaskTable<N>, TaskId) -> u32,
    ) {
        let new_key = key(tasks, id);
        let mut at = self.head;
        while let Some(c) = at {
            if key(tasks, c) > new_key {
                break;
            }
            at = tasks.node(c, self.kind).next;
        }
        match at {
            None => self.push_back(tasks, id),
            Some(c) => self.insert_before(tasks, id, c),
        }
    }

    /// Insert ordered by ascending wake-up tick (delay wheel)
    pub(crate) fn insert_by_wake<const N: usize>(&mut self, tasks: &mut TaskTable<N>, id: TaskId) {
        self.insert_sorted(tasks, id, |t, i| t.tcb(i).wake_up);
    }

    /// Insert ordered by ascending priority value (waiter lists)
    #[cfg(any(feature = "semaphore", feature = "message-queue"))]
    pub(crate) fn insert_by_priority<const N: usize>(
        &mut self,
        tasks: &mut TaskTable<N>,
        id: TaskId,
    ) {
        self.insert_sorted(tasks, id, |t, i| t.tcb(i).priority as u32);
    }

    fn insert_before<const N: usize>(&mut self, tasks: &mut TaskTable<N>, id: TaskId, at: TaskId) {
        debug_assert!(tasks.node(id, self.kind).owner.is_none());
        debug_assert_eq!(tasks.node(at, self.kind).owner, Some(self.tag));
        let prev = tasks.node(at, self.kind).prev;
        let node = tasks.node_mut(id, self.kind);
        node.prev = prev;
        node.next = Some(at);
        node.owner = Some(self.tag);
        tasks.node_mut(at, self.kind).prev = Some(id);
        match prev {
            Some(p) => tasks.node_mut(p, self.kind).next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;
    }

    /// Unlink `id` from this list
    pub(crate) fn remove<const N: usize>(&mut self, tasks: &mut TaskTable<N>, id: TaskId) {
        let node = *tasks.node(id, self.kind);
        debug_assert_eq!(node.owner, Some(self.tag));
        match node.prev {
            Some(p) => tasks.node_mut(p, self.kind).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => tasks.node_mut(n, self.kind).prev = node.prev,
            None => self.tail = node.prev,
        }
        *tasks.node_mut(id, self.kind) = ListNode::detached();
        self.len -= 1;
    }

    /// Detach and return the head, if any
    pub(crate) fn pop_front<const N: usize>(&mut self, tasks: &mut TaskTable<N>) -> Option<TaskId> {
        let head = self.head?;
        self.remove(tasks, head);
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Storage, TaskTable, Tcb};

    fn table() -> TaskTable<8> {
        TaskTable::new()
    }

    fn add_task(tasks: &mut TaskTable<8>, priority: u8, wake_up: u32) -> TaskId {
        let stack = Storage::Borrowed(alloc::vec![0u8; 128].leak());
        let mut tcb = Tcb::new(stack, priority, false);
        tcb.wake_up = wake_up;
        tasks.insert(tcb).unwrap()
    }

    #[test]
    fn fifo_push_and_pop() {
        let mut tasks = table();
        let mut list = TaskList::new(LinkKind::State, ListTag::Suspend);
        let a = add_task(&mut tasks, 1, 0);
        let b = add_task(&mut tasks, 1, 0);
        let c = add_task(&mut tasks, 1, 0);
        list.push_back(&mut tasks, a);
        list.push_back(&mut tasks, b);
        list.push_front(&mut tasks, c);
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(&mut tasks), Some(c));
        assert_eq!(list.pop_front(&mut tasks), Some(a));
        assert_eq!(list.pop_front(&mut tasks), Some(b));
        assert_eq!(list.pop_front(&mut tasks), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle_relinks() {
        let mut tasks = table();
        let mut list = TaskList::new(LinkKind::State, ListTag::Suspend);
        let a = add_task(&mut tasks, 1, 0);
        let b = add_task(&mut tasks, 1, 0);
        let c = add_task(&mut tasks, 1, 0);
        for id in [a, b, c] {
            list.push_back(&mut tasks, id);
        }
        list.remove(&mut tasks, b);
        assert!(tasks.node(b, LinkKind::State).owner.is_none());
        assert_eq!(list.pop_front(&mut tasks), Some(a));
        assert_eq!(list.pop_front(&mut tasks), Some(c));
    }

    #[test]
    fn wake_order_is_ascending_with_fifo_ties() {
        let mut tasks = table();
        let mut list = TaskList::new(LinkKind::State, ListTag::Blocked(0));
        let late = add_task(&mut tasks, 1, 300);
        let early = add_task(&mut tasks, 1, 100);
        let tie_first = add_task(&mut tasks, 1, 200);
        let tie_second = add_task(&mut tasks, 1, 200);
        list.insert_by_wake(&mut tasks, late);
        list.insert_by_wake(&mut tasks, early);
        list.insert_by_wake(&mut tasks, tie_first);
        list.insert_by_wake(&mut tasks, tie_second);
        assert_eq!(list.pop_front(&mut tasks), Some(early));
        assert_eq!(list.pop_front(&mut tasks), Some(tie_first));
        assert_eq!(list.pop_front(&mut tasks), Some(tie_second));
        assert_eq!(list.pop_front(&mut tasks), Some(late));
    }

    #[cfg(feature = "semaphore")]
    #[test]
    fn priority_order_walks_from_head() {
        let mut tasks = table();
        let mut list = TaskList::new(LinkKind::State, ListTag::Suspend);
        let low = add_task(&mut tasks, 9, 0);
        let high = add_task(&mut tasks, 2, 0);
        let mid = add_task(&mut tasks, 5, 0);
        list.insert_by_priority(&mut tasks, low);
        list.insert_by_priority(&mut tasks, high);
        list.insert_by_priority(&mut tasks, mid);
        assert_eq!(list.pop_front(&mut tasks), Some(high));
        assert_eq!(list.pop_front(&mut tasks), Some(mid));
        assert_eq!(list.pop_front(&mut tasks), Some(low));
    }
}
