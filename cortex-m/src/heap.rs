//! Kernel heap
//!
//! Dynamic task stacks, TCBs and queue storage come from this allocator.
//! The allocator internals are interchangeable; the kernel only relies on
//! the global alloc/dealloc contract and treats allocation failure as a
//! reportable error.

use core::mem::MaybeUninit;

use linked_list_allocator::LockedHeap;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hand a memory region to the kernel heap
///
/// Must be called once, before the first dynamic creation. Subsequent calls
/// are ignored.
pub fn init_heap(region: &'static mut [MaybeUninit<u8>]) {
    let mut heap = HEAP.lock();
    if heap.size() == 0 {
        heap.init_from_slice(region);
    }
}

/// Bytes currently available for allocation
pub fn free_heap_bytes() -> usize {
    HEAP.lock().free()
}
