//! Kernel status codes

/// Errors reported by fallible kernel calls
///
/// Every fallible operation returns one of these instead of unwinding. The
/// kernel never panics on a recoverable condition; the caller decides how to
/// react.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// API called from a context it is not allowed in (e.g. a blocking call
    /// from an interrupt handler)
    WrongContext,
    /// Stale handle, out-of-range priority or bit index, idle-task
    /// manipulation, zero item size, mismatched buffer length, or a mutex
    /// give by a non-holder
    BadArgument,
    /// Non-blocking take or receive found nothing available
    Empty,
    /// Non-blocking send found no room in the queue
    InsufficientSpace,
    /// A wait completed without success before its deadline
    Timeout,
    /// The waited-on object was deleted while waiting, or the handle refers
    /// to an object that no longer exists
    Deleted,
    /// Dynamic creation failed because no memory was available
    OutOfMemory,
    /// An internal invariant did not hold; any occurrence is a kernel bug
    Invariant,
}

/// Result alias used across the kernel
pub type Result<T> = core::result::Result<T, KernelError>;
