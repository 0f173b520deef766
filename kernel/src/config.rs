//! Build-time kernel configuration
//!
//! These constants size the kernel's fixed tables and set its timing
//! defaults. Optional subsystems (semaphores, message queues, task
//! notifications, stack instrumentation) are Cargo features; disabling a
//! feature removes its data and code paths without changing the behaviour of
//! what remains.

/// Requested number of task priorities (0 = highest)
pub const PRIORITY_GROUPS: usize = 16;

/// Priorities actually provisioned: `PRIORITY_GROUPS` rounded up to the
/// bitmap widths the find-highest-set-bit lookup supports
pub const PRIORITY_COUNT: usize = if PRIORITY_GROUPS <= 8 {
    8
} else if PRIORITY_GROUPS <= 16 {
    16
} else {
    32
};

/// Logical width of the ready bitmap in bits
pub const BITMAP_WIDTH: u32 = PRIORITY_COUNT as u32;

/// Kernel tick rate in hertz
pub const TICK_RATE_HZ: u32 = 1_000;

/// Stack size of the idle task in bytes
pub const IDLE_STACK_SIZE: usize = 512;

/// Byte pattern the kernel fills fresh stacks with, so the high-water mark
/// can be recovered by scanning for the first overwritten byte
pub const STACK_FILL_PATTERN: u8 = 0xA5;

/// Delay value meaning "block until explicitly woken"
pub const MAX_DELAY: u32 = u32::MAX;

/// Smallest stack a task can be created with: room for the seeded exception
/// frame (17 machine words) plus alignment headroom
pub const MIN_STACK_SIZE: usize = 17 * 4 + 8;

/// Capacity of the semaphore table
#[cfg(feature = "semaphore")]
pub const MAX_SEMS: usize = 16;

/// Capacity of the message-queue table
#[cfg(feature = "message-queue")]
pub const MAX_QUEUES: usize = 8;

/// Largest message item size in bytes; bounds the per-task rendezvous
/// scratch buffer
#[cfg(feature = "message-queue")]
pub const MAX_MSG_ITEM: usize = 32;

/// Notification channels per task (bits 0..N-1)
#[cfg(feature = "task-notify")]
pub const NOTIFY_CHANNELS: usize = 8;

/// Convert milliseconds to kernel ticks
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms * TICK_RATE_HZ / 1_000
}
