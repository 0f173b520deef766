//! Port interface
//!
//! The kernel is hardware-independent; everything CPU-specific funnels
//! through this trait. A port supplies the initial stack-frame layout, and
//! owns the context-switch and critical-section machinery around the kernel.

use crate::task::TaskEntry;

/// CPU-specific services the kernel needs at task creation
pub trait Arch {
    /// Seed `stack` with an initial register frame so that restoring it via
    /// the normal context-switch path enters `entry` with `arg` in the
    /// argument register, and return the initial stack pointer.
    ///
    /// The slice is already filled with the stack fill pattern; the frame is
    /// written at its top end (stacks grow downward).
    fn seed_stack(stack: &mut [u8], entry: TaskEntry, arg: usize) -> usize;
}
