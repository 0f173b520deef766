//! A port of the corto kernel to ARM Cortex-M
//!
//! Supplies everything the portable kernel leaves to the hardware: the
//! recursive ISR-aware critical section, the initial exception-frame layout,
//! the SVCall/PendSV/SysTick handlers, heap bring-up and the idle task. The
//! public API wraps a kernel singleton; application code calls these free
//! functions and never touches the kernel instance directly.
//!
//! Targets Cortex-M4F/M7F (two-stack-pointer model, automatic exception
//! stacking, lazy FPU stacking).

#![no_std]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod critical;
#[cfg(all(target_arch = "arm", target_os = "none"))]
mod heap;
#[cfg(all(target_arch = "arm", target_os = "none"))]
mod port;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use heap::{free_heap_bytes, init_heap};
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use port::*;

pub use corto::config::{self, ms_to_ticks, MAX_DELAY, TICK_RATE_HZ};
pub use corto::{KernelError, TaskId, TaskState};

pub use corto::{QueueId, SendMode};
pub use corto::{SemId, SemKind};
