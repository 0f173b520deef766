//! corto — a compact preemptive real-time kernel core
//!
//! Hardware-independent half of the corto RTOS: the task model, the
//! priority-bitmap scheduler, the tick-overflow-safe delay wheel and the
//! synchronization primitives. A port crate (see `corto-cortex-m`) owns the
//! critical section, the exception handlers and the initial stack-frame
//! layout, and drives one [`Kernel`] instance through its public methods.
//!
//! Everything in this crate runs on the host too, which is where the test
//! suite lives.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
mod bitmap;
pub mod config;
mod error;
mod kernel;
mod list;
#[cfg(feature = "task-notify")]
mod notify;
#[cfg(feature = "message-queue")]
mod queue;
#[cfg(feature = "semaphore")]
mod sem;
mod task;

pub use arch::Arch;
pub use error::{KernelError, Result};
pub use kernel::Kernel;
#[cfg(feature = "task-notify")]
pub use notify::NotifyWait;
#[cfg(feature = "message-queue")]
pub use queue::{QueueId, QueueRecv, QueueSend, SendMode};
#[cfg(feature = "semaphore")]
pub use sem::{SemId, SemKind, SemTake};
pub use task::{TaskEntry, TaskId, TaskState};
