//! Recursive, ISR-aware critical section
//!
//! Task context and interrupt context keep independent nesting counters and
//! saved PRIMASK state, so an ISR taking the critical section cannot clobber
//! the interrupted task's saved interrupt-enable flag. The outermost enter
//! per context saves PRIMASK and masks interrupts; the matching outermost
//! exit restores it. Data memory barriers on both edges order kernel writes
//! against the next owner.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::SCB;

static TASK_NESTING: AtomicU32 = AtomicU32::new(0);
static TASK_IRQ_WERE_ENABLED: AtomicBool = AtomicBool::new(false);
static ISR_NESTING: AtomicU32 = AtomicU32::new(0);
static ISR_IRQ_WERE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether the CPU is currently servicing an exception
pub fn in_interrupt() -> bool {
    SCB::vect_active() != VectActive::ThreadMode
}

pub fn enter() {
    // Sample the context before masking; IPSR is unaffected by PRIMASK
    let in_isr = in_interrupt();
    let irq_enabled = cortex_m::register::primask::read().is_inactive();
    cortex_m::interrupt::disable();
    if in_isr {
        if ISR_NESTING.load(Ordering::Relaxed) == 0 {
            ISR_IRQ_WERE_ENABLED.store(irq_enabled, Ordering::Relaxed);
        }
        ISR_NESTING.fetch_add(1, Ordering::Relaxed);
    } else {
        if TASK_NESTING.load(Ordering::Relaxed) == 0 {
            TASK_IRQ_WERE_ENABLED.store(irq_enabled, Ordering::Relaxed);
        }
        TASK_NESTING.fetch_add(1, Ordering::Relaxed);
    }
    cortex_m::asm::dmb();
}

pub fn exit() {
    if ISR_NESTING.load(Ordering::Relaxed) > 0 {
        if ISR_NESTING.fetch_sub(1, Ordering::Relaxed) == 1 {
            cortex_m::asm::dmb();
            if ISR_IRQ_WERE_ENABLED.load(Ordering::Relaxed) {
                unsafe { cortex_m::interrupt::enable() };
            }
        }
    } else {
        // Unmatched exit in task context is ignored
        if TASK_NESTING.load(Ordering::Relaxed) == 0 {
            return;
        }
        if TASK_NESTING.fetch_sub(1, Ordering::Relaxed) == 1 {
            cortex_m::asm::dmb();
            if TASK_IRQ_WERE_ENABLED.load(Ordering::Relaxed) {
                unsafe { cortex_m::interrupt::enable() };
            }
        }
    }
}

/// Run `f` inside the critical section
pub fn with<R>(f: impl FnOnce() -> R) -> R {
    enter();
    let r = f();
    exit();
    r
}
