//! Kernel singleton, public API and exception handlers

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::{scb, syst::SystClkSource, SCB, SYST};

use corto::config;
use corto::{
    Arch, Kernel, KernelError, NotifyWait, QueueId, QueueRecv, QueueSend, SemId, SemKind, SemTake,
    SendMode, TaskEntry, TaskId,
};

use crate::critical;

/// Maximum number of kernel tasks, idle included
pub const MAX_NUM_TASKS: usize = 32;

/// Coprocessor access control register; grants full CP10/CP11 access so
/// tasks may use FPU instructions
const CPACR: *mut u32 = 0xE000_ED88 as *mut u32;
/// FP context control register; ASPEN | LSPEN enable lazy stacking
const FPCCR: *mut u32 = 0xE000_EF34 as *mut u32;

/// The Cortex-M implementation of the kernel's port interface
pub struct CortexM;

impl Arch for CortexM {
    fn seed_stack(stack: &mut [u8], entry: TaskEntry, arg: usize) -> usize {
        let base = stack.as_ptr() as usize;
        // AAPCS requires an 8-byte aligned stack
        let top = (base + stack.len()) & !0x7;

        let frame = [
            0x0100_0000,                    // xPSR (Thumb bit)
            entry as usize as u32 | 1,      // PC
            task_exit as usize as u32 | 1,  // R14 (LR)
            0x1212_1212,                    // R12
            0x0303_0303,                    // R3
            0x0202_0202,                    // R2
            0x0101_0101,                    // R1
            arg as u32,                     // R0
            0xFFFF_FFFD,                    // R14 (EXC_RETURN: thread, PSP)
            0x1111_1111,                    // R11
            0x1010_1010,                    // R10
            0x0909_0909,                    // R9
            0x0808_0808,                    // R8
            0x0707_0707,                    // R7
            0x0606_0606,                    // R6
            0x0505_0505,                    // R5
            0x0404_0404,                    // R4
        ];

        let mut sp = top;
        for word in frame {
            sp -= 4;
            let at = sp - base;
            stack[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        sp
    }
}

type KernelInstance = Kernel<CortexM, MAX_NUM_TASKS>;

struct KernelCell(UnsafeCell<MaybeUninit<KernelInstance>>);

// Single-core: every access goes through the critical section
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(MaybeUninit::uninit()));

/// Stack pointer of the first task, consumed once by the SVCall handler
static FIRST_TASK_SP: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "idle-hook")]
struct HookCell(UnsafeCell<Option<fn()>>);
#[cfg(feature = "idle-hook")]
unsafe impl Sync for HookCell {}
#[cfg(feature = "idle-hook")]
static IDLE_HOOK: HookCell = HookCell(UnsafeCell::new(None));

fn with_kernel<R>(f: impl FnOnce(&mut KernelInstance) -> R) -> R {
    critical::with(|| f(unsafe { (*KERNEL.0.get()).assume_init_mut() }))
}

/// Request a context switch: pend the lowest-priority software exception
///
/// It is taken as soon as no other exception is active and interrupts are
/// enabled.
fn trigger_context_switch() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Rotate the caller to the tail of its priority and switch
fn preempt_yield() {
    let _ = with_kernel(|k| k.yield_current());
    trigger_context_switch();
}

/// All tasks are infinite loops; a returning entry function is a bug. The
/// seeded link register lands here: remove the offender and park.
extern "C" fn task_exit() {
    let _ = delete(None);
    loop {
        cortex_m::asm::wfi();
    }
}

fn idle_task(_: usize) -> ! {
    loop {
        let yield_requested = with_kernel(|k| {
            k.reap_deleted();
            #[cfg(feature = "idle-hook")]
            if let Some(hook) = unsafe { *IDLE_HOOK.0.get() } {
                hook();
            }
            k.take_idle_yield()
        });
        if yield_requested {
            preempt_yield();
        }
    }
}

/// Install a function the idle task calls on every pass
#[cfg(feature = "idle-hook")]
pub fn set_idle_hook(hook: fn()) {
    critical::with(|| unsafe { *IDLE_HOOK.0.get() = Some(hook) });
}

/// Initialize the kernel and create the idle task
///
/// Must be called once before any other kernel API. Call
/// [`crate::init_heap`] as well before the first dynamic creation.
pub fn init(idle_stack: &'static mut [u8]) {
    critical::with(|| {
        let kernel = unsafe { &mut *KERNEL.0.get() }.write(KernelInstance::new());
        kernel
            .init(idle_stack, idle_task)
            .expect("idle task creation failed");
    });
}

/// Start the kernel
///
/// Configures the tick and exception priorities, then launches the first
/// task through the one-shot SVCall exception. Does not return: program
/// execution continues in tasks and interrupt handlers.
pub fn start(scb: &mut SCB, systick: &mut SYST, clock_freq_hz: u32) -> ! {
    let first_sp = with_kernel(|k| k.start()).expect("kernel not initialized");
    FIRST_TASK_SP.store(first_sp as u32, Ordering::Relaxed);

    unsafe {
        // Tick and context switch at the lowest priority so they never
        // preempt device interrupts; the start-up SVC at the highest
        scb.set_priority(scb::SystemHandler::SysTick, 0xFF);
        scb.set_priority(scb::SystemHandler::PendSV, 0xFF);
        scb.set_priority(scb::SystemHandler::SVCall, 0x00);
    }

    systick.set_reload((clock_freq_hz / config::TICK_RATE_HZ) - 1);
    systick.clear_current();
    systick.set_clock_source(SystClkSource::Core);
    systick.enable_interrupt();
    systick.enable_counter();

    unsafe {
        // Full CP10/CP11 access and lazy FP state preservation
        CPACR.write_volatile(CPACR.read_volatile() | (0xF << 20));
        FPCCR.write_volatile(FPCCR.read_volatile() | (0x3 << 30));
        start_first_task();
    }
    // Execution continued into the first task via SVCall
    loop {
        cortex_m::asm::wfi();
    }
}

// ----------------------------------------------------------------------
// Task API
// ----------------------------------------------------------------------

/// Create a task on a heap-allocated stack
pub fn create(
    entry: TaskEntry,
    arg: usize,
    priority: u8,
    stack_size: usize,
) -> Result<TaskId, KernelError> {
    with_kernel(|k| k.create_dynamic(entry, arg, priority, stack_size))
}

/// Create a task on a caller-provided stack
pub fn create_static(
    stack: &'static mut [u8],
    entry: TaskEntry,
    arg: usize,
    priority: u8,
) -> Result<TaskId, KernelError> {
    with_kernel(|k| k.create_static(stack, entry, arg, priority))
}

/// Delete a task, or the caller with `None`
///
/// A dynamic task's memory is freed by the idle task; a self-delete never
/// returns.
pub fn delete(task: Option<TaskId>) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.delete(task))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Suspend a task, or the caller with `None`
pub fn suspend(task: Option<TaskId>) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.suspend(task))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Resume a suspended task
pub fn resume(task: TaskId) -> Result<(), KernelError> {
    with_kernel(|k| k.resume(task))
}

/// Block the caller for `ticks` kernel ticks
///
/// `0` yields; [`config::MAX_DELAY`] blocks until [`wakeup`].
pub fn delay(ticks: u32) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.delay_current(ticks))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Block the caller until one `period` after its previous wake
pub fn delay_until(period: u32) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.delay_until(period))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Release a task blocked with `delay(MAX_DELAY)`
///
/// Usable from interrupt handlers: the pended switch is taken once no
/// exception is active.
pub fn wakeup(task: TaskId) -> Result<(), KernelError> {
    if with_kernel(|k| k.wakeup(task))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Hand the CPU to the next ready task of the same priority
pub fn yield_now() -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    with_kernel(|k| k.yield_current())?;
    trigger_context_switch();
    Ok(())
}

/// Request a context switch from an interrupt handler epilogue
///
/// Pass the `higher_prio_woken` result of a `*_from_isr` call.
pub fn yield_from_isr(higher_prio_woken: bool) {
    if higher_prio_woken {
        SCB::set_pendsv();
    }
}

/// Change a task's priority, or the caller's with `None`
pub fn set_priority(task: Option<TaskId>, priority: u8) -> Result<(), KernelError> {
    with_kernel(|k| k.set_priority(task, priority))
}

pub fn current_task() -> Option<TaskId> {
    with_kernel(|k| k.current_task())
}

pub fn current_tick() -> u32 {
    with_kernel(|k| k.current_tick())
}

/// Total stack size of a task, or the caller's with `None`
pub fn stack_size(task: Option<TaskId>) -> Option<usize> {
    with_kernel(|k| k.stack_size(task))
}

/// Deepest stack use observed for a task, or the caller's with `None`
#[cfg(feature = "high-water-mark")]
pub fn high_water_mark(task: Option<TaskId>) -> Option<usize> {
    with_kernel(|k| k.high_water_mark(task))
}

/// Replace the stack-overflow hook run by the context switcher
#[cfg(feature = "stack-overflow-check")]
pub fn set_stack_overflow_hook(hook: fn(TaskId)) {
    with_kernel(|k| k.set_stack_overflow_hook(hook))
}

// ----------------------------------------------------------------------
// Semaphores and mutexes
// ----------------------------------------------------------------------

/// Create a counting semaphore
pub fn sem_create(initial: u16, max: u16) -> Result<SemId, KernelError> {
    with_kernel(|k| k.sem_create(initial, max, SemKind::Counting))
}

/// Create a binary semaphore
pub fn sem_create_binary(available: bool) -> Result<SemId, KernelError> {
    with_kernel(|k| k.sem_create_binary(available))
}

/// Create a mutex with priority inheritance
pub fn mutex_create(recursive: bool) -> Result<SemId, KernelError> {
    with_kernel(|k| k.mutex_create(recursive))
}

/// Take a token, blocking up to `timeout` ticks
///
/// `timeout == 0` never blocks; [`config::MAX_DELAY`] waits forever.
pub fn take(sem: SemId, timeout: u32) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    loop {
        match with_kernel(|k| k.sem_take_step(sem, timeout))? {
            SemTake::Acquired => return Ok(()),
            SemTake::Blocked => trigger_context_switch(),
        }
        // Woken: settle the verdict, then retry the fast path
        with_kernel(|k| k.sem_take_resume(sem))?;
    }
}

/// Release a token, yielding to a woken higher-priority waiter
pub fn give(sem: SemId) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.sem_give(sem))? {
        preempt_yield();
    }
    Ok(())
}

/// Interrupt-context give; returns whether a higher-priority task was woken
pub fn give_from_isr(sem: SemId) -> Result<bool, KernelError> {
    if !critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    with_kernel(|k| k.sem_give_from_isr(sem))
}

/// Reset the count to zero and release all waiters with a timeout verdict
pub fn sem_clear(sem: SemId) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.sem_clear(sem))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Release all waiters with a deleted verdict and destroy the semaphore
pub fn sem_delete(sem: SemId) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.sem_delete(sem))? {
        trigger_context_switch();
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Message queues
// ----------------------------------------------------------------------

/// Create a queue of `capacity` records of `item_size` bytes
pub fn queue_create(item_size: usize, capacity: usize) -> Result<QueueId, KernelError> {
    with_kernel(|k| k.queue_create(item_size, capacity))
}

/// Create a queue over caller-provided storage
pub fn queue_create_static(
    storage: &'static mut [u8],
    item_size: usize,
    capacity: usize,
) -> Result<QueueId, KernelError> {
    with_kernel(|k| k.queue_create_static(storage, item_size, capacity))
}

/// Send one record, blocking up to `timeout` ticks when the queue is full
///
/// [`SendMode::Overwrite`] drops the oldest record instead and never blocks.
pub fn send(
    queue: QueueId,
    payload: &[u8],
    mode: SendMode,
    timeout: u32,
) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    match with_kernel(|k| k.queue_send_step(queue, payload, mode, timeout))? {
        QueueSend::Delivered { preempt } => {
            if preempt {
                preempt_yield();
            }
            Ok(())
        }
        QueueSend::Blocked => {
            trigger_context_switch();
            with_kernel(|k| k.queue_send_resume(queue))
        }
    }
}

/// Receive one record into `out`, blocking up to `timeout` ticks when empty
pub fn receive(queue: QueueId, out: &mut [u8], timeout: u32) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    match with_kernel(|k| k.queue_recv_step(queue, out, timeout))? {
        QueueRecv::Received { preempt } => {
            if preempt {
                preempt_yield();
            }
            Ok(())
        }
        QueueRecv::Blocked => {
            trigger_context_switch();
            with_kernel(|k| k.queue_recv_resume(queue, out))
        }
    }
}

/// Interrupt-context send; returns whether a higher-priority task was woken
pub fn send_from_isr(
    queue: QueueId,
    payload: &[u8],
    mode: SendMode,
) -> Result<bool, KernelError> {
    if !critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    with_kernel(|k| k.queue_send_from_isr(queue, payload, mode))
}

/// Copy the oldest record without removing it
pub fn peek(queue: QueueId, out: &mut [u8]) -> Result<(), KernelError> {
    with_kernel(|k| k.queue_peek(queue, out))
}

/// Drop all records and release all waiters with a timeout verdict
pub fn queue_clear(queue: QueueId) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.queue_clear(queue))? {
        trigger_context_switch();
    }
    Ok(())
}

/// Release all waiters with a deleted verdict and destroy the queue
pub fn queue_delete(queue: QueueId) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.queue_delete(queue))? {
        trigger_context_switch();
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Task notifications
// ----------------------------------------------------------------------

/// Post one notification on `bit` to `target`, yielding to a woken
/// higher-priority waiter
pub fn notify_send(target: TaskId, bit: u8) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    if with_kernel(|k| k.notify_send(target, bit))? {
        preempt_yield();
    }
    Ok(())
}

/// Wait for a notification on `bit`, blocking up to `timeout` ticks
pub fn notify_wait(bit: u8, timeout: u32) -> Result<(), KernelError> {
    if critical::in_interrupt() {
        return Err(KernelError::WrongContext);
    }
    loop {
        match with_kernel(|k| k.notify_wait_step(bit, timeout))? {
            NotifyWait::Taken => return Ok(()),
            NotifyWait::Blocked => trigger_context_switch(),
        }
        with_kernel(|k| k.notify_wait_resume())?;
    }
}

// ----------------------------------------------------------------------
// Exception handlers
// ----------------------------------------------------------------------

/// SysTick interrupt: advance the kernel tick and pend a context switch
/// when a higher-priority task woke up
#[no_mangle]
pub extern "C" fn SysTick() {
    if with_kernel(|k| k.tick_update()) {
        SCB::set_pendsv();
    }
}

/// Called from the PendSV handler with the outgoing task's pushed stack
/// pointer; returns the incoming task's stack pointer
#[no_mangle]
extern "C" fn corto_switch_context(saved_sp: u32) -> u32 {
    critical::with(|| {
        let kernel = unsafe { (*KERNEL.0.get()).assume_init_mut() };
        kernel.switch_context(Some(saved_sp as usize)) as u32
    })
}

/// Reads the first task's seeded stack pointer for the SVCall handler
#[no_mangle]
extern "C" fn corto_first_task_sp() -> u32 {
    FIRST_TASK_SP.load(Ordering::Relaxed)
}

/// Launch the first task: point MSP back at the vector-table stack top,
/// drop any FP context, enable interrupts and take the SVCall exception
#[naked_function::naked]
unsafe extern "C" fn start_first_task() {
    asm!(
        "movw   r0, #0xED08", // VTOR: vector table base
        "movt   r0, #0xE000",
        "ldr    r0, [r0]",
        "ldr    r0, [r0]",    // first entry: initial MSP
        "msr    msp, r0",     // reclaim the boot stack
        "mov    r0, #0",
        "msr    control, r0", // MSP, no FP context
        "cpsie  i",
        "cpsie  f",
        "dsb",
        "isb",
        "svc    0",           // never returns here
        "b      .",
    );
}

/// SVCall handler: pops the first task's seeded frame into the CPU
///
/// Taken exactly once, from `start_first_task`.
#[naked_function::naked]
#[allow(non_snake_case)]
pub unsafe extern "C" fn SVCall() {
    asm!(
        "bl     corto_first_task_sp",  // R0 = seeded PSP
        "ldmia  r0!, {{r4-r11, r14}}", // software-saved block
        "msr    psp, r0",
        "isb",
        "mov    r0, #0",
        "msr    basepri, r0",
        "bx     r14",                  // exception return pops the rest
    );
}

/// PendSV handler: the context switch
///
/// Hardware already pushed the caller-saved block to the process stack on
/// entry; push the callee-saved block (and live FPU registers), let the
/// kernel swap tasks, then unwind the same way for the incoming task.
#[naked_function::naked]
#[allow(non_snake_case)]
pub unsafe extern "C" fn PendSV() {
    asm!(
        "cpsid    i",
        "mrs      r0, psp",
        "isb",
        "mov      r1, lr",               // keep this exception's EXC_RETURN
        "tst      r14, #0x10",           // FP context active?
        "it       eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb    r0!, {{r4-r11, r14}}",
        "push     {{r1, r2}}",           // two words keep MSP 8-byte aligned
        "bl       corto_switch_context", // R0: old SP in, new SP out
        "pop      {{r1, r2}}",
        "ldmia    r0!, {{r4-r11, r14}}",
        "tst      r14, #0x10",
        "it       eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "msr      psp, r0",
        "cpsie    i",
        "bx       r1",
    );
}
