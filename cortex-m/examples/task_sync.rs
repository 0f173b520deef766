//! Producer/consumer pair coupled by a message queue, with a mutex guarding
//! a shared counter. The producer outranks the consumer, so every send that
//! finds the consumer parked hands the record over directly.

#![no_std]
#![no_main]

mod common;

use core::sync::atomic::{AtomicU32, Ordering};

use defmt::info;

use corto_cortex_m as corto;
use corto_cortex_m::SendMode;

static SHARED: AtomicU32 = AtomicU32::new(0);

static mut QUEUE: Option<corto::QueueId> = None;
static mut LOCK: Option<corto::SemId> = None;

fn producer(_: usize) -> ! {
    let queue = unsafe { QUEUE.unwrap() };
    let lock = unsafe { LOCK.unwrap() };
    let mut value = 0u32;

    loop {
        value += 1;
        corto::send(queue, &value.to_le_bytes(), SendMode::Back, corto::MAX_DELAY).unwrap();

        corto::take(lock, corto::MAX_DELAY).unwrap();
        SHARED.fetch_add(1, Ordering::Relaxed);
        corto::give(lock).unwrap();

        corto::delay(corto::ms_to_ticks(250)).unwrap();
    }
}

fn consumer(_: usize) -> ! {
    let queue = unsafe { QUEUE.unwrap() };
    let mut buffer = [0u8; 4];

    loop {
        corto::receive(queue, &mut buffer, corto::MAX_DELAY).unwrap();
        info!(
            "received {} (shared = {})",
            u32::from_le_bytes(buffer),
            SHARED.load(Ordering::Relaxed)
        );
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let mut resources = common::setup();

    static mut IDLE_STACK: [u8; common::IDLE_STACK_SIZE] = [0; common::IDLE_STACK_SIZE];
    corto::init(unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) });

    unsafe {
        QUEUE = Some(corto::queue_create(4, 8).unwrap());
        LOCK = Some(corto::mutex_create(false).unwrap());
    }

    corto::create(producer, 0, 2, common::TASK_STACK_SIZE).unwrap();
    corto::create(consumer, 0, 3, common::TASK_STACK_SIZE).unwrap();

    info!("starting");
    corto::start(
        &mut resources.scb,
        &mut resources.systick,
        resources.clocks.hclk().to_Hz(),
    );
}
