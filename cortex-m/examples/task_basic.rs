//! Two periodic tasks sharing one entry function, parametrized by their
//! period in milliseconds. Task 1 runs twice as often as Task 0.

#![no_std]
#![no_main]

mod common;

use defmt::info;

use corto_cortex_m as corto;

fn task_template(arg: usize) -> ! {
    let period = corto::ms_to_ticks(arg as u32);
    assert!(period > 0);

    loop {
        info!("hello from the {}ms task", arg);
        corto::delay_until(period).unwrap();
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let mut resources = common::setup();

    info!("initializing");
    static mut IDLE_STACK: [u8; common::IDLE_STACK_SIZE] = [0; common::IDLE_STACK_SIZE];
    corto::init(unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) });

    info!("creating tasks");
    corto::create(task_template, 2_000, 0, common::TASK_STACK_SIZE).unwrap();
    corto::create(task_template, 1_000, 1, common::TASK_STACK_SIZE).unwrap();

    info!("starting");
    corto::start(
        &mut resources.scb,
        &mut resources.systick,
        resources.clocks.hclk().to_Hz(),
    );
}
