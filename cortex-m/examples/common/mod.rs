use core::mem::MaybeUninit;

use cortex_m::peripheral::{SCB, SYST};
use defmt_rtt as _;
use panic_probe as _;
use stm32f7xx_hal::rcc::Clocks;
use stm32f7xx_hal::{pac, prelude::*};

use corto_cortex_m as corto;

pub const IDLE_STACK_SIZE: usize = 512;
pub const TASK_STACK_SIZE: usize = 2048;
pub const HEAP_SIZE: usize = 16 * 1024;

defmt::timestamp!("{=u32:ms}", corto::current_tick());

pub struct KernelResources {
    pub scb: SCB,
    pub systick: SYST,
    pub clocks: Clocks,
}

pub fn setup() -> KernelResources {
    let pac_periph = pac::Peripherals::take().unwrap();
    let rcc = pac_periph.RCC.constrain();
    let clocks = rcc.cfgr.sysclk(16_000_000.Hz()).freeze();

    static mut HEAP: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];
    corto::init_heap(unsafe { &mut *core::ptr::addr_of_mut!(HEAP) });

    let cm_periph = cortex_m::Peripherals::take().unwrap();
    let systick = cm_periph.SYST;
    let scb = cm_periph.SCB;

    KernelResources {
        scb,
        systick,
        clocks,
    }
}
