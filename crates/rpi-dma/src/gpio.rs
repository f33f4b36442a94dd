//! Direct GPIO access: function select, immediate reads/writes, and endstop
//! polling. The DMA ring handles the timed writes; this path covers
//! everything that happens "now": configuring pin modes, reading endstops,
//! and restoring default levels on exit.

use std::rc::Rc;

use sched::{Level, PinId};
use tracing::debug;

use crate::mem::{DevMem, MmioRegion};
use crate::regs::{GPCLR0, GPFSEL0, GPIO_OFFSET, GPLEV0, GPSET0};
use crate::DmaError;

/// The mapped GPIO register block.
pub struct Gpio {
    regs: MmioRegion,
}

impl Gpio {
    pub fn new(devmem: &DevMem, peripheral_base: u32) -> Result<Self, DmaError> {
        let regs = devmem.map_peripheral(peripheral_base + GPIO_OFFSET)?;
        Ok(Self { regs })
    }

    /// Configure `pin` as a plain output (function bits 001).
    pub fn set_output(&self, pin: PinId) {
        let reg = GPFSEL0 + 4 * (pin.0 as usize / 10);
        let shift = 3 * (pin.0 % 10);
        self.regs.write_masked(reg, 0b111 << shift, 0b001 << shift);
        debug!(pin = pin.0, "pin configured as output");
    }

    /// Configure `pin` as an input (function bits 000).
    pub fn set_input(&self, pin: PinId) {
        let reg = GPFSEL0 + 4 * (pin.0 as usize / 10);
        let shift = 3 * (pin.0 % 10);
        self.regs.write_masked(reg, 0b111 << shift, 0);
        debug!(pin = pin.0, "pin configured as input");
    }

    /// Drive `pin` immediately, bypassing the DMA ring.
    pub fn write(&self, pin: PinId, level: Level) {
        let reg = match level {
            Level::High => GPSET0,
            Level::Low => GPCLR0,
        } + 4 * pin.bank();
        self.regs.write(reg, pin.mask());
    }

    pub fn read(&self, pin: PinId) -> Level {
        let word = self.regs.read(GPLEV0 + 4 * pin.bank());
        if word & pin.mask() != 0 {
            Level::High
        } else {
            Level::Low
        }
    }

    /// Raw address of the set/clear registers, for the exit handler.
    pub(crate) fn set_clear_addrs(&self) -> (usize, usize) {
        (self.regs.addr_of(GPSET0), self.regs.addr_of(GPCLR0))
    }
}

/// One GPIO pin, usable as an endstop or any other polled input.
#[derive(Clone)]
pub struct RpiPin {
    gpio: Rc<Gpio>,
    pin: PinId,
    /// Endstops wired normally-closed read low when pressed.
    active_low: bool,
}

impl RpiPin {
    pub fn input(gpio: Rc<Gpio>, pin: PinId, active_low: bool) -> Self {
        gpio.set_input(pin);
        Self {
            gpio,
            pin,
            active_low,
        }
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn read(&self) -> Level {
        self.gpio.read(self.pin)
    }
}

impl motion::stepper::Endstop for RpiPin {
    fn is_triggered(&self) -> bool {
        let high = self.read().is_high();
        high != self.active_low
    }
}
