//! The DMA-paced hardware scheduler.
//!
//! A ring of [`SOURCE_BUFFER_FRAMES`] GPIO frames represents ~8 ms of pin
//! history at one frame per microsecond. Three control blocks per frame form
//! a circular chain the DMA engine walks forever:
//!
//! 1. a 4-byte write into the PWM FIFO, gated by the PWM DREQ; this is the
//!    rate limiter holding the chain to exactly [`FRAMES_PER_SEC`]; its
//!    otherwise-unused `STRIDE` register carries the frame index so software
//!    can read the cursor,
//! 2. a 2D-strided copy of the frame's set/clear masks into `GPSET0..GPCLR1`,
//! 3. a copy from the sibling "clear ring" back over the frame, readying the
//!    slot for its next lap. The clear ring doubles as a persistent PWM
//!    generator: `queue_pwm` writes its pattern there.
//!
//! The CPU never races the engine: `queue` blocks until the target time is
//! within [`MAX_SCHED_AHEAD_USEC`] so the slot it writes was consumed and
//! cleared on the previous lap and will not be fetched again for several
//! milliseconds. No locks are taken on the hot path.

use std::ptr;
use std::rc::Rc;
use std::sync::{Mutex, Once};
use std::time::Duration;

use sched::frame::{frame_index, PwmPattern};
use sched::{
    EventClock, EventTime, GpioFrame, HardwareScheduler, IdleInterval, Level, OutputEvent, PinId,
};
use tracing::{debug, info, trace, warn};

use crate::gpio::Gpio;
use crate::mem::{DevMem, DmaMemory, MmioRegion};
use crate::regs::{
    cm_pwmdiv_divi, dma_cb_stride, dma_cb_txfr_len_2d, dma_cs_panic_priority, dma_cs_priority,
    pwm_dmac_dreq, pwm_dmac_panic, DmaControlBlock, BUS_GPIO_BASE, BUS_PWM_BASE, CLOCK_OFFSET,
    CM_PASSWD, CM_PWMCTL, CM_PWMCTL_BUSY, CM_PWMCTL_ENAB, CM_PWMCTL_SRC_PLLD, CM_PWMDIV,
    DMA_CB_TI_DEST_DREQ, DMA_CB_TI_DEST_INC, DMA_CB_TI_NO_WIDE_BURSTS, DMA_CB_TI_PERMAP_PWM,
    DMA_CB_TI_SRC_INC, DMA_CB_TI_TDMODE, DMA_CB_TXFR_LEN_YLENGTH_MASK, DMA_CHANNEL_STRIDE,
    DMA_CONBLK_AD, DMA_CS, DMA_CS_ABORT, DMA_CS_ACTIVE, DMA_CS_DISDEBUG, DMA_CS_END, DMA_CS_RESET,
    DMA_DEBUG, DMA_DEBUG_FIFO_ERROR, DMA_DEBUG_READ_ERROR, DMA_DEBUG_READ_LAST_NOT_SET_ERROR,
    DMA_ENABLE, DMA_OFFSET, DMA_STRIDE_REG, GPSET0, PERIPHERAL_BASE_BCM2835, PWM_CTL,
    PWM_CTL_CLRFIFO, PWM_CTL_ENABLE1, PWM_CTL_REPEATEMPTY1, PWM_CTL_USEFIFO1, PWM_DMAC,
    PWM_DMAC_ENAB, PWM_FIF1, PWM_OFFSET, PWM_RNG1, PWM_STA, PWM_STA_ERRS,
};
use crate::DmaError;

/// Ring length. A power of two keeps the slot arithmetic a masked modulo.
pub const SOURCE_BUFFER_FRAMES: usize = 8192;

/// Frames consumed per second; fixed by the PWM clock configuration below.
pub const FRAMES_PER_SEC: u64 = 1_000_000;

/// Microseconds of history the ring covers.
pub const RING_USEC: u64 = SOURCE_BUFFER_FRAMES as u64 * 1_000_000 / FRAMES_PER_SEC;

/// How far ahead of an event's time `queue` allows the write: 15/16 of the
/// ring, leaving a lap margin against DMA jitter and clock drift.
pub const MAX_SCHED_AHEAD_USEC: u64 = RING_USEC * 15 / 16;

/// Recovery target for late events.
pub const MIN_SCHED_AHEAD_USEC: u64 = 128;

/// DREQ threshold: request more data as soon as the FIFO has room for a
/// word. A deeper threshold tolerates more drift but can burst frames.
const PWM_FIFO_SIZE: u32 = 1;

/// 500 MHz PLLD divided to the PWM bit clock.
const CLOCK_DIV: u32 = 250;

/// Bits per FIFO word: bit clock / RNG1 = FIFO drain rate = frame rate.
const BITS_PER_CLOCK: u32 = (500_000_000 / CLOCK_DIV as u64 / FRAMES_PER_SEC) as u32;

const RESYNC_INTERVAL_USEC: i64 = 32_768;
const DRIFT_WARN_USEC: i64 = 20;
const CURSOR_RETRY_LIMIT: u32 = 100_000;

const FRAME_BYTES: usize = std::mem::size_of::<GpioFrame>();
const CB_BYTES: usize = std::mem::size_of::<DmaControlBlock>();
const WORDS_PER_FRAME: usize = FRAME_BYTES / 4;

/// Construction parameters for [`DmaScheduler`].
#[derive(Debug, Clone)]
pub struct DmaSchedulerConfig {
    /// SoC peripheral base; the single integration point for newer boards.
    pub peripheral_base: u32,
    /// DMA channel to claim. Channels 0-6 are full-featured engines.
    pub dma_channel: usize,
    /// Widens the cursor sampling window from 1 us to 250 us; needed when
    /// the monotonic clock itself jitters (valgrind, VMs).
    pub running_in_vm: bool,
    /// Levels to force on exit, after the DMA engine is halted.
    pub default_pin_states: Vec<(PinId, Level)>,
}

impl Default for DmaSchedulerConfig {
    fn default() -> Self {
        Self {
            peripheral_base: PERIPHERAL_BASE_BCM2835,
            dma_channel: 5,
            running_in_vm: false,
            default_pin_states: Vec::new(),
        }
    }
}

/// What the process-exit handler needs, with raw register addresses stored
/// as integers so the state is `Send`. Populated once at bring-up.
struct ExitState {
    dma_cs_addr: usize,
    gpset_addr: usize,
    gpclr_addr: usize,
    defaults: Vec<(u32, bool)>,
}

static EXIT_STATE: Mutex<Option<ExitState>> = Mutex::new(None);
static EXIT_HOOK: Once = Once::new();

extern "C" fn exit_hook() {
    run_exit_cleanup();
}

/// Halt the DMA engine and restore default pin levels. Without this the
/// engine keeps streaming frames into the GPIO block after the process dies.
fn run_exit_cleanup() {
    let state = match EXIT_STATE.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => None,
    };
    let Some(state) = state else { return };
    unsafe {
        let cs = state.dma_cs_addr as *mut u32;
        ptr::write_volatile(cs, ptr::read_volatile(cs) & !DMA_CS_ACTIVE);
        libc::usleep(100);
        ptr::write_volatile(cs, DMA_CS_RESET);
        for &(pin, high) in &state.defaults {
            let base = if high {
                state.gpset_addr
            } else {
                state.gpclr_addr
            };
            let reg = (base as *mut u32).add(pin as usize / 32);
            ptr::write_volatile(reg, 1 << (pin % 32));
        }
    }
    info!("dma engine halted, io pins restored to defaults");
}

/// The DMA-paced GPIO scheduler. One per process; owns the DMA channel, the
/// PWM peripheral and its clock for the process lifetime.
pub struct DmaScheduler {
    // Kept alive for the lifetime of the uncached mappings.
    _devmem: DevMem,
    gpio: Rc<Gpio>,
    dma: MmioRegion,
    pwm: MmioRegion,
    clock: MmioRegion,
    dma_channel: usize,
    frames: DmaMemory,
    clear_frames: DmaMemory,
    control_blocks: DmaMemory,
    /// Absolute time at which the current lap's frame 0 fired.
    time_at_frame0: i64,
    last_resync: EventTime,
    cursor_tolerance_us: i64,
}

impl DmaScheduler {
    pub fn new(
        devmem: DevMem,
        gpio: Rc<Gpio>,
        config: DmaSchedulerConfig,
    ) -> Result<Self, DmaError> {
        let dma = devmem.map_peripheral(config.peripheral_base + DMA_OFFSET)?;
        let pwm = devmem.map_peripheral(config.peripheral_base + PWM_OFFSET)?;
        let clock = devmem.map_peripheral(config.peripheral_base + CLOCK_OFFSET)?;
        let frames = DmaMemory::alloc(&devmem, SOURCE_BUFFER_FRAMES * FRAME_BYTES)?;
        let clear_frames = DmaMemory::alloc(&devmem, SOURCE_BUFFER_FRAMES * FRAME_BYTES)?;
        let control_blocks = DmaMemory::alloc(&devmem, SOURCE_BUFFER_FRAMES * 3 * CB_BYTES)?;

        let mut this = Self {
            _devmem: devmem,
            gpio,
            dma,
            pwm,
            clock,
            dma_channel: config.dma_channel,
            frames,
            clear_frames,
            control_blocks,
            time_at_frame0: 0,
            last_resync: EventTime::default(),
            cursor_tolerance_us: if config.running_in_vm { 250 } else { 1 },
        };
        this.build_control_blocks();
        this.init_pwm();
        this.install_exit_state(&config.default_pin_states);
        this.init_dma();
        info!(
            frames = SOURCE_BUFFER_FRAMES,
            channel = this.dma_channel,
            ring_ms = RING_USEC as f64 / 1000.0,
            "dma scheduler running"
        );
        Ok(this)
    }

    fn channel_reg(&self, reg: usize) -> usize {
        DMA_CHANNEL_STRIDE * self.dma_channel + reg
    }

    /// Fill the circular 3-CBs-per-frame chain.
    fn build_control_blocks(&mut self) {
        let cbs = self.control_blocks.uncached_ptr() as *mut DmaControlBlock;
        for frame in 0..SOURCE_BUFFER_FRAMES {
            let frame_bus = self.frames.bus_addr_at(frame * FRAME_BYTES);
            let cb_bus = |index: usize| self.control_blocks.bus_addr_at(index * CB_BYTES);

            // Pace: one dummy word into the PWM FIFO, gated by DREQ. The
            // frame index rides in STRIDE so software can read the cursor.
            let pace = DmaControlBlock {
                ti: DMA_CB_TI_PERMAP_PWM
                    | DMA_CB_TI_DEST_DREQ
                    | DMA_CB_TI_NO_WIDE_BURSTS
                    | DMA_CB_TI_TDMODE,
                source_ad: frame_bus,
                dest_ad: BUS_PWM_BASE + PWM_FIF1 as u32,
                txfr_len: dma_cb_txfr_len_2d(1, 4),
                stride: frame as u32,
                nextconbk: cb_bus(3 * frame + 1),
                reserved: [0; 2],
            };
            // Copy: gpset words to GPSET0..1, then skip the reserved word
            // between GPSET1 and GPCLR0 (destination stride 4).
            let copy = DmaControlBlock {
                ti: DMA_CB_TI_SRC_INC
                    | DMA_CB_TI_DEST_INC
                    | DMA_CB_TI_NO_WIDE_BURSTS
                    | DMA_CB_TI_TDMODE,
                source_ad: frame_bus,
                dest_ad: BUS_GPIO_BASE + GPSET0 as u32,
                txfr_len: dma_cb_txfr_len_2d(2, 8),
                stride: dma_cb_stride(4, 0),
                nextconbk: cb_bus(3 * frame + 2),
                reserved: [0; 2],
            };
            // Clear: restore the frame from the clear ring so the slot can
            // be reused next lap. The index rides in STRIDE here too.
            let clear = DmaControlBlock {
                ti: DMA_CB_TI_SRC_INC
                    | DMA_CB_TI_DEST_INC
                    | DMA_CB_TI_NO_WIDE_BURSTS
                    | DMA_CB_TI_TDMODE,
                source_ad: self.clear_frames.bus_addr_at(frame * FRAME_BYTES),
                dest_ad: frame_bus,
                txfr_len: dma_cb_txfr_len_2d(1, FRAME_BYTES as u32),
                stride: frame as u32,
                nextconbk: cb_bus(3 * ((frame + 1) % SOURCE_BUFFER_FRAMES)),
                reserved: [0; 2],
            };
            unsafe {
                ptr::write_volatile(cbs.add(3 * frame), pace);
                ptr::write_volatile(cbs.add(3 * frame + 1), copy);
                ptr::write_volatile(cbs.add(3 * frame + 2), clear);
            }
        }
        debug!(
            control_blocks = SOURCE_BUFFER_FRAMES * 3,
            "control block chain built"
        );
    }

    /// Configure the PWM clock and channel 1 so the FIFO drains at exactly
    /// [`FRAMES_PER_SEC`] words per second, driving the DREQ pacing.
    fn init_pwm(&mut self) {
        // Stop the clock, preserving other control bits; every clock-manager
        // write needs the password.
        self.clock.write(
            CM_PWMCTL,
            CM_PASSWD | (self.clock.read(CM_PWMCTL) & !CM_PWMCTL_ENAB),
        );
        while self.clock.read(CM_PWMCTL) & CM_PWMCTL_BUSY != 0 {
            std::hint::spin_loop();
        }
        self.clock
            .write(CM_PWMDIV, CM_PASSWD | cm_pwmdiv_divi(CLOCK_DIV));
        self.clock.write(CM_PWMCTL, CM_PASSWD | CM_PWMCTL_SRC_PLLD);
        self.clock
            .write(CM_PWMCTL, CM_PASSWD | CM_PWMCTL_SRC_PLLD | CM_PWMCTL_ENAB);
        while self.clock.read(CM_PWMCTL) & CM_PWMCTL_BUSY == 0 {
            std::hint::spin_loop();
        }

        self.pwm.write(PWM_DMAC, 0);
        self.pwm
            .write(PWM_CTL, self.pwm.read(PWM_CTL) | PWM_CTL_CLRFIFO);
        std::thread::sleep(Duration::from_micros(100));
        self.pwm.write(PWM_STA, PWM_STA_ERRS);
        std::thread::sleep(Duration::from_micros(100));
        self.pwm.write(
            PWM_DMAC,
            PWM_DMAC_ENAB | pwm_dmac_dreq(PWM_FIFO_SIZE) | pwm_dmac_panic(PWM_FIFO_SIZE),
        );
        self.pwm.write(PWM_RNG1, BITS_PER_CLOCK);
        self.pwm.write(
            PWM_CTL,
            PWM_CTL_REPEATEMPTY1 | PWM_CTL_ENABLE1 | PWM_CTL_USEFIFO1,
        );
        debug!(clock_div = CLOCK_DIV, rng1 = BITS_PER_CLOCK, "pwm pacing configured");
    }

    /// Reset the channel and point it at the head of the chain.
    fn init_dma(&mut self) {
        self.dma
            .write_masked(DMA_ENABLE, 1 << self.dma_channel, 1 << self.dma_channel);

        let cs = self.channel_reg(DMA_CS);
        self.dma.write(cs, self.dma.read(cs) | DMA_CS_ABORT);
        std::thread::sleep(Duration::from_micros(100));
        self.dma.write(cs, DMA_CS_RESET);
        std::thread::sleep(Duration::from_micros(100));
        self.dma.write_masked(cs, DMA_CS_END, DMA_CS_END);
        self.dma.write(
            self.channel_reg(DMA_DEBUG),
            DMA_DEBUG_READ_ERROR | DMA_DEBUG_FIFO_ERROR | DMA_DEBUG_READ_LAST_NOT_SET_ERROR,
        );

        let first_cb = self.control_blocks.bus_addr_at(0);
        debug!(conblk_ad = format_args!("{first_cb:#010x}"), "starting dma");
        self.dma.write(self.channel_reg(DMA_CONBLK_AD), first_cb);
        let flags = dma_cs_priority(14) | dma_cs_panic_priority(14) | DMA_CS_DISDEBUG;
        self.dma.write(cs, flags);
        self.dma.write(cs, flags | DMA_CS_ACTIVE);
        // Frame 0 fires approximately now; the first resync refines this.
        self.time_at_frame0 = EventClock::now().as_micros() as i64;
    }

    fn install_exit_state(&self, defaults: &[(PinId, Level)]) {
        let (gpset_addr, gpclr_addr) = self.gpio.set_clear_addrs();
        let state = ExitState {
            dma_cs_addr: self.dma.addr_of(self.channel_reg(DMA_CS)),
            gpset_addr,
            gpclr_addr,
            defaults: defaults
                .iter()
                .map(|&(pin, level)| (pin.0, level.is_high()))
                .collect(),
        };
        if let Ok(mut guard) = EXIT_STATE.lock() {
            *guard = Some(state);
        }
        EXIT_HOOK.call_once(|| unsafe {
            libc::atexit(exit_hook);
        });
    }

    /// Re-measure the wall time of the current lap's frame 0 from the DMA
    /// cursor. The PWM-paced chain and the monotonic clock drift apart
    /// slowly; without this, slot arithmetic walks off the real frames.
    fn resync_cursor(&mut self) {
        let now = EventClock::now();
        if now.micros_since(self.last_resync) < RESYNC_INTERVAL_USEC {
            return;
        }
        self.last_resync = now;

        let stride_reg = self.channel_reg(DMA_STRIDE_REG);
        let mut tries = 0u32;
        let (cursor, sampled_at) = loop {
            // STRIDE only holds a pure frame index while a pace or clear
            // block executes; while the 2D GPIO copy runs it holds packed
            // stride halves, betrayed by nonzero Y-length bits. The sample
            // also only counts if the two clock reads bracket it tightly.
            let before = EventClock::now();
            let stride = self.dma.read(stride_reg);
            let after = EventClock::now();
            if after.micros_since(before) <= self.cursor_tolerance_us
                && stride & DMA_CB_TXFR_LEN_YLENGTH_MASK == 0
            {
                break (stride as u64, after);
            }
            tries += 1;
            if tries >= CURSOR_RETRY_LIMIT {
                warn!("dma cursor did not stabilize; resync skipped until next idle interval");
                return;
            }
        };

        let cursor_usec = (cursor * 1_000_000 / FRAMES_PER_SEC) as i64;
        let time_at_frame0 = sampled_at.as_micros() as i64 - cursor_usec;
        let mut drift = (time_at_frame0 - self.time_at_frame0).rem_euclid(RING_USEC as i64);
        if drift > RING_USEC as i64 / 2 {
            drift -= RING_USEC as i64;
        }
        trace!(cursor, drift_us = drift, "dma cursor resync");
        if drift.abs() > DRIFT_WARN_USEC {
            warn!(
                drift_us = drift,
                "dma timing drift beyond frame granularity; event producer may not be keeping up"
            );
        }
        self.time_at_frame0 = time_at_frame0;
    }

    /// OR one transition into a ring slot through the uncached view.
    fn write_frame(&self, index: usize, pin: PinId, level: Level) {
        let words = self.frames.uncached_ptr() as *mut u32;
        let word = index * WORDS_PER_FRAME + if level.is_high() { 0 } else { 2 } + pin.bank();
        unsafe {
            let target = words.add(word);
            ptr::write_volatile(target, ptr::read_volatile(target) | pin.mask());
        }
    }
}

impl HardwareScheduler for DmaScheduler {
    fn queue(&mut self, event: OutputEvent) {
        // Backpressure: the slot for `event.time` was reused on the previous
        // lap until MAX_SCHED_AHEAD before it; sleeping here is the single
        // suspension point of the whole pipeline.
        EventClock::sleep_until(event.time.saturating_sub_micros(MAX_SCHED_AHEAD_USEC));

        let mut micros = event.time.as_micros() as i64;
        let mut from_frame0 = micros - self.time_at_frame0;
        if from_frame0 < 0 {
            // Late caller. Delay the step rather than dropping it.
            let now = EventClock::now().as_micros() as i64;
            warn!(
                late_us = now - micros,
                pin = event.pin.0,
                "event scheduled in the past; delaying to the near future"
            );
            micros = now + MIN_SCHED_AHEAD_USEC as i64;
            from_frame0 = micros - self.time_at_frame0;
        }
        let index = frame_index(from_frame0 as u64, FRAMES_PER_SEC, SOURCE_BUFFER_FRAMES);
        self.write_frame(index, event.pin, event.level);
    }

    fn queue_pwm(&mut self, pin: PinId, duty: f64, ideal_period: f64) {
        info!(pin = pin.0, duty, ideal_period, "installing pwm pattern");
        let words = self.clear_frames.uncached_ptr() as *mut u32;
        let pattern = PwmPattern::new(duty, ideal_period, FRAMES_PER_SEC);
        for (frame, level) in (0..SOURCE_BUFFER_FRAMES).zip(pattern) {
            let set = frame * WORDS_PER_FRAME + pin.bank();
            let clr = set + 2;
            let (on, off) = if level.is_high() { (set, clr) } else { (clr, set) };
            unsafe {
                let on = words.add(on);
                ptr::write_volatile(on, ptr::read_volatile(on) | pin.mask());
                let off = words.add(off);
                ptr::write_volatile(off, ptr::read_volatile(off) & !pin.mask());
            }
        }
    }

    fn on_idle_cpu(&mut self, interval: IdleInterval) -> bool {
        if interval == IdleInterval::Wide {
            self.resync_cursor();
        }
        false
    }
}

impl Drop for DmaScheduler {
    fn drop(&mut self) {
        // Runs before the ring/CB mappings are torn down by field drops.
        run_exit_cleanup();
    }
}
