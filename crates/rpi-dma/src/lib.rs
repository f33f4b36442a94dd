//! # DMA-paced GPIO scheduling for BCM2835-class boards
//!
//! Kernel scheduling jitter on a non-realtime host makes bit-banged step
//! pulses unusable above a few kHz. This crate sidesteps the kernel entirely
//! for the timing-critical path: a DMA engine continuously copies a
//! precomputed ring of GPIO set/clear frames into the GPIO peripheral, paced
//! to exactly one frame per microsecond by the PWM peripheral's DREQ signal.
//! The CPU's only job is to write each pulse into the right ring slot ahead
//! of time.
//!
//! - [`mem`]: `/dev/mem` peripheral windows and physically-locked DMA memory
//!   (the one module that knows about `/proc/self/pagemap`).
//! - [`regs`]: BCM2835 register layouts and bit fields.
//! - [`gpio`]: pin function select, direct reads/writes, endstop polling.
//! - [`sched`]: the [`DmaScheduler`] itself.
//!
//! Everything here requires root (or equivalent capabilities) for `/dev/mem`
//! and `/proc/self/pagemap` access, and is inherently process-global: there
//! is one DMA engine and one GPIO block.

pub mod gpio;
pub mod mem;
pub mod regs;
pub mod sched;

pub use crate::gpio::{Gpio, RpiPin};
pub use crate::sched::{DmaScheduler, DmaSchedulerConfig};

use thiserror::Error;

/// Fatal configuration/bring-up errors. There is no safe recovery path from
/// any of these: the caller should log and abort.
#[derive(Debug, Error)]
pub enum DmaError {
    #[error("cannot open /dev/mem (are you running as root?): {0}")]
    DevMemOpen(#[source] std::io::Error),

    #[error("cannot open /proc/self/pagemap: {0}")]
    PagemapOpen(#[source] std::io::Error),

    #[error("mmap of {what} failed: {source}")]
    Mmap {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("mlock of {0} bytes failed")]
    Mlock(usize),

    #[error("pagemap read for virtual address {addr:#x} failed")]
    PagemapRead { addr: usize },

    #[error("page at virtual address {addr:#x} has no physical backing")]
    PageNotPresent { addr: usize },

    #[error("uncached view was not mapped contiguously at offset {offset:#x}")]
    UncachedViewNotContiguous { offset: usize },
}
