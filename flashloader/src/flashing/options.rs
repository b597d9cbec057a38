use super::{FlashAlgorithm, FlashProgress};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for flashing, set by the caller of a flash operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashOptions {
    /// Program pages through two alternating RAM buffers, if the algorithm has them.
    pub double_buffering: bool,
    /// Read back programmed data and compare it.
    pub verify: bool,
    /// Preserve the bytes of touched sectors which are not programmed.
    ///
    /// Without it, these bytes are left erased.
    pub keep_unwritten_bytes: bool,
    /// Program without erasing first. The flash has to be erased already.
    pub skip_erase: bool,
    /// Clock frequency handed to `Init()`. Zero is passed when unset.
    pub clock: Option<u32>,
    /// How long `Init()` and `UnInit()` may run, in milliseconds.
    pub init_timeout_ms: u64,
    /// Receives progress events.
    #[serde(skip)]
    pub progress: Option<FlashProgress>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            double_buffering: true,
            verify: false,
            keep_unwritten_bytes: false,
            skip_erase: false,
            clock: None,
            init_timeout_ms: 2000,
            progress: None,
        }
    }
}

impl FlashOptions {
    pub(super) fn progress(&self) -> FlashProgress {
        self.progress.clone().unwrap_or_else(FlashProgress::empty)
    }
}

/// How long each routine of a flash algorithm may run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// `Init()` and `UnInit()`.
    pub init: Duration,
    /// `EraseSector()`.
    pub erase_sector: Duration,
    /// `EraseAll()`.
    pub erase_all: Duration,
    /// `ProgramPage()`.
    pub program_page: Duration,
}

impl Timeouts {
    /// Lower bound for erasing the whole flash.
    const MIN_ERASE_ALL: Duration = Duration::from_secs(30);

    /// Derive the timeouts from the flash properties of `algorithm`.
    ///
    /// Erasing everything is budgeted as erasing every sector on its own, but never below 30 seconds.
    pub fn new(algorithm: &FlashAlgorithm, options: &FlashOptions) -> Self {
        let properties = &algorithm.flash_properties;
        let erase_sector = Duration::from_millis(properties.erase_sector_timeout as u64);
        let sectors = algorithm.iter_sectors().count() as u32;

        Self {
            init: Duration::from_millis(options.init_timeout_ms),
            erase_sector,
            erase_all: erase_sector
                .saturating_mul(sectors)
                .max(Self::MIN_ERASE_ALL),
            program_page: Duration::from_millis(properties.program_page_timeout as u64),
        }
    }
}
