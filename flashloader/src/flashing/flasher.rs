use tracing::Level;

use super::{
    AbortHandle, FlashAlgorithm, FlashContext, FlashError, FlashOptions, FlashProgress,
    FlasherState, LoadedAlgorithm, PageProgrammer, RoutineStatus, Timeouts,
};
use crate::core::{CoreInterface, CoreRegister, HaltReason};
use crate::error::LinkError;
use flashloader_target::{MemoryRange, NvmRegion, SectorInfo};
use std::fmt::Debug;
use std::ops::Range;
use std::time::{Duration, Instant};

/// How long to wait for the core to acknowledge a halt request.
const HALT_TIMEOUT: Duration = Duration::from_millis(100);

/// Slice of a routine timeout after which the abort flag is checked again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The function a flash algorithm is initialized for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Erasing sectors or the whole flash.
    Erase,
    /// Programming pages.
    Program,
    /// Verifying programmed data.
    Verify,
}

impl Operation {
    /// The function code passed to `Init()` and `UnInit()`.
    pub fn code(self) -> u32 {
        match self {
            Operation::Erase => 1,
            Operation::Program => 2,
            Operation::Verify => 3,
        }
    }

    /// Human readable name of the operation.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Erase => "Erase",
            Operation::Program => "Program",
            Operation::Verify => "Verify",
        }
    }
}

/// A structure to control the flash of an attached microchip.
///
/// Constructing it loads the flash algorithm into target RAM, unless the
/// [`FlashContext`] shows it is already resident. Operations run between an
/// `Init()` and `UnInit()` call of the algorithm, see [`Flasher::run`].
pub struct Flasher<'a> {
    core: &'a mut dyn CoreInterface,
    context: &'a mut FlashContext,
    region: NvmRegion,
    algorithm: FlashAlgorithm,
    timeouts: Timeouts,
    options: FlashOptions,
    progress: FlashProgress,
    abort: AbortHandle,
}

impl<'a> Flasher<'a> {
    /// Prepare flashing `region` with `algorithm`.
    pub fn new(
        core: &'a mut dyn CoreInterface,
        context: &'a mut FlashContext,
        region: NvmRegion,
        algorithm: FlashAlgorithm,
        options: FlashOptions,
        abort: AbortHandle,
    ) -> Result<Self, FlashError> {
        if context.state != FlasherState::Idle {
            return Err(FlashError::OperationInProgress);
        }

        let timeouts = Timeouts::new(&algorithm, &options);
        let progress = options.progress();

        let mut this = Self {
            core,
            context,
            region,
            algorithm,
            timeouts,
            options,
            progress,
            abort,
        };

        if this
            .context
            .is_loaded(&this.algorithm.name, this.algorithm.load_address)
        {
            tracing::debug!(
                "Flash algorithm '{}' is already loaded.",
                this.algorithm.name
            );
        } else {
            this.load()?;
        }

        Ok(this)
    }

    /// The assembled flash algorithm.
    pub fn flash_algorithm(&self) -> &FlashAlgorithm {
        &self.algorithm
    }

    /// The flash region this flasher operates on.
    pub fn region(&self) -> &NvmRegion {
        &self.region
    }

    /// Timeouts of the algorithm routines.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// The runtime state of flashing.
    pub fn context(&self) -> &FlashContext {
        self.context
    }

    /// Whether pages can be programmed through two alternating buffers.
    pub fn double_buffering_supported(&self) -> bool {
        self.algorithm.double_buffering_supported()
    }

    /// Write the algorithm to RAM and check it arrived unchanged.
    fn load(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Initializing the flash algorithm.");
        self.context.invalidate();

        let algo = &self.algorithm;

        tracing::debug!("Halting core");
        self.core.halt(HALT_TIMEOUT)?;

        // Load flash algorithm code into target RAM.
        let span = tracing::debug_span!("Loading algorithm into RAM", address = algo.load_address)
            .entered();

        self.core.write_32(algo.load_address, &algo.instructions)?;

        drop(span);

        let mut data = vec![0; algo.instructions.len()];
        self.core.read_32(algo.load_address, &mut data)?;

        let mismatch = algo
            .instructions
            .iter()
            .zip(data.iter())
            .position(|(original, read_back)| original != read_back);
        if let Some(offset) = mismatch {
            let address = algo.load_address + (4 * offset) as u64;
            tracing::error!(
                "Failed to verify flash algorithm. Data mismatch at address {:#08x}",
                address
            );
            tracing::error!("Original instruction: {:#08x}", algo.instructions[offset]);
            tracing::error!("Readback instruction: {:#08x}", data[offset]);

            return Err(FlashError::FlashAlgorithmNotLoaded { address });
        }

        tracing::debug!("RAM contents match flashing algo blob.");

        if let Some(breakpoint) = self.context.return_breakpoint.take() {
            if let Err(error) = self.core.clear_hw_breakpoint(breakpoint) {
                tracing::warn!("Failed to clear breakpoint at {:#010x}: {}", breakpoint, error);
            }
        }
        if !algo.has_return_header() {
            // Routines return to the load address, which has no BKPT without the header.
            self.core.set_hw_breakpoint(algo.load_address)?;
            self.context.return_breakpoint = Some(algo.load_address);
        }

        self.context.loaded_algorithm = Some(LoadedAlgorithm {
            name: algo.name.clone(),
            load_address: algo.load_address,
            size: algo.image_size(),
        });
        self.context.ram_cursor = Some(algo.image_range().end);
        self.context.active_buffer = 0;

        Ok(())
    }

    /// Initialize the algorithm for `operation`.
    ///
    /// The returned [`ActiveFlasher`] calls `UnInit()` when it is dropped.
    pub fn init(&mut self, operation: Operation) -> Result<ActiveFlasher<'_>, FlashError> {
        if self.context.state != FlasherState::Idle {
            return Err(FlashError::OperationInProgress);
        }
        if self.context.loaded_algorithm.is_none() {
            // A previous failure discarded the algorithm.
            self.load()?;
        }

        tracing::debug!("Preparing Flasher for operation {}", operation.name());
        let mut flasher = ActiveFlasher {
            core: &mut *self.core,
            context: &mut *self.context,
            algorithm: &self.algorithm,
            region: &self.region,
            timeouts: self.timeouts,
            progress: self.progress.clone(),
            abort: self.abort.clone(),
            clock: self.options.clock,
            double_buffering: self.options.double_buffering,
            operation,
            needs_setup: true,
            pending: None,
        };

        flasher.init()?;

        Ok(flasher)
    }

    /// Run `f` between `Init()` and `UnInit()` of `operation`.
    ///
    /// `UnInit()` is attempted even if `f` fails. Its own failure is only logged.
    pub fn run<T>(
        &mut self,
        operation: Operation,
        f: impl FnOnce(&mut ActiveFlasher<'_>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        let mut active = self.init(operation)?;
        let result = f(&mut active);

        if let Err(error) = active.uninit() {
            tracing::warn!("Failed to uninitialize the flash algorithm: {}", error);
        }

        result
    }

    /// Erase every sector which intersects `range`.
    pub fn erase_sectors(&mut self, range: Range<u64>) -> Result<(), FlashError> {
        self.check_range(&range)?;
        self.run(Operation::Erase, |active| active.erase_range(&range))
    }

    /// Erase the whole flash with the `EraseAll()` routine.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        let progress = self.progress.clone();

        progress.started_erasing();
        let result = self.run(Operation::Erase, |active| active.erase_all());
        if result.is_ok() {
            progress.finished_erasing();
        } else {
            progress.failed_erasing();
        }

        result
    }

    /// Program `data` to the page aligned `address`.
    ///
    /// The touched sectors are erased first, unless [`FlashOptions::skip_erase`] is set.
    /// Returns the number of bytes programmed.
    pub fn program(&mut self, address: u64, data: &[u8]) -> Result<u64, FlashError> {
        let range = address..address + data.len() as u64;
        self.check_range(&range)?;

        let skip_erase = self.options.skip_erase;
        let progress = self.progress.clone();

        self.run(Operation::Program, |active| {
            if !skip_erase {
                active.erase_range(&range)?;
            }

            progress.started_programming();
            let mut programmer = active.program_range(address, data)?;
            for page in &mut programmer {
                if let Err(error) = page {
                    progress.failed_programming();
                    return Err(error);
                }
            }
            progress.finished_programming();

            Ok(programmer.committed())
        })
    }

    /// Compare the flash contents at `address` with `data`.
    pub fn verify(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        let range = address..address + data.len() as u64;
        self.check_range(&range)?;
        self.run(Operation::Verify, |active| active.verify(address, data))
    }

    fn check_range(&self, range: &Range<u64>) -> Result<(), FlashError> {
        if range.is_empty() || self.region.range.contains_range(range) {
            Ok(())
        } else {
            Err(FlashError::RangeOutsideFlash {
                start: range.start,
                end: range.end,
                flash: self.region.range.clone(),
            })
        }
    }
}

#[derive(Clone, Copy)]
struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}({:?}, {:?}, {:?}, {:?})",
            self.pc, self.r0, self.r1, self.r2, self.r3
        )
    }
}

fn into_reg(val: u64) -> Result<u32, FlashError> {
    let reg_value: u32 = val
        .try_into()
        .map_err(|_| FlashError::RegisterValueNotSupported(val))?;

    Ok(reg_value)
}

fn check_result(name: &'static str, error_code: u32) -> Result<(), FlashError> {
    if error_code == 0 {
        Ok(())
    } else {
        Err(FlashError::RoutineCallFailed { name, error_code })
    }
}

/// `ProgramPage()` which runs on the target while the host continues.
#[derive(Debug)]
struct PendingCall {
    address: u64,
    buffer: usize,
    registers: Registers,
    retried: bool,
    started: Instant,
}

/// A flash algorithm which has been initialized for an [`Operation`].
///
/// Routines can be called until [`ActiveFlasher::uninit`] runs, which also
/// happens when the value is dropped. A failed erase or program operation
/// uninitializes the algorithm, later calls fail with [`FlashError::NotInitialized`].
pub struct ActiveFlasher<'f> {
    core: &'f mut dyn CoreInterface,
    context: &'f mut FlashContext,
    algorithm: &'f FlashAlgorithm,
    region: &'f NvmRegion,
    timeouts: Timeouts,
    progress: FlashProgress,
    abort: AbortHandle,
    clock: Option<u32>,
    double_buffering: bool,
    operation: Operation,
    /// Static base and stack pointer have to be written with the next call.
    needs_setup: bool,
    pending: Option<PendingCall>,
}

impl<'f> ActiveFlasher<'f> {
    /// The assembled flash algorithm.
    pub fn flash_algorithm(&self) -> &FlashAlgorithm {
        self.algorithm
    }

    /// The operation the algorithm was initialized for.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The state of the driver.
    pub fn state(&self) -> FlasherState {
        self.context.state
    }

    #[tracing::instrument(name = "Call to flash algorithm init", skip(self))]
    fn init(&mut self) -> Result<(), FlashError> {
        let algo = self.algorithm;

        let Some(pc_init) = algo.pc_init else {
            self.context.state = FlasherState::Ready;
            return Ok(());
        };

        let registers = Registers {
            pc: into_reg(pc_init)?,
            r0: Some(into_reg(algo.flash_properties.address_range.start)?),
            r1: Some(self.clock.unwrap_or(0)),
            r2: Some(self.operation.code()),
            r3: None,
        };
        let timeout = self.timeouts.init;

        let result = self
            .call_function("init", &registers)
            .and_then(|()| self.wait_for_completion("init", timeout, true));

        let error = match result {
            Ok(0) => {
                self.context.state = FlasherState::Ready;
                return Ok(());
            }
            Ok(error_code) => FlashError::AlgoInitFault { error_code },
            Err(FlashError::Link(LinkError::Timeout)) => FlashError::AlgoInitTimeout,
            Err(error) => error,
        };

        // The algorithm state is unknown, it is loaded again before the next use.
        if let Err(halt_error) = self.core.halt(HALT_TIMEOUT) {
            tracing::warn!("Failed to halt the core after init failed: {}", halt_error);
        }
        self.context.state = FlasherState::Idle;
        self.context.invalidate();

        Err(error)
    }

    /// Call `UnInit()` and return to [`FlasherState::Idle`].
    ///
    /// A routine which is still running is halted first. Does nothing if the algorithm
    /// is not initialized.
    pub fn uninit(&mut self) -> Result<(), FlashError> {
        if self.context.state == FlasherState::Idle {
            return Ok(());
        }

        tracing::debug!("Running uninit routine.");
        let result = self.run_uninit();

        self.pending = None;
        self.context.state = FlasherState::Idle;

        if result.is_err() {
            // The routine may still be running, the algorithm is loaded again before the next use.
            if let Err(halt_error) = self.core.halt(HALT_TIMEOUT) {
                tracing::warn!("Failed to halt the core after uninit failed: {}", halt_error);
            }
            self.context.invalidate();
        }

        result
    }

    fn run_uninit(&mut self) -> Result<(), FlashError> {
        if self.context.state == FlasherState::Busy {
            self.core.halt(HALT_TIMEOUT)?;
            self.context.state = FlasherState::Ready;
        }

        let Some(pc_uninit) = self.algorithm.pc_uninit else {
            return Ok(());
        };

        let registers = Registers {
            pc: into_reg(pc_uninit)?,
            r0: Some(self.operation.code()),
            r1: None,
            r2: None,
            r3: None,
        };
        self.call_function("uninit", &registers)?;
        let result = self.wait_for_completion("uninit", self.timeouts.init, false)?;

        check_result("uninit", result)
    }

    /// Erase the sector containing `address`.
    #[tracing::instrument(skip(self))]
    pub fn erase_sector(&mut self, address: u64) -> Result<(), FlashError> {
        self.ensure_ready()?;
        self.ensure_erasable()?;

        let algo = self.algorithm;
        let sector = algo
            .sector_info(address)
            .ok_or_else(|| FlashError::RangeOutsideFlash {
                start: address,
                end: address + 1,
                flash: algo.flash_properties.address_range.clone(),
            })?;

        tracing::info!("Erasing sector at address 0x{:08x}", address);
        let t1 = Instant::now();

        let registers = Registers {
            pc: into_reg(algo.pc_erase_sector)?,
            r0: Some(into_reg(address)?),
            r1: None,
            r2: None,
            r3: None,
        };
        let timeout = self.timeouts.erase_sector;

        let result = self
            .call_with_retry("erase_sector", &registers, timeout)
            .and_then(|code| check_result("erase_sector", code));

        match result {
            Ok(()) => {
                tracing::info!("Done erasing sector. This took {:?}", t1.elapsed());
                self.progress
                    .sector_erased(sector.base_address, sector.size, t1.elapsed());
                Ok(())
            }
            Err(error) => Err(self.fatal(error, |source| FlashError::EraseFailed {
                address,
                source: Box::new(source),
            })),
        }
    }

    /// Erase every sector which intersects `range`, in increasing address order.
    pub fn erase_range(&mut self, range: &Range<u64>) -> Result<(), FlashError> {
        let sectors: Vec<SectorInfo> = self
            .algorithm
            .iter_sectors()
            .filter(|sector| sector.address_range().intersects_range(range))
            .collect();

        self.progress.started_erasing();
        for sector in sectors {
            if let Err(error) = self.erase_sector(sector.base_address) {
                self.progress.failed_erasing();
                return Err(error);
            }
        }
        self.progress.finished_erasing();

        Ok(())
    }

    /// Erase the whole flash with the `EraseAll()` routine.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        self.ensure_ready()?;
        self.ensure_erasable()?;

        let algo = self.algorithm;
        let Some(pc_erase_all) = algo.pc_erase_all else {
            return Err(FlashError::EraseAllNotSupported);
        };

        tracing::debug!("Erasing entire chip.");
        let t1 = Instant::now();

        let registers = Registers {
            pc: into_reg(pc_erase_all)?,
            r0: None,
            r1: None,
            r2: None,
            r3: None,
        };
        let timeout = self.timeouts.erase_all;

        let result = self
            .call_with_retry("erase_all", &registers, timeout)
            .and_then(|code| check_result("erase_all", code));

        match result {
            Ok(()) => {
                tracing::info!("Erasing the chip took {:?}", t1.elapsed());
                Ok(())
            }
            Err(error) => Err(self.fatal(error, |source| FlashError::EraseFailed {
                address: algo.flash_properties.address_range.start,
                source: Box::new(source),
            })),
        }
    }

    /// Program one page.
    ///
    /// `data` may be shorter than a page if its length is a multiple of the
    /// minimum program length. The rest of the page is filled with the erased
    /// byte value.
    pub fn program_page(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        self.ensure_ready()?;
        self.check_page(address, data.len())?;

        tracing::info!(
            "Flashing page at address {:#08x} with size: {}",
            address,
            data.len()
        );

        if let Err(error) = self.load_page_buffer(data, 0) {
            return Err(self.page_failed(address, error));
        }
        self.start_program_page_with_buffer(address, 0)?;
        self.wait_for_program_page()
    }

    /// Program `data` page by page, starting at the page aligned `address`.
    ///
    /// The pages are programmed as the returned iterator advances.
    pub fn program_range<'p>(
        &'p mut self,
        address: u64,
        data: &'p [u8],
    ) -> Result<PageProgrammer<'p, 'f>, FlashError> {
        let properties = &self.algorithm.flash_properties;
        let page_size = properties.page_size;

        if address % page_size as u64 != 0 {
            return Err(FlashError::UnalignedPageAddress { address, page_size });
        }
        let range = address..address + data.len() as u64;
        if !data.is_empty() && !properties.address_range.contains_range(&range) {
            return Err(FlashError::RangeOutsideFlash {
                start: range.start,
                end: range.end,
                flash: properties.address_range.clone(),
            });
        }

        let buffers = if self.double_buffering && self.algorithm.double_buffering_supported() {
            2
        } else {
            1
        };
        tracing::debug!(
            "Programming {} bytes at {:#010x} with {} page buffer(s)",
            data.len(),
            address,
            buffers
        );
        self.context.active_buffer = 0;

        Ok(PageProgrammer::new(self, address, data, buffers))
    }

    /// Copy `data` into page buffer `buffer`, padded to a full page.
    ///
    /// The buffer used by a running `ProgramPage()` cannot be loaded.
    pub fn load_page_buffer(&mut self, data: &[u8], buffer: usize) -> Result<(), FlashError> {
        let algo = self.algorithm;
        let page_size = algo.flash_properties.page_size;

        let address = self.page_buffer(buffer)?;
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.buffer == buffer)
        {
            return Err(FlashError::OperationInProgress);
        }
        if data.is_empty() || data.len() > page_size as usize {
            return Err(FlashError::InvalidProgramLength {
                length: data.len(),
                page_size,
                min_program_length: algo.min_program_length,
            });
        }

        let mut page = data.to_vec();
        page.resize(page_size as usize, algo.flash_properties.erased_byte_value);

        let words: Vec<u32> = page
            .chunks_exact(std::mem::size_of::<u32>())
            .map(|a| u32::from_le_bytes([a[0], a[1], a[2], a[3]]))
            .collect();

        let t1 = Instant::now();
        self.core.write_32(address, &words)?;

        tracing::info!(
            "Took {:?} to download {} byte page into ram",
            t1.elapsed(),
            page.len()
        );

        Ok(())
    }

    /// Start `ProgramPage()` for the page at `address` with the data in `buffer`,
    /// without waiting for it to finish.
    ///
    /// [`ActiveFlasher::wait_for_program_page`] completes the call.
    pub fn start_program_page_with_buffer(
        &mut self,
        address: u64,
        buffer: usize,
    ) -> Result<(), FlashError> {
        self.ensure_ready()?;
        let buffer_address = self.page_buffer(buffer)?;
        let page_size = self.algorithm.flash_properties.page_size;
        self.check_page(address, page_size as usize)?;

        let registers = Registers {
            pc: into_reg(self.algorithm.pc_program_page)?,
            r0: Some(into_reg(address)?),
            r1: Some(page_size),
            r2: Some(into_reg(buffer_address)?),
            r3: None,
        };

        let mut retried = false;
        let started = match self.call_function("program_page", &registers) {
            Err(error) if error.is_recoverable() => {
                tracing::warn!(
                    "Starting 'program_page' failed: {}. Resetting the link and retrying once.",
                    error
                );
                retried = true;
                self.recover_link()
                    .and_then(|()| self.call_function("program_page", &registers))
            }
            result => result,
        };
        if let Err(error) = started {
            return Err(self.page_failed(address, error));
        }

        self.pending = Some(PendingCall {
            address,
            buffer,
            registers,
            retried,
            started: Instant::now(),
        });

        Ok(())
    }

    /// Wait for the `ProgramPage()` started last.
    pub fn wait_for_program_page(&mut self) -> Result<(), FlashError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let timeout = self.timeouts.program_page;

        let result = match self.wait_for_completion("program_page", timeout, true) {
            Err(error) if error.is_recoverable() && !pending.retried => {
                // The page data is still in its buffer.
                self.retry("program_page", &pending.registers, timeout, error)
            }
            result => result,
        }
        .and_then(|code| check_result("program_page", code));

        match result {
            Ok(()) => {
                let time = pending.started.elapsed();
                tracing::info!("Flashing took: {:?}", time);
                self.progress.page_programmed(
                    pending.address,
                    self.algorithm.flash_properties.page_size,
                    time,
                );
                Ok(())
            }
            Err(error) => Err(self.page_failed(pending.address, error)),
        }
    }

    /// Compare the memory at `address` with `data`.
    pub fn verify(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        self.ensure_ready()?;

        let mut read_back = vec![0; data.len()];
        self.core.read_8(address, &mut read_back)?;

        match data.iter().zip(&read_back).position(|(a, b)| a != b) {
            Some(offset) => Err(FlashError::Verify {
                address: address + offset as u64,
            }),
            None => Ok(()),
        }
    }

    /// Returns the buffer the next page is staged into, and moves on to the other one.
    pub(super) fn next_buffer(&mut self, buffers: usize) -> usize {
        let buffer = self.context.active_buffer;
        self.context.active_buffer = (buffer + 1) % buffers;
        buffer
    }

    /// Uninitialize the algorithm after a fatal error and mark it for reloading.
    pub(super) fn fail(&mut self, error: FlashError) -> FlashError {
        if let Err(uninit_error) = self.uninit() {
            tracing::warn!(
                "Failed to uninitialize the flash algorithm: {}",
                uninit_error
            );
        }
        self.context.invalidate();
        error
    }

    fn fatal(
        &mut self,
        error: FlashError,
        wrap: impl FnOnce(FlashError) -> FlashError,
    ) -> FlashError {
        match error {
            // The abort already uninitialized the algorithm.
            FlashError::Aborted => FlashError::Aborted,
            error => {
                let error = wrap(error);
                self.fail(error)
            }
        }
    }

    fn page_failed(&mut self, page_address: u64, error: FlashError) -> FlashError {
        self.fatal(error, |source| FlashError::ProgramFailed {
            page_address,
            committed: 0,
            source: Box::new(source),
        })
    }

    fn ensure_ready(&self) -> Result<(), FlashError> {
        match self.context.state {
            FlasherState::Ready => Ok(()),
            FlasherState::Busy => Err(FlashError::OperationInProgress),
            FlasherState::Idle => Err(FlashError::NotInitialized),
        }
    }

    fn ensure_erasable(&self) -> Result<(), FlashError> {
        if self.region.is_erasable {
            Ok(())
        } else {
            Err(FlashError::NotErasable {
                region: self.region.range.clone(),
            })
        }
    }

    fn page_buffer(&self, buffer: usize) -> Result<u64, FlashError> {
        self.algorithm
            .page_buffers
            .get(buffer)
            .copied()
            .ok_or(FlashError::InvalidPageBuffer {
                index: buffer,
                available: self.algorithm.page_buffers.len(),
            })
    }

    fn check_page(&self, address: u64, length: usize) -> Result<(), FlashError> {
        let properties = &self.algorithm.flash_properties;
        let page_size = properties.page_size;
        let min_program_length = self.algorithm.min_program_length;

        if address % page_size as u64 != 0 {
            return Err(FlashError::UnalignedPageAddress { address, page_size });
        }
        if length == 0
            || length > page_size as usize
            || length % min_program_length as usize != 0
        {
            return Err(FlashError::InvalidProgramLength {
                length,
                page_size,
                min_program_length,
            });
        }

        let page = address..address + page_size as u64;
        if !properties.address_range.contains_range(&page) {
            return Err(FlashError::RangeOutsideFlash {
                start: page.start,
                end: page.end,
                flash: properties.address_range.clone(),
            });
        }

        Ok(())
    }

    fn call_with_retry(
        &mut self,
        name: &'static str,
        registers: &Registers,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        let result = self
            .call_function(name, registers)
            .and_then(|()| self.wait_for_completion(name, timeout, true));

        match result {
            Err(error) if error.is_recoverable() => self.retry(name, registers, timeout, error),
            result => result,
        }
    }

    fn retry(
        &mut self,
        name: &'static str,
        registers: &Registers,
        timeout: Duration,
        error: FlashError,
    ) -> Result<u32, FlashError> {
        tracing::warn!(
            "Routine '{}' failed: {}. Resetting the link and retrying once.",
            name,
            error
        );

        self.recover_link()?;
        self.call_function(name, registers)?;
        self.wait_for_completion(name, timeout, true)
    }

    /// Reset the link and halt the core, so the routine can be called again.
    fn recover_link(&mut self) -> Result<(), FlashError> {
        self.core.reset_link()?;
        self.core.halt(HALT_TIMEOUT)?;

        self.context.state = FlasherState::Ready;
        self.needs_setup = true;

        Ok(())
    }

    fn call_function(&mut self, name: &'static str, registers: &Registers) -> Result<(), FlashError> {
        tracing::debug!(
            "Calling routine '{}' {:?}, setup={}",
            name,
            &registers,
            self.needs_setup
        );

        let algo = self.algorithm;

        let arguments = [registers.r0, registers.r1, registers.r2, registers.r3];
        let mut writes = vec![(CoreRegister::Pc, Some(registers.pc))];
        writes.extend(
            arguments
                .into_iter()
                .enumerate()
                .filter_map(|(index, value)| Some((CoreRegister::argument(index)?, value))),
        );
        if self.needs_setup {
            writes.push((CoreRegister::R9, Some(into_reg(algo.static_base)?)));
            writes.push((CoreRegister::Sp, Some(into_reg(algo.begin_stack)?)));
        }
        // The return address has the Thumb bit set, so the core stays in Thumb mode.
        writes.push((CoreRegister::Lr, Some(into_reg(algo.load_address + 1)?)));

        for (register, value) in writes {
            let Some(value) = value else {
                continue;
            };
            self.core.write_core_reg(register, value)?;

            if tracing::enabled!(Level::DEBUG) {
                let read_back = self.core.read_core_reg(register)?;

                tracing::debug!(
                    "content of {:?}: 0x{:08x} should be: 0x{:08x}",
                    register,
                    read_back,
                    value
                );
            }
        }

        // Resume target operation.
        self.core.run()?;

        self.context.state = FlasherState::Busy;
        self.needs_setup = false;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn wait_for_completion(
        &mut self,
        name: &'static str,
        timeout: Duration,
        abortable: bool,
    ) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");

        let start = Instant::now();

        loop {
            if abortable && self.abort.is_aborted() {
                tracing::warn!("Aborting routine '{}'", name);
                self.context.last_status = Some(RoutineStatus {
                    routine: name,
                    result: None,
                });
                if let Err(error) = self.uninit() {
                    tracing::warn!("Failed to uninitialize the flash algorithm: {}", error);
                }
                return Err(FlashError::Aborted);
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                self.context.last_status = Some(RoutineStatus {
                    routine: name,
                    result: None,
                });
                return Err(FlashError::Link(LinkError::Timeout));
            }

            match self.core.wait_for_halt(remaining.min(POLL_INTERVAL)) {
                Ok(HaltReason::Breakpoint) => break,
                Ok(reason) => {
                    self.context.state = FlasherState::Ready;
                    self.context.last_status = Some(RoutineStatus {
                        routine: name,
                        result: None,
                    });
                    return Err(FlashError::UnexpectedHalt { name, reason });
                }
                Err(LinkError::Timeout) => continue,
                Err(error) => return Err(error.into()),
            }
        }

        self.context.state = FlasherState::Ready;

        let result = self.core.read_core_reg(CoreRegister::result())?;
        self.context.last_status = Some(RoutineStatus {
            routine: name,
            result: Some(result),
        });

        Ok(result)
    }
}

impl Drop for ActiveFlasher<'_> {
    fn drop(&mut self) {
        if self.context.state != FlasherState::Idle {
            if let Err(error) = self.uninit() {
                tracing::warn!("Failed to uninitialize the flash algorithm: {}", error);
            }
        }
    }
}
