use std::ops::Range;

use crate::core::HaltReason;
use crate::error::LinkError;

/// Describes any error that happened during the or in preparation for the flashing procedure.
#[derive(thiserror::Error, docsplay::Display, Debug)]
pub enum FlashError {
    /// No memory region contains the address {address:#010x}.
    AddressNotMapped {
        /// The address that was looked up.
        address: u64,
    },
    /// The address {address:#010x} is not located in flash memory.
    NotFlashMemory {
        /// The address that was looked up.
        address: u64,
    },
    /// The memory map contains no flash region.
    NoFlashRegion,
    /// No flash algorithm is linked to the flash region {region:#010x?}.
    NoFlashAlgorithm {
        /// Range of the flash region.
        region: Range<u64>,
    },
    /// The range {start:#010x}..{end:#010x} does not fit into the flash {flash:#010x?}.
    RangeOutsideFlash {
        /// Start of the requested range.
        start: u64,
        /// End of the requested range.
        end: u64,
        /// The flash the range was checked against.
        flash: Range<u64>,
    },
    /// The flash region {region:#010x?} must not be erased.
    NotErasable {
        /// Range of the region.
        region: Range<u64>,
    },
    /// The flash algorithm '{name}' is invalid: {reason}
    InvalidFlashAlgorithm {
        /// Name of the algorithm.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The {what} {range:#010x?} of the flash algorithm is not located in RAM.
    RegionNotInRam {
        /// Which part of the algorithm is misplaced.
        what: &'static str,
        /// Location of that part.
        range: Range<u64>,
    },
    /// The flash algorithm needs {size} bytes of RAM, but only {available} bytes are available at its load address.
    AlgorithmTooLarge {
        /// Size of the instruction image.
        size: u64,
        /// RAM available from the load address to the end of its region.
        available: u64,
    },
    /// The flash algorithm image {image:#010x?} overlaps with the {what} at {conflict:#010x?}.
    LoadAddressConflict {
        /// Location of the instruction image.
        image: Range<u64>,
        /// What the image overlaps with.
        what: &'static str,
        /// Location of the overlapping part.
        conflict: Range<u64>,
    },
    /// The page buffers at {first:#010x} and {second:#010x} overlap.
    PageBufferOverlap {
        /// Address of the first buffer.
        first: u64,
        /// Address of the second buffer.
        second: u64,
    },
    /// The entry point '{name}' at offset {offset:#x} lies outside of the {image_size} byte instruction image.
    EntryPointOutOfBounds {
        /// Name of the entry point.
        name: &'static str,
        /// Offset relative to the load address.
        offset: u32,
        /// Size of the instruction image.
        image_size: u64,
    },
    /// The value {0:#x} does not fit into a 32-bit register.
    RegisterValueNotSupported(u64),
    /// The RAM contents did not match the flash algorithm after loading it, starting at {address:#010x}.
    FlashAlgorithmNotLoaded {
        /// First address which read back differently.
        address: u64,
    },
    /// The flash algorithm did not finish its initialization in time.
    AlgoInitTimeout,
    /// The initialization of the flash algorithm failed with code {error_code}.
    AlgoInitFault {
        /// The value returned by `Init()`.
        error_code: u32,
    },
    /// The execution of '{name}' failed with code {error_code}.
    RoutineCallFailed {
        /// Name of the routine.
        name: &'static str,
        /// The value returned by the routine.
        error_code: u32,
    },
    /// The core halted unexpectedly ({reason:?}) while running '{name}'.
    UnexpectedHalt {
        /// Name of the routine.
        name: &'static str,
        /// Why the core halted.
        reason: HaltReason,
    },
    /// Failed to erase the flash at {address:#010x}.
    EraseFailed {
        /// The sector address, or the flash start for a full erase.
        address: u64,
        /// The underlying error.
        source: Box<FlashError>,
    },
    /// The flash algorithm does not support erasing the whole flash.
    EraseAllNotSupported,
    /// Failed to program the page at {page_address:#010x} after {committed} bytes were written.
    ProgramFailed {
        /// Address of the failing page.
        page_address: u64,
        /// Bytes programmed successfully before the failing page.
        committed: u64,
        /// The underlying error.
        source: Box<FlashError>,
    },
    /// {length} bytes cannot be programmed: the length has to be a non-zero multiple of {min_program_length} and at most {page_size} bytes.
    InvalidProgramLength {
        /// Length of the data.
        length: usize,
        /// Page size of the flash.
        page_size: u32,
        /// Minimum program length of the algorithm.
        min_program_length: u32,
    },
    /// The address {address:#010x} is not aligned to the page size {page_size:#x}.
    UnalignedPageAddress {
        /// The requested address.
        address: u64,
        /// Page size of the flash.
        page_size: u32,
    },
    /// Page buffer {index} does not exist, the algorithm has {available}.
    InvalidPageBuffer {
        /// The requested buffer.
        index: usize,
        /// The number of buffers.
        available: usize,
    },
    /// Another flash operation is still in progress.
    OperationInProgress,
    /// The flash algorithm is not initialized.
    NotInitialized,
    /// Verification failed at address {address:#010x}.
    Verify {
        /// First address which differs.
        address: u64,
    },
    /// The operation was aborted.
    Aborted,
    /// An error with the target link occurred.
    Link(#[from] LinkError),
}

impl FlashError {
    /// Whether the error is a link error a link reset may clear.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FlashError::Link(error) if error.is_recoverable())
    }
}
