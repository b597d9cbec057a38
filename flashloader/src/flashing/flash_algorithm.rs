use super::FlashError;
use flashloader_target::{
    FlashProperties, MemoryMap, MemoryRange, PageInfo, RawFlashAlgorithm, SectorInfo,
};
use std::ops::Range;

/// A flash algorithm, which has been assembled for a specific
/// chip.
///
/// All addresses are absolute. To create a [FlashAlgorithm], call the
/// [`assemble_from_raw`] function.
///
/// [`assemble_from_raw`]: FlashAlgorithm::assemble_from_raw
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// Whether this flash algorithm is the default one or not.
    pub default: bool,
    /// Memory address where the flash algo instructions will be loaded to.
    pub load_address: u64,
    /// List of 32-bit words containing the code for the algo.
    pub instructions: Vec<u32>,
    /// Address of the `Init()` entry point. Optional.
    pub pc_init: Option<u64>,
    /// Address of the `UnInit()` entry point. Optional.
    pub pc_uninit: Option<u64>,
    /// Address of the `ProgramPage()` entry point.
    pub pc_program_page: u64,
    /// Address of the `EraseSector()` entry point.
    pub pc_erase_sector: u64,
    /// Address of the `EraseAll()` entry point. Optional.
    pub pc_erase_all: Option<u64>,
    /// Initial value of the R9 register for calling flash algo entry points, which
    /// determines where the static data resides.
    pub static_base: u64,
    /// Initial value of the stack pointer when calling any flash algo API.
    pub begin_stack: u64,
    /// Size of the stack below `begin_stack`.
    pub stack_size: u64,
    /// Base addresses of the page buffers, each holding one page.
    ///
    /// With two buffers, double buffered programming is possible.
    pub page_buffers: Vec<u64>,
    /// Smallest amount of data `ProgramPage()` accepts.
    pub min_program_length: u32,
    /// RAM reserved for the CRC analyzer, if the chip supports it.
    pub analyzer: Option<Range<u64>>,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

impl FlashAlgorithm {
    /// Stack size used when the algorithm does not declare one.
    const FLASH_ALGO_MIN_STACK_SIZE: u32 = 512;

    /// RAM needed by the CRC analyzer.
    const ANALYZER_SIZE: u64 = 0x600;

    /// `BKPT #0` in the first halfword of the image.
    ///
    /// Algorithms starting with it return into a breakpoint at their load address.
    /// The second halfword is a branch over the header, its encoding varies.
    const BKPT_INSTRUCTION: u32 = 0xBE00;

    /// Try to retrieve the information about the flash sector
    /// which contains `address`.
    ///
    /// If the `address` is not part of the flash, None will
    /// be returned.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        let sector = self.flash_properties.sector_info(address);
        if sector.is_none() {
            tracing::trace!("Address {:08x} not contained in this flash device", address);
        }
        sector
    }

    /// Returns the necessary information about the page which `address` resides in
    /// if the address is inside the flash region.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        self.flash_properties.page_info(address)
    }

    /// Iterate over all the sectors of the flash.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        self.flash_properties.iter_sectors()
    }

    /// Iterate over all the pages of the flash.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageInfo> + '_ {
        self.flash_properties.iter_pages()
    }

    /// Returns true if the entire contents of the argument array equal the erased byte value.
    pub fn is_erased(&self, data: &[u8]) -> bool {
        data.iter()
            .all(|b| *b == self.flash_properties.erased_byte_value)
    }

    /// The RAM occupied by the instructions.
    pub fn image_range(&self) -> Range<u64> {
        self.load_address..self.load_address + self.image_size()
    }

    /// Size of the instruction image in bytes.
    pub fn image_size(&self) -> u64 {
        self.instructions.len() as u64 * 4
    }

    /// The RAM reserved for the stack.
    pub fn stack_range(&self) -> Range<u64> {
        self.begin_stack - self.stack_size..self.begin_stack
    }

    /// Whether routines can return into the breakpoint at the start of the image.
    ///
    /// Otherwise a hardware breakpoint has to be placed at the load address.
    pub fn has_return_header(&self) -> bool {
        self.instructions
            .first()
            .is_some_and(|word| word & 0xFFFF == Self::BKPT_INSTRUCTION)
    }

    /// Whether the algorithm has the two page buffers needed for double buffering.
    pub fn double_buffering_supported(&self) -> bool {
        self.page_buffers.len() > 1
    }

    /// Constructs a complete flash algorithm for the chip with the given memory map.
    ///
    /// Entry points are made absolute, and code, stack and buffers are checked
    /// against each other and against the RAM of the chip.
    pub fn assemble_from_raw(
        raw: &RawFlashAlgorithm,
        memory_map: &MemoryMap,
    ) -> Result<Self, FlashError> {
        let invalid = |reason: String| FlashError::InvalidFlashAlgorithm {
            name: raw.name.clone(),
            reason,
        };

        let page_size = raw.flash_properties.page_size;
        if page_size == 0 || page_size % 4 != 0 {
            return Err(invalid(format!(
                "page size {page_size:#x} is not a non-zero multiple of 4"
            )));
        }
        raw.flash_properties.validate().map_err(invalid)?;

        let min_program_length = raw.min_program_length.unwrap_or(page_size);
        if min_program_length == 0 || page_size % min_program_length != 0 {
            return Err(invalid(format!(
                "minimum program length {min_program_length:#x} does not divide the page size {page_size:#x}"
            )));
        }

        if raw.instructions.is_empty() {
            return Err(invalid("the instruction image is empty".to_string()));
        }

        // Code
        let image_size = raw.instructions.len() as u64 * 4;
        let image = raw.load_address..raw.load_address + image_size;
        let ram = memory_map
            .ram_regions()
            .find(|ram| ram.range.contains(&image.start))
            .ok_or_else(|| FlashError::RegionNotInRam {
                what: "instruction image",
                range: image.clone(),
            })?;
        if image.end > ram.range.end {
            return Err(FlashError::AlgorithmTooLarge {
                size: image_size,
                available: ram.range.end - image.start,
            });
        }
        tracing::debug!("Flash algorithm '{}' occupies {:#010x?}", raw.name, image);

        let entry_points = [
            ("init", raw.pc_init),
            ("uninit", raw.pc_uninit),
            ("program_page", Some(raw.pc_program_page)),
            ("erase_sector", Some(raw.pc_erase_sector)),
            ("erase_all", raw.pc_erase_all),
        ];
        for (name, offset) in entry_points {
            let Some(offset) = offset else {
                continue;
            };
            // The thumb bit does not move the entry point.
            if (offset & !1) as u64 >= image_size {
                return Err(FlashError::EntryPointOutOfBounds {
                    name,
                    offset,
                    image_size,
                });
            }
        }

        // Stack
        let stack_size = raw.stack_size.unwrap_or(Self::FLASH_ALGO_MIN_STACK_SIZE) as u64;
        let stack = raw
            .begin_stack
            .checked_sub(stack_size)
            .map(|bottom| bottom..raw.begin_stack)
            .ok_or_else(|| invalid(format!("stack of {stack_size:#x} bytes underflows")))?;
        if memory_map.ram_region_containing(&stack).is_none() {
            return Err(FlashError::RegionNotInRam {
                what: "stack",
                range: stack,
            });
        }
        if image.intersects_range(&stack) {
            return Err(FlashError::LoadAddressConflict {
                image,
                what: "stack",
                conflict: stack,
            });
        }

        // Data
        let page_buffers = if raw.page_buffers.is_empty() {
            vec![raw.begin_data]
        } else {
            if raw.page_buffers.len() > 2 {
                tracing::debug!(
                    "Flash algorithm '{}' declares {} page buffers, using the first two",
                    raw.name,
                    raw.page_buffers.len()
                );
            }
            raw.page_buffers.iter().copied().take(2).collect()
        };

        let buffer_range = |address: u64| address..address + page_size as u64;
        for &buffer in &page_buffers {
            let range = buffer_range(buffer);
            if memory_map.ram_region_containing(&range).is_none() {
                return Err(FlashError::RegionNotInRam {
                    what: "page buffer",
                    range,
                });
            }
            if image.intersects_range(&range) {
                return Err(FlashError::LoadAddressConflict {
                    image,
                    what: "page buffer",
                    conflict: range,
                });
            }
            if stack.intersects_range(&range) {
                return Err(invalid(format!(
                    "page buffer {range:#010x?} overlaps with the stack {stack:#010x?}"
                )));
            }
        }
        if let [first, second] = page_buffers[..] {
            if buffer_range(first).intersects_range(&buffer_range(second)) {
                return Err(FlashError::PageBufferOverlap { first, second });
            }
        }

        // Analyzer
        let analyzer = raw
            .analyzer_supported
            .then(|| raw.analyzer_address..raw.analyzer_address + Self::ANALYZER_SIZE);
        if let Some(analyzer) = &analyzer {
            if image.intersects_range(analyzer) {
                return Err(FlashError::LoadAddressConflict {
                    image,
                    what: "analyzer",
                    conflict: analyzer.clone(),
                });
            }
            let clobbered = std::iter::once(stack.clone())
                .chain(page_buffers.iter().map(|&buffer| buffer_range(buffer)))
                .find(|range| range.intersects_range(analyzer));
            if let Some(range) = clobbered {
                return Err(invalid(format!(
                    "the analyzer at {analyzer:#010x?} overlaps with {range:#010x?}"
                )));
            }
        }

        tracing::debug!("Page buffers: {:#010X?}", page_buffers);

        let absolute = |offset: u32| raw.load_address + offset as u64;

        Ok(FlashAlgorithm {
            name: raw.name.clone(),
            default: raw.default,
            load_address: raw.load_address,
            instructions: raw.instructions.clone(),
            pc_init: raw.pc_init.map(absolute),
            pc_uninit: raw.pc_uninit.map(absolute),
            pc_program_page: absolute(raw.pc_program_page),
            pc_erase_sector: absolute(raw.pc_erase_sector),
            pc_erase_all: raw.pc_erase_all.map(absolute),
            static_base: raw.static_base,
            begin_stack: raw.begin_stack,
            stack_size,
            page_buffers,
            min_program_length,
            analyzer,
            flash_properties: raw.flash_properties.clone(),
        })
    }
}
