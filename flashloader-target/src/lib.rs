//! Target description schema
//!
//! Programming the flash of a chip requires a description of its memory map and
//! one or more flash algorithms: small routines which are copied into the RAM of the
//! target and run there to erase and program the flash.
//!
//! This crate contains the schema structs for the YAML target description files,
//! and the validation which makes sure that a loaded description is consistent.
#![warn(missing_docs)]

mod chip;
mod chip_family;
mod flash_algorithm;
mod flash_properties;
mod memory;
pub(crate) mod serialize;

pub use chip::Chip;
pub use chip_family::{ChipFamily, TargetDescriptionSource};
pub use flash_algorithm::RawFlashAlgorithm;
pub use flash_properties::FlashProperties;
pub use memory::{
    GenericRegion, MemoryAccess, MemoryMap, MemoryMapError, MemoryRange, MemoryRegion, NvmRegion,
    PageInfo, RamRegion, SectorDescription, SectorInfo,
};
