//! Target descriptions and the registry of known chips.
//!
//! Chips are described by YAML files, which contain a family of chip variants
//! with their memory maps and the flash algorithms used to program them.
//! The descriptions in `targets/` are compiled into the library, more can be
//! added at runtime with [`add_target_family_from_yaml`].

mod registry;
mod sequences;
mod target;

pub use flashloader_target::{
    Chip, ChipFamily, FlashProperties, GenericRegion, MemoryAccess, MemoryMap, MemoryMapError,
    MemoryRange, MemoryRegion, NvmRegion, PageInfo, RamRegion, RawFlashAlgorithm,
    SectorDescription, SectorInfo, TargetDescriptionSource,
};

pub use registry::{
    add_target_family_from_reader, add_target_family_from_yaml, families, get_target_by_name,
    search_chips, Registry, RegistryError,
};
pub use sequences::{DebugSequence, DefaultDebugSequence};
pub use target::Target;
