use super::{DebugSequence, DefaultDebugSequence};
use flashloader_target::{
    Chip, ChipFamily, MemoryMap, MemoryRange, NvmRegion, RawFlashAlgorithm,
    TargetDescriptionSource,
};
use std::sync::Arc;

/// This describes a complete target with a fixed chip model and variant.
#[derive(Debug, Clone)]
pub struct Target {
    /// The name of the target.
    pub name: String,
    /// The memory map of the target.
    pub memory_map: MemoryMap,
    /// The flash algorithms available for this target.
    pub flash_algorithms: Vec<Arc<RawFlashAlgorithm>>,
    /// Name of the SVD file describing the peripherals of the target.
    pub svd: Option<String>,
    /// Chip specific steps of the debug session.
    pub debug_sequence: Arc<dyn DebugSequence>,
    /// Source of the target description. Used for diagnostics.
    pub source: TargetDescriptionSource,
}

impl Target {
    /// Create a new target for the given details.
    ///
    /// The debug sequence is looked up in the vendor registry.
    pub fn new(family: &ChipFamily, chip: &Chip) -> Target {
        let flash_algorithms = chip
            .flash_algorithms
            .iter()
            .filter_map(|name| family.get_algorithm(name))
            .cloned()
            .collect();

        let debug_sequence = crate::vendor::try_create_debug_sequence(chip)
            .unwrap_or_else(|| Arc::new(DefaultDebugSequence));

        Target {
            name: chip.name.clone(),
            memory_map: chip.memory_map.clone(),
            flash_algorithms,
            svd: chip.svd.clone(),
            debug_sequence,
            source: family.source.clone(),
        }
    }

    /// Returns the flash algorithm which programs `region`.
    ///
    /// An algorithm named by the region wins. Otherwise the default algorithm
    /// covering the region is used, or the first one covering it.
    pub fn algorithm_for_region(&self, region: &NvmRegion) -> Option<&RawFlashAlgorithm> {
        if let Some(name) = &region.algorithm {
            return self
                .flash_algorithms
                .iter()
                .find(|algorithm| &algorithm.name == name)
                .map(AsRef::as_ref);
        }

        let covering = || {
            self.flash_algorithms.iter().filter(|algorithm| {
                algorithm
                    .flash_properties
                    .address_range
                    .contains_range(&region.range)
            })
        };

        covering()
            .find(|algorithm| algorithm.default)
            .or_else(|| covering().next())
            .map(AsRef::as_ref)
    }
}
