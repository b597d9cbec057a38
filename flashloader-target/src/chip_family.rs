use super::chip::Chip;
use super::flash_algorithm::RawFlashAlgorithm;
use crate::memory::MemoryRange;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Source of a target description.
///
/// This is used for diagnostics, when
/// an error related to a target description occurs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetDescriptionSource {
    /// The target description was compiled into the library.
    BuiltIn,
    /// The target description was added at runtime.
    External,
}

/// This describes a chip family with all its variants.
///
/// This struct is usually read from a target description
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChipFamily {
    /// This is the name of the chip family in base form.
    /// E.g. `HC32F448 Series`.
    pub name: String,
    /// Name of the manufacturer.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// This vector holds all the variants of the family.
    pub variants: Vec<Chip>,
    /// This vector holds all available algorithms.
    ///
    /// Algorithms are immutable once loaded, every target created from this
    /// family shares them.
    #[serde(default)]
    pub flash_algorithms: Vec<Arc<RawFlashAlgorithm>>,
    #[serde(skip, default = "default_source")]
    /// Source of the target description, used for diagnostics
    pub source: TargetDescriptionSource,
}

fn default_source() -> TargetDescriptionSource {
    TargetDescriptionSource::External
}

impl ChipFamily {
    /// Validates the [`ChipFamily`] so that flashing code can rely on the references
    /// between variants, regions and algorithms.
    ///
    /// Memory maps validate themselves when they are built.
    pub fn validate(&self) -> Result<(), String> {
        self.reject_duplicate_target_names()?;
        self.ensure_algorithms_exist()?;
        self.validate_algorithm_geometry()?;
        self.ensure_regions_have_algorithms()?;

        Ok(())
    }

    fn reject_duplicate_target_names(&self) -> Result<(), String> {
        let mut seen = HashSet::new();

        for chip in &self.variants {
            if !seen.insert(&chip.name) {
                return Err(format!(
                    "Target {} appears multiple times in {}",
                    chip.name, self.name,
                ));
            }
        }

        Ok(())
    }

    /// Make sure the algorithms used on the variant actually exist on the family (this is basically a check for typos).
    fn ensure_algorithms_exist(&self) -> Result<(), String> {
        for variant in &self.variants {
            for algorithm_name in variant.flash_algorithms.iter() {
                if self.get_algorithm(algorithm_name).is_none() {
                    return Err(format!(
                        "unknown flash algorithm `{}` for variant `{}`",
                        algorithm_name, variant.name
                    ));
                }
            }

            for region in variant.memory_map.nvm_regions() {
                let Some(algorithm_name) = &region.algorithm else {
                    continue;
                };
                if !variant.flash_algorithms.contains(algorithm_name) {
                    return Err(format!(
                        "region {:#010x?} of variant `{}` uses flash algorithm `{}`, which the variant does not list",
                        region.range, variant.name, algorithm_name
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_algorithm_geometry(&self) -> Result<(), String> {
        for algorithm in &self.flash_algorithms {
            algorithm
                .flash_properties
                .validate()
                .map_err(|reason| format!("flash algorithm `{}`: {reason}", algorithm.name))?;
        }

        Ok(())
    }

    /// Every region without an explicit algorithm needs a default algorithm covering it.
    fn ensure_regions_have_algorithms(&self) -> Result<(), String> {
        for variant in &self.variants {
            for region in variant.memory_map.nvm_regions() {
                if region.algorithm.is_some() {
                    continue;
                }

                let covered = variant
                    .flash_algorithms
                    .iter()
                    .filter_map(|name| self.get_algorithm(name))
                    .any(|algorithm| {
                        algorithm
                            .flash_properties
                            .address_range
                            .contains_range(&region.range)
                    });

                if !covered {
                    return Err(format!(
                        "no flash algorithm of variant `{}` covers the region {:#010x?}",
                        variant.name, region.range
                    ));
                }
            }
        }

        Ok(())
    }
}

impl ChipFamily {
    /// Get the different [Chip]s which are part of this
    /// family.
    pub fn variants(&self) -> &[Chip] {
        &self.variants
    }

    /// Get all flash algorithms for this family of chips.
    pub fn algorithms(&self) -> &[Arc<RawFlashAlgorithm>] {
        &self.flash_algorithms
    }

    /// Try to find a [RawFlashAlgorithm] with a given name.
    pub fn get_algorithm(&self, name: impl AsRef<str>) -> Option<&Arc<RawFlashAlgorithm>> {
        let name = name.as_ref();
        self.flash_algorithms.iter().find(|elem| elem.name == name)
    }
}
