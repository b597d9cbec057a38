use crate::memory::MemoryMap;
use serde::{Deserialize, Serialize};

/// A single chip variant.
///
/// This describes an exact chip variant, including its flash and memory size. For example,
/// the `HC32F448` family has two variants, `HC32F448xA` and `HC32F448xC`, which differ in
/// the size of their flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chip {
    /// This is the name of the chip in base form.
    /// E.g. `HC32F448xC`.
    pub name: String,
    /// Name of the SVD file describing the peripherals of the chip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svd: Option<String>,
    /// The memory regions available on the chip.
    pub memory_map: MemoryMap,
    /// Names of all flash algorithms available for this chip.
    ///
    /// This can be used to look up the flash algorithm in the
    /// [`ChipFamily::flash_algorithms`] field.
    ///
    /// [`ChipFamily::flash_algorithms`]: crate::ChipFamily::flash_algorithms
    #[serde(default)]
    pub flash_algorithms: Vec<String>,
}
