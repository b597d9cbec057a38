//! Peripheral descriptions of a chip.
//!
//! Target descriptions only carry the name of the SVD file of a chip. Parsing
//! it is left to a [`PeripheralDescriptionSource`] supplied by the caller.

/// Loads peripheral descriptions by their file name.
pub trait PeripheralDescriptionSource {
    /// The parsed description.
    type Device;

    /// Loads the description called `name`, e.g. `HC32F448.svd`.
    fn load_by_name(&self, name: &str) -> anyhow::Result<Self::Device>;
}
