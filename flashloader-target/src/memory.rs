use crate::serialize::{hex_range, hex_u_int};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Represents a region in non-volatile memory (e.g. flash, OTP or UICR).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmRegion {
    /// A name to describe the region
    #[serde(default)]
    pub name: Option<String>,
    /// Address range of the region
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Size of the smallest programmable unit.
    #[serde(serialize_with = "hex_u_int")]
    pub page_size: u32,
    /// Sector geometry of the region.
    ///
    /// Each entry starts a group of equally sized sectors at the given offset
    /// from the start of the region.
    pub sectors: Vec<SectorDescription>,
    /// Access permissions for the region.
    #[serde(default)]
    pub access: Option<MemoryAccess>,
    /// Whether this region is used when no region is named explicitly.
    #[serde(default = "default_true")]
    pub is_default: bool,
    /// Whether this region may be used by automated flash tests.
    #[serde(default = "default_true")]
    pub is_testable: bool,
    /// Whether this region may be erased at all.
    #[serde(default = "default_true")]
    pub is_erasable: bool,
    /// Name of the flash algorithm that programs this region.
    ///
    /// When absent, the default algorithm of the chip covering the region is used.
    #[serde(default)]
    pub algorithm: Option<String>,
}

impl NvmRegion {
    /// Returns the access permissions for the region.
    pub fn access(&self) -> MemoryAccess {
        self.access.unwrap_or_default()
    }

    /// Returns whether the region is boot memory.
    pub fn is_boot_memory(&self) -> bool {
        self.access().boot
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> u64 {
        self.range.end.saturating_sub(self.range.start)
    }

    /// Returns true if the region spans no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the size of the sector containing `offset`, relative to the start of the region.
    ///
    /// Offsets past the last entry of the sector table use the size of that last entry.
    pub fn sector_size_at(&self, offset: u64) -> u64 {
        sector_group(&self.sectors, offset)
            .map(|group| group.size)
            .unwrap_or(self.page_size as u64)
    }

    /// Returns the sector which contains `address`.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        sector_containing(&self.range, &self.sectors, address)
    }

    /// Returns the page which contains `address`.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        page_containing(&self.range, self.page_size, address)
    }

    /// Iterates over all sectors of the region, in increasing address order.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        iter_sectors(self.range.clone(), &self.sectors)
    }

    /// Checks that the sector table describes the whole region.
    pub fn validate_geometry(&self) -> Result<(), String> {
        validate_geometry(&self.range, self.page_size, &self.sectors)
    }
}

fn default_true() -> bool {
    true
}

/// Represents access permissions of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryAccess {
    /// True if the region is readable.
    #[serde(default = "default_true")]
    pub read: bool,
    /// True if the region is writable.
    #[serde(default = "default_true")]
    pub write: bool,
    /// True if the region is executable.
    #[serde(default = "default_true")]
    pub execute: bool,
    /// True if the chip boots from this memory
    #[serde(default)]
    pub boot: bool,
}

impl Default for MemoryAccess {
    fn default() -> Self {
        MemoryAccess {
            read: true,
            write: true,
            execute: true,
            boot: false,
        }
    }
}

/// Represents a region in RAM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RamRegion {
    /// A name to describe the region
    #[serde(default)]
    pub name: Option<String>,
    /// Address range of the region
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Access permissions for the region.
    #[serde(default)]
    pub access: Option<MemoryAccess>,
}

/// Represents a device region, e.g. memory mapped peripherals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenericRegion {
    /// A name to describe the region
    #[serde(default)]
    pub name: Option<String>,
    /// Address range of the region
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Access permissions for the region.
    #[serde(default)]
    pub access: Option<MemoryAccess>,
}

/// Holds information about a specific, individual flash
/// sector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SectorInfo {
    /// Base address of the flash sector
    pub base_address: u64,
    /// Size of the flash sector
    pub size: u64,
}

impl SectorInfo {
    /// Returns the address range of the sector.
    pub fn address_range(&self) -> Range<u64> {
        self.base_address..self.base_address + self.size
    }
}

/// Information about a group of flash sectors.
///
/// Starting at the offset `address` from the start of the flash, all following
/// sectors have a size of `size`. This holds until either the end of the flash,
/// or until another `SectorDescription` changes the sector size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorDescription {
    /// Size of each individual flash sector
    #[serde(serialize_with = "hex_u_int")]
    pub size: u64,
    /// Start offset of the group of flash sectors, relative
    /// to the start address of the flash.
    #[serde(serialize_with = "hex_u_int")]
    pub address: u64,
}

/// Holds information about a page in flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Base address of the page in flash.
    pub base_address: u64,
    /// Size of the page
    pub size: u32,
}

impl PageInfo {
    /// Returns the address range of the page.
    pub fn address_range(&self) -> Range<u64> {
        self.base_address..self.base_address + self.size as u64
    }
}

fn sector_group(sectors: &[SectorDescription], offset: u64) -> Option<&SectorDescription> {
    sectors.iter().rfind(|group| group.address <= offset)
}

pub(crate) fn sector_containing(
    range: &Range<u64>,
    sectors: &[SectorDescription],
    address: u64,
) -> Option<SectorInfo> {
    if !range.contains(&address) {
        return None;
    }

    let offset = address - range.start;
    let group = sector_group(sectors, offset)?;
    if group.size == 0 {
        return None;
    }

    let index = (offset - group.address) / group.size;
    Some(SectorInfo {
        base_address: range.start + group.address + index * group.size,
        size: group.size,
    })
}

pub(crate) fn page_containing(range: &Range<u64>, page_size: u32, address: u64) -> Option<PageInfo> {
    if !range.contains(&address) || page_size == 0 {
        return None;
    }

    let offset = address - range.start;
    Some(PageInfo {
        base_address: range.start + offset - offset % page_size as u64,
        size: page_size,
    })
}

pub(crate) fn iter_sectors(
    range: Range<u64>,
    sectors: &[SectorDescription],
) -> impl Iterator<Item = SectorInfo> + '_ {
    let mut address = range.start;
    std::iter::from_fn(move || {
        if address >= range.end {
            return None;
        }
        let sector = sector_containing(&range, sectors, address)?;
        address = sector.base_address + sector.size;
        Some(sector)
    })
}

pub(crate) fn validate_geometry(
    range: &Range<u64>,
    page_size: u32,
    sectors: &[SectorDescription],
) -> Result<(), String> {
    let length = range.end.saturating_sub(range.start);

    if page_size == 0 {
        return Err("page size must not be zero".to_string());
    }
    let Some(first) = sectors.first() else {
        return Err("sector table is empty".to_string());
    };
    if first.address != 0 {
        return Err(format!(
            "sector table starts at offset {:#x} instead of 0",
            first.address
        ));
    }

    for (index, group) in sectors.iter().enumerate() {
        if group.size == 0 {
            return Err(format!("sector group at offset {:#x} has size 0", group.address));
        }
        if group.size % page_size as u64 != 0 {
            return Err(format!(
                "sector size {:#x} is not a multiple of the page size {:#x}",
                group.size, page_size
            ));
        }
        if group.address >= length {
            return Err(format!(
                "sector group at offset {:#x} lies outside of the region",
                group.address
            ));
        }

        let group_end = sectors.get(index + 1).map_or(length, |next| next.address);
        if group_end <= group.address {
            return Err(format!(
                "sector group offsets are not increasing at offset {:#x}",
                group.address
            ));
        }
        if (group_end - group.address) % group.size != 0 {
            return Err(format!(
                "sectors of size {:#x} starting at offset {:#x} do not tile up to offset {:#x}",
                group.size, group.address, group_end
            ));
        }
    }

    Ok(())
}

/// Enables the user to do range intersection testing.
pub trait MemoryRange {
    /// Returns true if `self` contains `range` fully.
    fn contains_range(&self, range: &Range<u64>) -> bool;

    /// Returns true if `self` and `range` share at least one address.
    fn intersects_range(&self, range: &Range<u64>) -> bool;
}

impl MemoryRange for Range<u64> {
    fn contains_range(&self, range: &Range<u64>) -> bool {
        if range.is_empty() {
            false
        } else {
            self.start <= range.start && range.end <= self.end
        }
    }

    fn intersects_range(&self, range: &Range<u64>) -> bool {
        !self.is_empty() && !range.is_empty() && self.start < range.end && range.start < self.end
    }
}

/// Declares the type of a memory region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryRegion {
    /// Memory region describing RAM.
    Ram(RamRegion),
    /// Device region, which is neither flash nor RAM.
    Generic(GenericRegion),
    /// Memory region describing flash, OTP or other non-volatile memory.
    #[serde(alias = "Flash")]
    Nvm(NvmRegion),
}

impl MemoryRegion {
    /// Returns the RAM region if this is a RAM region, otherwise None.
    pub fn as_ram_region(&self) -> Option<&RamRegion> {
        match self {
            MemoryRegion::Ram(region) => Some(region),
            _ => None,
        }
    }

    /// Returns the NVM region if this is a NVM region, otherwise None.
    pub fn as_nvm_region(&self) -> Option<&NvmRegion> {
        match self {
            MemoryRegion::Nvm(region) => Some(region),
            _ => None,
        }
    }

    /// Returns the address range of the memory region.
    pub fn address_range(&self) -> Range<u64> {
        match self {
            MemoryRegion::Ram(rr) => rr.range.clone(),
            MemoryRegion::Generic(gr) => gr.range.clone(),
            MemoryRegion::Nvm(nr) => nr.range.clone(),
        }
    }

    /// Returns the name of the region, if it has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            MemoryRegion::Ram(region) => region.name.as_deref(),
            MemoryRegion::Generic(region) => region.name.as_deref(),
            MemoryRegion::Nvm(region) => region.name.as_deref(),
        }
    }

    /// Returns whether the memory region contains the given address.
    pub fn contains(&self, address: u64) -> bool {
        self.address_range().contains(&address)
    }

    /// Returns `true` if the memory region is [`Ram`].
    ///
    /// [`Ram`]: MemoryRegion::Ram
    #[must_use]
    pub fn is_ram(&self) -> bool {
        matches!(self, Self::Ram(..))
    }

    /// Returns `true` if the memory region is [`Nvm`].
    ///
    /// [`Nvm`]: MemoryRegion::Nvm
    #[must_use]
    pub fn is_nvm(&self) -> bool {
        matches!(self, Self::Nvm(..))
    }
}

/// Errors raised while building or querying a [`MemoryMap`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum MemoryMapError {
    /// No memory region contains the address {address:#010x}.
    AddressNotMapped {
        /// The address that was looked up.
        address: u64,
    },
    /// The memory region {first:#010x?} overlaps with the region {second:#010x?}.
    RegionOverlap {
        /// Range of the first region.
        first: Range<u64>,
        /// Range of the region overlapping the first one.
        second: Range<u64>,
    },
    /// The memory region {range:#010x?} does not span any bytes.
    EmptyRegion {
        /// Range of the offending region.
        range: Range<u64>,
    },
    /// The sector table of the region {range:#010x?} is invalid: {reason}
    InvalidSectorTable {
        /// Range of the offending region.
        range: Range<u64>,
        /// What is wrong with the table.
        reason: String,
    },
}

/// The validated, ordered set of memory regions of a chip.
///
/// Regions never overlap, and every NVM region carries a sector table which
/// covers its whole length. A `MemoryMap` can only be obtained through
/// [`MemoryMap::new`] (or deserialization, which calls it), so these properties
/// hold for every instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MemoryRegion>", into = "Vec<MemoryRegion>")]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Validates `regions` and builds a memory map from them.
    ///
    /// The order of the regions is kept.
    pub fn new(regions: Vec<MemoryRegion>) -> Result<Self, MemoryMapError> {
        for region in &regions {
            let range = region.address_range();
            if range.is_empty() {
                return Err(MemoryMapError::EmptyRegion { range });
            }

            if let MemoryRegion::Nvm(nvm) = region {
                nvm.validate_geometry()
                    .map_err(|reason| MemoryMapError::InvalidSectorTable { range, reason })?;
            }
        }

        let mut by_start = regions.iter().map(MemoryRegion::address_range).collect::<Vec<_>>();
        by_start.sort_by_key(|range| range.start);
        for pair in by_start.windows(2) {
            if pair[0].intersects_range(&pair[1]) {
                return Err(MemoryMapError::RegionOverlap {
                    first: pair[0].clone(),
                    second: pair[1].clone(),
                });
            }
        }

        Ok(Self { regions })
    }

    /// Returns the region which contains `address`.
    pub fn resolve(&self, address: u64) -> Result<&MemoryRegion, MemoryMapError> {
        self.regions
            .iter()
            .find(|region| region.contains(address))
            .ok_or(MemoryMapError::AddressNotMapped { address })
    }

    /// All regions, in declaration order.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Iterates over all regions, in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, MemoryRegion> {
        self.regions.iter()
    }

    /// Iterates over the NVM regions.
    pub fn nvm_regions(&self) -> impl Iterator<Item = &NvmRegion> {
        self.regions.iter().filter_map(MemoryRegion::as_nvm_region)
    }

    /// Iterates over the RAM regions.
    pub fn ram_regions(&self) -> impl Iterator<Item = &RamRegion> {
        self.regions.iter().filter_map(MemoryRegion::as_ram_region)
    }

    /// Returns the RAM region which fully contains `range`.
    pub fn ram_region_containing(&self, range: &Range<u64>) -> Option<&RamRegion> {
        self.ram_regions()
            .find(|region| region.range.contains_range(range))
    }

    /// Returns the NVM region used when no address is given.
    ///
    /// Boot memory is preferred among the default regions.
    pub fn default_nvm(&self) -> Option<&NvmRegion> {
        self.nvm_regions()
            .find(|region| region.is_default && region.is_boot_memory())
            .or_else(|| self.nvm_regions().find(|region| region.is_default))
    }
}

impl TryFrom<Vec<MemoryRegion>> for MemoryMap {
    type Error = MemoryMapError;

    fn try_from(regions: Vec<MemoryRegion>) -> Result<Self, Self::Error> {
        MemoryMap::new(regions)
    }
}

impl From<MemoryMap> for Vec<MemoryRegion> {
    fn from(map: MemoryMap) -> Self {
        map.regions
    }
}

impl<'a> IntoIterator for &'a MemoryMap {
    type Item = &'a MemoryRegion;
    type IntoIter = std::slice::Iter<'a, MemoryRegion>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}
