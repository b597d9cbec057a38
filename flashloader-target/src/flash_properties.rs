use crate::memory::{self, PageInfo, SectorDescription, SectorInfo};
use crate::serialize::{hex_range, hex_u_int};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Properties of the flash memory a flash algorithm programs.
///
/// These values are read from the YAML target description files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct FlashProperties {
    /// The range of the device flash.
    #[serde(serialize_with = "hex_range")]
    pub address_range: Range<u64>,
    /// The page size of the device flash.
    #[serde(serialize_with = "hex_u_int")]
    pub page_size: u32,
    /// The value of a byte in flash that was just erased.
    #[serde(serialize_with = "hex_u_int")]
    pub erased_byte_value: u8,
    /// The approximative time it takes to program a page, in milliseconds.
    pub program_page_timeout: u32,
    /// The approximative time it takes to erase a sector, in milliseconds.
    pub erase_sector_timeout: u32,
    /// The available sectors of the device flash.
    #[serde(default)]
    pub sectors: Vec<SectorDescription>,
}

impl Default for FlashProperties {
    #[allow(clippy::reversed_empty_ranges)]
    fn default() -> Self {
        FlashProperties {
            address_range: 0..0,
            page_size: 0,
            erased_byte_value: 0xff,
            program_page_timeout: 0,
            erase_sector_timeout: 0,
            sectors: vec![],
        }
    }
}

impl FlashProperties {
    /// Returns the sector which contains `address`.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        memory::sector_containing(&self.address_range, &self.sectors, address)
    }

    /// Returns the page which contains `address`.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        memory::page_containing(&self.address_range, self.page_size, address)
    }

    /// Iterates over all sectors of the flash, in increasing address order.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        memory::iter_sectors(self.address_range.clone(), &self.sectors)
    }

    /// Iterates over all pages of the flash, in increasing address order.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageInfo> + '_ {
        let mut address = self.address_range.start;
        std::iter::from_fn(move || {
            let page = self.page_info(address)?;
            address = page.address_range().end;
            Some(page)
        })
    }

    /// Checks that page and sector geometry describe the whole flash.
    pub fn validate(&self) -> Result<(), String> {
        memory::validate_geometry(&self.address_range, self.page_size, &self.sectors)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn properties() -> FlashProperties {
        FlashProperties {
            address_range: 0x0300_0c00..0x0300_1000,
            page_size: 0x100,
            erased_byte_value: 0xff,
            program_page_timeout: 1000,
            erase_sector_timeout: 2000,
            sectors: vec![SectorDescription { size: 0x400, address: 0x0 }],
        }
    }

    #[test]
    fn iterates_pages_inside_flash() {
        let properties = properties();
        let pages = properties.iter_pages().collect::<Vec<_>>();

        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0].base_address, 0x0300_0c00);
        assert_eq!(pages[3].address_range().end, 0x0300_1000);
    }

    #[test]
    fn single_sector_flash() {
        let properties = properties();
        properties.validate().unwrap();

        assert_eq!(properties.iter_sectors().count(), 1);
        assert_eq!(
            properties.sector_info(0x0300_0fff),
            Some(SectorInfo { base_address: 0x0300_0c00, size: 0x400 })
        );
    }
}
