use super::flash_properties::FlashProperties;
use crate::serialize::{hex_option, hex_u_int, hex_vec, words_base64};

use serde::{Deserialize, Serialize};

/// The raw flash algorithm is the description of a flash algorithm,
/// and is usually read from a target description file.
///
/// Entry points (`pc_*`) are offsets relative to `load_address`, every other
/// address is absolute. Before it can be used for flashing, the algorithm has
/// to be assembled against the memory map of a chip, which resolves the entry
/// points and checks that code, stack and buffers fit into RAM.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description of the algorithm.
    #[serde(default)]
    pub description: String,
    /// Whether this flash algorithm is the default one or not.
    #[serde(default)]
    pub default: bool,
    /// Address in RAM the instructions are copied to.
    #[serde(serialize_with = "hex_u_int")]
    pub load_address: u64,
    /// The position-dependent code of the algorithm, as little-endian 32-bit words.
    #[serde(with = "words_base64")]
    pub instructions: Vec<u32>,
    /// Offset of the `Init()` entry point. Optional.
    #[serde(serialize_with = "hex_option", default)]
    pub pc_init: Option<u32>,
    /// Offset of the `UnInit()` entry point. Optional.
    #[serde(serialize_with = "hex_option", default)]
    pub pc_uninit: Option<u32>,
    /// Offset of the `ProgramPage()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_program_page: u32,
    /// Offset of the `EraseSector()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_erase_sector: u32,
    /// Offset of the `EraseAll()` entry point. Optional.
    #[serde(serialize_with = "hex_option", default)]
    pub pc_erase_all: Option<u32>,
    /// Address of the static data of the algorithm, passed in `r9`.
    #[serde(serialize_with = "hex_u_int")]
    pub static_base: u64,
    /// Initial stack pointer.
    #[serde(serialize_with = "hex_u_int")]
    pub begin_stack: u64,
    /// Size of the stack below `begin_stack`.
    #[serde(serialize_with = "hex_option", default)]
    pub stack_size: Option<u32>,
    /// Scratch data buffer, used as page buffer if no `page_buffers` are given.
    #[serde(serialize_with = "hex_u_int")]
    pub begin_data: u64,
    /// RAM buffers holding one page each. Two buffers allow double buffering.
    #[serde(serialize_with = "hex_vec", default)]
    pub page_buffers: Vec<u64>,
    /// Smallest amount of data `ProgramPage()` accepts. Defaults to the page size.
    #[serde(serialize_with = "hex_option", default)]
    pub min_program_length: Option<u32>,
    /// Whether the chip supports the CRC analyzer.
    #[serde(default)]
    pub analyzer_supported: bool,
    /// Load address of the analyzer.
    #[serde(serialize_with = "hex_u_int", default)]
    pub analyzer_address: u64,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}
