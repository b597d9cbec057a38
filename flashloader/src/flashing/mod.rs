//! Flash programming operations.
//!
//! This module drives flash algorithms on the target: small routines which are
//! loaded into target RAM and implement erasing and programming of the flash.
//!
//! [`FlashAlgorithm::assemble_from_raw`] turns the table from a target description
//! into absolute addresses and checks it against the memory map. A [`Flasher`]
//! loads it, and every operation runs between `Init()` and `UnInit()` of the
//! algorithm through an [`ActiveFlasher`].
//!
//! ## Example
//!
//! ```no_run
//! use flashloader::flashing::FlashOptions;
//! use flashloader::Session;
//! # use flashloader::CoreInterface;
//! # fn link() -> Box<dyn CoreInterface> { unimplemented!() }
//!
//! let mut session = Session::connect_by_name(link(), "HC32F448xC")?;
//!
//! session.program(0x0, &[0x1, 0x2, 0x3, 0x4], FlashOptions::default())?;
//!
//! # Ok::<(), flashloader::Error>(())
//! ```

mod context;
mod error;
mod flash_algorithm;
mod flasher;
mod options;
mod programmer;
mod progress;

pub use context::*;
pub use error::*;
pub use flash_algorithm::*;
pub use flasher::*;
pub use options::*;
pub use programmer::*;
pub use progress::*;
