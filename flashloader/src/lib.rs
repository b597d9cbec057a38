//! # Flash programming through RAM-resident flash algorithms
//!
//! Microcontroller flash is programmed by small routines, flash algorithms, which
//! are loaded into the RAM of the target and called by the debugger. This crate
//! drives them: it picks the algorithm for a memory region, loads it, and runs
//! its `Init()`, `EraseSector()`, `ProgramPage()` and `UnInit()` routines on the
//! core through a [`CoreInterface`] supplied by the caller.
//!
//! # Examples
//!
//! ## Programming the flash of a chip
//! ```no_run
//! use flashloader::flashing::FlashOptions;
//! use flashloader::Session;
//! # use flashloader::CoreInterface;
//! # fn link() -> Box<dyn CoreInterface> { unimplemented!() }
//!
//! // Attach to a chip known to the target registry.
//! let mut session = Session::connect_by_name(link(), "HC32F448xC")?;
//!
//! // Erase the touched sectors and program two pages.
//! session.program(0x0, &[0x5a; 0x400], FlashOptions::default())?;
//!
//! // Hand the link back.
//! let _link = session.disconnect();
//! # Ok::<(), flashloader::Error>(())
//! ```
//!
//! ## Watching progress
//! ```no_run
//! use flashloader::flashing::{FlashOptions, FlashProgress, ProgressEvent};
//! use flashloader::Session;
//! # use flashloader::CoreInterface;
//! # fn link() -> Box<dyn CoreInterface> { unimplemented!() }
//!
//! let mut session = Session::connect_by_name(link(), "nRF9160_xxAA")?;
//!
//! let options = FlashOptions {
//!     verify: true,
//!     progress: Some(FlashProgress::new(|event| {
//!         if let ProgressEvent::PageProgrammed { address, .. } = event {
//!             println!("Programmed page at {address:#010x}");
//!         }
//!     })),
//!     ..Default::default()
//! };
//! session.program(0x1000, &[0x00; 0x1000], options)?;
//! # Ok::<(), flashloader::Error>(())
//! ```
#![warn(missing_docs)]

pub mod config;
pub mod flashing;
pub mod svd;
pub mod vendor;

mod core;
mod error;
mod memory;
mod session;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use crate::config::Target;
pub use crate::core::{CoreInterface, CoreRegister, HaltReason};
pub use crate::error::{Error, LinkError};
pub use crate::memory::MemoryInterface;
pub use crate::session::Session;
