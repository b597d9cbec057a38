//! Chip specific debug sequences.

use crate::core::CoreInterface;
use crate::error::LinkError;
use std::fmt::Debug;

/// Chip specific steps, run at fixed points of a debug session.
///
/// Should be implemented on a custom handle for chips that require special sequence code.
/// The writes done by a sequence are single register accesses which can be repeated
/// without changing the outcome.
pub trait DebugSequence: Send + Sync + Debug {
    /// Runs after the session halted the core on connect.
    ///
    /// Used to keep peripherals like watchdogs from running while the core is halted,
    /// or to route trace output.
    fn post_connect(&self, _core: &mut dyn CoreInterface) -> Result<(), LinkError> {
        Ok(())
    }
}

/// The sequence used for chips without special requirements.
#[derive(Debug)]
pub struct DefaultDebugSequence;

impl DebugSequence for DefaultDebugSequence {}
