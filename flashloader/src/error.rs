use crate::config::RegistryError;
use crate::flashing::FlashError;

/// Errors reported by the target link.
///
/// The link is the transport to the debug probe and the debug port behind it.
/// Its errors are propagated unchanged, [`LinkError::is_recoverable`] decides
/// whether an operation may be retried after a link reset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, docsplay::Display)]
pub enum LinkError {
    /// The operation did not complete in time.
    Timeout,
    /// A transient transfer error occurred: {0}
    Transient(String),
    /// The target is not connected.
    NotConnected,
    /// The access to address {address:#010x} faulted.
    AccessFault {
        /// The address which was accessed.
        address: u64,
    },
    /// The core has to be halted for this operation.
    CoreNotHalted,
    /// {0}
    Other(String),
}

impl LinkError {
    /// Whether a link reset may clear this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LinkError::Timeout | LinkError::Transient(_))
    }
}

/// The overarching error type which contains all possible errors as variants.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum Error {
    /// An error with the target link occurred.
    Link(#[from] LinkError),
    /// A flash operation failed.
    Flash(#[from] FlashError),
    /// Unable to load the specification for the chip.
    ChipNotFound(#[from] RegistryError),
    /// {0}
    Other(#[from] anyhow::Error),
}
