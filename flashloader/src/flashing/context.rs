use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State of the flash operation driver.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FlasherState {
    /// No operation is initialized.
    #[default]
    Idle,
    /// `Init()` succeeded, routines may be called.
    Ready,
    /// A routine is executing on the target.
    Busy,
}

/// The flash algorithm which currently resides in target RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAlgorithm {
    /// Name of the algorithm.
    pub name: String,
    /// Where the image was written to.
    pub load_address: u64,
    /// Size of the image in bytes.
    pub size: u64,
}

/// Result of the last routine which ran on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineStatus {
    /// Name of the routine.
    pub routine: &'static str,
    /// The value the routine returned, if it returned at all.
    pub result: Option<u32>,
}

impl RoutineStatus {
    /// Whether the routine returned zero.
    pub fn succeeded(&self) -> bool {
        self.result == Some(0)
    }
}

/// Runtime state of flashing on one connected target.
///
/// Created on connect and dropped on disconnect. The session owns it exclusively,
/// every flasher borrows it for the duration of its operations.
#[derive(Debug, Default)]
pub struct FlashContext {
    pub(crate) loaded_algorithm: Option<LoadedAlgorithm>,
    pub(crate) ram_cursor: Option<u64>,
    pub(crate) active_buffer: usize,
    pub(crate) state: FlasherState,
    pub(crate) last_status: Option<RoutineStatus>,
    pub(crate) return_breakpoint: Option<u64>,
}

impl FlashContext {
    /// The algorithm currently resident in target RAM.
    pub fn loaded_algorithm(&self) -> Option<&LoadedAlgorithm> {
        self.loaded_algorithm.as_ref()
    }

    /// First RAM address after the loaded image.
    pub fn ram_cursor(&self) -> Option<u64> {
        self.ram_cursor
    }

    /// Index of the page buffer the next page is staged into.
    pub fn active_buffer(&self) -> usize {
        self.active_buffer
    }

    /// The state of the driver.
    pub fn state(&self) -> FlasherState {
        self.state
    }

    /// Outcome of the last routine call.
    pub fn last_status(&self) -> Option<&RoutineStatus> {
        self.last_status.as_ref()
    }

    /// The hardware breakpoint placed to catch routine returns, if any.
    pub fn return_breakpoint(&self) -> Option<u64> {
        self.return_breakpoint
    }

    pub(crate) fn is_loaded(&self, name: &str, load_address: u64) -> bool {
        self.loaded_algorithm
            .as_ref()
            .is_some_and(|loaded| loaded.name == name && loaded.load_address == load_address)
    }

    /// Forget the loaded algorithm, so the next flasher writes it again.
    pub(crate) fn invalidate(&mut self) {
        if let Some(loaded) = self.loaded_algorithm.take() {
            tracing::debug!("Flash algorithm '{}' has to be reloaded", loaded.name);
        }
        self.ram_cursor = None;
        self.active_buffer = 0;
    }
}

/// Requests the abort of a running flash operation.
///
/// The handle can be cloned and moved to another thread. The driver checks it
/// while it waits for a routine to finish.
#[derive(Debug, Default, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Abort the current operation.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn abort_is_shared_between_clones() {
        let handle = AbortHandle::default();
        let remote = handle.clone();

        remote.abort();
        assert!(handle.is_aborted());

        handle.reset();
        assert!(!remote.is_aborted());
    }

    #[test]
    fn invalidate_forgets_the_algorithm() {
        let mut context = FlashContext {
            loaded_algorithm: Some(LoadedAlgorithm {
                name: "algo".to_string(),
                load_address: 0x2000_0000,
                size: 0x100,
            }),
            ram_cursor: Some(0x2000_0100),
            active_buffer: 1,
            ..Default::default()
        };
        assert!(context.is_loaded("algo", 0x2000_0000));
        assert!(!context.is_loaded("algo", 0x2000_1000));

        context.invalidate();
        assert!(!context.is_loaded("algo", 0x2000_0000));
        assert_eq!(context.ram_cursor(), None);
        assert_eq!(context.active_buffer(), 0);
    }
}
