use crate::error::LinkError;
use crate::memory::MemoryInterface;
use std::time::Duration;

/// Core registers used to call into a flash algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CoreRegister {
    /// First argument, and the result of a routine.
    R0,
    /// Second argument.
    R1,
    /// Third argument.
    R2,
    /// Fourth argument.
    R3,
    /// Static base register.
    R9,
    /// Stack pointer.
    Sp,
    /// Link register, holding the return address.
    Lr,
    /// Program counter.
    Pc,
}

impl CoreRegister {
    /// Returns the register holding argument `index` of a routine call.
    pub fn argument(index: usize) -> Option<Self> {
        match index {
            0 => Some(CoreRegister::R0),
            1 => Some(CoreRegister::R1),
            2 => Some(CoreRegister::R2),
            3 => Some(CoreRegister::R3),
            _ => None,
        }
    }

    /// The register holding the result of a routine.
    pub fn result() -> Self {
        CoreRegister::R0
    }
}

/// The reason why a core halted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// A breakpoint was hit.
    Breakpoint,
    /// The host requested the halt.
    Request,
    /// The core took an exception, e.g. a hard fault.
    Exception,
    /// The core halted for a reason the link cannot tell.
    Unknown,
}

/// Run control and register access of the core which executes flash algorithms.
///
/// This is everything flashing needs from a debug probe. Implementations exist for
/// real probes outside of this crate, and for the simulated target used in tests.
pub trait CoreInterface: MemoryInterface {
    /// Read a core register. The core has to be halted.
    fn read_core_reg(&mut self, register: CoreRegister) -> Result<u32, LinkError>;

    /// Write a core register. The core has to be halted.
    fn write_core_reg(&mut self, register: CoreRegister, value: u32) -> Result<(), LinkError>;

    /// Set a hardware breakpoint at `address`.
    fn set_hw_breakpoint(&mut self, address: u64) -> Result<(), LinkError>;

    /// Remove the hardware breakpoint at `address`.
    fn clear_hw_breakpoint(&mut self, address: u64) -> Result<(), LinkError>;

    /// Resume the core.
    fn run(&mut self) -> Result<(), LinkError>;

    /// Halt the core and wait for it to report the halt.
    fn halt(&mut self, timeout: Duration) -> Result<(), LinkError>;

    /// Block until the core halts, or `timeout` elapses.
    ///
    /// Returns [`LinkError::Timeout`] if the core is still running afterwards.
    fn wait_for_halt(&mut self, timeout: Duration) -> Result<HaltReason, LinkError>;

    /// Reset the link to the debug port, keeping the target state.
    fn reset_link(&mut self) -> Result<(), LinkError>;
}
