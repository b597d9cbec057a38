//! Helpers for testing the crate
//!
//! [`FakeTarget`] simulates a core which runs flash algorithms. It does not execute
//! instructions: a routine is recognized by the program counter it is started at,
//! and its effect on the flash is applied directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{
    DefaultDebugSequence, FlashProperties, MemoryMap, MemoryRegion, NvmRegion, RamRegion,
    RawFlashAlgorithm, SectorDescription, Target, TargetDescriptionSource,
};
use crate::flashing::AbortHandle;
use crate::{CoreInterface, CoreRegister, HaltReason, LinkError, MemoryInterface};

/// Memory map with 256 KiB of flash at 0 and 32 KiB of RAM at `0x2000_0000`.
pub fn example_memory_map() -> MemoryMap {
    let regions = vec![
        MemoryRegion::Nvm(NvmRegion {
            name: Some("FLASH".to_string()),
            range: 0..0x4_0000,
            page_size: 0x200,
            sectors: vec![SectorDescription {
                size: 0x2000,
                address: 0,
            }],
            access: None,
            is_default: true,
            is_testable: true,
            is_erasable: true,
            algorithm: Some("test_flash".to_string()),
        }),
        MemoryRegion::Ram(RamRegion {
            name: Some("SRAM".to_string()),
            range: 0x2000_0000..0x2000_8000,
            access: None,
        }),
    ];

    MemoryMap::new(regions).expect("example memory map is valid")
}

/// A flash algorithm for [`example_memory_map`].
///
/// The image is 512 bytes and starts with the return breakpoint header.
pub fn example_algorithm() -> RawFlashAlgorithm {
    let mut instructions = vec![0xbf00_bf00; 128];
    instructions[0] = 0xE00A_BE00;

    RawFlashAlgorithm {
        name: "test_flash".to_string(),
        description: "Flash algorithm of the simulated target".to_string(),
        default: true,
        load_address: 0x2000_0000,
        instructions,
        pc_init: Some(0x41),
        pc_uninit: Some(0x51),
        pc_program_page: 0x61,
        pc_erase_sector: 0x71,
        pc_erase_all: Some(0x81),
        static_base: 0x2000_00f0,
        begin_stack: 0x2000_0800,
        stack_size: None,
        begin_data: 0x2000_1000,
        page_buffers: vec![0x2000_1000, 0x2000_1200],
        min_program_length: None,
        analyzer_supported: false,
        analyzer_address: 0,
        flash_properties: FlashProperties {
            address_range: 0..0x4_0000,
            page_size: 0x200,
            erased_byte_value: 0xff,
            program_page_timeout: 100,
            erase_sector_timeout: 200,
            sectors: vec![SectorDescription {
                size: 0x2000,
                address: 0,
            }],
        },
    }
}

/// A target built from [`example_memory_map`] and [`example_algorithm`].
pub fn example_target() -> Target {
    Target {
        name: "Example".to_string(),
        memory_map: example_memory_map(),
        flash_algorithms: vec![Arc::new(example_algorithm())],
        svd: None,
        debug_sequence: Arc::new(DefaultDebugSequence),
        source: TargetDescriptionSource::External,
    }
}

/// The routines of a flash algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Routine {
    /// `Init()`
    Init,
    /// `UnInit()`
    UnInit,
    /// `EraseSector()`
    EraseSector,
    /// `EraseAll()`
    EraseAll,
    /// `ProgramPage()`
    ProgramPage,
}

/// A routine call seen by the [`FakeTarget`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RoutineCall {
    /// The routine which was started.
    pub routine: Routine,
    /// First argument.
    pub r0: u32,
    /// Second argument.
    pub r1: u32,
    /// Third argument.
    pub r2: u32,
}

#[derive(Debug, Copy, Clone)]
struct Fault {
    successes: usize,
    code: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Core {
    Halted(HaltReason),
    /// The routine ran into its return breakpoint, the host has not seen the halt yet.
    Returned,
    Hanging,
}

#[derive(Debug)]
struct Memory {
    base: u64,
    data: Vec<u8>,
    flash: bool,
}

impl Memory {
    fn range(&self) -> std::ops::Range<u64> {
        self.base..self.base + self.data.len() as u64
    }
}

#[derive(Debug)]
struct State {
    memories: Vec<Memory>,
    algorithms: Vec<RawFlashAlgorithm>,
    registers: HashMap<CoreRegister, u32>,
    core: Core,
    faults: HashMap<Routine, Fault>,
    hangs: HashMap<Routine, usize>,
    abort_on: Option<(Routine, AbortHandle)>,
    fail_link_reset: bool,
    calls: Vec<RoutineCall>,
    link_resets: usize,
    ram_writes: usize,
    breakpoints: Vec<u64>,
    peripheral_writes: Vec<(u64, u32)>,
}

/// A simulated target which runs flash algorithms.
///
/// Clones share the target, so a test can keep one to inspect the target while
/// another one is borrowed by a flasher.
#[derive(Debug, Clone)]
pub struct FakeTarget {
    state: Arc<Mutex<State>>,
}

impl FakeTarget {
    /// Creates a target with the memories of `memory_map`, which runs `algorithms`.
    ///
    /// The flash starts out erased, RAM is zeroed.
    pub fn new(
        memory_map: &MemoryMap,
        algorithms: impl IntoIterator<Item = RawFlashAlgorithm>,
    ) -> Self {
        let memories = memory_map
            .regions()
            .iter()
            .filter_map(|region| match region {
                MemoryRegion::Nvm(nvm) => Some(Memory {
                    base: nvm.range.start,
                    data: vec![0xff; nvm.len() as usize],
                    flash: true,
                }),
                MemoryRegion::Ram(ram) => Some(Memory {
                    base: ram.range.start,
                    data: vec![0; (ram.range.end - ram.range.start) as usize],
                    flash: false,
                }),
                MemoryRegion::Generic(_) => None,
            })
            .collect();

        let state = State {
            memories,
            algorithms: algorithms.into_iter().collect(),
            registers: HashMap::new(),
            core: Core::Halted(HaltReason::Request),
            faults: HashMap::new(),
            hangs: HashMap::new(),
            abort_on: None,
            fail_link_reset: false,
            calls: Vec::new(),
            link_resets: 0,
            ram_writes: 0,
            breakpoints: Vec::new(),
            peripheral_writes: Vec::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Every call of `routine` returns `code`.
    pub fn fail_routine(&self, routine: Routine, code: u32) {
        self.fail_routine_after(routine, 0, code);
    }

    /// Calls of `routine` return `code` once `successes` calls succeeded.
    pub fn fail_routine_after(&self, routine: Routine, successes: usize, code: u32) {
        self.state
            .lock()
            .faults
            .insert(routine, Fault { successes, code });
    }

    /// The next `count` calls of `routine` never return.
    pub fn hang_routine(&self, routine: Routine, count: usize) {
        self.state.lock().hangs.insert(routine, count);
    }

    /// Starting `routine` aborts `handle`, and the routine never returns.
    pub fn abort_on(&self, routine: Routine, handle: AbortHandle) {
        self.state.lock().abort_on = Some((routine, handle));
    }

    /// Link resets fail.
    pub fn fail_link_reset(&self) {
        self.state.lock().fail_link_reset = true;
    }

    /// All routine calls, in order.
    pub fn calls(&self) -> Vec<RoutineCall> {
        self.state.lock().calls.clone()
    }

    /// The routines called, in order.
    pub fn routines(&self) -> Vec<Routine> {
        self.calls().iter().map(|call| call.routine).collect()
    }

    /// The number of link resets.
    pub fn link_resets(&self) -> usize {
        self.state.lock().link_resets
    }

    /// The number of writes to RAM.
    pub fn ram_writes(&self) -> usize {
        self.state.lock().ram_writes
    }

    /// Addresses of the hardware breakpoints which are set.
    pub fn breakpoints(&self) -> Vec<u64> {
        self.state.lock().breakpoints.clone()
    }

    /// Word writes outside of flash and RAM, in order.
    pub fn peripheral_writes(&self) -> Vec<(u64, u32)> {
        self.state.lock().peripheral_writes.clone()
    }

    /// Reads the flash contents at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not flash.
    pub fn read_flash(&self, address: u64, data: &mut [u8]) {
        let state = self.state.lock();
        let memory = state
            .memory(address, data.len())
            .filter(|memory| memory.flash)
            .unwrap_or_else(|| panic!("no flash at {address:#010x}"));
        let offset = (address - memory.base) as usize;
        data.copy_from_slice(&memory.data[offset..offset + data.len()]);
    }
}

impl State {
    fn memory(&self, address: u64, len: usize) -> Option<&Memory> {
        let end = address + len as u64;
        self.memories
            .iter()
            .find(|memory| memory.range().contains(&address) && end <= memory.range().end)
    }

    fn memory_mut(&mut self, address: u64, len: usize) -> Option<&mut Memory> {
        let end = address + len as u64;
        self.memories
            .iter_mut()
            .find(|memory| memory.range().contains(&address) && end <= memory.range().end)
    }

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), LinkError> {
        let memory = self
            .memory(address, data.len())
            .ok_or(LinkError::AccessFault { address })?;
        let offset = (address - memory.base) as usize;
        data.copy_from_slice(&memory.data[offset..offset + data.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), LinkError> {
        let memory = self
            .memory_mut(address, data.len())
            .ok_or(LinkError::AccessFault { address })?;
        // Flash can only be changed by the flash controller.
        if memory.flash {
            return Err(LinkError::AccessFault { address });
        }
        let offset = (address - memory.base) as usize;
        memory.data[offset..offset + data.len()].copy_from_slice(data);
        self.ram_writes += 1;
        Ok(())
    }

    fn register(&self, register: CoreRegister) -> u32 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    fn identify(&self, pc: u64) -> Option<(Routine, RawFlashAlgorithm)> {
        self.algorithms.iter().find_map(|algorithm| {
            let offset = u32::try_from(pc.checked_sub(algorithm.load_address)?).ok()?;
            let routine = if Some(offset) == algorithm.pc_init {
                Routine::Init
            } else if Some(offset) == algorithm.pc_uninit {
                Routine::UnInit
            } else if offset == algorithm.pc_program_page {
                Routine::ProgramPage
            } else if offset == algorithm.pc_erase_sector {
                Routine::EraseSector
            } else if Some(offset) == algorithm.pc_erase_all {
                Routine::EraseAll
            } else {
                return None;
            };
            Some((routine, algorithm.clone()))
        })
    }

    fn fill_flash(&mut self, range: std::ops::Range<u64>, value: u8) {
        if let Some(memory) = self.memory_mut(range.start, (range.end - range.start) as usize) {
            let start = (range.start - memory.base) as usize;
            let end = (range.end - memory.base) as usize;
            memory.data[start..end].fill(value);
        }
    }

    fn execute(&mut self, routine: Routine, algorithm: &RawFlashAlgorithm) -> u32 {
        // The current call is already recorded.
        let previous = self
            .calls
            .iter()
            .filter(|call| call.routine == routine)
            .count()
            .saturating_sub(1);
        if let Some(fault) = self.faults.get(&routine) {
            if previous >= fault.successes {
                return fault.code;
            }
        }

        let properties = &algorithm.flash_properties;
        let r0 = self.register(CoreRegister::R0) as u64;
        match routine {
            Routine::Init | Routine::UnInit => {}
            Routine::EraseSector => {
                let Some(sector) = properties.sector_info(r0) else {
                    return 1;
                };
                self.fill_flash(sector.address_range(), properties.erased_byte_value);
            }
            Routine::EraseAll => {
                self.fill_flash(properties.address_range.clone(), properties.erased_byte_value);
            }
            Routine::ProgramPage => {
                let length = self.register(CoreRegister::R1) as usize;
                let buffer = self.register(CoreRegister::R2) as u64;

                let mut page = vec![0; length];
                if self.read(buffer, &mut page).is_err() {
                    return 2;
                }
                let Some(memory) = self.memory_mut(r0, length) else {
                    return 3;
                };
                let offset = (r0 - memory.base) as usize;
                // Programming can only clear bits.
                for (cell, byte) in memory.data[offset..offset + length].iter_mut().zip(page) {
                    *cell &= byte;
                }
            }
        }

        0
    }
}

impl MemoryInterface for FakeTarget {
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), LinkError> {
        self.state.lock().read(address, data)
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), LinkError> {
        self.state.lock().write(address, data)
    }

    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), LinkError> {
        let mut bytes = vec![0; data.len() * 4];
        self.state.lock().read(address, &mut bytes)?;

        for (word, chunk) in data.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), LinkError> {
        let mut state = self.state.lock();

        if state.memory(address, data.len() * 4).is_none() {
            for (index, word) in data.iter().enumerate() {
                state
                    .peripheral_writes
                    .push((address + 4 * index as u64, *word));
            }
            return Ok(());
        }

        let bytes: Vec<u8> = data.iter().flat_map(|word| word.to_le_bytes()).collect();
        state.write(address, &bytes)
    }
}

impl CoreInterface for FakeTarget {
    fn read_core_reg(&mut self, register: CoreRegister) -> Result<u32, LinkError> {
        let state = self.state.lock();
        match state.core {
            Core::Halted(_) => Ok(state.register(register)),
            _ => Err(LinkError::CoreNotHalted),
        }
    }

    fn write_core_reg(&mut self, register: CoreRegister, value: u32) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        let core = state.core;
        match core {
            Core::Halted(_) => {
                state.registers.insert(register, value);
                Ok(())
            }
            _ => Err(LinkError::CoreNotHalted),
        }
    }

    fn set_hw_breakpoint(&mut self, address: u64) -> Result<(), LinkError> {
        self.state.lock().breakpoints.push(address);
        Ok(())
    }

    fn clear_hw_breakpoint(&mut self, address: u64) -> Result<(), LinkError> {
        self.state
            .lock()
            .breakpoints
            .retain(|breakpoint| *breakpoint != address);
        Ok(())
    }

    fn run(&mut self) -> Result<(), LinkError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let pc = state.register(CoreRegister::Pc) as u64;
        let Some((routine, algorithm)) = state.identify(pc) else {
            // Not a routine entry, the core faults right away.
            state.core = Core::Halted(HaltReason::Exception);
            return Ok(());
        };

        let call = RoutineCall {
            routine,
            r0: state.register(CoreRegister::R0),
            r1: state.register(CoreRegister::R1),
            r2: state.register(CoreRegister::R2),
        };
        state.calls.push(call);

        let abort = state
            .abort_on
            .as_ref()
            .filter(|(abort_routine, _)| *abort_routine == routine)
            .map(|(_, handle)| handle.clone());
        if let Some(handle) = abort {
            handle.abort();
            state.core = Core::Hanging;
            return Ok(());
        }

        if let Some(count) = state.hangs.get_mut(&routine) {
            if *count > 0 {
                *count -= 1;
                state.core = Core::Hanging;
                return Ok(());
            }
        }

        let result = state.execute(routine, &algorithm);
        state.registers.insert(CoreRegister::R0, result);
        state.core = Core::Returned;

        Ok(())
    }

    fn halt(&mut self, _timeout: Duration) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.core = match state.core {
            Core::Returned => Core::Halted(HaltReason::Breakpoint),
            Core::Hanging => Core::Halted(HaltReason::Request),
            halted => halted,
        };
        Ok(())
    }

    fn wait_for_halt(&mut self, timeout: Duration) -> Result<HaltReason, LinkError> {
        let mut state = self.state.lock();
        let core = state.core;
        match core {
            Core::Halted(reason) => Ok(reason),
            Core::Returned => {
                state.core = Core::Halted(HaltReason::Breakpoint);
                Ok(HaltReason::Breakpoint)
            }
            Core::Hanging => {
                drop(state);
                std::thread::sleep(timeout);
                Err(LinkError::Timeout)
            }
        }
    }

    fn reset_link(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.link_resets += 1;

        if state.fail_link_reset {
            Err(LinkError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flash_is_not_writable_directly() {
        let mut target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);

        assert_eq!(
            target.write_32(0x0, &[0]),
            Err(LinkError::AccessFault { address: 0x0 })
        );
        target.write_32(0x2000_1000, &[0x1234_5678]).unwrap();
        assert_eq!(target.read_word_32(0x2000_1000).unwrap(), 0x1234_5678);
    }

    #[test]
    fn registers_need_halted_core() {
        let mut target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        target.hang_routine(Routine::Init, 1);

        target.write_core_reg(CoreRegister::Pc, 0x2000_0041).unwrap();
        target.run().unwrap();

        assert_eq!(
            target.read_core_reg(CoreRegister::R0),
            Err(LinkError::CoreNotHalted)
        );
        assert_eq!(
            target.wait_for_halt(Duration::from_millis(1)),
            Err(LinkError::Timeout)
        );
        target.halt(Duration::from_millis(1)).unwrap();
        assert!(target.read_core_reg(CoreRegister::R0).is_ok());
    }
}
