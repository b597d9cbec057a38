use std::time::Duration;

use crate::config::{get_target_by_name, MemoryRegion, NvmRegion, Target};
use crate::core::CoreInterface;
use crate::error::Error;
use crate::flashing::{AbortHandle, FlashAlgorithm, FlashContext, FlashError, FlashOptions, Flasher};
use crate::svd::PeripheralDescriptionSource;

/// How long the core may take to halt on connect.
const CONNECT_HALT_TIMEOUT: Duration = Duration::from_millis(100);

/// The `Session` struct represents an active debug session with one target.
///
/// It owns the link to the target and the flashing state of it. All flash
/// operations go through the session, which looks up the memory region and
/// flash algorithm for the address they touch.
///
/// ## Example
///
/// ```no_run
/// use flashloader::flashing::FlashOptions;
/// use flashloader::Session;
/// # use flashloader::CoreInterface;
/// # fn link() -> Box<dyn CoreInterface> { unimplemented!() }
///
/// let mut session = Session::connect_by_name(link(), "nRF9160_xxAA")?;
///
/// session.erase_sector(0x1000)?;
/// session.program(0x1000, &[0xaa; 0x100], FlashOptions::default())?;
///
/// let link = session.disconnect();
/// # Ok::<(), flashloader::Error>(())
/// ```
pub struct Session {
    target: Target,
    link: Box<dyn CoreInterface>,
    context: FlashContext,
    abort: AbortHandle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target.name)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Attach to `target` through `link`.
    ///
    /// The core is halted, then the post-connect sequence of the chip runs.
    #[tracing::instrument(skip_all, fields(target = %target.name))]
    pub fn connect(mut link: Box<dyn CoreInterface>, target: Target) -> Result<Self, Error> {
        tracing::info!("Connecting to {}", target.name);

        link.halt(CONNECT_HALT_TIMEOUT)?;

        let mut session = Self {
            target,
            link,
            context: FlashContext::default(),
            abort: AbortHandle::default(),
        };
        session.post_connect_hook()?;

        Ok(session)
    }

    /// Attach to the chip called `name` in the target registry.
    pub fn connect_by_name(link: Box<dyn CoreInterface>, name: &str) -> Result<Self, Error> {
        let target = get_target_by_name(name)?;
        Self::connect(link, target)
    }

    /// Run the post-connect sequence of the chip.
    ///
    /// The sequence only does idempotent register writes, so this can be called again,
    /// e.g. after the target was reset.
    pub fn post_connect_hook(&mut self) -> Result<(), Error> {
        let sequence = self.target.debug_sequence.clone();
        tracing::debug!("Running post-connect sequence {:?}", sequence);

        sequence.post_connect(&mut *self.link)?;

        Ok(())
    }

    /// End the session and hand back the link.
    ///
    /// The flash algorithm stays in RAM, but the flashing state is discarded.
    pub fn disconnect(mut self) -> Box<dyn CoreInterface> {
        if let Some(breakpoint) = self.context.return_breakpoint.take() {
            if let Err(error) = self.link.clear_hw_breakpoint(breakpoint) {
                tracing::warn!("Failed to clear breakpoint at {:#010x}: {}", breakpoint, error);
            }
        }

        tracing::info!("Disconnected from {}", self.target.name);
        self.link
    }

    /// The target this session is attached to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The flashing state of the target.
    pub fn context(&self) -> &FlashContext {
        &self.context
    }

    /// Direct access to the core, e.g. to inspect memory between flash operations.
    pub fn core(&mut self) -> &mut dyn CoreInterface {
        &mut *self.link
    }

    /// A handle which aborts the flash operation in progress.
    ///
    /// The abort request is cleared when the next operation starts.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Create a [`Flasher`] for the flash region containing `address`.
    ///
    /// The flash algorithm is picked by the region, and loaded into RAM unless it
    /// is already resident.
    pub fn flasher(&mut self, address: u64, options: FlashOptions) -> Result<Flasher<'_>, FlashError> {
        let (region, algorithm) = self.algorithm_for_address(address)?;
        self.create_flasher(region, algorithm, options)
    }

    /// Erase the sector containing `address`.
    pub fn erase_sector(&mut self, address: u64) -> Result<(), Error> {
        let mut flasher = self.flasher(address, FlashOptions::default())?;
        flasher.erase_sectors(address..address + 1)?;

        Ok(())
    }

    /// Erase the default flash region with the `EraseAll()` routine of its algorithm.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        let address = self
            .target
            .memory_map
            .default_nvm()
            .map(|region| region.range.start)
            .ok_or(FlashError::NoFlashRegion)?;

        let mut flasher = self.flasher(address, FlashOptions::default())?;
        flasher.erase_all()?;

        Ok(())
    }

    /// Program `data` to `address`.
    ///
    /// The sectors touched are erased first, unless [`FlashOptions::skip_erase`] is set.
    /// Bytes of these sectors outside of `data` are erased as well, unless
    /// [`FlashOptions::keep_unwritten_bytes`] is set. The programmed data is read back
    /// with [`FlashOptions::verify`].
    #[tracing::instrument(skip(self, data, options), fields(length = data.len()))]
    pub fn program(&mut self, address: u64, data: &[u8], options: FlashOptions) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let (region, algorithm) = self.algorithm_for_address(address)?;
        let end = address + data.len() as u64;
        let properties = &algorithm.flash_properties;

        let (image_start, mut image) = if options.keep_unwritten_bytes {
            let (Some(first), Some(last)) =
                (algorithm.sector_info(address), algorithm.sector_info(end - 1))
            else {
                return Err(FlashError::RangeOutsideFlash {
                    start: address,
                    end,
                    flash: properties.address_range.clone(),
                }
                .into());
            };

            let start = first.base_address;
            let mut contents = vec![0; (last.address_range().end - start) as usize];
            tracing::debug!(
                "Reading {} bytes at {:#010x} to keep unwritten bytes",
                contents.len(),
                start
            );
            self.link.read_8(start, &mut contents)?;

            (start, contents)
        } else {
            let page_size = properties.page_size as u64;
            let start = address - address % page_size;

            (start, vec![properties.erased_byte_value; (end - start) as usize])
        };

        let offset = (address - image_start) as usize;
        image[offset..offset + data.len()].copy_from_slice(data);

        let verify = options.verify;
        let mut flasher = self.create_flasher(region, algorithm, options)?;
        let committed = flasher.program(image_start, &image)?;
        tracing::info!("Programmed {} bytes at {:#010x}", committed, image_start);

        if verify {
            flasher.verify(address, data)?;
        }

        Ok(())
    }

    /// Compare the flash contents at `address` with `data`.
    pub fn verify(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let mut flasher = self.flasher(address, FlashOptions::default())?;
        flasher.verify(address, data)?;

        Ok(())
    }

    /// Load the peripheral description of the chip from `source`.
    pub fn peripheral_descriptions<S: PeripheralDescriptionSource>(
        &self,
        source: &S,
    ) -> Result<S::Device, Error> {
        let Some(svd) = &self.target.svd else {
            return Err(anyhow::anyhow!(
                "The target {} has no peripheral description",
                self.target.name
            )
            .into());
        };

        source.load_by_name(svd).map_err(Error::Other)
    }

    fn algorithm_for_address(&self, address: u64) -> Result<(NvmRegion, FlashAlgorithm), FlashError> {
        let memory_map = &self.target.memory_map;

        let region = match memory_map.resolve(address) {
            Ok(MemoryRegion::Nvm(region)) => region,
            Ok(_) => return Err(FlashError::NotFlashMemory { address }),
            Err(_) => return Err(FlashError::AddressNotMapped { address }),
        };

        let raw = self
            .target
            .algorithm_for_region(region)
            .ok_or_else(|| FlashError::NoFlashAlgorithm {
                region: region.range.clone(),
            })?;
        let algorithm = FlashAlgorithm::assemble_from_raw(raw, memory_map)?;

        Ok((region.clone(), algorithm))
    }

    fn create_flasher(
        &mut self,
        region: NvmRegion,
        algorithm: FlashAlgorithm,
        options: FlashOptions,
    ) -> Result<Flasher<'_>, FlashError> {
        self.abort.reset();

        Flasher::new(
            &mut *self.link,
            &mut self.context,
            region,
            algorithm,
            options,
            self.abort.clone(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{example_algorithm, example_memory_map, example_target, FakeTarget, Routine};
    use pretty_assertions::assert_eq;

    fn connect() -> (FakeTarget, Session) {
        let target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        let session = Session::connect(Box::new(target.clone()), example_target()).unwrap();

        (target, session)
    }

    #[test]
    fn unmapped_address_is_rejected() {
        let (target, mut session) = connect();

        let error = session.erase_sector(0x1000_0000).unwrap_err();
        assert!(matches!(
            error,
            Error::Flash(FlashError::AddressNotMapped {
                address: 0x1000_0000
            })
        ));
        let error = session.erase_sector(0x2000_0000).unwrap_err();
        assert!(matches!(error, Error::Flash(FlashError::NotFlashMemory { .. })));
        assert!(target.calls().is_empty());
    }

    #[test]
    fn unaligned_program_is_padded() {
        let (target, mut session) = connect();

        session
            .program(0x2010, &[0x12; 8], FlashOptions::default())
            .unwrap();

        let calls = target.calls();
        let program: Vec<_> = calls
            .iter()
            .filter(|call| call.routine == Routine::ProgramPage)
            .collect();
        assert_eq!(program.len(), 1);
        assert_eq!(program[0].r0, 0x2000);
        assert_eq!(program[0].r1, 0x200);

        let mut read_back = [0; 0x20];
        target.read_flash(0x2000, &mut read_back);
        assert!(read_back[..0x10].iter().all(|b| *b == 0xff));
        assert_eq!(read_back[0x10..0x18], [0x12; 8]);
        assert!(read_back[0x18..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn unwritten_bytes_are_kept() {
        let (target, mut session) = connect();

        session
            .program(0x2000, &[0x11; 0x400], FlashOptions::default())
            .unwrap();
        let options = FlashOptions {
            keep_unwritten_bytes: true,
            verify: true,
            ..Default::default()
        };
        session.program(0x2200, &[0x22; 0x10], options).unwrap();

        let mut read_back = vec![0; 0x400];
        target.read_flash(0x2000, &mut read_back);
        assert!(read_back[..0x200].iter().all(|b| *b == 0x11));
        assert!(read_back[0x200..0x210].iter().all(|b| *b == 0x22));
        assert!(read_back[0x210..].iter().all(|b| *b == 0x11));
    }

    #[test]
    fn verify_reports_first_difference() {
        let (_target, mut session) = connect();

        session
            .program(0x0, &[0x33; 0x200], FlashOptions::default())
            .unwrap();

        let mut expected = vec![0x33; 0x200];
        expected[0x42] = 0x34;
        let error = session.verify(0x0, &expected).unwrap_err();
        assert!(matches!(
            error,
            Error::Flash(FlashError::Verify { address: 0x42 })
        ));
    }

    #[test]
    fn algorithm_is_loaded_once_per_session() {
        let (target, mut session) = connect();

        session.erase_sector(0x0).unwrap();
        let writes = target.ram_writes();
        session.erase_sector(0x2000).unwrap();

        assert_eq!(target.ram_writes(), writes);
        assert_eq!(
            session.context().loaded_algorithm().map(|algo| algo.name.as_str()),
            Some("test_flash")
        );
    }

    #[test]
    fn missing_peripheral_description() {
        struct Names;

        impl PeripheralDescriptionSource for Names {
            type Device = String;

            fn load_by_name(&self, name: &str) -> anyhow::Result<String> {
                Ok(name.to_string())
            }
        }

        let (_target, mut session) = connect();
        assert!(session.peripheral_descriptions(&Names).is_err());

        session.target.svd = Some("Example.svd".to_string());
        assert_eq!(session.peripheral_descriptions(&Names).unwrap(), "Example.svd");
    }
}
