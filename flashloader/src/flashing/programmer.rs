use super::{ActiveFlasher, FlashError};

/// A page which was programmed successfully.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProgrammedPage {
    /// Start address of the page.
    pub address: u64,
    /// Number of bytes of the input data in this page.
    pub size: u32,
    /// Index of the page buffer the data was transferred through.
    pub buffer: usize,
}

#[derive(Debug, Copy, Clone)]
struct StagedPage {
    address: u64,
    size: u32,
    buffer: usize,
}

/// Programs a range of flash page by page, as an iterator over the programmed pages.
///
/// With two page buffers, the next page is transferred to the target while the
/// previous one is programmed. Buffers are used alternately, starting with the first.
///
/// The iterator stops after the first failure, which is reported as
/// [`FlashError::ProgramFailed`] with the address of the first page which is not
/// known to be programmed. Programming can be restarted from [`PageProgrammer::resume_address`].
pub struct PageProgrammer<'p, 'f> {
    flasher: &'p mut ActiveFlasher<'f>,
    start: u64,
    data: &'p [u8],
    page_size: usize,
    buffers: usize,
    next_offset: usize,
    staged: Option<StagedPage>,
    committed: u64,
    done: bool,
}

impl<'p, 'f> PageProgrammer<'p, 'f> {
    pub(super) fn new(
        flasher: &'p mut ActiveFlasher<'f>,
        start: u64,
        data: &'p [u8],
        buffers: usize,
    ) -> Self {
        let page_size = flasher.flash_algorithm().flash_properties.page_size as usize;

        Self {
            flasher,
            start,
            data,
            page_size,
            buffers,
            next_offset: 0,
            staged: None,
            committed: 0,
            done: false,
        }
    }

    /// Bytes of the input programmed so far.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Address of the first page which is not programmed yet.
    pub fn resume_address(&self) -> u64 {
        self.start + self.committed
    }

    /// Copy the next chunk of input into the free page buffer.
    fn stage_next(&mut self) -> Result<Option<StagedPage>, FlashError> {
        if self.next_offset >= self.data.len() {
            return Ok(None);
        }

        let end = (self.next_offset + self.page_size).min(self.data.len());
        let chunk = &self.data[self.next_offset..end];

        let buffer = self.flasher.next_buffer(self.buffers);
        self.flasher.load_page_buffer(chunk, buffer)?;

        let page = StagedPage {
            address: self.start + self.next_offset as u64,
            size: chunk.len() as u32,
            buffer,
        };
        self.next_offset = end;

        Ok(Some(page))
    }

    fn step(&mut self) -> Result<Option<ProgrammedPage>, FlashError> {
        let current = match self.staged.take() {
            Some(page) => page,
            None => match self.stage_next()? {
                Some(page) => page,
                None => return Ok(None),
            },
        };

        self.flasher
            .start_program_page_with_buffer(current.address, current.buffer)?;

        if self.buffers > 1 {
            self.staged = self.stage_next()?;
        }

        self.flasher.wait_for_program_page()?;
        self.committed += current.size as u64;

        Ok(Some(ProgrammedPage {
            address: current.address,
            size: current.size,
            buffer: current.buffer,
        }))
    }

    fn failed(&mut self, error: FlashError) -> FlashError {
        let committed = self.committed;
        let resume_address = self.resume_address();

        let error = match error {
            FlashError::Aborted => return FlashError::Aborted,
            FlashError::ProgramFailed {
                page_address,
                source,
                ..
            } => FlashError::ProgramFailed {
                page_address,
                committed,
                source,
            },
            error => FlashError::ProgramFailed {
                page_address: resume_address,
                committed,
                source: Box::new(error),
            },
        };

        // A page may still be running if staging the next one failed.
        self.flasher.fail(error)
    }
}

impl Iterator for PageProgrammer<'_, '_> {
    type Item = Result<ProgrammedPage, FlashError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                self.staged = None;
                Some(Err(self.failed(error)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flashing::{
        AbortHandle, FlashAlgorithm, FlashContext, FlashOptions, Flasher, Operation,
    };
    use crate::test::{example_algorithm, example_memory_map, FakeTarget, Routine};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn programmed_buffers(target: &FakeTarget) -> Vec<u32> {
        target
            .calls()
            .iter()
            .filter(|call| call.routine == Routine::ProgramPage)
            .map(|call| call.r2)
            .collect()
    }

    fn flasher<'a>(
        target: &'a mut FakeTarget,
        context: &'a mut FlashContext,
        options: FlashOptions,
    ) -> Flasher<'a> {
        let memory_map = example_memory_map();
        let region = memory_map.nvm_regions().next().unwrap().clone();
        let algorithm =
            FlashAlgorithm::assemble_from_raw(&example_algorithm(), &memory_map).unwrap();

        Flasher::new(
            target,
            context,
            region,
            algorithm,
            options,
            AbortHandle::default(),
        )
        .unwrap()
    }

    #[test_case(2; "two pages")]
    #[test_case(3; "three pages")]
    #[test_case(8; "eight pages")]
    fn buffers_alternate(pages: usize) {
        let target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        let mut link = target.clone();
        let mut context = FlashContext::default();
        let mut flasher = flasher(&mut link, &mut context, FlashOptions::default());
        let data = vec![0x5a; pages * 0x200];

        let programmed: Vec<ProgrammedPage> = flasher
            .run(Operation::Program, |active| {
                active.program_range(0x4000, &data)?.collect()
            })
            .unwrap();

        let buffers: Vec<usize> = programmed.iter().map(|page| page.buffer).collect();
        let expected: Vec<usize> = (0..pages).map(|page| page % 2).collect();
        assert_eq!(buffers, expected);

        let addresses = programmed_buffers(&target);
        assert_eq!(addresses.len(), pages);
        for (index, address) in addresses.iter().enumerate() {
            let expected = if index % 2 == 0 { 0x2000_1000 } else { 0x2000_1200 };
            assert_eq!(*address, expected);
        }

        let mut read_back = vec![0; data.len()];
        target.read_flash(0x4000, &mut read_back);
        assert_eq!(read_back, data);
    }

    #[test]
    fn single_buffer_without_double_buffering() {
        let target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        let mut link = target.clone();
        let mut context = FlashContext::default();
        let options = FlashOptions {
            double_buffering: false,
            ..Default::default()
        };
        let mut flasher = flasher(&mut link, &mut context, options);

        flasher
            .run(Operation::Program, |active| {
                for page in active.program_range(0x0, &[0x11; 0x600])? {
                    page?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(programmed_buffers(&target), vec![0x2000_1000; 3]);
    }

    #[test]
    fn tail_is_padded_with_erased_value() {
        let target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        let mut link = target.clone();
        let mut context = FlashContext::default();
        let mut flasher = flasher(&mut link, &mut context, FlashOptions::default());

        let committed = flasher.program(0x0, &[0x42; 0x210]).unwrap();
        assert_eq!(committed, 0x210);

        let mut read_back = vec![0; 0x400];
        target.read_flash(0x0, &mut read_back);
        assert!(read_back[..0x210].iter().all(|b| *b == 0x42));
        assert!(read_back[0x210..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn failure_reports_committed_bytes() {
        let target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        target.fail_routine_after(Routine::ProgramPage, 2, 5);
        let mut link = target.clone();
        let mut context = FlashContext::default();
        let mut flasher = flasher(&mut link, &mut context, FlashOptions::default());
        let data = vec![0x33; 0x800];

        let (results, resume_address) = flasher
            .run(Operation::Program, |active| {
                let mut programmer = active.program_range(0x2000, &data)?;
                let results: Vec<_> = programmer.by_ref().collect();
                Ok((results, programmer.resume_address()))
            })
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        let Err(FlashError::ProgramFailed {
            page_address,
            committed,
            ..
        }) = &results[2]
        else {
            panic!("unexpected result {:?}", results[2]);
        };
        assert_eq!(*page_address, 0x2400);
        assert_eq!(*committed, 0x400);
        assert_eq!(resume_address, 0x2400);
        assert!(flasher.context().loaded_algorithm().is_none());
    }

    #[test]
    fn unaligned_start_is_rejected() {
        let target = FakeTarget::new(&example_memory_map(), [example_algorithm()]);
        let mut link = target.clone();
        let mut context = FlashContext::default();
        let mut flasher = flasher(&mut link, &mut context, FlashOptions::default());

        let error = flasher
            .run(Operation::Program, |active| {
                active.program_range(0x100, &[0; 0x200]).map(|_| ())
            })
            .unwrap_err();
        assert!(matches!(
            error,
            FlashError::UnalignedPageAddress {
                address: 0x100,
                page_size: 0x200
            }
        ));
    }
}
