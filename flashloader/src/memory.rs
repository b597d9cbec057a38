use crate::error::LinkError;

/// Memory access on the target.
///
/// Addresses are target addresses. Multi-byte values use the endianness of the target.
pub trait MemoryInterface {
    /// Read a block of 8bit words at `address`.
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), LinkError>;

    /// Write a block of 8bit words to `address`.
    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), LinkError>;

    /// Read a block of 32bit words at `address`.
    ///
    /// The address has to be a multiple of 4.
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), LinkError>;

    /// Write a block of 32bit words to `address`.
    ///
    /// The address has to be a multiple of 4.
    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), LinkError>;

    /// Read a 32bit word at `address`.
    fn read_word_32(&mut self, address: u64) -> Result<u32, LinkError> {
        let mut word = 0;
        self.read_32(address, std::slice::from_mut(&mut word))?;
        Ok(word)
    }

    /// Write a 32bit word to `address`.
    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), LinkError> {
        self.write_32(address, std::slice::from_ref(&data))
    }
}
