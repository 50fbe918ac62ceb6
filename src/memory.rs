/// Size of the flat 6502 address space.
pub const MEMORY_SIZE: usize = 0x10000;

/// Flat 64 KiB byte store.
///
/// Addresses are `u16`, so every access lands inside the array. Bulk loads
/// that would run past `$FFFF` drop the overflowing bytes instead of
/// wrapping into the zero page.
pub struct Memory {
    data: Box<[u8; MEMORY_SIZE]>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: Box::new([0; MEMORY_SIZE]),
        }
    }

    pub fn read(&self, address: u16) -> u8 {
        self.data[address as usize]
    }

    pub fn write(&mut self, address: u16, value: u8) {
        self.data[address as usize] = value;
    }

    /// Zero every byte.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    /// Copy `bytes` starting at `base`. Returns how many bytes were stored.
    pub fn load(&mut self, base: u16, bytes: &[u8]) -> usize {
        let start = base as usize;
        let end = (start + bytes.len()).min(MEMORY_SIZE);
        let len = end - start;
        self.data[start..end].copy_from_slice(&bytes[..len]);
        len
    }

    // Little-endian word read, high byte from the next address (16-bit wrap)
    pub fn read_u16(&self, address: u16) -> u16 {
        let low = self.read(address) as u16;
        let high = self.read(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    pub fn write_u16(&mut self, address: u16, value: u16) {
        self.write(address, (value & 0xFF) as u8);
        self.write(address.wrapping_add(1), (value >> 8) as u8);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_memory_is_zeroed() {
        let memory = Memory::new();
        assert!(memory.as_slice().iter().all(|&b| b == 0));
        assert_eq!(memory.as_slice().len(), MEMORY_SIZE);
    }

    #[test]
    fn test_read_write_extremes() {
        let mut memory = Memory::new();
        memory.write(0x0000, 0x11);
        memory.write(0xFFFF, 0x22);
        assert_eq!(memory.read(0x0000), 0x11);
        assert_eq!(memory.read(0xFFFF), 0x22);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let mut memory = Memory::new();
        memory.write(0x1234, 0xAB);
        memory.write(0xFFFF, 0xCD);
        memory.reset();
        assert_eq!(memory.read(0x1234), 0);
        assert_eq!(memory.read(0xFFFF), 0);
    }

    #[test]
    fn test_load_drops_bytes_past_end() {
        let mut memory = Memory::new();
        let stored = memory.load(0xFFFE, &[1, 2, 3, 4]);
        assert_eq!(stored, 2);
        assert_eq!(memory.read(0xFFFE), 1);
        assert_eq!(memory.read(0xFFFF), 2);
        // Nothing wrapped into the zero page
        assert_eq!(memory.read(0x0000), 0);
        assert_eq!(memory.read(0x0001), 0);
    }

    #[test]
    fn test_word_access_is_little_endian() {
        let mut memory = Memory::new();
        memory.write_u16(0x2000, 0xBEEF);
        assert_eq!(memory.read(0x2000), 0xEF);
        assert_eq!(memory.read(0x2001), 0xBE);
        assert_eq!(memory.read_u16(0x2000), 0xBEEF);

        memory.write_u16(0xFFFF, 0x1234);
        assert_eq!(memory.read(0xFFFF), 0x34);
        assert_eq!(memory.read(0x0000), 0x12);
    }
}
