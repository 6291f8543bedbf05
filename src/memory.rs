//! Guest memory access for the PBI side channel.
//!
//! The PBI BIOS and the firmware talk through shared Atari memory: the
//! handshake block in the PBI ROM window, the device control block in page 3
//! and the data buffers the guest points at. On hardware the firmware reaches
//! them with DMA through the FPGA; [`GuestMemory`] is that DMA port.
//!
//! ## Addresses used
//!
//! | Address | Size | Contents                                       |
//! |---------|------|------------------------------------------------|
//! | $0300   | 16   | Device control block (DCB)                     |
//! | $D100   | 16   | PBI handshake block                            |
//! | $DFA0   | $60  | Fixed disk identity strings for device info    |
//! | $DFAD   | 1    | Fixed disk status byte reported by get-status  |
//!
//! Addresses wrap at 64 KiB.

/// Size of the guest address space.
pub const GUEST_MEMORY_SIZE: usize = 0x1_0000;

/// DMA window into the guest's address space.
pub trait GuestMemory {
    fn read(&mut self, addr: u16, buf: &mut [u8]);

    fn write(&mut self, addr: u16, data: &[u8]);

    fn read_byte(&mut self, addr: u16) -> u8 {
        let mut byte = [0u8; 1];
        self.read(addr, &mut byte);
        byte[0]
    }

    fn write_byte(&mut self, addr: u16, value: u8) {
        self.write(addr, &[value]);
    }
}

/// Flat 64 KiB guest RAM.
#[derive(Clone)]
pub struct GuestRam {
    data: Box<[u8]>,
}

impl Default for GuestRam {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam").finish_non_exhaustive()
    }
}

impl GuestRam {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0; GUEST_MEMORY_SIZE].into_boxed_slice(),
        }
    }

    /// Direct view of the whole address space.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

impl GuestMemory for GuestRam {
    fn read(&mut self, addr: u16, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.data[usize::from(addr.wrapping_add(i as u16))];
        }
    }

    fn write(&mut self, addr: u16, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.data[usize::from(addr.wrapping_add(i as u16))] = byte;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mut ram = GuestRam::new();
        ram.write(0x0300, &[1, 2, 3]);
        let mut buf = [0u8; 3];
        ram.read(0x0300, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(ram.read_byte(0x0301), 2);
        ram.write_byte(0xD100, 0xA5);
        assert_eq!(ram.as_slice()[0xD100], 0xA5);
    }

    #[test]
    fn test_wraps_at_top_of_memory() {
        let mut ram = GuestRam::new();
        ram.write(0xFFFF, &[0xAA, 0xBB]);
        assert_eq!(ram.read_byte(0xFFFF), 0xAA);
        assert_eq!(ram.read_byte(0x0000), 0xBB);
        ram.clear();
        assert_eq!(ram.read_byte(0x0000), 0);
    }
}
