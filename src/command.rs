//! SIO command frame, device selector and the per-command response builder.
//!
//! ## Command frame
//!
//! | Byte | Field                                   |
//! |------|-----------------------------------------|
//! | 0    | Device selector (device id + unit)      |
//! | 1    | Command code                            |
//! | 2    | AUX1 (sector number low)                |
//! | 3    | AUX2 (sector number high)               |
//! | 4    | Checksum of bytes 0-3                   |
//!
//! The PBI path adds a 16-bit extended aux value (bits 16-31 of the sector
//! number) that only the fixed disk uses for large LBAs.

/// Largest sector any unit serves.
pub const SECTOR_BUFFER_SIZE: usize = 512;

/// Wire handshake bytes.
pub mod reply {
    pub const ACK: u8 = b'A';
    pub const NAK: u8 = b'N';
    pub const COMPLETE: u8 = b'C';
    pub const ERROR: u8 = b'E';
}

/// Command codes understood by the dispatch table.
pub mod codes {
    /// High-speed index query
    pub const SPEED: u8 = 0x3F;
    /// Format single density
    pub const FORMAT: u8 = 0x21;
    /// Format enhanced density
    pub const FORMAT_ENHANCED: u8 = 0x22;
    /// Force media change (PBI only)
    pub const FORCE_MEDIA_CHANGE: u8 = 0x46;
    /// Read PERCOM block
    pub const READ_PERCOM: u8 = 0x4E;
    /// Write sector
    pub const WRITE: u8 = 0x50;
    /// Read sector
    pub const READ: u8 = 0x52;
    /// Get status
    pub const STATUS: u8 = 0x53;
    /// Write sector with verify
    pub const WRITE_VERIFY: u8 = 0x57;
    /// Device info (PBI only)
    pub const DEVICE_INFO: u8 = 0x6E;
}

/// Carry-propagating 8-bit sum used by every SIO checksum.
///
/// Each carry out of bit 7 is added back into the low bit (end-around carry),
/// so the result differs from a plain wrapping sum once the total passes 255.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| {
        let (next, carry) = sum.overflowing_add(b);
        next + u8::from(carry)
    })
}

/// Device selector byte.
///
/// ```text
///  7   6   5..0
/// XDCB PBI device id (0x31-0x3F floppy units, 0x20 fixed disk)
/// ```
///
/// The PBI bit is never set on the wire; the PBI bridge sets it to tell the
/// dispatch table which path a request came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSelector(pub u8);

impl DeviceSelector {
    const PBI: u8 = 0x40;
    const EXTENDED: u8 = 0x80;
    const FIXED_DISK_ID: u8 = 0x20;

    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn with_pbi(self) -> Self {
        Self(self.0 | Self::PBI)
    }

    /// Request arrived through the PBI bridge rather than the wire.
    #[must_use]
    pub const fn is_pbi(self) -> bool {
        self.0 & Self::PBI != 0
    }

    /// Extended device control block: the request carries an extended aux.
    #[must_use]
    pub const fn is_extended(self) -> bool {
        self.0 & Self::EXTENDED != 0
    }

    /// Addresses the fixed disk (id 0x20), which counts sectors from 0.
    #[must_use]
    pub const fn is_fixed_disk(self) -> bool {
        self.0 & 0x3F == Self::FIXED_DISK_ID
    }

    /// Floppy device ids 0x31..=0x34 (D1: to D4:) as seen on the wire.
    #[must_use]
    pub const fn is_wire_drive(self) -> bool {
        self.0 >= 0x31 && self.0 <= 0x34
    }

    /// Zero-based unit index from the low nibble (unit numbers are 1-based).
    /// Returns `None` for the fixed disk and for unit nibble 0.
    #[must_use]
    pub const fn unit_index(self) -> Option<usize> {
        if self.is_fixed_disk() {
            return None;
        }
        match self.0 & 0x0F {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    /// First valid sector number on the addressed device.
    #[must_use]
    pub const fn first_sector(self) -> u32 {
        if self.is_fixed_disk() {
            0
        } else {
            1
        }
    }
}

/// One decoded request, built and discarded per poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SioCommand {
    pub device: DeviceSelector,
    pub command: u8,
    pub aux1: u8,
    pub aux2: u8,
    pub checksum: u8,
    /// Bits 16-31 of the sector number; only the fixed disk uses it.
    pub aux_ext: u16,
}

impl SioCommand {
    /// Builds a command from the five frame bytes.
    #[must_use]
    pub const fn from_frame(frame: [u8; 5]) -> Self {
        Self {
            device: DeviceSelector(frame[0]),
            command: frame[1],
            aux1: frame[2],
            aux2: frame[3],
            checksum: frame[4],
            aux_ext: 0,
        }
    }

    #[must_use]
    pub const fn payload(&self) -> [u8; 4] {
        [self.device.0, self.command, self.aux1, self.aux2]
    }

    #[must_use]
    pub fn checksum_valid(&self) -> bool {
        checksum(&self.payload()) == self.checksum
    }

    /// Sector number split across aux1 (low), aux2 and the extended aux.
    #[must_use]
    pub const fn sector(&self) -> u32 {
        ((self.aux_ext as u32) << 16) | ((self.aux2 as u32) << 8) | self.aux1 as u32
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self.command, codes::WRITE | codes::WRITE_VERIFY)
    }
}

/// Response under construction for one dispatched command.
#[derive(Clone, Debug)]
pub struct SioAction {
    /// Number of payload bytes in `buffer` to return.
    pub bytes: usize,
    pub success: bool,
    /// Divisor to program once the reply has gone out.
    pub divisor: Option<u8>,
    /// Whether the framing layer sends COMPLETE/ERROR plus the payload.
    pub respond: bool,
    pub buffer: Vec<u8>,
}

impl Default for SioAction {
    fn default() -> Self {
        Self::new()
    }
}

impl SioAction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: 0,
            success: true,
            divisor: None,
            respond: true,
            buffer: vec![0; SECTOR_BUFFER_SIZE],
        }
    }

    /// Response preloaded with data sent by the guest (PBI writes, device info).
    #[must_use]
    pub fn with_data(data: &[u8]) -> Self {
        let mut action = Self::new();
        let len = data.len().min(SECTOR_BUFFER_SIZE);
        action.buffer[..len].copy_from_slice(&data[..len]);
        action.bytes = len;
        action
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.bytes.min(SECTOR_BUFFER_SIZE)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_end_around_carry() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x31, 0x52, 0x01, 0x00]), 0x84);
        // 0xFF + 0x02 = 0x101 -> 0x01 + carry = 0x02
        assert_eq!(checksum(&[0xFF, 0x02]), 0x02);
        assert_eq!(checksum(&[0xFF, 0xFF, 0xFF]), 0xFF);
    }

    #[test]
    fn test_checksum_detects_single_bit_flips() {
        let frames: [[u8; 4]; 4] = [
            [0x31, 0x52, 0x01, 0x00],
            [0x34, 0x57, 0xD0, 0x02],
            [0x31, 0x53, 0x00, 0x00],
            [0x3F, 0x3F, 0xFF, 0xFF],
        ];
        for frame in frames {
            let good = checksum(&frame);
            for byte in 0..4 {
                for bit in 0..8 {
                    let mut bad = frame;
                    bad[byte] ^= 1 << bit;
                    assert_ne!(
                        checksum(&bad),
                        good,
                        "flip byte {byte} bit {bit} of {frame:02X?} went unnoticed"
                    );
                }
            }
        }
    }

    #[test]
    fn test_selector_predicates() {
        let d1 = DeviceSelector(0x31);
        assert!(d1.is_wire_drive());
        assert_eq!(d1.unit_index(), Some(0));
        assert_eq!(d1.first_sector(), 1);
        assert!(!d1.is_pbi());

        let hdd = DeviceSelector(0xA0);
        assert!(hdd.is_fixed_disk());
        assert!(hdd.is_extended());
        assert_eq!(hdd.unit_index(), None);
        assert_eq!(hdd.first_sector(), 0);

        assert!(DeviceSelector(0x33).with_pbi().is_pbi());
        assert!(!DeviceSelector(0x35).is_wire_drive());
    }

    #[test]
    fn test_command_sector_number() {
        let mut cmd = SioCommand::from_frame([0x31, codes::READ, 0x68, 0x01, 0]);
        assert_eq!(cmd.sector(), 0x168);
        cmd.aux_ext = 0x0002;
        assert_eq!(cmd.sector(), 0x0002_0168);
        assert!(!cmd.is_write());
    }

    #[test]
    fn test_command_checksum_valid() {
        let cmd = SioCommand::from_frame([0x31, 0x52, 0x01, 0x00, 0x84]);
        assert!(cmd.checksum_valid());
        let cmd = SioCommand::from_frame([0x31, 0x52, 0x01, 0x00, 0x85]);
        assert!(!cmd.checksum_valid());
    }
}
