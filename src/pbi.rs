//! Parallel Bus Interface side channel.
//!
//! With PBI enabled the guest's PBI BIOS skips the serial bus entirely: it
//! fills in the OS device control block, raises a flag in the handshake block
//! and waits. The firmware picks the request up from guest memory, runs it
//! through the same dispatch table as the wire path and writes the result
//! straight back. There is no checksum, ACK or completion byte.
//!
//! ## Handshake block ($D100)
//!
//! | Offset | Dir | Contents                                          |
//! |--------|-----|---------------------------------------------------|
//! | $00-01 | in  | Magic `A5 A5`                                     |
//! | $02    | out | Splash screen enabled                             |
//! | $03    | i/o | Init request (1), cleared when done               |
//! | $04    | out | Command result (see [`PbiResult`])                |
//! | $05    | i/o | Command request (1), cleared when done            |
//! | $0A    | out | Boot partition or drive                           |
//! | $0B    | out | Boot drive setting                                |
//! | $0C-0F | out | D1..D4 handling mode (0 off, 1 PBI, 2 SIO)        |
//!
//! The request flag is always cleared in the same write as its result so the
//! BIOS never sees a half-finished answer.
//!
//! ## Device control block ($0300)
//!
//! | Offset | Field   | Use                                        |
//! |--------|---------|--------------------------------------------|
//! | $00    | DDEVIC  | Device id; bit 7 marks an extended DCB     |
//! | $01    | DUNIT   | Unit number, 1-based                       |
//! | $02    | DCOMND  | Command code                               |
//! | $03    | DSTATS  | Direction in, status out                   |
//! | $04-05 | DBUF    | Guest buffer address                       |
//! | $08-09 | DBYT    | Transfer length in, bytes returned out     |
//! | $0A-0B | DAUX    | aux1, aux2                                 |
//! | $0C-0D | DAUX3/4 | Extended aux (extended DCB only)           |

use crate::command::{DeviceSelector, SioAction, SioCommand, SECTOR_BUFFER_SIZE};
use crate::config::PbiMode;
use crate::dispatch::{resolve, HandlerContext};
use crate::drive::{ImageKind, BLOCK_SIZE, FIXED_UNIT, UNIT_COUNT};
use crate::transport::Transport;
use tracing::debug;

pub const HANDSHAKE_ADDR: u16 = 0xD100;
pub const DCB_ADDR: u16 = 0x0300;

const HANDSHAKE_SIZE: usize = 16;
const DCB_SIZE: usize = 16;
const MAGIC: [u8; 2] = [0xA5, 0xA5];
const FIXED_DISK_ID: u8 = 0x20;

/// Status codes written back to DSTATS.
pub mod status {
    pub const SUCCESS: u8 = 0x01;
    /// The unit has nothing mounted.
    pub const TIMEOUT: u8 = 0x8A;
    /// No handler accepted the command.
    pub const NAK: u8 = 0x8B;
    pub const DEVICE_ERROR: u8 = 0x90;
}

/// Outcome of a PBI command request, as reported to the BIOS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbiResult {
    /// Handled here; DSTATS holds the status.
    Served,
    /// The BIOS should run its own high-speed SIO routine.
    HandedToSio,
    /// Not a device this bridge answers for.
    Declined,
}

impl PbiResult {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Served => 0,
            Self::HandedToSio => 1,
            Self::Declined => 0xFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbiEvent {
    Init,
    Command(PbiResult),
}

/// PBI handshake state. Drive modes are latched when the BIOS initialises.
#[derive(Clone, Debug, Default)]
pub struct PbiBridge {
    drive_modes: [PbiMode; 4],
}

impl PbiBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn drive_modes(&self) -> [PbiMode; 4] {
        self.drive_modes
    }

    /// Checks the handshake block and answers a pending init or command
    /// request. Does nothing without guest memory in `ctx`.
    pub fn poll<T: Transport>(
        &mut self,
        port: &mut T,
        ctx: &mut HandlerContext<'_, '_>,
    ) -> Option<PbiEvent> {
        ctx.guest.as_ref()?;

        let mut block = [0u8; HANDSHAKE_SIZE];
        dma_read(ctx, HANDSHAKE_ADDR, &mut block);
        if block[..2] != MAGIC {
            return None;
        }

        if block[3] == 1 {
            self.init(ctx, &mut block);
            Some(PbiEvent::Init)
        } else if block[5] == 1 {
            port.set_led(true);
            let result = self.process_command(ctx);
            port.set_led(false);
            block[4] = result.code();
            block[5] = 0;
            dma_write(ctx, HANDSHAKE_ADDR + 4, &block[4..6]);
            Some(PbiEvent::Command(result))
        } else {
            None
        }
    }

    fn init(&mut self, ctx: &mut HandlerContext<'_, '_>, block: &mut [u8; HANDSHAKE_SIZE]) {
        self.drive_modes = ctx.config.pbi_drive_modes;
        for (dst, mode) in block[0x0C..0x10].iter_mut().zip(self.drive_modes) {
            *dst = mode.bits();
        }

        let boot = ctx.config.boot_drive;
        block[0x0B] = boot;
        block[0x0A] = if boot == 1 && ctx.registry.has_own_image(FIXED_UNIT) {
            ctx.registry.boot_partition()
        } else {
            boot.saturating_sub(1)
        };
        dma_write(ctx, HANDSHAKE_ADDR + 0x0A, &block[0x0A..0x10]);

        block[2] = u8::from(ctx.config.splash);
        block[3] = 0;
        dma_write(ctx, HANDSHAKE_ADDR + 2, &block[2..4]);
        debug!(modes = ?self.drive_modes, boot, "pbi init");
    }

    fn process_command(&self, ctx: &mut HandlerContext<'_, '_>) -> PbiResult {
        let mut dcb = [0u8; DCB_SIZE];
        dma_read(ctx, DCB_ADDR, &mut dcb);

        let fixed_device = dcb[0] & 0x7F == FIXED_DISK_ID;
        let drive = dcb[1].wrapping_sub(1);
        let device = DeviceSelector(dcb[0].wrapping_add(drive)).with_pbi();
        let unit = if fixed_device && drive == 0 {
            FIXED_UNIT
        } else {
            usize::from(drive)
        };
        if unit >= UNIT_COUNT {
            return PbiResult::Declined;
        }

        let mut mode = if fixed_device && drive == 0 {
            PbiMode::Pbi.bits()
        } else if !fixed_device && drive < 4 {
            self.drive_modes[usize::from(drive)].bits()
        } else {
            dcb[0] >> 7
        };

        // The fixed disk, its partitions and synthetic images are out of
        // reach of the BIOS serial routine.
        let open = ctx.registry.is_open(unit);
        let mounted = ctx.registry.unit(unit).filter(|_| open);
        if let Some(drive) = mounted {
            let forced = if drive.is_fixed() {
                !fixed_device
            } else {
                matches!(drive.kind(), ImageKind::FluxLevel | ImageKind::FastLoader)
            };
            if forced {
                mode = PbiMode::Pbi.bits();
            }
        }
        let block_sized = mounted.is_some_and(|d| usize::from(d.sector_size()) == BLOCK_SIZE);

        if mode == PbiMode::Off.bits() || (mode == PbiMode::Sio.bits() && block_sized) {
            return PbiResult::Declined;
        }

        let result = if mode == PbiMode::Sio.bits() {
            PbiResult::HandedToSio
        } else {
            PbiResult::Served
        };

        if !open {
            if result == PbiResult::Served {
                dcb[3] = status::TIMEOUT;
            }
        } else if result == PbiResult::Served {
            dcb[3] = serve(ctx, device, unit, &mut dcb);
        }

        dma_write(ctx, DCB_ADDR + 3, &dcb[3..4]);
        debug!(device = device.raw(), unit, ?result, dstats = dcb[3], "pbi command");
        result
    }
}

/// Runs a decoded DCB through the dispatch table and returns DSTATS.
fn serve(
    ctx: &mut HandlerContext<'_, '_>,
    device: DeviceSelector,
    unit: usize,
    dcb: &mut [u8; DCB_SIZE],
) -> u8 {
    let command = SioCommand {
        device,
        command: dcb[2],
        aux1: dcb[0x0A],
        aux2: dcb[0x0B],
        checksum: 0,
        aux_ext: if device.is_extended() {
            u16::from_le_bytes([dcb[0x0C], dcb[0x0D]])
        } else {
            0
        },
    };
    let Some(handler) = ctx
        .registry
        .unit(unit)
        .and_then(|drive| resolve(&command, dcb[3], drive))
    else {
        return status::NAK;
    };

    let addr = u16::from_le_bytes([dcb[4], dcb[5]]);
    let requested = usize::from(u16::from_le_bytes([dcb[8], dcb[9]])).min(SECTOR_BUFFER_SIZE);
    let mut data = [0u8; SECTOR_BUFFER_SIZE];
    dma_read(ctx, addr, &mut data[..requested]);
    let mut action = SioAction::with_data(&data[..requested]);

    ctx.execute(handler, &command, unit, &mut action);

    if action.respond {
        let returned = action.payload().len();
        dcb[8..10].copy_from_slice(&(returned as u16).to_le_bytes());
        dma_write(ctx, addr, action.payload());
        dma_write(ctx, DCB_ADDR + 8, &dcb[8..10]);
    }
    if action.success {
        status::SUCCESS
    } else {
        status::DEVICE_ERROR
    }
}

fn dma_read(ctx: &mut HandlerContext<'_, '_>, addr: u16, buf: &mut [u8]) {
    if let Some(guest) = ctx.guest.as_deref_mut() {
        guest.read(addr, buf);
    }
}

fn dma_write(ctx: &mut HandlerContext<'_, '_>, addr: u16, data: &[u8]) {
    if let Some(guest) = ctx.guest.as_deref_mut() {
        guest.write(addr, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apt::tests::external_row;
    use crate::clock::FakeClock;
    use crate::command::codes;
    use crate::config::EmulatorConfig;
    use crate::drive::tests::{atr_image, fixed_image};
    use crate::drive::{DriveRegistry, ImageHint};
    use crate::memory::{GuestMemory, GuestRam};
    use crate::transport::FifoTransport;
    use std::io::Cursor;

    const BUF_ADDR: u16 = 0x4000;

    struct Rig {
        registry: DriveRegistry,
        config: EmulatorConfig,
        ram: GuestRam,
        bridge: PbiBridge,
        port: FifoTransport,
    }

    impl Rig {
        fn new(modes: [PbiMode; 4]) -> Self {
            Self {
                registry: DriveRegistry::new(),
                config: EmulatorConfig {
                    pbi_enabled: true,
                    pbi_drive_modes: modes,
                    ..EmulatorConfig::default()
                },
                ram: GuestRam::new(),
                bridge: PbiBridge::new(),
                port: FifoTransport::new(),
            }
        }

        fn mount(&mut self, unit: usize, image: Vec<u8>, hint: ImageHint) {
            self.registry
                .mount_image(unit, Box::new(Cursor::new(image)), hint, "IMG.ATR", true)
                .unwrap();
        }

        fn poll(&mut self) -> Option<PbiEvent> {
            let clock = FakeClock::new(0);
            let mut ctx = HandlerContext {
                registry: &mut self.registry,
                clock: &clock,
                config: &self.config,
                guest: Some(&mut self.ram),
            };
            self.bridge.poll(&mut self.port, &mut ctx)
        }

        fn init(&mut self) {
            self.ram.write(HANDSHAKE_ADDR, &[0xA5, 0xA5, 0, 1, 0, 0]);
            assert_eq!(self.poll(), Some(PbiEvent::Init));
        }

        /// Places a DCB and raises the command flag.
        fn request(&mut self, device: u8, unit: u8, command: u8, dstats: u8, len: u16, sector: u16) -> Option<PbiEvent> {
            let mut dcb = [0u8; DCB_SIZE];
            dcb[0] = device;
            dcb[1] = unit;
            dcb[2] = command;
            dcb[3] = dstats;
            dcb[4..6].copy_from_slice(&BUF_ADDR.to_le_bytes());
            dcb[8..10].copy_from_slice(&len.to_le_bytes());
            dcb[0x0A..0x0C].copy_from_slice(&sector.to_le_bytes());
            self.ram.write(DCB_ADDR, &dcb);
            self.ram.write(HANDSHAKE_ADDR + 4, &[0, 1]);
            self.poll()
        }

        fn dstats(&mut self) -> u8 {
            self.ram.read_byte(DCB_ADDR + 3)
        }
    }

    fn patterned_atr() -> Vec<u8> {
        let mut image = atr_image(128, 720);
        image[16 + 384..16 + 512].fill(0x3C);
        image
    }

    #[test]
    fn test_ignores_block_without_magic() {
        let mut rig = Rig::new([PbiMode::Pbi; 4]);
        rig.ram.write(HANDSHAKE_ADDR, &[0xA5, 0x00, 0, 1, 0, 1]);
        assert_eq!(rig.poll(), None);
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 3), 1);
    }

    #[test]
    fn test_no_guest_memory_is_a_no_op() {
        let mut registry = DriveRegistry::new();
        let config = EmulatorConfig::default();
        let clock = FakeClock::new(0);
        let mut ctx = HandlerContext {
            registry: &mut registry,
            clock: &clock,
            config: &config,
            guest: None,
        };
        let mut bridge = PbiBridge::new();
        assert_eq!(bridge.poll(&mut FifoTransport::new(), &mut ctx), None);
    }

    #[test]
    fn test_init_publishes_settings() {
        let mut rig = Rig::new([PbiMode::Pbi, PbiMode::Sio, PbiMode::Off, PbiMode::Pbi]);
        rig.config.boot_drive = 3;
        rig.config.splash = true;
        rig.init();

        let mut block = [0u8; HANDSHAKE_SIZE];
        rig.ram.read(HANDSHAKE_ADDR, &mut block);
        assert_eq!(block[2..4], [1, 0]);
        assert_eq!(block[0x0A], 2);
        assert_eq!(block[0x0B], 3);
        assert_eq!(block[0x0C..0x10], [1, 2, 0, 1]);
        assert_eq!(rig.bridge.drive_modes()[1], PbiMode::Sio);
    }

    #[test]
    fn test_init_boot_from_fixed_disk_partition() {
        let mut rig = Rig::new([PbiMode::Off; 4]);
        rig.config.boot_drive = 1;
        rig.init();
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 0x0A), 0);

        rig.mount(FIXED_UNIT, fixed_image(&[(0, external_row(4, 16, 1))], 32), ImageHint::Atr);
        rig.init();
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 0x0A), 1);
    }

    #[test]
    fn test_read_sector_into_guest() {
        let mut rig = Rig::new([PbiMode::Pbi, PbiMode::Off, PbiMode::Off, PbiMode::Off]);
        rig.mount(0, patterned_atr(), ImageHint::Atr);
        rig.init();

        let event = rig.request(0x31, 1, codes::READ, 0x40, 128, 4);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 4), 0);
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 5), 0);
        assert_eq!(rig.dstats(), status::SUCCESS);

        let mut data = [0u8; 128];
        rig.ram.read(BUF_ADDR, &mut data);
        assert!(data.iter().all(|&b| b == 0x3C));
        assert_eq!(rig.ram.read_byte(DCB_ADDR + 8), 128);
        assert!(!rig.port.led_state());
        assert!(!rig.port.has_tx_data());
    }

    #[test]
    fn test_write_sector_from_guest() {
        let mut rig = Rig::new([PbiMode::Pbi; 4]);
        rig.mount(1, patterned_atr(), ImageHint::Atr);
        rig.init();

        rig.ram.write(BUF_ADDR, &[0x77; 128]);
        let event = rig.request(0x31, 2, codes::WRITE_VERIFY, 0x80, 128, 20);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
        assert_eq!(rig.dstats(), status::SUCCESS);

        rig.ram.write(BUF_ADDR, &[0; 128]);
        rig.request(0x31, 2, codes::READ, 0x40, 128, 20);
        assert_eq!(rig.ram.read_byte(BUF_ADDR + 127), 0x77);
    }

    #[test]
    fn test_wrong_direction_is_nak() {
        let mut rig = Rig::new([PbiMode::Pbi; 4]);
        rig.mount(0, patterned_atr(), ImageHint::Atr);
        rig.init();

        rig.request(0x31, 1, codes::READ, 0x80, 128, 4);
        assert_eq!(rig.dstats(), status::NAK);
        rig.request(0x31, 1, 0x99, 0x40, 0, 0);
        assert_eq!(rig.dstats(), status::NAK);
    }

    #[test]
    fn test_drive_modes_route_requests() {
        let mut rig = Rig::new([PbiMode::Pbi, PbiMode::Sio, PbiMode::Off, PbiMode::Sio]);
        rig.mount(1, patterned_atr(), ImageHint::Atr);
        rig.mount(3, atr_image(512, 64), ImageHint::Atr);
        rig.init();

        // D1: served here but nothing mounted.
        let event = rig.request(0x31, 1, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
        assert_eq!(rig.dstats(), status::TIMEOUT);

        // D2: left to the BIOS serial routine, DSTATS untouched.
        let event = rig.request(0x31, 2, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::HandedToSio)));
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 4), 1);
        assert_eq!(rig.dstats(), 0x40);

        // D3: off.
        let event = rig.request(0x31, 3, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Declined)));
        assert_eq!(rig.ram.read_byte(HANDSHAKE_ADDR + 4), 0xFF);

        // D4: the serial routine cannot move 512-byte sectors.
        let event = rig.request(0x31, 4, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Declined)));
    }

    #[test]
    fn test_modes_latched_at_init() {
        let mut rig = Rig::new([PbiMode::Pbi; 4]);
        rig.mount(0, patterned_atr(), ImageHint::Atr);

        let event = rig.request(0x31, 1, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Declined)));

        rig.init();
        let event = rig.request(0x31, 1, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
    }

    #[test]
    fn test_synthetic_images_forced_to_pbi() {
        let mut rig = Rig::new([PbiMode::Off; 4]);
        rig.mount(0, vec![0xFF; 300], ImageHint::Xex);
        rig.init();

        let event = rig.request(0x31, 1, codes::READ, 0x40, 128, 0x169);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
        assert_eq!(rig.dstats(), status::SUCCESS);
        assert_eq!(rig.ram.read_byte(BUF_ADDR), 0x42);
    }

    #[test]
    fn test_fixed_disk_and_partitions() {
        let mut rig = Rig::new([PbiMode::Off; 4]);
        let mut image = fixed_image(&[(0, external_row(4, 16, 0x0102))], 32);
        image[4 * 512..5 * 512].fill(0xD5);
        rig.mount(FIXED_UNIT, image, ImageHint::Atr);
        rig.init();
        rig.ram.write_byte(0xDFAD, 0x5E);

        let event = rig.request(0x20, 1, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
        assert_eq!(rig.dstats(), status::SUCCESS);
        assert_eq!(rig.ram.read_byte(BUF_ADDR), 0x40);
        assert_eq!(rig.ram.read_byte(BUF_ADDR + 3), 0x5E);

        // Partition in slot 0 answers as D1: with its own sector numbering.
        let event = rig.request(0x31, 1, codes::READ, 0x40, 512, 1);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Served)));
        assert_eq!(rig.dstats(), status::SUCCESS);
        assert_eq!(rig.ram.read_byte(BUF_ADDR + 511), 0xD5);
        assert_eq!(rig.ram.read_byte(DCB_ADDR + 9), 2);
    }

    #[test]
    fn test_unit_zero_declined() {
        let mut rig = Rig::new([PbiMode::Pbi; 4]);
        rig.init();
        let event = rig.request(0x31, 0, codes::STATUS, 0x40, 4, 0);
        assert_eq!(event, Some(PbiEvent::Command(PbiResult::Declined)));
    }
}
