//! Disk drive side of the Atari 8-bit core.
//!
//! This module ties the peripheral pieces together into the object the host
//! firmware drives from its main loop: the drive registry, the SIO link to
//! the FPGA and the PBI side channel.
//!
//! ## Main loop
//!
//! ```text
//! loop {
//!     bridge.poll(Some(&mut guest_dma));  // PBI request first, then one SIO frame
//!     ... menu, OSD, other cores ...
//! }
//! ```
//!
//! Each [`SioBridge::poll`] call does at most one unit of work on each path and
//! never blocks waiting for the guest; a frame that has started arriving is
//! however served to completion, including the reply timing.
//!
//! ## Architecture
//!
//! ```text
//!              +-------------+
//!  SIO words ->|  sio::poll  |--+
//!              +-------------+  |   +-----------+   +---------------+
//!                               +-->| dispatch  |-->| DriveRegistry |--> ATX / XEX / plain
//!              +-------------+  |   +-----------+   +---------------+
//!  guest DMA ->|  PbiBridge  |--+
//!              +-------------+
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::EmulatorConfig;
use crate::dispatch::HandlerContext;
use crate::drive::{DriveRegistry, ImageHint, ImageIo, UnitSnapshot};
use crate::error::Result;
use crate::memory::GuestMemory;
use crate::pbi::{PbiBridge, PbiEvent};
use crate::sio::{self, SioOutcome};
use crate::transport::{Transport, DEFAULT_DIVISOR};
use std::path::Path;
use tracing::info;

/// What one [`SioBridge::poll`] call did on each path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollReport {
    pub pbi: Option<PbiEvent>,
    pub sio: SioOutcome,
}

/// Emulated disk drives attached to one Atari.
pub struct SioBridge<T: Transport, C: Clock> {
    /// Byte link to the FPGA's SIO port
    transport: T,
    clock: C,
    config: EmulatorConfig,
    /// Mounted images for D1..D15 and the fixed disk
    registry: DriveRegistry,
    pbi: PbiBridge,
}

impl<T: Transport> SioBridge<T, SystemClock> {
    /// Creates a bridge timed by the host's monotonic clock.
    pub fn with_system_clock(transport: T, config: EmulatorConfig) -> Result<Self> {
        Self::new(transport, SystemClock::new(), config)
    }
}

impl<T: Transport, C: Clock> SioBridge<T, C> {
    /// Creates a bridge with nothing mounted. Fails on an invalid config.
    pub fn new(transport: T, clock: C, config: EmulatorConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = DriveRegistry::new();
        registry.set_force_read_only(config.force_read_only);
        Ok(Self {
            transport,
            clock,
            config,
            registry,
            pbi: PbiBridge::new(),
        })
    }

    /// Closes every image and puts the link back at the standard rate.
    pub fn reset(&mut self) {
        info!("drive reset");
        self.registry.unmount_all();
        self.pbi = PbiBridge::new();
        self.transport.set_divisor(DEFAULT_DIVISOR);
    }

    /// Serves a pending PBI request (when enabled and `guest` is given) and
    /// then at most one SIO frame.
    pub fn poll(&mut self, guest: Option<&mut dyn GuestMemory>) -> PollReport {
        let mut ctx = HandlerContext {
            registry: &mut self.registry,
            clock: &self.clock,
            config: &self.config,
            guest,
        };
        let pbi = if self.config.pbi_enabled {
            self.pbi.poll(&mut self.transport, &mut ctx)
        } else {
            None
        };
        let sio = sio::poll(&mut self.transport, &mut ctx);
        PollReport { pbi, sio }
    }

    /// Replaces the configuration. Already mounted images keep their
    /// read-only state.
    pub fn set_config(&mut self, config: EmulatorConfig) -> Result<()> {
        config.validate()?;
        self.registry.set_force_read_only(config.force_read_only);
        self.config = config;
        Ok(())
    }

    /// Mounts the file at `path`. Without `hint` the format comes from the
    /// file extension.
    pub fn mount(&mut self, unit: usize, path: &Path, hint: Option<ImageHint>) -> Result<()> {
        self.registry.mount(unit, path, hint)
    }

    pub fn mount_image(
        &mut self,
        unit: usize,
        image: Box<dyn ImageIo>,
        hint: ImageHint,
        name: &str,
        writable: bool,
    ) -> Result<()> {
        self.registry.mount_image(unit, image, hint, name, writable)
    }

    pub fn unmount(&mut self, unit: usize) -> Result<()> {
        self.registry.unmount(unit)
    }

    /// Boot sectors served for executables mounted as disks.
    pub fn set_boot_loader(&mut self, loader: Vec<u8>) {
        self.registry.set_boot_loader(loader);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        self.registry.snapshot()
    }

    /// Mounted units as JSON, for the host menu.
    pub fn snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    #[must_use]
    pub const fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &DriveRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DriveRegistry {
        &mut self.registry
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::command::{checksum, codes};
    use crate::config::PbiMode;
    use crate::dispatch::Handler;
    use crate::drive::tests::atr_image;
    use crate::error::SioError;
    use crate::memory::GuestRam;
    use crate::pbi::{PbiResult, DCB_ADDR, HANDSHAKE_ADDR};
    use crate::transport::FifoTransport;
    use std::io::{Cursor, Write};

    fn bridge(config: EmulatorConfig) -> SioBridge<FifoTransport, FakeClock> {
        SioBridge::new(FifoTransport::new(), FakeClock::new(0), config).unwrap()
    }

    fn push_command(bridge: &mut SioBridge<FifoTransport, FakeClock>, device: u8, command: u8, sector: u16) {
        let [aux1, aux2] = sector.to_le_bytes();
        let sum = checksum(&[device, command, aux1, aux2]);
        bridge
            .transport_mut()
            .push_frame([device, command, aux1, aux2, sum]);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EmulatorConfig {
            speed_index: 9,
            ..EmulatorConfig::default()
        };
        let result = SioBridge::new(FifoTransport::new(), FakeClock::new(0), config);
        assert!(matches!(result, Err(SioError::InvalidConfig(_))));

        let mut ok = bridge(EmulatorConfig::default());
        let bad = EmulatorConfig {
            boot_drive: 8,
            ..EmulatorConfig::default()
        };
        assert!(ok.set_config(bad).is_err());
        assert_eq!(ok.config().boot_drive, 0);
    }

    #[test]
    fn test_with_system_clock() {
        let bridge =
            SioBridge::with_system_clock(FifoTransport::new(), EmulatorConfig::default()).unwrap();
        assert!(bridge.snapshot().is_empty());
        assert!(bridge.clock().now_us() < 1_000_000);
    }

    #[test]
    fn test_poll_serves_sio_frame() {
        let mut bridge = bridge(EmulatorConfig::default());
        bridge
            .mount_image(0, Box::new(Cursor::new(atr_image(128, 720))), ImageHint::Atr, "DOS.ATR", true)
            .unwrap();
        push_command(&mut bridge, 0x31, codes::STATUS, 0);

        let report = bridge.poll(None);
        assert_eq!(report.pbi, None);
        assert_eq!(
            report.sio,
            SioOutcome::Served {
                handler: Handler::GetStatus,
                success: true
            }
        );
        let tx = bridge.transport_mut().take_tx();
        assert_eq!(&tx[..2], b"AC");

        assert_eq!(bridge.poll(None).sio, SioOutcome::Idle);
    }

    #[test]
    fn test_pbi_only_when_enabled() {
        let mut ram = GuestRam::new();
        ram.write(HANDSHAKE_ADDR, &[0xA5, 0xA5, 0, 1]);

        let mut disabled = bridge(EmulatorConfig::default());
        assert_eq!(disabled.poll(Some(&mut ram)).pbi, None);
        assert_eq!(ram.read_byte(HANDSHAKE_ADDR + 3), 1);

        let mut enabled = bridge(EmulatorConfig {
            pbi_enabled: true,
            pbi_drive_modes: [PbiMode::Pbi; 4],
            ..EmulatorConfig::default()
        });
        assert_eq!(enabled.poll(Some(&mut ram)).pbi, Some(PbiEvent::Init));
        assert_eq!(ram.read_byte(HANDSHAKE_ADDR + 3), 0);
    }

    #[test]
    fn test_pbi_and_sio_in_one_poll() {
        let mut bridge = bridge(EmulatorConfig {
            pbi_enabled: true,
            pbi_drive_modes: [PbiMode::Pbi; 4],
            ..EmulatorConfig::default()
        });
        bridge
            .mount_image(0, Box::new(Cursor::new(atr_image(128, 720))), ImageHint::Atr, "A.ATR", true)
            .unwrap();
        let mut ram = GuestRam::new();
        ram.write(HANDSHAKE_ADDR, &[0xA5, 0xA5, 0, 1]);
        bridge.poll(Some(&mut ram));

        ram.write(DCB_ADDR, &[0x31, 1, codes::STATUS, 0x40, 0x00, 0x50, 0, 0, 4, 0]);
        ram.write(HANDSHAKE_ADDR + 4, &[0, 1]);
        push_command(&mut bridge, 0x31, codes::STATUS, 0);

        let report = bridge.poll(Some(&mut ram));
        assert_eq!(report.pbi, Some(PbiEvent::Command(PbiResult::Served)));
        assert!(matches!(report.sio, SioOutcome::Served { .. }));
        assert_eq!(ram.read_byte(0x5000), 0x10);
    }

    #[test]
    fn test_reset_unmounts_and_restores_divisor() {
        let mut bridge = bridge(EmulatorConfig::default());
        bridge
            .mount_image(2, Box::new(Cursor::new(atr_image(256, 720))), ImageHint::Atr, "C.ATR", true)
            .unwrap();
        bridge.transport_mut().set_divisor(0x08);

        bridge.reset();
        assert!(bridge.registry().unit(2).is_none());
        assert_eq!(bridge.transport().divisor(), DEFAULT_DIVISOR);

        push_command(&mut bridge, 0x33, codes::STATUS, 0);
        assert_eq!(bridge.poll(None).sio, SioOutcome::NotForUs);
    }

    #[test]
    fn test_forced_read_only_mount_from_path() {
        let mut file = tempfile::Builder::new().suffix(".atr").tempfile().unwrap();
        file.write_all(&atr_image(128, 720)).unwrap();
        file.flush().unwrap();

        let mut bridge = bridge(EmulatorConfig {
            force_read_only: true,
            ..EmulatorConfig::default()
        });
        bridge.mount(0, file.path(), None).unwrap();
        assert!(bridge.registry().unit(0).unwrap().is_read_only());

        push_command(&mut bridge, 0x31, codes::WRITE, 5);
        assert_eq!(bridge.poll(None).sio, SioOutcome::Refused);

        bridge.unmount(0).unwrap();
        assert!(bridge.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_json() {
        let mut bridge = bridge(EmulatorConfig::default());
        bridge
            .mount_image(0, Box::new(Cursor::new(atr_image(128, 720))), ImageHint::Atr, "GAME.ATR", false)
            .unwrap();
        let json = bridge.snapshot_json().unwrap();
        assert!(json.contains("\"name\":\"GAME.ATR\""));
        assert!(json.contains("\"sector_count\":720"));
    }
}
