//! Command dispatch table shared by the SIO wire and the PBI bridge.
//!
//! A command is first resolved against the addressed unit's state: whether
//! the unit is writable, whether the sector is in range, and which path the
//! request came from. Only a resolved command reaches its handler; anything
//! else is answered with an error by the caller.
//!
//! ## Availability
//!
//! | Code  | Command            | SIO | PBI (`dstats`)        | Extra condition        |
//! |-------|--------------------|-----|-----------------------|------------------------|
//! | $3F   | Speed query        | yes | no                    |                        |
//! | $21/22| Format             | yes | no                    | writable               |
//! | $46   | Force media change | no  | any                   |                        |
//! | $4E   | Read PERCOM        | yes | any                   | not the fixed disk     |
//! | $53   | Get status         | yes | $40 (read)            |                        |
//! | $50/57| Write (+verify)    | yes | $80 (write)           | writable, in range     |
//! | $52   | Read               | yes | $40 (read)            | in range               |
//! | $6E   | Device info        | no  | $40 (read)            |                        |

use crate::clock::Clock;
use crate::command::{codes, DeviceSelector, SioAction, SioCommand};
use crate::config::{EmulatorConfig, SPEED_COUNT};
use crate::drive::{DriveRegistry, DriveUnit, ImageKind, UnitFlags, FIXED_UNIT};
use crate::memory::GuestMemory;
use bitflags::bitflags;
use tracing::{debug, warn};

/// POKEY divisors offered for high-speed transfers, indexed by speed index.
pub const SPEEDS: [u8; SPEED_COUNT] = [0x28, 6, 5, 4, 3, 2, 1, 0];

/// Offset added to a table entry to get the programmed divisor.
const DIVISOR_BIAS: u8 = 6;

/// `dstats` value of a PBI read request.
const DSTATS_READ: u8 = 0x40;
/// `dstats` value of a PBI write request.
const DSTATS_WRITE: u8 = 0x80;

const PERCOM_SIZE: usize = 12;
const STATUS_SIZE: usize = 4;

/// Guest addresses read for the fixed disk.
const FIXED_INFO_ADDR: u16 = 0xDFA0;
const FIXED_INFO_SIZE: usize = 0x60;
const FIXED_STATUS_ADDR: u16 = 0xDFAD;

bitflags! {
    /// First byte of the get-status reply.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DriveStatus: u8 {
        const WRITE_PROTECT = 0x08;
        const MOTOR_ON = 0x10;
        /// 256-byte sectors.
        const DOUBLE_DENSITY = 0x20;
        /// Fixed disk ready.
        const FIXED_READY = 0x40;
        /// Anything but a 720-sector disk.
        const ENHANCED_DENSITY = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    Speed,
    Format,
    ForceMediaChange,
    ReadPercom,
    GetStatus,
    Write,
    Read,
    DeviceInfo,
}

/// Unit addressed by a selector: the fixed disk or a 1-based drive number.
#[must_use]
pub fn unit_for(selector: DeviceSelector) -> Option<usize> {
    if selector.is_fixed_disk() {
        Some(FIXED_UNIT)
    } else {
        selector.unit_index()
    }
}

/// Looks up the handler for `command` on `unit`.
///
/// `dstats` is the transfer direction from the PBI request block; the wire
/// path passes 0.
#[must_use]
pub fn resolve(command: &SioCommand, dstats: u8, unit: &DriveUnit) -> Option<Handler> {
    let device = command.device;
    let pbi = device.is_pbi();
    let writable = !unit.is_read_only();
    let first = device.first_sector();
    let sector = command.sector();
    let in_range = sector >= first && sector - first < unit.sector_count();

    let handler = match command.command {
        codes::SPEED if !pbi => Handler::Speed,
        codes::FORMAT | codes::FORMAT_ENHANCED if writable && !pbi => Handler::Format,
        codes::FORCE_MEDIA_CHANGE if pbi => Handler::ForceMediaChange,
        codes::READ_PERCOM if first != 0 => Handler::ReadPercom,
        codes::STATUS if !pbi || dstats == DSTATS_READ => Handler::GetStatus,
        codes::WRITE | codes::WRITE_VERIFY
            if writable && (!pbi || dstats == DSTATS_WRITE) && in_range =>
        {
            Handler::Write
        }
        codes::READ if (!pbi || dstats == DSTATS_READ) && in_range => Handler::Read,
        codes::DEVICE_INFO if pbi && dstats == DSTATS_READ => Handler::DeviceInfo,
        _ => return None,
    };
    Some(handler)
}

/// Everything a handler may touch.
pub struct HandlerContext<'a, 'g> {
    pub registry: &'a mut DriveRegistry,
    pub clock: &'a dyn Clock,
    pub config: &'a EmulatorConfig,
    /// Guest memory, available on the PBI path.
    pub guest: Option<&'a mut (dyn GuestMemory + 'g)>,
}

impl HandlerContext<'_, '_> {
    /// Runs `handler` for `command` on `unit`, filling in `action`.
    ///
    /// Write data is expected in `action.buffer`; the wire path receives it
    /// before calling here.
    pub fn execute(&mut self, handler: Handler, command: &SioCommand, unit: usize, action: &mut SioAction) {
        debug!(?handler, unit, sector = command.sector(), "dispatch");
        match handler {
            Handler::Speed => self.speed(command, unit, action),
            Handler::Format => self.format(unit, action),
            Handler::ForceMediaChange => self.force_media_change(action),
            Handler::ReadPercom => self.read_percom(unit, action),
            Handler::GetStatus => self.get_status(unit, action),
            Handler::Write => self.write(command, unit, action),
            Handler::Read => self.read(command, unit, action),
            Handler::DeviceInfo => self.device_info(unit, action),
        }
    }

    fn speed(&mut self, command: &SioCommand, unit: usize, action: &mut SioAction) {
        let flux = self
            .registry
            .unit(unit)
            .is_some_and(|u| u.kind() == ImageKind::FluxLevel);
        let configured = usize::from(self.config.speed_index).min(SPEED_COUNT - 1);

        // Flux-level timing only holds at the standard rate.
        let (reply, applied) = if flux {
            (SPEEDS[0], 0)
        } else if command.aux2 != 0 {
            (SPEEDS[configured], 0)
        } else {
            (SPEEDS[configured], configured)
        };
        action.buffer[0] = reply;
        action.bytes = 1;
        action.divisor = Some(SPEEDS[applied] + DIVISOR_BIAS);
    }

    fn format(&mut self, unit: usize, action: &mut SioAction) {
        let size = self.registry.unit(unit).map_or(0, |u| usize::from(u.sector_size()));
        if let Err(err) = self.registry.format(unit) {
            warn!(unit, %err, "format failed");
            action.success = false;
        }
        action.buffer.fill(0);
        action.buffer[0] = 0xFF;
        action.buffer[1] = 0xFF;
        action.bytes = size;
    }

    fn force_media_change(&mut self, action: &mut SioAction) {
        action.respond = false;
        if let Err(err) = self.registry.partition_scan() {
            warn!(%err, "media change rescan failed");
            action.success = false;
        }
    }

    fn read_percom(&mut self, unit: usize, action: &mut SioAction) {
        let Some(drive) = self.registry.unit(unit) else {
            action.success = false;
            return;
        };
        action.buffer[..PERCOM_SIZE].copy_from_slice(&percom_block(drive));
        action.bytes = PERCOM_SIZE;
    }

    fn get_status(&mut self, unit: usize, action: &mut SioAction) {
        let Some(drive) = self.registry.unit(unit) else {
            action.success = false;
            return;
        };
        let fixed = unit == FIXED_UNIT;
        let status = if fixed {
            DriveStatus::FIXED_READY
        } else {
            let mut status = DriveStatus::MOTOR_ON;
            status.set(DriveStatus::WRITE_PROTECT, drive.is_read_only());
            status.set(DriveStatus::ENHANCED_DENSITY, drive.sector_count() != 720);
            status.set(DriveStatus::DOUBLE_DENSITY, drive.sector_size() != 128);
            status
        };

        action.buffer[0] = status.bits();
        action.buffer[1] = drive.status();
        action.buffer[2] = if fixed { 0x10 } else { 0xE0 };
        action.buffer[3] = match (&mut self.guest, fixed) {
            (Some(guest), true) => guest.read_byte(FIXED_STATUS_ADDR),
            _ => 0,
        };
        action.bytes = STATUS_SIZE;
    }

    fn write(&mut self, command: &SioCommand, unit: usize, action: &mut SioAction) {
        action.respond = false;
        let verify = command.command == codes::WRITE_VERIFY;
        let sector = command.sector();
        let Some(size) = self.registry.unit(unit).map(|u| u.transfer_size(sector)) else {
            action.success = false;
            return;
        };
        match self
            .registry
            .write_sector(unit, sector, &action.buffer[..size], verify)
        {
            Ok(ok) => action.success = ok,
            Err(err) => {
                warn!(unit, sector, %err, "sector write failed");
                action.success = false;
            }
        }
    }

    fn read(&mut self, command: &SioCommand, unit: usize, action: &mut SioAction) {
        let sector = command.sector();
        action.buffer.fill(0);
        match self.registry.read_sector(
            unit,
            sector,
            self.clock,
            self.config.drive_model,
            &mut action.buffer,
        ) {
            Ok(outcome) => {
                action.bytes = outcome.bytes;
                action.success = outcome.success;
            }
            Err(err) => {
                warn!(unit, sector, %err, "sector read failed");
                action.bytes = self.registry.unit(unit).map_or(0, |u| u.transfer_size(sector));
                action.success = false;
            }
        }
    }

    fn device_info(&mut self, unit: usize, action: &mut SioAction) {
        let Some(drive) = self.registry.unit(unit) else {
            action.success = false;
            return;
        };
        let buf = &mut action.buffer;
        buf.fill(0);
        buf[0] = 1;
        buf[2] = 1;
        buf[6..8].copy_from_slice(&drive.sector_size().to_le_bytes());
        buf[8..12].copy_from_slice(&drive.sector_count().to_le_bytes());

        if unit == FIXED_UNIT {
            if let Some(guest) = self.guest.as_mut() {
                let mut info = [0u8; FIXED_INFO_SIZE];
                guest.read(FIXED_INFO_ADDR, &mut info);
                copy_counted(&info, 0x0E, &mut buf[0x10..]);
                copy_counted(&info, 0x37, &mut buf[0x38..]);
            }
            return;
        }

        buf[3..5].copy_from_slice(&drive.partition_id().to_le_bytes());
        let block = drive.offset() >> 9;
        buf[12..15].copy_from_slice(&block.to_le_bytes()[..3]);

        if drive.flags().contains(UnitFlags::META) {
            let meta = drive.meta_offset() + 16;
            if let Err(err) = self.registry.read_raw(unit, meta, &mut buf[0x10..0x38]) {
                warn!(unit, %err, "partition name unreadable");
                action.success = false;
            }
        }
    }
}

/// Copies the string whose length byte sits at `info[len_at]` and whose
/// text follows it.
fn copy_counted(info: &[u8], len_at: usize, dst: &mut [u8]) {
    let start = len_at + 1;
    let len = usize::from(info[len_at])
        .min(info.len() - start)
        .min(dst.len());
    dst[..len].copy_from_slice(&info[start..start + len]);
}

/// PERCOM configuration block describing the unit's geometry.
///
/// ```text
/// 0    tracks           4    sides - 1
/// 1    step rate (3)    5    density flags (4 = MFM)
/// 2-3  sectors/track    6-7  bytes/sector (big-endian)
///                       8    drive present ($FF)
/// ```
#[must_use]
pub fn percom_block(unit: &DriveUnit) -> [u8; PERCOM_SIZE] {
    let mut block = [0u8; PERCOM_SIZE];
    let size = unit.sector_size();
    let mut per_track = unit.sector_count();

    block[1] = 0x03;
    block[6..8].copy_from_slice(&size.to_be_bytes());
    block[8] = 0xFF;

    if !unit.is_fixed() && matches!(per_track, 720 | 1040 | 1440) {
        per_track /= 40;
        if per_track == 36 {
            per_track = 18;
            block[4] = 1;
        }
        block[0] = 40;
        block[5] = if size == 256 || per_track == 26 { 4 } else { 0 };
    } else {
        block[0] = 1;
        block[5] = if size == 128 { 0 } else { 4 };
    }
    block[2..4].copy_from_slice(&(per_track as u16).to_be_bytes());
    block
}
