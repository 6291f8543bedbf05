//! Drive unit registry: mounted images, their geometry and sector addressing.
//!
//! ## Unit numbering
//!
//! | Index | Unit                                                     |
//! |-------|----------------------------------------------------------|
//! | 0-14  | Removable drives D1: .. D15:, or partitions of the fixed disk |
//! | 15    | Fixed disk (device id 0x20, sectors counted from 0)      |
//!
//! Only the first four removable units are reachable over the SIO wire; the
//! rest, the fixed disk and its partitions are served through the PBI bridge.
//!
//! ## Sector addressing
//!
//! | Unit kind                    | Byte offset of sector n                  | Size |
//! |------------------------------|------------------------------------------|------|
//! | Fixed disk                   | `base + n * 512`                         | 512  |
//! | Partition, 512-byte floppies | `base + (n - 1) * 512`                   | 512  |
//! | Floppy, n <= 3               | `base + (n - 1) * 128`                   | 128  |
//! | Floppy, n > 3                | `base + 384 + (n - 4) * sector_size`     | sector_size |
//!
//! Partitions with sectors smaller than 512 bytes still occupy one 512-byte
//! block per sector; the payload is spread across the block at a stride of
//! `512 / sector_size`.

use crate::apt::{self, Partition, PartitionTable, Slot, SLOT_COUNT};
use crate::atx::{AtxIndex, AtxResult, Density};
use crate::clock::Clock;
use crate::command::SECTOR_BUFFER_SIZE;
use crate::config::DriveModel;
use crate::error::{Result, SioError};
use crate::xex;
use bitflags::bitflags;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Logical units, removable plus the fixed disk.
pub const UNIT_COUNT: usize = 16;
/// Index of the fixed disk.
pub const FIXED_UNIT: usize = 15;

const ATR_HEADER_SIZE: usize = 16;
const ATR_MAGIC: u16 = 0x0296;
/// Storage block of the fixed disk and of 512-byte sector images.
pub const BLOCK_SIZE: usize = 512;
/// Boot sectors 1-3 of a floppy are always 128 bytes.
const BOOT_SECTORS: u32 = 3;
const BOOT_SECTOR_SIZE: usize = 128;

/// Random-access storage behind a mounted image.
pub trait ImageIo: Read + Write + Seek {
    fn size(&mut self) -> io::Result<u64> {
        let current = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(current))?;
        Ok(end)
    }
}

impl ImageIo for File {}
impl ImageIo for Cursor<Vec<u8>> {}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UnitFlags: u8 {
        /// Sectors smaller than the 512-byte block they are stored in.
        const SMALL_SECTOR = 0x10;
        /// Partition carries a metadata sector (name etc.).
        const META = 0x20;
        const READ_ONLY = 0x40;
        /// Fixed disk or one of its partitions.
        const FIXED = 0x80;
    }
}

/// Image file type, usually taken from the extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageHint {
    /// Sector image with a 16-byte header (also raw fixed-disk images).
    Atr,
    /// Headerless 128-byte sector image.
    Xdf,
    /// Atari executable served as a synthetic disk.
    Xex,
    /// Flux-level image.
    Atx,
}

impl ImageHint {
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "atr" | "img" => Some(Self::Atr),
            "xdf" => Some(Self::Xdf),
            "xex" | "com" | "exe" => Some(Self::Xex),
            "atx" => Some(Self::Atx),
            _ => None,
        }
    }

    const fn forces_read_only(self) -> bool {
        matches!(self, Self::Xex | Self::Atx)
    }
}

/// Format tag of a mounted unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitFormat {
    Plain,
    FastLoader,
    FluxLevel(AtxIndex),
    Fixed,
    Partition,
}

/// Serialisable summary of [`UnitFormat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Plain,
    FastLoader,
    FluxLevel,
    Fixed,
    Partition,
}

impl UnitFormat {
    #[must_use]
    pub const fn kind(&self) -> ImageKind {
        match self {
            Self::Plain => ImageKind::Plain,
            Self::FastLoader => ImageKind::FastLoader,
            Self::FluxLevel(_) => ImageKind::FluxLevel,
            Self::Fixed => ImageKind::Fixed,
            Self::Partition => ImageKind::Partition,
        }
    }
}

/// Geometry and state of one mounted unit.
#[derive(Clone, Debug)]
pub struct DriveUnit {
    format: UnitFormat,
    name: String,
    sector_size: u16,
    sector_count: u32,
    offset: u64,
    flags: UnitFlags,
    /// Last FDC status, reported by get-status.
    status: u8,
    partition_id: u16,
    meta_offset: u64,
}

impl DriveUnit {
    fn new(format: UnitFormat, name: &str, sector_size: u16, sector_count: u32) -> Self {
        Self {
            format,
            name: name.to_owned(),
            sector_size,
            sector_count,
            offset: 0,
            flags: UnitFlags::empty(),
            status: 0xFF,
            partition_id: 0,
            meta_offset: 0,
        }
    }

    fn from_partition(part: &Partition, fixed_read_only: bool) -> Self {
        let mut flags = UnitFlags::FIXED;
        flags.set(UnitFlags::READ_ONLY, fixed_read_only || part.read_only);
        flags.set(UnitFlags::META, part.has_meta);
        flags.set(UnitFlags::SMALL_SECTOR, usize::from(part.sector_size) != BLOCK_SIZE);
        Self {
            offset: part.offset,
            flags,
            partition_id: part.partition_id,
            meta_offset: part.meta_offset,
            ..Self::new(UnitFormat::Partition, "", part.sector_size, part.sector_count)
        }
    }

    #[must_use]
    pub const fn format(&self) -> &UnitFormat {
        &self.format
    }

    #[must_use]
    pub const fn kind(&self) -> ImageKind {
        self.format.kind()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn sector_size(&self) -> u16 {
        self.sector_size
    }

    #[must_use]
    pub const fn sector_count(&self) -> u32 {
        self.sector_count
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn flags(&self) -> UnitFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.flags.contains(UnitFlags::READ_ONLY)
    }

    /// Fixed disk or partition.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.flags.contains(UnitFlags::FIXED)
    }

    #[must_use]
    pub const fn status(&self) -> u8 {
        self.status
    }

    #[must_use]
    pub const fn partition_id(&self) -> u16 {
        self.partition_id
    }

    #[must_use]
    pub const fn meta_offset(&self) -> u64 {
        self.meta_offset
    }

    /// Byte offset and stored size of `sector`.
    #[must_use]
    pub fn locate(&self, sector: u32) -> (u64, usize) {
        let sector = u64::from(sector);
        let stored = if self.is_fixed() || self.flags.contains(UnitFlags::SMALL_SECTOR) {
            BLOCK_SIZE
        } else {
            usize::from(self.sector_size)
        };

        if usize::from(self.sector_size) == BLOCK_SIZE || self.is_fixed() {
            let index = match self.format {
                UnitFormat::Fixed => sector,
                _ => sector.saturating_sub(1),
            };
            (self.offset + index * stored as u64, stored)
        } else if sector > u64::from(BOOT_SECTORS) {
            let boot = u64::from(BOOT_SECTORS) * BOOT_SECTOR_SIZE as u64;
            (self.offset + boot + (sector - 4) * stored as u64, stored)
        } else {
            let index = sector.saturating_sub(1);
            (self.offset + index * BOOT_SECTOR_SIZE as u64, BOOT_SECTOR_SIZE)
        }
    }

    /// Payload bytes exchanged with the guest for `sector`.
    #[must_use]
    pub fn transfer_size(&self, sector: u32) -> usize {
        if self.flags.contains(UnitFlags::SMALL_SECTOR) {
            usize::from(self.sector_size)
        } else {
            self.locate(sector).1
        }
    }

    /// Stride between payload bytes inside a 512-byte block.
    fn interleave_step(&self) -> Option<usize> {
        if self.flags.contains(UnitFlags::SMALL_SECTOR) && self.sector_size != 0 {
            Some(BLOCK_SIZE / usize::from(self.sector_size))
        } else {
            None
        }
    }
}

/// Row of [`DriveRegistry::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub unit: usize,
    pub kind: ImageKind,
    pub name: String,
    pub sector_size: u16,
    pub sector_count: u32,
    pub read_only: bool,
    pub status: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_id: Option<u16>,
}

/// Result of a sector read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Payload bytes placed in the buffer.
    pub bytes: usize,
    pub success: bool,
}

/// All logical units and the images behind them.
///
/// Partition units have no image of their own; they read and write through
/// the fixed disk's image.
pub struct DriveRegistry {
    units: [Option<DriveUnit>; UNIT_COUNT],
    images: [Option<Box<dyn ImageIo>>; UNIT_COUNT],
    boot_partition: u8,
    force_read_only: bool,
    boot_loader: Vec<u8>,
}

impl Default for DriveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            units: std::array::from_fn(|_| None),
            images: std::array::from_fn(|_| None),
            boot_partition: 0,
            force_read_only: false,
            boot_loader: Vec::new(),
        }
    }

    /// Mount every image read-only from now on.
    pub fn set_force_read_only(&mut self, force: bool) {
        self.force_read_only = force;
    }

    /// Boot sectors served for fast-loader units (two 128-byte sectors).
    pub fn set_boot_loader(&mut self, loader: Vec<u8>) {
        self.boot_loader = loader;
    }

    #[must_use]
    pub fn unit(&self, unit: usize) -> Option<&DriveUnit> {
        self.units.get(unit)?.as_ref()
    }

    /// Boot partition from the fixed disk's partition table.
    #[must_use]
    pub const fn boot_partition(&self) -> u8 {
        self.boot_partition
    }

    /// True when the unit has its own image open (partitions never do).
    #[must_use]
    pub fn has_own_image(&self, unit: usize) -> bool {
        self.images.get(unit).is_some_and(Option::is_some)
    }

    /// True when the unit can be read: its own image or, for a partition,
    /// the fixed disk's.
    #[must_use]
    pub fn is_open(&self, unit: usize) -> bool {
        match self.unit(unit) {
            Some(drive) if drive.kind() == ImageKind::Partition => self.has_own_image(FIXED_UNIT),
            Some(_) => self.has_own_image(unit),
            None => false,
        }
    }

    /// Opens the file at `path` and mounts it, read-write when possible.
    ///
    /// `hint` names the image format; without one it comes from the file
    /// extension. The fixed unit ignores the format.
    pub fn mount(&mut self, unit: usize, path: &Path, hint: Option<ImageHint>) -> Result<()> {
        let hint = match hint.or_else(|| ImageHint::from_path(path)) {
            Some(hint) => hint,
            None if unit == FIXED_UNIT => ImageHint::Atr,
            None => return Err(SioError::Unsupported("unknown image format")),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (file, writable) = if hint.forces_read_only() || self.force_read_only {
            (File::open(path)?, false)
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => (file, true),
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    (File::open(path)?, false)
                }
                Err(err) => return Err(err.into()),
            }
        };

        self.mount_image(unit, Box::new(file), hint, &name, writable)
    }

    /// Mounts an already-open image. The fixed unit always mounts as a fixed
    /// disk and requires a partition table.
    pub fn mount_image(
        &mut self,
        unit: usize,
        mut image: Box<dyn ImageIo>,
        hint: ImageHint,
        name: &str,
        writable: bool,
    ) -> Result<()> {
        if unit >= UNIT_COUNT {
            return Err(SioError::UnitOutOfRange(unit));
        }
        if unit != FIXED_UNIT && self.unit(unit).is_some_and(|u| u.kind() == ImageKind::Partition) {
            return Err(SioError::PartitionSlot(unit));
        }
        self.unmount(unit)?;

        let read_only = hint.forces_read_only() || !writable || self.force_read_only;
        let size = image.size()?;

        let mut drive = if unit == FIXED_UNIT {
            let mut drive =
                DriveUnit::new(UnitFormat::Fixed, name, BLOCK_SIZE as u16, (size / 512) as u32);
            drive.status = 0;
            drive.flags = UnitFlags::FIXED;
            drive
        } else {
            match hint {
                ImageHint::Atr => mount_atr(image.as_mut(), name)?,
                ImageHint::Xdf => DriveUnit::new(UnitFormat::Plain, name, 128, (size / 128) as u32),
                ImageHint::Xex => DriveUnit::new(
                    UnitFormat::FastLoader,
                    name,
                    xex::SECTOR_SIZE as u16,
                    xex::sector_count(size),
                ),
                ImageHint::Atx => {
                    let index = AtxIndex::load(image.as_mut())?;
                    let density: Density = index.density();
                    DriveUnit::new(
                        UnitFormat::FluxLevel(index),
                        name,
                        density.bytes_per_sector(),
                        density.sector_count(),
                    )
                }
            }
        };
        drive.flags.set(UnitFlags::READ_ONLY, read_only);

        info!(
            unit,
            name,
            kind = ?drive.kind(),
            sector_size = drive.sector_size,
            sector_count = drive.sector_count,
            read_only,
            "image mounted"
        );
        self.units[unit] = Some(drive);
        self.images[unit] = Some(image);

        if unit == FIXED_UNIT {
            if let Err(err) = self.partition_scan() {
                warn!(%err, "fixed disk rejected");
                self.units[FIXED_UNIT] = None;
                self.images[FIXED_UNIT] = None;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Closes the unit's image. Closing the fixed disk also drops every
    /// partition unit. Partition slots are left alone.
    pub fn unmount(&mut self, unit: usize) -> Result<()> {
        if unit >= UNIT_COUNT {
            return Err(SioError::UnitOutOfRange(unit));
        }
        if unit != FIXED_UNIT && self.unit(unit).is_some_and(|u| u.kind() == ImageKind::Partition) {
            return Err(SioError::PartitionSlot(unit));
        }
        if self.images[unit].take().is_some() {
            info!(unit, "image unmounted");
        }
        self.units[unit] = None;

        if unit == FIXED_UNIT {
            for slot in self.units.iter_mut().take(SLOT_COUNT) {
                if slot.as_ref().is_some_and(|u| u.kind() == ImageKind::Partition) {
                    *slot = None;
                }
            }
            self.boot_partition = 0;
        }
        Ok(())
    }

    /// Closes every image.
    pub fn unmount_all(&mut self) {
        self.units = std::array::from_fn(|_| None);
        self.images = std::array::from_fn(|_| None);
        self.boot_partition = 0;
    }

    /// Reads the fixed disk's partition table and rebuilds the partition
    /// units from it.
    pub fn partition_scan(&mut self) -> Result<()> {
        let image = self.images[FIXED_UNIT]
            .as_deref_mut()
            .ok_or(SioError::NotMounted(FIXED_UNIT))?;
        let table = apt::scan(image)?;
        self.apply_partition_table(&table);
        Ok(())
    }

    fn apply_partition_table(&mut self, table: &PartitionTable) {
        let fixed_read_only = self.unit(FIXED_UNIT).is_some_and(DriveUnit::is_read_only);
        if let Some(fixed) = self.units[FIXED_UNIT].as_mut() {
            fixed.flags.set(UnitFlags::META, table.has_meta);
        }
        self.boot_partition = table.boot_partition;

        for (slot, entry) in table.slots.iter().enumerate() {
            let current_is_partition = self.units[slot]
                .as_ref()
                .is_some_and(|u| u.kind() == ImageKind::Partition);
            match entry {
                Slot::Partition(part) => {
                    if self.images[slot].take().is_some() {
                        info!(slot, "removable image replaced by partition");
                    }
                    debug!(slot, id = part.partition_id, offset = part.offset, "partition");
                    self.units[slot] = Some(DriveUnit::from_partition(part, fixed_read_only));
                }
                Slot::Empty | Slot::Invalid if current_is_partition => self.units[slot] = None,
                Slot::Empty | Slot::Invalid => {}
            }
        }
    }

    /// Byte offset and stored size of `sector` on `unit`.
    pub fn address(&self, unit: usize, sector: u32) -> Result<(u64, usize)> {
        self.unit(unit)
            .map(|drive| drive.locate(sector))
            .ok_or(SioError::NotMounted(unit))
    }

    fn parts(&mut self, unit: usize) -> Result<(&mut DriveUnit, &mut dyn ImageIo)> {
        split_unit(&mut self.units, &mut self.images, unit)
    }

    /// Image the unit reads from, resolving partitions to the fixed disk.
    pub fn image_mut(&mut self, unit: usize) -> Result<&mut dyn ImageIo> {
        self.parts(unit).map(|(_, image)| image)
    }

    /// Reads one sector into `buf`, whatever the unit's format.
    ///
    /// Flux-level reads block on `clock` for the simulated mechanism and
    /// update the unit's status byte.
    pub fn read_sector(
        &mut self,
        unit: usize,
        sector: u32,
        clock: &dyn Clock,
        model: DriveModel,
        buf: &mut [u8],
    ) -> Result<ReadOutcome> {
        let (drive, image) = split_unit(&mut self.units, &mut self.images, unit)?;
        match drive.format {
            UnitFormat::FastLoader => {
                let total = drive.sector_count;
                let bytes =
                    xex::read_sector(image, &drive.name, total, &self.boot_loader, sector, buf)?;
                Ok(ReadOutcome { bytes, success: true })
            }
            UnitFormat::FluxLevel(ref mut index) => {
                let read = index.read_sector(image, clock, model, sector, buf);
                drive.status = read.status;
                Ok(ReadOutcome {
                    bytes: usize::from(drive.sector_size),
                    success: read.result == AtxResult::Ok,
                })
            }
            UnitFormat::Plain | UnitFormat::Fixed | UnitFormat::Partition => {
                let (location, stored) = drive.locate(sector);
                image.seek(SeekFrom::Start(location))?;
                match drive.interleave_step() {
                    Some(step) => {
                        let mut block = [0u8; BLOCK_SIZE];
                        read_up_to(image, &mut block)?;
                        let size = usize::from(drive.sector_size).min(buf.len());
                        for (n, byte) in buf[..size].iter_mut().enumerate() {
                            *byte = block[n * step];
                        }
                        Ok(ReadOutcome { bytes: size, success: true })
                    }
                    None => {
                        let size = stored.min(buf.len());
                        read_up_to(image, &mut buf[..size])?;
                        Ok(ReadOutcome { bytes: size, success: true })
                    }
                }
            }
        }
    }

    /// Writes one sector. With `verify` the sector is read back and compared;
    /// the result is false on a mismatch.
    pub fn write_sector(&mut self, unit: usize, sector: u32, data: &[u8], verify: bool) -> Result<bool> {
        let (drive, image) = self.parts(unit)?;
        if drive.is_read_only() {
            return Err(SioError::Unsupported("write to read-only unit"));
        }
        if matches!(drive.format, UnitFormat::FastLoader | UnitFormat::FluxLevel(_)) {
            return Err(SioError::Unsupported("write to synthetic image"));
        }

        let (location, stored) = drive.locate(sector);
        let size = drive.transfer_size(sector).min(data.len());
        let step = drive.interleave_step();

        image.seek(SeekFrom::Start(location))?;
        match step {
            Some(step) => {
                let mut block = [0u8; BLOCK_SIZE];
                for (n, &byte) in data[..size].iter().enumerate() {
                    block[n * step] = byte;
                }
                image.write_all(&block)?;
            }
            None => image.write_all(&data[..size.min(stored)])?,
        }
        image.flush()?;

        if !verify {
            return Ok(true);
        }

        let mut stored_bytes = [0u8; SECTOR_BUFFER_SIZE];
        image.seek(SeekFrom::Start(location))?;
        let matches = match step {
            Some(step) => {
                read_up_to(image, &mut stored_bytes)?;
                data[..size]
                    .iter()
                    .enumerate()
                    .all(|(n, &byte)| stored_bytes[n * step] == byte)
            }
            None => {
                read_up_to(image, &mut stored_bytes[..size])?;
                stored_bytes[..size] == data[..size]
            }
        };
        if !matches {
            warn!(unit, sector, "write verify mismatch");
        }
        Ok(matches)
    }

    /// Zeroes the unit's data area.
    pub fn format(&mut self, unit: usize) -> Result<()> {
        let (drive, image) = self.parts(unit)?;
        if drive.is_read_only() {
            return Err(SioError::Unsupported("format of read-only unit"));
        }
        let end = if drive.kind() == ImageKind::Partition {
            // Each partition sector fills one block of the fixed disk.
            let span = drive.offset + u64::from(drive.sector_count) * BLOCK_SIZE as u64;
            span.min(image.size()?)
        } else {
            image.size()?
        };
        let mut at = drive.offset;
        image.seek(SeekFrom::Start(at))?;
        let zeros = [0u8; BOOT_SECTOR_SIZE];
        while at < end {
            let len = (end - at).min(BOOT_SECTOR_SIZE as u64) as usize;
            image.write_all(&zeros[..len])?;
            at += len as u64;
        }
        image.flush()?;
        info!(unit, "unit formatted");
        Ok(())
    }

    /// Reads `buf.len()` bytes from the unit's image at an absolute offset.
    pub fn read_raw(&mut self, unit: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let image = self.image_mut(unit)?;
        image.seek(SeekFrom::Start(offset))?;
        image.read_exact(buf)?;
        Ok(())
    }

    /// Summary of every mounted unit.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        self.units
            .iter()
            .enumerate()
            .filter_map(|(unit, drive)| drive.as_ref().map(|d| (unit, d)))
            .map(|(unit, drive)| UnitSnapshot {
                unit,
                kind: drive.kind(),
                name: drive.name.clone(),
                sector_size: drive.sector_size,
                sector_count: drive.sector_count,
                read_only: drive.is_read_only(),
                status: drive.status,
                partition_id: (drive.kind() == ImageKind::Partition).then_some(drive.partition_id),
            })
            .collect()
    }
}

/// Unit metadata plus the image it reads from.
fn split_unit<'a>(
    units: &'a mut [Option<DriveUnit>; UNIT_COUNT],
    images: &'a mut [Option<Box<dyn ImageIo>>; UNIT_COUNT],
    unit: usize,
) -> Result<(&'a mut DriveUnit, &'a mut dyn ImageIo)> {
    let drive = units
        .get_mut(unit)
        .ok_or(SioError::UnitOutOfRange(unit))?
        .as_mut()
        .ok_or(SioError::NotMounted(unit))?;
    let source = if drive.kind() == ImageKind::Partition {
        FIXED_UNIT
    } else {
        unit
    };
    let image = images[source]
        .as_deref_mut()
        .ok_or(SioError::NotMounted(unit))?;
    Ok((drive, image))
}

/// Parses the ATR header at the start of `image`.
fn mount_atr(image: &mut dyn ImageIo, name: &str) -> Result<DriveUnit> {
    let mut header = [0u8; ATR_HEADER_SIZE];
    image.seek(SeekFrom::Start(0))?;
    image.read_exact(&mut header)?;

    if u16::from_le_bytes([header[0], header[1]]) != ATR_MAGIC {
        return Err(SioError::CorruptImage("missing ATR signature"));
    }
    let paragraphs = u32::from(u16::from_le_bytes([header[2], header[3]])) | u32::from(header[6]) << 16;
    let sector_size = u16::from_le_bytes([header[4], header[5]]);

    let sector_count = match sector_size {
        512 => paragraphs / 32,
        128 | 256 => {
            let bytes = (paragraphs * 16).saturating_sub(BOOT_SECTORS * BOOT_SECTOR_SIZE as u32);
            BOOT_SECTORS + bytes / u32::from(sector_size)
        }
        _ => return Err(SioError::Unsupported("ATR sector size")),
    };

    let mut drive = DriveUnit::new(UnitFormat::Plain, name, sector_size, sector_count);
    drive.offset = ATR_HEADER_SIZE as u64;
    Ok(drive)
}

/// Reads until `buf` is full or the image ends; the tail is zeroed.
pub(crate) fn read_up_to(image: &mut dyn ImageIo, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match image.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    buf[filled..].fill(0);
    Ok(filled)
}
