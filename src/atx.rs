//! ATX flux-level disk images and the rotational drive model that serves them.
//!
//! An ATX image records every physical sector the way a real drive saw it:
//! where on the rotation it sits, what FDC status reading it produced, and
//! whether its bits were unstable. Copy-protected software checks exactly
//! those properties, so reads are answered by simulating the drive: the
//! head steps to the track, the rotor position is taken from the wall clock,
//! and the sector copy that would pass under the head first is the one
//! returned, after the time the real mechanism would have needed.
//!
//! ## Container layout (little-endian)
//!
//! ```text
//! file header (48)   "AT8X", version, min version, ..., density @18, start of data @28
//! track record       header (32): size, type, track number @8, sector count @10,
//!                    flags @16 (bit 1 = MFM), header size @20
//!   chunk chain      starts at track + header size, each chunk: size u32, type u8,
//!                    sector index u8, data u16; a zero size ends the chain
//!     sector list    the first chunk; followed by one 8-byte record per sector:
//!                    number, FDC status, position (angular units), data offset
//!     weak data      chunk type 0x10: data = first unstable byte in the sector
//!     long sector    chunk type 0x11: data = size code (128 << code bytes)
//! ```
//!
//! ## Angular units
//!
//! One rotation is 26042 units of 8 µs (208 ms, 288 rpm).

use crate::clock::Clock;
use crate::config::DriveModel;
use crate::drive::ImageIo;
use crate::error::{Result, SioError};
use bitflags::bitflags;
use rand::Rng;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{debug, trace};

/// Angular units in one full disk rotation.
pub const AU_FULL_ROTATION: u32 = 26042;
/// Microseconds per angular unit.
const US_PER_AU: u64 = 8;

/// Track offsets kept per image.
pub const MAX_TRACK: usize = 42;

const ATX_VERSION: u16 = 1;
const FILE_HEADER_SIZE: usize = 48;
const TRACK_HEADER_SIZE: usize = 32;
const RECORD_SIZE: usize = 8;

const TRACK_FLAG_MFM: u32 = 0x02;
const CHUNK_WEAK: u8 = 0x10;
const CHUNK_LONG_SECTOR: u8 = 0x11;

bitflags! {
    /// WD177x status byte as recorded in the image (active high).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FdcStatus: u8 {
        const BUSY = 0x01;
        const DRQ = 0x02;
        const DATA_LOST = 0x04;
        const CRC = 0x08;
        const MISSING = 0x10;
        const RECORD_TYPE = 0x20;
        /// In an image record: the track has extended data for this sector.
        const EXTENDED_DATA = 0x40;
        /// In a returned status: write protect.
        const WRITE_PROTECT = 0x40;
        const RESERVED = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Density {
    Single,
    Medium,
    Double,
}

impl Density {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Single),
            1 => Some(Self::Medium),
            2 => Some(Self::Double),
            _ => None,
        }
    }

    #[must_use]
    pub const fn sectors_per_track(self) -> u8 {
        match self {
            Self::Medium => 26,
            Self::Single | Self::Double => 18,
        }
    }

    #[must_use]
    pub const fn bytes_per_sector(self) -> u16 {
        match self {
            Self::Double => 256,
            Self::Single | Self::Medium => 128,
        }
    }

    /// Sectors on a 40-track disk of this density.
    #[must_use]
    pub const fn sector_count(self) -> u32 {
        match self {
            Self::Medium => 1040,
            Self::Single | Self::Double => 720,
        }
    }

    const fn is_mfm(self) -> bool {
        !matches!(self, Self::Single)
    }
}

/// Mechanism constants for one drive model.
#[derive(Clone, Copy, Debug)]
struct DriveTiming {
    track_step_us: u64,
    head_settle_us: u64,
    /// Time spent spinning before giving up on a sector that is not there.
    missed_rotation_us: u64,
    /// Controller time to verify the sector checksum.
    checksum_calc_us: u64,
    retries: u8,
}

impl DriveTiming {
    const fn for_model(model: DriveModel) -> Self {
        match model {
            DriveModel::Atari810 => Self {
                track_step_us: 5300,
                head_settle_us: 10_000,
                missed_rotation_us: 1_566_000,
                checksum_calc_us: 5136,
                retries: 4,
            },
            DriveModel::Atari1050 => Self {
                track_step_us: 20_120,
                head_settle_us: 20_000,
                missed_rotation_us: 942_000,
                checksum_calc_us: 270,
                retries: 2,
            },
        }
    }
}

/// Rotor angle sampled from the clock.
#[derive(Clone, Copy, Debug)]
struct HeadPosition {
    stamp: u64,
    angle: u16,
}

impl HeadPosition {
    fn sample(clock: &dyn Clock) -> Self {
        let stamp = clock.now_us();
        Self {
            stamp,
            angle: ((stamp >> 3) % u64::from(AU_FULL_ROTATION)) as u16,
        }
    }

    fn wait_from(&self, clock: &dyn Clock, us: u64) {
        clock.wait_until(self.stamp + us);
    }
}

#[derive(Clone, Copy, Debug)]
struct SectorRecord {
    number: u8,
    status: FdcStatus,
    position: u16,
    data_offset: u32,
}

#[derive(Clone, Debug)]
struct Track {
    offset: u64,
    size: u64,
    header_size: u64,
    sectors: Vec<SectorRecord>,
}

/// Outcome of a sector resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtxResult {
    /// Sector found with a clean status.
    Ok,
    /// The drive reported a problem; the buffer may still hold data.
    DiskError,
    /// The image itself could not be read.
    StorageError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorRead {
    pub result: AtxResult,
    /// Inverted FDC status, as the Atari sees it.
    pub status: u8,
}

/// Per-image track index built at mount time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtxIndex {
    density: Density,
    /// File offset of each track record, 0 when absent.
    track_offsets: [u64; MAX_TRACK],
    head_track: u8,
}

impl AtxIndex {
    /// Validates the file header and records the offset of every track.
    pub fn load(image: &mut dyn ImageIo) -> Result<Self> {
        let mut header = [0u8; FILE_HEADER_SIZE];
        read_at(image, 0, &mut header)?;

        if &header[0..4] != b"AT8X" {
            return Err(SioError::CorruptImage("missing ATX signature"));
        }
        if le16(&header[4..]) != ATX_VERSION || le16(&header[6..]) != ATX_VERSION {
            return Err(SioError::Unsupported("ATX version"));
        }
        let density =
            Density::from_byte(header[18]).ok_or(SioError::Unsupported("ATX density"))?;

        let mut track_offsets = [0u64; MAX_TRACK];
        let mut offset = u64::from(le32(&header[28..]));
        for slot in &mut track_offsets {
            let mut track_header = [0u8; TRACK_HEADER_SIZE];
            if read_at(image, offset, &mut track_header).is_err() {
                break;
            }
            *slot = offset;
            let size = u64::from(le32(&track_header));
            if size == 0 {
                break;
            }
            offset += size;
        }

        debug!(?density, "ATX image indexed");
        Ok(Self {
            density,
            track_offsets,
            head_track: 0,
        })
    }

    #[must_use]
    pub const fn density(&self) -> Density {
        self.density
    }

    #[must_use]
    pub const fn sectors_per_track(&self) -> u8 {
        self.density.sectors_per_track()
    }

    #[must_use]
    pub const fn bytes_per_sector(&self) -> u16 {
        self.density.bytes_per_sector()
    }

    #[must_use]
    pub const fn head_track(&self) -> u8 {
        self.head_track
    }

    /// Resolves absolute sector `sector` (1-based) against the simulated
    /// drive, filling `buf` with the sector payload.
    ///
    /// Blocks on `clock` for the full mechanical latency of the request,
    /// including step, rotation, retries and checksum time.
    pub fn read_sector(
        &mut self,
        image: &mut dyn ImageIo,
        clock: &dyn Clock,
        model: DriveModel,
        sector: u32,
        buf: &mut [u8],
    ) -> SectorRead {
        let timing = DriveTiming::for_model(model);
        let is_1050 = model.is_1050();
        let per_track = u32::from(self.sectors_per_track());
        let index = sector.saturating_sub(1);
        let target_track = (index / per_track).min(u32::from(u8::MAX)) as u8;
        let target_sector = (index % per_track + 1) as u8;
        let nominal = usize::from(self.bytes_per_sector()).min(buf.len());
        buf[..nominal].fill(0);

        self.step_to(target_track, clock, &timing, is_1050);
        let mut head = HeadPosition::sample(clock);

        let mut storage_failed = false;
        let track = match self.load_track(image, target_track) {
            Ok(track) => track,
            Err(err) => {
                debug!(target_track, %err, "ATX track unreadable");
                storage_failed = true;
                None
            }
        };

        let mut status = FdcStatus::MISSING;
        let mut data_read = false;
        let mut weak_offset = None;

        for attempt in 0..timing.retries {
            let retries_left = timing.retries - 1 - attempt;
            weak_offset = None;
            data_read = false;

            let chosen = track
                .as_ref()
                .and_then(|t| pick_sector(&t.sectors, target_sector, head.angle));

            match (chosen, track.as_ref()) {
                (Some((index, record, distance)), Some(track)) => {
                    status = record.status;
                    let mut actual_size = usize::from(self.bytes_per_sector());

                    if status.contains(FdcStatus::EXTENDED_DATA) {
                        match scan_chunks(image, track, index) {
                            Ok(ext) => {
                                weak_offset = ext.weak_offset;
                                if let Some(long) = ext.long_size {
                                    // 1050 waits for long sectors, 810 cuts short ones.
                                    if (is_1050 && long > actual_size)
                                        || (!is_1050 && long < actual_size)
                                    {
                                        actual_size = long;
                                    }
                                }
                            }
                            Err(_) => storage_failed = true,
                        }
                    }

                    let data_at = track.offset + u64::from(record.data_offset);
                    match read_at(image, data_at, &mut buf[..nominal]) {
                        Ok(()) => data_read = true,
                        Err(_) => storage_failed = true,
                    }

                    let au_per_byte = if self.density == Density::Single { 8 } else { 4 };
                    let au_read = (23 + actual_size as u64) * au_per_byte + 2;
                    head.wait_from(clock, (au_read + distance) * US_PER_AU);

                    if !status.is_empty() {
                        clock.wait_us(u64::from(AU_FULL_ROTATION) * US_PER_AU);
                    }
                }
                _ => {
                    head.wait_from(clock, timing.missed_rotation_us);
                    if is_1050 || retries_left == 2 {
                        self.reseek(target_track, clock, &timing, is_1050);
                    }
                }
            }

            head = HeadPosition::sample(clock);
            trace!(sector, attempt, status = status.bits(), "ATX attempt");

            if status.is_empty() || storage_failed {
                break;
            }
        }

        status.remove(FdcStatus::RESERVED | FdcStatus::EXTENDED_DATA);
        if status.contains(FdcStatus::DATA_LOST) {
            if is_1050 {
                status.insert(FdcStatus::DRQ);
            } else {
                // The 810 controller has no lost-data signal.
                status.remove(FdcStatus::DATA_LOST | FdcStatus::CRC);
                status.insert(FdcStatus::BUSY);
            }
        }
        if !is_1050 && status.contains(FdcStatus::RECORD_TYPE) {
            status.insert(FdcStatus::WRITE_PROTECT);
        }

        let result = if storage_failed {
            AtxResult::StorageError
        } else if data_read && status.is_empty() {
            AtxResult::Ok
        } else {
            AtxResult::DiskError
        };

        if let Some(offset) = weak_offset.filter(|_| data_read) {
            if offset < nominal {
                rand::thread_rng().fill(&mut buf[offset..nominal]);
            }
        }

        head.wait_from(clock, timing.checksum_calc_us);

        SectorRead {
            result,
            status: !status.bits(),
        }
    }

    fn step_to(&mut self, target: u8, clock: &dyn Clock, timing: &DriveTiming, is_1050: bool) {
        let current = self.head_track;
        if target != current {
            let distance = if target > current {
                u64::from(target - current) + u64::from(is_1050)
            } else {
                u64::from(current - target)
            };
            clock.wait_us(distance * timing.track_step_us + timing.head_settle_us);
        }
        self.head_track = target;
    }

    /// Recalibration after a failed search: the head travels back out to
    /// track 0 and steps in again.
    fn reseek(&self, target: u8, clock: &dyn Clock, timing: &DriveTiming, is_1050: bool) {
        let target = u64::from(target);
        if !is_1050 {
            clock.wait_us((43 + target) * timing.track_step_us + timing.head_settle_us);
        } else if target != 0 {
            clock.wait_us((2 * target + 1) * timing.track_step_us + timing.head_settle_us);
        }
    }

    /// Reads the track record and its sector list. `None` when the track is
    /// absent or does not match the requested number/density.
    fn load_track(&self, image: &mut dyn ImageIo, track_number: u8) -> io::Result<Option<Track>> {
        let offset = match self.track_offsets.get(usize::from(track_number)) {
            Some(&offset) if offset != 0 => offset,
            _ => return Ok(None),
        };

        let mut header = [0u8; TRACK_HEADER_SIZE];
        read_at(image, offset, &mut header)?;
        let sector_count = usize::from(le16(&header[10..]));
        let flags = le32(&header[16..]);
        let header_size = u64::from(le32(&header[20..]));

        let mut track = Track {
            offset,
            size: u64::from(le32(&header)),
            header_size,
            sectors: Vec::new(),
        };

        if header[8] != track_number || ((flags & TRACK_FLAG_MFM) != 0) != self.density.is_mfm() {
            return Ok(Some(track));
        }

        let mut list_header = [0u8; RECORD_SIZE];
        let list_at = offset + header_size;
        read_at(image, list_at, &mut list_header)?;
        // The list header may be longer than 8 bytes; records sit at its end.
        let list_size = u64::from(le32(&list_header));
        let records_at = (list_at + list_size).saturating_sub((sector_count * RECORD_SIZE) as u64);

        let mut raw = vec![0u8; sector_count * RECORD_SIZE];
        read_at(image, records_at, &mut raw)?;
        track.sectors = raw
            .chunks_exact(RECORD_SIZE)
            .map(|r| SectorRecord {
                number: r[0],
                status: FdcStatus::from_bits_retain(r[1]),
                position: le16(&r[2..]),
                data_offset: le32(&r[4..]),
            })
            .collect();

        Ok(Some(track))
    }
}

/// Picks the copy of `number` that passes under the head soonest.
///
/// Copies still ahead of the head (positive distance) win over ones that
/// already passed; within each group the smallest signed distance wins, and
/// the first record wins a tie. Returns the record index, the record and the
/// distance in angular units until it arrives.
fn pick_sector(
    sectors: &[SectorRecord],
    number: u8,
    angle: u16,
) -> Option<(usize, SectorRecord, u64)> {
    sectors
        .iter()
        .enumerate()
        .filter(|(_, r)| r.number == number && !r.status.contains(FdcStatus::MISSING))
        .map(|(i, r)| (i, *r, i32::from(r.position) - i32::from(angle)))
        .min_by_key(|&(i, _, delta)| (delta <= 0, delta, i))
        .map(|(i, r, delta)| {
            let distance = if delta > 0 {
                delta
            } else {
                delta + AU_FULL_ROTATION as i32
            };
            (i, r, distance.max(0) as u64)
        })
}

#[derive(Default)]
struct ExtendedData {
    weak_offset: Option<usize>,
    long_size: Option<usize>,
}

/// Walks the track's chunk chain looking for records about `sector_index`.
fn scan_chunks(image: &mut dyn ImageIo, track: &Track, sector_index: usize) -> io::Result<ExtendedData> {
    let mut ext = ExtendedData::default();
    let end = track.offset + track.size;
    let mut at = track.offset + track.header_size;

    while at < end {
        let mut chunk = [0u8; RECORD_SIZE];
        read_at(image, at, &mut chunk)?;
        let size = u64::from(le32(&chunk));
        if size == 0 {
            break;
        }
        if usize::from(chunk[5]) == sector_index {
            let data = le16(&chunk[6..]);
            match chunk[4] {
                CHUNK_WEAK => ext.weak_offset = Some(usize::from(data)),
                CHUNK_LONG_SECTOR => ext.long_size = Some(128usize << data.min(3)),
                _ => {}
            }
        }
        at += size;
    }

    Ok(ext)
}

fn read_at(image: &mut dyn ImageIo, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    image.seek(SeekFrom::Start(offset))?;
    image.read_exact(buf)
}

fn le16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
