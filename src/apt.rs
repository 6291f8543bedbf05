//! APT partition table found on fixed-disk images.
//!
//! ## Table layout (256 bytes)
//!
//! ```text
//! 0x00      version/flags (0x00, or 0x10 = partitions carry metadata sectors)
//! 0x01-0x03 "APT"
//! 0x04      low nibble: boot partition
//! 0x10-0xFF 15 rows of 16 bytes, one per partition slot
//! ```
//!
//! ## Row layout
//!
//! | Offset | Size | Field                                                   |
//! |--------|------|---------------------------------------------------------|
//! | 0      | 1    | size code (1-3 -> 128/256/512), 0x40 meta, 0x30 RO bits |
//! | 1      | 1    | kind: 0x00 DOS partition, 0x03 external partition       |
//! | 2      | 4    | start block (512-byte units)                            |
//! | 6      | 4    | sector count                                            |
//! | 10     | 2    | partition id                                            |
//! | 12     | 1    | flags: 0x80 read-only, 0x40 enabled                     |
//! | 13     | 3    | external: metadata block; DOS: byte 14-15 = data skip   |
//!
//! A row whose first byte is zero is an empty slot.
//!
//! When the first 256 bytes do not carry the signature the image is taken to
//! start with an MBR; the second half of sector 0 is searched for a partition
//! entry of type 0x7F whose start LBA points at the real table.

use crate::drive::ImageIo;
use crate::error::{Result, SioError};
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, warn};

pub const TABLE_SIZE: usize = 256;
pub const SLOT_COUNT: usize = 15;

const ROW_SIZE: usize = 16;
const MBR_TYPE_APT: u8 = 0x7F;
/// Partition-type byte of the first MBR entry, relative to the second half of sector 0.
const MBR_SCAN_START: usize = 0xC2;

const KIND_DOS: u8 = 0x00;
const KIND_EXTERNAL: u8 = 0x03;

const ROW_READ_ONLY: u8 = 0x80;
const ROW_ENABLED: u8 = 0x40;

/// One populated partition slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub sector_size: u16,
    /// Byte offset of sector 1 inside the image.
    pub offset: u64,
    pub sector_count: u32,
    pub partition_id: u16,
    /// Byte offset of the partition's metadata sector.
    pub meta_offset: u64,
    pub read_only: bool,
    pub has_meta: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Row flag byte unset.
    Empty,
    /// Row present but malformed or disabled.
    Invalid,
    Partition(Partition),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTable {
    /// Header says partitions carry metadata sectors.
    pub has_meta: bool,
    pub boot_partition: u8,
    pub slots: [Slot; SLOT_COUNT],
}

/// Locates and parses the partition table of a fixed-disk image.
pub fn scan(image: &mut dyn ImageIo) -> Result<PartitionTable> {
    let mut table = [0u8; TABLE_SIZE];
    image.seek(SeekFrom::Start(0))?;
    image.read_exact(&mut table)?;

    if !has_signature(&table) {
        // Second half of the MBR sector.
        image.read_exact(&mut table)?;
        let lba = find_indirect_lba(&table).ok_or(SioError::NoPartitionTable)?;
        let offset = u64::from(lba) << 9;
        debug!(offset, "following MBR entry to partition table");
        image.seek(SeekFrom::Start(offset))?;
        image.read_exact(&mut table)?;
        if !has_signature(&table) {
            warn!(offset, "MBR entry does not point at a partition table");
            return Err(SioError::NoPartitionTable);
        }
    }

    parse(&table)
}

fn has_signature(table: &[u8; TABLE_SIZE]) -> bool {
    &table[1..4] == b"APT"
}

/// First MBR entry of type 0x7F wins.
fn find_indirect_lba(half: &[u8; TABLE_SIZE]) -> Option<u32> {
    (MBR_SCAN_START..TABLE_SIZE)
        .step_by(ROW_SIZE)
        .find(|&i| half[i] == MBR_TYPE_APT)
        .map(|i| le32(&half[i + 4..i + 8]))
}

/// Parses a table that already carries the signature.
pub fn parse(table: &[u8; TABLE_SIZE]) -> Result<PartitionTable> {
    if !has_signature(table) {
        return Err(SioError::NoPartitionTable);
    }
    let has_meta = match table[0] {
        0x00 => false,
        0x10 => true,
        _ => return Err(SioError::Unsupported("partition table version")),
    };

    let mut slots = [Slot::Empty; SLOT_COUNT];
    for (slot, entry) in slots.iter_mut().enumerate() {
        let start = (slot + 1) * ROW_SIZE;
        let row: &[u8; ROW_SIZE] = table[start..start + ROW_SIZE]
            .try_into()
            .map_err(|_| SioError::CorruptImage("partition row"))?;
        *entry = parse_row(row);
    }

    Ok(PartitionTable {
        has_meta,
        boot_partition: table[4] & 0x0F,
        slots,
    })
}

fn parse_row(row: &[u8; ROW_SIZE]) -> Slot {
    if row[0] == 0 {
        return Slot::Empty;
    }

    let size_code = row[0] & 0x8F;
    let kind = row[1];
    if !(1..=3).contains(&size_code)
        || (kind != KIND_DOS && kind != KIND_EXTERNAL)
        || row[12] & ROW_ENABLED == 0
    {
        return Slot::Invalid;
    }

    let start = u64::from(le32(&row[2..6])) << 9;
    let (offset, meta_offset) = if kind == KIND_DOS {
        let skip = u64::from(u16::from_le_bytes([row[14], row[15]])) << 9;
        (start + skip, start.saturating_sub(512))
    } else {
        let meta = u32::from_le_bytes([row[13], row[14], row[15], 0]);
        (start, u64::from(meta) << 9)
    };

    Slot::Partition(Partition {
        sector_size: 128 << (size_code - 1),
        offset,
        sector_count: le32(&row[6..10]),
        partition_id: u16::from_le_bytes([row[10], row[11]]),
        meta_offset,
        read_only: row[0] & 0x30 != 0 || row[12] & ROW_READ_ONLY != 0,
        has_meta: row[0] & 0x40 != 0,
    })
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Builds a table with the given rows (slot, row bytes).
    pub(crate) fn table_with(rows: &[(usize, [u8; 16])]) -> [u8; TABLE_SIZE] {
        let mut table = [0u8; TABLE_SIZE];
        table[1..4].copy_from_slice(b"APT");
        table[4] = 0x01;
        for (slot, row) in rows {
            let start = (slot + 1) * 16;
            table[start..start + 16].copy_from_slice(row);
        }
        table
    }

    /// External partition with 512-byte sectors.
    pub(crate) fn external_row(start_block: u32, count: u32, id: u16) -> [u8; 16] {
        let mut row = [0u8; 16];
        row[0] = 0x03;
        row[1] = KIND_EXTERNAL;
        row[2..6].copy_from_slice(&start_block.to_le_bytes());
        row[6..10].copy_from_slice(&count.to_le_bytes());
        row[10..12].copy_from_slice(&id.to_le_bytes());
        row[12] = ROW_ENABLED;
        row[13] = 0x02;
        row
    }

    #[test]
    fn test_parse_external_partition() {
        let table = table_with(&[(0, external_row(4, 100, 0x1234))]);
        let parsed = parse(&table).unwrap();
        assert!(!parsed.has_meta);
        assert_eq!(parsed.boot_partition, 1);
        assert_eq!(
            parsed.slots[0],
            Slot::Partition(Partition {
                sector_size: 512,
                offset: 4 * 512,
                sector_count: 100,
                partition_id: 0x1234,
                meta_offset: 2 * 512,
                read_only: false,
                has_meta: false,
            })
        );
        assert_eq!(parsed.slots[1], Slot::Empty);
    }

    #[test]
    fn test_parse_dos_partition() {
        let mut row = [0u8; 16];
        row[0] = 0x41; // 128-byte sectors, metadata
        row[1] = KIND_DOS;
        row[2..6].copy_from_slice(&10u32.to_le_bytes());
        row[6..10].copy_from_slice(&720u32.to_le_bytes());
        row[12] = ROW_ENABLED | ROW_READ_ONLY;
        row[14] = 0x01;
        let parsed = parse(&table_with(&[(2, row)])).unwrap();
        match parsed.slots[2] {
            Slot::Partition(p) => {
                assert_eq!(p.sector_size, 128);
                assert_eq!(p.offset, 10 * 512 + 512);
                assert_eq!(p.meta_offset, 9 * 512);
                assert!(p.read_only);
                assert!(p.has_meta);
            }
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn test_parse_invalid_rows() {
        let mut disabled = external_row(1, 1, 1);
        disabled[12] = 0;
        let mut bad_kind = external_row(1, 1, 1);
        bad_kind[1] = 0x07;
        let mut bad_size = external_row(1, 1, 1);
        bad_size[0] = 0x04;
        let parsed = parse(&table_with(&[(0, disabled), (1, bad_kind), (2, bad_size)])).unwrap();
        assert_eq!(parsed.slots[..3], [Slot::Invalid; 3]);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let table = table_with(&[(0, external_row(4, 100, 1)), (5, external_row(900, 7, 2))]);
        assert_eq!(parse(&table).unwrap(), parse(&table).unwrap());
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let mut table = table_with(&[]);
        table[0] = 0x20;
        assert!(parse(&table).is_err());
    }

    #[test]
    fn test_scan_direct() {
        let mut image = vec![0u8; 4096];
        image[..256].copy_from_slice(&table_with(&[(0, external_row(2, 4, 9))]));
        let parsed = scan(&mut Cursor::new(image)).unwrap();
        assert!(matches!(parsed.slots[0], Slot::Partition(p) if p.partition_id == 9));
    }

    #[test]
    fn test_scan_through_mbr() {
        let mut image = vec![0u8; 8192];
        // Entry 2 of the MBR (0x1CE), type byte at +4, start LBA at +8.
        image[0x1D2] = MBR_TYPE_APT;
        image[0x1D6..0x1DA].copy_from_slice(&8u32.to_le_bytes());
        // A later 0x7F entry must be ignored.
        image[0x1E2] = MBR_TYPE_APT;
        image[0x1E6..0x1EA].copy_from_slice(&12u32.to_le_bytes());
        image[8 * 512..8 * 512 + 256].copy_from_slice(&table_with(&[(3, external_row(20, 5, 7))]));

        let parsed = scan(&mut Cursor::new(image)).unwrap();
        assert!(matches!(parsed.slots[3], Slot::Partition(p) if p.partition_id == 7));
    }

    #[test]
    fn test_scan_without_table_fails() {
        let image = vec![0u8; 4096];
        assert!(matches!(
            scan(&mut Cursor::new(image)),
            Err(SioError::NoPartitionTable)
        ));
    }
}
