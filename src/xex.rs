//! Executable files presented as a bootable single-density disk.
//!
//! Nothing is written to the host file; every sector is synthesised on read.
//!
//! | Sector        | Contents                                              |
//! |---------------|-------------------------------------------------------|
//! | 1-2           | Boot loader supplied by the host                      |
//! | 0x168         | VTOC: sector map size and free sector count           |
//! | 0x169         | Directory entry named after the file                  |
//! | 0x171..       | File data, 125 bytes per sector plus a 3-byte link    |
//! | anything else | Zeros                                                 |
//!
//! ## Data sector trailer
//!
//! | Byte | Meaning                                    |
//! |------|--------------------------------------------|
//! | 125  | Next sector, high byte (0 on the last one) |
//! | 126  | Next sector, low byte                      |
//! | 127  | Data bytes used in this sector             |

use crate::drive::{read_up_to, ImageIo};
use std::io::{self, Seek, SeekFrom};

pub const SECTOR_SIZE: usize = 128;

const BOOT_SECTORS: u32 = 2;
const VTOC_SECTOR: u32 = 0x168;
const DIRECTORY_SECTOR: u32 = 0x169;
const FIRST_DATA_SECTOR: u32 = 0x171;
/// Sectors before the first data sector plus two spare.
const SYSTEM_SECTORS: u32 = 0x173;
const DATA_BYTES: usize = SECTOR_SIZE - 3;

/// Sector count of the synthetic disk for a file of `file_size` bytes.
#[must_use]
pub fn sector_count(file_size: u64) -> u32 {
    let data_sectors = file_size.div_ceil(DATA_BYTES as u64);
    SYSTEM_SECTORS + data_sectors.min(u64::from(u32::MAX - SYSTEM_SECTORS)) as u32
}

/// Fills `buf` with synthetic sector `sector` and returns its length.
pub fn read_sector(
    image: &mut dyn ImageIo,
    name: &str,
    sector_count: u32,
    boot_loader: &[u8],
    sector: u32,
    buf: &mut [u8],
) -> io::Result<usize> {
    let buf = &mut buf[..SECTOR_SIZE];
    buf.fill(0);

    match sector {
        1..=BOOT_SECTORS => {
            let start = (sector as usize - 1) * SECTOR_SIZE;
            if let Some(loader) = boot_loader.get(start..) {
                let len = loader.len().min(SECTOR_SIZE);
                buf[..len].copy_from_slice(&loader[..len]);
            }
        }
        VTOC_SECTOR => {
            let (map_sectors, free) = vtoc(sector_count);
            buf[0] = ((map_sectors + 3) / 2) as u8;
            buf[1..3].copy_from_slice(&(free as u16).to_le_bytes());
        }
        DIRECTORY_SECTOR => {
            let file_sectors = sector_count.saturating_sub(SYSTEM_SECTORS);
            buf[0] = if file_sectors > 0x28F { 0x46 } else { 0x42 };
            buf[1..3].copy_from_slice(&(file_sectors as u16).to_le_bytes());
            buf[3] = FIRST_DATA_SECTOR as u8;
            buf[4] = (FIRST_DATA_SECTOR >> 8) as u8;
            buf[5..16].copy_from_slice(&directory_name(name));
        }
        FIRST_DATA_SECTOR.. => {
            let offset = u64::from(sector - FIRST_DATA_SECTOR) * DATA_BYTES as u64;
            image.seek(SeekFrom::Start(offset))?;
            let read = read_up_to(image, &mut buf[..DATA_BYTES])?;
            let next = if read < DATA_BYTES { 0 } else { sector + 1 };
            buf[DATA_BYTES] = (next >> 8) as u8;
            buf[DATA_BYTES + 1] = next as u8;
            buf[DATA_BYTES + 2] = read as u8;
        }
        _ => {}
    }

    Ok(SECTOR_SIZE)
}

/// Sector-map size and the free count reported in the VTOC.
fn vtoc(sector_count: u32) -> (u32, u32) {
    let mut map_sectors = sector_count / 1024;
    match sector_count % 1024 {
        0 => {}
        rem if rem > 943 => map_sectors += 2,
        _ => map_sectors += 1,
    }
    if map_sectors % 2 == 0 {
        map_sectors += 1;
    }
    (map_sectors, sector_count.saturating_sub(map_sectors + 12))
}

/// 8.3 name, upper case, space padded; anything but a letter becomes '@'.
fn directory_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (stem, ext) = match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    let fold = |c: u8| {
        if c.is_ascii_alphabetic() {
            c.to_ascii_uppercase()
        } else {
            b'@'
        }
    };
    for (dst, &c) in out[..8].iter_mut().zip(stem.as_bytes()) {
        *dst = fold(c);
    }
    for (dst, &c) in out[8..].iter_mut().zip(ext.as_bytes()) {
        *dst = fold(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sector_of(file: Vec<u8>, name: &str, sector: u32) -> [u8; SECTOR_SIZE] {
        let count = sector_count(file.len() as u64);
        let mut image = Cursor::new(file);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            read_sector(&mut image, name, count, &[], sector, &mut buf).unwrap(),
            SECTOR_SIZE
        );
        buf
    }

    #[test]
    fn test_sector_count() {
        assert_eq!(sector_count(0), 0x173);
        assert_eq!(sector_count(1), 0x174);
        assert_eq!(sector_count(125), 0x174);
        assert_eq!(sector_count(126), 0x175);
    }

    #[test]
    fn test_data_sectors_chain() {
        let file: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        let first = sector_of(file.clone(), "A.XEX", 0x171);
        assert_eq!(&first[..125], &file[..125]);
        assert_eq!(first[125..], [0x01, 0x72, 125]);

        let last = sector_of(file.clone(), "A.XEX", 0x173);
        assert_eq!(&last[..50], &file[250..]);
        assert!(last[50..125].iter().all(|&b| b == 0));
        assert_eq!(last[125..], [0, 0, 50]);
    }

    #[test]
    fn test_directory_entry() {
        let buf = sector_of(vec![0; 1000], "game2.xex", 0x169);
        assert_eq!(buf[0], 0x42);
        assert_eq!(u16::from_le_bytes([buf[1], buf[2]]), 8);
        assert_eq!(buf[3..5], [0x71, 0x01]);
        assert_eq!(&buf[5..16], b"GAME@   XEX");
        assert!(buf[16..].iter().all(|&b| b == 0));

        let big = sector_of(vec![0; 0x290 * 125], "LONGFILENAME.COM", 0x169);
        assert_eq!(big[0], 0x46);
        assert_eq!(&big[5..16], b"LONGFILECOM");
    }

    #[test]
    fn test_vtoc() {
        // 0x173 + 8 sectors: one map sector, odd already.
        let buf = sector_of(vec![0; 1000], "A.XEX", 0x168);
        assert_eq!(buf[0], 2);
        assert_eq!(u16::from_le_bytes([buf[1], buf[2]]), 0x17B - 13);

        assert_eq!(vtoc(1024), (1, 1011));
        assert_eq!(vtoc(2048 + 950), (5, 2998 - 17));
    }

    #[test]
    fn test_boot_sectors_and_filler() {
        let loader: Vec<u8> = (0..256u32).map(|i| (i ^ 0x5A) as u8).collect();
        let mut image = Cursor::new(vec![0u8; 10]);
        let mut buf = [0xEEu8; SECTOR_SIZE];
        read_sector(&mut image, "A.XEX", 0x174, &loader, 2, &mut buf).unwrap();
        assert_eq!(&buf[..], &loader[128..]);

        read_sector(&mut image, "A.XEX", 0x174, &[], 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        read_sector(&mut image, "A.XEX", 0x174, &loader, 5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
