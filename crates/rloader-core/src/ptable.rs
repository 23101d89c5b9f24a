//! On-flash partition table
//!
//! A single flash block at a known offset holds the table: a small header
//! (version byte, 8 reserved bytes, little-endian entry count, CRC32 of
//! the preceding bytes), `count` packed entries, and a trailing 4-byte
//! magic. Each entry carries a NUL-terminated alphanumeric name, a type,
//! a byte offset and size, and its own CRC32. Everything multi-byte is
//! little-endian on flash regardless of the host.
//!
//! Legacy tables (version 0, 1 or 0xff) predate the checksums; their CRC
//! fields are ignored on parse for backward compatibility.

use crate::crc32::crc32;
use crate::error::{Error, Result};
use core::mem::size_of;
use heapless::Vec;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Current table version stamped by [`PartitionTable::serialize`].
pub const VERSION: u8 = 2;

/// Trailing magic signature.
pub const MAGIC: [u8; 4] = *b"ptab";

/// Fixed on-flash name field width (including the terminating NUL).
pub const NAME_LEN: usize = 32;

/// Upper bound on entries held in memory.
pub const MAX_PARTITIONS: usize = 16;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct RawHeader {
    version: u8,
    reserved: [u8; 8],
    count: U32,
    crc: U32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct RawEntry {
    name: [u8; NAME_LEN],
    kind: U32,
    offset: U32,
    size: U32,
    crc: U32,
}

const HEADER_SIZE: usize = size_of::<RawHeader>();
const ENTRY_SIZE: usize = size_of::<RawEntry>();
/// Bytes of the header covered by the header CRC.
const HEADER_CRC_SPAN: usize = HEADER_SIZE - size_of::<U32>();
/// Bytes of an entry covered by the entry CRC.
const ENTRY_CRC_SPAN: usize = ENTRY_SIZE - size_of::<U32>();

/// Serialized size of a table with `count` entries.
pub const fn table_size(count: usize) -> usize {
    HEADER_SIZE + count * ENTRY_SIZE + MAGIC.len()
}

fn ptable_crc(data: &[u8]) -> u32 {
    !crc32(data, 0xffff_ffff)
}

fn legacy_version(version: u8) -> bool {
    version == 0 || version == 1 || version == 0xff
}

/// Recognized partition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PartType {
    /// Raw byte range
    Raw = 0,
    /// JFFS2 filesystem
    Jffs2 = 1,
    /// meterfs filesystem
    Meterfs = 2,
}

impl PartType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PartType::Raw),
            1 => Some(PartType::Jffs2),
            2 => Some(PartType::Meterfs),
            _ => None,
        }
    }

    /// Human-readable type name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            PartType::Raw => "raw",
            PartType::Jffs2 => "jffs2",
            PartType::Meterfs => "meterfs",
        }
    }
}

/// One partition entry in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    name: [u8; NAME_LEN],
    /// Partition type.
    pub kind: PartType,
    /// Byte offset within the underlying device.
    pub offset: u32,
    /// Byte size.
    pub size: u32,
}

impl Partition {
    /// Build an entry, validating the name (nonempty, alphanumeric, short
    /// enough to leave room for the NUL terminator).
    pub fn new(name: &str, kind: PartType, offset: u32, size: u32) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= NAME_LEN {
            return Err(Error::Invalid);
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::Invalid);
        }

        let mut field = [0u8; NAME_LEN];
        field[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            name: field,
            kind,
            offset,
            size,
        })
    }

    /// Partition name.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        // Construction and parsing both enforce ASCII alphanumeric names
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Check the name field: nonempty alphanumeric run, NUL terminated,
    /// shorter than the field.
    fn valid_name(name: &[u8; NAME_LEN]) -> bool {
        let end = match name.iter().position(|b| !b.is_ascii_alphanumeric()) {
            Some(end) => end,
            None => return false,
        };
        end > 0 && name[end] == 0
    }
}

/// Parsed partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    /// Table version as found on flash (or [`VERSION`] for new tables).
    pub version: u8,
    parts: Vec<Partition, MAX_PARTITIONS>,
}

impl PartitionTable {
    /// Create an empty table at the current version.
    pub fn new() -> Self {
        Self {
            version: VERSION,
            parts: Vec::new(),
        }
    }

    /// Entries in table order.
    pub fn partitions(&self) -> &[Partition] {
        &self.parts
    }

    /// Append an entry.
    pub fn push(&mut self, part: Partition) -> Result<()> {
        self.parts.push(part).map_err(|_| Error::NoSpace)
    }

    /// Find an entry by name.
    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.parts.iter().find(|p| p.name() == name)
    }

    /// Parse and verify a table from `buf`.
    ///
    /// `memsz` is the size of the underlying device, `blksz` its erase
    /// block size; every entry must be block-aligned and in range. Any
    /// verification failure returns `Invalid` with no partial state.
    pub fn parse(buf: &[u8], memsz: u64, blksz: u32) -> Result<Self> {
        let (header, _) = RawHeader::ref_from_prefix(buf).map_err(|_| Error::Invalid)?;
        let crc_check = !legacy_version(header.version);

        if crc_check && header.crc.get() != ptable_crc(&buf[..HEADER_CRC_SPAN]) {
            return Err(Error::Invalid);
        }

        let count = header.count.get() as usize;
        if count > MAX_PARTITIONS {
            return Err(Error::Invalid);
        }

        let size = table_size(count);
        if size > blksz as usize || size > buf.len() {
            return Err(Error::Invalid);
        }

        if buf[size - MAGIC.len()..size] != MAGIC {
            return Err(Error::Invalid);
        }

        let mut table = Self {
            version: header.version,
            parts: Vec::new(),
        };

        for i in 0..count {
            let raw_offs = HEADER_SIZE + i * ENTRY_SIZE;
            let raw = &buf[raw_offs..raw_offs + ENTRY_SIZE];
            let entry = RawEntry::ref_from_bytes(raw).map_err(|_| Error::Invalid)?;

            if crc_check && entry.crc.get() != ptable_crc(&raw[..ENTRY_CRC_SPAN]) {
                return Err(Error::Invalid);
            }

            let part = Self::verify_entry(entry, table.partitions(), memsz, blksz)?;
            table.parts.push(part).map_err(|_| Error::Invalid)?;
        }

        Ok(table)
    }

    fn verify_entry(
        entry: &RawEntry,
        previous: &[Partition],
        memsz: u64,
        blksz: u32,
    ) -> Result<Partition> {
        let offset = entry.offset.get();
        let size = entry.size.get();

        if size == 0 || size % blksz != 0 || offset % blksz != 0 {
            return Err(Error::Invalid);
        }
        if offset as u64 + size as u64 > memsz {
            return Err(Error::Invalid);
        }

        let kind = PartType::from_raw(entry.kind.get()).ok_or(Error::Invalid)?;

        if !Partition::valid_name(&entry.name) {
            return Err(Error::Invalid);
        }

        let part = Partition {
            name: entry.name,
            kind,
            offset,
            size,
        };

        for p in previous {
            // Range overlap (in u64: the sums can exceed u32 on large devices)
            if offset as u64 <= p.offset as u64 + p.size as u64 - 1
                && offset as u64 + size as u64 - 1 >= p.offset as u64
            {
                return Err(Error::Invalid);
            }
            // Name duplicate
            if p.name == part.name {
                return Err(Error::Invalid);
            }
        }

        Ok(part)
    }

    /// Serialize into `buf`: stamp the current version, compute header and
    /// entry CRCs, append the magic, then re-verify the image. Returns the
    /// number of bytes written.
    pub fn serialize(&self, buf: &mut [u8], memsz: u64, blksz: u32) -> Result<usize> {
        let size = table_size(self.parts.len());
        if size > buf.len() {
            return Err(Error::Invalid);
        }

        let mut header = RawHeader {
            version: VERSION,
            reserved: [0; 8],
            count: U32::new(self.parts.len() as u32),
            crc: U32::new(0),
        };
        let header_bytes = header.as_bytes();
        let crc = ptable_crc(&header_bytes[..HEADER_CRC_SPAN]);
        header.crc = U32::new(crc);
        buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());

        for (i, part) in self.parts.iter().enumerate() {
            let mut entry = RawEntry {
                name: part.name,
                kind: U32::new(part.kind as u32),
                offset: U32::new(part.offset),
                size: U32::new(part.size),
                crc: U32::new(0),
            };
            let crc = ptable_crc(&entry.as_bytes()[..ENTRY_CRC_SPAN]);
            entry.crc = U32::new(crc);

            let offs = HEADER_SIZE + i * ENTRY_SIZE;
            buf[offs..offs + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }

        buf[size - MAGIC.len()..size].copy_from_slice(&MAGIC);

        Self::parse(&buf[..size], memsz, blksz)?;

        Ok(size)
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_entry_table() -> PartitionTable {
        let mut table = PartitionTable::new();
        table
            .push(Partition::new("kernel", PartType::Raw, 0, 0x10_0000).unwrap())
            .unwrap();
        table
            .push(Partition::new("rootfs", PartType::Jffs2, 0x10_0000, 0x20_0000).unwrap())
            .unwrap();
        table
            .push(Partition::new("data", PartType::Meterfs, 0x30_0000, 0x10_0000).unwrap())
            .unwrap();
        table
            .push(Partition::new("config", PartType::Raw, 0x40_0000, 0x1_0000).unwrap())
            .unwrap();
        table
    }

    const MEMSZ: u64 = 0x80_0000;
    const BLKSZ: u32 = 0x1000;

    #[test]
    fn test_four_entry_round_trip() {
        let table = four_entry_table();
        let mut buf = [0u8; 0x1000];

        let size = table.serialize(&mut buf, MEMSZ, BLKSZ).unwrap();
        assert_eq!(size, table_size(4));

        let parsed = PartitionTable::parse(&buf[..size], MEMSZ, BLKSZ).unwrap();
        assert_eq!(parsed.version, VERSION);
        assert_eq!(parsed.partitions(), table.partitions());

        // Serializing the parsed table reproduces the image byte for byte
        let mut again = [0u8; 0x1000];
        let size2 = parsed.serialize(&mut again, MEMSZ, BLKSZ).unwrap();
        assert_eq!(&buf[..size], &again[..size2]);
    }

    #[test]
    fn test_single_bit_flips_rejected() {
        let table = four_entry_table();
        let mut pristine = [0u8; 0x1000];
        let size = table.serialize(&mut pristine, MEMSZ, BLKSZ).unwrap();

        // Every bit of the payload (the version byte is excluded: some
        // flips there produce a legacy version, which by design disables
        // the checksum)
        for byte in 1..size {
            for bit in 0..8 {
                let mut corrupt = pristine;
                corrupt[byte] ^= 1 << bit;
                assert_eq!(
                    PartitionTable::parse(&corrupt[..size], MEMSZ, BLKSZ),
                    Err(Error::Invalid),
                    "flip at byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_legacy_version_skips_crc() {
        let table = four_entry_table();
        let mut buf = [0u8; 0x1000];
        let size = table.serialize(&mut buf, MEMSZ, BLKSZ).unwrap();

        // Rewrite as a legacy table with garbage CRCs
        buf[0] = 1;
        buf[13..17].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let parsed = PartitionTable::parse(&buf[..size], MEMSZ, BLKSZ).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.partitions().len(), 4);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut table = PartitionTable::new();
        table
            .push(Partition::new("first", PartType::Raw, 0, 0x2000).unwrap())
            .unwrap();
        table
            .push(Partition::new("second", PartType::Raw, 0x1000, 0x2000).unwrap())
            .unwrap();

        let mut buf = [0u8; 0x1000];
        assert_eq!(table.serialize(&mut buf, MEMSZ, BLKSZ), Err(Error::Invalid));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut table = PartitionTable::new();
        table
            .push(Partition::new("dup", PartType::Raw, 0, 0x1000).unwrap())
            .unwrap();
        table
            .push(Partition::new("dup", PartType::Raw, 0x1000, 0x1000).unwrap())
            .unwrap();

        let mut buf = [0u8; 0x1000];
        assert_eq!(table.serialize(&mut buf, MEMSZ, BLKSZ), Err(Error::Invalid));
    }

    #[test]
    fn test_unaligned_and_out_of_range_rejected() {
        for (offset, size) in [
            (0x800u32, 0x1000u32),  // offset not block aligned
            (0x1000, 0x800),        // size not block aligned
            (0x1000, 0),            // empty
            (0x7f_f000, 0x2000),    // runs past the device
            (0xffff_f000, 0x2000),  // offset + size overflows u32
        ] {
            let mut table = PartitionTable::new();
            table
                .push(Partition::new("bad", PartType::Raw, offset, size).unwrap())
                .unwrap();

            let mut buf = [0u8; 0x1000];
            assert_eq!(
                table.serialize(&mut buf, MEMSZ, BLKSZ),
                Err(Error::Invalid),
                "offset {:#x} size {:#x} accepted",
                offset,
                size
            );
        }
    }

    #[test]
    fn test_name_rules() {
        assert!(Partition::new("ok123", PartType::Raw, 0, 0x1000).is_ok());
        assert!(Partition::new("", PartType::Raw, 0, 0x1000).is_err());
        assert!(Partition::new("has space", PartType::Raw, 0, 0x1000).is_err());
        assert!(Partition::new("dash-ed", PartType::Raw, 0, 0x1000).is_err());
        // 32 characters leave no room for the NUL
        let long = "a".repeat(32);
        assert!(Partition::new(&long, PartType::Raw, 0, 0x1000).is_err());
        let fits = "a".repeat(31);
        assert!(Partition::new(&fits, PartType::Raw, 0, 0x1000).is_ok());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let table = four_entry_table();
        let mut buf = [0u8; 0x1000];
        let size = table.serialize(&mut buf, MEMSZ, BLKSZ).unwrap();

        buf[size - 1] = b'X';
        assert_eq!(
            PartitionTable::parse(&buf[..size], MEMSZ, BLKSZ),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn test_table_larger_than_block_rejected() {
        let table = four_entry_table();
        let mut buf = [0u8; 0x1000];
        let size = table.serialize(&mut buf, MEMSZ, BLKSZ).unwrap();

        // A block smaller than the table cannot hold it
        assert_eq!(
            PartitionTable::parse(&buf[..size], MEMSZ, 0x80),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn test_find_by_name() {
        let table = four_entry_table();
        let part = table.find("rootfs").unwrap();
        assert_eq!(part.kind, PartType::Jffs2);
        assert_eq!(part.offset, 0x10_0000);
        assert!(table.find("missing").is_none());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(PartType::Raw.name(), "raw");
        assert_eq!(PartType::Jffs2.name(), "jffs2");
        assert_eq!(PartType::Meterfs.name(), "meterfs");
    }
}
