//! CFI query response and command-set dispatch
//!
//! The JEDEC CFI query response is a packed byte layout starting with the
//! vendor area and the "QRY" signature. On this platform the controller
//! returns 16-bit values with their bytes swapped, so every 16-bit field
//! is swapped once right after the raw copy; all accessors below are in
//! host byte order.

use crate::bus::NorBus;
use rloader_core::Result;

/// Serialized size of the query response the driver consumes.
pub const QUERY_SIZE: usize = 61;

/// Byte offset of the "QRY" signature inside the response.
pub const QRY_OFFSET: usize = 16;

/// Read/Enter Query command (common to both command sets).
pub const CMD_RD_QUERY: u8 = 0x98;
/// Read Status Register command (common to both command sets).
pub const CMD_RD_STATUS: u8 = 0x70;

/// Typical or maximum operation timings, each a log2 value per CFI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfiTimeouts {
    /// Single-word program, log2 microseconds
    pub word_program: u8,
    /// Buffer write, log2 microseconds
    pub buf_write: u8,
    /// Block erase, log2 milliseconds
    pub blk_erase: u8,
    /// Chip erase, log2 milliseconds
    pub chip_erase: u8,
}

/// One erase-region descriptor: `count + 1` sectors of `size * 256` bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfiRegion {
    /// Number of sectors in this region, minus one
    pub count: u16,
    /// Sector size in 256-byte units
    pub size: u16,
}

/// Parsed CFI query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfiInfo {
    /// Vendor area preceding the query structure (holds the device ID)
    pub vendor_data: [u8; 16],
    /// "QRY" signature
    pub qry: [u8; 3],
    /// Primary command-set ID
    pub cmd_set1: u16,
    /// Primary extended-table address
    pub addr_ext1: u16,
    /// Alternate command-set ID
    pub cmd_set2: u16,
    /// Alternate extended-table address
    pub addr_ext2: u16,
    /// Vcc min, BCD volts/100mV
    pub vcc_min: u8,
    /// Vcc max
    pub vcc_max: u8,
    /// Vpp min
    pub vpp_min: u8,
    /// Vpp max
    pub vpp_max: u8,
    /// Typical timings
    pub tout_typical: CfiTimeouts,
    /// Worst-case timing multipliers
    pub tout_max: CfiTimeouts,
    /// Chip size as log2 bytes
    pub chip_sz: u8,
    /// Flash device interface description
    pub fdi_desc: u16,
    /// Write-buffer size as log2 bytes
    pub buf_sz: u16,
    /// Number of valid erase regions
    pub region_cnt: u8,
    /// Erase region descriptors
    pub regions: [CfiRegion; 4],
}

impl CfiInfo {
    /// Deserialize from the raw query bytes, swapping 16-bit fields into
    /// host order.
    pub fn parse(raw: &[u8; QUERY_SIZE]) -> Self {
        let u16_at = |offs: usize| u16::from_le_bytes([raw[offs], raw[offs + 1]]);

        let mut vendor_data = [0u8; 16];
        vendor_data.copy_from_slice(&raw[0..16]);

        let mut regions = [CfiRegion::default(); 4];
        for (i, region) in regions.iter_mut().enumerate() {
            region.count = u16_at(45 + i * 4);
            region.size = u16_at(47 + i * 4);
        }

        Self {
            vendor_data,
            qry: [raw[16], raw[17], raw[18]],
            cmd_set1: u16_at(19),
            addr_ext1: u16_at(21),
            cmd_set2: u16_at(23),
            addr_ext2: u16_at(25),
            vcc_min: raw[27],
            vcc_max: raw[28],
            vpp_min: raw[29],
            vpp_max: raw[30],
            tout_typical: CfiTimeouts {
                word_program: raw[31],
                buf_write: raw[32],
                blk_erase: raw[33],
                chip_erase: raw[34],
            },
            tout_max: CfiTimeouts {
                word_program: raw[35],
                buf_write: raw[36],
                blk_erase: raw[37],
                chip_erase: raw[38],
            },
            chip_sz: raw[39],
            fdi_desc: u16_at(40),
            buf_sz: u16_at(42),
            region_cnt: raw[44],
            regions,
        }
    }

    /// Serialize back to the raw byte layout (16-bit fields re-swapped).
    pub fn serialize(&self) -> [u8; QUERY_SIZE] {
        let mut raw = [0u8; QUERY_SIZE];
        raw[0..16].copy_from_slice(&self.vendor_data);
        raw[16..19].copy_from_slice(&self.qry);
        raw[19..21].copy_from_slice(&self.cmd_set1.to_le_bytes());
        raw[21..23].copy_from_slice(&self.addr_ext1.to_le_bytes());
        raw[23..25].copy_from_slice(&self.cmd_set2.to_le_bytes());
        raw[25..27].copy_from_slice(&self.addr_ext2.to_le_bytes());
        raw[27] = self.vcc_min;
        raw[28] = self.vcc_max;
        raw[29] = self.vpp_min;
        raw[30] = self.vpp_max;
        raw[31] = self.tout_typical.word_program;
        raw[32] = self.tout_typical.buf_write;
        raw[33] = self.tout_typical.blk_erase;
        raw[34] = self.tout_typical.chip_erase;
        raw[35] = self.tout_max.word_program;
        raw[36] = self.tout_max.buf_write;
        raw[37] = self.tout_max.blk_erase;
        raw[38] = self.tout_max.chip_erase;
        raw[39] = self.chip_sz;
        raw[40..42].copy_from_slice(&self.fdi_desc.to_le_bytes());
        raw[42..44].copy_from_slice(&self.buf_sz.to_le_bytes());
        raw[44] = self.region_cnt;
        for (i, region) in self.regions.iter().enumerate() {
            raw[45 + i * 4..47 + i * 4].copy_from_slice(&region.count.to_le_bytes());
            raw[47 + i * 4..49 + i * 4].copy_from_slice(&region.size.to_le_bytes());
        }
        raw
    }

    /// Chip size in bytes.
    pub fn chip_size(&self) -> usize {
        1usize << self.chip_sz
    }

    /// Write-buffer size in bytes.
    pub fn write_buffer_size(&self) -> usize {
        1usize << self.buf_sz
    }

    /// Worst-case buffer-program timeout in milliseconds:
    /// `2^typical us * 2^max / 1000`.
    pub fn program_timeout_ms(&self) -> u64 {
        ((1u64 << self.tout_typical.buf_write) * (1u64 << self.tout_max.buf_write)) / 1000
    }

    /// Worst-case block-erase timeout in milliseconds: `2^typical * 2^max`.
    pub fn block_erase_timeout_ms(&self) -> u64 {
        (1u64 << self.tout_typical.blk_erase) * (1u64 << self.tout_max.blk_erase)
    }

    /// Worst-case chip-erase timeout in milliseconds.
    pub fn chip_erase_timeout_ms(&self) -> u64 {
        (1u64 << self.tout_typical.chip_erase) * (1u64 << self.tout_max.chip_erase)
    }
}

/// Vendor-specific command cycles of one CFI command set.
///
/// Implementations only issue bus cycles and decode status; timing and
/// buffering policy live in [`crate::flash`].
pub trait CommandSet: Sync {
    /// Read the status register.
    fn status_read(&self, bus: &mut dyn NorBus) -> u8;

    /// Decode the status register, logging and returning `Io` on any
    /// error bit.
    fn status_check(&self, bus: &mut dyn NorBus, op: &str) -> Result<()>;

    /// Clear the status register.
    fn status_clear(&self, bus: &mut dyn NorBus);

    /// Return the chip to array-read mode.
    fn issue_reset(&self, bus: &mut dyn NorBus);

    /// Start a write-to-buffer transaction of `len` bytes.
    fn issue_write_buffer(&self, bus: &mut dyn NorBus, sector_addr: u32, program_addr: u32, len: usize);

    /// Commit the loaded write buffer.
    fn issue_write_confirm(&self, bus: &mut dyn NorBus, sector_addr: u32);

    /// Start a sector erase.
    fn issue_sector_erase(&self, bus: &mut dyn NorBus, sector_addr: u32);

    /// Start a chip erase, or report that this command set has none.
    fn issue_chip_erase(&self, bus: &mut dyn NorBus) -> Result<()>;

    /// Enter CFI query mode.
    fn enter_query(&self, bus: &mut dyn NorBus, sector_addr: u32);

    /// Leave CFI query mode.
    fn exit_query(&self, bus: &mut dyn NorBus);
}

/// One supported flash model.
pub struct FlashModel {
    /// Marketing name, for the configuration log line
    pub name: &'static str,
    /// CFI vendor byte
    pub vendor: u8,
    /// Device ID (the low byte is compared on x8 buses)
    pub device: u16,
    /// Chip data-bus width in bits
    pub chip_width: u8,
    /// Ready bit in the status register
    pub status_rdy_mask: u8,
    /// Completion by data polling (true) or status-ready polling (false)
    pub use_polling: bool,
    /// Command set this model speaks
    pub cmdset: &'static dyn CommandSet,
}
