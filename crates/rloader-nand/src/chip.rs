//! NAND page engine
//!
//! Issues named chip commands as DMA descriptor chains through the
//! [`NandIo`] seam, manages the BCH page layout across full, partial,
//! metadata-only and raw transfers, decodes per-chunk ECC status, and
//! recovers erased chunks that picked up bitflips. The block drivers
//! consume the [`PageNand`] trait so they can run against an emulated
//! chip in tests.

use crate::bch::BchEcc;
use crate::dma::DmaChain;
use crate::gpmi;
use rloader_core::{Error, Result};

/// Largest page the engine handles.
pub const PAGE_MAX: usize = 4096;
/// Largest OOB area.
pub const OOB_MAX: usize = 256;
/// Largest raw transfer (page + OOB).
pub const RAW_MAX: usize = PAGE_MAX + OOB_MAX;
/// User metadata bytes per page.
pub const META_SIZE: usize = 16;
/// Upper bound on ECC chunks per page (metadata + data blocks).
pub const CHUNKS_MAX: usize = 9;

const DMA_BUF_SIZE: usize = 1024;
const AUX_SIZE: usize = 64;
const MAX_ADDRSZ: usize = 5;

/// Per-chunk ECC status: no errors.
pub const ECC_OK: u8 = 0x00;
/// Per-chunk ECC status: chunk uncorrectable.
pub const ECC_UNCORRECTABLE: u8 = 0xfe;
/// Per-chunk ECC status: chunk erased (all ones).
pub const ECC_ERASED: u8 = 0xff;

/// One chip command: first/second command byte and address length.
#[derive(Debug, Clone, Copy)]
pub struct NandCmd {
    /// First command cycle.
    pub cmd1: u8,
    /// Second command cycle (0 when absent).
    pub cmd2: u8,
    /// Number of address cycles.
    pub addrsz: u16,
}

/// Command table indices.
#[allow(missing_docs)]
pub mod cmd {
    pub const RESET: usize = 0;
    pub const READ_ID: usize = 1;
    pub const READ_PARAMETER_PAGE: usize = 2;
    pub const READ_UNIQUE_ID: usize = 3;
    pub const GET_FEATURES: usize = 4;
    pub const SET_FEATURES: usize = 5;
    pub const READ_STATUS: usize = 6;
    pub const READ_STATUS_ENHANCED: usize = 7;
    pub const RANDOM_DATA_READ: usize = 8;
    pub const RANDOM_DATA_READ_TWO_PLANE: usize = 9;
    pub const RANDOM_DATA_INPUT: usize = 10;
    pub const PROGRAM_DATA_MOVE_COLUMN: usize = 11;
    pub const READ_MODE: usize = 12;
    pub const READ_PAGE: usize = 13;
    pub const READ_PAGE_CACHE_SEQ: usize = 14;
    pub const READ_PAGE_CACHE_RANDOM: usize = 15;
    pub const READ_PAGE_CACHE_LAST: usize = 16;
    pub const PROGRAM_PAGE: usize = 17;
    pub const PROGRAM_PAGE_CACHE: usize = 18;
    pub const ERASE_BLOCK: usize = 19;
    pub const READ_DATA_MOVE: usize = 20;
    pub const PROGRAM_DATA_MOVE: usize = 21;
    pub const BLOCK_UNLOCK_LOW: usize = 22;
    pub const BLOCK_UNLOCK_HIGH: usize = 23;
    pub const BLOCK_LOCK: usize = 24;
    pub const BLOCK_LOCK_TIGHT: usize = 25;
    pub const BLOCK_LOCK_STATUS: usize = 26;
    pub const OTP_LOCK: usize = 27;
    pub const OTP_PROGRAM: usize = 28;
    pub const OTP_READ: usize = 29;
}

/// The ONFI command set as issued by the engine.
pub static CMDS: [NandCmd; 30] = [
    NandCmd { cmd1: 0xff, cmd2: 0x00, addrsz: 0 }, /* reset */
    NandCmd { cmd1: 0x90, cmd2: 0x00, addrsz: 1 }, /* read_id */
    NandCmd { cmd1: 0xec, cmd2: 0x00, addrsz: 1 }, /* read_parameter_page */
    NandCmd { cmd1: 0xed, cmd2: 0x00, addrsz: 1 }, /* read_unique_id */
    NandCmd { cmd1: 0xee, cmd2: 0x00, addrsz: 1 }, /* get_features */
    NandCmd { cmd1: 0xef, cmd2: 0x00, addrsz: 1 }, /* set_features */
    NandCmd { cmd1: 0x70, cmd2: 0x00, addrsz: 0 }, /* read_status */
    NandCmd { cmd1: 0x78, cmd2: 0x00, addrsz: 3 }, /* read_status_enhanced */
    NandCmd { cmd1: 0x05, cmd2: 0xe0, addrsz: 2 }, /* random_data_read */
    NandCmd { cmd1: 0x06, cmd2: 0xe0, addrsz: 5 }, /* random_data_read_two_plane */
    NandCmd { cmd1: 0x85, cmd2: 0x00, addrsz: 2 }, /* random_data_input */
    NandCmd { cmd1: 0x85, cmd2: 0x00, addrsz: 5 }, /* program_for_internal_data_move_column */
    NandCmd { cmd1: 0x00, cmd2: 0x00, addrsz: 0 }, /* read_mode */
    NandCmd { cmd1: 0x00, cmd2: 0x30, addrsz: 5 }, /* read_page */
    NandCmd { cmd1: 0x31, cmd2: 0x00, addrsz: 0 }, /* read_page_cache_sequential */
    NandCmd { cmd1: 0x00, cmd2: 0x31, addrsz: 5 }, /* read_page_cache_random */
    NandCmd { cmd1: 0x3f, cmd2: 0x00, addrsz: 0 }, /* read_page_cache_last */
    NandCmd { cmd1: 0x80, cmd2: 0x10, addrsz: 5 }, /* program_page */
    NandCmd { cmd1: 0x80, cmd2: 0x15, addrsz: 5 }, /* program_page_cache */
    NandCmd { cmd1: 0x60, cmd2: 0xd0, addrsz: 3 }, /* erase_block */
    NandCmd { cmd1: 0x00, cmd2: 0x35, addrsz: 5 }, /* read_for_internal_data_move */
    NandCmd { cmd1: 0x85, cmd2: 0x10, addrsz: 5 }, /* program_for_internal_data_move */
    NandCmd { cmd1: 0x23, cmd2: 0x00, addrsz: 3 }, /* block_unlock_low */
    NandCmd { cmd1: 0x24, cmd2: 0x00, addrsz: 3 }, /* block_unlock_high */
    NandCmd { cmd1: 0x2a, cmd2: 0x00, addrsz: 0 }, /* block_lock */
    NandCmd { cmd1: 0x2c, cmd2: 0x00, addrsz: 0 }, /* block_lock_tight */
    NandCmd { cmd1: 0x7a, cmd2: 0x00, addrsz: 3 }, /* block_lock_read_status */
    NandCmd { cmd1: 0x80, cmd2: 0x10, addrsz: 5 }, /* otp_data_lock_by_block */
    NandCmd { cmd1: 0x80, cmd2: 0x10, addrsz: 5 }, /* otp_data_program */
    NandCmd { cmd1: 0x00, cmd2: 0x30, addrsz: 5 }, /* otp_data_read */
];

/// Geometry and ECC of one supported chip.
#[derive(Debug)]
pub struct NandInfo {
    /// Chip name for the configuration log line.
    pub name: &'static str,
    /// Manufacturer ID byte.
    pub manid: u8,
    /// Device ID byte.
    pub devid: u8,
    /// Total size in bytes.
    pub size: u64,
    /// Eraseblock size in bytes.
    pub erasesz: u32,
    /// Page data size in bytes.
    pub pagesz: u32,
    /// Page OOB size in bytes.
    pub oobsz: u32,
    /// User metadata bytes per page.
    pub metasz: u32,
    /// BCH configuration.
    pub ecc: &'static BchEcc,
}

impl NandInfo {
    /// Pages per eraseblock.
    pub fn pages_per_block(&self) -> u32 {
        self.erasesz / self.pagesz
    }

    /// Eraseblocks on the device.
    pub fn block_count(&self) -> u32 {
        (self.size / self.erasesz as u64) as u32
    }
}

/// 4 KiB page with 16 B metadata.
static NAND_ECC: BchEcc = BchEcc {
    blocksz0: 0,
    blockszn: 512,
    nblocks: 8,
    ecc0: 16,
    eccn: 14,
    gf0: 13,
    gfn: 13,
};

/// Supported chips.
pub static NAND_INFO: [NandInfo; 2] = [
    NandInfo {
        name: "Kioxia TH58NVG4",
        manid: 0x98,
        devid: 0xd3,
        size: 8192 * 64 * 4096,
        erasesz: 64 * 4096,
        pagesz: 4096,
        oobsz: 256,
        metasz: 16,
        ecc: &NAND_ECC,
    },
    NandInfo {
        name: "Micron MT29F8G",
        manid: 0x2c,
        devid: 0xd3,
        size: 4096 * 64 * 4096,
        erasesz: 64 * 4096,
        pagesz: 4096,
        oobsz: 224,
        metasz: 16,
        ecc: &NAND_ECC,
    },
];

/// Decoded page metadata and per-chunk ECC status.
#[derive(Debug, Clone, Copy)]
pub struct PageMeta {
    /// User metadata bytes.
    pub metadata: [u8; META_SIZE],
    /// ECC status per chunk: [`ECC_OK`], a corrected-bit count,
    /// [`ECC_UNCORRECTABLE`] or [`ECC_ERASED`].
    pub errors: [u8; CHUNKS_MAX],
}

impl PageMeta {
    /// All-erased metadata, no errors.
    pub fn new() -> Self {
        Self {
            metadata: [0xff; META_SIZE],
            errors: [ECC_OK; CHUNKS_MAX],
        }
    }
}

impl Default for PageMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Hardware seam: chain execution, BCH completion and layout registers.
pub trait NandIo {
    /// Run a descriptor chain to completion.
    fn run(&mut self, chain: &DmaChain<'_>) -> Result<()>;

    /// Wait for the BCH completion interrupt (bounded).
    fn bch_wait(&mut self) -> Result<()>;

    /// Program the BCH page-layout registers of chip select `chip`.
    fn bch_set_layout(&mut self, chip: u32, layout0: u32, layout1: u32);

    /// Translate a CPU buffer pointer to a DMA bus address.
    fn dma_addr(&self, buf: *const u8) -> u32;
}

/// Page-level NAND operations, as the block drivers consume them.
pub trait PageNand {
    /// Identify the chip (idempotent) and return its geometry.
    fn probe(&mut self) -> Result<&'static NandInfo>;

    /// Forget the probed chip.
    fn shutdown(&mut self);

    /// Chip geometry; `NoDevice` before a successful probe.
    fn info(&self) -> Result<&'static NandInfo>;

    /// ECC read of a full page: data into `data`, metadata and chunk
    /// statuses into `meta`.
    fn read(&mut self, page: u32, data: &mut [u8], meta: &mut PageMeta) -> Result<()>;

    /// ECC read of the metadata only.
    fn read_meta(&mut self, page: u32, meta: &mut PageMeta) -> Result<()>;

    /// Raw read (no ECC) of the first `buf.len()` bytes of page + OOB.
    fn read_raw(&mut self, page: u32, buf: &mut [u8]) -> Result<()>;

    /// Program a full page. With `meta` absent the chip's existing
    /// metadata is preserved byte for byte (partial-page program).
    fn write(&mut self, page: u32, data: &[u8], meta: Option<&[u8]>) -> Result<()>;

    /// Program the metadata only.
    fn write_meta(&mut self, page: u32, meta: &[u8]) -> Result<()>;

    /// Raw program (no ECC) of the first `buf.len()` bytes of page + OOB.
    fn write_raw(&mut self, page: u32, buf: &[u8]) -> Result<()>;

    /// Erase one block.
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Bad-block check: vendor marker in the first page's raw metadata;
    /// a failed read counts as bad.
    fn is_bad(&mut self, block: u32) -> bool;

    /// Stamp the bad-block marker.
    fn mark_bad(&mut self, block: u32) -> Result<()>;
}

/// Count zero bits in `buf` over the bit range `[boffs, boffs + blen)`.
///
/// Works byte-wise up to a 32-bit alignment, then word-wise, then
/// byte-wise again for the tail.
pub fn check_erased(buf: &[u8], mut boffs: usize, mut blen: usize) -> u32 {
    let mut idx = boffs / 8;
    boffs %= 8;
    let mut ret = 0u32;

    /* First byte */
    if boffs > 0 {
        let mut byte = buf[idx];
        idx += 1;
        byte |= 0xffu8 << (8 - boffs);

        /* Is it also the last byte? */
        if boffs + blen < 8 {
            byte |= 0xffu8 >> (boffs + blen);
            blen = 0;
        } else {
            blen -= 8 - boffs;
        }
        ret += 8 - byte.count_ones();
    }

    /* Bytes up to a 32-bit aligned address */
    while blen > 8 && (buf.as_ptr() as usize + idx) % 4 != 0 {
        ret += 8 - buf[idx].count_ones();
        idx += 1;
        blen -= 8;
    }

    /* Whole words */
    while blen > 32 {
        let word = u32::from_ne_bytes(buf[idx..idx + 4].try_into().unwrap());
        idx += 4;
        blen -= 32;
        if word != 0xffff_ffff {
            ret += 32 - word.count_ones();
        }
    }

    /* Remaining bytes */
    while blen > 8 {
        ret += 8 - buf[idx].count_ones();
        idx += 1;
        blen -= 8;
    }

    /* Last byte */
    if blen > 0 {
        let byte = buf[idx] | (0xffu8 >> blen);
        ret += 8 - byte.count_ones();
    }

    ret
}

/// Chunk recovery after BCH reported uncorrectable chunks.
///
/// `raw` is the page re-read without ECC. A chunk whose raw bitflip count
/// does not exceed its ECC strength is an erased chunk with flips: the
/// decoded buffer is corrected to all-ones. Anything worse is fatal.
fn correct_erased_chunks(
    ecc: &BchEcc,
    metasz: usize,
    statuses: &[u8],
    raw: &[u8],
    mut data: Option<&mut [u8]>,
    metadata: &mut [u8],
) -> Result<()> {
    let mlen = 8 * metasz + ecc.ecc0 as usize * ecc.gf0 as usize;
    let dlen = 8 * ecc.blockszn as usize + ecc.eccn as usize * ecc.gfn as usize;

    for (i, &status) in statuses.iter().enumerate() {
        if status != ECC_UNCORRECTABLE {
            continue;
        }

        let (boffs, blen) = if i == 0 {
            (0, mlen)
        } else {
            (mlen + (i - 1) * dlen, dlen)
        };

        let flips = check_erased(raw, boffs, blen);
        if flips == 0 {
            continue;
        }

        if i == 0 {
            if flips > ecc.ecc0 as u32 {
                return Err(Error::EccFault);
            }
            metadata[..metasz].fill(0xff);
        } else {
            let blockszn = ecc.blockszn as usize;
            if flips > ecc.eccn as u32 {
                return Err(Error::EccFault);
            }
            if let Some(data) = data.as_deref_mut() {
                data[(i - 1) * blockszn..i * blockszn].fill(0xff);
            }
        }
    }

    Ok(())
}

/// Offset of the chunk status bytes inside the auxiliary buffer (32-bit
/// aligned, right after the user metadata).
fn status_offset(metasz: usize) -> usize {
    (metasz + 3) & !3
}

/// The GPMI/BCH/DMA-driven page engine.
pub struct GpmiNand<IO: NandIo> {
    io: IO,
    chip: u32,
    info: Option<&'static NandInfo>,
    dma_buf: [u8; DMA_BUF_SIZE],
    /// Raw-transfer scratch (erased-chunk re-reads, ID reads, markers).
    scratch: [u8; RAW_MAX],
    /// BCH auxiliary buffer: metadata, then chunk statuses.
    aux: [u8; AUX_SIZE],
}

/// Row-address bytes of a page (3 cycles).
fn row_addr(page: u32) -> [u8; MAX_ADDRSZ] {
    let le = page.to_le_bytes();
    [le[0], le[1], le[2], 0, 0]
}

/// Column + row address of a page (2 + 3 cycles).
fn page_addr(page: u32) -> [u8; MAX_ADDRSZ] {
    let le = page.to_le_bytes();
    [0, 0, le[0], le[1], le[2]]
}

/// Append command and address cycles (and an optional write payload) to
/// the chain, exactly as the command table describes them.
fn issue(
    chain: &mut DmaChain<'_>,
    chip: u32,
    idx: usize,
    addr: Option<&[u8; MAX_ADDRSZ]>,
    payload: Option<(u32, Option<u32>, u16)>,
) {
    let command = &CMDS[idx];

    let mut bytes = [0u8; 8];
    bytes[0] = command.cmd1;
    if let Some(addr) = addr {
        bytes[1..1 + command.addrsz as usize].copy_from_slice(&addr[..command.addrsz as usize]);
    }
    bytes[7] = command.cmd2;

    let (offs, bus) = chain.alloc_bytes(8);
    chain.fill_bytes(offs, &bytes);

    gpmi::cmdaddr(chain, chip, bus, command.addrsz);

    if let Some((buf, aux, size)) = payload {
        if size > 0 {
            match aux {
                Some(aux) => gpmi::ecwrite(chain, chip, buf, aux, size),
                None => gpmi::write(chain, chip, buf, size),
            }
        }
    }

    if command.cmd2 != 0 {
        gpmi::cmdaddr(chain, chip, bus + 7, 0);
    }
}

/// Wait-for-ready with the sense check looping back on a glitch.
fn wait_ready(chain: &mut DmaChain<'_>, chip: u32) {
    let w4 = gpmi::w4ready(chain, chip);
    chain.check(w4);
}

/// Status read-compare: on mismatch the chain branches to a failing
/// terminator.
fn read_compare(chain: &mut DmaChain<'_>, chip: u32, mask: u16, val: u16) {
    let fail = chain.terminator(-1);
    gpmi::readcmp(chain, chip, mask, val);
    chain.check(fail);
}

impl<IO: NandIo> GpmiNand<IO> {
    /// New engine on chip select `chip`; the chip is identified by
    /// [`probe`](Self::probe).
    pub fn new(io: IO, chip: u32) -> Self {
        Self {
            io,
            chip,
            info: None,
            dma_buf: [0; DMA_BUF_SIZE],
            scratch: [0xff; RAW_MAX],
            aux: [0; AUX_SIZE],
        }
    }

    /// New engine for a known chip, skipping the ID probe (fixed-hardware
    /// builds and tests). The BCH layout is still programmed.
    pub fn preconfigured(io: IO, chip: u32, info: &'static NandInfo) -> Self {
        let mut engine = Self::new(io, chip);
        engine.set_info(info);
        engine
    }

    fn set_info(&mut self, info: &'static NandInfo) {
        let rawsz = (info.pagesz + info.oobsz) as u16;
        self.io.bch_set_layout(
            self.chip,
            info.ecc.layout0(info.metasz as u8),
            info.ecc.layout1(rawsz),
        );
        self.info = Some(info);
    }

    fn restore_layout(&mut self) {
        if let Some(info) = self.info {
            let rawsz = (info.pagesz + info.oobsz) as u16;
            self.io.bch_set_layout(
                self.chip,
                info.ecc.layout0(info.metasz as u8),
                info.ecc.layout1(rawsz),
            );
        }
    }

    /// Reset the chip.
    pub fn reset(&mut self) -> Result<()> {
        let base = self.io.dma_addr(self.dma_buf.as_ptr());
        let mut chain = DmaChain::new(&mut self.dma_buf, base);

        issue(&mut chain, self.chip, cmd::RESET, None, None);
        chain.finish();

        self.io.run(&chain)
    }

    /// Read the chip's ID bytes.
    pub fn read_id(&mut self) -> Result<(u8, u8)> {
        let base = self.io.dma_addr(self.dma_buf.as_ptr());
        let id_bus = self.io.dma_addr(self.scratch.as_ptr());
        let mut chain = DmaChain::new(&mut self.dma_buf, base);

        wait_ready(&mut chain, self.chip);
        issue(
            &mut chain,
            self.chip,
            cmd::READ_ID,
            Some(&[0; MAX_ADDRSZ]),
            None,
        );
        wait_ready(&mut chain, self.chip);
        gpmi::read(&mut chain, self.chip, id_bus, 5);
        chain.finish();

        self.io.run(&chain)?;

        Ok((self.scratch[0], self.scratch[1]))
    }

    /// Reset the chip, read its ID and match it against the supported
    /// chip table.
    pub fn probe(&mut self) -> Result<&'static NandInfo> {
        if let Some(info) = self.info {
            return Ok(info);
        }

        self.reset()?;
        let (manid, devid) = self.read_id()?;

        let info = NAND_INFO
            .iter()
            .find(|info| info.manid == manid && info.devid == devid)
            .ok_or(Error::NoDevice)?;

        self.set_info(info);

        Ok(info)
    }

    /// Forget the probed chip.
    pub fn shutdown(&mut self) {
        self.info = None;
    }

    fn raw_xfer(&mut self, page: u32, bus: u32, len: u16, write: bool) -> Result<()> {
        let base = self.io.dma_addr(self.dma_buf.as_ptr());
        let mut chain = DmaChain::new(&mut self.dma_buf, base);

        wait_ready(&mut chain, self.chip);
        if write {
            issue(
                &mut chain,
                self.chip,
                cmd::PROGRAM_PAGE,
                Some(&page_addr(page)),
                Some((bus, None, len)),
            );
            wait_ready(&mut chain, self.chip);
            issue(&mut chain, self.chip, cmd::READ_STATUS, None, None);
            read_compare(&mut chain, self.chip, 0x3, 0);
        } else {
            issue(
                &mut chain,
                self.chip,
                cmd::READ_PAGE,
                Some(&page_addr(page)),
                None,
            );
            wait_ready(&mut chain, self.chip);
            gpmi::read(&mut chain, self.chip, bus, len);
        }
        chain.finish();

        self.io.run(&chain)
    }

    /// Raw page re-read into the scratch buffer (erased-chunk recovery).
    fn reread_raw(&mut self, page: u32, len: usize) -> Result<()> {
        let bus = self.io.dma_addr(self.scratch.as_ptr());
        self.raw_xfer(page, bus, len as u16, false)
    }

    /// ECC read; `data_bus` of 0 reads metadata only.
    fn ecc_read(&mut self, page: u32, data_bus: u32, size: u16) -> Result<()> {
        let base = self.io.dma_addr(self.dma_buf.as_ptr());
        let aux_bus = self.io.dma_addr(self.aux.as_ptr());
        let mut chain = DmaChain::new(&mut self.dma_buf, base);

        wait_ready(&mut chain, self.chip);
        issue(
            &mut chain,
            self.chip,
            cmd::READ_PAGE,
            Some(&page_addr(page)),
            None,
        );
        wait_ready(&mut chain, self.chip);
        gpmi::ecread(&mut chain, self.chip, data_bus, aux_bus, size);
        gpmi::disable_bch(&mut chain, self.chip);
        chain.finish();

        self.io.run(&chain)?;
        self.io.bch_wait()
    }

    /// ECC program; payload and auxiliary already staged.
    fn ecc_write(&mut self, page: u32, data_bus: u32, size: u16) -> Result<()> {
        let base = self.io.dma_addr(self.dma_buf.as_ptr());
        let aux_bus = self.io.dma_addr(self.aux.as_ptr());
        let mut chain = DmaChain::new(&mut self.dma_buf, base);

        wait_ready(&mut chain, self.chip);
        issue(
            &mut chain,
            self.chip,
            cmd::PROGRAM_PAGE,
            Some(&page_addr(page)),
            Some((data_bus, Some(aux_bus), size)),
        );
        wait_ready(&mut chain, self.chip);
        issue(&mut chain, self.chip, cmd::READ_STATUS, None, None);
        read_compare(&mut chain, self.chip, 0x3, 0);
        chain.finish();

        self.io.run(&chain)
    }

    /// Decode chunk statuses and recover erased chunks with bitflips.
    fn check_ecc(
        &mut self,
        page: u32,
        chunks: usize,
        mut data: Option<&mut [u8]>,
        meta: &mut PageMeta,
    ) -> Result<()> {
        let info = self.info.ok_or(Error::NoDevice)?;
        let metasz = info.metasz as usize;

        meta.metadata.copy_from_slice(&self.aux[..metasz]);

        let status_at = status_offset(metasz);
        let mut statuses = [ECC_OK; CHUNKS_MAX];
        statuses[..chunks].copy_from_slice(&self.aux[status_at..status_at + chunks]);
        meta.errors = statuses;

        if statuses[..chunks]
            .iter()
            .all(|&s| s != ECC_UNCORRECTABLE)
        {
            return Ok(());
        }

        /* Re-read the page raw and count actual bitflips */
        self.reread_raw(page, (info.pagesz + info.oobsz) as usize)?;

        correct_erased_chunks(
            info.ecc,
            metasz,
            &statuses[..chunks],
            &self.scratch,
            data.as_deref_mut(),
            &mut meta.metadata,
        )
    }
}

impl<IO: NandIo> PageNand for GpmiNand<IO> {
    fn probe(&mut self) -> Result<&'static NandInfo> {
        GpmiNand::probe(self)
    }

    fn shutdown(&mut self) {
        GpmiNand::shutdown(self)
    }

    fn info(&self) -> Result<&'static NandInfo> {
        self.info.ok_or(Error::NoDevice)
    }

    fn read(&mut self, page: u32, data: &mut [u8], meta: &mut PageMeta) -> Result<()> {
        let info = self.info()?;
        let size = (info.pagesz + info.oobsz) as u16;
        let chunks = 1 + info.ecc.nblocks as usize;

        let data_bus = self.io.dma_addr(data.as_ptr());
        self.ecc_read(page, data_bus, size)?;

        self.check_ecc(page, chunks, Some(data), meta)
    }

    fn read_meta(&mut self, page: u32, meta: &mut PageMeta) -> Result<()> {
        let info = self.info()?;
        let size = (info.metasz as usize + info.ecc.meta_parity()) as u16;

        self.ecc_read(page, 0, size)?;

        self.check_ecc(page, 1, None, meta)
    }

    fn read_raw(&mut self, page: u32, buf: &mut [u8]) -> Result<()> {
        self.info()?;
        let bus = self.io.dma_addr(buf.as_ptr());
        self.raw_xfer(page, bus, buf.len() as u16, false)
    }

    fn write(&mut self, page: u32, data: &[u8], meta: Option<&[u8]>) -> Result<()> {
        let info = self.info()?;
        let size = (info.pagesz + info.oobsz) as u16;
        let metasz = info.metasz as usize;

        match meta {
            Some(meta) => {
                self.aux[..metasz].copy_from_slice(&meta[..metasz]);
            }
            None => {
                /* Partial-page program: the metadata block passes through
                 * raw, preserving whatever the chip holds there */
                self.aux[..metasz + info.ecc.meta_parity()].fill(0xff);
                self.io.bch_set_layout(
                    self.chip,
                    info.ecc.layout0_data(metasz as u8),
                    info.ecc.layout1(size),
                );
            }
        }

        let data_bus = self.io.dma_addr(data.as_ptr());
        let res = self.ecc_write(page, data_bus, size);

        self.restore_layout();

        res
    }

    fn write_meta(&mut self, page: u32, meta: &[u8]) -> Result<()> {
        let info = self.info()?;
        let metasz = info.metasz as usize;
        let size = (metasz + info.ecc.meta_parity()) as u16;

        self.aux[..metasz].fill(0xff);
        self.aux[..meta.len().min(metasz)].copy_from_slice(&meta[..meta.len().min(metasz)]);

        self.io.bch_set_layout(
            self.chip,
            info.ecc.layout0_meta(metasz as u8),
            info.ecc.layout1_meta(metasz as u8),
        );

        let res = self.ecc_write(page, 0, size);

        self.restore_layout();

        res
    }

    fn write_raw(&mut self, page: u32, buf: &[u8]) -> Result<()> {
        self.info()?;
        let bus = self.io.dma_addr(buf.as_ptr());
        self.raw_xfer(page, bus, buf.len() as u16, true)
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let info = self.info()?;
        let page = block * info.pages_per_block();

        let base = self.io.dma_addr(self.dma_buf.as_ptr());
        let mut chain = DmaChain::new(&mut self.dma_buf, base);

        wait_ready(&mut chain, self.chip);
        issue(
            &mut chain,
            self.chip,
            cmd::ERASE_BLOCK,
            Some(&row_addr(page)),
            None,
        );
        wait_ready(&mut chain, self.chip);
        issue(&mut chain, self.chip, cmd::READ_STATUS, None, None);
        read_compare(&mut chain, self.chip, 0x1, 0);
        chain.finish();

        self.io.run(&chain)
    }

    fn is_bad(&mut self, block: u32) -> bool {
        let info = match self.info() {
            Ok(info) => info,
            Err(_) => return true,
        };
        let page = block * info.pages_per_block();
        let len = info.metasz as usize + info.ecc.meta_parity();

        let bus = self.io.dma_addr(self.scratch.as_ptr());
        if self.raw_xfer(page, bus, len as u16, false).is_err() {
            /* Read error, assume bad block */
            return true;
        }

        /* First metadata byte is the vendor bad-block marker */
        self.scratch[0] == 0x00
    }

    fn mark_bad(&mut self, block: u32) -> Result<()> {
        let info = self.info()?;
        let page = block * info.pages_per_block();
        let len = info.metasz as usize + info.ecc.meta_parity();

        let mut marker = [0xffu8; AUX_SIZE];
        marker[0] = 0x00;

        self.write_raw(page, &marker[..len])
    }
}
