//! Serial NOR chip support: probe, status, EAR, erase, program, read
//!
//! All the opcodes used here take 3-byte addresses; access beyond 16 MiB
//! goes through the chip's extended address register (EAR). The driver
//! keeps a shadow copy and only rewrites the register when the desired
//! high byte changes. Every address-bearing operation validates the EAR
//! first - including window reads, because the window shares it.

use crate::controller::{SpimCtrl, XferOp};
use rloader_core::{Error, Result};

/// Largest nominal sector the write-back cache must hold.
pub const SECTOR_MAX: usize = 0x10000;
/// Largest program page.
pub const PAGE_MAX: usize = 0x100;
/// Erase region table size.
pub const REGIONS_MAX: usize = 4;
/// The erased state of NOR flash.
pub const ERASED_STATE: u8 = 0xff;

const CMD_RDID: u8 = 0x9f;

/* Status register */
const SR_WIP: u8 = 0x01; /* Write in progress */
const SR_WEL: u8 = 0x02; /* Write enable latch */

const fn flash_id(vid: u8, pid: u16) -> u32 {
    ((vid as u32) << 16) | (pid as u32)
}

const VID_MACRONIX: u8 = 0xc2;
const VID_SPANSION: u8 = 0x01;

/// One erase region: `sector_cnt` sectors of `sector_sz` bytes.
#[derive(Debug, Clone, Copy)]
pub struct NorRegion {
    /// Number of sectors (0 terminates the table).
    pub sector_cnt: usize,
    /// Physical sector size in bytes.
    pub sector_sz: usize,
}

/// Static description of one supported chip.
#[derive(Debug)]
pub struct NorInfo {
    /// JEDEC ID (vendor byte and 16-bit device ID).
    pub jedec_id: u32,
    /// Chip name for the configuration log line.
    pub name: &'static str,
    /// Vendor name.
    pub vendor: &'static str,
    /// Total size in bytes.
    pub total_sz: usize,
    /// Program page size in bytes.
    pub page_sz: usize,
    /// Nominal (largest) sector size; the cache granule.
    pub sector_sz: usize,
    /// Typical page-program time in milliseconds.
    pub t_pp: u64,
    /// Typical sector-erase time in milliseconds.
    pub t_se: u64,
    /// Typical chip-erase time in milliseconds.
    pub t_ce: u64,
    /// Erase regions, in address order.
    pub regions: [NorRegion; REGIONS_MAX],
}

/// Vendor opcode set.
#[derive(Debug)]
pub struct NorCmds {
    /// Read status register.
    pub rdsr: u8,
    /// Write enable.
    pub wren: u8,
    /// Write disable.
    pub wrdi: u8,
    /// Read extended address register.
    pub rdear: u8,
    /// Write extended address register.
    pub wrear: u8,
    /// Chip erase.
    pub ce: u8,
    /// Sector erase.
    pub se: u8,
    /// Page program.
    pub pp: u8,
    /// Read data.
    pub read: u8,
}

static MACRONIX_CMDS: NorCmds = NorCmds {
    rdsr: 0x05,
    wren: 0x06,
    wrdi: 0x04,
    rdear: 0xc8,
    wrear: 0xc5,
    ce: 0x60,
    se: 0x20,
    pp: 0x02,
    read: 0x03,
};

static SPANSION_CMDS: NorCmds = NorCmds {
    rdsr: 0x05,
    wren: 0x06,
    wrdi: 0x04,
    rdear: 0x16,
    wrear: 0x17,
    ce: 0x60,
    se: 0xd8,
    pp: 0x02,
    read: 0x03,
};

const NO_REGION: NorRegion = NorRegion {
    sector_cnt: 0,
    sector_sz: 0,
};

/// Supported chips.
pub static FLASH_INFO: [NorInfo; 2] = [
    NorInfo {
        jedec_id: flash_id(VID_MACRONIX, 0x2019),
        name: "MX25L25635F",
        vendor: "Macronix",
        total_sz: 32 * 1024 * 1024,
        page_sz: 0x100,
        sector_sz: 0x1000,
        t_pp: 2,
        t_se: 120,
        t_ce: 150 * 1000,
        regions: [
            NorRegion {
                sector_cnt: 8192,
                sector_sz: 0x1000,
            },
            NO_REGION,
            NO_REGION,
            NO_REGION,
        ],
    },
    NorInfo {
        jedec_id: flash_id(VID_SPANSION, 0x2018),
        name: "S25FL128S",
        vendor: "Spansion",
        total_sz: 16 * 1024 * 1024,
        page_sz: 0x100,
        sector_sz: 0x10000,
        t_pp: 1,
        t_se: 650,
        t_ce: 165 * 1000,
        regions: [
            NorRegion {
                sector_cnt: 32,
                sector_sz: 0x1000,
            },
            NorRegion {
                sector_cnt: 254,
                sector_sz: 0x10000,
            },
            NO_REGION,
            NO_REGION,
        ],
    },
];

/// Probed chip state: static tables plus the EAR shadow.
pub struct SpiNor {
    /// Chip description.
    pub info: &'static NorInfo,
    /// Vendor opcode set.
    pub cmds: &'static NorCmds,
    /// Shadow of the chip's extended address register.
    pub ear: u8,
}

fn read_id<C: SpimCtrl>(ctrl: &mut C) -> Result<u32> {
    let cmd = [CMD_RDID];
    let mut data = [0u8; 3];

    ctrl.xfer(XferOp::read(&cmd, &mut data))?;

    Ok(((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32)
}

fn read_status<C: SpimCtrl>(ctrl: &mut C, nor: &SpiNor) -> Result<u8> {
    let cmd = [nor.cmds.rdsr];
    let mut status = [0u8; 1];

    ctrl.xfer(XferOp::read(&cmd, &mut status))?;

    Ok(status[0])
}

/// Poll the status register until write-in-progress clears; a zero
/// timeout waits indefinitely.
pub fn wait_busy<C: SpimCtrl>(ctrl: &mut C, nor: &SpiNor, timeout_ms: u64) -> Result<()> {
    let start = ctrl.now_ms();

    loop {
        let status = read_status(ctrl, nor)?;
        if status & SR_WIP == 0 {
            return Ok(());
        }

        if timeout_ms > 0 && ctrl.now_ms().wrapping_sub(start) > timeout_ms {
            return Err(Error::Timeout);
        }
    }
}

/// Set or clear the write-enable latch, reading it back to verify the
/// chip actually latched the request.
fn write_enable<C: SpimCtrl>(ctrl: &mut C, nor: &SpiNor, enable: bool) -> Result<()> {
    wait_busy(ctrl, nor, 0)?;

    let cmd = [if enable { nor.cmds.wren } else { nor.cmds.wrdi }];
    ctrl.xfer(XferOp::command(&cmd))?;

    let status = read_status(ctrl, nor)?;
    if (status & SR_WEL != 0) != enable {
        return Err(Error::Io);
    }

    Ok(())
}

fn read_ear<C: SpimCtrl>(ctrl: &mut C, nor: &SpiNor) -> Result<u8> {
    let cmd = [nor.cmds.rdear];
    let mut ear = [0u8; 1];

    ctrl.xfer(XferOp::read(&cmd, &mut ear))?;

    Ok(ear[0])
}

/// Write the extended address register and verify the read-back.
fn write_ear<C: SpimCtrl>(ctrl: &mut C, nor: &mut SpiNor, value: u8) -> Result<()> {
    write_enable(ctrl, nor, true)?;

    let cmd = [nor.cmds.wrear];
    ctrl.xfer(XferOp::write(&cmd, &[value]))?;

    nor.ear = read_ear(ctrl, nor)?;
    if nor.ear != value {
        return Err(Error::Io);
    }

    Ok(())
}

/// Make sure the EAR matches the high byte of `addr` before an operation
/// whose opcode only carries 3 address bytes.
fn validate_ear<C: SpimCtrl>(ctrl: &mut C, nor: &mut SpiNor, addr: u32) -> Result<()> {
    let desired = ((addr >> 24) & 0xff) as u8;

    if desired != nor.ear {
        write_ear(ctrl, nor, desired)?;
    }

    Ok(())
}

fn addr_cmd(opcode: u8, addr: u32) -> [u8; 4] {
    [
        opcode,
        ((addr >> 16) & 0xff) as u8,
        ((addr >> 8) & 0xff) as u8,
        (addr & 0xff) as u8,
    ]
}

/// Erase the whole chip.
pub fn erase_chip<C: SpimCtrl>(ctrl: &mut C, nor: &mut SpiNor) -> Result<()> {
    write_enable(ctrl, nor, true)?;

    let cmd = [nor.cmds.ce];
    ctrl.xfer(XferOp::command(&cmd))?;

    wait_busy(ctrl, nor, nor.info.t_ce)
}

/// Erase one nominal sector at `addr`.
///
/// On chips with mixed region layouts the physical sector at `addr` may
/// be smaller than the nominal sector size; enough physical erases are
/// issued to cover the whole nominal sector.
pub fn erase_sector<C: SpimCtrl>(ctrl: &mut C, nor: &mut SpiNor, addr: u32) -> Result<()> {
    let mut region_erase_sz = 0usize;
    let mut region_end = 0usize;

    for region in &nor.info.regions {
        if region.sector_cnt == 0 {
            break;
        }
        region_end += region.sector_cnt * region.sector_sz;
        if (addr as usize) < region_end {
            region_erase_sz = region.sector_sz;
            break;
        }
    }

    if region_erase_sz == 0 {
        return Err(Error::Invalid);
    }

    let mut addr = addr;
    for _ in 0..nor.info.sector_sz / region_erase_sz {
        validate_ear(ctrl, nor, addr)?;
        write_enable(ctrl, nor, true)?;

        let cmd = addr_cmd(nor.cmds.se, addr);
        ctrl.xfer(XferOp::command(&cmd))?;

        wait_busy(ctrl, nor, nor.info.t_se)?;

        addr += region_erase_sz as u32;
    }

    Ok(())
}

/// Program up to one page at `addr` (must not cross a page boundary).
pub fn page_program<C: SpimCtrl>(
    ctrl: &mut C,
    nor: &mut SpiNor,
    addr: u32,
    src: &[u8],
) -> Result<()> {
    validate_ear(ctrl, nor, addr)?;
    write_enable(ctrl, nor, true)?;

    let cmd = addr_cmd(nor.cmds.pp, addr);
    ctrl.xfer(XferOp::write(&cmd, src))?;

    wait_busy(ctrl, nor, nor.info.t_pp)
}

fn read_cmd<C: SpimCtrl>(
    ctrl: &mut C,
    nor: &mut SpiNor,
    addr: u32,
    data: &mut [u8],
) -> Result<usize> {
    validate_ear(ctrl, nor, addr)?;

    let cmd = addr_cmd(nor.cmds.read, addr);
    ctrl.xfer(XferOp::read(&cmd, data))?;

    Ok(data.len())
}

fn read_window<C: SpimCtrl>(
    ctrl: &mut C,
    nor: &mut SpiNor,
    addr: u32,
    data: &mut [u8],
) -> Result<usize> {
    validate_ear(ctrl, nor, addr)?;

    ctrl.window_read(addr, data);

    Ok(data.len())
}

/// Read `data.len()` bytes at `addr`, choosing between the mapped window
/// and the opcode-based read.
///
/// A range crossing a 16 MiB boundary would need an EAR change mid-copy,
/// which the window cannot do, so such reads go through the opcode.
pub fn read_data<C: SpimCtrl>(
    ctrl: &mut C,
    nor: &mut SpiNor,
    addr: u32,
    data: &mut [u8],
) -> Result<usize> {
    if addr & 0xff00_0000 == 0 && (addr + data.len() as u32) & 0xff00_0000 != 0 {
        read_cmd(ctrl, nor, addr, data)
    } else {
        read_window(ctrl, nor, addr, data)
    }
}

fn probe<C: SpimCtrl>(ctrl: &mut C) -> Result<(&'static NorInfo, &'static NorCmds)> {
    let jedec_id = read_id(ctrl)?;
    log::info!("dev/flash/nor: probing flash id {:#010x}", jedec_id);

    let info = FLASH_INFO
        .iter()
        .find(|info| info.jedec_id == jedec_id)
        .ok_or_else(|| {
            log::error!("dev/flash/nor: unsupported flash id {:#010x}", jedec_id);
            Error::NoDevice
        })?;

    let cmds = match (jedec_id >> 16) as u8 {
        VID_MACRONIX => &MACRONIX_CMDS,
        VID_SPANSION => &SPANSION_CMDS,
        _ => return Err(Error::NoDevice),
    };

    Ok((info, cmds))
}

/// Probe the chip and capture the EAR shadow.
pub fn init<C: SpimCtrl>(ctrl: &mut C) -> Result<SpiNor> {
    let (info, cmds) = probe(ctrl)?;

    let mut nor = SpiNor {
        info,
        cmds,
        ear: 0,
    };
    nor.ear = read_ear(ctrl, &nor)?;

    Ok(nor)
}
