//! CFI flash engine: probe, write-buffer programming, erase
//!
//! Everything here runs while the chip may be busy programming, so on XIP
//! platforms this code must execute from RAM (see the crate docs).

use crate::amd;
use crate::bus::NorBus;
use crate::cfi::{CfiInfo, FlashModel, QRY_OFFSET, QUERY_SIZE};
use crate::intel;
use rloader_core::{Error, Result};

/// Largest sector the write-back cache must hold.
pub const SECTOR_MAX: usize = 0x20000;

/// The erased state of NOR flash.
pub const ERASED_STATE: u8 = 0xff;

/// All registered flash models, probed in order.
pub fn models() -> impl Iterator<Item = &'static FlashModel> {
    amd::MODELS.iter().chain(intel::MODELS.iter())
}

/// One bus word, sized by the port width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashWord {
    Byte(u8),
    Word(u16),
}

/// Data polling: wait until the bus reads back `expected` at `offs`
/// (AMD-style completion; the chip serves toggling data until done).
fn status_poll(bus: &mut dyn NorBus, expected: FlashWord, offs: u32, timeout_ms: u64) -> Result<()> {
    let start = bus.now_ms();

    loop {
        let ready = match expected {
            FlashWord::Byte(byte) => bus.read_u8(offs) == byte,
            FlashWord::Word(word) => {
                let val = bus.read_u8(offs) as u16 | (bus.read_u8(offs + 1) as u16) << 8;
                val == word
            }
        };

        if ready {
            return Ok(());
        }

        if timeout_ms > 0 && bus.now_ms().wrapping_sub(start) > timeout_ms {
            return Err(Error::Timeout);
        }
    }
}

/// Status polling: wait for the ready bit (Intel-style completion).
fn status_wait(bus: &mut dyn NorBus, model: &FlashModel, timeout_ms: u64) -> Result<()> {
    let start = bus.now_ms();

    while model.cmdset.status_read(bus) & model.status_rdy_mask == 0 {
        if timeout_ms > 0 && bus.now_ms().wrapping_sub(start) > timeout_ms {
            return Err(Error::Timeout);
        }
    }

    Ok(())
}

/// Program up to one write-buffer window at `addr` (within the sector at
/// `sector_addr`). Leading already-erased bytes are skipped; if the whole
/// window is erased no transaction is issued.
pub fn write_buffer(
    bus: &mut dyn NorBus,
    model: &FlashModel,
    sector_addr: u32,
    addr: u32,
    data: &[u8],
    timeout_ms: u64,
) -> Result<()> {
    let port_width = bus.port_width();

    let mut skip = 0usize;
    while skip < data.len() {
        match port_width {
            8 => {
                if data[skip] != ERASED_STATE {
                    break;
                }
                skip += 1;
            }
            16 => {
                let val = data[skip] as u16 | (data[skip + 1] as u16) << 8;
                if val != 0xffff {
                    break;
                }
                skip += 2;
            }
            _ => return Err(Error::Invalid),
        }
    }

    let data = &data[skip..];
    let addr = addr + skip as u32;

    if data.is_empty() {
        return Ok(());
    }

    model
        .cmdset
        .issue_write_buffer(bus, sector_addr, addr, data.len());

    let mut i = 0usize;
    while i < data.len() {
        match port_width {
            8 => {
                bus.write_u8(addr + i as u32, data[i]);
                i += 1;
            }
            16 => {
                let val = data[i] as u16 | (data[i + 1] as u16) << 8;
                bus.write_u16(addr + i as u32, val);
                i += 2;
            }
            _ => unreachable!(),
        }
    }

    model.cmdset.issue_write_confirm(bus, sector_addr);

    let res = if model.use_polling {
        let step = (port_width / 8) as usize;
        let last = data.len() - step;
        let word = match port_width {
            8 => FlashWord::Byte(data[last]),
            _ => FlashWord::Word(data[last] as u16 | (data[last + 1] as u16) << 8),
        };
        status_poll(bus, word, addr + last as u32, timeout_ms)
    } else {
        status_wait(bus, model, timeout_ms)
    };

    let status = model.cmdset.status_check(bus, "write buffer");

    model.cmdset.status_clear(bus);

    res.and(status)
}

/// Erase the sector at `sector_addr` and wait for completion.
pub fn sector_erase(
    bus: &mut dyn NorBus,
    model: &FlashModel,
    sector_addr: u32,
    timeout_ms: u64,
) -> Result<()> {
    model.cmdset.issue_sector_erase(bus, sector_addr);

    let res = if model.use_polling {
        let word = match bus.port_width() {
            8 => FlashWord::Byte(0xff),
            16 => FlashWord::Word(0xffff),
            _ => return Err(Error::Invalid),
        };
        status_poll(bus, word, sector_addr, timeout_ms)
    } else {
        status_wait(bus, model, timeout_ms)
    };

    let status = model.cmdset.status_check(bus, "sector erase");

    model.cmdset.status_clear(bus);

    res.and(status)
}

/// Erase the whole chip; `NotSupported` when the command set has no chip
/// erase (the caller falls back to iterated sector erase).
pub fn chip_erase(bus: &mut dyn NorBus, model: &FlashModel, timeout_ms: u64) -> Result<()> {
    model.cmdset.issue_chip_erase(bus)?;

    let res = status_wait(bus, model, timeout_ms);

    let status = model.cmdset.status_check(bus, "chip erase");

    model.cmdset.status_clear(bus);

    res.and(status)
}

/// Copy `buf.len()` bytes out of the flash window at `offs`, returning the
/// chip to array mode first.
pub fn read(bus: &mut dyn NorBus, model: &FlashModel, offs: u32, buf: &mut [u8]) {
    model.cmdset.issue_reset(bus);

    bus.read_into(offs, buf);
}

/// Reset both command sets; at probe time the chip's convention is still
/// unknown and the order matters (AMD first).
fn reset_all(bus: &mut dyn NorBus) {
    bus.write_u8(0, 0xf0);

    for _ in 0..1000 {
        core::hint::spin_loop();
    }

    bus.write_u8(0, 0xff);
}

/// Identify the chip: for each registered model, enter CFI query mode,
/// check the "QRY" signature, read the full query response and match the
/// vendor/device bytes.
///
/// Query bytes appear on even addresses (the x8 view of the chip).
pub fn probe(bus: &mut dyn NorBus) -> Result<(&'static FlashModel, CfiInfo)> {
    for model in models() {
        reset_all(bus);
        model.cmdset.enter_query(bus, 0x0);

        let mut qry = [0u8; 3];
        for (j, byte) in qry.iter_mut().enumerate() {
            *byte = bus.read_u8(((QRY_OFFSET + j) * 2) as u32);
        }
        if &qry != b"QRY" {
            continue;
        }

        let mut raw = [0u8; QUERY_SIZE];
        for (j, byte) in raw.iter_mut().enumerate() {
            *byte = bus.read_u8((j * 2) as u32);
        }
        let info = CfiInfo::parse(&raw);

        /* x8 flash */
        let device = u16::from_le_bytes([info.vendor_data[1], info.vendor_data[2]]) & 0xff;

        if info.vendor_data[0] != model.vendor || device != model.device & 0xff {
            /* Query succeeded, but this is not the model under test */
            model.cmdset.exit_query(bus);
            continue;
        }

        model.cmdset.exit_query(bus);

        return Ok((model, info));
    }

    Err(Error::NoDevice)
}
