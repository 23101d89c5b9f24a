//! Intel command-set implementation
//!
//! No unlock cycles; the write-buffer command is re-issued until the
//! extended status register reports the buffer available. Completion is
//! observed through the status-ready bit, and there is no chip erase.

use crate::bus::NorBus;
use crate::cfi::{CommandSet, FlashModel, CMD_RD_QUERY, CMD_RD_STATUS};
use rloader_core::{Error, Result};

const CMD_RESET: u8 = 0xff; /* Reset/Read Array */
const CMD_WR_BUF: u8 = 0xe8; /* Write to Buffer */
const CMD_WR_CONFIRM: u8 = 0xd0; /* Write Confirm */
const CMD_CLR_STATUS: u8 = 0x50; /* Clear Status Register */
const CMD_BE_CYC1: u8 = 0x20; /* Block Erase (1st bus cycle) */

/* Valid offset on flash - for executing commands */
const FLASH_VALID_OFFS: u32 = 0x0;
const STS_FULL_CHECK: u8 = (1 << 5) | (1 << 4) | (1 << 3) | (1 << 1);
const XSR_WRBUF_RDY: u8 = 1 << 7; /* Write buffer ready */

/// The Intel command set.
pub struct IntelCmdSet;

impl CommandSet for IntelCmdSet {
    fn status_read(&self, bus: &mut dyn NorBus) -> u8 {
        bus.write_u8(FLASH_VALID_OFFS, CMD_RD_STATUS);
        bus.read_u8(FLASH_VALID_OFFS)
    }

    fn status_check(&self, bus: &mut dyn NorBus, op: &str) -> Result<()> {
        let status = self.status_read(bus);
        let res = if status & STS_FULL_CHECK != 0 {
            log::error!("dev/flash: {} error: status {:#x}", op, status);
            Err(Error::Io)
        } else {
            Ok(())
        };

        self.status_clear(bus);

        res
    }

    fn status_clear(&self, bus: &mut dyn NorBus) {
        bus.write_u8(FLASH_VALID_OFFS, CMD_CLR_STATUS);
    }

    fn issue_reset(&self, bus: &mut dyn NorBus) {
        bus.write_u8(FLASH_VALID_OFFS, CMD_RESET);
    }

    fn issue_write_buffer(
        &self,
        bus: &mut dyn NorBus,
        _sector_addr: u32,
        program_addr: u32,
        len: usize,
    ) {
        loop {
            bus.write_u8(program_addr, CMD_WR_BUF);
            let xsr = bus.read_u8(FLASH_VALID_OFFS);
            if xsr & XSR_WRBUF_RDY != 0 {
                break;
            }
        }

        bus.write_u8(program_addr, ((len - 1) & 0xff) as u8);
    }

    fn issue_write_confirm(&self, bus: &mut dyn NorBus, sector_addr: u32) {
        bus.write_u8(sector_addr, CMD_WR_CONFIRM);
    }

    fn issue_sector_erase(&self, bus: &mut dyn NorBus, sector_addr: u32) {
        bus.write_u8(sector_addr, CMD_BE_CYC1);
        bus.write_u8(sector_addr, CMD_WR_CONFIRM);
    }

    fn issue_chip_erase(&self, _bus: &mut dyn NorBus) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn enter_query(&self, bus: &mut dyn NorBus, addr: u32) {
        bus.write_u8(addr, CMD_RD_QUERY);
    }

    fn exit_query(&self, _bus: &mut dyn NorBus) {}
}

static INTEL_OPS: IntelCmdSet = IntelCmdSet;

/// Intel command-set models probed by the driver.
pub static MODELS: [FlashModel; 1] = [FlashModel {
    name: "Intel JS28F640J3",
    vendor: 0x89,
    device: 0x0017,
    chip_width: 8,
    status_rdy_mask: 1 << 7,
    use_polling: false,
    cmdset: &INTEL_OPS,
}];
