//! AMD command-set implementation
//!
//! Commands are preceded by the 0xaaa/0x555 unlock sequence; completion
//! is observed by data polling at the programmed address.

use crate::bus::NorBus;
use crate::cfi::{CommandSet, FlashModel, CMD_RD_QUERY, CMD_RD_STATUS};
use rloader_core::{Error, Result};

const CMD_RESET: u8 = 0xf0; /* Reset/ASO Exit */
const CMD_WR_BUF: u8 = 0x25; /* Write to Buffer */
const CMD_WR_CONFIRM: u8 = 0x29; /* Write Confirm */
const CMD_CLR_STATUS: u8 = 0x71; /* Clear Status Register */
const CMD_CE_CYC1: u8 = 0x80; /* Chip Erase (1st bus cycle) */
const CMD_CE_CYC2: u8 = 0x10; /* Chip Erase (2nd bus cycle) */
const CMD_BE_CYC1: u8 = 0x80; /* Block Erase (1st bus cycle) */
const CMD_BE_CYC2: u8 = 0x30; /* Block Erase (2nd bus cycle) */
const CMD_EXIT_QUERY: u8 = 0xff; /* Exit Query */

/* Valid offset on flash - for executing commands */
const FLASH_VALID_OFFS: u32 = 0x0;
const STS_FULL_CHECK: u8 = (1 << 5) | (1 << 4) | (1 << 3) | (1 << 1);

fn unlock_sequence(bus: &mut dyn NorBus) {
    bus.write_u8(0x0aaa, 0xaa);
    bus.write_u8(0x0555, 0x55);
}

/// The AMD command set.
pub struct AmdCmdSet;

impl CommandSet for AmdCmdSet {
    fn status_read(&self, bus: &mut dyn NorBus) -> u8 {
        bus.write_u8(0x0aaa, CMD_RD_STATUS);
        bus.read_u8(FLASH_VALID_OFFS)
    }

    fn status_check(&self, bus: &mut dyn NorBus, op: &str) -> Result<()> {
        let status = self.status_read(bus);
        if status & STS_FULL_CHECK != 0 {
            log::error!("dev/flash: {} error: status {:#x}", op, status);
            return Err(Error::Io);
        }
        Ok(())
    }

    fn status_clear(&self, bus: &mut dyn NorBus) {
        bus.write_u8(0x0aaa, CMD_CLR_STATUS);
    }

    fn issue_reset(&self, bus: &mut dyn NorBus) {
        bus.write_u8(FLASH_VALID_OFFS, CMD_RESET);
    }

    fn issue_write_buffer(
        &self,
        bus: &mut dyn NorBus,
        sector_addr: u32,
        _program_addr: u32,
        len: usize,
    ) {
        unlock_sequence(bus);
        bus.write_u8(sector_addr, CMD_WR_BUF);
        bus.write_u8(sector_addr, ((len - 1) & 0xff) as u8);
    }

    fn issue_write_confirm(&self, bus: &mut dyn NorBus, sector_addr: u32) {
        bus.write_u8(sector_addr, CMD_WR_CONFIRM);
    }

    fn issue_sector_erase(&self, bus: &mut dyn NorBus, sector_addr: u32) {
        unlock_sequence(bus);
        bus.write_u8(0x0aaa, CMD_BE_CYC1);

        unlock_sequence(bus);
        bus.write_u8(sector_addr, CMD_BE_CYC2);
    }

    fn issue_chip_erase(&self, bus: &mut dyn NorBus) -> Result<()> {
        unlock_sequence(bus);
        bus.write_u8(0x0aaa, CMD_CE_CYC1);

        unlock_sequence(bus);
        bus.write_u8(0x0aaa, CMD_CE_CYC2);

        Ok(())
    }

    fn enter_query(&self, bus: &mut dyn NorBus, sector_addr: u32) {
        bus.write_u8(sector_addr + 0xaa, CMD_RD_QUERY);
    }

    fn exit_query(&self, bus: &mut dyn NorBus) {
        bus.write_u8(0, CMD_EXIT_QUERY);
    }
}

static AMD_OPS: AmdCmdSet = AmdCmdSet;

/// AMD command-set models probed by the driver.
pub static MODELS: [FlashModel; 1] = [FlashModel {
    name: "Infineon S29GL01/512T",
    vendor: 0x01,
    device: 0x227e,
    chip_width: 16,
    status_rdy_mask: 1 << 7,
    use_polling: true,
    cmdset: &AMD_OPS,
}];
