//! rloader-nand - NAND flash driver
//!
//! Three cooperating pieces of silicon drive the chip: the GPMI controller
//! issues command/address/data cycles, the BCH engine computes and checks
//! ECC over a programmable page layout, and the APBH DMA engine walks
//! descriptor chains that feed GPMI while routing payload through BCH.
//!
//! On top of the page engine sit three block devices: `data` (ECC page
//! data with bad-block management and a write-back eraseblock cache),
//! `meta` (per-page user metadata) and `raw` (page plus OOB bytes, no
//! ECC).

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bch;
pub mod chip;
pub mod dma;
pub mod driver;
pub mod gpmi;
pub mod io;

pub use chip::{GpmiNand, NandIo, PageNand};
pub use driver::{NandData, NandDriver, NandMeta, NandRaw};
