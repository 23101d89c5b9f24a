//! rloader-spimctrl - Serial NOR flash driver
//!
//! Drives a serial NOR chip through an SPI controller that exposes both a
//! register-level command channel and a memory-mapped read window over
//! the flash. Chips are identified by JEDEC ID; the command set (status,
//! write enable, extended address register, erase, program, read) is
//! selected per vendor. The driver layers the uniform block-device
//! contract with a sector write-back cache on top.

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod controller;
pub mod driver;
pub mod nor;

pub use controller::{SpimCtrl, XferOp};
pub use driver::SpiNorDriver;
