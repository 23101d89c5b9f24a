//! rloader-ftmctrl - CFI parallel NOR flash driver
//!
//! Drives a parallel NOR chip memory-mapped behind the FTMCTRL memory
//! controller. The chip is identified through a CFI query and then spoken
//! to in either the Intel or the AMD command-set convention, whichever the
//! matched model uses. The driver layers the uniform block-device contract
//! (byte-granular writes, sector write-back cache) on top of the
//! write-buffer/sector-erase primitives.
//!
//! Anything that executes while the flash is being programmed or erased
//! cannot run from that same flash; on XIP platforms the linker script
//! must place this crate's code in RAM.

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod amd;
pub mod bus;
pub mod cfi;
pub mod driver;
pub mod flash;
pub mod intel;

pub use bus::NorBus;
pub use driver::CfiNorDriver;
