//! rloader-core - Core library for the loader storage subsystem
//!
//! This crate provides the device registry, the uniform block-device
//! contract that every storage driver implements, the on-flash partition
//! table, and the small utilities the drivers share (CRC32, circular
//! buffer, option parsing). It is `no_std` so the same code runs on the
//! bare-metal targets and inside host-side tests.
//!
//! # Features
//!
//! - `std` - Enable standard library support (host-side tests and tools)
//!
//! # Example
//!
//! ```ignore
//! use rloader_core::dev::{DevClass, Registry};
//!
//! fn boot(registry: &mut Registry<'_>) {
//!     registry.init_all();
//!     let mut buf = [0u8; 512];
//!     match registry.read(DevClass::Storage, 0, 0, &mut buf, 0) {
//!         Ok(n) => log::info!("read {} bytes", n),
//!         Err(e) => log::error!("read failed: {}", e),
//!     }
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod cbuffer;
pub mod crc32;
pub mod dev;
pub mod error;
pub mod optparse;
pub mod ptable;

pub use error::{Error, Result};
