//! Device classes, the block-device contract, and the registry
//!
//! Every driver implements the [`Device`] trait and registers a
//! contiguous minor range under one of the closed [`DevClass`] tags. The
//! registry is the only globally addressable surface: the shell and the
//! partition loader dispatch by `(class, minor)` and never see a concrete
//! driver type.

mod registry;

pub use registry::Registry;

use crate::error::Result;
use bitflags::bitflags;

/// Erase length meaning "the whole device" (a single chip erase when the
/// hardware has one, otherwise a full sector-erase sweep).
pub const ERASE_ALL: usize = usize::MAX;

/// Closed set of device classes the registry recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevClass {
    /// Raw UART byte pipe
    Uart,
    /// Console TTY
    Tty,
    /// Block storage (parallel NOR, serial NOR, SD)
    Storage,
    /// NAND data area (ECC-protected page data)
    NandData,
    /// NAND raw area (page + OOB bytes, no ECC)
    NandRaw,
    /// NAND per-page user metadata
    NandMeta,
}

impl DevClass {
    /// Number of classes (registry table dimension).
    pub const COUNT: usize = 6;

    pub(crate) fn index(self) -> usize {
        match self {
            DevClass::Uart => 0,
            DevClass::Tty => 1,
            DevClass::Storage => 2,
            DevClass::NandData => 3,
            DevClass::NandRaw => 4,
            DevClass::NandMeta => 5,
        }
    }
}

bitflags! {
    /// Access mode of a device region or a memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapMode: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
    }
}

/// Outcome of a successful [`Device::map`] query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapResult {
    /// The device window covers the requested range in place; the value is
    /// the device's memory-mapped base address.
    Mappable(usize),
    /// Data must be copied through I/O.
    NotMappable,
}

/// The device-operations table every driver implements.
///
/// A driver instance serves a contiguous minor range; `minor` is always
/// local to the driver (the registry subtracts the range base). All
/// offsets are byte addresses into a flat device space.
///
/// # Contract
///
/// - `read` returns at most `buf.len()` bytes; a read at or past the end
///   of the device returns 0 or `Invalid` per driver; reads may be served
///   from the driver's write-back cache.
/// - `write` has byte granularity from the caller's point of view: bytes
///   outside the written range within the same sector are preserved
///   through a read-modify-erase-write cycle in the cache.
/// - `erase` rounds the range outward to sector boundaries and returns
///   the rounded byte count; [`ERASE_ALL`] means whole-device erase.
/// - `sync` flushes the write-back cache and is a no-op when the cache is
///   clean. A failed sync leaves the cache dirty so the caller can retry.
/// - `map` answers whether the region can be used in place at the given
///   memory window; the requested access mode must be a subset of the
///   hardware mode for the copy path.
pub trait Device {
    /// Probe and initialize the instance. Called once by the registry.
    fn init(&mut self, minor: u8) -> Result<()>;

    /// Flush and tear down the instance.
    fn done(&mut self, minor: u8) -> Result<()>;

    /// Read up to `buf.len()` bytes at `offs`, returning the byte count.
    ///
    /// `timeout_ms` only matters for devices that can block indefinitely
    /// (console input); storage reads complete synchronously.
    fn read(&mut self, minor: u8, offs: u64, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;

    /// Write `data` at `offs`, returning the byte count consumed.
    fn write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize>;

    /// Erase every sector intersecting `[offs, offs + len)`.
    fn erase(&mut self, minor: u8, offs: u64, len: usize, flags: u32) -> Result<usize>;

    /// Flush the write-back cache.
    fn sync(&mut self, minor: u8) -> Result<()>;

    /// Query whether `[addr, addr + size)` on the device can be used in
    /// place inside the memory window `[memaddr, memaddr + memsize)`.
    #[allow(clippy::too_many_arguments)]
    fn map(
        &mut self,
        minor: u8,
        addr: u64,
        size: usize,
        mode: MapMode,
        memaddr: u64,
        memsize: usize,
        memmode: MapMode,
    ) -> Result<MapResult>;
}
