//! rloader-dummy - In-memory block device emulator
//!
//! A storage device backed by a plain byte vector with flash-like
//! semantics: programming clears bits, erase sets a whole sector to 0xff,
//! sub-sector writes go through a write-back sector cache just like the
//! real NOR drivers. Useful for exercising the registry, the partition
//! table and shell commands without hardware.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
use std::vec;
#[cfg(feature = "std")]
use std::vec::Vec;

use rloader_core::dev::{Device, MapMode, MapResult, ERASE_ALL};
use rloader_core::{Error, Result};

/// Geometry of the emulated device.
#[derive(Debug, Clone)]
pub struct RamConfig {
    /// Device size in bytes.
    pub size: usize,
    /// Sector (erase block) size in bytes.
    pub sector_sz: usize,
}

impl Default for RamConfig {
    fn default() -> Self {
        Self {
            size: 1024 * 1024,
            sector_sz: 0x1000,
        }
    }
}

/// RAM-backed storage device.
#[cfg(feature = "std")]
pub struct RamStorage {
    config: RamConfig,
    mem: Vec<u8>,
    cache: Vec<u8>,
    cache_addr: Option<u64>,
    dirty: bool,
    initialized: bool,
    /// Fail the next N sector flushes with an I/O error.
    pub fail_flushes: usize,
}

#[cfg(feature = "std")]
impl RamStorage {
    /// New device, fully erased.
    pub fn new(config: RamConfig) -> Self {
        assert!(config.sector_sz.is_power_of_two());
        assert!(config.size % config.sector_sz == 0);

        let sector_sz = config.sector_sz;
        let size = config.size;
        Self {
            config,
            mem: vec![0xff; size],
            cache: vec![0xff; sector_sz],
            cache_addr: None,
            dirty: false,
            initialized: false,
            fail_flushes: 0,
        }
    }

    /// New device with the default geometry (1 MiB, 4 KiB sectors).
    pub fn new_default() -> Self {
        Self::new(RamConfig::default())
    }

    /// Backing bytes.
    pub fn mem(&self) -> &[u8] {
        &self.mem
    }

    /// Backing bytes, writable (test setup).
    pub fn mem_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    fn sector_addr(&self, addr: u64) -> u64 {
        addr & !(self.config.sector_sz as u64 - 1)
    }

    fn valid_range(&self, offs: u64, len: usize) -> bool {
        offs < self.config.size as u64 && offs + len as u64 <= self.config.size as u64
    }

    fn flush(&mut self) -> Result<()> {
        let addr = match self.cache_addr {
            Some(addr) if self.dirty => addr as usize,
            _ => return Ok(()),
        };

        if self.fail_flushes > 0 {
            self.fail_flushes -= 1;
            return Err(Error::Io);
        }

        let sector_sz = self.config.sector_sz;
        /* Erase, then program */
        self.mem[addr..addr + sector_sz].fill(0xff);
        for (i, &byte) in self.cache.iter().enumerate() {
            self.mem[addr + i] &= byte;
        }
        self.dirty = false;

        Ok(())
    }

    fn fill(&mut self, addr: u64) {
        let sector_sz = self.config.sector_sz;
        self.cache
            .copy_from_slice(&self.mem[addr as usize..addr as usize + sector_sz]);
        self.cache_addr = Some(addr);
    }
}

#[cfg(feature = "std")]
impl Device for RamStorage {
    fn init(&mut self, minor: u8) -> Result<()> {
        if minor != 0 {
            return Err(Error::NoDevice);
        }

        self.cache_addr = None;
        self.dirty = false;
        self.initialized = true;

        log::info!(
            "dev/dummy: configured {} KB ram storage({})",
            self.config.size / 1024,
            minor
        );

        Ok(())
    }

    fn done(&mut self, minor: u8) -> Result<()> {
        if minor != 0 {
            return Err(Error::NoDevice);
        }

        self.flush()?;
        self.initialized = false;

        Ok(())
    }

    fn read(&mut self, minor: u8, offs: u64, buf: &mut [u8], _timeout_ms: u64) -> Result<usize> {
        if minor != 0 || !self.initialized {
            return Err(Error::NoDevice);
        }
        if !self.valid_range(offs, buf.len()) {
            return Err(Error::Invalid);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let sector_sz = self.config.sector_sz;
        let mut offs = offs;
        let mut done = 0usize;

        if let Some(addr) = self.cache_addr {
            if self.sector_addr(offs) == addr {
                let in_sector = (addr as usize + sector_sz) - offs as usize;
                done = in_sector.min(buf.len());
                let cache_offs = (offs - addr) as usize;
                buf[..done].copy_from_slice(&self.cache[cache_offs..cache_offs + done]);

                if done == buf.len() {
                    return Ok(done);
                }
                offs += done as u64;
            }
        }

        let offs = offs as usize;
        let rest = buf.len() - done;
        buf[done..].copy_from_slice(&self.mem[offs..offs + rest]);

        Ok(done + rest)
    }

    fn write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        if minor != 0 || !self.initialized {
            return Err(Error::NoDevice);
        }
        if !self.valid_range(offs, data.len()) {
            return Err(Error::Invalid);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let sector_sz = self.config.sector_sz;
        let mut offs = offs;
        let mut done = 0usize;

        while done < data.len() {
            let curr = self.sector_addr(offs);
            let sector_offs = (offs - curr) as usize;
            let chunk = (sector_sz - sector_offs).min(data.len() - done);

            if self.cache_addr != Some(curr) {
                self.flush()?;
                self.fill(curr);
            }

            self.cache[sector_offs..sector_offs + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            self.dirty = true;

            offs += chunk as u64;
            done += chunk;
        }

        Ok(done)
    }

    fn erase(&mut self, minor: u8, offs: u64, len: usize, _flags: u32) -> Result<usize> {
        if minor != 0 || !self.initialized {
            return Err(Error::NoDevice);
        }

        let size = self.config.size as u64;
        let whole = len == ERASE_ALL;
        if offs >= size || (!whole && offs + len as u64 > size) {
            return Err(Error::Invalid);
        }
        if len == 0 {
            return Ok(0);
        }

        let (start, end) = if whole {
            (0u64, size)
        } else {
            (
                self.sector_addr(offs),
                self.sector_addr(offs + len as u64 + self.config.sector_sz as u64 - 1),
            )
        };

        if let Some(addr) = self.cache_addr {
            if addr >= start && addr < end {
                self.cache_addr = None;
                self.dirty = false;
            }
        }

        self.mem[start as usize..end as usize].fill(0xff);

        Ok((end - start) as usize)
    }

    fn sync(&mut self, minor: u8) -> Result<()> {
        if minor != 0 || !self.initialized {
            return Err(Error::NoDevice);
        }
        self.flush()
    }

    fn map(
        &mut self,
        minor: u8,
        addr: u64,
        size: usize,
        mode: MapMode,
        _memaddr: u64,
        _memsize: usize,
        memmode: MapMode,
    ) -> Result<MapResult> {
        if minor != 0 || !self.initialized {
            return Err(Error::NoDevice);
        }
        if addr + size as u64 >= self.config.size as u64 {
            return Err(Error::Invalid);
        }
        if !memmode.contains(mode) {
            return Err(Error::Invalid);
        }

        /* RAM storage has no device window: always copied */
        Ok(MapResult::NotMappable)
    }
}
