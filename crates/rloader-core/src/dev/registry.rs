//! Device registry: `(class, minor)` to driver dispatch
//!
//! Drivers register during a fixed, link-time-defined startup sequence
//! (`drivers_init` on the platform side), before the shell starts. After
//! that the table never changes, so registration failures are programming
//! errors and assert.

use super::{DevClass, Device, MapMode, MapResult};
use crate::error::{Error, Result};
use heapless::Vec;

/// Max driver entries across all classes.
const MAX_ENTRIES: usize = 8;
/// Max minors per registered driver (init-state bitmap width).
const MAX_MINORS: u8 = 8;

struct Entry<'a> {
    class: DevClass,
    base: u8,
    count: u8,
    /// Bitmap of successfully initialized minors (local numbering).
    active: u8,
    driver: &'a mut dyn Device,
}

/// The registry proper.
///
/// Holds one entry per registered driver plus the per-minor init state;
/// all per-device state lives inside the drivers.
pub struct Registry<'a> {
    entries: Vec<Entry<'a>, MAX_ENTRIES>,
    /// Next free minor per class.
    next_minor: [u8; DevClass::COUNT],
}

impl<'a> Registry<'a> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_minor: [0; DevClass::COUNT],
        }
    }

    /// Register `driver` for the next `count` minors of `class`, returning
    /// the base minor of the reserved range.
    ///
    /// Registration happens once at startup in a fixed order and never
    /// fails at runtime; capacity misuse asserts.
    pub fn register(&mut self, class: DevClass, count: u8, driver: &'a mut dyn Device) -> u8 {
        assert!(count > 0 && count <= MAX_MINORS, "bad minor count");

        let base = self.next_minor[class.index()];
        assert!(base.checked_add(count).is_some(), "minor range overflow");
        self.next_minor[class.index()] = base + count;

        let entry = Entry {
            class,
            base,
            count,
            active: 0,
            driver,
        };
        assert!(
            self.entries.push(entry).is_ok(),
            "registry entry table full"
        );

        base
    }

    fn entry_mut(&mut self, class: DevClass, minor: u8) -> Option<(&mut Entry<'a>, u8)> {
        self.entries
            .iter_mut()
            .find(|e| e.class == class && minor >= e.base && minor < e.base + e.count)
            .map(|e| {
                let local = minor - e.base;
                (e, local)
            })
    }

    /// Initialize `(class, minor)`. Idempotent: after the first success,
    /// later calls return `Ok` without re-invoking the driver.
    pub fn init(&mut self, class: DevClass, minor: u8) -> Result<()> {
        let (entry, local) = self.entry_mut(class, minor).ok_or(Error::NoDevice)?;

        if entry.active & (1 << local) != 0 {
            return Ok(());
        }

        entry.driver.init(local)?;
        entry.active |= 1 << local;

        Ok(())
    }

    /// Tear down `(class, minor)`. The driver flushes its cache; afterwards
    /// the instance counts as uninitialized again.
    pub fn done(&mut self, class: DevClass, minor: u8) -> Result<()> {
        let (entry, local) = self.entry_mut(class, minor).ok_or(Error::NoDevice)?;

        if entry.active & (1 << local) == 0 {
            return Err(Error::NoDevice);
        }

        entry.driver.done(local)?;
        entry.active &= !(1 << local);

        Ok(())
    }

    /// Initialize every registered minor, logging failures and carrying on.
    pub fn init_all(&mut self) {
        for i in 0..self.entries.len() {
            let (class, base, count) = {
                let e = &self.entries[i];
                (e.class, e.base, e.count)
            };
            for minor in base..base + count {
                if let Err(err) = self.init(class, minor) {
                    log::error!("dev: init {:?} minor {} failed: {}", class, minor, err);
                }
            }
        }
    }

    /// Tear down every initialized minor.
    pub fn done_all(&mut self) {
        for i in 0..self.entries.len() {
            let (class, base, count) = {
                let e = &self.entries[i];
                (e.class, e.base, e.count)
            };
            for minor in base..base + count {
                if let Err(err) = self.done(class, minor) {
                    if err != Error::NoDevice {
                        log::error!("dev: done {:?} minor {} failed: {}", class, minor, err);
                    }
                }
            }
        }
    }

    fn active_entry(&mut self, class: DevClass, minor: u8) -> Result<(&mut Entry<'a>, u8)> {
        let (entry, local) = self.entry_mut(class, minor).ok_or(Error::NoDevice)?;
        if entry.active & (1 << local) == 0 {
            return Err(Error::NoDevice);
        }
        Ok((entry, local))
    }

    /// Forward a read to the driver behind `(class, minor)`.
    pub fn read(
        &mut self,
        class: DevClass,
        minor: u8,
        offs: u64,
        buf: &mut [u8],
        timeout_ms: u64,
    ) -> Result<usize> {
        let (entry, local) = self.active_entry(class, minor)?;
        entry.driver.read(local, offs, buf, timeout_ms)
    }

    /// Forward a write.
    pub fn write(&mut self, class: DevClass, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        let (entry, local) = self.active_entry(class, minor)?;
        entry.driver.write(local, offs, data)
    }

    /// Forward an erase.
    pub fn erase(
        &mut self,
        class: DevClass,
        minor: u8,
        offs: u64,
        len: usize,
        flags: u32,
    ) -> Result<usize> {
        let (entry, local) = self.active_entry(class, minor)?;
        entry.driver.erase(local, offs, len, flags)
    }

    /// Forward a sync.
    pub fn sync(&mut self, class: DevClass, minor: u8) -> Result<()> {
        let (entry, local) = self.active_entry(class, minor)?;
        entry.driver.sync(local)
    }

    /// Forward a map query.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        class: DevClass,
        minor: u8,
        addr: u64,
        size: usize,
        mode: MapMode,
        memaddr: u64,
        memsize: usize,
        memmode: MapMode,
    ) -> Result<MapResult> {
        let (entry, local) = self.active_entry(class, minor)?;
        entry
            .driver
            .map(local, addr, size, mode, memaddr, memsize, memmode)
    }
}

impl Default for Registry<'_> {
    fn default() -> Self {
        Self::new()
    }
}
