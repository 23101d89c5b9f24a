//! NAND block devices: data, meta and raw
//!
//! One [`NandDriver`] owns the write-back cache shared by the whole NAND
//! complex: the last-read page and the last-written eraseblock. The three
//! device classes are thin adapters over a `RefCell`-shared driver, the
//! single-threaded equivalent of the original's process-wide state - the
//! meta and raw devices must flush the data device's cache before they
//! touch the chip.
//!
//! Bad-block policy: reads and writes skip bad blocks; a failed page read
//! or block program marks the block bad and, on sync, the cached data
//! moves forward to the next good block. The meta device never skips bad
//! blocks, because it is the mechanism by which blocks get marked.

use crate::chip::{PageMeta, PageNand, META_SIZE, RAW_MAX};
use core::cell::RefCell;
use rloader_core::dev::{Device, MapMode, MapResult};
use rloader_core::{Error, Result};

/// Chips served per driver (GPMI and BCH support up to 4 chip selects;
/// current platforms populate one).
const NAND_CNT: u8 = 1;

/// Largest page the page cache holds.
pub const PAGE_CACHE_MAX: usize = 4096;
/// Largest eraseblock the write cache holds.
pub const BLOCK_CACHE_MAX: usize = 64 * 4096;

/// The NAND driver proper: chip engine plus the shared caches.
pub struct NandDriver<N: PageNand> {
    chip: N,
    meta: PageMeta,
    /// Last-read page cache.
    rvalid: bool,
    rpage: u32,
    /// Last-written eraseblock cache. `wblock` keeps its value after a
    /// sync so the write path can see where the data landed.
    wvalid: bool,
    wblock: u32,
    page_buf: [u8; PAGE_CACHE_MAX],
    block_buf: [u8; BLOCK_CACHE_MAX],
    raw_buf: [u8; RAW_MAX],
}

impl<N: PageNand> NandDriver<N> {
    /// Wrap a page engine; the chip is probed on the data device's init.
    pub fn new(chip: N) -> Self {
        Self {
            chip,
            meta: PageMeta::new(),
            rvalid: false,
            rpage: 0,
            wvalid: false,
            wblock: 0,
            page_buf: [0xff; PAGE_CACHE_MAX],
            block_buf: [0xff; BLOCK_CACHE_MAX],
            raw_buf: [0xff; RAW_MAX],
        }
    }

    fn check_minor(&self, minor: u8) -> Result<()> {
        if minor >= NAND_CNT {
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    /// Flush the eraseblock cache, retrying forward past blocks that turn
    /// out bad. Also drops the page cache.
    fn do_sync(&mut self) -> Result<()> {
        self.rvalid = false;

        if !self.wvalid {
            return Ok(());
        }

        let info = self.chip.info()?;
        let nblocks = info.block_count();
        let npages = info.pages_per_block();
        let pagesz = info.pagesz as usize;

        loop {
            /* The cached block might have become a bad block */
            while self.wblock < nblocks && self.chip.is_bad(self.wblock) {
                self.wblock += 1;
            }

            /* Fatal, no good block left for the data */
            if self.wblock >= nblocks {
                return Err(Error::NoSpace);
            }

            let mut res = self.chip.erase(self.wblock);
            if res.is_ok() {
                for i in 0..npages as usize {
                    res = self.chip.write(
                        self.wblock * npages + i as u32,
                        &self.block_buf[i * pagesz..(i + 1) * pagesz],
                        None,
                    );
                    if res.is_err() {
                        break;
                    }
                }
            }

            match res {
                Ok(()) => {
                    self.wvalid = false;
                    return Ok(());
                }
                Err(_) => {
                    /* Mark the failing block bad and move the data on */
                    if self.chip.mark_bad(self.wblock).is_err() {
                        return Err(Error::Io);
                    }
                    self.wblock += 1;
                }
            }
        }
    }

    // =========================================================================
    // Data device
    // =========================================================================

    fn data_init(&mut self, minor: u8) -> Result<()> {
        self.check_minor(minor)?;

        let info = self.chip.probe()?;

        if info.pagesz as usize > PAGE_CACHE_MAX || info.erasesz as usize > BLOCK_CACHE_MAX {
            return Err(Error::Invalid);
        }

        log::info!("dev/flash/nand: configured {}({})", info.name, minor);

        Ok(())
    }

    fn data_done(&mut self, minor: u8) -> Result<()> {
        self.check_minor(minor)?;
        self.do_sync()
    }

    fn data_read(&mut self, minor: u8, offs: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;

        if offs >= info.size {
            return Err(Error::Invalid);
        }

        let len = buf.len().min((info.size - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        let erasesz = info.erasesz as usize;
        let pagesz = info.pagesz as usize;
        let nblocks = info.block_count();
        let npages = info.pages_per_block();

        let mut boffs = (offs % erasesz as u64) as usize;
        let mut block = (offs / erasesz as u64) as u32;
        let mut ret = 0usize;

        while block < nblocks && ret < len {
            /* Skip bad blocks */
            if self.chip.is_bad(block) {
                block += 1;
                continue;
            }

            if self.wvalid && self.wblock == block {
                /* Serve from the write cache */
                let chunk = (len - ret).min(erasesz - boffs);
                buf[ret..ret + chunk].copy_from_slice(&self.block_buf[boffs..boffs + chunk]);
                ret += chunk;
            } else {
                let mut poffs = boffs % pagesz;
                let mut page = block * npages + (boffs / pagesz) as u32;

                while page < (block + 1) * npages && ret < len {
                    if !(self.rvalid && self.rpage == page) {
                        let res =
                            self.chip
                                .read(page, &mut self.page_buf[..pagesz], &mut self.meta);
                        if res.is_err() {
                            /* Block data is lost, mark it bad */
                            self.rvalid = false;
                            let _ = self.chip.mark_bad(block);
                            return Err(Error::Io);
                        }
                        self.rvalid = true;
                        self.rpage = page;
                    }

                    let chunk = (len - ret).min(pagesz - poffs);
                    buf[ret..ret + chunk].copy_from_slice(&self.page_buf[poffs..poffs + chunk]);
                    ret += chunk;
                    poffs = 0;
                    page += 1;
                }
            }

            boffs = 0;
            block += 1;
        }

        Ok(ret.min(len))
    }

    fn data_write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;

        if offs >= info.size {
            return Err(Error::Invalid);
        }

        let len = data.len().min((info.size - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        self.rvalid = false;

        let erasesz = info.erasesz as usize;
        let pagesz = info.pagesz as usize;
        let nblocks = info.block_count();
        let npages = info.pages_per_block();

        let mut boffs = (offs % erasesz as u64) as usize;
        let mut block = (offs / erasesz as u64) as u32;
        let mut ret = 0usize;

        while block < nblocks && ret < len {
            if self.chip.is_bad(block) {
                block += 1;
                continue;
            }

            if !(self.wvalid && self.wblock == block) {
                if self.wvalid {
                    let cblock = self.wblock;
                    self.do_sync()?;

                    /* The cached data may have been forwarded into our
                     * target range by bad-block retries; resume past it */
                    if block > cblock && block <= self.wblock {
                        block = self.wblock + 1;
                        continue;
                    }
                }

                /* Fill the cache around the area about to be written */
                let mut res: Result<()> = Ok(());
                let mut i = 0usize;
                while i * pagesz < boffs {
                    res = self.chip.read(
                        block * npages + i as u32,
                        &mut self.block_buf[i * pagesz..(i + 1) * pagesz],
                        &mut self.meta,
                    );
                    if res.is_err() {
                        break;
                    }
                    i += 1;
                }

                if res.is_ok() {
                    i = i.max((boffs + len - ret) / pagesz);
                    while i < npages as usize {
                        res = self.chip.read(
                            block * npages + i as u32,
                            &mut self.block_buf[i * pagesz..(i + 1) * pagesz],
                            &mut self.meta,
                        );
                        if res.is_err() {
                            break;
                        }
                        i += 1;
                    }
                }

                if res.is_err() {
                    /* Block data is lost, mark it bad and move on */
                    if self.chip.mark_bad(block).is_err() {
                        return Err(Error::Io);
                    }
                    block += 1;
                    continue;
                }

                self.wvalid = true;
                self.wblock = block;
            }

            let chunk = (len - ret).min(erasesz - boffs);
            self.block_buf[boffs..boffs + chunk].copy_from_slice(&data[ret..ret + chunk]);
            ret += chunk;
            boffs = 0;
            block += 1;
        }

        Ok(ret.min(len))
    }

    fn data_erase(&mut self, minor: u8, offs: u64, len: usize) -> Result<usize> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;

        if offs >= info.size {
            return Err(Error::Invalid);
        }

        let len = len.min((info.size - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        self.rvalid = false;

        let erasesz = info.erasesz as usize;
        let pagesz = info.pagesz as usize;
        let nblocks = info.block_count();
        let npages = info.pages_per_block();

        let mut boffs = (offs % erasesz as u64) as usize;
        let mut block = (offs / erasesz as u64) as u32;
        let mut ret = 0usize;

        while block < nblocks && ret < len {
            if self.chip.is_bad(block) {
                block += 1;
                continue;
            }

            if boffs != 0 || ret + erasesz > len {
                /* Partial block: clear the range through the cache */
                if !(self.wvalid && self.wblock == block) {
                    if self.wvalid {
                        self.do_sync()?;
                    }

                    let mut res: Result<()> = Ok(());
                    for i in 0..npages as usize {
                        res = self.chip.read(
                            block * npages + i as u32,
                            &mut self.block_buf[i * pagesz..(i + 1) * pagesz],
                            &mut self.meta,
                        );
                        if res.is_err() {
                            break;
                        }
                    }

                    if res.is_err() {
                        if self.chip.mark_bad(block).is_err() {
                            return Err(Error::Io);
                        }
                        block += 1;
                        continue;
                    }

                    self.wvalid = true;
                    self.wblock = block;
                }

                let chunk = (len - ret).min(erasesz - boffs);
                self.block_buf[boffs..boffs + chunk].fill(0xff);
                ret += chunk;
                boffs = 0;
            } else {
                /* Full block erase */
                if self.wvalid && self.wblock == block {
                    self.wvalid = false;
                }

                match self.chip.erase(block) {
                    Err(_) => {
                        if self.chip.mark_bad(block).is_err() {
                            return Err(Error::Io);
                        }
                    }
                    Ok(()) => ret += erasesz,
                }
            }

            block += 1;
        }

        Ok(ret)
    }

    fn data_sync(&mut self, minor: u8) -> Result<()> {
        self.check_minor(minor)?;
        self.do_sync()
    }

    fn nand_map(
        &mut self,
        minor: u8,
        mode: MapMode,
        memmode: MapMode,
    ) -> Result<MapResult> {
        self.check_minor(minor)?;

        /* Device mode cannot exceed the map mode when data is copied */
        if !memmode.contains(mode) {
            return Err(Error::Invalid);
        }

        /* NAND has no memory-mapped window */
        Ok(MapResult::NotMappable)
    }

    // =========================================================================
    // Meta device: per-page user metadata as a flat byte space
    // =========================================================================

    fn meta_total(&self) -> Result<u64> {
        let info = self.chip.info()?;
        Ok((info.size / info.pagesz as u64) * info.metasz as u64)
    }

    fn meta_init(&mut self, minor: u8) -> Result<()> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;
        log::info!("dev/nand/meta: configured {}({})", info.name, minor);
        Ok(())
    }

    fn meta_read(&mut self, minor: u8, offs: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;
        let metasz = info.metasz as usize;
        let total = self.meta_total()?;

        if offs >= total || offs % metasz as u64 != 0 {
            return Err(Error::Invalid);
        }

        let len = buf.len().min((total - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        /* The data device's cache may hold newer metadata-bearing pages */
        self.do_sync()?;

        let mut page = (offs / metasz as u64) as u32;
        let mut ret = 0usize;

        while ret < len {
            if self.chip.read_meta(page, &mut self.meta).is_err() {
                return Err(Error::Io);
            }

            let chunk = (len - ret).min(metasz);
            buf[ret..ret + chunk].copy_from_slice(&self.meta.metadata[..chunk]);
            ret += chunk;
            page += 1;
        }

        Ok(ret)
    }

    fn meta_write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;
        let metasz = info.metasz as usize;
        let total = self.meta_total()?;

        if offs >= total || offs % metasz as u64 != 0 {
            return Err(Error::Invalid);
        }

        let len = data.len().min((total - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        self.do_sync()?;

        let mut page = (offs / metasz as u64) as u32;
        let mut ret = 0usize;

        while ret < len {
            /* No bad-block skipping: this device is how blocks get marked */
            let chunk = (len - ret).min(metasz);

            let mut padded = [0xffu8; META_SIZE];
            let padded = &mut padded[..metasz];
            padded[..chunk].copy_from_slice(&data[ret..ret + chunk]);

            if self.chip.write_meta(page, padded).is_err() {
                return Err(Error::Io);
            }

            ret += chunk;
            page += 1;
        }

        Ok(ret)
    }

    // =========================================================================
    // Raw device: page + metadata bytes, no ECC
    // =========================================================================

    fn raw_pagesz(&self) -> Result<usize> {
        let info = self.chip.info()?;
        Ok((info.pagesz + info.metasz) as usize)
    }

    fn raw_total(&self) -> Result<u64> {
        let info = self.chip.info()?;
        Ok((info.size / info.pagesz as u64) * self.raw_pagesz()? as u64)
    }

    fn raw_init(&mut self, minor: u8) -> Result<()> {
        self.check_minor(minor)?;
        let info = self.chip.info()?;
        log::info!("dev/nand/raw: configured {}({})", info.name, minor);
        Ok(())
    }

    fn raw_read(&mut self, minor: u8, offs: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_minor(minor)?;
        let raw_pagesz = self.raw_pagesz()?;
        let total = self.raw_total()?;

        if offs >= total {
            return Err(Error::Invalid);
        }

        let len = buf.len().min((total - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        self.do_sync()?;

        let mut ret = 0usize;
        while ret < len {
            let page = ((offs + ret as u64) / raw_pagesz as u64) as u32;
            let poffs = ((offs + ret as u64) % raw_pagesz as u64) as usize;
            let chunk = (len - ret).min(raw_pagesz - poffs);

            let raw_buf = &mut self.raw_buf[..raw_pagesz];
            if self.chip.read_raw(page, raw_buf).is_err() {
                return Err(Error::Io);
            }
            buf[ret..ret + chunk].copy_from_slice(&self.raw_buf[poffs..poffs + chunk]);

            ret += chunk;
        }

        Ok(ret)
    }

    fn raw_write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        self.check_minor(minor)?;
        let raw_pagesz = self.raw_pagesz()?;
        let total = self.raw_total()?;

        if offs >= total || offs % raw_pagesz as u64 != 0 {
            return Err(Error::Invalid);
        }

        let len = data.len().min((total - offs) as usize);
        if len == 0 {
            return Ok(0);
        }

        self.do_sync()?;

        let mut ret = 0usize;
        while ret < len {
            let page = ((offs + ret as u64) / raw_pagesz as u64) as u32;
            let chunk = (len - ret).min(raw_pagesz);

            self.raw_buf[..chunk].copy_from_slice(&data[ret..ret + chunk]);
            let raw_buf = &self.raw_buf[..chunk];
            if self.chip.write_raw(page, raw_buf).is_err() {
                return Err(Error::Io);
            }

            ret += chunk;
        }

        Ok(ret)
    }
}

/// Shared driver handle the three device adapters borrow.
pub type SharedNand<N> = RefCell<NandDriver<N>>;

/// The NAND data device (ECC page data, bad-block managed).
pub struct NandData<'a, N: PageNand>(&'a SharedNand<N>);

impl<'a, N: PageNand> NandData<'a, N> {
    /// Adapter over a shared driver.
    pub fn new(shared: &'a SharedNand<N>) -> Self {
        Self(shared)
    }
}

impl<N: PageNand> Device for NandData<'_, N> {
    fn init(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().data_init(minor)
    }

    fn done(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().data_done(minor)
    }

    fn read(&mut self, minor: u8, offs: u64, buf: &mut [u8], _timeout_ms: u64) -> Result<usize> {
        self.0.borrow_mut().data_read(minor, offs, buf)
    }

    fn write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        self.0.borrow_mut().data_write(minor, offs, data)
    }

    fn erase(&mut self, minor: u8, offs: u64, len: usize, _flags: u32) -> Result<usize> {
        self.0.borrow_mut().data_erase(minor, offs, len)
    }

    fn sync(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().data_sync(minor)
    }

    fn map(
        &mut self,
        minor: u8,
        _addr: u64,
        _size: usize,
        mode: MapMode,
        _memaddr: u64,
        _memsize: usize,
        memmode: MapMode,
    ) -> Result<MapResult> {
        self.0.borrow_mut().nand_map(minor, mode, memmode)
    }
}

/// The NAND metadata device.
///
/// Relies on the data device for chip bring-up.
pub struct NandMeta<'a, N: PageNand>(&'a SharedNand<N>);

impl<'a, N: PageNand> NandMeta<'a, N> {
    /// Adapter over a shared driver.
    pub fn new(shared: &'a SharedNand<N>) -> Self {
        Self(shared)
    }
}

impl<N: PageNand> Device for NandMeta<'_, N> {
    fn init(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().meta_init(minor)
    }

    fn done(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().check_minor(minor)
    }

    fn read(&mut self, minor: u8, offs: u64, buf: &mut [u8], _timeout_ms: u64) -> Result<usize> {
        self.0.borrow_mut().meta_read(minor, offs, buf)
    }

    fn write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        self.0.borrow_mut().meta_write(minor, offs, data)
    }

    fn erase(&mut self, _minor: u8, _offs: u64, _len: usize, _flags: u32) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn sync(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().check_minor(minor)
    }

    fn map(
        &mut self,
        _minor: u8,
        _addr: u64,
        _size: usize,
        _mode: MapMode,
        _memaddr: u64,
        _memsize: usize,
        _memmode: MapMode,
    ) -> Result<MapResult> {
        Err(Error::NotSupported)
    }
}

/// The NAND raw device (page + metadata bytes, no ECC).
///
/// Relies on the data device for chip bring-up.
pub struct NandRaw<'a, N: PageNand>(&'a SharedNand<N>);

impl<'a, N: PageNand> NandRaw<'a, N> {
    /// Adapter over a shared driver.
    pub fn new(shared: &'a SharedNand<N>) -> Self {
        Self(shared)
    }
}

impl<N: PageNand> Device for NandRaw<'_, N> {
    fn init(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().raw_init(minor)
    }

    fn done(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().check_minor(minor)
    }

    fn read(&mut self, minor: u8, offs: u64, buf: &mut [u8], _timeout_ms: u64) -> Result<usize> {
        self.0.borrow_mut().raw_read(minor, offs, buf)
    }

    fn write(&mut self, minor: u8, offs: u64, data: &[u8]) -> Result<usize> {
        self.0.borrow_mut().raw_write(minor, offs, data)
    }

    fn erase(&mut self, _minor: u8, _offs: u64, _len: usize, _flags: u32) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn sync(&mut self, minor: u8) -> Result<()> {
        self.0.borrow_mut().check_minor(minor)
    }

    fn map(
        &mut self,
        _minor: u8,
        _addr: u64,
        _size: usize,
        _mode: MapMode,
        _memaddr: u64,
        _memsize: usize,
        _memmode: MapMode,
    ) -> Result<MapResult> {
        Err(Error::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bch::BchEcc;
    use crate::chip::{NandInfo, META_SIZE};
    use std::vec;
    use std::vec::Vec;

    static TEST_ECC: BchEcc = BchEcc {
        blocksz0: 0,
        blockszn: 512,
        nblocks: 8,
        ecc0: 16,
        eccn: 8,
        gf0: 13,
        gfn: 13,
    };

    /// 8 blocks of 4 pages of 4 KiB.
    static TEST_INFO: NandInfo = NandInfo {
        name: "mocknand",
        manid: 0x00,
        devid: 0x00,
        size: 8 * 4 * 4096,
        erasesz: 4 * 4096,
        pagesz: 4096,
        oobsz: 256,
        metasz: 16,
        ecc: &TEST_ECC,
    };

    const PAGESZ: usize = 4096;
    const BLOCKSZ: usize = 4 * PAGESZ;
    const NPAGES: u32 = 4;
    const NBLOCKS: u32 = 8;

    /// Page-level chip emulator with fault injection.
    struct MockNand {
        pages: Vec<[u8; PAGESZ]>,
        metas: Vec<[u8; META_SIZE]>,
        erases: Vec<u32>,
        /// Page programs fail inside these blocks.
        fail_write_blocks: Vec<u32>,
        /// Page reads fail on these pages.
        fail_read_pages: Vec<u32>,
    }

    impl MockNand {
        fn new() -> Self {
            Self {
                pages: vec![[0xff; PAGESZ]; (NBLOCKS * NPAGES) as usize],
                metas: vec![[0xff; META_SIZE]; (NBLOCKS * NPAGES) as usize],
                erases: Vec::new(),
                fail_write_blocks: Vec::new(),
                fail_read_pages: Vec::new(),
            }
        }

        fn set_bad(&mut self, block: u32) {
            self.metas[(block * NPAGES) as usize][0] = 0x00;
        }

        fn block_data(&self, block: u32) -> Vec<u8> {
            let mut out = Vec::new();
            for i in 0..NPAGES {
                out.extend_from_slice(&self.pages[(block * NPAGES + i) as usize]);
            }
            out
        }
    }

    impl PageNand for MockNand {
        fn probe(&mut self) -> Result<&'static NandInfo> {
            Ok(&TEST_INFO)
        }

        fn shutdown(&mut self) {}

        fn info(&self) -> Result<&'static NandInfo> {
            Ok(&TEST_INFO)
        }

        fn read(&mut self, page: u32, data: &mut [u8], meta: &mut PageMeta) -> Result<()> {
            if self.fail_read_pages.contains(&page) {
                return Err(Error::EccFault);
            }
            data.copy_from_slice(&self.pages[page as usize][..data.len()]);
            meta.metadata = self.metas[page as usize];
            Ok(())
        }

        fn read_meta(&mut self, page: u32, meta: &mut PageMeta) -> Result<()> {
            if self.fail_read_pages.contains(&page) {
                return Err(Error::EccFault);
            }
            meta.metadata = self.metas[page as usize];
            Ok(())
        }

        fn read_raw(&mut self, page: u32, buf: &mut [u8]) -> Result<()> {
            let n = buf.len().min(PAGESZ);
            buf[..n].copy_from_slice(&self.pages[page as usize][..n]);
            if buf.len() > PAGESZ {
                let m = (buf.len() - PAGESZ).min(META_SIZE);
                buf[PAGESZ..PAGESZ + m].copy_from_slice(&self.metas[page as usize][..m]);
            }
            Ok(())
        }

        fn write(&mut self, page: u32, data: &[u8], meta: Option<&[u8]>) -> Result<()> {
            if self.fail_write_blocks.contains(&(page / NPAGES)) {
                return Err(Error::Io);
            }
            for (i, &byte) in data.iter().enumerate() {
                self.pages[page as usize][i] &= byte;
            }
            if let Some(meta) = meta {
                for (i, &byte) in meta.iter().take(META_SIZE).enumerate() {
                    self.metas[page as usize][i] &= byte;
                }
            }
            Ok(())
        }

        fn write_meta(&mut self, page: u32, meta: &[u8]) -> Result<()> {
            for (i, &byte) in meta.iter().take(META_SIZE).enumerate() {
                self.metas[page as usize][i] &= byte;
            }
            Ok(())
        }

        fn write_raw(&mut self, page: u32, buf: &[u8]) -> Result<()> {
            let n = buf.len().min(PAGESZ);
            for (i, &byte) in buf[..n].iter().enumerate() {
                self.pages[page as usize][i] &= byte;
            }
            if buf.len() > PAGESZ {
                let m = (buf.len() - PAGESZ).min(META_SIZE);
                for i in 0..m {
                    self.metas[page as usize][i] &= buf[PAGESZ + i];
                }
            }
            Ok(())
        }

        fn erase(&mut self, block: u32) -> Result<()> {
            for i in 0..NPAGES {
                self.pages[(block * NPAGES + i) as usize].fill(0xff);
                self.metas[(block * NPAGES + i) as usize].fill(0xff);
            }
            self.erases.push(block);
            Ok(())
        }

        fn is_bad(&mut self, block: u32) -> bool {
            self.metas[(block * NPAGES) as usize][0] == 0x00
        }

        fn mark_bad(&mut self, block: u32) -> Result<()> {
            self.set_bad(block);
            Ok(())
        }
    }

    fn driver() -> NandDriver<MockNand> {
        let mut driver = NandDriver::new(MockNand::new());
        driver.data_init(0).unwrap();
        driver
    }

    #[test]
    fn test_read_after_write_unaligned() {
        let mut driver = driver();

        let data: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        assert_eq!(driver.data_write(0, 0x333, &data).unwrap(), 10_000);
        driver.data_sync(0).unwrap();

        let mut out = vec![0u8; 10_000];
        assert_eq!(driver.data_read(0, 0x333, &mut out).unwrap(), 10_000);
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_preserves_neighbors() {
        let mut driver = driver();

        driver.data_write(0, 0, &[0x11u8; BLOCKSZ]).unwrap();
        driver.data_sync(0).unwrap();

        driver.data_write(0, 0x100, &[0x22u8; 0x40]).unwrap();
        driver.data_sync(0).unwrap();

        let mut out = vec![0u8; 0x200];
        driver.data_read(0, 0, &mut out).unwrap();
        assert!(out[..0x100].iter().all(|&b| b == 0x11));
        assert!(out[0x100..0x140].iter().all(|&b| b == 0x22));
        assert!(out[0x140..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_reads_served_from_write_cache() {
        let mut driver = driver();

        driver.data_write(0, 0x80, &[0xabu8; 0x40]).unwrap();

        // Not synced yet: the chip still holds erased bytes, the cache
        // serves the new data
        let mut out = [0u8; 0x40];
        driver.data_read(0, 0x80, &mut out).unwrap();
        assert_eq!(out, [0xab; 0x40]);
        assert!(driver.chip.pages[0][0x80..0xc0].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_bad_block_skipped_on_write_and_read() {
        let mut driver = driver();
        driver.chip.set_bad(1);

        // Spans what would be blocks 0..3; block 1 must be skipped
        let data: Vec<u8> = (0..3 * BLOCKSZ).map(|i| (i % 239) as u8).collect();
        driver.data_write(0, 0, &data).unwrap();
        driver.data_sync(0).unwrap();

        // The bad block was never programmed or erased
        assert!(driver.chip.is_bad(1));
        assert!(!driver.chip.erases.contains(&1));
        assert!(driver.chip.block_data(1)[16..].iter().all(|&b| b == 0xff));

        // Data is laid out on blocks 0, 2, 3 and reads back contiguously
        let mut out = vec![0u8; 3 * BLOCKSZ];
        driver.data_read(0, 0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_sync_retries_on_next_good_block() {
        let mut driver = driver();

        // Block 2 accepts no programs: sync must mark it bad and move the
        // cached data forward to block 3
        driver.chip.fail_write_blocks.push(2);

        let data = vec![0x5au8; 0x100];
        driver.data_write(0, (2 * BLOCKSZ) as u64, &data).unwrap();
        driver.data_sync(0).unwrap();

        assert!(driver.chip.is_bad(2));
        assert_eq!(driver.wblock, 3);
        assert!(driver.chip.block_data(3)[..0x100].iter().all(|&b| b == 0x5a));

        // Reading the same logical range now lands on block 3
        let mut out = vec![0u8; 0x100];
        driver.data_read(0, (2 * BLOCKSZ) as u64, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_sync_out_of_good_blocks() {
        let mut driver = driver();

        for block in 0..NBLOCKS {
            if block != 6 {
                driver.chip.set_bad(block);
            }
        }
        driver.chip.fail_write_blocks.push(6);

        driver
            .data_write(0, (6 * BLOCKSZ) as u64, &[0u8; 0x10])
            .unwrap();
        assert_eq!(driver.data_sync(0), Err(Error::NoSpace));
    }

    #[test]
    fn test_cached_data_forwarded_into_write_range() {
        let mut driver = driver();

        // Cache data for block 0, which will refuse to program
        driver.chip.fail_write_blocks.push(0);
        let first = vec![0x11u8; 0x20];
        driver.data_write(0, 0, &first).unwrap();

        // Writing block 1 forces a sync: block 0 goes bad, its data
        // forwards into block 1, and the new data must land beyond it
        let second = vec![0x22u8; 0x20];
        driver.data_write(0, BLOCKSZ as u64, &second).unwrap();
        driver.data_sync(0).unwrap();

        assert!(driver.chip.is_bad(0));
        assert!(driver.chip.block_data(1)[..0x20].iter().all(|&b| b == 0x11));
        assert!(driver.chip.block_data(2)[..0x20].iter().all(|&b| b == 0x22));

        // Logical reads follow the same skip rules
        let mut out = [0u8; 0x20];
        driver.data_read(0, 0, &mut out).unwrap();
        assert_eq!(out, [0x11; 0x20]);
    }

    #[test]
    fn test_partial_erase_through_cache() {
        let mut driver = driver();

        driver.data_write(0, 0, &[0x33u8; BLOCKSZ]).unwrap();
        driver.data_sync(0).unwrap();
        driver.chip.erases.clear();

        // Erase the middle of block 0
        let done = driver.data_erase(0, 0x1000, 0x800).unwrap();
        assert_eq!(done, 0x800);
        // No physical erase yet; the clear lives in the cache
        assert!(driver.chip.erases.is_empty());

        driver.data_sync(0).unwrap();

        let mut out = vec![0u8; BLOCKSZ];
        driver.data_read(0, 0, &mut out).unwrap();
        assert!(out[..0x1000].iter().all(|&b| b == 0x33));
        assert!(out[0x1000..0x1800].iter().all(|&b| b == 0xff));
        assert!(out[0x1800..].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_full_block_erase() {
        let mut driver = driver();

        driver.data_write(0, 0, &[0x44u8; 2 * BLOCKSZ]).unwrap();
        driver.data_sync(0).unwrap();
        driver.chip.erases.clear();

        let done = driver.data_erase(0, 0, BLOCKSZ).unwrap();
        assert_eq!(done, BLOCKSZ);
        assert_eq!(driver.chip.erases, vec![0]);

        let mut out = vec![0u8; 2 * BLOCKSZ];
        driver.data_read(0, 0, &mut out).unwrap();
        assert!(out[..BLOCKSZ].iter().all(|&b| b == 0xff));
        assert!(out[BLOCKSZ..].iter().all(|&b| b == 0x44));
    }

    #[test]
    fn test_range_erase_skips_bad_blocks() {
        let mut driver = driver();
        driver.chip.set_bad(1);

        let done = driver.data_erase(0, 0, 3 * BLOCKSZ).unwrap();
        // The bad block is skipped and the erase extends over the next
        // good one to cover the requested length
        assert_eq!(done, 3 * BLOCKSZ);
        assert_eq!(driver.chip.erases, vec![0, 2, 3]);
        assert!(driver.chip.is_bad(1));
    }

    #[test]
    fn test_failed_read_marks_block_bad() {
        let mut driver = driver();
        driver.chip.fail_read_pages.push(5); // block 1, page 1

        let mut out = [0u8; PAGESZ];
        assert_eq!(
            driver.data_read(0, (BLOCKSZ + PAGESZ) as u64, &mut out),
            Err(Error::Io)
        );
        assert!(driver.chip.is_bad(1));
    }

    #[test]
    fn test_meta_round_trip_flushes_data_cache() {
        let shared = RefCell::new(driver());
        let mut data_dev = NandData::new(&shared);
        let mut meta_dev = NandMeta::new(&shared);

        // Dirty the data cache, then use the meta device
        data_dev.write(0, 0, &[0x77u8; 0x10]).unwrap();

        meta_dev.write(0, 16, &[0xa1u8; 8]).unwrap();

        // The data cache was flushed before the chip access
        assert!(!shared.borrow().wvalid);
        assert!(shared.borrow().chip.pages[0][..0x10]
            .iter()
            .all(|&b| b == 0x77));

        let mut out = [0u8; 16];
        assert_eq!(meta_dev.read(0, 16, &mut out, 0).unwrap(), 16);
        assert_eq!(&out[..8], &[0xa1; 8]);
        assert_eq!(&out[8..], &[0xff; 8]);
    }

    #[test]
    fn test_meta_alignment_enforced() {
        let shared = RefCell::new(driver());
        let mut meta_dev = NandMeta::new(&shared);

        let mut out = [0u8; 16];
        assert_eq!(meta_dev.read(0, 3, &mut out, 0), Err(Error::Invalid));
        assert_eq!(
            meta_dev.erase(0, 0, 16, 0),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn test_raw_round_trip() {
        let shared = RefCell::new(driver());
        let mut raw_dev = NandRaw::new(&shared);

        let raw_pagesz = PAGESZ + META_SIZE;
        let mut image = vec![0x00u8; raw_pagesz];
        image[..4].copy_from_slice(&[1, 2, 3, 4]);
        image[PAGESZ] = 0x5a; // metadata byte 0

        raw_dev.write(0, 0, &image).unwrap();

        let mut out = vec![0u8; raw_pagesz];
        assert_eq!(raw_dev.read(0, 0, &mut out, 0).unwrap(), raw_pagesz);
        assert_eq!(out, image);

        // Unaligned raw writes are rejected
        assert_eq!(raw_dev.write(0, 7, &image), Err(Error::Invalid));
    }

    #[test]
    fn test_map_contract() {
        let shared = RefCell::new(driver());
        let mut data_dev = NandData::new(&shared);

        // Mode subset: copy through I/O
        let res = data_dev
            .map(0, 0, 0x1000, MapMode::READ, 0, 0x1000, MapMode::READ | MapMode::WRITE)
            .unwrap();
        assert_eq!(res, MapResult::NotMappable);

        // Mode exceeding the window mode: rejected
        assert_eq!(
            data_dev.map(0, 0, 0x1000, MapMode::WRITE, 0, 0x1000, MapMode::READ),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut driver = driver();
        let size = TEST_INFO.size;

        let mut buf = [0u8; 16];
        assert_eq!(driver.data_read(0, size, &mut buf), Err(Error::Invalid));
        assert_eq!(driver.data_write(0, size, &buf), Err(Error::Invalid));

        // Reads crossing the end truncate
        let got = driver.data_read(0, size - 8, &mut buf).unwrap();
        assert_eq!(got, 8);
    }
}
