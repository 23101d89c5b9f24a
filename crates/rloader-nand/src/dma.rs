//! APBH DMA descriptor chains
//!
//! A chain is a linked list of packed descriptors the DMA engine walks on
//! its own: each carries a flag word, a payload pointer, a size, a next
//! pointer and up to 15 inline PIO words programmed into the peripheral's
//! control registers. The chain is built inside one caller-provided
//! buffer; all pointers stored in descriptors are bus addresses.

/// Descriptor flag word bits.
pub mod flags {
    /// Number of PIO words attached to the descriptor.
    pub const fn pio(n: u16) -> u16 {
        (n & 0xf) << 12
    }

    /// Command is valid ("hot").
    pub const HOT: u16 = 1 << 8;
    /// Wait for the end-command handshake.
    pub const W4ENDCMD: u16 = 1 << 7;
    /// Decrement the channel semaphore.
    pub const DECSEMA: u16 = 1 << 6;
    /// Wait for the device ready line.
    pub const W4READY: u16 = 1 << 5;
    /// Hold the NAND arbitration lock.
    pub const NANDLOCK: u16 = 1 << 4;
    /// Raise the completion interrupt.
    pub const IRQCOMP: u16 = 1 << 3;
    /// Chain to the next descriptor.
    pub const CHAIN: u16 = 1 << 2;

    /// Transfer mode: conditional branch on the sense lines.
    pub const SENSE: u16 = 3;
    /// Transfer mode: peripheral reads from memory.
    pub const READ: u16 = 2;
    /// Transfer mode: peripheral writes to memory.
    pub const WRITE: u16 = 1;
    /// Transfer mode: no data transfer.
    pub const NOXFER: u16 = 0;
}

/// Fixed part of a descriptor: next, flags, size, payload address.
pub const DESC_HEADER: usize = 12;

/// One parsed descriptor, for chain inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc {
    /// Bus address of the next descriptor (valid when CHAIN is set).
    pub next: u32,
    /// Flag word.
    pub flags: u16,
    /// Payload size in bytes.
    pub size: u16,
    /// Payload bus address (or branch target / result code).
    pub addr: u32,
    /// Inline PIO words.
    pub pio: [u32; 15],
}

impl Desc {
    /// Number of PIO words attached.
    pub fn pio_count(&self) -> usize {
        ((self.flags >> 12) & 0xf) as usize
    }

    /// Serialized size in the chain buffer.
    pub fn byte_len(&self) -> usize {
        DESC_HEADER + self.pio_count() * 4
    }
}

/// Descriptor chain builder over a caller-provided buffer.
///
/// `base` is the bus address of `buf[0]`; descriptors reference each
/// other (and inline command bytes) through it.
pub struct DmaChain<'a> {
    buf: &'a mut [u8],
    base: u32,
    first: Option<usize>,
    last: Option<usize>,
    used: usize,
}

impl<'a> DmaChain<'a> {
    /// Start an empty chain in `buf`, which the DMA engine sees at bus
    /// address `base`.
    pub fn new(buf: &'a mut [u8], base: u32) -> Self {
        Self {
            buf,
            base,
            first: None,
            last: None,
            used: 0,
        }
    }

    /// Drop all descriptors, keeping the buffer.
    pub fn reset(&mut self) {
        self.first = None;
        self.last = None;
        self.used = 0;
    }

    /// Bus address of the first descriptor (chain entry point).
    pub fn head(&self) -> u32 {
        self.base + self.first.unwrap_or(0) as u32
    }

    /// Bus address of the chain buffer.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Raw chain bytes (for engines that emulate the walk).
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    fn bus_addr(&self, offs: usize) -> u32 {
        self.base + offs as u32
    }

    /// Reserve `len` inline bytes (command/address storage), returning
    /// their buffer offset and bus address.
    pub fn alloc_bytes(&mut self, len: usize) -> (usize, u32) {
        let offs = self.used;
        assert!(offs + len <= self.buf.len(), "dma chain buffer exhausted");
        self.used += len;
        (offs, self.bus_addr(offs))
    }

    /// Write into previously reserved inline bytes.
    pub fn fill_bytes(&mut self, offs: usize, data: &[u8]) {
        self.buf[offs..offs + data.len()].copy_from_slice(data);
    }

    fn emit(&mut self, flags: u16, size: u16, addr: u32, pio: &[u32]) -> usize {
        let flags = flags | flags::pio(pio.len() as u16);
        let len = DESC_HEADER + pio.len() * 4;
        let (offs, _) = self.alloc_bytes(len);

        self.buf[offs..offs + 4].copy_from_slice(&0u32.to_le_bytes());
        self.buf[offs + 4..offs + 6].copy_from_slice(&flags.to_le_bytes());
        self.buf[offs + 6..offs + 8].copy_from_slice(&size.to_le_bytes());
        self.buf[offs + 8..offs + 12].copy_from_slice(&addr.to_le_bytes());
        for (i, word) in pio.iter().enumerate() {
            let at = offs + DESC_HEADER + i * 4;
            self.buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }

        offs
    }

    fn link(&mut self, offs: usize) {
        if let Some(last) = self.last {
            let flags =
                u16::from_le_bytes([self.buf[last + 4], self.buf[last + 5]]) | flags::CHAIN;
            self.buf[last + 4..last + 6].copy_from_slice(&flags.to_le_bytes());
            let next = self.bus_addr(offs);
            self.buf[last..last + 4].copy_from_slice(&next.to_le_bytes());
        } else {
            self.first = Some(offs);
        }
        self.last = Some(offs);
    }

    /// Append a descriptor to the chain, returning its bus address (sense
    /// checks branch to earlier descriptors through it).
    pub fn append(&mut self, flags: u16, size: u16, addr: u32, pio: &[u32]) -> u32 {
        let offs = self.emit(flags, size, addr, pio);
        self.link(offs);
        self.bus_addr(offs)
    }

    /// Emit a terminator out of line (not linked into the chain) and
    /// return its bus address; a check descriptor branches to it on
    /// failure. The terminator posts `err` as the result code.
    pub fn terminator(&mut self, err: i32) -> u32 {
        let offs = self.emit(
            flags::DECSEMA | flags::IRQCOMP | flags::NOXFER,
            0,
            err as u32,
            &[],
        );
        self.bus_addr(offs)
    }

    /// Append a sense check branching to `fail` when the peripheral
    /// reports failure.
    pub fn check(&mut self, fail: u32) {
        self.append(flags::HOT | flags::SENSE, 0, fail, &[]);
    }

    /// Close the chain with a success terminator.
    pub fn finish(&mut self) {
        let offs = self.emit(
            flags::DECSEMA | flags::IRQCOMP | flags::NOXFER,
            0,
            0,
            &[],
        );
        self.link(offs);
    }

    /// Walk the chain from its first descriptor.
    pub fn iter(&self) -> ChainIter<'_, 'a> {
        ChainIter {
            chain: self,
            offs: self.first,
        }
    }

    fn parse_at(&self, offs: usize) -> Desc {
        let buf = &self.buf;
        let next = u32::from_le_bytes(buf[offs..offs + 4].try_into().unwrap());
        let flags = u16::from_le_bytes(buf[offs + 4..offs + 6].try_into().unwrap());
        let size = u16::from_le_bytes(buf[offs + 6..offs + 8].try_into().unwrap());
        let addr = u32::from_le_bytes(buf[offs + 8..offs + 12].try_into().unwrap());

        let count = ((flags >> 12) & 0xf) as usize;
        let mut pio = [0u32; 15];
        for (i, word) in pio.iter_mut().take(count).enumerate() {
            let at = offs + DESC_HEADER + i * 4;
            *word = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        }

        Desc {
            next,
            flags,
            size,
            addr,
            pio,
        }
    }
}

/// Iterator over the linked descriptors of a chain.
pub struct ChainIter<'c, 'b> {
    chain: &'c DmaChain<'b>,
    offs: Option<usize>,
}

impl Iterator for ChainIter<'_, '_> {
    type Item = Desc;

    fn next(&mut self) -> Option<Self::Item> {
        let offs = self.offs?;
        let desc = self.chain.parse_at(offs);

        self.offs = if desc.flags & flags::CHAIN != 0 {
            Some((desc.next - self.chain.base) as usize)
        } else {
            None
        };

        Some(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_in_order() {
        let mut buf = [0u8; 256];
        let mut chain = DmaChain::new(&mut buf, 0x1000);

        chain.append(flags::HOT | flags::NOXFER, 0, 0, &[0xaaaa_5555]);
        chain.append(flags::HOT | flags::READ, 8, 0x2000, &[1, 2, 3]);
        chain.finish();

        let descs: std::vec::Vec<Desc> = chain.iter().collect();
        assert_eq!(descs.len(), 3);

        assert_eq!(descs[0].pio_count(), 1);
        assert_eq!(descs[0].pio[0], 0xaaaa_5555);
        assert!(descs[0].flags & flags::CHAIN != 0);

        assert_eq!(descs[1].size, 8);
        assert_eq!(descs[1].addr, 0x2000);
        assert_eq!(descs[1].pio[..3], [1, 2, 3]);

        // Terminator: no chain, posts success and the IRQ
        assert_eq!(descs[2].flags & flags::CHAIN, 0);
        assert!(descs[2].flags & flags::IRQCOMP != 0);
        assert!(descs[2].flags & flags::DECSEMA != 0);
        assert_eq!(descs[2].addr, 0);
    }

    #[test]
    fn test_check_branches_to_terminator() {
        let mut buf = [0u8; 256];
        let mut chain = DmaChain::new(&mut buf, 0x4000);

        let fail = chain.terminator(-1);
        chain.append(flags::HOT | flags::NOXFER, 0, 0, &[]);
        chain.check(fail);
        chain.finish();

        let descs: std::vec::Vec<Desc> = chain.iter().collect();
        // The out-of-line fail terminator is not part of the walk
        assert_eq!(descs.len(), 3);

        let check = descs[1];
        assert_eq!(check.flags & 0x3, flags::SENSE);
        assert_eq!(check.addr, fail);
    }

    #[test]
    fn test_reset_reuses_buffer() {
        let mut buf = [0u8; 128];
        let mut chain = DmaChain::new(&mut buf, 0);

        chain.append(flags::HOT, 0, 0, &[]);
        chain.finish();
        let used_once = chain.iter().count();

        chain.reset();
        chain.append(flags::HOT, 0, 0, &[]);
        chain.finish();
        assert_eq!(chain.iter().count(), used_once);
    }

    #[test]
    fn test_inline_bytes() {
        let mut buf = [0u8; 64];
        let mut chain = DmaChain::new(&mut buf, 0x100);

        let (offs, bus) = chain.alloc_bytes(8);
        assert_eq!(bus, 0x100);
        chain.fill_bytes(offs, &[0xde, 0xad]);
        assert_eq!(&chain.bytes()[..2], &[0xde, 0xad]);
    }
}
