//! BCH ECC page-layout configuration
//!
//! A NAND page passes through the BCH engine as one metadata block
//! (attached user metadata plus parity) followed by N data blocks (chunk
//! plus parity). Two registers describe the layout; they are reprogrammed
//! on the fly for metadata-only and data-only transfers and must be
//! restored to the standard layout afterwards.

/// BCH ECC configuration of one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BchEcc {
    /// Metadata block attached data size in bytes (multiple of 4, 0 for
    /// no attached data)
    pub blocksz0: u16,
    /// Data block size in bytes (multiple of 4, typically 512)
    pub blockszn: u16,
    /// Number of page data blocks
    pub nblocks: u8,
    /// Metadata block ECC strength
    pub ecc0: u8,
    /// Data blocks ECC strength
    pub eccn: u8,
    /// Metadata block Galois field (13 or 14)
    pub gf0: u8,
    /// Data blocks Galois field (13 or 14)
    pub gfn: u8,
}

/// Parity size in bytes for a given ECC strength and Galois field.
pub const fn eccsz(ecc: u8, gf: u8) -> usize {
    (ecc as usize * gf as usize + 7) / 8
}

impl BchEcc {
    /// Parity bytes of the metadata block.
    pub const fn meta_parity(&self) -> usize {
        eccsz(self.ecc0, self.gf0)
    }

    /// Parity bytes of one data block.
    pub const fn data_parity(&self) -> usize {
        eccsz(self.eccn, self.gfn)
    }

    /// LAYOUT0 for the standard page layout: block counts, metadata size
    /// and the metadata block's ECC parameters.
    pub fn layout0(&self, metasz: u8) -> u32 {
        ((self.nblocks as u32) << 24)
            | ((metasz as u32) << 16)
            | ((((self.ecc0 as u32) >> 1) & 0x3f) << 11)
            | (((self.gf0 == 14) as u32) << 10)
            | (((self.blocksz0 as u32) >> 2) & 0x3ff)
    }

    /// LAYOUT1 for the standard page layout: raw transfer size and the
    /// data blocks' ECC parameters.
    pub fn layout1(&self, rawsz: u16) -> u32 {
        ((rawsz as u32) << 16)
            | ((((self.eccn as u32) >> 1) & 0x3f) << 11)
            | (((self.gfn == 14) as u32) << 10)
            | (((self.blockszn as u32) >> 2) & 0x3ff)
    }

    /// LAYOUT0 for metadata-only transfers: no data blocks.
    pub fn layout0_meta(&self, metasz: u8) -> u32 {
        self.layout0(metasz) & !(0xff << 24)
    }

    /// LAYOUT1 for metadata-only transfers: the whole transfer is the
    /// metadata block and its parity.
    pub fn layout1_meta(&self, metasz: u8) -> u32 {
        let rawsz = metasz as usize + self.meta_parity();
        (self.layout1(0) & !(0xffff << 16)) | ((rawsz as u32) << 16)
    }

    /// LAYOUT0 for data-only transfers: the metadata block and its parity
    /// pass through as raw bytes (ECC strength 0), so the chip's existing
    /// metadata survives a partial-page program untouched.
    pub fn layout0_data(&self, metasz: u8) -> u32 {
        let raw_meta = metasz as usize + self.meta_parity();
        (self.layout0(metasz) & !(0x1fff << 11)) | ((raw_meta as u32) << 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4 KiB page + 16 B metadata configuration.
    const ECC: BchEcc = BchEcc {
        blocksz0: 0,
        blockszn: 512,
        nblocks: 8,
        ecc0: 16,
        eccn: 8,
        gf0: 13,
        gfn: 13,
    };

    #[test]
    fn test_parity_sizes() {
        // 16 bits of strength over GF(13): 26 parity bytes
        assert_eq!(eccsz(16, 13), 26);
        assert_eq!(eccsz(8, 13), 13);
        assert_eq!(ECC.meta_parity(), 26);
        assert_eq!(ECC.data_parity(), 13);
    }

    #[test]
    fn test_standard_layout() {
        let layout0 = ECC.layout0(16);
        assert_eq!(layout0 >> 24, 8); // 8 data blocks
        assert_eq!((layout0 >> 16) & 0xff, 16); // metadata size
        assert_eq!((layout0 >> 11) & 0x3f, 8); // ecc0 / 2
        assert_eq!((layout0 >> 10) & 1, 0); // GF13
        assert_eq!(layout0 & 0x3ff, 0); // no attached data

        let layout1 = ECC.layout1(4096 + 256);
        assert_eq!(layout1 >> 16, 4352);
        assert_eq!((layout1 >> 11) & 0x3f, 4); // eccn / 2
        assert_eq!(layout1 & 0x3ff, 128); // 512 / 4
    }

    #[test]
    fn test_meta_layout() {
        let layout0 = ECC.layout0_meta(16);
        assert_eq!(layout0 >> 24, 0); // no data blocks
        assert_eq!((layout0 >> 16) & 0xff, 16);

        let layout1 = ECC.layout1_meta(16);
        assert_eq!(layout1 >> 16, 16 + 26); // metadata + parity
        assert_eq!(layout1 & 0xffff, ECC.layout1(0) & 0xffff);
    }

    #[test]
    fn test_data_layout_passes_metadata_raw() {
        let layout0 = ECC.layout0_data(16);
        assert_eq!(layout0 >> 24, 8); // data blocks unchanged
        assert_eq!((layout0 >> 16) & 0xff, 16 + 26); // raw metadata span
        assert_eq!((layout0 >> 11) & 0x3f, 0); // metadata ECC off
    }

    #[test]
    fn test_gf14_flag() {
        let ecc = BchEcc { gf0: 14, gfn: 14, ..ECC };
        assert_eq!((ecc.layout0(16) >> 10) & 1, 1);
        assert_eq!((ecc.layout1(4352) >> 10) & 1, 1);
    }
}
