//! GPMI descriptor constructors
//!
//! Each function appends one descriptor to a chain, with the PIO words
//! that program the GPMI (and, for ECC transfers, BCH) control registers
//! when the DMA engine executes it.

use crate::dma::{flags, DmaChain};

/* GPMI CTRL0 fields */
const LOCKCS: u32 = 1 << 27;
const WRITE: u32 = 0 << 24;
const READ: u32 = 1 << 24;
const READCMP: u32 = 2 << 24;
const W4READY: u32 = 3 << 24;
const BIT8: u32 = 1 << 23;
const DATA: u32 = 0 << 17;
const CLE: u32 = 1 << 17;
const ADDRINC: u32 = 1 << 16;

const fn cs(cs: u32) -> u32 {
    cs << 20
}

/* GPMI ECCCTRL fields */
const ECC_ENCODE: u32 = 1 << 13;
const ECC: u32 = 1 << 12;
const ECC_AUX: u32 = 0x100;
const ECC_PAGE: u32 = 0x1ff;

/// Wait for the chip's ready line; returns the descriptor's bus address
/// so a sense check can loop back to it.
pub fn w4ready(chain: &mut DmaChain<'_>, chip: u32) -> u32 {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::W4READY | flags::NOXFER,
        0,
        0,
        &[W4READY | BIT8 | cs(chip)],
    )
}

/// Issue command and address cycles; `buf` is the bus address of the
/// command byte followed by `addrsz` address bytes.
pub fn cmdaddr(chain: &mut DmaChain<'_>, chip: u32, buf: u32, addrsz: u16) {
    let size = addrsz + 1;
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::READ,
        size,
        buf,
        &[
            LOCKCS
                | WRITE
                | BIT8
                | cs(chip)
                | CLE
                | if addrsz > 0 { ADDRINC } else { 0 }
                | size as u32,
            0,
            0,
        ],
    );
}

/// Read one data byte and compare it against `val` under `mask`; a sense
/// check after this descriptor branches on mismatch.
pub fn readcmp(chain: &mut DmaChain<'_>, chip: u32, mask: u16, val: u16) {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::NOXFER,
        0,
        0,
        &[
            READCMP | BIT8 | cs(chip) | DATA | 1,
            ((mask as u32) << 16) | val as u32,
            0,
        ],
    );
}

/// Wait out the BCH engine after an ECC read (the controller holds the
/// lock until BCH drains).
pub fn disable_bch(chain: &mut DmaChain<'_>, chip: u32) {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::NOXFER,
        0,
        0,
        &[LOCKCS | W4READY | BIT8 | cs(chip) | DATA, 0, 0],
    );
}

/// Plain data read into `buf`.
pub fn read(chain: &mut DmaChain<'_>, chip: u32, buf: u32, size: u16) {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::WRITE,
        size,
        buf,
        &[READ | BIT8 | cs(chip) | DATA | size as u32, 0, 0],
    );
}

/// ECC-decoded read: payload to `buf` (0 for aux-only), decoded metadata
/// and per-chunk status to `aux`.
pub fn ecread(chain: &mut DmaChain<'_>, chip: u32, buf: u32, aux: u32, size: u16) {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::NOXFER,
        0,
        0,
        &[
            READ | BIT8 | cs(chip) | DATA | size as u32,
            0,
            ECC | if buf != 0 { ECC_PAGE } else { ECC_AUX },
            size as u32,
            buf,
            aux,
        ],
    );
}

/// Plain data write from `buf`.
pub fn write(chain: &mut DmaChain<'_>, chip: u32, buf: u32, size: u16) {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::READ,
        size,
        buf,
        &[
            LOCKCS | WRITE | BIT8 | cs(chip) | DATA | size as u32,
            0,
            0,
        ],
    );
}

/// ECC-encoded write: payload from `buf`, metadata from `aux`.
pub fn ecwrite(chain: &mut DmaChain<'_>, chip: u32, buf: u32, aux: u32, size: u16) {
    chain.append(
        flags::HOT | flags::W4ENDCMD | flags::NANDLOCK | flags::NOXFER,
        0,
        0,
        &[
            LOCKCS | WRITE | BIT8 | cs(chip) | DATA,
            0,
            ECC_ENCODE | ECC | ECC_PAGE,
            size as u32,
            buf,
            aux,
        ],
    );
}
