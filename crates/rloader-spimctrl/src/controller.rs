//! SPI controller abstraction
//!
//! A transfer is a command phase (opcode plus optional address bytes)
//! followed by an optional data phase in one direction. The controller
//! additionally maps the flash into the address space for plain reads.

use rloader_core::{Error, Result};

/// Data phase of a transfer.
pub enum XferData<'a> {
    /// No data phase.
    None,
    /// Clock data out of the chip into the buffer.
    Read(&'a mut [u8]),
    /// Clock data into the chip.
    Write(&'a [u8]),
}

/// One SPI transfer: command phase plus data phase.
pub struct XferOp<'a> {
    /// Command phase bytes (opcode, then address bytes if any).
    pub cmd: &'a [u8],
    /// Data phase.
    pub data: XferData<'a>,
}

impl<'a> XferOp<'a> {
    /// Command with a read data phase.
    pub fn read(cmd: &'a [u8], buf: &'a mut [u8]) -> Self {
        Self {
            cmd,
            data: XferData::Read(buf),
        }
    }

    /// Command with a write data phase.
    pub fn write(cmd: &'a [u8], data: &'a [u8]) -> Self {
        Self {
            cmd,
            data: XferData::Write(data),
        }
    }

    /// Bare command.
    pub fn command(cmd: &'a [u8]) -> Self {
        Self {
            cmd,
            data: XferData::None,
        }
    }
}

/// The SPI controller the NOR driver runs on.
pub trait SpimCtrl {
    /// One-time bring-up (clock enable, core reset).
    fn init(&mut self);

    /// Execute a transfer; `Busy` when the core is not ready to accept one.
    fn xfer(&mut self, op: XferOp<'_>) -> Result<()>;

    /// Copy from the memory-mapped flash window. The window shares the
    /// chip's extended-address state with the command channel.
    fn window_read(&mut self, addr: u32, buf: &mut [u8]);

    /// Base address of the read window in the physical address space.
    fn window_base(&self) -> usize;

    /// Reset the controller core.
    fn reset(&mut self);

    /// Monotonic millisecond timer for bounded polls.
    fn now_ms(&self) -> u64;
}

/// Controller register offsets (word indices).
mod regs {
    pub const CTRL: usize = 1; /* Flash control    : 0x04 */
    pub const STAT: usize = 2; /* Flash status     : 0x08 */
    pub const RX: usize = 3; /* Flash receive    : 0x0C */
    pub const TX: usize = 4; /* Flash transmit   : 0x10 */
}

/* Control register */
const USR_CTRL: u32 = 1 << 0;
const CHIP_SEL: u32 = 1 << 3;
const CORE_RST: u32 = 1 << 4;

/* Status register */
const OPER_DONE: u32 = 1 << 0;
const CORE_BUSY: u32 = 1 << 1;
const INITIALIZED: u32 = 1 << 2;

const CMD_NOP: u8 = 0x00;

/// Register-level implementation of the GRLIB SPI memory controller.
pub struct GrlibSpimctrl {
    base: *mut u32,
    window: *const u8,
    clk_enable: fn(),
    timer_ms: fn() -> u64,
}

impl GrlibSpimctrl {
    /// # Safety
    ///
    /// `base` must point at the controller register bank and `window` at
    /// the mapped flash region, both valid for the lifetime of the value.
    pub unsafe fn new(
        base: *mut u32,
        window: *const u8,
        clk_enable: fn(),
        timer_ms: fn() -> u64,
    ) -> Self {
        Self {
            base,
            window,
            clk_enable,
            timer_ms,
        }
    }

    fn reg(&self, idx: usize) -> u32 {
        unsafe { self.base.add(idx).read_volatile() }
    }

    fn reg_write(&mut self, idx: usize, val: u32) {
        unsafe { self.base.add(idx).write_volatile(val) };
    }

    fn busy(&self) -> bool {
        self.reg(regs::STAT) & CORE_BUSY != 0
    }

    fn ready(&self) -> bool {
        self.reg(regs::STAT) & (INITIALIZED | OPER_DONE) == INITIALIZED
    }

    /// Take manual control of the chip select.
    fn user_ctrl(&mut self) {
        self.reg_write(regs::CTRL, USR_CTRL);
        let ctrl = self.reg(regs::CTRL);
        self.reg_write(regs::CTRL, ctrl & !CHIP_SEL);
    }

    fn release(&mut self) {
        let ctrl = self.reg(regs::CTRL);
        self.reg_write(regs::CTRL, ctrl & !USR_CTRL);
    }

    fn tx(&mut self, byte: u8) {
        self.reg_write(regs::TX, byte as u32);
        while self.reg(regs::STAT) & OPER_DONE == 0 {}
        let stat = self.reg(regs::STAT);
        self.reg_write(regs::STAT, stat | OPER_DONE);
    }

    fn rx(&self) -> u8 {
        (self.reg(regs::RX) & 0xff) as u8
    }
}

impl SpimCtrl for GrlibSpimctrl {
    fn init(&mut self) {
        (self.clk_enable)();
        self.reset();
    }

    fn xfer(&mut self, op: XferOp<'_>) -> Result<()> {
        if self.busy() || !self.ready() {
            return Err(Error::Busy);
        }

        self.user_ctrl();

        for &byte in op.cmd {
            self.tx(byte);
        }

        match op.data {
            XferData::None => {}
            XferData::Read(buf) => {
                for byte in buf.iter_mut() {
                    self.tx(CMD_NOP);
                    *byte = self.rx();
                }
            }
            XferData::Write(data) => {
                for &byte in data {
                    self.tx(byte);
                }
            }
        }

        self.release();

        Ok(())
    }

    fn window_read(&mut self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { self.window.add(addr as usize + i).read_volatile() };
        }
    }

    fn window_base(&self) -> usize {
        self.window as usize
    }

    fn reset(&mut self) {
        self.reg_write(regs::CTRL, CORE_RST);
    }

    fn now_ms(&self) -> u64 {
        (self.timer_ms)()
    }
}
