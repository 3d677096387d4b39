//! A minimal flat-memory `Ops` implementation shared by this crate's
//! integration tests. Segments are ignored and treated as if every one of
//! them had base 0 and span the whole buffer, matching how the teacher's
//! own `FlatTestBus`/`TestBus` fakes model memory for instruction-level
//! tests (real segmentation is exercised separately in `seg`'s own unit
//! tests, not here).

use x86emu_core::exception::EmuError;
use x86emu_core::ops::{CpuidLeaf, Ops};
use x86emu_core::state::SegReg;
use x86emu_core::{AddressMode, Ctxt, EmuResult, Regs};

pub struct FlatBus {
    pub mem: Vec<u8>,
    pub io: [u8; 0x10000],
}

impl FlatBus {
    pub fn new(size: usize) -> FlatBus {
        FlatBus {
            mem: vec![0; size],
            io: [0; 0x10000],
        }
    }

    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let start = addr as usize;
        u32::from_le_bytes(self.mem[start..start + 4].try_into().unwrap())
    }

    fn slice(&self, offset: u64, len: usize) -> EmuResult<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(EmuError::Unhandleable)?;
        if end > self.mem.len() {
            return Err(EmuError::Unhandleable);
        }
        Ok(start..end)
    }
}

impl Ops for FlatBus {
    fn insn_fetch(&mut self, seg: SegReg, offset: u64, buf: &mut [u8]) -> EmuResult<()> {
        self.read(seg, offset, buf)
    }

    fn read(&mut self, _seg: SegReg, offset: u64, buf: &mut [u8]) -> EmuResult<()> {
        let range = self.slice(offset, buf.len())?;
        buf.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn write(&mut self, _seg: SegReg, offset: u64, buf: &[u8]) -> EmuResult<()> {
        let range = self.slice(offset, buf.len())?;
        self.mem[range].copy_from_slice(buf);
        Ok(())
    }

    fn cmpxchg(&mut self, seg: SegReg, offset: u64, _old: &[u8], new: &[u8]) -> EmuResult<()> {
        // Callers only reach here after comparing against the current value
        // themselves (see `exec::system::cmpxchg`), so a match is already
        // guaranteed; just perform the store.
        self.write(seg, offset, new)
    }

    fn read_io(&mut self, port: u16, buf: &mut [u8]) -> EmuResult<()> {
        let start = port as usize;
        buf.copy_from_slice(&self.io[start..start + buf.len()]);
        Ok(())
    }

    fn write_io(&mut self, port: u16, buf: &[u8]) -> EmuResult<()> {
        let start = port as usize;
        self.io[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn cpuid(&mut self, eax_in: u32, _ecx_in: u32) -> EmuResult<CpuidLeaf> {
        Ok((eax_in, 0, 0, 0))
    }
}

/// Builds a `Ctxt` in 64-bit mode with `rip` set to `CODE_BASE` and every
/// segment's descriptor cache left at its zeroed (base 0, flat) default.
pub fn new_ctxt64() -> Ctxt {
    let mut regs = Regs::default();
    regs.rip = CODE_BASE;
    Ctxt::new(regs, AddressMode::Bits64)
}

pub const CODE_BASE: u64 = 0x1000;
pub const BUS_SIZE: usize = 0x1_0000;

/// Loads `code` at `CODE_BASE`, points `rip` there, and runs exactly one
/// `emulate` call.
pub fn exec_one(ctxt: &mut Ctxt, bus: &mut FlatBus, code: &[u8]) -> x86emu_core::EmulateStatus {
    bus.load(CODE_BASE, code);
    ctxt.regs.rip = CODE_BASE;
    x86emu_core::emulate(ctxt, bus)
}
