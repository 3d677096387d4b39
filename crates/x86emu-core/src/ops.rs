//! The `Ops` capability vtable, `spec.md` §3 / §6: the set of guest-state
//! callbacks the core consumes. Every method has a default that reports
//! `Unhandleable`, except `insn_fetch`, which is mandatory.

use crate::exception::{EmuResult, GateType};
use crate::state::{Cr0, Cr4, Eflags, SegReg, SegmentRegister};

/// A descriptor-table gate record read back by `Ops::read` from the IDT,
/// used by software-interrupt injection (`spec.md` §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtGate {
    pub gate_type: GateType,
    pub present: bool,
    pub dpl: u8,
    pub selector: u16,
    pub offset: u64,
}

/// The FPU/MMX/SSE/AVX register-file flavor a `get_fpu`/`put_fpu` bracket
/// names, `spec.md` §4.F / §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuKind {
    Wait,
    X87,
    Mmx,
    Xmm,
    Ymm,
}

/// Invoked by the core if host execution of a stubbed instruction inside a
/// `get_fpu`/`put_fpu` bracket raises a hardware exception; implementations
/// populate the guest-visible fault state and return the vector observed.
pub trait FpuExceptionHandler {
    fn on_exception(&mut self, vector: u8);
}

/// CPUID leaf result, `(eax, ebx, ecx, edx)`.
pub type CpuidLeaf = (u32, u32, u32, u32);

/// Guest-state callbacks the core consumes during decode and execution.
/// Implementations may leave any method at its default (`Unhandleable`)
/// except [`Ops::insn_fetch`]; the core treats a missing capability as
/// "this instruction cannot be emulated here" rather than panicking.
pub trait Ops {
    /// Reads `bytes` bytes of the instruction stream at `offset` in segment
    /// `seg` (always CS). `buf.is_empty()` means "validate `offset` is
    /// fetchable" without actually reading (used for branch-target checks).
    fn insn_fetch(&mut self, seg: SegReg, offset: u64, buf: &mut [u8]) -> EmuResult<()>;

    fn read(&mut self, _seg: SegReg, _offset: u64, _buf: &mut [u8]) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn write(&mut self, _seg: SegReg, _offset: u64, _buf: &[u8]) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    /// Atomic (with respect to other guest CPUs) compare-and-swap. Per
    /// `spec.md` Open Questions, this always returns `Ok(())` regardless of
    /// whether `old` matched the current memory value; the caller
    /// (`x86emu-core`'s writeback/CMPXCHG logic) determines match/mismatch
    /// itself by reading back and comparing, then sets ZF accordingly. On
    /// mismatch `new` must not be written.
    fn cmpxchg(
        &mut self,
        _seg: SegReg,
        _offset: u64,
        _old: &[u8],
        _new: &[u8],
    ) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn rep_ins(&mut self, _port: u16, _seg: SegReg, _offset: u64, _bytes: u8, _nr_reps: &mut u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn rep_outs(&mut self, _port: u16, _seg: SegReg, _offset: u64, _bytes: u8, _nr_reps: &mut u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn rep_movs(
        &mut self,
        _dst_seg: SegReg,
        _dst_off: u64,
        _src_seg: SegReg,
        _src_off: u64,
        _bytes: u8,
        _nr_reps: &mut u64,
    ) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn rep_stos(&mut self, _seg: SegReg, _offset: u64, _val: u64, _bytes: u8, _nr_reps: &mut u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn read_io(&mut self, _port: u16, _buf: &mut [u8]) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn write_io(&mut self, _port: u16, _buf: &[u8]) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn read_segment(&mut self, _seg: SegReg) -> EmuResult<SegmentRegister> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn write_segment(&mut self, _seg: SegReg, _value: SegmentRegister) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn read_cr(&mut self, _idx: u8) -> EmuResult<u64> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn write_cr(&mut self, _idx: u8, _val: u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn read_dr(&mut self, _idx: u8) -> EmuResult<u64> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn write_dr(&mut self, _idx: u8, _val: u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn read_msr(&mut self, _idx: u32) -> EmuResult<u64> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn write_msr(&mut self, _idx: u32, _val: u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn cpuid(&mut self, _eax_in: u32, _ecx_in: u32) -> EmuResult<CpuidLeaf> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn wbinvd(&mut self) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn invlpg(&mut self, _seg: SegReg, _offset: u64) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    /// Acquires host FPU ownership for the duration of one stubbed
    /// instruction. `handler` receives the vector if the stub traps.
    fn get_fpu(&mut self, _kind: FpuKind, _handler: &mut dyn FpuExceptionHandler) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    fn put_fpu(&mut self) {}

    fn vmfunc(&mut self) -> EmuResult<()> {
        Err(crate::exception::EmuError::Unhandleable)
    }

    /// Optional pre-execute hook, called after decode completes and before
    /// any side-effectful callback runs. May mutate the opcode classification
    /// the core is about to dispatch on (to redirect execution) or the
    /// force-writeback flag, returning `Done` to suppress execution entirely
    /// so the caller can handle the decoded instruction itself. Must not
    /// touch register state or guest memory/ports directly; do that from
    /// `Done` handling in the caller instead.
    fn validate(&mut self, _decoded: &x86emu_decoder::Decoded) -> EmuResult<()> {
        Ok(())
    }

    /// Reads the current value of `cr0`/`cr4` flags the executor needs for
    /// gating (CR0.EM/TS/MP, CR4.OSFXSR/OSXSAVE/OSXMMEXCPT/UMIP) without a
    /// full `read_cr` round trip. A default implementation built on
    /// `read_cr` is provided so most `Ops` implementors only need the
    /// generic accessor.
    fn cr0_flags(&mut self) -> EmuResult<Cr0> {
        self.read_cr(0).map(Cr0::from_bits_truncate)
    }

    fn cr4_flags(&mut self) -> EmuResult<Cr4> {
        self.read_cr(4).map(Cr4::from_bits_truncate)
    }

    fn eflags(&mut self) -> EmuResult<Eflags> {
        Err(crate::exception::EmuError::Unhandleable)
    }
}

/// An executable scratch-page allocator for the stub trampoline
/// (`spec.md` §4.F / §9 option (c), §5 resource policy #2). Kept as a
/// separate trait from [`Ops`] so hosts that never enable the `stub-exec`
/// feature need not implement it at all.
#[cfg(feature = "stub-exec")]
pub trait StubPage {
    /// Acquires the per-thread executable scratch page, returning a
    /// writable slice the core copies trampoline bytes into. Every
    /// successful `get_stub` must be matched by exactly one `put_stub`
    /// along every exit path.
    fn get_stub(&mut self) -> EmuResult<&mut [u8]>;

    fn put_stub(&mut self);
}
