//! Architectural state and per-opcode execution for embedding an x86
//! instruction emulator core into a hypervisor or sandbox.
//!
//! Control flow, `spec.md` §2: the caller invokes [`emulate`] with a
//! [`Ctxt`] and an [`Ops`] vtable. `emulate` decodes one instruction via
//! `x86emu-decoder`, offers [`Ops::validate`] a chance to redirect or
//! short-circuit, dispatches the decoded instruction through [`exec`],
//! and on success runs the writeback/retire housekeeping before returning
//! an [`EmulateStatus`]. Nothing here allocates; a `Ctxt` is a plain,
//! `Copy`-able stack value the caller owns across calls.

mod exec;

pub mod alu;
pub mod ctxt;
pub mod exception;
pub mod operand;
pub mod ops;
pub mod seg;
pub mod state;
#[cfg(feature = "stub-exec")]
pub mod stub;
pub mod writeback;

pub use ctxt::{Ctxt, OpcodeId, SoftwareInterruptPolicy};
pub use exception::{EmuError, EmuResult, EmulateStatus, Exception, GateType, PendingEvent, Retire};
pub use ops::{CpuidLeaf, FpuExceptionHandler, FpuKind, IdtGate, Ops};
#[cfg(feature = "stub-exec")]
pub use ops::StubPage;
pub use state::{AddressMode, Cr0, Cr4, CpuVendor, Eflags, Gpr, Regs, SegReg, SegmentRegister};

use state::SegReg as Seg;
use x86emu_decoder::{DecodeError, Decoded, MAX_INSTRUCTION_LEN};

/// Decodes and executes exactly one instruction at `ctxt.regs.rip`.
///
/// Clears `ctxt.event` and `ctxt.retire` on entry. On `Okay`, `ctxt.regs`
/// reflects the fully-committed post-instruction state and `ctxt.retire`
/// carries any side effects the caller must apply (HLT, a blocked STI
/// window, a MOV-SS shadow, an armed single-step). On `Exception`,
/// `ctxt.event` is populated and `ctxt.regs.rip` is restored to the
/// instruction's start address, except for trap-class vectors (`spec.md`
/// §7), which point past it. On `Retry` and `Unhandleable`, `ctxt.regs` is
/// left exactly as it was on entry. On `Done`, `ctxt.regs` reflects
/// whatever `validate` or the dispatched handler left behind; the caller
/// is responsible for taking it from there.
pub fn emulate(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmulateStatus {
    ctxt.event = None;
    ctxt.retire = Retire::default();
    ctxt.force_writeback = false;

    let start_rip = ctxt.regs.rip;

    let decoded = match fetch_and_decode(ctxt, ops) {
        Ok(d) => d,
        Err(err) => return finish_err(ctxt, ops, err, start_rip, 0),
    };

    if let Err(err) = ops.validate(&decoded) {
        return finish_err(ctxt, ops, err, start_rip, decoded.len() as u8);
    }

    // Advance RIP to the fall-through address before dispatch: every
    // control-transfer handler in `exec` either leaves this untouched
    // (straight-line instructions, not-taken Jcc) or overwrites it with an
    // absolute target (taken branches, CALL/RET, software-interrupt
    // injection). This mirrors real microcode, where IP is advanced as
    // part of fetch/decode and a taken branch is what overwrites it.
    ctxt.regs.rip = decoded.next_ip();

    match exec::execute(ctxt, ops, &decoded) {
        Ok(()) => {
            writeback::finish_instruction(&mut ctxt.regs, ctxt.mode.is_64bit(), &mut ctxt.retire);
            EmulateStatus::Okay
        }
        Err(err) => finish_err(ctxt, ops, err, start_rip, decoded.len() as u8),
    }
}

/// Fetches up to [`MAX_INSTRUCTION_LEN`] bytes at `ctxt.regs.rip` and
/// decodes them, growing the fetch window only when the decoder reports
/// [`DecodeError::TooShort`] — avoids unconditionally reading 15 bytes
/// past every short instruction, which could spuriously fault against an
/// unmapped following page.
fn fetch_and_decode(ctxt: &Ctxt, ops: &mut dyn Ops) -> EmuResult<Decoded> {
    let mode = ctxt.mode.to_decode_mode();
    let ip = ctxt.regs.rip;
    let mut buf = [0u8; MAX_INSTRUCTION_LEN];
    let mut len = 8usize.min(MAX_INSTRUCTION_LEN);
    loop {
        ops.insn_fetch(Seg::Cs, ip, &mut buf[..len])?;
        match x86emu_decoder::decode_one(mode, ip, &buf[..len]) {
            Ok(d) => return Ok(d),
            Err(DecodeError::InvalidInstruction) => return Err(Exception::ud().into()),
            Err(DecodeError::TooShort) => {
                if len >= MAX_INSTRUCTION_LEN {
                    return Err(Exception::ud().into());
                }
                len = MAX_INSTRUCTION_LEN;
            }
        }
    }
}

fn finish_err(ctxt: &mut Ctxt, ops: &mut dyn Ops, err: EmuError, start_rip: u64, insn_len: u8) -> EmulateStatus {
    match err {
        EmuError::Exception(mut ev) => {
            if !ev.vector.is_trap_class() {
                ctxt.regs.rip = start_rip;
            }
            if ev.vector == Exception::Xm {
                let osxmmexcpt = ops.cr4_flags().map(|f| f.contains(Cr4::OSXMMEXCPT)).unwrap_or(false);
                ev = exception::remap_xm_if_masked(ev, osxmmexcpt);
            }
            ev.insn_len = insn_len;
            ctxt.event = Some(ev);
            EmulateStatus::Exception
        }
        EmuError::Retry => {
            ctxt.regs.rip = start_rip;
            EmulateStatus::Retry
        }
        EmuError::Unhandleable => {
            ctxt.regs.rip = start_rip;
            EmulateStatus::Unhandleable
        }
        EmuError::Done => EmulateStatus::Done,
    }
}
