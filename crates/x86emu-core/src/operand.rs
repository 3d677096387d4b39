//! Operand fetch, `spec.md` §4.D: materializes `src`/`dst` values from
//! register, memory, or immediate sources per the resolved operand form
//! `iced_x86` already decoded.

use iced_x86::{Instruction, OpKind, Register};

use crate::exception::EmuResult;
use crate::ops::Ops;
use crate::state::{Gpr, Regs, SegReg};
use crate::writeback::Destination;

/// A fetched operand: where it came from, its value (zero-extended into a
/// `u64` scratch holder per `spec.md` §3's `Operand.val`), and — for
/// register/memory operands — the pre-read value writeback compares
/// against to decide whether a write is actually needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOperand {
    pub dest: Destination,
    pub bytes: u8,
    pub val: u64,
    pub orig_val: u64,
}

/// Maps an `iced_x86` register to the GPR it aliases, its width in bytes,
/// and whether it's a legacy high-byte register (AH/BH/CH/DH), which reads
/// and writes bits 8..15 of the aliased GPR rather than bits 0..7.
fn gpr_info(reg: Register) -> Option<(Gpr, u8, bool)> {
    use Register::*;
    Some(match reg {
        AL => (Gpr::Rax, 1, false),
        CL => (Gpr::Rcx, 1, false),
        DL => (Gpr::Rdx, 1, false),
        BL => (Gpr::Rbx, 1, false),
        AH => (Gpr::Rax, 1, true),
        CH => (Gpr::Rcx, 1, true),
        DH => (Gpr::Rdx, 1, true),
        BH => (Gpr::Rbx, 1, true),
        SPL => (Gpr::Rsp, 1, false),
        BPL => (Gpr::Rbp, 1, false),
        SIL => (Gpr::Rsi, 1, false),
        DIL => (Gpr::Rdi, 1, false),
        R8L => (Gpr::R8, 1, false),
        R9L => (Gpr::R9, 1, false),
        R10L => (Gpr::R10, 1, false),
        R11L => (Gpr::R11, 1, false),
        R12L => (Gpr::R12, 1, false),
        R13L => (Gpr::R13, 1, false),
        R14L => (Gpr::R14, 1, false),
        R15L => (Gpr::R15, 1, false),

        AX => (Gpr::Rax, 2, false),
        CX => (Gpr::Rcx, 2, false),
        DX => (Gpr::Rdx, 2, false),
        BX => (Gpr::Rbx, 2, false),
        SP => (Gpr::Rsp, 2, false),
        BP => (Gpr::Rbp, 2, false),
        SI => (Gpr::Rsi, 2, false),
        DI => (Gpr::Rdi, 2, false),
        R8W => (Gpr::R8, 2, false),
        R9W => (Gpr::R9, 2, false),
        R10W => (Gpr::R10, 2, false),
        R11W => (Gpr::R11, 2, false),
        R12W => (Gpr::R12, 2, false),
        R13W => (Gpr::R13, 2, false),
        R14W => (Gpr::R14, 2, false),
        R15W => (Gpr::R15, 2, false),

        EAX => (Gpr::Rax, 4, false),
        ECX => (Gpr::Rcx, 4, false),
        EDX => (Gpr::Rdx, 4, false),
        EBX => (Gpr::Rbx, 4, false),
        ESP => (Gpr::Rsp, 4, false),
        EBP => (Gpr::Rbp, 4, false),
        ESI => (Gpr::Rsi, 4, false),
        EDI => (Gpr::Rdi, 4, false),
        R8D => (Gpr::R8, 4, false),
        R9D => (Gpr::R9, 4, false),
        R10D => (Gpr::R10, 4, false),
        R11D => (Gpr::R11, 4, false),
        R12D => (Gpr::R12, 4, false),
        R13D => (Gpr::R13, 4, false),
        R14D => (Gpr::R14, 4, false),
        R15D => (Gpr::R15, 4, false),

        RAX => (Gpr::Rax, 8, false),
        RCX => (Gpr::Rcx, 8, false),
        RDX => (Gpr::Rdx, 8, false),
        RBX => (Gpr::Rbx, 8, false),
        RSP => (Gpr::Rsp, 8, false),
        RBP => (Gpr::Rbp, 8, false),
        RSI => (Gpr::Rsi, 8, false),
        RDI => (Gpr::Rdi, 8, false),
        R8 => (Gpr::R8, 8, false),
        R9 => (Gpr::R9, 8, false),
        R10 => (Gpr::R10, 8, false),
        R11 => (Gpr::R11, 8, false),
        R12 => (Gpr::R12, 8, false),
        R13 => (Gpr::R13, 8, false),
        R14 => (Gpr::R14, 8, false),
        R15 => (Gpr::R15, 8, false),
        _ => return None,
    })
}

/// Reads `r`'s current value, honoring the high-byte quirk.
pub fn read_gpr(regs: &Regs, reg: Register) -> Option<u64> {
    let (g, bytes, high) = gpr_info(reg)?;
    let raw = regs.gpr(g);
    Some(if high { (raw >> 8) & 0xFF } else { crate::alu::Width(bytes).truncate(raw) })
}

/// Public re-export of [`gpr_info`] for callers outside this module (e.g.
/// `exec::lea`/`exec::bswap`) that need the aliased [`Gpr`] and width for a
/// raw `iced_x86::Register` operand rather than a fetched operand value.
pub fn gpr_info_pub(reg: Register) -> Option<(Gpr, u8, bool)> {
    gpr_info(reg)
}

/// Translates an `iced_x86` segment register into this crate's [`SegReg`],
/// defaulting to DS for `Register::None` (no override, no implicit SS from
/// an rBP/rSP-based address — `iced` already resolved that default for us
/// via `Instruction::memory_segment`).
fn map_segment(reg: Register) -> SegReg {
    match reg {
        Register::ES => SegReg::Es,
        Register::CS => SegReg::Cs,
        Register::SS => SegReg::Ss,
        Register::FS => SegReg::Fs,
        Register::GS => SegReg::Gs,
        _ => SegReg::Ds,
    }
}

/// Resolves the full effective address of `instruction`'s memory operand
/// `idx`: base register + index register*scale + displacement, with
/// RIP-relative forms resolved against the instruction's own post-decode
/// `ip` (`spec.md` §4.B step 5). This is the piece `iced_x86::Instruction`
/// cannot supply on its own, since base/index values live in the guest
/// register snapshot, not in the static decode; `Instruction::virtual_address`
/// takes exactly this kind of register-resolution callback.
fn effective_offset(instruction: &Instruction, idx: u32, regs: &Regs, ad_bytes: u8) -> u64 {
    let raw = instruction
        .virtual_address(idx, 0, |register, _element_index, _element_size| {
            match register {
                Register::RIP => Some(instruction.next_ip()),
                Register::EIP => Some(instruction.next_ip32() as u64),
                _ => read_gpr(regs, register),
            }
        })
        .unwrap_or(0);
    // spec.md §3 invariant: "Memory.offset is always truncated to ad_bytes
    // after effective-address computation." `virtual_address` already masks
    // to the addressing width it decoded with, but re-truncating here keeps
    // the invariant explicit and independent of that internal behavior.
    crate::alu::Width(ad_bytes).truncate(raw)
}

/// Returns operand `idx`'s width in bytes without reading it: register width
/// from its sub-register kind, memory width from the decoded memory-operand
/// size. Used by MOVZX/MOVSX, which need the *source* operand's width
/// before fetching it — fetching it twice to learn the width first would
/// issue a second `ops.read` against the same address, an observable bug
/// against MMIO-backed memory with read side effects.
pub fn operand_width(decoded: &x86emu_decoder::Decoded, idx: u32) -> u8 {
    let instruction = &decoded.instruction;
    match instruction.op_kind(idx) {
        OpKind::Register => {
            let reg = instruction.op_register(idx);
            gpr_info(reg).map(|(_, bytes, _)| bytes).unwrap_or(1)
        }
        OpKind::Memory => {
            let bytes = instruction.memory_size().size();
            if bytes == 0 {
                1
            } else {
                bytes.min(8) as u8
            }
        }
        _ => 1,
    }
}

/// Fetches operand `idx` of `decoded`. Memory operands resolve their
/// effective address against `regs` and perform an actual `ops.read`;
/// register/immediate operands are pure.
pub fn fetch(
    ops: &mut dyn Ops,
    regs: &Regs,
    decoded: &x86emu_decoder::Decoded,
    idx: u32,
    op_bytes: u8,
) -> EmuResult<ResolvedOperand> {
    let instruction = &decoded.instruction;
    match instruction.op_kind(idx) {
        OpKind::Register => {
            let reg = instruction.op_register(idx);
            let (g, bytes, _) = gpr_info(reg).unwrap_or((Gpr::Rax, op_bytes, false));
            let val = read_gpr(regs, reg).unwrap_or(0);
            Ok(ResolvedOperand {
                dest: Destination::Register(g),
                bytes,
                val,
                orig_val: val,
            })
        }
        OpKind::Memory => {
            let seg = map_segment(instruction.memory_segment());
            let offset = effective_offset(instruction, idx, regs, decoded.ad_bytes);
            let bytes = instruction.memory_size().size().max(1).min(8) as u8;
            let bytes = if bytes == 0 { op_bytes } else { bytes };
            let mut buf = [0u8; 8];
            ops.read(seg, offset, &mut buf[..bytes as usize])?;
            let val = u64::from_le_bytes(buf);
            Ok(ResolvedOperand {
                dest: Destination::Memory { seg, offset },
                bytes,
                val,
                orig_val: val,
            })
        }
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => {
            let val = instruction.immediate(idx);
            Ok(ResolvedOperand {
                dest: Destination::None,
                bytes: op_bytes,
                val,
                orig_val: val,
            })
        }
        _ => Ok(ResolvedOperand {
            dest: Destination::None,
            bytes: op_bytes,
            val: 0,
            orig_val: 0,
        }),
    }
}

/// Computes the effective segment/offset for a memory operand without
/// reading through it, used by LEA and address-only instructions
/// (INVLPG, prefetch). Resolves whichever operand is the memory form,
/// which is always where these mnemonics encode their sole memory
/// reference.
pub fn effective_address(decoded: &x86emu_decoder::Decoded, regs: &Regs) -> (SegReg, u64) {
    let instruction = &decoded.instruction;
    let idx = (0..instruction.op_count())
        .find(|&i| instruction.op_kind(i) == OpKind::Memory)
        .unwrap_or(0);
    (
        map_segment(instruction.memory_segment()),
        effective_offset(instruction, idx, regs, decoded.ad_bytes),
    )
}
