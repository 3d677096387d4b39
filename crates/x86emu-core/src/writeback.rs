//! Commits `dst` to register or memory, `spec.md` §4.I.

use crate::exception::EmuResult;
use crate::ops::Ops;
use crate::state::{Gpr, Regs, SegReg};

/// Where a resolved operand's value ultimately lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    None,
    Register(Gpr),
    Memory { seg: SegReg, offset: u64 },
}

/// The writeback-relevant half of a decoded operand: its destination, the
/// value to commit, the value it held before execution (for LOCKed CAS
/// retry and the "skip writeback when unchanged" rule), and its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritebackOp {
    pub dest: Destination,
    pub val: u64,
    pub orig_val: u64,
    pub bytes: u8,
    /// True for Mov-attributed opcodes (`spec.md` §4.A): writeback commits
    /// unconditionally even when `val == orig_val`, since a Mov is
    /// write-only and was never a read-modify-write to begin with.
    pub is_mov: bool,
    pub lock: bool,
}

/// Commits `op`, honoring the "skip writeback when unchanged" rule and the
/// LOCK-prefix CAS discipline for memory destinations.
pub fn commit(ops: &mut dyn Ops, regs: &mut Regs, op: WritebackOp, force_writeback: bool) -> EmuResult<()> {
    match op.dest {
        Destination::None => Ok(()),
        Destination::Register(r) => {
            regs.write_gpr_sized(r, op.val, op.bytes);
            Ok(())
        }
        Destination::Memory { seg, offset } => {
            if !force_writeback && !op.is_mov && op.val == op.orig_val {
                return Ok(());
            }
            let new_bytes = op.val.to_le_bytes();
            let old_bytes = op.orig_val.to_le_bytes();
            let n = op.bytes as usize;
            if op.lock {
                ops.cmpxchg(seg, offset, &old_bytes[..n], &new_bytes[..n])
            } else {
                ops.write(seg, offset, &new_bytes[..n])
            }
        }
    }
}

/// Post-execution RIP/EFLAGS housekeeping `spec.md` §4.I's "Finally:" list
/// describes: zero-extend RIP to 32 bits outside 64-bit mode, arm
/// `retire.singlestep` unless a MOV-SS shadow is active, and clear
/// EFLAGS.RF.
pub fn finish_instruction(
    regs: &mut Regs,
    is_64bit_mode: bool,
    retire: &mut crate::exception::Retire,
) {
    if !is_64bit_mode {
        regs.rip &= 0xFFFF_FFFF;
    }
    if regs.eflags.contains(crate::state::Eflags::TF) && !retire.mov_ss_shadow {
        retire.singlestep = true;
    }
    regs.eflags.remove(crate::state::Eflags::RF);
}
