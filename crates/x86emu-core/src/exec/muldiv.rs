//! MUL/IMUL/DIV/IDIV (single and double-width), BOUND, ARPL.

use crate::alu::{self, Width};
use crate::ctxt::Ctxt;
use crate::exception::{EmuResult, Exception};
use crate::operand;
use crate::ops::Ops;
use crate::state::{Eflags, Gpr};
use x86emu_decoder::Decoded;

use super::commit;

/// IMUL: one, two, or three operand forms, distinguished by `op_count`.
pub fn imul(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let ins = &decoded.instruction;
    match ins.op_count() {
        1 => {
            // IMUL r/m: AX/DX:AX/EDX:EAX/RDX:RAX = AL/AX/EAX/RAX * r/m.
            let src = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
            let acc = width.truncate(ctxt.regs.gpr(Gpr::Rax));
            let (low, high, overflow) = alu::imul_dbl(width, acc, src.val);
            write_double(ctxt, width, low, high);
            set_mul_flags(ctxt, overflow);
            Ok(())
        }
        2 => {
            let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
            let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
            let outcome = alu::imul2(width, dst.val, src.val);
            ctxt.regs.eflags = (ctxt.regs.eflags & !(Eflags::CF | Eflags::OF))
                | (outcome.flags & (Eflags::CF | Eflags::OF))
                | Eflags::MB1;
            commit(ctxt, ops, dst, outcome.result, false, false)
        }
        _ => {
            let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
            let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
            let imm = operand::fetch(ops, &ctxt.regs, decoded, 2, width.0)?;
            let outcome = alu::imul2(width, src.val, imm.val);
            ctxt.regs.eflags = (ctxt.regs.eflags & !(Eflags::CF | Eflags::OF))
                | (outcome.flags & (Eflags::CF | Eflags::OF))
                | Eflags::MB1;
            commit(ctxt, ops, dst, outcome.result, false, false)
        }
    }
}

pub fn mul(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let acc = width.truncate(ctxt.regs.gpr(Gpr::Rax));
    let (low, high, overflow) = alu::mul_dbl(width, acc, src.val);
    write_double(ctxt, width, low, high);
    set_mul_flags(ctxt, overflow);
    Ok(())
}

fn write_double(ctxt: &mut Ctxt, width: Width, low: u64, high: u64) {
    if width.0 == 1 {
        // 8-bit MUL/IMUL: result is AX, not AL:AH split registers.
        let combined = (low & 0xFF) | ((high & 0xFF) << 8);
        ctxt.regs.write_gpr_sized(Gpr::Rax, combined, 2);
    } else {
        ctxt.regs.write_gpr_sized(Gpr::Rax, low, width.0);
        ctxt.regs.write_gpr_sized(Gpr::Rdx, high, width.0);
    }
}

fn set_mul_flags(ctxt: &mut Ctxt, overflow: bool) {
    let mut f = Eflags::empty();
    f.set(Eflags::CF, overflow);
    f.set(Eflags::OF, overflow);
    ctxt.regs.eflags = (ctxt.regs.eflags & !(Eflags::CF | Eflags::OF)) | (f & (Eflags::CF | Eflags::OF)) | Eflags::MB1;
}

pub fn div(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let (low, high) = read_double(ctxt, width);
    match alu::div_dbl(width, low, high, src.val) {
        Some((q, r)) => {
            write_quot_rem(ctxt, width, q, r);
            Ok(())
        }
        None => Err(Exception::de().into()),
    }
}

pub fn idiv(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let (low, high) = read_double(ctxt, width);
    match alu::idiv_dbl(width, low, high, src.val) {
        Some((q, r)) => {
            write_quot_rem(ctxt, width, q, r);
            Ok(())
        }
        None => Err(Exception::de().into()),
    }
}

fn read_double(ctxt: &Ctxt, width: Width) -> (u64, u64) {
    if width.0 == 1 {
        (ctxt.regs.gpr(Gpr::Rax) & 0xFFFF, 0)
    } else {
        (width.truncate(ctxt.regs.gpr(Gpr::Rax)), width.truncate(ctxt.regs.gpr(Gpr::Rdx)))
    }
}

fn write_quot_rem(ctxt: &mut Ctxt, width: Width, q: u64, r: u64) {
    if width.0 == 1 {
        let combined = (q & 0xFF) | ((r & 0xFF) << 8);
        ctxt.regs.write_gpr_sized(Gpr::Rax, combined, 2);
    } else {
        ctxt.regs.write_gpr_sized(Gpr::Rax, q, width.0);
        ctxt.regs.write_gpr_sized(Gpr::Rdx, r, width.0);
    }
}

pub fn bound(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let index = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?.val;
    let (seg, offset) = operand::effective_address(decoded, &ctxt.regs);
    let mut lo_buf = [0u8; 8];
    let mut hi_buf = [0u8; 8];
    ops.read(seg, offset, &mut lo_buf[..width.0 as usize])?;
    ops.read(seg, offset + width.0 as u64, &mut hi_buf[..width.0 as usize])?;
    let lower = u64::from_le_bytes(lo_buf);
    let upper = u64::from_le_bytes(hi_buf);
    let _ = ins;
    if alu::bound_violation(width, index, lower, upper) {
        Err(Exception::br().into())
    } else {
        Ok(())
    }
}

pub fn arpl(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, 2)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, 2)?;
    let src_rpl = (src.val & 0b11) as u8;
    let (new_sel, adjusted) = alu::arpl(dst.val as u16, src_rpl);
    ctxt.regs.eflags.set(Eflags::ZF, adjusted);
    ctxt.regs.eflags.insert(Eflags::MB1);
    commit(ctxt, ops, dst, new_sel as u64, false, false)
}
