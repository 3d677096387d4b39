//! Stack operations and control transfer: PUSH/POP family, PUSHF/POPF,
//! PUSHA/POPA, ENTER/LEAVE, JMP/CALL/RET, LOOP family, Jcc/SETcc.

use iced_x86::Mnemonic;

use crate::alu::Width;
use crate::ctxt::Ctxt;
use crate::exception::EmuResult;
use crate::operand;
use crate::ops::Ops;
use crate::seg;
use crate::state::{AddressMode, Eflags, Gpr, SegReg};
use x86emu_decoder::Decoded;

use super::{commit, condition_holds};

fn stack_bytes(ctxt: &Ctxt) -> u8 {
    match ctxt.stack_mode {
        AddressMode::Bits16 => 2,
        AddressMode::Bits32 => 4,
        AddressMode::Bits64 => 8,
    }
}

pub(crate) fn push_raw(ctxt: &mut Ctxt, ops: &mut dyn Ops, val: u64, bytes: u8) -> EmuResult<()> {
    let new_rsp = Width(stack_bytes(ctxt)).truncate(ctxt.regs.gpr(Gpr::Rsp).wrapping_sub(bytes as u64));
    ops.write(SegReg::Ss, new_rsp, &val.to_le_bytes()[..bytes as usize])?;
    ctxt.regs.write_gpr_sized(Gpr::Rsp, new_rsp, stack_bytes(ctxt));
    Ok(())
}

fn pop_raw(ctxt: &mut Ctxt, ops: &mut dyn Ops, bytes: u8) -> EmuResult<u64> {
    let rsp = ctxt.regs.gpr(Gpr::Rsp);
    let mut buf = [0u8; 8];
    ops.read(SegReg::Ss, rsp, &mut buf[..bytes as usize])?;
    let val = u64::from_le_bytes(buf);
    let new_rsp = Width(stack_bytes(ctxt)).truncate(rsp.wrapping_add(bytes as u64));
    ctxt.regs.write_gpr_sized(Gpr::Rsp, new_rsp, stack_bytes(ctxt));
    Ok(val)
}

pub fn push(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    push_raw(ctxt, ops, src.val, width.0)
}

pub fn pop(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let val = pop_raw(ctxt, ops, width.0)?;
    commit(ctxt, ops, dst, val, true, false)
}

pub fn pushf(ctxt: &mut Ctxt, ops: &mut dyn Ops, width: Width) -> EmuResult<()> {
    // VM and RF are never visible on the stack image; masked to 0.
    let masked = ctxt.regs.eflags & !(Eflags::VM | Eflags::RF);
    push_raw(ctxt, ops, masked.bits(), width.0)
}

pub fn popf(ctxt: &mut Ctxt, ops: &mut dyn Ops, width: Width) -> EmuResult<()> {
    let val = pop_raw(ctxt, ops, width.0)?;
    let incoming = Eflags::from_bits_truncate(val);
    // IOPL/IF may only change at CPL 0; VM/VIF/VIP are never affected by a
    // plain (non-V86) POPF. This model applies the full incoming value
    // when CPL is 0 and otherwise preserves IOPL/IF, matching the
    // privileged-vs-unprivileged POPF split the architecture defines.
    let preserved = if ctxt.regs.cpl() == 0 {
        Eflags::empty()
    } else {
        Eflags::IOPL | Eflags::IF
    };
    let kept = ctxt.regs.eflags & preserved;
    let applied = (incoming & !preserved) | kept;
    ctxt.regs.eflags = (applied & !(Eflags::VM | Eflags::RF)).canonicalize();
    Ok(())
}

pub fn pusha(ctxt: &mut Ctxt, ops: &mut dyn Ops, width: Width) -> EmuResult<()> {
    let orig_sp = ctxt.regs.gpr(Gpr::Rsp);
    let order = [Gpr::Rax, Gpr::Rcx, Gpr::Rdx, Gpr::Rbx, Gpr::Rsp, Gpr::Rbp, Gpr::Rsi, Gpr::Rdi];
    for g in order {
        let val = if g == Gpr::Rsp { orig_sp } else { ctxt.regs.gpr(g) };
        push_raw(ctxt, ops, Width(width.0).truncate(val), width.0)?;
    }
    Ok(())
}

pub fn popa(ctxt: &mut Ctxt, ops: &mut dyn Ops, width: Width) -> EmuResult<()> {
    // Reverse of PUSHA's order, skipping the write to SP itself (POPA
    // discards the popped SP slot and lets the stack pointer arithmetic
    // itself restore it).
    let order = [Gpr::Rdi, Gpr::Rsi, Gpr::Rbp, Gpr::Rsp, Gpr::Rbx, Gpr::Rdx, Gpr::Rcx, Gpr::Rax];
    for g in order {
        let val = pop_raw(ctxt, ops, width.0)?;
        if g != Gpr::Rsp {
            ctxt.regs.write_gpr_sized(g, val, width.0);
        }
    }
    Ok(())
}

pub fn enter(ctxt: &mut Ctxt, ops: &mut dyn Ops, ins: &iced_x86::Instruction, width: Width) -> EmuResult<()> {
    let alloc = ins.immediate16() as u64;
    let nesting = (ins.immediate8_2nd() & 0x1F) as u32;
    let frame_bytes = width.0;
    push_raw(ctxt, ops, ctxt.regs.gpr(Gpr::Rbp), frame_bytes)?;
    let frame_temp = ctxt.regs.gpr(Gpr::Rsp);
    if nesting > 0 {
        for i in 1..nesting {
            let bp = ctxt.regs.gpr(Gpr::Rbp).wrapping_sub((i as u64) * frame_bytes as u64);
            let mut buf = [0u8; 8];
            ops.read(SegReg::Ss, bp, &mut buf[..frame_bytes as usize])?;
            push_raw(ctxt, ops, u64::from_le_bytes(buf), frame_bytes)?;
        }
        push_raw(ctxt, ops, frame_temp, frame_bytes)?;
    }
    ctxt.regs.write_gpr_sized(Gpr::Rbp, frame_temp, frame_bytes);
    let new_rsp = Width(stack_bytes(ctxt)).truncate(ctxt.regs.gpr(Gpr::Rsp).wrapping_sub(alloc));
    ctxt.regs.write_gpr_sized(Gpr::Rsp, new_rsp, stack_bytes(ctxt));
    Ok(())
}

pub fn leave(ctxt: &mut Ctxt, ops: &mut dyn Ops, width: Width) -> EmuResult<()> {
    ctxt.regs.write_gpr_sized(Gpr::Rsp, ctxt.regs.gpr(Gpr::Rbp), stack_bytes(ctxt));
    let val = pop_raw(ctxt, ops, width.0)?;
    ctxt.regs.write_gpr_sized(Gpr::Rbp, val, width.0);
    Ok(())
}

fn near_target(ins: &iced_x86::Instruction, _mode: AddressMode) -> u64 {
    ins.near_branch_target()
}

pub fn jmp(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let ins = &decoded.instruction;
    if ins.is_jmp_short_or_near() {
        ctxt.regs.rip = near_target(ins, ctxt.mode);
        return Ok(());
    }
    if ins.is_jmp_far() {
        return far_transfer(ctxt, ops, decoded, false);
    }
    // Indirect near jmp through register or memory.
    let target = operand::fetch(ops, &ctxt.regs, decoded, 0, decoded.op_bytes)?.val;
    ctxt.regs.rip = target;
    Ok(())
}

pub fn call(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let ret_addr = decoded.next_ip();
    if ins.is_call_far() {
        push_raw(ctxt, ops, ctxt.regs.seg(SegReg::Cs).selector as u64, stack_bytes(ctxt))?;
        push_raw(ctxt, ops, ret_addr, stack_bytes(ctxt))?;
        return far_transfer(ctxt, ops, decoded, true);
    }
    let target = if ins.is_call_near() {
        near_target(ins, ctxt.mode)
    } else {
        operand::fetch(ops, &ctxt.regs, decoded, 0, decoded.op_bytes)?.val
    };
    push_raw(ctxt, ops, ret_addr, stack_bytes(ctxt))?;
    ctxt.regs.rip = target;
    Ok(())
}

fn far_transfer(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, is_call: bool) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let (selector, offset) = if ins.op0_kind() == iced_x86::OpKind::Memory {
        let (seg, off) = operand::effective_address(decoded, &ctxt.regs);
        let mut buf = [0u8; 8];
        ops.read(seg, off, &mut buf[..decoded.op_bytes as usize])?;
        let offset = u64::from_le_bytes(buf);
        let mut sel_buf = [0u8; 2];
        ops.read(seg, off + decoded.op_bytes as u64, &mut sel_buf)?;
        (u16::from_le_bytes(sel_buf), offset)
    } else {
        (ins.far_branch_selector(), ins.far_branch32() as u64)
    };
    let _ = is_call;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), selector, false)?;
    ctxt.regs.rip = offset;
    Ok(())
}

pub fn ret_near(ctxt: &mut Ctxt, ops: &mut dyn Ops, ins: &iced_x86::Instruction, width: Width) -> EmuResult<()> {
    let target = pop_raw(ctxt, ops, width.0)?;
    if ins.op_count() > 0 {
        let extra = ins.immediate16() as u64;
        let new_rsp = Width(stack_bytes(ctxt)).truncate(ctxt.regs.gpr(Gpr::Rsp).wrapping_add(extra));
        ctxt.regs.write_gpr_sized(Gpr::Rsp, new_rsp, stack_bytes(ctxt));
    }
    ctxt.regs.rip = target;
    Ok(())
}

pub fn ret_far(ctxt: &mut Ctxt, ops: &mut dyn Ops, ins: &iced_x86::Instruction) -> EmuResult<()> {
    let bytes = stack_bytes(ctxt);
    let offset = pop_raw(ctxt, ops, bytes)?;
    let selector = pop_raw(ctxt, ops, bytes)? as u16;
    if ins.op_count() > 0 {
        let extra = ins.immediate16() as u64;
        let new_rsp = Width(bytes).truncate(ctxt.regs.gpr(Gpr::Rsp).wrapping_add(extra));
        ctxt.regs.write_gpr_sized(Gpr::Rsp, new_rsp, bytes);
    }
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), selector, true)?;
    ctxt.regs.rip = offset;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCond {
    Always,
    E,
    Ne,
}

pub fn loop_insn(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, cond: LoopCond) -> EmuResult<()> {
    let ad_bytes = decoded.ad_bytes;
    let cur = Width(ad_bytes).truncate(ctxt.regs.gpr(Gpr::Rcx).wrapping_sub(1));
    ctxt.regs.write_gpr_sized(Gpr::Rcx, cur, ad_bytes);
    let zf = ctxt.regs.eflags.contains(Eflags::ZF);
    let take = cur != 0
        && match cond {
            LoopCond::Always => true,
            LoopCond::E => zf,
            LoopCond::Ne => !zf,
        };
    if take {
        ctxt.regs.rip = near_target(&decoded.instruction, ctxt.mode);
    }
    let _ = ops;
    Ok(())
}

pub fn jcxz(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let cur = Width(decoded.ad_bytes).truncate(ctxt.regs.gpr(Gpr::Rcx));
    if cur == 0 {
        ctxt.regs.rip = near_target(&decoded.instruction, ctxt.mode);
    }
    let _ = ops;
    Ok(())
}

pub fn jcc(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, m: Mnemonic) -> EmuResult<()> {
    if condition_holds(m, ctxt.regs.eflags) {
        ctxt.regs.rip = near_target(&decoded.instruction, ctxt.mode);
    }
    let _ = ops;
    Ok(())
}

pub fn setcc(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, m: Mnemonic) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, 1)?;
    let val = condition_holds(m, ctxt.regs.eflags) as u64;
    commit(ctxt, ops, dst, val, true, false)
}
