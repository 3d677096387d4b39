//! System/privileged instructions: interrupt/exception delivery, SYSCALL
//! family, CMPXCHG/CMPXCHG8B/16B, I/O, CR/DR/MSR/segment moves, descriptor
//! table loads, and the small portable-algorithm families (MOVBE/CRC32/
//! RDRAND/RDSEED) `SPEC_FULL.md` §6 groups with this dispatch.

use iced_x86::{Instruction, Mnemonic};

use crate::alu::{AluOp, Width};
use crate::ctxt::{Ctxt, SoftwareInterruptPolicy};
use crate::exception::{EmuError, EmuResult, Exception, GateType, PendingEvent};
use crate::operand;
use crate::ops::{CpuidLeaf, IdtGate, Ops};
use crate::seg;
use crate::state::{Cr0, Eflags, Gpr, SegReg};
use x86emu_decoder::Decoded;

use super::{commit, merge_arith_flags};

// ---- flags ---------------------------------------------------------------

pub fn cli(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    check_iopl(ctxt, ops)?;
    ctxt.regs.eflags.remove(Eflags::IF);
    Ok(())
}

pub fn sti(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    check_iopl(ctxt, ops)?;
    let was_off = !ctxt.regs.eflags.contains(Eflags::IF);
    ctxt.regs.eflags.insert(Eflags::IF);
    // STI's one-instruction interrupt-shadow window: an interrupt becoming
    // unmasked here must not fire until the instruction after this one has
    // retired.
    ctxt.retire.sti_blocked = was_off;
    Ok(())
}

fn check_iopl(ctxt: &Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let _ = ops;
    if !ctxt.regs.cr0.contains(Cr0::PE) || ctxt.regs.eflags.iopl() >= ctxt.regs.cpl() {
        Ok(())
    } else {
        Err(Exception::gp0().into())
    }
}

// ---- software interrupt injection (spec.md §4.H) -------------------------

fn idt_gate_type(type_attr: u8, long_mode: bool) -> Option<GateType> {
    match type_attr & 0x1F {
        0x6 if !long_mode => Some(GateType::Interrupt16),
        0x7 if !long_mode => Some(GateType::Trap16),
        0x5 if !long_mode => Some(GateType::Task),
        0xE => Some(GateType::Interrupt32),
        0xF => Some(GateType::Trap32),
        _ => None,
    }
}

fn read_idt_gate(ctxt: &Ctxt, ops: &mut dyn Ops, vector: u8) -> EmuResult<IdtGate> {
    let idtr = ctxt.regs.seg(SegReg::Idtr);
    let long_mode = ctxt.regs.long_mode_active();
    let gate_size: u64 = if long_mode { 16 } else { 8 };
    let entry_offset = vector as u64 * gate_size;
    if entry_offset + gate_size > idtr.limit as u64 + 1 {
        return Err(Exception::gp(vector as u32 * 8 + 2).into());
    }
    let mut lo = [0u8; 8];
    ops.read(SegReg::Idtr, idtr.base + entry_offset, &mut lo)?;
    let low = u64::from_le_bytes(lo);
    let selector = ((low >> 16) & 0xFFFF) as u16;
    let type_attr = ((low >> 40) & 0xFF) as u8;
    let present = type_attr & 0x80 != 0;
    let dpl = (type_attr >> 5) & 0b11;
    let offset_low = low & 0xFFFF;
    let offset_mid = (low >> 48) & 0xFFFF;
    let offset = if long_mode {
        let mut hi = [0u8; 8];
        ops.read(SegReg::Idtr, idtr.base + entry_offset + 8, &mut hi)?;
        let high = u64::from_le_bytes(hi) & 0xFFFF_FFFF;
        offset_low | (offset_mid << 16) | (high << 32)
    } else {
        offset_low | (offset_mid << 16)
    };
    let gate_type = idt_gate_type(type_attr, long_mode).ok_or_else(|| EmuError::from(Exception::gp(vector as u32 * 8 + 2)))?;
    Ok(IdtGate {
        gate_type,
        present,
        dpl,
        selector,
        offset,
    })
}

/// INT3 / INT imm8: validated software-interrupt injection per `spec.md`
/// §4.H. `exempt_cpl_check` is true only for ICEBP, which bypasses the
/// CPL-vs-gate-DPL comparison every other software interrupt source obeys.
pub fn software_interrupt(ctxt: &mut Ctxt, ops: &mut dyn Ops, vector: u8, exempt_cpl_check: bool) -> EmuResult<()> {
    if ctxt.swint_policy == SoftwareInterruptPolicy::Defer {
        return Err(EmuError::Unhandleable);
    }
    let gate = read_idt_gate(ctxt, ops, vector)?;
    if matches!(gate.gate_type, GateType::Task) {
        return Err(EmuError::Unhandleable);
    }
    if !gate.present {
        return Err(Exception::np(vector as u32 * 8 + 2).into());
    }
    if !exempt_cpl_check && ctxt.regs.cpl() > gate.dpl {
        return Err(Exception::gp(vector as u32 * 8 + 0b10).into());
    }
    inject_frame(ctxt, ops, &gate)
}

fn inject_frame(ctxt: &mut Ctxt, ops: &mut dyn Ops, gate: &IdtGate) -> EmuResult<()> {
    let bytes = if ctxt.mode.is_64bit() { 8 } else { 4 };
    let ret_rip = ctxt.regs.rip;
    let old_flags = ctxt.regs.eflags;
    let old_cs = ctxt.regs.seg(SegReg::Cs).selector;
    super::control::push_raw(ctxt, ops, old_flags.bits(), bytes)?;
    super::control::push_raw(ctxt, ops, old_cs as u64, bytes)?;
    super::control::push_raw(ctxt, ops, ret_rip, bytes)?;
    if matches!(gate.gate_type, GateType::Interrupt16 | GateType::Interrupt32) {
        ctxt.regs.eflags.remove(Eflags::IF);
    }
    ctxt.regs.eflags.remove(Eflags::TF | Eflags::RF | Eflags::VM);
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), gate.selector, false)?;
    ctxt.regs.rip = gate.offset;
    Ok(())
}

pub fn into(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    if ctxt.regs.eflags.contains(Eflags::OF) {
        software_interrupt(ctxt, ops, Exception::Of.vector(), false)
    } else {
        Ok(())
    }
}

pub fn icebp(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    software_interrupt(ctxt, ops, Exception::Db.vector(), true)
}

pub fn iret(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let bytes: u8 = if ctxt.mode.is_64bit() { 8 } else { 4 };
    let rsp = ctxt.regs.gpr(Gpr::Rsp);
    let mut buf = [0u8; 8];
    ops.read(SegReg::Ss, rsp, &mut buf[..bytes as usize])?;
    let new_rip = u64::from_le_bytes(buf);
    ops.read(SegReg::Ss, rsp + bytes as u64, &mut buf[..bytes as usize])?;
    let new_cs = u64::from_le_bytes(buf) as u16;
    ops.read(SegReg::Ss, rsp + 2 * bytes as u64, &mut buf[..bytes as usize])?;
    let new_flags = u64::from_le_bytes(buf);
    let new_rsp = rsp.wrapping_add(3 * bytes as u64);
    ctxt.regs.write_gpr_sized(Gpr::Rsp, new_rsp, bytes);
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), new_cs, true)?;
    ctxt.regs.rip = new_rip;
    let preserved = if ctxt.regs.cpl() == 0 { Eflags::empty() } else { Eflags::IOPL | Eflags::IF };
    let kept = ctxt.regs.eflags & preserved;
    ctxt.regs.eflags = ((Eflags::from_bits_truncate(new_flags) & !preserved) | kept).canonicalize();
    Ok(())
}

// ---- fast system call family ----------------------------------------------

pub fn syscall(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    if ctxt.regs.efer & crate::state::EFER_SCE == 0 {
        return Err(Exception::ud().into());
    }
    let star = ops.read_msr(0xC000_0081)?;
    let lstar = ops.read_msr(0xC000_0082)?;
    let sfmask = ops.read_msr(0xC000_0084)?;
    ctxt.regs.set_gpr(Gpr::Rcx, ctxt.regs.rip);
    let r11 = ctxt.regs.eflags.bits();
    ctxt.regs.eflags = Eflags::from_bits_truncate(ctxt.regs.eflags.bits() & !sfmask).canonicalize();
    let cs_sel = ((star >> 32) & 0xFFFF) as u16 & !0b11;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), cs_sel, false)?;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Ss), cs_sel.wrapping_add(8), false)?;
    ctxt.regs.rip = lstar;
    ctxt.regs.set_gpr(Gpr::R11, r11);
    Ok(())
}

pub fn sysret(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let star = ops.read_msr(0xC000_0081)?;
    let cs_sel = (((star >> 48) & 0xFFFF) as u16 & !0b11) | 0b11;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), cs_sel, true)?;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Ss), cs_sel.wrapping_add(8), true)?;
    ctxt.regs.rip = ctxt.regs.gpr(Gpr::Rcx);
    ctxt.regs.eflags = Eflags::from_bits_truncate(ctxt.regs.gpr(Gpr::R11)).canonicalize();
    Ok(())
}

pub fn sysenter(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let cs = ops.read_msr(0x174)? as u16 & !0b11;
    let eip = ops.read_msr(0x176)?;
    let esp = ops.read_msr(0x175)?;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), cs, false)?;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Ss), cs.wrapping_add(8), false)?;
    ctxt.regs.set_gpr(Gpr::Rsp, esp);
    ctxt.regs.rip = eip;
    ctxt.regs.eflags.remove(Eflags::VM | Eflags::IF | Eflags::RF);
    Ok(())
}

pub fn sysexit(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let cs = ops.read_msr(0x174)? as u16;
    let user_cs = (cs.wrapping_add(16) & !0b11) | 0b11;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Cs), user_cs, true)?;
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(SegReg::Ss), user_cs.wrapping_add(8), true)?;
    ctxt.regs.set_gpr(Gpr::Rsp, ctxt.regs.gpr(Gpr::Rdx));
    ctxt.regs.rip = ctxt.regs.gpr(Gpr::Rcx);
    Ok(())
}

// ---- atomics --------------------------------------------------------------

pub fn cmpxchg(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width, lock: bool) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let acc = width.truncate(ctxt.regs.gpr(Gpr::Rax));
    let outcome = alu_cmp(width, acc, dst.val);
    ctxt.regs.eflags = merge_arith_flags(ctxt.regs.eflags, outcome);
    if acc == width.truncate(dst.val) {
        commit(ctxt, ops, dst, src.val, true, lock)
    } else {
        ctxt.regs.write_gpr_sized(Gpr::Rax, dst.val, width.0);
        Ok(())
    }
}

fn alu_cmp(width: Width, a: u64, b: u64) -> Eflags {
    crate::alu::alu_op(AluOp::Cmp, width, a, b, false).flags
}

pub fn cmpxchg8b(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, lock: bool) -> EmuResult<()> {
    let (seg, offset) = operand::effective_address(decoded, &ctxt.regs);
    let mut buf = [0u8; 8];
    ops.read(seg, offset, &mut buf)?;
    let mem = u64::from_le_bytes(buf);
    let acc_lo = ctxt.regs.gpr(Gpr::Rax) as u32;
    let acc_hi = ctxt.regs.gpr(Gpr::Rdx) as u32;
    let acc64 = ((acc_hi as u64) << 32) | acc_lo as u64;
    let matched = mem == acc64;
    ctxt.regs.eflags.set(Eflags::ZF, matched);
    ctxt.regs.eflags.insert(Eflags::MB1);
    if matched {
        let new = ((ctxt.regs.gpr(Gpr::Rcx) as u32 as u64) << 32) | (ctxt.regs.gpr(Gpr::Rbx) as u32 as u64);
        if lock {
            ops.cmpxchg(seg, offset, &mem.to_le_bytes(), &new.to_le_bytes())
        } else {
            ops.write(seg, offset, &new.to_le_bytes())
        }
    } else {
        ctxt.regs.write_gpr_sized(Gpr::Rax, mem & 0xFFFF_FFFF, 4);
        ctxt.regs.write_gpr_sized(Gpr::Rdx, mem >> 32, 4);
        Ok(())
    }
}

pub fn cmpxchg16b(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, lock: bool) -> EmuResult<()> {
    let (seg, offset) = operand::effective_address(decoded, &ctxt.regs);
    if offset % 16 != 0 {
        return Err(Exception::gp0().into());
    }
    let mut lo_buf = [0u8; 8];
    let mut hi_buf = [0u8; 8];
    ops.read(seg, offset, &mut lo_buf)?;
    ops.read(seg, offset + 8, &mut hi_buf)?;
    let mem_lo = u64::from_le_bytes(lo_buf);
    let mem_hi = u64::from_le_bytes(hi_buf);
    let acc_lo = ctxt.regs.gpr(Gpr::Rax);
    let acc_hi = ctxt.regs.gpr(Gpr::Rdx);
    let matched = mem_lo == acc_lo && mem_hi == acc_hi;
    ctxt.regs.eflags.set(Eflags::ZF, matched);
    ctxt.regs.eflags.insert(Eflags::MB1);
    if matched {
        let new_lo = ctxt.regs.gpr(Gpr::Rbx);
        let new_hi = ctxt.regs.gpr(Gpr::Rcx);
        if lock {
            ops.cmpxchg(seg, offset, &mem_lo.to_le_bytes(), &new_lo.to_le_bytes())?;
            ops.cmpxchg(seg, offset + 8, &mem_hi.to_le_bytes(), &new_hi.to_le_bytes())
        } else {
            ops.write(seg, offset, &new_lo.to_le_bytes())?;
            ops.write(seg, offset + 8, &new_hi.to_le_bytes())
        }
    } else {
        ctxt.regs.set_gpr(Gpr::Rax, mem_lo);
        ctxt.regs.set_gpr(Gpr::Rdx, mem_hi);
        Ok(())
    }
}

// ---- I/O -------------------------------------------------------------------

pub fn in_(ctxt: &mut Ctxt, ops: &mut dyn Ops, ins: &Instruction, width: Width) -> EmuResult<()> {
    let port = if ins.op1_kind() == iced_x86::OpKind::Immediate8 {
        ins.immediate8() as u16
    } else {
        (ctxt.regs.gpr(Gpr::Rdx) & 0xFFFF) as u16
    };
    check_io_permission(ctxt, port)?;
    let mut buf = [0u8; 8];
    ops.read_io(port, &mut buf[..width.0 as usize])?;
    let val = u64::from_le_bytes(buf);
    ctxt.regs.write_gpr_sized(Gpr::Rax, val, width.0);
    Ok(())
}

pub fn out_(ctxt: &mut Ctxt, ops: &mut dyn Ops, ins: &Instruction, width: Width) -> EmuResult<()> {
    let port = if ins.op0_kind() == iced_x86::OpKind::Immediate8 {
        ins.immediate8() as u16
    } else {
        (ctxt.regs.gpr(Gpr::Rdx) & 0xFFFF) as u16
    };
    check_io_permission(ctxt, port)?;
    let val = Width(width.0).truncate(ctxt.regs.gpr(Gpr::Rax));
    ops.write_io(port, &val.to_le_bytes()[..width.0 as usize])
}

/// IOPL-vs-CPL comparison only; the TSS I/O permission bitmap itself is a
/// caller concern the core defers to `read_io`/`write_io`'s own
/// `Unhandleable`/`Exception` response, per `SPEC_FULL.md` §6.
fn check_io_permission(ctxt: &Ctxt, _port: u16) -> EmuResult<()> {
    if !ctxt.regs.cr0.contains(Cr0::PE) || ctxt.regs.eflags.iopl() >= ctxt.regs.cpl() {
        Ok(())
    } else {
        Err(Exception::gp0().into())
    }
}

// ---- CPUID / counters / cache management -----------------------------------

pub fn cpuid(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let eax_in = ctxt.regs.gpr(Gpr::Rax) as u32;
    let ecx_in = ctxt.regs.gpr(Gpr::Rcx) as u32;
    let leaf: CpuidLeaf = ops.cpuid(eax_in, ecx_in)?;
    ctxt.regs.write_gpr_sized(Gpr::Rax, leaf.0 as u64, 4);
    ctxt.regs.write_gpr_sized(Gpr::Rbx, leaf.1 as u64, 4);
    ctxt.regs.write_gpr_sized(Gpr::Rcx, leaf.2 as u64, 4);
    ctxt.regs.write_gpr_sized(Gpr::Rdx, leaf.3 as u64, 4);
    Ok(())
}

const IA32_TSC: u32 = 0x10;
const IA32_TSC_AUX: u32 = 0xC000_0103;

pub fn rdtsc(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let tsc = ops.read_msr(IA32_TSC)?;
    ctxt.regs.write_gpr_sized(Gpr::Rax, tsc & 0xFFFF_FFFF, 4);
    ctxt.regs.write_gpr_sized(Gpr::Rdx, tsc >> 32, 4);
    Ok(())
}

pub fn rdtscp(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    rdtsc(ctxt, ops)?;
    let aux = ops.read_msr(IA32_TSC_AUX)?;
    ctxt.regs.write_gpr_sized(Gpr::Rcx, aux & 0xFFFF_FFFF, 4);
    Ok(())
}

pub fn rdpmc(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let idx = ctxt.regs.gpr(Gpr::Rcx) as u32;
    let val = ops.read_msr(0xC1 + idx)?;
    ctxt.regs.write_gpr_sized(Gpr::Rax, val & 0xFFFF_FFFF, 4);
    ctxt.regs.write_gpr_sized(Gpr::Rdx, val >> 32, 4);
    Ok(())
}

pub fn rdmsr(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let idx = ctxt.regs.gpr(Gpr::Rcx) as u32;
    let val = ops.read_msr(idx)?;
    ctxt.regs.write_gpr_sized(Gpr::Rax, val & 0xFFFF_FFFF, 4);
    ctxt.regs.write_gpr_sized(Gpr::Rdx, val >> 32, 4);
    Ok(())
}

pub fn wrmsr(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let idx = ctxt.regs.gpr(Gpr::Rcx) as u32;
    let val = (ctxt.regs.gpr(Gpr::Rdx) << 32) | (ctxt.regs.gpr(Gpr::Rax) & 0xFFFF_FFFF);
    ops.write_msr(idx, val)
}

// ---- CR/DR/segment/descriptor-table privileged moves -----------------------

pub fn clts(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let cr0 = ops.read_cr(0)?;
    ops.write_cr(0, cr0 & !(Cr0::TS.bits()))
}

fn umip_gate(ctxt: &Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let cr4 = ops.cr4_flags()?;
    if cr4.contains(crate::state::Cr4::UMIP) && ctxt.regs.cpl() > 0 {
        Err(Exception::gp0().into())
    } else {
        Ok(())
    }
}

pub fn smsw(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    umip_gate(ctxt, ops)?;
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let cr0 = ops.read_cr(0)?;
    commit(ctxt, ops, dst, cr0, true, false)
}

pub fn lmsw(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    if ctxt.regs.cpl() != 0 {
        return Err(Exception::gp0().into());
    }
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, 2)?;
    let cr0 = ops.read_cr(0)?;
    let new = (cr0 & !0xF) | (src.val & 0xF) | (cr0 & Cr0::PE.bits());
    ops.write_cr(0, new)
}

pub fn sgidt(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, which: Mnemonic) -> EmuResult<()> {
    umip_gate(ctxt, ops)?;
    let seg = if which == Mnemonic::Sgdt { SegReg::Gdtr } else { SegReg::Idtr };
    let record = ctxt.regs.seg(seg);
    let (out_seg, offset) = operand::effective_address(decoded, &ctxt.regs);
    let mut buf = [0u8; 10];
    buf[..2].copy_from_slice(&(record.limit as u16).to_le_bytes());
    buf[2..10].copy_from_slice(&record.base.to_le_bytes());
    ops.write(out_seg, offset, &buf)
}

pub fn lgidt(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, which: Mnemonic) -> EmuResult<()> {
    if ctxt.regs.cpl() != 0 {
        return Err(Exception::gp0().into());
    }
    let (in_seg, offset) = operand::effective_address(decoded, &ctxt.regs);
    let mut limit_buf = [0u8; 2];
    let mut base_buf = [0u8; 8];
    ops.read(in_seg, offset, &mut limit_buf)?;
    ops.read(in_seg, offset + 2, &mut base_buf)?;
    let target = if which == Mnemonic::Lgdt { SegReg::Gdtr } else { SegReg::Idtr };
    let mut record = *ctxt.regs.seg(target);
    record.limit = u16::from_le_bytes(limit_buf) as u32;
    record.base = u64::from_le_bytes(base_buf);
    ops.write_segment(target, record)
}

pub fn sldt_str(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width, which: Mnemonic) -> EmuResult<()> {
    if which == Mnemonic::Sldt {
        umip_gate(ctxt, ops)?;
    }
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let seg = if which == Mnemonic::Sldt { SegReg::Ldtr } else { SegReg::Tr };
    let selector = ops.read_segment(seg)?.selector;
    commit(ctxt, ops, dst, selector as u64, true, false)
}

pub fn lldt_ltr(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, which: Mnemonic) -> EmuResult<()> {
    if ctxt.regs.cpl() != 0 {
        return Err(Exception::gp0().into());
    }
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, 2)?;
    let target = if which == Mnemonic::Lldt { SegReg::Ldtr } else { SegReg::Tr };
    seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(target), src.val as u16, false)
}

pub fn verr_verw(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, which: Mnemonic) -> EmuResult<()> {
    let src = operand::fetch(ops, &ctxt.regs, decoded, 0, 2)?;
    let result = seg::protmode_load_seg(ops, &ctxt.regs, ctxt.vendor, None, src.val as u16, false);
    let zf = match result {
        Ok(record) => {
            if which == Mnemonic::Verr {
                record.present() && (record.attr & 0x18 != 0x10 || record.attr & 0x2 != 0)
            } else {
                record.present() && record.attr & 0x1A == 0x12
            }
        }
        Err(e @ EmuError::Exception(PendingEvent { vector: Exception::Pf, .. })) => return Err(e),
        Err(_) => false,
    };
    ctxt.regs.eflags.set(Eflags::ZF, zf);
    ctxt.regs.eflags.insert(Eflags::MB1);
    Ok(())
}

pub fn lar(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, 2)?;
    let result = seg::protmode_load_seg(ops, &ctxt.regs, ctxt.vendor, None, src.val as u16, false);
    match result {
        Ok(record) => {
            ctxt.regs.eflags.insert(Eflags::ZF | Eflags::MB1);
            let attrs = (record.attr as u64) << 8;
            commit(ctxt, ops, dst, attrs, true, false)
        }
        Err(e @ EmuError::Exception(PendingEvent { vector: Exception::Pf, .. })) => Err(e),
        Err(_) => {
            ctxt.regs.eflags.remove(Eflags::ZF);
            ctxt.regs.eflags.insert(Eflags::MB1);
            Ok(())
        }
    }
}

pub fn lsl(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, 2)?;
    let result = seg::protmode_load_seg(ops, &ctxt.regs, ctxt.vendor, None, src.val as u16, false);
    match result {
        Ok(record) => {
            ctxt.regs.eflags.insert(Eflags::ZF | Eflags::MB1);
            commit(ctxt, ops, dst, record.limit as u64, true, false)
        }
        Err(e @ EmuError::Exception(PendingEvent { vector: Exception::Pf, .. })) => Err(e),
        Err(_) => {
            ctxt.regs.eflags.remove(Eflags::ZF);
            ctxt.regs.eflags.insert(Eflags::MB1);
            Ok(())
        }
    }
}

pub fn mov_segment(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, _m: Mnemonic) -> EmuResult<()> {
    let ins = &decoded.instruction;
    if super::is_segment_register(ins.op0_register()) {
        let target = seg_reg_of(ins.op0_register());
        let src = operand::fetch(ops, &ctxt.regs, decoded, 1, 2)?;
        seg::load_seg(ops, &ctxt.regs, ctxt.mode, ctxt.vendor, Some(target), src.val as u16, false)?;
        if target == SegReg::Ss {
            ctxt.retire.mov_ss_shadow = true;
        }
        Ok(())
    } else {
        let target = seg_reg_of(ins.op1_register());
        let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, decoded.op_bytes)?;
        let selector = ops.read_segment(target)?.selector;
        commit(ctxt, ops, dst, selector as u64, true, false)
    }
}

fn seg_reg_of(r: iced_x86::Register) -> SegReg {
    use iced_x86::Register::*;
    match r {
        ES => SegReg::Es,
        CS => SegReg::Cs,
        SS => SegReg::Ss,
        DS => SegReg::Ds,
        FS => SegReg::Fs,
        GS => SegReg::Gs,
        _ => SegReg::Ds,
    }
}

pub fn mov_cr_dr(ctxt: &mut Ctxt, ops: &mut dyn Ops, ins: &Instruction) -> EmuResult<()> {
    if ctxt.regs.cpl() != 0 {
        return Err(Exception::gp0().into());
    }
    let cr_dr_idx = |r: iced_x86::Register| -> Option<(bool, u8)> {
        use iced_x86::Register::*;
        match r {
            CR0 => Some((true, 0)),
            CR1 => Some((true, 1)),
            CR2 => Some((true, 2)),
            CR3 => Some((true, 3)),
            CR4 => Some((true, 4)),
            CR5 => Some((true, 5)),
            CR6 => Some((true, 6)),
            CR7 => Some((true, 7)),
            CR8 => Some((true, 8)),
            DR0 => Some((false, 0)),
            DR1 => Some((false, 1)),
            DR2 => Some((false, 2)),
            DR3 => Some((false, 3)),
            DR4 => Some((false, 4)),
            DR5 => Some((false, 5)),
            DR6 => Some((false, 6)),
            DR7 => Some((false, 7)),
            _ => None,
        }
    };
    if let Some((is_cr, idx)) = cr_dr_idx(ins.op0_register()) {
        let val = crate::operand::read_gpr(&ctxt.regs, ins.op1_register()).unwrap_or(0);
        if is_cr {
            ops.write_cr(idx, val)
        } else {
            ops.write_dr(idx, val)
        }
    } else if let Some((is_cr, idx)) = cr_dr_idx(ins.op1_register()) {
        let val = if is_cr { ops.read_cr(idx)? } else { ops.read_dr(idx)? };
        if let Some((g, bytes, _)) = crate::operand::gpr_info_pub(ins.op0_register()) {
            ctxt.regs.write_gpr_sized(g, val, bytes);
        }
        Ok(())
    } else {
        Err(Exception::ud().into())
    }
}

// ---- MOVBE / CRC32 / RDRAND / RDSEED ---------------------------------------

pub fn movbe(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    commit(ctxt, ops, dst, crate::alu::bswap(width, src.val), true, false)
}

const CRC32_POLY: u32 = 0x1EDC_6F41;

fn crc32_step(crc: u32, byte: u8) -> u32 {
    let mut c = crc ^ byte as u32;
    for _ in 0..8 {
        c = if c & 1 != 0 { (c >> 1) ^ CRC32_POLY } else { c >> 1 };
    }
    c
}

pub fn crc32(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, 4)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let mut crc = dst.val as u32;
    for i in 0..width.0 {
        let byte = ((src.val >> (i * 8)) & 0xFF) as u8;
        crc = crc32_step(crc, byte);
    }
    commit(ctxt, ops, dst, crc as u64, true, false)
}

pub fn rdrand(ctxt: &mut Ctxt, ins: &Instruction, width: Width) -> EmuResult<()> {
    #[cfg(target_arch = "x86_64")]
    {
        let (val, ok) = unsafe { host_rdrand(width) };
        write_rand_result(ctxt, ins, width, val, ok)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        write_rand_result(ctxt, ins, width, 0, false)
    }
}

pub fn rdseed(ctxt: &mut Ctxt, ins: &Instruction, width: Width) -> EmuResult<()> {
    #[cfg(target_arch = "x86_64")]
    {
        let (val, ok) = unsafe { host_rdseed(width) };
        write_rand_result(ctxt, ins, width, val, ok)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        write_rand_result(ctxt, ins, width, 0, false)
    }
}

fn write_rand_result(ctxt: &mut Ctxt, ins: &Instruction, width: Width, val: u64, ok: bool) -> EmuResult<()> {
    if let Some((g, bytes, _)) = crate::operand::gpr_info_pub(ins.op0_register()) {
        ctxt.regs.write_gpr_sized(g, if ok { val } else { 0 }, bytes);
    }
    let _ = width;
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::ARITH) | Eflags::MB1;
    ctxt.regs.eflags.set(Eflags::CF, ok);
    Ok(())
}

#[cfg(target_arch = "x86_64")]
unsafe fn host_rdrand(width: Width) -> (u64, bool) {
    use core::arch::asm;
    let ok: u8;
    let val: u64;
    match width.0 {
        2 => {
            let v16: u16;
            asm!("rdrand {0:x}", "setc {1}", out(reg) v16, out(reg_byte) ok, options(nostack, nomem));
            val = v16 as u64;
        }
        4 => {
            let v32: u32;
            asm!("rdrand {0:e}", "setc {1}", out(reg) v32, out(reg_byte) ok, options(nostack, nomem));
            val = v32 as u64;
        }
        _ => {
            asm!("rdrand {0}", "setc {1}", out(reg) val, out(reg_byte) ok, options(nostack, nomem));
        }
    }
    (val, ok != 0)
}

#[cfg(target_arch = "x86_64")]
unsafe fn host_rdseed(width: Width) -> (u64, bool) {
    use core::arch::asm;
    let ok: u8;
    let val: u64;
    match width.0 {
        2 => {
            let v16: u16;
            asm!("rdseed {0:x}", "setc {1}", out(reg) v16, out(reg_byte) ok, options(nostack, nomem));
            val = v16 as u64;
        }
        4 => {
            let v32: u32;
            asm!("rdseed {0:e}", "setc {1}", out(reg) v32, out(reg_byte) ok, options(nostack, nomem));
            val = v32 as u64;
        }
        _ => {
            asm!("rdseed {0}", "setc {1}", out(reg) val, out(reg_byte) ok, options(nostack, nomem));
        }
    }
    (val, ok != 0)
}
