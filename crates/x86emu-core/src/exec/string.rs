//! String operations with REP/REPE/REPNE, `spec.md` §4.F: clipped-batch
//! `nr_reps`, bulk-callback-first with per-iteration fallback.

use iced_x86::Mnemonic;

use crate::alu::{AluOp, Width};
use crate::ctxt::Ctxt;
use crate::exception::{EmuError, EmuResult};
use crate::ops::Ops;
use crate::state::{Eflags, Gpr, SegReg};
use x86emu_decoder::Decoded;

/// Element width a string mnemonic's B/W/D/Q suffix names, independent of
/// any operand-size prefix (MOVSB is always 1 byte regardless of REX.W).
fn elem_bytes(m: Mnemonic) -> u8 {
    use Mnemonic::*;
    match m {
        Movsb | Cmpsb | Stosb | Lodsb | Scasb | Insb | Outsb => 1,
        Movsw | Cmpsw | Stosw | Lodsw | Scasw | Insw | Outsw => 2,
        Movsd | Cmpsd | Stosd | Lodsd | Scasd | Insd | Outsd => 4,
        Movsq | Cmpsq | Stosq | Lodsq | Scasq => 8,
        _ => 1,
    }
}

enum RepKind {
    None,
    Rep,
    Repe,
    Repne,
}

fn rep_kind(decoded: &Decoded) -> RepKind {
    if decoded.prefixes.repne {
        RepKind::Repne
    } else if decoded.prefixes.rep {
        RepKind::Repe // the same F3 byte means REP for MOVS/STOS/LODS/INS/OUTS
                      // and REPE for CMPS/SCAS; callers that only loop
                      // unconditionally (MOVS/STOS/LODS/INS/OUTS) never
                      // consult the ZF-gating distinction this enum carries.
    } else {
        RepKind::None
    }
}

/// Requested repetition count from (E/R)CX, truncated to `ad_bytes`, per
/// `spec.md`'s `get_loop_count`.
fn loop_count(regs: &crate::state::Regs, ad_bytes: u8) -> u64 {
    Width(ad_bytes).truncate(regs.gpr(Gpr::Rcx))
}

fn set_loop_count(regs: &mut crate::state::Regs, ad_bytes: u8, val: u64) {
    regs.write_gpr_sized(Gpr::Rcx, val, ad_bytes);
}

/// Clips a requested count so the index register cannot wrap within one
/// batch: never larger than the distance from the current index to the
/// address-size wraparound boundary in the direction of travel.
fn clip_count(requested: u64, index: u64, ad_bytes: u8, forward: bool) -> u64 {
    if requested == 0 {
        return 0;
    }
    let limit = Width(ad_bytes).mask();
    let room = if forward {
        limit - index + 1
    } else {
        index + 1
    };
    requested.min(room.max(1))
}

fn advance(regs: &mut crate::state::Regs, reg: Gpr, bytes: u8, count: u64, ad_bytes: u8, forward: bool) {
    let cur = regs.gpr(reg);
    let delta = (bytes as u64).wrapping_mul(count);
    let new = if forward { cur.wrapping_add(delta) } else { cur.wrapping_sub(delta) };
    regs.write_gpr_sized(reg, Width(ad_bytes).truncate(new), ad_bytes);
}

fn segment_override(decoded: &Decoded, default: SegReg) -> SegReg {
    match decoded.prefixes.segment {
        Some(x86emu_decoder::Segment::Es) => SegReg::Es,
        Some(x86emu_decoder::Segment::Cs) => SegReg::Cs,
        Some(x86emu_decoder::Segment::Ss) => SegReg::Ss,
        Some(x86emu_decoder::Segment::Ds) => SegReg::Ds,
        Some(x86emu_decoder::Segment::Fs) => SegReg::Fs,
        Some(x86emu_decoder::Segment::Gs) => SegReg::Gs,
        None => default,
    }
}

/// Single-step (TF) forces `nr_reps = 1`, per `spec.md`.
fn single_step_clip(ctxt: &Ctxt, count: u64) -> u64 {
    if ctxt.regs.eflags.contains(Eflags::TF) {
        count.min(1)
    } else {
        count
    }
}

/// Rewinds RIP to re-enter this instruction on the next `emulate` call
/// (loop continues because RCX != 0 after this batch).
fn maybe_reenter(ctxt: &mut Ctxt, decoded: &Decoded, remaining: u64) {
    if remaining != 0 {
        ctxt.regs.rip = decoded.start_ip;
    }
}

pub fn movs(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let bytes = elem_bytes(ins.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let has_rep = matches!(rep_kind(decoded), RepKind::Rep | RepKind::Repe | RepKind::Repne);
    let requested = if has_rep { loop_count(&ctxt.regs, decoded.ad_bytes) } else { 1 };
    if has_rep && requested == 0 {
        return Ok(());
    }
    let src_idx = ctxt.regs.gpr(Gpr::Rsi);
    let dst_idx = ctxt.regs.gpr(Gpr::Rdi);
    let clipped = single_step_clip(
        ctxt,
        clip_count(requested, src_idx.min(dst_idx), decoded.ad_bytes, forward),
    );
    let src_seg = segment_override(decoded, SegReg::Ds);
    let dst_seg = SegReg::Es;

    let mut nr_reps = clipped;
    let status = ops.rep_movs(dst_seg, dst_idx, src_seg, src_idx, bytes, &mut nr_reps);
    let performed = match status {
        Ok(()) => nr_reps,
        Err(EmuError::Unhandleable) => {
            let mut done = 0u64;
            let mut buf = [0u8; 8];
            for i in 0..clipped {
                let off = bytes as u64 * i;
                let s = if forward { src_idx.wrapping_add(off) } else { src_idx.wrapping_sub(off) };
                let d = if forward { dst_idx.wrapping_add(off) } else { dst_idx.wrapping_sub(off) };
                ops.read(src_seg, s, &mut buf[..bytes as usize])?;
                ops.write(dst_seg, d, &buf[..bytes as usize])?;
                done += 1;
            }
            done
        }
        Err(e) => return Err(e),
    };

    advance(&mut ctxt.regs, Gpr::Rsi, bytes, performed, decoded.ad_bytes, forward);
    advance(&mut ctxt.regs, Gpr::Rdi, bytes, performed, decoded.ad_bytes, forward);
    if has_rep {
        let remaining = requested - performed;
        set_loop_count(&mut ctxt.regs, decoded.ad_bytes, remaining);
        maybe_reenter(ctxt, decoded, remaining);
    }
    Ok(())
}

pub fn stos(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let bytes = elem_bytes(ins.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let has_rep = matches!(rep_kind(decoded), RepKind::Rep | RepKind::Repe | RepKind::Repne);
    let requested = if has_rep { loop_count(&ctxt.regs, decoded.ad_bytes) } else { 1 };
    if has_rep && requested == 0 {
        return Ok(());
    }
    let dst_idx = ctxt.regs.gpr(Gpr::Rdi);
    let clipped = single_step_clip(ctxt, clip_count(requested, dst_idx, decoded.ad_bytes, forward));
    let val = Width(bytes).truncate(ctxt.regs.gpr(Gpr::Rax));

    let mut nr_reps = clipped;
    let status = ops.rep_stos(SegReg::Es, dst_idx, val, bytes, &mut nr_reps);
    let performed = match status {
        Ok(()) => nr_reps,
        Err(EmuError::Unhandleable) => {
            let buf = val.to_le_bytes();
            let mut done = 0u64;
            for i in 0..clipped {
                let off = bytes as u64 * i;
                let d = if forward { dst_idx.wrapping_add(off) } else { dst_idx.wrapping_sub(off) };
                ops.write(SegReg::Es, d, &buf[..bytes as usize])?;
                done += 1;
            }
            done
        }
        Err(e) => return Err(e),
    };

    advance(&mut ctxt.regs, Gpr::Rdi, bytes, performed, decoded.ad_bytes, forward);
    if has_rep {
        let remaining = requested - performed;
        set_loop_count(&mut ctxt.regs, decoded.ad_bytes, remaining);
        maybe_reenter(ctxt, decoded, remaining);
    }
    Ok(())
}

pub fn lods(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    // LODS is never usefully REPed (no bulk accelerator makes sense for a
    // register-destination load), so it always executes exactly once.
    let ins = &decoded.instruction;
    let bytes = elem_bytes(ins.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let src_idx = ctxt.regs.gpr(Gpr::Rsi);
    let seg = segment_override(decoded, SegReg::Ds);
    let mut buf = [0u8; 8];
    ops.read(seg, src_idx, &mut buf[..bytes as usize])?;
    let val = u64::from_le_bytes(buf);
    ctxt.regs.write_gpr_sized(Gpr::Rax, val, bytes);
    advance(&mut ctxt.regs, Gpr::Rsi, bytes, 1, decoded.ad_bytes, forward);
    Ok(())
}

pub fn cmps(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let bytes = elem_bytes(ins.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let repe = matches!(rep_kind(decoded), RepKind::Repe);
    let repne = matches!(rep_kind(decoded), RepKind::Repne);
    let has_rep = repe || repne;
    let requested = if has_rep { loop_count(&ctxt.regs, decoded.ad_bytes) } else { 1 };
    if has_rep && requested == 0 {
        return Ok(());
    }
    let src_idx0 = ctxt.regs.gpr(Gpr::Rsi);
    let dst_idx0 = ctxt.regs.gpr(Gpr::Rdi);
    let clipped = single_step_clip(
        ctxt,
        clip_count(requested, src_idx0.min(dst_idx0), decoded.ad_bytes, forward),
    );
    let seg1 = segment_override(decoded, SegReg::Ds);

    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    let mut performed = 0u64;
    let mut last_flags = ctxt.regs.eflags;
    for i in 0..clipped.max(1) {
        if i >= clipped {
            break;
        }
        let off = bytes as u64 * i;
        let s = if forward { src_idx0.wrapping_add(off) } else { src_idx0.wrapping_sub(off) };
        let d = if forward { dst_idx0.wrapping_add(off) } else { dst_idx0.wrapping_sub(off) };
        ops.read(seg1, s, &mut a[..bytes as usize])?;
        ops.read(SegReg::Es, d, &mut b[..bytes as usize])?;
        let av = u64::from_le_bytes(a);
        let bv = u64::from_le_bytes(b);
        let outcome = crate::alu::alu_op(AluOp::Cmp, Width(bytes), av, bv, false);
        last_flags = (ctxt.regs.eflags & !Eflags::ARITH) | (outcome.flags & Eflags::ARITH) | Eflags::MB1;
        performed += 1;
        if has_rep {
            let zf = last_flags.contains(Eflags::ZF);
            if (repe && !zf) || (repne && zf) {
                break;
            }
        }
    }
    ctxt.regs.eflags = last_flags;
    advance(&mut ctxt.regs, Gpr::Rsi, bytes, performed, decoded.ad_bytes, forward);
    advance(&mut ctxt.regs, Gpr::Rdi, bytes, performed, decoded.ad_bytes, forward);
    if has_rep {
        let remaining = requested - performed;
        let zf = last_flags.contains(Eflags::ZF);
        let stopped_early = (repe && !zf) || (repne && zf);
        set_loop_count(&mut ctxt.regs, decoded.ad_bytes, remaining);
        if !stopped_early {
            maybe_reenter(ctxt, decoded, remaining);
        }
    }
    Ok(())
}

pub fn scas(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let ins = &decoded.instruction;
    let bytes = elem_bytes(ins.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let repe = matches!(rep_kind(decoded), RepKind::Repe);
    let repne = matches!(rep_kind(decoded), RepKind::Repne);
    let has_rep = repe || repne;
    let requested = if has_rep { loop_count(&ctxt.regs, decoded.ad_bytes) } else { 1 };
    if has_rep && requested == 0 {
        return Ok(());
    }
    let dst_idx0 = ctxt.regs.gpr(Gpr::Rdi);
    let clipped = single_step_clip(ctxt, clip_count(requested, dst_idx0, decoded.ad_bytes, forward));
    let al = Width(bytes).truncate(ctxt.regs.gpr(Gpr::Rax));

    let mut buf = [0u8; 8];
    let mut performed = 0u64;
    let mut last_flags = ctxt.regs.eflags;
    for i in 0..clipped {
        let off = bytes as u64 * i;
        let d = if forward { dst_idx0.wrapping_add(off) } else { dst_idx0.wrapping_sub(off) };
        ops.read(SegReg::Es, d, &mut buf[..bytes as usize])?;
        let mv = u64::from_le_bytes(buf);
        let outcome = crate::alu::alu_op(AluOp::Cmp, Width(bytes), al, mv, false);
        last_flags = (ctxt.regs.eflags & !Eflags::ARITH) | (outcome.flags & Eflags::ARITH) | Eflags::MB1;
        performed += 1;
        if has_rep {
            let zf = last_flags.contains(Eflags::ZF);
            if (repe && !zf) || (repne && zf) {
                break;
            }
        }
    }
    ctxt.regs.eflags = last_flags;
    advance(&mut ctxt.regs, Gpr::Rdi, bytes, performed, decoded.ad_bytes, forward);
    if has_rep {
        let remaining = requested - performed;
        let zf = last_flags.contains(Eflags::ZF);
        let stopped_early = (repe && !zf) || (repne && zf);
        set_loop_count(&mut ctxt.regs, decoded.ad_bytes, remaining);
        if !stopped_early {
            maybe_reenter(ctxt, decoded, remaining);
        }
    }
    Ok(())
}

pub fn ins(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let bytes = elem_bytes(decoded.instruction.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let has_rep = matches!(rep_kind(decoded), RepKind::Rep);
    let requested = if has_rep { loop_count(&ctxt.regs, decoded.ad_bytes) } else { 1 };
    if has_rep && requested == 0 {
        return Ok(());
    }
    let dst_idx = ctxt.regs.gpr(Gpr::Rdi);
    let clipped = single_step_clip(ctxt, clip_count(requested, dst_idx, decoded.ad_bytes, forward));
    let port = (ctxt.regs.gpr(Gpr::Rdx) & 0xFFFF) as u16;

    let mut nr_reps = clipped;
    let status = ops.rep_ins(port, SegReg::Es, dst_idx, bytes, &mut nr_reps);
    let performed = match status {
        Ok(()) => nr_reps,
        Err(EmuError::Unhandleable) => {
            let mut buf = [0u8; 8];
            let mut done = 0u64;
            for i in 0..clipped {
                let off = bytes as u64 * i;
                let d = if forward { dst_idx.wrapping_add(off) } else { dst_idx.wrapping_sub(off) };
                ops.read_io(port, &mut buf[..bytes as usize])?;
                ops.write(SegReg::Es, d, &buf[..bytes as usize])?;
                done += 1;
            }
            done
        }
        Err(e) => return Err(e),
    };
    advance(&mut ctxt.regs, Gpr::Rdi, bytes, performed, decoded.ad_bytes, forward);
    if has_rep {
        let remaining = requested - performed;
        set_loop_count(&mut ctxt.regs, decoded.ad_bytes, remaining);
        maybe_reenter(ctxt, decoded, remaining);
    }
    Ok(())
}

pub fn outs(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded) -> EmuResult<()> {
    let bytes = elem_bytes(decoded.instruction.mnemonic());
    let forward = !ctxt.regs.eflags.contains(Eflags::DF);
    let has_rep = matches!(rep_kind(decoded), RepKind::Rep);
    let requested = if has_rep { loop_count(&ctxt.regs, decoded.ad_bytes) } else { 1 };
    if has_rep && requested == 0 {
        return Ok(());
    }
    let src_idx = ctxt.regs.gpr(Gpr::Rsi);
    let clipped = single_step_clip(ctxt, clip_count(requested, src_idx, decoded.ad_bytes, forward));
    let port = (ctxt.regs.gpr(Gpr::Rdx) & 0xFFFF) as u16;
    let seg = segment_override(decoded, SegReg::Ds);

    let mut nr_reps = clipped;
    let status = ops.rep_outs(port, seg, src_idx, bytes, &mut nr_reps);
    let performed = match status {
        Ok(()) => nr_reps,
        Err(EmuError::Unhandleable) => {
            let mut buf = [0u8; 8];
            let mut done = 0u64;
            for i in 0..clipped {
                let off = bytes as u64 * i;
                let s = if forward { src_idx.wrapping_add(off) } else { src_idx.wrapping_sub(off) };
                ops.read(seg, s, &mut buf[..bytes as usize])?;
                ops.write_io(port, &buf[..bytes as usize])?;
                done += 1;
            }
            done
        }
        Err(e) => return Err(e),
    };
    advance(&mut ctxt.regs, Gpr::Rsi, bytes, performed, decoded.ad_bytes, forward);
    if has_rep {
        let remaining = requested - performed;
        set_loop_count(&mut ctxt.regs, decoded.ad_bytes, remaining);
        maybe_reenter(ctxt, decoded, remaining);
    }
    Ok(())
}

/// XLATB: `AL = [rBX + AL]` in the DS segment (overridable).
pub fn xlat(ctxt: &mut Ctxt, ops: &mut dyn Ops) -> EmuResult<()> {
    let al = ctxt.regs.gpr(Gpr::Rax) & 0xFF;
    let base = ctxt.regs.gpr(Gpr::Rbx);
    let offset = base.wrapping_add(al);
    let mut buf = [0u8; 1];
    ops.read(SegReg::Ds, offset, &mut buf)?;
    ctxt.regs.write_gpr_sized(Gpr::Rax, buf[0] as u64, 1);
    Ok(())
}
