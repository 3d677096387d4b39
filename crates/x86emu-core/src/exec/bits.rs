//! Bit-manipulation family: BT/BTS/BTR/BTC, BSF/BSR, POPCNT/LZCNT/TZCNT,
//! and the BMI1/BMI2/ADX portable algorithms `SPEC_FULL.md` §6 calls for.

use crate::alu::{self, BitOp, Width};
use crate::ctxt::Ctxt;
use crate::exception::EmuResult;
use crate::operand::{self, ResolvedOperand};
use crate::ops::Ops;
use crate::state::Eflags;
use x86emu_decoder::Decoded;

use super::commit;

/// Splits a bit-test index operand into an effective-address adjustment
/// (for the memory-form `reg` index, which may be negative and span whole
/// bytes outside the addressed operand) plus a residual `0..bitwidth-1`
/// index, per `SPEC_FULL.md` §4's "BitBase normalization".
fn normalize_bit_index(dst: &ResolvedOperand, raw_index: u64, width: Width) -> (ResolvedOperand, u32) {
    let bits = width.0 as u64 * 8;
    let signed = width.sign_extend(raw_index);
    let byte_shift = signed.div_euclid(8);
    let bit = signed.rem_euclid(8) as u32;
    if byte_shift == 0 || !matches!(dst.dest, crate::writeback::Destination::Memory { .. }) {
        return (*dst, (raw_index % bits) as u32);
    }
    let crate::writeback::Destination::Memory { seg, offset } = dst.dest else {
        unreachable!()
    };
    let adjusted = offset.wrapping_add(byte_shift as u64);
    (
        ResolvedOperand {
            dest: crate::writeback::Destination::Memory { seg, offset: adjusted },
            bytes: dst.bytes,
            val: dst.val,
            orig_val: dst.orig_val,
        },
        bit,
    )
}

pub fn bt(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width, op: BitOp, lock: bool) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let (dst, index) = normalize_bit_index(&dst, src.val, width);
    // Re-read at the adjusted address: `dst` from `fetch` above may have
    // been read at the unadjusted offset when the index selected a
    // different byte than ModRM addressed directly.
    let dst = if matches!(dst.dest, crate::writeback::Destination::Memory { .. }) {
        reread(ops, dst)?
    } else {
        dst
    };
    let outcome = alu::bit_op(op, width, dst.val, index);
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::CF) | (outcome.flags & Eflags::CF) | Eflags::MB1;
    if matches!(op, BitOp::Test) {
        Ok(())
    } else {
        commit(ctxt, ops, dst, outcome.result, false, lock)
    }
}

fn reread(ops: &mut dyn Ops, dst: ResolvedOperand) -> EmuResult<ResolvedOperand> {
    let crate::writeback::Destination::Memory { seg, offset } = dst.dest else {
        return Ok(dst);
    };
    let mut buf = [0u8; 8];
    ops.read(seg, offset, &mut buf[..dst.bytes as usize])?;
    let val = u64::from_le_bytes(buf);
    Ok(ResolvedOperand { val, orig_val: val, ..dst })
}

pub fn bsf(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let val = width.truncate(src.val);
    let mut f = Eflags::empty();
    let result = if val == 0 {
        f.insert(Eflags::ZF);
        dst.val
    } else {
        val.trailing_zeros() as u64
    };
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::ZF) | (f & Eflags::ZF) | Eflags::MB1;
    commit(ctxt, ops, dst, result, false, false)
}

pub fn bsr(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let val = width.truncate(src.val);
    let mut f = Eflags::empty();
    let result = if val == 0 {
        f.insert(Eflags::ZF);
        dst.val
    } else {
        // `leading_zeros` counts over the full u64; rebase to the operand
        // width to get the index of the highest set bit.
        let bits = width.0 as u32 * 8;
        (bits - 1 - (val.leading_zeros() - (64 - bits))) as u64
    };
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::ZF) | (f & Eflags::ZF) | Eflags::MB1;
    commit(ctxt, ops, dst, result, false, false)
}

pub fn popcnt(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let outcome = alu::popcnt(width, src.val);
    // POPCNT clears OF/SF/AF/CF/PF and sets ZF per the result.
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::ARITH) | (outcome.flags & Eflags::ZF) | Eflags::MB1;
    commit(ctxt, ops, dst, outcome.result, false, false)
}

pub fn lzcnt(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let val = width.truncate(src.val);
    let bits = width.0 as u32 * 8;
    let count = if val == 0 { bits as u64 } else { (val.leading_zeros() - (64 - bits)) as u64 };
    let mut f = Eflags::empty();
    f.set(Eflags::ZF, count == bits as u64);
    f.set(Eflags::CF, val == 0);
    ctxt.regs.eflags = (ctxt.regs.eflags & !(Eflags::ZF | Eflags::CF)) | (f & (Eflags::ZF | Eflags::CF)) | Eflags::MB1;
    commit(ctxt, ops, dst, count, false, false)
}

pub fn tzcnt(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let val = width.truncate(src.val);
    let bits = width.0 as u32 * 8;
    let count = if val == 0 { bits as u64 } else { val.trailing_zeros() as u64 };
    let mut f = Eflags::empty();
    f.set(Eflags::ZF, count == bits as u64);
    f.set(Eflags::CF, val == 0);
    ctxt.regs.eflags = (ctxt.regs.eflags & !(Eflags::ZF | Eflags::CF)) | (f & (Eflags::ZF | Eflags::CF)) | Eflags::MB1;
    commit(ctxt, ops, dst, count, false, false)
}

/// ANDN (BMI1): `dst = ~src1 & src2`, VEX.vvvv-addressed `src1`. Sets
/// SF/ZF from the result, clears OF/CF, leaves AF/PF undefined (modeled as
/// cleared).
pub fn andn(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src1 = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let src2 = operand::fetch(ops, &ctxt.regs, decoded, 2, width.0)?;
    let result = width.truncate(!src1.val & src2.val);
    set_sf_zf_only(ctxt, width, result);
    commit(ctxt, ops, dst, result, false, false)
}

pub fn bextr(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let ctrl = operand::fetch(ops, &ctxt.regs, decoded, 2, width.0)?;
    let start = (ctrl.val & 0xFF) as u32;
    let len = ((ctrl.val >> 8) & 0xFF) as u32;
    let bits = width.0 as u32 * 8;
    let result = if start >= bits {
        0
    } else {
        let shifted = width.truncate(src.val) >> start;
        let mask = if len >= bits { width.mask() } else { (1u64 << len) - 1 };
        shifted & mask
    };
    set_sf_zf_only(ctxt, width, result);
    commit(ctxt, ops, dst, result, false, false)
}

pub fn bzhi(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let ctrl = operand::fetch(ops, &ctxt.regs, decoded, 2, width.0)?;
    let n = (ctrl.val & 0xFF) as u32;
    let bits = width.0 as u32 * 8;
    let result = if n >= bits { width.truncate(src.val) } else { width.truncate(src.val) & ((1u64 << n) - 1) };
    let mut f = Eflags::empty();
    f.set(Eflags::CF, n >= bits);
    set_sf_zf_only(ctxt, width, result);
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::CF) | (f & Eflags::CF) | Eflags::MB1;
    commit(ctxt, ops, dst, result, false, false)
}

pub fn blsi(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let v = width.truncate(src.val);
    let result = v & v.wrapping_neg();
    let mut f = Eflags::empty();
    f.set(Eflags::CF, v != 0);
    set_sf_zf_only(ctxt, width, result);
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::CF) | (f & Eflags::CF) | Eflags::MB1;
    commit(ctxt, ops, dst, result, false, false)
}

pub fn blsr(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let v = width.truncate(src.val);
    let result = v & v.wrapping_sub(1);
    let mut f = Eflags::empty();
    f.set(Eflags::CF, v != 0);
    set_sf_zf_only(ctxt, width, result);
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::CF) | (f & Eflags::CF) | Eflags::MB1;
    commit(ctxt, ops, dst, result, false, false)
}

pub fn blsmsk(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let v = width.truncate(src.val);
    let result = width.truncate(v ^ v.wrapping_sub(1));
    let mut f = Eflags::empty();
    f.set(Eflags::CF, v == 0);
    set_sf_zf_only(ctxt, width, result);
    ctxt.regs.eflags = (ctxt.regs.eflags & !Eflags::CF) | (f & Eflags::CF) | Eflags::MB1;
    commit(ctxt, ops, dst, result, false, false)
}

pub fn pdep(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let mask = operand::fetch(ops, &ctxt.regs, decoded, 2, width.0)?;
    let (src, mask) = (width.truncate(src.val), width.truncate(mask.val));
    let mut result = 0u64;
    let mut bit = 0u32;
    for i in 0..(width.0 as u32 * 8) {
        if mask & (1u64 << i) != 0 {
            if src & (1u64 << bit) != 0 {
                result |= 1u64 << i;
            }
            bit += 1;
        }
    }
    commit(ctxt, ops, dst, result, true, false)
}

pub fn pext(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let mask = operand::fetch(ops, &ctxt.regs, decoded, 2, width.0)?;
    let (src, mask) = (width.truncate(src.val), width.truncate(mask.val));
    let mut result = 0u64;
    let mut bit = 0u32;
    for i in 0..(width.0 as u32 * 8) {
        if mask & (1u64 << i) != 0 {
            if src & (1u64 << i) != 0 {
                result |= 1u64 << bit;
            }
            bit += 1;
        }
    }
    commit(ctxt, ops, dst, result, true, false)
}

/// ADCX/ADOX (ADX): add with carry/overflow into CF or OF only, the other
/// flag (and the rest of the arithmetic six) left untouched.
pub fn adcx_adox(ctxt: &mut Ctxt, ops: &mut dyn Ops, decoded: &Decoded, width: Width, use_of: bool) -> EmuResult<()> {
    let dst = operand::fetch(ops, &ctxt.regs, decoded, 0, width.0)?;
    let src = operand::fetch(ops, &ctxt.regs, decoded, 1, width.0)?;
    let carry_in = if use_of {
        ctxt.regs.eflags.contains(Eflags::OF)
    } else {
        ctxt.regs.eflags.contains(Eflags::CF)
    };
    let sum = width.truncate(dst.val) as u128 + width.truncate(src.val) as u128 + carry_in as u128;
    let result = width.truncate(sum as u64);
    let carry_out = sum > width.mask() as u128;
    if use_of {
        ctxt.regs.eflags.set(Eflags::OF, carry_out);
    } else {
        ctxt.regs.eflags.set(Eflags::CF, carry_out);
    }
    commit(ctxt, ops, dst, result, false, false)
}

fn set_sf_zf_only(ctxt: &mut Ctxt, width: Width, result: u64) {
    let mut f = Eflags::empty();
    f.set(Eflags::ZF, width.truncate(result) == 0);
    f.set(Eflags::SF, width.is_negative(result));
    let mask = Eflags::SF | Eflags::ZF;
    ctxt.regs.eflags = (ctxt.regs.eflags & !(Eflags::ARITH)) | (f & mask) | Eflags::MB1;
}
