//! Segmentation & descriptor engine, `spec.md` §4.G.

use crate::exception::{EmuError, EmuResult, Exception};
use crate::ops::Ops;
use crate::state::{AddressMode, CpuVendor, Regs, SegReg, SegmentRegister};

/// Raw 8-byte (or, for long-mode system descriptors, 16-byte) descriptor
/// table entry, before `protmode_load_seg` interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawDescriptor {
    pub low: u64,
    /// Present only for system-segment descriptors (LDT, TSS, call gates)
    /// fetched in long mode, which are 16 bytes wide.
    pub high: Option<u64>,
}

impl RawDescriptor {
    fn limit(&self) -> u32 {
        let lo = (self.low & 0xFFFF) as u32;
        let hi = ((self.low >> 48) & 0xF) as u32;
        lo | (hi << 16)
    }

    fn base(&self) -> u64 {
        let lo = (self.low >> 16) & 0xFF_FFFF;
        let hi = (self.low >> 56) & 0xFF;
        let base32 = lo | (hi << 24);
        match self.high {
            Some(h) => base32 | (h << 32),
            None => base32,
        }
    }

    fn access(&self) -> u8 {
        ((self.low >> 40) & 0xFF) as u8
    }

    fn flags(&self) -> u8 {
        ((self.low >> 52) & 0xF) as u8
    }

    fn descriptor_type(&self) -> u8 {
        (self.access() >> 4) & 1 // S bit: 1 = code/data, 0 = system
    }

    fn seg_type(&self) -> u8 {
        self.access() & 0xF
    }

    fn dpl(&self) -> u8 {
        (self.access() >> 5) & 0b11
    }

    fn present(&self) -> bool {
        self.access() & 0x80 != 0
    }

    fn is_code(&self) -> bool {
        self.descriptor_type() == 1 && self.seg_type() & 0x8 != 0
    }

    fn is_data(&self) -> bool {
        self.descriptor_type() == 1 && self.seg_type() & 0x8 == 0
    }

    fn data_is_writable(&self) -> bool {
        self.seg_type() & 0b10 != 0
    }

    fn code_is_conforming(&self) -> bool {
        self.seg_type() & 0b100 != 0
    }

    fn is_long_mode_code(&self) -> bool {
        self.flags() & 0b0010 != 0
    }

    fn default_big(&self) -> bool {
        self.flags() & 0b0100 != 0
    }

    fn granularity(&self) -> bool {
        self.flags() & 0b1000 != 0
    }

    fn accessed(&self) -> bool {
        self.access() & 0b1 != 0
    }

    fn with_accessed_set(&self) -> RawDescriptor {
        RawDescriptor {
            low: self.low | (1u64 << 40),
            high: self.high,
        }
    }
}

fn canonical(addr: u64, va_bits: u32) -> bool {
    let shift = 64 - va_bits;
    (((addr as i64) << shift) >> shift) as u64 == addr
}

/// True iff this was a near-whole selector load: `seg == None` names the
/// pseudo-segment `spec.md` §4.G describes for VERR/VERW/LAR/LSL-style
/// inspection, which suppresses all exceptions except `#PF` and never
/// commits.
fn is_pseudo_load(seg: Option<SegReg>) -> bool {
    seg.is_none()
}

/// Loads `sel` into `seg` using the full protected-mode descriptor path.
/// `is_ret` marks a RET/IRET-style reload, which relaxes the RPL==CPL
/// check to RPL>=CPL and applies the conforming-segment DPL rule. Returns
/// the resolved [`SegmentRegister`] without committing it; callers call
/// `ops.write_segment` themselves (or, for the pseudo-segment, discard it).
pub fn protmode_load_seg(
    ops: &mut dyn Ops,
    regs: &Regs,
    vendor: CpuVendor,
    seg: Option<SegReg>,
    sel: u16,
    is_ret: bool,
) -> EmuResult<SegmentRegister> {
    let pseudo = is_pseudo_load(seg);
    let cpl = regs.cpl();
    let rpl = (sel & 0b11) as u8;
    let index = sel >> 3;
    let table_is_ldt = sel & 0b100 != 0;

    if sel & !0b111 == 0 {
        // NULL selector.
        return load_null_selector(seg, cpl, rpl, vendor);
    }

    let table_reg = if table_is_ldt { SegReg::Ldtr } else { SegReg::Gdtr };
    let table = ops.read_segment(table_reg)?;
    let entry_offset = (index as u64) * 8;
    if entry_offset + 8 > table.limit as u64 + 1 {
        return Err(gp_or_suppress(pseudo, sel));
    }

    let mut buf = [0u8; 8];
    ops.read(SegReg::Gdtr, table.base + entry_offset, &mut buf)?;
    let low = u64::from_le_bytes(buf);
    let mut desc = RawDescriptor { low, high: None };

    let is_system = desc.descriptor_type() == 0;
    let seg_is_long_mode_system = is_system && regs.long_mode_active();
    if seg_is_long_mode_system {
        let mut hi = [0u8; 8];
        ops.read(SegReg::Gdtr, table.base + entry_offset + 8, &mut hi)?;
        let high = u64::from_le_bytes(hi);
        if high & 0xFFFF_FFFF_0000_0000 != 0 {
            // Upper 32 bits of a long-mode system descriptor's second
            // 8 bytes must be zero in this model (reserved field).
            return Err(gp_or_suppress(pseudo, sel));
        }
        desc.high = Some(high);
    }

    if !desc.present() {
        return Err(not_present_fault(seg, sel, pseudo));
    }

    type_check(seg, &desc, cpl, rpl, is_ret, pseudo, sel)?;

    if !desc.accessed() && !pseudo {
        let updated = desc.with_accessed_set();
        ops.cmpxchg(
            SegReg::Gdtr,
            table.base + entry_offset,
            &desc.low.to_le_bytes(),
            &updated.low.to_le_bytes(),
        )?;
    }

    let base = desc.base();
    if regs.long_mode_active() && desc.is_code() && desc.is_long_mode_code() {
        if !canonical(base, 48) {
            return Err(gp_or_suppress(pseudo, sel));
        }
    }

    let mut limit = desc.limit();
    if desc.granularity() {
        limit = (limit << 12) | 0xFFF;
    }

    let attr = build_attr(&desc);

    Ok(SegmentRegister {
        selector: sel,
        base,
        limit,
        attr,
    })
}

fn build_attr(desc: &RawDescriptor) -> u16 {
    let mut attr = desc.access() as u16;
    attr |= (desc.flags() as u16) << 8;
    attr
}

fn load_null_selector(
    seg: Option<SegReg>,
    cpl: u8,
    rpl: u8,
    vendor: CpuVendor,
) -> EmuResult<SegmentRegister> {
    match seg {
        None => Ok(SegmentRegister::default()),
        Some(SegReg::Cs) | Some(SegReg::Tr) | Some(SegReg::Ldtr) => {
            Err(EmuError::Exception(Exception::gp0()))
        }
        Some(SegReg::Ss) => {
            // spec.md Design Notes open question, resolved: in 64-bit mode,
            // SS=0 is permitted at non-CPL-3 when the selector's RPL equals
            // CPL (matching the source's opaque `default:` fallthrough,
            // confirmed against SDM Vol. 3 "Loading a Null Selector").
            if cpl != 3 && cpl == rpl {
                Ok(SegmentRegister::default())
            } else {
                Err(EmuError::Exception(Exception::gp0()))
            }
        }
        Some(_) => {
            // DS/ES/FS/GS: permitted, though AMD preserves the prior base
            // and limit (only the selector and a "not usable" attribute bit
            // change); we model both vendors as resetting to a blank
            // record here and let callers that care about AMD's
            // preserve-on-null behavior pre-seed `out` before calling
            // `write_segment` if they need that fidelity.
            let _ = vendor;
            Ok(SegmentRegister {
                selector: 0,
                base: 0,
                limit: 0,
                attr: 0,
            })
        }
    }
}

fn gp_or_suppress(pseudo: bool, sel: u16) -> EmuError {
    if pseudo {
        EmuError::Done
    } else {
        EmuError::Exception(Exception::gp(sel as u32 & !0b111))
    }
}

fn not_present_fault(seg: Option<SegReg>, sel: u16, pseudo: bool) -> EmuError {
    if pseudo {
        return EmuError::Done;
    }
    let error_code = sel as u32 & !0b111;
    match seg {
        Some(SegReg::Ss) => EmuError::Exception(Exception::ss(error_code)),
        _ => EmuError::Exception(Exception::np(error_code)),
    }
}

fn type_check(
    seg: Option<SegReg>,
    desc: &RawDescriptor,
    cpl: u8,
    rpl: u8,
    is_ret: bool,
    pseudo: bool,
    sel: u16,
) -> EmuResult<()> {
    let fail = || gp_or_suppress(pseudo, sel);

    match seg {
        Some(SegReg::Cs) => {
            if !desc.is_code() {
                return Err(fail());
            }
            if desc.is_long_mode_code() && desc.default_big() {
                return Err(fail());
            }
            if is_ret {
                if rpl < cpl {
                    return Err(fail());
                }
                if !desc.code_is_conforming() && desc.dpl() != rpl {
                    return Err(fail());
                }
                if desc.code_is_conforming() && desc.dpl() > rpl {
                    return Err(fail());
                }
            } else if !desc.code_is_conforming() && desc.dpl() != cpl {
                return Err(fail());
            } else if desc.code_is_conforming() && desc.dpl() > cpl {
                return Err(fail());
            }
        }
        Some(SegReg::Ss) => {
            if !desc.is_data() || !desc.data_is_writable() {
                return Err(fail());
            }
            if desc.dpl() != cpl || rpl != cpl {
                return Err(fail());
            }
        }
        Some(SegReg::Ldtr) => {
            if desc.descriptor_type() != 0 || desc.seg_type() != 2 {
                return Err(fail());
            }
        }
        Some(SegReg::Tr) => {
            if desc.descriptor_type() != 0 || (desc.seg_type() != 9 && desc.seg_type() != 0xB) {
                return Err(fail());
            }
        }
        Some(_) => {
            // DS/ES/FS/GS: any readable data or non-conforming-readable
            // code segment, with the usual DPL>=max(CPL,RPL) rule unless
            // conforming.
            let readable_code = desc.is_code() && (desc.seg_type() & 0b10 != 0);
            if !(desc.is_data() || readable_code) {
                return Err(fail());
            }
            if desc.is_data() || !desc.code_is_conforming() {
                if desc.dpl() < cpl.max(rpl) {
                    return Err(fail());
                }
            }
        }
        None => {}
    }
    Ok(())
}

/// Real-mode segment load: base = sel << 4, attributes and limit retained
/// from whatever the segment previously held (`spec.md` §4.G).
pub fn realmode_load_seg(prior: SegmentRegister, sel: u16) -> SegmentRegister {
    SegmentRegister {
        selector: sel,
        base: (sel as u64) << 4,
        limit: prior.limit,
        attr: prior.attr,
    }
}

/// Public entry point: selects the real- or protected-mode path based on
/// `mode`/`cr0.PE`, and on success calls `ops.write_segment`. The
/// pseudo-segment (`seg == None`) never commits.
pub fn load_seg(
    ops: &mut dyn Ops,
    regs: &Regs,
    mode: AddressMode,
    vendor: CpuVendor,
    seg: Option<SegReg>,
    sel: u16,
    is_ret: bool,
) -> EmuResult<()> {
    let protected = mode.is_64bit() || regs.cr0.contains(crate::state::Cr0::PE);
    let result = if protected {
        protmode_load_seg(ops, regs, vendor, seg, sel, is_ret)?
    } else {
        let prior = match seg {
            Some(s) => *regs.seg(s),
            None => SegmentRegister::default(),
        };
        realmode_load_seg(prior, sel)
    };
    if let Some(s) = seg {
        ops.write_segment(s, result)?;
    }
    Ok(())
}
