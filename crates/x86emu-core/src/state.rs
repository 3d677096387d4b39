//! Guest-visible CPU state: general registers, segment records, control/debug
//! registers, and the EFLAGS bit layout.

use bitflags::bitflags;

bitflags! {
    /// EFLAGS/RFLAGS bits the core reads or writes. Bit 1 is the
    /// architectural mandatory-one bit; bits 3, 5, 15, and 22-31 are always
    /// clear and never appear here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u64 {
        const CF = 1 << 0;
        const MB1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 0b11 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

impl Eflags {
    /// The "arithmetic six" flags ALU primitives touch.
    pub const ARITH: Eflags = Eflags::from_bits_truncate(
        Eflags::OF.bits()
            | Eflags::SF.bits()
            | Eflags::ZF.bits()
            | Eflags::AF.bits()
            | Eflags::PF.bits()
            | Eflags::CF.bits(),
    );

    /// Bits that are architecturally reserved: forced to their documented
    /// constant value regardless of what software writes.
    pub fn canonicalize(self) -> Eflags {
        (self & !Eflags::reserved_clear()) | Eflags::MB1
    }

    fn reserved_clear() -> Eflags {
        Eflags::from_bits_truncate((1 << 3) | (1 << 5) | (1 << 15) | (0xFFFFFFFF_u64 << 22))
    }

    pub fn iopl(self) -> u8 {
        ((self.bits() & Self::IOPL.bits()) >> 12) as u8
    }

    pub fn set_iopl(&mut self, level: u8) {
        let cleared = self.bits() & !Self::IOPL.bits();
        *self = Eflags::from_bits_truncate(cleared | ((level as u64 & 0b11) << 12));
    }
}

impl Default for Eflags {
    fn default() -> Self {
        Eflags::MB1
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr0: u64 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr4: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP = 1 << 11;
        const VMXE = 1 << 13;
        const SMXE = 1 << 14;
        const FSGSBASE = 1 << 16;
        const PCIDE = 1 << 17;
        const OSXSAVE = 1 << 18;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
    }
}

/// x86 general-purpose register index, independent of any particular
/// encoding (legacy modrm.reg/rm, REX-extended, or VEX.vvvv all resolve to
/// one of these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub fn from_index(idx: u8) -> Gpr {
        // SAFETY-free: plain table lookup, panics on out-of-range input,
        // which callers guarantee never happens (idx is always a 4-bit
        // ModR/M/REX-extended field).
        const TABLE: [Gpr; 16] = [
            Gpr::Rax,
            Gpr::Rcx,
            Gpr::Rdx,
            Gpr::Rbx,
            Gpr::Rsp,
            Gpr::Rbp,
            Gpr::Rsi,
            Gpr::Rdi,
            Gpr::R8,
            Gpr::R9,
            Gpr::R10,
            Gpr::R11,
            Gpr::R12,
            Gpr::R13,
            Gpr::R14,
            Gpr::R15,
        ];
        TABLE[idx as usize & 0xF]
    }
}

/// The segment register a memory access or segment-load instruction names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Tr,
    Ldtr,
    Gdtr,
    Idtr,
}

/// A loaded segment's shadow state: selector plus the descriptor-cache
/// fields the CPU keeps hidden from software after a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// Raw descriptor access-rights byte(s): type, S, DPL, P, AVL, L, D/B, G.
    pub attr: u16,
}

impl SegmentRegister {
    pub fn present(&self) -> bool {
        self.attr & (1 << 7) != 0
    }

    pub fn dpl(&self) -> u8 {
        ((self.attr >> 5) & 0b11) as u8
    }

    pub fn is_long_mode_code(&self) -> bool {
        self.attr & (1 << 13) != 0
    }

    pub fn default_big(&self) -> bool {
        self.attr & (1 << 14) != 0
    }

    pub fn granularity(&self) -> bool {
        self.attr & (1 << 15) != 0
    }
}

/// The guest register snapshot `Ctxt` owns and the emulator mutates in
/// place. Mirrors `spec.md` §3's `Ctxt` register fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regs {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub eflags: Eflags,
    pub seg: [SegmentRegister; 10],
    pub cr0: Cr0,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: Cr4,
    pub cr8: u64,
    pub efer: u64,
    pub dr: [u64; 8],
}

impl Default for Regs {
    fn default() -> Self {
        Regs {
            gpr: [0; 16],
            rip: 0,
            eflags: Eflags::default(),
            seg: [SegmentRegister::default(); 10],
            cr0: Cr0::default(),
            cr2: 0,
            cr3: 0,
            cr4: Cr4::default(),
            cr8: 0,
            efer: 0,
            dr: [0; 8],
        }
    }
}

/// `EFER.LMA`, bit 10: long mode is active.
pub const EFER_LMA: u64 = 1 << 10;
/// `EFER.LME`, bit 8: long mode is enabled (but not necessarily active).
pub const EFER_LME: u64 = 1 << 8;
/// `EFER.SCE`, bit 0: SYSCALL/SYSRET enabled.
pub const EFER_SCE: u64 = 1 << 0;

impl Regs {
    pub fn gpr(&self, r: Gpr) -> u64 {
        self.gpr[r as usize]
    }

    pub fn set_gpr(&mut self, r: Gpr, val: u64) {
        self.gpr[r as usize] = val;
    }

    /// Writes `val` truncated to `bytes`, applying the "4-byte write
    /// zero-extends the full 64-bit register" rule `spec.md` §4.I calls for.
    /// 1- and 2-byte writes only ever touch the low bits of the register on
    /// real hardware and this model follows suit.
    pub fn write_gpr_sized(&mut self, r: Gpr, val: u64, bytes: u8) {
        let cur = self.gpr[r as usize];
        let new = match bytes {
            1 => (cur & !0xFF) | (val & 0xFF),
            2 => (cur & !0xFFFF) | (val & 0xFFFF),
            4 => val & 0xFFFF_FFFF,
            8 => val,
            _ => unreachable!("invalid operand width"),
        };
        self.gpr[r as usize] = new;
    }

    pub fn seg(&self, s: SegReg) -> &SegmentRegister {
        &self.seg[seg_index(s)]
    }

    pub fn seg_mut(&mut self, s: SegReg) -> &mut SegmentRegister {
        &mut self.seg[seg_index(s)]
    }

    pub fn long_mode_active(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    pub fn cpl(&self) -> u8 {
        self.seg(SegReg::Cs).dpl()
    }
}

fn seg_index(s: SegReg) -> usize {
    match s {
        SegReg::Es => 0,
        SegReg::Cs => 1,
        SegReg::Ss => 2,
        SegReg::Ds => 3,
        SegReg::Fs => 4,
        SegReg::Gs => 5,
        SegReg::Tr => 6,
        SegReg::Ldtr => 7,
        SegReg::Gdtr => 8,
        SegReg::Idtr => 9,
    }
}

/// `spec.md` §3's address-size/stack-size/vendor axes of `Ctxt`, independent
/// of the register snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Bits16,
    Bits32,
    Bits64,
}

impl AddressMode {
    pub fn to_decode_mode(self) -> x86emu_decoder::DecodeMode {
        match self {
            AddressMode::Bits16 => x86emu_decoder::DecodeMode::Bits16,
            AddressMode::Bits32 => x86emu_decoder::DecodeMode::Bits32,
            AddressMode::Bits64 => x86emu_decoder::DecodeMode::Bits64,
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, AddressMode::Bits64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuVendor {
    Intel,
    Amd,
}
