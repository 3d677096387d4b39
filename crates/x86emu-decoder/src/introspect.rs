//! Post-decode introspection classifiers, `spec.md` §4.J.

use iced_x86::{Mnemonic, OpKind};

use crate::decode::Decoded;

/// True iff any operand is a memory access, excluding LEA/INVLPG (which only
/// compute an address) but including the string/XLAT instruction family,
/// which always touches memory even though `iced_x86` models some of them
/// with implicit (non-`Memory`-kind) operands.
pub fn is_mem_access(d: &Decoded) -> bool {
    match d.instruction.mnemonic() {
        Mnemonic::Lea | Mnemonic::Invlpg => return false,
        Mnemonic::Movsb
        | Mnemonic::Movsw
        | Mnemonic::Movsd
        | Mnemonic::Movsq
        | Mnemonic::Cmpsb
        | Mnemonic::Cmpsw
        | Mnemonic::Cmpsd
        | Mnemonic::Cmpsq
        | Mnemonic::Stosb
        | Mnemonic::Stosw
        | Mnemonic::Stosd
        | Mnemonic::Stosq
        | Mnemonic::Lodsb
        | Mnemonic::Lodsw
        | Mnemonic::Lodsd
        | Mnemonic::Lodsq
        | Mnemonic::Scasb
        | Mnemonic::Scasw
        | Mnemonic::Scasd
        | Mnemonic::Scasq
        | Mnemonic::Insb
        | Mnemonic::Insw
        | Mnemonic::Insd
        | Mnemonic::Outsb
        | Mnemonic::Outsw
        | Mnemonic::Outsd
        | Mnemonic::Xlatb
        | Mnemonic::Clzero => return true,
        _ => {}
    }
    let ins = &d.instruction;
    (0..ins.op_count()).any(|i| ins.op_kind(i) == OpKind::Memory)
}

/// True iff the instruction writes to memory: a `DstMem` form with
/// `mod != 3` plus the enumerated stores/atomics `spec.md` §4.J calls out.
pub fn is_mem_write(d: &Decoded) -> bool {
    let ins = &d.instruction;
    match ins.mnemonic() {
        Mnemonic::Stosb
        | Mnemonic::Stosw
        | Mnemonic::Stosd
        | Mnemonic::Stosq
        | Mnemonic::Movsb
        | Mnemonic::Movsw
        | Mnemonic::Movsd
        | Mnemonic::Movsq
        | Mnemonic::Insb
        | Mnemonic::Insw
        | Mnemonic::Insd
        | Mnemonic::Bts
        | Mnemonic::Btr
        | Mnemonic::Btc
        | Mnemonic::Cmpxchg8b
        | Mnemonic::Cmpxchg16b
        | Mnemonic::Sgdt
        | Mnemonic::Sidt
        | Mnemonic::Movntps
        | Mnemonic::Movntpd
        | Mnemonic::Movntdq
        | Mnemonic::Movnti
        | Mnemonic::Movntq => return true,
        _ => {}
    }

    // FPU store sub-opcodes (FST/FSTP/FISTP/...) are all "the destination
    // operand is memory and this mnemonic is a store, not a load".
    if is_fpu_store_mnemonic(ins.mnemonic()) {
        return true;
    }

    // General rule: a memory operand used as operand 0 (the destination in
    // every AT&T/Intel two-operand ALU/MOV encoding this crate dispatches)
    // that isn't itself a pure comparison/load.
    if ins.op_count() == 0 {
        return false;
    }
    ins.op_kind(0) == OpKind::Memory && !is_pure_load_mnemonic(ins.mnemonic())
}

fn is_fpu_store_mnemonic(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Fst
            | Mnemonic::Fstp
            | Mnemonic::Fist
            | Mnemonic::Fistp
            | Mnemonic::Fisttp
            | Mnemonic::Fbstp
            | Mnemonic::Fxsave
            | Mnemonic::Fxsave64
            | Mnemonic::Xsave
            | Mnemonic::Xsave64
    )
}

fn is_pure_load_mnemonic(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Cmp
            | Mnemonic::Test
            | Mnemonic::Bt
            | Mnemonic::Cmpxchg
            | Mnemonic::Fld
            | Mnemonic::Fild
            | Mnemonic::Fxrstor
            | Mnemonic::Fxrstor64
            | Mnemonic::Xrstor
            | Mnemonic::Xrstor64
    )
}

/// True iff this is the IN/OUT/INS/OUTS family.
pub fn is_portio(d: &Decoded) -> bool {
    matches!(
        d.instruction.mnemonic(),
        Mnemonic::In
            | Mnemonic::Out
            | Mnemonic::Insb
            | Mnemonic::Insw
            | Mnemonic::Insd
            | Mnemonic::Outsb
            | Mnemonic::Outsw
            | Mnemonic::Outsd
    )
}

/// True iff this accesses a control register: `MOV` to/from `CRn`, `CLTS`,
/// or Grp7 `SMSW`/`LMSW`.
pub fn is_cr_access(d: &Decoded) -> bool {
    let ins = &d.instruction;
    match ins.mnemonic() {
        Mnemonic::Clts | Mnemonic::Smsw | Mnemonic::Lmsw => return true,
        Mnemonic::Mov => {}
        _ => return false,
    }
    (0..ins.op_count()).any(|i| {
        ins.op_kind(i) == OpKind::Register
            && matches!(
                ins.op_register(i),
                iced_x86::Register::CR0
                    | iced_x86::Register::CR1
                    | iced_x86::Register::CR2
                    | iced_x86::Register::CR3
                    | iced_x86::Register::CR4
                    | iced_x86::Register::CR5
                    | iced_x86::Register::CR6
                    | iced_x86::Register::CR7
                    | iced_x86::Register::CR8
            )
    })
}
