//! Cross-checks this crate's reported instruction length against an
//! independent decoder (Capstone) for a representative opcode sample, in
//! each of the three operating modes.

use capstone::prelude::*;
use x86emu_decoder::{decode_one, DecodeMode};

fn capstone_for(mode: DecodeMode) -> Capstone {
    let cs_mode = match mode {
        DecodeMode::Bits16 => arch::x86::ArchMode::Mode16,
        DecodeMode::Bits32 => arch::x86::ArchMode::Mode32,
        DecodeMode::Bits64 => arch::x86::ArchMode::Mode64,
    };
    Capstone::new()
        .x86()
        .mode(cs_mode)
        .build()
        .expect("capstone init")
}

fn assert_lengths_agree(mode: DecodeMode, bytes: &[u8]) {
    let ours = decode_one(mode, 0, bytes).expect("our decoder accepts sample");
    let cs = capstone_for(mode);
    let insns = cs.disasm_count(bytes, 0, 1).expect("capstone disasm");
    let insn = insns.iter().next().expect("capstone produced an instruction");
    assert_eq!(
        ours.len() as usize,
        insn.bytes().len(),
        "length mismatch for {bytes:02x?} in {mode:?}"
    );
}

#[test]
fn agrees_with_capstone_on_32_bit_samples() {
    let samples: &[&[u8]] = &[
        &[0x90],                   // nop
        &[0x89, 0xD8],             // mov eax, ebx
        &[0x01, 0xC3],             // add ebx, eax
        &[0x83, 0xC0, 0x01],       // add eax, 1
        &[0x8B, 0x45, 0x08],       // mov eax, [ebp+8]
        &[0xE8, 0x00, 0x00, 0x00, 0x00], // call rel32
        &[0x0F, 0xB6, 0xC0],       // movzx eax, al
        &[0xC3],                   // ret
    ];
    for s in samples {
        assert_lengths_agree(DecodeMode::Bits32, s);
    }
}

#[test]
fn agrees_with_capstone_on_64_bit_samples() {
    let samples: &[&[u8]] = &[
        &[0x48, 0x89, 0xD8],             // mov rax, rbx
        &[0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00], // mov rax, [rip+0]
        &[0x48, 0x83, 0xEC, 0x20],       // sub rsp, 0x20
        &[0x41, 0x50],                   // push r8
        &[0xC3],                         // ret
    ];
    for s in samples {
        assert_lengths_agree(DecodeMode::Bits64, s);
    }
}

#[test]
fn agrees_with_capstone_on_16_bit_samples() {
    let samples: &[&[u8]] = &[
        &[0x90],             // nop
        &[0x89, 0xD8],       // mov ax, bx
        &[0xB8, 0x34, 0x12], // mov ax, 0x1234
    ];
    for s in samples {
        assert_lengths_agree(DecodeMode::Bits16, s);
    }
}
