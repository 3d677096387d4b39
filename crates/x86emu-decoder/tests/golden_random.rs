//! Cross-checks random byte streams against Capstone across all three modes:
//! whenever both decoders accept a sample, their reported lengths must
//! agree. Complements `golden_capstone.rs`'s hand-picked samples with broad,
//! reproducible coverage via a fixed-seed PRNG.

mod common;

use capstone::prelude::*;
use common::XorShift64;
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

fn check_mode(mode: DecodeMode, seed: u64) {
    let cs = capstone_for(mode);
    let mut rng = XorShift64(seed);
    let mut buf = [0u8; 16];
    for _ in 0..2000 {
        rng.fill(&mut buf);
        let ours = decode_one(mode, 0, &buf);
        let theirs = cs.disasm_count(&buf, 0, 1).ok().filter(|i| !i.is_empty());
        if let (Ok(ours), Some(theirs)) = (ours, theirs) {
            let insn = theirs.iter().next().expect("non-empty disasm result");
            assert_eq!(
                ours.len() as usize,
                insn.bytes().len(),
                "length mismatch for {buf:02x?} in {mode:?}"
            );
        }
    }
}

#[test]
fn random_32_bit_streams_agree_with_capstone_when_both_accept() {
    check_mode(DecodeMode::Bits32, 0x9E37_79B9_7F4A_7C15);
}

#[test]
fn random_64_bit_streams_agree_with_capstone_when_both_accept() {
    check_mode(DecodeMode::Bits64, 0xC2B2_AE3D_27D4_EB4F);
}

#[test]
fn random_16_bit_streams_agree_with_capstone_when_both_accept() {
    check_mode(DecodeMode::Bits16, 0x1656_67B1_9E37_79F9);
}
