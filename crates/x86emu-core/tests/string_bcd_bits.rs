//! Coverage for the string/REP family, the BCD/MUL-DIV primitives, and the
//! bit-manipulation/atomics groups that `alu_and_control.rs` doesn't reach.

mod common;

use common::{exec_one, new_ctxt64, FlatBus, BUS_SIZE, CODE_BASE};
use x86emu_core::{AddressMode, Ctxt, EmulateStatus, Eflags, Gpr, Regs};

#[test]
fn rep_movsb_copies_bytes_forward_and_zeroes_rcx() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x2000, b"ABCD");
    ctxt.regs.set_gpr(Gpr::Rsi, 0x2000);
    ctxt.regs.set_gpr(Gpr::Rdi, 0x3000);
    ctxt.regs.set_gpr(Gpr::Rcx, 4);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF3, 0xA4]), EmulateStatus::Okay); // rep movsb
    assert_eq!(&bus.mem[0x3000..0x3004], b"ABCD");
    assert_eq!(ctxt.regs.gpr(Gpr::Rsi), 0x2004);
    assert_eq!(ctxt.regs.gpr(Gpr::Rdi), 0x3004);
    assert_eq!(ctxt.regs.gpr(Gpr::Rcx), 0);
}

#[test]
fn rep_movsb_with_rcx_zero_touches_nothing() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x3000, &[0xFF; 4]);
    ctxt.regs.set_gpr(Gpr::Rsi, 0x2000);
    ctxt.regs.set_gpr(Gpr::Rdi, 0x3000);
    ctxt.regs.set_gpr(Gpr::Rcx, 0);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF3, 0xA4]), EmulateStatus::Okay);
    assert_eq!(&bus.mem[0x3000..0x3004], &[0xFF; 4]);
    assert_eq!(ctxt.regs.gpr(Gpr::Rsi), 0x2000);
    assert_eq!(ctxt.regs.gpr(Gpr::Rdi), 0x3000);
}

#[test]
fn rep_stosb_fills_with_al_and_honors_direction_flag() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.eflags.insert(Eflags::DF);
    ctxt.regs.set_gpr(Gpr::Rax, 0x7A);
    ctxt.regs.set_gpr(Gpr::Rdi, 0x3003);
    ctxt.regs.set_gpr(Gpr::Rcx, 4);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF3, 0xAA]), EmulateStatus::Okay); // rep stosb
    assert_eq!(&bus.mem[0x3000..0x3004], &[0x7A; 4]);
    assert_eq!(ctxt.regs.gpr(Gpr::Rdi), 0x2FFF);
    assert_eq!(ctxt.regs.gpr(Gpr::Rcx), 0);
}

#[test]
fn repe_scasb_stops_on_first_mismatch_before_rcx_is_exhausted() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x3000, b"AAB_"); // mismatch at the 3rd byte, one short of RCX
    ctxt.regs.set_gpr(Gpr::Rax, b'A' as u64);
    ctxt.regs.set_gpr(Gpr::Rdi, 0x3000);
    ctxt.regs.set_gpr(Gpr::Rcx, 4);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF3, 0xAE]), EmulateStatus::Okay); // repe scasb
    assert_eq!(ctxt.regs.gpr(Gpr::Rdi), 0x3003); // advanced by the 3 bytes it did compare
    assert_eq!(ctxt.regs.gpr(Gpr::Rcx), 1); // one repetition left uncompleted
    assert!(!ctxt.regs.eflags.contains(Eflags::ZF)); // stopped because 'B' != 'A'
}

#[test]
fn div_overflow_produces_correct_quotient_and_remainder() {
    // spec.md S3: EDX:EAX = 0x0000_0001_0000_0000, ECX=2 -> DIV ECX.
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0);
    ctxt.regs.set_gpr(Gpr::Rdx, 1);
    ctxt.regs.set_gpr(Gpr::Rcx, 2);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF7, 0xF1]), EmulateStatus::Okay); // div ecx
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) & 0xFFFF_FFFF, 0x8000_0000);
    assert_eq!(ctxt.regs.gpr(Gpr::Rdx) & 0xFFFF_FFFF, 0);
}

#[test]
fn div_by_zero_raises_de_and_leaves_registers_unchanged() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 10);
    ctxt.regs.set_gpr(Gpr::Rdx, 0);
    ctxt.regs.set_gpr(Gpr::Rcx, 0);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF7, 0xF1]), EmulateStatus::Exception); // div ecx
    let ev = ctxt.event.expect("a #DE should have been queued");
    assert_eq!(ev.vector, x86emu_core::Exception::De);
    assert_eq!(ctxt.regs.gpr(Gpr::Rax), 10);
    assert_eq!(ctxt.regs.gpr(Gpr::Rdx), 0);
}

#[test]
fn imul_r8_overflow_sets_cf_and_of() {
    // spec.md S8: AL=0x7F, r/m8=0x7F -> AX = 0x3F01, OF=CF=1.
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0x7F);
    ctxt.regs.set_gpr(Gpr::Rbx, 0x7F);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF6, 0xEB]), EmulateStatus::Okay); // imul bl
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) & 0xFFFF, 0x3F01);
    assert!(ctxt.regs.eflags.contains(Eflags::CF));
    assert!(ctxt.regs.eflags.contains(Eflags::OF));
}

#[test]
fn daa_adjusts_al_and_sets_carry_and_aux_carry() {
    // spec.md S4/S5-style fact, run in 32-bit mode since DAA is invalid
    // in 64-bit mode: AL=0x9F, CF=0, AF=0 -> AL=0x05, CF=1, AF=1.
    let mut regs = Regs::default();
    regs.rip = CODE_BASE;
    let mut ctxt = Ctxt::new(regs, AddressMode::Bits32);
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0x9F);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x27]), EmulateStatus::Okay); // daa
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) & 0xFF, 0x05);
    assert!(ctxt.regs.eflags.contains(Eflags::CF));
    assert!(ctxt.regs.eflags.contains(Eflags::AF));
}

#[test]
fn xor_self_zeroes_register_and_sets_zf_pf() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0x1234);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x31, 0xC0]), EmulateStatus::Okay); // xor eax, eax
    assert_eq!(ctxt.regs.gpr(Gpr::Rax), 0);
    assert!(ctxt.regs.eflags.contains(Eflags::ZF));
    assert!(ctxt.regs.eflags.contains(Eflags::PF));
    assert!(!ctxt.regs.eflags.contains(Eflags::CF));
    assert!(!ctxt.regs.eflags.contains(Eflags::OF));
}

#[test]
fn neg_twice_restores_the_original_value() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0x2A);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF7, 0xD8]), EmulateStatus::Okay); // neg eax
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, (-0x2Ai32) as u32);
    assert!(ctxt.regs.eflags.contains(Eflags::CF));

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF7, 0xD8]), EmulateStatus::Okay); // neg eax
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, 0x2A);
}

#[test]
fn bswap_is_its_own_inverse_for_32_bit_operands() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0x1122_3344);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x0F, 0xC8]), EmulateStatus::Okay); // bswap eax
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, 0x4433_2211);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x0F, 0xC8]), EmulateStatus::Okay); // bswap eax
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, 0x1122_3344);
}

#[test]
fn popcnt_counts_set_bits_and_clears_arithmetic_flags() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.eflags.insert(Eflags::OF | Eflags::CF);
    ctxt.regs.set_gpr(Gpr::Rbx, 0b1011);

    // popcnt eax, ebx
    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF3, 0x0F, 0xB8, 0xC3]), EmulateStatus::Okay);
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, 3);
    assert!(!ctxt.regs.eflags.contains(Eflags::ZF));
    assert!(!ctxt.regs.eflags.contains(Eflags::OF));
    assert!(!ctxt.regs.eflags.contains(Eflags::CF));
}

#[test]
fn cmpxchg_mismatch_loads_rax_and_leaves_memory_untouched() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x2000, &0xAAAA_AAAAu32.to_le_bytes());
    ctxt.regs.set_gpr(Gpr::Rbx, 0x2000);
    ctxt.regs.set_gpr(Gpr::Rax, 0x1111_1111); // expected value, doesn't match memory
    ctxt.regs.set_gpr(Gpr::Rcx, 0xBBBB_BBBB); // new value, should not be written

    // cmpxchg [rbx], ecx
    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x0F, 0xB1, 0x0B]), EmulateStatus::Okay);
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, 0xAAAA_AAAA);
    assert_eq!(bus.read_u32(0x2000), 0xAAAA_AAAA);
    assert!(!ctxt.regs.eflags.contains(Eflags::ZF));
}

#[test]
fn cmpxchg_match_writes_the_new_value_and_sets_zf() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x2000, &0xAAAA_AAAAu32.to_le_bytes());
    ctxt.regs.set_gpr(Gpr::Rbx, 0x2000);
    ctxt.regs.set_gpr(Gpr::Rax, 0xAAAA_AAAA); // matches memory
    ctxt.regs.set_gpr(Gpr::Rcx, 0xBBBB_BBBB);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x0F, 0xB1, 0x0B]), EmulateStatus::Okay);
    assert_eq!(bus.read_u32(0x2000), 0xBBBB_BBBB);
    assert!(ctxt.regs.eflags.contains(Eflags::ZF));
}

#[test]
fn cpuid_returns_the_callback_supplied_leaf() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 7);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x0F, 0xA2]), EmulateStatus::Okay); // cpuid
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) as u32, 7); // FlatBus::cpuid echoes eax_in
}

#[test]
fn lock_prefix_on_a_non_rmw_opcode_is_ud() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 0x1234);

    // f0 90 : lock nop -- NOP is not in the LOCKable RMW set.
    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0xF0, 0x90]), EmulateStatus::Exception);
    let ev = ctxt.event.expect("a #UD should have been queued");
    assert_eq!(ev.vector, x86emu_core::Exception::Ud);
}
