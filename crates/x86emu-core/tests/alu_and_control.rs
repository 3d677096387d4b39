mod common;

use common::{exec_one, new_ctxt64, FlatBus, BUS_SIZE, CODE_BASE};
use x86emu_core::{emulate, EmulateStatus, Eflags, Gpr};

#[test]
fn add_al_imm8_sets_arithmetic_flags() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);

    let status = exec_one(&mut ctxt, &mut bus, &[0x04, 0x05]); // add al, 5
    assert_eq!(status, EmulateStatus::Okay);
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) & 0xFF, 5);
    assert!(!ctxt.regs.eflags.contains(Eflags::ZF));
    assert!(!ctxt.regs.eflags.contains(Eflags::CF));
    assert!(ctxt.regs.eflags.contains(Eflags::PF)); // 0b101 has even parity
    assert_eq!(ctxt.regs.rip, CODE_BASE + 2);
}

#[test]
fn cmp_sets_zf_without_modifying_the_operand() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rax, 7);

    let status = exec_one(&mut ctxt, &mut bus, &[0x3C, 0x07]); // cmp al, 7
    assert_eq!(status, EmulateStatus::Okay);
    assert_eq!(ctxt.regs.gpr(Gpr::Rax) & 0xFF, 7);
    assert!(ctxt.regs.eflags.contains(Eflags::ZF));
}

#[test]
fn je_branches_when_zf_is_set() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.eflags.insert(Eflags::ZF);

    // je +4: lands past a 2-byte window of filler this test never executes.
    let status = exec_one(&mut ctxt, &mut bus, &[0x74, 0x04]);
    assert_eq!(status, EmulateStatus::Okay);
    assert_eq!(ctxt.regs.rip, CODE_BASE + 2 + 4);
}

#[test]
fn jne_does_not_branch_when_zf_is_set() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.eflags.insert(Eflags::ZF);

    let status = exec_one(&mut ctxt, &mut bus, &[0x75, 0x04]); // jne +4
    assert_eq!(status, EmulateStatus::Okay);
    assert_eq!(ctxt.regs.rip, CODE_BASE + 2);
}

#[test]
fn loop_decrements_rcx_and_rewinds_to_itself_until_exhausted() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rcx, 2);
    bus.load(CODE_BASE, &[0xE2, 0xFE]); // loop $ (branches to its own start_ip)

    ctxt.regs.rip = CODE_BASE;
    assert_eq!(emulate(&mut ctxt, &mut bus), EmulateStatus::Okay);
    assert_eq!(ctxt.regs.gpr(Gpr::Rcx), 1);
    assert_eq!(ctxt.regs.rip, CODE_BASE); // RCX != 0, branch taken

    assert_eq!(emulate(&mut ctxt, &mut bus), EmulateStatus::Okay);
    assert_eq!(ctxt.regs.gpr(Gpr::Rcx), 0);
    assert_eq!(ctxt.regs.rip, CODE_BASE + 2); // RCX == 0, falls through
}

#[test]
fn push_pop_round_trip_through_the_stack() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rsp, 0x9000);
    ctxt.regs.set_gpr(Gpr::Rax, 0x1122_3344_5566_7788);

    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x50]), EmulateStatus::Okay); // push rax
    assert_eq!(ctxt.regs.gpr(Gpr::Rsp), 0x8FF8);
    assert_eq!(bus.read_u32(0x8FF8), 0x5566_7788);

    ctxt.regs.set_gpr(Gpr::Rax, 0);
    assert_eq!(exec_one(&mut ctxt, &mut bus, &[0x58]), EmulateStatus::Okay); // pop rax
    assert_eq!(ctxt.regs.gpr(Gpr::Rax), 0x1122_3344_5566_7788);
    assert_eq!(ctxt.regs.gpr(Gpr::Rsp), 0x9000);
}

#[test]
fn call_pushes_return_address_and_ret_restores_it() {
    let mut ctxt = new_ctxt64();
    let mut bus = FlatBus::new(BUS_SIZE);
    ctxt.regs.set_gpr(Gpr::Rsp, 0x9000);
    ctxt.regs.rip = CODE_BASE;

    // call +0xb, landing on a ret at CODE_BASE + 0x10.
    bus.load(CODE_BASE, &[0xE8, 0x0B, 0x00, 0x00, 0x00]);
    bus.load(CODE_BASE + 0x10, &[0xC3]);

    assert_eq!(emulate(&mut ctxt, &mut bus), EmulateStatus::Okay);
    assert_eq!(ctxt.regs.rip, CODE_BASE + 0x10);
    assert_eq!(ctxt.regs.gpr(Gpr::Rsp), 0x8FF8);
    assert_eq!(bus.read_u32(0x8FF8), (CODE_BASE + 5) as u32);

    assert_eq!(emulate(&mut ctxt, &mut bus), EmulateStatus::Okay);
    assert_eq!(ctxt.regs.rip, CODE_BASE + 5);
    assert_eq!(ctxt.regs.gpr(Gpr::Rsp), 0x9000);
}
