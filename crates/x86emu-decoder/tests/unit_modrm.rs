use iced_x86::Register;
use x86emu_decoder::{decode_one, DecodeMode};

#[test]
fn decodes_rip_relative_memory_operand() {
    // 48 8B 05 78 56 34 12  => mov rax, qword ptr [rip+0x12345678]
    let bytes = [0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12];
    let decoded = decode_one(DecodeMode::Bits64, 0x1000, &bytes).expect("decode");
    let ins = decoded.instruction;
    assert_eq!(ins.op_count(), 2);
    assert_eq!(ins.memory_base(), Register::RIP);
    assert_eq!(ins.memory_index(), Register::None);
    let expected = (0x1000u64 + ins.len() as u64).wrapping_add(0x12345678);
    assert_eq!(ins.memory_displacement64(), expected);
    assert_eq!(decoded.op_bytes, 8);
    assert_eq!(decoded.ad_bytes, 8);
}

#[test]
fn decodes_sib_scaled_index() {
    // 48 8B 84 8B 78 56 34 12
    // mov rax, qword ptr [rbx+rcx*4+0x12345678]
    let bytes = [0x48, 0x8B, 0x84, 0x8B, 0x78, 0x56, 0x34, 0x12];
    let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).expect("decode");
    let ins = decoded.instruction;
    assert_eq!(ins.memory_base(), Register::RBX);
    assert_eq!(ins.memory_index(), Register::RCX);
    assert_eq!(ins.memory_index_scale(), 4);
    assert_eq!(ins.memory_displacement64(), 0x12345678);
}

#[test]
fn modrm_split_matches_instruction_operands() {
    // 89 D8  => mov eax, ebx  (mod=11, reg=011(ebx), rm=000(eax))
    let bytes = [0x89, 0xD8];
    let decoded = decode_one(DecodeMode::Bits32, 0, &bytes).expect("decode");
    let modrm = decoded.modrm.expect("modrm present");
    assert_eq!(modrm.mod_, 0b11);
    assert_eq!(modrm.reg, 0b011);
    assert_eq!(modrm.rm, 0b000);
}

#[test]
fn instruction_length_never_exceeds_architectural_maximum() {
    // A heavily prefixed, but still valid, instruction.
    let bytes = [
        0x66, 0x67, 0x2E, 0xF0, 0x0F, 0xC7, 0x09, // lock cs addr32 op32 cmpxchg8b [ecx]
    ];
    if let Ok(decoded) = decode_one(DecodeMode::Bits32, 0, &bytes) {
        assert!(decoded.len() as usize <= x86emu_decoder::MAX_INSTRUCTION_LEN);
    }
}
