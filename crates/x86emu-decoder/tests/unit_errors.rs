use x86emu_decoder::{decode_one, DecodeError, DecodeMode, MAX_INSTRUCTION_LEN};

#[test]
fn empty_input_is_too_short() {
    let err = decode_one(DecodeMode::Bits32, 0, &[]).unwrap_err();
    assert_eq!(err, DecodeError::TooShort);
}

#[test]
fn truncated_instruction_is_too_short() {
    // 0F B6 is MOVZX r32, r/m8 and needs a ModRM byte that never arrives.
    let err = decode_one(DecodeMode::Bits32, 0, &[0x0F, 0xB6]).unwrap_err();
    assert_eq!(err, DecodeError::TooShort);
}

#[test]
fn full_window_of_garbage_is_invalid_not_too_short() {
    // LOCK NOP has no valid encoding (NOP is not a read-modify-write memory
    // form LOCK can apply to); the decoder rejects it outright regardless
    // of how many trailing bytes follow, so a full 15-byte window must
    // report a permanent `InvalidInstruction`, not `TooShort`.
    let mut bytes = [0x90u8; MAX_INSTRUCTION_LEN];
    bytes[0] = 0xF0;
    let err = decode_one(DecodeMode::Bits32, 0, &bytes).unwrap_err();
    assert_eq!(err, DecodeError::InvalidInstruction);
}

#[test]
fn valid_instruction_decodes_ok() {
    let decoded = decode_one(DecodeMode::Bits32, 0, &[0x90]).expect("nop decodes");
    assert_eq!(decoded.len(), 1);
}
