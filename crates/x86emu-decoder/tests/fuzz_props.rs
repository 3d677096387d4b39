use proptest::prelude::*;
use x86emu_decoder::{decode_one, DecodeMode, MAX_INSTRUCTION_LEN};

proptest! {
    /// The decoder never panics on arbitrary byte soup, in any mode, and
    /// whatever it reports stays internally consistent: a successful decode
    /// never claims a length longer than the window it was given, or longer
    /// than the architectural maximum.
    #[test]
    fn never_panics_and_length_is_sane(
        bytes in prop::collection::vec(any::<u8>(), 1..32),
        mode_idx in 0u8..3,
    ) {
        let mode = match mode_idx {
            0 => DecodeMode::Bits16,
            1 => DecodeMode::Bits32,
            _ => DecodeMode::Bits64,
        };
        if let Ok(decoded) = decode_one(mode, 0, &bytes) {
            prop_assert!(decoded.len() as usize <= MAX_INSTRUCTION_LEN);
            prop_assert!(decoded.len() as usize <= bytes.len());
        }
    }

    /// Decoding is a pure function of its inputs: the same bytes at the
    /// same `ip` in the same mode always produce the same verdict.
    #[test]
    fn decode_is_deterministic(
        bytes in prop::collection::vec(any::<u8>(), 1..32),
        ip in any::<u64>(),
    ) {
        let a = decode_one(DecodeMode::Bits64, ip, &bytes);
        let b = decode_one(DecodeMode::Bits64, ip, &bytes);
        match (a, b) {
            (Ok(da), Ok(db)) => prop_assert_eq!(da.len(), db.len()),
            (Err(ea), Err(eb)) => prop_assert_eq!(ea, eb),
            _ => prop_assert!(false, "decode was nondeterministic"),
        }
    }
}
