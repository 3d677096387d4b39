use x86emu_decoder::{scan_prefixes, DecodeMode, MandatoryPrefix, Segment};

#[test]
fn no_prefixes() {
    let (p, n) = scan_prefixes(DecodeMode::Bits32, &[0x90]).unwrap();
    assert_eq!(n, 0);
    assert_eq!(p.mandatory_prefix(), MandatoryPrefix::None);
    assert!(p.segment.is_none());
}

#[test]
fn operand_size_override_alone() {
    let (p, n) = scan_prefixes(DecodeMode::Bits32, &[0x66, 0x90]).unwrap();
    assert_eq!(n, 1);
    assert!(p.operand_size_override);
    assert_eq!(p.mandatory_prefix(), MandatoryPrefix::P66);
}

#[test]
fn operand_and_address_size_override() {
    let (p, n) = scan_prefixes(DecodeMode::Bits32, &[0x66, 0x67, 0x90]).unwrap();
    assert_eq!(n, 2);
    assert!(p.operand_size_override);
    assert!(p.address_size_override);
}

#[test]
fn rex_prefix_counted_in_64_bit_mode() {
    let (p, n) = scan_prefixes(DecodeMode::Bits64, &[0x48, 0x90]).unwrap();
    assert_eq!(n, 1);
    assert_eq!(p.rex, Some(0x48));
    assert!(p.rex_w());
}

#[test]
fn rex_ignored_outside_64_bit_mode() {
    // 0x48 in 32-bit mode is `dec eax`, not a REX prefix.
    let (p, n) = scan_prefixes(DecodeMode::Bits32, &[0x48, 0x90]).unwrap();
    assert_eq!(n, 0);
    assert!(p.rex.is_none());
}

#[test]
fn segment_override_recognized() {
    let (p, n) = scan_prefixes(DecodeMode::Bits32, &[0x64, 0x90]).unwrap();
    assert_eq!(n, 1);
    assert_eq!(p.segment, Some(Segment::Fs));
}

#[test]
fn lock_and_rep_tracked_independently_of_mandatory_prefix() {
    let (p, _) = scan_prefixes(DecodeMode::Bits32, &[0xF0, 0x90]).unwrap();
    assert!(p.lock);
    let (p, _) = scan_prefixes(DecodeMode::Bits32, &[0xF3, 0x90]).unwrap();
    assert!(p.rep);
    assert_eq!(p.mandatory_prefix(), MandatoryPrefix::F3);
    let (p, _) = scan_prefixes(DecodeMode::Bits32, &[0xF2, 0x90]).unwrap();
    assert!(p.repne);
    assert_eq!(p.mandatory_prefix(), MandatoryPrefix::F2);
}

#[test]
fn legacy_prefix_after_rex_nullifies_it() {
    // Legacy prefixes must precede REX; a 0x66 appearing after a REX byte
    // is not a prefix at all (REX must be the byte immediately before the
    // opcode), so the scan stops at the REX byte and leaves 0x66 for the
    // opcode decoder to interpret on its own terms.
    let (p, n) = scan_prefixes(DecodeMode::Bits64, &[0x48, 0x66, 0x90]).unwrap();
    assert_eq!(p.rex, Some(0x48));
    assert_eq!(n, 1);
}

#[test]
fn trailing_legacy_prefix_nullifies_earlier_rex() {
    // Here the 0x66 appears *before* the REX byte, so it is scanned as a
    // legacy prefix, and the REX byte that follows it is the one that
    // counts.
    let (p, n) = scan_prefixes(DecodeMode::Bits64, &[0x66, 0x48, 0x90]).unwrap();
    assert_eq!(p.rex, Some(0x48));
    assert!(p.operand_size_override);
    assert_eq!(n, 2);
}
