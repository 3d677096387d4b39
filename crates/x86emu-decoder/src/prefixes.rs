use crate::error::DecodeError;
use crate::mode::DecodeMode;

/// A segment-override prefix, independent of any register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl Segment {
    fn from_prefix_byte(byte: u8) -> Option<Segment> {
        match byte {
            0x26 => Some(Segment::Es),
            0x2E => Some(Segment::Cs),
            0x36 => Some(Segment::Ss),
            0x3E => Some(Segment::Ds),
            0x64 => Some(Segment::Fs),
            0x65 => Some(Segment::Gs),
            _ => None,
        }
    }
}

/// The mandatory-prefix role a `0x66`/`0xF2`/`0xF3` byte plays for SIMD-family
/// opcodes, per `spec.md` §4.B: `0x66` participates in both the operand-size
/// role and (absent a REP*) the mandatory-prefix role; a later REP*
/// overrides `0x66` in the mandatory-prefix role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MandatoryPrefix {
    None,
    P66,
    F3,
    F2,
}

/// Legacy-prefix (plus, in 64-bit mode, REX) decode result for one
/// instruction, independent of the opcode/ModRM/SIB/immediate bytes that
/// follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    pub segment: Option<Segment>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    /// Set when a REX prefix (0x40-0x4F) directly precedes the opcode in
    /// 64-bit mode. Any legacy prefix appearing *after* a REX byte nullifies
    /// it (the REX byte is consumed as a no-op and `rex` stays absent).
    pub rex: Option<u8>,
}

impl Prefixes {
    pub fn mandatory_prefix(&self) -> MandatoryPrefix {
        // A REP*/REPNE in the mandatory-prefix role always wins over 0x66,
        // per spec.md §4.B.
        if self.repne {
            MandatoryPrefix::F2
        } else if self.rep {
            MandatoryPrefix::F3
        } else if self.operand_size_override {
            MandatoryPrefix::P66
        } else {
            MandatoryPrefix::None
        }
    }

    pub fn rex_w(&self) -> bool {
        self.rex.map(|r| r & 0x8 != 0).unwrap_or(false)
    }
    pub fn rex_r(&self) -> bool {
        self.rex.map(|r| r & 0x4 != 0).unwrap_or(false)
    }
    pub fn rex_x(&self) -> bool {
        self.rex.map(|r| r & 0x2 != 0).unwrap_or(false)
    }
    pub fn rex_b(&self) -> bool {
        self.rex.map(|r| r & 0x1 != 0).unwrap_or(false)
    }
}

fn is_legacy_prefix_byte(byte: u8) -> bool {
    matches!(
        byte,
        0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
    )
}

/// Scans the legacy-prefix (and, in 64-bit mode, trailing REX) run at the
/// start of `bytes`, returning the decoded [`Prefixes`] plus the number of
/// bytes consumed before the opcode begins.
///
/// This is the same scan [`crate::decode_one`] performs internally; it is
/// exposed standalone for callers that only need instruction-boundary
/// heuristics (e.g. re-synchronizing after a disassembly desync) without
/// paying for full operand decode.
pub fn scan_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<(Prefixes, usize), DecodeError> {
    let mut prefixes = Prefixes::default();
    let mut consumed = 0usize;

    loop {
        let Some(&byte) = bytes.get(consumed) else {
            // A stream of only prefix bytes can never form a valid
            // instruction on its own; whether that's "need more bytes" or
            // "invalid" is for the caller (decode_one) to decide based on
            // how much of the 15-byte window was available.
            return Err(DecodeError::TooShort);
        };

        if !is_legacy_prefix_byte(byte) {
            break;
        }

        // Any legacy prefix occurring after a REX byte nullifies that REX
        // (REX must be the byte immediately preceding the opcode).
        prefixes.rex = None;

        match byte {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {
                prefixes.segment = Segment::from_prefix_byte(byte);
            }
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            0xF0 => prefixes.lock = true,
            0xF2 => {
                prefixes.repne = true;
                prefixes.rep = false;
            }
            0xF3 => {
                prefixes.rep = true;
                prefixes.repne = false;
            }
            _ => unreachable!(),
        }
        consumed += 1;
    }

    if mode.is_64bit() {
        if let Some(&byte) = bytes.get(consumed) {
            if (0x40..=0x4F).contains(&byte) {
                prefixes.rex = Some(byte);
                consumed += 1;
            }
        } else {
            return Err(DecodeError::TooShort);
        }
    }

    Ok((prefixes, consumed))
}

/// Convenience wrapper over [`scan_prefixes`] that discards the consumed
/// byte count.
pub fn decode_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<Prefixes, DecodeError> {
    scan_prefixes(mode, bytes).map(|(p, _)| p)
}
