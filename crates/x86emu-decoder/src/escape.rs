/// Which opcode-map escape sequence produced this instruction, per
/// `spec.md` §3's `State.escape_map` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EscapeMap {
    /// The one-byte primary opcode map.
    None,
    /// `0F xx` two-byte map.
    Of,
    /// `0F 38 xx`.
    Of38,
    /// `0F 3A xx`.
    Of3a,
    /// XOP group 8 (`8F /8`).
    Xop8,
    /// XOP group 9 (`8F /9`).
    Xop9,
    /// XOP group 10 (`8F /A`).
    XopA,
}
