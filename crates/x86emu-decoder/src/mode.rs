/// The decoder's notion of default operand/address size, driven by the
/// segment's `D`/`L` bits (or real mode) rather than by any single
/// instruction's prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    Bits16,
    Bits32,
    Bits64,
}

impl DecodeMode {
    pub fn bitness(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, DecodeMode::Bits64)
    }

    /// Default operand size in bytes absent any operand-size override.
    pub fn default_operand_bytes(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 2,
            DecodeMode::Bits32 | DecodeMode::Bits64 => 4,
        }
    }

    /// Default address size in bytes absent any address-size override.
    pub fn default_address_bytes(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 2,
            DecodeMode::Bits32 => 4,
            DecodeMode::Bits64 => 8,
        }
    }
}
