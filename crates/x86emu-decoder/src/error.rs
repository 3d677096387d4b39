use thiserror::Error;

/// Failure modes for [`crate::decode_one`] and friends.
///
/// The distinction between the two variants matters to callers that fetch
/// instruction bytes lazily (e.g. one [`crate::MAX_INSTRUCTION_LEN`]-sized
/// window at a time from guest memory): `TooShort` means "decode again once
/// more bytes are available", while `InvalidInstruction` means the byte
/// stream can never form a valid instruction no matter how many more bytes
/// are supplied, and the caller should raise `#UD` immediately.
///
/// A decode window that already spans the full architectural maximum of 15
/// bytes and still fails is always `InvalidInstruction`: no x86 instruction
/// can require more than 15 bytes, so "not enough bytes yet" is not a
/// possible explanation once the window is that wide.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("instruction decode requires more bytes than were supplied")]
    TooShort,
    #[error("byte stream does not decode to a valid instruction")]
    InvalidInstruction,
}
