//! `Ctxt`, `spec.md` §3: the caller-owned context passed by reference to
//! every emulation call.

use crate::exception::{PendingEvent, Retire};
use crate::state::{AddressMode, CpuVendor, Regs};

/// Governs whether the core is permitted to emulate software-interrupt
/// delivery (INT/INTO/INT3/ICEBP) itself, per `spec.md` §3's
/// "software-interrupt emulation policy" field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftwareInterruptPolicy {
    /// The core performs the full IDT-gate-validated injection itself.
    Emulate,
    /// The core declines (`Unhandleable`) and leaves delivery to the caller.
    Defer,
}

/// The decoded opcode identity `spec.md` §3 describes as "packed: escape
/// map, mandatory prefix, final byte" — kept as a plain record here since
/// `x86emu-core` dispatches off `iced_x86::Instruction` directly rather
/// than a custom packed integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeId {
    pub escape_map: x86emu_decoder::EscapeMap,
    pub mandatory_prefix: x86emu_decoder::MandatoryPrefix,
    pub mnemonic: iced_x86::Mnemonic,
}

/// Caller-owned emulation context, passed by reference to [`crate::emulate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ctxt {
    pub regs: Regs,
    pub mode: AddressMode,
    pub stack_mode: AddressMode,
    pub vendor: CpuVendor,
    pub swint_policy: SoftwareInterruptPolicy,
    pub retire: Retire,
    /// Set when an `EXCEPTION` status is returned; cleared on entry to
    /// every `emulate` call.
    pub event: Option<PendingEvent>,
    /// Forces writeback even when `dst.val == dst.orig_val` and the opcode
    /// is not Mov-attributed (`spec.md` §4.I). `validate` may set this.
    pub force_writeback: bool,
}

impl Ctxt {
    pub fn new(regs: Regs, mode: AddressMode) -> Ctxt {
        Ctxt {
            regs,
            mode,
            stack_mode: mode,
            vendor: CpuVendor::Intel,
            swint_policy: SoftwareInterruptPolicy::Emulate,
            retire: Retire::default(),
            event: None,
            force_writeback: false,
        }
    }
}
