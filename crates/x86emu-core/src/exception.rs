//! The architectural exception vector table and the five-kind emulator
//! status taxonomy, `spec.md` §4.H / §7.

use thiserror::Error;

/// x86 architectural exception vectors the core can raise or propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Exception {
    De = 0,
    Db = 1,
    Nmi = 2,
    Bp = 3,
    Of = 4,
    Br = 5,
    Ud = 6,
    Nm = 7,
    Df = 8,
    Ts = 10,
    Np = 11,
    Ss = 12,
    Gp = 13,
    Pf = 14,
    Mf = 16,
    Ac = 17,
    Mc = 18,
    Xm = 19,
}

impl Exception {
    /// True for vectors whose IDT delivery pushes an error code.
    pub fn has_error_code(self) -> bool {
        matches!(
            self,
            Exception::Df
                | Exception::Ts
                | Exception::Np
                | Exception::Ss
                | Exception::Gp
                | Exception::Pf
                | Exception::Ac
        )
    }

    /// True for the trap-class vectors whose RIP-on-delivery points *past*
    /// the instruction, not at it (`spec.md` §7 / Testable Property 3).
    pub fn is_trap_class(self) -> bool {
        matches!(self, Exception::Bp | Exception::Of | Exception::Db)
    }

    pub fn vector(self) -> u8 {
        self as u8
    }

    pub fn gp0() -> PendingEvent {
        PendingEvent::fault(Exception::Gp, Some(0))
    }

    pub fn gp(error_code: u32) -> PendingEvent {
        PendingEvent::fault(Exception::Gp, Some(error_code))
    }

    pub fn ud() -> PendingEvent {
        PendingEvent::fault(Exception::Ud, None)
    }

    pub fn nm() -> PendingEvent {
        PendingEvent::fault(Exception::Nm, None)
    }

    pub fn ss(error_code: u32) -> PendingEvent {
        PendingEvent::fault(Exception::Ss, Some(error_code))
    }

    pub fn np(error_code: u32) -> PendingEvent {
        PendingEvent::fault(Exception::Np, Some(error_code))
    }

    pub fn de() -> PendingEvent {
        PendingEvent::fault(Exception::De, None)
    }

    pub fn br() -> PendingEvent {
        PendingEvent::fault(Exception::Br, None)
    }

    pub fn ac0() -> PendingEvent {
        PendingEvent::fault(Exception::Ac, Some(0))
    }

    pub fn pf(error_code: u32, cr2: u64) -> PendingEvent {
        PendingEvent {
            vector: Exception::Pf,
            error_code: Some(error_code),
            cr2: Some(cr2),
            insn_len: 0,
        }
    }
}

/// What kind of IDT gate an interrupt/exception is delivered through; used
/// by `inject_swint` to validate software-interrupt injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateType {
    Interrupt16,
    Trap16,
    Task,
    Interrupt32,
    Trap32,
}

/// A fully-described pending architectural event, queued into `Ctxt` for the
/// caller to deliver. Distinct from `Exception` itself because the same
/// vector can carry different error codes/CR2 values per occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub vector: Exception,
    pub error_code: Option<u32>,
    pub cr2: Option<u64>,
    /// Length of the faulting instruction, when known; used by callers that
    /// need to distinguish "fault at" from "fault past".
    pub insn_len: u8,
}

impl PendingEvent {
    pub fn fault(vector: Exception, error_code: Option<u32>) -> PendingEvent {
        PendingEvent {
            vector,
            error_code,
            cr2: None,
            insn_len: 0,
        }
    }
}

/// The five-kind status every callback and every internal operation
/// propagates, `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulateStatus {
    /// Continue; for callbacks, "I handled this, proceed".
    Okay,
    /// A guest architectural exception was queued; see the `PendingEvent`
    /// returned alongside.
    Exception,
    /// Transient; caller should re-invoke the emulator from scratch.
    Retry,
    /// This instruction, or a required callback, is not supported. Caller
    /// must fall back to another mechanism.
    Unhandleable,
    /// Emulation was short-circuited (by `validate` or a callback); caller
    /// should commit register state as given and return.
    Done,
}

/// Internal result type threaded through decode/execute. `Ok` carries
/// whatever the operation produces on success; `Err` carries the emulator's
/// early-return reason and, for `Exception`, the event to queue.
pub type EmuResult<T> = Result<T, EmuError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmuError {
    #[error("guest exception: {0:?}")]
    Exception(PendingEvent),
    #[error("transient condition, caller should retry")]
    Retry,
    #[error("instruction or required callback unsupported")]
    Unhandleable,
    #[error("emulation short-circuited")]
    Done,
}

impl EmuError {
    pub fn status(self) -> EmulateStatus {
        match self {
            EmuError::Exception(_) => EmulateStatus::Exception,
            EmuError::Retry => EmulateStatus::Retry,
            EmuError::Unhandleable => EmulateStatus::Unhandleable,
            EmuError::Done => EmulateStatus::Done,
        }
    }

    pub fn event(self) -> Option<PendingEvent> {
        match self {
            EmuError::Exception(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PendingEvent> for EmuError {
    fn from(e: PendingEvent) -> Self {
        EmuError::Exception(e)
    }
}

/// Remaps `#XM` to `#UD` when `CR4.OSXMMEXCPT` is clear, `spec.md` §7's
/// single chokepoint for this rule. Every call site that might raise `#XM`
/// must route the outgoing event through this function rather than
/// constructing the `PendingEvent` directly.
pub fn remap_xm_if_masked(event: PendingEvent, osxmmexcpt: bool) -> PendingEvent {
    if event.vector == Exception::Xm && !osxmmexcpt {
        PendingEvent {
            vector: Exception::Ud,
            error_code: None,
            cr2: None,
            insn_len: event.insn_len,
        }
    } else {
        event
    }
}

/// Retire-side-effect flags `spec.md` §4.H / §3 describe: instructions that
/// ask the caller to apply something *after* the emulator returns `Okay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retire {
    pub hlt: bool,
    pub sti_blocked: bool,
    pub mov_ss_shadow: bool,
    pub singlestep: bool,
}
