//! Executable stub trampoline, `spec.md` §4.F / §9 option (c) / §5 resource
//! policy #2: for FPU/SIMD/BMI-family opcodes this crate does not
//! special-case inline, copy the instruction's own bytes (or a synthesized
//! VEX/XOP encoding with patched operand registers) into a writable
//! executable scratch page, append a `ret`, and call it.
//!
//! Gated behind the `stub-exec` feature (x86_64-only); with the feature
//! disabled, every caller sees [`EmulateStatus::Unhandleable`] instead.
//!
//! [`EmulateStatus::Unhandleable`]: crate::exception::EmulateStatus::Unhandleable

#![cfg(feature = "stub-exec")]

use crate::exception::{EmuError, EmuResult};
use crate::ops::StubPage;

/// Acquire-on-entry / release-on-every-exit-path guard around one stub
/// invocation (`spec.md` §9's RAII-equivalent pattern for the shared
/// per-thread stub page).
pub struct StubGuard<'a> {
    page: &'a mut dyn StubPage,
    released: bool,
}

impl<'a> StubGuard<'a> {
    pub fn acquire(page: &'a mut dyn StubPage) -> EmuResult<StubGuard<'a>> {
        page.get_stub()?;
        Ok(StubGuard { page, released: false })
    }

    fn release(&mut self) {
        if !self.released {
            self.page.put_stub();
            self.released = true;
        }
    }
}

impl<'a> Drop for StubGuard<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A machine-code trampoline: `template` is the raw instruction bytes
/// (already prefix/opcode/modrm/imm complete) to execute, operating on
/// values already placed in the appropriate host registers/memory by the
/// caller before invoking [`exec_stub`].
pub struct Trampoline<'a> {
    pub template: &'a [u8],
}

/// Copies `trampoline.template` plus a flags-capturing epilogue into the
/// stub page and executes it, returning the resulting RFLAGS arithmetic-six
/// bits.
/// `inputs`/`outputs` are caller-managed via whatever calling convention the
/// specific opcode family needs (BMI/TBM/ADX stubs pass operands in
/// registers per their VEX/XOP encoding; FPU/SIMD stubs operate on memory
/// operands already materialized by the caller) — this function's job is
/// strictly the copy-patch-append-ret-invoke mechanics, not operand
/// marshalling, which callers in `exec/` handle per instruction family.
///
/// # Safety
/// The caller must guarantee `trampoline.template` is a valid, complete
/// x86_64 instruction encoding with no control-transfer or privileged forms,
/// and that any registers/memory it touches are already set up correctly;
/// this function makes the page executable and jumps into it verbatim.
pub unsafe fn exec_stub(guard: &mut StubGuard<'_>, trampoline: Trampoline<'_>) -> EmuResult<u64> {
    let page = guard.page.get_stub()?;
    let len = trampoline.template.len();
    // Append `pushfq; pop rax; ret` so the trampoline's own return value
    // (read by the `extern "C" fn() -> u64` call below, per the SysV
    // return-in-rax convention) carries the RFLAGS the instruction just
    // set, mirroring the source's save/restore-EFLAGS envelope.
    let epilogue = [0x9Cu8, 0x58, 0xC3];
    if len + epilogue.len() > page.len() {
        return Err(EmuError::Unhandleable);
    }
    page[..len].copy_from_slice(trampoline.template);
    page[len..len + epilogue.len()].copy_from_slice(&epilogue);

    let flags: u64;
    let entry = page.as_ptr();
    #[cfg(target_arch = "x86_64")]
    {
        let func: extern "C" fn() -> u64 = core::mem::transmute(entry);
        flags = func();
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = entry;
        return Err(EmuError::Unhandleable);
    }
    Ok(flags & crate::state::Eflags::ARITH.bits())
}
