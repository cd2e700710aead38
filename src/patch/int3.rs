//! INT3 software-breakpoint patch

use core::sync::atomic::AtomicU32;

use crate::error::{HookError, Result};
use crate::patch::detour::{DetourCore, PatchBackend};
use crate::patch::veh;
use crate::process::Process;

/// int3 backend: one `0xCC` byte, dispatched through the vectored handler
pub(crate) struct Int3Backend;

impl PatchBackend for Int3Backend {
    fn patch_size(_core: &mut DetourCore<'_>) -> Result<usize> {
        // 0xCC
        Ok(1)
    }

    fn write_patch(core: &mut DetourCore<'_>) -> Result<()> {
        veh::insert_hook(core.target, core.detour)?;
        if let Err(err) = core.process.write_bytes(core.target, &[0xCC]) {
            veh::remove_hook(core.target);
            return Err(err);
        }
        Ok(())
    }

    fn remove_patch(core: &mut DetourCore<'_>) -> Result<()> {
        core.process.write_bytes(core.target, &core.orig)?;
        veh::remove_hook(core.target);
        Ok(())
    }

    fn can_hook_chain() -> Result<bool> {
        // the dispatcher never re-executes the overwritten byte, so a
        // second hook on the same address has nothing to chain through
        Ok(false)
    }
}

/// software-breakpoint patch: writes `0xCC` at the target and redirects
/// the resulting `#BP` to the detour
///
/// current-process only. A trampoline is still generated from the bytes
/// under the breakpoint, so the detour can call the original through
/// [`trampoline_ptr`](Self::trampoline_ptr) exactly as with [`PatchDetour`].
///
/// [`PatchDetour`]: crate::patch::PatchDetour
pub struct PatchInt3<'p> {
    core: DetourCore<'p>,
}

impl<'p> PatchInt3<'p> {
    /// create an inert record, registering the process-wide exception
    /// handler on first use
    pub fn new(process: &'p Process, target: usize, detour: usize) -> Result<Self> {
        if !process.is_current() {
            return Err(HookError::CrossProcessUnsupported {
                pid: process.pid(),
            });
        }
        veh::ensure_handler()?;
        Ok(Self {
            core: DetourCore::new(process, target, detour),
        })
    }

    pub fn target(&self) -> usize {
        self.core.target
    }

    pub fn detour(&self) -> usize {
        self.core.detour
    }

    pub fn is_applied(&self) -> bool {
        self.core.applied
    }

    /// bytes overwritten at the target
    pub fn patch_size(&self) -> usize {
        1
    }

    /// install the breakpoint
    ///
    /// # Safety
    /// `target` must be the entry of a function, and `detour` a function
    /// of compatible signature and calling convention; the dispatcher
    /// transfers control to it with the call-site stack intact.
    pub unsafe fn apply(&mut self) -> Result<()> {
        self.core.apply::<Int3Backend>()
    }

    /// restore the original byte and drop the dispatch entry
    ///
    /// # Safety
    /// same contract as [`apply`](Self::apply).
    pub unsafe fn remove(&mut self) -> Result<()> {
        self.core.remove::<Int3Backend>()
    }

    /// permanently disarm the record; the target is never touched again
    pub fn detach(&mut self) {
        self.core.detach();
    }

    /// entry of the trampoline; `None` before the first `apply`
    pub fn trampoline_ptr(&self) -> Option<usize> {
        self.core.trampoline_ptr()
    }

    /// user-managed count of in-flight detour invocations
    pub fn ref_count(&self) -> &AtomicU32 {
        &self.core.ref_count
    }

    /// INT3 hooks cannot be stacked
    pub fn can_hook_chain(&self) -> bool {
        matches!(Int3Backend::can_hook_chain(), Ok(true))
    }
}

impl Drop for PatchInt3<'_> {
    fn drop(&mut self) {
        self.core.drop_cleanup::<Int3Backend>();
    }
}
