//! Detour patch: prologue jump plus trampoline
//!
//! `apply` rewrites the target's first bytes into a jump to the detour and
//! builds a trampoline holding the displaced prologue followed by a jump
//! back into the original body. Calling the trampoline behaves like calling
//! the unhooked function.
//!
//! The trampoline is *not* freed by `remove`: a thread that
//! entered the detour just before removal may still be on its way back
//! through the trampoline. It is released on the next `apply` — by which
//! point the caller has had the chance to wait on the [`ref_count`]
//! reaching zero — or when the record is dropped.
//!
//! [`ref_count`]: PatchDetour::ref_count

use core::sync::atomic::AtomicU32;

use crate::asm::emit;
use crate::error::{HookError, Result};
use crate::process::Process;
use crate::thread::{self, SuspendedProcess};
use crate::trampoline::allocator::ExecutableMemory;
use crate::trampoline::generator::{self, PlannedJump};

/// capability set of a patch flavor
///
/// the four hook points every flavor fills in: how many target bytes the
/// patch claims, how it is written and removed, and whether another hook
/// can be stacked on top of it afterwards. The defaults reject the
/// operation, so a flavor that forgets one fails loudly instead of
/// mis-hooking.
pub(crate) trait PatchBackend {
    /// bytes of the target the patch claims; the relocator consumes at
    /// least this many
    fn patch_size(core: &mut DetourCore<'_>) -> Result<usize> {
        let _ = core;
        Err(HookError::Unimplemented {
            operation: "patch_size",
        })
    }

    /// install the redirect; the prologue snapshot and quiescence check
    /// have already happened
    fn write_patch(core: &mut DetourCore<'_>) -> Result<()> {
        let _ = core;
        Err(HookError::Unimplemented {
            operation: "write_patch",
        })
    }

    /// undo the redirect
    fn remove_patch(core: &mut DetourCore<'_>) -> Result<()> {
        let _ = core;
        Err(HookError::Unimplemented {
            operation: "remove_patch",
        })
    }

    /// whether a second hook may be installed atop this one without
    /// breaking this hook's trampoline
    fn can_hook_chain() -> Result<bool> {
        Err(HookError::Unimplemented {
            operation: "can_hook_chain",
        })
    }
}

/// state shared by every detour-style patch flavor
pub(crate) struct DetourCore<'p> {
    pub(crate) process: &'p Process,
    pub(crate) target: usize,
    pub(crate) detour: usize,
    pub(crate) applied: bool,
    pub(crate) detached: bool,
    pub(crate) orig: Vec<u8>,
    pub(crate) trampoline: Option<ExecutableMemory<'p>>,
    pub(crate) aux: Vec<ExecutableMemory<'p>>,
    pub(crate) pending_jump: Option<PlannedJump<'p>>,
    pub(crate) ref_count: AtomicU32,
}

impl<'p> DetourCore<'p> {
    pub(crate) fn new(process: &'p Process, target: usize, detour: usize) -> Self {
        Self {
            process,
            target,
            detour,
            applied: false,
            detached: false,
            orig: Vec::new(),
            trampoline: None,
            aux: Vec::new(),
            pending_jump: None,
            ref_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn apply<B: PatchBackend>(&mut self) -> Result<()> {
        if self.applied {
            return Ok(());
        }
        if self.detached {
            log::warn!("apply on a detached patch at {:#x} ignored", self.target);
            return Ok(());
        }

        // the previous trampoline is released here, not in remove; see the
        // module docs for the in-flight-detour race this avoids
        self.trampoline = None;
        self.aux.clear();

        let result = self.apply_world_stopped::<B>();
        if result.is_err() {
            self.pending_jump = None;
            self.trampoline = None;
            self.aux.clear();
            self.orig.clear();
        }
        result
    }

    fn apply_world_stopped<B: PatchBackend>(&mut self) -> Result<()> {
        let _world = SuspendedProcess::new(self.process)?;

        let patch_len = B::patch_size(self)?;
        log::trace!(
            "applying patch: target={:#x} detour={:#x} patch_len={}",
            self.target,
            self.detour,
            patch_len
        );

        let mut tramp =
            ExecutableMemory::allocate_near(self.process, self.target, TRAMPOLINE_ALLOC)
                .or_else(|_| ExecutableMemory::allocate(self.process, TRAMPOLINE_ALLOC))?;
        let prologue_len = generator::relocate_prologue(
            self.process,
            self.target,
            patch_len,
            &mut tramp,
            &mut self.aux,
        )?;
        log::trace!("trampoline at {:#x}", tramp.base());

        self.orig = self.process.read_vec(self.target, patch_len)?;
        thread::verify_threads_not_in_range(self.process, self.target, self.orig.len())?;
        self.trampoline = Some(tramp);

        B::write_patch(self)?;
        self.process
            .flush_instruction_cache(self.target, prologue_len)?;

        self.applied = true;
        Ok(())
    }

    pub(crate) fn remove<B: PatchBackend>(&mut self) -> Result<()> {
        if !self.applied {
            return Ok(());
        }

        let _world = SuspendedProcess::new(self.process)?;

        thread::verify_threads_not_in_range(self.process, self.target, self.orig.len())?;
        // detoured callees may still be inside the trampoline
        if let Some(tramp) = &self.trampoline {
            thread::verify_threads_not_in_range(self.process, tramp.base(), tramp.size())?;
        }

        B::remove_patch(self)?;
        self.process
            .flush_instruction_cache(self.target, self.orig.len())?;

        self.applied = false;
        Ok(())
    }

    pub(crate) fn detach(&mut self) {
        self.applied = false;
        self.detached = true;
    }

    /// best-effort removal for `Drop`: failures are logged, the record is
    /// disarmed, and live code memory is leaked rather than freed under a
    /// still-installed hook
    pub(crate) fn drop_cleanup<B: PatchBackend>(&mut self) {
        if self.detached {
            // the redirect stays in place forever; so must the code it
            // jumps through
            self.leak_code_memory();
            return;
        }
        if let Err(err) = self.remove::<B>() {
            log::error!(
                "leaving patch at {:#x} applied: removal failed during drop: {}",
                self.target,
                err
            );
            self.applied = false;
            self.orig.clear();
            self.leak_code_memory();
        }
    }

    fn leak_code_memory(&mut self) {
        for mem in self.aux.drain(..) {
            mem.leak();
        }
        if let Some(tramp) = self.trampoline.take() {
            tramp.leak();
        }
        if let Some(plan) = self.pending_jump.take() {
            if let Some(slot) = plan.slot {
                slot.leak();
            }
        }
    }

    pub(crate) fn trampoline_ptr(&self) -> Option<usize> {
        self.trampoline.as_ref().map(|t| t.base())
    }
}

const TRAMPOLINE_ALLOC: usize = 0x1000;

/// jump-detour backend: the classic prologue overwrite
pub(crate) struct JumpBackend;

impl PatchBackend for JumpBackend {
    fn patch_size(core: &mut DetourCore<'_>) -> Result<usize> {
        // plan the exact jump now so the relocated length always covers
        // the bytes the overwrite will touch, 14-byte fallback included
        let plan = generator::plan_jump(core.process, core.target, core.detour)?;
        let len = plan.bytes.len();
        core.pending_jump = Some(plan);
        Ok(len)
    }

    fn write_patch(core: &mut DetourCore<'_>) -> Result<()> {
        let plan = match core.pending_jump.take() {
            Some(plan) => plan,
            None => generator::plan_jump(core.process, core.target, core.detour)?,
        };
        core.process.write_bytes(core.target, &plan.bytes)?;
        if let Some(slot) = plan.slot {
            core.aux.push(slot);
        }
        Ok(())
    }

    fn remove_patch(core: &mut DetourCore<'_>) -> Result<()> {
        core.process.write_bytes(core.target, &core.orig)
    }

    fn can_hook_chain() -> Result<bool> {
        Ok(true)
    }
}

/// jump-detour patch
///
/// ```ignore
/// let process = Process::current();
/// let mut patch = PatchDetour::new(&process, target_fn as usize, my_detour as usize);
/// unsafe { patch.apply()? };
/// let original: extern "system" fn(u32) -> u32 =
///     unsafe { core::mem::transmute(patch.trampoline_ptr().unwrap()) };
/// ```
pub struct PatchDetour<'p> {
    core: DetourCore<'p>,
}

impl<'p> PatchDetour<'p> {
    /// create an inert detour record
    pub fn new(process: &'p Process, target: usize, detour: usize) -> Self {
        Self {
            core: DetourCore::new(process, target, detour),
        }
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

    /// minimum prologue bytes the overwrite claims: 5 when the detour is
    /// within rel32 reach of the target, 6 for the indirect-slot form
    ///
    /// instruction-boundary rounding and the 14-byte fallback can enlarge
    /// the actual overwrite.
    pub fn patch_size(&self) -> usize {
        if emit::is_near(self.core.target, self.core.detour) {
            emit::JMP_REL32_LEN
        } else {
            emit::JMP_INDIRECT_LEN
        }
    }

    /// install the hook
    ///
    /// no-op if already applied or detached.
    ///
    /// # Safety
    /// `target` must be the entry of a function whose prologue tolerates
    /// being overwritten, and `detour` must be a function of a compatible
    /// signature and calling convention.
    pub unsafe fn apply(&mut self) -> Result<()> {
        self.core.apply::<JumpBackend>()
    }

    /// restore the original prologue; the trampoline stays mapped
    ///
    /// no-op if not applied.
    ///
    /// # Safety
    /// same contract as [`apply`](Self::apply).
    pub unsafe fn remove(&mut self) -> Result<()> {
        self.core.remove::<JumpBackend>()
    }

    /// permanently disarm the record; the target is never touched again
    pub fn detach(&mut self) {
        self.core.detach();
    }

    /// entry of the trampoline, valid while the record lives
    ///
    /// transmute it to the original function's signature to call through.
    /// `None` before the first `apply`.
    pub fn trampoline_ptr(&self) -> Option<usize> {
        self.core.trampoline_ptr()
    }

    /// user-managed count of in-flight detour invocations
    ///
    /// the engine never reads it; increment on detour entry and decrement
    /// on exit, then wait for zero before dropping the record.
    pub fn ref_count(&self) -> &AtomicU32 {
        &self.core.ref_count
    }

    /// a further hook can be stacked on an applied jump detour
    pub fn can_hook_chain(&self) -> bool {
        matches!(JumpBackend::can_hook_chain(), Ok(true))
    }
}

impl Drop for PatchDetour<'_> {
    fn drop(&mut self) {
        self.core.drop_cleanup::<JumpBackend>();
    }
}
