//! Hardware-breakpoint patch via debug registers
//!
//! Zero bytes of the target change: a free debug register of the calling
//! thread is pointed at the target as an execute breakpoint, and the
//! process-wide dispatcher redirects the resulting `#DB` to the detour.
//!
//! Known limitations of the technique:
//! one hook per thread, only the calling thread is hooked, any other user
//! of the debug registers is stepped on, and the thread-id bookkeeping
//! does not survive thread-id reuse. Removal validates that the recorded
//! slot still belongs to the calling thread before touching anything.

use core::sync::atomic::AtomicU32;

use crate::error::{HookError, Result};
use crate::patch::detour::{DetourCore, PatchBackend};
use crate::patch::veh;
use crate::process::Process;
use crate::thread::{
    self, Thread, CONTEXT_DEBUG_REGISTERS, THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION,
    THREAD_SET_CONTEXT,
};

// Dr7 bit 8: local-exact enable
const DR7_LOCAL_EXACT: usize = 1 << 8;

const DR_ACCESS: u32 = THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION;

/// debug-register backend
pub(crate) struct DrBackend;

impl PatchBackend for DrBackend {
    fn patch_size(_core: &mut DetourCore<'_>) -> Result<usize> {
        // nothing is overwritten, but claiming one byte makes the
        // relocator produce a trampoline that jumps over the breakpoint
        Ok(1)
    }

    fn write_patch(core: &mut DetourCore<'_>) -> Result<()> {
        let mut maps = veh::maps().write().unwrap_or_else(|e| e.into_inner());

        if maps.hooks_by_address.contains_key(&core.target) {
            return Err(HookError::AlreadyHooked {
                target: core.target,
            });
        }
        maps.hooks_by_address.insert(core.target, core.detour);

        let result = arm_current_thread(&mut maps, core.target);
        if result.is_err() {
            maps.hooks_by_address.remove(&core.target);
        }
        result
    }

    fn remove_patch(core: &mut DetourCore<'_>) -> Result<()> {
        let mut maps = veh::maps().write().unwrap_or_else(|e| e.into_inner());

        let tid = thread::current_thread_id();
        let Some(&dr_index) = maps.dr_by_thread.get(&tid) else {
            // the slot record is gone, most likely thread-id reuse after
            // the hooking thread exited; nothing of ours is left to clear
            log::warn!(
                "no debug-register slot recorded for thread {tid}, dropping hook entry only"
            );
            maps.hooks_by_address.remove(&core.target);
            return Ok(());
        };

        let thread = Thread::open(tid, DR_ACCESS)?;
        let mut ctx = thread.context(CONTEXT_DEBUG_REGISTERS)?;
        ctx.set_dr(dr_index, 0);
        ctx.set_dr7(ctx.dr7() & !(1 << (2 * dr_index)));
        thread.set_context(&ctx)?;

        maps.dr_by_thread.remove(&tid);
        maps.hooks_by_address.remove(&core.target);
        Ok(())
    }

    fn can_hook_chain() -> Result<bool> {
        Ok(false)
    }
}

/// pick a free debug register on the calling thread and point it at
/// `target` as a one-byte execute breakpoint
fn arm_current_thread(maps: &mut veh::VehMaps, target: usize) -> Result<()> {
    let tid = thread::current_thread_id();
    if maps.dr_by_thread.contains_key(&tid) {
        // one hook per thread: a second would orphan the first
        return Err(HookError::AlreadyHooked { target });
    }

    let thread = Thread::open(tid, DR_ACCESS)?;
    let mut ctx = thread.context(CONTEXT_DEBUG_REGISTERS)?;

    // free means: local-enable bit clear in Dr7 *and* the register itself
    // zero; the second check guards against tools that park an address
    // without enabling it
    let dr_index = (0..4u32).find(|&i| {
        ctx.dr7() & (1 << (2 * i)) == 0 && ctx.dr(i) == 0
    });
    let Some(dr_index) = dr_index else {
        return Err(HookError::NoFreeDebugRegisters);
    };

    maps.dr_by_thread.insert(tid, dr_index);

    ctx.set_dr(dr_index, target);
    // L<i> local enable; RW<i> = 00 (execute) and LEN<i> = 00 (one byte)
    // stay clear; bit 8 is the architectural local-exact enable
    ctx.set_dr7(ctx.dr7() | (1 << (2 * dr_index)) | DR7_LOCAL_EXACT);

    if let Err(err) = thread.set_context(&ctx) {
        maps.dr_by_thread.remove(&tid);
        return Err(err);
    }
    Ok(())
}

/// hardware-breakpoint patch for the calling thread
///
/// only calls made *by the hooking thread* are redirected; other threads
/// run the unmodified target. The trampoline works as with the other
/// detour flavors.
pub struct PatchDr<'p> {
    core: DetourCore<'p>,
}

impl<'p> PatchDr<'p> {
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

    /// nominal patch size; no target bytes actually change
    pub fn patch_size(&self) -> usize {
        1
    }

    /// arm the breakpoint on the calling thread
    ///
    /// # Safety
    /// `target` must be the entry of a function, and `detour` a function
    /// of compatible signature and calling convention.
    pub unsafe fn apply(&mut self) -> Result<()> {
        self.core.apply::<DrBackend>()
    }

    /// clear the breakpoint
    ///
    /// must run on the thread that applied the hook.
    ///
    /// # Safety
    /// same contract as [`apply`](Self::apply).
    pub unsafe fn remove(&mut self) -> Result<()> {
        self.core.remove::<DrBackend>()
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

    /// debug-register hooks cannot be stacked
    pub fn can_hook_chain(&self) -> bool {
        matches!(DrBackend::can_hook_chain(), Ok(true))
    }
}

impl Drop for PatchDr<'_> {
    fn drop(&mut self) {
        self.core.drop_cleanup::<DrBackend>();
    }
}
