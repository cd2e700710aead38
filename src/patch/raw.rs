//! Byte-for-byte overwrite patch

use crate::error::Result;
use crate::process::Process;
use crate::thread::{self, SuspendedProcess};

/// raw patch: writes a fixed byte string over the target, stashing what
/// was there for removal
///
/// both `apply` and `remove` are idempotent and run under a full
/// stop-the-world with the target range quiesced.
pub struct PatchRaw<'p> {
    process: &'p Process,
    target: usize,
    data: Vec<u8>,
    orig: Vec<u8>,
    applied: bool,
    detached: bool,
}

impl<'p> PatchRaw<'p> {
    /// create an inert record; nothing is written until [`apply`](Self::apply)
    pub fn new(process: &'p Process, target: usize, data: Vec<u8>) -> Self {
        Self {
            process,
            target,
            data,
            orig: Vec::new(),
            applied: false,
            detached: false,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// write the patch bytes over the target
    ///
    /// # Safety
    /// `target` must be a valid address of at least `data.len()` bytes in
    /// the patched process, and rewriting them must be sound for whatever
    /// code or data lives there.
    pub unsafe fn apply(&mut self) -> Result<()> {
        if self.applied {
            return Ok(());
        }
        if self.detached {
            log::warn!("apply on a detached patch at {:#x} ignored", self.target);
            return Ok(());
        }

        let _world = SuspendedProcess::new(self.process)?;
        thread::verify_threads_not_in_range(self.process, self.target, self.data.len())?;

        self.orig = self.process.read_vec(self.target, self.data.len())?;
        self.process.write_bytes(self.target, &self.data)?;
        self.process
            .flush_instruction_cache(self.target, self.data.len())?;

        self.applied = true;
        Ok(())
    }

    /// restore the stashed original bytes
    ///
    /// # Safety
    /// same contract as [`apply`](Self::apply).
    pub unsafe fn remove(&mut self) -> Result<()> {
        if !self.applied {
            return Ok(());
        }

        let _world = SuspendedProcess::new(self.process)?;
        thread::verify_threads_not_in_range(self.process, self.target, self.orig.len())?;

        self.process.write_bytes(self.target, &self.orig)?;
        self.process
            .flush_instruction_cache(self.target, self.orig.len())?;

        self.applied = false;
        Ok(())
    }

    /// permanently disarm the record; the target is never touched again
    pub fn detach(&mut self) {
        self.applied = false;
        self.detached = true;
    }
}

impl Drop for PatchRaw<'_> {
    fn drop(&mut self) {
        // SAFETY: same addresses apply validated; errors are only logged
        if let Err(err) = unsafe { self.remove() } {
            log::error!(
                "leaving raw patch at {:#x} applied: removal failed during drop: {}",
                self.target,
                err
            );
            self.applied = false;
            self.orig.clear();
            self.data.clear();
        }
    }
}
