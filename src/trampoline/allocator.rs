//! Executable memory allocation within rel32 reach
//!
//! Trampolines and indirect-jump slots must be addressable with a 32-bit
//! displacement from the code that references them, so allocation takes an
//! anchor and scans nearby addresses page by page.
//!
//! The scan runs **forward first, then backward**. Some third-party
//! overlays resolve `JMP [RIP+disp32]` by hand and forget to sign-extend a
//! negative displacement (observed in Steam's 64-bit overlay DLL); placing
//! the slot above the jump sidesteps the bug whenever possible. A failed
//! forward pass logs a warning before falling back.

use crate::error::{HookError, Result};
use crate::process::Process;

// keep a margin below the architectural ±2 GiB limit so the displacement
// math of any instruction within the page still fits
#[cfg(target_arch = "x86_64")]
const REL32_REACH: usize = 0x7FFF_FF00;

/// executable memory owned by a patch record
///
/// acts as a bump buffer: [`write`](ExecutableMemory::write) appends at
/// the cursor. The backing pages are released when the value is dropped,
/// or never, if [`leak`](ExecutableMemory::leak) is called.
pub struct ExecutableMemory<'p> {
    process: &'p Process,
    base: usize,
    size: usize,
    used: usize,
}

impl<'p> ExecutableMemory<'p> {
    /// allocate executable memory at any address
    pub fn allocate(process: &'p Process, size: usize) -> Result<Self> {
        let size = round_to_page(size);
        let base = process.alloc(size, None)?;
        Ok(Self {
            process,
            base,
            size,
            used: 0,
        })
    }

    /// allocate executable memory whose base lies within rel32 reach of
    /// `anchor`, scanning forward first and backward second
    ///
    /// on x86 every address is within reach, so the scan collapses to a
    /// plain allocation.
    pub fn allocate_near(process: &'p Process, anchor: usize, size: usize) -> Result<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            let size = round_to_page(size);
            let info = system_info();
            let page = info.page_size as usize;
            let search_beg = core::cmp::max(
                anchor.saturating_sub(REL32_REACH),
                info.minimum_application_address as usize,
            );
            let search_end = core::cmp::min(
                anchor.saturating_add(REL32_REACH),
                info.maximum_application_address as usize,
            );

            let mut index = 0usize;
            while anchor + index < search_end {
                if let Some(mem) = Self::try_allocate_at(process, anchor, anchor + index, size) {
                    return Ok(mem);
                }
                index += page;
            }

            log::warn!(
                "no executable page above {anchor:#x}, falling back to backward scan; \
                 this may upset overlays that mis-resolve negative displacements"
            );

            let mut index = page;
            while anchor.wrapping_sub(index) > search_beg && index <= anchor {
                if let Some(mem) = Self::try_allocate_at(process, anchor, anchor - index, size) {
                    return Ok(mem);
                }
                index += page;
            }

            Err(HookError::NoReachablePage { anchor })
        }
        #[cfg(target_arch = "x86")]
        {
            let _ = anchor;
            Self::allocate(process, size)
        }
    }

    /// try one candidate address; the kernel rounds hints down to the
    /// allocation granularity, so re-check reach on what actually came back
    #[cfg(target_arch = "x86_64")]
    fn try_allocate_at(
        process: &'p Process,
        anchor: usize,
        hint: usize,
        size: usize,
    ) -> Option<Self> {
        let base = process.alloc(size, Some(hint)).ok()?;
        if anchor.abs_diff(base) >= REL32_REACH {
            let _ = process.free(base);
            return None;
        }
        Some(Self {
            process,
            base,
            size,
            used: 0,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// address the next write lands at
    pub fn cursor(&self) -> usize {
        self.base + self.used
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// append `code` at the cursor, returning the address it was written at
    pub fn write(&mut self, code: &[u8]) -> Result<usize> {
        if code.len() > self.size - self.used {
            return Err(HookError::Io {
                context: "trampoline buffer exhausted",
                code: 0,
            });
        }
        let at = self.cursor();
        self.process.write_bytes(at, code)?;
        self.used += code.len();
        Ok(at)
    }

    /// give up ownership without releasing the pages
    pub fn leak(self) -> usize {
        let base = self.base;
        core::mem::forget(self);
        base
    }
}

impl Drop for ExecutableMemory<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.process.free(self.base) {
            log::warn!("failed to free trampoline page at {:#x}: {}", self.base, err);
        }
    }
}

fn round_to_page(size: usize) -> usize {
    let page = system_info().page_size as usize;
    (size + page - 1) & !(page - 1)
}

fn system_info() -> SystemInfo {
    // SAFETY: GetSystemInfo fills the struct unconditionally
    unsafe {
        let mut info = core::mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

#[repr(C)]
struct SystemInfo {
    processor_architecture: u16,
    reserved: u16,
    page_size: u32,
    minimum_application_address: *mut core::ffi::c_void,
    maximum_application_address: *mut core::ffi::c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

#[link(name = "kernel32")]
extern "system" {
    fn GetSystemInfo(info: *mut SystemInfo);
}
