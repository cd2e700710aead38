//! Process handle and virtual-memory access
//!
//! Every patch record operates through a [`Process`], which bundles the pid
//! with the memory operations the engine needs: reading and writing byte
//! ranges (with a protection override for code pages), allocating and
//! freeing executable memory with an optional address hint, and flushing
//! the instruction cache. The VEH-based hook flavors additionally require
//! the process to be the current one.

use crate::error::{HookError, Result};

const PROCESS_VM_OPERATION: u32 = 0x0008;
const PROCESS_VM_READ: u32 = 0x0010;
const PROCESS_VM_WRITE: u32 = 0x0020;
const PROCESS_QUERY_INFORMATION: u32 = 0x0400;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// handle to a process whose code is being patched
///
/// the handle is either the current-process pseudo handle (never closed)
/// or a real handle opened by [`Process::open`] (closed on drop).
pub struct Process {
    handle: *mut core::ffi::c_void,
    pid: u32,
    owns_handle: bool,
}

impl Process {
    /// get a handle to the current process
    pub fn current() -> Self {
        // SAFETY: both calls are infallible and return process-wide values
        unsafe {
            Self {
                handle: GetCurrentProcess(),
                pid: GetCurrentProcessId(),
                owns_handle: false,
            }
        }
    }

    /// open another process for patching
    pub fn open(pid: u32) -> Result<Self> {
        let access = PROCESS_VM_OPERATION
            | PROCESS_VM_READ
            | PROCESS_VM_WRITE
            | PROCESS_QUERY_INFORMATION;
        // SAFETY: OpenProcess validates the pid and access mask itself
        let handle = unsafe { OpenProcess(access, 0, pid) };
        if handle.is_null() {
            return Err(HookError::from_last_error("OpenProcess"));
        }
        Ok(Self {
            handle,
            pid,
            owns_handle: true,
        })
    }

    /// process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// check whether this handle refers to the current process
    pub fn is_current(&self) -> bool {
        // SAFETY: GetCurrentProcessId has no preconditions
        self.pid == unsafe { GetCurrentProcessId() }
    }

    pub(crate) fn raw_handle(&self) -> *mut core::ffi::c_void {
        self.handle
    }

    /// read `buf.len()` bytes starting at `address`
    pub fn read_bytes(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        let mut read = 0usize;
        // SAFETY: buf is valid for buf.len() writable bytes
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const _,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
                &mut read,
            )
        };
        if ok == 0 || read != buf.len() {
            return Err(HookError::from_last_error("ReadProcessMemory"));
        }
        Ok(())
    }

    /// read `len` bytes starting at `address` into a fresh buffer
    pub fn read_vec(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    /// read a little-endian pointer-sized cell, as stored in an
    /// indirect-jump slot
    pub fn read_ptr(&self, address: usize) -> Result<usize> {
        let mut buf = [0u8; core::mem::size_of::<usize>()];
        self.read_bytes(address, &mut buf)?;
        Ok(usize::from_le_bytes(buf))
    }

    /// write `bytes` at `address`, temporarily lifting page protection
    ///
    /// code pages are mapped read-execute; the write goes through a
    /// protect/write/restore sequence so it works on them as well as on
    /// the engine's own RWX trampoline pages.
    pub fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        let _guard = ProtectionGuard::new(self, address, bytes.len(), PAGE_EXECUTE_READWRITE)?;

        let mut written = 0usize;
        // SAFETY: bytes is valid for bytes.len() readable bytes
        let ok = unsafe {
            WriteProcessMemory(
                self.handle,
                address as *mut _,
                bytes.as_ptr() as *const _,
                bytes.len(),
                &mut written,
            )
        };
        if ok == 0 || written != bytes.len() {
            return Err(HookError::from_last_error("WriteProcessMemory"));
        }
        Ok(())
    }

    /// commit executable memory, optionally at a hinted address
    ///
    /// with a hint the allocation fails rather than falling back to an
    /// arbitrary address; the near-page scan in the trampoline allocator
    /// depends on that.
    pub fn alloc(&self, size: usize, hint: Option<usize>) -> Result<usize> {
        let hint_ptr = hint.unwrap_or(0) as *mut core::ffi::c_void;
        // SAFETY: a null hint lets the kernel pick the address
        let base = unsafe {
            VirtualAllocEx(
                self.handle,
                hint_ptr,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if base.is_null() {
            return Err(HookError::from_last_error("VirtualAllocEx"));
        }
        Ok(base as usize)
    }

    /// release memory previously returned by [`Process::alloc`]
    pub fn free(&self, base: usize) -> Result<()> {
        // SAFETY: caller passes a base obtained from alloc
        let ok = unsafe { VirtualFreeEx(self.handle, base as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(HookError::from_last_error("VirtualFreeEx"));
        }
        Ok(())
    }

    /// flush the instruction cache for a range of code
    pub fn flush_instruction_cache(&self, address: usize, size: usize) -> Result<()> {
        // SAFETY: FlushInstructionCache tolerates any range
        let ok = unsafe { FlushInstructionCache(self.handle, address as *const _, size) };
        if ok == 0 {
            return Err(HookError::from_last_error("FlushInstructionCache"));
        }
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.owns_handle {
            // SAFETY: handle came from OpenProcess and is only closed here
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

// SAFETY: the handle is a kernel object reference, valid from any thread
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

/// RAII guard lifting page protection for the duration of a write
struct ProtectionGuard<'p> {
    process: &'p Process,
    address: usize,
    size: usize,
    old_protection: u32,
}

impl<'p> ProtectionGuard<'p> {
    fn new(process: &'p Process, address: usize, size: usize, protection: u32) -> Result<Self> {
        let mut old_protection = 0u32;
        // SAFETY: VirtualProtectEx validates the range itself
        let ok = unsafe {
            VirtualProtectEx(
                process.handle,
                address as *mut _,
                size,
                protection,
                &mut old_protection,
            )
        };
        if ok == 0 {
            return Err(HookError::from_last_error("VirtualProtectEx"));
        }
        Ok(Self {
            process,
            address,
            size,
            old_protection,
        })
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        let mut tmp = 0u32;
        // SAFETY: restores the protection recorded at construction
        unsafe {
            VirtualProtectEx(
                self.process.handle,
                self.address as *mut _,
                self.size,
                self.old_protection,
                &mut tmp,
            );
        }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetCurrentProcess() -> *mut core::ffi::c_void;
    fn GetCurrentProcessId() -> u32;
    fn OpenProcess(access: u32, inherit: i32, pid: u32) -> *mut core::ffi::c_void;
    fn CloseHandle(handle: *mut core::ffi::c_void) -> i32;
    fn ReadProcessMemory(
        process: *mut core::ffi::c_void,
        address: *const core::ffi::c_void,
        buffer: *mut core::ffi::c_void,
        size: usize,
        read: *mut usize,
    ) -> i32;
    fn WriteProcessMemory(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        buffer: *const core::ffi::c_void,
        size: usize,
        written: *mut usize,
    ) -> i32;
    fn VirtualAllocEx(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        size: usize,
        allocation_type: u32,
        protection: u32,
    ) -> *mut core::ffi::c_void;
    fn VirtualFreeEx(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        size: usize,
        free_type: u32,
    ) -> i32;
    fn VirtualProtectEx(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        size: usize,
        protection: u32,
        old_protection: *mut u32,
    ) -> i32;
    fn FlushInstructionCache(
        process: *mut core::ffi::c_void,
        address: *const core::ffi::c_void,
        size: usize,
    ) -> i32;
}
