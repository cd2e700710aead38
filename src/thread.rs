//! Thread enumeration, contexts, and stop-the-world suspension
//!
//! Patching live code means making sure nobody is standing on it. This
//! module provides the pieces: a toolhelp-based iterator over the target
//! process's threads, a [`Thread`] handle with suspend/resume and context
//! access, the [`SuspendedProcess`] guard that freezes every thread except
//! the caller for the duration of a rewrite, and the quiescence check that
//! rejects a patch while some thread's instruction pointer is inside the
//! bytes about to change.

use crate::error::{HookError, Result};
use crate::process::Process;

const TH32CS_SNAPTHREAD: u32 = 0x0000_0004;
const INVALID_HANDLE_VALUE: *mut core::ffi::c_void = -1isize as *mut _;

pub(crate) const THREAD_SUSPEND_RESUME: u32 = 0x0002;
pub(crate) const THREAD_GET_CONTEXT: u32 = 0x0008;
pub(crate) const THREAD_SET_CONTEXT: u32 = 0x0010;
pub(crate) const THREAD_QUERY_INFORMATION: u32 = 0x0040;

#[cfg(target_arch = "x86_64")]
pub(crate) const CONTEXT_CONTROL: u32 = 0x0010_0001;
#[cfg(target_arch = "x86")]
pub(crate) const CONTEXT_CONTROL: u32 = 0x0001_0001;

#[cfg(target_arch = "x86_64")]
pub(crate) const CONTEXT_DEBUG_REGISTERS: u32 = 0x0010_0010;
#[cfg(target_arch = "x86")]
pub(crate) const CONTEXT_DEBUG_REGISTERS: u32 = 0x0001_0010;

/// current thread id
pub fn current_thread_id() -> u32 {
    // SAFETY: GetCurrentThreadId has no preconditions
    unsafe { GetCurrentThreadId() }
}

/// CONTEXT binding, covering the integer state the engine touches
///
/// the layout must match winnt.h exactly; the tail holds the FP/vector
/// state the engine never reads but GetThreadContext may still fill.
#[repr(C, align(16))]
#[cfg(target_arch = "x86_64")]
pub struct ThreadContext {
    p1_home: u64,
    p2_home: u64,
    p3_home: u64,
    p4_home: u64,
    p5_home: u64,
    p6_home: u64,
    pub(crate) context_flags: u32,
    mx_csr: u32,
    seg_cs: u16,
    seg_ds: u16,
    seg_es: u16,
    seg_fs: u16,
    seg_gs: u16,
    seg_ss: u16,
    pub(crate) eflags: u32,
    dr0: u64,
    dr1: u64,
    dr2: u64,
    dr3: u64,
    dr6: u64,
    dr7: u64,
    rax: u64,
    rcx: u64,
    rdx: u64,
    rbx: u64,
    rsp: u64,
    rbp: u64,
    rsi: u64,
    rdi: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    // XSAVE area, vector registers, and the debug-control tail
    reserved: [u8; 976],
}

#[repr(C)]
#[cfg(target_arch = "x86")]
pub struct ThreadContext {
    pub(crate) context_flags: u32,
    dr0: u32,
    dr1: u32,
    dr2: u32,
    dr3: u32,
    dr6: u32,
    dr7: u32,
    float_save: [u8; 112],
    seg_gs: u32,
    seg_fs: u32,
    seg_es: u32,
    seg_ds: u32,
    edi: u32,
    esi: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    ebp: u32,
    eip: u32,
    seg_cs: u32,
    pub(crate) eflags: u32,
    esp: u32,
    seg_ss: u32,
    extended_registers: [u8; 512],
}

impl ThreadContext {
    /// zero-initialized context requesting the given register classes
    pub(crate) fn zeroed(flags: u32) -> Self {
        // SAFETY: the CONTEXT layout is plain integer data, zero is valid
        let mut ctx: Self = unsafe { core::mem::zeroed() };
        ctx.context_flags = flags;
        ctx
    }

    pub(crate) fn instruction_pointer(&self) -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip as usize
        }
        #[cfg(target_arch = "x86")]
        {
            self.eip as usize
        }
    }

    pub(crate) fn set_instruction_pointer(&mut self, ip: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip = ip as u64;
        }
        #[cfg(target_arch = "x86")]
        {
            self.eip = ip as u32;
        }
    }

    /// read Dr0..Dr3 by index
    pub(crate) fn dr(&self, index: u32) -> usize {
        match index {
            0 => self.dr0 as usize,
            1 => self.dr1 as usize,
            2 => self.dr2 as usize,
            _ => self.dr3 as usize,
        }
    }

    /// write Dr0..Dr3 by index
    pub(crate) fn set_dr(&mut self, index: u32, value: usize) {
        let value = value as _;
        match index {
            0 => self.dr0 = value,
            1 => self.dr1 = value,
            2 => self.dr2 = value,
            _ => self.dr3 = value,
        }
    }

    pub(crate) fn dr6(&self) -> usize {
        self.dr6 as usize
    }

    pub(crate) fn set_dr6(&mut self, value: usize) {
        self.dr6 = value as _;
    }

    pub(crate) fn dr7(&self) -> usize {
        self.dr7 as usize
    }

    pub(crate) fn set_dr7(&mut self, value: usize) {
        self.dr7 = value as _;
    }
}

/// thread entry from a toolhelp snapshot
#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub thread_id: u32,
    pub owner_process_id: u32,
}

/// iterator over the threads of one process
pub struct ThreadIterator {
    snapshot: *mut core::ffi::c_void,
    first: bool,
    target_pid: u32,
}

impl ThreadIterator {
    /// snapshot the threads of `pid`
    ///
    /// the snapshot is system-wide; entries belonging to other processes
    /// are filtered out during iteration.
    pub fn new(pid: u32) -> Result<Self> {
        // SAFETY: CreateToolhelp32Snapshot is safe with valid flags
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(HookError::from_last_error("CreateToolhelp32Snapshot"));
        }
        Ok(Self {
            snapshot,
            first: true,
            target_pid: pid,
        })
    }
}

impl Iterator for ThreadIterator {
    type Item = ThreadEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let mut entry = ThreadEntry32 {
            size: core::mem::size_of::<ThreadEntry32>() as u32,
            ..Default::default()
        };

        loop {
            // SAFETY: snapshot is valid, entry is correctly sized
            let ok = if self.first {
                self.first = false;
                unsafe { Thread32First(self.snapshot, &mut entry) }
            } else {
                unsafe { Thread32Next(self.snapshot, &mut entry) }
            };
            if ok == 0 {
                return None;
            }
            if entry.owner_process_id == self.target_pid {
                return Some(ThreadEntry {
                    thread_id: entry.thread_id,
                    owner_process_id: entry.owner_process_id,
                });
            }
        }
    }
}

impl Drop for ThreadIterator {
    fn drop(&mut self) {
        if self.snapshot != INVALID_HANDLE_VALUE {
            // SAFETY: snapshot is a valid handle owned by this iterator
            unsafe {
                CloseHandle(self.snapshot);
            }
        }
    }
}

/// open handle to a single thread
pub struct Thread {
    handle: *mut core::ffi::c_void,
    tid: u32,
}

impl Thread {
    /// open a thread with the given access mask
    pub fn open(tid: u32, access: u32) -> Result<Self> {
        // SAFETY: OpenThread validates tid and access itself
        let handle = unsafe { OpenThread(access, 0, tid) };
        if handle.is_null() {
            return Err(HookError::from_last_error("OpenThread"));
        }
        Ok(Self { handle, tid })
    }

    pub fn id(&self) -> u32 {
        self.tid
    }

    /// increment the thread's suspend count
    pub fn suspend(&self) -> Result<()> {
        // SAFETY: handle was opened with THREAD_SUSPEND_RESUME
        let prev = unsafe { SuspendThread(self.handle) };
        if prev == u32::MAX {
            return Err(HookError::from_last_error("SuspendThread"));
        }
        Ok(())
    }

    /// decrement the thread's suspend count
    pub fn resume(&self) -> Result<()> {
        // SAFETY: handle was opened with THREAD_SUSPEND_RESUME
        let prev = unsafe { ResumeThread(self.handle) };
        if prev == u32::MAX {
            return Err(HookError::from_last_error("ResumeThread"));
        }
        Ok(())
    }

    /// read the thread's context for the requested register classes
    pub(crate) fn context(&self, flags: u32) -> Result<ThreadContext> {
        let mut ctx = ThreadContext::zeroed(flags);
        // SAFETY: ctx is a correctly sized and aligned CONTEXT
        let ok = unsafe { GetThreadContext(self.handle, &mut ctx) };
        if ok == 0 {
            return Err(HookError::from_last_error("GetThreadContext"));
        }
        Ok(ctx)
    }

    /// write back a context previously read with [`Thread::context`]
    pub(crate) fn set_context(&self, ctx: &ThreadContext) -> Result<()> {
        // SAFETY: ctx holds a valid CONTEXT for this architecture
        let ok = unsafe { SetThreadContext(self.handle, ctx) };
        if ok == 0 {
            return Err(HookError::from_last_error("SetThreadContext"));
        }
        Ok(())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // SAFETY: handle came from OpenThread and is only closed here
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

/// stop-the-world guard: suspends every thread of the target process
/// except the calling one, and resumes them when dropped
///
/// threads that exit between the snapshot and the suspension are skipped.
#[must_use]
pub struct SuspendedProcess {
    threads: Vec<Thread>,
}

impl SuspendedProcess {
    pub fn new(process: &Process) -> Result<Self> {
        let caller = current_thread_id();
        let mut threads = Vec::new();
        for entry in ThreadIterator::new(process.pid())? {
            if entry.thread_id == caller {
                continue;
            }
            let thread = match Thread::open(entry.thread_id, THREAD_SUSPEND_RESUME) {
                Ok(thread) => thread,
                // gone already
                Err(_) => continue,
            };
            if thread.suspend().is_ok() {
                threads.push(thread);
            }
        }
        Ok(Self { threads })
    }
}

impl Drop for SuspendedProcess {
    fn drop(&mut self) {
        for thread in self.threads.iter().rev() {
            if let Err(err) = thread.resume() {
                log::warn!("failed to resume thread {}: {}", thread.id(), err);
            }
        }
    }
}

/// fail if any non-calling thread's instruction pointer lies inside
/// `[start, start + len)`
///
/// callers hold a [`SuspendedProcess`] guard across this check and the
/// write it protects; otherwise a thread could wander into the range
/// after the check.
pub(crate) fn verify_threads_not_in_range(
    process: &Process,
    start: usize,
    len: usize,
) -> Result<()> {
    let caller = current_thread_id();
    for entry in ThreadIterator::new(process.pid())? {
        if entry.thread_id == caller {
            continue;
        }
        let thread = match Thread::open(
            entry.thread_id,
            THREAD_GET_CONTEXT | THREAD_QUERY_INFORMATION,
        ) {
            Ok(thread) => thread,
            Err(_) => continue,
        };
        let ctx = match thread.context(CONTEXT_CONTROL) {
            Ok(ctx) => ctx,
            Err(_) => continue,
        };
        let ip = ctx.instruction_pointer();
        if ip >= start && ip < start + len {
            return Err(HookError::ThreadInRange {
                thread_id: entry.thread_id,
                address: ip,
            });
        }
    }
    Ok(())
}

#[link(name = "kernel32")]
extern "system" {
    fn GetCurrentThreadId() -> u32;
    fn CreateToolhelp32Snapshot(flags: u32, pid: u32) -> *mut core::ffi::c_void;
    fn Thread32First(snapshot: *mut core::ffi::c_void, entry: *mut ThreadEntry32) -> i32;
    fn Thread32Next(snapshot: *mut core::ffi::c_void, entry: *mut ThreadEntry32) -> i32;
    fn CloseHandle(handle: *mut core::ffi::c_void) -> i32;
    fn OpenThread(access: u32, inherit: i32, tid: u32) -> *mut core::ffi::c_void;
    fn SuspendThread(thread: *mut core::ffi::c_void) -> u32;
    fn ResumeThread(thread: *mut core::ffi::c_void) -> u32;
    fn GetThreadContext(thread: *mut core::ffi::c_void, ctx: *mut ThreadContext) -> i32;
    fn SetThreadContext(thread: *mut core::ffi::c_void, ctx: *const ThreadContext) -> i32;
}

#[repr(C)]
#[derive(Default)]
struct ThreadEntry32 {
    size: u32,
    usage: u32,
    thread_id: u32,
    owner_process_id: u32,
    base_priority: i32,
    delta_priority: i32,
    flags: u32,
}
