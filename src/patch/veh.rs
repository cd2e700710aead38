//! Process-wide vectored exception dispatcher
//!
//! One handler serves every INT3 and debug-register hook in the process.
//! It is registered on first demand and stays until
//! [`remove_exception_handler`] is called at module unload.
//!
//! Two maps back the dispatch: hooked target address → detour address, and
//! thread id → debug-register slot in use by that thread. Both sit behind
//! a single reader-writer lock; the exception paths take it shared,
//! install and uninstall take it exclusive. The lock is the slim
//! SRW-backed `std::sync::RwLock`, which does not starve writers behind a
//! stream of readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Once, OnceLock, RwLock};

use crate::error::{HookError, Result};
use crate::thread::{self, ThreadContext};

const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

// EFLAGS resume flag: suppresses the instruction breakpoint for exactly
// one instruction so execution can move past the hooked address
const RESUME_FLAG: u32 = 1 << 16;

pub(crate) struct VehMaps {
    /// hooked target address → detour address
    pub(crate) hooks_by_address: HashMap<usize, usize>,
    /// thread id → debug-register index (0–3) that thread hooks with
    pub(crate) dr_by_thread: HashMap<u32, u32>,
}

/// the single lock guarding both maps
pub(crate) fn maps() -> &'static RwLock<VehMaps> {
    static MAPS: OnceLock<RwLock<VehMaps>> = OnceLock::new();
    MAPS.get_or_init(|| {
        RwLock::new(VehMaps {
            hooks_by_address: HashMap::new(),
            dr_by_thread: HashMap::new(),
        })
    })
}

static REGISTER: Once = Once::new();
static HANDLER_HANDLE: AtomicUsize = AtomicUsize::new(0);
static REGISTER_ERROR: AtomicU32 = AtomicU32::new(0);

/// register the process-wide handler exactly once
pub(crate) fn ensure_handler() -> Result<()> {
    REGISTER.call_once(|| {
        // first = 1: run ahead of frame-based handlers
        // SAFETY: dispatcher is a valid handler for the process lifetime
        let handle = unsafe { AddVectoredExceptionHandler(1, dispatcher) };
        if handle.is_null() {
            // SAFETY: GetLastError has no preconditions
            REGISTER_ERROR.store(unsafe { GetLastError() }, Ordering::Release);
        } else {
            HANDLER_HANDLE.store(handle as usize, Ordering::Release);
        }
    });
    if HANDLER_HANDLE.load(Ordering::Acquire) == 0 {
        return Err(HookError::VehRegistrationFailed {
            code: REGISTER_ERROR.load(Ordering::Acquire),
        });
    }
    Ok(())
}

/// unregister the process-wide handler
///
/// intended for module teardown, after every INT3/DR patch has been
/// removed; hooks left installed afterwards fault straight through to
/// whatever handler comes next.
pub fn remove_exception_handler() {
    let handle = HANDLER_HANDLE.swap(0, Ordering::AcqRel);
    if handle != 0 {
        // SAFETY: handle came from AddVectoredExceptionHandler
        unsafe {
            RemoveVectoredExceptionHandler(handle as *mut _);
        }
    }
}

/// insert a hook record, rejecting a second hook on the same address
pub(crate) fn insert_hook(target: usize, detour: usize) -> Result<()> {
    let mut maps = maps().write().unwrap_or_else(|e| e.into_inner());
    if maps.hooks_by_address.contains_key(&target) {
        return Err(HookError::AlreadyHooked { target });
    }
    maps.hooks_by_address.insert(target, detour);
    Ok(())
}

pub(crate) fn remove_hook(target: usize) {
    let mut maps = maps().write().unwrap_or_else(|e| e.into_inner());
    maps.hooks_by_address.remove(&target);
}

extern "system" fn dispatcher(info: *mut ExceptionPointers) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // SAFETY: the OS hands us valid pointers for the faulting thread
    let (record, context) = unsafe {
        let info = &*info;
        (&*info.exception_record, &mut *info.context_record)
    };

    match record.exception_code {
        EXCEPTION_BREAKPOINT => handle_breakpoint(record, context),
        EXCEPTION_SINGLE_STEP => handle_single_step(record, context),
        _ => EXCEPTION_CONTINUE_SEARCH,
    }
}

/// `#BP`: an INT3 hook fired
///
/// the breakpoint byte sits exactly where the call landed, so redirecting
/// the instruction pointer at the detour is the whole job; the stack
/// already looks like a fresh call.
fn handle_breakpoint(record: &ExceptionRecord, context: &mut ThreadContext) -> i32 {
    let maps = maps().read().unwrap_or_else(|e| e.into_inner());
    let target = record.exception_address as usize;
    match maps.hooks_by_address.get(&target) {
        Some(&detour) => {
            context.set_instruction_pointer(detour);
            EXCEPTION_CONTINUE_EXECUTION
        }
        None => EXCEPTION_CONTINUE_SEARCH,
    }
}

/// `#DB`: a debug-register hook may have fired
///
/// only claim the exception when the faulting address is hooked, the
/// current thread owns a debug-register slot, and Dr6 confirms that slot
/// triggered; anything else belongs to a debugger or another tool.
fn handle_single_step(record: &ExceptionRecord, context: &mut ThreadContext) -> i32 {
    let maps = maps().read().unwrap_or_else(|e| e.into_inner());
    let target = record.exception_address as usize;
    let Some(&detour) = maps.hooks_by_address.get(&target) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let Some(&dr_index) = maps.dr_by_thread.get(&thread::current_thread_id()) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    if context.dr6() & (1 << dr_index) == 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    context.set_dr6(0);
    context.eflags |= RESUME_FLAG;
    context.set_instruction_pointer(detour);
    EXCEPTION_CONTINUE_EXECUTION
}

#[repr(C)]
struct ExceptionRecord {
    exception_code: u32,
    exception_flags: u32,
    next_record: *mut ExceptionRecord,
    exception_address: *mut core::ffi::c_void,
    number_parameters: u32,
    exception_information: [usize; 15],
}

#[repr(C)]
struct ExceptionPointers {
    exception_record: *mut ExceptionRecord,
    context_record: *mut ThreadContext,
}

#[link(name = "kernel32")]
extern "system" {
    fn AddVectoredExceptionHandler(
        first: u32,
        handler: extern "system" fn(*mut ExceptionPointers) -> i32,
    ) -> *mut core::ffi::c_void;
    fn RemoveVectoredExceptionHandler(handle: *mut core::ffi::c_void) -> u32;
    fn GetLastError() -> u32;
}
