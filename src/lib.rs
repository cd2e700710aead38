#![cfg(windows)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)] // we document safety in # Safety sections

//! waylay: in-process function hooking for x86/x64 Windows
//!
//! Rewrites a live function's prologue so calls divert to a replacement,
//! while a generated trampoline keeps the original callable:
//!
//! - Prologue disassembly and relocation, fixing up IP-relative JMP/CALL
//!   operands so they still reach their destinations
//! - Trampoline pages allocated within ±2 GiB of the target, scanning
//!   forward before backward
//! - Stop-the-world installation with quiescence checks: no write lands
//!   while another thread's instruction pointer is inside the patch window
//! - Four strategies under one lifecycle: raw byte overwrite, jump detour,
//!   INT3 breakpoint, and hardware breakpoint, the latter two served by a
//!   process-wide vectored exception handler
//!
//! # Example
//!
//! ```ignore
//! use waylay::{PatchDetour, Process};
//!
//! static mut ORIGINAL: usize = 0;
//!
//! extern "system" fn my_detour(x: u32) -> u32 {
//!     let original: extern "system" fn(u32) -> u32 =
//!         unsafe { core::mem::transmute(ORIGINAL) };
//!     original(x) + 1
//! }
//!
//! let process = Process::current();
//! let mut patch = PatchDetour::new(&process, target as usize, my_detour as usize);
//! unsafe {
//!     patch.apply()?;
//!     ORIGINAL = patch.trampoline_ptr().unwrap();
//! }
//! // the hook is removed on drop; detach() makes it permanent instead
//! ```
//!
//! Hooking is process-wide surgery: source and target must share ISA and
//! bitness, and the INT3/DR flavors require the current process.

pub mod asm;
pub mod error;
pub mod patch;
pub mod process;
pub mod thread;
pub mod trampoline;

pub use error::{HookError, Result};
pub use patch::veh::remove_exception_handler;
pub use patch::{PatchDetour, PatchDr, PatchInt3, PatchRaw};
pub use process::Process;
pub use thread::SuspendedProcess;
pub use trampoline::ExecutableMemory;
