//! Patch records
//!
//! Four hook strategies under one lifecycle: a record is created inert,
//! becomes *applied* by `apply`, returns to inert by `remove`, and goes
//! permanently inert by `detach`. Dropping an applied record removes it
//! best-effort; a detached record never touches target memory again.
//!
//! - [`PatchRaw`] — plain byte overwrite with an original-bytes stash
//! - [`PatchDetour`] — prologue jump to a detour, with a trampoline that
//!   re-enters the original function
//! - [`PatchInt3`] — single `0xCC` byte, redirected by the process-wide
//!   vectored exception handler
//! - [`PatchDr`] — hardware execute breakpoint on the calling thread,
//!   redirected by the same handler

pub mod detour;
pub mod dr;
pub mod int3;
pub mod raw;
pub mod veh;

pub use detour::PatchDetour;
pub use dr::PatchDr;
pub use int3::PatchInt3;
pub use raw::PatchRaw;
