//! Trampoline memory and prologue relocation
//!
//! [`allocator`] finds executable pages within rel32 reach of an anchor;
//! [`generator`] relocates a function's displaced prologue into such a
//! page and appends the jump back into the original body.

pub mod allocator;
pub(crate) mod generator;

pub use allocator::ExecutableMemory;
