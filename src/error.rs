//! Unified error types for waylay

use core::fmt;

/// all errors that can occur while installing or removing hooks
#[derive(Debug)]
pub enum HookError {
    /// a non-calling thread's instruction pointer lies inside the range
    /// about to be rewritten or released
    ThreadInRange { thread_id: u32, address: usize },

    /// the decoder could not make sense of the bytes at the target
    DisassemblyFailed { address: usize },

    /// no free executable page exists within ±2 GiB of the anchor
    NoReachablePage { anchor: usize },

    /// all four debug registers of the calling thread are in use
    NoFreeDebugRegisters,

    /// AddVectoredExceptionHandler rejected the process-wide handler
    VehRegistrationFailed { code: u32 },

    /// the operation only works on the current process
    CrossProcessUnsupported { pid: u32 },

    /// a hook is already installed at this address
    AlreadyHooked { target: usize },

    /// a patch capability the backend does not provide
    Unimplemented { operation: &'static str },

    /// an OS memory or thread call was rejected
    Io { context: &'static str, code: u32 },
}

/// crate-wide result alias
pub type Result<T> = core::result::Result<T, HookError>;

impl HookError {
    /// build an `Io` error from the calling thread's last-error code
    pub(crate) fn from_last_error(context: &'static str) -> Self {
        // SAFETY: GetLastError has no preconditions
        let code = unsafe { GetLastError() };
        HookError::Io { context, code }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::ThreadInRange { thread_id, address } => write!(
                f,
                "thread {thread_id} is executing at {address:#x} inside the patch range"
            ),
            HookError::DisassemblyFailed { address } => {
                write!(f, "failed to disassemble instruction at {address:#x}")
            }
            HookError::NoReachablePage { anchor } => {
                write!(f, "no executable page available within ±2 GiB of {anchor:#x}")
            }
            HookError::NoFreeDebugRegisters => write!(f, "no free debug registers"),
            HookError::VehRegistrationFailed { code } => {
                write!(f, "AddVectoredExceptionHandler failed with code {code}")
            }
            HookError::CrossProcessUnsupported { pid } => {
                write!(f, "operation requires the current process, got pid {pid}")
            }
            HookError::AlreadyHooked { target } => {
                write!(f, "a hook is already installed at {target:#x}")
            }
            HookError::Unimplemented { operation } => {
                write!(f, "patch backend does not implement {operation}")
            }
            HookError::Io { context, code } => {
                write!(f, "{context} failed with code {code}")
            }
        }
    }
}

impl std::error::Error for HookError {}

#[link(name = "kernel32")]
extern "system" {
    fn GetLastError() -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let err = HookError::ThreadInRange {
            thread_id: 42,
            address: 0x1000,
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("0x1000"));

        let err = HookError::NoReachablePage { anchor: 0xdead0000 };
        assert!(err.to_string().contains("0xdead0000"));
    }
}
