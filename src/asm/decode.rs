//! Single-instruction decoding for the relocator
//!
//! Thin wrapper over the iced-x86 decoder that answers the one question
//! the relocator asks: is this instruction an unconditional JMP or a CALL
//! whose operand is IP-relative, and if so, where does it really go?
//!
//! Recognized shapes:
//! - rel8/rel16/rel32 immediate JMP and CALL — the absolute destination is
//!   `ip + len + sign_extend(imm)`, which iced computes for us
//! - `JMP`/`CALL qword ptr [RIP+disp32]` (x64) — the operand names an
//!   8-byte cell holding the destination; the cell address is reported so
//!   the caller can read through it
//!
//! Everything else (including conditional branches and indirect transfers
//! through registers) is position-independent as far as this engine is
//! concerned and gets copied verbatim.

use iced_x86::{Decoder, DecoderOptions, MemorySize, Mnemonic, OpKind};

use crate::error::{HookError, Result};

#[cfg(target_arch = "x86_64")]
const BITNESS: u32 = 64;
#[cfg(target_arch = "x86")]
const BITNESS: u32 = 32;

/// control-transfer flavor of a recognized branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Jump,
    Call,
}

/// where a recognized branch points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOperand {
    /// rel-immediate form; `target` is the resolved absolute destination
    Relative { target: u64 },
    /// `[RIP+disp32]` form; `cell` is the address of the 8-byte slot
    /// holding the destination
    RipIndirect { cell: u64 },
}

/// one decoded instruction, classified for relocation
#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn {
    /// encoded length in bytes
    pub len: usize,
    /// set when the instruction is a JMP/CALL the relocator must rewrite
    pub branch: Option<(BranchKind, BranchOperand)>,
}

/// decode the instruction at the start of `bytes`, which lives at virtual
/// address `ip`
///
/// decoding against the real address matters: iced resolves relative
/// displacements while decoding, so the reported targets are absolute.
pub fn decode_one(bytes: &[u8], ip: u64) -> Result<DecodedInsn> {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(HookError::DisassemblyFailed { address: ip as usize });
    }

    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(HookError::DisassemblyFailed { address: ip as usize });
    }

    let kind = match insn.mnemonic() {
        Mnemonic::Jmp => Some(BranchKind::Jump),
        Mnemonic::Call => Some(BranchKind::Call),
        _ => None,
    };

    let branch = kind.and_then(|kind| match insn.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Some((
            kind,
            BranchOperand::Relative {
                target: insn.near_branch_target(),
            },
        )),
        OpKind::Memory
            if insn.is_ip_rel_memory_operand() && insn.memory_size() == MemorySize::UInt64 =>
        {
            Some((
                kind,
                BranchOperand::RipIndirect {
                    cell: insn.ip_rel_memory_address(),
                },
            ))
        }
        _ => None,
    });

    Ok(DecodedInsn {
        len: insn.len(),
        branch,
    })
}
