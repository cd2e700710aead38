//! Prologue relocation and jump emission
//!
//! The relocator stream-decodes the target's first instructions and copies
//! them into the trampoline buffer, rewriting every IP-relative JMP/CALL so
//! it still reaches its original destination from the new address. It stops
//! at the first instruction boundary at or past the requested overwrite
//! length, then appends a jump back to the first byte it did not displace.
//!
//! Instructions with RIP-relative *data* operands (`MOV rax, [RIP+d]` and
//! friends) are copied verbatim; a prologue that loads data relative to its
//! own address will read the wrong cell from inside the trampoline.

use crate::asm::decode::{self, BranchKind, BranchOperand};
use crate::asm::emit;
use crate::error::Result;
use crate::process::Process;
use crate::trampoline::allocator::ExecutableMemory;

/// longest legal x86 instruction
pub(crate) const MAX_INSTRUCTION_LEN: usize = 15;

/// how far the relocator reads ahead of the target
pub(crate) const PROLOGUE_SCAN_LEN: usize = MAX_INSTRUCTION_LEN * 3;

/// a prologue jump decided ahead of the overwrite
///
/// planning is separate from writing so the caller knows the exact byte
/// count to relocate and snapshot before anything is touched.
pub(crate) struct PlannedJump<'p> {
    pub bytes: Vec<u8>,
    pub slot: Option<ExecutableMemory<'p>>,
}

/// relocate at least `min_len` bytes of the function at `target` into
/// `tramp` and append the jump back to `target + consumed`
///
/// returns the number of source bytes consumed, which is `min_len` rounded
/// up to the next instruction boundary.
pub(crate) fn relocate_prologue<'p>(
    process: &'p Process,
    target: usize,
    min_len: usize,
    tramp: &mut ExecutableMemory<'p>,
    aux: &mut Vec<ExecutableMemory<'p>>,
) -> Result<usize> {
    let buf = process.read_vec(target, PROLOGUE_SCAN_LEN)?;

    let mut consumed = 0usize;
    while consumed < min_len {
        let insn = decode::decode_one(&buf[consumed..], (target + consumed) as u64)?;
        match insn.branch {
            Some((kind, operand)) => {
                let dest = match operand {
                    BranchOperand::Relative { target } => target as usize,
                    // the slot the original jump reads survives the hook,
                    // follow it now so the trampoline can get its own
                    BranchOperand::RipIndirect { cell } => process.read_ptr(cell as usize)?,
                };
                log::trace!(
                    "relocating {:?} at {:#x} -> {:#x}",
                    kind,
                    target + consumed,
                    dest
                );
                match kind {
                    BranchKind::Jump => write_jump(process, tramp, dest, aux, true)?,
                    BranchKind::Call => write_call(process, tramp, dest, aux)?,
                };
            }
            None => {
                tramp.write(&buf[consumed..consumed + insn.len])?;
            }
        }
        consumed += insn.len;
    }

    log::trace!(
        "relocated {consumed} bytes from {target:#x}, jumping back to {:#x}",
        target + consumed
    );
    write_jump(process, tramp, target + consumed, aux, true)?;

    process.flush_instruction_cache(tramp.base(), tramp.size())?;
    Ok(consumed)
}

/// emit a jump from the buffer's cursor to `dest`
///
/// tries rel32, then an indirect jump through a freshly allocated near
/// slot, then (when permitted) the 14-byte PUSH/MOV/RET sequence that
/// needs no allocation at all.
pub(crate) fn write_jump<'p>(
    process: &'p Process,
    mem: &mut ExecutableMemory<'p>,
    dest: usize,
    aux: &mut Vec<ExecutableMemory<'p>>,
    push_ret_fallback: bool,
) -> Result<usize> {
    let at = mem.cursor();
    if emit::is_near(at, dest) {
        mem.write(&emit::jmp_rel32(at, dest))?;
        return Ok(emit::JMP_REL32_LEN);
    }
    match alloc_slot(process, at, dest) {
        Ok(slot) => {
            mem.write(&emit::jmp_indirect(at, slot.base()))?;
            aux.push(slot);
            Ok(emit::JMP_INDIRECT_LEN)
        }
        Err(err) if push_ret_fallback => {
            log::trace!("no reachable slot for jump at {at:#x} ({err}), using push/ret");
            if dest <= u32::MAX as usize {
                mem.write(&emit::push_ret(dest as u32))?;
                Ok(emit::PUSH_RET_LEN)
            } else {
                mem.write(&emit::push_mov_ret(dest as u64))?;
                Ok(emit::PUSH_MOV_RET_LEN)
            }
        }
        Err(err) => Err(err),
    }
}

/// emit a call from the buffer's cursor to `dest`
///
/// calls have no PUSH/RET spelling that preserves the return address, so
/// a far destination without a reachable slot is an error.
pub(crate) fn write_call<'p>(
    process: &'p Process,
    mem: &mut ExecutableMemory<'p>,
    dest: usize,
    aux: &mut Vec<ExecutableMemory<'p>>,
) -> Result<usize> {
    let at = mem.cursor();
    if emit::is_near(at, dest) {
        mem.write(&emit::call_rel32(at, dest))?;
        return Ok(emit::JMP_REL32_LEN);
    }
    let slot = alloc_slot(process, at, dest)?;
    mem.write(&emit::call_indirect(at, slot.base()))?;
    aux.push(slot);
    Ok(emit::JMP_INDIRECT_LEN)
}

/// decide the jump that will overwrite the prologue at `at`
pub(crate) fn plan_jump<'p>(
    process: &'p Process,
    at: usize,
    dest: usize,
) -> Result<PlannedJump<'p>> {
    if emit::is_near(at, dest) {
        log::trace!("prologue jump {at:#x} -> {dest:#x} is near, using rel32");
        return Ok(PlannedJump {
            bytes: emit::jmp_rel32(at, dest).to_vec(),
            slot: None,
        });
    }
    match alloc_slot(process, at, dest) {
        Ok(slot) => {
            log::trace!(
                "prologue jump {at:#x} -> {dest:#x} goes through slot {:#x}",
                slot.base()
            );
            Ok(PlannedJump {
                bytes: emit::jmp_indirect(at, slot.base()).to_vec(),
                slot: Some(slot),
            })
        }
        Err(err) => {
            log::trace!("prologue jump {at:#x} -> {dest:#x} has no slot ({err}), using push/ret");
            let bytes = if dest <= u32::MAX as usize {
                emit::push_ret(dest as u32).to_vec()
            } else {
                emit::push_mov_ret(dest as u64).to_vec()
            };
            Ok(PlannedJump { bytes, slot: None })
        }
    }
}

/// allocate a page near `anchor` and plant the absolute destination in its
/// first pointer-sized cell
fn alloc_slot<'p>(
    process: &'p Process,
    anchor: usize,
    dest: usize,
) -> Result<ExecutableMemory<'p>> {
    let mut slot = ExecutableMemory::allocate_near(process, anchor, core::mem::size_of::<usize>())?;
    slot.write(&dest.to_le_bytes())?;
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::decode::{decode_one, BranchKind, BranchOperand};

    fn exec_buf<'p>(process: &'p Process, bytes: &[u8]) -> ExecutableMemory<'p> {
        let mut mem = ExecutableMemory::allocate(process, 0x1000).expect("should allocate");
        mem.write(bytes).expect("should write");
        mem
    }

    #[test]
    fn test_straightline_prologue_copied_verbatim() {
        let process = Process::current();
        // mov [rsp+8], rbx; mov [rsp+10h], rsi; push rdi; sub rsp, 20h
        // (decodes identically enough on x86 to stay position-independent)
        let prologue = [
            0x48, 0x89, 0x5C, 0x24, 0x08, 0x48, 0x89, 0x74, 0x24, 0x10, 0x57, 0x48, 0x83, 0xEC,
            0x20, 0x90, 0x90, 0x90,
        ];
        let src = exec_buf(&process, &prologue);

        let mut tramp = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        let consumed =
            relocate_prologue(&process, src.base(), 5, &mut tramp, &mut aux).expect("relocate");

        // the first instruction is 5 bytes, so 5 in, 5 copied
        assert_eq!(consumed, 5);
        assert!(aux.is_empty());
        let copied = process.read_vec(tramp.base(), 5).unwrap();
        assert_eq!(copied, prologue[..5]);

        // jump back lands at src + consumed
        let back = decode_one(
            &process.read_vec(tramp.base() + 5, 5).unwrap(),
            (tramp.base() + 5) as u64,
        )
        .unwrap();
        assert_eq!(
            back.branch,
            Some((
                BranchKind::Jump,
                BranchOperand::Relative {
                    target: (src.base() + 5) as u64
                }
            ))
        );
    }

    #[test]
    fn test_overwrite_grows_to_instruction_boundary() {
        let process = Process::current();
        // push; push; 5-byte mov rsp-form straddling the 5-byte minimum
        let prologue = [
            0x57, // push rdi
            0x56, // push rsi
            0x48, 0x83, 0xEC, 0x20, // sub rsp, 0x20
            0x90, 0x90, 0x90, 0x90,
        ];
        let src = exec_buf(&process, &prologue);

        let mut tramp = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        let consumed =
            relocate_prologue(&process, src.base(), 5, &mut tramp, &mut aux).expect("relocate");

        // 1 + 1 + 4 on x86 would be 6 too; boundary rounding includes the
        // instruction that straddles byte five
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_jmp_rel8_rewritten_to_original_destination() {
        let process = Process::current();
        // jmp +10, then filler the minimum length forces in
        let prologue = [0xEB, 0x0A, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
        let src = exec_buf(&process, &prologue);
        let expected_dest = src.base() + 2 + 10;

        let mut tramp = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        relocate_prologue(&process, src.base(), 5, &mut tramp, &mut aux).expect("relocate");

        let first = decode_one(
            &process.read_vec(tramp.base(), MAX_INSTRUCTION_LEN).unwrap(),
            tramp.base() as u64,
        )
        .unwrap();
        assert_eq!(
            first.branch,
            Some((
                BranchKind::Jump,
                BranchOperand::Relative {
                    target: expected_dest as u64
                }
            ))
        );
    }

    #[test]
    fn test_call_rel32_rewritten() {
        let process = Process::current();
        // call +0x100 followed by filler
        let prologue = [0xE8, 0x00, 0x01, 0x00, 0x00, 0x90, 0x90, 0x90];
        let src = exec_buf(&process, &prologue);
        let expected_dest = src.base() + 5 + 0x100;

        let mut tramp = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        relocate_prologue(&process, src.base(), 5, &mut tramp, &mut aux).expect("relocate");

        let first = decode_one(
            &process.read_vec(tramp.base(), MAX_INSTRUCTION_LEN).unwrap(),
            tramp.base() as u64,
        )
        .unwrap();
        assert_eq!(
            first.branch,
            Some((
                BranchKind::Call,
                BranchOperand::Relative {
                    target: expected_dest as u64
                }
            ))
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_rip_indirect_jump_gets_fresh_slot() {
        let process = Process::current();
        // jmp qword ptr [rip+0] with the cell holding a far destination,
        // the import-thunk shape
        let far_dest = 0x7FFF_DEAD_0000usize;
        let mut prologue = vec![0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
        prologue.extend_from_slice(&far_dest.to_le_bytes());
        let src = exec_buf(&process, &prologue);

        let mut tramp = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        let consumed =
            relocate_prologue(&process, src.base(), 6, &mut tramp, &mut aux).expect("relocate");
        assert_eq!(consumed, 6);

        // the trampoline must not reuse the original cell: it reads the
        // destination through a slot of its own
        let first = decode_one(
            &process.read_vec(tramp.base(), MAX_INSTRUCTION_LEN).unwrap(),
            tramp.base() as u64,
        )
        .unwrap();
        match first.branch {
            Some((BranchKind::Jump, BranchOperand::RipIndirect { cell })) => {
                assert_ne!(cell as usize, src.base() + 6);
                assert_eq!(process.read_ptr(cell as usize).unwrap(), far_dest);
                assert_eq!(aux.len(), 1);
            }
            other => panic!("expected a RIP-indirect jump, got {other:?}"),
        }
    }

    #[test]
    fn test_write_jump_near_uses_rel32() {
        let process = Process::current();
        let mut mem = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        let dest = mem.base() + 0x800;
        let len = write_jump(&process, &mut mem, dest, &mut aux, false).unwrap();
        assert_eq!(len, emit::JMP_REL32_LEN);
        assert!(aux.is_empty());
        assert_eq!(process.read_vec(mem.base(), 1).unwrap()[0], 0xE9);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_write_jump_far_allocates_slot_within_reach() {
        let process = Process::current();
        let mut mem = ExecutableMemory::allocate(&process, 0x1000).unwrap();
        let mut aux = Vec::new();
        let at = mem.cursor();
        let dest = at.wrapping_add(0x2_0000_0000);
        let len = write_jump(&process, &mut mem, dest, &mut aux, true).unwrap();
        assert_eq!(len, emit::JMP_INDIRECT_LEN);
        assert_eq!(aux.len(), 1);
        // reach property: the slot displacement fits rel32
        assert!(at.abs_diff(aux[0].base()) <= 0x7FFF_FFFF - 6);
        assert_eq!(process.read_ptr(aux[0].base()).unwrap(), dest);
    }
}
