#![cfg(windows)]

//! End-to-end jump-detour and raw-patch tests against live code.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use waylay::trampoline::ExecutableMemory;
use waylay::{HookError, PatchDetour, PatchRaw, Process};

/// patching rewrites process-wide state; run one test at a time
fn serialize() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

// a straight-line x64 prologue with no IP-relative instructions:
// mov [rsp+8], rbx; mov [rsp+10h], rsi; push rdi; sub rsp, 20h; nops
const PLAIN_PROLOGUE: [u8; 16] = [
    0x48, 0x89, 0x5C, 0x24, 0x08, 0x48, 0x89, 0x74, 0x24, 0x10, 0x57, 0x48, 0x83, 0xEC, 0x20,
    0x90,
];

fn prologue_buffer<'p>(process: &'p Process) -> ExecutableMemory<'p> {
    let mut mem = ExecutableMemory::allocate(process, 0x1000).expect("should allocate");
    mem.write(&PLAIN_PROLOGUE).expect("should write");
    mem
}

#[test]
fn rel32_detour_writes_five_byte_jump() {
    let _guard = serialize();
    let process = Process::current();
    let buf = prologue_buffer(&process);
    let target = buf.base();
    // within the same page, trivially near
    let detour = buf.base() + 0x800;

    let mut patch = PatchDetour::new(&process, target, detour);
    assert_eq!(patch.patch_size(), 5);
    assert!(patch.can_hook_chain());
    assert!(patch.trampoline_ptr().is_none());

    unsafe { patch.apply() }.expect("should apply");
    assert!(patch.is_applied());

    // prologue now carries E9 <disp32> pointing at the detour
    let written = process.read_vec(target, 5).unwrap();
    assert_eq!(written[0], 0xE9);
    let disp = i32::from_le_bytes(written[1..5].try_into().unwrap());
    assert_eq!((target as i64 + 5 + disp as i64) as usize, detour);

    // the trampoline starts with the five displaced bytes verbatim
    let tramp = patch.trampoline_ptr().expect("applied patch has trampoline");
    assert_eq!(process.read_vec(tramp, 5).unwrap(), PLAIN_PROLOGUE[..5]);

    // and continues with the jump back to target + 5
    let back = process.read_vec(tramp + 5, 5).unwrap();
    assert_eq!(back[0], 0xE9);
    let disp = i32::from_le_bytes(back[1..5].try_into().unwrap());
    assert_eq!((tramp as i64 + 5 + 5 + disp as i64) as usize, target + 5);

    unsafe { patch.remove() }.expect("should remove");
    assert!(!patch.is_applied());
    assert_eq!(process.read_vec(target, 16).unwrap(), PLAIN_PROLOGUE);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn far_detour_goes_through_indirect_slot() {
    let _guard = serialize();
    let process = Process::current();
    let buf = prologue_buffer(&process);
    let target = buf.base();
    // four gigabytes away, out of rel32 reach; never called
    let detour = target.wrapping_add(0x1_0000_0000);

    let mut patch = PatchDetour::new(&process, target, detour);
    assert_eq!(patch.patch_size(), 6);

    unsafe { patch.apply() }.expect("should apply");

    // FF 25 <disp32> reading an 8-byte slot that holds the detour
    let written = process.read_vec(target, 6).unwrap();
    assert_eq!(&written[..2], &[0xFF, 0x25]);
    let disp = i32::from_le_bytes(written[2..6].try_into().unwrap());
    let slot = (target as i64 + 6 + disp as i64) as usize;
    assert_eq!(process.read_ptr(slot).unwrap(), detour);
    // reach property, and the forward scan keeps the slot at or above the
    // target modulo allocation-granularity rounding
    assert!(target.abs_diff(slot) <= 0x7FFF_FFFF - 6);
    assert!(slot + 0x10000 > target);

    unsafe { patch.remove() }.expect("should remove");
    assert_eq!(process.read_vec(target, 16).unwrap(), PLAIN_PROLOGUE);
}

#[inline(never)]
extern "system" fn live_add(a: u32, b: u32) -> u32 {
    std::hint::black_box(a).wrapping_add(std::hint::black_box(b))
}

static LIVE_TRAMPOLINE: AtomicUsize = AtomicUsize::new(0);

extern "system" fn live_add_detour(a: u32, b: u32) -> u32 {
    let original: extern "system" fn(u32, u32) -> u32 =
        unsafe { std::mem::transmute(LIVE_TRAMPOLINE.load(Ordering::Acquire)) };
    original(a, b).wrapping_add(1000)
}

#[test]
fn live_function_roundtrip() {
    let _guard = serialize();
    let process = Process::current();
    let f = std::hint::black_box(live_add as extern "system" fn(u32, u32) -> u32);
    assert_eq!(f(2, 3), 5);

    let target = live_add as usize;
    let before = process.read_vec(target, 16).unwrap();

    let mut patch = PatchDetour::new(&process, target, live_add_detour as usize);
    unsafe { patch.apply() }.expect("should apply");
    LIVE_TRAMPOLINE.store(patch.trampoline_ptr().unwrap(), Ordering::Release);

    // calls divert through the detour, which calls back through the
    // trampoline
    assert_eq!(f(2, 3), 1005);

    // the trampoline alone behaves like the unhooked function
    let original: extern "system" fn(u32, u32) -> u32 =
        unsafe { std::mem::transmute(patch.trampoline_ptr().unwrap()) };
    assert_eq!(original(2, 3), 5);

    // apply on an applied record is a no-op
    unsafe { patch.apply() }.expect("reapply is a no-op");
    assert_eq!(f(2, 3), 1005);

    unsafe { patch.remove() }.expect("should remove");
    assert_eq!(f(2, 3), 5);
    assert_eq!(process.read_vec(target, 16).unwrap(), before);

    // remove on a removed record is a no-op
    unsafe { patch.remove() }.expect("re-remove is a no-op");

    // a removed record can be applied again; the trampoline is rebuilt
    unsafe { patch.apply() }.expect("should re-apply");
    LIVE_TRAMPOLINE.store(patch.trampoline_ptr().unwrap(), Ordering::Release);
    assert_eq!(f(2, 3), 1005);

    // dropping an applied record removes the hook
    drop(patch);
    assert_eq!(f(2, 3), 5);
    assert_eq!(process.read_vec(target, 16).unwrap(), before);
}

#[inline(never)]
extern "system" fn detach_victim() -> u32 {
    std::hint::black_box(7)
}

extern "system" fn detach_detour() -> u32 {
    42
}

#[test]
fn detach_is_terminal() {
    let _guard = serialize();
    let process = Process::current();
    let f = std::hint::black_box(detach_victim as extern "system" fn() -> u32);
    assert_eq!(f(), 7);

    let mut patch = PatchDetour::new(&process, detach_victim as usize, detach_detour as usize);
    unsafe { patch.apply() }.expect("should apply");
    assert_eq!(f(), 42);

    patch.detach();
    assert!(!patch.is_applied());

    // a detached record never touches the target again: the hook stays
    unsafe { patch.remove() }.expect("remove after detach is a no-op");
    assert_eq!(f(), 42);
    drop(patch);
    assert_eq!(f(), 42);
}

#[test]
fn raw_patch_roundtrip() {
    let _guard = serialize();
    let process = Process::current();
    let mut buf = ExecutableMemory::allocate(&process, 0x1000).expect("should allocate");
    // mov eax, 1; ret
    buf.write(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3])
        .expect("should write");
    let f: extern "system" fn() -> u32 = unsafe { std::mem::transmute(buf.base()) };
    assert_eq!(f(), 1);

    // mov eax, 2; ret
    let mut patch = PatchRaw::new(
        &process,
        buf.base(),
        vec![0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3],
    );
    unsafe { patch.apply() }.expect("should apply");
    assert!(patch.is_applied());
    assert_eq!(f(), 2);

    unsafe { patch.remove() }.expect("should remove");
    assert_eq!(f(), 1);

    // drop of an applied record restores the bytes
    unsafe { patch.apply() }.expect("should re-apply");
    assert_eq!(f(), 2);
    drop(patch);
    assert_eq!(f(), 1);
}

#[test]
fn thread_in_range_rejects_patch() {
    let _guard = serialize();
    let process = Process::current();
    let mut buf = ExecutableMemory::allocate(&process, 0x1000).expect("should allocate");
    // jmp $: a two-byte infinite loop at a known address
    buf.write(&[0xEB, 0xFE]).expect("should write");
    let target = buf.base();

    let spinner: extern "system" fn() = unsafe { std::mem::transmute(target) };
    let ready = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ready_clone = ready.clone();
    let spin_thread = std::thread::spawn(move || {
        ready_clone.store(true, Ordering::Release);
        spinner();
    });
    while !ready.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    // give the thread time to actually enter the loop
    std::thread::sleep(std::time::Duration::from_millis(50));

    let mut patch = PatchRaw::new(&process, target, vec![0x90; 64]);
    let err = unsafe { patch.apply() }.expect_err("spinning thread must be detected");
    assert!(matches!(err, HookError::ThreadInRange { .. }));
    assert!(!patch.is_applied());

    // the target bytes were left untouched
    assert_eq!(process.read_vec(target, 2).unwrap(), [0xEB, 0xFE]);

    // break the loop: a one-byte ret lets the spinner fall out cleanly
    process.write_bytes(target, &[0xC3]).expect("should write");
    process
        .flush_instruction_cache(target, 1)
        .expect("should flush");
    spin_thread.join().expect("spinner should exit");
}
