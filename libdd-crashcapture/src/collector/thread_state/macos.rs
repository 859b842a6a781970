// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CaptureError, ThreadSnapshot};
use crate::collector::mach_ffi;
use libc::ucontext_t;
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;
use mach2::message::mach_msg_type_number_t;
use mach2::thread_act::{thread_get_state, thread_resume, thread_suspend};

pub type RawThread = thread_act_t;

#[cfg(target_arch = "x86_64")]
type MachThreadState = libc::__darwin_x86_thread_state64;
#[cfg(target_arch = "x86_64")]
const THREAD_STATE_FLAVOR: i32 = mach_ffi::X86_THREAD_STATE64;

#[cfg(target_arch = "aarch64")]
type MachThreadState = libc::__darwin_arm_thread_state64;
#[cfg(target_arch = "aarch64")]
const THREAD_STATE_FLAVOR: i32 = mach_ffi::ARM_THREAD_STATE64;

pub(super) fn current_thread() -> RawThread {
    // SAFETY: No preconditions. The returned port is not a new reference.
    unsafe { mach_ffi::pthread_mach_thread_np(libc::pthread_self()) }
}

pub(super) fn from_pthread(pthread: libc::pthread_t) -> RawThread {
    // SAFETY: `pthread` refers to a live thread of this process.
    unsafe { mach_ffi::pthread_mach_thread_np(pthread) }
}

pub(super) fn is_current(raw: RawThread) -> bool {
    current_thread() == raw
}

fn thread_id_of(raw: RawThread) -> u64 {
    let mut id = 0u64;
    // SAFETY: `pthread_from_mach_thread_np` returns null for threads it does not know about.
    unsafe {
        let pthread = mach_ffi::pthread_from_mach_thread_np(raw);
        if pthread.is_null() || mach_ffi::pthread_threadid_np(pthread, &mut id) != 0 {
            return raw as u64;
        }
    }
    id
}

fn current_thread_id() -> u64 {
    let mut id = 0u64;
    // SAFETY: A null thread means the calling thread.
    unsafe { mach_ffi::pthread_threadid_np(std::ptr::null_mut(), &mut id) };
    id
}

/// Decodes the machine context delivered to a `SA_SIGINFO` handler.
///
/// # Safety
/// `ucontext` must be null or point to the context the kernel passed to the running handler.
pub unsafe fn capture_from_context(
    ucontext: *const ucontext_t,
) -> Result<ThreadSnapshot, CaptureError> {
    if ucontext.is_null() || (*ucontext).uc_mcontext.is_null() {
        return Err(CaptureError::NullUcontext);
    }
    let state = &(*(*ucontext).uc_mcontext).__ss;
    Ok(snapshot_from_state(state, current_thread_id()))
}

#[cfg(target_arch = "x86_64")]
fn snapshot_from_state(state: &MachThreadState, thread_id: u64) -> ThreadSnapshot {
    let mut snapshot = ThreadSnapshot::empty(thread_id);
    let registers = [
        ("rax", state.__rax),
        ("rbx", state.__rbx),
        ("rcx", state.__rcx),
        ("rdx", state.__rdx),
        ("rdi", state.__rdi),
        ("rsi", state.__rsi),
        ("rbp", state.__rbp),
        ("rsp", state.__rsp),
        ("r8", state.__r8),
        ("r9", state.__r9),
        ("r10", state.__r10),
        ("r11", state.__r11),
        ("r12", state.__r12),
        ("r13", state.__r13),
        ("r14", state.__r14),
        ("r15", state.__r15),
        ("rip", state.__rip),
        ("rflags", state.__rflags),
    ];
    for (name, value) in registers {
        snapshot.push_register(name, value);
    }
    snapshot.set_frame(state.__rip, state.__rsp, state.__rbp);
    snapshot
}

#[cfg(target_arch = "aarch64")]
fn snapshot_from_state(state: &MachThreadState, thread_id: u64) -> ThreadSnapshot {
    const NAMES: [&str; 29] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28",
    ];
    let mut snapshot = ThreadSnapshot::empty(thread_id);
    for (name, value) in NAMES.iter().zip(state.__x.iter()) {
        snapshot.push_register(name, *value);
    }
    snapshot.push_register("fp", state.__fp);
    snapshot.push_register("lr", state.__lr);
    snapshot.push_register("sp", state.__sp);
    snapshot.push_register("pc", state.__pc);
    snapshot.push_register("cpsr", state.__cpsr as u64);
    snapshot.set_frame(state.__pc, state.__sp, state.__fp);
    snapshot
}

/// Resumes the suspended thread when dropped.
struct ResumeGuard(RawThread);

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        // SAFETY: The thread was suspended by `capture_other`.
        unsafe { thread_resume(self.0) };
    }
}

/// Reads the registers of a suspended thread.
///
/// SIGNAL SAFETY:
///     Only Mach calls, no allocation. Also used by the exception handler thread.
pub(crate) fn suspended_snapshot(thread: RawThread) -> Result<ThreadSnapshot, CaptureError> {
    // SAFETY: Zero is a valid bit pattern for the plain-integer thread state.
    let mut state: MachThreadState = unsafe { std::mem::zeroed() };
    let mut count = (std::mem::size_of::<MachThreadState>() / std::mem::size_of::<u32>())
        as mach_msg_type_number_t;
    // SAFETY: `state` is large enough for `count` words of the requested flavor.
    let kr = unsafe {
        thread_get_state(
            thread,
            THREAD_STATE_FLAVOR,
            &mut state as *mut MachThreadState as *mut u32,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(CaptureError::ThreadState(kr));
    }
    Ok(snapshot_from_state(&state, thread_id_of(thread)))
}

pub(super) fn capture_other<F, R>(thread: RawThread, f: F) -> Result<R, CaptureError>
where
    F: FnOnce(&ThreadSnapshot) -> R,
{
    // SAFETY: `thread` is a thread port of this task.
    let kr = unsafe { thread_suspend(thread) };
    if kr != KERN_SUCCESS {
        return Err(CaptureError::Suspend(kr));
    }
    let _resume = ResumeGuard(thread);
    let snapshot = suspended_snapshot(thread)?;
    Ok(f(&snapshot))
}
