// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-tolerant memory reads and a frame-pointer stack walker.
//!
//! The walker runs against a stack that may be corrupt, so every load goes through the kernel
//! (`process_vm_readv` on Linux, `mach_vm_read_overwrite` on macOS), which reports an error for
//! unmapped memory instead of faulting.

use crate::collector::thread_state::ThreadSnapshot;
use serde::{Deserialize, Serialize};

/// A raw stack frame containing register values.
///
/// - `ip`: Instruction pointer (return address for every frame but the first)
/// - `sp`: Stack pointer at this frame
/// - `bp`: Base/frame pointer at this frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub ip: usize,
    pub sp: usize,
    pub bp: usize,
}

const WORD: usize = std::mem::size_of::<usize>();

/// Reads one pointer-sized word, or `None` if `addr` is not readable.
///
/// SIGNAL SAFETY:
///     A single system call, no allocation.
#[cfg(target_os = "linux")]
pub fn read_word(addr: usize) -> Option<usize> {
    if addr == 0 || addr % WORD != 0 {
        return None;
    }
    let mut value: usize = 0;
    let local = libc::iovec {
        iov_base: &mut value as *mut usize as *mut libc::c_void,
        iov_len: WORD,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: WORD,
    };
    // SAFETY: `local` points to a live, writable word; the kernel validates `remote`.
    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    (read == WORD as isize).then_some(value)
}

#[cfg(target_os = "macos")]
pub fn read_word(addr: usize) -> Option<usize> {
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_read_overwrite;

    if addr == 0 || addr % WORD != 0 {
        return None;
    }
    let mut value: usize = 0;
    let mut read: u64 = 0;
    // SAFETY: The destination is a live, writable word; the kernel validates the source.
    let kr = unsafe {
        mach_vm_read_overwrite(
            mach_task_self(),
            addr as u64,
            WORD as u64,
            &mut value as *mut usize as u64,
            &mut read,
        )
    };
    (kr == KERN_SUCCESS && read == WORD as u64).then_some(value)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn read_word(_addr: usize) -> Option<usize> {
    None
}

/// Walks the frame-pointer chain starting at `snapshot`.
///
/// Stops at `max_frames`, at a null or misaligned frame pointer, at an unreadable frame, or after
/// the frame whose saved frame pointer fails to move strictly up the stack.
pub struct FrameWalker {
    next: Option<RawFrame>,
    remaining: usize,
}

impl FrameWalker {
    pub fn new(snapshot: &ThreadSnapshot, max_frames: usize) -> Self {
        let first = RawFrame {
            ip: snapshot.pc() as usize,
            sp: snapshot.sp() as usize,
            bp: snapshot.fp() as usize,
        };
        Self {
            next: (first.ip != 0).then_some(first),
            remaining: max_frames,
        }
    }
}

impl Iterator for FrameWalker {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next.take()?;
        self.remaining -= 1;

        // Both x86_64 and aarch64 store [saved fp, return address] at the frame pointer.
        let bp = current.bp;
        if bp != 0 && bp % WORD == 0 {
            if let (Some(caller_bp), Some(return_address)) = (read_word(bp), read_word(bp + WORD))
            {
                if return_address != 0 {
                    // A caller fp that does not move up the stack still leaves a valid return
                    // address; report it as the last frame.
                    self.next = Some(RawFrame {
                        ip: return_address,
                        sp: bp + 2 * WORD,
                        bp: if caller_bp > bp { caller_bp } else { 0 },
                    });
                }
            }
        }
        Some(current)
    }
}
