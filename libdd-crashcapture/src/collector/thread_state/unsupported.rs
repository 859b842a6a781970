// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CaptureError, ThreadSnapshot};
use libc::ucontext_t;

pub type RawThread = libc::pthread_t;

pub(super) fn current_thread() -> RawThread {
    // SAFETY: No preconditions.
    unsafe { libc::pthread_self() }
}

pub(super) fn from_pthread(pthread: libc::pthread_t) -> RawThread {
    pthread
}

pub(super) fn is_current(raw: RawThread) -> bool {
    // SAFETY: No preconditions.
    unsafe { libc::pthread_equal(raw, libc::pthread_self()) != 0 }
}

/// Register decoding is only implemented for Linux and macOS; elsewhere the snapshot is empty.
///
/// # Safety
/// `ucontext` must be null or point to the context the kernel passed to the running handler.
pub unsafe fn capture_from_context(
    ucontext: *const ucontext_t,
) -> Result<ThreadSnapshot, CaptureError> {
    if ucontext.is_null() {
        return Err(CaptureError::NullUcontext);
    }
    Ok(ThreadSnapshot::empty(0))
}

pub(super) fn capture_other<F, R>(_thread: RawThread, _f: F) -> Result<R, CaptureError>
where
    F: FnOnce(&ThreadSnapshot) -> R,
{
    Err(CaptureError::Unsupported)
}
