// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libc::{c_void, siginfo_t, ucontext_t};
use thiserror::Error;

/// The only layout of [`CrashCallbacks`] understood by this version of the library.
pub const CRASH_CALLBACKS_VERSION: u16 = 0;

/// Invoked on the faulting path after the report has been written.
///
/// Runs in fault context: the callee must restrict itself to async-signal-safe operations.
/// In exception-port mode `info` is null and `uap` points to an empty context.
pub type HandleSignalFn =
    extern "C" fn(info: *mut siginfo_t, uap: *mut ucontext_t, context: *mut c_void);

/// User hook run after a crash report has been written.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CrashCallbacks {
    pub version: u16,
    pub context: *mut c_void,
    pub handle_signal: Option<HandleSignalFn>,
}

// SAFETY: The context pointer is only handed back to the user's callback, which is responsible
// for whatever it points to.
unsafe impl Send for CrashCallbacks {}
unsafe impl Sync for CrashCallbacks {}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Unsupported crash callbacks version {0}")]
    UnknownVersion(u16),
    #[error("Crash callbacks must provide a handle_signal function")]
    NullCallback,
    #[error("Crash callbacks cannot be changed once the reporter is armed")]
    AlreadyArmed,
}

impl CrashCallbacks {
    pub fn new(context: *mut c_void, handle_signal: HandleSignalFn) -> Self {
        Self {
            version: CRASH_CALLBACKS_VERSION,
            context,
            handle_signal: Some(handle_signal),
        }
    }

    pub fn validate(&self) -> Result<(), CallbackError> {
        if self.version != CRASH_CALLBACKS_VERSION {
            return Err(CallbackError::UnknownVersion(self.version));
        }
        if self.handle_signal.is_none() {
            return Err(CallbackError::NullCallback);
        }
        Ok(())
    }

    /// SIGNAL SAFETY:
    ///     Calls the user function, nothing else.
    pub(crate) fn invoke(&self, info: *mut siginfo_t, uap: *mut ucontext_t) {
        if let Some(handle_signal) = self.handle_signal {
            handle_signal(info, uap, self.context);
        }
    }
}
