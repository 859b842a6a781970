// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault interception through Mach exception ports.
//!
//! The kernel turns a fault into a message sent to the task's exception port, suspends the
//! faulting thread and waits for a reply. A dedicated handler thread receives the message,
//! offers it to whichever port was installed before ours, and only writes a report when that
//! port did not claim the exception. Replying `KERN_FAILURE` then lets the kernel deliver the
//! corresponding signal, which terminates the process.

#[cfg(target_os = "macos")]
mod macos;

use crate::collector::fault_info::mach_exception::*;
use crate::collector::reentrancy_gate::ReentrancyGate;
use std::time::Duration;
use thiserror::Error;

pub const EXC_MASK_BAD_ACCESS: u32 = 1 << EXC_BAD_ACCESS;
pub const EXC_MASK_BAD_INSTRUCTION: u32 = 1 << EXC_BAD_INSTRUCTION;
pub const EXC_MASK_ARITHMETIC: u32 = 1 << EXC_ARITHMETIC;
pub const EXC_MASK_SOFTWARE: u32 = 1 << EXC_SOFTWARE;
pub const EXC_MASK_BREAKPOINT: u32 = 1 << EXC_BREAKPOINT;
pub const EXC_MASK_RESOURCE: u32 = 1 << EXC_RESOURCE;
pub const EXC_MASK_GUARD: u32 = 1 << EXC_GUARD;

const LOSER_WAIT_LIMIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ExceptionPortError {
    #[error("Exception ports are only available on macOS")]
    Unsupported,
    #[error("Exception ports are already armed in this process")]
    AlreadyArmed,
    #[error("{call} failed: kern_return_t {code}")]
    Mach { call: &'static str, code: i32 },
    #[error("Failed to spawn the exception handler thread: {0}")]
    Spawn(std::io::Error),
}

/// The exceptions claimed by the interceptor. `EXC_RESOURCE` is never claimed: it reports
/// resource usage, not a fault.
pub fn exception_mask(guard_supported: bool) -> u32 {
    let mask = EXC_MASK_BAD_ACCESS
        | EXC_MASK_BAD_INSTRUCTION
        | EXC_MASK_ARITHMETIC
        | EXC_MASK_SOFTWARE
        | EXC_MASK_BREAKPOINT;
    if guard_supported {
        mask | EXC_MASK_GUARD
    } else {
        mask
    }
}

/// `EXC_GUARD` exists from macOS 10.9 on.
pub fn guard_supported(version: &os_info::Version) -> bool {
    match version {
        os_info::Version::Semantic(major, minor, _) => (*major, *minor) >= (10, 9),
        _ => false,
    }
}

/// What a previously installed exception port did with a forwarded exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The previous port replied `KERN_SUCCESS`.
    Handled,
    /// The previous port replied with an error, or could not be reached.
    NotHandled,
    /// No previous port covers this exception.
    NoPreviousPort,
}

/// The reply sent back to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionReply {
    /// `KERN_SUCCESS`: the thread resumes.
    Handled,
    /// `KERN_FAILURE`: the kernel falls back to delivering a signal.
    NotHandled,
}

/// Runs the per-exception sequence: forward first, then disarm, gate, and report.
///
/// Nothing is reported, and the gate is left alone, when the previous port handled the exception.
pub(crate) fn process_exception(
    gate: &ReentrancyGate,
    forward: impl FnOnce() -> ForwardOutcome,
    disarm: impl FnOnce(),
    report: impl FnOnce(),
) -> ExceptionReply {
    if forward() == ForwardOutcome::Handled {
        return ExceptionReply::Handled;
    }
    disarm();
    if gate.try_claim() {
        report();
        gate.mark_complete();
    } else {
        gate.wait_for_completion(LOSER_WAIT_LIMIT);
    }
    ExceptionReply::NotHandled
}

/// Claims the exceptions of `mask` for this task and starts the handler thread.
#[cfg(target_os = "macos")]
pub(crate) fn arm(mask: u32) -> Result<(), ExceptionPortError> {
    macos::arm(mask)
}

#[cfg(not(target_os = "macos"))]
pub(crate) fn arm(_mask: u32) -> Result<(), ExceptionPortError> {
    Err(ExceptionPortError::Unsupported)
}

/// Restores the exception ports that were installed before arming.
///
/// SIGNAL SAFETY:
///     Only `task_set_exception_ports` is called.
#[cfg(target_os = "macos")]
pub(crate) fn disarm() {
    macos::disarm()
}

#[cfg(not(target_os = "macos"))]
pub(crate) fn disarm() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_exception_mask() {
        let mask = exception_mask(false);
        assert_eq!(mask & EXC_MASK_GUARD, 0);
        assert_eq!(mask & EXC_MASK_RESOURCE, 0);
        assert_ne!(mask & EXC_MASK_BAD_ACCESS, 0);
        assert_ne!(mask & EXC_MASK_BREAKPOINT, 0);

        let mask = exception_mask(true);
        assert_ne!(mask & EXC_MASK_GUARD, 0);
        assert_eq!(mask & EXC_MASK_RESOURCE, 0);
    }

    #[test]
    fn test_guard_supported() {
        use os_info::Version;
        assert!(!guard_supported(&Version::Semantic(10, 8, 5)));
        assert!(guard_supported(&Version::Semantic(10, 9, 0)));
        assert!(guard_supported(&Version::Semantic(14, 2, 1)));
        assert!(!guard_supported(&Version::Unknown));
    }

    #[test]
    fn test_handled_by_previous_port() {
        let gate = ReentrancyGate::new();
        let steps = RefCell::new(Vec::new());
        let reply = process_exception(
            &gate,
            || ForwardOutcome::Handled,
            || steps.borrow_mut().push("disarm"),
            || steps.borrow_mut().push("report"),
        );
        assert_eq!(reply, ExceptionReply::Handled);
        assert!(steps.borrow().is_empty());
        assert!(!gate.is_claimed());
    }

    #[test]
    fn test_unhandled_is_reported_once() {
        let gate = ReentrancyGate::new();
        let steps = RefCell::new(Vec::new());
        for outcome in [ForwardOutcome::NotHandled, ForwardOutcome::NoPreviousPort] {
            let reply = process_exception(
                &gate,
                || outcome,
                || steps.borrow_mut().push("disarm"),
                || steps.borrow_mut().push("report"),
            );
            assert_eq!(reply, ExceptionReply::NotHandled);
        }
        // The second exception finds the gate claimed and the first report complete.
        assert_eq!(*steps.borrow(), vec!["disarm", "report", "disarm"]);
        assert!(gate.is_claimed());
        assert!(gate.is_complete());
    }
}
