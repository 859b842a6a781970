// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::async_writer::{BoundedWriter, WriterError};
use super::crash_context::{self, CrashContext};
use super::emitters::{write_report, EmitterError};
use super::exception_port;
use super::fault_info::FaultInfo;
use super::image_registry::IMAGE_REGISTRY;
use super::reentrancy_gate::REPORT_GATE;
use super::uncaught_exception_handler::take_panic_description;
use super::signal_handler_manager::{divert_to_parking, restore_default_dispositions};
use super::thread_state::{capture_from_context, ThreadHandle, ThreadSnapshot};
use errno::{errno, set_errno};
use libc::{c_void, siginfo_t, ucontext_t};
use std::time::Duration;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clock_gettime
// - close
// - gettid (Linux), pthread_threadid_np (macOS)
// - nanosleep
// - open
// - process_vm_readv (Linux), mach_vm_read_overwrite (macOS)
// - raise
// - sigaction
// - task_set_exception_ports (macOS)
// - write

/// How long a thread that lost the gate waits for the winner before falling through to the
/// default disposition.
const LOSER_WAIT_LIMIT: Duration = Duration::from_secs(10);

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let saved_errno = errno();
    // Before anything else, so that a fault on another thread parks until the report is written.
    divert_to_parking();
    // SAFETY: Both pointers come from the kernel for this delivery.
    let handled =
        unsafe { handle_posix_signal_impl(signum, sig_info, ucontext as *mut ucontext_t) };
    restore_default_dispositions();
    set_errno(saved_errno);
    if !handled {
        // Returning from a hardware fault re-executes the faulting instruction, which then meets
        // the default disposition. A signal sent with `raise` or `kill` is only delivered once,
        // so it is raised again.
        // SAFETY: No preconditions.
        unsafe { libc::raise(signum) };
    }
}

/// Entry routine for monitored signals once a crash report is under way.
///
/// The thread writing the report, faulting again, meets the default disposition at once. Any
/// other thread waits for the report to be complete first.
pub(crate) extern "C" fn handle_parked_sigaction(
    signum: i32,
    _sig_info: *mut siginfo_t,
    _ucontext: *mut c_void,
) {
    if !REPORT_GATE.is_held_by_current_thread() {
        REPORT_GATE.wait_for_completion(LOSER_WAIT_LIMIT);
    }
    restore_default_dispositions();
    // SAFETY: No preconditions.
    unsafe { libc::raise(signum) };
}

/// Returns whether the signal was handled. It never is: the process must go on to terminate.
unsafe fn handle_posix_signal_impl(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut ucontext_t,
) -> bool {
    let Some(context) = crash_context::current() else {
        return false;
    };
    // The SIGABRT carve-out leaves the exception ports installed; withdraw them as well.
    exception_port::disarm();

    if !REPORT_GATE.try_claim_or_reenter() {
        write_stderr("crashcapture: another thread is writing the crash report\n");
        REPORT_GATE.wait_for_completion(LOSER_WAIT_LIMIT);
        return false;
    }

    let snapshot = match capture_from_context(ucontext) {
        Ok(snapshot) => snapshot,
        Err(_) => {
            write_stderr("crashcapture: no machine context, registers are not reported\n");
            ThreadSnapshot::empty(0)
        }
    };
    let fault_info = FaultInfo::from_siginfo(signum, sig_info);
    write_fault_report(context, &fault_info, &snapshot);

    // The callback runs under the default dispositions. Parked threads stay parked until it
    // returns.
    restore_default_dispositions();
    if let Some(callbacks) = context.callbacks() {
        callbacks.invoke(sig_info, ucontext);
    }
    REPORT_GATE.mark_complete();
    false
}

/// Writes the report of a fatal fault into the live-report slot.
/// Failures are printed to stderr, since nothing else can be done with them here.
///
/// SIGNAL SAFETY:
///     See the list of functions at the top of this file.
pub(crate) fn write_fault_report(
    context: &CrashContext,
    fault_info: &FaultInfo,
    snapshot: &ThreadSnapshot,
) {
    let opened = BoundedWriter::open(context.live_report_path(), context.max_report_bytes());
    let mut writer = match opened {
        Ok(writer) => writer,
        Err(_) => {
            write_stderr("crashcapture: unable to open the crash report file\n");
            return;
        }
    };
    let images = IMAGE_REGISTRY.snapshot_for_report();
    let mut report_context = context.report_context();
    if report_context.exception_description.is_none() {
        report_context.exception_description = take_panic_description();
    }
    let result = write_report(
        &mut writer,
        ThreadHandle::current(),
        &images,
        fault_info,
        Some(snapshot),
        &report_context,
    );
    match result {
        Ok(()) => (),
        Err(EmitterError::Writer(WriterError::BudgetExceeded { .. })) => {
            write_stderr("crashcapture: crash report truncated at its byte budget\n")
        }
        Err(_) => write_stderr("crashcapture: failed to write the crash report\n"),
    }
}

/// Writes to fd 2 without formatting or allocating.
///
/// SIGNAL SAFETY:
///     A single `write`.
pub(crate) fn write_stderr(message: &'static str) {
    // SAFETY: `message` is a valid slice for the length passed.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            message.as_ptr() as *const c_void,
            message.len(),
        )
    };
}
