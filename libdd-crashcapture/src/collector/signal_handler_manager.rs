// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::{handle_parked_sigaction, handle_posix_sigaction};
use errno::{errno, Errno};
use libc::{mmap, sigaltstack, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::atomic::Ordering::SeqCst;
use thiserror::Error;

/// Every signal the signal interceptor claims.
pub const MONITORED_SIGNALS: [Signal; 6] = [
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGTRAP,
];

/// Signals that stay on the signal path when faults are intercepted through exception ports.
/// `abort()` raises SIGABRT without going through the exception machinery first.
pub const EXCEPTION_PORT_SIGNALS: [Signal; 1] = [Signal::SIGABRT];

/// Bit `n` is set while signal `n` is routed to the crash handler.
static ARMED_SIGNALS: AtomicU64 = AtomicU64::new(0);
/// Bit `n` is set while signal `n` is routed to the parking handler.
static PARKED_SIGNALS: AtomicU64 = AtomicU64::new(0);
/// Bit `n` is set once signal `n` has been armed. Never cleared.
static ROUTED_SIGNALS: AtomicU64 = AtomicU64::new(0);
static USE_ALT_STACK: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum SignalArmError {
    #[error("Failed to allocate the alternate signal stack: {0}")]
    AltStackAlloc(Errno),
    #[error("Failed to set up the alternate signal stack guard page: {0}")]
    AltStackGuard(Errno),
    #[error("sigaltstack failed: {0}")]
    AltStack(Errno),
    #[error("Unable to register the handler for {signal}: {source}")]
    Register {
        signal: Signal,
        #[source]
        source: nix::Error,
    },
}

/// Routes every signal of `signals` to the crash handler.
///
/// Either every handler is installed, or none is: when one registration fails, the handlers
/// installed so far are replaced by the ones they displaced.
///
/// SAFETY:
///     Crash-capture functions are not guaranteed to be reentrant.
///     No other arming function should be called concurrently.
pub(crate) fn arm_signal_handlers(
    signals: &[Signal],
    create_alt_stack: bool,
    use_alt_stack: bool,
) -> Result<(), SignalArmError> {
    if create_alt_stack {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack_for_current_thread()? };
    }

    let mut displaced: Vec<(Signal, SigAction)> = Vec::with_capacity(signals.len());
    for &signal in signals {
        // Safety: The handler only performs async-signal-safe work.
        match unsafe { register_signal_handler(signal, handle_posix_sigaction, use_alt_stack) } {
            Ok(old) => displaced.push((signal, old)),
            Err(source) => {
                tracing::warn!(%signal, %source, "Rolling back signal handlers");
                for (signal, old) in displaced.iter().rev() {
                    // Safety: Restores a disposition that was in place a moment ago.
                    let _ = unsafe { signal::sigaction(*signal, old) };
                }
                return Err(SignalArmError::Register { signal, source });
            }
        }
    }

    let mask = signals
        .iter()
        .fold(0u64, |mask, signal| mask | (1u64 << (*signal as i32)));
    USE_ALT_STACK.store(use_alt_stack, SeqCst);
    ROUTED_SIGNALS.fetch_or(mask, SeqCst);
    ARMED_SIGNALS.store(mask, SeqCst);
    tracing::debug!(?signals, "Registered crash signal handlers");
    Ok(())
}

/// Routes every armed signal to the parking handler.
///
/// Called first by the crash handler. A thread that faults while the report is being written then
/// waits for it instead of meeting the default disposition, which would end the process with the
/// report half written. Only the first caller does anything.
///
/// SIGNAL SAFETY:
///     Only `sigaction` is called.
pub(crate) fn divert_to_parking() {
    let mask = ARMED_SIGNALS.swap(0, SeqCst);
    if mask == 0 {
        return;
    }
    PARKED_SIGNALS.fetch_or(mask, SeqCst);
    let use_alt_stack = USE_ALT_STACK.load(SeqCst);
    for signal in signals_in(mask) {
        // Safety: The parking handler only performs async-signal-safe work.
        let _ = unsafe { register_signal_handler(signal, handle_parked_sigaction, use_alt_stack) };
    }
}

/// Puts every signal that was ever armed back to its default disposition. Idempotent.
///
/// SIGNAL SAFETY:
///     Only `sigaction` is called.
pub(crate) fn restore_default_dispositions() {
    ARMED_SIGNALS.store(0, SeqCst);
    PARKED_SIGNALS.store(0, SeqCst);
    let mask = ROUTED_SIGNALS.load(SeqCst);
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in signals_in(mask) {
        // Safety: Installing the default disposition has no preconditions.
        let _ = unsafe { signal::sigaction(signal, &default) };
    }
}

fn signals_in(mask: u64) -> impl Iterator<Item = Signal> {
    MONITORED_SIGNALS
        .into_iter()
        .filter(move |signal| mask & (1u64 << (*signal as i32)) != 0)
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack_for_current_thread() -> Result<(), SignalArmError> {
    // Ensure that the altstack size is the greater of 16 pages or SIGSTKSZ. A report is written
    // from the handler, with a 1KiB write buffer and a register snapshot on the stack.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(libc::SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    if stackp == MAP_FAILED {
        return Err(SignalArmError::AltStackAlloc(errno()));
    }
    if libc::mprotect(stackp, page_size, PROT_NONE) != 0 {
        return Err(SignalArmError::AltStackGuard(errno()));
    }
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    if sigaltstack(&stack, ptr::null_mut()) != 0 {
        return Err(SignalArmError::AltStack(errno()));
    }
    Ok(())
}

unsafe fn register_signal_handler(
    signal: Signal,
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
    use_alt_stack: bool,
) -> Result<SigAction, nix::Error> {
    // Runtimes that install their own altstack expect handlers to run on it, so using the
    // altstack is independent from creating one. Creating one without using it is rejected by
    // `ReporterConfig`.
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    // SA_NODEFER: a fault inside the handler is delivered at once, to the parking handler
    // installed by the crash handler's first step.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handler),
        SaFlags::SA_NODEFER | extra_saflags,
        SigSet::empty(),
    );
    signal::sigaction(signal, &sig_action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitored_set() {
        let mut signals: Vec<i32> = MONITORED_SIGNALS.iter().map(|s| *s as i32).collect();
        signals.sort_unstable();
        let mut expected = vec![
            libc::SIGABRT,
            libc::SIGBUS,
            libc::SIGFPE,
            libc::SIGILL,
            libc::SIGSEGV,
            libc::SIGTRAP,
        ];
        expected.sort_unstable();
        assert_eq!(signals, expected);
        assert!(MONITORED_SIGNALS.iter().all(|s| (*s as i32) < 64));
        assert!(MONITORED_SIGNALS.contains(&EXCEPTION_PORT_SIGNALS[0]));
    }

    fn current_handler(signal: Signal) -> usize {
        // SAFETY: Querying a disposition with a null new action is always valid.
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(signal as libc::c_int, ptr::null(), &mut current);
            current.sa_sigaction
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_crash_parks_other_threads_then_restores_defaults() -> anyhow::Result<()> {
        // Nothing in the test process raises SIGTRAP.
        arm_signal_handlers(&[Signal::SIGTRAP], false, false)?;
        assert_eq!(
            current_handler(Signal::SIGTRAP),
            handle_posix_sigaction as usize
        );

        divert_to_parking();
        assert_eq!(
            current_handler(Signal::SIGTRAP),
            handle_parked_sigaction as usize
        );
        // A second crashing thread leaves the parking handler in place.
        divert_to_parking();
        assert_eq!(
            current_handler(Signal::SIGTRAP),
            handle_parked_sigaction as usize
        );

        restore_default_dispositions();
        assert_eq!(current_handler(Signal::SIGTRAP), libc::SIG_DFL);
        assert_eq!(ARMED_SIGNALS.load(SeqCst), 0);
        assert_eq!(PARKED_SIGNALS.load(SeqCst), 0);
        Ok(())
    }
}
