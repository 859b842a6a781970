// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_context::{self, CrashContext};
use super::reentrancy_gate::{current_thread_token, REPORT_GATE};
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());

/// The most recent panic, and the thread it happened on.
struct PanicRecord {
    thread: u64,
    description: String,
}

// Null or from `Box::into_raw`. Whoever swaps a record out of the slot owns it.
static LAST_PANIC: AtomicPtr<PanicRecord> = AtomicPtr::new(ptr::null_mut());

/// Terminates the process for an uncaught high-level exception.
///
/// The report gate is claimed here, on the calling thread, and `description` is stored as the
/// exception description. The `abort` that follows raises SIGABRT on this same thread, whose
/// handler re-enters the gate and writes a report that carries the description. If another
/// thread already holds the gate, the description is dropped and the process aborts anyway.
pub fn report_uncaught_exception(description: &str) -> ! {
    if let Some(context) = armed_context() {
        if REPORT_GATE.try_claim() {
            context.set_exception_description(Some(description.to_string()));
        }
    }
    std::process::abort()
}

/// Register the panic hook.
///
/// The hook records the panic message, with its location, then calls the hook that was installed
/// before it. The record is only used when the panicking thread crashes before its panic is over,
/// as it does when the panic ends in an abort; a panic caught by `catch_unwind` leaves no trace in
/// later reports. An exception description set on the reporter takes precedence.
/// PRECONDITIONS:
///     None
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn register_panic_hook() -> anyhow::Result<()> {
    // register only once
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return Ok(());
    }

    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.swap(old_hook_ptr, SeqCst);
    panic::set_hook(Box::new(|panic_info| {
        record_panic(panic_description(panic_info));
        call_previous_panic_hook(panic_info);
    }));
    Ok(())
}

fn record_panic(description: String) {
    let record = Box::into_raw(Box::new(PanicRecord {
        thread: current_thread_token(),
        description,
    }));
    let old = LAST_PANIC.swap(record, SeqCst);
    if !old.is_null() {
        // Safety: Swapped out of the slot, so no one else can reach it.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// The description of the panic the calling thread is going through, if any.
///
/// The record is taken out of the slot and never freed, so a panic on another thread cannot
/// invalidate it. Only the fatal path calls this.
///
/// SIGNAL SAFETY:
///     A thread-local read and an atomic swap, no allocation.
pub(crate) fn take_panic_description() -> Option<&'static str> {
    if !std::thread::panicking() {
        return None;
    }
    let record = LAST_PANIC.swap(ptr::null_mut(), SeqCst);
    // Safety: Non-null values come from `record_panic`, and this thread now owns the record.
    let record: &'static PanicRecord = unsafe { record.as_ref() }?;
    (record.thread == current_thread_token()).then_some(record.description.as_str())
}

fn armed_context() -> Option<&'static CrashContext> {
    crash_context::is_armed()
        .then(crash_context::current)
        .flatten()
}

fn panic_description(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>");
    match panic_info.location() {
        Some(location) => format!("panicked at {location}: {message}"),
        None => format!("panicked: {message}"),
    }
}

fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // Safety: This pointer can only come from Box::into_raw above in register_panic_hook.
        // It is borrowed, never freed, so it stays valid for later panics.
        unsafe {
            let old_hook = &*old_hook_ptr;
            old_hook(panic_info);
        }
    }
}
