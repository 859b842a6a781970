// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::callbacks::CrashCallbacks;
use crate::collector::emitters::ReportContext;
use crate::shared::configuration::ReporterConfig;
use crate::shared::metadata::AppMetadata;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use uuid::Uuid;

// Using mutexes inside a signal handler is not allowed, so the process-wide context is published
// through an `AtomicPtr`. It is either null or comes from `Box::into_raw`, and once arming has
// succeeded it is never freed.
static CONTEXT: AtomicPtr<CrashContext> = AtomicPtr::new(ptr::null_mut());
static ARMED: AtomicBool = AtomicBool::new(false);

/// Everything the fault path needs, prepared in ordinary code.
pub(crate) struct CrashContext {
    metadata_json: String,
    config_json: String,
    live_report_path: CString,
    max_report_bytes: usize,
    incident_id: Uuid,
    callbacks: Option<CrashCallbacks>,
    // Both are null or come from `Box::into_raw`.
    custom_data: AtomicPtr<Vec<u8>>,
    exception_description: AtomicPtr<String>,
}

impl CrashContext {
    pub(crate) fn new(
        config: &ReporterConfig,
        metadata: &AppMetadata,
        callbacks: Option<CrashCallbacks>,
    ) -> anyhow::Result<Self> {
        let live_report_path = CString::new(config.live_report_path().as_os_str().as_bytes())?;
        Ok(Self {
            metadata_json: serde_json::to_string(metadata)?,
            config_json: serde_json::to_string(config)?,
            live_report_path,
            max_report_bytes: config.max_report_bytes(),
            incident_id: metadata.incident_id,
            callbacks,
            custom_data: AtomicPtr::new(ptr::null_mut()),
            exception_description: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(crate) fn live_report_path(&self) -> &CStr {
        &self.live_report_path
    }

    pub(crate) fn max_report_bytes(&self) -> usize {
        self.max_report_bytes
    }

    pub(crate) fn incident_id(&self) -> Uuid {
        self.incident_id
    }

    pub(crate) fn callbacks(&self) -> Option<&CrashCallbacks> {
        self.callbacks.as_ref()
    }

    /// Replaces the custom data blob, dropping the previous one.
    ///
    /// ATOMICITY:
    ///     This function uses a swap on an atomic pointer. A fault on another thread that is
    ///     reading the old blob at the same moment is not guarded against.
    pub(crate) fn set_custom_data(&self, data: Option<Vec<u8>>) {
        swap_boxed(&self.custom_data, data);
    }

    /// Same contract as [`CrashContext::set_custom_data`].
    pub(crate) fn set_exception_description(&self, description: Option<String>) {
        swap_boxed(&self.exception_description, description);
    }

    /// Borrows the prepared report inputs.
    ///
    /// SIGNAL SAFETY:
    ///     Two atomic loads, no allocation.
    pub(crate) fn report_context(&self) -> ReportContext<'_> {
        let custom_data = self.custom_data.load(SeqCst);
        let exception_description = self.exception_description.load(SeqCst);
        // SAFETY: Non-null values come from `Box::into_raw` in `swap_boxed`.
        unsafe {
            ReportContext {
                metadata_json: &self.metadata_json,
                config_json: &self.config_json,
                custom_data: custom_data.as_ref().map(|d| d.as_slice()),
                exception_description: exception_description.as_ref().map(|s| s.as_str()),
            }
        }
    }
}

impl Drop for CrashContext {
    fn drop(&mut self) {
        swap_boxed::<Vec<u8>>(&self.custom_data, None);
        swap_boxed::<String>(&self.exception_description, None);
    }
}

fn swap_boxed<T>(slot: &AtomicPtr<T>, value: Option<T>) {
    let new = value.map_or(ptr::null_mut(), |v| Box::into_raw(Box::new(v)));
    let old = slot.swap(new, SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Publishes `context` as the process-wide context.
/// Fails, handing the context back, if another reporter already holds the slot.
pub(crate) fn install(
    context: Box<CrashContext>,
) -> Result<&'static CrashContext, Box<CrashContext>> {
    let raw = Box::into_raw(context);
    match CONTEXT.compare_exchange(ptr::null_mut(), raw, SeqCst, SeqCst) {
        // SAFETY: `raw` was just leaked and stays published until `uninstall`.
        Ok(_) => Ok(unsafe { &*raw }),
        // SAFETY: `raw` was not published, so this is the only owner.
        Err(_) => Err(unsafe { Box::from_raw(raw) }),
    }
}

/// Withdraws a context whose arming failed before any handler could observe it.
pub(crate) fn uninstall(context: &'static CrashContext) {
    let raw = context as *const CrashContext as *mut CrashContext;
    if CONTEXT
        .compare_exchange(raw, ptr::null_mut(), SeqCst, SeqCst)
        .is_ok()
    {
        ARMED.store(false, SeqCst);
        // SAFETY: The pointer came from `install` and is no longer reachable.
        unsafe { drop(Box::from_raw(raw)) };
    }
}

/// SIGNAL SAFETY:
///     One atomic load.
pub(crate) fn current() -> Option<&'static CrashContext> {
    let raw = CONTEXT.load(SeqCst);
    // SAFETY: Non-null values were published by `install`.
    unsafe { raw.as_ref() }
}

pub(crate) fn mark_armed() {
    ARMED.store(true, SeqCst);
}

pub(crate) fn is_armed() -> bool {
    ARMED.load(SeqCst)
}
