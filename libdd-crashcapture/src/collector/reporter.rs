// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::callbacks::{CallbackError, CrashCallbacks};
use super::crash_context::{self, CrashContext};
use super::emitters::ReportContext;
use super::exception_port::{self, exception_mask, guard_supported, ExceptionPortError};
use super::image_registry::register_loaded_images;
use super::live_report::{self, LiveReportError};
use super::signal_handler_manager::{
    arm_signal_handlers, SignalArmError, EXCEPTION_PORT_SIGNALS, MONITORED_SIGNALS,
};
use super::thread_state::ThreadHandle;
use crate::shared::configuration::{InterceptionMode, ReporterConfig};
use crate::shared::metadata::AppMetadata;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArmError {
    #[error("Another crash reporter is already armed in this process")]
    Busy,
    #[error("Unable to prepare the crash context: {0}")]
    Context(anyhow::Error),
    #[error(transparent)]
    Signal(#[from] SignalArmError),
    #[error(transparent)]
    ExceptionPort(#[from] ExceptionPortError),
}

/// Captures a report into `<base_path>/live_report` when the process crashes.
///
/// At most one reporter can be armed per process. Once armed, a reporter stays armed until the
/// process ends.
pub struct CrashReporter {
    config: ReporterConfig,
    metadata: AppMetadata,
    metadata_json: String,
    config_json: String,
    custom_data: Option<Vec<u8>>,
    exception_description: Option<String>,
    callbacks: Option<CrashCallbacks>,
    armed: Option<&'static CrashContext>,
}

impl CrashReporter {
    pub fn new(config: ReporterConfig, metadata: AppMetadata) -> anyhow::Result<Self> {
        let metadata_json = serde_json::to_string(&metadata)?;
        let config_json = serde_json::to_string(&config)?;
        Ok(Self {
            config,
            metadata,
            metadata_json,
            config_json,
            custom_data: None,
            exception_description: None,
            callbacks: None,
            armed: None,
        })
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn metadata(&self) -> &AppMetadata {
        &self.metadata
    }

    pub fn live_report_path(&self) -> PathBuf {
        self.config.live_report_path()
    }

    pub fn queued_reports_path(&self) -> PathBuf {
        self.config.queued_reports_path()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Opaque bytes written into every later report. Takes effect immediately when armed.
    pub fn set_custom_data(&mut self, data: Option<Vec<u8>>) {
        if let Some(context) = self.armed {
            context.set_custom_data(data.clone());
        }
        self.custom_data = data;
    }

    /// Description of the exception that is about to bring the process down.
    pub fn set_exception_description(&mut self, description: Option<String>) {
        if let Some(context) = self.armed {
            context.set_exception_description(description.clone());
        }
        self.exception_description = description;
    }

    /// Callbacks are fixed at arm time.
    pub fn set_crash_callbacks(&mut self, callbacks: CrashCallbacks) -> Result<(), CallbackError> {
        if self.armed.is_some() {
            return Err(CallbackError::AlreadyArmed);
        }
        callbacks.validate()?;
        self.callbacks = Some(callbacks);
        Ok(())
    }

    /// Installs the fault interceptor selected by the configuration.
    ///
    /// Fails with [`ArmError::Busy`] when another reporter of this process is armed; that
    /// reporter is left untouched. On any other failure, whatever was installed is rolled back.
    pub fn arm(&mut self) -> Result<(), ArmError> {
        if self.armed.is_some() {
            return Err(ArmError::Busy);
        }
        let context = CrashContext::new(&self.config, &self.metadata, self.callbacks)
            .map_err(ArmError::Context)?;
        context.set_custom_data(self.custom_data.clone());
        context.set_exception_description(self.exception_description.clone());
        let context = crash_context::install(Box::new(context)).map_err(|_| ArmError::Busy)?;

        if let Err(e) = arm_interceptor(&self.config) {
            tracing::error!("Unable to arm the crash reporter: {e}");
            crash_context::uninstall(context);
            return Err(e);
        }

        let images = register_loaded_images();
        crash_context::mark_armed();
        self.armed = Some(context);
        tracing::debug!(
            mode = ?self.config.interception_mode(),
            images,
            incident_id = %context.incident_id(),
            "Crash reporter armed"
        );
        Ok(())
    }

    /// Returns a report of `thread` as it is right now, without terminating anything.
    ///
    /// Works whether or not the reporter is armed, and never touches the live-report slot.
    pub fn generate_live_report(
        &self,
        thread: ThreadHandle,
        exception_description: Option<&str>,
    ) -> Result<Vec<u8>, LiveReportError> {
        let context = ReportContext {
            metadata_json: &self.metadata_json,
            config_json: &self.config_json,
            custom_data: self.custom_data.as_deref(),
            exception_description,
        };
        live_report::generate_live_report(
            self.config.base_path(),
            self.config.max_report_bytes(),
            thread,
            &context,
        )
    }
}

fn arm_interceptor(config: &ReporterConfig) -> Result<(), ArmError> {
    match config.interception_mode() {
        InterceptionMode::Signal => arm_signal_handlers(
            &MONITORED_SIGNALS,
            config.create_alt_stack(),
            config.use_alt_stack(),
        )?,
        InterceptionMode::ExceptionPort => {
            let mask = exception_mask(guard_supported(os_info::get().version()));
            exception_port::arm(mask)?;
            let signals = arm_signal_handlers(
                &EXCEPTION_PORT_SIGNALS,
                config.create_alt_stack(),
                config.use_alt_stack(),
            );
            if let Err(e) = signals {
                exception_port::disarm();
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::CaptureReport;
    use crate::shared::configuration::SymbolicationStrategy;
    use libc::{c_void, siginfo_t, ucontext_t};

    extern "C" fn noop(_: *mut siginfo_t, _: *mut ucontext_t, _: *mut c_void) {}

    fn reporter(base: &std::path::Path, mode: InterceptionMode) -> anyhow::Result<CrashReporter> {
        let config = ReporterConfig::new(
            base,
            mode,
            SymbolicationStrategy::SYMBOL_TABLE,
            1 << 20,
            false,
            false,
        )?;
        CrashReporter::new(config, AppMetadata::new("com.example.reporter", "2.0"))
    }

    #[test]
    fn test_set_crash_callbacks_validates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut reporter = reporter(dir.path(), InterceptionMode::Signal)?;
        let bad = CrashCallbacks {
            version: 3,
            ..CrashCallbacks::new(std::ptr::null_mut(), noop)
        };
        assert_eq!(
            reporter.set_crash_callbacks(bad),
            Err(CallbackError::UnknownVersion(3))
        );
        reporter.set_crash_callbacks(CrashCallbacks::new(std::ptr::null_mut(), noop))?;
        assert_eq!(reporter.live_report_path(), dir.path().join("live_report"));
        assert_eq!(
            reporter.queued_reports_path(),
            dir.path().join("queued_reports")
        );
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_live_report_on_unarmed_reporter() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut reporter = reporter(dir.path(), InterceptionMode::Signal)?;
        reporter.set_custom_data(Some(b"session=42".to_vec()));

        for _ in 0..2 {
            let bytes = reporter.generate_live_report(ThreadHandle::current(), Some("checkpoint"))?;
            let report = CaptureReport::parse(&bytes)?;
            assert!(report.complete);
            assert_eq!(report.custom_data.as_deref(), Some(&b"session=42"[..]));
            assert_eq!(report.exception.as_deref(), Some("checkpoint"));
            let metadata = report
                .metadata
                .ok_or_else(|| anyhow::anyhow!("missing metadata"))?;
            assert_eq!(metadata.app_identifier, "com.example.reporter");
            assert_eq!(report.config.as_ref(), Some(reporter.config()));
        }
        assert!(!reporter.live_report_path().exists());
        assert!(!reporter.is_armed());
        Ok(())
    }

    #[test]
    #[cfg(not(target_os = "macos"))]
    fn test_exception_port_mode_is_unsupported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut reporter = reporter(dir.path(), InterceptionMode::ExceptionPort)?;
        match reporter.arm() {
            Err(ArmError::ExceptionPort(ExceptionPortError::Unsupported)) => (),
            // Another test of this process holds the slot.
            Err(ArmError::Busy) => (),
            other => anyhow::bail!("unexpected arm result: {other:?}"),
        }
        assert!(!reporter.is_armed());
        Ok(())
    }
}
