// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::shared::constants;
use anyhow::Context;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How faults reach the reporter.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptionMode {
    /// POSIX signal handlers for the monitored signal set.
    Signal,
    /// Mach exception ports, with SIGABRT still routed through a signal handler.
    /// Only available on macOS.
    ExceptionPort,
}

impl FromStr for InterceptionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signal" => Ok(Self::Signal),
            "exception_port" | "mach" => Ok(Self::ExceptionPort),
            other => anyhow::bail!("Unknown interception mode {other:?}"),
        }
    }
}

bitflags! {
    /// Which symbolication data a consumer of the report intends to use.
    /// Nothing is symbolicated in process; the value is recorded in the report so that the
    /// offline symbolicator knows what it may rely on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SymbolicationStrategy: u32 {
        /// Resolve through the symbol tables of the images listed in the report.
        const SYMBOL_TABLE = 1 << 0;
        /// Resolve through language runtime metadata embedded in the images.
        const RUNTIME_METADATA = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReporterConfig {
    base_path: PathBuf,
    create_alt_stack: bool,
    interception_mode: InterceptionMode,
    max_report_bytes: usize,
    symbolication: SymbolicationStrategy,
    use_alt_stack: bool,
}

impl ReporterConfig {
    pub fn new(
        base_path: impl Into<PathBuf>,
        interception_mode: InterceptionMode,
        symbolication: SymbolicationStrategy,
        max_report_bytes: usize,
        create_alt_stack: bool,
        use_alt_stack: bool,
    ) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        anyhow::ensure!(
            !base_path.as_os_str().is_empty(),
            "The base storage path must not be empty"
        );
        anyhow::ensure!(max_report_bytes > 0, "The report byte budget must be positive");
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        Ok(Self {
            base_path,
            create_alt_stack,
            interception_mode,
            max_report_bytes,
            symbolication,
            use_alt_stack,
        })
    }

    /// Builds the default configuration for `base_path`, then applies the
    /// `CRASHCAPTURE_MAX_REPORT_BYTES` and `CRASHCAPTURE_INTERCEPTION_MODE` overrides.
    pub fn from_env(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let max_bytes = std::env::var(constants::ENV_MAX_REPORT_BYTES).ok();
        let mode = std::env::var(constants::ENV_INTERCEPTION_MODE).ok();
        Self::with_overrides(base_path, max_bytes.as_deref(), mode.as_deref())
    }

    fn with_overrides(
        base_path: impl Into<PathBuf>,
        max_report_bytes: Option<&str>,
        interception_mode: Option<&str>,
    ) -> anyhow::Result<Self> {
        let max_report_bytes = match max_report_bytes {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {v:?}", constants::ENV_MAX_REPORT_BYTES))?,
            None => constants::DEFAULT_MAX_REPORT_BYTES,
        };
        let interception_mode = match interception_mode {
            Some(v) => v.parse()?,
            None => InterceptionMode::Signal,
        };
        Self::new(
            base_path,
            interception_mode,
            SymbolicationStrategy::SYMBOL_TABLE,
            max_report_bytes,
            true,
            true,
        )
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The single-slot file a fatal report is written to.
    pub fn live_report_path(&self) -> PathBuf {
        self.base_path.join(constants::LIVE_REPORT_FILENAME)
    }

    pub fn queued_reports_path(&self) -> PathBuf {
        self.base_path.join(constants::QUEUED_REPORTS_DIRNAME)
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn interception_mode(&self) -> InterceptionMode {
        self.interception_mode
    }

    pub fn max_report_bytes(&self) -> usize {
        self.max_report_bytes
    }

    pub fn symbolication(&self) -> SymbolicationStrategy {
        self.symbolication
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn set_max_report_bytes(&mut self, max_report_bytes: usize) -> anyhow::Result<()> {
        anyhow::ensure!(max_report_bytes > 0, "The report byte budget must be positive");
        self.max_report_bytes = max_report_bytes;
        Ok(())
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates() {
        assert!(ReporterConfig::new(
            "",
            InterceptionMode::Signal,
            SymbolicationStrategy::empty(),
            1024,
            false,
            false
        )
        .is_err());
        assert!(ReporterConfig::new(
            "/tmp/crashes",
            InterceptionMode::Signal,
            SymbolicationStrategy::empty(),
            0,
            false,
            false
        )
        .is_err());
        assert!(ReporterConfig::new(
            "/tmp/crashes",
            InterceptionMode::Signal,
            SymbolicationStrategy::empty(),
            1024,
            true,
            false
        )
        .is_err());
    }

    #[test]
    fn test_paths() -> anyhow::Result<()> {
        let config = ReporterConfig::new(
            "/tmp/crashes",
            InterceptionMode::Signal,
            SymbolicationStrategy::all(),
            1024,
            false,
            true,
        )?;
        assert_eq!(
            config.live_report_path(),
            PathBuf::from("/tmp/crashes/live_report")
        );
        assert_eq!(
            config.queued_reports_path(),
            PathBuf::from("/tmp/crashes/queued_reports")
        );
        Ok(())
    }

    #[test]
    fn test_alt_stack_setters() -> anyhow::Result<()> {
        let mut config = ReporterConfig::with_overrides("/tmp/crashes", None, None)?;
        assert!(config.create_alt_stack());
        assert!(config.set_use_alt_stack(false).is_err());
        config.set_create_alt_stack(false)?;
        config.set_use_alt_stack(false)?;
        assert!(!config.use_alt_stack());
        Ok(())
    }

    #[test]
    fn test_overrides() -> anyhow::Result<()> {
        let config = ReporterConfig::with_overrides("/tmp/crashes", Some(" 4096 "), Some("mach"))?;
        assert_eq!(config.max_report_bytes(), 4096);
        assert_eq!(config.interception_mode(), InterceptionMode::ExceptionPort);

        let config = ReporterConfig::with_overrides("/tmp/crashes", None, None)?;
        assert_eq!(
            config.max_report_bytes(),
            constants::DEFAULT_MAX_REPORT_BYTES
        );
        assert_eq!(config.interception_mode(), InterceptionMode::Signal);

        assert!(ReporterConfig::with_overrides("/tmp/crashes", Some("lots"), None).is_err());
        assert!(ReporterConfig::with_overrides("/tmp/crashes", None, Some("ptrace")).is_err());
        assert!(ReporterConfig::with_overrides("/tmp/crashes", Some("0"), None).is_err());
        Ok(())
    }

    #[test]
    fn test_serde_roundtrip() -> anyhow::Result<()> {
        let config = ReporterConfig::new(
            "/tmp/crashes",
            InterceptionMode::ExceptionPort,
            SymbolicationStrategy::SYMBOL_TABLE,
            1024,
            true,
            true,
        )?;
        let json = serde_json::to_string(&config)?;
        assert!(json.contains("\"interception_mode\":\"exception_port\""));
        let back: ReporterConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);
        Ok(())
    }
}
