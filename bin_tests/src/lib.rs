// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared pieces of the `crashing_test_app` binary and of the tests that drive it.
//!
//! The binary takes two arguments, a [`CrashMode`] and a base directory. It arms a reporter on
//! that directory and then does whatever the mode asks for, usually crashing.

/// Marker written to stdout by the crash callback.
pub const CALLBACK_MARKER: &str = "callback ran";
/// Written by the crash callback when SIGSEGV was back at its default disposition.
pub const DEFAULT_DISPOSITION_MARKER: &str = "SIGSEGV disposition is default";
/// Printed when a second reporter could not be armed.
pub const BUSY_MARKER: &str = "second reporter is busy";
/// Name of the file the live report mode copies its reports into.
pub const LIVE_COPY_FILENAME: &str = "live_copy";
/// Number of threads faulting together in [`CrashMode::ConcurrentSegv`].
pub const CONCURRENT_THREADS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashMode {
    Segv,
    Abort,
    ConcurrentSegv,
    DoubleArm,
    Callback,
    UncaughtException,
    LiveReport,
    Panic,
}

impl CrashMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Segv => "segv",
            Self::Abort => "abort",
            Self::ConcurrentSegv => "concurrent_segv",
            Self::DoubleArm => "double_arm",
            Self::Callback => "callback",
            Self::UncaughtException => "uncaught_exception",
            Self::LiveReport => "live_report",
            Self::Panic => "panic",
        }
    }

    /// The signal the app is expected to die from, or `None` when it exits normally.
    pub const fn expected_signal(self) -> Option<i32> {
        match self {
            Self::Segv | Self::ConcurrentSegv | Self::DoubleArm | Self::Callback => {
                Some(libc::SIGSEGV)
            }
            Self::Abort | Self::UncaughtException | Self::Panic => Some(libc::SIGABRT),
            Self::LiveReport => None,
        }
    }
}

impl std::fmt::Display for CrashMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segv" => Ok(Self::Segv),
            "abort" => Ok(Self::Abort),
            "concurrent_segv" => Ok(Self::ConcurrentSegv),
            "double_arm" => Ok(Self::DoubleArm),
            "callback" => Ok(Self::Callback),
            "uncaught_exception" => Ok(Self::UncaughtException),
            "live_report" => Ok(Self::LiveReport),
            "panic" => Ok(Self::Panic),
            _ => Err(format!("Unknown crash mode: {s}")),
        }
    }
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        println!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}
