// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash capture for a single process.
//!
//! A [`CrashReporter`] intercepts fatal faults, either through POSIX signal handlers or through
//! Mach exception ports on macOS, and writes one self-describing report into
//! `<base_path>/live_report` before the process terminates. Everything the fault path needs is
//! prepared while arming, so that the handler itself only performs async-signal-safe work:
//! no allocation, no locks and no formatting beyond integers and pre-built strings.
//!
//! Reports can also be produced on demand, without a fault, with
//! [`CrashReporter::generate_live_report`]. Either kind of report is read back with
//! [`CaptureReport::parse`].
//!
//! Moving the live report into `queued_reports`, uploading it, and symbolicating it are left to
//! the surrounding system.

#![cfg(unix)]

mod collector;
mod report;
mod shared;

pub use collector::*;
pub use report::*;
pub use shared::configuration::{InterceptionMode, ReporterConfig, SymbolicationStrategy};
pub use shared::constants;
pub use shared::metadata::{AppMetadata, OsInfo};
