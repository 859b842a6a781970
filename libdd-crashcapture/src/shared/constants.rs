// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants shared by the report writer and the report parser.
//!
//! A report is a line-oriented text file. Every section starts with a `BEGIN` marker on its own
//! line and ends with the matching `END` marker. The lines in between are JSON documents, one per
//! line. Sections are written in a fixed order, and the file ends with [`CRASHCAPTURE_DONE`].
//! A file that lacks the `DONE` marker was truncated, either by the byte budget or by a failure
//! while writing.

/// First line of every report. Bumped whenever the section layout changes.
pub const CRASHCAPTURE_REPORT_HEADER: &str = "CRASHCAPTURE_REPORT_V1";

/// Marks the beginning of the metadata section.
/// The section contains a JSON-serialized `AppMetadata` object.
pub const CRASHCAPTURE_BEGIN_METADATA: &str = "CRASHCAPTURE_BEGIN_METADATA";
/// Marks the end of the metadata section.
pub const CRASHCAPTURE_END_METADATA: &str = "CRASHCAPTURE_END_METADATA";

/// Marks the beginning of the configuration section.
/// The section contains a JSON-serialized `ReporterConfig` object.
pub const CRASHCAPTURE_BEGIN_CONFIG: &str = "CRASHCAPTURE_BEGIN_CONFIG";
/// Marks the end of the configuration section.
pub const CRASHCAPTURE_END_CONFIG: &str = "CRASHCAPTURE_END_CONFIG";

/// Marks the beginning of the timestamp section: `{"secs": .., "nanos": ..}` taken from
/// `CLOCK_REALTIME` when the report was started.
pub const CRASHCAPTURE_BEGIN_TIMESTAMP: &str = "CRASHCAPTURE_BEGIN_TIMESTAMP";
/// Marks the end of the timestamp section.
pub const CRASHCAPTURE_END_TIMESTAMP: &str = "CRASHCAPTURE_END_TIMESTAMP";

/// Marks the beginning of the custom data section: a JSON string holding the hex encoding of the
/// user-supplied blob.
pub const CRASHCAPTURE_BEGIN_CUSTOM_DATA: &str = "CRASHCAPTURE_BEGIN_CUSTOM_DATA";
/// Marks the end of the custom data section.
pub const CRASHCAPTURE_END_CUSTOM_DATA: &str = "CRASHCAPTURE_END_CUSTOM_DATA";

/// Marks the beginning of the exception section: a JSON string with the description of the
/// uncaught exception that led to the fault.
pub const CRASHCAPTURE_BEGIN_EXCEPTION: &str = "CRASHCAPTURE_BEGIN_EXCEPTION";
/// Marks the end of the exception section.
pub const CRASHCAPTURE_END_EXCEPTION: &str = "CRASHCAPTURE_END_EXCEPTION";

/// Marks the beginning of the fault section: signal number, code, names and faulting address,
/// plus the Mach exception when the fault came through an exception port.
pub const CRASHCAPTURE_BEGIN_FAULT: &str = "CRASHCAPTURE_BEGIN_FAULT";
/// Marks the end of the fault section.
pub const CRASHCAPTURE_END_FAULT: &str = "CRASHCAPTURE_END_FAULT";

/// Marks the beginning of the thread section: the id of the crashed thread and its registers.
pub const CRASHCAPTURE_BEGIN_THREAD: &str = "CRASHCAPTURE_BEGIN_THREAD";
/// Marks the end of the thread section.
pub const CRASHCAPTURE_END_THREAD: &str = "CRASHCAPTURE_END_THREAD";

/// Marks the beginning of the image section. One `{"load_address": .., "path": ..}` per line.
pub const CRASHCAPTURE_BEGIN_IMAGES: &str = "CRASHCAPTURE_BEGIN_IMAGES";
/// Marks the end of the image section.
pub const CRASHCAPTURE_END_IMAGES: &str = "CRASHCAPTURE_END_IMAGES";

/// Marks the beginning of the stack trace section. One `{"ip": .., "sp": .., "bp": ..}` per line,
/// innermost frame first. Written last, since walking a damaged stack is the step most likely to
/// go wrong.
pub const CRASHCAPTURE_BEGIN_STACKTRACE: &str = "CRASHCAPTURE_BEGIN_STACKTRACE";
/// Marks the end of the stack trace section.
pub const CRASHCAPTURE_END_STACKTRACE: &str = "CRASHCAPTURE_END_STACKTRACE";

/// Last line of a complete report.
pub const CRASHCAPTURE_DONE: &str = "CRASHCAPTURE_DONE";

/// Name of the single-slot report file inside the base directory.
pub const LIVE_REPORT_FILENAME: &str = "live_report";
/// Name of the directory the surrounding system promotes reports into.
pub const QUEUED_REPORTS_DIRNAME: &str = "queued_reports";
/// Prefix of the private scratch files used by live reports.
pub const SCRATCH_REPORT_PREFIX: &str = ".live_report";

/// Default byte budget of a single report.
pub const DEFAULT_MAX_REPORT_BYTES: usize = 256 * 1024;

/// Maximum number of frames walked for the stack trace section.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

/// Environment variable overriding the report byte budget.
pub const ENV_MAX_REPORT_BYTES: &str = "CRASHCAPTURE_MAX_REPORT_BYTES";
/// Environment variable overriding the interception mode (`signal` or `exception_port`).
pub const ENV_INTERCEPTION_MODE: &str = "CRASHCAPTURE_INTERCEPTION_MODE";
