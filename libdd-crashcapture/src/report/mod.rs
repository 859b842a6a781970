// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reading a report back into typed data.
//!
//! Reports are written one section at a time, so a report cut short by its byte budget or by a
//! failure while writing still holds every section that was finished before the cut.
//! [`CaptureReport::parse`] keeps those sections and sets `complete` to false.

use crate::collector::{ImageDescriptor, RawFrame};
use crate::shared::configuration::ReporterConfig;
use crate::shared::constants::*;
use crate::shared::metadata::AppMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("Report does not start with {CRASHCAPTURE_REPORT_HEADER}")]
    MissingHeader,
    #[error("Report is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Line {line}: custom data is not a hex string")]
    CustomData { line: usize },
    #[error("Line {line}: timestamp out of range")]
    Timestamp { line: usize },
    #[error("Line {line}: unexpected {text:?}")]
    UnexpectedLine { line: usize, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedMachException {
    #[serde(rename = "type")]
    pub exception_type: i32,
    pub name: String,
    pub codes: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedFault {
    pub signo: i32,
    pub signame: String,
    pub code: i32,
    pub codename: String,
    pub address: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mach_exception: Option<ReportedMachException>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedThread {
    pub thread_id: u64,
    pub crashed: bool,
    pub registers: BTreeMap<String, u64>,
}

#[derive(Deserialize)]
struct ReportTimestamp {
    secs: i64,
    nanos: u32,
}

/// A parsed report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureReport {
    pub metadata: Option<AppMetadata>,
    pub config: Option<ReporterConfig>,
    pub timestamp: Option<DateTime<Utc>>,
    pub custom_data: Option<Vec<u8>>,
    pub exception: Option<String>,
    pub fault: Option<ReportedFault>,
    pub thread: Option<ReportedThread>,
    pub images: Vec<ImageDescriptor>,
    pub frames: Vec<RawFrame>,
    /// Whether the report ends with the `DONE` marker.
    pub complete: bool,
}

/// The section the parser is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportState {
    Config,
    CustomData,
    Done,
    Exception,
    Fault,
    Images,
    Metadata,
    StackTrace,
    Thread,
    Timestamp,
    Waiting,
}

impl CaptureReport {
    pub fn parse(bytes: &[u8]) -> Result<Self, ReportParseError> {
        // A line without its newline was cut short.
        let whole_lines = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(last) => &bytes[..=last],
            None => &[][..],
        };
        let text = std::str::from_utf8(whole_lines)?;
        let mut lines = text.lines().enumerate();
        match lines.next() {
            Some((_, header)) if header == CRASHCAPTURE_REPORT_HEADER => (),
            _ => return Err(ReportParseError::MissingHeader),
        }

        let mut report = CaptureReport::default();
        let mut state = ReportState::Waiting;
        for (index, line) in lines {
            state = report.process_line(index + 1, line, state)?;
        }
        report.complete = state == ReportState::Done;
        Ok(report)
    }

    /// Returns the state for the next line.
    fn process_line(
        &mut self,
        line_number: usize,
        line: &str,
        state: ReportState,
    ) -> Result<ReportState, ReportParseError> {
        let json = |source| ReportParseError::Json {
            line: line_number,
            source,
        };
        let next = match state {
            ReportState::Config if line == CRASHCAPTURE_END_CONFIG => ReportState::Waiting,
            ReportState::Config => {
                self.config = Some(serde_json::from_str(line).map_err(json)?);
                ReportState::Config
            }

            ReportState::CustomData if line == CRASHCAPTURE_END_CUSTOM_DATA => ReportState::Waiting,
            ReportState::CustomData => {
                let hex: String = serde_json::from_str(line).map_err(json)?;
                let data = decode_hex(&hex)
                    .ok_or(ReportParseError::CustomData { line: line_number })?;
                self.custom_data = Some(data);
                ReportState::CustomData
            }

            ReportState::Done => {
                return Err(ReportParseError::UnexpectedLine {
                    line: line_number,
                    text: line.to_string(),
                })
            }

            ReportState::Exception if line == CRASHCAPTURE_END_EXCEPTION => ReportState::Waiting,
            ReportState::Exception => {
                self.exception = Some(serde_json::from_str(line).map_err(json)?);
                ReportState::Exception
            }

            ReportState::Fault if line == CRASHCAPTURE_END_FAULT => ReportState::Waiting,
            ReportState::Fault => {
                self.fault = Some(serde_json::from_str(line).map_err(json)?);
                ReportState::Fault
            }

            ReportState::Images if line == CRASHCAPTURE_END_IMAGES => ReportState::Waiting,
            ReportState::Images => {
                self.images.push(serde_json::from_str(line).map_err(json)?);
                ReportState::Images
            }

            ReportState::Metadata if line == CRASHCAPTURE_END_METADATA => ReportState::Waiting,
            ReportState::Metadata => {
                self.metadata = Some(serde_json::from_str(line).map_err(json)?);
                ReportState::Metadata
            }

            ReportState::StackTrace if line == CRASHCAPTURE_END_STACKTRACE => ReportState::Waiting,
            ReportState::StackTrace => {
                self.frames.push(serde_json::from_str(line).map_err(json)?);
                ReportState::StackTrace
            }

            ReportState::Thread if line == CRASHCAPTURE_END_THREAD => ReportState::Waiting,
            ReportState::Thread => {
                self.thread = Some(serde_json::from_str(line).map_err(json)?);
                ReportState::Thread
            }

            ReportState::Timestamp if line == CRASHCAPTURE_END_TIMESTAMP => ReportState::Waiting,
            ReportState::Timestamp => {
                let ts: ReportTimestamp = serde_json::from_str(line).map_err(json)?;
                let timestamp = DateTime::from_timestamp(ts.secs, ts.nanos)
                    .ok_or(ReportParseError::Timestamp { line: line_number })?;
                self.timestamp = Some(timestamp);
                ReportState::Timestamp
            }

            ReportState::Waiting => match line {
                CRASHCAPTURE_BEGIN_CONFIG => ReportState::Config,
                CRASHCAPTURE_BEGIN_CUSTOM_DATA => ReportState::CustomData,
                CRASHCAPTURE_BEGIN_EXCEPTION => ReportState::Exception,
                CRASHCAPTURE_BEGIN_FAULT => ReportState::Fault,
                CRASHCAPTURE_BEGIN_IMAGES => ReportState::Images,
                CRASHCAPTURE_BEGIN_METADATA => ReportState::Metadata,
                CRASHCAPTURE_BEGIN_STACKTRACE => ReportState::StackTrace,
                CRASHCAPTURE_BEGIN_THREAD => ReportState::Thread,
                CRASHCAPTURE_BEGIN_TIMESTAMP => ReportState::Timestamp,
                CRASHCAPTURE_DONE => ReportState::Done,
                _ => {
                    return Err(ReportParseError::UnexpectedLine {
                        line: line_number,
                        text: line.to_string(),
                    })
                }
            },
        };
        Ok(next)
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}
