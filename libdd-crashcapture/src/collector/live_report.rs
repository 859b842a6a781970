// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::async_writer::{BoundedWriter, WriterError};
use crate::collector::emitters::{write_report, EmitterError, ReportContext};
use crate::collector::fault_info::FaultInfo;
use crate::collector::image_registry::IMAGE_REGISTRY;
use crate::collector::thread_state::ThreadHandle;
use crate::shared::constants::SCRATCH_REPORT_PREFIX;
use std::ffi::{CString, NulError};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LiveReportError {
    #[error("Scratch report path contains a nul byte: {0}")]
    Path(#[from] NulError),
    #[error("Unable to open the scratch report: {0}")]
    Writer(WriterError),
    #[error(transparent)]
    Emitter(#[from] EmitterError),
    #[error("Unable to read back the scratch report: {0}")]
    ReadBack(#[source] io::Error),
}

/// Removes the scratch file however generation ends.
struct ScratchFile {
    path: PathBuf,
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Unable to remove scratch report: {e}");
            }
        }
    }
}

/// Produces a report for `thread` without a fault and returns its bytes.
///
/// The report goes through a private scratch file under `base_path`, so the live-report slot is
/// left untouched and concurrent calls do not share a file. The report gate is not consulted.
pub(crate) fn generate_live_report(
    base_path: &Path,
    budget: usize,
    thread: ThreadHandle,
    context: &ReportContext<'_>,
) -> Result<Vec<u8>, LiveReportError> {
    let scratch = ScratchFile {
        path: base_path.join(format!("{SCRATCH_REPORT_PREFIX}.{}", Uuid::new_v4())),
    };
    let c_path = CString::new(scratch.path.as_os_str().as_bytes())?;
    let mut writer = BoundedWriter::open(&c_path, budget).map_err(LiveReportError::Writer)?;

    let images = IMAGE_REGISTRY.snapshot_for_report();
    write_report(
        &mut writer,
        thread,
        &images,
        &FaultInfo::live(),
        None,
        context,
    )?;
    drop(images);

    let bytes = std::fs::read(&scratch.path).map_err(LiveReportError::ReadBack)?;
    tracing::debug!(bytes = bytes.len(), "Generated live report");
    Ok(bytes)
}
