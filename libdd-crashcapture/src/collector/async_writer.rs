// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A buffered file writer that can be used from a signal handler.
//!
//! Only `open`, `write` and `close` are called, straight through `libc`. The buffer lives inside
//! the writer, which itself lives on the stack of the caller, so no operation allocates or takes a
//! lock. The total number of bytes accepted is capped by a byte budget: once the budget is
//! reached, the part of a write that still fits is kept and the rest is rejected with
//! [`WriterError::BudgetExceeded`].

use errno::{errno, Errno};
use std::ffi::CStr;
use std::io;
use thiserror::Error;

const BUFFER_SIZE: usize = 1024;
const REPORT_FILE_MODE: libc::c_uint = 0o644;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriterError {
    #[error("Failed to open report file: {0}")]
    Open(Errno),
    #[error("Failed to write report file: {0}")]
    Write(Errno),
    #[error("Report exceeded its budget of {budget} bytes")]
    BudgetExceeded { budget: usize },
    #[error("Failed to flush report file: {0}")]
    Flush(Errno),
    #[error("Failed to close report file: {0}")]
    Close(Errno),
}

pub struct BoundedWriter {
    fd: libc::c_int,
    buffer: [u8; BUFFER_SIZE],
    buffered: usize,
    accepted: usize,
    budget: usize,
    last_error: Option<WriterError>,
    closed: bool,
}

impl BoundedWriter {
    /// Creates or truncates `path` with mode `0644`.
    ///
    /// SIGNAL SAFETY:
    ///     `path` must have been built before the fault. This function only calls `open(2)`.
    pub fn open(path: &CStr, budget: usize) -> Result<Self, WriterError> {
        // SAFETY: `path` is a valid nul-terminated string.
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                REPORT_FILE_MODE,
            )
        };
        if fd < 0 {
            return Err(WriterError::Open(errno()));
        }
        Ok(Self {
            fd,
            buffer: [0; BUFFER_SIZE],
            buffered: 0,
            accepted: 0,
            budget,
            last_error: None,
            closed: false,
        })
    }

    /// Number of bytes accepted so far, flushed or not.
    pub fn bytes_accepted(&self) -> usize {
        self.accepted
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Returns the structured cause of the last failed `io::Write` call, if any.
    pub fn take_error(&mut self) -> Option<WriterError> {
        self.last_error.take()
    }

    /// Appends `bytes`, keeping whatever prefix still fits in the budget.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Write(Errno(libc::EBADF)));
        }
        let remaining = self.budget.saturating_sub(self.accepted);
        let fits = &bytes[..bytes.len().min(remaining)];

        let mut rest = fits;
        while !rest.is_empty() {
            if self.buffered == BUFFER_SIZE {
                self.drain().map_err(WriterError::Write)?;
            }
            let n = rest.len().min(BUFFER_SIZE - self.buffered);
            self.buffer[self.buffered..self.buffered + n].copy_from_slice(&rest[..n]);
            self.buffered += n;
            self.accepted += n;
            rest = &rest[n..];
        }

        if fits.len() < bytes.len() {
            return Err(WriterError::BudgetExceeded {
                budget: self.budget,
            });
        }
        Ok(())
    }

    /// Pushes buffered bytes to the file descriptor.
    pub fn flush_buffer(&mut self) -> Result<(), WriterError> {
        if self.closed {
            return Ok(());
        }
        self.drain().map_err(WriterError::Flush)
    }

    /// Flushes and closes the file descriptor.
    /// The descriptor is closed even when the flush fails; the flush error is returned first.
    pub fn close(&mut self) -> Result<(), WriterError> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush_buffer();
        self.closed = true;
        // SAFETY: `fd` was returned by `open` and has not been closed yet.
        let rval = unsafe { libc::close(self.fd) };
        flushed?;
        if rval != 0 {
            return Err(WriterError::Close(errno()));
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), Errno> {
        let mut start = 0;
        while start < self.buffered {
            let pending = &self.buffer[start..self.buffered];
            // SAFETY: `pending` is a valid slice for the length passed.
            let rval = unsafe {
                libc::write(
                    self.fd,
                    pending.as_ptr() as *const libc::c_void,
                    pending.len(),
                )
            };
            if rval < 0 {
                let e = errno();
                if e.0 == libc::EINTR {
                    continue;
                }
                return Err(e);
            }
            if rval == 0 {
                return Err(Errno(libc::EIO));
            }
            start += rval as usize;
        }
        self.buffered = 0;
        Ok(())
    }
}

impl io::Write for BoundedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_bytes(buf) {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                self.last_error = Some(e);
                // `From<ErrorKind>` does not allocate.
                Err(io::Error::from(io::ErrorKind::Other))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer().map_err(|e| {
            self.last_error = Some(e);
            io::Error::from(io::ErrorKind::Other)
        })
    }
}

impl Drop for BoundedWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Write;
    use std::os::unix::ffi::OsStrExt;

    fn c_path(dir: &tempfile::TempDir, name: &str) -> CString {
        #[allow(clippy::unwrap_used)]
        CString::new(dir.path().join(name).as_os_str().as_bytes()).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_and_close() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = c_path(&dir, "report");
        let mut w = BoundedWriter::open(&path, 1 << 20)?;
        for i in 0..1000 {
            writeln!(w, "line {i}")?;
        }
        w.close()?;
        let contents = std::fs::read_to_string(dir.path().join("report"))?;
        assert_eq!(contents.lines().count(), 1000);
        assert!(contents.ends_with("line 999\n"));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_open_truncates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("report"), "old contents that are long")?;
        let mut w = BoundedWriter::open(&c_path(&dir, "report"), 100)?;
        w.write_bytes(b"new")?;
        w.close()?;
        assert_eq!(std::fs::read(dir.path().join("report"))?, b"new");
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_budget_is_a_hard_cap() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = BoundedWriter::open(&c_path(&dir, "report"), 10)?;
        w.write_bytes(b"12345")?;
        assert_eq!(
            w.write_bytes(b"6789abcdef"),
            Err(WriterError::BudgetExceeded { budget: 10 })
        );
        assert_eq!(
            w.write_bytes(b"x"),
            Err(WriterError::BudgetExceeded { budget: 10 })
        );
        assert_eq!(w.bytes_accepted(), 10);
        w.close()?;
        assert_eq!(std::fs::read(dir.path().join("report"))?, b"123456789a");
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_io_write_records_structured_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = BoundedWriter::open(&c_path(&dir, "report"), 4)?;
        assert!(write!(w, "{}", 123456).is_err());
        assert_eq!(
            w.take_error(),
            Some(WriterError::BudgetExceeded { budget: 4 })
        );
        assert_eq!(w.take_error(), None);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_open_missing_directory() {
        let path = CString::new("/nonexistent-dir-for-crashcapture/report").unwrap_or_default();
        assert!(matches!(
            BoundedWriter::open(&path, 10),
            Err(WriterError::Open(Errno(libc::ENOENT)))
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_after_close() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = BoundedWriter::open(&c_path(&dir, "report"), 10)?;
        w.close()?;
        assert!(matches!(w.write_bytes(b"a"), Err(WriterError::Write(_))));
        assert!(w.close().is_ok());
        Ok(())
    }
}
