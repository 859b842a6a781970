// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::async_writer::{BoundedWriter, WriterError};
use crate::collector::fault_info::FaultInfo;
use crate::collector::image_registry::ImageSnapshot;
use crate::collector::memory::FrameWalker;
use crate::collector::thread_state::{capture_live, CaptureError, ThreadHandle, ThreadSnapshot};
use crate::shared::constants::*;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to capture the crashed thread: {0}")]
    Capture(#[from] CaptureError),
}

/// Everything about the process that was prepared before the fault.
/// All of it is borrowed, so building one does not allocate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportContext<'a> {
    pub metadata_json: &'a str,
    pub config_json: &'a str,
    pub custom_data: Option<&'a [u8]>,
    pub exception_description: Option<&'a str>,
}

/// Streams one complete report into `writer`, then closes it.
///
/// When `thread_state` is `None`, `faulting_thread` is captured live and the report is written
/// while that thread is held still.
///
/// SIGNAL SAFETY:
///     With `thread_state` provided, this only formats integers and string slices into the
///     writer's fixed buffer, reads memory through the kernel, and calls `write`/`close`.
///     Live capture is ordinary code.
pub fn write_report(
    writer: &mut BoundedWriter,
    faulting_thread: ThreadHandle,
    images: &ImageSnapshot<'_>,
    fault_info: &FaultInfo,
    thread_state: Option<&ThreadSnapshot>,
    context: &ReportContext<'_>,
) -> Result<(), EmitterError> {
    let emitted = match thread_state {
        Some(snapshot) => emit_report(writer, images, fault_info, snapshot, context),
        None => {
            let captured = capture_live(faulting_thread, |snapshot| {
                emit_report(&mut *writer, images, fault_info, snapshot, context)
            });
            match captured {
                Ok(emitted) => emitted,
                Err(e) => {
                    let _ = writer.close();
                    return Err(e.into());
                }
            }
        }
    };
    let emitted = emitted.map_err(|e| match writer.take_error() {
        Some(cause) => EmitterError::Writer(cause),
        None => EmitterError::Io(e),
    });
    let closed = writer.close();
    emitted?;
    closed?;
    Ok(())
}

fn emit_report(
    w: &mut impl Write,
    images: &ImageSnapshot<'_>,
    fault_info: &FaultInfo,
    snapshot: &ThreadSnapshot,
    context: &ReportContext<'_>,
) -> io::Result<()> {
    writeln!(w, "{CRASHCAPTURE_REPORT_HEADER}")?;
    emit_text_section(
        w,
        CRASHCAPTURE_BEGIN_METADATA,
        CRASHCAPTURE_END_METADATA,
        context.metadata_json,
    )?;
    emit_text_section(
        w,
        CRASHCAPTURE_BEGIN_CONFIG,
        CRASHCAPTURE_END_CONFIG,
        context.config_json,
    )?;
    emit_timestamp(w)?;
    if let Some(data) = context.custom_data {
        emit_custom_data(w, data)?;
    }
    if let Some(description) = context.exception_description {
        emit_exception(w, description)?;
    }
    emit_fault(w, fault_info)?;
    emit_thread(w, snapshot)?;
    emit_images(w, images.iter().map(|image| (image.load_address, image.path)))?;
    // Emitting the stacktrace last, since walking a corrupt stack is the riskiest step.
    emit_stacktrace(w, snapshot)?;
    writeln!(w, "{CRASHCAPTURE_DONE}")?;
    w.flush()?;
    Ok(())
}

fn emit_text_section(w: &mut impl Write, begin: &str, end: &str, body: &str) -> io::Result<()> {
    writeln!(w, "{begin}")?;
    if !body.is_empty() {
        writeln!(w, "{body}")?;
    }
    writeln!(w, "{end}")?;
    w.flush()
}

fn emit_timestamp(w: &mut impl Write) -> io::Result<()> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid timespec. clock_gettime is async-signal-safe.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    writeln!(w, "{CRASHCAPTURE_BEGIN_TIMESTAMP}")?;
    writeln!(
        w,
        "{{\"secs\": {}, \"nanos\": {}}}",
        now.tv_sec, now.tv_nsec
    )?;
    writeln!(w, "{CRASHCAPTURE_END_TIMESTAMP}")?;
    w.flush()
}

fn emit_custom_data(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    writeln!(w, "{CRASHCAPTURE_BEGIN_CUSTOM_DATA}")?;
    w.write_all(b"\"")?;
    let mut chunk = [0u8; 128];
    for bytes in data.chunks(chunk.len() / 2) {
        for (i, byte) in bytes.iter().enumerate() {
            chunk[2 * i] = HEX[(byte >> 4) as usize];
            chunk[2 * i + 1] = HEX[(byte & 0xf) as usize];
        }
        w.write_all(&chunk[..2 * bytes.len()])?;
    }
    w.write_all(b"\"\n")?;
    writeln!(w, "{CRASHCAPTURE_END_CUSTOM_DATA}")?;
    w.flush()
}

fn emit_exception(w: &mut impl Write, description: &str) -> io::Result<()> {
    writeln!(w, "{CRASHCAPTURE_BEGIN_EXCEPTION}")?;
    emit_json_string(w, description)?;
    writeln!(w)?;
    writeln!(w, "{CRASHCAPTURE_END_EXCEPTION}")?;
    w.flush()
}

/// Writes `s` as a quoted JSON string, escaping in place.
fn emit_json_string(w: &mut impl Write, s: &str) -> io::Result<()> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let bytes = s.as_bytes();
    w.write_all(b"\"")?;
    let mut run_start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let escape: Option<&[u8]> = match b {
            b'"' => Some(b"\\\""),
            b'\\' => Some(b"\\\\"),
            b'\n' => Some(b"\\n"),
            b'\r' => Some(b"\\r"),
            b'\t' => Some(b"\\t"),
            0..=0x1f => None,
            _ => continue,
        };
        w.write_all(&bytes[run_start..i])?;
        run_start = i + 1;
        match escape {
            Some(escaped) => w.write_all(escaped)?,
            None => w.write_all(&[
                b'\\',
                b'u',
                b'0',
                b'0',
                HEX[(b >> 4) as usize],
                HEX[(b & 0xf) as usize],
            ])?,
        }
    }
    w.write_all(&bytes[run_start..])?;
    w.write_all(b"\"")
}

fn emit_fault(w: &mut impl Write, fault_info: &FaultInfo) -> io::Result<()> {
    let signal = &fault_info.signal;
    writeln!(w, "{CRASHCAPTURE_BEGIN_FAULT}")?;
    write!(
        w,
        "{{\"signo\": {}, \"signame\": \"{}\", \"code\": {}, \"codename\": \"{}\", \"address\": {}",
        signal.signo,
        fault_info.signal_name(),
        signal.code,
        fault_info.code_name(),
        signal.address
    )?;
    if let Some(mach) = &fault_info.mach {
        write!(
            w,
            ", \"mach_exception\": {{\"type\": {}, \"name\": \"{}\", \"codes\": [",
            mach.exception_type,
            crate::collector::fault_info::mach_exception_name(mach.exception_type)
        )?;
        let count = (mach.code_count as usize).min(mach.codes.len());
        for (i, code) in mach.codes[..count].iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            write!(w, "{code}")?;
        }
        write!(w, "]}}")?;
    }
    writeln!(w, "}}")?;
    writeln!(w, "{CRASHCAPTURE_END_FAULT}")?;
    w.flush()
}

fn emit_thread(w: &mut impl Write, snapshot: &ThreadSnapshot) -> io::Result<()> {
    writeln!(w, "{CRASHCAPTURE_BEGIN_THREAD}")?;
    write!(
        w,
        "{{\"thread_id\": {}, \"crashed\": true, \"registers\": {{",
        snapshot.thread_id()
    )?;
    for (i, (name, value)) in snapshot.registers().iter().enumerate() {
        if i > 0 {
            write!(w, ", ")?;
        }
        write!(w, "\"{name}\": {value}")?;
    }
    writeln!(w, "}}}}")?;
    writeln!(w, "{CRASHCAPTURE_END_THREAD}")?;
    w.flush()
}

fn emit_images<'a>(
    w: &mut impl Write,
    images: impl Iterator<Item = (usize, &'a str)>,
) -> io::Result<()> {
    writeln!(w, "{CRASHCAPTURE_BEGIN_IMAGES}")?;
    for (load_address, path) in images {
        write!(w, "{{\"load_address\": {load_address}, \"path\": ")?;
        emit_json_string(w, path)?;
        writeln!(w, "}}")?;
    }
    writeln!(w, "{CRASHCAPTURE_END_IMAGES}")?;
    w.flush()
}

fn emit_stacktrace(w: &mut impl Write, snapshot: &ThreadSnapshot) -> io::Result<()> {
    writeln!(w, "{CRASHCAPTURE_BEGIN_STACKTRACE}")?;
    for frame in FrameWalker::new(snapshot, MAX_BACKTRACE_FRAMES) {
        writeln!(
            w,
            "{{\"ip\": {}, \"sp\": {}, \"bp\": {}}}",
            frame.ip, frame.sp, frame.bp
        )?;
    }
    writeln!(w, "{CRASHCAPTURE_END_STACKTRACE}")?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::image_registry::{ImageDescriptor, ImageRegistry};
    use crate::report::CaptureReport;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn to_string(bytes: Vec<u8>) -> anyhow::Result<String> {
        Ok(String::from_utf8(bytes)?)
    }

    #[test]
    fn test_emit_json_string_escapes() -> anyhow::Result<()> {
        let input = "quote\" backslash\\ newline\n tab\t bell\u{7} unicode é";
        let mut buf = Vec::new();
        emit_json_string(&mut buf, input)?;
        let decoded: String = serde_json::from_slice(&buf)?;
        assert_eq!(decoded, input);
        Ok(())
    }

    #[test]
    fn test_emit_custom_data_is_hex() -> anyhow::Result<()> {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut buf = Vec::new();
        emit_custom_data(&mut buf, &data)?;
        let out = to_string(buf)?;
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some(CRASHCAPTURE_BEGIN_CUSTOM_DATA));
        let hex: String = serde_json::from_str(lines.next().unwrap_or_default())?;
        assert_eq!(hex.len(), 512);
        assert!(hex.starts_with("000102"));
        assert!(hex.ends_with("fdfeff"));
        assert_eq!(lines.next(), Some(CRASHCAPTURE_END_CUSTOM_DATA));
        Ok(())
    }

    #[test]
    fn test_emit_fault_with_mach_exception() -> anyhow::Result<()> {
        use crate::collector::fault_info::{mach_exception, MachFault};
        let fault = FaultInfo::from_mach(MachFault {
            exception_type: mach_exception::EXC_BAD_ACCESS,
            codes: [mach_exception::KERN_INVALID_ADDRESS, 0x10],
            code_count: 2,
        });
        let mut buf = Vec::new();
        emit_fault(&mut buf, &fault)?;
        let out = to_string(buf)?;
        let json: serde_json::Value =
            serde_json::from_str(out.lines().nth(1).unwrap_or_default())?;
        assert_eq!(json["signame"], "SIGSEGV");
        assert_eq!(json["codename"], "SEGV_MAPERR");
        assert_eq!(json["address"], 16);
        assert_eq!(json["mach_exception"]["name"], "EXC_BAD_ACCESS");
        assert_eq!(json["mach_exception"]["codes"], serde_json::json!([1, 16]));
        Ok(())
    }

    #[test]
    fn test_emit_thread_registers() -> anyhow::Result<()> {
        let mut snapshot = ThreadSnapshot::empty(42);
        snapshot.push_register("pc", 0x1000);
        snapshot.push_register("sp", 0x2000);
        let mut buf = Vec::new();
        emit_thread(&mut buf, &snapshot)?;
        let out = to_string(buf)?;
        let json: serde_json::Value =
            serde_json::from_str(out.lines().nth(1).unwrap_or_default())?;
        assert_eq!(json["thread_id"], 42);
        assert_eq!(json["registers"]["pc"], 0x1000);
        assert_eq!(json["registers"]["sp"], 0x2000);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_report_sections_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report");
        let c_path = CString::new(path.as_os_str().as_bytes())?;

        let registry = ImageRegistry::new();
        registry.register(0x4000, "/usr/lib/libfoo.so");
        let images = registry.snapshot_for_report();

        let mut snapshot = ThreadSnapshot::empty(7);
        snapshot.push_register("pc", 0x1234);
        snapshot.set_frame(0x1234, 0x8000, 0);
        let context = ReportContext {
            metadata_json: "{\"app\": \"test\"}",
            config_json: "{}",
            custom_data: Some(b"\x01\x02"),
            exception_description: Some("boom"),
        };

        let mut writer = BoundedWriter::open(&c_path, 1 << 20)?;
        write_report(
            &mut writer,
            ThreadHandle::current(),
            &images,
            &FaultInfo::from_signal(libc::SIGSEGV, 1, 0x10),
            Some(&snapshot),
            &context,
        )?;

        let out = std::fs::read_to_string(&path)?;
        let markers: Vec<&str> = out
            .lines()
            .filter(|l| l.starts_with("CRASHCAPTURE_"))
            .collect();
        assert_eq!(
            markers,
            vec![
                CRASHCAPTURE_REPORT_HEADER,
                CRASHCAPTURE_BEGIN_METADATA,
                CRASHCAPTURE_END_METADATA,
                CRASHCAPTURE_BEGIN_CONFIG,
                CRASHCAPTURE_END_CONFIG,
                CRASHCAPTURE_BEGIN_TIMESTAMP,
                CRASHCAPTURE_END_TIMESTAMP,
                CRASHCAPTURE_BEGIN_CUSTOM_DATA,
                CRASHCAPTURE_END_CUSTOM_DATA,
                CRASHCAPTURE_BEGIN_EXCEPTION,
                CRASHCAPTURE_END_EXCEPTION,
                CRASHCAPTURE_BEGIN_FAULT,
                CRASHCAPTURE_END_FAULT,
                CRASHCAPTURE_BEGIN_THREAD,
                CRASHCAPTURE_END_THREAD,
                CRASHCAPTURE_BEGIN_IMAGES,
                CRASHCAPTURE_END_IMAGES,
                CRASHCAPTURE_BEGIN_STACKTRACE,
                CRASHCAPTURE_END_STACKTRACE,
                CRASHCAPTURE_DONE,
            ]
        );
        assert!(out.contains("\"path\": \"/usr/lib/libfoo.so\""));
        assert!(out.contains("{\"ip\": 4660, \"sp\": 32768, \"bp\": 0}"));
        Ok(())
    }

    fn reported_images(registry: &ImageRegistry) -> anyhow::Result<Vec<ImageDescriptor>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report");
        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let mut writer = BoundedWriter::open(&c_path, 1 << 20)?;
        write_report(
            &mut writer,
            ThreadHandle::current(),
            &registry.snapshot_for_report(),
            &FaultInfo::from_signal(libc::SIGSEGV, 1, 0),
            Some(&ThreadSnapshot::empty(1)),
            &ReportContext::default(),
        )?;
        let mut images = CaptureReport::parse(&std::fs::read(&path)?)?.images;
        images.sort();
        Ok(images)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_report_lists_registered_images() -> anyhow::Result<()> {
        let image = |load_address, path: &str| ImageDescriptor {
            load_address,
            path: path.to_string(),
        };

        let registry = ImageRegistry::new();
        registry.register(0xa000, "/lib/liba.so");
        registry.unregister(0xa000);
        assert!(reported_images(&registry)?.is_empty());

        registry.register(0xb000, "/lib/libb.so");
        registry.register(0xc000, "/lib/libc.so");
        let expected = vec![image(0xb000, "/lib/libb.so"), image(0xc000, "/lib/libc.so")];
        assert_eq!(reported_images(&registry)?, expected);

        // Registration order does not matter.
        let reversed = ImageRegistry::new();
        reversed.register(0xc000, "/lib/libc.so");
        reversed.register(0xa000, "/lib/liba.so");
        reversed.register(0xb000, "/lib/libb.so");
        reversed.unregister(0xa000);
        assert_eq!(reported_images(&reversed)?, expected);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_report_respects_budget() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report");
        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let registry = ImageRegistry::new();
        let images = registry.snapshot_for_report();
        let snapshot = ThreadSnapshot::empty(1);

        let mut writer = BoundedWriter::open(&c_path, 64)?;
        let result = write_report(
            &mut writer,
            ThreadHandle::current(),
            &images,
            &FaultInfo::live(),
            Some(&snapshot),
            &ReportContext {
                metadata_json: &"x".repeat(200),
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(EmitterError::Writer(WriterError::BudgetExceeded { budget: 64 }))
        ));
        assert_eq!(std::fs::metadata(&path)?.len(), 64);
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_report_captures_live_thread() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report");
        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let registry = ImageRegistry::new();
        let images = registry.snapshot_for_report();

        let mut writer = BoundedWriter::open(&c_path, 1 << 20)?;
        write_report(
            &mut writer,
            ThreadHandle::current(),
            &images,
            &FaultInfo::live(),
            None,
            &ReportContext::default(),
        )?;
        let out = std::fs::read_to_string(&path)?;
        assert!(out.contains("\"signame\": \"SIGTRAP\""));
        assert!(out.trim_end().ends_with(CRASHCAPTURE_DONE));
        Ok(())
    }
}
