// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalized register snapshots, taken either from a machine context delivered with a signal or
//! from a live thread that is held still for the duration of the capture.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as platform;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod unsupported;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
use unsupported as platform;

use errno::Errno;
use std::time::Duration;
use thiserror::Error;

pub use platform::capture_from_context;

/// Large enough for the 31 general purpose registers of aarch64 plus sp, pc and pstate.
pub const MAX_REGISTERS: usize = 36;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Null pointer provided for ucontext")]
    NullUcontext,
    #[error("Failed to install the capture signal handler: {0}")]
    InstallHandler(Errno),
    #[error("Failed to signal the target thread: {0}")]
    SignalThread(Errno),
    #[error("Target thread did not answer the capture request within {0:?}")]
    Timeout(Duration),
    #[error("thread_suspend failed: kern_return_t {0}")]
    Suspend(i32),
    #[error("thread_get_state failed: kern_return_t {0}")]
    ThreadState(i32),
    #[error("Failed to spawn the capture helper thread: {0}")]
    HelperSpawn(std::io::Error),
    #[error("The capture helper thread panicked")]
    HelperPanicked,
    #[error("Live thread capture is not supported on this platform")]
    Unsupported,
}

/// Register state of one thread. Plain data, so it can live on a signal handler's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    thread_id: u64,
    pc: u64,
    sp: u64,
    fp: u64,
    registers: [(&'static str, u64); MAX_REGISTERS],
    register_count: usize,
}

impl ThreadSnapshot {
    pub(crate) const fn empty(thread_id: u64) -> Self {
        Self {
            thread_id,
            pc: 0,
            sp: 0,
            fp: 0,
            registers: [("", 0); MAX_REGISTERS],
            register_count: 0,
        }
    }

    /// Appends a named register. Registers past [`MAX_REGISTERS`] are dropped.
    pub(crate) fn push_register(&mut self, name: &'static str, value: u64) {
        if self.register_count < MAX_REGISTERS {
            self.registers[self.register_count] = (name, value);
            self.register_count += 1;
        }
    }

    pub(crate) fn set_frame(&mut self, pc: u64, sp: u64, fp: u64) {
        self.pc = pc;
        self.sp = sp;
        self.fp = fp;
    }

    /// Kernel thread id on Linux, `pthread_threadid_np` value on macOS.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn fp(&self) -> u64 {
        self.fp
    }

    pub fn registers(&self) -> &[(&'static str, u64)] {
        &self.registers[..self.register_count]
    }
}

/// Addresses a thread for live capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    raw: platform::RawThread,
}

impl ThreadHandle {
    pub fn current() -> Self {
        Self {
            raw: platform::current_thread(),
        }
    }

    pub fn from_pthread(pthread: libc::pthread_t) -> Self {
        Self {
            raw: platform::from_pthread(pthread),
        }
    }

    /// Wraps a Mach thread port received in an exception message.
    #[cfg(target_os = "macos")]
    pub(crate) fn from_raw(raw: platform::RawThread) -> Self {
        Self { raw }
    }

    pub fn is_current(&self) -> bool {
        platform::is_current(self.raw)
    }
}

/// Holds `thread` still, reads its registers and runs `f` on the snapshot before releasing it.
///
/// The thread is released on every exit path, including capture failure. Capturing the calling
/// thread is supported: a short-lived helper thread performs the capture while the caller waits,
/// so that the caller's stack stays intact while `f` runs.
///
/// This is ordinary code. It allocates and takes locks, so it must not be used from a signal
/// handler.
pub fn capture_live<F, R>(thread: ThreadHandle, f: F) -> Result<R, CaptureError>
where
    F: FnOnce(&ThreadSnapshot) -> R + Send,
    R: Send,
{
    if !thread.is_current() {
        return platform::capture_other(thread.raw, f);
    }
    std::thread::scope(|scope| -> Result<R, CaptureError> {
        let helper = std::thread::Builder::new()
            .name("crashcapture-live".to_string())
            .spawn_scoped(scope, move || platform::capture_other(thread.raw, f))
            .map_err(CaptureError::HelperSpawn)?;
        helper.join().map_err(|_| CaptureError::HelperPanicked)?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};

    #[test]
    fn test_push_register_is_bounded() {
        let mut snapshot = ThreadSnapshot::empty(7);
        for _ in 0..MAX_REGISTERS + 5 {
            snapshot.push_register("r", 1);
        }
        assert_eq!(snapshot.registers().len(), MAX_REGISTERS);
        assert_eq!(snapshot.thread_id(), 7);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_live_self() -> anyhow::Result<()> {
        let first = capture_live(ThreadHandle::current(), |s| *s)?;
        assert_ne!(first.pc(), 0);
        assert_ne!(first.sp(), 0);
        assert!(!first.registers().is_empty());

        // Self capture can be repeated.
        let second = capture_live(ThreadHandle::current(), |s| s.thread_id())?;
        assert_eq!(second, first.thread_id());
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_live_other_thread_is_held() -> anyhow::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();
        let worker = {
            let stop = stop.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                let _ = tx.send(ThreadHandle::current());
                while !stop.load(Ordering::SeqCst) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::hint::spin_loop();
                }
            })
        };
        let target = rx.recv()?;

        let held_still = capture_live(target, |snapshot| {
            let before = counter.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            let after = counter.load(Ordering::SeqCst);
            assert_ne!(snapshot.sp(), 0);
            before == after
        })?;
        assert!(held_still);

        // Released afterwards.
        let before = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert!(counter.load(Ordering::SeqCst) > before);

        stop.store(true, Ordering::SeqCst);
        assert!(worker.join().is_ok());
        Ok(())
    }
}
