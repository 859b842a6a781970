// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Linux has no way to suspend another thread of the same process, so a live capture asks the
//! target to capture itself: a dedicated real-time signal is sent with `pthread_kill`, and its
//! handler publishes the delivered machine context, then spins until the requester releases it.
//!
//! A request is answered once, by its target. A delivery that arrives after its request timed out
//! finds another target, or the request already claimed, and leaves.

use super::{CaptureError, ThreadSnapshot};
use errno::{errno, set_errno, Errno};
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

pub type RawThread = libc::pthread_t;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Offset from `SIGRTMIN` of the signal used for live captures.
const CAPTURE_SIGNAL_OFFSET: c_int = 3;

struct SnapshotSlot(UnsafeCell<ThreadSnapshot>);

// SAFETY: The slot is written only by the thread that claimed the current generation in
// `CLAIMED`, before it publishes `ACKED`, and read by the requester only after observing `ACKED`.
// Requests are serialized by `CAPTURE_LOCK`.
unsafe impl Sync for SnapshotSlot {}

static CAPTURE_LOCK: Mutex<()> = Mutex::new(());
static REQUESTED: AtomicU64 = AtomicU64::new(0);
static TARGET: AtomicU64 = AtomicU64::new(0);
static CLAIMED: AtomicU64 = AtomicU64::new(0);
static ACKED: AtomicU64 = AtomicU64::new(0);
static RELEASED: AtomicU64 = AtomicU64::new(0);
static SLOT: SnapshotSlot = SnapshotSlot(UnsafeCell::new(ThreadSnapshot::empty(0)));
static HANDLER_INSTALLED: OnceLock<Result<(), Errno>> = OnceLock::new();

pub(super) fn current_thread() -> RawThread {
    // SAFETY: No preconditions.
    unsafe { libc::pthread_self() }
}

pub(super) fn from_pthread(pthread: libc::pthread_t) -> RawThread {
    pthread
}

pub(super) fn is_current(raw: RawThread) -> bool {
    // SAFETY: No preconditions.
    unsafe { libc::pthread_equal(raw, libc::pthread_self()) != 0 }
}

fn current_tid() -> u64 {
    // SAFETY: gettid is async-signal-safe and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

fn capture_signal() -> c_int {
    libc::SIGRTMIN() + CAPTURE_SIGNAL_OFFSET
}

/// Decodes the machine context delivered to a `SA_SIGINFO` handler.
///
/// # Safety
/// `ucontext` must be null or point to the context the kernel passed to the running handler.
///
/// SIGNAL SAFETY:
///     Reads memory and calls `gettid`.
pub unsafe fn capture_from_context(
    ucontext: *const ucontext_t,
) -> Result<ThreadSnapshot, CaptureError> {
    if ucontext.is_null() {
        return Err(CaptureError::NullUcontext);
    }
    let mut snapshot = ThreadSnapshot::empty(current_tid());
    decode_mcontext(&(*ucontext).uc_mcontext, &mut snapshot);
    Ok(snapshot)
}

#[cfg(target_arch = "x86_64")]
fn decode_mcontext(mcontext: &libc::mcontext_t, snapshot: &mut ThreadSnapshot) {
    const REGISTERS: [(&str, c_int); 18] = [
        ("rax", libc::REG_RAX),
        ("rbx", libc::REG_RBX),
        ("rcx", libc::REG_RCX),
        ("rdx", libc::REG_RDX),
        ("rdi", libc::REG_RDI),
        ("rsi", libc::REG_RSI),
        ("rbp", libc::REG_RBP),
        ("rsp", libc::REG_RSP),
        ("r8", libc::REG_R8),
        ("r9", libc::REG_R9),
        ("r10", libc::REG_R10),
        ("r11", libc::REG_R11),
        ("r12", libc::REG_R12),
        ("r13", libc::REG_R13),
        ("r14", libc::REG_R14),
        ("r15", libc::REG_R15),
        ("rip", libc::REG_RIP),
        ("rflags", libc::REG_EFL),
    ];
    let gregs = &mcontext.gregs;
    for (name, index) in REGISTERS {
        snapshot.push_register(name, gregs[index as usize] as u64);
    }
    snapshot.set_frame(
        gregs[libc::REG_RIP as usize] as u64,
        gregs[libc::REG_RSP as usize] as u64,
        gregs[libc::REG_RBP as usize] as u64,
    );
}

#[cfg(target_arch = "aarch64")]
fn decode_mcontext(mcontext: &libc::mcontext_t, snapshot: &mut ThreadSnapshot) {
    const NAMES: [&str; 31] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr",
    ];
    for (name, value) in NAMES.iter().zip(mcontext.regs.iter()) {
        snapshot.push_register(name, *value);
    }
    snapshot.push_register("sp", mcontext.sp);
    snapshot.push_register("pc", mcontext.pc);
    snapshot.push_register("pstate", mcontext.pstate);
    snapshot.set_frame(mcontext.pc, mcontext.sp, mcontext.regs[29]);
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn decode_mcontext(_mcontext: &libc::mcontext_t, _snapshot: &mut ThreadSnapshot) {}

extern "C" fn handle_capture_signal(_signum: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    // `TARGET` is stored before `REQUESTED`, so it belongs to `generation` or a later request.
    let generation = REQUESTED.load(SeqCst);
    if generation == 0 || current_thread() as u64 != TARGET.load(SeqCst) {
        // Left over from a request for another thread.
        return;
    }
    if CLAIMED.fetch_max(generation, SeqCst) >= generation {
        // Answered already, or given up by the requester.
        return;
    }
    let saved_errno = errno();
    // SAFETY: `ucontext` comes from the kernel for this delivery.
    let snapshot = unsafe { capture_from_context(ucontext as *const ucontext_t) }
        .unwrap_or(ThreadSnapshot::empty(current_tid()));
    // SAFETY: See `SnapshotSlot`.
    unsafe { *SLOT.0.get() = snapshot };
    ACKED.store(generation, SeqCst);
    while RELEASED.load(SeqCst) < generation {
        // SAFETY: No preconditions.
        unsafe { libc::sched_yield() };
    }
    set_errno(saved_errno);
}

fn install_capture_handler() -> Result<(), CaptureError> {
    let installed = HANDLER_INSTALLED.get_or_init(|| {
        let signum = capture_signal();
        // nix's `Signal` does not cover real-time signals, so this goes through libc directly.
        // SAFETY: The handler only uses async-signal-safe operations.
        let rval = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_capture_signal as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut())
        };
        if rval == 0 {
            tracing::debug!(signum, "Installed live capture signal handler");
            Ok(())
        } else {
            Err(errno())
        }
    });
    match installed {
        Ok(()) => Ok(()),
        Err(e) => Err(CaptureError::InstallHandler(*e)),
    }
}

/// Releases the target thread when dropped.
struct ReleaseGuard(u64);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        RELEASED.store(self.0, SeqCst);
    }
}

pub(super) fn capture_other<F, R>(thread: RawThread, f: F) -> Result<R, CaptureError>
where
    F: FnOnce(&ThreadSnapshot) -> R,
{
    let _serialized = CAPTURE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    install_capture_handler()?;

    let generation = REQUESTED.load(SeqCst) + 1;
    TARGET.store(thread as u64, SeqCst);
    REQUESTED.store(generation, SeqCst);
    let _release = ReleaseGuard(generation);

    // SAFETY: `thread` is a pthread of this process; a dead thread yields ESRCH.
    let rval = unsafe { libc::pthread_kill(thread, capture_signal()) };
    if rval != 0 {
        return Err(CaptureError::SignalThread(Errno(rval)));
    }

    let deadline = Instant::now() + CAPTURE_TIMEOUT;
    while ACKED.load(SeqCst) < generation {
        if Instant::now() >= deadline {
            if CLAIMED.fetch_max(generation, SeqCst) < generation {
                tracing::warn!("Live capture timed out waiting for the target thread");
                return Err(CaptureError::Timeout(CAPTURE_TIMEOUT));
            }
            // The target claimed the request just in time and is about to acknowledge it.
            while ACKED.load(SeqCst) < generation {
                std::thread::yield_now();
            }
            break;
        }
        std::thread::yield_now();
    }
    // SAFETY: See `SnapshotSlot`.
    let snapshot = unsafe { *SLOT.0.get() };
    Ok(f(&snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_signal_is_realtime() {
        let signum = capture_signal();
        assert!(signum > libc::SIGRTMIN() && signum <= libc::SIGRTMAX());
    }

    #[test]
    fn test_null_context() {
        // SAFETY: null is explicitly allowed.
        let result = unsafe { capture_from_context(std::ptr::null()) };
        assert!(matches!(result, Err(CaptureError::NullUcontext)));
    }

    fn set_capture_signal_mask(how: c_int) {
        // SAFETY: `set` is initialized by sigemptyset before use.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, capture_signal());
            libc::pthread_sigmask(how, &set, std::ptr::null_mut());
        }
    }

    /// A thread with the capture signal blocked until it is told otherwise.
    struct BlockedThread {
        pthread: RawThread,
        tid: u64,
        unblock: mpsc::Sender<()>,
        unblocked: mpsc::Receiver<()>,
        handle: std::thread::JoinHandle<()>,
    }

    impl BlockedThread {
        fn spawn() -> anyhow::Result<Self> {
            let (ids_tx, ids_rx) = mpsc::channel();
            let (unblock, unblock_rx) = mpsc::channel::<()>();
            let (unblocked_tx, unblocked) = mpsc::channel();
            let handle = std::thread::spawn(move || {
                set_capture_signal_mask(libc::SIG_BLOCK);
                let _ = ids_tx.send((current_thread(), current_tid()));
                if unblock_rx.recv().is_ok() {
                    // A pending capture signal is handled before this returns.
                    set_capture_signal_mask(libc::SIG_UNBLOCK);
                    let _ = unblocked_tx.send(());
                }
                // Stays alive until the sender is dropped.
                let _ = unblock_rx.recv();
            });
            let (pthread, tid) = ids_rx.recv()?;
            Ok(Self {
                pthread,
                tid,
                unblock,
                unblocked,
                handle,
            })
        }

        fn unblock(&self) -> anyhow::Result<()> {
            self.unblock.send(())?;
            self.unblocked.recv()?;
            Ok(())
        }

        fn finish(self) {
            drop(self.unblock);
            assert!(self.handle.join().is_ok());
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_late_delivery_does_not_answer_another_request() -> anyhow::Result<()> {
        let stale = BlockedThread::spawn()?;
        let result = capture_other(stale.pthread, |snapshot| snapshot.thread_id());
        assert!(matches!(result, Err(CaptureError::Timeout(_))));
        let timed_out = REQUESTED.load(SeqCst);

        let target = BlockedThread::spawn()?;
        let target_pthread = target.pthread;
        let capture =
            std::thread::spawn(move || capture_other(target_pthread, |s| s.thread_id()));
        while REQUESTED.load(SeqCst) <= timed_out || TARGET.load(SeqCst) != target_pthread as u64 {
            std::thread::yield_now();
        }
        // The signal of the timed-out request arrives while the new one is pending.
        stale.unblock()?;
        target.unblock()?;

        let captured = capture
            .join()
            .map_err(|_| anyhow::anyhow!("capture thread panicked"))??;
        assert_eq!(captured, target.tid);
        assert_ne!(captured, stale.tid);
        stale.finish();
        target.finish();
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_dead_thread_is_an_error() -> anyhow::Result<()> {
        use std::os::unix::thread::JoinHandleExt;
        let handle = std::thread::spawn(|| {});
        let pthread = handle.as_pthread_t();
        // Keep the pthread_t valid but the thread finished.
        std::thread::sleep(Duration::from_millis(20));
        let result = capture_other(pthread, |_| ());
        // Either the kernel already reaped the thread or it is a zombie; never hang.
        assert!(matches!(
            result,
            Ok(()) | Err(CaptureError::SignalThread(_)) | Err(CaptureError::Timeout(_))
        ));
        assert!(handle.join().is_ok());
        Ok(())
    }
}
