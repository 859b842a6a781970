// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use bin_tests::{
        CrashMode, BUSY_MARKER, CALLBACK_MARKER, CONCURRENT_THREADS, DEFAULT_DISPOSITION_MARKER,
        LIVE_COPY_FILENAME,
    };
    use libc::{c_void, siginfo_t, ucontext_t};
    use libdd_crashcapture::{
        register_panic_hook, report_uncaught_exception, AppMetadata, ArmError, CrashCallbacks,
        CrashReporter, ReporterConfig, ThreadHandle,
    };
    use std::env;
    use std::path::Path;
    use std::sync::{mpsc, Arc, Barrier};

    #[inline(never)]
    unsafe fn fn3() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::asm!("mov eax, [0]", options(nostack));
        }

        #[cfg(target_arch = "aarch64")]
        {
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));
        }
    }

    #[inline(never)]
    fn fn2() {
        unsafe { fn3() }
    }

    #[inline(never)]
    fn fn1() {
        fn2()
    }

    fn write_stdout(message: &str) {
        // SAFETY: `message` is valid for its length. write is async-signal-safe.
        unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                message.as_ptr() as *const c_void,
                message.len(),
            )
        };
    }

    extern "C" fn on_crash(_: *mut siginfo_t, _: *mut ucontext_t, _: *mut c_void) {
        write_stdout(CALLBACK_MARKER);
        write_stdout("\n");
        // SAFETY: Querying a disposition with a null new action is always valid.
        let is_default = unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(libc::SIGSEGV, std::ptr::null(), &mut current) == 0
                && current.sa_sigaction == libc::SIG_DFL
        };
        if is_default {
            write_stdout(DEFAULT_DISPOSITION_MARKER);
            write_stdout("\n");
        }
    }

    extern "C" fn panic_across_ffi() {
        panic!("the answer was not 42");
    }

    fn new_reporter(base: &Path) -> anyhow::Result<CrashReporter> {
        let config = ReporterConfig::from_env(base)?;
        CrashReporter::new(config, AppMetadata::new("com.example.crashing_test_app", "1.0.0"))
    }

    #[inline(never)]
    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let mode: CrashMode = args
            .next()
            .context("Unexpected number of arguments 1")?
            .parse()
            .map_err(anyhow::Error::msg)?;
        let base = args.next().context("Unexpected number of arguments 2")?;
        anyhow::ensure!(args.next().is_none(), "unexpected extra arguments");
        let base = Path::new(&base);

        let mut reporter = new_reporter(base)?;
        if mode == CrashMode::Callback {
            reporter.set_crash_callbacks(CrashCallbacks::new(std::ptr::null_mut(), on_crash))?;
        }
        if mode == CrashMode::Panic {
            register_panic_hook()?;
        }
        reporter.arm()?;

        match mode {
            CrashMode::Segv | CrashMode::Callback => fn1(),
            CrashMode::Abort => std::process::abort(),
            CrashMode::ConcurrentSegv => {
                let barrier = Arc::new(Barrier::new(CONCURRENT_THREADS));
                let threads: Vec<_> = (0..CONCURRENT_THREADS)
                    .map(|_| {
                        let barrier = Arc::clone(&barrier);
                        std::thread::spawn(move || {
                            barrier.wait();
                            fn1();
                        })
                    })
                    .collect();
                for thread in threads {
                    let _ = thread.join();
                }
            }
            CrashMode::DoubleArm => {
                let mut second = new_reporter(base)?;
                match second.arm() {
                    Err(ArmError::Busy) => println!("{BUSY_MARKER}"),
                    other => anyhow::bail!("second arm unexpectedly returned {other:?}"),
                }
                fn1();
            }
            CrashMode::UncaughtException => {
                reporter.set_custom_data(Some(b"session=7".to_vec()));
                report_uncaught_exception("ValueError: bad input");
            }
            CrashMode::LiveReport => {
                reporter.set_custom_data(Some(b"session=7".to_vec()));
                let first = reporter.generate_live_report(ThreadHandle::current(), None)?;
                let second =
                    reporter.generate_live_report(ThreadHandle::current(), Some("checkpoint"))?;
                anyhow::ensure!(!first.is_empty(), "empty live report");
                std::fs::write(base.join(LIVE_COPY_FILENAME), second)?;

                let (pthread_tx, pthread_rx) = mpsc::channel();
                let (release_tx, release_rx) = mpsc::channel::<()>();
                let parked = std::thread::spawn(move || {
                    // SAFETY: No preconditions.
                    let _ = pthread_tx.send(unsafe { libc::pthread_self() });
                    let _ = release_rx.recv();
                });
                let other = ThreadHandle::from_pthread(pthread_rx.recv()?);
                let other_report = reporter.generate_live_report(other, None);
                let _ = release_tx.send(());
                let _ = parked.join();
                std::fs::write(
                    base.join(format!("{LIVE_COPY_FILENAME}_other_thread")),
                    other_report?,
                )?;
            }
            CrashMode::Panic => panic_across_ffi(),
        }
        Ok(())
    }
}
