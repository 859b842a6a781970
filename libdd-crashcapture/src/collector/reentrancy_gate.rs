// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Duration;

const UNCLAIMED: u64 = 0;
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One-shot admission control for report generation.
///
/// The first thread to call [`ReentrancyGate::try_claim`] wins and the gate stays claimed for the
/// rest of the process. The claimed value is the winner's thread token, so that the uncaught
/// exception bridge, which claims the gate and then aborts, is admitted again when its own
/// SIGABRT arrives on the same thread.
pub struct ReentrancyGate {
    owner: AtomicU64,
    completed: AtomicBool,
}

/// The gate shared by every fatal path in the process.
pub(crate) static REPORT_GATE: ReentrancyGate = ReentrancyGate::new();

impl ReentrancyGate {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(UNCLAIMED),
            completed: AtomicBool::new(false),
        }
    }

    /// Single compare-and-swap from the unclaimed sentinel to the calling thread's token.
    /// Never released.
    pub fn try_claim(&self) -> bool {
        self.owner
            .compare_exchange(UNCLAIMED, current_thread_token(), SeqCst, SeqCst)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.owner.load(SeqCst) != UNCLAIMED
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(SeqCst) == current_thread_token()
    }

    /// Claims the gate, or accepts it if the calling thread already holds it.
    pub fn try_claim_or_reenter(&self) -> bool {
        self.try_claim() || self.is_held_by_current_thread()
    }

    /// Called by the winner once the report is on disk.
    pub fn mark_complete(&self) {
        self.completed.store(true, SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(SeqCst)
    }

    /// Parks a losing thread until the winner has finished its report, or `limit` has passed.
    ///
    /// SIGNAL SAFETY:
    ///     Only `nanosleep` is called.
    pub fn wait_for_completion(&self, limit: Duration) -> bool {
        let mut waited = Duration::ZERO;
        while !self.is_complete() {
            if waited >= limit {
                return false;
            }
            let ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: COMPLETION_POLL_INTERVAL.as_nanos() as libc::c_long,
            };
            // SAFETY: `ts` is a valid timespec; the remainder pointer may be null.
            unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
            waited += COMPLETION_POLL_INTERVAL;
        }
        true
    }
}

impl Default for ReentrancyGate {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn current_thread_token() -> u64 {
    // SAFETY: No preconditions. Never returns 0 for a live thread.
    unsafe { libc::pthread_self() as usize as u64 }
}
