// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The description of one captured fault. Signals and Mach exceptions share this representation
//! so that everything downstream of the interceptors is common.

use libc::siginfo_t;

// These are defined in siginfo.h. The values below are the ones shared by Linux and macOS.
pub mod si_codes {
    pub mod ill {
        pub const ILLOPC: i32 = 1;
    }

    pub mod segv {
        pub const MAPERR: i32 = 1;
        pub const ACCERR: i32 = 2;
    }

    pub mod bus {
        pub const ADRALN: i32 = 1;
        pub const ADRERR: i32 = 2;
        pub const OBJERR: i32 = 3;
    }

    pub mod trap {
        pub const BRKPT: i32 = 1;
        pub const TRACE: i32 = 2;
    }

    pub const NOOP: i32 = 0;
}

/// Mach exception types, from `<mach/exception_types.h>`.
pub mod mach_exception {
    pub const EXC_BAD_ACCESS: i32 = 1;
    pub const EXC_BAD_INSTRUCTION: i32 = 2;
    pub const EXC_ARITHMETIC: i32 = 3;
    pub const EXC_EMULATION: i32 = 4;
    pub const EXC_SOFTWARE: i32 = 5;
    pub const EXC_BREAKPOINT: i32 = 6;
    pub const EXC_CRASH: i32 = 10;
    pub const EXC_RESOURCE: i32 = 11;
    pub const EXC_GUARD: i32 = 12;

    /// `code[0]` values of `EXC_SOFTWARE` raised on behalf of the BSD layer.
    pub const EXC_UNIX_BAD_SYSCALL: i64 = 0x10000;
    pub const EXC_UNIX_BAD_PIPE: i64 = 0x10001;
    pub const EXC_UNIX_ABORT: i64 = 0x10002;
    pub const EXC_SOFT_SIGNAL: i64 = 0x10003;

    /// `code[0]` of `EXC_BAD_ACCESS` for an unmapped address.
    pub const KERN_INVALID_ADDRESS: i64 = 1;
    /// `code[0]` of `EXC_BAD_ACCESS` for a protection violation.
    pub const KERN_PROTECTION_FAILURE: i64 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFault {
    pub signo: i32,
    pub code: i32,
    pub address: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachFault {
    pub exception_type: i32,
    pub codes: [i64; 2],
    pub code_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub signal: SignalFault,
    pub mach: Option<MachFault>,
}

impl FaultInfo {
    /// Builds the fault description from a delivered `siginfo_t`.
    ///
    /// # Safety
    /// `sig_info` must be null or point to the siginfo the kernel passed to the running handler.
    pub unsafe fn from_siginfo(signum: i32, sig_info: *const siginfo_t) -> Self {
        if sig_info.is_null() {
            return Self::from_signal(signum, si_codes::NOOP, 0);
        }
        let si_signo = (*sig_info).si_signo;
        // SIGILL, SIGFPE, SIGSEGV, SIGBUS and SIGTRAP fill in si_addr with the faulting address.
        let address = match si_signo {
            libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                (*sig_info).si_addr() as usize
            }
            _ => 0,
        };
        Self::from_signal(si_signo, (*sig_info).si_code, address)
    }

    pub const fn from_signal(signo: i32, code: i32, address: usize) -> Self {
        Self {
            signal: SignalFault {
                signo,
                code,
                address,
            },
            mach: None,
        }
    }

    /// The benign trap used by live reports.
    pub const fn live() -> Self {
        Self::from_signal(libc::SIGTRAP, si_codes::trap::TRACE, 0)
    }

    /// Translates a Mach exception into the signal the BSD layer would have delivered for it.
    pub fn from_mach(mach: MachFault) -> Self {
        use mach_exception::*;
        let [code0, code1] = mach.codes;
        let (signo, code, address) = match mach.exception_type {
            EXC_BAD_ACCESS if code0 == KERN_INVALID_ADDRESS => {
                (libc::SIGSEGV, si_codes::segv::MAPERR, code1 as usize)
            }
            EXC_BAD_ACCESS if code0 == KERN_PROTECTION_FAILURE => {
                (libc::SIGSEGV, si_codes::segv::ACCERR, code1 as usize)
            }
            EXC_BAD_ACCESS => (libc::SIGBUS, si_codes::bus::ADRERR, code1 as usize),
            EXC_BAD_INSTRUCTION => (libc::SIGILL, si_codes::ill::ILLOPC, code1 as usize),
            EXC_ARITHMETIC => (libc::SIGFPE, si_codes::NOOP, code1 as usize),
            EXC_EMULATION => (libc::SIGILL, si_codes::NOOP, code1 as usize),
            EXC_SOFTWARE => match code0 {
                EXC_UNIX_BAD_SYSCALL => (libc::SIGSYS, si_codes::NOOP, 0),
                EXC_UNIX_BAD_PIPE => (libc::SIGPIPE, si_codes::NOOP, 0),
                EXC_SOFT_SIGNAL => (code1 as i32, si_codes::NOOP, 0),
                _ => (libc::SIGABRT, si_codes::NOOP, 0),
            },
            EXC_BREAKPOINT => (libc::SIGTRAP, si_codes::trap::BRKPT, code1 as usize),
            EXC_GUARD => (libc::SIGKILL, si_codes::NOOP, 0),
            _ => (0, si_codes::NOOP, 0),
        };
        Self {
            signal: SignalFault {
                signo,
                code,
                address,
            },
            mach: Some(mach),
        }
    }

    pub fn signal_name(&self) -> &'static str {
        signal_name(self.signal.signo)
    }

    pub fn code_name(&self) -> &'static str {
        code_name(self.signal.signo, self.signal.code)
    }

    pub fn mach_exception_name(&self) -> Option<&'static str> {
        self.mach.map(|m| mach_exception_name(m.exception_type))
    }
}

pub fn signal_name(signo: i32) -> &'static str {
    match signo {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGSYS => "SIGSYS",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGKILL => "SIGKILL",
        _ => "UNKNOWN",
    }
}

pub fn code_name(signo: i32, code: i32) -> &'static str {
    match (signo, code) {
        (libc::SIGSEGV, si_codes::segv::MAPERR) => "SEGV_MAPERR",
        (libc::SIGSEGV, si_codes::segv::ACCERR) => "SEGV_ACCERR",
        (libc::SIGBUS, si_codes::bus::ADRALN) => "BUS_ADRALN",
        (libc::SIGBUS, si_codes::bus::ADRERR) => "BUS_ADRERR",
        (libc::SIGBUS, si_codes::bus::OBJERR) => "BUS_OBJERR",
        (libc::SIGILL, si_codes::ill::ILLOPC) => "ILL_ILLOPC",
        (libc::SIGTRAP, si_codes::trap::BRKPT) => "TRAP_BRKPT",
        (libc::SIGTRAP, si_codes::trap::TRACE) => "TRAP_TRACE",
        (_, si_codes::NOOP) => "SI_NOINFO",
        _ => "UNKNOWN",
    }
}

pub fn mach_exception_name(exception_type: i32) -> &'static str {
    use mach_exception::*;
    match exception_type {
        EXC_BAD_ACCESS => "EXC_BAD_ACCESS",
        EXC_BAD_INSTRUCTION => "EXC_BAD_INSTRUCTION",
        EXC_ARITHMETIC => "EXC_ARITHMETIC",
        EXC_EMULATION => "EXC_EMULATION",
        EXC_SOFTWARE => "EXC_SOFTWARE",
        EXC_BREAKPOINT => "EXC_BREAKPOINT",
        EXC_CRASH => "EXC_CRASH",
        EXC_RESOURCE => "EXC_RESOURCE",
        EXC_GUARD => "EXC_GUARD",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::mach_exception::*;
    use super::*;

    fn mach(exception_type: i32, code0: i64, code1: i64) -> FaultInfo {
        FaultInfo::from_mach(MachFault {
            exception_type,
            codes: [code0, code1],
            code_count: 2,
        })
    }

    #[test]
    fn test_bad_access_translation() {
        let f = mach(EXC_BAD_ACCESS, KERN_INVALID_ADDRESS, 0x10);
        assert_eq!(f.signal.signo, libc::SIGSEGV);
        assert_eq!(f.code_name(), "SEGV_MAPERR");
        assert_eq!(f.signal.address, 0x10);
        assert_eq!(f.mach_exception_name(), Some("EXC_BAD_ACCESS"));

        let f = mach(EXC_BAD_ACCESS, KERN_PROTECTION_FAILURE, 0x20);
        assert_eq!(f.signal.signo, libc::SIGSEGV);
        assert_eq!(f.code_name(), "SEGV_ACCERR");

        let f = mach(EXC_BAD_ACCESS, 0x101, 0x30);
        assert_eq!(f.signal_name(), "SIGBUS");
    }

    #[test]
    fn test_other_translations() {
        assert_eq!(mach(EXC_BAD_INSTRUCTION, 1, 0).signal.signo, libc::SIGILL);
        assert_eq!(mach(EXC_ARITHMETIC, 1, 0).signal.signo, libc::SIGFPE);
        assert_eq!(mach(EXC_BREAKPOINT, 1, 0).code_name(), "TRAP_BRKPT");
        assert_eq!(mach(EXC_GUARD, 0, 0).signal.signo, libc::SIGKILL);
        assert_eq!(
            mach(EXC_SOFTWARE, EXC_UNIX_ABORT, 0).signal.signo,
            libc::SIGABRT
        );
        assert_eq!(
            mach(EXC_SOFTWARE, EXC_SOFT_SIGNAL, libc::SIGSEGV as i64).signal_name(),
            "SIGSEGV"
        );
        assert_eq!(
            mach(EXC_SOFTWARE, EXC_UNIX_BAD_SYSCALL, 0).signal.signo,
            libc::SIGSYS
        );
        assert_eq!(mach(99, 0, 0).signal_name(), "UNKNOWN");
        assert_eq!(mach(99, 0, 0).mach_exception_name(), Some("UNKNOWN"));
    }

    #[test]
    fn test_live_fault() {
        let f = FaultInfo::live();
        assert_eq!(f.signal_name(), "SIGTRAP");
        assert_eq!(f.code_name(), "TRAP_TRACE");
        assert!(f.mach.is_none());
    }

    #[test]
    fn test_null_siginfo() {
        // SAFETY: null is explicitly allowed.
        let f = unsafe { FaultInfo::from_siginfo(libc::SIGABRT, std::ptr::null()) };
        assert_eq!(f.signal_name(), "SIGABRT");
        assert_eq!(f.signal.address, 0);
    }
}
