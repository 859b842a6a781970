// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod async_writer;
mod callbacks;
mod crash_context;
mod crash_handler;
mod emitters;
mod exception_port;
mod fault_info;
mod image_registry;
mod live_report;
#[cfg(target_os = "macos")]
mod mach_ffi;
mod memory;
mod reentrancy_gate;
mod reporter;
mod signal_handler_manager;
mod thread_state;
mod uncaught_exception_handler;

pub use async_writer::{BoundedWriter, WriterError};
pub use callbacks::{CallbackError, CrashCallbacks, HandleSignalFn, CRASH_CALLBACKS_VERSION};
pub use emitters::{write_report, EmitterError, ReportContext};
pub use exception_port::{
    exception_mask, guard_supported, ExceptionPortError, EXC_MASK_ARITHMETIC,
    EXC_MASK_BAD_ACCESS, EXC_MASK_BAD_INSTRUCTION, EXC_MASK_BREAKPOINT, EXC_MASK_GUARD,
    EXC_MASK_RESOURCE, EXC_MASK_SOFTWARE,
};
pub use fault_info::{
    code_name, mach_exception_name, signal_name, FaultInfo, MachFault, SignalFault,
};
pub use image_registry::{
    image_registry, register_loaded_images, ImageDescriptor, ImageRegistry, ImageSnapshot,
};
pub use live_report::LiveReportError;
pub use memory::RawFrame;
pub use reentrancy_gate::ReentrancyGate;
pub use reporter::{ArmError, CrashReporter};
pub use signal_handler_manager::{SignalArmError, EXCEPTION_PORT_SIGNALS, MONITORED_SIGNALS};
pub use thread_state::{capture_live, CaptureError, ThreadHandle, ThreadSnapshot};
pub use uncaught_exception_handler::{register_panic_hook, report_uncaught_exception};
