// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{process_exception, ExceptionPortError, ExceptionReply, ForwardOutcome};
use crate::collector::crash_context;
use crate::collector::crash_handler::{write_fault_report, write_stderr};
use crate::collector::fault_info::{FaultInfo, MachFault};
use crate::collector::mach_ffi::*;
use crate::collector::reentrancy_gate::REPORT_GATE;
use crate::collector::thread_state::{capture_live, ThreadHandle, ThreadSnapshot};
use mach2::kern_return::{kern_return_t, KERN_FAILURE, KERN_SUCCESS};
use mach2::message::mach_msg_header_t;
use mach2::port::{mach_port_t, MACH_PORT_NULL};
use mach2::traps::mach_task_self;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};

/// The exception ports that were installed before ours, as returned by
/// `task_get_exception_ports`.
struct SavedPorts {
    count: usize,
    masks: [exception_mask_t; EXC_TYPES_COUNT],
    handlers: [mach_port_t; EXC_TYPES_COUNT],
    behaviors: [exception_behavior_t; EXC_TYPES_COUNT],
    flavors: [thread_state_flavor_t; EXC_TYPES_COUNT],
}

impl SavedPorts {
    fn get(task: mach_port_t, mask: exception_mask_t) -> Result<Self, ExceptionPortError> {
        let mut saved = Self {
            count: 0,
            masks: [0; EXC_TYPES_COUNT],
            handlers: [MACH_PORT_NULL; EXC_TYPES_COUNT],
            behaviors: [0; EXC_TYPES_COUNT],
            flavors: [0; EXC_TYPES_COUNT],
        };
        let mut count = EXC_TYPES_COUNT as u32;
        // SAFETY: Every array holds `count` entries.
        let kr = unsafe {
            task_get_exception_ports(
                task,
                mask,
                saved.masks.as_mut_ptr(),
                &mut count,
                saved.handlers.as_mut_ptr(),
                saved.behaviors.as_mut_ptr(),
                saved.flavors.as_mut_ptr(),
            )
        };
        if kr != KERN_SUCCESS {
            return Err(ExceptionPortError::Mach {
                call: "task_get_exception_ports",
                code: kr,
            });
        }
        saved.count = (count as usize).min(EXC_TYPES_COUNT);
        Ok(saved)
    }

    fn entries(&self) -> impl Iterator<Item = usize> + '_ {
        0..self.count
    }

    /// Index of the previous port registered for `exception_type`, if any.
    fn find(&self, exception_type: exception_type_t) -> Option<usize> {
        let bit = 1u32.checked_shl(exception_type as u32)?;
        self.entries()
            .find(|&i| self.masks[i] & bit != 0 && self.handlers[i] != MACH_PORT_NULL)
    }
}

// Null, or from `Box::into_raw`. Published just before our port is installed and only freed when
// installing it fails, so the server thread never sees it freed.
static SAVED_PORTS: AtomicPtr<SavedPorts> = AtomicPtr::new(ptr::null_mut());
static PORTS_INSTALLED: AtomicBool = AtomicBool::new(false);
static ARM_CLAIMED: AtomicBool = AtomicBool::new(false);

fn saved_ports() -> Option<&'static SavedPorts> {
    // SAFETY: See `SAVED_PORTS`.
    unsafe { SAVED_PORTS.load(SeqCst).as_ref() }
}

/// Exclusive right to arm. Handed back on drop unless arming went through.
struct ArmClaim {
    committed: bool,
}

impl ArmClaim {
    fn acquire() -> Result<Self, ExceptionPortError> {
        ARM_CLAIMED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .map(|_| Self { committed: false })
            .map_err(|_| ExceptionPortError::AlreadyArmed)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ArmClaim {
    fn drop(&mut self) {
        if !self.committed {
            ARM_CLAIMED.store(false, SeqCst);
        }
    }
}

pub(super) fn arm(mask: exception_mask_t) -> Result<(), ExceptionPortError> {
    let claim = ArmClaim::acquire()?;
    // SAFETY: No preconditions.
    let task = unsafe { mach_task_self() };
    let saved = SavedPorts::get(task, mask)?;

    let mut port: mach_port_t = MACH_PORT_NULL;
    // SAFETY: `port` is a valid out pointer.
    let kr = unsafe { mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut port) };
    if kr != KERN_SUCCESS {
        return Err(ExceptionPortError::Mach {
            call: "mach_port_allocate",
            code: kr,
        });
    }
    // SAFETY: `port` is a receive right of this task.
    let kr = unsafe { mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND) };
    if kr != KERN_SUCCESS {
        release_receive_right(port);
        return Err(ExceptionPortError::Mach {
            call: "mach_port_insert_right",
            code: kr,
        });
    }

    std::thread::Builder::new()
        .name("crashcapture-exc".to_string())
        .spawn(move || exception_server(port))
        .map_err(|e| {
            release_receive_right(port);
            ExceptionPortError::Spawn(e)
        })?;

    let saved = Box::into_raw(Box::new(saved));
    SAVED_PORTS.store(saved, SeqCst);
    // SAFETY: `port` holds a send right of this task.
    let kr = unsafe {
        task_set_exception_ports(
            task,
            mask,
            port,
            EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES,
            THREAD_STATE_NONE,
        )
    };
    if kr != KERN_SUCCESS {
        SAVED_PORTS.store(ptr::null_mut(), SeqCst);
        // SAFETY: From `Box::into_raw` above. Our port was never installed, so no exception
        // reached the server thread.
        unsafe { drop(Box::from_raw(saved)) };
        // The server thread exits once its port is gone.
        release_receive_right(port);
        return Err(ExceptionPortError::Mach {
            call: "task_set_exception_ports",
            code: kr,
        });
    }
    PORTS_INSTALLED.store(true, SeqCst);
    claim.commit();
    tracing::debug!(mask, "Installed crash exception port");
    Ok(())
}

pub(super) fn disarm() {
    if !PORTS_INSTALLED.swap(false, SeqCst) {
        return;
    }
    let Some(saved) = saved_ports() else {
        return;
    };
    // SAFETY: No preconditions.
    let task = unsafe { mach_task_self() };
    for i in saved.entries() {
        // SAFETY: Re-installs ports that this task held before arming.
        unsafe {
            task_set_exception_ports(
                task,
                saved.masks[i],
                saved.handlers[i],
                saved.behaviors[i],
                saved.flavors[i],
            )
        };
    }
}

fn release_receive_right(port: mach_port_t) {
    // SAFETY: `port` names a receive right of this task.
    unsafe { mach_port_mod_refs(mach_task_self(), port, MACH_PORT_RIGHT_RECEIVE, -1) };
}

/// One decoded `exception_raise` or `mach_exception_raise` request.
struct ExceptionRequest {
    thread: mach_port_t,
    task: mach_port_t,
    fault: MachFault,
}

fn decode_request(buffer: &ReceiveBuffer) -> Option<ExceptionRequest> {
    match buffer.header().msgh_id {
        MACH_EXCEPTION_RAISE_ID => {
            let msg: ExceptionRaiseRequest64 = buffer.request()?;
            let code_count = { msg.code_count }.min(2);
            Some(ExceptionRequest {
                thread: { msg.thread }.name,
                task: { msg.task }.name,
                fault: MachFault {
                    exception_type: msg.exception,
                    codes: { msg.code },
                    code_count,
                },
            })
        }
        EXCEPTION_RAISE_ID => {
            let msg: ExceptionRaiseRequest32 = buffer.request()?;
            let code_count = { msg.code_count }.min(2);
            let [code0, code1] = { msg.code };
            Some(ExceptionRequest {
                thread: { msg.thread }.name,
                task: { msg.task }.name,
                fault: MachFault {
                    exception_type: msg.exception,
                    codes: [code0 as i64, code1 as i64],
                    code_count,
                },
            })
        }
        _ => None,
    }
}

fn exception_server(port: mach_port_t) {
    loop {
        let mut buffer = ReceiveBuffer::new();
        // SAFETY: The buffer is valid for the size passed.
        let kr = unsafe {
            mach_msg(
                buffer.header_mut(),
                MACH_RCV_MSG,
                0,
                buffer.bytes.len() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != MACH_MSG_SUCCESS {
            tracing::debug!(kr, "Exception port closed, handler thread exiting");
            return;
        }
        let header = *buffer.header();
        let ret_code = match decode_request(&buffer) {
            Some(request) => {
                let reply = handle_exception(&request);
                release_request_rights(&request);
                match reply {
                    ExceptionReply::Handled => KERN_SUCCESS,
                    ExceptionReply::NotHandled => KERN_FAILURE,
                }
            }
            None => KERN_FAILURE,
        };
        send_reply(&header, ret_code);
    }
}

fn handle_exception(request: &ExceptionRequest) -> ExceptionReply {
    process_exception(
        &REPORT_GATE,
        || forward_to_previous_port(request),
        || {
            disarm();
            crate::collector::signal_handler_manager::restore_default_dispositions();
        },
        || report_exception(request),
    )
}

fn report_exception(request: &ExceptionRequest) {
    let Some(context) = crash_context::current() else {
        return;
    };
    let fault_info = FaultInfo::from_mach(request.fault);
    // The kernel already holds the faulting thread; capturing suspends it once more.
    let snapshot = capture_live(ThreadHandle::from_raw(request.thread), |snapshot| *snapshot)
        .unwrap_or_else(|_| {
            write_stderr("crashcapture: unable to read the faulting thread's registers\n");
            ThreadSnapshot::empty(0)
        });
    write_fault_report(context, &fault_info, &snapshot);

    if let Some(callbacks) = context.callbacks() {
        // There is no siginfo or machine context for a Mach exception.
        // SAFETY: Zero is a valid bit pattern for ucontext_t.
        let mut empty: libc::ucontext_t = unsafe { std::mem::zeroed() };
        callbacks.invoke(std::ptr::null_mut(), &mut empty);
    }
}

fn forward_to_previous_port(request: &ExceptionRequest) -> ForwardOutcome {
    let Some(saved) = saved_ports() else {
        return ForwardOutcome::NoPreviousPort;
    };
    let Some(index) = saved.find(request.fault.exception_type) else {
        return ForwardOutcome::NoPreviousPort;
    };
    let behavior = saved.behaviors[index];
    // Only the default behavior is forwarded; the state behaviors need a thread state this
    // handler does not collect.
    if behavior & !MACH_EXCEPTION_CODES != EXCEPTION_DEFAULT {
        return ForwardOutcome::NotHandled;
    }

    // SAFETY: No preconditions.
    let reply_port = unsafe { mach_reply_port() };
    if reply_port == MACH_PORT_NULL {
        return ForwardOutcome::NotHandled;
    }
    let handler = saved.handlers[index];
    let bits = mach_msgh_bits(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE)
        | MACH_MSGH_BITS_COMPLEX;
    let fault = request.fault;

    let mut reply = ReceiveBuffer::new();
    let kr = if behavior & MACH_EXCEPTION_CODES != 0 {
        let mut msg = ExceptionRaiseRequest64 {
            header: request_header(
                bits,
                size_of::<ExceptionRaiseRequest64>(),
                handler,
                reply_port,
                MACH_EXCEPTION_RAISE_ID,
            ),
            descriptor_count: 2,
            thread: PortDescriptor::copy_send(request.thread),
            task: PortDescriptor::copy_send(request.task),
            ndr: NDR_RECORD,
            exception: fault.exception_type,
            code_count: fault.code_count,
            code: fault.codes,
        };
        send_and_receive(
            &mut msg as *mut ExceptionRaiseRequest64 as *mut mach_msg_header_t,
            size_of::<ExceptionRaiseRequest64>(),
            &mut reply,
            reply_port,
        )
    } else {
        let mut msg = ExceptionRaiseRequest32 {
            header: request_header(
                bits,
                size_of::<ExceptionRaiseRequest32>(),
                handler,
                reply_port,
                EXCEPTION_RAISE_ID,
            ),
            descriptor_count: 2,
            thread: PortDescriptor::copy_send(request.thread),
            task: PortDescriptor::copy_send(request.task),
            ndr: NDR_RECORD,
            exception: fault.exception_type,
            code_count: fault.code_count,
            code: [fault.codes[0] as i32, fault.codes[1] as i32],
        };
        send_and_receive(
            &mut msg as *mut ExceptionRaiseRequest32 as *mut mach_msg_header_t,
            size_of::<ExceptionRaiseRequest32>(),
            &mut reply,
            reply_port,
        )
    };
    release_receive_right(reply_port);

    if kr != MACH_MSG_SUCCESS {
        return ForwardOutcome::NotHandled;
    }
    match reply.request::<ExceptionRaiseReply>() {
        Some(answer) if { answer.ret_code } == KERN_SUCCESS => ForwardOutcome::Handled,
        _ => ForwardOutcome::NotHandled,
    }
}

fn request_header(
    bits: u32,
    size: usize,
    remote: mach_port_t,
    local: mach_port_t,
    id: i32,
) -> mach_msg_header_t {
    mach_msg_header_t {
        msgh_bits: bits,
        msgh_size: size as u32,
        msgh_remote_port: remote,
        msgh_local_port: local,
        msgh_voucher_port: MACH_PORT_NULL,
        msgh_id: id,
    }
}

fn send_and_receive(
    header: *mut mach_msg_header_t,
    send_size: usize,
    reply: &mut ReceiveBuffer,
    reply_port: mach_port_t,
) -> kern_return_t {
    // Send and receive are separate calls: the reply lands in a different buffer.
    // SAFETY: `header` starts a message of `send_size` bytes.
    let kr = unsafe {
        mach_msg(
            header,
            MACH_SEND_MSG,
            send_size as u32,
            0,
            MACH_PORT_NULL,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    if kr != MACH_MSG_SUCCESS {
        return kr;
    }
    // SAFETY: The buffer is valid for the size passed.
    unsafe {
        mach_msg(
            reply.header_mut(),
            MACH_RCV_MSG,
            0,
            reply.bytes.len() as u32,
            reply_port,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    }
}

fn send_reply(request: &mach_msg_header_t, ret_code: kern_return_t) {
    let mut reply = ExceptionRaiseReply {
        header: mach_msg_header_t {
            msgh_bits: mach_msgh_bits(request.msgh_bits & 0x1f, 0),
            msgh_size: size_of::<ExceptionRaiseReply>() as u32,
            msgh_remote_port: request.msgh_remote_port,
            msgh_local_port: MACH_PORT_NULL,
            msgh_voucher_port: MACH_PORT_NULL,
            msgh_id: request.msgh_id + MIG_REPLY_OFFSET,
        },
        ndr: NDR_RECORD,
        ret_code,
    };
    // SAFETY: `reply` is a complete message of the size passed.
    unsafe {
        mach_msg(
            &mut reply as *mut ExceptionRaiseReply as *mut mach_msg_header_t,
            MACH_SEND_MSG,
            size_of::<ExceptionRaiseReply>() as u32,
            0,
            MACH_PORT_NULL,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
}

fn release_request_rights(request: &ExceptionRequest) {
    // SAFETY: The request carried one send right for each port.
    unsafe {
        let task = mach_task_self();
        mach_port_deallocate(task, request.thread);
        mach_port_deallocate(task, request.task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fault_info::mach_exception::*;

    #[test]
    fn test_find_previous_port() {
        let mut saved = SavedPorts {
            count: 2,
            masks: [0; EXC_TYPES_COUNT],
            handlers: [MACH_PORT_NULL; EXC_TYPES_COUNT],
            behaviors: [0; EXC_TYPES_COUNT],
            flavors: [0; EXC_TYPES_COUNT],
        };
        saved.masks[0] = 1 << EXC_BAD_ACCESS;
        saved.handlers[0] = 42;
        saved.masks[1] = 1 << EXC_BREAKPOINT;
        saved.handlers[1] = MACH_PORT_NULL;

        assert_eq!(saved.find(EXC_BAD_ACCESS), Some(0));
        assert_eq!(saved.find(EXC_BREAKPOINT), None);
        assert_eq!(saved.find(EXC_ARITHMETIC), None);
        assert_eq!(saved.find(99), None);
    }

    #[test]
    fn test_failed_arm_gives_the_claim_back() {
        let claim = match ArmClaim::acquire() {
            Ok(claim) => claim,
            // Exception ports are armed in this process.
            Err(_) => return,
        };
        assert!(matches!(
            ArmClaim::acquire(),
            Err(ExceptionPortError::AlreadyArmed)
        ));
        drop(claim);
        let retry = ArmClaim::acquire();
        assert!(retry.is_ok());
    }

    #[test]
    fn test_decode_request() {
        let mut buffer = ReceiveBuffer::new();
        let msg = ExceptionRaiseRequest64 {
            header: request_header(
                0,
                size_of::<ExceptionRaiseRequest64>(),
                1,
                2,
                MACH_EXCEPTION_RAISE_ID,
            ),
            descriptor_count: 2,
            thread: PortDescriptor::copy_send(7),
            task: PortDescriptor::copy_send(8),
            ndr: NDR_RECORD,
            exception: EXC_BAD_ACCESS,
            code_count: 2,
            code: [KERN_INVALID_ADDRESS, 0x10],
        };
        // SAFETY: The buffer is larger than the message.
        unsafe {
            std::ptr::write_unaligned(
                buffer.bytes.as_mut_ptr() as *mut ExceptionRaiseRequest64,
                msg,
            )
        };
        let request = decode_request(&buffer);
        assert!(request.is_some());
        if let Some(request) = request {
            assert_eq!(request.thread, 7);
            assert_eq!(request.task, 8);
            assert_eq!(request.fault.codes, [KERN_INVALID_ADDRESS, 0x10]);
        }
    }
}
