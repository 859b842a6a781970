// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mach declarations that `mach2` does not provide, and the MIG message layouts of the
//! `exc`/`mach_exc` subsystems. Everything here mirrors `<mach/exception_types.h>`,
//! `<mach/message.h>` and the MIG-generated `mach_exc.defs` structures.

#![allow(non_camel_case_types, non_upper_case_globals)]

use mach2::kern_return::kern_return_t;
use mach2::mach_types::task_t;
use mach2::message::{mach_msg_header_t, mach_msg_type_number_t};
use mach2::port::mach_port_t;

pub type exception_type_t = i32;
pub type exception_mask_t = u32;
pub type exception_behavior_t = i32;
pub type thread_state_flavor_t = i32;

pub const X86_THREAD_STATE64: thread_state_flavor_t = 4;
pub const ARM_THREAD_STATE64: thread_state_flavor_t = 6;

#[cfg(target_arch = "x86_64")]
pub const THREAD_STATE_NONE: thread_state_flavor_t = 13;
#[cfg(target_arch = "aarch64")]
pub const THREAD_STATE_NONE: thread_state_flavor_t = 5;

/// Size of the arrays filled by `task_get_exception_ports`.
pub const EXC_TYPES_COUNT: usize = 14;

pub const EXCEPTION_DEFAULT: exception_behavior_t = 1;
pub const MACH_EXCEPTION_CODES: exception_behavior_t = 0x8000_0000_u32 as i32;

pub const MACH_PORT_RIGHT_RECEIVE: u32 = 1;

pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: u32 = 18;
pub const MACH_MSG_TYPE_COPY_SEND: u32 = 19;
pub const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;
pub const MACH_MSG_TYPE_MAKE_SEND_ONCE: u32 = 21;
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
pub const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;

pub const MACH_SEND_MSG: i32 = 0x0000_0001;
pub const MACH_RCV_MSG: i32 = 0x0000_0002;
pub const MACH_MSG_SUCCESS: kern_return_t = 0;
pub const MACH_MSG_TIMEOUT_NONE: u32 = 0;

/// `exception_raise`: 32-bit codes.
pub const EXCEPTION_RAISE_ID: i32 = 2401;
/// `mach_exception_raise`: 64-bit codes.
pub const MACH_EXCEPTION_RAISE_ID: i32 = 2405;
/// MIG replies carry the request id plus this offset.
pub const MIG_REPLY_OFFSET: i32 = 100;

pub const fn mach_msgh_bits(remote: u32, local: u32) -> u32 {
    remote | (local << 8)
}

/// Mirrors `NDR_record_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdrRecord {
    pub bytes: [u8; 8],
}

/// The NDR record of little-endian, IEEE float, ASCII hosts.
pub const NDR_RECORD: NdrRecord = NdrRecord {
    bytes: [0, 0, 0, 0, 1, 0, 0, 0],
};

/// Mirrors `mach_msg_port_descriptor_t`.
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy)]
pub struct PortDescriptor {
    pub name: mach_port_t,
    pub pad1: u32,
    pub pad2: u16,
    pub disposition: u8,
    pub kind: u8,
}

impl PortDescriptor {
    pub const fn copy_send(name: mach_port_t) -> Self {
        Self {
            name,
            pad1: 0,
            pad2: 0,
            disposition: MACH_MSG_TYPE_COPY_SEND as u8,
            kind: MACH_MSG_PORT_DESCRIPTOR,
        }
    }
}

/// `__Request__mach_exception_raise_t`.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct ExceptionRaiseRequest64 {
    pub header: mach_msg_header_t,
    pub descriptor_count: u32,
    pub thread: PortDescriptor,
    pub task: PortDescriptor,
    pub ndr: NdrRecord,
    pub exception: exception_type_t,
    pub code_count: mach_msg_type_number_t,
    pub code: [i64; 2],
}

/// `__Request__exception_raise_t`.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct ExceptionRaiseRequest32 {
    pub header: mach_msg_header_t,
    pub descriptor_count: u32,
    pub thread: PortDescriptor,
    pub task: PortDescriptor,
    pub ndr: NdrRecord,
    pub exception: exception_type_t,
    pub code_count: mach_msg_type_number_t,
    pub code: [i32; 2],
}

/// `__Reply__exception_raise_t`, shared by both subsystems.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct ExceptionRaiseReply {
    pub header: mach_msg_header_t,
    pub ndr: NdrRecord,
    pub ret_code: kern_return_t,
}

/// Receive buffer for one request plus the largest trailer the kernel may append.
#[repr(C, align(8))]
pub struct ReceiveBuffer {
    pub bytes: [u8; 512],
}

impl ReceiveBuffer {
    pub const fn new() -> Self {
        Self { bytes: [0; 512] }
    }

    pub fn header(&self) -> &mach_msg_header_t {
        // SAFETY: The buffer is larger than a header and 8-byte aligned.
        unsafe { &*(self.bytes.as_ptr() as *const mach_msg_header_t) }
    }

    pub fn header_mut(&mut self) -> *mut mach_msg_header_t {
        self.bytes.as_mut_ptr() as *mut mach_msg_header_t
    }

    /// Reinterprets the buffer as a request, if the received size covers it.
    pub fn request<T: Copy>(&self) -> Option<T> {
        if (self.header().msgh_size as usize) < std::mem::size_of::<T>() {
            return None;
        }
        // SAFETY: The message is at least `size_of::<T>()` bytes and `T` is plain data.
        Some(unsafe { std::ptr::read_unaligned(self.bytes.as_ptr() as *const T) })
    }
}

extern "C" {
    pub fn pthread_mach_thread_np(thread: libc::pthread_t) -> mach_port_t;
    pub fn pthread_from_mach_thread_np(port: mach_port_t) -> libc::pthread_t;
    pub fn pthread_threadid_np(thread: libc::pthread_t, thread_id: *mut u64) -> libc::c_int;

    pub fn task_get_exception_ports(
        task: task_t,
        exception_mask: exception_mask_t,
        masks: *mut exception_mask_t,
        masks_count: *mut mach_msg_type_number_t,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut exception_behavior_t,
        old_flavors: *mut thread_state_flavor_t,
    ) -> kern_return_t;

    pub fn task_set_exception_ports(
        task: task_t,
        exception_mask: exception_mask_t,
        new_port: mach_port_t,
        behavior: exception_behavior_t,
        new_flavor: thread_state_flavor_t,
    ) -> kern_return_t;

    pub fn mach_port_allocate(
        task: task_t,
        right: u32,
        name: *mut mach_port_t,
    ) -> kern_return_t;

    pub fn mach_port_insert_right(
        task: task_t,
        name: mach_port_t,
        poly: mach_port_t,
        poly_poly: u32,
    ) -> kern_return_t;

    pub fn mach_port_mod_refs(
        task: task_t,
        name: mach_port_t,
        right: u32,
        delta: i32,
    ) -> kern_return_t;

    pub fn mach_port_deallocate(task: task_t, name: mach_port_t) -> kern_return_t;

    pub fn mach_reply_port() -> mach_port_t;

    pub fn mach_msg(
        msg: *mut mach_msg_header_t,
        option: i32,
        send_size: u32,
        rcv_size: u32,
        rcv_name: mach_port_t,
        timeout: u32,
        notify: mach_port_t,
    ) -> kern_return_t;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_match_mig() {
        assert_eq!(std::mem::size_of::<PortDescriptor>(), 12);
        assert_eq!(std::mem::size_of::<mach_msg_header_t>(), 24);
        assert_eq!(std::mem::size_of::<ExceptionRaiseRequest64>(), 84);
        assert_eq!(std::mem::size_of::<ExceptionRaiseRequest32>(), 76);
        assert_eq!(std::mem::size_of::<ExceptionRaiseReply>(), 36);
    }

    #[test]
    fn test_request_requires_enough_bytes() {
        let mut buffer = ReceiveBuffer::new();
        // SAFETY: Writing a field of the header inside the buffer.
        unsafe { (*buffer.header_mut()).msgh_size = 40 };
        assert!(buffer.request::<ExceptionRaiseRequest64>().is_none());
        unsafe { (*buffer.header_mut()).msgh_size = 84 };
        assert!(buffer.request::<ExceptionRaiseRequest64>().is_some());
    }
}
