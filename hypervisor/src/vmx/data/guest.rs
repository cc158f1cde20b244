//! Register state shared with the entry/exit trampolines.

use core::mem::{offset_of, size_of};

/// Guest general-purpose registers, saved and restored by the trampolines.
/// RSP lives in the VMCS, not here.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestState {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Scratch area whose address is programmed into HOST_RSP.
///
/// The exit trampoline receives this address in RSP, spills the guest
/// registers into `guest_state` and switches back to the host stack saved
/// in `host_rsp`. The entry trampoline fills `host_rsp` before loading the
/// guest registers. The field offsets below are baked into the assembly.
#[repr(C)]
#[derive(Debug, Default)]
pub struct VmxState {
    pub host_rsp: u64,
    pub guest_state: GuestState,
}

const_assert_eq!(offset_of!(VmxState, host_rsp), 0);
const_assert_eq!(offset_of!(VmxState, guest_state), 8);
const_assert_eq!(offset_of!(GuestState, rax), 0);
const_assert_eq!(offset_of!(GuestState, rdi), 48);
const_assert_eq!(offset_of!(GuestState, r15), 112);
const_assert_eq!(size_of::<VmxState>(), 128);
