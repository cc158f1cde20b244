//! Low-level VM entry and exit.
//!
//! `vmx_enter` is the only place raw register save/restore happens.
//! Convention:
//!
//! - On entry, RDI holds a `*mut VmxState` and ESI the resume flag. The
//!   host callee-saved registers and flags are pushed, the resulting stack
//!   pointer is stored in `VmxState::host_rsp`, the guest registers are
//!   loaded and VMLAUNCH or VMRESUME transfers to the guest.
//! - If the transition fails the instruction falls through, still on the
//!   host stack, and `vmx_enter` returns nonzero; the caller reads
//!   VM_INSTRUCTION_ERROR.
//! - On a VM exit the processor jumps to `vmx_exit_entry` (programmed as
//!   HOST_RIP) with RSP = `&VmxState` (programmed as HOST_RSP). The guest
//!   registers are spilled into `VmxState::guest_state`, the host stack is
//!   restored from `host_rsp`, `vmx_exit` fixes up host descriptor state,
//!   and control returns from `vmx_enter` with zero.

use super::data::guest::VmxState;
use crate::kernel;
use core::arch::global_asm;

global_asm!(
    r#"
.text

// i32 vmx_enter(VmxState* vmx_state, u32 resume)
.global vmx_enter
vmx_enter:
    pushfq
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp

    // The flag survives the register loads; MOV does not touch RFLAGS.
    test esi, esi

    mov rax, [rdi + 8]
    mov rcx, [rdi + 16]
    mov rdx, [rdi + 24]
    mov rbx, [rdi + 32]
    mov rbp, [rdi + 40]
    mov rsi, [rdi + 48]
    mov r8,  [rdi + 64]
    mov r9,  [rdi + 72]
    mov r10, [rdi + 80]
    mov r11, [rdi + 88]
    mov r12, [rdi + 96]
    mov r13, [rdi + 104]
    mov r14, [rdi + 112]
    mov r15, [rdi + 120]
    mov rdi, [rdi + 56]

    jnz 2f
    vmlaunch
    jmp 3f
2:
    vmresume
3:
    // Only reached when the transition failed; the host stack is intact.
    mov eax, 1
    jmp 4f

// VM-exit landing point, programmed as HOST_RIP. RSP = &VmxState.
.global vmx_exit_entry
vmx_exit_entry:
    mov [rsp + 8], rax
    mov [rsp + 16], rcx
    mov [rsp + 24], rdx
    mov [rsp + 32], rbx
    mov [rsp + 40], rbp
    mov [rsp + 48], rsi
    mov [rsp + 56], rdi
    mov [rsp + 64], r8
    mov [rsp + 72], r9
    mov [rsp + 80], r10
    mov [rsp + 88], r11
    mov [rsp + 96], r12
    mov [rsp + 104], r13
    mov [rsp + 112], r14
    mov [rsp + 120], r15

    mov rdi, rsp
    mov rsp, [rdi]
    call vmx_exit
    xor eax, eax
4:
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    popfq
    ret
"#
);

extern "C" {
    /// Enters the guest; returns 0 after a VM exit, nonzero if the
    /// transition itself failed.
    pub fn vmx_enter(vmx_state: *mut VmxState, resume: u32) -> i32;

    /// Exit landing point; never called directly, its address is programmed
    /// into HOST_RIP.
    pub fn vmx_exit_entry();
}

/// Restores host descriptor state the processor does not reload precisely.
///
/// VMX restores TR with a limit of 0x67, which excludes the IO bitmap, and
/// the IDT with a limit of 0xffff, which is too large. Runs on the exit
/// path with interrupts still disabled.
#[no_mangle]
extern "C" fn vmx_exit(_vmx_state: *mut VmxState) {
    let cpu = kernel::processor::current_cpu();
    kernel::processor::reload_tss(kernel::tss_selector(cpu));
    kernel::processor::reload_idt();
}
