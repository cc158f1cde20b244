//! Declarations of the kernel primitives consumed by this crate.

use crate::{HvError, HvResult};
use core::ffi::c_void;

pub const NO_ERROR: i32 = 0;
pub const ERR_INTERNAL: i32 = -1;
pub const ERR_NOT_SUPPORTED: i32 = -2;
pub const ERR_NO_MEMORY: i32 = -4;
pub const ERR_INVALID_ARGS: i32 = -10;
pub const ERR_BAD_STATE: i32 = -20;

/// Translates a kernel status code at the collaborator boundary.
pub fn status_to_result(status: i32) -> HvResult {
    match status {
        NO_ERROR => Ok(()),
        ERR_NOT_SUPPORTED => Err(HvError::NotSupported),
        ERR_NO_MEMORY => Err(HvError::NoMemory),
        ERR_INVALID_ARGS => Err(HvError::InvalidArgs),
        ERR_BAD_STATE => Err(HvError::BadState),
        _ => Err(HvError::Internal),
    }
}

/// Encodes a result as a kernel status code for a worker thread's return.
pub fn result_to_status(result: HvResult) -> i32 {
    match result {
        Ok(()) => NO_ERROR,
        Err(HvError::NotSupported) => ERR_NOT_SUPPORTED,
        Err(HvError::NoMemory) => ERR_NO_MEMORY,
        Err(HvError::InvalidArgs) => ERR_INVALID_ARGS,
        Err(HvError::BadState) => ERR_BAD_STATE,
        Err(HvError::Internal) => ERR_INTERNAL,
    }
}

/// Opaque physical page record owned by the physical memory manager.
#[repr(C)]
pub struct VmPage {
    _private: [u8; 0],
}

/// Opaque kernel thread.
#[repr(C)]
pub struct Thread {
    _private: [u8; 0],
}

pub const HIGH_PRIORITY: u32 = 24;
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;
pub const INFINITE_TIME: u64 = u64::MAX;

extern "C" {
    pub fn pmm_alloc_page(flags: u32, pa: *mut u64) -> *mut VmPage;
    pub fn pmm_free_page(page: *mut VmPage);
    pub fn paddr_to_vm_page(pa: u64) -> *mut VmPage;
    pub fn paddr_to_kvaddr(pa: u64) -> *mut u8;

    pub fn thread_create(
        name: *const u8,
        entry: extern "C" fn(*mut c_void) -> i32,
        arg: *mut c_void,
        priority: u32,
        stack_size: usize,
    ) -> *mut Thread;
    pub fn thread_set_pinned_cpu(thread: *mut Thread, cpu: u32);
    pub fn thread_resume(thread: *mut Thread) -> i32;
    pub fn thread_join(thread: *mut Thread, retcode: *mut i32, deadline: u64) -> i32;

    pub fn arch_curr_cpu_num() -> u32;
    pub fn arch_max_num_cpus() -> u32;

    /// Base address of the per-CPU task state segment.
    pub fn x86_tss_address(cpu: u32) -> u64;
    /// Base address of the host global descriptor table.
    pub fn x86_gdt_address() -> u64;
    /// Base address of the read-only interrupt descriptor table.
    pub fn idt_readonly_address() -> u64;
    /// Clears the busy bit of a TSS descriptor so TR can be reloaded.
    pub fn x86_clear_tss_busy(selector: u16);
    /// Reloads the task register from the host GDT.
    pub fn x86_ltr(selector: u16);
    /// Reloads the read-only IDT, restoring its limit.
    pub fn idt_load_readonly();
}
