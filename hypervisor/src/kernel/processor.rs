//! Per-CPU execution and host descriptor table access.
//!
//! VMXON, VMXOFF, VMPTRLD and VMLAUNCH operate on per-CPU structures and
//! must run on the CPU that owns them. `percpu_exec` provides that
//! guarantee: it runs a closure on a worker pinned to the target CPU and
//! joins it before returning.

use crate::HvResult;

#[cfg(not(test))]
mod imp {
    use super::super::include::*;
    use crate::{HvError, HvResult};
    use alloc::boxed::Box;
    use core::ffi::c_void;

    pub fn current_cpu() -> u32 {
        unsafe { arch_curr_cpu_num() }
    }

    pub fn max_cpus() -> u32 {
        unsafe { arch_max_num_cpus() }
    }

    extern "C" fn worker_entry<F>(arg: *mut c_void) -> i32
    where
        F: FnOnce() -> HvResult,
    {
        let f = unsafe { Box::from_raw(arg as *mut F) };
        result_to_status(f())
    }

    pub fn percpu_exec<F>(cpu: u32, f: F) -> HvResult
    where
        F: FnOnce() -> HvResult + Send,
    {
        let arg = Box::into_raw(Box::new(f));

        let thread = unsafe {
            thread_create(
                b"vmx\0".as_ptr(),
                worker_entry::<F>,
                arg as *mut c_void,
                HIGH_PRIORITY,
                DEFAULT_STACK_SIZE,
            )
        };
        if thread.is_null() {
            // The closure never ran; reclaim it.
            drop(unsafe { Box::from_raw(arg) });
            return Err(HvError::NoMemory);
        }

        unsafe { thread_set_pinned_cpu(thread, cpu) };

        let status = unsafe { thread_resume(thread) };
        status_to_result(status)?;

        // The join is what makes borrowing into the closure sound: the
        // worker has fully finished before this function returns.
        let mut retcode = NO_ERROR;
        let status = unsafe { thread_join(thread, &mut retcode, INFINITE_TIME) };
        status_to_result(status)?;
        status_to_result(retcode)
    }

    pub fn tss_address(cpu: u32) -> u64 {
        unsafe { x86_tss_address(cpu) }
    }

    pub fn gdt_base() -> u64 {
        unsafe { x86_gdt_address() }
    }

    pub fn readonly_idt_base() -> u64 {
        unsafe { idt_readonly_address() }
    }

    pub fn reload_tss(selector: u16) {
        unsafe {
            x86_clear_tss_busy(selector);
            x86_ltr(selector);
        }
    }

    pub fn reload_idt() {
        unsafe { idt_load_readonly() }
    }
}

#[cfg(test)]
use super::mock as imp;

pub use imp::{
    current_cpu, gdt_base, max_cpus, readonly_idt_base, reload_idt, reload_tss, tss_address,
};

/// Runs `f` on a high-priority worker pinned to `cpu` and returns its status,
/// or the spawn/join failure.
pub fn percpu_exec<F>(cpu: u32, f: F) -> HvResult
where
    F: FnOnce() -> HvResult + Send,
{
    imp::percpu_exec(cpu, f)
}
