//! Privileged instruction wrappers.
//!
//! Every MSR, control register, CPUID and VMX instruction access goes
//! through this module. Unit tests replace it with a recorded machine model
//! so the rest of the crate can run as ordinary host code.

/// One CPUID leaf as reported by the processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidLeaf {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[cfg(not(test))]
mod imp {
    use super::CpuidLeaf;
    use crate::{HvError, HvResult};
    use core::arch::asm;
    use x86::cpuid::CpuId;

    pub fn read_msr(msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    pub fn write_msr(msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) }
    }

    pub fn has_vmx() -> bool {
        CpuId::new()
            .get_feature_info()
            .map_or(false, |f| f.has_vmx())
    }

    pub fn cpuid(leaf: u32) -> CpuidLeaf {
        let result = x86::cpuid::cpuid!(leaf);
        CpuidLeaf {
            eax: result.eax,
            ebx: result.ebx,
            ecx: result.ecx,
            edx: result.edx,
        }
    }

    pub fn cr0() -> u64 {
        let value: u64;
        unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    pub fn cr3() -> u64 {
        unsafe { x86::controlregs::cr3() }
    }

    pub fn cr4() -> u64 {
        let value: u64;
        unsafe { asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    pub fn set_cr4(value: u64) {
        unsafe { asm!("mov cr4, {}", in(reg) value, options(nomem, nostack, preserves_flags)) };
    }

    pub fn interrupts_enabled() -> bool {
        x86::bits64::rflags::read().contains(x86::bits64::rflags::RFlags::FLAGS_IF)
    }

    pub fn enable_interrupts() {
        unsafe { x86::irq::enable() };
    }

    pub fn disable_interrupts() {
        unsafe { x86::irq::disable() };
    }

    pub fn vmxon(pa: u64) -> HvResult {
        let err: u8;
        unsafe {
            asm!("vmxon [{pa}]", "setna {err}", pa = in(reg) &pa as *const u64,
                 err = out(reg_byte) err, options(nostack))
        };
        if err != 0 {
            return Err(HvError::Internal);
        }
        Ok(())
    }

    pub fn vmxoff() -> HvResult {
        let err: u8;
        unsafe { asm!("vmxoff", "setna {err}", err = out(reg_byte) err, options(nostack)) };
        if err != 0 {
            return Err(HvError::Internal);
        }
        Ok(())
    }

    pub fn vmclear(pa: u64) -> HvResult {
        let err: u8;
        unsafe {
            asm!("vmclear [{pa}]", "setna {err}", pa = in(reg) &pa as *const u64,
                 err = out(reg_byte) err, options(nostack))
        };
        if err != 0 {
            return Err(HvError::Internal);
        }
        Ok(())
    }

    pub fn vmptrld(pa: u64) -> HvResult {
        let err: u8;
        unsafe {
            asm!("vmptrld [{pa}]", "setna {err}", pa = in(reg) &pa as *const u64,
                 err = out(reg_byte) err, options(nostack))
        };
        if err != 0 {
            return Err(HvError::Internal);
        }
        Ok(())
    }

    pub fn vmread(field: u64) -> u64 {
        let value: u64;
        let err: u8;
        unsafe {
            asm!("vmread {value}, {field}", "setna {err}", field = in(reg) field,
                 value = out(reg) value, err = out(reg_byte) err, options(nostack))
        };
        debug_assert_eq!(err, 0, "vmread failed for field {:#x}", field);
        value
    }

    pub fn vmwrite(field: u64, value: u64) {
        let err: u8;
        unsafe {
            asm!("vmwrite {field}, {value}", "setna {err}", field = in(reg) field,
                 value = in(reg) value, err = out(reg_byte) err, options(nostack))
        };
        debug_assert_eq!(err, 0, "vmwrite failed for field {:#x}", field);
    }
}

#[cfg(test)]
pub mod mock;
#[cfg(test)]
use mock as imp;

pub use imp::{
    cpuid, cr0, cr3, cr4, disable_interrupts, enable_interrupts, has_vmx, interrupts_enabled,
    read_msr, set_cr4, vmclear, vmptrld, vmread, vmwrite, vmxoff, vmxon, write_msr,
};
