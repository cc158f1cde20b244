//! Recorded machine model backing the privileged instruction wrappers in
//! unit tests.
//!
//! The default state describes a processor with every capability this
//! hypervisor requires; tests flip individual bits to exercise the gates.

use super::CpuidLeaf;
use crate::{HvError, HvResult};
use std::cell::RefCell;
use std::collections::BTreeMap;
use x86::msr::{
    IA32_EFER, IA32_FEATURE_CONTROL, IA32_FMASK, IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GSBASE,
    IA32_LSTAR, IA32_PAT, IA32_STAR, IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1,
    IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1, IA32_VMX_EPT_VPID_CAP, IA32_VMX_ENTRY_CTLS,
    IA32_VMX_EXIT_CTLS, IA32_VMX_MISC, IA32_VMX_PINBASED_CTLS, IA32_VMX_PROCBASED_CTLS,
    IA32_VMX_PROCBASED_CTLS2, IA32_VMX_TRUE_ENTRY_CTLS, IA32_VMX_TRUE_EXIT_CTLS,
    IA32_VMX_TRUE_PINBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS,
};

/// All controls flexible, nothing forced: allowed-0 is zero, allowed-1 is
/// all ones.
const ALL_FLEXIBLE: u64 = 0xffff_ffff_0000_0000;

pub struct MockHw {
    pub msrs: BTreeMap<u32, u64>,
    pub msr_writes: Vec<(u32, u64)>,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub has_vmx: bool,
    pub vendor_leaf: CpuidLeaf,
    pub interrupts_enabled: bool,
    /// Interrupt-flag transitions, `true` for enable.
    pub int_transitions: Vec<bool>,
    pub vmxon_count: u32,
    pub vmxoff_count: u32,
    pub vmxon_region: u64,
    /// When set, VMXON fails once this many have succeeded.
    pub vmxon_limit: Option<u32>,
    pub loaded_vmcs: u64,
    pub vmptrld_log: Vec<u64>,
    pub vmclear_log: Vec<u64>,
    pub vmcs: BTreeMap<u64, BTreeMap<u64, u64>>,
}

impl Default for MockHw {
    fn default() -> Self {
        let mut msrs = BTreeMap::new();

        // Revision 1, 4 KiB regions, write-back structures, IO exit info,
        // true controls.
        msrs.insert(
            IA32_VMX_BASIC,
            1 | (0x1000u64 << 32) | (6u64 << 50) | (1u64 << 54) | (1u64 << 55),
        );
        // Wait-for-SIPI activity state; MSR list limit field of zero (512).
        msrs.insert(IA32_VMX_MISC, 1u64 << 8);
        // Page-walk 4, write-back EPT, 2 MiB and 1 GiB pages, INVEPT with
        // single- and all-context types, accessed/dirty flags, exit info.
        msrs.insert(
            IA32_VMX_EPT_VPID_CAP,
            (1u64 << 6)
                | (1u64 << 14)
                | (1u64 << 16)
                | (1u64 << 17)
                | (1u64 << 20)
                | (1u64 << 21)
                | (1u64 << 22)
                | (1u64 << 25)
                | (1u64 << 26),
        );
        msrs.insert(IA32_VMX_TRUE_PINBASED_CTLS, ALL_FLEXIBLE);
        msrs.insert(IA32_VMX_TRUE_PROCBASED_CTLS, ALL_FLEXIBLE);
        msrs.insert(IA32_VMX_TRUE_EXIT_CTLS, ALL_FLEXIBLE);
        msrs.insert(IA32_VMX_TRUE_ENTRY_CTLS, ALL_FLEXIBLE);
        msrs.insert(IA32_VMX_PROCBASED_CTLS2, ALL_FLEXIBLE);
        msrs.insert(IA32_VMX_PINBASED_CTLS, 0);
        msrs.insert(IA32_VMX_PROCBASED_CTLS, 0);
        msrs.insert(IA32_VMX_EXIT_CTLS, 0);
        msrs.insert(IA32_VMX_ENTRY_CTLS, 0);
        // Locked with VMXON enabled.
        msrs.insert(IA32_FEATURE_CONTROL, 0b101);
        // PE, NE and PG required set for CR0; VMXE required set for CR4.
        msrs.insert(IA32_VMX_CR0_FIXED0, 0x8000_0021);
        msrs.insert(IA32_VMX_CR0_FIXED1, 0xffff_ffff);
        msrs.insert(IA32_VMX_CR4_FIXED0, 0x2000);
        msrs.insert(IA32_VMX_CR4_FIXED1, 0xffff_ffff);
        msrs.insert(IA32_PAT, 0x0007_0406_0007_0406);
        msrs.insert(IA32_EFER, 0xd01);
        msrs.insert(IA32_STAR, 0x0023_0008_0000_0000);
        msrs.insert(IA32_LSTAR, 0xffff_ffff_8000_1000);
        msrs.insert(IA32_FMASK, 0x4_7700);
        msrs.insert(IA32_FS_BASE, 0x0000_7fff_1234_0000);
        msrs.insert(IA32_GS_BASE, 0xffff_8880_0000_0000);
        msrs.insert(IA32_KERNEL_GSBASE, 0x0000_7fff_5678_0000);

        Self {
            msrs,
            msr_writes: Vec::new(),
            cr0: 0x8005_0033,
            cr3: 0x0000_0000_0010_b000,
            cr4: 0x06f0,
            has_vmx: true,
            vendor_leaf: CpuidLeaf {
                eax: 0x16,
                ebx: 0x756e_6547, // "Genu"
                ecx: 0x6c65_746e, // "ntel"
                edx: 0x4965_6e69, // "ineI"
            },
            interrupts_enabled: true,
            int_transitions: Vec::new(),
            vmxon_count: 0,
            vmxoff_count: 0,
            vmxon_region: 0,
            vmxon_limit: None,
            loaded_vmcs: 0,
            vmptrld_log: Vec::new(),
            vmclear_log: Vec::new(),
            vmcs: BTreeMap::new(),
        }
    }
}

thread_local! {
    static HW: RefCell<MockHw> = RefCell::new(MockHw::default());
}

pub fn reset() {
    HW.with(|hw| *hw.borrow_mut() = MockHw::default());
}

pub fn with<R>(f: impl FnOnce(&mut MockHw) -> R) -> R {
    HW.with(|hw| f(&mut hw.borrow_mut()))
}

/// Field value of the most recently loaded VMCS.
pub fn vmcs_field(field: u64) -> u64 {
    with(|hw| {
        let pa = hw.loaded_vmcs;
        hw.vmcs.get(&pa).and_then(|vmcs| vmcs.get(&field)).copied().unwrap_or(0)
    })
}

pub fn read_msr(msr: u32) -> u64 {
    with(|hw| hw.msrs.get(&msr).copied().unwrap_or(0))
}

pub fn write_msr(msr: u32, value: u64) {
    with(|hw| {
        hw.msrs.insert(msr, value);
        hw.msr_writes.push((msr, value));
    })
}

pub fn has_vmx() -> bool {
    with(|hw| hw.has_vmx)
}

pub fn cpuid(leaf: u32) -> CpuidLeaf {
    with(|hw| match leaf {
        0 => hw.vendor_leaf,
        _ => CpuidLeaf::default(),
    })
}

pub fn cr0() -> u64 {
    with(|hw| hw.cr0)
}

pub fn cr3() -> u64 {
    with(|hw| hw.cr3)
}

pub fn cr4() -> u64 {
    with(|hw| hw.cr4)
}

pub fn set_cr4(value: u64) {
    with(|hw| hw.cr4 = value);
}

pub fn interrupts_enabled() -> bool {
    with(|hw| hw.interrupts_enabled)
}

pub fn enable_interrupts() {
    with(|hw| {
        hw.interrupts_enabled = true;
        hw.int_transitions.push(true);
    })
}

pub fn disable_interrupts() {
    with(|hw| {
        hw.interrupts_enabled = false;
        hw.int_transitions.push(false);
    })
}

pub fn vmxon(pa: u64) -> HvResult {
    with(|hw| {
        if let Some(limit) = hw.vmxon_limit {
            if hw.vmxon_count >= limit {
                return Err(HvError::Internal);
            }
        }
        hw.vmxon_count += 1;
        hw.vmxon_region = pa;
        Ok(())
    })
}

pub fn vmxoff() -> HvResult {
    with(|hw| {
        hw.vmxoff_count += 1;
        Ok(())
    })
}

pub fn vmclear(pa: u64) -> HvResult {
    with(|hw| {
        hw.vmclear_log.push(pa);
        hw.vmcs.entry(pa).or_default();
        Ok(())
    })
}

pub fn vmptrld(pa: u64) -> HvResult {
    with(|hw| {
        hw.loaded_vmcs = pa;
        hw.vmptrld_log.push(pa);
        hw.vmcs.entry(pa).or_default();
        Ok(())
    })
}

pub fn vmread(field: u64) -> u64 {
    vmcs_field(field)
}

pub fn vmwrite(field: u64, value: u64) {
    with(|hw| {
        let pa = hw.loaded_vmcs;
        assert_ne!(pa, 0, "vmwrite without a loaded VMCS");
        hw.vmcs.entry(pa).or_default().insert(field, value);
    })
}
