//! Checks whether the current system is able to run the hypervisor.
//!
//! The three VMX capability MSRs are exposed as typed views; the gating
//! rules follow Volume 3, Appendices A.1, A.6 and A.10.

use super::hw;
use crate::{HvError, HvResult};
use x86::msr::{IA32_VMX_BASIC, IA32_VMX_EPT_VPID_CAP, IA32_VMX_MISC};

/// Memory type encoding for write-back, used by both the VMX-structure
/// capability check and the EPT pointer.
pub const VMX_MEMORY_TYPE_WRITE_BACK: u64 = 6;

pub(crate) const X86_CR0_PE: u64 = 1 << 0;
pub(crate) const X86_CR0_NE: u64 = 1 << 5;
pub(crate) const X86_CR0_PG: u64 = 1 << 31;
pub(crate) const X86_CR4_PAE: u64 = 1 << 5;
pub(crate) const X86_CR4_VMXE: u64 = 1 << 13;

const fn bits(value: u64, high: u32, low: u32) -> u64 {
    (value >> low) & ((1u64 << (high - low + 1)) - 1)
}

const fn bit(value: u64, n: u32) -> bool {
    value & (1u64 << n) != 0
}

/// View of IA32_VMX_BASIC.
#[derive(Clone, Copy, Debug)]
pub struct VmxInfo {
    pub revision_id: u32,
    pub region_size: u16,
    pub write_back: bool,
    pub io_exit_info: bool,
    pub vmx_controls: bool,
}

impl VmxInfo {
    pub fn read() -> Self {
        let basic_info = hw::read_msr(IA32_VMX_BASIC);
        Self {
            revision_id: bits(basic_info, 30, 0) as u32,
            region_size: bits(basic_info, 44, 32) as u16,
            write_back: bits(basic_info, 53, 50) == VMX_MEMORY_TYPE_WRITE_BACK,
            io_exit_info: bit(basic_info, 54),
            vmx_controls: bit(basic_info, 55),
        }
    }
}

/// View of IA32_VMX_MISC.
#[derive(Clone, Copy, Debug)]
pub struct MiscInfo {
    pub wait_for_sipi: bool,
    pub msr_list_limit: u32,
}

impl MiscInfo {
    pub fn read() -> Self {
        let misc_info = hw::read_msr(IA32_VMX_MISC);
        Self {
            wait_for_sipi: bit(misc_info, 8),
            msr_list_limit: (bits(misc_info, 27, 25) as u32 + 1) * 512,
        }
    }
}

/// View of IA32_VMX_EPT_VPID_CAP.
#[derive(Clone, Copy, Debug)]
pub struct EptInfo {
    pub page_walk_4: bool,
    pub write_back: bool,
    pub pde_2mb_page: bool,
    pub pdpe_1gb_page: bool,
    pub ept_flags: bool,
    pub exit_info: bool,
    pub invept: bool,
}

impl EptInfo {
    pub fn read() -> Self {
        let ept_info = hw::read_msr(IA32_VMX_EPT_VPID_CAP);
        Self {
            page_walk_4: bit(ept_info, 6),
            write_back: bit(ept_info, 14),
            pde_2mb_page: bit(ept_info, 16),
            pdpe_1gb_page: bit(ept_info, 17),
            ept_flags: bit(ept_info, 21),
            exit_info: bit(ept_info, 22),
            invept:
                // INVEPT instruction is supported.
                bit(ept_info, 20) &&
                // Single-context INVEPT type is supported.
                bit(ept_info, 25) &&
                // All-context INVEPT type is supported.
                bit(ept_info, 26),
        }
    }
}

/// Verifies every capability the hypervisor relies on. Runs on the CPU that
/// is about to enter VMX operation.
pub fn check_capabilities() -> HvResult {
    let vmx_info = VmxInfo::read();

    // Instruction information must be provided on IO exits.
    if !vmx_info.io_exit_info {
        log::warn!("Processor does not report IO exit instruction information");
        return Err(HvError::NotSupported);
    }

    // The true capability MSRs must exist for control negotiation.
    if !vmx_info.vmx_controls {
        log::warn!("Processor does not support true VMX controls");
        return Err(HvError::NotSupported);
    }

    let ept_info = EptInfo::read();
    if !ept_info.page_walk_4 {
        log::warn!("EPT page-walk length of 4 is not supported");
        return Err(HvError::NotSupported);
    }
    if !ept_info.write_back {
        log::warn!("Write-back EPT structures are not supported");
        return Err(HvError::NotSupported);
    }
    if !ept_info.ept_flags {
        log::warn!("EPT accessed and dirty flags are not supported");
        return Err(HvError::NotSupported);
    }
    if !ept_info.invept {
        log::warn!("INVEPT is not fully supported");
        return Err(HvError::NotSupported);
    }

    let misc_info = MiscInfo::read();
    if !misc_info.wait_for_sipi {
        log::warn!("Wait-for-SIPI activity state is not supported");
        return Err(HvError::NotSupported);
    }

    Ok(())
}

/// Whether a control register value violates the fixed-bit constraints of
/// VMX operation: every bit set in `fixed0` must be 1 and every bit clear in
/// `fixed1` must be 0.
pub(crate) fn cr_invalid(cr_value: u64, fixed0: u64, fixed1: u64) -> bool {
    !(cr_value | !fixed0) != 0 || !(!cr_value | fixed1) != 0
}

/// Reads a fixed-bit MSR pair and applies `cr_invalid`.
pub(crate) fn cr_is_invalid(cr_value: u64, fixed0_msr: u32, fixed1_msr: u32) -> bool {
    cr_invalid(cr_value, hw::read_msr(fixed0_msr), hw::read_msr(fixed1_msr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::hw::mock;

    #[test]
    fn basic_info_fields() {
        mock::reset();
        let info = VmxInfo::read();
        assert_eq!(info.revision_id, 1);
        assert_eq!(info.region_size, 0x1000);
        assert!(info.write_back);
        assert!(info.io_exit_info);
        assert!(info.vmx_controls);
    }

    #[test]
    fn misc_info_fields() {
        mock::reset();
        let info = MiscInfo::read();
        assert!(info.wait_for_sipi);
        assert_eq!(info.msr_list_limit, 512);
    }

    #[test]
    fn ept_info_requires_all_invept_types() {
        mock::reset();
        assert!(EptInfo::read().invept);

        // Drop the all-context INVEPT type.
        mock::with(|hw| {
            let cap = hw.msrs[&IA32_VMX_EPT_VPID_CAP] & !(1u64 << 26);
            hw.msrs.insert(IA32_VMX_EPT_VPID_CAP, cap);
        });
        assert!(!EptInfo::read().invept);
    }

    #[test]
    fn capability_gating() {
        let cases: &[(u32, u64)] = &[
            (IA32_VMX_BASIC, 1 << 54),        // IO exit info
            (IA32_VMX_BASIC, 1 << 55),        // true controls
            (IA32_VMX_EPT_VPID_CAP, 1 << 6),  // page-walk 4
            (IA32_VMX_EPT_VPID_CAP, 1 << 14), // write-back EPT
            (IA32_VMX_EPT_VPID_CAP, 1 << 21), // accessed/dirty flags
            (IA32_VMX_EPT_VPID_CAP, 1 << 20), // INVEPT
            (IA32_VMX_EPT_VPID_CAP, 1 << 25), // single-context INVEPT
            (IA32_VMX_EPT_VPID_CAP, 1 << 26), // all-context INVEPT
            (IA32_VMX_MISC, 1 << 8),          // wait-for-SIPI
        ];

        for &(msr, mask) in cases {
            mock::reset();
            mock::with(|hw| {
                let value = hw.msrs[&msr] & !mask;
                hw.msrs.insert(msr, value);
            });
            assert_eq!(
                check_capabilities(),
                Err(crate::HvError::NotSupported),
                "msr {:#x} bit {:#x}",
                msr,
                mask
            );
        }

        mock::reset();
        assert_eq!(check_capabilities(), Ok(()));
    }

    #[test]
    fn cr_fixed_bit_check() {
        // Required-1 bits missing.
        assert!(cr_invalid(0, 0x21, 0xffff_ffff));
        // Required-0 bits present.
        assert!(cr_invalid(0xffff_ffff, 0, 0));
        // Exactly the required bits.
        assert!(!cr_invalid(0x21, 0x21, 0x21));
    }
}
