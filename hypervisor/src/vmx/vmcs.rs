//! Virtual Machine Control Structure fields and accessors.
//!
//! Field tags are split by architectural width; the reader/writer narrows
//! or widens in one place so VMREAD/VMWRITE call sites stay minimal.

use super::data::vmx_page::VmxPage;
use super::hw;
use crate::{HvError, HvResult};
use bitflags::bitflags;

/// 16-bit VMCS fields.
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types)]
pub enum VmcsField16 {
    VPID = 0x0000,
    HOST_ES_SELECTOR = 0x0c00,
    HOST_CS_SELECTOR = 0x0c02,
    HOST_SS_SELECTOR = 0x0c04,
    HOST_DS_SELECTOR = 0x0c06,
    HOST_FS_SELECTOR = 0x0c08,
    HOST_GS_SELECTOR = 0x0c0a,
    HOST_TR_SELECTOR = 0x0c0c,
}

/// 32-bit VMCS fields.
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types)]
pub enum VmcsField32 {
    PINBASED_CTLS = 0x4000,
    PROCBASED_CTLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGEFAULT_ERRORCODE_MASK = 0x4006,
    PAGEFAULT_ERRORCODE_MATCH = 0x4008,
    EXIT_CTLS = 0x400c,
    EXIT_MSR_STORE_COUNT = 0x400e,
    EXIT_MSR_LOAD_COUNT = 0x4010,
    ENTRY_CTLS = 0x4012,
    ENTRY_MSR_LOAD_COUNT = 0x4014,
    PROCBASED_CTLS2 = 0x401e,
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    INTERRUPTION_INFORMATION = 0x4404,
    INTERRUPTION_ERROR_CODE = 0x4406,
    INSTRUCTION_LENGTH = 0x440c,
    INSTRUCTION_INFORMATION = 0x440e,
    GUEST_GDTR_LIMIT = 0x4810,
    GUEST_IDTR_LIMIT = 0x4812,
    GUEST_ES_ACCESS_RIGHTS = 0x4814,
    GUEST_CS_ACCESS_RIGHTS = 0x4816,
    GUEST_SS_ACCESS_RIGHTS = 0x4818,
    GUEST_DS_ACCESS_RIGHTS = 0x481a,
    GUEST_FS_ACCESS_RIGHTS = 0x481c,
    GUEST_GS_ACCESS_RIGHTS = 0x481e,
    GUEST_LDTR_ACCESS_RIGHTS = 0x4820,
    GUEST_TR_ACCESS_RIGHTS = 0x4822,
    GUEST_INTERRUPTIBILITY_STATE = 0x4824,
    GUEST_ACTIVITY_STATE = 0x4826,
    GUEST_IA32_SYSENTER_CS = 0x482a,
    HOST_IA32_SYSENTER_CS = 0x4c00,
}

/// 64-bit VMCS fields.
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types)]
pub enum VmcsField64 {
    MSR_BITMAPS_ADDRESS = 0x2004,
    EXIT_MSR_STORE_ADDRESS = 0x2006,
    EXIT_MSR_LOAD_ADDRESS = 0x2008,
    ENTRY_MSR_LOAD_ADDRESS = 0x200a,
    EPT_POINTER = 0x201a,
    GUEST_PHYSICAL_ADDRESS = 0x2400,
    LINK_POINTER = 0x2800,
    GUEST_IA32_PAT = 0x2804,
    GUEST_IA32_EFER = 0x2806,
    HOST_IA32_PAT = 0x2c00,
    HOST_IA32_EFER = 0x2c02,
}

/// Natural-width VMCS fields.
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types)]
pub enum VmcsFieldXX {
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDRESS = 0x640a,
    GUEST_CR0 = 0x6800,
    GUEST_CR3 = 0x6802,
    GUEST_CR4 = 0x6804,
    GUEST_GDTR_BASE = 0x6816,
    GUEST_IDTR_BASE = 0x6818,
    GUEST_RSP = 0x681c,
    GUEST_RIP = 0x681e,
    GUEST_RFLAGS = 0x6820,
    GUEST_PENDING_DEBUG_EXCEPTIONS = 0x6822,
    GUEST_IA32_SYSENTER_ESP = 0x6824,
    GUEST_IA32_SYSENTER_EIP = 0x6826,
    HOST_CR0 = 0x6c00,
    HOST_CR3 = 0x6c02,
    HOST_CR4 = 0x6c04,
    HOST_FS_BASE = 0x6c06,
    HOST_GS_BASE = 0x6c08,
    HOST_TR_BASE = 0x6c0a,
    HOST_GDTR_BASE = 0x6c0c,
    HOST_IDTR_BASE = 0x6c0e,
    HOST_IA32_SYSENTER_ESP = 0x6c10,
    HOST_IA32_SYSENTER_EIP = 0x6c12,
    HOST_RSP = 0x6c14,
    HOST_RIP = 0x6c16,
}

bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinbasedControls: u32 {
        /// External interrupts cause a VM exit.
        const EXTINT_EXITING = 1 << 0;
        /// Non-maskable interrupts cause a VM exit.
        const NMI_EXITING = 1 << 3;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct PrimaryControls: u32 {
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        /// VM exit on IN/OUT and their string forms.
        const IO_EXITING = 1 << 24;
        /// VM exit on MSR access decided by the MSR bitmaps.
        const MSR_BITMAPS = 1 << 28;
        /// Enable the secondary processor-based controls.
        const SECONDARY_CTLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct SecondaryControls: u32 {
        /// Extended page tables.
        const EPT = 1 << 1;
        /// RDTSCP usable by the guest.
        const RDTSCP = 1 << 3;
        /// Cached translations are tagged with a virtual processor ID.
        const VPID = 1 << 5;
        /// XSAVES and XRSTORS usable by the guest.
        const XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags! {
    /// VM-exit controls.
    pub struct ExitControls: u32 {
        /// Logical processor is in 64-bit mode after VM exit.
        const HOST_64BIT_MODE = 1 << 9;
        const SAVE_IA32_PAT = 1 << 18;
        const LOAD_IA32_PAT = 1 << 19;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
    }
}

bitflags! {
    /// VM-entry controls.
    pub struct EntryControls: u32 {
        /// Logical processor is in IA-32e mode after VM entry.
        const IA32E_MODE = 1 << 9;
        const LOAD_IA32_PAT = 1 << 14;
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags! {
    /// Guest segment access rights. The low 16 bits mirror bits 23:8 of the
    /// upper half of a 64-bit segment descriptor.
    pub struct AccessRights: u32 {
        const ACCESSED = 1 << 0;
        /// Writable data, or readable code.
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 3;
        /// Descriptor type: code or data rather than system.
        const CODE_DATA = 1 << 4;
        const PRESENT = 1 << 7;
        /// 64-bit mode active, CS only.
        const LONG_MODE = 1 << 13;
        const UNUSABLE = 1 << 16;
        /// Busy TSS system descriptor type.
        const TSS_BUSY = 0b1011;
    }
}

/// Set in LINK_POINTER when no shadow VMCS is in use.
pub const LINK_POINTER_INVALIDATE: u64 = u64::MAX;

pub const EXCEPTION_BITMAP_ALL_EXCEPTIONS: u32 = u32::MAX;

/// Reserved-one bits of RFLAGS.
pub const RFLAGS_RESERVED_ONES: u64 = 1 << 1;

pub fn read16(field: VmcsField16) -> u16 {
    hw::vmread(field as u64) as u16
}

pub fn read32(field: VmcsField32) -> u32 {
    hw::vmread(field as u64) as u32
}

pub fn read64(field: VmcsField64) -> u64 {
    hw::vmread(field as u64)
}

pub fn read_xx(field: VmcsFieldXX) -> u64 {
    hw::vmread(field as u64)
}

pub fn write16(field: VmcsField16, value: u16) {
    hw::vmwrite(field as u64, value as u64);
}

pub fn write32(field: VmcsField32, value: u32) {
    hw::vmwrite(field as u64, value as u64);
}

pub fn write64(field: VmcsField64, value: u64) {
    hw::vmwrite(field as u64, value);
}

pub fn write_xx(field: VmcsFieldXX, value: u64) {
    hw::vmwrite(field as u64, value);
}

/// Holds "VMCS loaded, interrupts disabled" for a scope. Both are released
/// on every exit path when the guard drops.
pub struct AutoVmcsLoad(());

impl AutoVmcsLoad {
    pub fn new(page: &VmxPage) -> HvResult<Self> {
        debug_assert!(hw::interrupts_enabled());
        hw::disable_interrupts();

        if let Err(err) = hw::vmptrld(page.physical_address()) {
            hw::enable_interrupts();
            return Err(err);
        }

        Ok(Self(()))
    }
}

impl Drop for AutoVmcsLoad {
    fn drop(&mut self) {
        debug_assert!(!hw::interrupts_enabled());
        hw::enable_interrupts();
    }
}

/// Computes a control value from a true capability MSR, the pre-"true"
/// default MSR, and the caller's required-set and required-clear masks.
///
/// From Volume 3, Section 31.5.1, Algorithm 3, Part C: if a control can be
/// either 0 or 1 (flexible) and the caller did not specify it, refer to the
/// old MSR to find the default value.
pub(crate) fn compute_control(
    true_msr: u64,
    old_msr: u64,
    set: u32,
    clear: u32,
) -> HvResult<u32> {
    let allowed_0 = true_msr as u32;
    let allowed_1 = (true_msr >> 32) as u32;

    if (allowed_1 & set) != set {
        return Err(HvError::NotSupported);
    }
    if (!allowed_0 & clear) != clear {
        return Err(HvError::NotSupported);
    }
    if (set & clear) != 0 {
        return Err(HvError::InvalidArgs);
    }

    let flexible = allowed_0 ^ allowed_1;
    let unknown = flexible & !(set | clear);
    let defaults = unknown & old_msr as u32;
    Ok(allowed_0 | defaults | set)
}

/// Negotiates and programs one VMCS control field.
pub fn set_control(
    field: VmcsField32,
    true_msr: u64,
    old_msr: u64,
    set: u32,
    clear: u32,
) -> HvResult {
    let value = compute_control(true_msr, old_msr, set, clear).map_err(|err| {
        log::warn!(
            "Can not program vmcs controls {:?}: set {:#x}, clear {:#x}",
            field,
            set,
            clear
        );
        err
    })?;

    write32(field, value);
    Ok(())
}
