//! Per-CPU guest VMCS lifecycle: one-time setup and entry.

use super::data::guest::VmxState;
use super::data::msr_bitmap::MsrBitmap;
use super::data::msr_list::MsrList;
use super::data::vmx_page::VmxPage;
use super::hw;
use super::support::{
    self, VmxInfo, VMX_MEMORY_TYPE_WRITE_BACK, X86_CR0_NE, X86_CR0_PE, X86_CR0_PG, X86_CR4_PAE,
    X86_CR4_VMXE,
};
use super::vmcs::{
    self, AccessRights, AutoVmcsLoad, EntryControls, ExitControls, PinbasedControls,
    PrimaryControls, SecondaryControls, VmcsField16, VmcsField32, VmcsField64, VmcsFieldXX,
    EXCEPTION_BITMAP_ALL_EXCEPTIONS, LINK_POINTER_INVALIDATE, RFLAGS_RESERVED_ONES,
};
use super::vmexit;
use super::vmlaunch::{vmx_enter, vmx_exit_entry};
use crate::guest::ByteSink;
use crate::kernel::{self, memory::PAGE_SIZE, processor};
use crate::{HvError, HvResult};
use alloc::boxed::Box;
use x86::msr::{
    IA32_EFER, IA32_FMASK, IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GSBASE, IA32_LSTAR, IA32_PAT,
    IA32_STAR, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1,
    IA32_VMX_ENTRY_CTLS, IA32_VMX_EXIT_CTLS, IA32_VMX_PINBASED_CTLS, IA32_VMX_PROCBASED_CTLS,
    IA32_VMX_PROCBASED_CTLS2, IA32_VMX_TRUE_ENTRY_CTLS, IA32_VMX_TRUE_EXIT_CTLS,
    IA32_VMX_TRUE_PINBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS,
};

/// Encodes the EPT pointer for a page-aligned PML4.
pub(crate) fn ept_pointer(pml4_address: u64) -> u64 {
    debug_assert_eq!(pml4_address % PAGE_SIZE as u64, 0);

    // Physical address of the PML4, write-back memory, page-walk length of
    // 4 (encoded as N minus 1), accessed and dirty flags enabled.
    pml4_address | VMX_MEMORY_TYPE_WRITE_BACK | (3 << 3) | (1 << 6)
}

/// Guest VMCS state owned by one logical CPU.
pub struct VmcsCpu {
    cpu: u32,
    page: VmxPage,
    msr_bitmap: MsrBitmap,
    host_msr_list: MsrList,
    guest_msr_list: MsrList,
    vmx_state: Box<VmxState>,
    do_resume: bool,
}

impl VmcsCpu {
    pub fn new(cpu: u32, vmx_info: &VmxInfo) -> HvResult<Self> {
        let mut page = VmxPage::alloc(vmx_info, 0)?;
        page.set_revision_id(vmx_info.revision_id);

        Ok(Self {
            cpu,
            page,
            msr_bitmap: MsrBitmap::new(vmx_info)?,
            host_msr_list: MsrList::new(vmx_info)?,
            guest_msr_list: MsrList::new(vmx_info)?,
            // Boxed so HOST_RSP stays valid however the owning context moves.
            vmx_state: Box::new(VmxState::default()),
            do_resume: false,
        })
    }

    pub fn clear(&mut self) -> HvResult {
        hw::vmclear(self.page.physical_address())
    }

    /// Programs every VMCS field the guest model needs. Runs pinned to the
    /// owning CPU with the VMCS loaded and interrupts disabled.
    pub fn setup(&mut self, pml4_address: u64) -> HvResult {
        self.clear()?;

        let _load = AutoVmcsLoad::new(&self.page)?;

        // Secondary processor-based controls. There is no pre-"true" MSR
        // for these, so the legacy word is zero.
        vmcs::set_control(
            VmcsField32::PROCBASED_CTLS2,
            hw::read_msr(IA32_VMX_PROCBASED_CTLS2),
            0,
            (SecondaryControls::EPT
                | SecondaryControls::RDTSCP
                | SecondaryControls::VPID
                | SecondaryControls::XSAVES_XRSTORS)
                .bits(),
            0,
        )?;

        // Pin-based controls.
        vmcs::set_control(
            VmcsField32::PINBASED_CTLS,
            hw::read_msr(IA32_VMX_TRUE_PINBASED_CTLS),
            hw::read_msr(IA32_VMX_PINBASED_CTLS),
            (PinbasedControls::EXTINT_EXITING | PinbasedControls::NMI_EXITING).bits(),
            0,
        )?;

        // Primary processor-based controls. CR3 accesses are the guest's
        // own business under EPT.
        vmcs::set_control(
            VmcsField32::PROCBASED_CTLS,
            hw::read_msr(IA32_VMX_TRUE_PROCBASED_CTLS),
            hw::read_msr(IA32_VMX_PROCBASED_CTLS),
            (PrimaryControls::IO_EXITING
                | PrimaryControls::MSR_BITMAPS
                | PrimaryControls::SECONDARY_CTLS)
                .bits(),
            (PrimaryControls::CR3_LOAD_EXITING | PrimaryControls::CR3_STORE_EXITING).bits(),
        )?;

        // VM-exit controls: the host is 64-bit, and PAT/EFER swap on exit.
        vmcs::set_control(
            VmcsField32::EXIT_CTLS,
            hw::read_msr(IA32_VMX_TRUE_EXIT_CTLS),
            hw::read_msr(IA32_VMX_EXIT_CTLS),
            (ExitControls::HOST_64BIT_MODE
                | ExitControls::SAVE_IA32_PAT
                | ExitControls::LOAD_IA32_PAT
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        // VM-entry controls: the guest starts in IA-32e mode.
        vmcs::set_control(
            VmcsField32::ENTRY_CTLS,
            hw::read_msr(IA32_VMX_TRUE_ENTRY_CTLS),
            hw::read_msr(IA32_VMX_ENTRY_CTLS),
            (EntryControls::IA32E_MODE
                | EntryControls::LOAD_IA32_PAT
                | EntryControls::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        // From Volume 3, Section 25.2: trapping all exceptions with a zero
        // page-fault error-code mask and match makes every #PF exit.
        vmcs::write32(VmcsField32::EXCEPTION_BITMAP, EXCEPTION_BITMAP_ALL_EXCEPTIONS);
        vmcs::write32(VmcsField32::PAGEFAULT_ERRORCODE_MASK, 0);
        vmcs::write32(VmcsField32::PAGEFAULT_ERRORCODE_MATCH, 0);

        // From Volume 3, Section 26.2.1.1: with the VPID control enabled the
        // VPID field must not be zero.
        vmcs::write16(VmcsField16::VPID, self.cpu as u16 + 1);

        vmcs::write64(VmcsField64::EPT_POINTER, ept_pointer(pml4_address));

        // MSR handling: everything exits except the fast GS pair.
        self.msr_bitmap.ignore(IA32_GS_BASE);
        self.msr_bitmap.ignore(IA32_KERNEL_GSBASE);
        vmcs::write64(
            VmcsField64::MSR_BITMAPS_ADDRESS,
            self.msr_bitmap.physical_address(),
        );

        // Host MSRs restored by the processor on exit. Index 3 is
        // KERNEL_GS_BASE and is refreshed on every entry.
        self.host_msr_list.edit(0, IA32_STAR, hw::read_msr(IA32_STAR));
        self.host_msr_list.edit(1, IA32_LSTAR, hw::read_msr(IA32_LSTAR));
        self.host_msr_list.edit(2, IA32_FMASK, hw::read_msr(IA32_FMASK));
        vmcs::write64(
            VmcsField64::EXIT_MSR_LOAD_ADDRESS,
            self.host_msr_list.physical_address(),
        );
        vmcs::write32(VmcsField32::EXIT_MSR_LOAD_COUNT, 4);

        // Guest MSRs saved on exit and reloaded on entry.
        self.guest_msr_list.edit(0, IA32_KERNEL_GSBASE, 0);
        vmcs::write64(
            VmcsField64::EXIT_MSR_STORE_ADDRESS,
            self.guest_msr_list.physical_address(),
        );
        vmcs::write32(VmcsField32::EXIT_MSR_STORE_COUNT, 1);
        vmcs::write64(
            VmcsField64::ENTRY_MSR_LOAD_ADDRESS,
            self.guest_msr_list.physical_address(),
        );
        vmcs::write32(VmcsField32::ENTRY_MSR_LOAD_COUNT, 1);

        // Host state to restore on exit. Pinned to this CPU, so per-CPU
        // state is stable here.
        vmcs::write64(VmcsField64::HOST_IA32_PAT, hw::read_msr(IA32_PAT));
        vmcs::write64(VmcsField64::HOST_IA32_EFER, hw::read_msr(IA32_EFER));
        vmcs::write_xx(VmcsFieldXX::HOST_CR0, hw::cr0());
        vmcs::write_xx(VmcsFieldXX::HOST_CR4, hw::cr4());
        vmcs::write16(VmcsField16::HOST_ES_SELECTOR, 0);
        vmcs::write16(VmcsField16::HOST_CS_SELECTOR, kernel::CODE_64_SELECTOR);
        vmcs::write16(VmcsField16::HOST_SS_SELECTOR, kernel::DATA_SELECTOR);
        vmcs::write16(VmcsField16::HOST_DS_SELECTOR, 0);
        vmcs::write16(VmcsField16::HOST_FS_SELECTOR, 0);
        vmcs::write16(VmcsField16::HOST_GS_SELECTOR, 0);
        vmcs::write16(VmcsField16::HOST_TR_SELECTOR, kernel::tss_selector(self.cpu));
        vmcs::write_xx(VmcsFieldXX::HOST_FS_BASE, hw::read_msr(IA32_FS_BASE));
        vmcs::write_xx(VmcsFieldXX::HOST_GS_BASE, hw::read_msr(IA32_GS_BASE));
        vmcs::write_xx(VmcsFieldXX::HOST_TR_BASE, processor::tss_address(self.cpu));
        vmcs::write_xx(VmcsFieldXX::HOST_GDTR_BASE, processor::gdt_base());
        vmcs::write_xx(VmcsFieldXX::HOST_IDTR_BASE, processor::readonly_idt_base());
        vmcs::write_xx(VmcsFieldXX::HOST_IA32_SYSENTER_ESP, 0);
        vmcs::write_xx(VmcsFieldXX::HOST_IA32_SYSENTER_EIP, 0);
        vmcs::write32(VmcsField32::HOST_IA32_SYSENTER_CS, 0);
        vmcs::write_xx(
            VmcsFieldXX::HOST_RSP,
            self.vmx_state.as_ref() as *const VmxState as u64,
        );
        vmcs::write_xx(VmcsFieldXX::HOST_RIP, vmx_exit_entry as usize as u64);

        // Initial guest state: 64-bit paged protected mode.

        let cr0 = X86_CR0_PE | X86_CR0_PG | X86_CR0_NE;
        if support::cr_is_invalid(cr0, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1) {
            return Err(HvError::BadState);
        }
        vmcs::write_xx(VmcsFieldXX::GUEST_CR0, cr0);

        let cr4 = X86_CR4_PAE | X86_CR4_VMXE;
        if support::cr_is_invalid(cr4, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1) {
            return Err(HvError::BadState);
        }
        vmcs::write_xx(VmcsFieldXX::GUEST_CR4, cr4);

        vmcs::write64(VmcsField64::GUEST_IA32_PAT, hw::read_msr(IA32_PAT));
        vmcs::write64(VmcsField64::GUEST_IA32_EFER, hw::read_msr(IA32_EFER));

        vmcs::write32(
            VmcsField32::GUEST_CS_ACCESS_RIGHTS,
            (AccessRights::ACCESSED
                | AccessRights::WRITABLE
                | AccessRights::EXECUTABLE
                | AccessRights::CODE_DATA
                | AccessRights::PRESENT
                | AccessRights::LONG_MODE)
                .bits(),
        );
        vmcs::write32(
            VmcsField32::GUEST_TR_ACCESS_RIGHTS,
            (AccessRights::TSS_BUSY | AccessRights::PRESENT).bits(),
        );

        // No other segments until a guest needs them.
        let unusable = AccessRights::UNUSABLE.bits();
        vmcs::write32(VmcsField32::GUEST_SS_ACCESS_RIGHTS, unusable);
        vmcs::write32(VmcsField32::GUEST_DS_ACCESS_RIGHTS, unusable);
        vmcs::write32(VmcsField32::GUEST_ES_ACCESS_RIGHTS, unusable);
        vmcs::write32(VmcsField32::GUEST_FS_ACCESS_RIGHTS, unusable);
        vmcs::write32(VmcsField32::GUEST_GS_ACCESS_RIGHTS, unusable);
        vmcs::write32(VmcsField32::GUEST_LDTR_ACCESS_RIGHTS, unusable);

        vmcs::write_xx(VmcsFieldXX::GUEST_GDTR_BASE, 0);
        vmcs::write32(VmcsField32::GUEST_GDTR_LIMIT, 0);
        vmcs::write_xx(VmcsFieldXX::GUEST_IDTR_BASE, 0);
        vmcs::write32(VmcsField32::GUEST_IDTR_LIMIT, 0);

        vmcs::write_xx(VmcsFieldXX::GUEST_RFLAGS, RFLAGS_RESERVED_ONES);

        vmcs::write32(VmcsField32::GUEST_ACTIVITY_STATE, 0);
        vmcs::write32(VmcsField32::GUEST_INTERRUPTIBILITY_STATE, 0);
        vmcs::write_xx(VmcsFieldXX::GUEST_PENDING_DEBUG_EXCEPTIONS, 0);

        // From Volume 3, Section 26.3.1.1: the SYSENTER ESP and EIP fields
        // must each hold a canonical address.
        vmcs::write_xx(VmcsFieldXX::GUEST_IA32_SYSENTER_ESP, 0);
        vmcs::write_xx(VmcsFieldXX::GUEST_IA32_SYSENTER_EIP, 0);
        vmcs::write32(VmcsField32::GUEST_IA32_SYSENTER_CS, 0);
        vmcs::write_xx(VmcsFieldXX::GUEST_RSP, 0);

        // From Volume 3, Section 24.4.2: without VMCS shadowing the link
        // pointer is set to all-ones to avoid VM-entry failures.
        vmcs::write64(VmcsField64::LINK_POINTER, LINK_POINTER_INVALIDATE);

        Ok(())
    }

    /// Enters the guest and services the resulting VM exit. Runs pinned to
    /// the owning CPU.
    pub fn enter(&mut self, cr3: u64, entry: u64, sink: &dyn ByteSink) -> HvResult {
        let _load = AutoVmcsLoad::new(&self.page)?;

        // FS holds thread-local storage; save it for this thread.
        vmcs::write_xx(VmcsFieldXX::HOST_FS_BASE, hw::read_msr(IA32_FS_BASE));
        // CR3 holds the current address space; save it for this thread.
        vmcs::write_xx(VmcsFieldXX::HOST_CR3, hw::cr3());
        // Kernel GS holds the user-space GS of the calling thread, which may
        // differ between entries.
        self.host_msr_list
            .edit(3, IA32_KERNEL_GSBASE, hw::read_msr(IA32_KERNEL_GSBASE));

        if self.do_resume {
            log::trace!("re-entering guest");
        } else {
            vmcs::write_xx(VmcsFieldXX::GUEST_CR3, cr3);
            vmcs::write_xx(VmcsFieldXX::GUEST_RIP, entry);
        }

        let status = unsafe { vmx_enter(self.vmx_state.as_mut(), self.do_resume as u32) };
        if status != 0 {
            let error = vmcs::read32(VmcsField32::VM_INSTRUCTION_ERROR);
            log::warn!("vmlaunch failed: {:#x}", error);
            return Err(HvError::Internal);
        }

        self.do_resume = true;
        vmexit::handle_vmexit(&mut self.vmx_state.guest_state, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::hw::mock;

    fn setup_cpu(cpu: u32, pml4: u64) -> VmcsCpu {
        mock::reset();
        crate::kernel::mock::reset();

        let mut vcpu = VmcsCpu::new(cpu, &VmxInfo::read()).unwrap();
        vcpu.setup(pml4).unwrap();
        vcpu
    }

    #[test]
    fn ept_pointer_encoding() {
        assert_eq!(ept_pointer(0x0012_3400_0000), 0x0012_3400_005e);
        assert_eq!(ept_pointer(0) & 0xfff, 0x5e);
    }

    #[test]
    fn setup_programs_the_vmcs() {
        let vcpu = setup_cpu(0, 0xaaa000);

        assert_eq!(
            mock::vmcs_field(VmcsField64::EPT_POINTER as u64),
            0xaaa000 | 0x5e
        );
        assert_eq!(mock::vmcs_field(VmcsField16::VPID as u64), 1);
        assert_eq!(
            mock::vmcs_field(VmcsField64::LINK_POINTER as u64),
            u64::MAX
        );
        assert_eq!(
            mock::vmcs_field(VmcsFieldXX::HOST_RIP as u64),
            vmx_exit_entry as usize as u64
        );
        assert_eq!(
            mock::vmcs_field(VmcsFieldXX::HOST_RSP as u64),
            vcpu.vmx_state.as_ref() as *const VmxState as u64
        );
        assert_eq!(
            mock::vmcs_field(VmcsField32::EXCEPTION_BITMAP as u64),
            u32::MAX as u64
        );
        assert_eq!(mock::vmcs_field(VmcsField32::PAGEFAULT_ERRORCODE_MASK as u64), 0);

        // MSR lists: four host loads, one guest save/load.
        assert_eq!(mock::vmcs_field(VmcsField32::EXIT_MSR_LOAD_COUNT as u64), 4);
        assert_eq!(mock::vmcs_field(VmcsField32::EXIT_MSR_STORE_COUNT as u64), 1);
        assert_eq!(mock::vmcs_field(VmcsField32::ENTRY_MSR_LOAD_COUNT as u64), 1);
        assert_eq!(
            mock::vmcs_field(VmcsField64::MSR_BITMAPS_ADDRESS as u64),
            vcpu.msr_bitmap.physical_address()
        );

        // Guest starts in 64-bit paged protected mode.
        assert_eq!(
            mock::vmcs_field(VmcsFieldXX::GUEST_CR0 as u64),
            0x8000_0021
        );
        assert_eq!(mock::vmcs_field(VmcsFieldXX::GUEST_CR4 as u64), 0x2020);
        assert_eq!(
            mock::vmcs_field(VmcsField32::GUEST_CS_ACCESS_RIGHTS as u64),
            0x209b
        );
        assert_eq!(
            mock::vmcs_field(VmcsField32::GUEST_TR_ACCESS_RIGHTS as u64),
            0x8b
        );
        assert_eq!(
            mock::vmcs_field(VmcsField32::GUEST_SS_ACCESS_RIGHTS as u64),
            1 << 16
        );
        assert_eq!(
            mock::vmcs_field(VmcsFieldXX::GUEST_RFLAGS as u64),
            0x2
        );

        // Host selectors for this CPU.
        assert_eq!(
            mock::vmcs_field(VmcsField16::HOST_CS_SELECTOR as u64),
            kernel::CODE_64_SELECTOR as u64
        );
        assert_eq!(
            mock::vmcs_field(VmcsField16::HOST_TR_SELECTOR as u64),
            kernel::tss_selector(0) as u64
        );

        // The load guard released interrupts on the way out.
        mock::with(|hw| assert!(hw.interrupts_enabled));
    }

    #[test]
    fn setup_uses_the_cpu_index_for_vpid_and_tss() {
        let _vcpu = setup_cpu(2, 0xaaa000);

        assert_eq!(mock::vmcs_field(VmcsField16::VPID as u64), 3);
        assert_eq!(
            mock::vmcs_field(VmcsField16::HOST_TR_SELECTOR as u64),
            kernel::tss_selector(2) as u64
        );
    }

    #[test]
    fn setup_rejects_missing_secondary_controls() {
        mock::reset();
        crate::kernel::mock::reset();

        // EPT can no longer be set.
        mock::with(|hw| {
            let cap = hw.msrs[&IA32_VMX_PROCBASED_CTLS2] & !(1u64 << (32 + 1));
            hw.msrs.insert(IA32_VMX_PROCBASED_CTLS2, cap);
        });

        let mut vcpu = VmcsCpu::new(0, &VmxInfo::read()).unwrap();
        assert_eq!(vcpu.setup(0xaaa000), Err(HvError::NotSupported));

        // The guard still released interrupts.
        mock::with(|hw| assert!(hw.interrupts_enabled));
    }

    #[test]
    fn setup_validates_initial_guest_registers() {
        mock::reset();
        crate::kernel::mock::reset();

        // Require a CR0 bit the guest image does not set.
        mock::with(|hw| {
            hw.msrs.insert(IA32_VMX_CR0_FIXED0, 0x8000_0023);
        });

        let mut vcpu = VmcsCpu::new(0, &VmxInfo::read()).unwrap();
        assert_eq!(vcpu.setup(0xaaa000), Err(HvError::BadState));
    }
}
