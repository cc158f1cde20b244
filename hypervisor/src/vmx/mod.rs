//! Host-side VMX lifecycle: per-CPU VMXON ownership.

use crate::kernel::processor;
use crate::{HvError, HvResult};
use alloc::vec::Vec;
use x86::msr::{
    IA32_FEATURE_CONTROL, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1, IA32_VMX_CR4_FIXED0,
    IA32_VMX_CR4_FIXED1,
};

pub mod data;
pub mod hw;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmexit;
pub mod vmlaunch;

use self::data::vmx_page::VmxPage;
use self::support::{VmxInfo, X86_CR4_VMXE};

const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const FEATURE_CONTROL_VMXON: u64 = 1 << 2;

/// VMXON state owned by one logical CPU.
struct VmxonCpu {
    cpu: u32,
    page: VmxPage,
    is_on: bool,
}

impl VmxonCpu {
    fn new(cpu: u32, vmx_info: &VmxInfo) -> HvResult<Self> {
        let mut page = VmxPage::alloc(vmx_info, 0)?;
        page.set_revision_id(vmx_info.revision_id);

        Ok(Self {
            cpu,
            page,
            is_on: false,
        })
    }

    /// Moves this CPU into VMX root operation. Runs pinned to the CPU.
    fn enable(&mut self) -> HvResult {
        support::check_capabilities()?;

        // Enable VMXON through the feature control MSR, if required. A
        // locked MSR without the VMXON bit means firmware has disabled VMX.
        let mut feature_control = hw::read_msr(IA32_FEATURE_CONTROL);
        if feature_control & FEATURE_CONTROL_LOCK == 0
            || feature_control & FEATURE_CONTROL_VMXON == 0
        {
            if feature_control & FEATURE_CONTROL_LOCK != 0 {
                log::warn!("VMX is disabled by firmware");
                return Err(HvError::NotSupported);
            }
            feature_control |= FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMXON;
            hw::write_msr(IA32_FEATURE_CONTROL, feature_control);
        }

        // Check the control registers are in a VMX-friendly state.
        let cr0 = hw::cr0();
        if support::cr_is_invalid(cr0, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1) {
            return Err(HvError::BadState);
        }
        let cr4 = hw::cr4() | X86_CR4_VMXE;
        if support::cr_is_invalid(cr4, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1) {
            return Err(HvError::BadState);
        }

        // Enable VMX using the VMXE bit.
        hw::set_cr4(cr4);

        hw::vmxon(self.page.physical_address())?;
        self.is_on = true;
        Ok(())
    }

    /// Leaves VMX root operation. Runs pinned to the CPU that enabled it.
    fn disable(&mut self) -> HvResult {
        if self.is_on {
            hw::vmxoff()?;
            self.is_on = false;
        }

        hw::set_cr4(hw::cr4() & !X86_CR4_VMXE);
        Ok(())
    }
}

/// Holds the selected CPUs in VMX root operation for its lifetime.
pub struct VmxRoot {
    per_cpu: Vec<VmxonCpu>,
}

impl VmxRoot {
    /// Probes capabilities and enables VMX root operation on every CPU in
    /// `cpus`.
    pub fn create(cpus: &[u32]) -> HvResult<Self> {
        if !hw::has_vmx() {
            log::warn!("Processor does not support VMX");
            return Err(HvError::NotSupported);
        }

        if cpus.is_empty() {
            return Err(HvError::InvalidArgs);
        }
        for &cpu in cpus {
            if cpu >= processor::max_cpus() {
                return Err(HvError::InvalidArgs);
            }
        }

        let vmx_info = VmxInfo::read();
        let mut per_cpu = Vec::new();
        for &cpu in cpus {
            per_cpu.push(VmxonCpu::new(cpu, &vmx_info)?);
        }

        // Construct first so a partial enable is unwound by drop.
        let mut root = Self { per_cpu };
        for record in &mut root.per_cpu {
            let cpu = record.cpu;
            processor::percpu_exec(cpu, || record.enable())?;
        }

        log::info!("VMX root operation enabled on {} cpu(s)", cpus.len());
        Ok(root)
    }
}

impl Drop for VmxRoot {
    fn drop(&mut self) {
        for record in &mut self.per_cpu {
            let cpu = record.cpu;
            if let Err(err) = processor::percpu_exec(cpu, || record.disable()) {
                log::error!("Failed to leave VMX operation on cpu {}: {:?}", cpu, err);
            }
        }
    }
}
