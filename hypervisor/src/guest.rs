//! Guest creation and execution facade.

use crate::kernel::memory::PAGE_SIZE;
use crate::kernel::processor;
use crate::vmx::support::VmxInfo;
use crate::vmx::vcpu::VmcsCpu;
use crate::{HvError, HvResult};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Guest-physical to host-physical translation, built by the embedding
/// kernel. The PML4 is installed as the EPT root.
pub trait GuestAddressSpace: Send + Sync {
    fn pml4_address(&self) -> u64;
    fn size(&self) -> u64;
}

/// Destination for the guest's serial output. Best effort: the returned
/// count is how many bytes were accepted.
pub trait ByteSink: Send + Sync {
    fn write(&self, bytes: &[u8]) -> usize;
}

/// A single guest virtual machine: per-CPU VMCS state plus the shared
/// address space and serial sink.
pub struct Guest {
    per_cpu: Vec<VmcsCpu>,
    cpus: Vec<u32>,
    gpas: Arc<dyn GuestAddressSpace>,
    sink: Arc<dyn ByteSink>,
    cr3: Option<u64>,
    entry: Option<u64>,
}

impl Guest {
    /// Allocates and programs a VMCS on every CPU in `cpus`. The host must
    /// already be in VMX root operation on those CPUs.
    pub fn create(
        cpus: &[u32],
        gpas: Arc<dyn GuestAddressSpace>,
        sink: Arc<dyn ByteSink>,
    ) -> HvResult<Self> {
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
            per_cpu.push(VmcsCpu::new(cpu, &vmx_info)?);
        }

        let mut guest = Self {
            per_cpu,
            cpus: cpus.to_vec(),
            gpas,
            sink,
            cr3: None,
            entry: None,
        };

        let pml4_address = guest.gpas.pml4_address();
        for (index, record) in guest.per_cpu.iter_mut().enumerate() {
            let cpu = guest.cpus[index];
            processor::percpu_exec(cpu, || record.setup(pml4_address))?;
        }

        Ok(guest)
    }

    /// Sets the guest page-table root loaded on first entry.
    pub fn set_cr3(&mut self, cr3: u64) -> HvResult {
        if cr3 >= self.gpas.size() - PAGE_SIZE as u64 {
            return Err(HvError::InvalidArgs);
        }

        self.cr3 = Some(cr3);
        Ok(())
    }

    /// Sets the guest entry point loaded on first entry.
    pub fn set_entry(&mut self, entry: u64) -> HvResult {
        if entry >= self.gpas.size() {
            return Err(HvError::InvalidArgs);
        }

        self.entry = Some(entry);
        Ok(())
    }

    /// Runs the guest on `cpu` until the next serviced VM exit. `Ok` means
    /// the guest can be entered again.
    pub fn enter(&mut self, cpu: u32) -> HvResult {
        let cr3 = self.cr3.ok_or(HvError::BadState)?;
        let entry = self.entry.ok_or(HvError::BadState)?;

        let index = self
            .cpus
            .iter()
            .position(|&c| c == cpu)
            .ok_or(HvError::InvalidArgs)?;

        let record = &mut self.per_cpu[index];
        let sink = self.sink.clone();
        processor::percpu_exec(cpu, || record.enter(cr3, entry, sink.as_ref()))
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        for (index, record) in self.per_cpu.iter_mut().enumerate() {
            let cpu = self.cpus[index];
            if let Err(err) = processor::percpu_exec(cpu, || record.clear()) {
                log::error!("Failed to clear the VMCS on cpu {}: {:?}", cpu, err);
            }
        }
    }
}
