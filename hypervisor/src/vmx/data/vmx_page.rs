//! Scoped ownership of a single physical page used for VMX structures.

use crate::kernel::memory::{self, PAGE_SIZE};
use crate::vmx::support::VmxInfo;
use crate::{HvError, HvResult};

/// Layout shared by the VMXON region and the VMCS region: the hardware
/// revision identifier occupies the first 32-bit word.
#[repr(C)]
pub struct VmxRegion {
    pub revision_id: u32,
}

/// A 4 KiB page-aligned physical frame, filled on allocation and returned
/// to the physical memory manager on drop.
pub struct VmxPage {
    pa: u64,
}

impl VmxPage {
    /// From Volume 3, Appendix A.1: bits 44:32 report the number of bytes
    /// software should allocate for the VMXON region and any VMCS region; it
    /// is at most 4096. A page therefore always suffices.
    pub fn alloc(vmx_info: &VmxInfo, fill: u8) -> HvResult<Self> {
        if vmx_info.region_size as usize > PAGE_SIZE {
            return Err(HvError::NotSupported);
        }

        // Write-back memory for VMX structures must be supported.
        if !vmx_info.write_back {
            return Err(HvError::NotSupported);
        }

        let pa = memory::alloc_page().ok_or(HvError::NoMemory)?;
        debug_assert_eq!(pa % PAGE_SIZE as u64, 0);

        let page = Self { pa };
        unsafe { core::ptr::write_bytes(page.virtual_address::<u8>(), fill, PAGE_SIZE) };
        Ok(page)
    }

    pub fn physical_address(&self) -> u64 {
        debug_assert_ne!(self.pa, 0);
        self.pa
    }

    pub fn virtual_address<T>(&self) -> *mut T {
        debug_assert_ne!(self.pa, 0);
        memory::page_to_kvaddr(self.pa).cast()
    }

    /// Stamps the hardware revision identifier into the first word.
    pub fn set_revision_id(&mut self, revision_id: u32) {
        unsafe { (*self.virtual_address::<VmxRegion>()).revision_id = revision_id };
    }
}

impl Drop for VmxPage {
    fn drop(&mut self) {
        memory::free_page(self.pa);
    }
}
