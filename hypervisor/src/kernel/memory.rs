//! Physical page management through the kernel's physical memory manager.

pub const PAGE_SIZE: usize = 0x1000;

/// Allocates one physical page and returns its physical address.
#[cfg(not(test))]
pub fn alloc_page() -> Option<u64> {
    use super::include::pmm_alloc_page;

    let mut pa = 0u64;
    let page = unsafe { pmm_alloc_page(0, &mut pa) };
    if page.is_null() {
        log::warn!("Failed to allocate a physical page");
        return None;
    }

    Some(pa)
}

/// Returns a previously allocated page to the physical memory manager.
#[cfg(not(test))]
pub fn free_page(pa: u64) {
    use super::include::{paddr_to_vm_page, pmm_free_page};

    let page = unsafe { paddr_to_vm_page(pa) };
    if !page.is_null() {
        unsafe { pmm_free_page(page) };
    }
}

/// Kernel-virtual address of a physical page in the direct map.
#[cfg(not(test))]
pub fn page_to_kvaddr(pa: u64) -> *mut u8 {
    unsafe { super::include::paddr_to_kvaddr(pa) }
}

#[cfg(test)]
pub use super::mock::{alloc_page, free_page, page_to_kvaddr};
