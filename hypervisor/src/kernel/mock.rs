//! In-memory double of the kernel primitives for unit tests.
//!
//! Physical pages are host heap allocations with a 4 KiB alignment and the
//! physical address equal to the virtual one; `percpu_exec` runs the closure
//! inline after switching the recorded current CPU.

use crate::kernel::memory::PAGE_SIZE;
use crate::HvResult;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::BTreeSet;

pub struct MockKernel {
    pub current_cpu: u32,
    pub max_cpus: u32,
    pub pages: BTreeSet<u64>,
    pub pinned_cpus: Vec<u32>,
    pub tss_reloads: u32,
    pub idt_reloads: u32,
    pub fail_page_alloc: bool,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self {
            current_cpu: 0,
            max_cpus: 4,
            pages: BTreeSet::new(),
            pinned_cpus: Vec::new(),
            tss_reloads: 0,
            idt_reloads: 0,
            fail_page_alloc: false,
        }
    }
}

thread_local! {
    static KERNEL: RefCell<MockKernel> = RefCell::new(MockKernel::default());
}

pub fn reset() {
    KERNEL.with(|k| *k.borrow_mut() = MockKernel::default());
}

pub fn with<R>(f: impl FnOnce(&mut MockKernel) -> R) -> R {
    KERNEL.with(|k| f(&mut k.borrow_mut()))
}

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

pub fn alloc_page() -> Option<u64> {
    with(|k| {
        if k.fail_page_alloc {
            return None;
        }
        let pa = unsafe { alloc_zeroed(page_layout()) } as u64;
        k.pages.insert(pa);
        Some(pa)
    })
}

pub fn free_page(pa: u64) {
    with(|k| {
        assert!(k.pages.remove(&pa), "freeing a page that was never allocated");
        unsafe { dealloc(pa as *mut u8, page_layout()) };
    })
}

pub fn page_to_kvaddr(pa: u64) -> *mut u8 {
    pa as *mut u8
}

pub fn current_cpu() -> u32 {
    with(|k| k.current_cpu)
}

pub fn max_cpus() -> u32 {
    with(|k| k.max_cpus)
}

pub fn percpu_exec<F>(cpu: u32, f: F) -> HvResult
where
    F: FnOnce() -> HvResult + Send,
{
    let previous = with(|k| {
        k.pinned_cpus.push(cpu);
        core::mem::replace(&mut k.current_cpu, cpu)
    });
    let result = f();
    with(|k| k.current_cpu = previous);
    result
}

pub fn tss_address(cpu: u32) -> u64 {
    0x0000_7000_0000_1000 + (cpu as u64) * 0x80
}

pub fn gdt_base() -> u64 {
    0x0000_7000_0000_0100
}

pub fn readonly_idt_base() -> u64 {
    0x0000_7000_0000_0800
}

pub fn reload_tss(_selector: u16) {
    with(|k| k.tss_reloads += 1);
}

pub fn reload_idt() {
    with(|k| k.idt_reloads += 1);
}
