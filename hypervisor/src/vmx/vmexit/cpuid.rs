//! CPUID emulation.
//!
//! Only the vendor leaf is emulated, and it reports a maximum basic leaf of
//! 0, so the guest cannot do feature discovery. Known limitation of the
//! current guest model; other leaves fail the entry.

use super::{next_rip, ExitInfo};
use crate::vmx::data::guest::GuestState;
use crate::vmx::hw;
use crate::{HvError, HvResult};

const BASIC_LEAF: u64 = 0;

pub fn handle(exit_info: &ExitInfo, guest_state: &mut GuestState) -> HvResult {
    match guest_state.rax {
        BASIC_LEAF => {
            next_rip(exit_info);

            let leaf = hw::cpuid(BASIC_LEAF as u32);
            guest_state.rbx = leaf.ebx as u64;
            guest_state.rcx = leaf.ecx as u64;
            guest_state.rdx = leaf.edx as u64;

            // Maximum input value for basic CPUID information.
            guest_state.rax = 0;
            Ok(())
        }
        _ => Err(HvError::NotSupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::hw::mock;
    use crate::vmx::vmcs::VmcsFieldXX;
    use crate::vmx::vmexit::tests::{stage_exit, RecordingSink};
    use crate::vmx::vmexit::{handle_vmexit, ExitReason};

    #[test]
    fn vendor_leaf_is_emulated() {
        stage_exit(ExitReason::Cpuid as u32, 0, 0x1000, 2);

        let sink = RecordingSink::new();
        let mut guest_state = GuestState::default();
        guest_state.rax = 0;
        guest_state.rbx = 0xdead;

        assert_eq!(handle_vmexit(&mut guest_state, sink.as_ref()), Ok(()));

        // "GenuineIntel" in ebx/edx/ecx order, maximum basic leaf of 0.
        assert_eq!(guest_state.rax, 0);
        assert_eq!(guest_state.rbx, 0x756e_6547);
        assert_eq!(guest_state.rdx, 0x4965_6e69);
        assert_eq!(guest_state.rcx, 0x6c65_746e);

        // RIP moved past the instruction.
        assert_eq!(mock::vmcs_field(VmcsFieldXX::GUEST_RIP as u64), 0x1002);
    }

    #[test]
    fn other_leaves_are_rejected() {
        stage_exit(ExitReason::Cpuid as u32, 0, 0x1000, 2);

        let sink = RecordingSink::new();
        let mut guest_state = GuestState::default();
        guest_state.rax = 1;

        assert_eq!(
            handle_vmexit(&mut guest_state, sink.as_ref()),
            Err(HvError::NotSupported)
        );

        // RIP untouched on the failure path.
        assert_eq!(mock::vmcs_field(VmcsFieldXX::GUEST_RIP as u64), 0x1000);
    }
}
