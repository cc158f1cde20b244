//! VM-exit decoding and dispatch.

use super::data::guest::GuestState;
use super::hw;
use super::vmcs::{self, VmcsField32, VmcsField64, VmcsFieldXX};
use crate::guest::ByteSink;
use crate::{HvError, HvResult};

pub mod cpuid;
pub mod io;

/// Basic exit reasons, Volume 3, Appendix C.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Vmcall = 18,
    ControlRegisterAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureGuestState = 33,
    EptViolation = 48,
    EptMisconfiguration = 49,
}

impl ExitReason {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            7 => Self::InterruptWindow,
            10 => Self::Cpuid,
            12 => Self::Hlt,
            18 => Self::Vmcall,
            28 => Self::ControlRegisterAccess,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            33 => Self::EntryFailureGuestState,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            _ => return None,
        })
    }
}

/// Snapshot of the exit information fields, taken at the top of the
/// dispatcher while the VMCS is loaded.
#[derive(Clone, Copy, Debug)]
pub struct ExitInfo {
    pub exit_reason: u32,
    pub exit_qualification: u64,
    pub interruption_information: u32,
    pub interruption_error_code: u32,
    pub instruction_length: u32,
    pub instruction_information: u32,
    pub guest_physical_address: u64,
    pub guest_linear_address: u64,
    pub guest_interruptibility_state: u32,
    pub guest_rip: u64,
}

impl ExitInfo {
    pub fn read() -> Self {
        let info = Self {
            exit_reason: vmcs::read32(VmcsField32::EXIT_REASON),
            exit_qualification: vmcs::read_xx(VmcsFieldXX::EXIT_QUALIFICATION),
            interruption_information: vmcs::read32(VmcsField32::INTERRUPTION_INFORMATION),
            interruption_error_code: vmcs::read32(VmcsField32::INTERRUPTION_ERROR_CODE),
            instruction_length: vmcs::read32(VmcsField32::INSTRUCTION_LENGTH),
            instruction_information: vmcs::read32(VmcsField32::INSTRUCTION_INFORMATION),
            guest_physical_address: vmcs::read64(VmcsField64::GUEST_PHYSICAL_ADDRESS),
            guest_linear_address: vmcs::read_xx(VmcsFieldXX::GUEST_LINEAR_ADDRESS),
            guest_interruptibility_state: vmcs::read32(VmcsField32::GUEST_INTERRUPTIBILITY_STATE),
            guest_rip: vmcs::read_xx(VmcsFieldXX::GUEST_RIP),
        };

        log::trace!("exit reason: {:#x}", info.exit_reason);
        log::trace!("exit qualification: {:#x}", info.exit_qualification);
        log::trace!("interruption information: {:#x}", info.interruption_information);
        log::trace!("interruption error code: {:#x}", info.interruption_error_code);
        log::trace!("instruction length: {:#x}", info.instruction_length);
        log::trace!("instruction information: {:#x}", info.instruction_information);
        log::trace!("guest physical address: {:#x}", info.guest_physical_address);
        log::trace!("guest linear address: {:#x}", info.guest_linear_address);
        log::trace!(
            "guest interruptibility state: {:#x}",
            info.guest_interruptibility_state
        );
        log::trace!("guest rip: {:#x}", info.guest_rip);

        info
    }

    pub fn reason(&self) -> Option<ExitReason> {
        ExitReason::from_u32(self.exit_reason)
    }
}

/// Decoded exit qualification of an IO instruction, Volume 3, Table 27-5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoInfo {
    pub bytes: u8,
    pub input: bool,
    pub string: bool,
    pub repeat: bool,
    pub port: u16,
}

impl IoInfo {
    pub fn new(qualification: u64) -> Self {
        Self {
            bytes: (qualification & 0x7) as u8 + 1,
            input: qualification & (1 << 3) != 0,
            string: qualification & (1 << 4) != 0,
            repeat: qualification & (1 << 5) != 0,
            port: (qualification >> 16) as u16,
        }
    }
}

/// Moves the guest past the instruction that exited.
pub(crate) fn next_rip(exit_info: &ExitInfo) {
    vmcs::write_xx(
        VmcsFieldXX::GUEST_RIP,
        exit_info.guest_rip + exit_info.instruction_length as u64,
    );
}

/// Services one VM exit. Runs with the VMCS loaded and interrupts disabled;
/// returning `Ok` means the caller may re-enter the guest.
pub(crate) fn handle_vmexit(guest_state: &mut GuestState, sink: &dyn ByteSink) -> HvResult {
    let exit_info = ExitInfo::read();

    match exit_info.reason() {
        Some(ExitReason::ExternalInterrupt) => {
            log::trace!("handling external interrupt");

            // Take the pending interrupt through the host IDT, then shut
            // the window again before resuming.
            debug_assert!(!hw::interrupts_enabled());
            hw::enable_interrupts();
            hw::disable_interrupts();
            Ok(())
        }
        Some(ExitReason::Cpuid) => {
            log::trace!("handling CPUID instruction");
            cpuid::handle(&exit_info, guest_state)
        }
        Some(ExitReason::IoInstruction) => {
            log::trace!("handling IO instruction");
            io::handle(&exit_info, guest_state, sink)
        }
        Some(ExitReason::Wrmsr) => {
            log::trace!("handling WRMSR instruction");
            Err(HvError::NotSupported)
        }
        _ => {
            log::warn!("unhandled VM exit {:#x}", exit_info.exit_reason);
            Err(HvError::NotSupported)
        }
    }
}
