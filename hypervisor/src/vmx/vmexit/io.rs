//! IO-exit handling: a write-only UART forwarded to the byte sink.

use super::{next_rip, ExitInfo, IoInfo};
use crate::guest::ByteSink;
use crate::vmx::data::guest::GuestState;
use crate::HvResult;

/// Data port of the emulated UART.
pub const UART_IO_PORT: u16 = 0x3f8;

pub fn handle(exit_info: &ExitInfo, guest_state: &mut GuestState, sink: &dyn ByteSink) -> HvResult {
    next_rip(exit_info);

    let io_info = IoInfo::new(exit_info.exit_qualification);

    // Inputs, string and repeated operations, and every other port are
    // accepted and dropped.
    if io_info.input || io_info.string || io_info.repeat || io_info.port != UART_IO_PORT {
        return Ok(());
    }

    // Best effort: the sink's actual count does not influence the guest.
    let data = guest_state.rax.to_le_bytes();
    let _ = sink.write(&data[..io_info.bytes as usize]);
    Ok(())
}
