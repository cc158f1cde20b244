//! Intel VT-x (VMX) hosting for a single guest virtual machine.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_ret_no_self)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

use snafu::Snafu;

pub mod guest;
pub mod kernel;
pub mod vmx;

pub use guest::{ByteSink, Guest, GuestAddressSpace};
pub use vmx::VmxRoot;

/// Failure modes surfaced by the hypervisor core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum HvError {
    /// The processor lacks a required capability, or the guest performed an
    /// operation outside the emulated set.
    #[snafu(display("a required hardware capability is missing"))]
    NotSupported,

    /// Processor or context state does not permit the operation.
    #[snafu(display("processor state does not permit the operation"))]
    BadState,

    /// A page or array allocation failed.
    #[snafu(display("out of memory"))]
    NoMemory,

    /// A caller-supplied value is out of range or contradictory.
    #[snafu(display("invalid argument"))]
    InvalidArgs,

    /// A VMX instruction reported architectural failure.
    #[snafu(display("a VMX instruction failed"))]
    Internal,
}

pub type HvResult<T = ()> = Result<T, HvError>;
