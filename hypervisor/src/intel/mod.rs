//! Intel VT-x specifics: guest state, EPT, MTRRs and the VM-exit handlers.

pub mod capture;
pub mod ept;
pub mod events;
pub mod mtrr;
pub mod platform;
#[cfg(target_arch = "x86_64")]
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
