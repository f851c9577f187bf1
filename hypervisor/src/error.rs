//! Error types shared across the hypervisor core.

use {crate::hyperv::hypercall::HvStatus, thiserror::Error};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("unhandled VM exit reason {0:#x}")]
    UnhandledVmExit(u32),

    #[error("unknown control register access {0:#x}")]
    UnknownControlRegisterAccess(u64),

    #[error("invalid general-purpose register index {0}")]
    InvalidGprIndex(u64),

    #[error("VMREAD/VMWRITE failed for field {0:#x}")]
    VmcsFieldAccessFailed(u32),

    #[error("VM-exit instruction length {0} is out of range")]
    InvalidInstructionLength(u64),

    #[error("EPT store operation failed: {0}")]
    Ept(#[from] EptError),

    #[error("host hypercall failed: {0:?}")]
    Hypercall(HvStatus),

    #[error("logical processor {0} does not exist")]
    InvalidProcessor(u32),

    #[error("the virtual CPU is terminating")]
    Terminating,
}

/// Failures reported by an EPT store.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptError {
    #[error("address {0:#x} is not aligned to the page granularity")]
    Misaligned(u64),

    #[error("address {0:#x} is beyond the supported guest-physical range")]
    OutOfRange(u64),

    #[error("the page pool backing the EPT is exhausted")]
    OutOfResources,

    #[error("a mapping of a different granularity already covers {0:#x}")]
    MappingConflict(u64),

    #[error("memory type {0:#x} cannot be encoded in an EPT entry")]
    InvalidMemoryType(u8),
}
