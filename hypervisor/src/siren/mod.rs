//! The siren paravirtual hypercall surface.
//!
//! A guest issues `VMCALL` with `RCX[63:32]` set to the siren signature and the call code in
//! `RCX[15:0]`. Arguments travel in `RDX` and `R8`; the status comes back in `RAX`.
//!
//! | code | call                 | RDX            | R8                  |
//! |------|----------------------|----------------|---------------------|
//! | 0x00 | echo                 | value          |                     |
//! | 0x01 | turn off the VM      |                |                     |
//! | 0x10 | commit 4 KiB page    | guest PA       | backing PA          |
//! | 0x11 | commit 2 MiB page    | guest PA       | backing PA          |
//! | 0x12 | commit 1 GiB page    | guest PA       | backing PA          |
//! | 0x13 | uncommit 4 KiB page  | guest PA       |                     |
//! | 0x14 | uncommit 2 MiB page  | guest PA       |                     |
//! | 0x15 | uncommit 1 GiB page  | guest PA       |                     |
//! | 0x16 | flush EPT            |                |                     |
//! | 0x17 | query memory type    | physical base  | granularity (0/1/2) |
//!
//! Any other code is reserved and answered with [`SirenStatus::NotImplemented`].

use {
    crate::{
        error::{EptError, HypervisorError},
        intel::{capture::GuestRegisters, mtrr::Granularity, vcpu::Vcpu, vmexit::ExitType},
    },
    log::*,
};

pub mod control;
pub mod memory;

/// Siren hypercall codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SirenCode {
    Echo = 0x00,
    TurnOffVm = 0x01,
    EptCommit4Kb = 0x10,
    EptCommit2Mb = 0x11,
    EptCommit1Gb = 0x12,
    EptUncommit4Kb = 0x13,
    EptUncommit2Mb = 0x14,
    EptUncommit1Gb = 0x15,
    EptFlush = 0x16,
    QueryMemoryType = 0x17,
}

impl SirenCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0x00 => Self::Echo,
            0x01 => Self::TurnOffVm,
            0x10 => Self::EptCommit4Kb,
            0x11 => Self::EptCommit2Mb,
            0x12 => Self::EptCommit1Gb,
            0x13 => Self::EptUncommit4Kb,
            0x14 => Self::EptUncommit2Mb,
            0x15 => Self::EptUncommit1Gb,
            0x16 => Self::EptFlush,
            0x17 => Self::QueryMemoryType,
            _ => return None,
        })
    }
}

/// Status returned in `RAX`.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SirenStatus {
    Success = 0,
    /// Misaligned or out-of-range address, or an unknown granularity selector.
    InvalidParameter = 1,
    /// The MTRRs do not yield a single memory type for the range.
    MemoryTypeUnspecified = 2,
    /// The page pool backing the EPT is exhausted.
    InsufficientResources = 3,
    NotImplemented = 4,
    /// A mapping of another granularity covers the range.
    MappingConflict = 5,
}

impl From<EptError> for SirenStatus {
    fn from(error: EptError) -> Self {
        match error {
            EptError::Misaligned(_) | EptError::OutOfRange(_) => Self::InvalidParameter,
            EptError::OutOfResources => Self::InsufficientResources,
            EptError::MappingConflict(_) => Self::MappingConflict,
            EptError::InvalidMemoryType(_) => Self::MemoryTypeUnspecified,
        }
    }
}

/// Writes `status` to the guest's `RAX`.
pub fn report(registers: &mut GuestRegisters, status: SirenStatus) {
    registers.rax = status as u64;
}

/// Routes a siren call to its handler.
///
/// Only `TurnOffVm` stops the guest; every failure of a known call is reported in `RAX`.
pub fn handle_siren_call(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters, code: u16) -> Result<ExitType, HypervisorError> {
    let Some(call) = SirenCode::from_u16(code) else {
        return control::not_implemented(registers, code);
    };

    debug!("Siren call {:?} RDX={:#x} R8={:#x}", call, registers.rdx, registers.r8);

    match call {
        SirenCode::Echo => control::echo(registers),
        SirenCode::TurnOffVm => control::turn_off_vm(registers),
        SirenCode::EptCommit4Kb => memory::ept_commit(vcpu, registers, Granularity::Page4Kb),
        SirenCode::EptCommit2Mb => memory::ept_commit(vcpu, registers, Granularity::Page2Mb),
        SirenCode::EptCommit1Gb => memory::ept_commit(vcpu, registers, Granularity::Page1Gb),
        SirenCode::EptUncommit4Kb => memory::ept_uncommit(vcpu, registers, Granularity::Page4Kb),
        SirenCode::EptUncommit2Mb => memory::ept_uncommit(vcpu, registers, Granularity::Page2Mb),
        SirenCode::EptUncommit1Gb => memory::ept_uncommit(vcpu, registers, Granularity::Page1Gb),
        SirenCode::EptFlush => memory::ept_flush(vcpu, registers),
        SirenCode::QueryMemoryType => memory::query_memory_type(vcpu, registers),
    }
}
