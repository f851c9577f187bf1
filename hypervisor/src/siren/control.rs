//! Siren calls that do not touch guest memory.

use {
    super::{report, SirenStatus},
    crate::{error::HypervisorError, intel::capture::GuestRegisters, intel::vmexit::ExitType},
    log::*,
};

/// Returns `RDX` in `RAX`.
pub fn echo(registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    registers.rax = registers.rdx;
    Ok(ExitType::IncrementRip)
}

/// Asks the dispatcher to tear the VM down.
pub fn turn_off_vm(registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    info!("Guest requested VM shutdown");
    report(registers, SirenStatus::Success);
    Ok(ExitType::ExitHypervisor)
}

/// Reserved codes: reported, never fatal.
pub fn not_implemented(registers: &mut GuestRegisters, code: u16) -> Result<ExitType, HypervisorError> {
    debug!("Siren call {:#x} is not implemented", code);
    report(registers, SirenStatus::NotImplemented);
    Ok(ExitType::IncrementRip)
}
