//! INVLPG VM-exit handler.

use crate::{
    error::HypervisorError,
    intel::{vcpu::Vcpu, vmexit::ExitType},
};

/// Invalidates the guest's translation of the linear address in the exit qualification.
pub fn handle_invlpg(vcpu: &mut Vcpu<'_>) -> Result<ExitType, HypervisorError> {
    let address = vcpu.guest.exit_qualification()?;
    log::trace!("INVLPG {:#x} (VPID {})", address, vcpu.config.vpid);

    vcpu.platform.invvpid_individual_address(vcpu.config.vpid, address);

    Ok(ExitType::IncrementRip)
}
