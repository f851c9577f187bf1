//! HLT VM-exit handler.

use {
    crate::{
        config::HaltPolicy,
        error::HypervisorError,
        intel::{
            vcpu::Vcpu,
            vmcs::ACTIVITY_STATE_HLT,
            vmexit::ExitType,
        },
    },
    x86::vmx::vmcs::guest,
};

/// Emulates HLT according to the partition's [`HaltPolicy`].
///
/// With [`HaltPolicy::Idle`] the virtual CPU is put in the HLT activity state and the processor
/// only re-enters the guest's instruction stream once an event is injected or delivered.
pub fn handle_halt(vcpu: &mut Vcpu<'_>) -> Result<ExitType, HypervisorError> {
    match vcpu.config.halt {
        HaltPolicy::Trap => log::trace!("HLT trapped"),
        HaltPolicy::Idle => {
            log::trace!("HLT: parking the virtual CPU");
            vcpu.guest.vmwrite(guest::ACTIVITY_STATE, ACTIVITY_STATE_HLT)?;
        }
    }

    Ok(ExitType::IncrementRip)
}
