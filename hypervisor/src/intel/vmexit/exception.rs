//! Exceptions raised on behalf of the guest.

use crate::{
    error::HypervisorError,
    intel::{events, vcpu::Vcpu, vmexit::ExitType},
};

/// Handles undefined opcode (`#UD`) exceptions for VMX instructions.
pub fn handle_undefined_opcode_exception(vcpu: &mut Vcpu<'_>) -> Result<ExitType, HypervisorError> {
    events::inject_undefined_opcode(&mut *vcpu.guest)?;
    Ok(ExitType::Continue)
}
