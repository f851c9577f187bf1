//! Exception injection through the VM-entry interruption-information field.

use {
    crate::{
        error::HypervisorError,
        intel::{
            vmcs::GuestState,
            vmerror::{ExceptionInterrupt, InterruptionType},
        },
    },
    bitfield::bitfield,
    x86::vmx::vmcs,
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);
    impl Debug;

    pub u8, vector, set_vector: 7, 0;
    pub u8, interruption_type, set_interruption_type: 10, 8;
    pub deliver_error_code, set_deliver_error_code: 11;
    // Reserved: 30:12
    pub valid, set_valid: 31;
}

impl EventInjection {
    /// A valid hardware exception with the given vector.
    pub fn hardware_exception(vector: ExceptionInterrupt, deliver_error_code: bool) -> Self {
        let mut event = EventInjection(0);

        event.set_vector(vector as u8);
        event.set_interruption_type(InterruptionType::HardwareException as u8);
        event.set_deliver_error_code(deliver_error_code);
        event.set_valid(true);

        event
    }

    pub fn general_protection() -> Self {
        Self::hardware_exception(ExceptionInterrupt::GeneralProtectionFault, true)
    }

    pub fn undefined_opcode() -> Self {
        Self::hardware_exception(ExceptionInterrupt::InvalidOpcode, false)
    }
}

/// Queues `#GP(error_code)` for delivery on the next VM entry.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.6 EVENT INJECTION
pub fn inject_general_protection(guest: &mut (impl GuestState + ?Sized), error_code: u32) -> Result<(), HypervisorError> {
    let event = EventInjection::general_protection();
    log::warn!("Injecting #GP({:#x}): info={:#x}", error_code, event.0);

    guest.vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code as u64)?;
    guest.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64)
}

/// Queues `#UD` for delivery on the next VM entry.
pub fn inject_undefined_opcode(guest: &mut (impl GuestState + ?Sized)) -> Result<(), HypervisorError> {
    let event = EventInjection::undefined_opcode();
    log::warn!("Injecting #UD: info={:#x}", event.0);

    guest.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64)
}
