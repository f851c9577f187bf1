//! Access to the current virtual CPU's VMCS.
//!
//! The exit handlers never issue VMREAD/VMWRITE directly; they go through [`GuestState`] so the
//! dispatcher can run against a fake VMCS in tests.

use {
    crate::error::HypervisorError,
    x86::vmx::vmcs,
};

/// VM-exit instruction length.
pub const VMEXIT_INSTRUCTION_LEN: u32 = 0x440C;
/// Guest IA32_DEBUGCTL.
pub const GUEST_IA32_DEBUGCTL_FULL: u32 = 0x2802;
/// Guest IA32_PAT.
pub const GUEST_IA32_PAT_FULL: u32 = 0x2804;
/// Guest IA32_EFER.
pub const GUEST_IA32_EFER_FULL: u32 = 0x2806;
/// Guest IA32_SYSENTER_CS.
pub const GUEST_SYSENTER_CS: u32 = 0x482A;
/// Guest IA32_SYSENTER_ESP.
pub const GUEST_SYSENTER_ESP: u32 = 0x6824;
/// Guest IA32_SYSENTER_EIP.
pub const GUEST_SYSENTER_EIP: u32 = 0x6826;
/// EPT pointer.
pub const EPT_POINTER_FULL: u32 = 0x201A;

/// Guest activity state "HLT".
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.2 Guest Non-Register State
pub const ACTIVITY_STATE_HLT: u64 = 1;

/// Instructions that cause VM exits are never longer than 15 bytes.
pub const MAX_INSTRUCTION_LENGTH: u64 = 15;

/// The opaque guest-state capability: read and write fields of the current VMCS.
pub trait GuestState {
    fn vmread(&self, field: u32) -> Result<u64, HypervisorError>;

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), HypervisorError>;

    /// Full 32-bit exit-reason field.
    fn exit_reason(&self) -> Result<u32, HypervisorError> {
        Ok(self.vmread(vmcs::ro::EXIT_REASON)? as u32)
    }

    fn exit_qualification(&self) -> Result<u64, HypervisorError> {
        self.vmread(vmcs::ro::EXIT_QUALIFICATION)
    }

    /// Length of the instruction that caused the exit, validated against the architectural maximum.
    fn instruction_length(&self) -> Result<u64, HypervisorError> {
        let length = self.vmread(VMEXIT_INSTRUCTION_LEN)?;
        match length {
            1..=MAX_INSTRUCTION_LENGTH => Ok(length),
            _ => Err(HypervisorError::InvalidInstructionLength(length)),
        }
    }
}

impl<G: GuestState + ?Sized> GuestState for &mut G {
    fn vmread(&self, field: u32) -> Result<u64, HypervisorError> {
        (**self).vmread(field)
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), HypervisorError> {
        (**self).vmwrite(field, value)
    }
}

/// The VMCS that is current on this logical processor.
#[cfg(target_arch = "x86_64")]
pub struct CurrentVmcs;

#[cfg(target_arch = "x86_64")]
impl GuestState for CurrentVmcs {
    fn vmread(&self, field: u32) -> Result<u64, HypervisorError> {
        unsafe { x86::current::vmx::vmread(field) }.map_err(|_| HypervisorError::VmcsFieldAccessFailed(field))
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), HypervisorError> {
        unsafe { x86::current::vmx::vmwrite(field, value) }.map_err(|_| HypervisorError::VmcsFieldAccessFailed(field))
    }
}
