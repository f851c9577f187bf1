//! CPUID VM-exit handler.
//!
//! Leaves are passed through from the processor with the virtualization features this
//! hypervisor does not offer to its guest masked out.

use {
    crate::{
        error::HypervisorError,
        intel::{capture::GuestRegisters, vcpu::Vcpu, vmexit::ExitType},
    },
    bit_field::BitField,
    log::*,
    x86::cpuid::CpuIdResult,
};

/// CPUID.01H:ECX.VMX[bit 5]
const FEATURE_INFORMATION_VMX: usize = 5;

/// Hyper-V implementation recommendations.
const HV_CPUID_ENLIGHTENMENT_INFO: u32 = 0x4000_0004;
/// Enlightened VMCS recommended (EAX bit 14).
const HV_ENLIGHTENED_VMCS_RECOMMENDED: usize = 14;
/// Hyper-V nested virtualization features.
const HV_CPUID_NESTED_FEATURES: u32 = 0x4000_000A;

/// Returns the (masked) processor leaves to the guest.
pub fn handle_cpuid(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    let leaf = registers.rax as u32;
    let sub_leaf = registers.rcx as u32;

    let mut result = vcpu.platform.cpuid(leaf, sub_leaf);
    mask_leaf(leaf, &mut result);

    trace!("CPUID {:#x}:{:#x} -> {:x?}", leaf, sub_leaf, result);

    registers.rax = result.eax as u64;
    registers.rbx = result.ebx as u64;
    registers.rcx = result.ecx as u64;
    registers.rdx = result.edx as u64;

    Ok(ExitType::IncrementRip)
}

/// Hides nested virtualization from the guest.
pub fn mask_leaf(leaf: u32, result: &mut CpuIdResult) {
    match leaf {
        0x1 => {
            result.ecx.set_bit(FEATURE_INFORMATION_VMX, false);
        }
        HV_CPUID_ENLIGHTENMENT_INFO => {
            result.eax.set_bit(HV_ENLIGHTENED_VMCS_RECOMMENDED, false);
        }
        HV_CPUID_NESTED_FEATURES => {
            *result = CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: 0 };
        }
        _ => {}
    }
}
