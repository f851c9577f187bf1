//! RDMSR/WRMSR VM-exit handler.
//!
//! Only MSRs on the allow-list below are visible to the guest. Anything else raises `#GP(0)`
//! in the guest, without advancing RIP, exactly as an unimplemented MSR does on hardware.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            events,
            vcpu::Vcpu,
            vmcs::{GUEST_IA32_DEBUGCTL_FULL, GUEST_IA32_EFER_FULL, GUEST_IA32_PAT_FULL, GUEST_SYSENTER_CS, GUEST_SYSENTER_EIP, GUEST_SYSENTER_ESP},
            vmexit::ExitType,
        },
    },
    log::*,
    x86::{msr, vmx::vmcs::guest},
    x86_64::{registers::model_specific::EferFlags, VirtAddr},
};

/// Last MSR of the variable-range MTRR block the guest may read (16 pairs).
const IA32_MTRR_PHYSMASK15: u32 = 0x21F;

/// IA32_FEATURE_CONTROL as the guest sees it: locked, VMX disabled inside and outside SMX.
const FEATURE_CONTROL_LOCKED: u64 = 1;

/// IA32_DEBUGCTL bits the guest may set: LBR, BTF and 15:6.
const DEBUGCTL_WRITABLE: u64 = 0xFFC3;

/// Memory types a PAT entry may hold: UC, WC, WT, WP, WB, UC-.
const PAT_VALID_TYPES: [u64; 6] = [0, 1, 4, 5, 6, 7];

/// Represents the type of MSR access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

/// How an MSR is serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrClass {
    /// Read from, and optionally written to, the logical processor.
    Hardware { writable: bool },
    /// Lives in a guest-state field of the VMCS.
    Vmcs(u32),
    /// IA32_FEATURE_CONTROL, reported locked with VMX disabled.
    FeatureControl,
    /// Not visible to the guest.
    Denied,
}

/// Looks `msr` up on the allow-list.
pub fn classify(msr: u32) -> MsrClass {
    match msr {
        msr::IA32_TSC_AUX | msr::IA32_KERNEL_GSBASE | msr::IA32_STAR | msr::IA32_LSTAR | msr::IA32_CSTAR | msr::IA32_FMASK => {
            MsrClass::Hardware { writable: true }
        }

        // The memory-type resolver depends on the MTRRs, so the guest may look but not touch.
        msr::IA32_TIME_STAMP_COUNTER
        | msr::IA32_MTRRCAP
        | msr::IA32_MTRR_DEF_TYPE
        | msr::IA32_MTRR_PHYSBASE0..=IA32_MTRR_PHYSMASK15
        | msr::IA32_MTRR_FIX64K_00000
        | msr::IA32_MTRR_FIX16K_80000
        | msr::IA32_MTRR_FIX16K_A0000
        | msr::IA32_MTRR_FIX4K_C0000..=msr::IA32_MTRR_FIX4K_F8000 => MsrClass::Hardware { writable: false },

        msr::IA32_FS_BASE => MsrClass::Vmcs(guest::FS_BASE),
        msr::IA32_GS_BASE => MsrClass::Vmcs(guest::GS_BASE),
        msr::IA32_EFER => MsrClass::Vmcs(GUEST_IA32_EFER_FULL),
        msr::IA32_PAT => MsrClass::Vmcs(GUEST_IA32_PAT_FULL),
        msr::IA32_DEBUGCTL => MsrClass::Vmcs(GUEST_IA32_DEBUGCTL_FULL),
        msr::IA32_SYSENTER_CS => MsrClass::Vmcs(GUEST_SYSENTER_CS),
        msr::IA32_SYSENTER_ESP => MsrClass::Vmcs(GUEST_SYSENTER_ESP),
        msr::IA32_SYSENTER_EIP => MsrClass::Vmcs(GUEST_SYSENTER_EIP),

        msr::IA32_FEATURE_CONTROL => MsrClass::FeatureControl,

        _ => MsrClass::Denied,
    }
}

/// Whether `value` may be written to `msr` without faulting the host or failing the next VM entry.
pub fn accepts(msr: u32, value: u64) -> bool {
    match msr {
        msr::IA32_LSTAR
        | msr::IA32_CSTAR
        | msr::IA32_KERNEL_GSBASE
        | msr::IA32_FS_BASE
        | msr::IA32_GS_BASE
        | msr::IA32_SYSENTER_ESP
        | msr::IA32_SYSENTER_EIP => VirtAddr::try_new(value).is_ok(),
        msr::IA32_TSC_AUX | msr::IA32_FMASK => value >> 32 == 0,
        msr::IA32_EFER => {
            let allowed = EferFlags::SYSTEM_CALL_EXTENSIONS | EferFlags::LONG_MODE_ENABLE | EferFlags::LONG_MODE_ACTIVE | EferFlags::NO_EXECUTE_ENABLE;
            value & !allowed.bits() == 0
        }
        msr::IA32_PAT => (0..8).all(|entry| PAT_VALID_TYPES.contains(&(value >> (entry * 8) & 0xFF))),
        msr::IA32_DEBUGCTL => value & !DEBUGCTL_WRITABLE == 0,
        _ => true,
    }
}

/// Handles MSR access based on the provided access type.
///
/// The MSR index is in ECX; the value travels in EDX:EAX.
pub fn handle_msr_access(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters, access_type: MsrAccessType) -> Result<ExitType, HypervisorError> {
    let msr_id = registers.rcx as u32;
    let class = classify(msr_id);

    trace!("{:?} MSR {:#x} ({:?})", access_type, msr_id, class);

    if access_type == MsrAccessType::Write && !accepts(msr_id, registers.edx_eax()) {
        warn!("Refusing write of {:#x} to MSR {:#x}", registers.edx_eax(), msr_id);
        events::inject_general_protection(&mut *vcpu.guest, 0)?;
        return Ok(ExitType::Continue);
    }

    match (access_type, class) {
        (MsrAccessType::Read, MsrClass::Hardware { .. }) => registers.set_edx_eax(vcpu.platform.rdmsr(msr_id)),
        (MsrAccessType::Write, MsrClass::Hardware { writable: true }) => vcpu.platform.wrmsr(msr_id, registers.edx_eax()),
        (MsrAccessType::Read, MsrClass::Vmcs(field)) => registers.set_edx_eax(vcpu.guest.vmread(field)?),
        (MsrAccessType::Write, MsrClass::Vmcs(field)) => vcpu.guest.vmwrite(field, registers.edx_eax())?,
        (MsrAccessType::Read, MsrClass::FeatureControl) => registers.set_edx_eax(FEATURE_CONTROL_LOCKED),
        (MsrAccessType::Write, MsrClass::Hardware { writable: false } | MsrClass::FeatureControl) | (_, MsrClass::Denied) => {
            warn!("Refusing {:?} of MSR {:#x}", access_type, msr_id);
            events::inject_general_protection(&mut *vcpu.guest, 0)?;
            return Ok(ExitType::Continue);
        }
    }

    Ok(ExitType::IncrementRip)
}
