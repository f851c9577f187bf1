//! Control Register access VM-exit handler.
//!
//! The guest owns CR0 and CR4 except for the bits in the guest/host masks; MOV to those
//! registers exits here and is checked the way the processor would check it before the value is
//! committed. VMXE stays set in the real CR4 and is hidden through the CR4 read shadow; a guest
//! that tries to set it gets `#GP(0)`. CR8 is kept in the [`Vcpu`], not in the VMCS.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            events,
            mtrr::physical_address_width,
            vcpu::Vcpu,
            vmcs::GUEST_IA32_EFER_FULL,
            vmerror::{ControlRegAccessExitQualification, CrAccessType},
            vmexit::ExitType,
        },
    },
    bit_field::BitField,
    log::*,
    x86::{
        msr,
        vmx::vmcs::{control, guest},
    },
    x86_64::registers::control::{Cr0Flags, Cr4Flags},
};

/// IA32_EFER.LMA
const EFER_LONG_MODE_ACTIVE: usize = 10;

/// CR3 bit 63: do not invalidate the PCID's translations (only with CR4.PCIDE).
const CR3_NO_FLUSH: usize = 63;

/// GPR index of RSP in the exit qualification.
const GPR_RSP: u64 = 4;

/// Handles the `ControlRegisterAccess` VM-exit.
pub fn handle_cr_reg_access(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    let qualification = vcpu.guest.exit_qualification()?;
    let cr = ControlRegAccessExitQualification::from(qualification);
    let gpr = cr.gpr() as u64;

    trace!("CR access: {:?} CR{} GPR={} RIP={:#x}", cr.access_type(), cr.control_register(), gpr, registers.rip);

    match (cr.access_type(), cr.control_register()) {
        (CrAccessType::MovToCr, 0) => handle_mov_to_cr0(vcpu, registers.gpr(gpr)?),
        (CrAccessType::MovToCr, 3) => handle_mov_to_cr3(vcpu, registers.gpr(gpr)?),
        (CrAccessType::MovToCr, 4) => handle_mov_to_cr4(vcpu, registers.gpr(gpr)?),
        (CrAccessType::MovToCr, 8) => handle_mov_to_cr8(vcpu, registers.gpr(gpr)?),
        (CrAccessType::MovFromCr, 0) => read_into_gpr(vcpu, registers, gpr, control::CR0_READ_SHADOW),
        (CrAccessType::MovFromCr, 3) => read_into_gpr(vcpu, registers, gpr, guest::CR3),
        (CrAccessType::MovFromCr, 4) => read_into_gpr(vcpu, registers, gpr, control::CR4_READ_SHADOW),
        (CrAccessType::MovFromCr, 8) => {
            let priority = vcpu.task_priority();
            write_gpr(vcpu, registers, gpr, priority)
        }
        (CrAccessType::Clts, _) => {
            let cr0 = Cr0Flags::from_bits_retain(vcpu.guest.vmread(control::CR0_READ_SHADOW)?) - Cr0Flags::TASK_SWITCHED;
            commit_cr0(vcpu, cr0)
        }
        (CrAccessType::Lmsw, _) => handle_lmsw(vcpu, cr.lmsw_source_data() as u64),
        _ => {
            warn!("Unhandled control register access {:#x}", qualification);
            Err(HypervisorError::UnknownControlRegisterAccess(qualification))
        }
    }
}

fn in_long_mode(vcpu: &Vcpu<'_>) -> Result<bool, HypervisorError> {
    Ok(vcpu.guest.vmread(GUEST_IA32_EFER_FULL)?.get_bit(EFER_LONG_MODE_ACTIVE))
}

fn inject_gp(vcpu: &mut Vcpu<'_>, reason: &str) -> Result<ExitType, HypervisorError> {
    debug!("Control register write refused: {}", reason);
    events::inject_general_protection(&mut *vcpu.guest, 0)?;
    Ok(ExitType::Continue)
}

/// Handle MOV to CR0
fn handle_mov_to_cr0(vcpu: &mut Vcpu<'_>, value: u64) -> Result<ExitType, HypervisorError> {
    trace!("MOV to CR0: {:#x}", value);

    // #GP(0) if setting any reserved bits in CR0[63:32]
    if value.get_bits(32..64) != 0 {
        return inject_gp(vcpu, "CR0[63:32] set");
    }

    let mut cr0 = Cr0Flags::from_bits_truncate(value);
    // CR0.ET is always 1
    cr0.insert(Cr0Flags::EXTENSION_TYPE);

    if cr0.contains(Cr0Flags::PAGING) && !cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
        return inject_gp(vcpu, "CR0.PG without CR0.PE");
    }

    if cr0.contains(Cr0Flags::NOT_WRITE_THROUGH) && !cr0.contains(Cr0Flags::CACHE_DISABLE) {
        return inject_gp(vcpu, "CR0.NW without CR0.CD");
    }

    if !cr0.contains(Cr0Flags::PAGING) && in_long_mode(vcpu)? {
        return inject_gp(vcpu, "clearing CR0.PG in long mode");
    }

    commit_cr0(vcpu, cr0)
}

/// Stores the guest's view in the read shadow and the VMX-adjusted value in the guest CR0.
fn commit_cr0(vcpu: &mut Vcpu<'_>, cr0: Cr0Flags) -> Result<ExitType, HypervisorError> {
    vcpu.guest.vmwrite(control::CR0_READ_SHADOW, cr0.bits())?;

    let fixed0 = vcpu.platform.rdmsr(msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = vcpu.platform.rdmsr(msr::IA32_VMX_CR0_FIXED1);
    let actual = (cr0.bits() | fixed0) & fixed1;
    vcpu.guest.vmwrite(guest::CR0, actual)?;

    trace!("CR0 shadow={:#x} actual={:#x}", cr0.bits(), actual);
    Ok(ExitType::IncrementRip)
}

/// Handle MOV to CR3
fn handle_mov_to_cr3(vcpu: &mut Vcpu<'_>, value: u64) -> Result<ExitType, HypervisorError> {
    trace!("MOV to CR3: {:#x}", value);

    let mut cr3 = value;
    cr3.set_bit(CR3_NO_FLUSH, false);

    let width = physical_address_width(vcpu.platform);
    if cr3 >> width != 0 {
        return inject_gp(vcpu, "CR3 beyond the physical address width");
    }

    vcpu.guest.vmwrite(guest::CR3, cr3)?;

    // A MOV to CR3 drops the non-global translations of the current context.
    if !value.get_bit(CR3_NO_FLUSH) {
        vcpu.platform.invvpid_single_context(vcpu.config.vpid);
    }

    Ok(ExitType::IncrementRip)
}

/// Handle MOV to CR4
fn handle_mov_to_cr4(vcpu: &mut Vcpu<'_>, value: u64) -> Result<ExitType, HypervisorError> {
    trace!("MOV to CR4: {:#x}", value);

    let Some(cr4) = Cr4Flags::from_bits(value) else {
        return inject_gp(vcpu, "reserved CR4 bits");
    };

    // CPUID hides VMX.
    if cr4.contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) {
        return inject_gp(vcpu, "CR4.VMXE set");
    }

    if !cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) && in_long_mode(vcpu)? {
        return inject_gp(vcpu, "clearing CR4.PAE in long mode");
    }

    vcpu.guest.vmwrite(control::CR4_READ_SHADOW, cr4.bits())?;

    let fixed0 = vcpu.platform.rdmsr(msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = vcpu.platform.rdmsr(msr::IA32_VMX_CR4_FIXED1);
    let actual = ((cr4 | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS).bits() | fixed0) & fixed1;
    vcpu.guest.vmwrite(guest::CR4, actual)?;

    trace!("CR4 shadow={:#x} actual={:#x}", cr4.bits(), actual);
    Ok(ExitType::IncrementRip)
}

/// Handle MOV to CR8 (task priority)
fn handle_mov_to_cr8(vcpu: &mut Vcpu<'_>, value: u64) -> Result<ExitType, HypervisorError> {
    trace!("MOV to CR8: {:#x}", value);

    // #GP(0) if bits 63:4 are not all zero
    if value & !0xF != 0 {
        return inject_gp(vcpu, "CR8[63:4] set");
    }

    vcpu.set_task_priority(value);
    Ok(ExitType::IncrementRip)
}

/// Handle LMSW: loads CR0[3:0] but never clears PE.
fn handle_lmsw(vcpu: &mut Vcpu<'_>, source: u64) -> Result<ExitType, HypervisorError> {
    trace!("LMSW {:#x}", source);

    let current = vcpu.guest.vmread(control::CR0_READ_SHADOW)?;
    let pe = current & Cr0Flags::PROTECTED_MODE_ENABLE.bits();
    let cr0 = (current & !0xF) | (source & 0xF) | pe;

    commit_cr0(vcpu, Cr0Flags::from_bits_retain(cr0))
}

/// MOV from a control register into a GPR.
fn read_into_gpr(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters, gpr: u64, field: u32) -> Result<ExitType, HypervisorError> {
    let value = vcpu.guest.vmread(field)?;
    trace!("MOV from control register field {:#x}: {:#x} -> GPR{}", field, value, gpr);

    write_gpr(vcpu, registers, gpr, value)
}

fn write_gpr(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters, gpr: u64, value: u64) -> Result<ExitType, HypervisorError> {
    registers.set_gpr(gpr, value)?;
    if gpr == GPR_RSP {
        vcpu.guest.vmwrite(guest::RSP, value)?;
    }

    Ok(ExitType::IncrementRip)
}
