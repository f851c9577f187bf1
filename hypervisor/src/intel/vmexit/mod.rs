//! VM-exit handlers and the table that routes exit reasons to them.
//!
//! The table is a closed `match` over every [`VmxBasicExitReason`]: a new reason cannot be added
//! without deciding here whether it is handled or fatal.

use crate::{
    error::HypervisorError,
    intel::{capture::GuestRegisters, vcpu::Vcpu, vmerror::VmxBasicExitReason},
};

pub mod cpuid;
pub mod cr;
pub mod exception;
pub mod halt;
pub mod invd;
pub mod invlpg;
pub mod msr;
pub mod vmcall;

/// What the dispatcher does once a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// The instruction was emulated; advance RIP past it and resume.
    IncrementRip,
    /// Resume without touching RIP (an exception was injected, or RIP was set by the handler).
    Continue,
    /// Tear the VM down.
    ExitHypervisor,
}

/// Routes one exit to its handler. Reasons without a handler are fatal.
pub fn handle_exit(
    vcpu: &mut Vcpu<'_>,
    reason: VmxBasicExitReason,
    exit_reason: u32,
    registers: &mut GuestRegisters,
) -> Result<ExitType, HypervisorError> {
    match reason {
        VmxBasicExitReason::ControlRegisterAccesses => cr::handle_cr_reg_access(vcpu, registers),
        VmxBasicExitReason::Cpuid => cpuid::handle_cpuid(vcpu, registers),
        VmxBasicExitReason::Hlt => halt::handle_halt(vcpu),
        VmxBasicExitReason::Invlpg => invlpg::handle_invlpg(vcpu),
        VmxBasicExitReason::WbinvdOrWbnoinvd | VmxBasicExitReason::Invd => invd::handle_invd(vcpu, reason),
        VmxBasicExitReason::Rdmsr => msr::handle_msr_access(vcpu, registers, msr::MsrAccessType::Read),
        VmxBasicExitReason::Wrmsr => msr::handle_msr_access(vcpu, registers, msr::MsrAccessType::Write),
        VmxBasicExitReason::Vmcall => vmcall::handle_vmcall(vcpu, registers),

        // VMX is hidden from the guest, so its instructions are undefined.
        VmxBasicExitReason::Vmclear
        | VmxBasicExitReason::Vmlaunch
        | VmxBasicExitReason::Vmptrld
        | VmxBasicExitReason::Vmptrst
        | VmxBasicExitReason::Vmread
        | VmxBasicExitReason::Vmresume
        | VmxBasicExitReason::Vmwrite
        | VmxBasicExitReason::Vmxoff
        | VmxBasicExitReason::Vmxon
        | VmxBasicExitReason::Invept
        | VmxBasicExitReason::Invvpid
        | VmxBasicExitReason::Vmfunc => exception::handle_undefined_opcode_exception(vcpu),

        VmxBasicExitReason::ExceptionOrNmi
        | VmxBasicExitReason::ExternalInterrupt
        | VmxBasicExitReason::TripleFault
        | VmxBasicExitReason::InitSignal
        | VmxBasicExitReason::StartupIpi
        | VmxBasicExitReason::IoSystemManagementInterrupt
        | VmxBasicExitReason::OtherSmi
        | VmxBasicExitReason::InterruptWindow
        | VmxBasicExitReason::NmiWindow
        | VmxBasicExitReason::TaskSwitch
        | VmxBasicExitReason::Getsec
        | VmxBasicExitReason::Rdpmc
        | VmxBasicExitReason::Rdtsc
        | VmxBasicExitReason::Rsm
        | VmxBasicExitReason::MovDr
        | VmxBasicExitReason::IoInstruction
        | VmxBasicExitReason::VmEntryFailureInvalidGuestState
        | VmxBasicExitReason::VmEntryFailureMsrLoading
        | VmxBasicExitReason::Mwait
        | VmxBasicExitReason::MonitorTrapFlag
        | VmxBasicExitReason::Monitor
        | VmxBasicExitReason::Pause
        | VmxBasicExitReason::VmEntryFailureMachineCheckEvent
        | VmxBasicExitReason::TprBelowThreshold
        | VmxBasicExitReason::ApicAccess
        | VmxBasicExitReason::VirtualizedEoi
        | VmxBasicExitReason::AccessToGdtrOrIdtr
        | VmxBasicExitReason::AccessToLdtrOrTr
        | VmxBasicExitReason::EptViolation
        | VmxBasicExitReason::EptMisconfiguration
        | VmxBasicExitReason::Rdtscp
        | VmxBasicExitReason::VmxPreemptionTimerExpired
        | VmxBasicExitReason::Xsetbv
        | VmxBasicExitReason::ApicWrite
        | VmxBasicExitReason::Rdrand
        | VmxBasicExitReason::Invpcid
        | VmxBasicExitReason::Encls
        | VmxBasicExitReason::Rdseed
        | VmxBasicExitReason::PageModificationLogFull
        | VmxBasicExitReason::Xsaves
        | VmxBasicExitReason::Xrstors
        | VmxBasicExitReason::Pconfig
        | VmxBasicExitReason::SppRelatedEvent
        | VmxBasicExitReason::Umwait
        | VmxBasicExitReason::Tpause
        | VmxBasicExitReason::Loadiwkey
        | VmxBasicExitReason::Enclv
        | VmxBasicExitReason::Enqcmd
        | VmxBasicExitReason::Enqcmds
        | VmxBasicExitReason::BusLock
        | VmxBasicExitReason::InstructionTimeout
        | VmxBasicExitReason::Seamcall
        | VmxBasicExitReason::Tdcall => {
            log::error!("No handler for VM exit {:?} ({:#x})", reason, exit_reason);
            Err(HypervisorError::UnhandledVmExit(exit_reason))
        }
    }
}
