//! The per-virtual-CPU exit dispatcher.
//!
//! A [`Vcpu`] bundles the capabilities an exit handler needs (the current VMCS, the logical
//! processor, the EPT store and the host hypercall relay) with the partition policy, and drives
//! the exit state machine:
//!
//! ```text
//! AwaitingExit --exit--> Dispatching --continue--> Resumed --entry--> AwaitingExit
//!                             |
//!                             +--stop / unmapped / error--> Terminating (absorbing)
//! ```

use {
    crate::{
        config::Config,
        error::HypervisorError,
        hyperv::{cpuid::HostHypervisor, relay::HypercallRelay, relay::HypercallTransport},
        intel::{
            capture::GuestRegisters,
            ept::EptStore,
            platform::Platform,
            vmcs::GuestState,
            vmerror::VmxBasicExitReason,
            vmexit::{self, ExitType},
        },
    },
    log::*,
    x86::vmx::vmcs::guest,
};

/// Number of slots in the per-reason exit counters (basic exit reasons 0-76).
const EXIT_REASON_SLOTS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    AwaitingExit,
    Dispatching,
    Resumed,
    Terminating,
}

pub struct Vcpu<'a> {
    pub guest: &'a mut dyn GuestState,
    pub platform: &'a dyn Platform,
    pub ept: &'a mut dyn EptStore,
    pub relay: HypercallRelay<&'a dyn HypercallTransport>,
    pub host: Option<HostHypervisor>,
    pub config: Config,
    state: VcpuState,
    exit_counts: [u64; EXIT_REASON_SLOTS],
    /// Guest CR8.
    task_priority: u64,
}

impl<'a> Vcpu<'a> {
    pub fn new(
        guest: &'a mut dyn GuestState,
        platform: &'a dyn Platform,
        ept: &'a mut dyn EptStore,
        transport: &'a dyn HypercallTransport,
        config: Config,
    ) -> Self {
        let host = HostHypervisor::query(platform);
        if host.is_none() {
            warn!("No host hypervisor detected; hypercalls will not be relayed");
        }

        Self {
            guest,
            platform,
            ept,
            relay: HypercallRelay::new(transport, config.nested_hypercalls),
            host,
            config,
            state: VcpuState::AwaitingExit,
            exit_counts: [0; EXIT_REASON_SLOTS],
            task_priority: 0,
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Marks the VM entry that follows a successful dispatch.
    pub fn entered(&mut self) {
        if self.state == VcpuState::Resumed {
            self.state = VcpuState::AwaitingExit;
        }
    }

    /// How many exits with `reason` this virtual CPU has dispatched.
    pub fn exit_count(&self, reason: VmxBasicExitReason) -> u64 {
        self.exit_counts.get(reason as usize).copied().unwrap_or(0)
    }

    /// The guest's task priority (CR8).
    pub fn task_priority(&self) -> u64 {
        self.task_priority
    }

    pub(crate) fn set_task_priority(&mut self, priority: u64) {
        self.task_priority = priority & 0xF;
    }

    /// Whether the host hypervisor is Hyper-V and hypercalls can be relayed to it.
    pub fn host_is_hyperv(&self) -> bool {
        self.host.as_ref().is_some_and(HostHypervisor::is_hyperv)
    }

    /// Handles one VM exit.
    ///
    /// Returns `true` to resume the guest, `false` to tear the VM down. Once a virtual CPU
    /// is terminating, every later call returns `false` without touching guest state.
    pub fn dispatch(&mut self, registers: &mut GuestRegisters) -> bool {
        if self.state == VcpuState::Terminating {
            return false;
        }

        self.state = VcpuState::Dispatching;

        match self.handle_exit(registers) {
            Ok(ExitType::ExitHypervisor) => {
                info!("Guest requested teardown at RIP {:#x}", registers.rip);
                self.state = VcpuState::Terminating;
                false
            }
            Ok(_) => {
                self.state = VcpuState::Resumed;
                true
            }
            Err(error) => {
                error!("Tearing down the VM: {}", error);
                self.state = VcpuState::Terminating;
                false
            }
        }
    }

    fn handle_exit(&mut self, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
        let exit_reason = self.guest.exit_reason()?;
        registers.rip = self.guest.vmread(guest::RIP)?;
        registers.rsp = self.guest.vmread(guest::RSP)?;
        registers.rflags = self.guest.vmread(guest::RFLAGS)?;

        let Some(reason) = VmxBasicExitReason::from_exit_reason(exit_reason as u64) else {
            return Err(HypervisorError::UnhandledVmExit(exit_reason));
        };

        if let Some(count) = self.exit_counts.get_mut(reason as usize) {
            *count += 1;
        }

        trace!("VM exit {:?} at RIP {:#x}", reason, registers.rip);

        let exit_type = vmexit::handle_exit(self, reason, exit_reason, registers)?;

        if exit_type == ExitType::IncrementRip {
            self.advance_rip(registers)?;
        }

        Ok(exit_type)
    }

    /// Moves the guest past the instruction that caused the exit.
    pub fn advance_rip(&mut self, registers: &mut GuestRegisters) -> Result<(), HypervisorError> {
        let length = self.guest.instruction_length()?;
        registers.rip = registers.rip.wrapping_add(length);
        self.guest.vmwrite(guest::RIP, registers.rip)
    }
}
