//! Siren calls that manage the guest-physical address space.

use {
    super::{report, SirenStatus},
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            mtrr::{self, Granularity, MemoryType},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::*,
};

/// Maps the page at `RDX` to the backing page at `R8`, cached as the MTRRs say the backing
/// range is cached.
///
/// When the MTRRs give no single type the call fails with
/// [`SirenStatus::MemoryTypeUnspecified`] and nothing is mapped.
pub fn ept_commit(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters, granularity: Granularity) -> Result<ExitType, HypervisorError> {
    let base = registers.rdx;
    let backing = registers.r8;

    if !granularity.is_aligned(base) || !granularity.is_aligned(backing) {
        debug!("Commit of {:#x} -> {:#x} is not {:?} aligned", base, backing, granularity);
        report(registers, SirenStatus::InvalidParameter);
        return Ok(ExitType::IncrementRip);
    }

    let memory_type = mtrr::resolve(vcpu.platform, backing, granularity);
    if memory_type == MemoryType::Unspecified {
        warn!("No single memory type for {:#x} ({:?}); commit refused", backing, granularity);
        report(registers, SirenStatus::MemoryTypeUnspecified);
        return Ok(ExitType::IncrementRip);
    }

    let status = match vcpu.ept.commit(base, granularity, backing, memory_type) {
        Ok(()) => SirenStatus::Success,
        Err(error) => {
            warn!("EPT commit of {:#x} failed: {}", base, error);
            SirenStatus::from(error)
        }
    };

    report(registers, status);
    Ok(ExitType::IncrementRip)
}

/// Removes the mapping of the page at `RDX`. Uncommitting a page that is not committed succeeds.
pub fn ept_uncommit(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters, granularity: Granularity) -> Result<ExitType, HypervisorError> {
    let status = match vcpu.ept.uncommit(registers.rdx, granularity) {
        Ok(()) => SirenStatus::Success,
        Err(error) => {
            debug!("EPT uncommit of {:#x} failed: {}", registers.rdx, error);
            SirenStatus::from(error)
        }
    };

    report(registers, status);
    Ok(ExitType::IncrementRip)
}

/// Invalidates cached translations for the whole guest-physical address space.
///
/// Under Hyper-V the host keeps its own shadow of the EPT, which is flushed too.
pub fn ept_flush(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    vcpu.ept.flush(vcpu.platform);

    if vcpu.config.relay_ept_flush && vcpu.host_is_hyperv() {
        let eptp = vcpu.ept.eptp();
        let result = vcpu.relay.flush_guest_physical_address_space(eptp);

        if !result.status().is_success() {
            warn!("Host failed to flush address space {:#x}: {:?}", eptp, result.status());
        }
    }

    report(registers, SirenStatus::Success);
    Ok(ExitType::IncrementRip)
}

/// Resolves the memory type of the range at `RDX` with the granularity selected by `R8`.
///
/// The type code comes back in `RDX`; `0xFF` when no single type applies.
pub fn query_memory_type(vcpu: &mut Vcpu<'_>, registers: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    let base = registers.rdx;

    let Some(granularity) = Granularity::from_selector(registers.r8).filter(|g| g.is_aligned(base)) else {
        report(registers, SirenStatus::InvalidParameter);
        return Ok(ExitType::IncrementRip);
    };

    let memory_type = mtrr::resolve(vcpu.platform, base, granularity);
    trace!("Memory type of {:#x} ({:?}): {:?}", base, granularity, memory_type);

    registers.rdx = memory_type as u64;
    report(
        registers,
        match memory_type {
            MemoryType::Unspecified => SirenStatus::MemoryTypeUnspecified,
            _ => SirenStatus::Success,
        },
    );

    Ok(ExitType::IncrementRip)
}
