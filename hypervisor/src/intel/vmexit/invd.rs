//! Manages WBINVD and INVD VM exits.

use crate::{
    config::CachePolicy,
    error::HypervisorError,
    intel::{vcpu::Vcpu, vmerror::VmxBasicExitReason, vmexit::ExitType},
};

/// Emulates a cache write-back-and-invalidate.
///
/// INVD is serviced as WBINVD: discarding dirty lines the host may still need is never safe.
/// Under a host hypervisor that keeps caches coherent the instruction is only skipped.
pub fn handle_invd(vcpu: &mut Vcpu<'_>, reason: VmxBasicExitReason) -> Result<ExitType, HypervisorError> {
    match vcpu.config.cache {
        CachePolicy::Emulate => log::trace!("{:?} emulated as a no-op", reason),
        CachePolicy::WriteBackInvalidate => {
            log::trace!("{:?}: executing WBINVD", reason);
            vcpu.platform.wbinvd();
        }
    }

    Ok(ExitType::IncrementRip)
}
