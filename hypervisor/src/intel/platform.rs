//! Capabilities of the logical processor the core executes on.

use x86::cpuid::CpuIdResult;

/// Model-specific register, CPU identification and TLB control on the current logical processor.
///
/// The hardware implementation lives in [`crate::intel::support::Hardware`]; tests substitute
/// a fake processor.
pub trait Platform {
    fn rdmsr(&self, msr: u32) -> u64;

    fn wrmsr(&self, msr: u32, value: u64);

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult;

    /// Writes back and invalidates all caches of this logical processor.
    fn wbinvd(&self);

    /// INVEPT single-context: drops guest-physical and combined mappings derived from `eptp`.
    fn invept_single_context(&self, eptp: u64);

    /// INVVPID individual-address: drops the linear mapping of `address` tagged with `vpid`.
    fn invvpid_individual_address(&self, vpid: u16, address: u64);

    /// INVVPID single-context, retaining global translations.
    fn invvpid_single_context(&self, vpid: u16);

    /// Initial APIC id of this logical processor.
    fn apic_id(&self) -> u32 {
        self.cpuid(0x1, 0).ebx >> 24
    }
}
