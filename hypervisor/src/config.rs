//! Compile-time constants and the per-partition runtime policy.

/// Ceiling, in pause instructions, for one round of spin backoff.
pub const MAX_BACKOFF_SPINS: u32 = 1 << 10;

/// Upper bound on variable-range MTRR pairs (`IA32_MTRRCAP.VCNT` is 8 bits wide).
pub const MAX_VARIABLE_MTRRS: usize = 255;

/// Physical address width assumed when CPUID leaf 0x80000008 is not implemented.
pub const DEFAULT_PHYSICAL_ADDRESS_WIDTH: u8 = 36;

/// Upper 32 bits of RCX that mark a VMCALL as a siren hypercall ("SIRE").
pub const SIREN_SIGNATURE: u32 = 0x5349_5245;

/// Number of 8-byte words passed in registers by the fast (XMM) hypercall convention:
/// RDX, R8 and XMM0-XMM5.
pub const FAST_BLOCK_WORDS: usize = 14;

/// Virtual-processor identifier tagging the guest's TLB entries.
pub const DEFAULT_VPID: u16 = 1;

/// What a trapped HLT does to the virtual CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltPolicy {
    /// Skip the instruction; the guest spins back into its idle loop.
    Trap,
    /// Skip the instruction and park the virtual CPU in the HLT activity state until the next event.
    Idle,
}

/// How WBINVD/INVD are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// The host hypervisor keeps caches coherent; the instruction is skipped.
    Emulate,
    /// Execute a real WBINVD on the current logical processor.
    WriteBackInvalidate,
}

/// Runtime policy for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub halt: HaltPolicy,
    pub cache: CachePolicy,
    /// Also ask the host to drop its shadow of the guest-physical address space on `ept_flush`.
    pub relay_ept_flush: bool,
    /// Set the nested bit on hypercalls issued to the host.
    pub nested_hypercalls: bool,
    pub vpid: u16,
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        let nested = cfg!(feature = "nested");

        Self {
            halt: HaltPolicy::Trap,
            cache: if nested { CachePolicy::Emulate } else { CachePolicy::WriteBackInvalidate },
            relay_ept_flush: nested,
            nested_hypercalls: false,
            vpid: DEFAULT_VPID,
            log_level: log::LevelFilter::Info,
        }
    }
}
