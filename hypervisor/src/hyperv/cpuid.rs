//! Host hypervisor discovery through the hypervisor CPUID leaves.
//!
//! Reference: TLFS 2.4 "Hypervisor CPUID Leaves".

use {crate::intel::platform::Platform, bit_field::BitField, log::*};

pub const CPUID_VENDOR_AND_MAX_FUNCTIONS: u32 = 0x4000_0000;
pub const CPUID_INTERFACE: u32 = 0x4000_0001;
pub const CPUID_VERSION: u32 = 0x4000_0002;
pub const CPUID_FEATURES: u32 = 0x4000_0003;

/// "Hv#1"
const HV_INTERFACE_SIGNATURE: u32 = 0x3123_7648;
const MICROSOFT_HV_VENDOR: &[u8; 12] = b"Microsoft Hv";

/// What the host hypervisor reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHypervisor {
    pub max_leaf: u32,
    pub vendor: [u8; 12],
    pub interface: u32,
    pub build_number: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// Partition privilege mask (EBX:EAX of leaf 0x40000003).
    pub privileges: u64,
    pub features_edx: u32,
}

impl HostHypervisor {
    /// Reads leaves 0x40000000-0x40000003, or returns `None` when no hypervisor is present.
    pub fn query(platform: &dyn Platform) -> Option<Self> {
        // CPUID.1:ECX[31] is the hypervisor-present bit.
        if !platform.cpuid(0x1, 0).ecx.get_bit(31) {
            return None;
        }

        let leaf0 = platform.cpuid(CPUID_VENDOR_AND_MAX_FUNCTIONS, 0);
        let mut vendor = [0u8; 12];
        vendor[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&leaf0.ecx.to_le_bytes());
        vendor[8..12].copy_from_slice(&leaf0.edx.to_le_bytes());

        let mut host = Self {
            max_leaf: leaf0.eax,
            vendor,
            interface: 0,
            build_number: 0,
            major_version: 0,
            minor_version: 0,
            privileges: 0,
            features_edx: 0,
        };

        if host.max_leaf >= CPUID_INTERFACE {
            host.interface = platform.cpuid(CPUID_INTERFACE, 0).eax;
        }

        if host.max_leaf >= CPUID_VERSION {
            let version = platform.cpuid(CPUID_VERSION, 0);
            host.build_number = version.eax;
            host.major_version = version.ebx.get_bits(16..32) as u16;
            host.minor_version = version.ebx.get_bits(0..16) as u16;
        }

        if host.max_leaf >= CPUID_FEATURES {
            let features = platform.cpuid(CPUID_FEATURES, 0);
            host.privileges = (features.ebx as u64) << 32 | features.eax as u64;
            host.features_edx = features.edx;
        }

        debug!(
            "Host hypervisor: vendor={:?} interface={:#x} version={}.{} build={}",
            core::str::from_utf8(&host.vendor).unwrap_or("?"),
            host.interface,
            host.major_version,
            host.minor_version,
            host.build_number
        );

        Some(host)
    }

    /// True when the host implements the Microsoft hypercall interface.
    pub fn is_hyperv(&self) -> bool {
        &self.vendor == MICROSOFT_HV_VENDOR && self.interface == HV_INTERFACE_SIGNATURE
    }

    /// Hypercall input may be passed in XMM registers (leaf 0x40000003 EDX[4]).
    pub fn has_xmm_hypercall_input(&self) -> bool {
        self.features_edx.get_bit(4)
    }
}
