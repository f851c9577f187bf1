//! Memory-type resolution from the variable-range MTRRs.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11 MEMORY TYPE RANGE REGISTERS (MTRRS)
//! and 12.11.4.1 MTRR Precedences.

use {
    crate::{
        config::{DEFAULT_PHYSICAL_ADDRESS_WIDTH, MAX_VARIABLE_MTRRS},
        error::HypervisorError,
        intel::platform::Platform,
        processor::{Affinity, run_on_all_processors},
        sync::OnceInit,
    },
    bit_field::BitField,
    bitfield::bitfield,
    x86::{
        bits64::paging::{BASE_PAGE_SIZE, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE},
        msr,
    },
};

/// Memory types as encoded in MTRRs, PAT entries and EPT leaf entries.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 12-8. Memory Types That Can Be Encoded in MTRRs
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
    /// No single architectural type applies (reserved encoding or overlapping ranges).
    Unspecified = 0xFF,
}

impl MemoryType {
    /// Decodes an MTRR type field; reserved encodings map to [`MemoryType::Unspecified`].
    pub fn from_raw(value: u64) -> Self {
        match value {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            _ => Self::Unspecified,
        }
    }
}

/// Size of the region whose memory type is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Page4Kb,
    Page2Mb,
    Page1Gb,
}

impl Granularity {
    pub const fn size(self) -> u64 {
        match self {
            Self::Page4Kb => BASE_PAGE_SIZE as u64,
            Self::Page2Mb => LARGE_PAGE_SIZE as u64,
            Self::Page1Gb => HUGE_PAGE_SIZE as u64,
        }
    }

    pub const fn is_aligned(self, address: u64) -> bool {
        address & (self.size() - 1) == 0
    }

    /// Decodes the granularity selector used by the memory-type query hypercall.
    pub fn from_selector(selector: u64) -> Option<Self> {
        match selector {
            0 => Some(Self::Page4Kb),
            1 => Some(Self::Page2Mb),
            2 => Some(Self::Page1Gb),
            _ => None,
        }
    }
}

bitfield! {
    /// IA32_MTRRCAP
    #[derive(Clone, Copy)]
    pub struct MtrrCapability(u64);
    impl Debug;

    pub u8, variable_count, _: 7, 0;
    pub fixed_supported, _: 8;
    pub write_combining_supported, _: 10;
    pub smrr_supported, _: 11;
}

bitfield! {
    /// IA32_MTRR_DEF_TYPE
    #[derive(Clone, Copy)]
    pub struct MtrrDefaultType(u64);
    impl Debug;

    pub u8, default_type, _: 7, 0;
    pub fixed_enabled, _: 10;
    pub enabled, _: 11;
}

bitfield! {
    /// IA32_MTRR_PHYSBASEn
    #[derive(Clone, Copy)]
    pub struct MtrrPhysBase(u64);
    impl Debug;

    pub u8, memory_type, _: 7, 0;
}

bitfield! {
    /// IA32_MTRR_PHYSMASKn
    #[derive(Clone, Copy)]
    pub struct MtrrPhysMask(u64);
    impl Debug;

    pub valid, _: 11;
}

/// The fixed-range MTRRs cover the first megabyte of physical memory.
const FIXED_RANGE_LIMIT: u64 = 0x10_0000;

/// CPUID.01H:EDX.MTRR[bit 12]
const CPUID_MTRR_SUPPORTED: usize = 12;

const CPUID_EXTENDED_MAX_LEAF: u32 = 0x8000_0000;
const CPUID_ADDRESS_SIZES: u32 = 0x8000_0008;

static PHYSICAL_ADDRESS_WIDTH: OnceInit<u8> = OnceInit::new();

/// MAXPHYADDR, read from CPUID 0x80000008 the first time it is needed and reused afterwards.
pub fn physical_address_width(platform: &dyn Platform) -> u8 {
    *PHYSICAL_ADDRESS_WIDTH.get_or_init(|| {
        let width = read_physical_address_width(platform);
        log::debug!("Physical address width: {} bits", width);
        width
    })
}

/// Reads MAXPHYADDR without caching it.
pub fn read_physical_address_width(platform: &dyn Platform) -> u8 {
    if platform.cpuid(CPUID_EXTENDED_MAX_LEAF, 0).eax < CPUID_ADDRESS_SIZES {
        return DEFAULT_PHYSICAL_ADDRESS_WIDTH;
    }

    match platform.cpuid(CPUID_ADDRESS_SIZES, 0).eax.get_bits(0..8) as u8 {
        0 => DEFAULT_PHYSICAL_ADDRESS_WIDTH,
        width => width.min(52),
    }
}

/// Mask of the physical-address bits 51:12 that exist on this processor.
fn address_mask(width: u8) -> u64 {
    ((1u64 << width) - 1) & !(BASE_PAGE_SIZE as u64 - 1)
}

pub fn mtrr_supported(platform: &dyn Platform) -> bool {
    platform.cpuid(0x1, 0).edx.get_bit(CPUID_MTRR_SUPPORTED)
}

/// Resolves the memory type of the naturally aligned region `[base, base + granularity)`.
///
/// The variable-range MTRRs are read fresh on every call. A region that is partially covered by a
/// range, or that falls under the fixed-range MTRRs, yields [`MemoryType::Unspecified`].
pub fn resolve(platform: &dyn Platform, base: u64, granularity: Granularity) -> MemoryType {
    if !mtrr_supported(platform) {
        return MemoryType::Uncacheable;
    }

    let default_type = MtrrDefaultType(platform.rdmsr(msr::IA32_MTRR_DEF_TYPE));
    if !default_type.enabled() {
        return MemoryType::Uncacheable;
    }

    let capability = MtrrCapability(platform.rdmsr(msr::IA32_MTRRCAP));
    if capability.fixed_supported() && default_type.fixed_enabled() && base < FIXED_RANGE_LIMIT {
        log::trace!("{:#x} is covered by the fixed-range MTRRs", base);
        return MemoryType::Unspecified;
    }

    let mask = address_mask(physical_address_width(platform));
    let base = base & !(granularity.size() - 1);
    let size_mask = granularity.size() - 1;
    let count = (capability.variable_count() as usize).min(MAX_VARIABLE_MTRRS) as u32;

    let mut candidate: Option<MemoryType> = None;

    for index in 0..count {
        let phys_mask = MtrrPhysMask(platform.rdmsr(msr::IA32_MTRR_PHYSMASK0 + index * 2));
        if !phys_mask.valid() {
            continue;
        }

        let phys_base = MtrrPhysBase(platform.rdmsr(msr::IA32_MTRR_PHYSBASE0 + index * 2));
        let range_base = phys_base.0 & mask;
        let range_mask = phys_mask.0 & mask;

        // Only the mask bits above the region size decide whether the region and the range meet.
        let high_mask = range_mask & !size_mask;
        if base & high_mask != range_base & high_mask {
            continue;
        }

        // Mask bits inside the region mean the range covers only part of it.
        if range_mask & size_mask != 0 {
            log::debug!("MTRR {} partially covers {:#x} (mask {:#x})", index, base, range_mask);
            return MemoryType::Unspecified;
        }

        match MemoryType::from_raw(phys_base.memory_type() as u64) {
            MemoryType::Unspecified => continue,
            MemoryType::Uncacheable => return MemoryType::Uncacheable,
            MemoryType::WriteBack if matches!(candidate, Some(MemoryType::WriteThrough | MemoryType::WriteBack)) => {}
            memory_type => candidate = Some(memory_type),
        }
    }

    candidate.unwrap_or_else(|| MemoryType::from_raw(default_type.default_type() as u64))
}

/// Snapshot of the MTRR configuration of one logical processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtrrState {
    pub default_type: u64,
    pub count: usize,
    pub ranges: [(u64, u64); MAX_VARIABLE_MTRRS],
}

impl MtrrState {
    pub fn capture(platform: &dyn Platform) -> Self {
        let capability = MtrrCapability(platform.rdmsr(msr::IA32_MTRRCAP));
        let count = (capability.variable_count() as usize).min(MAX_VARIABLE_MTRRS);

        let mut ranges = [(0, 0); MAX_VARIABLE_MTRRS];
        for (index, range) in ranges.iter_mut().enumerate().take(count) {
            let index = index as u32 * 2;
            *range = (platform.rdmsr(msr::IA32_MTRR_PHYSBASE0 + index), platform.rdmsr(msr::IA32_MTRR_PHYSMASK0 + index));
        }

        Self { default_type: platform.rdmsr(msr::IA32_MTRR_DEF_TYPE), count, ranges }
    }
}

/// Captures the MTRRs on every logical processor and reports whether they all agree.
///
/// Resolution reads the MTRRs of whichever processor handles the exit, so commits are only
/// consistent across the partition when this holds.
pub fn mtrrs_are_uniform<A: Affinity>(affinity: &A, platform: &dyn Platform) -> Result<bool, HypervisorError> {
    let mut reference: Option<MtrrState> = None;
    let mut uniform = true;

    run_on_all_processors(affinity, |processor| {
        let state = MtrrState::capture(platform);
        if reference.is_none() {
            reference = Some(state);
        } else if reference.as_ref() != Some(&state) {
            log::warn!("MTRRs of logical processor {} differ from processor 0", processor);
            uniform = false;
        }
        Ok(())
    })?;

    Ok(uniform)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        core::cell::RefCell,
        proptest::prelude::*,
        std::{collections::HashMap, vec::Vec},
        x86::cpuid::CpuIdResult,
    };

    const MTRR_ENABLED: u64 = 1 << 11;
    const FIXED_ENABLED: u64 = 1 << 10;
    const VALID: u64 = 1 << 11;
    // 36-bit mask bits 35:12
    const MASK_1GB: u64 = 0xF_C000_0000;
    const MASK_2MB: u64 = 0xF_FFE0_0000;

    struct Mtrrs {
        msrs: RefCell<HashMap<u32, u64>>,
        supported: bool,
    }

    impl Mtrrs {
        fn new(default_type: u64, ranges: &[(u64, u64, u64)]) -> Self {
            let mut msrs = HashMap::new();
            msrs.insert(msr::IA32_MTRRCAP, 0x500 | ranges.len() as u64);
            msrs.insert(msr::IA32_MTRR_DEF_TYPE, MTRR_ENABLED | default_type);
            for (index, &(base, mask, memory_type)) in ranges.iter().enumerate() {
                msrs.insert(msr::IA32_MTRR_PHYSBASE0 + index as u32 * 2, base | memory_type);
                msrs.insert(msr::IA32_MTRR_PHYSMASK0 + index as u32 * 2, mask | VALID);
            }
            Self { msrs: RefCell::new(msrs), supported: true }
        }
    }

    impl Platform for Mtrrs {
        fn rdmsr(&self, msr: u32) -> u64 {
            self.msrs.borrow().get(&msr).copied().unwrap_or(0)
        }

        fn wrmsr(&self, msr: u32, value: u64) {
            self.msrs.borrow_mut().insert(msr, value);
        }

        fn cpuid(&self, leaf: u32, _sub_leaf: u32) -> CpuIdResult {
            match leaf {
                0x1 => CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: if self.supported { 1 << 12 } else { 0 } },
                0x8000_0000 => CpuIdResult { eax: 0x8000_0008, ebx: 0, ecx: 0, edx: 0 },
                0x8000_0008 => CpuIdResult { eax: 36, ebx: 0, ecx: 0, edx: 0 },
                _ => CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: 0 },
            }
        }

        fn wbinvd(&self) {}

        fn invept_single_context(&self, _eptp: u64) {}

        fn invvpid_individual_address(&self, _vpid: u16, _address: u64) {}

        fn invvpid_single_context(&self, _vpid: u16) {}
    }

    #[test]
    fn default_type_applies_without_valid_ranges() {
        let mtrrs = Mtrrs::new(6, &[]);
        assert_eq!(resolve(&mtrrs, 0x4000_0000, Granularity::Page1Gb), MemoryType::WriteBack);
    }

    #[test]
    fn disabled_or_missing_mtrrs_are_uncacheable() {
        let mtrrs = Mtrrs::new(6, &[]);
        mtrrs.wrmsr(msr::IA32_MTRR_DEF_TYPE, 6);
        assert_eq!(resolve(&mtrrs, 0x4000_0000, Granularity::Page2Mb), MemoryType::Uncacheable);

        let mut mtrrs = Mtrrs::new(6, &[]);
        mtrrs.supported = false;
        assert_eq!(resolve(&mtrrs, 0x4000_0000, Granularity::Page2Mb), MemoryType::Uncacheable);
    }

    #[test]
    fn uncacheable_wins_over_write_back() {
        let mtrrs = Mtrrs::new(6, &[(0x8000_0000, MASK_1GB, 6), (0x8020_0000, MASK_2MB, 0)]);
        assert_eq!(resolve(&mtrrs, 0x8020_0000, Granularity::Page2Mb), MemoryType::Uncacheable);
        assert_eq!(resolve(&mtrrs, 0x8040_0000, Granularity::Page2Mb), MemoryType::WriteBack);
    }

    #[test]
    fn partial_overlap_is_unspecified() {
        let mtrrs = Mtrrs::new(6, &[(0x8020_0000, MASK_2MB, 0)]);
        assert_eq!(resolve(&mtrrs, 0x8000_0000, Granularity::Page1Gb), MemoryType::Unspecified);
    }

    #[test]
    fn reserved_range_type_falls_back_to_default() {
        let mtrrs = Mtrrs::new(4, &[(0x8000_0000, MASK_1GB, 2)]);
        assert_eq!(resolve(&mtrrs, 0x8000_0000, Granularity::Page4Kb), MemoryType::WriteThrough);
    }

    #[test]
    fn bits_beyond_the_address_width_are_ignored() {
        let mtrrs = Mtrrs::new(6, &[(1 << 40 | 0x8000_0000, MASK_1GB | 0xF0 << 36, 0)]);
        assert_eq!(resolve(&mtrrs, 0x8000_0000, Granularity::Page1Gb), MemoryType::Uncacheable);
        assert_eq!(resolve(&mtrrs, 0xC000_0000, Granularity::Page2Mb), MemoryType::WriteBack);
    }

    #[test]
    fn fixed_range_region_is_unspecified() {
        let mtrrs = Mtrrs::new(6, &[]);
        mtrrs.wrmsr(msr::IA32_MTRR_DEF_TYPE, MTRR_ENABLED | FIXED_ENABLED | 6);
        assert_eq!(resolve(&mtrrs, 0xA_0000, Granularity::Page4Kb), MemoryType::Unspecified);
        assert_eq!(resolve(&mtrrs, 0x10_0000, Granularity::Page4Kb), MemoryType::WriteBack);
    }

    #[test]
    fn granularity_selector_and_alignment() {
        assert_eq!(Granularity::from_selector(1), Some(Granularity::Page2Mb));
        assert_eq!(Granularity::from_selector(3), None);
        assert!(Granularity::Page1Gb.is_aligned(0x4000_0000));
        assert!(!Granularity::Page2Mb.is_aligned(0x1000));
    }

    #[test]
    fn capture_reads_every_variable_range() {
        let mtrrs = Mtrrs::new(6, &[(0x8000_0000, MASK_1GB, 6), (0x8020_0000, MASK_2MB, 0)]);
        let state = MtrrState::capture(&mtrrs);

        assert_eq!(state.count, 2);
        assert_eq!(state.ranges[1], (0x8020_0000, MASK_2MB | VALID));
        assert_eq!(state.ranges[2], (0, 0));
    }

    fn memory_type_code() -> impl Strategy<Value = u64> {
        prop::sample::select(vec![0u64, 1, 4, 5, 6])
    }

    proptest! {
        #[test]
        fn single_containing_range_decides(memory_type in memory_type_code(), default_type in memory_type_code(), slot in 0u64..16) {
            let base = slot * 0x4000_0000;
            let mtrrs = Mtrrs::new(default_type, &[(base, MASK_1GB, memory_type)]);
            prop_assert_eq!(resolve(&mtrrs, base + 0x20_0000, Granularity::Page2Mb), MemoryType::from_raw(memory_type));
        }

        #[test]
        fn precedence_does_not_depend_on_range_order(types in prop::collection::vec(memory_type_code(), 1..8), rotation in 0usize..8) {
            let ranges: Vec<_> = types.iter().map(|&memory_type| (0x4000_0000, MASK_1GB, memory_type)).collect();
            let mut rotated = ranges.clone();
            rotated.rotate_left(rotation % ranges.len());

            let forward = resolve(&Mtrrs::new(6, &ranges), 0x4000_0000, Granularity::Page4Kb);
            let rotated = resolve(&Mtrrs::new(6, &rotated), 0x4000_0000, Granularity::Page4Kb);

            if types.contains(&0) {
                prop_assert_eq!(forward, MemoryType::Uncacheable);
                prop_assert_eq!(rotated, MemoryType::Uncacheable);
            }
            if types.iter().all(|&t| t == 4 || t == 6) && types.contains(&4) {
                prop_assert_eq!(forward, MemoryType::WriteThrough);
                prop_assert_eq!(rotated, MemoryType::WriteThrough);
            }
        }
    }
}
