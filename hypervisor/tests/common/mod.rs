//! Fakes standing in for the VMCS, the logical processor, the host hypervisor and the page pool.

#![allow(dead_code)]

use {
    siren::{
        config::Config,
        error::HypervisorError,
        hyperv::{
            hypercall::{HvStatus, HypercallInput, HypercallResult},
            relay::{FastBlock, HypercallTransport},
        },
        intel::{
            ept::{Ept, PagePool, Table},
            platform::Platform,
            vcpu::Vcpu,
            vmcs::{GuestState, VMEXIT_INSTRUCTION_LEN},
            vmerror::VmxBasicExitReason,
        },
    },
    std::{
        cell::{Cell, RefCell},
        collections::{BTreeMap, HashMap},
    },
    x86::{
        cpuid::CpuIdResult,
        msr,
        vmx::vmcs::{guest, ro},
    },
};

/// RIP of the instruction every fake exit traps on.
pub const GUEST_RIP: u64 = 0x1000;

/// What the fake host leaves in R8 after a fast hypercall.
pub const FAST_OUTPUT: u64 = 0xF00D;

pub const MTRR_ENABLED: u64 = 1 << 11;
pub const FIXED_ENABLED: u64 = 1 << 10;
pub const MTRR_VALID: u64 = 1 << 11;
/// Variable-range masks on a 36-bit processor.
pub const MASK_1GB: u64 = 0xF_C000_0000;
pub const MASK_2MB: u64 = 0xF_FFE0_0000;
pub const MASK_4KB: u64 = 0xF_FFFF_F000;

pub const UC: u64 = 0;
pub const WT: u64 = 4;
pub const WB: u64 = 6;

/// A VMCS held in a map. Fields never written read as zero.
#[derive(Default)]
pub struct FakeVmcs {
    pub fields: HashMap<u32, u64>,
}

impl FakeVmcs {
    pub fn exit(reason: VmxBasicExitReason, length: u64) -> Self {
        let mut vmcs = Self::default();
        vmcs.fields.insert(ro::EXIT_REASON, reason as u64);
        vmcs.fields.insert(VMEXIT_INSTRUCTION_LEN, length);
        vmcs.fields.insert(guest::RIP, GUEST_RIP);
        vmcs
    }

    pub fn with(mut self, field: u32, value: u64) -> Self {
        self.fields.insert(field, value);
        self
    }
}

impl GuestState for FakeVmcs {
    fn vmread(&self, field: u32) -> Result<u64, HypervisorError> {
        Ok(self.fields.get(&field).copied().unwrap_or(0))
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), HypervisorError> {
        self.fields.insert(field, value);
        Ok(())
    }
}

/// Reads a VMCS field through the virtual CPU holding the fake.
pub fn field(vcpu: &Vcpu<'_>, field: u32) -> u64 {
    vcpu.guest.vmread(field).unwrap()
}

/// Queues the next exit on a virtual CPU that already handled one.
pub fn next_exit(vcpu: &mut Vcpu<'_>, reason: VmxBasicExitReason, length: u64) {
    vcpu.guest.vmwrite(ro::EXIT_REASON, reason as u64).unwrap();
    vcpu.guest.vmwrite(VMEXIT_INSTRUCTION_LEN, length).unwrap();
}

/// A logical processor running under Hyper-V (or under nothing), 36-bit physical addresses.
pub struct FakeCpu {
    pub msrs: RefCell<HashMap<u32, u64>>,
    pub leaves: HashMap<u32, CpuIdResult>,
    pub invept: RefCell<Vec<u64>>,
    pub invvpid_address: RefCell<Vec<(u16, u64)>>,
    pub invvpid_context: RefCell<Vec<u16>>,
    pub wbinvd: Cell<u32>,
}

fn leaf(eax: u32, ebx: u32, ecx: u32, edx: u32) -> CpuIdResult {
    CpuIdResult { eax, ebx, ecx, edx }
}

impl FakeCpu {
    /// MTRRs supported and enabled, default type write-back, no variable ranges.
    pub fn hyperv() -> Self {
        let mut leaves = HashMap::new();
        // VMX, MTRR and hypervisor-present bits.
        leaves.insert(0x1, leaf(0x000906EA, 0, (1 << 31) | (1 << 5), 1 << 12));
        leaves.insert(0x4000_0000, leaf(0x4000_000A, 0x7263_694D, 0x666F_736F, 0x7648_2074));
        leaves.insert(0x4000_0001, leaf(0x3123_7648, 0, 0, 0));
        leaves.insert(0x4000_0002, leaf(22621, 0x000A_0000, 0, 0));
        leaves.insert(0x4000_0003, leaf(0xFFFF, 0x1, 0, 1 << 4));
        leaves.insert(0x4000_0004, leaf(1 << 14 | 1, 0, 0, 0));
        leaves.insert(0x4000_000A, leaf(0xE0E, 0, 0, 0));
        leaves.insert(0x8000_0000, leaf(0x8000_0008, 0, 0, 0));
        leaves.insert(0x8000_0008, leaf(0x3024, 0, 0, 0));

        let cpu = Self {
            msrs: RefCell::new(HashMap::new()),
            leaves,
            invept: RefCell::new(Vec::new()),
            invvpid_address: RefCell::new(Vec::new()),
            invvpid_context: RefCell::new(Vec::new()),
            wbinvd: Cell::new(0),
        };

        cpu.set_msr(msr::IA32_VMX_CR0_FIXED1, u64::MAX);
        cpu.set_msr(msr::IA32_VMX_CR4_FIXED1, u64::MAX);
        cpu.with_mtrrs(WB, &[])
    }

    /// The same processor without a hypervisor above it.
    pub fn bare_metal() -> Self {
        let mut cpu = Self::hyperv();
        cpu.leaves.retain(|&leaf, _| !(0x4000_0000..0x5000_0000).contains(&leaf));
        if let Some(features) = cpu.leaves.get_mut(&0x1) {
            features.ecx &= !(1 << 31);
        }
        cpu
    }

    /// Programs the variable-range MTRRs: `(base, mask, type)` per range.
    pub fn with_mtrrs(self, default_type: u64, ranges: &[(u64, u64, u64)]) -> Self {
        self.set_msr(msr::IA32_MTRRCAP, 0x500 | ranges.len() as u64);
        self.set_msr(msr::IA32_MTRR_DEF_TYPE, MTRR_ENABLED | default_type);

        for (index, &(base, mask, memory_type)) in ranges.iter().enumerate() {
            let index = index as u32 * 2;
            self.set_msr(msr::IA32_MTRR_PHYSBASE0 + index, base | memory_type);
            self.set_msr(msr::IA32_MTRR_PHYSMASK0 + index, mask | MTRR_VALID);
        }

        self
    }

    pub fn msr(&self, msr: u32) -> u64 {
        self.msrs.borrow().get(&msr).copied().unwrap_or(0)
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.borrow_mut().insert(msr, value);
    }
}

impl Platform for FakeCpu {
    fn rdmsr(&self, msr: u32) -> u64 {
        self.msr(msr)
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        self.set_msr(msr, value);
    }

    fn cpuid(&self, leaf: u32, _sub_leaf: u32) -> CpuIdResult {
        self.leaves.get(&leaf).copied().unwrap_or(CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: 0 })
    }

    fn wbinvd(&self) {
        self.wbinvd.set(self.wbinvd.get() + 1);
    }

    fn invept_single_context(&self, eptp: u64) {
        self.invept.borrow_mut().push(eptp);
    }

    fn invvpid_individual_address(&self, vpid: u16, address: u64) {
        self.invvpid_address.borrow_mut().push((vpid, address));
    }

    fn invvpid_single_context(&self, vpid: u16) {
        self.invvpid_context.borrow_mut().push(vpid);
    }
}

/// A host hypervisor that records every hypercall and answers with `status`.
pub struct FakeHost {
    pub status: Cell<HvStatus>,
    pub memory_calls: RefCell<Vec<(HypercallInput, u64, u64)>>,
    pub fast_calls: RefCell<Vec<(HypercallInput, FastBlock)>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self { status: Cell::new(HvStatus::SUCCESS), memory_calls: RefCell::default(), fast_calls: RefCell::default() }
    }
}

impl HypercallTransport for FakeHost {
    fn call_memory(&self, input: HypercallInput, input_pa: u64, output_pa: u64) -> HypercallResult {
        self.memory_calls.borrow_mut().push((input, input_pa, output_pa));
        HypercallResult::new(self.status.get(), input.rep_count())
    }

    fn call_fast(&self, input: HypercallInput, block: &mut FastBlock) -> HypercallResult {
        self.fast_calls.borrow_mut().push((input, *block));
        block[1] = FAST_OUTPUT;
        HypercallResult::new(self.status.get(), 0)
    }
}

/// Heap-backed page pool where a table's physical address is its virtual address.
pub struct HeapPool {
    limit: usize,
    live: BTreeMap<u64, Box<Table>>,
}

impl HeapPool {
    pub fn new(limit: usize) -> Self {
        Self { limit, live: BTreeMap::new() }
    }

    pub fn live(&self) -> usize {
        self.live.len()
    }
}

unsafe impl PagePool for HeapPool {
    fn allocate(&mut self) -> Option<u64> {
        if self.live.len() == self.limit {
            return None;
        }

        let mut table = Box::new(Table::new());
        let table_pa = &mut *table as *mut Table as u64;
        self.live.insert(table_pa, table);
        Some(table_pa)
    }

    fn free(&mut self, table_pa: u64) {
        assert!(self.live.remove(&table_pa).is_some(), "double free of {table_pa:#x}");
    }

    fn table(&self, table_pa: u64) -> *mut Table {
        table_pa as *mut Table
    }
}

pub fn ept(limit: usize) -> Ept<HeapPool> {
    Ept::new(HeapPool::new(limit)).unwrap()
}

pub fn vcpu<'a>(vmcs: &'a mut FakeVmcs, cpu: &'a FakeCpu, ept: &'a mut Ept<HeapPool>, host: &'a FakeHost) -> Vcpu<'a> {
    Vcpu::new(vmcs, cpu, ept, host, Config::default())
}
