//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//!
//! Guest-physical ranges are committed and uncommitted at 4 KiB, 2 MiB and 1 GiB granularity.
//! Paging structures are taken from a [`PagePool`] on demand and handed back as soon as they
//! no longer map anything.

use {
    crate::{
        error::EptError,
        intel::{
            mtrr::{Granularity, MemoryType},
            platform::Platform,
        },
        sync::SpinLock,
    },
    bitfield::bitfield,
    bitflags::bitflags,
    log::*,
    static_assertions::const_assert_eq,
    x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE},
};

/// Number of entries in every EPT paging structure.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Guest-physical addresses translated by a four-level EPT.
const GUEST_PHYSICAL_LIMIT: u64 = 1 << 48;

/// EPTP bits 5:3 hold the page-walk length minus one.
const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

/// The capability the siren hypercalls manage guest-physical mappings through.
///
/// Commit and uncommit of disjoint ranges may run concurrently on different logical processors
/// only if the implementation provides the exclusion, e.g. by going through a [`SpinLock`].
pub trait EptStore {
    /// Maps `[base, base + granularity)` to `backing` with the given memory type, replacing a
    /// mapping of the same granularity.
    fn commit(&mut self, base: u64, granularity: Granularity, backing: u64, memory_type: MemoryType) -> Result<(), EptError>;

    /// Removes a mapping of exactly this granularity. Succeeds without effect when there is none.
    fn uncommit(&mut self, base: u64, granularity: Granularity) -> Result<(), EptError>;

    /// Drops every cached translation derived from this store.
    fn flush(&mut self, platform: &dyn Platform);

    /// Host-physical address `guest_pa` is mapped to.
    fn translate(&self, guest_pa: u64) -> Option<u64>;

    /// EPT pointer naming this guest-physical address space.
    fn eptp(&self) -> u64;
}

impl<E: EptStore> EptStore for &SpinLock<E> {
    fn commit(&mut self, base: u64, granularity: Granularity, backing: u64, memory_type: MemoryType) -> Result<(), EptError> {
        self.lock().commit(base, granularity, backing, memory_type)
    }

    fn uncommit(&mut self, base: u64, granularity: Granularity) -> Result<(), EptError> {
        self.lock().uncommit(base, granularity)
    }

    fn flush(&mut self, platform: &dyn Platform) {
        self.lock().flush(platform)
    }

    fn translate(&self, guest_pa: u64) -> Option<u64> {
        self.lock().translate(guest_pa)
    }

    fn eptp(&self) -> u64 {
        self.lock().eptp()
    }
}

/// Source of 4 KiB paging structures.
///
/// # Safety
///
/// `allocate` must return the physical address of a 4 KiB aligned page that nobody else uses
/// until it is passed back to `free`, and `table` must return a valid pointer to that page for
/// as long as it is allocated.
pub unsafe trait PagePool {
    fn allocate(&mut self) -> Option<u64>;

    fn free(&mut self, table_pa: u64);

    fn table(&self, table_pa: u64) -> *mut Table;
}

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct Table {
    pub entries: [Entry; ENTRIES_PER_TABLE],
}

const_assert_eq!(core::mem::size_of::<Table>(), BASE_PAGE_SIZE);

impl Table {
    pub const fn new() -> Self {
        Self { entries: [Entry(0); ENTRIES_PER_TABLE] }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.present())
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub u8, memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Entry {
    pub fn present(&self) -> bool {
        self.0 & AccessType::READ_WRITE_EXECUTE.bits() as u64 != 0
    }

    pub fn address(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }

    fn set_access(&mut self, access: AccessType) {
        self.set_readable(access.contains(AccessType::READ));
        self.set_writable(access.contains(AccessType::WRITE));
        self.set_executable(access.contains(AccessType::EXECUTE));
    }

    /// A non-leaf entry referencing the next paging structure.
    fn table(table_pa: u64) -> Self {
        let mut entry = Entry(0);
        entry.set_access(AccessType::READ_WRITE_EXECUTE);
        entry.set_pfn(table_pa >> BASE_PAGE_SHIFT);
        entry
    }

    fn leaf(backing: u64, memory_type: MemoryType, large: bool) -> Self {
        let mut entry = Entry(0);
        entry.set_access(AccessType::READ_WRITE_EXECUTE);
        entry.set_memory_type(memory_type as u8);
        entry.set_large(large);
        entry.set_pfn(backing >> BASE_PAGE_SHIFT);
        entry
    }
}

/// Paging-structure level: 4 = PML4, 3 = PDPT, 2 = PD, 1 = PT.
fn leaf_level(granularity: Granularity) -> u32 {
    match granularity {
        Granularity::Page4Kb => 1,
        Granularity::Page2Mb => 2,
        Granularity::Page1Gb => 3,
    }
}

fn index(guest_pa: u64, level: u32) -> usize {
    ((guest_pa >> (BASE_PAGE_SHIFT as u32 + 9 * (level - 1))) & (ENTRIES_PER_TABLE as u64 - 1)) as usize
}

fn level_size(level: u32) -> u64 {
    1 << (BASE_PAGE_SHIFT as u32 + 9 * (level - 1))
}

/// A four-level EPT hierarchy built from pool pages.
pub struct Ept<P: PagePool> {
    pool: P,
    pml4: u64,
}

impl<P: PagePool> Ept<P> {
    pub fn new(mut pool: P) -> Result<Self, EptError> {
        let pml4 = Self::allocate_from(&mut pool)?;
        Ok(Self { pool, pml4 })
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Leaf entry mapping `guest_pa` at exactly `granularity`, if any.
    pub fn leaf(&self, guest_pa: u64, granularity: Granularity) -> Option<Entry> {
        let target = leaf_level(granularity);
        let mut table_pa = self.pml4;

        for level in (target..=4).rev() {
            let entry = self.entry(table_pa, index(guest_pa, level));
            if !entry.present() {
                return None;
            }

            if level == target {
                return (level == 1 || entry.large()).then_some(entry);
            }

            if entry.large() {
                return None;
            }

            table_pa = entry.address();
        }

        None
    }

    fn allocate_from(pool: &mut P) -> Result<u64, EptError> {
        let table_pa = pool.allocate().ok_or(EptError::OutOfResources)?;
        // Safety: the pool hands out exclusive, valid pages.
        unsafe { pool.table(table_pa).write(Table::new()) };
        Ok(table_pa)
    }

    fn entry(&self, table_pa: u64, index: usize) -> Entry {
        // Safety: every table reachable from the PML4 was allocated from the pool and is still owned by us.
        unsafe { (*self.pool.table(table_pa)).entries[index] }
    }

    fn set_entry(&mut self, table_pa: u64, index: usize, entry: Entry) {
        // Safety: as in `entry`; `&mut self` gives exclusive access to the hierarchy.
        unsafe { (*self.pool.table(table_pa)).entries[index] = entry };
    }

    fn is_table_empty(&self, table_pa: u64) -> bool {
        // Safety: as in `entry`.
        unsafe { (*self.pool.table(table_pa)).is_empty() }
    }

    fn map(&mut self, base: u64, level: u32, backing: u64, memory_type: MemoryType) -> Result<(), EptError> {
        let mut table_pa = self.pml4;

        for walk in ((level + 1)..=4).rev() {
            let slot = index(base, walk);
            let mut entry = self.entry(table_pa, slot);

            if !entry.present() {
                let child = Self::allocate_from(&mut self.pool)?;
                entry = Entry::table(child);
                self.set_entry(table_pa, slot, entry);
            } else if entry.large() {
                debug!("{:#x} is already covered by a level {} mapping", base, walk);
                return Err(EptError::MappingConflict(base));
            }

            table_pa = entry.address();
        }

        let slot = index(base, level);
        let existing = self.entry(table_pa, slot);
        if existing.present() && level > 1 && !existing.large() {
            debug!("{:#x} already holds smaller mappings", base);
            return Err(EptError::MappingConflict(base));
        }

        self.set_entry(table_pa, slot, Entry::leaf(backing, memory_type, level > 1));
        Ok(())
    }

    /// Releases the paging structures on the path to `base` that no longer map anything.
    fn prune(&mut self, base: u64) {
        let mut path = [(0u64, 0usize); 4];
        let mut depth = 0;
        let mut table_pa = self.pml4;

        for level in (1..=4).rev() {
            let slot = index(base, level);
            let entry = self.entry(table_pa, slot);
            path[depth] = (table_pa, slot);
            depth += 1;

            if !entry.present() || entry.large() || level == 1 {
                break;
            }

            table_pa = entry.address();
        }

        // The last recorded table may be empty now; free it and walk back towards the root.
        while depth > 1 {
            let (child_pa, _) = path[depth - 1];
            if !self.is_table_empty(child_pa) {
                break;
            }

            let (parent_pa, parent_slot) = path[depth - 2];
            self.set_entry(parent_pa, parent_slot, Entry(0));
            self.pool.free(child_pa);
            trace!("Released EPT paging structure {:#x}", child_pa);
            depth -= 1;
        }
    }

    fn free_hierarchy(&mut self, table_pa: u64, level: u32) {
        if level > 1 {
            for slot in 0..ENTRIES_PER_TABLE {
                let entry = self.entry(table_pa, slot);
                if entry.present() && !entry.large() {
                    self.free_hierarchy(entry.address(), level - 1);
                }
            }
        }

        self.pool.free(table_pa);
    }
}

impl<P: PagePool> EptStore for Ept<P> {
    fn commit(&mut self, base: u64, granularity: Granularity, backing: u64, memory_type: MemoryType) -> Result<(), EptError> {
        if !granularity.is_aligned(base) {
            return Err(EptError::Misaligned(base));
        }
        if !granularity.is_aligned(backing) {
            return Err(EptError::Misaligned(backing));
        }
        if base >= GUEST_PHYSICAL_LIMIT {
            return Err(EptError::OutOfRange(base));
        }
        if memory_type == MemoryType::Unspecified {
            return Err(EptError::InvalidMemoryType(memory_type as u8));
        }

        let level = leaf_level(granularity);
        trace!("EPT commit {:#x} -> {:#x} ({:?}, {:?})", base, backing, granularity, memory_type);

        self.map(base, level, backing, memory_type).inspect_err(|_| self.prune(base))
    }

    fn uncommit(&mut self, base: u64, granularity: Granularity) -> Result<(), EptError> {
        if !granularity.is_aligned(base) {
            return Err(EptError::Misaligned(base));
        }
        if base >= GUEST_PHYSICAL_LIMIT {
            return Err(EptError::OutOfRange(base));
        }

        if self.leaf(base, granularity).is_none() {
            trace!("EPT uncommit {:#x} ({:?}): not committed", base, granularity);
            return Ok(());
        }

        let target = leaf_level(granularity);
        let mut table_pa = self.pml4;
        for level in ((target + 1)..=4).rev() {
            table_pa = self.entry(table_pa, index(base, level)).address();
        }

        self.set_entry(table_pa, index(base, target), Entry(0));
        self.prune(base);

        trace!("EPT uncommit {:#x} ({:?})", base, granularity);
        Ok(())
    }

    fn flush(&mut self, platform: &dyn Platform) {
        platform.invept_single_context(self.eptp());
    }

    /// Write-back paging structures, four-level walk.
    fn eptp(&self) -> u64 {
        self.pml4 | EPT_PAGE_WALK_LENGTH_4 | MemoryType::WriteBack as u64
    }

    fn translate(&self, guest_pa: u64) -> Option<u64> {
        if guest_pa >= GUEST_PHYSICAL_LIMIT {
            return None;
        }

        let mut table_pa = self.pml4;
        for level in (1..=4).rev() {
            let entry = self.entry(table_pa, index(guest_pa, level));
            if !entry.present() {
                return None;
            }

            if level == 1 || entry.large() {
                return Some(entry.address() + (guest_pa & (level_size(level) - 1)));
            }

            table_pa = entry.address();
        }

        None
    }
}

impl<P: PagePool> Drop for Ept<P> {
    fn drop(&mut self) {
        self.free_hierarchy(self.pml4, 4);
    }
}
