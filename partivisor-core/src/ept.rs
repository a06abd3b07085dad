//! Extended page tables: the GPA→HPA translation of every guest world.
//!
//! The generic page-table engine does the walking; this module supplies the
//! EPT entry encoding, the memory-type rules, the secure-world root that
//! borrows normal-world PDPTs with the execute right stripped, and the
//! misconfiguration predicate the EPT-misconfig exit handler relies on.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use partivisor_hal::page::{Page, PagePool};
use partivisor_hal::pgtable::{PageTable, PagingPolicy, PgError, PgtLevel, PFN_MASK};
use partivisor_hal::vmx::{clflushopt, EPTP_PWL_4, EPTP_WB};
use partivisor_hal::{cpu_caps, cpuid, hva2hpa, GuestPhysAddr, PhysAddr, INVALID_HPA};
use spin::Once;

use crate::error::HvErr;

bitflags::bitflags! {
    /// EPT leaf access rights and attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const IGNORE_PAT = 1 << 6;
    }
}

/* raw aliases, the currency of table entries */
pub const EPT_RD: u64 = EptFlags::READ.bits();
pub const EPT_WR: u64 = EptFlags::WRITE.bits();
pub const EPT_EXE: u64 = EptFlags::EXECUTE.bits();
pub const EPT_RWX: u64 = EPT_RD | EPT_WR | EPT_EXE;
pub const EPT_MT_SHIFT: u32 = 3;
pub const EPT_UNCACHED: u64 = 0 << EPT_MT_SHIFT;
pub const EPT_WC: u64 = 1 << EPT_MT_SHIFT;
pub const EPT_WT: u64 = 4 << EPT_MT_SHIFT;
pub const EPT_WP: u64 = 5 << EPT_MT_SHIFT;
pub const EPT_WB: u64 = 6 << EPT_MT_SHIFT;
pub const EPT_MT_MASK: u64 = 7 << EPT_MT_SHIFT;
pub const EPT_IGNORE_PAT: u64 = EptFlags::IGNORE_PAT.bits();
/// Frame bits of a leaf; bits 52..63 are software-available and excluded.
pub const EPT_ENTRY_PFN_MASK: u64 = PFN_MASK;

/// Set when the IOMMU shares these tables without snooping page walks.
static EPT_NONCOHERENT_WALK: AtomicBool = AtomicBool::new(false);

pub fn set_noncoherent_walk(on: bool) {
    EPT_NONCOHERENT_WALK.store(on, Ordering::Release);
}

/// EPT flavor of the paging policy.
pub struct EptPolicy;

impl PagingPolicy for EptPolicy {
    const DEFAULT_ACCESS_RIGHT: u64 = EPT_RWX;
    const PRESENT_MASK: u64 = EPT_RWX;

    fn large_page_support(level: PgtLevel, prot: u64) -> bool {
        // Never give out large leaves while a permission tweak is live on
        // the range; the split cost dwarfs the refusal.
        let _ = prot;
        match level {
            PgtLevel::Pd => {
                cpu_caps::cpu_caps().has_ept_cap(cpu_caps::EPT_FEATURE_2MB_PAGE)
            }
            PgtLevel::Pdpt => {
                cpu_caps::cpu_caps().has_ept_cap(cpu_caps::EPT_FEATURE_1GB_PAGE)
            }
            _ => false,
        }
    }

    fn clflush_pagewalk(entry: *const u64) {
        if EPT_NONCOHERENT_WALK.load(Ordering::Acquire) {
            // SAFETY: entry points into a live page-table node.
            unsafe { clflushopt(entry as *const u8) };
        }
    }

    fn tweak_exe_right(entry: &mut u64) {
        *entry &= !EPT_EXE;
    }

    fn recover_exe_right(entry: &mut u64) {
        *entry |= EPT_EXE;
    }
}

/// Pages backing all EPT structures.
const EPT_PAGE_NUM: usize = 1024;

struct EptBacking(UnsafeCell<[Page; EPT_PAGE_NUM]>);
// Handed to the pool once; the pool serializes access afterwards.
unsafe impl Sync for EptBacking {}

static EPT_BACKING: EptBacking = {
    const P: Page = Page::zeroed();
    EptBacking(UnsafeCell::new([P; EPT_PAGE_NUM]))
};

static EPT_POOL: Once<PagePool> = Once::new();

pub fn ept_pool() -> &'static PagePool {
    EPT_POOL.call_once(|| {
        // SAFETY: EPT_BACKING is given out exactly once.
        unsafe { PagePool::new(EPT_BACKING.0.get() as *mut Page, EPT_PAGE_NUM) }
    })
}

fn pg_to_hv(err: PgError) -> HvErr {
    match err {
        PgError::OutOfPages => HvErr::NoMem,
        PgError::BadAlignment => HvErr::Inval,
        _ => HvErr::Fault,
    }
}

/// One world's EPT hierarchy.
pub struct Ept {
    pool: &'static PagePool,
    root: AtomicU64,
}

impl Ept {
    pub fn new(pool: &'static PagePool) -> Result<Self, HvErr> {
        let pt: PageTable<'static, EptPolicy> = PageTable::new(pool);
        let root = pt.create_root().map_err(pg_to_hv)?;
        Ok(Ept {
            pool,
            root: AtomicU64::new(root as u64),
        })
    }

    /// Wrap an already-built root (the secure-world path).
    fn from_root(pool: &'static PagePool, root: *mut u64) -> Self {
        Ept {
            pool,
            root: AtomicU64::new(root as u64),
        }
    }

    fn table(&self) -> PageTable<'static, EptPolicy> {
        PageTable::new(self.pool)
    }

    pub fn root_hva(&self) -> *mut u64 {
        self.root.load(Ordering::Acquire) as *mut u64
    }

    /// The value programmed into VMX_EPT_POINTER: root HPA, 4-level walk,
    /// write-back walk accesses.
    pub fn eptp(&self) -> u64 {
        hva2hpa(self.root_hva() as *const u8) | EPTP_PWL_4 | EPTP_WB
    }

    /// Map `[gpa, gpa+size)` to `[hpa, ...)`. Re-adding an identical region
    /// is a no-op; a conflicting overlap re-ORs the requested rights into
    /// the existing leaves.
    pub fn add_mr(
        &self,
        hpa: PhysAddr,
        gpa: GuestPhysAddr,
        size: u64,
        prot: u64,
    ) -> Result<(), HvErr> {
        match self.table().add_map(self.root_hva(), hpa, gpa, size, prot) {
            Ok(()) => Ok(()),
            Err(PgError::AlreadyMapped) => self
                .table()
                .modify_map(self.root_hva(), gpa, size, prot & EPT_RWX, 0)
                .map_err(pg_to_hv),
            Err(e) => Err(pg_to_hv(e)),
        }
    }

    pub fn del_mr(&self, gpa: GuestPhysAddr, size: u64) -> Result<(), HvErr> {
        self.table()
            .del_map(self.root_hva(), gpa, size)
            .map_err(pg_to_hv)
    }

    pub fn modify_mr(
        &self,
        gpa: GuestPhysAddr,
        size: u64,
        prot_set: u64,
        prot_clr: u64,
    ) -> Result<(), HvErr> {
        self.table()
            .modify_map(self.root_hva(), gpa, size, prot_set, prot_clr)
            .map_err(pg_to_hv)
    }

    /// Translate one GPA; INVALID_HPA when no leaf covers it.
    pub fn gpa2hpa(&self, gpa: GuestPhysAddr) -> PhysAddr {
        self.local_gpa2hpa(gpa).map(|(hpa, _)| hpa).unwrap_or(INVALID_HPA)
    }

    /// Translate one GPA, also reporting the covering leaf size.
    pub fn local_gpa2hpa(&self, gpa: GuestPhysAddr) -> Option<(PhysAddr, u64)> {
        let (entry, pg_size) = self.table().lookup_entry(self.root_hva(), gpa)?;
        // SAFETY: lookup_entry returned a live leaf.
        let value = unsafe { core::ptr::read_volatile(entry) };
        let hpa = (value & EPT_ENTRY_PFN_MASK & !(pg_size - 1)) | (gpa & (pg_size - 1));
        Some((hpa, pg_size))
    }

    /// Visit every present leaf: `f(entry_value, covered_bytes)`.
    pub fn walk(&self, mut f: impl FnMut(u64, u64)) {
        self.table().walk_leaves(self.root_hva(), |entry, size| {
            // SAFETY: engine hands out live leaf pointers.
            f(unsafe { core::ptr::read_volatile(entry) }, size);
        });
    }

    /// Build the secure-world root: every PML4 slot below the rebase index
    /// gets a private copy of the normal world's PDPT with execute rights
    /// stripped, so secure code can read normal memory but never run it.
    pub fn create_trusty_root(&self, rebase_gpa: u64) -> Result<Ept, HvErr> {
        let pt = self.table();
        let sworld_root = pt.create_root().map_err(pg_to_hv)?;
        let rebase_idx = (rebase_gpa >> 39) as usize & 0x1FF;
        let nworld_root = self.root_hva();

        for idx in 0..rebase_idx {
            // SAFETY: both roots are live 512-entry nodes from our pool.
            let nworld_entry = unsafe { core::ptr::read_volatile(nworld_root.add(idx)) };
            if nworld_entry & EPT_RWX == 0 {
                continue;
            }
            let src_pdpt = partivisor_hal::hpa2hva(nworld_entry & PFN_MASK) as *const u64;
            let page = self.pool.alloc_page().map_err(|_| HvErr::NoMem)?;
            // SAFETY: freshly allocated, exclusively owned, zeroed page.
            let dst = unsafe { (*page).as_entries() };
            for (i, slot) in dst.iter_mut().enumerate() {
                let mut e = unsafe { core::ptr::read_volatile(src_pdpt.add(i)) };
                if e & EPT_RWX != 0 {
                    EptPolicy::tweak_exe_right(&mut e);
                }
                *slot = e;
                EptPolicy::clflush_pagewalk(slot as *const u64);
            }
            let value = hva2hpa(page as *const u8) | EptPolicy::DEFAULT_ACCESS_RIGHT;
            unsafe { core::ptr::write_volatile(sworld_root.add(idx), value) };
            EptPolicy::clflush_pagewalk(unsafe { sworld_root.add(idx) } as *const u64);
        }

        Ok(Ept::from_root(self.pool, sworld_root))
    }

    /// Tear down a secure-world root built by [`Ept::create_trusty_root`]:
    /// frees the private PDPT copies and the root itself, leaving the
    /// shared PD/PT nodes to the normal world.
    pub fn destroy_trusty_root(&self, rebase_gpa: u64) {
        let root = self.root_hva();
        let rebase_idx = (rebase_gpa >> 39) as usize & 0x1FF;
        for idx in 0..rebase_idx {
            // SAFETY: root is our own live node.
            let entry = unsafe { core::ptr::read_volatile(root.add(idx)) };
            if entry & EPT_RWX != 0 {
                let pdpt = partivisor_hal::hpa2hva(entry & PFN_MASK) as *mut Page;
                self.pool.free_page(pdpt);
            }
        }
        self.pool.free_page(root as *mut Page);
    }
}

// Root pointer is atomic; table mutation is serialized by the owning VM.
unsafe impl Send for Ept {}
unsafe impl Sync for Ept {}

/// Memory-type values legal in a leaf.
fn is_valid_ept_memtype(mt: u64) -> bool {
    matches!(mt >> EPT_MT_SHIFT, 0 | 1 | 4 | 5 | 6)
}

/// The misconfiguration rules the hardware applies to a present entry.
pub fn is_ept_entry_misconfigured(entry: u64, is_leaf: bool) -> bool {
    let access = entry & EPT_RWX;
    if access == 0 {
        return false;
    }
    // Write-without-read is always malformed.
    if access & EPT_WR != 0 && access & EPT_RD == 0 {
        return true;
    }
    // Execute-without-read needs the execute-only capability.
    if access & EPT_EXE != 0
        && access & EPT_RD == 0
        && !cpu_caps::cpu_caps().has_ept_cap(cpu_caps::EPT_FEATURE_EXEC_ONLY)
    {
        return true;
    }
    if is_leaf && !is_valid_ept_memtype(entry & EPT_MT_MASK) {
        return true;
    }
    // Frame bits above the machine's physical width are reserved.
    let phys_bits = cpu_caps::cpu_caps().phys_bits;
    if phys_bits != 0 && phys_bits < 52 {
        let rsvd = PFN_MASK & !((1u64 << phys_bits) - 1);
        if entry & rsvd != 0 {
            return true;
        }
    }
    false
}

/// Flush one leaf's backing memory out of the caches (WBINVD decomposition
/// used on cache-partitioned platforms).
pub fn ept_flush_leaf_page(entry: u64, size: u64) {
    if !cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_CLFLUSHOPT) {
        return;
    }
    let base = entry & EPT_ENTRY_PFN_MASK & !(size - 1);
    let mut line = base;
    while line < base + size {
        // SAFETY: leaf frames are direct-mapped host memory.
        unsafe { clflushopt(partivisor_hal::hpa2hva(line)) };
        line += 64;
    }
}

#[cfg(test)]
pub(crate) fn test_ept() -> Ept {
    use alloc::boxed::Box;
    let npages = 256;
    let mem: Box<[Page]> = (0..npages).map(|_| Page::zeroed()).collect();
    let base = Box::leak(mem).as_mut_ptr();
    // SAFETY: leaked, exclusively owned region.
    let pool = Box::leak(Box::new(unsafe { PagePool::new(base, npages) }));
    Ept::new(pool).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TRUSTY_EPT_REBASE_GPA;

    #[test]
    fn add_and_translate() {
        let ept = test_ept();
        ept.add_mr(0x8000, 0x1000, 0x2000, EPT_RWX | EPT_WB).unwrap();
        assert_eq!(ept.gpa2hpa(0x1234), 0x8234);
        assert_eq!(ept.gpa2hpa(0x2FFF), 0x9FFF);
        assert_eq!(ept.gpa2hpa(0x3000), INVALID_HPA);
    }

    #[test]
    fn add_is_idempotent_and_reors_rights() {
        let ept = test_ept();
        ept.add_mr(0x8000, 0x1000, 0x1000, EPT_RD | EPT_WB).unwrap();
        // identical: fine
        ept.add_mr(0x8000, 0x1000, 0x1000, EPT_RD | EPT_WB).unwrap();
        // differing rights: OR-ed into the leaf
        ept.add_mr(0x8000, 0x1000, 0x1000, EPT_RD | EPT_WR | EPT_WB)
            .unwrap();
        let (entry, _) = ept.table().lookup_entry(ept.root_hva(), 0x1000).unwrap();
        let value = unsafe { core::ptr::read_volatile(entry) };
        assert_eq!(value & EPT_RWX, EPT_RD | EPT_WR);
    }

    #[test]
    fn delete_unmaps() {
        let ept = test_ept();
        ept.add_mr(0x8000, 0x1000, 0x3000, EPT_RWX | EPT_WB).unwrap();
        ept.del_mr(0x2000, 0x1000).unwrap();
        assert_eq!(ept.gpa2hpa(0x2000), INVALID_HPA);
        assert_ne!(ept.gpa2hpa(0x1000), INVALID_HPA);
    }

    #[test]
    fn modify_clears_rights() {
        let ept = test_ept();
        ept.add_mr(0x8000, 0x1000, 0x1000, EPT_RWX | EPT_WB).unwrap();
        ept.modify_mr(0x1000, 0x1000, 0, EPT_WR).unwrap();
        let (entry, _) = ept.table().lookup_entry(ept.root_hva(), 0x1000).unwrap();
        let value = unsafe { core::ptr::read_volatile(entry) };
        assert_eq!(value & EPT_RWX, EPT_RD | EPT_EXE);
    }

    #[test]
    fn trusty_root_shares_reads_strips_exec() {
        let ept = test_ept();
        ept.add_mr(0x10_0000, 0x20_0000, 0x1000, EPT_RWX | EPT_WB).unwrap();

        let sworld = ept.create_trusty_root(TRUSTY_EPT_REBASE_GPA).unwrap();
        // Normal-world memory is visible through the secure root...
        assert_eq!(sworld.gpa2hpa(0x20_0000), 0x10_0000);
        // ...but the borrowed PDPT lost the execute right.
        let pdpt_entry = unsafe { core::ptr::read_volatile(sworld.root_hva()) };
        let pdpt = partivisor_hal::hpa2hva(pdpt_entry & PFN_MASK) as *const u64;
        let borrowed = unsafe { core::ptr::read_volatile(pdpt) };
        assert_eq!(borrowed & EPT_EXE, 0);

        // Secure mappings added at the rebase slot stay invisible to the
        // normal world.
        sworld
            .add_mr(0x40_0000, TRUSTY_EPT_REBASE_GPA, 0x1000, EPT_RWX | EPT_WB)
            .unwrap();
        assert_eq!(ept.gpa2hpa(TRUSTY_EPT_REBASE_GPA), INVALID_HPA);
        assert_eq!(sworld.gpa2hpa(TRUSTY_EPT_REBASE_GPA), 0x40_0000);
    }

    #[test]
    fn misconfig_rules() {
        assert!(!is_ept_entry_misconfigured(0, true));
        assert!(is_ept_entry_misconfigured(EPT_WR | 0x1000, true));
        // Execute-only without the capability (empty caps in tests).
        assert!(is_ept_entry_misconfigured(EPT_EXE | 0x1000, true));
        // Reserved memory type 2.
        assert!(is_ept_entry_misconfigured(
            EPT_RWX | (2 << EPT_MT_SHIFT),
            true
        ));
        assert!(!is_ept_entry_misconfigured(EPT_RWX | EPT_WB, true));
    }
}
