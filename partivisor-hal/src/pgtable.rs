//! Generic 4-level page-table engine.
//!
//! One walker drives both the host MMU tables and every VM's EPT; the two
//! differ only in the [`PagingPolicy`] they plug in: default access rights
//! for interior nodes, the present mask, large-page eligibility, the
//! cache-flush hook needed when an IOMMU shares the tables, and the
//! execute-right tweak hooks used when the secure world borrows PDPTs.

use core::marker::PhantomData;

use crate::page::{Page, PagePool, PAGE_SHIFT, PAGE_SIZE};
use crate::{hpa2hva, hva2hpa, PhysAddr};

pub const PTRS_PER_PTE: u64 = 512;
/// Physical-frame bits of an entry (bits 12..51).
pub const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Large-leaf marker at PD/PDPT level.
pub const PAGE_PS: u64 = 1 << 7;

pub const PML4E_SHIFT: u32 = 39;
pub const PDPTE_SHIFT: u32 = 30;
pub const PDE_SHIFT: u32 = 21;
pub const PTE_SHIFT: u32 = 12;

pub const PTE_SIZE: u64 = 1 << PTE_SHIFT;
pub const PDE_SIZE: u64 = 1 << PDE_SHIFT;
pub const PDPTE_SIZE: u64 = 1 << PDPTE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PgtLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl PgtLevel {
    #[inline]
    fn shift(self) -> u32 {
        match self {
            PgtLevel::Pml4 => PML4E_SHIFT,
            PgtLevel::Pdpt => PDPTE_SHIFT,
            PgtLevel::Pd => PDE_SHIFT,
            PgtLevel::Pt => PTE_SHIFT,
        }
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    pub fn entry_size(self) -> u64 {
        1u64 << self.shift()
    }

    #[inline]
    fn next(self) -> Option<PgtLevel> {
        match self {
            PgtLevel::Pml4 => Some(PgtLevel::Pdpt),
            PgtLevel::Pdpt => Some(PgtLevel::Pd),
            PgtLevel::Pd => Some(PgtLevel::Pt),
            PgtLevel::Pt => None,
        }
    }

    #[inline]
    fn index(self, addr: u64) -> usize {
        ((addr >> self.shift()) & (PTRS_PER_PTE - 1)) as usize
    }
}

/// Behavior knobs distinguishing MMU tables from EPT.
pub trait PagingPolicy {
    /// Rights OR-ed into any newly created non-leaf entry.
    const DEFAULT_ACCESS_RIGHT: u64;
    /// Any of these bits set means "entry references something".
    const PRESENT_MASK: u64;

    /// May a mapping of `prot` use a large leaf at `level`?
    fn large_page_support(level: PgtLevel, prot: u64) -> bool;

    /// Flush an entry towards memory when a non-coherent agent walks it.
    fn clflush_pagewalk(_entry: *const u64) {}

    /// Strip the execute right from a borrowed entry.
    fn tweak_exe_right(_entry: &mut u64) {}

    /// Restore the execute right on a borrowed entry.
    fn recover_exe_right(_entry: &mut u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgError {
    /// A present leaf with a different target or rights is already there.
    AlreadyMapped,
    /// Modify requested over a hole.
    NotMapped,
    /// Address or size not page-aligned.
    BadAlignment,
    /// Interior-node pool exhausted.
    OutOfPages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkOp {
    Modify { set: u64, clr: u64 },
    Delete,
}

/// The engine: a policy plus the pool its interior nodes come from.
pub struct PageTable<'p, P: PagingPolicy> {
    pool: &'p PagePool,
    _policy: PhantomData<P>,
}

impl<'p, P: PagingPolicy> PageTable<'p, P> {
    pub fn new(pool: &'p PagePool) -> Self {
        PageTable {
            pool,
            _policy: PhantomData,
        }
    }

    pub fn pool(&self) -> &'p PagePool {
        self.pool
    }

    /// Allocate an empty root table.
    pub fn create_root(&self) -> Result<*mut u64, PgError> {
        let page = self.pool.alloc_page().map_err(|_| PgError::OutOfPages)?;
        Ok(page as *mut u64)
    }

    /// Release a root table page (callers must have emptied it first).
    pub fn free_root(&self, root: *mut u64) {
        self.pool.free_page(root as *mut Page);
    }

    #[inline]
    fn is_present(entry: u64) -> bool {
        (entry & P::PRESENT_MASK) != 0
    }

    #[inline]
    fn is_leaf(level: PgtLevel, entry: u64) -> bool {
        level == PgtLevel::Pt || (entry & PAGE_PS) != 0
    }

    fn set_entry(entry: *mut u64, value: u64) {
        // SAFETY: caller derived `entry` from a live table page.
        unsafe { core::ptr::write_volatile(entry, value) };
        P::clflush_pagewalk(entry);
    }

    fn alloc_child(&self, entry: *mut u64) -> Result<*mut u64, PgError> {
        let page = self.pool.alloc_page().map_err(|_| PgError::OutOfPages)?;
        let table = page as *mut u64;
        Self::set_entry(entry, hva2hpa(table as *const u8) | P::DEFAULT_ACCESS_RIGHT);
        Ok(table)
    }

    #[inline]
    fn child_of(entry: u64) -> *mut u64 {
        hpa2hva(entry & PFN_MASK) as *mut u64
    }

    /// Break one large leaf into a full next-level table with the same
    /// rights, so a smaller region inside it can diverge.
    fn split_large_page(&self, entry: *mut u64, level: PgtLevel) -> Result<(), PgError> {
        let next = level.next().expect("PT leaves cannot split");
        // SAFETY: entry points into a live table.
        let old = unsafe { core::ptr::read_volatile(entry) };
        let prot = old & !PFN_MASK & !PAGE_PS;
        let base = old & PFN_MASK;

        let page = self.pool.alloc_page().map_err(|_| PgError::OutOfPages)?;
        // SAFETY: page is exclusively ours and zeroed.
        let table = unsafe { (*page).as_entries() };
        let step = next.entry_size();
        let child_ps = if next == PgtLevel::Pt { 0 } else { PAGE_PS };
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (base + i as u64 * step) | prot | child_ps;
            P::clflush_pagewalk(slot as *const u64);
        }
        Self::set_entry(entry, hva2hpa(page as *const u8) | P::DEFAULT_ACCESS_RIGHT);
        Ok(())
    }

    /// Map `[vaddr, vaddr+size)` to `[paddr, ...)` with `prot`.
    ///
    /// Idempotent for an identical pre-existing leaf; a conflicting present
    /// leaf fails with [`PgError::AlreadyMapped`] without touching anything
    /// past the conflict point.
    pub fn add_map(
        &self,
        root: *mut u64,
        paddr: PhysAddr,
        vaddr: u64,
        size: u64,
        prot: u64,
    ) -> Result<(), PgError> {
        if (paddr | vaddr | size) & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(PgError::BadAlignment);
        }
        let mut va = vaddr;
        let mut pa = paddr;
        let end = vaddr + size;
        while va < end {
            let mapped = self.map_chunk(root, PgtLevel::Pml4, pa, va, end - va, prot)?;
            va += mapped;
            pa += mapped;
        }
        Ok(())
    }

    /// Map as much as one entry at the deepest suitable level; returns bytes
    /// covered.
    fn map_chunk(
        &self,
        table: *mut u64,
        level: PgtLevel,
        pa: PhysAddr,
        va: u64,
        remain: u64,
        prot: u64,
    ) -> Result<u64, PgError> {
        let idx = level.index(va);
        // SAFETY: table is a live 512-entry node from our pool (or the root).
        let entry = unsafe { table.add(idx) };
        let cur = unsafe { core::ptr::read_volatile(entry) };
        let esize = level.entry_size();

        let fits_leaf = (va & (esize - 1)) == 0
            && (pa & (esize - 1)) == 0
            && remain >= esize
            && (level == PgtLevel::Pt || P::large_page_support(level, prot));

        if fits_leaf && !Self::is_present(cur) {
            let ps = if level == PgtLevel::Pt { 0 } else { PAGE_PS };
            Self::set_entry(entry, (pa & PFN_MASK) | prot | ps);
            return Ok(esize);
        }

        if Self::is_present(cur) && Self::is_leaf(level, cur) {
            // Identical mapping: tolerate re-adds of the same region.
            let ps = if level == PgtLevel::Pt { 0 } else { PAGE_PS };
            if fits_leaf && cur == ((pa & PFN_MASK) | prot | ps) {
                return Ok(esize);
            }
            if level == PgtLevel::Pt {
                return Err(PgError::AlreadyMapped);
            }
            // A smaller conflicting region inside a large leaf is a
            // conflict too; only non-present holes may be refined.
            return Err(PgError::AlreadyMapped);
        }

        let child = if Self::is_present(cur) {
            Self::child_of(cur)
        } else {
            self.alloc_child(entry)?
        };
        let next = level.next().ok_or(PgError::AlreadyMapped)?;
        self.map_chunk(child, next, pa, va, remain.min(esize - (va & (esize - 1))), prot)
    }

    /// OR-in `set` and clear `clr` on every leaf covering the range,
    /// splitting large leaves that straddle the boundary.
    pub fn modify_map(
        &self,
        root: *mut u64,
        vaddr: u64,
        size: u64,
        set: u64,
        clr: u64,
    ) -> Result<(), PgError> {
        self.walk_range(root, PgtLevel::Pml4, vaddr, vaddr + size, WalkOp::Modify { set, clr })
    }

    /// Remove every mapping in the range, returning empty interior nodes to
    /// the pool.
    pub fn del_map(&self, root: *mut u64, vaddr: u64, size: u64) -> Result<(), PgError> {
        self.walk_range(root, PgtLevel::Pml4, vaddr, vaddr + size, WalkOp::Delete)
    }

    fn walk_range(
        &self,
        table: *mut u64,
        level: PgtLevel,
        start: u64,
        end: u64,
        op: WalkOp,
    ) -> Result<(), PgError> {
        if (start | end) & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(PgError::BadAlignment);
        }
        let esize = level.entry_size();
        let mut va = start;
        while va < end {
            let idx = level.index(va);
            // SAFETY: table is a live node from our pool (or the root).
            let entry = unsafe { table.add(idx) };
            let cur = unsafe { core::ptr::read_volatile(entry) };
            let chunk_end = end.min((va & !(esize - 1)) + esize);

            if !Self::is_present(cur) {
                match op {
                    WalkOp::Modify { .. } => return Err(PgError::NotMapped),
                    WalkOp::Delete => {
                        va = chunk_end;
                        continue;
                    }
                }
            }

            if Self::is_leaf(level, cur) {
                let covers_whole = (va & (esize - 1)) == 0 && chunk_end - va == esize;
                if !covers_whole {
                    self.split_large_page(entry, level)?;
                    // Re-run this chunk against the new child table.
                    continue;
                }
                match op {
                    WalkOp::Modify { set, clr } => {
                        let ps = cur & PAGE_PS;
                        let frame = cur & PFN_MASK;
                        let prot = ((cur & !PFN_MASK & !PAGE_PS) | set) & !clr;
                        Self::set_entry(entry, frame | prot | ps);
                    }
                    WalkOp::Delete => Self::set_entry(entry, 0),
                }
                va = chunk_end;
                continue;
            }

            let child = Self::child_of(cur);
            let next = level.next().expect("leaf check covers PT");
            self.walk_range(child, next, va, chunk_end, op)?;

            if op == WalkOp::Delete && Self::table_empty(child) {
                Self::set_entry(entry, 0);
                self.pool.free_page(child as *mut Page);
            }
            va = chunk_end;
        }
        Ok(())
    }

    fn table_empty(table: *const u64) -> bool {
        for i in 0..PTRS_PER_PTE as usize {
            // SAFETY: table is a live 512-entry node.
            if unsafe { core::ptr::read_volatile(table.add(i)) } != 0 {
                return false;
            }
        }
        true
    }

    /// Find the leaf covering `addr`; returns the entry pointer and the
    /// bytes it covers.
    pub fn lookup_entry(&self, root: *mut u64, addr: u64) -> Option<(*mut u64, u64)> {
        let mut table = root;
        let mut level = PgtLevel::Pml4;
        loop {
            let idx = level.index(addr);
            // SAFETY: table chain comes from our own pool pages.
            let entry = unsafe { table.add(idx) };
            let cur = unsafe { core::ptr::read_volatile(entry) };
            if !Self::is_present(cur) {
                return None;
            }
            if Self::is_leaf(level, cur) {
                return Some((entry, level.entry_size()));
            }
            table = Self::child_of(cur);
            level = level.next()?;
        }
    }

    /// Visit every present leaf under `root`.
    pub fn walk_leaves(&self, root: *mut u64, mut f: impl FnMut(*mut u64, u64)) {
        self.walk_leaves_level(root, PgtLevel::Pml4, &mut f);
    }

    fn walk_leaves_level(
        &self,
        table: *mut u64,
        level: PgtLevel,
        f: &mut impl FnMut(*mut u64, u64),
    ) {
        for i in 0..PTRS_PER_PTE as usize {
            // SAFETY: table is a live node from our pool (or the root).
            let entry = unsafe { table.add(i) };
            let cur = unsafe { core::ptr::read_volatile(entry) };
            if !Self::is_present(cur) {
                continue;
            }
            if Self::is_leaf(level, cur) {
                f(entry, level.entry_size());
            } else if let Some(next) = level.next() {
                self.walk_leaves_level(Self::child_of(cur), next, f);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::test_pool;

    struct TestPolicy;

    impl PagingPolicy for TestPolicy {
        const DEFAULT_ACCESS_RIGHT: u64 = 0x7;
        const PRESENT_MASK: u64 = 0x7;

        fn large_page_support(level: PgtLevel, _prot: u64) -> bool {
            level == PgtLevel::Pd
        }
    }

    fn engine() -> PageTable<'static, TestPolicy> {
        PageTable::new(test_pool(512))
    }

    #[test]
    fn map_and_lookup_4k() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x5000, 0x1000, 0x3000, 0x3).unwrap();

        let (entry, size) = pt.lookup_entry(root, 0x2000).unwrap();
        assert_eq!(size, PTE_SIZE);
        let val = unsafe { *entry };
        assert_eq!(val & PFN_MASK, 0x6000);
        assert_eq!(val & 0x7, 0x3);
        assert!(pt.lookup_entry(root, 0x4000).is_none());
    }

    #[test]
    fn large_page_used_when_aligned() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x0, 0x20_0000, PDE_SIZE, 0x7).unwrap();

        let (entry, size) = pt.lookup_entry(root, 0x20_0000).unwrap();
        assert_eq!(size, PDE_SIZE);
        assert!(unsafe { *entry } & PAGE_PS != 0);
        // root + pdpt + pd, no pt
        assert_eq!(pt.pool().used(), 3);
    }

    #[test]
    fn identical_add_is_idempotent() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x8000, 0x1000, 0x1000, 0x3).unwrap();
        pt.add_map(root, 0x8000, 0x1000, 0x1000, 0x3).unwrap();
        assert_eq!(
            pt.add_map(root, 0x9000, 0x1000, 0x1000, 0x3),
            Err(PgError::AlreadyMapped)
        );
    }

    #[test]
    fn modify_splits_large_leaf() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x0, 0x20_0000, PDE_SIZE, 0x7).unwrap();

        // Clear the write right on one 4 KiB slice in the middle.
        pt.modify_map(root, 0x20_1000, 0x1000, 0, 0x2).unwrap();

        let (entry, size) = pt.lookup_entry(root, 0x20_1000).unwrap();
        assert_eq!(size, PTE_SIZE);
        assert_eq!(unsafe { *entry } & 0x7, 0x5);
        // Neighbors keep the original rights and target.
        let (n, _) = pt.lookup_entry(root, 0x20_2000).unwrap();
        assert_eq!(unsafe { *n } & 0x7, 0x7);
        assert_eq!(unsafe { *n } & PFN_MASK, 0x2000);
    }

    #[test]
    fn modify_hole_fails() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        assert_eq!(
            pt.modify_map(root, 0x1000, 0x1000, 0x2, 0),
            Err(PgError::NotMapped)
        );
    }

    #[test]
    fn delete_reclaims_interior_nodes() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x4000, 0x1000, 0x2000, 0x7).unwrap();
        let used_mapped = pt.pool().used();
        assert_eq!(used_mapped, 4); // root + pdpt + pd + pt

        pt.del_map(root, 0x1000, 0x2000).unwrap();
        // Everything but the root page goes back to the pool.
        assert_eq!(pt.pool().used(), 1);
        assert!(pt.lookup_entry(root, 0x1000).is_none());
    }

    #[test]
    fn delete_tolerates_holes() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x4000, 0x1000, 0x1000, 0x7).unwrap();
        pt.del_map(root, 0x0, 0x10_0000).unwrap();
        assert!(pt.lookup_entry(root, 0x1000).is_none());
    }

    #[test]
    fn walk_leaves_sees_every_mapping() {
        let pt = engine();
        let root = pt.create_root().unwrap();
        pt.add_map(root, 0x0, 0x0, 0x3000, 0x7).unwrap();
        pt.add_map(root, 0x40_0000, 0x20_0000, PDE_SIZE, 0x7).unwrap();
        let mut count = 0;
        let mut large = 0;
        pt.walk_leaves(root, |_, size| {
            count += 1;
            if size == PDE_SIZE {
                large += 1;
            }
        });
        assert_eq!(count, 4);
        assert_eq!(large, 1);
    }
}
