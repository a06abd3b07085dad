//! Property checks over the page-table engine used for both the host MMU
//! and EPT.

use proptest::prelude::*;

use partivisor_hal::page::{Page, PagePool};
use partivisor_hal::pgtable::{PageTable, PagingPolicy, PgtLevel, PFN_MASK};

struct RwxPolicy;

impl PagingPolicy for RwxPolicy {
    const DEFAULT_ACCESS_RIGHT: u64 = 0x7;
    const PRESENT_MASK: u64 = 0x7;

    fn large_page_support(level: PgtLevel, _prot: u64) -> bool {
        level == PgtLevel::Pd
    }
}

fn engine() -> PageTable<'static, RwxPolicy> {
    let npages = 256;
    let mem: Box<[Page]> = (0..npages).map(|_| Page::zeroed()).collect();
    let base = Box::leak(mem).as_mut_ptr();
    // SAFETY: leaked, exclusively owned region.
    let pool = Box::leak(Box::new(unsafe { PagePool::new(base, npages) }));
    PageTable::new(pool)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every page of a mapping translates to its stepped physical frame.
    #[test]
    fn mapped_range_translates_linearly(
        va_page in 0u64..1024,
        pa_page in 0u64..1024,
        pages in 1u64..16,
    ) {
        let pt = engine();
        let root = pt.create_root().unwrap();
        let va = va_page * 0x1000;
        let pa = pa_page * 0x1000;
        pt.add_map(root, pa, va, pages * 0x1000, 0x3).unwrap();

        for i in 0..pages {
            let (entry, size) = pt.lookup_entry(root, va + i * 0x1000).unwrap();
            prop_assert_eq!(size, 0x1000);
            let value = unsafe { core::ptr::read_volatile(entry) };
            prop_assert_eq!(value & PFN_MASK, pa + i * 0x1000);
        }
    }

    /// Deleting a mapping returns every interior node to the pool.
    #[test]
    fn delete_returns_all_interior_nodes(
        va_page in 0u64..1024,
        pages in 1u64..16,
    ) {
        let pt = engine();
        let root = pt.create_root().unwrap();
        let va = va_page * 0x1000;
        pt.add_map(root, 0x40_0000, va, pages * 0x1000, 0x7).unwrap();
        pt.del_map(root, va, pages * 0x1000).unwrap();
        // Only the root page stays allocated.
        prop_assert_eq!(pt.pool().used(), 1);
        prop_assert!(pt.lookup_entry(root, va).is_none());
    }
}
