//! Property checks over the engine's pure contracts: the CR0/CR4 bit-class
//! partition and EPT mapping idempotence.

use proptest::prelude::*;

use partivisor_core::ept::{Ept, EPT_RWX, EPT_WB};
use partivisor_core::virtual_cr::CrPolicy;
use partivisor_hal::page::{Page, PagePool};

fn arbitrary_policy(cr0_f0: u64, cr4_f0: u64) -> CrPolicy {
    CrPolicy::from_fixed(cr0_f0, 0xFFFF_FFFF, cr4_f0 | (1 << 13), 0x003F_FFFF)
}

proptest! {
    /// Whatever the guest writes, the effective CR0 always satisfies the
    /// reserved-bit contract the guest can observe.
    #[test]
    fn effective_cr0_keeps_reserved_contract(
        guest_value in any::<u64>(),
        cr0_f0 in any::<u32>(),
    ) {
        let p = arbitrary_policy(cr0_f0 as u64, 0);
        let effective = (guest_value & !p.cr0_reserved_bits_mask)
            | p.cr0_rsv_bits_guest_value;
        prop_assert!(p.is_valid_cr0(effective));
    }

    /// The three writable classes never overlap the reserved class.
    #[test]
    fn cr4_classes_are_disjoint(cr4_f0 in any::<u32>()) {
        let p = arbitrary_policy(0, cr4_f0 as u64);
        prop_assert_eq!(p.cr4_passthru_mask & p.cr4_reserved_bits_mask, 0);
        prop_assert_eq!(p.cr4_trap_and_passthru_mask & p.cr4_reserved_bits_mask, 0);
        prop_assert_eq!(p.cr4_passthru_mask & p.cr4_trap_and_passthru_mask, 0);
    }

    /// A reserved-violating CR4 write is never accepted.
    #[test]
    fn cr4_reserved_violations_rejected(value in any::<u64>()) {
        let p = arbitrary_policy(0, 0);
        if value & p.cr4_reserved_bits_mask != p.cr4_rsv_bits_guest_value {
            prop_assert!(!p.is_valid_cr4(value));
        }
    }
}

fn fresh_ept() -> Ept {
    let npages = 256;
    let mem: Box<[Page]> = (0..npages).map(|_| Page::zeroed()).collect();
    let base = Box::leak(mem).as_mut_ptr();
    // SAFETY: leaked, exclusively owned region.
    let pool = Box::leak(Box::new(unsafe { PagePool::new(base, npages) }));
    Ept::new(pool).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// ept_add_mr applied twice with identical arguments equals once.
    #[test]
    fn ept_add_is_idempotent(
        gpa_page in 0u64..512,
        hpa_page in 0u64..512,
        pages in 1u64..8,
    ) {
        let ept = fresh_ept();
        let gpa = gpa_page * 0x1000;
        let hpa = 0x100_0000 + hpa_page * 0x1000;
        let size = pages * 0x1000;

        ept.add_mr(hpa, gpa, size, EPT_RWX | EPT_WB).unwrap();
        let before: Vec<u64> = (0..pages).map(|i| ept.gpa2hpa(gpa + i * 0x1000)).collect();
        ept.add_mr(hpa, gpa, size, EPT_RWX | EPT_WB).unwrap();
        let after: Vec<u64> = (0..pages).map(|i| ept.gpa2hpa(gpa + i * 0x1000)).collect();
        prop_assert_eq!(before, after);
    }

    /// Delete removes exactly the requested range.
    #[test]
    fn ept_delete_is_precise(pages in 2u64..8, hole in 0u64..8) {
        let ept = fresh_ept();
        let hole = hole % pages;
        ept.add_mr(0x200_0000, 0, pages * 0x1000, EPT_RWX | EPT_WB).unwrap();
        ept.del_mr(hole * 0x1000, 0x1000).unwrap();
        for i in 0..pages {
            let hpa = ept.gpa2hpa(i * 0x1000);
            if i == hole {
                prop_assert_eq!(hpa, partivisor_hal::INVALID_HPA);
            } else {
                prop_assert_eq!(hpa, 0x200_0000 + i * 0x1000);
            }
        }
    }
}
