//! Guest-virtual to guest-physical translation and guest memory copies.
//!
//! The walker handles all four paging modes a guest can be in and applies
//! the architectural access checks: present, write protection against
//! CR0.WP, NX, user/supervisor, large leaves, and the SMAP/SMEP rules for
//! supervisor access to user-mode addresses. Every host-side touch of
//! guest pages is bracketed by `stac`/`clac`.

use partivisor_hal::vmx::{clac, exec_vmread, exec_vmread32, stac};
use partivisor_hal::{GuestPhysAddr, GuestVirtAddr, INVALID_HPA};

use crate::error::HvErr;
use crate::vcpu::Vcpu;
use crate::virtual_cr;
use crate::vm::Vm;

pub const PAGE_SIZE_4K: u64 = 0x1000;

/* page-table entry bits shared by every guest mode */
pub const PAGE_PRESENT: u64 = 1 << 0;
pub const PAGE_RW: u64 = 1 << 1;
pub const PAGE_USER: u64 = 1 << 2;
pub const PAGE_PSE: u64 = 1 << 7;
pub const PAGE_NX: u64 = 1 << 63;

/// Frame bits of an IA-32e paging entry.
pub const IA32E_REF_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/* page-fault error code flags */
pub const PAGE_FAULT_P_FLAG: u32 = 1 << 0;
pub const PAGE_FAULT_WR_FLAG: u32 = 1 << 1;
pub const PAGE_FAULT_US_FLAG: u32 = 1 << 2;
pub const PAGE_FAULT_ID_FLAG: u32 = 1 << 4;

/* PAE PDPTE reserved bits 1..2 and 5..8 */
pub const PAE_PDPTE_FIXED_RESVD_BITS: u64 = 0x0000_0000_0000_01E6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Level0,
    Level2,
    Level3,
    Level4,
}

/// Everything the walker needs, captured from the vCPU up front so the
/// walk itself is a pure function over guest memory.
#[derive(Debug, Clone, Copy)]
pub struct PageWalkInfo {
    pub top_entry: u64,
    pub level: u32,
    /// Index width per level: 9 for PAE/IA-32e, 10 for 32-bit.
    pub width: u32,
    pub is_user_mode_access: bool,
    pub is_write_access: bool,
    pub is_inst_fetch: bool,
    /// CR4.PSE for 32-bit paging; always true for PAE/4-level.
    pub pse: bool,
    pub wp: bool,
    pub nxe: bool,
    pub is_smap_on: bool,
    pub is_smep_on: bool,
    pub rflags_ac: bool,
}

/// gpa → direct-mapped host pointer through the VM's normal-world EPT.
pub fn gpa2hva(vm: &Vm, gpa: GuestPhysAddr) -> Option<*mut u8> {
    let hpa = vm.gpa2hpa(gpa);
    if hpa == INVALID_HPA {
        None
    } else {
        Some(partivisor_hal::hpa2hva(hpa))
    }
}

fn read_guest_entry(vm: &Vm, addr: GuestPhysAddr, width: u32, index: u64) -> Option<u64> {
    let base = gpa2hva(vm, addr)?;
    stac();
    let entry = if width == 10 {
        // SAFETY: base resolves through a live EPT leaf; 32-bit entry.
        unsafe { (base as *const u32).add(index as usize).read_volatile() as u64 }
    } else {
        // SAFETY: as above, 64-bit entry.
        unsafe { (base as *const u64).add(index as usize).read_volatile() }
    };
    clac();
    Some(entry)
}

/// The shared 2/4-level walk (PAE joins at level 2 with its PDPTE as the
/// top entry). On success the translated GPA; on a fault the error code
/// has the architectural flags merged in.
pub fn local_gva2gpa_common(
    vm: &Vm,
    pw: &PageWalkInfo,
    gva: GuestVirtAddr,
    err_code: &mut u32,
) -> Result<GuestPhysAddr, HvErr> {
    if pw.level < 1 {
        return Err(HvErr::Inval);
    }

    let mut addr = pw.top_entry;
    let mut entry = 0u64;
    let mut i = pw.level;
    let mut fault = false;
    let mut shift = 0u32;
    let mut is_user_mode_addr = true;
    let mut is_page_rw_flags_on = true;

    while i != 0 && !fault {
        i -= 1;
        addr &= IA32E_REF_MASK;
        shift = i * pw.width + 12;
        let index = (gva >> shift) & ((1u64 << pw.width) - 1);

        match read_guest_entry(vm, addr, pw.width, index) {
            None => {
                fault = true;
                break;
            }
            Some(e) => entry = e,
        }

        if entry & PAGE_PRESENT == 0 {
            fault = true;
            break;
        }

        // R/W: a write through a read-only entry faults for user mode
        // always, for supervisor mode when CR0.WP is set.
        if entry & PAGE_RW == 0 {
            if pw.is_write_access && (pw.is_user_mode_access || pw.wp) {
                fault = true;
            }
            is_page_rw_flags_on = false;
        }

        // NX is reserved(0) in 32-bit paging; nxe is false there.
        if !fault && pw.is_inst_fetch && pw.nxe && entry & PAGE_NX != 0 {
            fault = true;
        }

        if !fault && entry & PAGE_USER == 0 {
            is_user_mode_addr = false;
            if pw.is_user_mode_access {
                fault = true;
            }
        }

        if !fault && pw.pse && i > 0 && entry & PAGE_PSE != 0 {
            break;
        }
        addr = entry;
    }

    // SMAP constrains supervisor data access to user-mode addresses.
    if !fault && pw.is_smap_on && !pw.is_user_mode_access && is_user_mode_addr {
        if !pw.is_write_access && !pw.rflags_ac {
            fault = true;
        } else if pw.is_write_access {
            if !pw.wp && !pw.rflags_ac {
                fault = true;
            }
            if pw.wp && pw.rflags_ac && !is_page_rw_flags_on {
                fault = true;
            }
            if pw.wp && !pw.rflags_ac {
                fault = true;
            }
        }
    }

    // SMEP forbids supervisor fetch from user-mode addresses outright.
    if !fault && pw.is_smep_on && !pw.is_user_mode_access && is_user_mode_addr
        && pw.is_inst_fetch
    {
        fault = true;
    }

    if fault {
        *err_code |= PAGE_FAULT_P_FLAG;
        if pw.is_user_mode_access {
            *err_code |= PAGE_FAULT_US_FLAG;
        }
        return Err(HvErr::Fault);
    }

    let page_size = 1u64 << shift;
    let frame = (entry & IA32E_REF_MASK) & !(page_size - 1);
    Ok(frame | (gva & (page_size - 1)))
}

/// PAE mode: fetch the PDPTE from the register-cached table, then walk the
/// remaining two levels.
fn local_gva2gpa_pae(
    vm: &Vm,
    pw: &mut PageWalkInfo,
    gva: GuestVirtAddr,
    err_code: &mut u32,
) -> Result<GuestPhysAddr, HvErr> {
    let pdpt_addr = get_pae_pdpt_addr(pw.top_entry);
    let index = (gva >> 30) & 0x3;
    let entry =
        read_guest_entry(vm, pdpt_addr, 9, index).ok_or(HvErr::Fault)?;
    if entry & PAGE_PRESENT == 0 {
        *err_code |= PAGE_FAULT_P_FLAG;
        return Err(HvErr::Fault);
    }
    pw.level = 2;
    pw.top_entry = entry;
    local_gva2gpa_common(vm, pw, gva, err_code)
}

/// CR3 bits 5..31 locate the PAE PDPT.
pub fn get_pae_pdpt_addr(cr3: u64) -> u64 {
    cr3 & 0xFFFF_FFE0
}

/// Paging mode the vCPU currently runs in.
pub fn get_vcpu_paging_mode(vcpu: &mut Vcpu) -> PagingMode {
    if !virtual_cr::is_paging_enabled(vcpu) {
        PagingMode::Level0
    } else if virtual_cr::is_pae(vcpu) {
        if virtual_cr::is_long_mode(vcpu) {
            PagingMode::Level4
        } else {
            PagingMode::Level3
        }
    } else {
        PagingMode::Level2
    }
}

/// Translate one guest-virtual address in the vCPU's current context.
///
/// The caller seeds `err_code` with the access flags (WR for writes, ID
/// for instruction fetch); on fault the remaining flags are merged and the
/// caller decides whether to inject #PF.
pub fn gva2gpa(
    vcpu: &mut Vcpu,
    vm: &Vm,
    gva: GuestVirtAddr,
    err_code: &mut u32,
) -> Result<GuestPhysAddr, HvErr> {
    let mode = get_vcpu_paging_mode(vcpu);
    if mode == PagingMode::Level0 {
        return Ok(gva);
    }

    // The DPL of SS is the only reliably-defined privilege source when a
    // segment is unusable.
    // SAFETY: on the owning pCPU with the vCPU's VMCS current.
    let ss_attr = unsafe { exec_vmread32(partivisor_hal::vmx::VMX_GUEST_SS_ATTR) };
    let cpl = (ss_attr >> 5) & 0x3;

    let mut pw = PageWalkInfo {
        top_entry: unsafe { exec_vmread(partivisor_hal::vmx::VMX_GUEST_CR3) },
        level: 4,
        width: 9,
        is_user_mode_access: cpl == 3,
        is_write_access: *err_code & PAGE_FAULT_WR_FLAG != 0,
        is_inst_fetch: *err_code & PAGE_FAULT_ID_FLAG != 0,
        pse: true,
        wp: virtual_cr::guest_cr0(vcpu) & virtual_cr::CR0_WP != 0,
        nxe: vcpu.get_efer() & partivisor_hal::msr::MSR_IA32_EFER_NXE_BIT != 0,
        is_smap_on: virtual_cr::guest_cr4(vcpu) & virtual_cr::CR4_SMAP != 0,
        is_smep_on: virtual_cr::guest_cr4(vcpu) & virtual_cr::CR4_SMEP != 0,
        rflags_ac: vcpu.get_rflags() & (1 << 18) != 0,
    };
    *err_code &= !PAGE_FAULT_P_FLAG;

    match mode {
        PagingMode::Level4 => local_gva2gpa_common(vm, &pw, gva, err_code),
        PagingMode::Level3 => local_gva2gpa_pae(vm, &mut pw, gva, err_code),
        PagingMode::Level2 => {
            pw.width = 10;
            pw.level = 2;
            pw.pse = virtual_cr::guest_cr4(vcpu) & virtual_cr::CR4_PSE != 0;
            pw.nxe = false;
            local_gva2gpa_common(vm, &pw, gva, err_code)
        }
        PagingMode::Level0 => unreachable!(),
    }
}

fn local_copy_gpa(
    vm: &Vm,
    h_ptr: *mut u8,
    gpa: GuestPhysAddr,
    size: u64,
    fix_pg_size: u64,
    cp_from_vm: bool,
) -> u64 {
    let Some((hpa, mut pg_size)) = vm.local_gpa2hpa(gpa) else {
        crate::pr_err!("vm{}: gpa {:#x} is unmapped", vm.vm_id, gpa);
        return 0;
    };
    if fix_pg_size != 0 {
        pg_size = fix_pg_size;
    }
    let off = gpa & (pg_size - 1);
    let len = size.min(pg_size - off);
    let g_ptr = partivisor_hal::hpa2hva(hpa);

    stac();
    // SAFETY: g_ptr resolves through a live EPT leaf covering `len` bytes;
    // h_ptr is a hypervisor buffer supplied by the caller.
    unsafe {
        if cp_from_vm {
            core::ptr::copy_nonoverlapping(g_ptr, h_ptr, len as usize);
        } else {
            core::ptr::copy_nonoverlapping(h_ptr, g_ptr, len as usize);
        }
    }
    clac();
    len
}

fn copy_gpa(
    vm: &Vm,
    mut h_ptr: *mut u8,
    mut gpa: GuestPhysAddr,
    mut size: u64,
    cp_from_vm: bool,
) -> Result<(), HvErr> {
    while size > 0 {
        let len = local_copy_gpa(vm, h_ptr, gpa, size, 0, cp_from_vm);
        if len == 0 {
            return Err(HvErr::Inval);
        }
        gpa += len;
        // SAFETY: len <= remaining buffer size by construction.
        h_ptr = unsafe { h_ptr.add(len as usize) };
        size -= len;
    }
    Ok(())
}

/// Copy guest-physical memory into a hypervisor buffer. The GPA range must
/// be contiguous (hypercall-parameter contract).
pub fn copy_from_gpa(vm: &Vm, dst: &mut [u8], gpa: GuestPhysAddr) -> Result<(), HvErr> {
    copy_gpa(vm, dst.as_mut_ptr(), gpa, dst.len() as u64, true)
}

/// Copy a hypervisor buffer into guest-physical memory.
pub fn copy_to_gpa(vm: &Vm, src: &[u8], gpa: GuestPhysAddr) -> Result<(), HvErr> {
    copy_gpa(vm, src.as_ptr() as *mut u8, gpa, src.len() as u64, false)
}

fn copy_gva(
    vcpu: &mut Vcpu,
    vm: &Vm,
    h_ptr: *mut u8,
    mut gva: GuestVirtAddr,
    mut size: u64,
    err_code: &mut u32,
    fault_addr: &mut u64,
    cp_from_vm: bool,
) -> Result<(), HvErr> {
    let mut ptr = h_ptr;
    while size > 0 {
        let gpa = match gva2gpa(vcpu, vm, gva, err_code) {
            Ok(gpa) => gpa,
            Err(e) => {
                *fault_addr = gva;
                crate::pr_err!("gva2gpa failed, err_code {:#x}", *err_code);
                return Err(e);
            }
        };
        let len = local_copy_gpa(vm, ptr, gpa, size, PAGE_SIZE_4K, cp_from_vm);
        if len == 0 {
            return Err(HvErr::Inval);
        }
        gva += len;
        // SAFETY: len bounded by remaining size.
        ptr = unsafe { ptr.add(len as usize) };
        size -= len;
    }
    Ok(())
}

/// Copy guest-virtual memory into a hypervisor buffer, walking each page.
pub fn copy_from_gva(
    vcpu: &mut Vcpu,
    vm: &Vm,
    dst: &mut [u8],
    gva: GuestVirtAddr,
    err_code: &mut u32,
    fault_addr: &mut u64,
) -> Result<(), HvErr> {
    copy_gva(
        vcpu,
        vm,
        dst.as_mut_ptr(),
        gva,
        dst.len() as u64,
        err_code,
        fault_addr,
        true,
    )
}

/// Copy a hypervisor buffer into guest-virtual memory.
pub fn copy_to_gva(
    vcpu: &mut Vcpu,
    vm: &Vm,
    src: &[u8],
    gva: GuestVirtAddr,
    err_code: &mut u32,
    fault_addr: &mut u64,
) -> Result<(), HvErr> {
    *err_code |= PAGE_FAULT_WR_FLAG;
    copy_gva(
        vcpu,
        vm,
        src.as_ptr() as *mut u8,
        gva,
        src.len() as u64,
        err_code,
        fault_addr,
        false,
    )
}

/// Validate and load the four PAE PDPTEs at a paging-mode transition.
/// Returns the entries for the VMCS PDPTE fields.
pub fn load_pdptrs(vcpu: &mut Vcpu, vm: &Vm, guest_cr3: u64) -> Result<[u64; 4], HvErr> {
    let _ = vcpu;
    let mut raw = [0u8; 32];
    copy_from_gpa(vm, &mut raw, get_pae_pdpt_addr(guest_cr3)).map_err(|_| HvErr::Fault)?;

    let phys_bits = partivisor_hal::cpu_caps::cpu_caps().phys_bits;
    let maxphy = if phys_bits == 0 { 52 } else { phys_bits as u32 };
    let mut rsvd = PAE_PDPTE_FIXED_RESVD_BITS;
    if maxphy < 64 {
        rsvd |= !((1u64 << maxphy) - 1);
    }

    let mut pdpte = [0u64; 4];
    for (i, chunk) in raw.chunks_exact(8).enumerate() {
        let e = u64::from_le_bytes(chunk.try_into().unwrap());
        if e & PAGE_PRESENT != 0 && e & rsvd != 0 {
            return Err(HvErr::Fault);
        }
        pdpte[i] = e;
    }
    Ok(pdpte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::{EPT_RWX, EPT_WB};
    use crate::vm::tests::fixture_vm;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    /// A chunk of "guest RAM" mapped 1:1 into a fixture VM's EPT at `gpa`.
    fn guest_ram(vm: &Arc<crate::vm::Vm>, gpa: u64, pages: usize) -> &'static mut [u8] {
        let buf: Box<[u8]> = alloc::vec![0u8; pages * 4096].into_boxed_slice();
        let buf = Box::leak(buf);
        // The buffer is page-sized but not necessarily page-aligned; align
        // the window we actually map.
        let addr = buf.as_ptr() as u64;
        let aligned = (addr + 0xFFF) & !0xFFF;
        let usable = unsafe {
            core::slice::from_raw_parts_mut(aligned as *mut u8, (pages - 1) * 4096)
        };
        vm.ept_add_mr(aligned, gpa, ((pages - 1) * 4096) as u64, EPT_RWX | EPT_WB)
            .unwrap();
        usable
    }

    fn walk_info(top: u64) -> PageWalkInfo {
        PageWalkInfo {
            top_entry: top,
            level: 4,
            width: 9,
            is_user_mode_access: false,
            is_write_access: false,
            is_inst_fetch: false,
            pse: true,
            wp: true,
            nxe: true,
            is_smap_on: false,
            is_smep_on: false,
            rflags_ac: false,
        }
    }

    /// Build a tiny 4-level guest page table inside fixture guest RAM.
    /// Layout in the 8-page RAM window at gpa 0x10000:
    ///   page0 pml4, page1 pdpt, page2 pd, page3 pt, page4 data.
    fn build_guest_tables(ram: &mut [u8], base_gpa: u64, leaf_flags: u64) -> u64 {
        let entry = |page: u64, flags: u64| (base_gpa + page * 4096) | flags;
        let put = |ram: &mut [u8], page: usize, idx: usize, val: u64| {
            let off = page * 4096 + idx * 8;
            ram[off..off + 8].copy_from_slice(&val.to_le_bytes());
        };
        // gva 0x40201000 -> pml4[0], pdpt[1], pd[1], pt[1]
        put(ram, 0, 0, entry(1, PAGE_PRESENT | PAGE_RW | PAGE_USER));
        put(ram, 1, 1, entry(2, PAGE_PRESENT | PAGE_RW | PAGE_USER));
        put(ram, 2, 1, entry(3, PAGE_PRESENT | PAGE_RW | PAGE_USER));
        put(ram, 3, 1, entry(4, leaf_flags));
        base_gpa
    }

    const GVA: u64 = 0x4020_1000;

    #[test]
    fn four_level_walk_translates() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let cr3 = build_guest_tables(ram, 0x10000, PAGE_PRESENT | PAGE_RW | PAGE_USER);

        let pw = walk_info(cr3);
        let mut err = 0u32;
        let gpa = local_gva2gpa_common(&vm, &pw, GVA + 0x123, &mut err).unwrap();
        assert_eq!(gpa, 0x10000 + 4 * 4096 + 0x123);
    }

    #[test]
    fn not_present_faults_with_p_flag_clear_in_input() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let cr3 = build_guest_tables(ram, 0x10000, 0 /* not present */);

        let pw = walk_info(cr3);
        let mut err = 0u32;
        assert_eq!(
            local_gva2gpa_common(&vm, &pw, GVA, &mut err),
            Err(HvErr::Fault)
        );
        assert!(err & PAGE_FAULT_P_FLAG != 0);
    }

    #[test]
    fn write_to_readonly_respects_wp_and_cpl() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let cr3 = build_guest_tables(ram, 0x10000, PAGE_PRESENT | PAGE_USER);

        // Supervisor write with WP=1: fault.
        let mut pw = walk_info(cr3);
        pw.is_write_access = true;
        let mut err = PAGE_FAULT_WR_FLAG;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_err());

        // Supervisor write with WP=0: allowed.
        pw.wp = false;
        let mut err = PAGE_FAULT_WR_FLAG;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_ok());

        // User write: always faults on RO page, and US flag is reported.
        pw.is_user_mode_access = true;
        let mut err = PAGE_FAULT_WR_FLAG;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_err());
        assert!(err & PAGE_FAULT_US_FLAG != 0);
    }

    #[test]
    fn nx_blocks_instruction_fetch() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let cr3 = build_guest_tables(
            ram,
            0x10000,
            PAGE_PRESENT | PAGE_RW | PAGE_USER | PAGE_NX,
        );

        let mut pw = walk_info(cr3);
        pw.is_inst_fetch = true;
        let mut err = PAGE_FAULT_ID_FLAG;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_err());

        // With EFER.NXE clear the bit is ignored.
        pw.nxe = false;
        let mut err = PAGE_FAULT_ID_FLAG;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_ok());
    }

    #[test]
    fn supervisor_access_to_supervisor_page_from_user_faults() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        // U/S clear on the leaf.
        let cr3 = build_guest_tables(ram, 0x10000, PAGE_PRESENT | PAGE_RW);

        let mut pw = walk_info(cr3);
        pw.is_user_mode_access = true;
        let mut err = 0;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_err());
    }

    #[test]
    fn smep_blocks_supervisor_fetch_from_user_page() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let cr3 = build_guest_tables(ram, 0x10000, PAGE_PRESENT | PAGE_RW | PAGE_USER);

        let mut pw = walk_info(cr3);
        pw.is_smep_on = true;
        pw.is_inst_fetch = true;
        let mut err = PAGE_FAULT_ID_FLAG;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_err());
    }

    #[test]
    fn smap_read_requires_ac() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let cr3 = build_guest_tables(ram, 0x10000, PAGE_PRESENT | PAGE_RW | PAGE_USER);

        let mut pw = walk_info(cr3);
        pw.is_smap_on = true;
        let mut err = 0;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_err());

        pw.rflags_ac = true;
        let mut err = 0;
        assert!(local_gva2gpa_common(&vm, &pw, GVA, &mut err).is_ok());
    }

    #[test]
    fn large_page_leaf_composes_offset() {
        let vm = fixture_vm(1);
        let ram = guest_ram(&vm, 0x10000, 9);
        let entry = |page: u64, flags: u64| (0x10000 + page * 4096) | flags;
        let put = |ram: &mut [u8], page: usize, idx: usize, val: u64| {
            let off = page * 4096 + idx * 8;
            ram[off..off + 8].copy_from_slice(&val.to_le_bytes());
        };
        put(ram, 0, 0, entry(1, PAGE_PRESENT | PAGE_RW));
        put(ram, 1, 1, entry(2, PAGE_PRESENT | PAGE_RW));
        // 2 MiB leaf at pd[1]: frame 0x40_0000.
        put(
            ram,
            2,
            1,
            0x40_0000 | PAGE_PRESENT | PAGE_RW | PAGE_PSE,
        );

        let pw = walk_info(0x10000);
        let mut err = 0;
        let gpa = local_gva2gpa_common(&vm, &pw, 0x4020_1234, &mut err).unwrap();
        assert_eq!(gpa, 0x40_0000 + 0x1234);
    }

    #[test]
    fn gpa_copies_round_trip_across_pages() {
        let vm = fixture_vm(1);
        let _ram = guest_ram(&vm, 0x10000, 9);

        let pattern: alloc::vec::Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
        copy_to_gpa(&vm, &pattern, 0x10800).unwrap();
        let mut readback = alloc::vec![0u8; 6000];
        copy_from_gpa(&vm, &mut readback, 0x10800).unwrap();
        assert_eq!(pattern, readback);
    }

    #[test]
    fn gpa_copy_to_hole_fails() {
        let vm = fixture_vm(1);
        let mut buf = [0u8; 16];
        assert_eq!(
            copy_from_gpa(&vm, &mut buf, 0xDEAD_0000),
            Err(HvErr::Inval)
        );
    }

    #[test]
    fn pae_pdpt_address_masks_low_bits() {
        assert_eq!(get_pae_pdpt_addr(0xBEEF_F01F), 0xBEEF_F000);
    }
}
