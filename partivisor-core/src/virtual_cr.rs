//! Virtual CR0/CR4.
//!
//! Every bit of the two control registers falls into exactly one class,
//! fixed at init from the VMX fixed-bit MSRs:
//!
//! * passthru — guest writes land in the hardware register, no exit;
//! * trap-and-passthru — we emulate the side effects (paging mode, cache
//!   disable, PDPTE reload) and then write the effective value through;
//! * trap-and-emulate — only the read shadow changes;
//! * emulated-reserved — a guest write injects #GP.
//!
//! The guest-host masks are the complement of the passthru class, so
//! exactly the non-passthru bits exit.

use alloc::boxed::Box;

use once_cell::race::OnceBox;

use partivisor_hal::msr::{MSR_IA32_EFER_LMA_BIT, MSR_IA32_EFER_LME_BIT, PAT_ALL_UC_VALUE};
use partivisor_hal::vmx::{
    exec_vmread32, exec_vmwrite, exec_vmwrite32, VMX_CR0_GUEST_HOST_MASK,
    VMX_CR0_READ_SHADOW, VMX_CR4_GUEST_HOST_MASK, VMX_CR4_READ_SHADOW,
    VMX_ENTRY_CONTROLS, VMX_ENTRY_CTLS_IA32E_MODE, VMX_GUEST_CR0, VMX_GUEST_CR3,
    VMX_GUEST_CR4, VMX_GUEST_IA32_PAT_FULL, VMX_GUEST_PDPTE0_FULL, VMX_GUEST_PDPTE1_FULL,
    VMX_GUEST_PDPTE2_FULL, VMX_GUEST_PDPTE3_FULL,
};
use partivisor_hal::{cpu_caps, vmx};

use crate::guest_memory;
use crate::vcpu::{CpuReg, Vcpu};
use crate::virq::{self, REQ_EPT_FLUSH};
use crate::vmsr;

/* CR0 bits */
pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;
pub const CR0_PG: u64 = 1 << 31;

/* CR4 bits */
pub const CR4_VME: u64 = 1 << 0;
pub const CR4_PVI: u64 = 1 << 1;
pub const CR4_TSD: u64 = 1 << 2;
pub const CR4_DE: u64 = 1 << 3;
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_MCE: u64 = 1 << 6;
pub const CR4_PGE: u64 = 1 << 7;
pub const CR4_PCE: u64 = 1 << 8;
pub const CR4_OSFXSR: u64 = 1 << 9;
pub const CR4_OSXMMEXCPT: u64 = 1 << 10;
pub const CR4_UMIP: u64 = 1 << 11;
pub const CR4_LA57: u64 = 1 << 12;
pub const CR4_VMXE: u64 = 1 << 13;
pub const CR4_SMXE: u64 = 1 << 14;
pub const CR4_FSGSBASE: u64 = 1 << 16;
pub const CR4_PCIDE: u64 = 1 << 17;
pub const CR4_OSXSAVE: u64 = 1 << 18;
pub const CR4_KL: u64 = 1 << 19;
pub const CR4_SMEP: u64 = 1 << 20;
pub const CR4_SMAP: u64 = 1 << 21;
pub const CR4_PKE: u64 = 1 << 22;
pub const CR4_CET: u64 = 1 << 23;
pub const CR4_PKS: u64 = 1 << 24;

const CR0_PASSTHRU_BITS: u64 = CR0_MP | CR0_EM | CR0_TS | CR0_ET | CR0_NE | CR0_AM;
const CR0_TRAP_AND_PASSTHRU_BITS: u64 = CR0_PE | CR0_PG | CR0_WP;
const CR0_TRAP_AND_EMULATE_BITS: u64 = CR0_CD | CR0_NW;

const CR4_PASSTHRU_BITS: u64 = CR4_VME
    | CR4_PVI
    | CR4_TSD
    | CR4_DE
    | CR4_PGE
    | CR4_PCE
    | CR4_OSFXSR
    | CR4_PCIDE
    | CR4_OSXSAVE
    | CR4_FSGSBASE
    | CR4_OSXMMEXCPT
    | CR4_UMIP
    | CR4_LA57;
const CR4_TRAP_AND_PASSTHRU_BITS: u64 =
    CR4_PSE | CR4_PAE | CR4_SMEP | CR4_SMAP | CR4_PKE | CR4_PKS | CR4_KL;
const CR4_TRAP_AND_EMULATE_BITS: u64 = CR4_MCE;
const CR4_EMULATED_RESERVE_BITS: u64 = CR4_VMXE | CR4_CET | CR4_SMXE;
/// The physical value the emulated-reserved CR4 bits keep.
const CR4_EMRSV_BITS_PHYS_VALUE: u64 = CR4_VMXE;

/// A change of any of these bits invalidates combined mappings.
const CR0_EPT_FLUSH_BITS: u64 = CR0_PG | CR0_WP | CR0_CD;
const CR4_EPT_FLUSH_BITS: u64 =
    CR4_PAE | CR4_SMEP | CR4_SMAP | CR4_PKE | CR4_PKS | CR4_KL;

/// The bit-class partition, computed once from the fixed-bit MSRs.
#[derive(Debug, Clone, Copy)]
pub struct CrPolicy {
    pub cr0_passthru_mask: u64,
    pub cr0_trap_and_passthru_mask: u64,
    pub cr0_reserved_bits_mask: u64,
    pub cr0_rsv_bits_guest_value: u64,
    pub initial_guest_cr0: u64,
    pub cr4_passthru_mask: u64,
    pub cr4_trap_and_passthru_mask: u64,
    pub cr4_reserved_bits_mask: u64,
    pub cr4_rsv_bits_guest_value: u64,
    pub initial_guest_cr4: u64,
}

static_assertions::const_assert_eq!(
    (CR0_PASSTHRU_BITS ^ CR0_TRAP_AND_PASSTHRU_BITS) ^ CR0_TRAP_AND_EMULATE_BITS,
    CR0_PASSTHRU_BITS | CR0_TRAP_AND_PASSTHRU_BITS | CR0_TRAP_AND_EMULATE_BITS
);
static_assertions::const_assert_eq!(
    (CR4_PASSTHRU_BITS ^ CR4_TRAP_AND_PASSTHRU_BITS) ^ CR4_TRAP_AND_EMULATE_BITS,
    CR4_PASSTHRU_BITS | CR4_TRAP_AND_PASSTHRU_BITS | CR4_TRAP_AND_EMULATE_BITS
);

impl CrPolicy {
    /// Derive the partition from the four VMX fixed-bit MSR values.
    pub fn from_fixed(
        cr0_fixed0: u64,
        cr0_fixed1: u64,
        cr4_fixed0: u64,
        cr4_fixed1: u64,
    ) -> Self {
        // Flexible bits may be either value under VMX.
        let mut cr0_flexible = cr0_fixed0 ^ cr0_fixed1;
        // Hardware reports PE/PG fixed but unrestricted guests may clear
        // them; treat both as flexible.
        cr0_flexible |= CR0_PE | CR0_PG;
        let cr0_passthru_mask = CR0_PASSTHRU_BITS & cr0_flexible;
        let cr0_trap_and_passthru_mask = CR0_TRAP_AND_PASSTHRU_BITS & cr0_flexible;
        let cr0_reserved_bits_mask =
            !(cr0_passthru_mask | cr0_trap_and_passthru_mask | CR0_TRAP_AND_EMULATE_BITS);
        let cr0_rsv_bits_guest_value = cr0_fixed0 & !cr0_flexible;

        let cr4_flexible = cr4_fixed0 ^ cr4_fixed1;
        let cr4_passthru_mask = CR4_PASSTHRU_BITS & cr4_flexible;
        let cr4_trap_and_passthru_mask = CR4_TRAP_AND_PASSTHRU_BITS & cr4_flexible;
        let cr4_reserved_bits_mask =
            !(cr4_passthru_mask | cr4_trap_and_passthru_mask | CR4_TRAP_AND_EMULATE_BITS);
        let cr4_always_on = cr4_fixed0 & !cr4_flexible;
        let initial_guest_cr4 =
            (cr4_always_on & !CR4_EMULATED_RESERVE_BITS) | CR4_EMRSV_BITS_PHYS_VALUE;
        let cr4_rsv_bits_guest_value = cr4_always_on & !CR4_EMULATED_RESERVE_BITS;

        CrPolicy {
            cr0_passthru_mask,
            cr0_trap_and_passthru_mask,
            cr0_reserved_bits_mask,
            cr0_rsv_bits_guest_value,
            initial_guest_cr0: cr0_rsv_bits_guest_value,
            cr4_passthru_mask,
            cr4_trap_and_passthru_mask,
            cr4_reserved_bits_mask,
            cr4_rsv_bits_guest_value,
            initial_guest_cr4,
        }
    }

    pub fn is_valid_cr0(&self, cr0: u64) -> bool {
        (cr0 & self.cr0_reserved_bits_mask) == self.cr0_rsv_bits_guest_value
    }

    pub fn is_valid_cr4(&self, cr4: u64) -> bool {
        (cr4 & self.cr4_reserved_bits_mask) == self.cr4_rsv_bits_guest_value
    }

    /// The architectural #GP conditions on a CR0 write.
    pub fn is_cr0_write_valid(&self, cr0: u64, cur_cr4: u64, efer: u64) -> bool {
        // High half is reserved: setting any of it faults.
        if cr0 >> 32 != 0 {
            return false;
        }
        // Paging on without PAE in long mode is illegal.
        if cr0 & CR0_PG != 0 && cur_cr4 & CR4_PAE == 0 && efer & MSR_IA32_EFER_LME_BIT != 0
        {
            return false;
        }
        if cr0 & CR0_PE == 0 && cr0 & CR0_PG != 0 {
            return false;
        }
        if cr0 & CR0_CD == 0 && cr0 & CR0_NW != 0 {
            return false;
        }
        // Clearing PG while PCIDs are live faults.
        if cr0 & CR0_PG == 0 && cur_cr4 & CR4_PCIDE != 0 {
            return false;
        }
        true
    }

    /// The architectural #GP conditions on a CR4 write (the PCIDE 0→1 and
    /// PDPTE checks need live state and stay in the write path).
    pub fn is_cr4_write_valid(&self, cr4: u64, long_mode: bool) -> bool {
        if !self.is_valid_cr4(cr4) {
            return false;
        }
        if long_mode && cr4 & CR4_PAE == 0 {
            return false;
        }
        true
    }
}

static CR_POLICY: OnceBox<CrPolicy> = OnceBox::new();

/// Fix the bit classes from the probed capability table. BSP, once.
pub fn init_cr0_cr4_flexible_bits() {
    let caps = cpu_caps::cpu_caps();
    CR_POLICY.get_or_init(|| {
        Box::new(CrPolicy::from_fixed(
            caps.vmx.cr0_fixed0,
            caps.vmx.cr0_fixed1,
            caps.vmx.cr4_fixed0,
            caps.vmx.cr4_fixed1,
        ))
    });
}

pub fn policy() -> &'static CrPolicy {
    CR_POLICY.get_or_init(|| Box::new(CrPolicy::from_fixed(0, 0, 0, 0)))
}

/// Program the guest-host masks: everything but passthru bits traps.
///
/// Runs on the owning pCPU with the vCPU's VMCS current.
pub fn init_cr0_cr4_host_guest_mask() {
    let p = policy();
    // SAFETY: VMCS current per the function contract.
    unsafe {
        exec_vmwrite(VMX_CR0_GUEST_HOST_MASK, !p.cr0_passthru_mask);
        exec_vmwrite(VMX_CR4_GUEST_HOST_MASK, !p.cr4_passthru_mask);
    }
}

/// Guest-visible CR0: read shadow for trapped bits, hardware for passthru.
pub fn guest_cr0(vcpu: &mut Vcpu) -> u64 {
    let p = policy();
    vcpu.cached_read_with(CpuReg::Cr0, || {
        // SAFETY: owning pCPU, VMCS current.
        unsafe {
            (partivisor_hal::vmx::exec_vmread(VMX_CR0_READ_SHADOW) & !p.cr0_passthru_mask)
                | (partivisor_hal::vmx::exec_vmread(VMX_GUEST_CR0) & p.cr0_passthru_mask)
        }
    })
}

pub fn guest_cr4(vcpu: &mut Vcpu) -> u64 {
    let p = policy();
    vcpu.cached_read_with(CpuReg::Cr4, || {
        // SAFETY: owning pCPU, VMCS current.
        unsafe {
            (partivisor_hal::vmx::exec_vmread(VMX_CR4_READ_SHADOW) & !p.cr4_passthru_mask)
                | (partivisor_hal::vmx::exec_vmread(VMX_GUEST_CR4) & p.cr4_passthru_mask)
        }
    })
}

pub fn is_paging_enabled(vcpu: &mut Vcpu) -> bool {
    guest_cr0(vcpu) & CR0_PG != 0
}

pub fn is_pae(vcpu: &mut Vcpu) -> bool {
    guest_cr4(vcpu) & CR4_PAE != 0
}

pub fn is_long_mode(vcpu: &mut Vcpu) -> bool {
    vcpu.get_efer() & MSR_IA32_EFER_LMA_BIT != 0
}

fn load_pdptrs_or_gp(vcpu: &mut Vcpu) -> bool {
    // SAFETY: owning pCPU, VMCS current.
    let cr3 = unsafe { partivisor_hal::vmx::exec_vmread(VMX_GUEST_CR3) };
    let Some(vm) = crate::vm::get_vm(vcpu.vm_id) else {
        return false;
    };
    match guest_memory::load_pdptrs(vcpu, &vm, cr3) {
        Ok(pdpte) => {
            // SAFETY: as above.
            unsafe {
                exec_vmwrite(VMX_GUEST_PDPTE0_FULL, pdpte[0]);
                exec_vmwrite(VMX_GUEST_PDPTE1_FULL, pdpte[1]);
                exec_vmwrite(VMX_GUEST_PDPTE2_FULL, pdpte[2]);
                exec_vmwrite(VMX_GUEST_PDPTE3_FULL, pdpte[3]);
            }
            true
        }
        Err(_) => false,
    }
}

/// Trapped MOV-to-CR0. Emulates the side effects of the legal transitions
/// and writes the effective value through; illegal combinations inject #GP
/// and leave everything untouched.
pub fn vmx_write_cr0(vcpu: &mut Vcpu, value: u64) {
    let p = policy();
    let cur_cr4 = guest_cr4(vcpu);
    let efer = vcpu.get_efer();

    if !p.is_cr0_write_valid(value, cur_cr4, efer) {
        crate::pr_err!("invalid cr0 write from guest: {:#x}", value);
        virq::vcpu_inject_gp(vcpu, 0);
        return;
    }

    // Low-half reserved bits are ignored rather than faulting.
    let effective_cr0 =
        (value & !p.cr0_reserved_bits_mask) | p.cr0_rsv_bits_guest_value;
    let old_cr0 = guest_cr0(vcpu);
    let changed = old_cr0 ^ effective_cr0;
    let mut err_found = false;

    if changed & CR0_PG != 0 {
        if effective_cr0 & CR0_PG != 0 {
            if efer & MSR_IA32_EFER_LME_BIT != 0 {
                // SAFETY: owning pCPU, VMCS current.
                unsafe {
                    let ctls = exec_vmread32(VMX_ENTRY_CONTROLS)
                        | VMX_ENTRY_CTLS_IA32E_MODE;
                    exec_vmwrite32(VMX_ENTRY_CONTROLS, ctls);
                }
                vcpu.set_efer(efer | MSR_IA32_EFER_LMA_BIT);
            } else if cur_cr4 & CR4_PAE != 0 && !load_pdptrs_or_gp(vcpu) {
                err_found = true;
                virq::vcpu_inject_gp(vcpu, 0);
            }
        } else if efer & MSR_IA32_EFER_LME_BIT != 0 {
            // SAFETY: owning pCPU, VMCS current.
            unsafe {
                let ctls =
                    exec_vmread32(VMX_ENTRY_CONTROLS) & !VMX_ENTRY_CTLS_IA32E_MODE;
                exec_vmwrite32(VMX_ENTRY_CONTROLS, ctls);
            }
            vcpu.set_efer(efer & !MSR_IA32_EFER_LMA_BIT);
        }
    }

    if err_found {
        return;
    }

    // CD is trap-and-emulate: the effect is an all-UC PAT, not a real CD.
    if changed & CR0_CD != 0 {
        let pat = if effective_cr0 & CR0_CD != 0 {
            PAT_ALL_UC_VALUE
        } else {
            vmsr::vcpu_get_guest_msr(vcpu, partivisor_hal::msr::MSR_IA32_PAT)
        };
        // SAFETY: owning pCPU, VMCS current.
        unsafe { exec_vmwrite(VMX_GUEST_IA32_PAT_FULL, pat) };
    }

    if changed & CR0_EPT_FLUSH_BITS != 0 {
        virq::make_request_self(vcpu, REQ_EPT_FLUSH);
    }

    let mask = p.cr0_trap_and_passthru_mask | p.cr0_passthru_mask;
    let hw_value = (p.initial_guest_cr0 & !mask) | (effective_cr0 & mask);
    // SAFETY: owning pCPU, VMCS current.
    unsafe {
        exec_vmwrite(VMX_GUEST_CR0, hw_value);
        exec_vmwrite(VMX_CR0_READ_SHADOW, effective_cr0);
    }
    vcpu.prime_cache(CpuReg::Cr0, effective_cr0);
}

/// Trapped MOV-to-CR4: reserved bits fault, transitions are vetted, and
/// the trap-and-passthru bits reach the hardware register.
pub fn vmx_write_cr4(vcpu: &mut Vcpu, value: u64) {
    let p = policy();
    let long_mode = is_long_mode(vcpu);

    if !p.is_cr4_write_valid(value, long_mode) {
        crate::pr_err!("invalid cr4 write from guest: {:#x}", value);
        virq::vcpu_inject_gp(vcpu, 0);
        return;
    }

    let old_cr4 = guest_cr4(vcpu);
    let changed = old_cr4 ^ value;
    let mut err_found = false;

    if changed & CR4_TRAP_AND_PASSTHRU_BITS != 0 {
        if value & CR4_PAE != 0 && is_paging_enabled(vcpu) && !long_mode
            && !load_pdptrs_or_gp(vcpu)
        {
            err_found = true;
            virq::vcpu_inject_gp(vcpu, 0);
        }
        if !err_found {
            virq::make_request_self(vcpu, REQ_EPT_FLUSH);
        }
    }

    if !err_found && changed & CR4_PCIDE != 0 && value & CR4_PCIDE != 0 {
        // PCIDE 0→1 demands long mode and a clean CR3 low half.
        // SAFETY: owning pCPU, VMCS current.
        let cr3 = unsafe { partivisor_hal::vmx::exec_vmread(VMX_GUEST_CR3) };
        if !long_mode || cr3 & 0xFFF != 0 {
            err_found = true;
            virq::vcpu_inject_gp(vcpu, 0);
        }
    }

    if !err_found && changed & CR4_KL != 0 {
        if value & CR4_KL != 0 {
            vcpu.arch.cr4_kl_enabled = true;
            load_iwkey(vcpu);
        } else {
            vcpu.arch.cr4_kl_enabled = false;
        }
    }

    if err_found {
        return;
    }

    if changed & CR4_EPT_FLUSH_BITS != 0 {
        virq::make_request_self(vcpu, REQ_EPT_FLUSH);
    }

    let mask = p.cr4_trap_and_passthru_mask | p.cr4_passthru_mask;
    let hw_value = (p.initial_guest_cr4 & !mask) | (value & mask);
    // SAFETY: owning pCPU, VMCS current.
    unsafe {
        exec_vmwrite(VMX_GUEST_CR4, hw_value);
        exec_vmwrite(VMX_CR4_READ_SHADOW, value);
    }
    vcpu.prime_cache(CpuReg::Cr4, value);
}

/// Restore the guest's wrapping key when it owns KeyLocker state.
pub fn load_iwkey(vcpu: &mut Vcpu) {
    if vcpu.arch.cr4_kl_enabled {
        let mut regs = [0u64; 12];
        regs[0] = vcpu.arch.iwkey.integrity_key[0];
        regs[1] = vcpu.arch.iwkey.integrity_key[1];
        regs[2] = vcpu.arch.iwkey.encryption_key[0];
        regs[3] = vcpu.arch.iwkey.encryption_key[1];
        regs[4] = vcpu.arch.iwkey.encryption_key[2];
        regs[5] = vcpu.arch.iwkey.encryption_key[3];
        // SAFETY: KeyLocker enabled in CR4 on this pCPU.
        unsafe { vmx::asm_loadiwkey(&regs) };
        let region = partivisor_hal::percpu::get_pcpu_region(vcpu.pcpu_id);
        region
            .whose_iwkey
            .store(vcpu as *const Vcpu as usize, core::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Typical fixed values: CR0 PE/PG/NE fixed-1, CR4 VMXE fixed-1.
    fn typical_policy() -> CrPolicy {
        let cr0_fixed0 = CR0_PE | CR0_NE | CR0_PG;
        let cr0_fixed1 = 0xFFFF_FFFF;
        let cr4_fixed0 = CR4_VMXE;
        let cr4_fixed1 = 0x003F_FFFF;
        CrPolicy::from_fixed(cr0_fixed0, cr0_fixed1, cr4_fixed0, cr4_fixed1)
    }

    #[test]
    fn classes_partition_no_overlap() {
        let p = typical_policy();
        assert_eq!(p.cr0_passthru_mask & p.cr0_trap_and_passthru_mask, 0);
        assert_eq!(p.cr4_passthru_mask & p.cr4_trap_and_passthru_mask, 0);
        // PE and PG are forced flexible for unrestricted guests.
        assert!(p.cr0_trap_and_passthru_mask & CR0_PE != 0);
        assert!(p.cr0_trap_and_passthru_mask & CR0_PG != 0);
    }

    #[test]
    fn vmxe_is_reserved_and_kept_set_physically() {
        let p = typical_policy();
        assert!(p.cr4_reserved_bits_mask & CR4_VMXE != 0);
        // The guest reads VMXE as 0; the hardware value keeps it 1.
        assert_eq!(p.cr4_rsv_bits_guest_value & CR4_VMXE, 0);
        assert!(p.initial_guest_cr4 & CR4_VMXE != 0);
        assert!(p.is_valid_cr4(0));
        assert!(!p.is_valid_cr4(CR4_VMXE));
    }

    #[test]
    fn cr0_write_legality_rules() {
        let p = typical_policy();
        // High-half bits fault.
        assert!(!p.is_cr0_write_valid(1 << 33, 0, 0));
        // PG without PE.
        assert!(!p.is_cr0_write_valid(CR0_PG, 0, 0));
        // PG with LME but no PAE.
        assert!(!p.is_cr0_write_valid(
            CR0_PE | CR0_PG,
            0,
            MSR_IA32_EFER_LME_BIT
        ));
        // Same with PAE present is fine.
        assert!(p.is_cr0_write_valid(
            CR0_PE | CR0_PG,
            CR4_PAE,
            MSR_IA32_EFER_LME_BIT
        ));
        // NW without CD.
        assert!(!p.is_cr0_write_valid(CR0_PE | CR0_NW, 0, 0));
        // Dropping PG while PCIDE is on.
        assert!(!p.is_cr0_write_valid(CR0_PE, CR4_PCIDE, 0));
    }

    #[test]
    fn cr4_write_legality_rules() {
        let p = typical_policy();
        assert!(p.is_cr4_write_valid(CR4_PAE, true));
        // Long mode without PAE.
        assert!(!p.is_cr4_write_valid(0, true));
        // Reserved (emulated) bit set.
        assert!(!p.is_cr4_write_valid(CR4_VMXE | CR4_PAE, false));
    }

    #[test]
    fn reserved_low_cr0_bits_are_ignored_not_faulting() {
        let p = typical_policy();
        // Bit 7 is reserved in CR0; the write is legal and the effective
        // value keeps the reserved-bit contract.
        let v = CR0_PE | (1 << 7);
        assert!(p.is_cr0_write_valid(v, 0, 0));
        let effective = (v & !p.cr0_reserved_bits_mask) | p.cr0_rsv_bits_guest_value;
        assert!(p.is_valid_cr0(effective));
    }
}
