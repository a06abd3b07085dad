//! Virtual cache allocation: per-VM virtual CLOS ids over the physical
//! L2/L3 mask MSRs.
//!
//! A VM sees CLOS ids 0..num_vclosids and contiguous capacity bitmasks of
//! vcbm_len ways; writes are validated, mirrored to every vCPU sharing the
//! same cache, and translated onto the assigned physical CLOS with the
//! reserved MSR bits preserved.

use partivisor_hal::msr::{self, rdmsr, wrmsr, MSR_IA32_PQR_ASSOC};
use partivisor_hal::{cpu_caps, cpuid};

use crate::error::HvErr;
use crate::vcpu::{Vcpu, VcpuCell};
use crate::vm::Vm;
use crate::vmsr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdtResource {
    L2,
    L3,
}

pub fn is_vcat_configured(vm: &Vm) -> bool {
    vm.config.num_vclosids > 0
}

fn max_pcbm(vm: &Vm, res: RdtResource) -> u64 {
    match res {
        RdtResource::L2 => vm.config.max_l2_pcbm,
        RdtResource::L3 => vm.config.max_l3_pcbm,
    }
}

fn msr_base(res: RdtResource) -> u32 {
    match res {
        RdtResource::L2 => msr::MSR_IA32_L2_MASK_BASE,
        RdtResource::L3 => msr::MSR_IA32_L3_MASK_BASE,
    }
}

pub fn vcat_get_num_vclosids(vm: &Vm) -> u16 {
    if is_vcat_configured(vm) {
        vm.config.num_vclosids
    } else {
        0
    }
}

fn vclosid_to_pclosid(vm: &Vm, vclosid: u16) -> u16 {
    debug_assert!(vclosid < vcat_get_num_vclosids(vm));
    vm.config.pclosids[vclosid as usize & 0x7]
}

/// Width of the virtual bitmask: the ways the VM was assigned.
pub fn vcat_get_vcbm_len(vm: &Vm, res: RdtResource) -> u32 {
    max_pcbm(vm, res).count_ones()
}

fn vcat_get_max_vcbm(vm: &Vm, res: RdtResource) -> u64 {
    let pcbm = max_pcbm(vm, res);
    if pcbm == 0 {
        return 0;
    }
    pcbm >> pcbm.trailing_zeros()
}

pub fn vcat_pcbm_to_vcbm(vm: &Vm, pcbm: u64, res: RdtResource) -> u64 {
    let max = max_pcbm(vm, res);
    if max == 0 {
        return 0;
    }
    (pcbm & max) >> max.trailing_zeros()
}

fn vcbm_to_pcbm(vm: &Vm, vcbm: u64, res: RdtResource) -> u64 {
    let max = max_pcbm(vm, res);
    if max == 0 {
        return 0;
    }
    vcbm << max.trailing_zeros()
}

fn vcbm_msr_resource(vm: &Vm, m: u32) -> Option<RdtResource> {
    let n = vcat_get_num_vclosids(vm) as u32;
    if n == 0 {
        return None;
    }
    if (msr::MSR_IA32_L2_MASK_BASE..msr::MSR_IA32_L2_MASK_BASE + n).contains(&m)
        && vm.config.max_l2_pcbm != 0
    {
        return Some(RdtResource::L2);
    }
    if (msr::MSR_IA32_L3_MASK_BASE..msr::MSR_IA32_L3_MASK_BASE + n).contains(&m)
        && vm.config.max_l3_pcbm != 0
    {
        return Some(RdtResource::L3);
    }
    None
}

pub fn is_vcbm_msr(vm: &Vm, m: u32) -> bool {
    is_vcat_configured(vm) && vcbm_msr_resource(vm, m).is_some()
}

/// All (and only) contiguous one-runs are legal capacity masks.
fn is_contiguous(bitmask: u64) -> bool {
    if bitmask == 0 {
        return false;
    }
    let low = bitmask.trailing_zeros();
    let high = 63 - bitmask.leading_zeros();
    ((2u64 << high) - (1u64 << low)) == bitmask
}

/// L2/L3 cache ids of a vCPU, derived from its APIC id and the CPUID
/// cache-topology shifts.
fn get_cache_id(cell: &VcpuCell) -> (u32, u32) {
    let apicid = cell.shared.vlapic.apic_id();
    let (l2_shift, l3_shift) = get_cache_shift();
    (apicid >> l2_shift, apicid >> l3_shift)
}

/// Addressable-logical-processor shifts from CPUID leaf 04H.
fn get_cache_shift() -> (u32, u32) {
    if !cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
        // Capability table empty (hosted): treat every vCPU as sharing.
        return (0, 0);
    }
    let mut l2_shift = 0;
    let mut l3_shift = 0;
    for subleaf in 0..8 {
        let (eax, _, _, _) = cpuid::cpuid_subleaf(0x4, subleaf);
        let cache_type = eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        let level = (eax >> 5) & 0x7;
        let max_sharing = ((eax >> 14) & 0xFFF) + 1;
        let shift = 32 - (max_sharing - 1).leading_zeros();
        match level {
            2 => l2_shift = shift,
            3 => l3_shift = shift,
            _ => {}
        }
    }
    (l2_shift, l3_shift)
}

/// Mirror a vCBM write to every vCPU on the same cache domain.
fn propagate_vcbm(vm: &Vm, origin: &Vcpu, m: u32, value: u64) {
    let Some(origin_cell) = vm.vcpu(origin.vcpu_id) else {
        return;
    };
    let (l2_id, l3_id) = get_cache_id(origin_cell);
    let res = vcbm_msr_resource(vm, m);

    vm.foreach_vcpu(|cell| {
        let (peer_l2, peer_l3) = get_cache_id(cell);
        let shares = match res {
            Some(RdtResource::L2) => peer_l2 == l2_id,
            Some(RdtResource::L3) => peer_l3 == l3_id,
            None => false,
        };
        if shares {
            vmsr::cell_set_guest_msr(cell, m, value);
        }
    });
}

pub fn read_vcbm(vcpu: &Vcpu, vm: &Vm, m: u32) -> Result<u64, HvErr> {
    if !is_vcbm_msr(vm, m) {
        return Err(HvErr::Access);
    }
    Ok(vmsr::vcpu_get_guest_msr(vcpu, m))
}

/// vCBM write: contiguity- and width-checked, propagated, and pushed to
/// the mapped physical CLOS mask with reserved bits preserved.
pub fn write_vcbm(vcpu: &mut Vcpu, vm: &Vm, m: u32, value: u64) -> Result<(), HvErr> {
    let res = vcbm_msr_resource(vm, m).ok_or(HvErr::Access)?;
    let masked = value & vcat_get_max_vcbm(vm, res);
    if masked != value || !is_contiguous(value) {
        return Err(HvErr::Access);
    }

    propagate_vcbm(vm, vcpu, m, value);

    let base = msr_base(res);
    let vclosid = (m - base) as u16;
    let pmsr = base + vclosid_to_pclosid(vm, vclosid) as u32;
    let pcbm = vcbm_to_pcbm(vm, value, res);
    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_RDT_A) {
        // SAFETY: RDT allocation verified present.
        unsafe {
            let pvalue = (rdmsr(pmsr) & !max_pcbm(vm, res)) | pcbm;
            wrmsr(pmsr, pvalue);
        }
    }
    Ok(())
}

pub fn read_vclosid(vcpu: &Vcpu, vm: &Vm) -> Result<u64, HvErr> {
    if !is_vcat_configured(vm) {
        return Err(HvErr::Access);
    }
    Ok(vmsr::vcpu_get_guest_msr(vcpu, MSR_IA32_PQR_ASSOC))
}

/// PQR_ASSOC write: vCLOS in the high half, zero RMID, mapped onto the
/// physical CLOS through the MSR auto-load area.
pub fn write_vclosid(vcpu: &mut Vcpu, vm: &Vm, value: u64) -> Result<(), HvErr> {
    if !is_vcat_configured(vm) {
        return Err(HvErr::Access);
    }
    let vclosid = (value >> 32) as u32;
    if value & 0xFFFF_FFFF != 0 || vclosid >= vcat_get_num_vclosids(vm) as u32 {
        return Err(HvErr::Access);
    }
    vmsr::vcpu_set_guest_msr(vcpu, MSR_IA32_PQR_ASSOC, value);

    let pclosid = vclosid_to_pclosid(vm, vclosid as u16);
    let area = &mut vcpu.arch.msr_area;
    let idx = area.index_of_pqr_assoc;
    if idx < area.count {
        area.guest[idx].value = (pclosid as u64) << 32;
    }
    Ok(())
}

/// Reset every vCBM to the full assigned mask and vCLOS to 0.
pub fn init_vcat_msrs(vcpu: &mut Vcpu, vm: &Vm) {
    if !is_vcat_configured(vm) {
        return;
    }
    for res in [RdtResource::L2, RdtResource::L3] {
        let max_vcbm = vcat_get_max_vcbm(vm, res);
        if max_vcbm == 0 {
            continue;
        }
        let base = msr_base(res);
        for i in 0..vcat_get_num_vclosids(vm) as u32 {
            let _ = write_vcbm(vcpu, vm, base + i, max_vcbm);
        }
    }
    let _ = write_vclosid(vcpu, vm, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcat_vm(vcpus: u16) -> alloc::sync::Arc<crate::vm::Vm> {
        crate::vm::tests::fixture_vm_with(move |c| {
            c.vcpu_num = vcpus;
            c.num_vclosids = 2;
            c.pclosids = [4, 5, 0, 0, 0, 0, 0, 0];
            c.max_l3_pcbm = 0x0FF0; /* ways 4..11 */
        })
    }

    #[test]
    fn mask_arithmetic() {
        let vm = vcat_vm(2);
        assert_eq!(vcat_get_vcbm_len(&vm, RdtResource::L3), 8);
        assert_eq!(vcat_get_max_vcbm(&vm, RdtResource::L3), 0xFF);
        assert_eq!(vcat_pcbm_to_vcbm(&vm, 0x0F00, RdtResource::L3), 0xF0);
        assert_eq!(vcbm_to_pcbm(&vm, 0xFF, RdtResource::L3), 0x0FF0);
    }

    #[test]
    fn contiguity_rules() {
        assert!(is_contiguous(0x3FF));
        assert!(is_contiguous(0x0FF0));
        assert!(is_contiguous(0x4));
        assert!(!is_contiguous(0x5));
        assert!(!is_contiguous(0));
        assert!(!is_contiguous(0xF0F));
    }

    #[test]
    fn vcbm_write_propagates_to_cache_sharers() {
        let vm = vcat_vm(2);
        let m = msr::MSR_IA32_L3_MASK_BASE;
        assert!(is_vcbm_msr(&vm, m));

        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        write_vcbm(vcpu, &vm, m, 0xFF).unwrap();

        // Hosted cache ids collapse to one domain: both vCPUs see it.
        vm.foreach_vcpu(|c| {
            // SAFETY: as above.
            let body = unsafe { c.body_mut() };
            assert_eq!(vmsr::vcpu_get_guest_msr(body, m), 0xFF);
        });
    }

    #[test]
    fn vcbm_write_rejects_bad_masks() {
        let vm = vcat_vm(1);
        let m = msr::MSR_IA32_L3_MASK_BASE;
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        // Non-contiguous.
        assert!(write_vcbm(vcpu, &vm, m, 0x5).is_err());
        // Wider than the VM's assignment.
        assert!(write_vcbm(vcpu, &vm, m, 0x1FF).is_err());
        // Outside the configured vCLOS range.
        assert!(write_vcbm(vcpu, &vm, m + 5, 0xF).is_err());
    }

    #[test]
    fn vclosid_write_validates_layout() {
        let vm = vcat_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        // Low half must be zero.
        assert!(write_vclosid(vcpu, &vm, 0x1).is_err());
        // vCLOS beyond the configured count.
        assert!(write_vclosid(vcpu, &vm, 2u64 << 32).is_err());
        write_vclosid(vcpu, &vm, 1u64 << 32).unwrap();
        assert_eq!(
            vmsr::vcpu_get_guest_msr(vcpu, MSR_IA32_PQR_ASSOC),
            1u64 << 32
        );
    }
}
