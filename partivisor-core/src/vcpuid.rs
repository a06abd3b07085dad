//! The CPUID surface a guest sees: host leaves filtered of everything the
//! engine does not virtualize, plus a hypervisor vendor leaf.

use partivisor_hal::cpuid::cpuid_subleaf;

use crate::vcpu::{CpuReg, Vcpu, VcpuCell};
use crate::virtual_cr::{self, CR4_OSXSAVE};
use crate::vm::Vm;

/* leaf 01H ECX bits the guest never sees */
const CPUID_01_ECX_VMX: u32 = 1 << 5;
const CPUID_01_ECX_SMX: u32 = 1 << 6;
const CPUID_01_ECX_EIST: u32 = 1 << 7;
const CPUID_01_ECX_PDCM: u32 = 1 << 15;
const CPUID_01_ECX_XTPR: u32 = 1 << 14;
const CPUID_01_ECX_OSXSAVE: u32 = 1 << 27;
const CPUID_01_ECX_X2APIC: u32 = 1 << 21;
const CPUID_01_ECX_HV: u32 = 1 << 31;

/* leaf 07H EBX/ECX bits masked out */
const CPUID_07_EBX_SGX: u32 = 1 << 2;
const CPUID_07_EBX_MPX: u32 = 1 << 14;
const CPUID_07_EBX_PQM: u32 = 1 << 12;
const CPUID_07_EBX_PQE: u32 = 1 << 15;
const CPUID_07_ECX_SGX_LC: u32 = 1 << 30;
const CPUID_07_ECX_WAITPKG: u32 = 1 << 5;

const HV_LEAF_BASE: u32 = 0x4000_0000;

/// XCR0 components exposed to guests: x87, SSE, AVX.
pub const GUEST_XCR0_MASK: u64 = 0x7;

/// Filtered CPUID for one vCPU.
pub fn guest_cpuid(
    cell: &VcpuCell,
    vcpu: &mut Vcpu,
    vm: &Vm,
    leaf: u32,
    subleaf: u32,
) -> (u32, u32, u32, u32) {
    match leaf {
        0x1 => {
            let (eax, mut ebx, mut ecx, edx) = cpuid_subleaf(leaf, subleaf);
            ecx &= !(CPUID_01_ECX_VMX
                | CPUID_01_ECX_SMX
                | CPUID_01_ECX_EIST
                | CPUID_01_ECX_PDCM
                | CPUID_01_ECX_XTPR);
            ecx |= CPUID_01_ECX_X2APIC | CPUID_01_ECX_HV;
            // OSXSAVE reflects the guest's own CR4, not the host's.
            ecx &= !CPUID_01_ECX_OSXSAVE;
            if virtual_cr::guest_cr4(vcpu) & CR4_OSXSAVE != 0 {
                ecx |= CPUID_01_ECX_OSXSAVE;
            }
            // Initial APIC id in EBX[31:24].
            ebx = (ebx & 0x00FF_FFFF) | (cell.shared.vlapic.apic_id() << 24);
            (eax, ebx, ecx, edx)
        }
        0x7 if subleaf == 0 => {
            let (eax, mut ebx, mut ecx, edx) = cpuid_subleaf(leaf, subleaf);
            ebx &= !(CPUID_07_EBX_SGX | CPUID_07_EBX_MPX | CPUID_07_EBX_PQM);
            if !crate::vcat::is_vcat_configured(vm) {
                ebx &= !CPUID_07_EBX_PQE;
            }
            ecx &= !(CPUID_07_ECX_SGX_LC | CPUID_07_ECX_WAITPKG);
            (eax, ebx, ecx, edx)
        }
        0xB => {
            // x2APIC topology: report the vCPU's own x2APIC id.
            let (eax, ebx, ecx, _) = cpuid_subleaf(leaf, subleaf);
            (eax, ebx, ecx, cell.shared.vlapic.apic_id())
        }
        0xD => {
            let (mut eax, ebx, ecx, edx) = cpuid_subleaf(leaf, subleaf);
            if subleaf == 0 {
                eax &= GUEST_XCR0_MASK as u32;
            }
            (eax, ebx, ecx, edx)
        }
        0xA => (0, 0, 0, 0), /* no PMU */
        HV_LEAF_BASE => {
            // Vendor signature leaf.
            let sig = b"PRTVPRTVPRTV";
            (
                HV_LEAF_BASE + 1,
                u32::from_le_bytes(sig[0..4].try_into().unwrap()),
                u32::from_le_bytes(sig[4..8].try_into().unwrap()),
                u32::from_le_bytes(sig[8..12].try_into().unwrap()),
            )
        }
        l if l == HV_LEAF_BASE + 1 => (vm.vm_id as u32, 0, 0, 0),
        _ => cpuid_subleaf(leaf, subleaf),
    }
}

/// VM exit: CPUID.
pub fn cpuid_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) {
    let leaf = vcpu.get_gpreg(CpuReg::Rax) as u32;
    let subleaf = vcpu.get_gpreg(CpuReg::Rcx) as u32;
    let (eax, ebx, ecx, edx) = guest_cpuid(cell, vcpu, vm, leaf, subleaf);
    vcpu.set_gpreg(CpuReg::Rax, eax as u64);
    vcpu.set_gpreg(CpuReg::Rbx, ebx as u64);
    vcpu.set_gpreg(CpuReg::Rcx, ecx as u64);
    vcpu.set_gpreg(CpuReg::Rdx, edx as u64);
}

/// XCR0 values a guest may install via XSETBV.
pub fn is_valid_guest_xcr0(value: u64) -> bool {
    // x87 state can never be cleared.
    if value & 0x1 == 0 {
        return false;
    }
    if value & !GUEST_XCR0_MASK != 0 {
        return false;
    }
    // AVX requires SSE.
    const XCR0_SSE: u64 = 1 << 1;
    const XCR0_AVX: u64 = 1 << 2;
    if value & (XCR0_SSE | XCR0_AVX) == XCR0_AVX {
        return false;
    }
    // MPX is inside !GUEST_XCR0_MASK and already rejected; the platform
    // gate for it lives in the reserved check above.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::fixture_vm;

    #[test]
    fn leaf1_hides_vmx_and_reports_hypervisor() {
        let vm = fixture_vm(2);
        let cell = vm.vcpu(1).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        // Seed the CR4 cache so the OSXSAVE reflection is exercised
        // without a VMCS.
        vcpu.prime_cache(CpuReg::Cr4, 0);

        let (_, ebx, ecx, _) = guest_cpuid(cell, vcpu, &vm, 0x1, 0);
        assert_eq!(ecx & CPUID_01_ECX_VMX, 0);
        assert_ne!(ecx & CPUID_01_ECX_HV, 0);
        assert_ne!(ecx & CPUID_01_ECX_X2APIC, 0);
        assert_eq!(ecx & CPUID_01_ECX_OSXSAVE, 0);
        assert_eq!(ebx >> 24, 1, "initial APIC id follows the vCPU");
    }

    #[test]
    fn osxsave_follows_guest_cr4() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        vcpu.prime_cache(CpuReg::Cr4, CR4_OSXSAVE);
        let (_, _, ecx, _) = guest_cpuid(cell, vcpu, &vm, 0x1, 0);
        assert_ne!(ecx & CPUID_01_ECX_OSXSAVE, 0);
    }

    #[test]
    fn hypervisor_vendor_leaf() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        let (max, b, c, d) = guest_cpuid(cell, vcpu, &vm, HV_LEAF_BASE, 0);
        assert_eq!(max, HV_LEAF_BASE + 1);
        let mut sig = [0u8; 12];
        sig[0..4].copy_from_slice(&b.to_le_bytes());
        sig[4..8].copy_from_slice(&c.to_le_bytes());
        sig[8..12].copy_from_slice(&d.to_le_bytes());
        assert_eq!(&sig, b"PRTVPRTVPRTV");
    }

    #[test]
    fn xcr0_legality() {
        assert!(is_valid_guest_xcr0(0x1));
        assert!(is_valid_guest_xcr0(0x3));
        assert!(is_valid_guest_xcr0(0x7));
        // x87 cleared.
        assert!(!is_valid_guest_xcr0(0x2));
        // AVX without SSE.
        assert!(!is_valid_guest_xcr0(0x5));
        // MPX / reserved bits.
        assert!(!is_valid_guest_xcr0(0x19));
        assert!(!is_valid_guest_xcr0(1 << 9 | 1));
    }

    #[test]
    fn no_pmu_leaf() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        assert_eq!(guest_cpuid(cell, vcpu, &vm, 0xA, 0), (0, 0, 0, 0));
    }
}
