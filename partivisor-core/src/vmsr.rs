//! RDMSR/WRMSR interception and emulation.
//!
//! The MSR bitmap passes benign registers straight through; everything
//! else exits and lands here. Emulated values live in a fixed per-vCPU
//! `{index}`-ordered array whose first slots are world-isolated (swapped
//! by the secure-world context switch); the rest is shared between worlds.

use partivisor_hal::msr::{self, wrmsr};
use partivisor_hal::vmx::{exec_vmwrite, VMX_GUEST_IA32_PAT_FULL, VMX_TSC_OFFSET_FULL};
use partivisor_hal::{cpu_caps, cpuid, tsc};

use crate::error::HvErr;
use crate::vcat;
use crate::vcpu::{CpuReg, Vcpu, VcpuCell};
use crate::virq;
use crate::virtual_cr::{self, CR0_CD};
use crate::vlapic;
use crate::vm::Vm;

/// MSRs isolated between the normal and secure world; the world-switch
/// parks and restores exactly these.
pub const NUM_WORLD_MSRS: usize = 2;
const WORLD_MSRS: [u32; NUM_WORLD_MSRS] = [msr::MSR_IA32_PAT, msr::MSR_IA32_TSC_ADJUST];

const COMMON_MSRS: [u32; 6] = [
    msr::MSR_IA32_TSC_DEADLINE,
    msr::MSR_IA32_BIOS_SIGN_ID,
    msr::MSR_IA32_SPEC_CTRL,
    msr::MSR_IA32_XSS,
    msr::MSR_IA32_MISC_ENABLE,
    msr::MSR_IA32_PQR_ASSOC,
];

/// vCAT mask MSRs tracked per vCPU, L2 then L3.
pub const NUM_CAT_MSRS: usize = 16;
const CAT_MSRS_PER_RES: usize = 8;

pub const NUM_GUEST_MSRS: usize = NUM_WORLD_MSRS + COMMON_MSRS.len() + NUM_CAT_MSRS;

/// Index of an emulated MSR in the per-vCPU array.
pub fn guest_msr_index(m: u32) -> Option<usize> {
    if let Some(i) = WORLD_MSRS.iter().position(|&w| w == m) {
        return Some(i);
    }
    if let Some(i) = COMMON_MSRS.iter().position(|&c| c == m) {
        return Some(NUM_WORLD_MSRS + i);
    }
    let cat_base = NUM_WORLD_MSRS + COMMON_MSRS.len();
    if (msr::MSR_IA32_L2_MASK_BASE..msr::MSR_IA32_L2_MASK_BASE + CAT_MSRS_PER_RES as u32)
        .contains(&m)
    {
        return Some(cat_base + (m - msr::MSR_IA32_L2_MASK_BASE) as usize);
    }
    if (msr::MSR_IA32_L3_MASK_BASE..msr::MSR_IA32_L3_MASK_BASE + CAT_MSRS_PER_RES as u32)
        .contains(&m)
    {
        return Some(cat_base + CAT_MSRS_PER_RES + (m - msr::MSR_IA32_L3_MASK_BASE) as usize);
    }
    None
}

pub fn vcpu_get_guest_msr(vcpu: &Vcpu, m: u32) -> u64 {
    guest_msr_index(m)
        .map(|i| vcpu.arch.guest_msrs[i])
        .unwrap_or(0)
}

pub fn vcpu_set_guest_msr(vcpu: &mut Vcpu, m: u32, value: u64) {
    if let Some(i) = guest_msr_index(m) {
        vcpu.arch.guest_msrs[i] = value;
    }
}

/// Peer-vCPU variant used by the vCAT propagation sweep; legal because
/// MSR shadows are plain words and the writer holds the VM's vCAT flow.
pub fn cell_set_guest_msr(cell: &VcpuCell, m: u32, value: u64) {
    // SAFETY: single-word store into the shadow array; the vCAT path is
    // the only writer and readers tolerate either value.
    let vcpu = unsafe { cell.body_mut() };
    vcpu_set_guest_msr(vcpu, m, value);
}

/* MSR bitmap layout: 1 KiB chunks — read-low, read-high, write-low,
 * write-high. */
const INTERCEPT_READ: u8 = 1 << 0;
const INTERCEPT_WRITE: u8 = 1 << 1;

fn set_bitmap_bit(bitmap: &mut [u8; 4096], base: usize, m: u32, on: bool) {
    let offset = (m & 0x1FFF) as usize;
    let byte = base + offset / 8;
    let bit = 1u8 << (offset % 8);
    if on {
        bitmap[byte] |= bit;
    } else {
        bitmap[byte] &= !bit;
    }
}

/// Program one MSR's interception in the bitmap.
pub fn enable_msr_interception(bitmap: &mut [u8; 4096], m: u32, mode: u8) {
    let (read_base, write_base) = if m < 0x2000 {
        (0, 2048)
    } else if (0xC000_0000..0xC000_2000).contains(&m) {
        (1024, 3072)
    } else {
        return;
    };
    set_bitmap_bit(bitmap, read_base, m, mode & INTERCEPT_READ != 0);
    set_bitmap_bit(bitmap, write_base, m, mode & INTERCEPT_WRITE != 0);
}

/// Intercept everything the emulation layer owns; leave the rest
/// passthrough.
pub fn init_msr_emulation(vcpu: &mut Vcpu, vm: &Vm) {
    vm.with_msr_bitmap(|bitmap| {
        for m in WORLD_MSRS.iter().chain(COMMON_MSRS.iter()) {
            enable_msr_interception(bitmap, *m, INTERCEPT_READ | INTERCEPT_WRITE);
        }
        for i in 0..CAT_MSRS_PER_RES as u32 {
            enable_msr_interception(
                bitmap,
                msr::MSR_IA32_L2_MASK_BASE + i,
                INTERCEPT_READ | INTERCEPT_WRITE,
            );
            enable_msr_interception(
                bitmap,
                msr::MSR_IA32_L3_MASK_BASE + i,
                INTERCEPT_READ | INTERCEPT_WRITE,
            );
        }
        // The whole x2APIC window is emulated.
        for m in msr::MSR_IA32_EXT_APIC_BASE..=msr::MSR_IA32_EXT_APIC_END {
            enable_msr_interception(bitmap, m, INTERCEPT_READ | INTERCEPT_WRITE);
        }
        for m in [
            msr::MSR_IA32_EFER,
            msr::MSR_IA32_APIC_BASE,
            msr::MSR_IA32_FEATURE_CONTROL,
            msr::MSR_IA32_TIME_STAMP_COUNTER,
        ] {
            enable_msr_interception(bitmap, m, INTERCEPT_READ | INTERCEPT_WRITE);
        }
    });

    // Seed the shadows the guest expects non-zero.
    vcpu_set_guest_msr(vcpu, msr::MSR_IA32_PAT, msr::PAT_POWER_ON_VALUE);
    vcat::init_vcat_msrs(vcpu, vm);
}

fn pat_value_is_valid(value: u64) -> bool {
    (0..8).all(|i| {
        let e = (value >> (i * 8)) & 0xFF;
        matches!(e, 0 | 1 | 4 | 5 | 6 | 7)
    })
}

fn pat_mem_type_invalid(value: u64) -> bool {
    !pat_value_is_valid(value)
}

fn write_pat_msr(vcpu: &mut Vcpu, value: u64) -> Result<(), HvErr> {
    if pat_mem_type_invalid(value) {
        return Err(HvErr::Inval);
    }
    vcpu_set_guest_msr(vcpu, msr::MSR_IA32_PAT, value);
    // With CD set the guest runs on the all-UC PAT; the write lands when
    // caching is re-enabled.
    if virtual_cr::guest_cr0(vcpu) & CR0_CD == 0
        && cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX)
    {
        // SAFETY: owning pCPU, VMCS current.
        unsafe { exec_vmwrite(VMX_GUEST_IA32_PAT_FULL, value) };
    }
    Ok(())
}

fn write_efer_msr(vcpu: &mut Vcpu, value: u64) -> Result<(), HvErr> {
    // LMA is read-only to the guest; everything reserved must stay zero.
    const EFER_WRITABLE: u64 = msr::MSR_IA32_EFER_SCE_BIT
        | msr::MSR_IA32_EFER_LME_BIT
        | msr::MSR_IA32_EFER_NXE_BIT;
    if value & !(EFER_WRITABLE | msr::MSR_IA32_EFER_LMA_BIT) != 0 {
        return Err(HvErr::Inval);
    }
    let lma = vcpu.get_efer() & msr::MSR_IA32_EFER_LMA_BIT;
    vcpu.set_efer((value & EFER_WRITABLE) | lma);
    Ok(())
}

/// RDMSR exit: ECX selects, EDX:EAX returns.
pub fn rdmsr_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let m = vcpu.get_gpreg(CpuReg::Rcx) as u32;
    let mut err = false;

    let value = if msr::is_x2apic_msr(m) {
        match cell.shared.vlapic.read_msr(m) {
            Ok(v) => v,
            Err(()) => {
                err = true;
                0
            }
        }
    } else {
        match m {
            msr::MSR_IA32_PAT
            | msr::MSR_IA32_TSC_ADJUST
            | msr::MSR_IA32_TSC_DEADLINE
            | msr::MSR_IA32_SPEC_CTRL
            | msr::MSR_IA32_XSS
            | msr::MSR_IA32_MISC_ENABLE => vcpu_get_guest_msr(vcpu, m),
            msr::MSR_IA32_BIOS_SIGN_ID => 0,
            msr::MSR_IA32_EFER => vcpu.get_efer(),
            msr::MSR_IA32_FEATURE_CONTROL => msr::MSR_IA32_FEATURE_CONTROL_LOCK,
            msr::MSR_IA32_APIC_BASE => {
                // x2APIC enabled, xAPIC enabled; BSP flag on vCPU 0.
                let bsp = if vcpu.vcpu_id == 0 { 1u64 << 8 } else { 0 };
                0xFEE0_0000 | (0x3 << 10) | bsp
            }
            msr::MSR_IA32_TIME_STAMP_COUNTER => {
                let offset = vcpu.arch.contexts[vcpu.cur_context()].ext_ctx.tsc_offset;
                tsc::rdtsc().wrapping_add(offset)
            }
            msr::MSR_IA32_TSC_AUX => {
                vcpu.arch.contexts[vcpu.cur_context()].ext_ctx.tsc_aux
            }
            msr::MSR_IA32_PQR_ASSOC => match vcat::read_vclosid(vcpu, vm) {
                Ok(v) => v,
                Err(_) => {
                    err = true;
                    0
                }
            },
            m if vcat::is_vcbm_msr(vm, m) => match vcat::read_vcbm(vcpu, vm, m) {
                Ok(v) => v,
                Err(_) => {
                    err = true;
                    0
                }
            },
            _ => {
                err = true;
                0
            }
        }
    };

    if err {
        crate::pr_warn!("vm{}: rdmsr {:#x} rejected", vm.vm_id, m);
        virq::vcpu_inject_gp(vcpu, 0);
    } else {
        vcpu.set_gpreg(CpuReg::Rax, value & 0xFFFF_FFFF);
        vcpu.set_gpreg(CpuReg::Rdx, value >> 32);
    }
    Ok(())
}

/// WRMSR exit: ECX selects, EDX:EAX supplies.
pub fn wrmsr_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let m = vcpu.get_gpreg(CpuReg::Rcx) as u32;
    let value = (vcpu.get_gpreg(CpuReg::Rax) & 0xFFFF_FFFF)
        | (vcpu.get_gpreg(CpuReg::Rdx) << 32);
    let mut err = false;

    if msr::is_x2apic_msr(m) {
        match m {
            msr::MSR_IA32_EXT_APIC_EOI => {
                if let Some((vector, level)) = cell.shared.vlapic.process_eoi() {
                    if level {
                        vm.vioapic().process_eoi(vm, vector);
                    }
                }
            }
            msr::MSR_IA32_EXT_APIC_ICR => {
                if cell.shared.vlapic.write_msr(m, value).is_ok() {
                    vlapic::vlapic_icr_write(vm, &cell.shared, value);
                } else {
                    err = true;
                }
            }
            msr::MSR_IA32_EXT_APIC_SELF_IPI => {
                vlapic::vlapic_set_intr(&cell.shared, (value & 0xFF) as u32, false);
            }
            _ => err = cell.shared.vlapic.write_msr(m, value).is_err(),
        }
    } else {
        match m {
            msr::MSR_IA32_PAT => err = write_pat_msr(vcpu, value).is_err(),
            msr::MSR_IA32_EFER => err = write_efer_msr(vcpu, value).is_err(),
            msr::MSR_IA32_TSC_ADJUST | msr::MSR_IA32_TSC_DEADLINE => {
                vcpu_set_guest_msr(vcpu, m, value);
            }
            msr::MSR_IA32_TIME_STAMP_COUNTER => {
                let offset = value.wrapping_sub(tsc::rdtsc());
                vcpu.arch.contexts[vcpu.arch.cur_context].ext_ctx.tsc_offset = offset;
                if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
                    // SAFETY: owning pCPU, VMCS current.
                    unsafe { exec_vmwrite(VMX_TSC_OFFSET_FULL, offset) };
                }
            }
            msr::MSR_IA32_SPEC_CTRL => {
                vcpu_set_guest_msr(vcpu, m, value);
                vcpu.arch.contexts[vcpu.arch.cur_context].run_ctx.ia32_spec_ctrl = value;
            }
            msr::MSR_IA32_PRED_CMD => {
                if value & !msr::PRED_CMD_IBPB != 0 {
                    err = true;
                } else if value & msr::PRED_CMD_IBPB != 0
                    && cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_IBRS_IBPB)
                {
                    // SAFETY: capability checked; barrier write only.
                    unsafe { wrmsr(msr::MSR_IA32_PRED_CMD, msr::PRED_CMD_IBPB) };
                }
            }
            msr::MSR_IA32_XSS => {
                if value != 0 {
                    // No supervisor state components are exposed.
                    err = true;
                } else {
                    vcpu_set_guest_msr(vcpu, m, 0);
                    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVES) {
                        // SAFETY: capability checked.
                        unsafe { wrmsr(msr::MSR_IA32_XSS, 0) };
                    }
                }
            }
            msr::MSR_IA32_TSC_AUX => {
                vcpu.arch.contexts[vcpu.arch.cur_context].ext_ctx.tsc_aux = value;
            }
            msr::MSR_IA32_MISC_ENABLE | msr::MSR_IA32_BIOS_SIGN_ID => {
                // Tolerated, architecturally inert here.
            }
            msr::MSR_IA32_PQR_ASSOC => {
                err = vcat::write_vclosid(vcpu, vm, value).is_err();
            }
            m if vcat::is_vcbm_msr(vm, m) => {
                err = vcat::write_vcbm(vcpu, vm, m, value).is_err();
            }
            _ => err = true,
        }
    }

    if err {
        crate::pr_warn!("vm{}: wrmsr {:#x} <- {:#x} rejected", vm.vm_id, m, value);
        virq::vcpu_inject_gp(vcpu, 0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::fixture_vm;

    #[test]
    fn guest_msr_index_covers_world_common_and_cat() {
        assert_eq!(guest_msr_index(msr::MSR_IA32_PAT), Some(0));
        assert_eq!(guest_msr_index(msr::MSR_IA32_TSC_ADJUST), Some(1));
        assert!(guest_msr_index(msr::MSR_IA32_SPEC_CTRL).unwrap() >= NUM_WORLD_MSRS);
        let l2_0 = guest_msr_index(msr::MSR_IA32_L2_MASK_BASE).unwrap();
        let l3_0 = guest_msr_index(msr::MSR_IA32_L3_MASK_BASE).unwrap();
        assert_eq!(l3_0 - l2_0, CAT_MSRS_PER_RES);
        assert!(guest_msr_index(0x1234_5678).is_none());
        assert!(NUM_GUEST_MSRS > l3_0 + 7);
    }

    #[test]
    fn pat_validation() {
        assert!(pat_value_is_valid(msr::PAT_POWER_ON_VALUE));
        assert!(pat_value_is_valid(0)); /* all UC */
        assert!(!pat_value_is_valid(0x0000_0000_0000_0002)); /* type 2 reserved */
        assert!(!pat_value_is_valid(0x0300_0000_0000_0000));
    }

    #[test]
    fn efer_write_preserves_lma_and_rejects_reserved() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        vcpu.set_efer(msr::MSR_IA32_EFER_LMA_BIT);
        write_efer_msr(vcpu, msr::MSR_IA32_EFER_LME_BIT | msr::MSR_IA32_EFER_NXE_BIT)
            .unwrap();
        let efer = vcpu.get_efer();
        assert!(efer & msr::MSR_IA32_EFER_LMA_BIT != 0);
        assert!(efer & msr::MSR_IA32_EFER_LME_BIT != 0);

        assert!(write_efer_msr(vcpu, 1 << 20).is_err());
    }

    #[test]
    fn bitmap_intercept_layout() {
        let mut bitmap = [0u8; 4096];
        enable_msr_interception(&mut bitmap, 0x277, INTERCEPT_READ | INTERCEPT_WRITE);
        assert_eq!(bitmap[0x277 / 8], 1 << (0x277 % 8));
        assert_eq!(bitmap[2048 + 0x277 / 8], 1 << (0x277 % 8));

        enable_msr_interception(&mut bitmap, 0xC000_0080, INTERCEPT_WRITE);
        assert_eq!(bitmap[1024 + 0x80 / 8], 0);
        assert_eq!(bitmap[3072 + 0x80 / 8], 1 << (0x80 % 8));

        // Out-of-range MSRs are ignored.
        enable_msr_interception(&mut bitmap, 0x8000_0000, INTERCEPT_READ);
    }

    #[test]
    fn rdmsr_of_apic_base_reports_x2apic_and_bsp() {
        let vm = fixture_vm(2);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        vcpu.set_gpreg(CpuReg::Rcx, msr::MSR_IA32_APIC_BASE as u64);
        rdmsr_vmexit_handler(cell, vcpu, &vm).unwrap();
        let value = vcpu.get_gpreg(CpuReg::Rax);
        assert!(value & (1 << 8) != 0, "vcpu0 is the BSP");
        assert!(value & (0x3 << 10) == 0x3 << 10, "x2apic mode");

        let ap = vm.vcpu(1).unwrap();
        // SAFETY: as above.
        let ap_body = unsafe { ap.body_mut() };
        ap_body.set_gpreg(CpuReg::Rcx, msr::MSR_IA32_APIC_BASE as u64);
        rdmsr_vmexit_handler(ap, ap_body, &vm).unwrap();
        assert!(ap_body.get_gpreg(CpuReg::Rax) & (1 << 8) == 0);
    }

    #[test]
    fn unknown_msr_injects_gp() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        vcpu.set_gpreg(CpuReg::Rcx, 0xDEAD);
        rdmsr_vmexit_handler(cell, vcpu, &vm).unwrap();
        assert_eq!(vcpu.arch.exception_info.exception, virq::IDT_GP);
    }

    #[test]
    fn x2apic_eoi_write_retires_and_forwards_level() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        cell.shared.vlapic.accept_intr(0x77, false);
        cell.shared.vlapic.intr_accepted(0x77);

        vcpu.set_gpreg(CpuReg::Rcx, msr::MSR_IA32_EXT_APIC_EOI as u64);
        vcpu.set_gpreg(CpuReg::Rax, 0);
        vcpu.set_gpreg(CpuReg::Rdx, 0);
        wrmsr_vmexit_handler(cell, vcpu, &vm).unwrap();
        assert_eq!(cell.shared.vlapic.pending_intr(), None);
    }
}
