//! The reason-indexed VM-exit dispatcher.
//!
//! One entry per basic exit reason: the handler plus whether the exit
//! qualification should be fetched up front. Exits that the engine never
//! enables land on `unhandled`; the VMX-instruction family lands on
//! `undefined`, which injects #UD.

use partivisor_hal::vmx::{
    self, exec_vmread, exec_vmread32, exec_vmwrite32, NR_VMX_EXIT_REASONS,
    VMX_EXIT_QUALIFICATION, VMX_GUEST_CS_ATTR, VMX_IDT_VEC_ERROR_CODE,
    VMX_IDT_VEC_INFO_FIELD, VMX_INT_INFO_ERR_CODE_VALID, VMX_INT_INFO_VALID,
    VMX_INT_TYPE_HW_EXP, VMX_INT_TYPE_MASK, VMX_INT_TYPE_NMI,
    VMX_PROCBASED_CTLS_MON_TRAP, VMX_PROC_VM_EXEC_CONTROLS,
};
use partivisor_hal::{cpu_caps, cpuid, percpu};

use crate::error::HvErr;
use crate::io_emul;
use crate::schedule::{VCPU_EVENT_SPLIT_LOCK, VCPU_EVENT_VIRTUAL_INTERRUPT};
use crate::vcpu::{CpuReg, Vcpu, VcpuCell};
use crate::vcpuid;
use crate::virq::{self, REQ_SPLIT_LOCK, REQ_WAIT_WBINVD};
use crate::virtual_cr;
use crate::vm::{self, Vm};
use crate::vmsr;

type ExitHandler = fn(&VcpuCell, &mut Vcpu, &Vm) -> Result<(), HvErr>;

#[derive(Clone, Copy)]
struct VmExitDispatch {
    handler: ExitHandler,
    need_exit_qualification: bool,
}

const fn entry(handler: ExitHandler) -> VmExitDispatch {
    VmExitDispatch {
        handler,
        need_exit_qualification: false,
    }
}

const fn entry_qual(handler: ExitHandler) -> VmExitDispatch {
    VmExitDispatch {
        handler,
        need_exit_qualification: true,
    }
}

static DISPATCH_TABLE: [VmExitDispatch; NR_VMX_EXIT_REASONS] = {
    let mut t = [entry(unhandled_vmexit_handler); NR_VMX_EXIT_REASONS];
    t[vmx::VMX_EXIT_REASON_EXCEPTION_OR_NMI as usize] = entry(exception_or_nmi_handler);
    t[vmx::VMX_EXIT_REASON_EXTERNAL_INTERRUPT as usize] = entry(external_interrupt_handler);
    t[vmx::VMX_EXIT_REASON_TRIPLE_FAULT as usize] = entry(triple_fault_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_INIT_SIGNAL as usize] = entry(init_signal_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_INTERRUPT_WINDOW as usize] = entry(interrupt_window_handler);
    t[vmx::VMX_EXIT_REASON_NMI_WINDOW as usize] = entry(nmi_window_handler);
    t[vmx::VMX_EXIT_REASON_CPUID as usize] = entry(cpuid_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_HLT as usize] = entry(hlt_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMCALL as usize] = entry(vmcall_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_RDPMC as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMPTRST as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMCLEAR as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMLAUNCH as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMPTRLD as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMREAD as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMRESUME as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMWRITE as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMXOFF as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMXON as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_INVEPT as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_INVVPID as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VMFUNC as usize] = entry(undefined_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_CR_ACCESS as usize] = entry_qual(cr_access_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_IO_INSTRUCTION as usize] = entry_qual(pio_instr_handler);
    t[vmx::VMX_EXIT_REASON_RDMSR as usize] = entry(rdmsr_handler);
    t[vmx::VMX_EXIT_REASON_WRMSR as usize] = entry(wrmsr_handler);
    t[vmx::VMX_EXIT_REASON_MONITOR_TRAP as usize] = entry(mtf_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_PAUSE as usize] = entry(pause_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_TPR_BELOW_THRESHOLD as usize] =
        entry(tpr_below_threshold_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_APIC_ACCESS as usize] = entry_qual(apic_access_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_VIRTUALIZED_EOI as usize] = entry_qual(veoi_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_EPT_VIOLATION as usize] = entry_qual(ept_violation_handler);
    t[vmx::VMX_EXIT_REASON_EPT_MISCONFIGURATION as usize] =
        entry_qual(ept_misconfig_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_WBINVD as usize] = entry(wbinvd_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_XSETBV as usize] = entry(xsetbv_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_APIC_WRITE as usize] = entry_qual(apic_write_vmexit_handler);
    t[vmx::VMX_EXIT_REASON_LOADIWKEY as usize] = entry(loadiwkey_vmexit_handler);
    t
};

/// Top of the exit path, called from the per-pCPU run loop right after
/// the hardware exit.
pub fn vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    if percpu::get_pcpu_id() != vcpu.pcpu_id {
        crate::pr_fatal!("vcpu{} handled off its pcpu", vcpu.vcpu_id);
        return Err(HvErr::Inval);
    }

    // Reclaim whatever event the exit interrupted; hardware exceptions and
    // NMIs are requeued, everything else is re-injected verbatim.
    // SAFETY: owning pCPU, right after the exit.
    vcpu.arch.idt_vectoring_info = unsafe { exec_vmread32(VMX_IDT_VEC_INFO_FIELD) };
    if vcpu.arch.idt_vectoring_info & VMX_INT_INFO_VALID != 0 {
        let info = vcpu.arch.idt_vectoring_info;
        let vector = info & 0xFF;
        let int_type = (info & VMX_INT_TYPE_MASK) >> 8;
        if int_type == VMX_INT_TYPE_HW_EXP {
            let err_code = if info & VMX_INT_INFO_ERR_CODE_VALID != 0 {
                // SAFETY: as above.
                unsafe { exec_vmread32(VMX_IDT_VEC_ERROR_CODE) }
            } else {
                0
            };
            let _ = virq::vcpu_queue_exception(vcpu, vector, err_code);
            vcpu.arch.idt_vectoring_info = 0;
        } else if int_type == VMX_INT_TYPE_NMI {
            virq::vcpu_make_request(&cell.shared, virq::REQ_NMI);
            vcpu.arch.idt_vectoring_info = 0;
        }
    }

    let basic_reason = (vcpu.arch.exit_reason & 0xFFFF) as usize;
    if basic_reason >= NR_VMX_EXIT_REASONS {
        crate::pr_err!("invalid exit reason {:#x}", vcpu.arch.exit_reason);
        return Err(HvErr::Inval);
    }

    let dispatch = &DISPATCH_TABLE[basic_reason];
    if dispatch.need_exit_qualification {
        // SAFETY: as above.
        vcpu.arch.exit_qualification = unsafe { exec_vmread(VMX_EXIT_QUALIFICATION) };
    }

    let ret = (dispatch.handler)(cell, vcpu, vm);

    crate::pr_dbg!(
        "vm{} vcpu{} exit reason {:#x}",
        vm.vm_id,
        vcpu.vcpu_id,
        basic_reason
    );
    ret
}

fn unhandled_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    let rip = vcpu.get_rip();
    crate::pr_fatal!(
        "unhandled exit {:#x} at guest rip {:#x}",
        vcpu.arch.exit_reason,
        rip
    );
    Ok(())
}

/// VMX-family and other never-enabled instructions surface as #UD.
fn undefined_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    virq::vcpu_inject_ud(vcpu);
    Ok(())
}

fn triple_fault_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    vm::triple_fault_shutdown_vm(vm, vcpu.vcpu_id);
    Ok(())
}

/// INIT while in VMX non-root alters nothing; keep RIP and move on.
fn init_signal_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    vcpu.retain_rip();
    Ok(())
}

fn interrupt_window_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    virq::interrupt_window_vmexit_handler(vcpu)
}

fn nmi_window_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    virq::nmi_window_vmexit_handler(vcpu)
}

fn external_interrupt_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    virq::external_interrupt_vmexit_handler(vcpu, vm)
}

fn cpuid_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    vcpuid::cpuid_vmexit_handler(cell, vcpu, vm);
    Ok(())
}

fn pause_vmexit_handler(_cell: &VcpuCell, _vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    core::hint::spin_loop();
    Ok(())
}

fn hlt_vmexit_handler(cell: &VcpuCell, _vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    let pending = cell
        .shared
        .pending_req
        .load(core::sync::atomic::Ordering::Acquire);
    if pending == 0 && !cell.shared.vlapic.has_pending_intr() {
        cell.shared.events[VCPU_EVENT_VIRTUAL_INTERRUPT].wait();
    }
    Ok(())
}

fn vmcall_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    crate::hypercall::vmcall_vmexit_handler(cell, vcpu, vm)
}

fn rdmsr_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    vmsr::rdmsr_vmexit_handler(cell, vcpu, vm)
}

fn wrmsr_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    vmsr::wrmsr_vmexit_handler(cell, vcpu, vm)
}

fn pio_instr_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    io_emul::pio_instr_vmexit_handler(vcpu, vm)
}

fn ept_violation_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    io_emul::ept_violation_vmexit_handler(vcpu, vm)
}

/// A live misconfigured leaf means corrupted tables: fatal for the VM.
fn ept_misconfig_vmexit_handler(
    _cell: &VcpuCell,
    vcpu: &mut Vcpu,
    vm: &Vm,
) -> Result<(), HvErr> {
    crate::pr_fatal!(
        "vm{}: EPT misconfiguration at qual {:#x}",
        vm.vm_id,
        vcpu.arch.exit_qualification
    );
    vm.shutdown();
    Ok(())
}

/* ---- CR access ---- */

fn cr_access_type(qual: u64) -> u64 {
    (qual >> 4) & 0x3
}

fn cr_access_num(qual: u64) -> u64 {
    qual & 0xF
}

fn cr_access_reg_idx(qual: u64) -> u32 {
    ((qual >> 8) & 0xF) as u32
}

const GPR_ORDER: [CpuReg; 16] = [
    CpuReg::Rax,
    CpuReg::Rcx,
    CpuReg::Rdx,
    CpuReg::Rbx,
    CpuReg::Rsp,
    CpuReg::Rbp,
    CpuReg::Rsi,
    CpuReg::Rdi,
    CpuReg::R8,
    CpuReg::R9,
    CpuReg::R10,
    CpuReg::R11,
    CpuReg::R12,
    CpuReg::R13,
    CpuReg::R14,
    CpuReg::R15,
];

fn cr_access_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    let qual = vcpu.arch.exit_qualification;
    let reg = GPR_ORDER[cr_access_reg_idx(qual) as usize];

    match (cr_access_type(qual), cr_access_num(qual)) {
        (0, 0) => {
            // mov to cr0
            let value = vcpu.get_gpreg(reg);
            virtual_cr::vmx_write_cr0(vcpu, value);
        }
        (0, 4) => {
            // mov to cr4
            let value = vcpu.get_gpreg(reg);
            virtual_cr::vmx_write_cr4(vcpu, value);
        }
        (2, _) => {
            // CLTS
            let cr0 = virtual_cr::guest_cr0(vcpu);
            virtual_cr::vmx_write_cr0(vcpu, cr0 & !virtual_cr::CR0_TS);
        }
        (3, _) => {
            // LMSW loads the low four CR0 bits; source is qual[16..32].
            let source = (qual >> 16) & 0xF;
            let cr0 = virtual_cr::guest_cr0(vcpu);
            virtual_cr::vmx_write_cr0(vcpu, (cr0 & !0xEu64) | (source & 0xF));
        }
        (t, n) => {
            crate::pr_err!("unhandled CR access type {} cr{}", t, n);
            return Err(HvErr::Inval);
        }
    }
    Ok(())
}

/* ---- caches ---- */

fn wbinvd_vmexit_handler(cell: &VcpuCell, _vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    if !vm::has_rt_vm() {
        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
            // SAFETY: CPL0 on hardware.
            unsafe { vmx::wbinvd() };
        }
    } else if vm.is_rt_vm() {
        vm.walk_ept(crate::ept::ept_flush_leaf_page);
    } else {
        let _guard = vm.wbinvd_lock.lock();
        vm.foreach_vcpu(|other| {
            if other.shared.vcpu_id != cell.shared.vcpu_id {
                virq::vcpu_make_request(&other.shared, REQ_WAIT_WBINVD);
            }
        });

        vm.walk_ept(crate::ept::ept_flush_leaf_page);

        vm.foreach_vcpu(|other| {
            if other.shared.vcpu_id != cell.shared.vcpu_id {
                other.shared.events[crate::schedule::VCPU_EVENT_SYNC_WBINVD].signal();
            }
        });
    }
    Ok(())
}

/* ---- XSETBV ---- */

fn xsetbv_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    if !vcpu.arch.xsave_enabled
        || virtual_cr::guest_cr4(vcpu) & virtual_cr::CR4_OSXSAVE == 0
    {
        virq::vcpu_inject_ud(vcpu);
        return Ok(());
    }

    // SAFETY: owning pCPU, VMCS current.
    let cpl = unsafe { (exec_vmread32(VMX_GUEST_CS_ATTR) >> 5) & 3 };
    let idx = vcpu.get_gpreg(CpuReg::Rcx) & 0xFFFF_FFFF;
    let value = (vcpu.get_gpreg(CpuReg::Rax) & 0xFFFF_FFFF)
        | (vcpu.get_gpreg(CpuReg::Rdx) << 32);

    if cpl != 0 || idx != 0 || !vcpuid::is_valid_guest_xcr0(value) {
        virq::vcpu_inject_gp(vcpu, 0);
        return Ok(());
    }

    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVE) {
        // SAFETY: legality vetted above; CR4.OSXSAVE is set.
        unsafe { vmx::write_xcr(0, value) };
    }
    Ok(())
}

/* ---- split-lock emulation ---- */

const IDT_AC: u32 = 17;

/// #AC taken for a split-locked operation: freeze the peers, single-step
/// the offending instruction under MTF, then release.
pub fn begin_split_lock_emulation(
    cell: &VcpuCell,
    vcpu: &mut Vcpu,
    vm: &Vm,
    vector: u32,
    err_code: u32,
) -> bool {
    if vector != IDT_AC || err_code != 0 {
        return false;
    }
    if !cpu_caps::cpu_caps().has_core_cap(1 << 5) {
        // No split-lock detection on this machine: a genuine #AC.
        return false;
    }
    if !vcpu.arch.emulating_lock {
        vcpu.arch.emulating_lock = true;
        vm.foreach_vcpu(|other| {
            if other.shared.vcpu_id != cell.shared.vcpu_id {
                virq::vcpu_make_request(&other.shared, REQ_SPLIT_LOCK);
            }
        });
        vcpu.arch.proc_vm_exec_ctrls |= VMX_PROCBASED_CTLS_MON_TRAP;
        // SAFETY: owning pCPU, VMCS current.
        unsafe { exec_vmwrite32(VMX_PROC_VM_EXEC_CONTROLS, vcpu.arch.proc_vm_exec_ctrls) };
    }
    vcpu.retain_rip();
    true
}

fn complete_split_lock_emulation(cell: &VcpuCell, vm: &Vm) {
    vm.foreach_vcpu(|other| {
        if other.shared.vcpu_id != cell.shared.vcpu_id {
            other.shared.events[VCPU_EVENT_SPLIT_LOCK].signal();
        }
    });
}

/// MTF exit: the stepped instruction finished; stop trapping and release
/// the frozen peers.
fn mtf_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    vcpu.arch.proc_vm_exec_ctrls &= !VMX_PROCBASED_CTLS_MON_TRAP;
    // SAFETY: owning pCPU, VMCS current.
    unsafe { exec_vmwrite32(VMX_PROC_VM_EXEC_CONTROLS, vcpu.arch.proc_vm_exec_ctrls) };
    vcpu.retain_rip();

    if vcpu.arch.emulating_lock {
        vcpu.arch.emulating_lock = false;
        complete_split_lock_emulation(cell, vm);
    }
    Ok(())
}

fn exception_or_nmi_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    // SAFETY: owning pCPU, right after the exit.
    let intinfo = unsafe { exec_vmread32(partivisor_hal::vmx::VMX_EXIT_INT_INFO) };
    if intinfo & VMX_INT_INFO_VALID != 0 {
        let vector = intinfo & 0xFF;
        let err_code = if intinfo & VMX_INT_INFO_ERR_CODE_VALID != 0 {
            // SAFETY: as above.
            unsafe { exec_vmread32(partivisor_hal::vmx::VMX_EXIT_INT_ERROR_CODE) }
        } else {
            0
        };
        if begin_split_lock_emulation(cell, vcpu, vm, vector, err_code) {
            return Ok(());
        }
    }
    virq::exception_vmexit_handler(vcpu)
}

/* ---- APICv surface ---- */

fn veoi_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    // Virtualized EOI: the in-service retirement already happened in the
    // virtual APIC page; propagate the level EOI to the vIOAPIC.
    let vector = (vcpu.arch.exit_qualification & 0xFF) as u32;
    vm.vioapic().process_eoi(vm, vector);
    Ok(())
}

fn apic_access_vmexit_handler(
    _cell: &VcpuCell,
    vcpu: &mut Vcpu,
    vm: &Vm,
) -> Result<(), HvErr> {
    // x2APIC-only guests reach the APIC through MSRs; a stray xAPIC MMIO
    // access has nothing behind it.
    crate::pr_err!(
        "vm{}: unexpected xAPIC access, qual {:#x}",
        vm.vm_id,
        vcpu.arch.exit_qualification
    );
    virq::vcpu_inject_gp(vcpu, 0);
    Ok(())
}

fn apic_write_vmexit_handler(
    _cell: &VcpuCell,
    vcpu: &mut Vcpu,
    _vm: &Vm,
) -> Result<(), HvErr> {
    let offset = vcpu.arch.exit_qualification & 0xFFF;
    crate::pr_warn!("apic-write exit at offset {:#x} ignored", offset);
    vcpu.retain_rip();
    Ok(())
}

fn tpr_below_threshold_vmexit_handler(
    cell: &VcpuCell,
    vcpu: &mut Vcpu,
    _vm: &Vm,
) -> Result<(), HvErr> {
    // The lowered TPR may unblock a pending vector; re-evaluate on entry.
    virq::vcpu_make_request(&cell.shared, virq::REQ_EVENT);
    vcpu.retain_rip();
    Ok(())
}

/* ---- KeyLocker ---- */

fn loadiwkey_vmexit_handler(_cell: &VcpuCell, vcpu: &mut Vcpu, _vm: &Vm) -> Result<(), HvErr> {
    // Backup and randomization flavors are not virtualized.
    if vcpu.get_gpreg(CpuReg::Rax) != 0 {
        virq::vcpu_inject_gp(vcpu, 0);
        return Ok(());
    }
    let mut xmm = [0u64; 12];
    // SAFETY: SSE state live in root mode.
    unsafe { vmx::read_xmm_0_5(&mut xmm) };
    // Integrity key rides in XMM0, encryption key in XMM1:XMM2.
    vcpu.arch.iwkey.integrity_key[0] = xmm[0];
    vcpu.arch.iwkey.integrity_key[1] = xmm[1];
    vcpu.arch.iwkey.encryption_key[0] = xmm[2];
    vcpu.arch.iwkey.encryption_key[1] = xmm[3];
    vcpu.arch.iwkey.encryption_key[2] = xmm[4];
    vcpu.arch.iwkey.encryption_key[3] = xmm[5];

    // SAFETY: KeyLocker enabled per the exit's existence.
    unsafe { vmx::asm_loadiwkey(&xmm) };
    percpu::get_pcpu_region(vcpu.pcpu_id)
        .whose_iwkey
        .store(vcpu as *const Vcpu as usize, core::sync::atomic::Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_architected_reasons() {
        // Spot checks: these must not fall through to `unhandled`.
        for reason in [
            vmx::VMX_EXIT_REASON_CPUID,
            vmx::VMX_EXIT_REASON_HLT,
            vmx::VMX_EXIT_REASON_CR_ACCESS,
            vmx::VMX_EXIT_REASON_IO_INSTRUCTION,
            vmx::VMX_EXIT_REASON_EPT_VIOLATION,
            vmx::VMX_EXIT_REASON_WBINVD,
            vmx::VMX_EXIT_REASON_XSETBV,
            vmx::VMX_EXIT_REASON_LOADIWKEY,
        ] {
            let d = &DISPATCH_TABLE[reason as usize];
            assert_ne!(d.handler as usize, unhandled_vmexit_handler as usize);
        }
        // And the VMX family injects #UD.
        for reason in [
            vmx::VMX_EXIT_REASON_VMLAUNCH,
            vmx::VMX_EXIT_REASON_VMRESUME,
            vmx::VMX_EXIT_REASON_VMXON,
            vmx::VMX_EXIT_REASON_INVEPT,
        ] {
            let d = &DISPATCH_TABLE[reason as usize];
            assert_eq!(d.handler as usize, undefined_vmexit_handler as usize);
        }
    }

    #[test]
    fn qualification_prefetch_flags() {
        assert!(DISPATCH_TABLE[vmx::VMX_EXIT_REASON_CR_ACCESS as usize].need_exit_qualification);
        assert!(
            DISPATCH_TABLE[vmx::VMX_EXIT_REASON_EPT_VIOLATION as usize]
                .need_exit_qualification
        );
        assert!(!DISPATCH_TABLE[vmx::VMX_EXIT_REASON_CPUID as usize].need_exit_qualification);
        assert!(!DISPATCH_TABLE[vmx::VMX_EXIT_REASON_HLT as usize].need_exit_qualification);
    }

    #[test]
    fn cr_qualification_decode() {
        // mov cr4, r12: type 0, cr 4, reg 12.
        let qual = 0x4u64 | (12 << 8);
        assert_eq!(cr_access_type(qual), 0);
        assert_eq!(cr_access_num(qual), 4);
        assert_eq!(cr_access_reg_idx(qual), 12);
        assert_eq!(GPR_ORDER[12], CpuReg::R12);
        // lmsw with source 0b1011 in qual[19:16].
        let qual = (3u64 << 4) | (0xB << 16);
        assert_eq!(cr_access_type(qual), 3);
        assert_eq!((qual >> 16) & 0xF, 0xB);
    }
}
