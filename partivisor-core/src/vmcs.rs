//! VMCS programming for one vCPU: host state, guest init state and the
//! execution/entry/exit controls, every control adjusted against the
//! allowed-0/allowed-1 capability words.
//!
//! Everything here runs on the vCPU's own pCPU, in VMX root, with the
//! vCPU's VMCS made current first — it is driven by the `INIT_VMCS`
//! pending-request bit.

use partivisor_hal::msr::{self, rdmsr};
use partivisor_hal::page::Page;
use partivisor_hal::smp;
use partivisor_hal::vmx::{self, exec_vmwrite, exec_vmwrite32};
use partivisor_hal::{cpu_caps, hva2hpa};

use crate::vcpu::{SegDescriptor, Vcpu};
use crate::virtual_cr;
use crate::vm::Vm;
use crate::vmsr;

/// Adjust a 32-bit control word: allowed-0 bits forced on, everything not
/// allowed-1 forced off.
fn check_vmx_ctrl(cap_msr_value: u64, wanted: u32) -> u32 {
    let allowed0 = cap_msr_value as u32;
    let allowed1 = (cap_msr_value >> 32) as u32;
    let value = (wanted | allowed0) & allowed1;
    if wanted & !value != 0 {
        crate::pr_warn!(
            "vmx ctrl bits {:#x} not supported by the platform",
            wanted & !value
        );
    }
    value
}

fn write_segment(seg: &SegDescriptor, sel: u32, base: u32, limit: u32, attr: u32) {
    // SAFETY: callers hold the VMCS-current contract of this module.
    unsafe {
        exec_vmwrite(sel, seg.selector as u64);
        exec_vmwrite(base, seg.base);
        exec_vmwrite32(limit, seg.limit);
        exec_vmwrite32(attr, seg.attr);
    }
}

fn init_host_state(vcpu: &Vcpu) {
    let pcpu_id = vcpu.pcpu_id;
    // SAFETY: CPL0 on the owning pCPU, VMCS current.
    unsafe {
        exec_vmwrite(vmx::VMX_HOST_CS_SEL, smp::host_gdt_code_sel() as u64);
        for field in [
            vmx::VMX_HOST_ES_SEL,
            vmx::VMX_HOST_SS_SEL,
            vmx::VMX_HOST_DS_SEL,
            vmx::VMX_HOST_FS_SEL,
            vmx::VMX_HOST_GS_SEL,
        ] {
            exec_vmwrite(field, smp::host_gdt_data_sel() as u64);
        }
        exec_vmwrite(vmx::VMX_HOST_TR_SEL, smp::host_gdt_tss_sel() as u64);

        exec_vmwrite(vmx::VMX_HOST_CR0, smp::host_cr0());
        exec_vmwrite(vmx::VMX_HOST_CR3, smp::host_cr3());
        exec_vmwrite(vmx::VMX_HOST_CR4, smp::host_cr4());

        exec_vmwrite(vmx::VMX_HOST_GDTR_BASE, smp::host_gdt_base(pcpu_id));
        exec_vmwrite(vmx::VMX_HOST_IDTR_BASE, smp::read_idtr_base());
        exec_vmwrite(vmx::VMX_HOST_TR_BASE, smp::host_tss_base(pcpu_id));

        exec_vmwrite(vmx::VMX_HOST_FS_BASE, rdmsr(msr::MSR_IA32_FS_BASE));
        exec_vmwrite(vmx::VMX_HOST_GS_BASE, rdmsr(msr::MSR_IA32_GS_BASE));
        exec_vmwrite32(
            vmx::VMX_HOST_IA32_SYSENTER_CS,
            rdmsr(msr::MSR_IA32_SYSENTER_CS) as u32,
        );
        exec_vmwrite(
            vmx::VMX_HOST_IA32_SYSENTER_ESP,
            rdmsr(msr::MSR_IA32_SYSENTER_ESP),
        );
        exec_vmwrite(
            vmx::VMX_HOST_IA32_SYSENTER_EIP,
            rdmsr(msr::MSR_IA32_SYSENTER_EIP),
        );
        exec_vmwrite(vmx::VMX_HOST_IA32_PAT_FULL, rdmsr(msr::MSR_IA32_PAT));
        exec_vmwrite(vmx::VMX_HOST_IA32_EFER_FULL, rdmsr(msr::MSR_IA32_EFER));

        // HOST_RSP is rewritten by the entry assembly on every run.
        exec_vmwrite(vmx::VMX_HOST_RIP, vmx::vmexit_entry_hva());
    }
}

fn init_guest_state(vcpu: &mut Vcpu) {
    let world = vcpu.arch.cur_context;
    // Copy out what we need before taking VMCS writes.
    let (run_rip, run_rsp, run_rflags, run_efer) = {
        let run = &vcpu.arch.contexts[world].run_ctx;
        (run.rip, run.rsp, run.rflags, run.ia32_efer)
    };
    let ext = &vcpu.arch.contexts[world].ext_ctx;

    write_segment(
        &ext.cs,
        vmx::VMX_GUEST_CS_SEL,
        vmx::VMX_GUEST_CS_BASE,
        vmx::VMX_GUEST_CS_LIMIT,
        vmx::VMX_GUEST_CS_ATTR,
    );
    write_segment(
        &ext.ss,
        vmx::VMX_GUEST_SS_SEL,
        vmx::VMX_GUEST_SS_BASE,
        vmx::VMX_GUEST_SS_LIMIT,
        vmx::VMX_GUEST_SS_ATTR,
    );
    write_segment(
        &ext.ds,
        vmx::VMX_GUEST_DS_SEL,
        vmx::VMX_GUEST_DS_BASE,
        vmx::VMX_GUEST_DS_LIMIT,
        vmx::VMX_GUEST_DS_ATTR,
    );
    write_segment(
        &ext.es,
        vmx::VMX_GUEST_ES_SEL,
        vmx::VMX_GUEST_ES_BASE,
        vmx::VMX_GUEST_ES_LIMIT,
        vmx::VMX_GUEST_ES_ATTR,
    );
    write_segment(
        &ext.fs,
        vmx::VMX_GUEST_FS_SEL,
        vmx::VMX_GUEST_FS_BASE,
        vmx::VMX_GUEST_FS_LIMIT,
        vmx::VMX_GUEST_FS_ATTR,
    );
    write_segment(
        &ext.gs,
        vmx::VMX_GUEST_GS_SEL,
        vmx::VMX_GUEST_GS_BASE,
        vmx::VMX_GUEST_GS_LIMIT,
        vmx::VMX_GUEST_GS_ATTR,
    );
    write_segment(
        &ext.tr,
        vmx::VMX_GUEST_TR_SEL,
        vmx::VMX_GUEST_TR_BASE,
        vmx::VMX_GUEST_TR_LIMIT,
        vmx::VMX_GUEST_TR_ATTR,
    );
    write_segment(
        &ext.ldtr,
        vmx::VMX_GUEST_LDTR_SEL,
        vmx::VMX_GUEST_LDTR_BASE,
        vmx::VMX_GUEST_LDTR_LIMIT,
        vmx::VMX_GUEST_LDTR_ATTR,
    );

    // SAFETY: VMCS current on the owning pCPU.
    unsafe {
        exec_vmwrite(vmx::VMX_GUEST_GDTR_BASE, ext.gdtr.base);
        exec_vmwrite32(vmx::VMX_GUEST_GDTR_LIMIT, ext.gdtr.limit);
        exec_vmwrite(vmx::VMX_GUEST_IDTR_BASE, ext.idtr.base);
        exec_vmwrite32(vmx::VMX_GUEST_IDTR_LIMIT, ext.idtr.limit);

        exec_vmwrite(vmx::VMX_GUEST_CR3, ext.cr3);
        exec_vmwrite(vmx::VMX_GUEST_DR7, ext.dr7);
        exec_vmwrite(vmx::VMX_GUEST_IA32_DEBUGCTL_FULL, ext.ia32_debugctl);
        exec_vmwrite(vmx::VMX_GUEST_IA32_PAT_FULL, ext.ia32_pat);
        exec_vmwrite32(vmx::VMX_GUEST_IA32_SYSENTER_CS, ext.ia32_sysenter_cs);
        exec_vmwrite(vmx::VMX_GUEST_IA32_SYSENTER_ESP, ext.ia32_sysenter_esp);
        exec_vmwrite(vmx::VMX_GUEST_IA32_SYSENTER_EIP, ext.ia32_sysenter_eip);

        exec_vmwrite(vmx::VMX_GUEST_RIP, run_rip);
        exec_vmwrite(vmx::VMX_GUEST_RSP, run_rsp);
        exec_vmwrite(vmx::VMX_GUEST_RFLAGS, run_rflags);
        exec_vmwrite(vmx::VMX_GUEST_IA32_EFER_FULL, run_efer);

        exec_vmwrite(vmx::VMX_VMS_LINK_PTR_FULL, !0u64);
        exec_vmwrite32(vmx::VMX_GUEST_ACTIVITY_STATE, 0);
        exec_vmwrite32(vmx::VMX_GUEST_INTERRUPTIBILITY_INFO, 0);
        exec_vmwrite(vmx::VMX_GUEST_PENDING_DEBUG_EXCEPT, 0);
        exec_vmwrite(vmx::VMX_TSC_OFFSET_FULL, ext.tsc_offset);
    }

    // Initial CR0/CR4 flow through the trap logic so the shadow, the
    // hardware value and the cache line up.
    let cr0 = vcpu.arch.contexts[world].run_ctx.cr0;
    let cr4 = vcpu.arch.contexts[world].run_ctx.cr4;
    virtual_cr::init_cr0_cr4_host_guest_mask();
    virtual_cr::vmx_write_cr0(vcpu, cr0);
    virtual_cr::vmx_write_cr4(vcpu, cr4);
}

/// #MC always exits; #AC exits when split-lock emulation is armed.
const INIT_EXCEPTION_BITMAP: u32 = (1 << 18) | (1 << 17);

fn init_exec_controls(vcpu: &mut Vcpu, vm: &Vm) {
    let caps = cpu_caps::cpu_caps();

    let pin = check_vmx_ctrl(
        caps.vmx.pinbased,
        vmx::VMX_PINBASED_CTLS_IRQ_EXIT | vmx::VMX_PINBASED_CTLS_NMI_EXIT,
    );

    let proc_wanted = vmx::VMX_PROCBASED_CTLS_TSC_OFF
        | vmx::VMX_PROCBASED_CTLS_TPR_SHADOW
        | vmx::VMX_PROCBASED_CTLS_IO_BITMAP
        | vmx::VMX_PROCBASED_CTLS_MSR_BITMAP
        | vmx::VMX_PROCBASED_CTLS_HLT
        | vmx::VMX_PROCBASED_CTLS_SECONDARY;
    let mut proc = check_vmx_ctrl(caps.vmx.procbased, proc_wanted);
    // CR3 accesses stay passthrough with EPT; force the exiting bits off.
    proc &= !(vmx::VMX_PROCBASED_CTLS_CR3_LOAD | vmx::VMX_PROCBASED_CTLS_CR3_STORE);

    let proc2_wanted = vmx::VMX_PROCBASED_CTLS2_EPT
        | vmx::VMX_PROCBASED_CTLS2_VPID
        | vmx::VMX_PROCBASED_CTLS2_VAPIC
        | vmx::VMX_PROCBASED_CTLS2_VX2APIC
        | vmx::VMX_PROCBASED_CTLS2_RDTSCP
        | vmx::VMX_PROCBASED_CTLS2_UNRESTRICT
        | vmx::VMX_PROCBASED_CTLS2_WBINVD
        | vmx::VMX_PROCBASED_CTLS2_XSVE_XRSTR
        | vmx::VMX_PROCBASED_CTLS2_INVPCID;
    let mut proc2 = check_vmx_ctrl(caps.vmx.procbased2, proc2_wanted);
    if !cpu_caps::is_apicv_advanced_feature_supported() {
        proc2 &= !(vmx::VMX_PROCBASED_CTLS2_VAPIC_REGS
            | vmx::VMX_PROCBASED_CTLS2_VIRQ_DELIVERY);
    }

    let exit = check_vmx_ctrl(
        caps.vmx.exit,
        vmx::VMX_EXIT_CTLS_HOST_ADDR64
            | vmx::VMX_EXIT_CTLS_SAVE_PAT
            | vmx::VMX_EXIT_CTLS_LOAD_PAT
            | vmx::VMX_EXIT_CTLS_SAVE_EFER
            | vmx::VMX_EXIT_CTLS_LOAD_EFER
            | vmx::VMX_EXIT_CTLS_ACK_IRQ,
    );

    let entry = check_vmx_ctrl(
        caps.vmx.entry,
        vmx::VMX_ENTRY_CTLS_LOAD_PAT | vmx::VMX_ENTRY_CTLS_LOAD_EFER,
    );

    vcpu.arch.proc_vm_exec_ctrls = proc;

    let eptp = vm.nworld_eptp_value();
    let io = vm.io().bitmap.read();

    // SAFETY: VMCS current on the owning pCPU.
    unsafe {
        exec_vmwrite32(vmx::VMX_PIN_VM_EXEC_CONTROLS, pin);
        exec_vmwrite32(vmx::VMX_PROC_VM_EXEC_CONTROLS, proc);
        exec_vmwrite32(vmx::VMX_PROC_VM_EXEC_CONTROLS2, proc2);
        exec_vmwrite32(vmx::VMX_EXIT_CONTROLS, exit);
        exec_vmwrite32(vmx::VMX_ENTRY_CONTROLS, entry);
        exec_vmwrite32(vmx::VMX_EXCEPTION_BITMAP, INIT_EXCEPTION_BITMAP);
        exec_vmwrite32(vmx::VMX_PF_ERROR_CODE_MASK, 0);
        exec_vmwrite32(vmx::VMX_PF_ERROR_CODE_MATCH, 0);
        exec_vmwrite32(vmx::VMX_CR3_TARGET_COUNT, 0);
        exec_vmwrite32(vmx::VMX_TPR_THRESHOLD, 0);

        exec_vmwrite(vmx::VMX_EPT_POINTER_FULL, eptp);
        exec_vmwrite(vmx::VMX_VPID, vcpu.arch.vpid as u64);

        exec_vmwrite(vmx::VMX_MSR_BITMAP_FULL, vm.msr_bitmap_hpa());
        exec_vmwrite(vmx::VMX_IO_BITMAP_A_FULL, io.bitmap_a_hpa());
        exec_vmwrite(vmx::VMX_IO_BITMAP_B_FULL, io.bitmap_b_hpa());
        exec_vmwrite(vmx::VMX_XSS_EXITING_BITMAP_FULL, 0);
    }
}

/// Auto-load area: PQR_ASSOC swaps between host and guest class of
/// service when vCAT is configured.
fn prepare_auto_msr_area(vcpu: &mut Vcpu, vm: &Vm) {
    vcpu.arch.msr_area.count = 0;

    if crate::vcat::is_vcat_configured(vm) {
        let idx = vcpu.arch.msr_area.count;
        vcpu.arch.msr_area.guest[idx] =
            partivisor_hal::vmx::MsrStoreEntry::new(msr::MSR_IA32_PQR_ASSOC);
        vcpu.arch.msr_area.host[idx] =
            partivisor_hal::vmx::MsrStoreEntry::new(msr::MSR_IA32_PQR_ASSOC);
        vcpu.arch.msr_area.index_of_pqr_assoc = idx;
        vcpu.arch.msr_area.count += 1;
    }

    let count = vcpu.arch.msr_area.count as u64;
    if count == 0 {
        return;
    }
    let guest_hpa = hva2hpa(vcpu.arch.msr_area.guest.as_ptr() as *const u8);
    let host_hpa = hva2hpa(vcpu.arch.msr_area.host.as_ptr() as *const u8);
    // SAFETY: VMCS current on the owning pCPU; the area lives in the boxed
    // vCPU body for its whole lifetime.
    unsafe {
        exec_vmwrite(vmx::VMX_ENTRY_MSR_LOAD_ADDR_FULL, guest_hpa);
        exec_vmwrite32(vmx::VMX_ENTRY_MSR_LOAD_COUNT, count as u32);
        exec_vmwrite(vmx::VMX_EXIT_MSR_STORE_ADDR_FULL, guest_hpa);
        exec_vmwrite32(vmx::VMX_EXIT_MSR_STORE_COUNT, count as u32);
        exec_vmwrite(vmx::VMX_EXIT_MSR_LOAD_ADDR_FULL, host_hpa);
        exec_vmwrite32(vmx::VMX_EXIT_MSR_LOAD_COUNT, count as u32);
    }
}

/// Bring this vCPU's VMCS up from scratch and make it current.
pub fn init_vmcs(vcpu: &mut Vcpu, vm: &Vm) {
    let revision = (cpu_caps::cpu_caps().vmx.basic & 0x7FFF_FFFF) as u32;
    let page = &mut vcpu.vmcs_page;
    page.0.fill(0);
    // SAFETY: exclusive ownership of the VMCS page.
    unsafe {
        core::ptr::write(page.0.as_mut_ptr() as *mut u32, revision);
    }
    let vmcs_hpa = hva2hpa(vcpu.vmcs_page.0.as_ptr());

    // SAFETY: VMX root on the owning pCPU; the page carries the revision.
    unsafe {
        let _ = vmx::vmclear(vmcs_hpa);
        let _ = vmx::vmptrld(vmcs_hpa);
    }
    vcpu.launched = false;
    vcpu.arch.xsave_enabled =
        cpu_caps::pcpu_has_cap(partivisor_hal::cpuid::X86_FEATURE_XSAVE);

    init_host_state(vcpu);
    init_exec_controls(vcpu, vm);
    init_guest_state(vcpu);
    vmsr::init_msr_emulation(vcpu, vm);
    prepare_auto_msr_area(vcpu, vm);
}

/// Make another vCPU's VMCS current on this pCPU (explicit migration path;
/// never on the hot path).
pub fn load_vmcs(vcpu: &Vcpu) {
    let vmcs_hpa = hva2hpa(vcpu.vmcs_page.0.as_ptr());
    // SAFETY: VMX root on the owning pCPU.
    unsafe {
        let _ = vmx::vmptrld(vmcs_hpa);
    }
}

/// Flush a VMCS from this processor before the vCPU can move.
pub fn clear_vmcs(vcpu: &mut Vcpu) {
    let vmcs_hpa = hva2hpa(vcpu.vmcs_page.0.as_ptr());
    // SAFETY: VMX root on the owning pCPU.
    unsafe {
        let _ = vmx::vmclear(vmcs_hpa);
    }
    vcpu.launched = false;
}

const _: () = assert!(core::mem::size_of::<Page>() == 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_adjustment_honors_allowed_bits() {
        // allowed-0 = 0x16 (always on), allowed-1 = 0xFFFF.
        let cap = 0xFFFFu64 << 32 | 0x16;
        let v = check_vmx_ctrl(cap, 0x81);
        assert_eq!(v, 0x81 | 0x16);
        // A wanted bit outside allowed-1 is dropped.
        let cap = 0x00FFu64 << 32;
        let v = check_vmx_ctrl(cap, 0x100);
        assert_eq!(v & 0x100, 0);
    }

    #[test]
    fn exception_bitmap_covers_mc_and_ac() {
        assert!(INIT_EXCEPTION_BITMAP & (1 << 18) != 0);
        assert!(INIT_EXCEPTION_BITMAP & (1 << 17) != 0);
    }
}
