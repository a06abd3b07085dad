//! Pending-request pipeline and event injection.
//!
//! Every cross-vCPU operation is a bit in the target's pending word plus a
//! notification IPI; the bits are consumed in one fixed order at each VM
//! entry, which is the delivery order the guest observes. Exception
//! queueing follows the SDM contributory/benign table, promoting to double
//! fault and from double fault to a fatal triple fault.

use core::sync::atomic::Ordering;

use partivisor_hal::config::VECTOR_NOTIFY_VCPU;
use partivisor_hal::irq::{dispatch_interrupt, local_irq_disable, local_irq_enable, IntrExcpCtx};
use partivisor_hal::vmx::{
    exec_vmread32, exec_vmwrite32, VMX_BLOCKED_BY_MOVSS, VMX_BLOCKED_BY_NMI,
    VMX_BLOCKED_BY_STI, VMX_ENTRY_EXCEPTION_ERROR_CODE, VMX_ENTRY_INT_INFO_FIELD,
    VMX_EXIT_INT_INFO, VMX_GUEST_CS_ATTR, VMX_GUEST_INTERRUPTIBILITY_INFO,
    VMX_INT_INFO_ERR_CODE_VALID, VMX_INT_INFO_VALID, VMX_INT_TYPE_HW_EXP,
    VMX_INT_TYPE_MASK, VMX_INT_TYPE_NMI, VMX_PROCBASED_CTLS_IRQ_WIN,
    VMX_PROC_VM_EXEC_CONTROLS,
};
use partivisor_hal::{cpu_caps, cpuid, lapic, percpu};

use crate::error::HvErr;
use crate::schedule::{VCPU_EVENT_SPLIT_LOCK, VCPU_EVENT_SYNC_WBINVD, VCPU_EVENT_VIRTUAL_INTERRUPT};
use crate::vcpu::{Vcpu, VcpuCell, VcpuShared, VcpuState, VECTOR_INVALID};
use crate::vm::{self, Vm};

/* pending-request bits, in pipeline order */
pub const REQ_INIT_VMCS: u16 = 0;
pub const REQ_TRP_FAULT: u16 = 1;
pub const REQ_WAIT_WBINVD: u16 = 2;
pub const REQ_SPLIT_LOCK: u16 = 3;
pub const REQ_EPT_FLUSH: u16 = 4;
pub const REQ_VPID_FLUSH: u16 = 5;
pub const REQ_EOI_EXIT_BITMAP_UPDATE: u16 = 6;
pub const REQ_TMR_UPDATE: u16 = 7;
pub const REQ_SMP_CALL: u16 = 8;
pub const REQ_EXCP: u16 = 9;
pub const REQ_NMI: u16 = 10;
pub const REQ_EXTINT: u16 = 11;
pub const REQ_EVENT: u16 = 12;

/* exception vectors */
pub const IDT_DE: u32 = 0;
pub const IDT_DB: u32 = 1;
pub const IDT_NMI: u32 = 2;
pub const IDT_BP: u32 = 3;
pub const IDT_OF: u32 = 4;
pub const IDT_UD: u32 = 6;
pub const IDT_DF: u32 = 8;
pub const IDT_TS: u32 = 10;
pub const IDT_NP: u32 = 11;
pub const IDT_SS: u32 = 12;
pub const IDT_GP: u32 = 13;
pub const IDT_PF: u32 = 14;
pub const IDT_MC: u32 = 18;
pub const IDT_VE: u32 = 20;

const EXCEPTION_ERROR_CODE_VALID: u16 = 8;

/// Interruption type plus error-code flag per vector.
static EXCEPTION_TYPE: [u16; 32] = {
    let mut t = [VMX_INT_TYPE_HW_EXP as u16; 32];
    t[IDT_DF as usize] |= EXCEPTION_ERROR_CODE_VALID;
    t[IDT_TS as usize] |= EXCEPTION_ERROR_CODE_VALID;
    t[IDT_NP as usize] |= EXCEPTION_ERROR_CODE_VALID;
    t[IDT_SS as usize] |= EXCEPTION_ERROR_CODE_VALID;
    t[IDT_GP as usize] |= EXCEPTION_ERROR_CODE_VALID;
    t[IDT_PF as usize] |= EXCEPTION_ERROR_CODE_VALID;
    t[17] |= EXCEPTION_ERROR_CODE_VALID; /* #AC */
    t
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

fn exception_class(vector: u32) -> ExceptionClass {
    match vector {
        IDT_DE | IDT_TS | IDT_NP | IDT_SS | IDT_GP => ExceptionClass::Contributory,
        IDT_PF | IDT_VE => ExceptionClass::PageFault,
        _ => ExceptionClass::Benign,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionType {
    Fault,
    Trap,
    Abort,
    Interrupt,
}

fn exception_type_of(vector: u32) -> ExceptionType {
    if vector > 31 || vector == IDT_NMI {
        ExceptionType::Interrupt
    } else if vector == IDT_DB || vector == IDT_BP || vector == IDT_OF {
        ExceptionType::Trap
    } else if vector == IDT_DF || vector == IDT_MC {
        ExceptionType::Abort
    } else {
        ExceptionType::Fault
    }
}

/// Outcome of stacking a new exception on a possibly-pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Deliver { vector: u32, err_code: u32 },
    TripleFault,
}

/// SDM 6.15 double-fault promotion.
pub fn resolve_exception(prev_vector: u32, vector: u32, err_code: u32) -> QueueOutcome {
    let new_class = exception_class(vector);
    if prev_vector == IDT_DF && new_class != ExceptionClass::Benign {
        return QueueOutcome::TripleFault;
    }
    let prev_class = if prev_vector < 32 {
        exception_class(prev_vector)
    } else {
        ExceptionClass::Benign
    };
    if (prev_class == ExceptionClass::Contributory && new_class == ExceptionClass::Contributory)
        || (prev_class == ExceptionClass::PageFault && new_class != ExceptionClass::Benign)
    {
        QueueOutcome::Deliver {
            vector: IDT_DF,
            err_code: 0,
        }
    } else {
        QueueOutcome::Deliver { vector, err_code }
    }
}

/// Post a request bit and kick the target off its pCPU if it is running
/// remotely; the forced VM exit guarantees the bit is seen before the next
/// entry.
pub fn vcpu_make_request(shared: &VcpuShared, req: u16) {
    shared.pending_req.fetch_or(1u64 << req, Ordering::AcqRel);
    kick_vcpu(shared);
}

/// Force a running vCPU out of non-root mode with the notification IPI.
pub fn kick_vcpu(shared: &VcpuShared) {
    if shared.state() != VcpuState::Running {
        return;
    }
    let target_pcpu = shared.pcpu_id.load(Ordering::Acquire);
    if target_pcpu != percpu::get_pcpu_id() && percpu::is_pcpu_active(target_pcpu) {
        // SAFETY: x2APIC is live on every active pCPU past bring-up.
        unsafe { lapic::send_single_ipi(percpu::lapic_id_of(target_pcpu), VECTOR_NOTIFY_VCPU) };
    }
}

/// Request variant for code that only holds the vCPU body (self-requests
/// from exit handlers; no kick needed, the pipeline runs before re-entry).
pub fn make_request_self(vcpu: &Vcpu, req: u16) {
    if let Some(vm) = vm::get_vm(vcpu.vm_id) {
        if let Some(cell) = vm.vcpu(vcpu.vcpu_id) {
            cell.shared.pending_req.fetch_or(1u64 << req, Ordering::AcqRel);
        }
    }
}

fn test_and_clear(shared: &VcpuShared, req: u16) -> bool {
    let bit = 1u64 << req;
    shared.pending_req.fetch_and(!bit, Ordering::AcqRel) & bit != 0
}

fn pending(shared: &VcpuShared, req: u16) -> bool {
    shared.pending_req.load(Ordering::Acquire) & (1u64 << req) != 0
}

/// Queue an exception on the vCPU, applying the double-fault rules.
pub fn vcpu_queue_exception(vcpu: &mut Vcpu, vector: u32, err_code: u32) -> Result<(), HvErr> {
    if vector >= 32 {
        crate::pr_err!("invalid exception vector {}", vector);
        return Err(HvErr::Inval);
    }
    let prev = vcpu.arch.exception_info.exception;
    match resolve_exception(prev, vector, err_code) {
        QueueOutcome::TripleFault => {
            make_request_self(vcpu, REQ_TRP_FAULT);
        }
        QueueOutcome::Deliver { vector, err_code } => {
            vcpu.arch.exception_info.exception = vector;
            vcpu.arch.exception_info.error =
                if EXCEPTION_TYPE[vector as usize] & EXCEPTION_ERROR_CODE_VALID != 0 {
                    err_code
                } else {
                    0
                };
            make_request_self(vcpu, REQ_EXCP);
        }
    }
    Ok(())
}

fn vcpu_inject_exception(vcpu: &mut Vcpu) {
    let vector = vcpu.arch.exception_info.exception;
    if vector >= 32 {
        return;
    }
    // SAFETY: owning pCPU, VMCS current (injection happens at entry).
    unsafe {
        if EXCEPTION_TYPE[vector as usize] & EXCEPTION_ERROR_CODE_VALID != 0 {
            exec_vmwrite32(
                VMX_ENTRY_EXCEPTION_ERROR_CODE,
                vcpu.arch.exception_info.error,
            );
        }
        // The error-code-valid flag (8) lands on bit 11 after the shift,
        // exactly where the interruption-info format wants it.
        exec_vmwrite32(
            VMX_ENTRY_INT_INFO_FIELD,
            VMX_INT_INFO_VALID
                | ((EXCEPTION_TYPE[vector as usize] as u32) << 8)
                | (vector & 0xFF),
        );
    }
    vcpu.arch.exception_info.exception = VECTOR_INVALID;

    if exception_type_of(vector) == ExceptionType::Fault {
        // Faults re-execute the instruction and push RFLAGS.RF.
        vcpu.retain_rip();
        let rflags = vcpu.get_rflags();
        vcpu.set_rflags(rflags | (1 << 16));
    }
}

/* guest-facing injection helpers */

pub fn vcpu_inject_gp(vcpu: &mut Vcpu, err_code: u32) {
    let _ = vcpu_queue_exception(vcpu, IDT_GP, err_code);
}

pub fn vcpu_inject_pf(vcpu: &mut Vcpu, addr: u64, err_code: u32) {
    vcpu.set_cr2(addr);
    let _ = vcpu_queue_exception(vcpu, IDT_PF, err_code);
}

pub fn vcpu_inject_ud(vcpu: &mut Vcpu) {
    let _ = vcpu_queue_exception(vcpu, IDT_UD, 0);
}

pub fn vcpu_inject_ss(vcpu: &mut Vcpu) {
    let _ = vcpu_queue_exception(vcpu, IDT_SS, 0);
}

/// External interrupt (vPIC wire) towards a vCPU.
pub fn vcpu_inject_extint(shared: &VcpuShared) {
    vcpu_make_request(shared, REQ_EXTINT);
    shared.events[VCPU_EVENT_VIRTUAL_INTERRUPT].signal();
}

pub fn vcpu_inject_nmi(shared: &VcpuShared) {
    vcpu_make_request(shared, REQ_NMI);
    shared.events[VCPU_EVENT_VIRTUAL_INTERRUPT].signal();
}

fn is_guest_irq_enabled(vcpu: &mut Vcpu) -> bool {
    if vcpu.get_rflags() & (1 << 9) == 0 {
        return false;
    }
    // SAFETY: owning pCPU, VMCS current.
    let blocking = unsafe { exec_vmread32(VMX_GUEST_INTERRUPTIBILITY_INFO) };
    blocking & (VMX_BLOCKED_BY_STI | VMX_BLOCKED_BY_MOVSS) == 0
}

fn is_nmi_injectable() -> bool {
    // SAFETY: owning pCPU, VMCS current.
    let blocking = unsafe { exec_vmread32(VMX_GUEST_INTERRUPTIBILITY_INFO) };
    blocking & (VMX_BLOCKED_BY_STI | VMX_BLOCKED_BY_MOVSS | VMX_BLOCKED_BY_NMI) == 0
}

fn vcpu_do_pending_extint(vm: &Vm, vcpu: &Vcpu) -> bool {
    // The PIC wire reaches the boot vCPU only.
    if vcpu.vcpu_id != 0 {
        return false;
    }
    let Some(vector) = vm.vpic().pending_intr() else {
        return false;
    };
    // SAFETY: owning pCPU, VMCS current.
    unsafe { exec_vmwrite32(VMX_ENTRY_INT_INFO_FIELD, VMX_INT_INFO_VALID | (vector & 0xFF)) };
    vm.vpic().intr_accepted(vector);
    true
}

fn vlapic_inject_intr(cell: &VcpuCell, guest_irq_enabled: bool, injected: bool) {
    let vlapic = &cell.shared.vlapic;
    if guest_irq_enabled && !injected {
        if let Some(vector) = vlapic.pending_intr() {
            if vector >= 16 {
                vlapic.intr_accepted(vector);
                // SAFETY: owning pCPU, VMCS current.
                unsafe {
                    exec_vmwrite32(
                        VMX_ENTRY_INT_INFO_FIELD,
                        VMX_INT_INFO_VALID | (vector & 0xFF),
                    )
                };
            }
        }
    }
}

fn can_touch_vmcs() -> bool {
    // Hosted test runs have no VMCS; everything VMCS-bound is skipped at
    // the same points the real machine would act.
    cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX)
}

/// The entry pipeline (spec order). Returns Err on a triple fault; the
/// caller shuts the VM down.
pub fn handle_pending_request(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let shared = &cell.shared;

    if shared.pending_req.load(Ordering::Acquire) != 0 {
        if test_and_clear(shared, REQ_INIT_VMCS) {
            crate::vmcs::init_vmcs(vcpu, vm);
        }

        if test_and_clear(shared, REQ_TRP_FAULT) {
            crate::pr_fatal!("vm{}: triple fault, shutting down", vcpu.vm_id);
            return Err(HvErr::Fault);
        }

        if test_and_clear(shared, REQ_WAIT_WBINVD) {
            shared.events[VCPU_EVENT_SYNC_WBINVD].wait();
        }

        if test_and_clear(shared, REQ_SPLIT_LOCK) {
            shared.events[VCPU_EVENT_SPLIT_LOCK].wait();
        }

        if can_touch_vmcs() && test_and_clear(shared, REQ_EPT_FLUSH) {
            // SAFETY: VMX root on the owning pCPU.
            unsafe {
                partivisor_hal::vmx::invept_single_context(vm.nworld_eptp_value());
                if let Some(sworld) = vm.sworld_eptp_value() {
                    partivisor_hal::vmx::invept_single_context(sworld);
                }
            }
        }

        if can_touch_vmcs() && test_and_clear(shared, REQ_VPID_FLUSH) {
            // SAFETY: VMX root on the owning pCPU.
            unsafe { partivisor_hal::vmx::flush_vpid_single(vcpu.arch.vpid) };
        }

        if test_and_clear(shared, REQ_TMR_UPDATE) {
            vm.vioapic().update_tmr(vm, vcpu.vcpu_id);
            shared.pending_req.fetch_or(
                1u64 << REQ_EOI_EXIT_BITMAP_UPDATE,
                Ordering::AcqRel,
            );
        }

        if can_touch_vmcs() && test_and_clear(shared, REQ_EOI_EXIT_BITMAP_UPDATE) {
            set_vmcs_eoi_exit(shared);
        }

        if test_and_clear(shared, REQ_SMP_CALL) {
            handle_smp_call();
        }
    }

    if !can_touch_vmcs() {
        return Ok(());
    }

    /* injection: exception first, then NMI, then the re-queued event */
    let mut injected = false;
    if test_and_clear(shared, REQ_EXCP) {
        vcpu_inject_exception(vcpu);
        injected = true;
    } else if test_and_clear(shared, REQ_NMI) {
        if is_nmi_injectable() {
            // SAFETY: owning pCPU, VMCS current.
            unsafe {
                exec_vmwrite32(
                    VMX_ENTRY_INT_INFO_FIELD,
                    VMX_INT_INFO_VALID | (VMX_INT_TYPE_NMI << 8) | IDT_NMI,
                )
            };
            injected = true;
        } else {
            // Blocked: retry at the next entry.
            shared.pending_req.fetch_or(1u64 << REQ_NMI, Ordering::AcqRel);
        }
    } else if vcpu.arch.idt_vectoring_info & VMX_INT_INFO_VALID != 0 {
        // Re-deliver whatever was in flight when the exit interrupted it.
        // SAFETY: owning pCPU, VMCS current.
        unsafe { exec_vmwrite32(VMX_ENTRY_INT_INFO_FIELD, vcpu.arch.idt_vectoring_info) };
        vcpu.arch.idt_vectoring_info = 0;
        injected = true;
    }

    // Split-lock emulation defers maskable interrupts past the MTF exit.
    if !vm.is_lapic_pt() && !vcpu.arch.emulating_lock {
        let guest_irq_enabled = is_guest_irq_enabled(vcpu);
        if guest_irq_enabled && !injected && test_and_clear(shared, REQ_EXTINT) {
            injected = vcpu_do_pending_extint(vm, vcpu);
        }
        if test_and_clear(shared, REQ_EVENT) {
            vlapic_inject_intr(cell, guest_irq_enabled, injected);
        }
    }

    // A vector we could not deliver needs the interrupt window open so the
    // guest exits as soon as it can take it.
    if !vm.is_lapic_pt() && !vcpu.arch.irq_window_enabled {
        let undelivered = pending(shared, REQ_EXTINT)
            || pending(shared, REQ_NMI)
            || cell.shared.vlapic.has_pending_intr();
        if undelivered {
            vcpu.arch.proc_vm_exec_ctrls |= VMX_PROCBASED_CTLS_IRQ_WIN;
            // SAFETY: owning pCPU, VMCS current.
            unsafe {
                exec_vmwrite32(VMX_PROC_VM_EXEC_CONTROLS, vcpu.arch.proc_vm_exec_ctrls)
            };
            vcpu.arch.irq_window_enabled = true;
        }
    }

    Ok(())
}

/// Mirror the vLAPIC's EOI-exit bitmap into the VMCS.
fn set_vmcs_eoi_exit(shared: &VcpuShared) {
    use partivisor_hal::vmx::{
        exec_vmwrite, VMX_EOI_EXIT0_FULL, VMX_EOI_EXIT1_FULL, VMX_EOI_EXIT2_FULL,
        VMX_EOI_EXIT3_FULL,
    };
    shared.vlapic.batch_update_eoi_exit_bitmap();
    // SAFETY: owning pCPU, VMCS current.
    unsafe {
        exec_vmwrite(VMX_EOI_EXIT0_FULL, shared.vlapic.eoi_exit_bitmap(0));
        exec_vmwrite(VMX_EOI_EXIT1_FULL, shared.vlapic.eoi_exit_bitmap(1));
        exec_vmwrite(VMX_EOI_EXIT2_FULL, shared.vlapic.eoi_exit_bitmap(2));
        exec_vmwrite(VMX_EOI_EXIT3_FULL, shared.vlapic.eoi_exit_bitmap(3));
    }
}

/* ---- cross-pCPU function calls ---- */

static SMP_CALLS: [core::sync::atomic::AtomicUsize;
    partivisor_hal::config::MAX_PCPU_NUM] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const Z: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
    [Z; partivisor_hal::config::MAX_PCPU_NUM]
};

/// Arrange for `f` to run on the pCPU hosting `shared` at its next entry.
pub fn request_smp_call(shared: &VcpuShared, f: fn()) {
    let pcpu = shared.pcpu_id.load(Ordering::Acquire) as usize;
    SMP_CALLS[pcpu].store(f as usize, Ordering::Release);
    vcpu_make_request(shared, REQ_SMP_CALL);
}

fn handle_smp_call() {
    let pcpu = percpu::get_pcpu_id() as usize;
    let raw = SMP_CALLS[pcpu].swap(0, Ordering::AcqRel);
    if raw != 0 {
        // SAFETY: only fn() pointers are stored above.
        let f: fn() = unsafe { core::mem::transmute(raw) };
        f();
    }
}

/* ---- VM exit handlers owned by this module ---- */

/// Interrupt-window exit: close the window and let the pipeline inject.
pub fn interrupt_window_vmexit_handler(vcpu: &mut Vcpu) -> Result<(), HvErr> {
    vcpu.arch.irq_window_enabled = false;
    vcpu.arch.proc_vm_exec_ctrls &= !VMX_PROCBASED_CTLS_IRQ_WIN;
    // SAFETY: owning pCPU, VMCS current.
    unsafe { exec_vmwrite32(VMX_PROC_VM_EXEC_CONTROLS, vcpu.arch.proc_vm_exec_ctrls) };
    vcpu.retain_rip();
    Ok(())
}

/// NMI-window exit mirrors the interrupt window.
pub fn nmi_window_vmexit_handler(vcpu: &mut Vcpu) -> Result<(), HvErr> {
    vcpu.arch.proc_vm_exec_ctrls &= !partivisor_hal::vmx::VMX_PROCBASED_CTLS_NMI_WINEXIT;
    // SAFETY: owning pCPU, VMCS current.
    unsafe { exec_vmwrite32(VMX_PROC_VM_EXEC_CONTROLS, vcpu.arch.proc_vm_exec_ctrls) };
    vcpu.retain_rip();
    Ok(())
}

/// External interrupt exit: hand the vector to the host table.
pub fn external_interrupt_vmexit_handler(vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    // SAFETY: owning pCPU, right after the exit.
    let intr_info = unsafe { exec_vmread32(VMX_EXIT_INT_INFO) };
    if intr_info & VMX_INT_INFO_VALID == 0
        || (intr_info & VMX_INT_TYPE_MASK) >> 8 != 0
    {
        crate::pr_err!("invalid VM exit interrupt info {:#x}", intr_info);
        vcpu.retain_rip();
        return Err(HvErr::Inval);
    }
    let ctx = IntrExcpCtx {
        vector: intr_info & 0xFF,
        rip: vcpu.get_rip(),
        rflags: vcpu.get_rflags(),
        // SAFETY: as above.
        cs: unsafe { exec_vmread32(VMX_GUEST_CS_ATTR) },
    };
    if !vm.is_lapic_pt() {
        local_irq_disable();
        dispatch_interrupt(&ctx);
        local_irq_enable();
    } else {
        dispatch_interrupt(&ctx);
    }
    vcpu.retain_rip();
    Ok(())
}

/// Exception-or-NMI exit: requeue towards the guest, with the CPL folded
/// into the error code for stack-borne exceptions.
pub fn exception_vmexit_handler(vcpu: &mut Vcpu) -> Result<(), HvErr> {
    // SAFETY: owning pCPU, right after the exit.
    let intinfo = unsafe { exec_vmread32(VMX_EXIT_INT_INFO) };
    let mut vector = VECTOR_INVALID;
    let mut err_code = 0u32;

    if intinfo & VMX_INT_INFO_VALID != 0 {
        vector = intinfo & 0xFF;
        if intinfo & VMX_INT_INFO_ERR_CODE_VALID != 0 {
            // SAFETY: as above.
            err_code = unsafe {
                exec_vmread32(partivisor_hal::vmx::VMX_EXIT_INT_ERROR_CODE)
            };
            let cpl = unsafe { (exec_vmread32(VMX_GUEST_CS_ATTR) >> 5) & 3 };
            if cpl < 3 {
                err_code &= !4;
            } else {
                err_code |= 4;
            }
        }
    }

    if vector == IDT_MC {
        crate::pr_fatal!("#MC from guest, re-injecting");
    }

    if vector != VECTOR_INVALID {
        vcpu.retain_rip();
        vcpu_queue_exception(vcpu, vector, err_code)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::fixture_vm;

    #[test]
    fn double_fault_promotion_table() {
        // Contributory on contributory.
        assert_eq!(
            resolve_exception(IDT_GP, IDT_NP, 5),
            QueueOutcome::Deliver {
                vector: IDT_DF,
                err_code: 0
            }
        );
        // Page fault followed by contributory.
        assert_eq!(
            resolve_exception(IDT_PF, IDT_GP, 1),
            QueueOutcome::Deliver {
                vector: IDT_DF,
                err_code: 0
            }
        );
        // Benign on anything delivers as-is.
        assert_eq!(
            resolve_exception(IDT_GP, IDT_UD, 0),
            QueueOutcome::Deliver {
                vector: IDT_UD,
                err_code: 0
            }
        );
        // Nothing pending (the invalid marker is > 31).
        assert_eq!(
            resolve_exception(VECTOR_INVALID, IDT_GP, 2),
            QueueOutcome::Deliver {
                vector: IDT_GP,
                err_code: 2
            }
        );
        // Double fault stacking fatally.
        assert_eq!(resolve_exception(IDT_DF, IDT_GP, 0), QueueOutcome::TripleFault);
        assert_eq!(
            resolve_exception(IDT_DF, IDT_UD, 0),
            QueueOutcome::Deliver {
                vector: IDT_UD,
                err_code: 0
            }
        );
    }

    #[test]
    fn queue_exception_records_error_code_validity() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        vcpu_queue_exception(vcpu, IDT_GP, 0x1234).unwrap();
        assert_eq!(vcpu.arch.exception_info.exception, IDT_GP);
        assert_eq!(vcpu.arch.exception_info.error, 0x1234);
        assert!(pending(&cell.shared, REQ_EXCP));

        // #UD carries no error code regardless of what the caller passed.
        vcpu.arch.exception_info.exception = VECTOR_INVALID;
        vcpu_queue_exception(vcpu, IDT_UD, 0x9999).unwrap();
        assert_eq!(vcpu.arch.exception_info.error, 0);
    }

    #[test]
    fn triple_fault_request_from_stacked_faults() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        vcpu.arch.exception_info.exception = IDT_DF;
        vcpu_queue_exception(vcpu, IDT_GP, 0).unwrap();
        assert!(pending(&cell.shared, REQ_TRP_FAULT));
    }

    #[test]
    fn pipeline_reports_triple_fault_fatal() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        vcpu_make_request(&cell.shared, REQ_TRP_FAULT);
        assert_eq!(
            handle_pending_request(cell, vcpu, &vm),
            Err(HvErr::Fault)
        );
        // The bit was consumed.
        assert!(!pending(&cell.shared, REQ_TRP_FAULT));
    }

    #[test]
    fn tmr_update_chains_into_eoi_bitmap_update() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        vcpu_make_request(&cell.shared, REQ_TMR_UPDATE);
        handle_pending_request(cell, vcpu, &vm).unwrap();
        // Without VMX (hosted) the chained bit stays pending for the real
        // entry path; the TMR bit itself is gone.
        assert!(!pending(&cell.shared, REQ_TMR_UPDATE));
        assert!(pending(&cell.shared, REQ_EOI_EXIT_BITMAP_UPDATE));
    }

    #[test]
    fn wait_wbinvd_consumes_signaled_event() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        cell.shared.events[VCPU_EVENT_SYNC_WBINVD].signal();
        vcpu_make_request(&cell.shared, REQ_WAIT_WBINVD);
        handle_pending_request(cell, vcpu, &vm).unwrap();
        assert!(!cell.shared.events[VCPU_EVENT_SYNC_WBINVD].try_consume());
    }

    #[test]
    fn smp_call_runs_on_pipeline() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn bump() {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        request_smp_call(&cell.shared, bump);
        handle_pending_request(cell, vcpu, &vm).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
