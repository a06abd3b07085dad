#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! The guest-facing virtualization engine of the Partivisor hypervisor.
//!
//! Everything that models a guest lives here: the VM and vCPU objects,
//! EPT, the virtual interrupt controllers, control-register and MSR
//! emulation, port-I/O and MMIO dispatch, the VM-exit dispatcher with its
//! pending-request pipeline, the secure-world switch, and the hypercall
//! surface towards the Service VM. Hardware access goes through
//! `partivisor-hal` exclusively.

extern crate alloc;

pub mod config;
pub mod ept;
pub mod error;
pub mod guest_memory;
pub mod hypercall;
pub mod instr_emul;
pub mod io_emul;
pub mod ioreq;
pub mod log;
pub mod schedule;
pub mod trusty;
pub mod vcat;
pub mod vcpu;
pub mod vcpuid;
pub mod vioapic;
pub mod virq;
pub mod virtual_cr;
pub mod vlapic;
pub mod vm;
pub mod vmcs;
pub mod vmexit;
pub mod vmsr;
pub mod vpic;

pub use error::HvErr;
pub use vcpu::{Vcpu, VcpuCell, VcpuState};
pub use vm::{create_vm, destroy_vm, get_service_vm, get_vm, Vm, VmConfig, VmState, VmType};

use partivisor_hal::percpu;
use vcpu::VcpuState as State;

/// One iteration of a pCPU's share of the world: run its bound vCPU once
/// through the pipeline, the guest, and the exit dispatcher.
///
/// Returns `Ok(true)` when a guest was run, `Ok(false)` when the pCPU is
/// idle, and an error when the VM must be torn down.
pub fn run_vcpu_once(vm: &Vm, cell: &VcpuCell) -> Result<bool, HvErr> {
    if cell.shared.state() != State::Running {
        return Ok(false);
    }

    // SAFETY: this is the owning pCPU's run loop; nothing else may hold
    // the body while the vCPU is Running.
    let vcpu = unsafe { cell.body_mut() };

    if let Err(e) = virq::handle_pending_request(cell, vcpu, vm) {
        vm::triple_fault_shutdown_vm(vm, vcpu.vcpu_id);
        return Err(e);
    }

    vcpu.run()?;
    cell.shared
        .launched
        .store(true, core::sync::atomic::Ordering::Release);

    vmexit::vmexit_handler(cell, vcpu, vm)?;
    Ok(true)
}

/// The per-pCPU main loop: runs whatever vCPU is bound to this processor,
/// idles otherwise, and honors the offline flag.
pub fn hv_main_loop(pcpu_id: u16) -> ! {
    loop {
        if percpu::test_and_clear_pcpu_flag(pcpu_id, percpu::NEED_OFFLINE) {
            partivisor_hal::smp::cpu_dead(pcpu_id);
        }

        match current_vcpu(pcpu_id) {
            Some((vm, vcpu_id)) => {
                let ran = vm
                    .vcpu(vcpu_id)
                    .map(|cell| run_vcpu_once(&vm, cell))
                    .unwrap_or(Ok(false));
                if !matches!(ran, Ok(true)) {
                    partivisor_hal::smp::cpu_do_idle();
                }
            }
            None => partivisor_hal::smp::cpu_do_idle(),
        }
    }
}

/// The Running vCPU bound to `pcpu_id`, resolved through the per-pCPU
/// region's binding (written on every transition into `Running`). At most
/// one exists at any time (one vCPU per pCPU).
fn current_vcpu(pcpu_id: u16) -> Option<(alloc::sync::Arc<Vm>, u16)> {
    let (vm_id, vcpu_id) = vm::bound_vcpu(pcpu_id)?;
    let vm = vm::get_vm(vm_id)?;
    let cell = vm.vcpu(vcpu_id)?;
    if cell.shared.state() != State::Running {
        return None;
    }
    Some((vm, vcpu_id))
}
