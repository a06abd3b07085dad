#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Partivisor: a partitioning Type-1 hypervisor core for Intel VT-x.
//!
//! This crate stitches the two members together and owns the bring-up
//! order: the BSP probes and gates capabilities, builds the host paging,
//! releases the APs, and every pCPU then enters VMX root and parks in the
//! per-pCPU main loop waiting for a vCPU to be bound to it.

extern crate alloc;

pub use partivisor_core as core_engine;
pub use partivisor_hal as hal;

pub use partivisor_core::{
    create_vm, destroy_vm, get_service_vm, get_vm, HvErr, Vm, VmConfig, VmState, VmType,
};

use partivisor_hal::{percpu, smp, HalError};

/// Bring the boot processor up to the point where VMs can be created:
/// capability gate, host paging, LAPIC, descriptor tables, TSC, VMXON.
///
/// Fail-stop (panics) when the platform misses a required capability.
pub fn init_primary_pcpu() -> Result<u16, HalError> {
    let pcpu_id = smp::init_pcpu_pre(true)?;
    smp::init_pcpu_post(pcpu_id);
    // SAFETY: the capability gate passed in init_pcpu_pre.
    unsafe { smp::exec_vmxon_instr(pcpu_id)? };
    partivisor_core::virtual_cr::init_cr0_cr4_flexible_bits();
    Ok(pcpu_id)
}

/// Application-processor bring-up, entered from the trampoline.
pub fn init_secondary_pcpu() -> Result<u16, HalError> {
    let pcpu_id = smp::init_pcpu_pre(false)?;
    smp::init_pcpu_post(pcpu_id);
    // SAFETY: as above; the BSP validated the platform.
    unsafe { smp::exec_vmxon_instr(pcpu_id)? };
    Ok(pcpu_id)
}

/// Release the application processors named in `mask` and wait for them.
pub fn start_application_pcpus(mask: u64) -> bool {
    smp::start_pcpus(mask)
}

/// Enter the per-pCPU scheduling loop; never returns.
pub fn enter_main_loop() -> ! {
    partivisor_core::hv_main_loop(percpu::get_pcpu_id())
}

/// Orderly teardown: offline every other pCPU, then halt this one.
pub fn shutdown_all_pcpus() -> ! {
    let _ = smp::stop_pcpus();
    smp::cpu_dead(percpu::get_pcpu_id())
}
