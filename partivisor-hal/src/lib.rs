#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware access layer for the Partivisor hypervisor.
//!
//! Everything that touches the physical machine lives here: MSR and CPUID
//! shims, the boot-time capability probe, the per-pCPU region and SMP
//! bring-up, the physical LAPIC, the page-table engine shared by the host
//! MMU and EPT, and the raw VMX instruction wrappers. The guest-facing
//! models build on top of this crate and never issue privileged
//! instructions themselves.

extern crate alloc;

pub mod config;
pub mod cpu_caps;
pub mod cpuid;
pub mod irq;
pub mod lapic;
pub mod msr;
pub mod page;
pub mod percpu;
pub mod pgtable;
pub mod smp;
pub mod tsc;
pub mod vmx;

pub use cpu_caps::{cpu_caps, CpuCapabilities};
pub use page::{Page, PagePool, PAGE_SIZE};
pub use percpu::{get_pcpu_id, PcpuState};
pub use vmx::{clac, stac};

/// Host-physical address.
pub type PhysAddr = u64;
/// Guest-physical address.
pub type GuestPhysAddr = u64;
/// Guest-virtual address.
pub type GuestVirtAddr = u64;

/// Marker for "no translation exists" from [`PhysAddr`]-producing lookups.
pub const INVALID_HPA: PhysAddr = !0u64;

/// The hypervisor runs on a direct map: host-virtual == host-physical.
#[inline(always)]
pub fn hpa2hva(hpa: PhysAddr) -> *mut u8 {
    hpa as *mut u8
}

#[inline(always)]
pub fn hva2hpa(hva: *const u8) -> PhysAddr {
    hva as PhysAddr
}

/// Errors surfaced by the hardware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// A required architectural capability is missing.
    MissingCapability(&'static str),
    /// VMX is disabled or locked off by firmware.
    VmxLocked,
    /// VMXON/VMPTRLD/VMCLEAR failed (CF/ZF set).
    VmxInstrFailed,
    /// A target pCPU did not reach the expected state in time.
    Timeout,
    /// Page pool exhausted.
    OutOfPages,
}
