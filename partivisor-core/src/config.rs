//! Build-time configuration of the virtualization engine.

/// Concurrent VMs the arena is sized for.
pub const MAX_VM_NUM: usize = 8;

/// vCPUs per VM.
pub const MAX_VCPUS_PER_VM: usize = 8;

/// Slots in the per-VM port-I/O emulation table.
pub const EMUL_PIO_IDX_MAX: usize = 12;

/// Capacity of the per-VM MMIO emulation table.
pub const MAX_EMULATED_MMIO_REGIONS: usize = 16;

/// VPIDs are carved from this range, one per vCPU; 0 is reserved.
pub const MAX_VPID: u16 = 32;

/// Guest-physical base of the virtual IOAPIC window.
pub const VIOAPIC_BASE: u64 = 0xFEC0_0000;
pub const VIOAPIC_SIZE: u64 = 0x1000;

/// Redirection entries of the Service VM view (aligned with the widest
/// physical IOAPIC) and of a User VM view.
pub const REDIR_ENTRIES_HW: usize = 120;
pub const VIOAPIC_RTE_NUM: usize = 48;

/// Guest-physical address the secure world is rebased to: the top PML4
/// slot, 511 GiB up.
pub const TRUSTY_EPT_REBASE_GPA: u64 = 511u64 << 30;

/// Upcall vector posted to the Service VM when an ioreq is pending.
pub const VECTOR_HYPERVISOR_CALLBACK: u32 = 0xF3;

/// E820 entries carried per VM.
pub const E820_MAX_ENTRIES: usize = 32;
