//! Platform build-time configuration.

/// Number of logical processors the per-pCPU arrays are sized for.
pub const MAX_PCPU_NUM: usize = 8;

/// Per-pCPU hypervisor stack, bytes.
pub const STACK_SIZE: usize = 0x2000;

/// Bounded wait for an AP to set its active bit after SIPI, in milliseconds.
pub const CPU_UP_TIMEOUT_MS: u32 = 100;

/// Bounded wait for a pCPU to clear its active bit on offline.
pub const CPU_DOWN_TIMEOUT_MS: u32 = 100;

/// Idle behavior of a pCPU with nothing to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMode {
    Hlt,
    Pause,
}

pub const IDLE_MODE: IdleMode = IdleMode::Hlt;

/// When set, the L1D flush on VM entry is delegated to the entry-time MSR
/// load list and the world switch does not issue its own flush.
pub const L1D_FLUSH_VMENTRY_ENABLED: bool = false;

/// Host IRQ vector used to kick a vCPU out of non-root mode.
pub const VECTOR_NOTIFY_VCPU: u32 = 0xF0;

/// First vector usable for device interrupts; below this live exceptions.
pub const VECTOR_FOR_INTR_START: u32 = 0x20;

/// Highest valid interrupt vector.
pub const NR_MAX_VECTOR: u32 = 0xFF;
