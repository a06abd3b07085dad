//! Cooperative vCPU events.
//!
//! A vCPU parks itself on one of its events (HLT, SMP WBINVD rendezvous,
//! split-lock emulation) and a peer — or the Service VM notifier — releases
//! it. There is no scheduler to yield to: one vCPU is pinned per pCPU, so
//! waiting is an idle loop on the owning processor.

use core::sync::atomic::{AtomicBool, Ordering};

use partivisor_hal::smp::cpu_do_idle;

pub const VCPU_EVENT_VIRTUAL_INTERRUPT: usize = 0;
pub const VCPU_EVENT_SYNC_WBINVD: usize = 1;
pub const VCPU_EVENT_SPLIT_LOCK: usize = 2;
pub const NUM_VCPU_EVENTS: usize = 3;

/// One level-style completion flag.
pub struct VcpuEvent {
    signaled: AtomicBool,
}

impl VcpuEvent {
    pub const fn new() -> Self {
        VcpuEvent {
            signaled: AtomicBool::new(false),
        }
    }

    /// Clear a stale signal before arming a new wait.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Block until signaled, consuming the signal.
    pub fn wait(&self) {
        while !self.signaled.swap(false, Ordering::AcqRel) {
            cpu_do_idle();
        }
    }

    /// Non-blocking variant: consume the signal if present.
    pub fn try_consume(&self) -> bool {
        self.signaled.swap(false, Ordering::AcqRel)
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }
}

impl Default for VcpuEvent {
    fn default() -> Self {
        VcpuEvent::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_wait_does_not_block() {
        let ev = VcpuEvent::new();
        ev.signal();
        ev.wait();
        assert!(!ev.try_consume());
    }

    #[test]
    fn reset_discards_pending_signal() {
        let ev = VcpuEvent::new();
        ev.signal();
        ev.reset();
        assert!(!ev.try_consume());
    }
}
