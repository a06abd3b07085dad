//! The ioreq channel to the Service VM device model.
//!
//! One shared page per VM holds a request slot per vCPU. The hypervisor is
//! the producer: it fills a slot, moves it FREE→PENDING and raises the
//! upcall vector. The device model consumes the slot (PROCESSING) and
//! finishes it (COMPLETE); the blocked vCPU then applies the completion and
//! recycles the slot to FREE.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use partivisor_hal::{hpa2hva, stac, clac};

use crate::config::VECTOR_HYPERVISOR_CALLBACK;
use crate::error::HvErr;
use crate::vcpu::{Vcpu, VcpuState};
use crate::vlapic;
use crate::vm::{self, Vm};

pub const REQ_STATE_FREE: u32 = 3;
pub const REQ_STATE_PENDING: u32 = 0;
pub const REQ_STATE_COMPLETE: u32 = 1;
pub const REQ_STATE_PROCESSING: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IoReqType {
    #[default]
    Portio = 0,
    Mmio = 1,
    Pcicfg = 2,
    Wp = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IoDirection {
    #[default]
    Read = 0,
    Write = 1,
}

/// One slot of the shared page; layout is ABI with the device model.
#[repr(C)]
pub struct IoReqSlot {
    pub req_type: u32,
    pub direction: u32,
    pub address: u64,
    pub size: u64,
    pub value: u64,
    pub processed: AtomicU32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<IoReqSlot>(), 40);

/// Per-VM binding of the shared page, set by the Service VM hypercall.
pub struct IoReqBuffer {
    page_hpa: AtomicU64,
}

impl IoReqBuffer {
    pub const fn unset() -> Self {
        IoReqBuffer {
            page_hpa: AtomicU64::new(0),
        }
    }

    pub fn set(&self, hpa: u64) {
        self.page_hpa.store(hpa, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.page_hpa.load(Ordering::Acquire) != 0
    }

    /// The slot belonging to `vcpu_id`, or None before the buffer exists.
    pub fn slot(&self, vcpu_id: u16) -> Option<&IoReqSlot> {
        let hpa = self.page_hpa.load(Ordering::Acquire);
        if hpa == 0 {
            return None;
        }
        let base = hpa2hva(hpa) as *const IoReqSlot;
        // SAFETY: the Service VM pinned this page when it registered it;
        // slots are per-vCPU so this reference never aliases a writer on
        // another slot.
        Some(unsafe { &*base.add(vcpu_id as usize) })
    }
}

/// Current state of the vCPU's slot, FREE when no buffer is bound.
pub fn get_req_state(vm: &Vm, vcpu_id: u16) -> u32 {
    match vm.ioreq_buffer().slot(vcpu_id) {
        Some(slot) => slot.processed.load(Ordering::Acquire),
        None => REQ_STATE_FREE,
    }
}

/// Publish the vCPU's pending request to the device model and block until
/// it completes. There is no timeout on this path; the device model owns
/// the request for as long as it needs.
pub fn insert_request(vcpu: &mut Vcpu) -> Result<(), HvErr> {
    let vm = vm::get_vm(vcpu.vm_id).ok_or(HvErr::Inval)?;
    let slot = vm
        .ioreq_buffer()
        .slot(vcpu.vcpu_id)
        .ok_or(HvErr::NoDev)?;

    if slot.processed.load(Ordering::Acquire) != REQ_STATE_FREE {
        crate::pr_err!(
            "vm{} vcpu{}: ioreq slot not free",
            vcpu.vm_id,
            vcpu.vcpu_id
        );
        return Err(HvErr::BadState);
    }

    let req = &vcpu.req;
    stac();
    // SAFETY: plain stores into the pinned shared page; `processed` is the
    // only synchronization word and is released last.
    unsafe {
        let p = slot as *const IoReqSlot as *mut IoReqSlot;
        (*p).req_type = req.req_type as u32;
        match req.req_type {
            IoReqType::Portio | IoReqType::Pcicfg => {
                (*p).direction = req.pio.direction as u32;
                (*p).address = req.pio.address as u64;
                (*p).size = req.pio.size as u64;
                (*p).value = req.pio.value as u64;
            }
            IoReqType::Mmio | IoReqType::Wp => {
                (*p).direction = req.mmio.direction as u32;
                (*p).address = req.mmio.address;
                (*p).size = req.mmio.size;
                (*p).value = req.mmio.value;
            }
        }
    }
    slot.processed.store(REQ_STATE_PENDING, Ordering::Release);
    clac();

    deliver_upcall(&vm);
    wait_for_completion(vcpu, slot);
    Ok(())
}

fn deliver_upcall(_user_vm: &Vm) {
    if let Some(service_vm) = vm::get_service_vm() {
        if let Some(cell) = service_vm.vcpu(0) {
            vlapic::vlapic_set_intr(&cell.shared, VECTOR_HYPERVISOR_CALLBACK, false);
        }
    }
}

fn wait_for_completion(vcpu: &Vcpu, slot: &IoReqSlot) {
    loop {
        let state = slot.processed.load(Ordering::Acquire);
        if state == REQ_STATE_COMPLETE {
            break;
        }
        // A vCPU being torn down stops waiting; the completion sweep will
        // recycle the slot.
        if vcpu_is_zombie(vcpu) {
            break;
        }
        // Same idle discipline as every other wait: the notify hypercall
        // kicks the pCPU back out of HLT.
        partivisor_hal::smp::cpu_do_idle();
    }
}

fn vcpu_is_zombie(vcpu: &Vcpu) -> bool {
    vm::get_vm(vcpu.vm_id)
        .and_then(|vm| {
            vm.vcpu(vcpu.vcpu_id)
                .map(|cell| cell.shared.state() == VcpuState::Zombie)
        })
        .unwrap_or(true)
}

/// Pull the completion value out of the slot into the vCPU's request and
/// free the slot.
pub fn complete_ioreq(vm: &Vm, vcpu: &mut Vcpu) {
    if let Some(slot) = vm.ioreq_buffer().slot(vcpu.vcpu_id) {
        stac();
        let value = slot.value;
        match vcpu.req.req_type {
            IoReqType::Portio | IoReqType::Pcicfg => vcpu.req.pio.value = value as u32,
            IoReqType::Mmio => vcpu.req.mmio.value = value,
            IoReqType::Wp => {}
        }
        slot.processed.store(REQ_STATE_FREE, Ordering::Release);
        clac();
    }
}

/// Drop a zombie vCPU's slot without touching the vCPU.
pub fn discard_ioreq(vm: &Vm, vcpu_id: u16) {
    if let Some(slot) = vm.ioreq_buffer().slot(vcpu_id) {
        slot.processed.store(REQ_STATE_FREE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_unset_reports_free() {
        let buf = IoReqBuffer::unset();
        assert!(!buf.is_set());
        assert!(buf.slot(0).is_none());
    }

    #[test]
    fn slot_indexing_is_per_vcpu() {
        use alloc::boxed::Box;
        let page = Box::leak(Box::new([0u8; 4096]));
        let buf = IoReqBuffer::unset();
        buf.set(page.as_ptr() as u64);
        let s0 = buf.slot(0).unwrap() as *const IoReqSlot as usize;
        let s1 = buf.slot(1).unwrap() as *const IoReqSlot as usize;
        assert_eq!(s1 - s0, core::mem::size_of::<IoReqSlot>());
    }
}
