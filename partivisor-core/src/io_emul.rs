//! Port-I/O and MMIO emulation: handler tables, dispatch and completion.
//!
//! A request is tried against in-hypervisor handlers first; a handler that
//! declines (or the absence of one) routes the request to the Service VM
//! device model through the ioreq page. Completion work is split by type:
//! port reads splice into RAX at access width, MMIO reads re-execute the
//! decoded instruction against the filled-in value.

use alloc::boxed::Box;

use spin::RwLock;

use partivisor_hal::page::Page;
use partivisor_hal::vmx::{exec_vmread, VMX_GUEST_PHYSICAL_ADDR_FULL};
use partivisor_hal::{hva2hpa, GuestPhysAddr};

use crate::config::{EMUL_PIO_IDX_MAX, MAX_EMULATED_MMIO_REGIONS};
use crate::error::HvErr;
use crate::instr_emul;
use crate::ioreq::{self, IoDirection, IoReqType};
use crate::vcpu::{CpuReg, Vcpu};
use crate::vm::{self, Vm};

#[derive(Debug, Clone, Copy, Default)]
pub struct PioRequest {
    pub direction: IoDirection,
    pub address: u16,
    pub size: usize,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MmioRequest {
    pub direction: IoDirection,
    pub address: GuestPhysAddr,
    pub size: u64,
    pub value: u64,
}

/// The reusable per-vCPU emulation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoRequest {
    pub req_type: IoReqType,
    pub pio: PioRequest,
    pub mmio: MmioRequest,
}

/// Port read handler: fill `pio.value`; return false to defer to the DM.
pub type PioReadFn = fn(&Vm, &mut PioRequest) -> bool;
/// Port write handler: return false to defer to the DM.
pub type PioWriteFn = fn(&Vm, u16, usize, u32) -> bool;

#[derive(Clone, Copy)]
pub struct VmIoHandlerDesc {
    pub port_start: u16,
    pub port_end: u16,
    pub io_read: Option<PioReadFn>,
    pub io_write: Option<PioWriteFn>,
}

impl VmIoHandlerDesc {
    const fn empty() -> Self {
        VmIoHandlerDesc {
            port_start: 0,
            port_end: 0,
            io_read: None,
            io_write: None,
        }
    }
}

pub type MmioHandlerFn = fn(&Vm, &mut MmioRequest) -> Result<(), HvErr>;

#[derive(Clone, Copy)]
pub struct MemIoNode {
    pub range_start: u64,
    pub range_end: u64,
    pub read_write: MmioHandlerFn,
}

/// Two pages of port-permission bits handed to the VMCS: bit set = exit.
pub struct IoBitmap {
    pages: Box<[Page; 2]>,
}

impl IoBitmap {
    /// All ports trapping.
    pub fn new_all_trapped() -> Self {
        let mut pages = Box::new([Page::zeroed(), Page::zeroed()]);
        for page in pages.iter_mut() {
            page.0.fill(0xFF);
        }
        IoBitmap { pages }
    }

    pub fn bitmap_a_hpa(&self) -> u64 {
        hva2hpa(self.pages[0].0.as_ptr())
    }

    pub fn bitmap_b_hpa(&self) -> u64 {
        hva2hpa(self.pages[1].0.as_ptr())
    }

    fn set_ports(&mut self, base: u16, nbytes: u32, trap: bool) {
        for i in 0..nbytes {
            let Some(port) = base.checked_add(i as u16) else { break };
            let page = &mut self.pages[(port >> 15) as usize];
            let byte = &mut page.0[((port & 0x7FFF) >> 3) as usize];
            let bit = 1u8 << (port & 7);
            if trap {
                *byte |= bit;
            } else {
                *byte &= !bit;
            }
        }
    }

    pub fn is_trapped(&self, port: u16) -> bool {
        let page = &self.pages[(port >> 15) as usize];
        page.0[((port & 0x7FFF) >> 3) as usize] & (1u8 << (port & 7)) != 0
    }
}

/// All I/O emulation state a VM owns.
pub struct VmIoTables {
    pub pio: RwLock<[VmIoHandlerDesc; EMUL_PIO_IDX_MAX]>,
    pub mmio: RwLock<heapless::Vec<MemIoNode, MAX_EMULATED_MMIO_REGIONS>>,
    pub bitmap: RwLock<IoBitmap>,
}

impl VmIoTables {
    pub fn new() -> Self {
        VmIoTables {
            pio: RwLock::new([VmIoHandlerDesc::empty(); EMUL_PIO_IDX_MAX]),
            mmio: RwLock::new(heapless::Vec::new()),
            bitmap: RwLock::new(IoBitmap::new_all_trapped()),
        }
    }
}

impl Default for VmIoTables {
    fn default() -> Self {
        VmIoTables::new()
    }
}

/// Let the VM touch `[port, port+nbytes)` directly, no exit.
pub fn allow_guest_pio_access(vm: &Vm, port: u16, nbytes: u32) {
    vm.io().bitmap.write().set_ports(port, nbytes, false);
}

pub fn deny_guest_pio_access(vm: &Vm, port: u16, nbytes: u32) {
    vm.io().bitmap.write().set_ports(port, nbytes, true);
}

/// Install a port-I/O handler at a fixed slot index.
pub fn register_pio_emulation_handler(
    vm: &Vm,
    pio_idx: usize,
    port_start: u16,
    len: u16,
    io_read: Option<PioReadFn>,
    io_write: Option<PioWriteFn>,
) {
    debug_assert!(pio_idx < EMUL_PIO_IDX_MAX);
    if vm.is_service_vm() {
        deny_guest_pio_access(vm, port_start, len as u32);
    }
    let mut table = vm.io().pio.write();
    table[pio_idx] = VmIoHandlerDesc {
        port_start,
        port_end: port_start + len,
        io_read,
        io_write,
    };
}

/// Install an MMIO handler for `[start, end)`; refuses once the VM runs.
pub fn register_mmio_emulation_handler(
    vm: &Vm,
    read_write: MmioHandlerFn,
    start: u64,
    end: u64,
) -> Result<(), HvErr> {
    if read_write as usize == 0 || end <= start {
        return Err(HvErr::Inval);
    }
    if vm.any_vcpu_launched() {
        crate::pr_err!("vm{}: mmio handler registered after launch", vm.vm_id);
        return Err(HvErr::BadState);
    }
    let mut table = vm.io().mmio.write();
    table
        .push(MemIoNode {
            range_start: start,
            range_end: end,
            read_write,
        })
        .map_err(|_| HvErr::NoMem)?;
    // The Service VM mapped all memory up front; carve the range out so
    // accesses actually trap.
    if vm.is_service_vm() {
        let _ = vm.ept_del_mr(start, end - start);
    }
    Ok(())
}

/// Splice a completed port read into RAX at the access width.
pub fn emulate_pio_complete(vcpu: &mut Vcpu, req: &IoRequest) {
    let pio = &req.pio;
    let mask = 0xFFFF_FFFFu64 >> (32 - 8 * pio.size as u32);
    if pio.direction == IoDirection::Read {
        let rax = vcpu.get_gpreg(CpuReg::Rax);
        vcpu.set_gpreg(CpuReg::Rax, (rax & !mask) | (pio.value as u64 & mask));
    }
}

fn emulate_mmio_complete(vcpu: &mut Vcpu, req: &IoRequest) {
    if req.mmio.direction == IoDirection::Read {
        let value = req.mmio.value;
        let _ = instr_emul::emulate_instruction(vcpu, value);
    }
}

/// Try the in-hypervisor port handlers.
fn hv_emulate_pio(vm: &Vm, req: &mut IoRequest) -> Result<(), HvErr> {
    let port = req.pio.address;
    let size = req.pio.size;
    let table = vm.io().pio.read();
    for handler in table.iter() {
        if port < handler.port_start || port >= handler.port_end {
            continue;
        }
        return if req.pio.direction == IoDirection::Write {
            match handler.io_write {
                Some(write) if !write(vm, port, size, req.pio.value) => Err(HvErr::NoDev),
                Some(_) => Ok(()),
                None => Ok(()),
            }
        } else {
            match handler.io_read {
                Some(read) if !read(vm, &mut req.pio) => Err(HvErr::NoDev),
                Some(_) => Ok(()),
                None => Ok(()),
            }
        };
    }
    Err(HvErr::NoDev)
}

/// Try the in-hypervisor MMIO handlers. A request straddling a region
/// boundary is unrecoverable.
fn hv_emulate_mmio(vm: &Vm, req: &mut IoRequest) -> Result<(), HvErr> {
    let address = req.mmio.address;
    let size = req.mmio.size;
    let table = vm.io().mmio.read();
    for node in table.iter() {
        if address + size <= node.range_start || address >= node.range_end {
            continue;
        }
        if !(address >= node.range_start && address + size <= node.range_end) {
            crate::pr_fatal!("mmio request {:#x}+{:#x} crosses a region", address, size);
            return Err(HvErr::Io);
        }
        return (node.read_write)(vm, &mut req.mmio);
    }
    Err(HvErr::NoDev)
}

/// Emulate the vCPU's current request in the hypervisor, falling back to
/// the device model when nothing claims it.
pub fn emulate_io(vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let mut req = vcpu.req;
    let status = match req.req_type {
        IoReqType::Portio | IoReqType::Pcicfg => hv_emulate_pio(vm, &mut req),
        IoReqType::Mmio | IoReqType::Wp => hv_emulate_mmio(vm, &mut req),
    };
    vcpu.req = req;

    match status {
        Ok(()) => {
            match vcpu.req.req_type {
                IoReqType::Portio | IoReqType::Pcicfg => {
                    let req = vcpu.req;
                    emulate_pio_complete(vcpu, &req);
                }
                IoReqType::Mmio | IoReqType::Wp => {
                    let req = vcpu.req;
                    emulate_mmio_complete(vcpu, &req);
                }
            }
            Ok(())
        }
        Err(HvErr::NoDev) => {
            let inserted = ioreq::insert_request(vcpu);
            match inserted {
                Ok(()) => {
                    dm_emulate_io_complete(vcpu, vm);
                    Ok(())
                }
                Err(e) => {
                    crate::pr_fatal!(
                        "io defer failed: type {:?} addr {:#x}",
                        vcpu.req.req_type,
                        vcpu.req.mmio.address
                    );
                    Err(e)
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Post-work once the device model flipped the slot to COMPLETE.
pub fn dm_emulate_io_complete(vcpu: &mut Vcpu, vm: &Vm) {
    if ioreq::get_req_state(vm, vcpu.vcpu_id) != ioreq::REQ_STATE_COMPLETE {
        return;
    }
    if vcpu_zombie(vcpu, vm) {
        ioreq::discard_ioreq(vm, vcpu.vcpu_id);
        return;
    }
    ioreq::complete_ioreq(vm, vcpu);
    let req = vcpu.req;
    match req.req_type {
        IoReqType::Mmio => emulate_mmio_complete(vcpu, &req),
        // A port access re-typed to PCICFG shares the PIO layout; the
        // post-work only cares about the read value.
        IoReqType::Portio | IoReqType::Pcicfg => emulate_pio_complete(vcpu, &req),
        // Write-protect requests are writes; nothing to splice back.
        IoReqType::Wp => {}
    }
}

fn vcpu_zombie(vcpu: &Vcpu, vm: &Vm) -> bool {
    vm.vcpu(vcpu.vcpu_id)
        .map(|cell| cell.shared.state() == crate::vcpu::VcpuState::Zombie)
        .unwrap_or(true)
}

/* qualification decode for I/O instruction exits */
fn io_size(qual: u64) -> usize {
    (qual & 0x7) as usize + 1
}

fn io_is_in(qual: u64) -> bool {
    qual & (1 << 3) != 0
}

fn io_port(qual: u64) -> u16 {
    (qual >> 16) as u16
}

/// VM exit: IN/OUT instruction.
pub fn pio_instr_vmexit_handler(vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let qual = vcpu.arch.exit_qualification;

    vcpu.req = IoRequest::default();
    vcpu.req.req_type = IoReqType::Portio;
    vcpu.req.pio.size = io_size(qual);
    vcpu.req.pio.address = io_port(qual);
    if io_is_in(qual) {
        vcpu.req.pio.direction = IoDirection::Read;
    } else {
        let mask = 0xFFFF_FFFFu32 >> (32 - 8 * vcpu.req.pio.size as u32);
        vcpu.req.pio.direction = IoDirection::Write;
        vcpu.req.pio.value = vcpu.get_gpreg(CpuReg::Rax) as u32 & mask;
    }

    emulate_io(vcpu, vm)
}

/* EPT-violation qualification bits */
const EPT_VIOLATION_WRITE: u64 = 1 << 1;
/// Access was a write and the leaf allowed read+execute: a write-protect
/// trap rather than a hole.
const EPT_VIOLATION_PERM_MASK: u64 = 0x38;
const EPT_VIOLATION_PERM_RX: u64 = 0x28;

/// VM exit: EPT violation on a non-misconfigured address — MMIO emulation.
pub fn ept_violation_vmexit_handler(vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let qual = vcpu.arch.exit_qualification;

    vcpu.req = IoRequest::default();
    vcpu.req.req_type = IoReqType::Mmio;

    if qual & EPT_VIOLATION_WRITE != 0 {
        vcpu.req.mmio.direction = IoDirection::Write;
        if qual & EPT_VIOLATION_PERM_MASK == EPT_VIOLATION_PERM_RX {
            vcpu.req.req_type = IoReqType::Wp;
        }
    } else {
        vcpu.req.mmio.direction = IoDirection::Read;
    }

    // SAFETY: on the owning pCPU inside its own exit.
    let gpa = unsafe { exec_vmread(VMX_GUEST_PHYSICAL_ADDR_FULL) };
    vcpu.req.mmio.address = gpa;

    match instr_emul::decode_instruction(vcpu, vm) {
        Ok(size) => {
            vcpu.req.mmio.size = size as u64;
            if vcpu.req.mmio.direction == IoDirection::Write {
                // Resolve the written value before anything is handed on.
                let value = instr_emul::emulated_write_value(vcpu)?;
                vcpu.req.mmio.value = value;
            }
            emulate_io(vcpu, vm)
        }
        Err(HvErr::Fault) => {
            // The fetch itself faulted; the injected #PF will rerun the
            // instruction.
            Ok(())
        }
        Err(e) => {
            crate::pr_err!("vm{}: undecodable access at gpa {:#x}", vm.vm_id, gpa);
            Err(e)
        }
    }
}

/// Spec-facing wrapper used by hypercalls: route a one-off request through
/// the same dispatch as an exit would.
pub fn mmio_request(vm: &Vm, req: &mut MmioRequest) -> Result<(), HvErr> {
    let mut io_req = IoRequest {
        req_type: IoReqType::Mmio,
        mmio: *req,
        ..Default::default()
    };
    let status = hv_emulate_mmio(vm, &mut io_req);
    *req = io_req.mmio;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::fixture_vm;

    fn ro_port_read(_vm: &Vm, pio: &mut PioRequest) -> bool {
        pio.value = 0xA5A5_5A5A;
        true
    }

    fn port_write_declines(_vm: &Vm, _port: u16, _size: usize, _value: u32) -> bool {
        false
    }

    fn scratch_mmio(_vm: &Vm, req: &mut MmioRequest) -> Result<(), HvErr> {
        if req.direction == IoDirection::Read {
            req.value = 0x1122_3344_5566_7788;
        }
        Ok(())
    }

    #[test]
    fn pio_dispatch_finds_covering_slot() {
        let vm = fixture_vm(1);
        register_pio_emulation_handler(&vm, 0, 0x60, 4, Some(ro_port_read), None);

        let mut req = IoRequest::default();
        req.req_type = IoReqType::Portio;
        req.pio.address = 0x62;
        req.pio.size = 1;
        req.pio.direction = IoDirection::Read;
        assert!(hv_emulate_pio(&vm, &mut req).is_ok());
        assert_eq!(req.pio.value, 0xA5A5_5A5A);

        req.pio.address = 0x64;
        assert_eq!(hv_emulate_pio(&vm, &mut req), Err(HvErr::NoDev));
    }

    #[test]
    fn pio_handler_can_defer_to_dm() {
        let vm = fixture_vm(1);
        register_pio_emulation_handler(&vm, 1, 0xCF8, 8, None, Some(port_write_declines));
        let mut req = IoRequest::default();
        req.req_type = IoReqType::Portio;
        req.pio.address = 0xCF8;
        req.pio.size = 4;
        req.pio.direction = IoDirection::Write;
        assert_eq!(hv_emulate_pio(&vm, &mut req), Err(HvErr::NoDev));
    }

    #[test]
    fn mmio_boundary_crossing_is_eio() {
        let vm = fixture_vm(1);
        register_mmio_emulation_handler(&vm, scratch_mmio, 0x1000, 0x2000).unwrap();

        let mut req = IoRequest::default();
        req.req_type = IoReqType::Mmio;
        req.mmio.address = 0x1FFC;
        req.mmio.size = 8;
        req.mmio.direction = IoDirection::Read;
        assert_eq!(hv_emulate_mmio(&vm, &mut req), Err(HvErr::Io));

        req.mmio.address = 0x1FF8;
        assert!(hv_emulate_mmio(&vm, &mut req).is_ok());
        assert_eq!(req.mmio.value, 0x1122_3344_5566_7788);
    }

    #[test]
    fn mmio_table_capacity_bounded() {
        let vm = fixture_vm(1);
        for i in 0..MAX_EMULATED_MMIO_REGIONS as u64 {
            register_mmio_emulation_handler(
                &vm,
                scratch_mmio,
                0x10_0000 + i * 0x1000,
                0x10_0000 + (i + 1) * 0x1000,
            )
            .unwrap();
        }
        assert_eq!(
            register_mmio_emulation_handler(&vm, scratch_mmio, 0x90_0000, 0x91_0000),
            Err(HvErr::NoMem)
        );
    }

    #[test]
    fn io_bitmap_default_traps_everything() {
        let vm = fixture_vm(1);
        assert!(vm.io().bitmap.read().is_trapped(0x3F8));
        allow_guest_pio_access(&vm, 0x3F8, 8);
        assert!(!vm.io().bitmap.read().is_trapped(0x3F8));
        assert!(!vm.io().bitmap.read().is_trapped(0x3FF));
        assert!(vm.io().bitmap.read().is_trapped(0x400));
        deny_guest_pio_access(&vm, 0x3F8, 8);
        assert!(vm.io().bitmap.read().is_trapped(0x3F8));
    }

    #[test]
    fn pio_qualification_decode() {
        // OUT 0x71, size 1: qual has port<<16, dir bit clear.
        let qual = (0x71u64 << 16) | 0x0;
        assert_eq!(io_port(qual), 0x71);
        assert_eq!(io_size(qual), 1);
        assert!(!io_is_in(qual));
        assert!(io_is_in(qual | (1 << 3)));
    }
}
