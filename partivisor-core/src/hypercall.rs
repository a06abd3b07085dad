//! The VMCALL surface towards the Service VM (and the TEE calls a User VM
//! issues for its secure world).
//!
//! ABI: leaf in RAX, parameter GPAs in RDI/RSI, result as 0/-errno back in
//! RAX. Ring 0 only. Variable-size payloads start with a versioned header
//! so a stale device model fails loudly instead of silently truncating.

use partivisor_hal::vmx::{exec_vmread32, VMX_GUEST_CS_ATTR};
use partivisor_hal::{cpu_caps, cpuid, GuestPhysAddr, INVALID_HPA};

use crate::ept::{EPT_RD, EPT_RWX, EPT_WB, EPT_WR};
use crate::error::HvErr;
use crate::guest_memory::{copy_from_gpa, copy_to_gpa};
use crate::trusty;
use crate::vcpu::{CpuReg, Vcpu, VcpuCell, NORMAL_WORLD, SECURE_WORLD};
use crate::vioapic::IrqState;
use crate::virq;
use crate::vlapic;
use crate::vm::{self, Vm};

pub const API_VERSION_MAJOR: u32 = 1;
pub const API_VERSION_MINOR: u32 = 0;

/* hypercall leaves */
const HC_ID_BASE: u64 = 0x8000_0000;
pub const HC_GET_API_VERSION: u64 = HC_ID_BASE;
pub const HC_SERVICE_VM_OFFLINE_CPU: u64 = HC_ID_BASE + 0x1;
pub const HC_SET_CALLBACK_VECTOR: u64 = HC_ID_BASE + 0x2;
pub const HC_GET_HW_INFO: u64 = HC_ID_BASE + 0x3;

pub const HC_CREATE_VM: u64 = HC_ID_BASE + 0x10;
pub const HC_DESTROY_VM: u64 = HC_ID_BASE + 0x11;
pub const HC_START_VM: u64 = HC_ID_BASE + 0x12;
pub const HC_PAUSE_VM: u64 = HC_ID_BASE + 0x13;
pub const HC_RESET_VM: u64 = HC_ID_BASE + 0x15;
pub const HC_SET_VCPU_REGS: u64 = HC_ID_BASE + 0x16;
pub const HC_CREATE_VCPU: u64 = HC_ID_BASE + 0x17;

pub const HC_SET_IRQLINE: u64 = HC_ID_BASE + 0x20;
pub const HC_INJECT_MSI: u64 = HC_ID_BASE + 0x21;
pub const HC_VM_INTR_MONITOR: u64 = HC_ID_BASE + 0x22;
pub const HC_SET_PTDEV_INTR_INFO: u64 = HC_ID_BASE + 0x23;
pub const HC_RESET_PTDEV_INTR_INFO: u64 = HC_ID_BASE + 0x24;

pub const HC_SET_IOREQ_BUFFER: u64 = HC_ID_BASE + 0x30;
pub const HC_NOTIFY_REQUEST_FINISH: u64 = HC_ID_BASE + 0x31;
pub const HC_ASYNCIO_ASSIGN: u64 = HC_ID_BASE + 0x32;
pub const HC_ASYNCIO_DEASSIGN: u64 = HC_ID_BASE + 0x33;

pub const HC_SET_VM_MEMORY_REGIONS: u64 = HC_ID_BASE + 0x40;
pub const HC_WRITE_PROTECT_PAGE: u64 = HC_ID_BASE + 0x41;
pub const HC_GPA_TO_HPA: u64 = HC_ID_BASE + 0x42;

pub const HC_ASSIGN_PCIDEV: u64 = HC_ID_BASE + 0x50;
pub const HC_DEASSIGN_PCIDEV: u64 = HC_ID_BASE + 0x51;
pub const HC_ASSIGN_MMIODEV: u64 = HC_ID_BASE + 0x52;
pub const HC_DEASSIGN_MMIODEV: u64 = HC_ID_BASE + 0x53;
pub const HC_ADD_VDEV: u64 = HC_ID_BASE + 0x54;
pub const HC_REMOVE_VDEV: u64 = HC_ID_BASE + 0x55;

pub const HC_SETUP_SBUF: u64 = HC_ID_BASE + 0x60;
pub const HC_SETUP_HV_NPK_LOG: u64 = HC_ID_BASE + 0x61;
pub const HC_PROFILING_OPS: u64 = HC_ID_BASE + 0x62;

pub const HC_INITIALIZE_TRUSTY: u64 = HC_ID_BASE + 0x70;
pub const HC_WORLD_SWITCH: u64 = HC_ID_BASE + 0x71;
pub const HC_SAVE_RESTORE_SWORLD_CTX: u64 = HC_ID_BASE + 0x72;
pub const HC_SWITCH_EE: u64 = HC_ID_BASE + 0x73;
pub const HC_TEE_VCPU_BOOT_DONE: u64 = HC_ID_BASE + 0x74;

pub const HC_GET_CPU_PM_STATE: u64 = HC_ID_BASE + 0x80;

/// Versioned header required ahead of every variable-size payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HcHeader {
    pub magic: u32,
    pub version: u32,
    pub len: u32,
}

pub const HC_HEADER_MAGIC: u32 = 0x5056_4843; /* "CHVP" */
pub const HC_HEADER_VERSION: u32 = 1;

impl HcHeader {
    pub fn validate(&self, payload_len: usize) -> Result<(), HvErr> {
        if self.magic != HC_HEADER_MAGIC
            || self.version != HC_HEADER_VERSION
            || (self.len as usize) < payload_len
        {
            return Err(HvErr::Inval);
        }
        Ok(())
    }
}

fn read_struct<T: Copy>(vm: &Vm, gpa: GuestPhysAddr) -> Result<T, HvErr> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let buf = unsafe {
        core::slice::from_raw_parts_mut(
            value.as_mut_ptr() as *mut u8,
            core::mem::size_of::<T>(),
        )
    };
    copy_from_gpa(vm, buf, gpa).map_err(|_| HvErr::Fault)?;
    // SAFETY: fully overwritten above; T is Copy/plain-old-data here.
    Ok(unsafe { value.assume_init() })
}

fn write_struct<T: Copy>(vm: &Vm, gpa: GuestPhysAddr, value: &T) -> Result<(), HvErr> {
    let buf = unsafe {
        core::slice::from_raw_parts(
            value as *const T as *const u8,
            core::mem::size_of::<T>(),
        )
    };
    copy_to_gpa(vm, buf, gpa).map_err(|_| HvErr::Fault)
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ApiVersion {
    major: u32,
    minor: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct VcpuRegsParam {
    header: HcHeader,
    vcpu_id: u16,
    reserved: u16,
    rip: u64,
    rsp: u64,
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct IrqlineParam {
    irq: u32,
    /// 0 assert, 1 deassert, 2 pulse.
    op: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct MsiParam {
    addr: u64,
    data: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct MemoryRegion {
    /// 0 add, 1 del.
    op: u32,
    reserved: u32,
    service_vm_gpa: u64,
    user_vm_gpa: u64,
    size: u64,
    /// EPT access bits.
    prot: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct MemoryRegionsParam {
    header: HcHeader,
    vm_id: u16,
    reserved: u16,
    count: u32,
    regions_gpa: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct WpParam {
    /// 1 to protect, 0 to release.
    set: u8,
    reserved: [u8; 7],
    gpa: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TranslateParam {
    gpa: u64,
    hpa: u64,
}

fn guest_cpl() -> u32 {
    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
        // SAFETY: owning pCPU, VMCS current.
        unsafe { (exec_vmread32(VMX_GUEST_CS_ATTR) >> 5) & 3 }
    } else {
        0
    }
}

fn target_vm(param: u64) -> Result<alloc::sync::Arc<Vm>, HvErr> {
    vm::get_vm(param as u16).ok_or(HvErr::Inval)
}

/* ---------------- per-leaf bodies ---------------- */

fn hc_get_api_version(service_vm: &Vm, param: u64) -> Result<(), HvErr> {
    let version = ApiVersion {
        major: API_VERSION_MAJOR,
        minor: API_VERSION_MINOR,
    };
    write_struct(service_vm, param, &version)
}

fn hc_set_vcpu_regs(service_vm: &Vm, param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    if target.state() != vm::VmState::Created {
        return Err(HvErr::BadState);
    }
    let regs: VcpuRegsParam = read_struct(service_vm, param2)?;
    regs.header.validate(core::mem::size_of::<VcpuRegsParam>())?;

    let cell = target.vcpu(regs.vcpu_id).ok_or(HvErr::Inval)?;
    // SAFETY: target VM is Created, so no vCPU is Running; the arena write
    // lock in the caller is not needed for this pre-launch seed.
    let vcpu = unsafe { cell.body_mut() };
    vcpu.set_startup_entry(regs.rip);
    vcpu.set_rsp(regs.rsp);
    vcpu.set_gpreg(CpuReg::Rax, regs.rax);
    vcpu.set_gpreg(CpuReg::Rbx, regs.rbx);
    vcpu.set_gpreg(CpuReg::Rcx, regs.rcx);
    vcpu.set_gpreg(CpuReg::Rdx, regs.rdx);
    vcpu.set_gpreg(CpuReg::Rsi, regs.rsi);
    vcpu.set_gpreg(CpuReg::Rdi, regs.rdi);
    Ok(())
}

fn hc_set_irqline(service_vm: &Vm, param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    let p: IrqlineParam = read_struct(service_vm, param2)?;
    let state = match p.op {
        0 => IrqState::Assert,
        1 => IrqState::Deassert,
        2 => IrqState::Pulse,
        _ => return Err(HvErr::Inval),
    };
    target.vioapic().set_irqstate(&target, p.irq, state)
}

fn hc_inject_msi(service_vm: &Vm, param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    let msi: MsiParam = read_struct(service_vm, param2)?;
    // Architectural MSI format: dest in addr[19:12], vector in data[7:0].
    let dest = ((msi.addr >> 12) & 0xFF) as u32;
    let phys = msi.addr & (1 << 2) == 0; /* redirection hint off = physical */
    let delmode = (msi.data & 0x700) as u32;
    let vector = (msi.data & 0xFF) as u32;
    vlapic::vlapic_deliver_intr(&target, false, dest, phys, delmode, vector);
    Ok(())
}

fn hc_set_ioreq_buffer(service_vm: &Vm, param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    let gpa: u64 = read_struct(service_vm, param2)?;
    let hpa = service_vm.gpa2hpa(gpa);
    if hpa == INVALID_HPA {
        return Err(HvErr::Fault);
    }
    target.ioreq_buffer().set(hpa);
    Ok(())
}

fn hc_notify_ioreq_finish(param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    let cell = target.vcpu(param2 as u16).ok_or(HvErr::Inval)?;
    // The blocked vCPU polls the slot; a kick shortens the wait when it
    // sits in root mode.
    virq::kick_vcpu(&cell.shared);
    Ok(())
}

fn hc_set_vm_memory_regions(service_vm: &Vm, param: u64) -> Result<(), HvErr> {
    let p: MemoryRegionsParam = read_struct(service_vm, param)?;
    p.header.validate(core::mem::size_of::<MemoryRegionsParam>())?;
    let target = vm::get_vm(p.vm_id).ok_or(HvErr::Inval)?;

    for i in 0..p.count as u64 {
        let region: MemoryRegion = read_struct(
            service_vm,
            p.regions_gpa + i * core::mem::size_of::<MemoryRegion>() as u64,
        )?;
        let hpa = service_vm.gpa2hpa(region.service_vm_gpa);
        match region.op {
            0 => {
                if hpa == INVALID_HPA {
                    return Err(HvErr::Fault);
                }
                let prot = if region.prot == 0 {
                    EPT_RWX | EPT_WB
                } else {
                    region.prot
                };
                target.ept_add_mr(hpa, region.user_vm_gpa, region.size, prot)?;
            }
            1 => target.ept_del_mr(region.user_vm_gpa, region.size)?,
            _ => return Err(HvErr::Inval),
        }
    }
    Ok(())
}

fn hc_write_protect_page(service_vm: &Vm, param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    let p: WpParam = read_struct(service_vm, param2)?;
    if p.set != 0 {
        target.ept_mr_modify(p.gpa & !0xFFF, 0x1000, 0, EPT_WR)
    } else {
        target.ept_mr_modify(p.gpa & !0xFFF, 0x1000, EPT_WR | EPT_RD, 0)
    }
}

fn hc_gpa_to_hpa(service_vm: &Vm, param1: u64, param2: u64) -> Result<(), HvErr> {
    let target = target_vm(param1)?;
    let mut p: TranslateParam = read_struct(service_vm, param2)?;
    p.hpa = target.gpa2hpa(p.gpa);
    if p.hpa == INVALID_HPA {
        return Err(HvErr::Fault);
    }
    write_struct(service_vm, param2, &p)
}

/* ---- TEE calls issued by the owning User VM ---- */

fn hc_initialize_trusty(vcpu: &mut Vcpu, vm: &Vm, param: u64) -> Result<(), HvErr> {
    let boot_param: trusty::TrustyBootParam = read_struct(vm, param)?;
    if trusty::initialize_trusty(vcpu, vm, &boot_param) {
        Ok(())
    } else {
        Err(HvErr::Inval)
    }
}

fn hc_world_switch(vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    if !vm.has_sworld() {
        return Err(HvErr::BadState);
    }
    let next = if vcpu.arch.cur_context == NORMAL_WORLD {
        SECURE_WORLD
    } else {
        NORMAL_WORLD
    };
    trusty::switch_world(vcpu, vm, next);
    Ok(())
}

fn hc_save_restore_sworld_ctx(vcpu: &mut Vcpu, vm: &Vm, save: bool) -> Result<(), HvErr> {
    if save {
        if !vm.has_sworld() {
            return Err(HvErr::BadState);
        }
        trusty::save_sworld_context(vcpu, vm);
        Ok(())
    } else {
        trusty::restore_sworld_context(vcpu, vm)
    }
}

/// Dispatch one VMCALL. The return value lands in guest RAX.
pub fn vmcall_vmexit_handler(cell: &VcpuCell, vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let leaf = vcpu.get_gpreg(CpuReg::Rax);
    let param1 = vcpu.get_gpreg(CpuReg::Rdi);
    let param2 = vcpu.get_gpreg(CpuReg::Rsi);
    let _ = cell;

    let result = if guest_cpl() != 0 {
        // Non-ring-0 callers get #UD, not an errno.
        virq::vcpu_inject_ud(vcpu);
        vcpu.retain_rip();
        return Ok(());
    } else {
        dispatch_hypercall(vcpu, vm, leaf, param1, param2)
    };

    let rax = match result {
        Ok(()) => 0i64,
        Err(e) => e.errno() as i64,
    };
    vcpu.set_gpreg(CpuReg::Rax, rax as u64);
    Ok(())
}

fn dispatch_hypercall(
    vcpu: &mut Vcpu,
    vm: &Vm,
    leaf: u64,
    param1: u64,
    param2: u64,
) -> Result<(), HvErr> {
    // TEE leaves are the only ones a non-Service VM may issue.
    let is_tee_leaf = matches!(
        leaf,
        HC_INITIALIZE_TRUSTY
            | HC_WORLD_SWITCH
            | HC_SAVE_RESTORE_SWORLD_CTX
            | HC_SWITCH_EE
            | HC_TEE_VCPU_BOOT_DONE
    );
    if !vm.is_service_vm() && !is_tee_leaf {
        crate::pr_warn!("vm{}: hypercall {:#x} denied", vm.vm_id, leaf);
        return Err(HvErr::Access);
    }

    match leaf {
        HC_GET_API_VERSION => hc_get_api_version(vm, param1),
        HC_CREATE_VM => vm::create_vm(vm::VmConfig::new(vm::VmType::User, 1))
            .map(|created| {
                // Hand the new vm_id back through the parameter block.
                let _ = write_struct(vm, param1, &(created.vm_id as u64));
            }),
        HC_DESTROY_VM => vm::destroy_vm(param1 as u16),
        HC_START_VM => target_vm(param1)?.start(param2),
        HC_PAUSE_VM => target_vm(param1)?.pause(),
        HC_RESET_VM => target_vm(param1)?.reset(),
        HC_SET_VCPU_REGS => hc_set_vcpu_regs(vm, param1, param2),
        HC_SET_IRQLINE => hc_set_irqline(vm, param1, param2),
        HC_INJECT_MSI => hc_inject_msi(vm, param1, param2),
        HC_SET_IOREQ_BUFFER => hc_set_ioreq_buffer(vm, param1, param2),
        HC_NOTIFY_REQUEST_FINISH => hc_notify_ioreq_finish(param1, param2),
        HC_SET_VM_MEMORY_REGIONS => hc_set_vm_memory_regions(vm, param1),
        HC_WRITE_PROTECT_PAGE => hc_write_protect_page(vm, param1, param2),
        HC_GPA_TO_HPA => hc_gpa_to_hpa(vm, param1, param2),
        HC_SERVICE_VM_OFFLINE_CPU => {
            partivisor_hal::smp::make_pcpu_offline(param1 as u16);
            Ok(())
        }
        HC_INITIALIZE_TRUSTY => hc_initialize_trusty(vcpu, vm, param1),
        HC_WORLD_SWITCH => hc_world_switch(vcpu, vm),
        HC_SAVE_RESTORE_SWORLD_CTX => hc_save_restore_sworld_ctx(vcpu, vm, param1 != 0),
        /* Collaborator subsystems (passthrough wiring, profiling, power,
         * trace buffers) are outside the virtualization engine. */
        HC_ASSIGN_PCIDEV | HC_DEASSIGN_PCIDEV | HC_ASSIGN_MMIODEV | HC_DEASSIGN_MMIODEV
        | HC_ADD_VDEV | HC_REMOVE_VDEV | HC_SET_PTDEV_INTR_INFO
        | HC_RESET_PTDEV_INTR_INFO | HC_VM_INTR_MONITOR | HC_SETUP_SBUF
        | HC_SETUP_HV_NPK_LOG | HC_PROFILING_OPS | HC_GET_CPU_PM_STATE
        | HC_GET_HW_INFO | HC_SET_CALLBACK_VECTOR | HC_ASYNCIO_ASSIGN
        | HC_ASYNCIO_DEASSIGN | HC_CREATE_VCPU | HC_SWITCH_EE
        | HC_TEE_VCPU_BOOT_DONE => Err(HvErr::NoDev),
        _ => {
            crate::pr_err!("unknown hypercall {:#x}", leaf);
            Err(HvErr::Inval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::{EPT_RWX, EPT_WB};
    use crate::vm::tests::fixture_vm;
    use alloc::boxed::Box;

    fn service_like_vm() -> alloc::sync::Arc<Vm> {
        crate::vm::tests::fixture_vm_with(|c| c.vm_type = vm::VmType::Service)
    }

    /// Back `[gpa, +pages*4K)` of `vm` with leaked host memory.
    fn back(vm: &Vm, gpa: u64, pages: usize) -> u64 {
        let buf: Box<[u8]> = alloc::vec![0u8; (pages + 1) * 4096].into_boxed_slice();
        let addr = Box::leak(buf).as_ptr() as u64;
        let aligned = (addr + 0xFFF) & !0xFFF;
        vm.ept_add_mr(aligned, gpa, pages as u64 * 4096, EPT_RWX | EPT_WB)
            .unwrap();
        aligned
    }

    #[test]
    fn header_validation() {
        let good = HcHeader {
            magic: HC_HEADER_MAGIC,
            version: HC_HEADER_VERSION,
            len: 64,
        };
        assert!(good.validate(64).is_ok());
        assert!(good.validate(128).is_err());
        let bad = HcHeader {
            magic: 0,
            ..good
        };
        assert!(bad.validate(8).is_err());
    }

    #[test]
    fn api_version_lands_in_guest_memory() {
        let svm = service_like_vm();
        let hpa = back(&svm, 0x5000, 1);
        hc_get_api_version(&svm, 0x5000).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(hpa as *const u8, 8) };
        assert_eq!(&bytes[0..4], &API_VERSION_MAJOR.to_le_bytes());
        assert_eq!(&bytes[4..8], &API_VERSION_MINOR.to_le_bytes());
    }

    #[test]
    fn non_service_vm_is_denied_management_calls() {
        let uvm = fixture_vm(1);
        let cell = uvm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        assert_eq!(
            dispatch_hypercall(vcpu, &uvm, HC_DESTROY_VM, 0, 0),
            Err(HvErr::Access)
        );
    }

    #[test]
    fn memory_regions_add_and_delete() {
        let svm = service_like_vm();
        let target = fixture_vm(1);
        // Service VM memory: one page of parameters, one page of backing
        // to be donated.
        back(&svm, 0x10_0000, 1); /* params */
        let donated_hpa = back(&svm, 0x20_0000, 4);

        let region = MemoryRegion {
            op: 0,
            reserved: 0,
            service_vm_gpa: 0x20_0000,
            user_vm_gpa: 0x40_0000,
            size: 4 * 4096,
            prot: 0,
        };
        let regions_gpa = 0x10_0000 + 0x100;
        write_struct(&svm, regions_gpa, &region).unwrap();
        let param = MemoryRegionsParam {
            header: HcHeader {
                magic: HC_HEADER_MAGIC,
                version: HC_HEADER_VERSION,
                len: core::mem::size_of::<MemoryRegionsParam>() as u32,
            },
            vm_id: target.vm_id,
            reserved: 0,
            count: 1,
            regions_gpa,
        };
        write_struct(&svm, 0x10_0000, &param).unwrap();

        hc_set_vm_memory_regions(&svm, 0x10_0000).unwrap();
        assert_eq!(target.gpa2hpa(0x40_0000), donated_hpa);

        // Now delete through the same path.
        let region = MemoryRegion {
            op: 1,
            ..region
        };
        write_struct(&svm, regions_gpa, &region).unwrap();
        hc_set_vm_memory_regions(&svm, 0x10_0000).unwrap();
        assert_eq!(target.gpa2hpa(0x40_0000), INVALID_HPA);
    }

    #[test]
    fn write_protect_page_clears_and_restores_write() {
        let svm = service_like_vm();
        let target = fixture_vm(1);
        back(&svm, 0x3000, 1);
        back(&target, 0x7000, 1);

        fn leaf_rights(vm: &Vm, gpa: u64) -> u64 {
            let mut rights = 0;
            vm.walk_ept(|entry, size| {
                let frame = entry & crate::ept::EPT_ENTRY_PFN_MASK;
                if (frame..frame + size).contains(&vm.gpa2hpa(gpa)) {
                    rights = entry & EPT_RWX;
                }
            });
            rights
        }

        let wp = WpParam {
            set: 1,
            reserved: [0; 7],
            gpa: 0x7000,
        };
        write_struct(&svm, 0x3000, &wp).unwrap();
        hc_write_protect_page(&svm, target.vm_id as u64, 0x3000).unwrap();
        assert_eq!(leaf_rights(&target, 0x7000) & crate::ept::EPT_WR, 0);

        let wp = WpParam { set: 0, ..wp };
        write_struct(&svm, 0x3000, &wp).unwrap();
        hc_write_protect_page(&svm, target.vm_id as u64, 0x3000).unwrap();
        assert_ne!(leaf_rights(&target, 0x7000) & crate::ept::EPT_WR, 0);
    }

    #[test]
    fn gpa_to_hpa_round_trip() {
        let svm = service_like_vm();
        let target = fixture_vm(1);
        back(&svm, 0x3000, 1);
        let hpa = back(&target, 0x9000, 1);

        let p = TranslateParam { gpa: 0x9000, hpa: 0 };
        write_struct(&svm, 0x3000, &p).unwrap();
        hc_gpa_to_hpa(&svm, target.vm_id as u64, 0x3000).unwrap();
        let out: TranslateParam = read_struct(&svm, 0x3000).unwrap();
        assert_eq!(out.hpa, hpa);

        let p = TranslateParam { gpa: 0xFF_0000, hpa: 0 };
        write_struct(&svm, 0x3000, &p).unwrap();
        assert_eq!(
            hc_gpa_to_hpa(&svm, target.vm_id as u64, 0x3000),
            Err(HvErr::Fault)
        );
    }

    #[test]
    fn irqline_reaches_the_vioapic() {
        let svm = service_like_vm();
        let target = fixture_vm(1);
        back(&svm, 0x3000, 1);

        let p = IrqlineParam { irq: 999, op: 0 };
        write_struct(&svm, 0x3000, &p).unwrap();
        assert_eq!(
            hc_set_irqline(&svm, target.vm_id as u64, 0x3000),
            Err(HvErr::Inval)
        );
    }
}
