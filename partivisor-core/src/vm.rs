//! The VM: identity, its vCPUs, both worlds' EPT, the emulation tables and
//! the lifecycle state machine.
//!
//! VMs live in a process-wide arena and are addressed by `vm_id`
//! everywhere; holding an `Arc` only pins the allocation, never a lock.
//! Every EPT mutation fans an `EPT_FLUSH` request out to the VM's vCPUs —
//! the invalidation itself runs on each owning pCPU at its next entry.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use spin::{Mutex, RwLock};

use partivisor_hal::page::PagePool;
use partivisor_hal::percpu;
use partivisor_hal::{GuestPhysAddr, PhysAddr, INVALID_HPA};

use crate::config::{E820_MAX_ENTRIES, MAX_VCPUS_PER_VM, MAX_VM_NUM, VIOAPIC_BASE, VIOAPIC_SIZE};
use crate::ept::Ept;
use crate::error::HvErr;
use crate::io_emul::{self, MmioRequest, VmIoTables};
use crate::ioreq::IoReqBuffer;
use crate::schedule::VCPU_EVENT_VIRTUAL_INTERRUPT;
use crate::vcpu::{GuestCpuContext, VcpuCell, VcpuState};
use crate::vioapic::Vioapic;
use crate::virq::{self, REQ_EPT_FLUSH, REQ_INIT_VMCS};
use crate::vlapic::{APIC_DELMODE_INIT, APIC_DELMODE_STARTUP};
use crate::vpic::Vpic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmState {
    Created = 0,
    Started = 1,
    Paused = 2,
    PoweredOff = 3,
}

impl VmState {
    fn from_u8(v: u8) -> VmState {
        match v {
            1 => VmState::Started,
            2 => VmState::Paused,
            3 => VmState::PoweredOff,
            _ => VmState::Created,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Service,
    User,
    RtUser,
}

/// Static per-VM configuration, normally distilled from the scenario.
#[derive(Clone)]
pub struct VmConfig {
    pub name: [u8; 32],
    pub vm_type: VmType,
    pub vcpu_num: u16,
    /// Pinned pCPU per vCPU slot.
    pub cpu_affinity: [u16; MAX_VCPUS_PER_VM],
    pub sworld_supported: bool,
    pub lapic_pt: bool,
    /// vCAT: number of virtual CLOS ids, 0 when not configured.
    pub num_vclosids: u16,
    /// vCAT: assigned physical CLOS per virtual CLOS.
    pub pclosids: [u16; 8],
    pub max_l2_pcbm: u64,
    pub max_l3_pcbm: u64,
}

impl VmConfig {
    pub fn new(vm_type: VmType, vcpu_num: u16) -> Self {
        let mut affinity = [0u16; MAX_VCPUS_PER_VM];
        for (i, a) in affinity.iter_mut().enumerate() {
            *a = i as u16;
        }
        VmConfig {
            name: [0; 32],
            vm_type,
            vcpu_num,
            cpu_affinity: affinity,
            sworld_supported: vm_type == VmType::User,
            lapic_pt: false,
            num_vclosids: 0,
            pclosids: [0; 8],
            max_l2_pcbm: 0,
            max_l3_pcbm: 0,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        let bytes = name.as_bytes();
        let n = bytes.len().min(31);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct E820Entry {
    pub baseaddr: u64,
    pub length: u64,
    pub entry_type: u32,
}

/// Secure-world memory bookkeeping, kept for teardown and snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct SworldMemory {
    pub base_gpa_in_user_vm: u64,
    pub base_hpa: u64,
    pub length: u64,
}

#[derive(Default)]
pub struct SworldControl {
    pub memory: SworldMemory,
}

pub struct Vm {
    pub vm_id: u16,
    pub config: VmConfig,
    state: AtomicU8,
    vcpus: Box<[VcpuCell]>,
    nworld_ept: Ept,
    sworld_ept: RwLock<Option<Ept>>,
    pub sworld_control: Mutex<SworldControl>,
    pub sworld_snapshot: Mutex<Option<Box<GuestCpuContext>>>,
    io: VmIoTables,
    ioreq: IoReqBuffer,
    vioapic: Vioapic,
    vpic: Vpic,
    pub e820: RwLock<heapless::Vec<E820Entry, E820_MAX_ENTRIES>>,
    /// MSR-exit bitmap shared by the VM's vCPUs.
    msr_bitmap: Mutex<Box<partivisor_hal::page::Page>>,
    pub wbinvd_lock: Mutex<()>,
    /// Serializes creation/destruction-grade configuration.
    pub vm_lock: Mutex<()>,
}

static VMS: RwLock<Vec<Arc<Vm>>> = RwLock::new(Vec::new());
static SERVICE_VM_ID: AtomicU16 = AtomicU16::new(u16::MAX);
static NEXT_VM_ID: AtomicU16 = AtomicU16::new(0);

/// Look a VM up by id.
pub fn get_vm(vm_id: u16) -> Option<Arc<Vm>> {
    VMS.read().iter().find(|vm| vm.vm_id == vm_id).cloned()
}

/// Any real-time VM alive in the arena (changes the WBINVD strategy).
pub fn has_rt_vm() -> bool {
    VMS.read().iter().any(|vm| vm.is_rt_vm())
}

pub fn get_service_vm() -> Option<Arc<Vm>> {
    let id = SERVICE_VM_ID.load(Ordering::Acquire);
    if id == u16::MAX {
        None
    } else {
        get_vm(id)
    }
}

/// Build a VM from its configuration and publish it in the arena.
pub fn create_vm(config: VmConfig) -> Result<Arc<Vm>, HvErr> {
    let mut vms = VMS.write();
    if vms.len() >= MAX_VM_NUM {
        return Err(HvErr::NoMem);
    }
    let vm_id = NEXT_VM_ID.fetch_add(1, Ordering::AcqRel);
    let vm = Arc::new(Vm::build(vm_id, config, crate::ept::ept_pool())?);
    if vm.config.vm_type == VmType::Service {
        SERVICE_VM_ID.store(vm_id, Ordering::Release);
    }
    vms.push(vm.clone());
    Ok(vm)
}

/// Unpublish and tear down.
pub fn destroy_vm(vm_id: u16) -> Result<(), HvErr> {
    let mut vms = VMS.write();
    let idx = vms
        .iter()
        .position(|vm| vm.vm_id == vm_id)
        .ok_or(HvErr::Inval)?;
    let vm = &vms[idx];
    if vm.state() == VmState::Started {
        return Err(HvErr::BadState);
    }
    vms.remove(idx);
    Ok(())
}

fn vioapic_mmio_handler(vm: &Vm, req: &mut MmioRequest) -> Result<(), HvErr> {
    vm.vioapic().mmio_access(vm, req)
}

/* ------------- pCPU ↔ vCPU binding through the per-pCPU region ------- */

const PCPU_BINDING_VALID: usize = 1 << 63;

fn encode_binding(vm_id: u16, vcpu_id: u16) -> usize {
    PCPU_BINDING_VALID | ((vm_id as usize) << 16) | vcpu_id as usize
}

/// Publish `cell` as the vCPU its pCPU should run; called on every
/// transition into `Running`.
fn bind_vcpu_to_pcpu(cell: &VcpuCell) {
    let pcpu = cell.shared.pcpu_id.load(Ordering::Acquire);
    percpu::get_pcpu_region(pcpu).current_vcpu.store(
        encode_binding(cell.shared.vm_id, cell.shared.vcpu_id),
        Ordering::Release,
    );
}

/// Drop the binding when this vCPU leaves `Running`; a binding another
/// vCPU installed in the meantime is left alone.
fn unbind_vcpu_from_pcpu(cell: &VcpuCell) {
    let pcpu = cell.shared.pcpu_id.load(Ordering::Acquire);
    let _ = percpu::get_pcpu_region(pcpu).current_vcpu.compare_exchange(
        encode_binding(cell.shared.vm_id, cell.shared.vcpu_id),
        0,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

/// The `(vm_id, vcpu_id)` bound to `pcpu_id`, if any.
pub fn bound_vcpu(pcpu_id: u16) -> Option<(u16, u16)> {
    let raw = percpu::get_pcpu_region(pcpu_id)
        .current_vcpu
        .load(Ordering::Acquire);
    if raw & PCPU_BINDING_VALID == 0 {
        return None;
    }
    Some((((raw >> 16) & 0xFFFF) as u16, (raw & 0xFFFF) as u16))
}

impl Vm {
    fn build(vm_id: u16, config: VmConfig, ept_pool: &'static PagePool) -> Result<Vm, HvErr> {
        if config.vcpu_num == 0 || config.vcpu_num as usize > MAX_VCPUS_PER_VM {
            return Err(HvErr::Inval);
        }
        let vcpus: Vec<VcpuCell> = (0..config.vcpu_num)
            .map(|i| VcpuCell::new(vm_id, i, config.cpu_affinity[i as usize]))
            .collect();

        let vm = Vm {
            vm_id,
            vcpus: vcpus.into_boxed_slice(),
            nworld_ept: Ept::new(ept_pool)?,
            sworld_ept: RwLock::new(None),
            sworld_control: Mutex::new(SworldControl::default()),
            sworld_snapshot: Mutex::new(None),
            io: VmIoTables::new(),
            ioreq: IoReqBuffer::unset(),
            vioapic: Vioapic::new(config.vm_type == VmType::Service),
            vpic: Vpic::new(),
            e820: RwLock::new(heapless::Vec::new()),
            msr_bitmap: Mutex::new(Box::new(partivisor_hal::page::Page::zeroed())),
            wbinvd_lock: Mutex::new(()),
            vm_lock: Mutex::new(()),
            state: AtomicU8::new(VmState::Created as u8),
            config,
        };

        io_emul::register_mmio_emulation_handler(
            &vm,
            vioapic_mmio_handler,
            VIOAPIC_BASE,
            VIOAPIC_BASE + VIOAPIC_SIZE,
        )?;
        Ok(vm)
    }

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: VmState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn name(&self) -> &[u8] {
        let len = self
            .config
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.config.name.len());
        &self.config.name[..len]
    }

    pub fn is_service_vm(&self) -> bool {
        self.config.vm_type == VmType::Service
    }

    pub fn is_rt_vm(&self) -> bool {
        self.config.vm_type == VmType::RtUser
    }

    pub fn is_lapic_pt(&self) -> bool {
        self.config.lapic_pt
    }

    pub fn vcpu_count(&self) -> u16 {
        self.vcpus.len() as u16
    }

    pub fn vcpu(&self, vcpu_id: u16) -> Option<&VcpuCell> {
        self.vcpus.get(vcpu_id as usize)
    }

    pub fn foreach_vcpu(&self, mut f: impl FnMut(&VcpuCell)) {
        for cell in self.vcpus.iter() {
            f(cell);
        }
    }

    pub fn any_vcpu_launched(&self) -> bool {
        self.vcpus
            .iter()
            .any(|c| c.shared.launched.load(Ordering::Acquire))
    }

    pub fn io(&self) -> &VmIoTables {
        &self.io
    }

    pub fn ioreq_buffer(&self) -> &IoReqBuffer {
        &self.ioreq
    }

    pub fn vioapic(&self) -> &Vioapic {
        &self.vioapic
    }

    pub fn vpic(&self) -> &Vpic {
        &self.vpic
    }

    /// Mutate the MSR-exit bitmap (interception setup before launch).
    pub fn with_msr_bitmap<R>(&self, f: impl FnOnce(&mut [u8; 4096]) -> R) -> R {
        let mut page = self.msr_bitmap.lock();
        f(&mut page.0)
    }

    pub fn msr_bitmap_hpa(&self) -> u64 {
        let page = self.msr_bitmap.lock();
        partivisor_hal::hva2hpa(page.0.as_ptr())
    }

    /* ---------------- EPT wrappers with invalidation fan-out ---------- */

    fn broadcast_ept_flush(&self) {
        self.foreach_vcpu(|cell| {
            virq::vcpu_make_request(&cell.shared, REQ_EPT_FLUSH);
        });
    }

    pub fn ept_add_mr(
        &self,
        hpa: PhysAddr,
        gpa: GuestPhysAddr,
        size: u64,
        prot: u64,
    ) -> Result<(), HvErr> {
        self.nworld_ept.add_mr(hpa, gpa, size, prot)?;
        self.broadcast_ept_flush();
        Ok(())
    }

    pub fn ept_del_mr(&self, gpa: GuestPhysAddr, size: u64) -> Result<(), HvErr> {
        self.nworld_ept.del_mr(gpa, size)?;
        self.broadcast_ept_flush();
        Ok(())
    }

    pub fn ept_mr_modify(
        &self,
        gpa: GuestPhysAddr,
        size: u64,
        prot_set: u64,
        prot_clr: u64,
    ) -> Result<(), HvErr> {
        self.nworld_ept.modify_mr(gpa, size, prot_set, prot_clr)?;
        self.broadcast_ept_flush();
        Ok(())
    }

    pub fn gpa2hpa(&self, gpa: GuestPhysAddr) -> PhysAddr {
        self.nworld_ept.gpa2hpa(gpa)
    }

    pub fn local_gpa2hpa(&self, gpa: GuestPhysAddr) -> Option<(PhysAddr, u64)> {
        self.nworld_ept.local_gpa2hpa(gpa)
    }

    pub fn nworld_ept(&self) -> &Ept {
        &self.nworld_ept
    }

    pub fn nworld_eptp_value(&self) -> u64 {
        self.nworld_ept.eptp()
    }

    pub fn sworld_eptp_value(&self) -> Option<u64> {
        self.sworld_ept.read().as_ref().map(|e| e.eptp())
    }

    pub fn has_sworld(&self) -> bool {
        self.sworld_ept.read().is_some()
    }

    pub(crate) fn sworld_ept(&self) -> &RwLock<Option<Ept>> {
        &self.sworld_ept
    }

    /// Visit every normal-world EPT leaf: `f(entry, size)`.
    pub fn walk_ept(&self, f: impl FnMut(u64, u64)) {
        self.nworld_ept.walk(f);
    }

    /* ---------------- lifecycle ---------------- */

    /// Move Created→Started; vCPU 0 gets the boot entry, the others stay
    /// in wait-for-SIPI until the guest BSP kicks them.
    pub fn start(&self, entry_gpa: u64) -> Result<(), HvErr> {
        if self.state() != VmState::Created {
            return Err(HvErr::BadState);
        }
        let bsp = self.vcpu(0).ok_or(HvErr::Inval)?;
        {
            // SAFETY: vCPU not yet Running; configuration is serialized by
            // the caller holding the VM operation flow.
            let body = unsafe { bsp.body_mut() };
            body.set_startup_entry(entry_gpa);
        }
        virq::vcpu_make_request(&bsp.shared, REQ_INIT_VMCS);
        bsp.shared.set_state(VcpuState::Running);
        bind_vcpu_to_pcpu(bsp);
        self.set_state(VmState::Started);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), HvErr> {
        if self.state() != VmState::Started {
            return Err(HvErr::BadState);
        }
        self.foreach_vcpu(|cell| {
            if cell.shared.state() == VcpuState::Running {
                virq::kick_vcpu(&cell.shared);
                cell.shared.set_state(VcpuState::Paused);
                unbind_vcpu_from_pcpu(cell);
            }
        });
        self.set_state(VmState::Paused);
        Ok(())
    }

    /// Zombie every vCPU and release waiters; the owning pCPUs drop the
    /// vCPUs at their next pipeline run.
    pub fn shutdown(&self) {
        self.foreach_vcpu(|cell| {
            cell.shared.set_state(VcpuState::Zombie);
            unbind_vcpu_from_pcpu(cell);
            for ev in cell.shared.events.iter() {
                ev.signal();
            }
            crate::ioreq::discard_ioreq(self, cell.shared.vcpu_id);
        });
        self.set_state(VmState::PoweredOff);
    }

    pub fn reset(&self) -> Result<(), HvErr> {
        if self.state() != VmState::Paused && self.state() != VmState::PoweredOff {
            return Err(HvErr::BadState);
        }
        self.foreach_vcpu(|cell| {
            cell.shared.set_state(VcpuState::Init);
            unbind_vcpu_from_pcpu(cell);
            cell.shared.vlapic.reset();
            // SAFETY: every vCPU left Running above; teardown path is
            // serialized by the caller.
            unsafe { cell.body_mut().reset_guest_regs() };
        });
        self.set_state(VmState::Created);
        Ok(())
    }
}

/// Fatal guest event: log-and-stop semantics of a triple fault.
pub fn triple_fault_shutdown_vm(vm: &Vm, vcpu_id: u16) {
    crate::pr_fatal!("vm{}: triple fault on vcpu{}", vm.vm_id, vcpu_id);
    vm.shutdown();
}

/// INIT/SIPI delivered through a vLAPIC ICR write.
pub fn vlapic_process_init_sipi(vm: &Vm, dest: u32, delmode: u32, vector: u32) {
    vm.foreach_vcpu(|cell| {
        if cell.shared.vlapic.apic_id() != dest && dest != u32::MAX {
            return;
        }
        match delmode {
            APIC_DELMODE_INIT => {
                if cell.shared.state() == VcpuState::Running {
                    cell.shared.set_state(VcpuState::Init);
                    unbind_vcpu_from_pcpu(cell);
                }
            }
            APIC_DELMODE_STARTUP => {
                if cell.shared.state() == VcpuState::Init {
                    // SAFETY: target is not Running (checked above) and
                    // INIT/SIPI flow is serialized per target.
                    let body = unsafe { cell.body_mut() };
                    body.reset_guest_regs();
                    body.set_startup_entry((vector as u64) << 12);
                    virq::vcpu_make_request(&cell.shared, REQ_INIT_VMCS);
                    cell.shared.set_state(VcpuState::Running);
                    bind_vcpu_to_pcpu(cell);
                    cell.shared.events[VCPU_EVENT_VIRTUAL_INTERRUPT].signal();
                }
            }
            _ => {}
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use partivisor_hal::page::Page;

    /// A VM wired into the arena with a private leaked EPT pool, so module
    /// tests exercise the same lookup paths the hypervisor uses.
    pub(crate) fn fixture_vm(vcpu_num: u16) -> Arc<Vm> {
        fixture_vm_sized(vcpu_num, |_| {})
    }

    /// Fixture with a configuration tweak applied before the build.
    pub(crate) fn fixture_vm_with(tweak: impl FnOnce(&mut VmConfig)) -> Arc<Vm> {
        fixture_vm_sized(2, tweak)
    }

    fn fixture_vm_sized(vcpu_num: u16, tweak: impl FnOnce(&mut VmConfig)) -> Arc<Vm> {
        let npages = 512;
        let mem: Box<[Page]> = (0..npages).map(|_| Page::zeroed()).collect();
        let base = Box::leak(mem).as_mut_ptr();
        // SAFETY: leaked, exclusively owned backing region.
        let pool = Box::leak(Box::new(unsafe { PagePool::new(base, npages) }));

        let mut vms = VMS.write();
        let vm_id = NEXT_VM_ID.fetch_add(1, Ordering::AcqRel);
        let mut config = VmConfig::new(VmType::User, vcpu_num).named("fixture");
        tweak(&mut config);
        let vm = Arc::new(Vm::build(vm_id, config, pool).unwrap());
        vms.push(vm.clone());
        vm
    }

    #[test]
    fn arena_lookup_by_id() {
        let vm = fixture_vm(2);
        let found = get_vm(vm.vm_id).unwrap();
        assert_eq!(found.vm_id, vm.vm_id);
        assert_eq!(found.vcpu_count(), 2);
        assert!(get_vm(0xFFF0).is_none());
    }

    #[test]
    fn vioapic_window_is_preregistered() {
        let vm = fixture_vm(1);
        let table = vm.io().mmio.read();
        assert!(table
            .iter()
            .any(|n| n.range_start == VIOAPIC_BASE && n.range_end == VIOAPIC_BASE + VIOAPIC_SIZE));
    }

    #[test]
    fn ept_mutation_broadcasts_flush_requests() {
        let vm = fixture_vm(2);
        vm.ept_add_mr(0x10_0000, 0x0, 0x1000, crate::ept::EPT_RWX | crate::ept::EPT_WB)
            .unwrap();
        vm.foreach_vcpu(|cell| {
            let pending = cell.shared.pending_req.load(Ordering::SeqCst);
            assert!(pending & (1 << REQ_EPT_FLUSH) != 0);
        });
        assert_ne!(vm.gpa2hpa(0x0), INVALID_HPA);
    }

    #[test]
    fn lifecycle_created_started_shutdown() {
        let vm = fixture_vm(2);
        assert_eq!(vm.state(), VmState::Created);
        vm.start(0x100_0000).unwrap();
        assert_eq!(vm.state(), VmState::Started);
        assert_eq!(vm.vcpu(0).unwrap().shared.state(), VcpuState::Running);
        // APs wait for SIPI.
        assert_eq!(vm.vcpu(1).unwrap().shared.state(), VcpuState::Init);
        assert!(vm.start(0x100_0000).is_err());

        vm.shutdown();
        assert_eq!(vm.state(), VmState::PoweredOff);
        vm.foreach_vcpu(|c| assert_eq!(c.shared.state(), VcpuState::Zombie));
    }

    #[test]
    fn sipi_wakes_ap_at_vector() {
        let vm = fixture_vm(2);
        vm.start(0x100_0000).unwrap();

        vlapic_process_init_sipi(&vm, 1, APIC_DELMODE_STARTUP, 0x9A);
        let ap = vm.vcpu(1).unwrap();
        assert_eq!(ap.shared.state(), VcpuState::Running);
        // SAFETY: test fixture; the AP never actually runs.
        let body = unsafe { ap.body_mut() };
        assert_eq!(body.get_rip(), 0x9A << 12);
    }

    #[test]
    fn reset_returns_vcpus_to_init() {
        let vm = fixture_vm(1);
        vm.start(0x1000).unwrap();
        vm.shutdown();
        vm.reset().unwrap();
        assert_eq!(vm.state(), VmState::Created);
        assert_eq!(vm.vcpu(0).unwrap().shared.state(), VcpuState::Init);
    }

    #[test]
    fn name_is_trimmed_at_nul() {
        let vm = fixture_vm(1);
        assert_eq!(vm.name(), b"fixture");
    }

    #[test]
    fn running_vcpu_is_bound_to_its_pcpu_region() {
        // pCPUs 6/7 are used by this test alone, so parallel fixtures
        // cannot race the bindings.
        let vm = fixture_vm_with(|c| {
            c.cpu_affinity[0] = 6;
            c.cpu_affinity[1] = 7;
        });
        assert_eq!(bound_vcpu(6), None);

        vm.start(0x100_0000).unwrap();
        assert_eq!(bound_vcpu(6), Some((vm.vm_id, 0)));
        assert_eq!(bound_vcpu(7), None, "AP not bound until SIPI");

        vlapic_process_init_sipi(&vm, 1, APIC_DELMODE_STARTUP, 0x9A);
        assert_eq!(bound_vcpu(7), Some((vm.vm_id, 1)));

        // INIT drops the AP's binding; shutdown drops the BSP's.
        vlapic_process_init_sipi(&vm, 1, APIC_DELMODE_INIT, 0);
        assert_eq!(bound_vcpu(7), None);
        vm.shutdown();
        assert_eq!(bound_vcpu(6), None);
    }
}
