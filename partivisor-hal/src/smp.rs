//! pCPU bring-up, rendezvous and teardown.
//!
//! The BSP probes capabilities, builds the host page tables and releases the
//! APs through INIT-SIPI-SIPI; every pCPU then runs the same post-init (GDT,
//! TR, control-register hardening, XSAVE, LAPIC) and meets the others at the
//! `PCPU_SYNC` barrier. Teardown is the reverse: flag, kick, wait, VMXOFF,
//! halt.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use spin::Once;
use x86::dtables::{lgdt, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86::Ring;

use crate::config::{
    IdleMode, CPU_DOWN_TIMEOUT_MS, CPU_UP_TIMEOUT_MS, IDLE_MODE, MAX_PCPU_NUM,
    VECTOR_NOTIFY_VCPU,
};
use crate::cpu_caps::{self, has_monitor_cap};
use crate::cpuid::{self};
use crate::lapic;
use crate::page::{Page, PagePool, PAGE_SIZE};
use crate::percpu::{self, PcpuState, INVALID_PCPU_ID, PCPU_SYNC};
use crate::pgtable::{PageTable, PagingPolicy, PgtLevel};
use crate::tsc;
use crate::vmx;
use crate::HalError;

bitflags::bitflags! {
    /// Host page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostPageFlags: u64 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const PSE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NX = 1 << 63;
    }
}

pub const PAGE_PRESENT: u64 = HostPageFlags::PRESENT.bits();
pub const PAGE_RW: u64 = HostPageFlags::RW.bits();
pub const PAGE_GLOBAL: u64 = HostPageFlags::GLOBAL.bits();

/// Policy for the hypervisor's own MMU tables.
pub struct HostMmuPolicy;

impl PagingPolicy for HostMmuPolicy {
    const DEFAULT_ACCESS_RIGHT: u64 = PAGE_PRESENT | PAGE_RW;
    const PRESENT_MASK: u64 = PAGE_PRESENT;

    fn large_page_support(level: PgtLevel, _prot: u64) -> bool {
        match level {
            PgtLevel::Pd => true,
            PgtLevel::Pdpt => cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_PAGE1GB),
            _ => false,
        }
    }
}

/// Pages reserved for the host primary page tables.
const PPT_PAGE_NUM: usize = 64;

struct PptBacking(UnsafeCell<[Page; PPT_PAGE_NUM]>);
// Handed to the PagePool exactly once; the pool serializes all access.
unsafe impl Sync for PptBacking {}

static PPT_BACKING: PptBacking = {
    const P: Page = Page::zeroed();
    PptBacking(UnsafeCell::new([P; PPT_PAGE_NUM]))
};

static PPT_POOL: Once<PagePool> = Once::new();
static HOST_PML4: AtomicU64 = AtomicU64::new(0);

/// Host direct map size: 512 GiB, the reach of one PML4 entry.
const DIRECT_MAP_SIZE: u64 = 512 << 30;

fn ppt_pool() -> &'static PagePool {
    PPT_POOL.call_once(|| {
        // SAFETY: PPT_BACKING is used for nothing else; call_once guarantees
        // a single hand-over.
        unsafe { PagePool::new(PPT_BACKING.0.get() as *mut Page, PPT_PAGE_NUM) }
    })
}

fn init_host_paging() -> Result<(), HalError> {
    let pt: PageTable<'static, HostMmuPolicy> = PageTable::new(ppt_pool());
    let root = pt.create_root().map_err(|_| HalError::OutOfPages)?;
    let gb = 1u64 << 30;
    let step = if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_PAGE1GB) {
        DIRECT_MAP_SIZE
    } else {
        // 2 MiB leaves need more interior nodes; map the low 4 GiB only and
        // let the boot collaborator extend the map from the E820.
        4 * gb
    };
    pt.add_map(root, 0, 0, step, PAGE_PRESENT | PAGE_RW | PAGE_GLOBAL)
        .map_err(|_| HalError::OutOfPages)?;
    HOST_PML4.store(root as u64, Ordering::Release);
    Ok(())
}

#[inline]
unsafe fn write_cr3(value: u64) {
    unsafe { core::arch::asm!("mov cr3, {}", in(reg) value, options(nostack)) };
}

/// Host control-register reads for VMCS host-state setup.
///
/// # Safety
/// CPL0.
pub unsafe fn host_cr0() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mov {}, cr0", out(reg) v, options(nomem, nostack)) };
    v
}

/// # Safety
/// CPL0.
pub unsafe fn host_cr3() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) v, options(nomem, nostack)) };
    v
}

/// # Safety
/// CPL0.
pub unsafe fn host_cr4() -> u64 {
    unsafe { read_cr4() }
}

/// GDTR base as loaded on this processor.
///
/// # Safety
/// CPL0 (SGDT with UMIP enabled).
pub unsafe fn read_gdtr_base() -> u64 {
    let mut table: [u8; 10] = [0; 10];
    unsafe { core::arch::asm!("sgdt [{}]", in(reg) table.as_mut_ptr(), options(nostack)) };
    u64::from_le_bytes(table[2..10].try_into().unwrap())
}

/// IDTR base as loaded on this processor.
///
/// # Safety
/// CPL0 (SIDT with UMIP enabled).
pub unsafe fn read_idtr_base() -> u64 {
    let mut table: [u8; 10] = [0; 10];
    unsafe { core::arch::asm!("sidt [{}]", in(reg) table.as_mut_ptr(), options(nostack)) };
    u64::from_le_bytes(table[2..10].try_into().unwrap())
}

#[inline]
unsafe fn read_cr4() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mov {}, cr4", out(reg) v, options(nomem, nostack)) };
    v
}

#[inline]
unsafe fn write_cr4(value: u64) {
    unsafe { core::arch::asm!("mov cr4, {}", in(reg) value, options(nostack)) };
}

const CR4_OSFXSR: u64 = 1 << 9;
const CR4_OSXMMEXCPT: u64 = 1 << 10;
const CR4_VMXE: u64 = 1 << 13;
const CR4_SMXE: u64 = 1 << 14;
const CR4_OSXSAVE: u64 = 1 << 18;
const CR4_SMEP: u64 = 1 << 20;
const CR4_SMAP: u64 = 1 << 21;
const CR4_KL: u64 = 1 << 19;

const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;

#[inline]
unsafe fn xsetbv(xcr: u32, value: u64) {
    unsafe {
        core::arch::asm!(
            "xsetbv",
            in("ecx") xcr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack),
        );
    }
}

/* ---------------- per-pCPU GDT / TSS ---------------- */

const HOST_GDT_RING0_CODE_SEL: u16 = 0x08;
const HOST_GDT_RING0_DATA_SEL: u16 = 0x10;
const HOST_GDT_RING0_TSS_SEL: u16 = 0x18;

#[repr(C, packed)]
struct Tss64 {
    reserved0: u32,
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    reserved1: u64,
    ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    iomap_base: u16,
}

struct PcpuGdt {
    gdt: UnsafeCell<[u64; 5]>,
    tss: UnsafeCell<Tss64>,
}
// Written once by the owning pCPU before TR load.
unsafe impl Sync for PcpuGdt {}

#[allow(clippy::declare_interior_mutable_const)]
const GDT_INIT: PcpuGdt = PcpuGdt {
    gdt: UnsafeCell::new([0; 5]),
    tss: UnsafeCell::new(Tss64 {
        reserved0: 0,
        rsp0: 0,
        rsp1: 0,
        rsp2: 0,
        reserved1: 0,
        ist: [0; 7],
        reserved2: 0,
        reserved3: 0,
        iomap_base: core::mem::size_of::<Tss64>() as u16,
    }),
};
static PCPU_GDTS: [PcpuGdt; MAX_PCPU_NUM] = [GDT_INIT; MAX_PCPU_NUM];

const GDT_CODE64: u64 = 0x00AF_9B00_0000_FFFF;
const GDT_DATA: u64 = 0x00CF_9300_0000_FFFF;

fn tss_descriptor(base: u64) -> (u64, u64) {
    let limit = (core::mem::size_of::<Tss64>() - 1) as u64;
    let low = (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x89u64 << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56);
    (low, base >> 32)
}

/// Build and load this pCPU's GDT, then load TR.
///
/// # Safety
/// CPL0, once per pCPU during post-init.
unsafe fn load_gdtr_and_tr(pcpu_id: u16) {
    let slot = &PCPU_GDTS[pcpu_id as usize];
    // SAFETY: only the owning pCPU touches its GDT slot, and only here.
    unsafe {
        let tss = &mut *slot.tss.get();
        tss.rsp0 = percpu::pcpu_stack_top(pcpu_id);

        let gdt = &mut *slot.gdt.get();
        gdt[0] = 0;
        gdt[1] = GDT_CODE64;
        gdt[2] = GDT_DATA;
        let (tss_lo, tss_hi) = tss_descriptor(slot.tss.get() as u64);
        gdt[3] = tss_lo;
        gdt[4] = tss_hi;

        let ptr = DescriptorTablePointer {
            limit: (core::mem::size_of::<[u64; 5]>() - 1) as u16,
            base: gdt.as_ptr(),
        };
        lgdt(&ptr);
        x86::task::load_tr(SegmentSelector::new(
            HOST_GDT_RING0_TSS_SEL >> 3,
            Ring::Ring0,
        ));
    }
}

pub fn host_gdt_code_sel() -> u16 {
    HOST_GDT_RING0_CODE_SEL
}

pub fn host_gdt_data_sel() -> u16 {
    HOST_GDT_RING0_DATA_SEL
}

pub fn host_gdt_tss_sel() -> u16 {
    HOST_GDT_RING0_TSS_SEL
}

pub fn host_gdt_base(pcpu_id: u16) -> u64 {
    PCPU_GDTS[pcpu_id as usize].gdt.get() as u64
}

pub fn host_tss_base(pcpu_id: u16) -> u64 {
    PCPU_GDTS[pcpu_id as usize].tss.get() as u64
}

/* ---------------- VMXON regions ---------------- */

struct VmxonBacking(UnsafeCell<[Page; MAX_PCPU_NUM]>);
unsafe impl Sync for VmxonBacking {}

static VMXON_REGIONS: VmxonBacking = {
    const P: Page = Page::zeroed();
    VmxonBacking(UnsafeCell::new([P; MAX_PCPU_NUM]))
};

/// Enter VMX root operation on the calling pCPU.
///
/// # Safety
/// CPL0 after the capability gate passed.
pub unsafe fn exec_vmxon_instr(pcpu_id: u16) -> Result<(), HalError> {
    let caps = cpu_caps::cpu_caps();
    let revision = (caps.vmx.basic & 0x7FFF_FFFF) as u32;
    unsafe {
        // Fixed-bit adjust before enabling VMXE.
        let mut cr4 = read_cr4();
        cr4 |= caps.vmx.cr4_fixed0 & !CR4_SMXE;
        cr4 &= caps.vmx.cr4_fixed1;
        write_cr4(cr4 | CR4_VMXE);

        let region = (VMXON_REGIONS.0.get() as *mut Page).add(pcpu_id as usize);
        core::ptr::write_bytes(region as *mut u8, 0, PAGE_SIZE);
        core::ptr::write(region as *mut u32, revision);
        vmx::vmxon(crate::hva2hpa(region as *const u8))?;
    }
    percpu::get_pcpu_region(pcpu_id).vmxon_done.store(true, Ordering::Release);
    Ok(())
}

/* ---------------- AP launch handshake ---------------- */

/// Values the real-mode trampoline reads to jump into long mode. Filling
/// them is the boundary with the boot collaborator.
pub struct ApLaunch {
    pub stack_top: AtomicU64,
    pub pml4: AtomicU64,
}

pub static AP_LAUNCH: ApLaunch = ApLaunch {
    stack_top: AtomicU64::new(0),
    pml4: AtomicU64::new(0),
};

/// Real-mode page number of the AP trampoline.
const STARTUP_VECTOR: u8 = 0x08;

/* ---------------- bring-up ---------------- */

/// Early per-pCPU init, before interrupts or VMX.
///
/// On the BSP this probes and gates capabilities (fail-stop on a missing
/// one) and builds the host page tables; an AP enables the paging the BSP
/// prepared and derives its pcpu_id from its LAPIC id.
pub fn init_pcpu_pre(is_bsp: bool) -> Result<u16, HalError> {
    let pcpu_id;
    if is_bsp {
        cpu_caps::detect();
        if let Err(missing) = cpu_caps::check_essential_caps() {
            panic!("fatal: required capability missing: {}", missing);
        }
        init_host_paging()?;
        pcpu_id = 0;
        // SAFETY: CPL0 boot path.
        unsafe { lapic::early_init_lapic() };
        percpu::set_lapic_id(0, unsafe { lapic::get_cur_lapic_id() });
    } else {
        // SAFETY: the BSP published the PML4 before sending SIPIs.
        unsafe {
            write_cr3(HOST_PML4.load(Ordering::Acquire));
            lapic::early_init_lapic();
        }
        let lapic_id = unsafe { lapic::get_cur_lapic_id() };
        pcpu_id = percpu::pcpu_id_from_lapic_id(lapic_id).unwrap_or(INVALID_PCPU_ID);
        if pcpu_id == INVALID_PCPU_ID {
            return Err(HalError::MissingCapability("lapic id not in MADT table"));
        }
    }
    percpu::pcpu_set_current_state(pcpu_id, PcpuState::Initializing);
    Ok(pcpu_id)
}

/// Late per-pCPU init: descriptor tables, CR hardening, XSAVE, then the
/// rendezvous with every other starting pCPU.
pub fn init_pcpu_post(pcpu_id: u16) {
    // SAFETY: CPL0 bring-up path on the owning pCPU.
    unsafe {
        load_gdtr_and_tr(pcpu_id);

        let mut cr4 = read_cr4();
        cr4 |= CR4_OSFXSR | CR4_OSXMMEXCPT;
        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_SMEP) {
            cr4 |= CR4_SMEP;
        }
        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_SMAP) {
            cr4 |= CR4_SMAP;
        }
        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVE) {
            cr4 |= CR4_OSXSAVE;
        }
        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_KEYLOCKER) {
            cr4 |= CR4_KL;
        }
        write_cr4(cr4);

        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVE) {
            xsetbv(0, XCR0_X87 | XCR0_SSE);
            if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVES) {
                crate::msr::wrmsr(crate::msr::MSR_IA32_XSS, 0);
            }
        }

        percpu::bind_pcpu_id(pcpu_id);
    }

    if pcpu_id == 0 {
        tsc::calibrate_tsc();
    }

    percpu::pcpu_set_current_state(pcpu_id, PcpuState::Running);

    // Release our bit, then wait for everyone else to do the same.
    PCPU_SYNC.fetch_and(!(1u64 << pcpu_id), Ordering::AcqRel);
    wait_sync_change(&PCPU_SYNC, 0);
}

/// Start every pCPU whose bit is set in `mask` (the caller's own bit is
/// ignored). Returns false when any target missed the deadline; such pCPUs
/// are marked Dead and the system continues without them.
pub fn start_pcpus(mask: u64) -> bool {
    let self_id = percpu::get_pcpu_id();
    let mut expected = mask & !(1u64 << self_id);
    PCPU_SYNC.fetch_or(expected | (1u64 << self_id), Ordering::AcqRel);

    let mut ok = true;
    while expected != 0 {
        let pcpu_id = expected.trailing_zeros() as u16;
        expected &= expected - 1;

        AP_LAUNCH
            .stack_top
            .store(percpu::pcpu_stack_top(pcpu_id), Ordering::Release);
        AP_LAUNCH
            .pml4
            .store(HOST_PML4.load(Ordering::Acquire), Ordering::Release);
        fence(Ordering::SeqCst);

        // SAFETY: trampoline parameters are published above.
        unsafe { lapic::send_startup_ipi(percpu::lapic_id_of(pcpu_id), STARTUP_VECTOR) };

        let mut waited_us = 0u64;
        while !percpu::is_pcpu_active(pcpu_id) {
            if waited_us >= CPU_UP_TIMEOUT_MS as u64 * 1_000 {
                percpu::pcpu_set_current_state(pcpu_id, PcpuState::Dead);
                PCPU_SYNC.fetch_and(!(1u64 << pcpu_id), Ordering::AcqRel);
                ok = false;
                break;
            }
            tsc::udelay(50);
            waited_us += 50;
        }
    }
    ok
}

/// Flag every other active pCPU for offline, kick them, and wait.
pub fn stop_pcpus() -> Result<(), HalError> {
    let self_id = percpu::get_pcpu_id();
    let mut others = percpu::pcpu_active_bitmap() & !(1u64 << self_id);
    let mut scan = others;
    while scan != 0 {
        let pcpu_id = scan.trailing_zeros() as u16;
        scan &= scan - 1;
        percpu::set_pcpu_flag(pcpu_id, percpu::NEED_OFFLINE);
        // SAFETY: x2APIC live past post-init.
        unsafe { lapic::send_single_ipi(percpu::lapic_id_of(pcpu_id), VECTOR_NOTIFY_VCPU) };
    }

    let mut waited_us = 0u64;
    loop {
        others &= percpu::pcpu_active_bitmap();
        if others == 0 {
            return Ok(());
        }
        if waited_us >= CPU_DOWN_TIMEOUT_MS as u64 * 1_000 {
            return Err(HalError::Timeout);
        }
        tsc::udelay(50);
        waited_us += 50;
    }
}

/// Ask a single pCPU to go offline and kick it.
pub fn make_pcpu_offline(pcpu_id: u16) {
    percpu::set_pcpu_flag(pcpu_id, percpu::NEED_OFFLINE);
    if percpu::is_pcpu_active(pcpu_id) {
        // SAFETY: x2APIC live past post-init.
        unsafe { lapic::send_single_ipi(percpu::lapic_id_of(pcpu_id), VECTOR_NOTIFY_VCPU) };
    }
}

/// One idle beat, per the configured policy.
pub fn cpu_do_idle() {
    match IDLE_MODE {
        IdleMode::Hlt => x86_64::instructions::hlt(),
        IdleMode::Pause => core::hint::spin_loop(),
    }
}

/// Final descent of a pCPU: leave VMX, flush caches, drop out of the
/// active bitmap and halt for good.
pub fn cpu_dead(pcpu_id: u16) -> ! {
    let region = percpu::get_pcpu_region(pcpu_id);
    if region.vmxon_done.swap(false, Ordering::AcqRel) {
        // SAFETY: this pCPU entered VMX root during bring-up.
        unsafe { vmx::vmxoff() };
    }
    // SAFETY: CPL0; full flush so no dirty hypervisor line outlives us.
    unsafe { vmx::wbinvd() };
    percpu::pcpu_set_current_state(pcpu_id, PcpuState::Dead);
    loop {
        x86_64::instructions::hlt();
    }
}

#[inline]
unsafe fn asm_monitor(addr: *const u64) {
    unsafe {
        core::arch::asm!(
            "monitor",
            in("rax") addr,
            in("ecx") 0u32,
            in("edx") 0u32,
            options(nostack),
        );
    }
}

#[inline]
unsafe fn asm_mwait() {
    unsafe {
        core::arch::asm!(
            "mwait",
            in("eax") 0u32,
            in("ecx") 0u32,
            options(nostack),
        );
    }
}

/// Spin until `*sync == wval`, using MONITOR/MWAIT when the platform has a
/// trustworthy implementation and PAUSE otherwise.
pub fn wait_sync_change(sync: &AtomicU64, wval: u64) {
    if has_monitor_cap() {
        while sync.load(Ordering::Acquire) != wval {
            // SAFETY: armed on a valid address; a stale wakeup only loops.
            unsafe {
                asm_monitor(sync.as_ptr());
                if sync.load(Ordering::Acquire) != wval {
                    asm_mwait();
                }
            }
        }
    } else {
        while sync.load(Ordering::Acquire) != wval {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tss_descriptor_encodes_base_and_limit() {
        let (lo, hi) = tss_descriptor(0x1234_5678_9ABC_DEF0);
        // type = available 64-bit TSS, present
        assert_eq!((lo >> 40) & 0xFF, 0x89);
        assert_eq!(lo & 0xFFFF, (core::mem::size_of::<Tss64>() - 1) as u64);
        assert_eq!((lo >> 16) & 0xFF_FFFF, 0xBC_DEF0);
        assert_eq!((lo >> 56) & 0xFF, 0x9A);
        assert_eq!(hi, 0x1234_5678);
    }

    #[test]
    fn wait_sync_change_returns_on_match() {
        // Hosted: monitor capability is absent, so this takes the PAUSE path.
        let sync = AtomicU64::new(0);
        wait_sync_change(&sync, 0);
    }

    #[test]
    fn gdt_selectors_are_consistent() {
        assert_eq!(host_gdt_code_sel() >> 3, 1);
        assert_eq!(host_gdt_data_sel() >> 3, 2);
        assert_eq!(host_gdt_tss_sel() >> 3, 3);
    }
}
