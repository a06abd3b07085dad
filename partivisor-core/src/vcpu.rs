//! The vCPU: two worlds of guest context, the lazy VMCS register cache,
//! the pending-request word and the hardware entry path.
//!
//! Concurrency contract: the big mutable body (`Vcpu`) belongs to the
//! pCPU the vCPU is pinned to. Peers reach a vCPU only through
//! `VcpuShared` (atomics, events, the vLAPIC) — or through the body while
//! the vCPU is provably not Running and the VM's configuration lock is
//! held. `VcpuCell::body_mut` spells out the rule.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};

use partivisor_hal::msr::{self, rdmsr, wrmsr};
use partivisor_hal::page::Page;
use partivisor_hal::vmx::{
    self, exec_vmread, exec_vmread32, exec_vmwrite, GeneralRegisters, MsrStoreEntry,
};
use partivisor_hal::{cpu_caps, cpuid};

use crate::config::MAX_VCPUS_PER_VM;
use crate::error::HvErr;
use crate::instr_emul::DecodedInstr;
use crate::io_emul::IoRequest;
use crate::schedule::{VcpuEvent, NUM_VCPU_EVENTS};
use crate::virtual_cr;
use crate::vlapic::Vlapic;
use crate::vmsr::{NUM_GUEST_MSRS, NUM_WORLD_MSRS};

pub const NORMAL_WORLD: usize = 0;
pub const SECURE_WORLD: usize = 1;
pub const NUM_WORLDS: usize = 2;

pub const VECTOR_INVALID: u32 = 0x100;

/// Register identifiers; the first sixteen index the hardware GPR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuReg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Rip,
    Rflags,
    Efer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VcpuState {
    Init = 0,
    Running = 1,
    Paused = 2,
    Zombie = 3,
    Offline = 4,
}

impl VcpuState {
    fn from_u8(v: u8) -> VcpuState {
        match v {
            1 => VcpuState::Running,
            2 => VcpuState::Paused,
            3 => VcpuState::Zombie,
            4 => VcpuState::Offline,
            _ => VcpuState::Init,
        }
    }
}

/// VMX-root-observable guest snapshot; the GPR block must stay first for
/// the entry assembly.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct RunContext {
    pub gprs: GeneralRegisters,
    pub cr0: u64,
    pub cr2: u64,
    pub cr4: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub ia32_spec_ctrl: u64,
    pub ia32_efer: u64,
}

static_assertions::const_assert_eq!(core::mem::offset_of!(RunContext, gprs), 0);

#[derive(Debug, Default, Clone, Copy)]
pub struct SegDescriptor {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DescTablePtr {
    pub base: u64,
    pub limit: u32,
}

/// XSAVES image, compaction format.
#[repr(C, align(64))]
pub struct XsaveArea(pub [u8; 4096]);

impl Default for XsaveArea {
    fn default() -> Self {
        XsaveArea([0; 4096])
    }
}

impl Clone for XsaveArea {
    fn clone(&self) -> Self {
        XsaveArea(self.0)
    }
}

/// Guest state that survives a world switch but is not part of the VMCS
/// working set.
#[derive(Default, Clone)]
pub struct ExtContext {
    pub cr3: u64,
    pub dr7: u64,
    pub ia32_debugctl: u64,
    pub ia32_pat: u64,
    pub ia32_sysenter_cs: u32,
    pub ia32_sysenter_esp: u64,
    pub ia32_sysenter_eip: u64,
    pub cs: SegDescriptor,
    pub ss: SegDescriptor,
    pub ds: SegDescriptor,
    pub es: SegDescriptor,
    pub fs: SegDescriptor,
    pub gs: SegDescriptor,
    pub tr: SegDescriptor,
    pub ldtr: SegDescriptor,
    pub idtr: DescTablePtr,
    pub gdtr: DescTablePtr,
    pub ia32_star: u64,
    pub ia32_lstar: u64,
    pub ia32_fmask: u64,
    pub ia32_kernel_gs_base: u64,
    pub tsc_aux: u64,
    pub tsc_offset: u64,
    pub xcr0: u64,
    pub xss: u64,
    pub xsave: XsaveArea,
}

/// One world of a vCPU.
#[derive(Default, Clone)]
pub struct GuestCpuContext {
    pub run_ctx: RunContext,
    pub ext_ctx: ExtContext,
    pub world_msrs: [u64; NUM_WORLD_MSRS],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExceptionInfo {
    pub exception: u32,
    pub error: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IWKey {
    pub encryption_key: [u64; 4],
    pub integrity_key: [u64; 2],
}

/// Auto-load/store MSR list slots, hardware layout.
pub const MSR_AREA_COUNT: usize = 4;

#[derive(Default)]
pub struct MsrArea {
    pub count: usize,
    pub guest: [MsrStoreEntry; MSR_AREA_COUNT],
    pub host: [MsrStoreEntry; MSR_AREA_COUNT],
    pub index_of_pqr_assoc: usize,
}

pub struct VcpuArch {
    pub contexts: [Box<GuestCpuContext>; NUM_WORLDS],
    pub cur_context: usize,
    pub vpid: u16,
    pub exit_reason: u64,
    pub exit_qualification: u64,
    pub idt_vectoring_info: u32,
    pub inst_len: u32,
    pub proc_vm_exec_ctrls: u32,
    pub irq_window_enabled: bool,
    pub emulating_lock: bool,
    pub xsave_enabled: bool,
    pub cr4_kl_enabled: bool,
    pub exception_info: ExceptionInfo,
    pub iwkey: IWKey,
    pub guest_msrs: [u64; NUM_GUEST_MSRS],
    pub msr_area: MsrArea,
    pub nr_exits: u64,
}

impl VcpuArch {
    fn new(vpid: u16) -> Self {
        VcpuArch {
            contexts: [Box::default(), Box::default()],
            cur_context: NORMAL_WORLD,
            vpid,
            exit_reason: 0,
            exit_qualification: 0,
            idt_vectoring_info: 0,
            inst_len: 0,
            proc_vm_exec_ctrls: 0,
            irq_window_enabled: false,
            emulating_lock: false,
            xsave_enabled: false,
            cr4_kl_enabled: false,
            exception_info: ExceptionInfo {
                exception: VECTOR_INVALID,
                error: 0,
            },
            iwkey: IWKey::default(),
            guest_msrs: [0; NUM_GUEST_MSRS],
            msr_area: MsrArea::default(),
            nr_exits: 0,
        }
    }
}

/// The big, pCPU-owned body.
pub struct Vcpu {
    pub vcpu_id: u16,
    pub vm_id: u16,
    pub pcpu_id: u16,
    pub vmcs_page: Box<Page>,
    pub launched: bool,
    pub arch: VcpuArch,
    reg_cached: u64,
    reg_updated: u64,
    pub req: IoRequest,
    pub decoded: Option<DecodedInstr>,
}

/// The part of a vCPU any context may touch.
pub struct VcpuShared {
    pub vcpu_id: u16,
    pub vm_id: u16,
    pub pcpu_id: AtomicU16,
    state: AtomicU8,
    prev_state: AtomicU8,
    pub pending_req: AtomicU64,
    pub launched: AtomicBool,
    pub events: [VcpuEvent; NUM_VCPU_EVENTS],
    pub vlapic: Vlapic,
}

impl VcpuShared {
    pub fn state(&self) -> VcpuState {
        VcpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, new: VcpuState) {
        let old = self.state.swap(new as u8, Ordering::AcqRel);
        self.prev_state.store(old, Ordering::Release);
    }

    pub fn prev_state(&self) -> VcpuState {
        VcpuState::from_u8(self.prev_state.load(Ordering::Acquire))
    }
}

pub struct VcpuCell {
    pub shared: VcpuShared,
    body: UnsafeCell<Vcpu>,
}

// Access to `body` is governed by the ownership rule on body_mut; the
// shared half is atomics throughout.
unsafe impl Send for VcpuCell {}
unsafe impl Sync for VcpuCell {}

impl VcpuCell {
    pub fn new(vm_id: u16, vcpu_id: u16, pcpu_id: u16) -> Self {
        // One VPID per vCPU slot, folded into [1, MAX_VPID].
        let slot = vm_id as usize * MAX_VCPUS_PER_VM + vcpu_id as usize;
        let vpid = 1 + (slot % (crate::config::MAX_VPID as usize - 1)) as u16;
        const EV: VcpuEvent = VcpuEvent::new();
        VcpuCell {
            shared: VcpuShared {
                vcpu_id,
                vm_id,
                pcpu_id: AtomicU16::new(pcpu_id),
                state: AtomicU8::new(VcpuState::Init as u8),
                prev_state: AtomicU8::new(VcpuState::Init as u8),
                pending_req: AtomicU64::new(0),
                launched: AtomicBool::new(false),
                events: [EV; NUM_VCPU_EVENTS],
                vlapic: Vlapic::new(vm_id, vcpu_id, vcpu_id as u32),
            },
            body: UnsafeCell::new(Vcpu::new(vm_id, vcpu_id, pcpu_id, vpid)),
        }
    }

    /// Mutable access to the body.
    ///
    /// # Safety
    /// The caller must either be the pCPU this vCPU is pinned to (run
    /// loop, exit handlers), or hold the VM configuration lock while the
    /// vCPU is not in `Running` state.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn body_mut(&self) -> &mut Vcpu {
        unsafe { &mut *self.body.get() }
    }
}

impl Vcpu {
    fn new(vm_id: u16, vcpu_id: u16, pcpu_id: u16, vpid: u16) -> Self {
        let mut vcpu = Vcpu {
            vcpu_id,
            vm_id,
            pcpu_id,
            vmcs_page: Box::new(Page::zeroed()),
            launched: false,
            arch: VcpuArch::new(vpid),
            reg_cached: 0,
            reg_updated: 0,
            req: IoRequest::default(),
            decoded: None,
        };
        vcpu.reset_guest_regs();
        vcpu
    }

    #[inline]
    fn ctx(&mut self) -> &mut GuestCpuContext {
        &mut self.arch.contexts[self.arch.cur_context]
    }

    #[inline]
    pub fn cur_context(&self) -> usize {
        self.arch.cur_context
    }

    fn bit(reg: CpuReg) -> u64 {
        1u64 << reg as u32
    }

    /// Seed the wait-for-SIPI INIT register state.
    pub fn reset_guest_regs(&mut self) {
        for world in self.arch.contexts.iter_mut() {
            let run = &mut world.run_ctx;
            *run = RunContext::default();
            run.rflags = 0x2;
            run.cr0 = 0x6000_0010; /* CD | NW | ET */

            let ext = &mut world.ext_ctx;
            ext.cs = SegDescriptor {
                selector: 0xF000,
                base: 0xFFFF_0000,
                limit: 0xFFFF,
                attr: 0x9B,
            };
            for seg in [&mut ext.ss, &mut ext.ds, &mut ext.es, &mut ext.fs, &mut ext.gs]
            {
                *seg = SegDescriptor {
                    selector: 0,
                    base: 0,
                    limit: 0xFFFF,
                    attr: 0x93,
                };
            }
            ext.tr = SegDescriptor {
                selector: 0,
                base: 0,
                limit: 0xFFFF,
                attr: 0x8B,
            };
            ext.ldtr = SegDescriptor {
                selector: 0,
                base: 0,
                limit: 0xFFFF,
                attr: 0x82,
            };
            ext.idtr = DescTablePtr {
                base: 0,
                limit: 0xFFFF,
            };
            ext.gdtr = DescTablePtr {
                base: 0,
                limit: 0xFFFF,
            };
            ext.ia32_pat = msr::PAT_POWER_ON_VALUE;
            ext.xcr0 = 0x1;
        }
        self.arch.contexts[NORMAL_WORLD].run_ctx.rip = 0xFFF0;
        self.reg_cached = 0;
        self.reg_updated = 0;
    }

    /// Point the vCPU at its startup entry (SIPI or configured entry).
    pub fn set_startup_entry(&mut self, entry_gpa: u64) {
        let ctx = self.ctx();
        ctx.run_ctx.rip = entry_gpa;
        self.reg_updated |= Self::bit(CpuReg::Rip);
    }

    /* ---------- register accessors with the lazy VMCS cache ---------- */

    pub fn get_gpreg(&mut self, reg: CpuReg) -> u64 {
        let idx = reg as usize;
        if idx < 16 {
            if reg == CpuReg::Rsp {
                return self.get_rsp();
            }
            let gprs = &self.ctx().run_ctx.gprs as *const GeneralRegisters as *const u64;
            // SAFETY: idx < 16 indexes inside the repr(C) GPR block.
            unsafe { *gprs.add(idx) }
        } else {
            match reg {
                CpuReg::Cr0 => virtual_cr::guest_cr0(self),
                CpuReg::Cr2 => self.get_cr2(),
                CpuReg::Cr4 => virtual_cr::guest_cr4(self),
                CpuReg::Rip => self.get_rip(),
                CpuReg::Rflags => self.get_rflags(),
                CpuReg::Efer => self.get_efer(),
                _ => 0,
            }
        }
    }

    pub fn set_gpreg(&mut self, reg: CpuReg, value: u64) {
        let idx = reg as usize;
        if idx < 16 {
            if reg == CpuReg::Rsp {
                self.set_rsp(value);
                return;
            }
            let gprs = &mut self.ctx().run_ctx.gprs as *mut GeneralRegisters as *mut u64;
            // SAFETY: idx < 16 indexes inside the repr(C) GPR block.
            unsafe { *gprs.add(idx) = value };
        }
    }

    fn cached_read(&mut self, reg: CpuReg, field: u32) -> u64 {
        // SAFETY: owning pCPU with this vCPU's VMCS current.
        self.cached_read_with(reg, || unsafe { exec_vmread(field) })
    }

    /// Composed reads (CR0/CR4 fold the read shadow in) share the cache
    /// discipline: a dirty or cached register is served from the context.
    pub(crate) fn cached_read_with(
        &mut self,
        reg: CpuReg,
        read: impl FnOnce() -> u64,
    ) -> u64 {
        let bit = Self::bit(reg);
        if self.reg_updated & bit == 0 && self.reg_cached & bit == 0 {
            self.reg_cached |= bit;
            let value = read();
            self.store_cached(reg, value);
        }
        self.load_cached(reg)
    }

    /// Park a value in the cache without touching hardware (used when a
    /// trapped write already knows the architectural value).
    pub(crate) fn prime_cache(&mut self, reg: CpuReg, value: u64) {
        self.store_cached(reg, value);
        self.reg_cached |= Self::bit(reg);
    }

    fn store_cached(&mut self, reg: CpuReg, value: u64) {
        let run = &mut self.ctx().run_ctx;
        match reg {
            CpuReg::Rip => run.rip = value,
            CpuReg::Rsp => run.rsp = value,
            CpuReg::Rflags => run.rflags = value,
            CpuReg::Efer => run.ia32_efer = value,
            CpuReg::Cr0 => run.cr0 = value,
            CpuReg::Cr4 => run.cr4 = value,
            _ => {}
        }
    }

    fn load_cached(&mut self, reg: CpuReg) -> u64 {
        let run = &mut self.ctx().run_ctx;
        match reg {
            CpuReg::Rip => run.rip,
            CpuReg::Rsp => run.rsp,
            CpuReg::Rflags => run.rflags,
            CpuReg::Efer => run.ia32_efer,
            CpuReg::Cr0 => run.cr0,
            CpuReg::Cr4 => run.cr4,
            _ => 0,
        }
    }

    pub fn get_rip(&mut self) -> u64 {
        self.cached_read(CpuReg::Rip, vmx::VMX_GUEST_RIP)
    }

    pub fn set_rip(&mut self, value: u64) {
        self.store_cached(CpuReg::Rip, value);
        self.reg_updated |= Self::bit(CpuReg::Rip);
    }

    pub fn get_rsp(&mut self) -> u64 {
        self.cached_read(CpuReg::Rsp, vmx::VMX_GUEST_RSP)
    }

    pub fn set_rsp(&mut self, value: u64) {
        self.store_cached(CpuReg::Rsp, value);
        self.reg_updated |= Self::bit(CpuReg::Rsp);
    }

    pub fn get_rflags(&mut self) -> u64 {
        self.cached_read(CpuReg::Rflags, vmx::VMX_GUEST_RFLAGS)
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.store_cached(CpuReg::Rflags, value);
        self.reg_updated |= Self::bit(CpuReg::Rflags);
    }

    /// EFER is software-maintained; the flush path mirrors it to the VMCS.
    pub fn get_efer(&mut self) -> u64 {
        self.ctx().run_ctx.ia32_efer
    }

    pub fn set_efer(&mut self, value: u64) {
        self.ctx().run_ctx.ia32_efer = value;
        self.reg_updated |= Self::bit(CpuReg::Efer);
    }

    pub fn get_cr2(&mut self) -> u64 {
        self.ctx().run_ctx.cr2
    }

    pub fn set_cr2(&mut self, value: u64) {
        self.ctx().run_ctx.cr2 = value;
    }

    /// Mark a CR's cache stale so the next read comes from the VMCS.
    pub fn invalidate_reg_cache(&mut self, reg: CpuReg) {
        self.reg_cached &= !Self::bit(reg);
    }

    /// Mark a register dirty for the pre-entry flush (world switch).
    pub fn mark_reg_updated(&mut self, reg: CpuReg) {
        self.reg_updated |= Self::bit(reg);
    }

    pub fn reg_is_updated(&self, reg: CpuReg) -> bool {
        self.reg_updated & Self::bit(reg) != 0
    }

    /// Keep RIP where it is on the next entry (fault-style injection,
    /// window exits).
    pub fn retain_rip(&mut self) {
        self.arch.inst_len = 0;
    }

    /// Flush lazily-written registers back into the VMCS before entry.
    fn flush_updated_regs(&mut self) {
        if self.reg_updated == 0 {
            return;
        }
        let updated = self.reg_updated;
        self.reg_updated = 0;

        if updated & Self::bit(CpuReg::Rip) != 0 {
            let v = self.ctx().run_ctx.rip;
            // SAFETY: owning pCPU, VMCS current (same for the writes below).
            unsafe { exec_vmwrite(vmx::VMX_GUEST_RIP, v) };
        }
        if updated & Self::bit(CpuReg::Rsp) != 0 {
            let v = self.ctx().run_ctx.rsp;
            unsafe { exec_vmwrite(vmx::VMX_GUEST_RSP, v) };
        }
        if updated & Self::bit(CpuReg::Rflags) != 0 {
            let v = self.ctx().run_ctx.rflags;
            unsafe { exec_vmwrite(vmx::VMX_GUEST_RFLAGS, v) };
        }
        if updated & Self::bit(CpuReg::Efer) != 0 {
            let v = self.ctx().run_ctx.ia32_efer;
            unsafe { exec_vmwrite(vmx::VMX_GUEST_IA32_EFER_FULL, v) };
        }
        if updated & Self::bit(CpuReg::Cr0) != 0 {
            let v = self.ctx().run_ctx.cr0;
            virtual_cr::vmx_write_cr0(self, v);
        }
        if updated & Self::bit(CpuReg::Cr4) != 0 {
            let v = self.ctx().run_ctx.cr4;
            virtual_cr::vmx_write_cr4(self, v);
        }
    }

    /// One guest entry: flush dirty state, run, pull exit information.
    pub fn run(&mut self) -> Result<(), HvErr> {
        self.flush_updated_regs();

        // Advance RIP past the handled instruction unless retained.
        if self.arch.inst_len != 0 {
            let len = self.arch.inst_len as u64;
            let rip = self.get_rip();
            self.set_rip(rip + len);
            let v = self.ctx().run_ctx.rip;
            // SAFETY: owning pCPU, VMCS current.
            unsafe { exec_vmwrite(vmx::VMX_GUEST_RIP, v) };
            self.reg_updated &= !Self::bit(CpuReg::Rip);
        }

        let spec_ctrl = self.ctx().run_ctx.ia32_spec_ctrl;
        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_IBRS_IBPB) {
            // SAFETY: capability checked; restores below after exit.
            unsafe { wrmsr(msr::MSR_IA32_SPEC_CTRL, spec_ctrl) };
        }

        let launch = !self.launched;
        let gprs = &mut self.ctx().run_ctx.gprs as *mut GeneralRegisters;
        // SAFETY: VMCS fully initialized by init_vmcs; gprs lives in the
        // boxed context for the whole run.
        let result = unsafe { vmx::vmrun(gprs, launch) };

        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_IBRS_IBPB) {
            // SAFETY: capability checked.
            unsafe {
                let guest = rdmsr(msr::MSR_IA32_SPEC_CTRL);
                self.ctx().run_ctx.ia32_spec_ctrl = guest;
                wrmsr(msr::MSR_IA32_SPEC_CTRL, msr::SPEC_CTRL_IBRS);
            }
        }

        result.map_err(|_| HvErr::Fault)?;
        self.launched = true;

        // Everything VMCS-resident is stale now.
        self.reg_cached = 0;
        self.arch.nr_exits += 1;
        // SAFETY: owning pCPU right after exit.
        unsafe {
            self.arch.exit_reason = exec_vmread(vmx::VMX_EXIT_REASON);
            self.arch.inst_len = exec_vmread32(vmx::VMX_EXIT_INSTR_LEN);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcpu() -> Vcpu {
        Vcpu::new(0, 0, 0, 1)
    }

    #[test]
    fn init_state_is_wait_for_sipi() {
        let mut v = vcpu();
        assert_eq!(v.ctx().run_ctx.rflags, 0x2);
        assert_eq!(v.arch.contexts[NORMAL_WORLD].run_ctx.rip, 0xFFF0);
        let cs = &v.arch.contexts[NORMAL_WORLD].ext_ctx.cs;
        assert_eq!(cs.selector, 0xF000);
        assert_eq!(cs.base, 0xFFFF_0000);
        assert_eq!(v.arch.exception_info.exception, VECTOR_INVALID);
    }

    #[test]
    fn gpreg_read_write_round_trip() {
        let mut v = vcpu();
        v.set_gpreg(CpuReg::Rbx, 0xDEAD_BEEF);
        v.set_gpreg(CpuReg::R15, 42);
        assert_eq!(v.get_gpreg(CpuReg::Rbx), 0xDEAD_BEEF);
        assert_eq!(v.get_gpreg(CpuReg::R15), 42);
        assert_eq!(v.get_gpreg(CpuReg::Rcx), 0);
    }

    #[test]
    fn set_then_get_does_not_hit_vmcs() {
        // A set marks the register updated; the getter must serve it from
        // the context instead of vmread (which would fault hosted).
        let mut v = vcpu();
        v.set_rip(0x1000);
        assert_eq!(v.get_rip(), 0x1000);
        v.set_rsp(0x2000);
        assert_eq!(v.get_gpreg(CpuReg::Rsp), 0x2000);
        v.set_rflags(0x202);
        assert_eq!(v.get_rflags(), 0x202);
    }

    #[test]
    fn efer_is_software_maintained() {
        let mut v = vcpu();
        v.set_efer(msr::MSR_IA32_EFER_LME_BIT);
        assert_eq!(v.get_efer(), msr::MSR_IA32_EFER_LME_BIT);
        assert!(v.reg_is_updated(CpuReg::Efer));
    }

    #[test]
    fn worlds_have_independent_contexts() {
        let mut v = vcpu();
        v.set_rip(0x1111);
        v.arch.cur_context = SECURE_WORLD;
        v.set_rip(0x2222);
        assert_eq!(v.get_rip(), 0x2222);
        v.arch.cur_context = NORMAL_WORLD;
        assert_eq!(v.get_rip(), 0x1111);
    }

    #[test]
    fn retain_rip_clears_inst_len() {
        let mut v = vcpu();
        v.arch.inst_len = 3;
        v.retain_rip();
        assert_eq!(v.arch.inst_len, 0);
    }

    #[test]
    fn cell_state_machine() {
        let cell = VcpuCell::new(0, 1, 2);
        assert_eq!(cell.shared.state(), VcpuState::Init);
        cell.shared.set_state(VcpuState::Running);
        assert_eq!(cell.shared.state(), VcpuState::Running);
        assert_eq!(cell.shared.prev_state(), VcpuState::Init);
        cell.shared.set_state(VcpuState::Zombie);
        assert_eq!(cell.shared.prev_state(), VcpuState::Running);
    }

    #[test]
    fn vpid_assignment_is_unique_per_vcpu() {
        let a = VcpuCell::new(0, 0, 0);
        let b = VcpuCell::new(0, 1, 1);
        let c = VcpuCell::new(1, 0, 2);
        // SAFETY: test-only, cells are local and not running.
        unsafe {
            assert_ne!(a.body_mut().arch.vpid, b.body_mut().arch.vpid);
            assert_ne!(a.body_mut().arch.vpid, c.body_mut().arch.vpid);
            assert_ne!(a.body_mut().arch.vpid, 0);
        }
    }
}
