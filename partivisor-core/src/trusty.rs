//! Secure-world (Trusty) support: carving the secure memory out of the
//! normal world, the rebased secure EPT, key material derivation, and the
//! SMC-driven world switch.
//!
//! The isolation invariant: every byte mapped in the secure world's
//! private range is absent from the normal world's EPT, so a normal-world
//! access EPT-violates. The secure world keeps read visibility into
//! normal memory through borrowed, execute-stripped PDPTs.

use core::mem::size_of;

use sha2::{Digest, Sha256};
use spin::Mutex;

use partivisor_hal::config::L1D_FLUSH_VMENTRY_ENABLED;
use partivisor_hal::msr::{self, rdmsr, wrmsr};
use partivisor_hal::vmx::{
    self, cpu_l1d_flush, exec_vmread, exec_vmread32, exec_vmwrite, exec_vmwrite32,
};
use partivisor_hal::{cpu_caps, cpuid, hpa2hva, stac, clac, tsc, INVALID_HPA};

use crate::config::TRUSTY_EPT_REBASE_GPA;
use crate::ept::{EPT_RWX, EPT_WB};
use crate::error::HvErr;
use crate::vcpu::{
    CpuReg, DescTablePtr, ExtContext, SegDescriptor, Vcpu, NORMAL_WORLD, SECURE_WORLD,
};
use crate::virtual_cr;
use crate::vm::Vm;
use crate::vmsr::NUM_WORLD_MSRS;

const TRUSTY_VERSION: u32 = 1;
const TRUSTY_VERSION_2: u32 = 2;

/// Boot parameter handed in by the guest bootloader.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrustyBootParam {
    pub size_of_this_struct: u32,
    pub version: u32,
    pub entry_point: u32,
    pub base_addr: u32,
    pub mem_size: u32,
    pub padding: u32,
    pub entry_point_high: u32,
    pub base_addr_high: u32,
    pub rpmb_key: [u8; 64],
}

impl Default for TrustyBootParam {
    fn default() -> Self {
        Self {
            size_of_this_struct: 0,
            version: 0,
            entry_point: 0,
            base_addr: 0,
            mem_size: 0,
            padding: 0,
            entry_point_high: 0,
            base_addr_high: 0,
            rpmb_key: [0; 64],
        }
    }
}

/// First-page startup block the secure kernel reads on entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrustyStartupParam {
    pub size_of_this_struct: u32,
    pub mem_size: u32,
    pub tsc_per_ms: u64,
    pub trusty_mem_base: u64,
    pub reserved: u64,
}

pub const NUM_DSEEDS: usize = 4;

/// Key material derived per VM, placed ahead of the startup block.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct TrustyKeyInfo {
    pub size_of_this_struct: u32,
    pub version: u32,
    pub platform: u32,
    pub num_seeds: u32,
    pub dseed_list: [[u8; 64]; NUM_DSEEDS],
    pub attkb_enc_key: [u8; 32],
    pub rpmb_key: [u8; 64],
}

/// Device seeds provisioned by the platform boot flow.
static DSEED_STORE: Mutex<[[u8; 64]; NUM_DSEEDS]> = Mutex::new([[0; 64]; NUM_DSEEDS]);

/// Install the platform seeds (boot collaborator, before any VM starts).
pub fn provision_dseeds(seeds: &[[u8; 64]; NUM_DSEEDS]) {
    *DSEED_STORE.lock() = *seeds;
}

/// Virtual seeds: HMAC-style SHA-256 of each device seed keyed with the
/// VM identity, so no VM ever sees a raw platform seed.
fn derive_virtual_seed(out: &mut [[u8; 64]; NUM_DSEEDS], vm_name: &[u8]) -> u32 {
    let store = DSEED_STORE.lock();
    for (i, seed) in store.iter().enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(vm_name);
        hasher.update([i as u8]);
        let digest = hasher.finalize();
        out[i][..32].copy_from_slice(&digest);
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(seed);
        let second = hasher.finalize();
        out[i][32..].copy_from_slice(&second);
    }
    NUM_DSEEDS as u32
}

/// Encryption key for the attestation keybox, bound to the first seed.
fn derive_attkb_enc_key(out: &mut [u8; 32]) {
    let store = DSEED_STORE.lock();
    let mut hasher = Sha256::new();
    hasher.update(b"attkb");
    hasher.update(store[0]);
    out.copy_from_slice(&hasher.finalize());
}

/// Carve `[gpa_orig, +size)` out of the normal world and build the secure
/// hierarchy mapping `[gpa_rebased, +size)` onto the same host frames.
fn create_secure_world_ept(
    vm: &Vm,
    gpa_orig: u64,
    size: u64,
    gpa_rebased: u64,
) -> Result<u64, HvErr> {
    let hpa = vm.gpa2hpa(gpa_orig);
    if hpa == INVALID_HPA {
        return Err(HvErr::Fault);
    }

    vm.ept_del_mr(gpa_orig, size)?;

    let sworld = vm.nworld_ept().create_trusty_root(gpa_rebased)?;
    sworld.add_mr(hpa, gpa_rebased, size, EPT_RWX | EPT_WB)?;
    *vm.sworld_ept().write() = Some(sworld);

    let mut control = vm.sworld_control.lock();
    control.memory.base_gpa_in_user_vm = gpa_orig;
    control.memory.base_hpa = hpa;
    control.memory.length = size;

    Ok(hpa)
}

/// Tear the secure world down, optionally scrubbing its memory, and hand
/// the range back to the normal world.
pub fn destroy_secure_world(vm: &Vm, need_clr_mem: bool) {
    let (hpa, gpa_user_vm, size) = {
        let control = vm.sworld_control.lock();
        (
            control.memory.base_hpa,
            control.memory.base_gpa_in_user_vm,
            control.memory.length,
        )
    };

    let mut sworld_guard = vm.sworld_ept().write();
    let Some(sworld) = sworld_guard.take() else {
        crate::pr_err!("vm{}: secure world was never created", vm.vm_id);
        return;
    };

    if need_clr_mem {
        stac();
        // SAFETY: the range was exclusively the secure world's; it is
        // unmapped from every EPT while we scrub.
        unsafe { core::ptr::write_bytes(hpa2hva(hpa), 0, size as usize) };
        clac();
    }

    let _ = sworld.del_mr(TRUSTY_EPT_REBASE_GPA, size);
    sworld.destroy_trusty_root(TRUSTY_EPT_REBASE_GPA);
    drop(sworld_guard);

    if let Err(e) = vm.ept_add_mr(hpa, gpa_user_vm, size, EPT_RWX | EPT_WB) {
        crate::pr_err!("vm{}: restore of secure range failed: {:?}", vm.vm_id, e);
    }
}

/// Selector/base/limit/attr field tuples per segment register.
const SEG_FIELDS: [(u32, u32, u32, u32); 8] = [
    (vmx::VMX_GUEST_CS_SEL, vmx::VMX_GUEST_CS_BASE, vmx::VMX_GUEST_CS_LIMIT, vmx::VMX_GUEST_CS_ATTR),
    (vmx::VMX_GUEST_SS_SEL, vmx::VMX_GUEST_SS_BASE, vmx::VMX_GUEST_SS_LIMIT, vmx::VMX_GUEST_SS_ATTR),
    (vmx::VMX_GUEST_DS_SEL, vmx::VMX_GUEST_DS_BASE, vmx::VMX_GUEST_DS_LIMIT, vmx::VMX_GUEST_DS_ATTR),
    (vmx::VMX_GUEST_ES_SEL, vmx::VMX_GUEST_ES_BASE, vmx::VMX_GUEST_ES_LIMIT, vmx::VMX_GUEST_ES_ATTR),
    (vmx::VMX_GUEST_FS_SEL, vmx::VMX_GUEST_FS_BASE, vmx::VMX_GUEST_FS_LIMIT, vmx::VMX_GUEST_FS_ATTR),
    (vmx::VMX_GUEST_GS_SEL, vmx::VMX_GUEST_GS_BASE, vmx::VMX_GUEST_GS_LIMIT, vmx::VMX_GUEST_GS_ATTR),
    (vmx::VMX_GUEST_TR_SEL, vmx::VMX_GUEST_TR_BASE, vmx::VMX_GUEST_TR_LIMIT, vmx::VMX_GUEST_TR_ATTR),
    (vmx::VMX_GUEST_LDTR_SEL, vmx::VMX_GUEST_LDTR_BASE, vmx::VMX_GUEST_LDTR_LIMIT, vmx::VMX_GUEST_LDTR_ATTR),
];

fn each_segment(ext: &mut ExtContext) -> [&mut SegDescriptor; 8] {
    [
        &mut ext.cs,
        &mut ext.ss,
        &mut ext.ds,
        &mut ext.es,
        &mut ext.fs,
        &mut ext.gs,
        &mut ext.tr,
        &mut ext.ldtr,
    ]
}

const XSAVE_COMPONENT_MASK: u64 = !0u64;

/// Park the departing world's non-VMCS state.
fn save_world_ctx(vcpu: &mut Vcpu, world: usize) {
    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
        // Cache the on-demand registers so the parked run context is
        // whole.
        let _ = vcpu.get_efer();
        let _ = vcpu.get_rflags();
        let _ = vcpu.get_rsp();
        let _ = vcpu.get_rip();
        let _ = virtual_cr::guest_cr0(vcpu);
        let _ = virtual_cr::guest_cr4(vcpu);
        let ext = &mut vcpu.arch.contexts[world].ext_ctx;
        // SAFETY: owning pCPU, VMCS current; MSR reads are architectural.
        unsafe {
            ext.tsc_offset = exec_vmread(vmx::VMX_TSC_OFFSET_FULL);
            ext.cr3 = exec_vmread(vmx::VMX_GUEST_CR3);
            ext.dr7 = exec_vmread(vmx::VMX_GUEST_DR7);
            ext.ia32_debugctl = exec_vmread(vmx::VMX_GUEST_IA32_DEBUGCTL_FULL);
            ext.ia32_pat = exec_vmread(vmx::VMX_GUEST_IA32_PAT_FULL);
            ext.ia32_sysenter_cs = exec_vmread32(vmx::VMX_GUEST_IA32_SYSENTER_CS);
            ext.ia32_sysenter_esp = exec_vmread(vmx::VMX_GUEST_IA32_SYSENTER_ESP);
            ext.ia32_sysenter_eip = exec_vmread(vmx::VMX_GUEST_IA32_SYSENTER_EIP);

            for (i, seg) in each_segment(ext).into_iter().enumerate() {
                let (sel, base, limit, attr) = SEG_FIELDS[i];
                seg.selector = exec_vmread(sel) as u16;
                seg.base = exec_vmread(base);
                seg.limit = exec_vmread32(limit);
                seg.attr = exec_vmread32(attr);
            }
            ext.idtr = DescTablePtr {
                base: exec_vmread(vmx::VMX_GUEST_IDTR_BASE),
                limit: exec_vmread32(vmx::VMX_GUEST_IDTR_LIMIT),
            };
            ext.gdtr = DescTablePtr {
                base: exec_vmread(vmx::VMX_GUEST_GDTR_BASE),
                limit: exec_vmread32(vmx::VMX_GUEST_GDTR_LIMIT),
            };

            ext.ia32_star = rdmsr(msr::MSR_IA32_STAR);
            ext.ia32_lstar = rdmsr(msr::MSR_IA32_LSTAR);
            ext.ia32_fmask = rdmsr(msr::MSR_IA32_FMASK);
            ext.ia32_kernel_gs_base = rdmsr(msr::MSR_IA32_KERNEL_GS_BASE);
            ext.tsc_aux = rdmsr(msr::MSR_IA32_TSC_AUX);
        }

        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVES) {
            // SAFETY: XSAVES checked; the area is 64-byte aligned.
            unsafe {
                let ext = &mut vcpu.arch.contexts[world].ext_ctx;
                ext.xcr0 = vmx::read_xcr(0);
                vmx::xsaves(ext.xsave.0.as_mut_ptr(), XSAVE_COMPONENT_MASK);
            }
        }
    }

    for i in 0..NUM_WORLD_MSRS {
        vcpu.arch.contexts[world].world_msrs[i] = vcpu.arch.guest_msrs[i];
    }
}

/// Install the arriving world's non-VMCS state.
fn load_world_ctx(vcpu: &mut Vcpu, world: usize) {
    // The on-demand registers come back lazily at the next entry.
    for reg in [CpuReg::Efer, CpuReg::Rflags, CpuReg::Rsp, CpuReg::Rip, CpuReg::Cr0, CpuReg::Cr4]
    {
        vcpu.mark_reg_updated(reg);
    }

    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
        let ext = &vcpu.arch.contexts[world].ext_ctx;
        // SAFETY: owning pCPU, VMCS current.
        unsafe {
            exec_vmwrite(vmx::VMX_TSC_OFFSET_FULL, ext.tsc_offset);
            exec_vmwrite(vmx::VMX_GUEST_CR3, ext.cr3);
            exec_vmwrite(vmx::VMX_GUEST_DR7, ext.dr7);
            exec_vmwrite(vmx::VMX_GUEST_IA32_DEBUGCTL_FULL, ext.ia32_debugctl);
            exec_vmwrite(vmx::VMX_GUEST_IA32_PAT_FULL, ext.ia32_pat);
            exec_vmwrite32(vmx::VMX_GUEST_IA32_SYSENTER_CS, ext.ia32_sysenter_cs);
            exec_vmwrite(vmx::VMX_GUEST_IA32_SYSENTER_ESP, ext.ia32_sysenter_esp);
            exec_vmwrite(vmx::VMX_GUEST_IA32_SYSENTER_EIP, ext.ia32_sysenter_eip);

            let segs = [
                &ext.cs, &ext.ss, &ext.ds, &ext.es, &ext.fs, &ext.gs, &ext.tr, &ext.ldtr,
            ];
            for (i, seg) in segs.into_iter().enumerate() {
                let (sel, base, limit, attr) = SEG_FIELDS[i];
                exec_vmwrite(sel, seg.selector as u64);
                exec_vmwrite(base, seg.base);
                exec_vmwrite32(limit, seg.limit);
                exec_vmwrite32(attr, seg.attr);
            }
            exec_vmwrite(vmx::VMX_GUEST_IDTR_BASE, ext.idtr.base);
            exec_vmwrite32(vmx::VMX_GUEST_IDTR_LIMIT, ext.idtr.limit);
            exec_vmwrite(vmx::VMX_GUEST_GDTR_BASE, ext.gdtr.base);
            exec_vmwrite32(vmx::VMX_GUEST_GDTR_LIMIT, ext.gdtr.limit);

            wrmsr(msr::MSR_IA32_STAR, ext.ia32_star);
            wrmsr(msr::MSR_IA32_LSTAR, ext.ia32_lstar);
            wrmsr(msr::MSR_IA32_FMASK, ext.ia32_fmask);
            wrmsr(msr::MSR_IA32_KERNEL_GS_BASE, ext.ia32_kernel_gs_base);
            wrmsr(msr::MSR_IA32_TSC_AUX, ext.tsc_aux);
        }

        if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_XSAVES) {
            // SAFETY: XSAVES checked; the image was produced by xsaves.
            unsafe {
                let ext = &vcpu.arch.contexts[world].ext_ctx;
                vmx::write_xcr(0, ext.xcr0);
                vmx::xrstors(ext.xsave.0.as_ptr(), XSAVE_COMPONENT_MASK);
            }
        }
    }

    for i in 0..NUM_WORLD_MSRS {
        vcpu.arch.guest_msrs[i] = vcpu.arch.contexts[world].world_msrs[i];
    }
}

/// SMC calling convention: RDI, RSI, RDX, RBX travel between worlds.
fn copy_smc_param(vcpu: &mut Vcpu, prev: usize, next: usize) {
    let prev_gprs = vcpu.arch.contexts[prev].run_ctx.gprs;
    let next_gprs = &mut vcpu.arch.contexts[next].run_ctx.gprs;
    next_gprs.rdi = prev_gprs.rdi;
    next_gprs.rsi = prev_gprs.rsi;
    next_gprs.rdx = prev_gprs.rdx;
    next_gprs.rbx = prev_gprs.rbx;
}

/// Flip the vCPU between worlds.
pub fn switch_world(vcpu: &mut Vcpu, vm: &Vm, next_world: usize) {
    let prev_world = vcpu.arch.cur_context;
    debug_assert_ne!(prev_world, next_world);

    save_world_ctx(vcpu, prev_world);

    // The register cache and dirty set belong to the world being parked;
    // the arriving world re-marks what it needs.
    vcpu.arch.cur_context = next_world;
    load_world_ctx(vcpu, next_world);
    copy_smc_param(vcpu, prev_world, next_world);

    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
        let eptp = if next_world == NORMAL_WORLD {
            Some(vm.nworld_eptp_value())
        } else {
            vm.sworld_eptp_value()
        };
        if let Some(eptp) = eptp {
            // SAFETY: owning pCPU, VMCS current.
            unsafe { exec_vmwrite(vmx::VMX_EPT_POINTER_FULL, eptp) };
        }
    }

    // Entering the secure world must not leak normal-world lines.
    if next_world == SECURE_WORLD && !L1D_FLUSH_VMENTRY_ENABLED {
        cpu_l1d_flush();
    }
}

fn setup_trusty_info(
    vcpu: &mut Vcpu,
    vm: &Vm,
    mem_size: u32,
    mem_base_hpa: u64,
    rpmb_key: Option<&[u8; 64]>,
) -> bool {
    let mut key_info = TrustyKeyInfo {
        size_of_this_struct: size_of::<TrustyKeyInfo>() as u32,
        version: 0,
        platform: 3,
        num_seeds: 0,
        dseed_list: [[0; 64]; NUM_DSEEDS],
        attkb_enc_key: [0; 32],
        rpmb_key: [0; 64],
    };
    if let Some(key) = rpmb_key {
        key_info.rpmb_key = *key;
    }

    key_info.num_seeds = derive_virtual_seed(&mut key_info.dseed_list, vm.name());
    derive_attkb_enc_key(&mut key_info.attkb_enc_key);

    let startup_param = TrustyStartupParam {
        size_of_this_struct: size_of::<TrustyStartupParam>() as u32,
        mem_size,
        tsc_per_ms: tsc::tsc_per_ms(),
        trusty_mem_base: TRUSTY_EPT_REBASE_GPA,
        reserved: 0,
    };

    // Boot protocol: RDI points at the startup block, placed right after
    // the key info in the first secure page.
    vcpu.arch.contexts[SECURE_WORLD].run_ctx.gprs.rdi =
        TRUSTY_EPT_REBASE_GPA + size_of::<TrustyKeyInfo>() as u64;

    stac();
    // SAFETY: mem_base_hpa is the secure region's exclusive backing; both
    // structs fit the first page by construction.
    unsafe {
        let page = hpa2hva(mem_base_hpa);
        core::ptr::write(page as *mut TrustyKeyInfo, key_info);
        core::ptr::write(
            page.add(size_of::<TrustyKeyInfo>()) as *mut TrustyStartupParam,
            startup_param,
        );
    }
    clac();

    // The local copy held raw key material.
    key_info.dseed_list = [[0; 64]; NUM_DSEEDS];
    key_info.attkb_enc_key = [0; 32];
    true
}

fn init_secure_world_env(
    vcpu: &mut Vcpu,
    vm: &Vm,
    entry_gpa: u64,
    base_hpa: u64,
    size: u32,
    rpmb_key: Option<&[u8; 64]>,
) -> bool {
    vcpu.arch.inst_len = 0;
    vcpu.arch.contexts[SECURE_WORLD].run_ctx.rip = entry_gpa;
    vcpu.arch.contexts[SECURE_WORLD].run_ctx.rsp = TRUSTY_EPT_REBASE_GPA + size as u64;
    vcpu.arch.contexts[SECURE_WORLD].run_ctx.gprs.rsp_unused = 0;
    vcpu.arch.contexts[SECURE_WORLD].ext_ctx.tsc_offset = 0;

    for i in 0..NUM_WORLD_MSRS {
        let v = vcpu.arch.guest_msrs[i];
        vcpu.arch.contexts[NORMAL_WORLD].world_msrs[i] = v;
        vcpu.arch.contexts[SECURE_WORLD].world_msrs[i] = v;
    }

    setup_trusty_info(vcpu, vm, size, base_hpa, rpmb_key)
}

/// The `initialize_trusty` hypercall body: returns false and leaves the
/// guest in its prior context on any violation.
pub fn initialize_trusty(
    vcpu: &mut Vcpu,
    vm: &Vm,
    boot_param: &TrustyBootParam,
) -> bool {
    let (entry_gpa, base_gpa, rpmb_key) = match boot_param.version {
        TRUSTY_VERSION_2 => (
            boot_param.entry_point as u64 | ((boot_param.entry_point_high as u64) << 32),
            boot_param.base_addr as u64 | ((boot_param.base_addr_high as u64) << 32),
            Some(&boot_param.rpmb_key),
        ),
        TRUSTY_VERSION => (
            boot_param.entry_point as u64,
            boot_param.base_addr as u64,
            None,
        ),
        v => {
            crate::pr_err!("trusty version {} not supported", v);
            return false;
        }
    };

    if !vm.config.sworld_supported || vm.has_sworld() {
        crate::pr_err!(
            "vm{}: secure world unsupported or already initialized",
            vm.vm_id
        );
        return false;
    }

    let mem_size = boot_param.mem_size;
    let base_hpa = match create_secure_world_ept(
        vm,
        base_gpa,
        mem_size as u64,
        TRUSTY_EPT_REBASE_GPA,
    ) {
        Ok(hpa) => hpa,
        Err(e) => {
            crate::pr_err!("vm{}: secure world EPT build failed: {:?}", vm.vm_id, e);
            return false;
        }
    };

    if cpu_caps::pcpu_has_cap(cpuid::X86_FEATURE_VMX) {
        if let Some(eptp) = vm.sworld_eptp_value() {
            // SAFETY: owning pCPU, VMCS current.
            unsafe { exec_vmwrite(vmx::VMX_EPT_POINTER_FULL, eptp) };
        }
    }

    save_world_ctx(vcpu, NORMAL_WORLD);

    let rebased_entry = entry_gpa.wrapping_sub(base_gpa).wrapping_add(TRUSTY_EPT_REBASE_GPA);
    if init_secure_world_env(vcpu, vm, rebased_entry, base_hpa, mem_size, rpmb_key) {
        vcpu.arch.cur_context = SECURE_WORLD;
        true
    } else {
        false
    }
}

/// Snapshot the whole secure context (suspend path).
pub fn save_sworld_context(vcpu: &Vcpu, vm: &Vm) {
    let ctx = vcpu.arch.contexts[SECURE_WORLD].clone();
    *vm.sworld_snapshot.lock() = Some(ctx);
}

/// Rebuild the secure EPT and restore the snapshot (resume path).
pub fn restore_sworld_context(vcpu: &mut Vcpu, vm: &Vm) -> Result<(), HvErr> {
    let (gpa, size) = {
        let control = vm.sworld_control.lock();
        (control.memory.base_gpa_in_user_vm, control.memory.length)
    };
    create_secure_world_ept(vm, gpa, size, TRUSTY_EPT_REBASE_GPA)?;

    let snapshot = vm.sworld_snapshot.lock().take().ok_or(HvErr::BadState)?;
    vcpu.arch.contexts[SECURE_WORLD] = snapshot;
    Ok(())
}

const _: () = assert!(size_of::<TrustyKeyInfo>() + size_of::<TrustyStartupParam>() <= 4096);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::fixture_vm;
    use alloc::boxed::Box;

    /// Map `pages` of leaked, page-aligned host memory at `gpa`.
    fn back_guest_range(vm: &Vm, gpa: u64, pages: usize) -> u64 {
        let buf: Box<[u8]> = alloc::vec![0u8; (pages + 1) * 4096].into_boxed_slice();
        let addr = Box::leak(buf).as_ptr() as u64;
        let aligned = (addr + 0xFFF) & !0xFFF;
        vm.ept_add_mr(aligned, gpa, pages as u64 * 4096, EPT_RWX | EPT_WB)
            .unwrap();
        aligned
    }

    fn boot_param_v2(entry: u32, base: u32, size: u32) -> TrustyBootParam {
        TrustyBootParam {
            size_of_this_struct: size_of::<TrustyBootParam>() as u32,
            version: TRUSTY_VERSION_2,
            entry_point: entry,
            base_addr: base,
            mem_size: size,
            rpmb_key: [0xA5; 64],
            ..Default::default()
        }
    }

    #[test]
    fn initialize_carves_rebases_and_switches() {
        let vm = fixture_vm(1);
        let base_gpa = 0x20_0000u64;
        let size = 0x10_0000u32; /* 1 MiB */
        let hpa = back_guest_range(&vm, base_gpa, (size / 4096) as usize);

        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        let param = boot_param_v2(0x28_0000, base_gpa as u32, size);
        assert!(initialize_trusty(vcpu, &vm, &param));

        // The secure range vanished from the normal world.
        assert_eq!(vm.gpa2hpa(base_gpa), INVALID_HPA);
        assert_eq!(vm.gpa2hpa(base_gpa + size as u64 - 1), INVALID_HPA);

        // It reappears at the rebase address in the secure world only.
        let sworld = vm.sworld_ept();
        let guard = sworld.read();
        let sworld_ept = guard.as_ref().unwrap();
        assert_eq!(sworld_ept.gpa2hpa(TRUSTY_EPT_REBASE_GPA), hpa);

        // Entry rebasing and the SMC environment.
        assert_eq!(vcpu.arch.cur_context, SECURE_WORLD);
        assert_eq!(
            vcpu.arch.contexts[SECURE_WORLD].run_ctx.rip,
            TRUSTY_EPT_REBASE_GPA + (0x28_0000 - 0x20_0000)
        );
        assert_eq!(
            vcpu.arch.contexts[SECURE_WORLD].run_ctx.rsp,
            TRUSTY_EPT_REBASE_GPA + size as u64
        );
        assert_eq!(
            vcpu.arch.contexts[SECURE_WORLD].run_ctx.gprs.rdi,
            TRUSTY_EPT_REBASE_GPA + size_of::<TrustyKeyInfo>() as u64
        );

        // Key material landed in the first secure page, with the VM-bound
        // derivation rather than the raw seeds.
        // SAFETY: test memory mapped above.
        let key_info = unsafe { &*(hpa as *const TrustyKeyInfo) };
        assert_eq!(key_info.num_seeds, NUM_DSEEDS as u32);
        assert_eq!(key_info.rpmb_key, [0xA5; 64]);
        assert_ne!(key_info.dseed_list[0], [0u8; 64]);
        let startup = unsafe {
            &*((hpa as usize + size_of::<TrustyKeyInfo>()) as *const TrustyStartupParam)
        };
        assert_eq!(startup.mem_size, size);
        assert_eq!(startup.trusty_mem_base, TRUSTY_EPT_REBASE_GPA);

        // Double initialization is refused.
        assert!(!initialize_trusty(vcpu, &vm, &param));
    }

    #[test]
    fn bad_version_is_refused() {
        let vm = fixture_vm(1);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };
        let mut param = boot_param_v2(0, 0, 0x1000);
        param.version = 9;
        assert!(!initialize_trusty(vcpu, &vm, &param));
        assert_eq!(vcpu.arch.cur_context, NORMAL_WORLD);
    }

    #[test]
    fn world_switch_round_trip_preserves_context() {
        let vm = fixture_vm(1);
        let base_gpa = 0x40_0000u64;
        back_guest_range(&vm, base_gpa, 16);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        vcpu.set_gpreg(CpuReg::Rbx, 0x1111);
        vcpu.set_gpreg(CpuReg::Rdi, 0x2222);
        vcpu.set_gpreg(CpuReg::R12, 0x3333);
        vcpu.set_rip(0xAAAA);
        vcpu.arch.guest_msrs[0] = 0x7070;

        let param = boot_param_v2(base_gpa as u32, base_gpa as u32, 0x8000);
        assert!(initialize_trusty(vcpu, &vm, &param));
        assert_eq!(vcpu.arch.cur_context, SECURE_WORLD);

        // First secure entry: RDI carries the startup block, every other
        // GP register starts clean.
        assert_eq!(vcpu.get_gpreg(CpuReg::Rbx), 0);
        assert_eq!(vcpu.get_gpreg(CpuReg::Rdi),
            TRUSTY_EPT_REBASE_GPA + size_of::<TrustyKeyInfo>() as u64);
        assert_eq!(vcpu.get_gpreg(CpuReg::R12), 0);

        // World MSRs were seeded into both worlds.
        assert_eq!(vcpu.arch.contexts[SECURE_WORLD].world_msrs[0], 0x7070);

        // Switch back: the normal world resumes its own registers.
        vcpu.set_gpreg(CpuReg::Rbx, 0x9999);
        switch_world(vcpu, &vm, NORMAL_WORLD);
        assert_eq!(vcpu.arch.cur_context, NORMAL_WORLD);
        assert_eq!(vcpu.get_gpreg(CpuReg::R12), 0x3333);
        // SMC registers followed the switch.
        assert_eq!(vcpu.get_gpreg(CpuReg::Rbx), 0x9999);
        assert_eq!(vcpu.arch.guest_msrs[0], 0x7070);
    }

    #[test]
    fn destroy_restores_normal_world() {
        let vm = fixture_vm(1);
        let base_gpa = 0x60_0000u64;
        let hpa = back_guest_range(&vm, base_gpa, 8);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        // Scribble into the secure page so the scrub is observable.
        let param = boot_param_v2(base_gpa as u32, base_gpa as u32, 0x8000);
        assert!(initialize_trusty(vcpu, &vm, &param));
        // SAFETY: test memory.
        unsafe { *(hpa as *mut u64).add(512) = 0xDEAD_BEEF };

        destroy_secure_world(&vm, true);
        assert!(!vm.has_sworld());
        assert_eq!(vm.gpa2hpa(base_gpa), hpa);
        // Scrubbed.
        let word = unsafe { *(hpa as *const u64).add(512) };
        assert_eq!(word, 0);
    }

    #[test]
    fn snapshot_round_trip() {
        let vm = fixture_vm(1);
        let base_gpa = 0x80_0000u64;
        back_guest_range(&vm, base_gpa, 8);
        let cell = vm.vcpu(0).unwrap();
        // SAFETY: test fixture, vCPU not running.
        let vcpu = unsafe { cell.body_mut() };

        let param = boot_param_v2(base_gpa as u32, base_gpa as u32, 0x8000);
        assert!(initialize_trusty(vcpu, &vm, &param));
        vcpu.arch.contexts[SECURE_WORLD].run_ctx.gprs.r15 = 0xFEED;
        save_sworld_context(vcpu, &vm);

        destroy_secure_world(&vm, false);
        vcpu.arch.contexts[SECURE_WORLD].run_ctx.gprs.r15 = 0;

        restore_sworld_context(vcpu, &vm).unwrap();
        assert_eq!(vcpu.arch.contexts[SECURE_WORLD].run_ctx.gprs.r15, 0xFEED);
        assert!(vm.has_sworld());
    }
}
