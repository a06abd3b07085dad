//! Boot-time probe of the architectural capabilities the engine depends on.
//!
//! The table is filled once on the BSP before any other subsystem starts and
//! is read-only afterwards. Every later `has_cap` query — including the ones
//! gating SMAP `stac`/`clac` and MONITOR/MWAIT — goes through it, so on a
//! machine (or in a hosted test) where `detect` never ran, all capabilities
//! read as absent.

use raw_cpuid::CpuId;
use spin::Once;

use crate::cpuid::{self, cpuid, cpuid_subleaf, FEATURE_WORDS};
use crate::msr::{self, rdmsr};

/* APICv sub-features, split the way the VMX secondary controls report them. */
pub const VAPIC_FEATURE_VIRT_ACCESS: u8 = 1 << 0;
pub const VAPIC_FEATURE_VIRT_REG: u8 = 1 << 1;
pub const VAPIC_FEATURE_INTR_DELIVERY: u8 = 1 << 2;
pub const VAPIC_FEATURE_TPR_SHADOW: u8 = 1 << 3;
pub const VAPIC_FEATURE_POST_INTR: u8 = 1 << 4;
pub const VAPIC_FEATURE_VX2APIC_MODE: u8 = 1 << 5;

/// Features required for the engine to run at all.
pub const APICV_BASIC_FEATURE: u8 =
    VAPIC_FEATURE_TPR_SHADOW | VAPIC_FEATURE_VIRT_ACCESS | VAPIC_FEATURE_VX2APIC_MODE;
/// Enabled together when the platform has them all, otherwise not at all.
pub const APICV_ADVANCED_FEATURE: u8 =
    VAPIC_FEATURE_VIRT_REG | VAPIC_FEATURE_INTR_DELIVERY | VAPIC_FEATURE_POST_INTR;

/* EPT sub-features from MSR_IA32_VMX_EPT_VPID_CAP. */
pub const EPT_FEATURE_EXEC_ONLY: u8 = 1 << 0;
pub const EPT_FEATURE_2MB_PAGE: u8 = 1 << 1;
pub const EPT_FEATURE_1GB_PAGE: u8 = 1 << 2;
pub const EPT_FEATURE_INVEPT_SINGLE: u8 = 1 << 3;
pub const EPT_FEATURE_INVEPT_GLOBAL: u8 = 1 << 4;

const VMX_EPT_VPID_CAP_EXEC_ONLY: u64 = 1 << 0;
const VMX_EPT_VPID_CAP_2MB: u64 = 1 << 16;
const VMX_EPT_VPID_CAP_1GB: u64 = 1 << 17;
const VMX_EPT_VPID_CAP_INVEPT: u64 = 1 << 20;
const VMX_EPT_VPID_CAP_INVEPT_SINGLE: u64 = 1 << 25;
const VMX_EPT_VPID_CAP_INVEPT_GLOBAL: u64 = 1 << 26;
const VMX_EPT_VPID_CAP_INVVPID_SINGLE: u64 = 1 << 41;
const VMX_EPT_VPID_CAP_INVVPID_GLOBAL: u64 = 1 << 42;

/* Secondary processor-based control bits reported in
 * MSR_IA32_VMX_PROCBASED_CTLS2[63:32]. */
const PROCBASED2_VIRT_APIC_ACCESS: u32 = 1 << 0;
const PROCBASED2_EPT: u32 = 1 << 1;
const PROCBASED2_UNRESTRICTED_GUEST: u32 = 1 << 7;
const PROCBASED2_VX2APIC: u32 = 1 << 4;
const PROCBASED2_APIC_REG_VIRT: u32 = 1 << 8;
const PROCBASED2_VIRT_INTR_DELIVERY: u32 = 1 << 9;
const PROCBASED_TPR_SHADOW: u32 = 1 << 21;
const PINBASED_POST_INTR: u32 = 1 << 7;

#[derive(Debug, Clone, Copy)]
pub struct VmxCaps {
    pub basic: u64,
    pub pinbased: u64,
    pub procbased: u64,
    pub procbased2: u64,
    pub exit: u64,
    pub entry: u64,
    pub ept_vpid: u64,
    pub misc: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuCapabilities {
    pub cpuid_leaves: [u32; FEATURE_WORDS],
    pub family: u32,
    pub model: u32,
    pub phys_bits: u8,
    pub virt_bits: u8,
    pub apicv_features: u8,
    pub ept_features: u8,
    pub core_caps: u32,
    pub vmx: VmxCaps,
}

static CPU_CAPS: Once<CpuCapabilities> = Once::new();

impl CpuCapabilities {
    fn empty() -> Self {
        CpuCapabilities {
            cpuid_leaves: [0; FEATURE_WORDS],
            family: 0,
            model: 0,
            phys_bits: 0,
            virt_bits: 0,
            apicv_features: 0,
            ept_features: 0,
            core_caps: 0,
            vmx: VmxCaps {
                basic: 0,
                pinbased: 0,
                procbased: 0,
                procbased2: 0,
                exit: 0,
                entry: 0,
                ept_vpid: 0,
                misc: 0,
                cr0_fixed0: 0,
                cr0_fixed1: 0,
                cr4_fixed0: 0,
                cr4_fixed1: 0,
            },
        }
    }

    pub fn has_cap(&self, feature: u32) -> bool {
        let word = (feature >> 5) as usize;
        let bit = feature & 0x1f;
        word < FEATURE_WORDS && (self.cpuid_leaves[word] & (1 << bit)) != 0
    }

    pub fn has_ept_cap(&self, mask: u8) -> bool {
        (self.ept_features & mask) == mask
    }

    pub fn has_apicv_cap(&self, mask: u8) -> bool {
        (self.apicv_features & mask) == mask
    }

    pub fn has_core_cap(&self, mask: u32) -> bool {
        (self.core_caps & mask) != 0
    }

    /// Goldmont (family 6 model 0x5c) mis-handles MONITOR in root mode.
    pub fn is_apl_platform(&self) -> bool {
        self.family == 6 && self.model == 0x5c
    }
}

/// Probe the boot processor. Idempotent; the first call wins.
pub fn detect() -> &'static CpuCapabilities {
    CPU_CAPS.call_once(|| {
        let mut caps = CpuCapabilities::empty();

        let (_, _, c1, d1) = cpuid(0x1);
        caps.cpuid_leaves[cpuid::FEAT_1_ECX as usize] = c1;
        caps.cpuid_leaves[cpuid::FEAT_1_EDX as usize] = d1;

        let (_, b7, c7, d7) = cpuid_subleaf(0x7, 0);
        caps.cpuid_leaves[cpuid::FEAT_7_0_EBX as usize] = b7;
        caps.cpuid_leaves[cpuid::FEAT_7_0_ECX as usize] = c7;
        caps.cpuid_leaves[cpuid::FEAT_7_0_EDX as usize] = d7;

        let (_, _, ce, de) = cpuid(cpuid::CPUID_EXTEND_FUNCTION_1);
        caps.cpuid_leaves[cpuid::FEAT_8000_0001_ECX as usize] = ce;
        caps.cpuid_leaves[cpuid::FEAT_8000_0001_EDX as usize] = de;

        let (_, _, _, dp) = cpuid(cpuid::CPUID_EXTEND_INVA_TSC);
        caps.cpuid_leaves[cpuid::FEAT_8000_0007_EDX as usize] = dp;

        let (ax, _, _, _) = cpuid_subleaf(0xD, 1);
        caps.cpuid_leaves[cpuid::FEAT_D_1_EAX as usize] = ax;

        let id = CpuId::new();
        if let Some(fi) = id.get_feature_info() {
            caps.family = fi.family_id() as u32;
            caps.model = fi.model_id() as u32;
        }

        let (addr, _, _, _) = cpuid(cpuid::CPUID_EXTEND_ADDRESS_SIZE);
        caps.phys_bits = (addr & 0xff) as u8;
        caps.virt_bits = ((addr >> 8) & 0xff) as u8;

        if caps.has_cap(cpuid::X86_FEATURE_CORE_CAP) {
            caps.core_caps = unsafe { rdmsr(msr::MSR_IA32_CORE_CAPABILITIES) } as u32;
        }

        if caps.has_cap(cpuid::X86_FEATURE_VMX) {
            caps.vmx = VmxCaps {
                basic: unsafe { rdmsr(msr::MSR_IA32_VMX_BASIC) },
                pinbased: unsafe { rdmsr(msr::MSR_IA32_VMX_PINBASED_CTLS) },
                procbased: unsafe { rdmsr(msr::MSR_IA32_VMX_PROCBASED_CTLS) },
                procbased2: unsafe { rdmsr(msr::MSR_IA32_VMX_PROCBASED_CTLS2) },
                exit: unsafe { rdmsr(msr::MSR_IA32_VMX_EXIT_CTLS) },
                entry: unsafe { rdmsr(msr::MSR_IA32_VMX_ENTRY_CTLS) },
                ept_vpid: unsafe { rdmsr(msr::MSR_IA32_VMX_EPT_VPID_CAP) },
                misc: unsafe { rdmsr(msr::MSR_IA32_VMX_MISC) },
                cr0_fixed0: unsafe { rdmsr(msr::MSR_IA32_VMX_CR0_FIXED0) },
                cr0_fixed1: unsafe { rdmsr(msr::MSR_IA32_VMX_CR0_FIXED1) },
                cr4_fixed0: unsafe { rdmsr(msr::MSR_IA32_VMX_CR4_FIXED0) },
                cr4_fixed1: unsafe { rdmsr(msr::MSR_IA32_VMX_CR4_FIXED1) },
            };
            caps.ept_features = ept_features_from(caps.vmx.ept_vpid);
            caps.apicv_features = apicv_features_from(&caps.vmx);
        }

        caps
    })
}

fn ept_features_from(ept_vpid: u64) -> u8 {
    let mut f = 0u8;
    if ept_vpid & VMX_EPT_VPID_CAP_EXEC_ONLY != 0 {
        f |= EPT_FEATURE_EXEC_ONLY;
    }
    if ept_vpid & VMX_EPT_VPID_CAP_2MB != 0 {
        f |= EPT_FEATURE_2MB_PAGE;
    }
    if ept_vpid & VMX_EPT_VPID_CAP_1GB != 0 {
        f |= EPT_FEATURE_1GB_PAGE;
    }
    if ept_vpid & (VMX_EPT_VPID_CAP_INVEPT | VMX_EPT_VPID_CAP_INVEPT_SINGLE) != 0 {
        f |= EPT_FEATURE_INVEPT_SINGLE;
    }
    if ept_vpid & (VMX_EPT_VPID_CAP_INVEPT | VMX_EPT_VPID_CAP_INVEPT_GLOBAL) != 0 {
        f |= EPT_FEATURE_INVEPT_GLOBAL;
    }
    f
}

/// A control bit may be set 1 only if bit 32+X of the capability MSR is 1.
fn ctrl_allowed_1(msr_val: u64, ctrl: u32) -> bool {
    (((msr_val >> 32) as u32) & ctrl) == ctrl
}

fn apicv_features_from(vmx: &VmxCaps) -> u8 {
    let mut f = 0u8;
    if ctrl_allowed_1(vmx.procbased, PROCBASED_TPR_SHADOW) {
        f |= VAPIC_FEATURE_TPR_SHADOW;
    }
    if ctrl_allowed_1(vmx.procbased2, PROCBASED2_VIRT_APIC_ACCESS) {
        f |= VAPIC_FEATURE_VIRT_ACCESS;
    }
    if ctrl_allowed_1(vmx.procbased2, PROCBASED2_VX2APIC) {
        f |= VAPIC_FEATURE_VX2APIC_MODE;
    }
    if ctrl_allowed_1(vmx.procbased2, PROCBASED2_APIC_REG_VIRT) {
        f |= VAPIC_FEATURE_VIRT_REG;
    }
    if ctrl_allowed_1(vmx.procbased2, PROCBASED2_VIRT_INTR_DELIVERY) {
        f |= VAPIC_FEATURE_INTR_DELIVERY;
    }
    if ctrl_allowed_1(vmx.pinbased, PINBASED_POST_INTR) {
        f |= VAPIC_FEATURE_POST_INTR;
    }
    f
}

/// The filled capability table, or a zeroed one when `detect` has not run.
pub fn cpu_caps() -> &'static CpuCapabilities {
    static EMPTY: CpuCapabilities = CpuCapabilities {
        cpuid_leaves: [0; FEATURE_WORDS],
        family: 0,
        model: 0,
        phys_bits: 0,
        virt_bits: 0,
        apicv_features: 0,
        ept_features: 0,
        core_caps: 0,
        vmx: VmxCaps {
            basic: 0,
            pinbased: 0,
            procbased: 0,
            procbased2: 0,
            exit: 0,
            entry: 0,
            ept_vpid: 0,
            misc: 0,
            cr0_fixed0: 0,
            cr0_fixed1: 0,
            cr4_fixed0: 0,
            cr4_fixed1: 0,
        },
    };
    CPU_CAPS.get().unwrap_or(&EMPTY)
}

/// Shorthand over the global table.
pub fn pcpu_has_cap(feature: u32) -> bool {
    cpu_caps().has_cap(feature)
}

/// MONITOR/MWAIT usable in root mode: present and not the known-bad model.
pub fn has_monitor_cap() -> bool {
    let caps = cpu_caps();
    caps.has_cap(cpuid::X86_FEATURE_MONITOR) && !caps.is_apl_platform()
}

/// Fail-stop check of everything the engine depends on.
///
/// Returns the name of the first missing capability.
pub fn check_essential_caps() -> Result<(), &'static str> {
    let caps = cpu_caps();

    let cpu_features: &[(u32, &'static str)] = &[
        (cpuid::X86_FEATURE_LM, "long mode"),
        (cpuid::X86_FEATURE_INVA_TSC, "invariant TSC"),
        (cpuid::X86_FEATURE_TSC_DEADLINE, "TSC deadline"),
        (cpuid::X86_FEATURE_NX, "NX"),
        (cpuid::X86_FEATURE_SMEP, "SMEP"),
        (cpuid::X86_FEATURE_SMAP, "SMAP"),
        (cpuid::X86_FEATURE_MTRR, "MTRR"),
        (cpuid::X86_FEATURE_CLFLUSHOPT, "CLFLUSHOPT"),
        (cpuid::X86_FEATURE_VMX, "VMX"),
        (cpuid::X86_FEATURE_X2APIC, "x2APIC"),
        (cpuid::X86_FEATURE_POPCNT, "POPCNT"),
        (cpuid::X86_FEATURE_SSE, "SSE"),
        (cpuid::X86_FEATURE_RDRAND, "RDRAND"),
        (cpuid::X86_FEATURE_XSAVES, "XSAVES"),
        (cpuid::X86_FEATURE_COMPACTION_EXT, "XSAVE compaction"),
    ];
    for &(f, name) in cpu_features {
        if !caps.has_cap(f) {
            return Err(name);
        }
    }

    if caps.phys_bits == 0 || caps.phys_bits > 52 {
        return Err("physical address width");
    }

    if !is_fast_string_erms_enabled() {
        return Err("fast-string ERMS");
    }

    if !is_vmx_unlocked() {
        return Err("VMX locked off by firmware");
    }

    if !ctrl_allowed_1(caps.vmx.procbased2, PROCBASED2_UNRESTRICTED_GUEST) {
        return Err("unrestricted guest");
    }
    if !ctrl_allowed_1(caps.vmx.procbased2, PROCBASED2_EPT) {
        return Err("EPT");
    }
    if !caps.has_ept_cap(
        EPT_FEATURE_INVEPT_SINGLE | EPT_FEATURE_INVEPT_GLOBAL | EPT_FEATURE_2MB_PAGE,
    ) {
        return Err("INVEPT / EPT large pages");
    }
    if !caps.has_apicv_cap(APICV_BASIC_FEATURE) {
        return Err("APICv basic set");
    }

    Ok(())
}

fn is_fast_string_erms_enabled() -> bool {
    if !pcpu_has_cap(cpuid::X86_FEATURE_ERMS) {
        return false;
    }
    let misc = unsafe { rdmsr(msr::MSR_IA32_MISC_ENABLE) };
    (misc & msr::MSR_IA32_MISC_ENABLE_FAST_STRING) != 0
}

fn is_vmx_unlocked() -> bool {
    let fc = unsafe { rdmsr(msr::MSR_IA32_FEATURE_CONTROL) };
    (fc & msr::MSR_IA32_FEATURE_CONTROL_LOCK) == 0
        || (fc & msr::MSR_IA32_FEATURE_CONTROL_VMX_NO_SMX) != 0
}

/// `true` once the platform qualified for the APICv advanced set.
pub fn is_apicv_advanced_feature_supported() -> bool {
    cpu_caps().has_apicv_cap(APICV_ADVANCED_FEATURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_caps_report_nothing() {
        // detect() is never called in hosted tests; the fallback table must
        // deny every capability so privileged paths stay dormant.
        assert!(!pcpu_has_cap(cpuid::X86_FEATURE_SMAP));
        assert!(!has_monitor_cap());
        assert!(!is_apicv_advanced_feature_supported());
    }

    #[test]
    fn ept_feature_decode() {
        let f = ept_features_from(
            VMX_EPT_VPID_CAP_2MB | VMX_EPT_VPID_CAP_INVEPT | VMX_EPT_VPID_CAP_EXEC_ONLY,
        );
        assert!(f & EPT_FEATURE_2MB_PAGE != 0);
        assert!(f & EPT_FEATURE_EXEC_ONLY != 0);
        assert!(f & EPT_FEATURE_INVEPT_SINGLE != 0);
        assert!(f & EPT_FEATURE_1GB_PAGE == 0);
    }

    #[test]
    fn apicv_basic_from_controls() {
        let mut vmx = cpu_caps().vmx;
        vmx.procbased = (PROCBASED_TPR_SHADOW as u64) << 32;
        vmx.procbased2 =
            ((PROCBASED2_VIRT_APIC_ACCESS | PROCBASED2_VX2APIC) as u64) << 32;
        let f = apicv_features_from(&vmx);
        assert_eq!(f & APICV_BASIC_FEATURE, APICV_BASIC_FEATURE);
        assert_eq!(f & APICV_ADVANCED_FEATURE, 0);
    }
}
