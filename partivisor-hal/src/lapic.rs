//! Physical local APIC access, x2APIC mode only.

use crate::msr::{
    rdmsr, wrmsr, MSR_IA32_APIC_BASE, MSR_IA32_EXT_APIC_EOI, MSR_IA32_EXT_APIC_ICR,
    MSR_IA32_EXT_APIC_SIVR, MSR_IA32_EXT_XAPICID,
};

const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const APIC_BASE_XAPIC_ENABLE: u64 = 1 << 11;

/* ICR delivery modes */
const ICR_DELMODE_FIXED: u64 = 0x000;
const ICR_DELMODE_INIT: u64 = 0x500;
const ICR_DELMODE_STARTUP: u64 = 0x600;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_TRIGGER_LEVEL: u64 = 1 << 15;
const ICR_DEST_SHIFT: u32 = 32;

const APIC_SIVR_ENABLED: u64 = 1 << 8;
const APIC_SPURIOUS_VECTOR: u64 = 0xFF;

/// Switch the local APIC to x2APIC mode and enable it.
///
/// # Safety
/// CPL0, once per processor during bring-up.
pub unsafe fn early_init_lapic() {
    unsafe {
        let base = rdmsr(MSR_IA32_APIC_BASE);
        wrmsr(
            MSR_IA32_APIC_BASE,
            base | APIC_BASE_XAPIC_ENABLE | APIC_BASE_X2APIC_ENABLE,
        );
        wrmsr(MSR_IA32_EXT_APIC_SIVR, APIC_SIVR_ENABLED | APIC_SPURIOUS_VECTOR);
    }
}

/// LAPIC id of the calling processor.
///
/// # Safety
/// CPL0 with x2APIC enabled.
pub unsafe fn get_cur_lapic_id() -> u32 {
    (unsafe { rdmsr(MSR_IA32_EXT_XAPICID) }) as u32
}

/// Fixed-mode IPI to one LAPIC id. In x2APIC mode the ICR is a single
/// 64-bit MSR write; no delivery-status poll is architected or needed.
///
/// # Safety
/// CPL0 with x2APIC enabled.
pub unsafe fn send_single_ipi(dest_lapic_id: u32, vector: u32) {
    let icr = ((dest_lapic_id as u64) << ICR_DEST_SHIFT)
        | ICR_DELMODE_FIXED
        | (vector as u64 & 0xFF);
    unsafe { wrmsr(MSR_IA32_EXT_APIC_ICR, icr) };
}

/// INIT-SIPI-SIPI to wake one application processor.
///
/// `startup_vector` is the page number of the real-mode trampoline.
///
/// # Safety
/// CPL0 with x2APIC enabled; the trampoline must be in place.
pub unsafe fn send_startup_ipi(dest_lapic_id: u32, startup_vector: u8) {
    let dest = (dest_lapic_id as u64) << ICR_DEST_SHIFT;
    unsafe {
        wrmsr(
            MSR_IA32_EXT_APIC_ICR,
            dest | ICR_DELMODE_INIT | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL,
        );
        crate::tsc::udelay(10_000);
        wrmsr(MSR_IA32_EXT_APIC_ICR, dest | ICR_DELMODE_STARTUP | startup_vector as u64);
        crate::tsc::udelay(200);
        wrmsr(MSR_IA32_EXT_APIC_ICR, dest | ICR_DELMODE_STARTUP | startup_vector as u64);
    }
}

/// Signal end-of-interrupt on the physical LAPIC.
///
/// # Safety
/// CPL0 with x2APIC enabled.
pub unsafe fn lapic_eoi() {
    unsafe { wrmsr(MSR_IA32_EXT_APIC_EOI, 0) };
}
