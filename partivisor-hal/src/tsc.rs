//! Time-stamp counter calibration and busy-wait delays.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpuid::cpuid;

/// Calibrated TSC frequency in kHz; a conservative default until the BSP
/// calibrates.
static TSC_KHZ: AtomicU64 = AtomicU64::new(1_000_000);

#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Calibrate from CPUID leaf 15H (crystal) or 16H (brand frequency).
/// Runs once on the BSP; APs inherit the value.
pub fn calibrate_tsc() {
    let (max_leaf, _, _, _) = cpuid(0);
    if max_leaf >= 0x15 {
        let (denom, numer, crystal_hz, _) = cpuid(0x15);
        if denom != 0 && numer != 0 && crystal_hz != 0 {
            let hz = crystal_hz as u64 * numer as u64 / denom as u64;
            TSC_KHZ.store(hz / 1_000, Ordering::Release);
            return;
        }
    }
    if max_leaf >= 0x16 {
        let (base_mhz, _, _, _) = cpuid(0x16);
        if base_mhz != 0 {
            TSC_KHZ.store(base_mhz as u64 * 1_000, Ordering::Release);
        }
    }
}

pub fn tsc_khz() -> u64 {
    TSC_KHZ.load(Ordering::Acquire)
}

pub fn tsc_per_ms() -> u64 {
    tsc_khz()
}

#[inline]
pub fn us_to_ticks(us: u64) -> u64 {
    us * tsc_khz() / 1_000
}

/// Busy-wait for `us` microseconds.
pub fn udelay(us: u64) {
    let deadline = rdtsc().wrapping_add(us_to_ticks(us));
    while (rdtsc().wrapping_sub(deadline) as i64) < 0 {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frequency_converts() {
        assert_eq!(us_to_ticks(1_000), tsc_khz());
    }

    #[test]
    fn udelay_returns() {
        udelay(1);
    }
}
