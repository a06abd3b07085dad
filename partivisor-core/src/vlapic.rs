//! Virtual local APIC, exposed to guests in x2APIC mode only.
//!
//! IRR and TMR are atomic bitmaps because any vCPU (or the vIOAPIC under
//! its own lock) may inject into a peer; ISR, PPR and the register file are
//! owned by the target vCPU and sit behind a spinlock. Acceptance order
//! follows the architectural rule: a vector moves IRR→ISR only when it
//! outranks the processor priority.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::vcpu::VcpuShared;
use crate::virq::{self, REQ_EVENT};
use crate::vm::Vm;

/* delivery modes, ICR/RTE encoding */
pub const APIC_DELMODE_FIXED: u32 = 0x000;
pub const APIC_DELMODE_LOWPRIO: u32 = 0x100;
pub const APIC_DELMODE_SMI: u32 = 0x200;
pub const APIC_DELMODE_NMI: u32 = 0x400;
pub const APIC_DELMODE_INIT: u32 = 0x500;
pub const APIC_DELMODE_STARTUP: u32 = 0x600;
pub const APIC_DELMODE_EXTINT: u32 = 0x700;
pub const APIC_DELMODE_MASK: u32 = 0x700;

const APIC_ICR_DEST_SHORTHAND_SHIFT: u32 = 18;
const APIC_ICR_LEVEL_ASSERT: u64 = 1 << 14;
const APIC_DESTMODE_LOGICAL: u64 = 1 << 11;

pub const APIC_SVR_ENABLE: u32 = 1 << 8;
const APIC_LVT_MASKED: u32 = 1 << 16;
const APIC_VERSION: u32 = 0x16 | (6 << 16); /* version 0x16, 7 LVT entries */

const VECTOR_BITMAP_WORDS: usize = 8;

/// Broadcast destination id in x2APIC mode.
const X2APIC_BCAST_DEST: u32 = 0xFFFF_FFFF;

fn vec_word(vector: u32) -> usize {
    (vector as usize >> 5) & 0x7
}

fn vec_mask(vector: u32) -> u32 {
    1u32 << (vector & 0x1F)
}

#[derive(Default)]
struct LapicPage {
    isr: [u32; VECTOR_BITMAP_WORDS],
    tpr: u32,
    ppr: u32,
    svr: u32,
    ldr: u32,
    esr: u32,
    icr: u64,
    lvt_timer: u32,
    lvt_thermal: u32,
    lvt_pmi: u32,
    lvt_lint0: u32,
    lvt_lint1: u32,
    lvt_error: u32,
    lvt_cmci: u32,
    timer_icr: u32,
    timer_dcr: u32,
    /// Highest vector currently in service, 0 when none.
    isrv: u32,
}

pub struct Vlapic {
    pub vm_id: u16,
    pub vcpu_id: u16,
    apic_id: u32,
    regs: Mutex<LapicPage>,
    irr: [AtomicU32; VECTOR_BITMAP_WORDS],
    tmr: [AtomicU32; VECTOR_BITMAP_WORDS],
    /// Mirror of the VMCS EOI-exit bitmap, rebuilt on demand.
    eoi_exit_bitmap: [AtomicU64; 4],
}

impl Vlapic {
    pub fn new(vm_id: u16, vcpu_id: u16, apic_id: u32) -> Self {
        const ZERO32: AtomicU32 = AtomicU32::new(0);
        const ZERO64: AtomicU64 = AtomicU64::new(0);
        let vlapic = Vlapic {
            vm_id,
            vcpu_id,
            apic_id,
            regs: Mutex::new(LapicPage::default()),
            irr: [ZERO32; VECTOR_BITMAP_WORDS],
            tmr: [ZERO32; VECTOR_BITMAP_WORDS],
            eoi_exit_bitmap: [ZERO64; 4],
        };
        vlapic.reset();
        vlapic
    }

    pub fn reset(&self) {
        let mut regs = self.regs.lock();
        *regs = LapicPage::default();
        regs.svr = 0xFF; /* spurious vector, APIC soft-disabled */
        regs.lvt_timer = APIC_LVT_MASKED;
        regs.lvt_thermal = APIC_LVT_MASKED;
        regs.lvt_pmi = APIC_LVT_MASKED;
        regs.lvt_lint0 = APIC_LVT_MASKED;
        regs.lvt_lint1 = APIC_LVT_MASKED;
        regs.lvt_error = APIC_LVT_MASKED;
        regs.lvt_cmci = APIC_LVT_MASKED;
        drop(regs);
        for w in &self.irr {
            w.store(0, Ordering::Release);
        }
        for w in &self.tmr {
            w.store(0, Ordering::Release);
        }
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.lock().svr & APIC_SVR_ENABLE != 0
    }

    /// x2APIC logical destination register value: cluster in the high
    /// half, 1-of-16 mask in the low half.
    fn x2apic_ldr(&self) -> u32 {
        ((self.apic_id >> 4) << 16) | (1u32 << (self.apic_id & 0xF))
    }

    /// Post one vector into IRR, recording its trigger mode. Returns true
    /// when the caller must notify the owning vCPU.
    pub fn accept_intr(&self, vector: u32, level: bool) -> bool {
        debug_assert!(vector < 256);
        let word = vec_word(vector);
        let mask = vec_mask(vector);
        if level {
            self.tmr[word].fetch_or(mask, Ordering::AcqRel);
        } else {
            self.tmr[word].fetch_and(!mask, Ordering::AcqRel);
        }
        let prev = self.irr[word].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    fn highest_irr(&self) -> Option<u32> {
        for word in (0..VECTOR_BITMAP_WORDS).rev() {
            let w = self.irr[word].load(Ordering::Acquire);
            if w != 0 {
                return Some((word as u32) << 5 | (31 - w.leading_zeros()));
            }
        }
        None
    }

    /// Processor priority: the higher class of TPR and the in-service
    /// vector.
    fn ppr_locked(regs: &mut LapicPage) -> u32 {
        let isr_class = regs.isrv & 0xF0;
        if (regs.tpr & 0xF0) >= isr_class {
            regs.ppr = regs.tpr;
        } else {
            regs.ppr = isr_class;
        }
        regs.ppr
    }

    /// Highest pending vector that outranks PPR, if any. Does not alter
    /// any state.
    pub fn pending_intr(&self) -> Option<u32> {
        let vector = self.highest_irr()?;
        let mut regs = self.regs.lock();
        let ppr = Self::ppr_locked(&mut regs);
        if (vector & 0xF0) > (ppr & 0xF0) {
            Some(vector)
        } else {
            None
        }
    }

    /// `true` when anything is pending in IRR regardless of priority.
    pub fn has_pending_intr(&self) -> bool {
        self.highest_irr().is_some()
    }

    /// Move `vector` IRR→ISR: the architectural INTA cycle.
    pub fn intr_accepted(&self, vector: u32) {
        let word = vec_word(vector);
        let mask = vec_mask(vector);
        self.irr[word].fetch_and(!mask, Ordering::AcqRel);
        let mut regs = self.regs.lock();
        regs.isr[word] |= mask;
        if vector > regs.isrv {
            regs.isrv = vector;
        }
        Self::ppr_locked(&mut regs);
    }

    /// Retire the highest in-service vector. Returns the vector and whether
    /// it was level-triggered (so the caller can forward EOI to the
    /// vIOAPIC).
    pub fn process_eoi(&self) -> Option<(u32, bool)> {
        let mut regs = self.regs.lock();
        if regs.isrv == 0 {
            return None;
        }
        let vector = regs.isrv;
        let word = vec_word(vector);
        regs.isr[word] &= !vec_mask(vector);
        regs.isrv = Self::highest_isr_locked(&regs);
        Self::ppr_locked(&mut regs);
        drop(regs);
        let level = self.tmr[word].load(Ordering::Acquire) & vec_mask(vector) != 0;
        Some((vector, level))
    }

    fn highest_isr_locked(regs: &LapicPage) -> u32 {
        for word in (0..VECTOR_BITMAP_WORDS).rev() {
            let w = regs.isr[word];
            if w != 0 {
                return (word as u32) << 5 | (31 - w.leading_zeros());
            }
        }
        0
    }

    /// Record one vector's trigger mode for the TMR recompute sweep.
    pub fn set_tmr_one_vec(&self, delmode: u32, vector: u32, level: bool) {
        if delmode == APIC_DELMODE_FIXED && vector >= 16 {
            let word = vec_word(vector);
            let mask = vec_mask(vector);
            if level {
                self.tmr[word].fetch_or(mask, Ordering::AcqRel);
            } else {
                self.tmr[word].fetch_and(!mask, Ordering::AcqRel);
            }
        }
    }

    /// Fold the TMR into the EOI-exit bitmap mirror; the pending-request
    /// pipeline writes it to the VMCS on the owning pCPU.
    pub fn batch_update_eoi_exit_bitmap(&self) {
        for i in 0..4 {
            let lo = self.tmr[i * 2].load(Ordering::Acquire) as u64;
            let hi = self.tmr[i * 2 + 1].load(Ordering::Acquire) as u64;
            self.eoi_exit_bitmap[i].store(lo | (hi << 32), Ordering::Release);
        }
    }

    pub fn eoi_exit_bitmap(&self, idx: usize) -> u64 {
        self.eoi_exit_bitmap[idx].load(Ordering::Acquire)
    }

    fn matches_dest(&self, dest: u32, phys: bool) -> bool {
        if dest == X2APIC_BCAST_DEST {
            return true;
        }
        if phys {
            dest == self.apic_id
        } else {
            let ldr = self.x2apic_ldr();
            ((dest >> 16) == (ldr >> 16)) && (dest & ldr & 0xFFFF) != 0
        }
    }

    /* ---------- x2APIC MSR interface ---------- */

    pub fn read_msr(&self, msr: u32) -> Result<u64, ()> {
        use partivisor_hal::msr::*;
        let regs = self.regs.lock();
        let v = match msr {
            MSR_IA32_EXT_XAPICID => self.apic_id as u64,
            MSR_IA32_EXT_APIC_VERSION => APIC_VERSION as u64,
            MSR_IA32_EXT_APIC_TPR => regs.tpr as u64,
            MSR_IA32_EXT_APIC_PPR => {
                let mut regs = regs;
                Self::ppr_locked(&mut regs) as u64
            }
            MSR_IA32_EXT_APIC_LDR => self.x2apic_ldr() as u64,
            MSR_IA32_EXT_APIC_SIVR => regs.svr as u64,
            MSR_IA32_EXT_APIC_ESR => regs.esr as u64,
            MSR_IA32_EXT_APIC_ICR => regs.icr,
            MSR_IA32_EXT_APIC_LVT_CMCI => regs.lvt_cmci as u64,
            MSR_IA32_EXT_APIC_LVT_TIMER => regs.lvt_timer as u64,
            MSR_IA32_EXT_APIC_LVT_THERMAL => regs.lvt_thermal as u64,
            MSR_IA32_EXT_APIC_LVT_PMI => regs.lvt_pmi as u64,
            MSR_IA32_EXT_APIC_LVT_LINT0 => regs.lvt_lint0 as u64,
            MSR_IA32_EXT_APIC_LVT_LINT1 => regs.lvt_lint1 as u64,
            MSR_IA32_EXT_APIC_LVT_ERROR => regs.lvt_error as u64,
            MSR_IA32_EXT_APIC_INIT_COUNT => regs.timer_icr as u64,
            MSR_IA32_EXT_APIC_CUR_COUNT => 0,
            MSR_IA32_EXT_APIC_DIV_CONF => regs.timer_dcr as u64,
            m if (MSR_IA32_EXT_APIC_ISR0..MSR_IA32_EXT_APIC_ISR0 + 8).contains(&m) => {
                regs.isr[(m - MSR_IA32_EXT_APIC_ISR0) as usize] as u64
            }
            m if (MSR_IA32_EXT_APIC_TMR0..MSR_IA32_EXT_APIC_TMR0 + 8).contains(&m) => {
                self.tmr[(m - MSR_IA32_EXT_APIC_TMR0) as usize].load(Ordering::Acquire)
                    as u64
            }
            m if (MSR_IA32_EXT_APIC_IRR0..MSR_IA32_EXT_APIC_IRR0 + 8).contains(&m) => {
                self.irr[(m - MSR_IA32_EXT_APIC_IRR0) as usize].load(Ordering::Acquire)
                    as u64
            }
            _ => return Err(()),
        };
        Ok(v)
    }

    /// Write side of the x2APIC window. `EOI`, `ICR` and self-IPI have side
    /// effects beyond the register file and are routed by the caller
    /// through the module-level helpers.
    pub fn write_msr(&self, msr: u32, value: u64) -> Result<(), ()> {
        use partivisor_hal::msr::*;
        let mut regs = self.regs.lock();
        match msr {
            MSR_IA32_EXT_APIC_TPR => regs.tpr = value as u32 & 0xFF,
            MSR_IA32_EXT_APIC_SIVR => regs.svr = value as u32,
            MSR_IA32_EXT_APIC_ESR => regs.esr = 0,
            MSR_IA32_EXT_APIC_LVT_CMCI => regs.lvt_cmci = value as u32,
            MSR_IA32_EXT_APIC_LVT_TIMER => regs.lvt_timer = value as u32,
            MSR_IA32_EXT_APIC_LVT_THERMAL => regs.lvt_thermal = value as u32,
            MSR_IA32_EXT_APIC_LVT_PMI => regs.lvt_pmi = value as u32,
            MSR_IA32_EXT_APIC_LVT_LINT0 => regs.lvt_lint0 = value as u32,
            MSR_IA32_EXT_APIC_LVT_LINT1 => regs.lvt_lint1 = value as u32,
            MSR_IA32_EXT_APIC_LVT_ERROR => regs.lvt_error = value as u32,
            MSR_IA32_EXT_APIC_INIT_COUNT => regs.timer_icr = value as u32,
            MSR_IA32_EXT_APIC_DIV_CONF => regs.timer_dcr = value as u32 & 0xB,
            MSR_IA32_EXT_APIC_ICR => regs.icr = value,
            _ => return Err(()),
        }
        Ok(())
    }
}

/// Inject a fixed-mode vector into one vCPU and notify it. A vector that
/// coalesced into an already-pending IRR bit still kicks the target so the
/// interrupt-window logic re-evaluates.
pub fn vlapic_set_intr(shared: &VcpuShared, vector: u32, level: bool) {
    shared.vlapic.accept_intr(vector, level);
    virq::vcpu_make_request(shared, REQ_EVENT);
}

/// Deliver one interrupt message to every matching vLAPIC of `vm`.
pub fn vlapic_deliver_intr(
    vm: &Vm,
    level: bool,
    dest: u32,
    phys: bool,
    delmode: u32,
    vector: u32,
) {
    match delmode {
        APIC_DELMODE_FIXED | APIC_DELMODE_LOWPRIO => {
            if vector < 16 {
                return;
            }
            let mut lowprio_pick: Option<u16> = None;
            vm.foreach_vcpu(|cell| {
                if cell.shared.vlapic.matches_dest(dest, phys) {
                    if delmode == APIC_DELMODE_LOWPRIO {
                        // Without APR tracking, lowest-priority collapses to
                        // round-robin-by-first-match.
                        if lowprio_pick.is_none() {
                            lowprio_pick = Some(cell.shared.vcpu_id);
                            vlapic_set_intr(&cell.shared, vector, level);
                        }
                    } else {
                        vlapic_set_intr(&cell.shared, vector, level);
                    }
                }
            });
        }
        APIC_DELMODE_NMI => {
            vm.foreach_vcpu(|cell| {
                if cell.shared.vlapic.matches_dest(dest, phys) {
                    virq::vcpu_inject_nmi(&cell.shared);
                }
            });
        }
        APIC_DELMODE_EXTINT => {
            // ExtINT rides the PIC wire into the boot vCPU.
            if let Some(cell) = vm.vcpu(0) {
                virq::vcpu_inject_extint(&cell.shared);
            }
        }
        _ => {
            crate::pr_err!(
                "vm{}: unsupported delivery mode {:#x} for vector {:#x}",
                vm.vm_id,
                delmode,
                vector
            );
        }
    }
}

/// Side-effect half of an x2APIC ICR write: resolve the destination
/// shorthand and deliver.
pub fn vlapic_icr_write(vm: &Vm, sender: &VcpuShared, icr: u64) {
    let vector = (icr & 0xFF) as u32;
    let delmode = (icr & 0x700) as u32;
    let phys = icr & APIC_DESTMODE_LOGICAL == 0;
    let shorthand = ((icr >> APIC_ICR_DEST_SHORTHAND_SHIFT) & 0x3) as u32;
    let dest = (icr >> 32) as u32;
    let _ = icr & APIC_ICR_LEVEL_ASSERT;

    match shorthand {
        0 => match delmode {
            APIC_DELMODE_INIT | APIC_DELMODE_STARTUP => {
                crate::vm::vlapic_process_init_sipi(vm, dest, delmode, vector);
            }
            _ => vlapic_deliver_intr(vm, false, dest, phys, delmode, vector),
        },
        1 => {
            // self
            vlapic_set_intr(sender, vector, false);
        }
        2 => {
            // all including self
            vlapic_deliver_intr(vm, false, X2APIC_BCAST_DEST, true, delmode, vector);
        }
        _ => {
            // all excluding self
            vm.foreach_vcpu(|cell| {
                if cell.shared.vcpu_id != sender.vcpu_id {
                    vlapic_set_intr(&cell.shared, vector, false);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lapic() -> Vlapic {
        Vlapic::new(0, 0, 0)
    }

    #[test]
    fn accept_and_pending_respect_tpr() {
        let v = lapic();
        assert!(v.accept_intr(0x31, false));
        assert_eq!(v.pending_intr(), Some(0x31));

        // TPR raised above the vector class gates delivery.
        v.write_msr(partivisor_hal::msr::MSR_IA32_EXT_APIC_TPR, 0x40).unwrap();
        assert_eq!(v.pending_intr(), None);
        v.write_msr(partivisor_hal::msr::MSR_IA32_EXT_APIC_TPR, 0x20).unwrap();
        assert_eq!(v.pending_intr(), Some(0x31));
    }

    #[test]
    fn irr_to_isr_to_eoi_cycle() {
        let v = lapic();
        v.accept_intr(0x55, false);
        v.accept_intr(0x31, false);

        let vec = v.pending_intr().unwrap();
        assert_eq!(vec, 0x55);
        v.intr_accepted(vec);

        // Lower-priority vector is now blocked by PPR.
        assert_eq!(v.pending_intr(), None);

        let (retired, level) = v.process_eoi().unwrap();
        assert_eq!(retired, 0x55);
        assert!(!level);

        // EOI unblocks the lower vector.
        assert_eq!(v.pending_intr(), Some(0x31));
    }

    #[test]
    fn in_service_ordering_never_loses_high_vector() {
        let v = lapic();
        v.accept_intr(0x81, false);
        let first = v.pending_intr().unwrap();
        v.intr_accepted(first);
        v.accept_intr(0x91, false);
        // Higher class beats the in-service 0x81.
        assert_eq!(v.pending_intr(), Some(0x91));
        v.intr_accepted(0x91);
        assert_eq!(v.process_eoi().unwrap().0, 0x91);
        assert_eq!(v.process_eoi().unwrap().0, 0x81);
        assert!(v.process_eoi().is_none());
    }

    #[test]
    fn level_triggered_reported_at_eoi() {
        let v = lapic();
        v.accept_intr(0x44, true);
        v.intr_accepted(0x44);
        let (vec, level) = v.process_eoi().unwrap();
        assert_eq!(vec, 0x44);
        assert!(level);
    }

    #[test]
    fn tmr_folds_into_eoi_exit_bitmap() {
        let v = lapic();
        v.set_tmr_one_vec(APIC_DELMODE_FIXED, 0x21, true);
        v.set_tmr_one_vec(APIC_DELMODE_FIXED, 0x41, true);
        v.batch_update_eoi_exit_bitmap();
        assert_eq!(v.eoi_exit_bitmap(0), (1u64 << 0x21) | (1u64 << 0x41));
        v.set_tmr_one_vec(APIC_DELMODE_FIXED, 0x21, false);
        v.batch_update_eoi_exit_bitmap();
        assert_eq!(v.eoi_exit_bitmap(0), 1u64 << 0x41);
    }

    #[test]
    fn physical_and_logical_destinations() {
        let v = Vlapic::new(0, 3, 3);
        assert!(v.matches_dest(3, true));
        assert!(!v.matches_dest(4, true));
        assert!(v.matches_dest(X2APIC_BCAST_DEST, true));
        // logical: cluster 0, bit 3
        assert!(v.matches_dest(1 << 3, false));
        assert!(!v.matches_dest(1 << 2, false));
    }

    #[test]
    fn x2apic_window_read_write() {
        use partivisor_hal::msr::*;
        let v = lapic();
        v.write_msr(MSR_IA32_EXT_APIC_SIVR, (APIC_SVR_ENABLE | 0xFF) as u64)
            .unwrap();
        assert!(v.is_enabled());
        assert_eq!(v.read_msr(MSR_IA32_EXT_XAPICID).unwrap(), 0);
        assert!(v.read_msr(0x9999).is_err());
        v.accept_intr(0x23, false);
        assert_eq!(
            v.read_msr(MSR_IA32_EXT_APIC_IRR0 + 1).unwrap(),
            1u64 << 3
        );
    }
}
