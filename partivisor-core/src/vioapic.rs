//! Virtual I/O APIC, one per VM.
//!
//! Pin state is an assert counter (`acnt`): shared interrupt lines sum
//! their asserts and deasserts, and a level pin delivers only while the
//! count is positive, the pin unmasked and the previous delivery EOIed
//! (remote-IRR clear). All register state lives under one spinlock taken
//! from both vCPU MMIO exits and hypercall-driven irqline updates.

use spin::Mutex;

use crate::config::{REDIR_ENTRIES_HW, VIOAPIC_BASE, VIOAPIC_RTE_NUM, VIOAPIC_SIZE};
use crate::error::HvErr;
use crate::io_emul::MmioRequest;
use crate::ioreq::IoDirection;
use crate::virq::REQ_TMR_UPDATE;
use crate::vlapic;
use crate::vm::Vm;

/* redirection-table entry fields */
pub const IOAPIC_RTE_INTVEC: u64 = 0xFF;
pub const IOAPIC_RTE_DELMOD: u64 = 0x700;
pub const IOAPIC_RTE_DESTMOD: u64 = 1 << 11;
pub const IOAPIC_RTE_DELIVS: u64 = 1 << 12;
pub const IOAPIC_RTE_INTPOL: u64 = 1 << 13;
pub const IOAPIC_RTE_REM_IRR: u64 = 1 << 14;
pub const IOAPIC_RTE_TRGRLVL: u64 = 1 << 15;
pub const IOAPIC_RTE_INTMASK: u64 = 1 << 16;
pub const IOAPIC_RTE_DEST_SHIFT: u32 = 56;

/// Read-only bits a guest write may not touch.
const RTBL_RO_BITS: u64 = IOAPIC_RTE_REM_IRR | IOAPIC_RTE_DELIVS;
/// Any change outside mask/polarity forces a TMR recompute on all vCPUs.
const NEED_TMR_UPDATE: u64 = !(IOAPIC_RTE_INTMASK | IOAPIC_RTE_INTPOL);

const MASK_ALL_INTERRUPTS: u64 = 0x0001_0000_0001_0000;

/* indirect register numbers */
const IOAPIC_ID: u32 = 0x00;
const IOAPIC_VER: u32 = 0x01;
const IOAPIC_ARB: u32 = 0x02;
const IOAPIC_REDTBL: u32 = 0x10;

/* MMIO window offsets */
const IOAPIC_REGSEL: u64 = 0x00;
const IOAPIC_WINDOW: u64 = 0x10;
const IOAPIC_EOIR: u64 = 0x40;

const MAX_RTE_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqState {
    Assert,
    Deassert,
    Pulse,
}

struct VioapicInner {
    id: u32,
    ioregsel: u32,
    rtbl: [u64; REDIR_ENTRIES_HW],
    /// Sum of pin asserts (+1) and deasserts (-1).
    acnt: [i32; REDIR_ENTRIES_HW],
}

pub struct Vioapic {
    pincount: usize,
    inner: Mutex<VioapicInner>,
}

impl Vioapic {
    pub fn new(is_service_vm: bool) -> Self {
        let pincount = if is_service_vm {
            REDIR_ENTRIES_HW
        } else {
            VIOAPIC_RTE_NUM
        };
        let v = Vioapic {
            pincount,
            inner: Mutex::new(VioapicInner {
                id: 0,
                ioregsel: 0,
                rtbl: [0; REDIR_ENTRIES_HW],
                acnt: [0; REDIR_ENTRIES_HW],
            }),
        };
        v.reset();
        v
    }

    pub fn pincount(&self) -> usize {
        self.pincount
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for pin in 0..self.pincount {
            inner.rtbl[pin] = MASK_ALL_INTERRUPTS;
            inner.acnt[pin] = 0;
        }
        inner.ioregsel = 0;
    }

    pub fn get_rte(&self, pin: usize) -> u64 {
        self.inner.lock().rtbl[pin]
    }

    fn send_intr_locked(inner: &mut VioapicInner, vm: &Vm, pin: usize) {
        let rte = inner.rtbl[pin];
        if rte & IOAPIC_RTE_INTMASK != 0 {
            return;
        }
        let level = rte & IOAPIC_RTE_TRGRLVL != 0;
        if level {
            inner.rtbl[pin] |= IOAPIC_RTE_REM_IRR;
        }
        let phys = rte & IOAPIC_RTE_DESTMOD == 0;
        let delmode = (rte & IOAPIC_RTE_DELMOD) as u32;
        let vector = (rte & IOAPIC_RTE_INTVEC) as u32;
        let dest = (rte >> IOAPIC_RTE_DEST_SHIFT) as u32;
        vlapic::vlapic_deliver_intr(vm, level, dest, phys, delmode, vector);
    }

    fn set_pinstate_locked(inner: &mut VioapicInner, vm: &Vm, pin: usize, asserted: bool) {
        let oldcnt = inner.acnt[pin];
        inner.acnt[pin] += if asserted { 1 } else { -1 };
        let newcnt = inner.acnt[pin];
        if newcnt < 0 {
            crate::pr_err!("vioapic pin{}: bad assert count {}", pin, newcnt);
        }
        if oldcnt == 0 && newcnt == 1 {
            Self::send_intr_locked(inner, vm, pin);
        }
    }

    pub fn set_irqstate(&self, vm: &Vm, irq: u32, state: IrqState) -> Result<(), HvErr> {
        let pin = irq as usize;
        if pin >= self.pincount {
            return Err(HvErr::Inval);
        }
        let mut inner = self.inner.lock();
        match state {
            IrqState::Assert => Self::set_pinstate_locked(&mut inner, vm, pin, true),
            IrqState::Deassert => Self::set_pinstate_locked(&mut inner, vm, pin, false),
            IrqState::Pulse => {
                Self::set_pinstate_locked(&mut inner, vm, pin, true);
                Self::set_pinstate_locked(&mut inner, vm, pin, false);
            }
        }
        Ok(())
    }

    /// Recompute one vCPU's TMR from every pin's trigger mode.
    pub fn update_tmr(&self, vm: &Vm, vcpu_id: u16) {
        let inner = self.inner.lock();
        if let Some(cell) = vm.vcpu(vcpu_id) {
            for pin in 0..self.pincount {
                let rte = inner.rtbl[pin];
                let level = rte & IOAPIC_RTE_TRGRLVL != 0;
                let delmode = (rte & IOAPIC_RTE_DELMOD) as u32;
                let vector = (rte & IOAPIC_RTE_INTVEC) as u32;
                cell.shared.vlapic.set_tmr_one_vec(delmode, vector, level);
            }
            cell.shared.vlapic.batch_update_eoi_exit_bitmap();
        }
    }

    fn indirect_read(&self, inner: &VioapicInner, regnum: u32) -> u32 {
        match regnum {
            IOAPIC_ID => inner.id,
            IOAPIC_VER => ((self.pincount as u32 - 1) << MAX_RTE_SHIFT) | 0x11,
            IOAPIC_ARB => inner.id,
            _ => {
                let span = self.pincount as u32 * 2;
                if (IOAPIC_REDTBL..IOAPIC_REDTBL + span).contains(&regnum) {
                    let off = regnum - IOAPIC_REDTBL;
                    let pin = (off / 2) as usize;
                    if off % 2 != 0 {
                        (inner.rtbl[pin] >> 32) as u32
                    } else {
                        inner.rtbl[pin] as u32
                    }
                } else {
                    0
                }
            }
        }
    }

    fn indirect_write(&self, inner: &mut VioapicInner, vm: &Vm, regnum: u32, data: u32) {
        if regnum == IOAPIC_ID {
            inner.id = data & 0x0F00_0000;
            return;
        }
        let span = self.pincount as u32 * 2;
        if !(IOAPIC_REDTBL..IOAPIC_REDTBL + span).contains(&regnum) {
            return;
        }
        let off = regnum - IOAPIC_REDTBL;
        let pin = (off / 2) as usize;

        let last = inner.rtbl[pin];
        let new = if off % 2 != 0 {
            (last & 0xFFFF_FFFF) | ((data as u64) << 32)
        } else {
            (last & (0xFFFF_FFFF_0000_0000 | RTBL_RO_BITS)) | (data as u64 & !RTBL_RO_BITS)
        };
        let changed = last ^ new;
        inner.rtbl[pin] = new;

        // Trigger-mode or destination edits invalidate every vCPU's TMR.
        if changed & NEED_TMR_UPDATE != 0 {
            vm.foreach_vcpu(|cell| {
                crate::virq::vcpu_make_request(&cell.shared, REQ_TMR_UPDATE);
            });
        }

        // Unmasked, EOIed and still asserted: deliver now.
        if new & IOAPIC_RTE_INTMASK == 0
            && new & IOAPIC_RTE_REM_IRR == 0
            && inner.acnt[pin] > 0
        {
            Self::send_intr_locked(inner, vm, pin);
        }
    }

    /// EOI broadcast from the vLAPIC (or the EOI register): clear
    /// remote-IRR for every matching level pin and re-deliver the still
    /// asserted ones.
    pub fn process_eoi(&self, vm: &Vm, vector: u32) {
        if !(0x10..=0xFF).contains(&vector) {
            crate::pr_err!("vioapic eoi: bad vector {:#x}", vector);
            return;
        }
        let mut inner = self.inner.lock();
        for pin in 0..self.pincount {
            let rte = inner.rtbl[pin];
            if rte & IOAPIC_RTE_REM_IRR == 0 || rte & IOAPIC_RTE_INTVEC != vector as u64 {
                continue;
            }
            inner.rtbl[pin] &= !IOAPIC_RTE_REM_IRR;
            if inner.acnt[pin] > 0 {
                Self::send_intr_locked(&mut inner, vm, pin);
            }
        }
    }

    /// The VM-registered MMIO window handler; 32-bit accesses only.
    pub fn mmio_access(&self, vm: &Vm, req: &mut MmioRequest) -> Result<(), HvErr> {
        if req.size != 4 {
            crate::pr_err!("vioapic: access must be 32-bit");
            return Err(HvErr::Inval);
        }
        let offset = req.address - VIOAPIC_BASE;
        if offset >= VIOAPIC_SIZE {
            return Err(HvErr::Inval);
        }
        let mut inner = self.inner.lock();
        match (offset, req.direction) {
            (IOAPIC_REGSEL, IoDirection::Read) => req.value = inner.ioregsel as u64,
            (IOAPIC_REGSEL, IoDirection::Write) => inner.ioregsel = req.value as u32,
            (IOAPIC_EOIR, IoDirection::Write) => {
                let vector = req.value as u32;
                drop(inner);
                self.process_eoi(vm, vector);
            }
            (IOAPIC_EOIR, IoDirection::Read) => req.value = 0,
            (IOAPIC_WINDOW, IoDirection::Read) => {
                let regnum = inner.ioregsel & 0xFF;
                req.value = self.indirect_read(&inner, regnum) as u64;
            }
            (IOAPIC_WINDOW, IoDirection::Write) => {
                let regnum = inner.ioregsel & 0xFF;
                self.indirect_write(&mut inner, vm, regnum, req.value as u32);
            }
            (_, IoDirection::Read) => req.value = 0,
            (_, IoDirection::Write) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::tests::fixture_vm;

    fn unmasked_edge_rte(vector: u64, dest: u64) -> u64 {
        (dest << IOAPIC_RTE_DEST_SHIFT) | vector
    }

    fn unmasked_level_rte(vector: u64, dest: u64) -> u64 {
        unmasked_edge_rte(vector, dest) | IOAPIC_RTE_TRGRLVL
    }

    fn program_rte(vio: &Vioapic, vm: &Vm, pin: usize, rte: u64) {
        let mut inner = vio.inner.lock();
        let regnum = IOAPIC_REDTBL + pin as u32 * 2;
        vio.indirect_write(&mut inner, vm, regnum + 1, (rte >> 32) as u32);
        vio.indirect_write(&mut inner, vm, regnum, rte as u32);
    }

    #[test]
    fn edge_pulse_delivers_once_per_edge() {
        let vm = fixture_vm(2);
        let vio = vm.vioapic();
        program_rte(vio, &vm, 4, unmasked_edge_rte(0x60, 0));

        vio.set_irqstate(&vm, 4, IrqState::Pulse).unwrap();
        let vlapic = &vm.vcpu(0).unwrap().shared.vlapic;
        assert_eq!(vlapic.pending_intr(), Some(0x60));
        vlapic.intr_accepted(0x60);
        let _ = vlapic.process_eoi();

        vio.set_irqstate(&vm, 4, IrqState::Pulse).unwrap();
        assert_eq!(vlapic.pending_intr(), Some(0x60));
    }

    #[test]
    fn masked_pin_blocks_delivery() {
        let vm = fixture_vm(1);
        let vio = vm.vioapic();
        program_rte(vio, &vm, 2, unmasked_edge_rte(0x61, 0) | IOAPIC_RTE_INTMASK);
        vio.set_irqstate(&vm, 2, IrqState::Assert).unwrap();
        assert_eq!(vm.vcpu(0).unwrap().shared.vlapic.pending_intr(), None);
    }

    #[test]
    fn level_gated_on_remote_irr_until_eoi() {
        let vm = fixture_vm(1);
        let vio = vm.vioapic();
        program_rte(vio, &vm, 5, unmasked_level_rte(0x62, 0));

        vio.set_irqstate(&vm, 5, IrqState::Assert).unwrap();
        assert!(vio.get_rte(5) & IOAPIC_RTE_REM_IRR != 0);

        let vlapic = &vm.vcpu(0).unwrap().shared.vlapic;
        vlapic.intr_accepted(vlapic.pending_intr().unwrap());

        // Second asserter while in flight: coalesced by acnt, no re-deliver.
        vio.set_irqstate(&vm, 5, IrqState::Assert).unwrap();
        let (vec, level) = vlapic.process_eoi().unwrap();
        assert_eq!(vec, 0x62);
        assert!(level);

        // EOI with the line still asserted re-raises remote IRR.
        vio.process_eoi(&vm, 0x62);
        assert!(vio.get_rte(5) & IOAPIC_RTE_REM_IRR != 0);
        assert_eq!(vlapic.pending_intr(), Some(0x62));
    }

    #[test]
    fn deassert_below_zero_is_reported_not_fatal() {
        let vm = fixture_vm(1);
        let vio = vm.vioapic();
        program_rte(vio, &vm, 1, unmasked_edge_rte(0x63, 0));
        vio.set_irqstate(&vm, 1, IrqState::Deassert).unwrap();
        assert!(vio.set_irqstate(&vm, 999, IrqState::Assert).is_err());
    }

    #[test]
    fn rte_write_changing_trigger_mode_requests_tmr_update() {
        let vm = fixture_vm(2);
        let vio = vm.vioapic();
        program_rte(vio, &vm, 3, unmasked_level_rte(0x64, 0));
        vm.foreach_vcpu(|cell| {
            let pending = cell.shared.pending_req.load(core::sync::atomic::Ordering::SeqCst);
            assert!(pending & (1 << REQ_TMR_UPDATE) != 0);
        });
    }

    #[test]
    fn window_readback_matches_programmed_rte() {
        let vm = fixture_vm(1);
        let vio = vm.vioapic();
        let rte = unmasked_level_rte(0x65, 0);
        program_rte(vio, &vm, 7, rte);

        let mut req = MmioRequest {
            direction: IoDirection::Write,
            address: VIOAPIC_BASE + IOAPIC_REGSEL,
            size: 4,
            value: (IOAPIC_REDTBL + 14) as u64,
        };
        vio.mmio_access(&vm, &mut req).unwrap();
        let mut read = MmioRequest {
            direction: IoDirection::Read,
            address: VIOAPIC_BASE + IOAPIC_WINDOW,
            size: 4,
            value: 0,
        };
        vio.mmio_access(&vm, &mut read).unwrap();
        assert_eq!(read.value as u32, rte as u32);
    }
}
