//! Decode of the memory-access instructions that reach MMIO emulation.
//!
//! Only the mov family lands on emulated MMIO in practice; anything else
//! is refused and the access is reported undecodable. The effective
//! address is never computed here — hardware already delivered the
//! faulting GPA — so decode only has to recover direction, operand size,
//! the register (or immediate) involved, and any extension rule.

use crate::error::HvErr;
use crate::guest_memory::{self, PAGE_FAULT_ID_FLAG};
use crate::vcpu::{CpuReg, Vcpu};
use crate::virq;
use crate::vm::Vm;

/// Longest instruction we will ever fetch.
pub const MAX_INSTR_BYTES: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovKind {
    /// MOV mem, reg
    ToMem,
    /// MOV reg, mem
    FromMem,
    /// MOV mem, imm
    ImmToMem(u64),
    /// MOVZX reg, mem
    ZeroExtend,
    /// MOVSX reg, mem
    SignExtend,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodedInstr {
    pub kind: MovKind,
    /// Memory operand width in bytes.
    pub opsize: usize,
    /// Destination register width for the extend forms.
    pub regsize: usize,
    pub reg: CpuReg,
}

fn reg_from_index(index: u8) -> CpuReg {
    // Same ordering as the hardware GPR block.
    const REGS: [CpuReg; 16] = [
        CpuReg::Rax,
        CpuReg::Rcx,
        CpuReg::Rdx,
        CpuReg::Rbx,
        CpuReg::Rsp,
        CpuReg::Rbp,
        CpuReg::Rsi,
        CpuReg::Rdi,
        CpuReg::R8,
        CpuReg::R9,
        CpuReg::R10,
        CpuReg::R11,
        CpuReg::R12,
        CpuReg::R13,
        CpuReg::R14,
        CpuReg::R15,
    ];
    REGS[(index & 0xF) as usize]
}

/// Swallow the ModRM byte plus any SIB/displacement it implies; returns
/// (reg_field, bytes_consumed).
fn parse_modrm(bytes: &[u8], rex_r: bool, rex_b: bool) -> Result<(u8, usize), HvErr> {
    use bit_field::BitField;
    let modrm = *bytes.first().ok_or(HvErr::Inval)?;
    let md = modrm.get_bits(6..8);
    let reg = modrm.get_bits(3..6);
    let rm = modrm.get_bits(0..3);
    let _ = rex_b;
    if md == 3 {
        // Register-direct never faults on memory.
        return Err(HvErr::Inval);
    }
    let mut len = 1;
    if rm == 4 {
        len += 1; // SIB
    }
    match md {
        0 => {
            if rm == 5 {
                len += 4; // RIP-relative disp32
            }
        }
        1 => len += 1,
        2 => len += 4,
        _ => unreachable!(),
    }
    let reg_index = reg | if rex_r { 0x8 } else { 0 };
    Ok((reg_index, len))
}

/// Pure decode over raw instruction bytes.
pub fn parse(bytes: &[u8]) -> Result<DecodedInstr, HvErr> {
    let mut i = 0;
    let mut opsize_override = false;
    let mut rex: u8 = 0;

    // Legacy prefixes, then REX.
    while i < bytes.len() {
        match bytes[i] {
            0x66 => {
                opsize_override = true;
                i += 1;
            }
            0x67 | 0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {
                i += 1;
            }
            0x40..=0x4F => {
                rex = bytes[i];
                i += 1;
                break;
            }
            _ => break,
        }
    }

    let rex_w = rex & 0x8 != 0;
    let rex_r = rex & 0x4 != 0;
    let rex_b = rex & 0x1 != 0;
    let opsize = if rex_w {
        8
    } else if opsize_override {
        2
    } else {
        4
    };

    let op = *bytes.get(i).ok_or(HvErr::Inval)?;
    i += 1;

    match op {
        0x88 | 0x89 | 0x8A | 0x8B => {
            let (reg, consumed) = parse_modrm(&bytes[i..], rex_r, rex_b)?;
            let _ = consumed;
            let size = if op & 1 == 0 { 1 } else { opsize };
            let kind = if op < 0x8A {
                MovKind::ToMem
            } else {
                MovKind::FromMem
            };
            Ok(DecodedInstr {
                kind,
                opsize: size,
                regsize: size,
                reg: reg_from_index(reg),
            })
        }
        0xC6 | 0xC7 => {
            let (_, consumed) = parse_modrm(&bytes[i..], rex_r, rex_b)?;
            i += consumed;
            let size = if op == 0xC6 { 1 } else { opsize };
            // Immediate is 1/2/4 bytes; a REX.W form sign-extends imm32.
            let imm_len = size.min(4);
            let imm_bytes = bytes.get(i..i + imm_len).ok_or(HvErr::Inval)?;
            let mut imm = 0u64;
            for (n, &b) in imm_bytes.iter().enumerate() {
                imm |= (b as u64) << (8 * n);
            }
            if size == 8 {
                // REX.W form carries imm32, sign-extended to 64.
                imm = imm as u32 as i32 as i64 as u64;
            }
            Ok(DecodedInstr {
                kind: MovKind::ImmToMem(imm),
                opsize: size,
                regsize: size,
                reg: CpuReg::Rax,
            })
        }
        0x0F => {
            let op2 = *bytes.get(i).ok_or(HvErr::Inval)?;
            i += 1;
            let (reg, _) = parse_modrm(&bytes[i..], rex_r, rex_b)?;
            let (kind, memsize) = match op2 {
                0xB6 => (MovKind::ZeroExtend, 1),
                0xB7 => (MovKind::ZeroExtend, 2),
                0xBE => (MovKind::SignExtend, 1),
                0xBF => (MovKind::SignExtend, 2),
                _ => return Err(HvErr::Inval),
            };
            Ok(DecodedInstr {
                kind,
                opsize: memsize,
                regsize: opsize,
                reg: reg_from_index(reg),
            })
        }
        _ => Err(HvErr::Inval),
    }
}

/// Fetch and decode the faulting instruction; the decode is parked on the
/// vCPU for the completion step. Returns the memory operand size.
pub fn decode_instruction(vcpu: &mut Vcpu, vm: &Vm) -> Result<usize, HvErr> {
    let rip = vcpu.get_rip();
    let len = (vcpu.arch.inst_len as usize).clamp(1, MAX_INSTR_BYTES);
    let mut bytes = [0u8; MAX_INSTR_BYTES];
    let mut err_code = PAGE_FAULT_ID_FLAG;
    let mut fault_addr = 0u64;

    if guest_memory::copy_from_gva(
        vcpu,
        vm,
        &mut bytes[..len],
        rip,
        &mut err_code,
        &mut fault_addr,
    )
    .is_err()
    {
        virq::vcpu_inject_pf(vcpu, fault_addr, err_code);
        vcpu.retain_rip();
        return Err(HvErr::Fault);
    }

    let decoded = parse(&bytes[..len])?;
    let size = decoded.opsize;
    vcpu.decoded = Some(decoded);
    Ok(size)
}

/// Value a decoded write stores to memory.
pub fn emulated_write_value(vcpu: &mut Vcpu) -> Result<u64, HvErr> {
    let decoded = vcpu.decoded.ok_or(HvErr::Inval)?;
    let value = match decoded.kind {
        MovKind::ToMem => vcpu.get_gpreg(decoded.reg),
        MovKind::ImmToMem(imm) => imm,
        _ => return Err(HvErr::Inval),
    };
    Ok(mask_to(value, decoded.opsize))
}

fn mask_to(value: u64, size: usize) -> u64 {
    match size {
        1 => value & 0xFF,
        2 => value & 0xFFFF,
        4 => value & 0xFFFF_FFFF,
        _ => value,
    }
}

fn sign_extend(value: u64, from: usize) -> u64 {
    match from {
        1 => value as u8 as i8 as i64 as u64,
        2 => value as u16 as i16 as i64 as u64,
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}

/// Finish a decoded read: land `value` in the destination register with
/// the architectural width rules (32-bit writes zero the upper half,
/// 8/16-bit writes merge).
pub fn emulate_instruction(vcpu: &mut Vcpu, value: u64) -> Result<(), HvErr> {
    let decoded = vcpu.decoded.ok_or(HvErr::Inval)?;
    let result = match decoded.kind {
        MovKind::FromMem => mask_to(value, decoded.opsize),
        MovKind::ZeroExtend => mask_to(value, decoded.opsize),
        MovKind::SignExtend => {
            mask_to(sign_extend(value, decoded.opsize), decoded.regsize.max(4))
        }
        _ => return Ok(()),
    };

    let width = match decoded.kind {
        MovKind::FromMem => decoded.opsize,
        _ => decoded.regsize,
    };
    let old = vcpu.get_gpreg(decoded.reg);
    let merged = match width {
        1 => (old & !0xFF) | (result & 0xFF),
        2 => (old & !0xFFFF) | (result & 0xFFFF),
        4 => result & 0xFFFF_FFFF,
        _ => result,
    };
    vcpu.set_gpreg(decoded.reg, merged);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_r32_from_mem() {
        // mov eax, [rbx] => 8B 03
        let d = parse(&[0x8B, 0x03]).unwrap();
        assert_eq!(d.kind, MovKind::FromMem);
        assert_eq!(d.opsize, 4);
        assert_eq!(d.reg, CpuReg::Rax);
    }

    #[test]
    fn mov_r64_to_mem_with_rex() {
        // mov [rdi], r12 => 4C 89 27
        let d = parse(&[0x4C, 0x89, 0x27]).unwrap();
        assert_eq!(d.kind, MovKind::ToMem);
        assert_eq!(d.opsize, 8);
        assert_eq!(d.reg, CpuReg::R12);
    }

    #[test]
    fn mov_r8_write() {
        // mov [rcx], dl => 88 11
        let d = parse(&[0x88, 0x11]).unwrap();
        assert_eq!(d.kind, MovKind::ToMem);
        assert_eq!(d.opsize, 1);
        assert_eq!(d.reg, CpuReg::Rdx);
    }

    #[test]
    fn mov_imm32_to_mem() {
        // mov dword [rbx], 0xAB12CD34 => C7 03 34 CD 12 AB
        let d = parse(&[0xC7, 0x03, 0x34, 0xCD, 0x12, 0xAB]).unwrap();
        assert_eq!(d.opsize, 4);
        assert_eq!(d.kind, MovKind::ImmToMem(0xAB12_CD34));
    }

    #[test]
    fn operand_size_prefix_gives_16bit() {
        // mov [rbx], ax => 66 89 03
        let d = parse(&[0x66, 0x89, 0x03]).unwrap();
        assert_eq!(d.opsize, 2);
    }

    #[test]
    fn movzx_byte_into_r32() {
        // movzx ecx, byte [rax] => 0F B6 08
        let d = parse(&[0x0F, 0xB6, 0x08]).unwrap();
        assert_eq!(d.kind, MovKind::ZeroExtend);
        assert_eq!(d.opsize, 1);
        assert_eq!(d.regsize, 4);
        assert_eq!(d.reg, CpuReg::Rcx);
    }

    #[test]
    fn register_direct_form_is_rejected() {
        // mov eax, ebx => 8B C3 (mod=3) never faults on memory
        assert!(parse(&[0x8B, 0xC3]).is_err());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(parse(&[0x0F, 0xAE, 0x38]).is_err());
        assert!(parse(&[0x90]).is_err());
    }

    #[test]
    fn sib_and_displacement_consumed() {
        // mov [rax+rcx*4+0x10], edx => 89 54 88 10
        let d = parse(&[0x89, 0x54, 0x88, 0x10]).unwrap();
        assert_eq!(d.kind, MovKind::ToMem);
        assert_eq!(d.reg, CpuReg::Rdx);
    }

    #[test]
    fn sign_extension_math() {
        assert_eq!(sign_extend(0x80, 1), 0xFFFF_FFFF_FFFF_FF80);
        assert_eq!(sign_extend(0x7F, 1), 0x7F);
        assert_eq!(mask_to(0xDEAD_BEEF_CAFE, 2), 0xCAFE);
    }
}
