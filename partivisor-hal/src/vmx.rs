//! Raw VMX plumbing: VMCS field encodings, instruction shims, and the
//! VMLAUNCH/VMRESUME entry path that swaps guest GPRs in and out.

use crate::HalError;

/* 16-bit control fields */
pub const VMX_VPID: u32 = 0x0000;
/* 16-bit guest-state fields */
pub const VMX_GUEST_ES_SEL: u32 = 0x0800;
pub const VMX_GUEST_CS_SEL: u32 = 0x0802;
pub const VMX_GUEST_SS_SEL: u32 = 0x0804;
pub const VMX_GUEST_DS_SEL: u32 = 0x0806;
pub const VMX_GUEST_FS_SEL: u32 = 0x0808;
pub const VMX_GUEST_GS_SEL: u32 = 0x080A;
pub const VMX_GUEST_LDTR_SEL: u32 = 0x080C;
pub const VMX_GUEST_TR_SEL: u32 = 0x080E;
pub const VMX_GUEST_INTR_STATUS: u32 = 0x0810;
/* 16-bit host-state fields */
pub const VMX_HOST_ES_SEL: u32 = 0x0C00;
pub const VMX_HOST_CS_SEL: u32 = 0x0C02;
pub const VMX_HOST_SS_SEL: u32 = 0x0C04;
pub const VMX_HOST_DS_SEL: u32 = 0x0C06;
pub const VMX_HOST_FS_SEL: u32 = 0x0C08;
pub const VMX_HOST_GS_SEL: u32 = 0x0C0A;
pub const VMX_HOST_TR_SEL: u32 = 0x0C0C;
/* 64-bit control fields */
pub const VMX_IO_BITMAP_A_FULL: u32 = 0x2000;
pub const VMX_IO_BITMAP_B_FULL: u32 = 0x2002;
pub const VMX_MSR_BITMAP_FULL: u32 = 0x2004;
pub const VMX_EXIT_MSR_STORE_ADDR_FULL: u32 = 0x2006;
pub const VMX_EXIT_MSR_LOAD_ADDR_FULL: u32 = 0x2008;
pub const VMX_ENTRY_MSR_LOAD_ADDR_FULL: u32 = 0x200A;
pub const VMX_TSC_OFFSET_FULL: u32 = 0x2010;
pub const VMX_VIRTUAL_APIC_PAGE_ADDR_FULL: u32 = 0x2012;
pub const VMX_APIC_ACCESS_ADDR_FULL: u32 = 0x2014;
pub const VMX_EPT_POINTER_FULL: u32 = 0x201A;
pub const VMX_EOI_EXIT0_FULL: u32 = 0x201C;
pub const VMX_EOI_EXIT1_FULL: u32 = 0x201E;
pub const VMX_EOI_EXIT2_FULL: u32 = 0x2020;
pub const VMX_EOI_EXIT3_FULL: u32 = 0x2022;
pub const VMX_XSS_EXITING_BITMAP_FULL: u32 = 0x202C;
/* 64-bit read-only data fields */
pub const VMX_GUEST_PHYSICAL_ADDR_FULL: u32 = 0x2400;
/* 64-bit guest-state fields */
pub const VMX_VMS_LINK_PTR_FULL: u32 = 0x2800;
pub const VMX_GUEST_IA32_DEBUGCTL_FULL: u32 = 0x2802;
pub const VMX_GUEST_IA32_PAT_FULL: u32 = 0x2804;
pub const VMX_GUEST_IA32_EFER_FULL: u32 = 0x2806;
pub const VMX_GUEST_IA32_PERF_CTL_FULL: u32 = 0x2808;
pub const VMX_GUEST_PDPTE0_FULL: u32 = 0x280A;
pub const VMX_GUEST_PDPTE1_FULL: u32 = 0x280C;
pub const VMX_GUEST_PDPTE2_FULL: u32 = 0x280E;
pub const VMX_GUEST_PDPTE3_FULL: u32 = 0x2810;
/* 64-bit host-state fields */
pub const VMX_HOST_IA32_PAT_FULL: u32 = 0x2C00;
pub const VMX_HOST_IA32_EFER_FULL: u32 = 0x2C02;
/* 32-bit control fields */
pub const VMX_PIN_VM_EXEC_CONTROLS: u32 = 0x4000;
pub const VMX_PROC_VM_EXEC_CONTROLS: u32 = 0x4002;
pub const VMX_EXCEPTION_BITMAP: u32 = 0x4004;
pub const VMX_PF_ERROR_CODE_MASK: u32 = 0x4006;
pub const VMX_PF_ERROR_CODE_MATCH: u32 = 0x4008;
pub const VMX_CR3_TARGET_COUNT: u32 = 0x400A;
pub const VMX_EXIT_CONTROLS: u32 = 0x400C;
pub const VMX_EXIT_MSR_STORE_COUNT: u32 = 0x400E;
pub const VMX_EXIT_MSR_LOAD_COUNT: u32 = 0x4010;
pub const VMX_ENTRY_CONTROLS: u32 = 0x4012;
pub const VMX_ENTRY_MSR_LOAD_COUNT: u32 = 0x4014;
pub const VMX_ENTRY_INT_INFO_FIELD: u32 = 0x4016;
pub const VMX_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
pub const VMX_ENTRY_INSTR_LENGTH: u32 = 0x401A;
pub const VMX_TPR_THRESHOLD: u32 = 0x401C;
pub const VMX_PROC_VM_EXEC_CONTROLS2: u32 = 0x401E;
/* 32-bit read-only data fields */
pub const VMX_INSTR_ERROR: u32 = 0x4400;
pub const VMX_EXIT_REASON: u32 = 0x4402;
pub const VMX_EXIT_INT_INFO: u32 = 0x4404;
pub const VMX_EXIT_INT_ERROR_CODE: u32 = 0x4406;
pub const VMX_IDT_VEC_INFO_FIELD: u32 = 0x4408;
pub const VMX_IDT_VEC_ERROR_CODE: u32 = 0x440A;
pub const VMX_EXIT_INSTR_LEN: u32 = 0x440C;
pub const VMX_INSTR_INFO: u32 = 0x440E;
/* 32-bit guest-state fields */
pub const VMX_GUEST_ES_LIMIT: u32 = 0x4800;
pub const VMX_GUEST_CS_LIMIT: u32 = 0x4802;
pub const VMX_GUEST_SS_LIMIT: u32 = 0x4804;
pub const VMX_GUEST_DS_LIMIT: u32 = 0x4806;
pub const VMX_GUEST_FS_LIMIT: u32 = 0x4808;
pub const VMX_GUEST_GS_LIMIT: u32 = 0x480A;
pub const VMX_GUEST_LDTR_LIMIT: u32 = 0x480C;
pub const VMX_GUEST_TR_LIMIT: u32 = 0x480E;
pub const VMX_GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const VMX_GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const VMX_GUEST_ES_ATTR: u32 = 0x4814;
pub const VMX_GUEST_CS_ATTR: u32 = 0x4816;
pub const VMX_GUEST_SS_ATTR: u32 = 0x4818;
pub const VMX_GUEST_DS_ATTR: u32 = 0x481A;
pub const VMX_GUEST_FS_ATTR: u32 = 0x481C;
pub const VMX_GUEST_GS_ATTR: u32 = 0x481E;
pub const VMX_GUEST_LDTR_ATTR: u32 = 0x4820;
pub const VMX_GUEST_TR_ATTR: u32 = 0x4822;
pub const VMX_GUEST_INTERRUPTIBILITY_INFO: u32 = 0x4824;
pub const VMX_GUEST_ACTIVITY_STATE: u32 = 0x4826;
pub const VMX_GUEST_IA32_SYSENTER_CS: u32 = 0x482A;
pub const VMX_GUEST_TIMER: u32 = 0x482E;
/* 32-bit host-state field */
pub const VMX_HOST_IA32_SYSENTER_CS: u32 = 0x4C00;
/* natural-width control fields */
pub const VMX_CR0_GUEST_HOST_MASK: u32 = 0x6000;
pub const VMX_CR4_GUEST_HOST_MASK: u32 = 0x6002;
pub const VMX_CR0_READ_SHADOW: u32 = 0x6004;
pub const VMX_CR4_READ_SHADOW: u32 = 0x6006;
/* natural-width read-only data fields */
pub const VMX_EXIT_QUALIFICATION: u32 = 0x6400;
pub const VMX_GUEST_LINEAR_ADDR: u32 = 0x640A;
/* natural-width guest-state fields */
pub const VMX_GUEST_CR0: u32 = 0x6800;
pub const VMX_GUEST_CR3: u32 = 0x6802;
pub const VMX_GUEST_CR4: u32 = 0x6804;
pub const VMX_GUEST_ES_BASE: u32 = 0x6806;
pub const VMX_GUEST_CS_BASE: u32 = 0x6808;
pub const VMX_GUEST_SS_BASE: u32 = 0x680A;
pub const VMX_GUEST_DS_BASE: u32 = 0x680C;
pub const VMX_GUEST_FS_BASE: u32 = 0x680E;
pub const VMX_GUEST_GS_BASE: u32 = 0x6810;
pub const VMX_GUEST_LDTR_BASE: u32 = 0x6812;
pub const VMX_GUEST_TR_BASE: u32 = 0x6814;
pub const VMX_GUEST_GDTR_BASE: u32 = 0x6816;
pub const VMX_GUEST_IDTR_BASE: u32 = 0x6818;
pub const VMX_GUEST_DR7: u32 = 0x681A;
pub const VMX_GUEST_RSP: u32 = 0x681C;
pub const VMX_GUEST_RIP: u32 = 0x681E;
pub const VMX_GUEST_RFLAGS: u32 = 0x6820;
pub const VMX_GUEST_PENDING_DEBUG_EXCEPT: u32 = 0x6822;
pub const VMX_GUEST_IA32_SYSENTER_ESP: u32 = 0x6824;
pub const VMX_GUEST_IA32_SYSENTER_EIP: u32 = 0x6826;
/* natural-width host-state fields */
pub const VMX_HOST_CR0: u32 = 0x6C00;
pub const VMX_HOST_CR3: u32 = 0x6C02;
pub const VMX_HOST_CR4: u32 = 0x6C04;
pub const VMX_HOST_FS_BASE: u32 = 0x6C06;
pub const VMX_HOST_GS_BASE: u32 = 0x6C08;
pub const VMX_HOST_TR_BASE: u32 = 0x6C0A;
pub const VMX_HOST_GDTR_BASE: u32 = 0x6C0C;
pub const VMX_HOST_IDTR_BASE: u32 = 0x6C0E;
pub const VMX_HOST_IA32_SYSENTER_ESP: u32 = 0x6C10;
pub const VMX_HOST_IA32_SYSENTER_EIP: u32 = 0x6C12;
pub const VMX_HOST_RSP: u32 = 0x6C14;
pub const VMX_HOST_RIP: u32 = 0x6C16;

/* basic exit reasons, SDM Appendix C */
pub const VMX_EXIT_REASON_EXCEPTION_OR_NMI: u16 = 0;
pub const VMX_EXIT_REASON_EXTERNAL_INTERRUPT: u16 = 1;
pub const VMX_EXIT_REASON_TRIPLE_FAULT: u16 = 2;
pub const VMX_EXIT_REASON_INIT_SIGNAL: u16 = 3;
pub const VMX_EXIT_REASON_STARTUP_IPI: u16 = 4;
pub const VMX_EXIT_REASON_IO_SMI: u16 = 5;
pub const VMX_EXIT_REASON_OTHER_SMI: u16 = 6;
pub const VMX_EXIT_REASON_INTERRUPT_WINDOW: u16 = 7;
pub const VMX_EXIT_REASON_NMI_WINDOW: u16 = 8;
pub const VMX_EXIT_REASON_TASK_SWITCH: u16 = 9;
pub const VMX_EXIT_REASON_CPUID: u16 = 10;
pub const VMX_EXIT_REASON_GETSEC: u16 = 11;
pub const VMX_EXIT_REASON_HLT: u16 = 12;
pub const VMX_EXIT_REASON_INVD: u16 = 13;
pub const VMX_EXIT_REASON_INVLPG: u16 = 14;
pub const VMX_EXIT_REASON_RDPMC: u16 = 15;
pub const VMX_EXIT_REASON_RDTSC: u16 = 16;
pub const VMX_EXIT_REASON_RSM: u16 = 17;
pub const VMX_EXIT_REASON_VMCALL: u16 = 18;
pub const VMX_EXIT_REASON_VMCLEAR: u16 = 19;
pub const VMX_EXIT_REASON_VMLAUNCH: u16 = 20;
pub const VMX_EXIT_REASON_VMPTRLD: u16 = 21;
pub const VMX_EXIT_REASON_VMPTRST: u16 = 22;
pub const VMX_EXIT_REASON_VMREAD: u16 = 23;
pub const VMX_EXIT_REASON_VMRESUME: u16 = 24;
pub const VMX_EXIT_REASON_VMWRITE: u16 = 25;
pub const VMX_EXIT_REASON_VMXOFF: u16 = 26;
pub const VMX_EXIT_REASON_VMXON: u16 = 27;
pub const VMX_EXIT_REASON_CR_ACCESS: u16 = 28;
pub const VMX_EXIT_REASON_DR_ACCESS: u16 = 29;
pub const VMX_EXIT_REASON_IO_INSTRUCTION: u16 = 30;
pub const VMX_EXIT_REASON_RDMSR: u16 = 31;
pub const VMX_EXIT_REASON_WRMSR: u16 = 32;
pub const VMX_EXIT_REASON_ENTRY_FAILURE_INVALID_GUEST_STATE: u16 = 33;
pub const VMX_EXIT_REASON_ENTRY_FAILURE_MSR_LOADING: u16 = 34;
pub const VMX_EXIT_REASON_MWAIT: u16 = 36;
pub const VMX_EXIT_REASON_MONITOR_TRAP: u16 = 37;
pub const VMX_EXIT_REASON_MONITOR: u16 = 39;
pub const VMX_EXIT_REASON_PAUSE: u16 = 40;
pub const VMX_EXIT_REASON_ENTRY_FAILURE_MACHINE_CHECK: u16 = 41;
pub const VMX_EXIT_REASON_TPR_BELOW_THRESHOLD: u16 = 43;
pub const VMX_EXIT_REASON_APIC_ACCESS: u16 = 44;
pub const VMX_EXIT_REASON_VIRTUALIZED_EOI: u16 = 45;
pub const VMX_EXIT_REASON_GDTR_IDTR_ACCESS: u16 = 46;
pub const VMX_EXIT_REASON_LDTR_TR_ACCESS: u16 = 47;
pub const VMX_EXIT_REASON_EPT_VIOLATION: u16 = 48;
pub const VMX_EXIT_REASON_EPT_MISCONFIGURATION: u16 = 49;
pub const VMX_EXIT_REASON_INVEPT: u16 = 50;
pub const VMX_EXIT_REASON_RDTSCP: u16 = 51;
pub const VMX_EXIT_REASON_VMX_PREEMPTION_TIMER_EXPIRED: u16 = 52;
pub const VMX_EXIT_REASON_INVVPID: u16 = 53;
pub const VMX_EXIT_REASON_WBINVD: u16 = 54;
pub const VMX_EXIT_REASON_XSETBV: u16 = 55;
pub const VMX_EXIT_REASON_APIC_WRITE: u16 = 56;
pub const VMX_EXIT_REASON_RDRAND: u16 = 57;
pub const VMX_EXIT_REASON_INVPCID: u16 = 58;
pub const VMX_EXIT_REASON_VMFUNC: u16 = 59;
pub const VMX_EXIT_REASON_ENCLS: u16 = 60;
pub const VMX_EXIT_REASON_RDSEED: u16 = 61;
pub const VMX_EXIT_REASON_PAGE_MODIFICATION_LOG_FULL: u16 = 62;
pub const VMX_EXIT_REASON_XSAVES: u16 = 63;
pub const VMX_EXIT_REASON_XRSTORS: u16 = 64;
pub const VMX_EXIT_REASON_LOADIWKEY: u16 = 69;
pub const NR_VMX_EXIT_REASONS: usize = 70;

/* pin-based execution controls */
pub const VMX_PINBASED_CTLS_IRQ_EXIT: u32 = 1 << 0;
pub const VMX_PINBASED_CTLS_NMI_EXIT: u32 = 1 << 3;
pub const VMX_PINBASED_CTLS_VIRT_NMI: u32 = 1 << 5;
pub const VMX_PINBASED_CTLS_POST_IRQ: u32 = 1 << 7;
/* processor-based execution controls */
pub const VMX_PROCBASED_CTLS_IRQ_WIN: u32 = 1 << 2;
pub const VMX_PROCBASED_CTLS_TSC_OFF: u32 = 1 << 3;
pub const VMX_PROCBASED_CTLS_HLT: u32 = 1 << 7;
pub const VMX_PROCBASED_CTLS_INVLPG: u32 = 1 << 9;
pub const VMX_PROCBASED_CTLS_MWAIT: u32 = 1 << 10;
pub const VMX_PROCBASED_CTLS_RDPMC: u32 = 1 << 11;
pub const VMX_PROCBASED_CTLS_CR3_LOAD: u32 = 1 << 15;
pub const VMX_PROCBASED_CTLS_CR3_STORE: u32 = 1 << 16;
pub const VMX_PROCBASED_CTLS_CR8_LOAD: u32 = 1 << 19;
pub const VMX_PROCBASED_CTLS_CR8_STORE: u32 = 1 << 20;
pub const VMX_PROCBASED_CTLS_TPR_SHADOW: u32 = 1 << 21;
pub const VMX_PROCBASED_CTLS_NMI_WINEXIT: u32 = 1 << 22;
pub const VMX_PROCBASED_CTLS_MOV_DR: u32 = 1 << 23;
pub const VMX_PROCBASED_CTLS_UNCOND_IO: u32 = 1 << 24;
pub const VMX_PROCBASED_CTLS_IO_BITMAP: u32 = 1 << 25;
pub const VMX_PROCBASED_CTLS_MON_TRAP: u32 = 1 << 27;
pub const VMX_PROCBASED_CTLS_MSR_BITMAP: u32 = 1 << 28;
pub const VMX_PROCBASED_CTLS_MONITOR: u32 = 1 << 29;
pub const VMX_PROCBASED_CTLS_PAUSE: u32 = 1 << 30;
pub const VMX_PROCBASED_CTLS_SECONDARY: u32 = 1 << 31;
/* secondary processor-based controls */
pub const VMX_PROCBASED_CTLS2_VAPIC: u32 = 1 << 0;
pub const VMX_PROCBASED_CTLS2_EPT: u32 = 1 << 1;
pub const VMX_PROCBASED_CTLS2_RDTSCP: u32 = 1 << 3;
pub const VMX_PROCBASED_CTLS2_VX2APIC: u32 = 1 << 4;
pub const VMX_PROCBASED_CTLS2_VPID: u32 = 1 << 5;
pub const VMX_PROCBASED_CTLS2_WBINVD: u32 = 1 << 6;
pub const VMX_PROCBASED_CTLS2_UNRESTRICT: u32 = 1 << 7;
pub const VMX_PROCBASED_CTLS2_VAPIC_REGS: u32 = 1 << 8;
pub const VMX_PROCBASED_CTLS2_VIRQ_DELIVERY: u32 = 1 << 9;
pub const VMX_PROCBASED_CTLS2_RDRAND: u32 = 1 << 11;
pub const VMX_PROCBASED_CTLS2_INVPCID: u32 = 1 << 12;
pub const VMX_PROCBASED_CTLS2_XSVE_XRSTR: u32 = 1 << 20;
/* exit controls */
pub const VMX_EXIT_CTLS_SAVE_DBG: u32 = 1 << 2;
pub const VMX_EXIT_CTLS_HOST_ADDR64: u32 = 1 << 9;
pub const VMX_EXIT_CTLS_ACK_IRQ: u32 = 1 << 15;
pub const VMX_EXIT_CTLS_SAVE_PAT: u32 = 1 << 18;
pub const VMX_EXIT_CTLS_LOAD_PAT: u32 = 1 << 19;
pub const VMX_EXIT_CTLS_SAVE_EFER: u32 = 1 << 20;
pub const VMX_EXIT_CTLS_LOAD_EFER: u32 = 1 << 21;
/* entry controls */
pub const VMX_ENTRY_CTLS_LOAD_DBG: u32 = 1 << 2;
pub const VMX_ENTRY_CTLS_IA32E_MODE: u32 = 1 << 9;
pub const VMX_ENTRY_CTLS_LOAD_PAT: u32 = 1 << 14;
pub const VMX_ENTRY_CTLS_LOAD_EFER: u32 = 1 << 15;

/* VM-entry / exit interruption info */
pub const VMX_INT_INFO_VALID: u32 = 1 << 31;
pub const VMX_INT_INFO_ERR_CODE_VALID: u32 = 1 << 11;
pub const VMX_INT_TYPE_MASK: u32 = 0x700;
pub const VMX_INT_TYPE_EXT_INT: u32 = 0;
pub const VMX_INT_TYPE_NMI: u32 = 2;
pub const VMX_INT_TYPE_HW_EXP: u32 = 3;
pub const VMX_INT_TYPE_SW_EXP: u32 = 6;

/* interruptibility-state bits */
pub const VMX_BLOCKED_BY_STI: u32 = 1 << 0;
pub const VMX_BLOCKED_BY_MOVSS: u32 = 1 << 1;
pub const VMX_BLOCKED_BY_NMI: u32 = 1 << 3;

/* EPTP format: page-walk length 4, write-back walk memtype */
pub const EPTP_PWL_4: u64 = 3 << 3;
pub const EPTP_WB: u64 = 6;

/// Guest general-purpose registers in the hardware entry/exit block order.
/// The VM-entry assembly addresses this layout by fixed offsets.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp_unused: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<GeneralRegisters>(), 128);
static_assertions::const_assert_eq!(core::mem::offset_of!(GeneralRegisters, rbp), 0x28);
static_assertions::const_assert_eq!(core::mem::offset_of!(GeneralRegisters, rdi), 0x38);
static_assertions::const_assert_eq!(core::mem::offset_of!(GeneralRegisters, r15), 0x78);

/// One `{index, value}` slot of the architectural VM-entry/exit MSR lists.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct MsrStoreEntry {
    pub msr_index: u32,
    reserved: u32,
    pub value: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<MsrStoreEntry>(), 16);

impl MsrStoreEntry {
    pub const fn new(msr_index: u32) -> Self {
        MsrStoreEntry {
            msr_index,
            reserved: 0,
            value: 0,
        }
    }
}

core::arch::global_asm!(
    r#"
    .text
    .balign 16
    .globl __partivisor_vmrun
// rdi = &GeneralRegisters, rsi = 1 for VMLAUNCH / 0 for VMRESUME.
// Returns 0 after a VM exit, 1 when the entry instruction itself failed.
__partivisor_vmrun:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15
    push rdi
    push rsi
    mov rax, 0x6C14
    vmwrite rax, rsp
    mov rax, [rdi + 0x00]
    mov rcx, [rdi + 0x08]
    mov rdx, [rdi + 0x10]
    mov rbx, [rdi + 0x18]
    mov rbp, [rdi + 0x28]
    mov r8,  [rdi + 0x40]
    mov r9,  [rdi + 0x48]
    mov r10, [rdi + 0x50]
    mov r11, [rdi + 0x58]
    mov r12, [rdi + 0x60]
    mov r13, [rdi + 0x68]
    mov r14, [rdi + 0x70]
    mov r15, [rdi + 0x78]
    mov rsi, [rdi + 0x30]
    cmp qword ptr [rsp], 0
    mov rdi, [rdi + 0x38]
    jne 2f
    vmresume
    jmp 3f
2:  vmlaunch
3:  // Only reached when the entry instruction failed (CF or ZF set).
    pop rsi
    pop rdi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    mov eax, 1
    ret

    .balign 16
    .globl __partivisor_vmexit_entry
// VMCS host RIP. Hardware restored RSP from the host-RSP field, so the
// stack still holds [launch flag][regs ptr][saved callee regs].
__partivisor_vmexit_entry:
    xchg rdi, [rsp + 8]
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rcx
    mov [rdi + 0x10], rdx
    mov [rdi + 0x18], rbx
    mov [rdi + 0x28], rbp
    mov [rdi + 0x30], rsi
    mov [rdi + 0x40], r8
    mov [rdi + 0x48], r9
    mov [rdi + 0x50], r10
    mov [rdi + 0x58], r11
    mov [rdi + 0x60], r12
    mov [rdi + 0x68], r13
    mov [rdi + 0x70], r14
    mov [rdi + 0x78], r15
    mov rax, [rsp + 8]
    mov [rdi + 0x38], rax
    pop rax
    pop rax
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    xor eax, eax
    ret
"#
);

extern "C" {
    fn __partivisor_vmrun(regs: *mut GeneralRegisters, launch: u64) -> u64;
    /// Address programmed into VMX_HOST_RIP; never called from Rust.
    pub fn __partivisor_vmexit_entry();
}

/// Enter the guest. Returns `Ok(())` after a VM exit.
///
/// # Safety
/// The current VMCS must be fully initialized and `regs` must stay valid
/// across the guest run.
pub unsafe fn vmrun(regs: *mut GeneralRegisters, launch: bool) -> Result<(), HalError> {
    let failed = unsafe { __partivisor_vmrun(regs, launch as u64) };
    if failed != 0 {
        return Err(HalError::VmxInstrFailed);
    }
    Ok(())
}

pub fn vmexit_entry_hva() -> u64 {
    __partivisor_vmexit_entry as usize as u64
}

#[inline]
fn rflags_cf_zf(rflags: u64) -> bool {
    (rflags & 0x1) != 0 || (rflags & 0x40) != 0
}

/// VMXON with the given 4 KiB region.
///
/// # Safety
/// CPL0, CR4.VMXE set, region initialized with the VMCS revision id.
pub unsafe fn vmxon(region_hpa: u64) -> Result<(), HalError> {
    let rflags: u64;
    unsafe {
        core::arch::asm!(
            "vmxon [{0}]",
            "pushfq",
            "pop {1}",
            in(reg) &region_hpa,
            out(reg) rflags,
        );
    }
    if rflags_cf_zf(rflags) {
        return Err(HalError::VmxInstrFailed);
    }
    Ok(())
}

/// Leave VMX root operation.
///
/// # Safety
/// CPL0, in VMX root operation.
pub unsafe fn vmxoff() {
    unsafe { core::arch::asm!("vmxoff") };
}

/// Make the VMCS at `vmcs_hpa` current on this processor.
///
/// # Safety
/// CPL0 in VMX root; the region must carry the revision id.
pub unsafe fn vmptrld(vmcs_hpa: u64) -> Result<(), HalError> {
    let rflags: u64;
    unsafe {
        core::arch::asm!(
            "vmptrld [{0}]",
            "pushfq",
            "pop {1}",
            in(reg) &vmcs_hpa,
            out(reg) rflags,
        );
    }
    if rflags_cf_zf(rflags) {
        return Err(HalError::VmxInstrFailed);
    }
    Ok(())
}

/// Flush and deactivate the VMCS at `vmcs_hpa`.
///
/// # Safety
/// CPL0 in VMX root.
pub unsafe fn vmclear(vmcs_hpa: u64) -> Result<(), HalError> {
    let rflags: u64;
    unsafe {
        core::arch::asm!(
            "vmclear [{0}]",
            "pushfq",
            "pop {1}",
            in(reg) &vmcs_hpa,
            out(reg) rflags,
        );
    }
    if rflags_cf_zf(rflags) {
        return Err(HalError::VmxInstrFailed);
    }
    Ok(())
}

/// Read a field of the current VMCS.
///
/// # Safety
/// A VMCS must be current on this processor and `field` valid for it.
#[inline]
pub unsafe fn exec_vmread(field: u32) -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!(
            "vmread {0}, {1}",
            out(reg) value,
            in(reg) field as u64,
            options(nostack, preserves_flags),
        );
    }
    value
}

/// Write a field of the current VMCS.
///
/// # Safety
/// A VMCS must be current on this processor and `field` writable.
#[inline]
pub unsafe fn exec_vmwrite(field: u32, value: u64) {
    unsafe {
        core::arch::asm!(
            "vmwrite {0}, {1}",
            in(reg) field as u64,
            in(reg) value,
            options(nostack, preserves_flags),
        );
    }
}

#[inline]
pub unsafe fn exec_vmread32(field: u32) -> u32 {
    unsafe { exec_vmread(field) as u32 }
}

#[inline]
pub unsafe fn exec_vmwrite32(field: u32, value: u32) {
    unsafe { exec_vmwrite(field, value as u64) }
}

#[repr(C, packed)]
struct InvDescriptor {
    first: u64,
    second: u64,
}

const INVEPT_TYPE_SINGLE_CONTEXT: u64 = 1;
const INVEPT_TYPE_ALL_CONTEXTS: u64 = 2;
const INVVPID_TYPE_SINGLE_CONTEXT: u64 = 1;
const INVVPID_TYPE_ALL_CONTEXTS: u64 = 2;

/// Invalidate EPT-derived translations tagged with `eptp`.
///
/// # Safety
/// CPL0 in VMX root with the INVEPT capability present.
pub unsafe fn invept_single_context(eptp: u64) {
    let desc = InvDescriptor {
        first: eptp,
        second: 0,
    };
    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) INVEPT_TYPE_SINGLE_CONTEXT,
            in(reg) &desc,
            options(nostack),
        );
    }
}

/// Invalidate every EPT-derived translation.
///
/// # Safety
/// CPL0 in VMX root with the INVEPT capability present.
pub unsafe fn invept_global() {
    let desc = InvDescriptor {
        first: 0,
        second: 0,
    };
    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) INVEPT_TYPE_ALL_CONTEXTS,
            in(reg) &desc,
            options(nostack),
        );
    }
}

/// Invalidate translations tagged with a single VPID.
///
/// # Safety
/// CPL0 in VMX root with the INVVPID capability present.
pub unsafe fn flush_vpid_single(vpid: u16) {
    if vpid == 0 {
        return;
    }
    let desc = InvDescriptor {
        first: vpid as u64,
        second: 0,
    };
    unsafe {
        core::arch::asm!(
            "invvpid {0}, [{1}]",
            in(reg) INVVPID_TYPE_SINGLE_CONTEXT,
            in(reg) &desc,
            options(nostack),
        );
    }
}

/// Invalidate every VPID-tagged translation.
///
/// # Safety
/// CPL0 in VMX root with the INVVPID capability present.
pub unsafe fn flush_vpid_global() {
    let desc = InvDescriptor {
        first: 0,
        second: 0,
    };
    unsafe {
        core::arch::asm!(
            "invvpid {0}, [{1}]",
            in(reg) INVVPID_TYPE_ALL_CONTEXTS,
            in(reg) &desc,
            options(nostack),
        );
    }
}

/// Allow supervisor access to user pages; paired with [`clac`].
/// No-op unless SMAP was detected (keeps hosted tests unprivileged).
#[inline]
pub fn stac() {
    if crate::cpu_caps::pcpu_has_cap(crate::cpuid::X86_FEATURE_SMAP) {
        unsafe { core::arch::asm!("stac", options(nomem, nostack)) };
    }
}

/// Re-arm SMAP after a guest-memory access window.
#[inline]
pub fn clac() {
    if crate::cpu_caps::pcpu_has_cap(crate::cpuid::X86_FEATURE_SMAP) {
        unsafe { core::arch::asm!("clac", options(nomem, nostack)) };
    }
}

/// Full writeback-invalidate of this processor's caches.
///
/// # Safety
/// CPL0.
pub unsafe fn wbinvd() {
    unsafe { core::arch::asm!("wbinvd", options(nostack)) };
}

/// CLFLUSHOPT one cache line.
///
/// # Safety
/// `p` must be a mapped address.
pub unsafe fn clflushopt(p: *const u8) {
    unsafe { core::arch::asm!("clflushopt [{0}]", in(reg) p, options(nostack)) };
}

/// Flush the L1 data cache before entering a less-trusted world.
pub fn cpu_l1d_flush() {
    if crate::cpu_caps::pcpu_has_cap(crate::cpuid::X86_FEATURE_L1D_FLUSH) {
        unsafe { crate::msr::wrmsr(crate::msr::MSR_IA32_FLUSH_CMD, 1) };
    }
}

/// XSAVES into `area` for the state components in `mask`.
///
/// # Safety
/// CPL0 with XSAVES available; `area` must be a 64-byte-aligned save area
/// large enough for the enabled components.
pub unsafe fn xsaves(area: *mut u8, mask: u64) {
    unsafe {
        core::arch::asm!(
            "xsaves64 [{0}]",
            in(reg) area,
            in("eax") mask as u32,
            in("edx") (mask >> 32) as u32,
            options(nostack),
        );
    }
}

/// XRSTORS from `area` for the state components in `mask`.
///
/// # Safety
/// As [`xsaves`]; the area must hold a valid compacted image.
pub unsafe fn xrstors(area: *const u8, mask: u64) {
    unsafe {
        core::arch::asm!(
            "xrstors64 [{0}]",
            in(reg) area,
            in("eax") mask as u32,
            in("edx") (mask >> 32) as u32,
            options(nostack),
        );
    }
}

/// Write an extended control register (XSETBV).
///
/// # Safety
/// CPL0 with CR4.OSXSAVE set and a legal `value` for `xcr`.
pub unsafe fn write_xcr(xcr: u32, value: u64) {
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

/// Read an extended control register (XGETBV).
///
/// # Safety
/// CPL0-or-guest with CR4.OSXSAVE set.
pub unsafe fn read_xcr(xcr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        core::arch::asm!(
            "xgetbv",
            in("ecx") xcr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Load the wrapping key from `regs` (integrity key in XMM0/1, encryption
/// key in XMM2..5) and execute LOADIWKEY XMM1, XMM2.
///
/// # Safety
/// CR4.KL must be set on this processor.
pub unsafe fn asm_loadiwkey(regs: &[u64; 12]) {
    unsafe {
        core::arch::asm!(
            "movdqu xmm0, [{p}]",
            "movdqu xmm1, [{p} + 16]",
            "movdqu xmm2, [{p} + 32]",
            "movdqu xmm3, [{p} + 48]",
            "movdqu xmm4, [{p} + 64]",
            "movdqu xmm5, [{p} + 80]",
            "xor eax, eax",
            ".byte 0xf3, 0x0f, 0x38, 0xdc, 0xca", // loadiwkey xmm1, xmm2
            p = in(reg) regs.as_ptr(),
            out("eax") _,
            out("xmm0") _,
            out("xmm1") _,
            out("xmm2") _,
            out("xmm3") _,
            out("xmm4") _,
            out("xmm5") _,
            options(nostack),
        );
    }
}

/// Snapshot XMM0..XMM5, used to capture LOADIWKEY operands.
///
/// # Safety
/// SSE state must be live (always true once the engine runs).
pub unsafe fn read_xmm_0_5(out: &mut [u64; 12]) {
    unsafe {
        core::arch::asm!(
            "movdqu [{p}], xmm0",
            "movdqu [{p} + 16], xmm1",
            "movdqu [{p} + 32], xmm2",
            "movdqu [{p} + 48], xmm3",
            "movdqu [{p} + 64], xmm4",
            "movdqu [{p} + 80], xmm5",
            p = in(reg) out.as_mut_ptr(),
            options(nostack),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_block_matches_entry_asm_offsets() {
        assert_eq!(core::mem::offset_of!(GeneralRegisters, rax), 0x00);
        assert_eq!(core::mem::offset_of!(GeneralRegisters, rcx), 0x08);
        assert_eq!(core::mem::offset_of!(GeneralRegisters, rsi), 0x30);
        assert_eq!(core::mem::offset_of!(GeneralRegisters, r8), 0x40);
    }

    #[test]
    fn msr_store_entry_is_hardware_abi() {
        let e = MsrStoreEntry::new(0x277);
        assert_eq!(core::mem::size_of_val(&e), 16);
        assert_eq!(e.value, 0);
    }

    #[test]
    fn stac_clac_inert_without_smap() {
        // Hosted: the capability table is empty, so these must not execute
        // the privileged instruction.
        stac();
        clac();
    }
}
