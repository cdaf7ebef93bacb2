//! The module containing the [`Svm`] type, which implements the
//! [`hardware_vt::HardwareVt`] trait for AMD processors.
//!
//! The Secure Virtual Machine (SVM) extension implements AMD Virtualization
//! (AMD-V), the hardware assisted virtualization technology on AMD processors.
//!
//! All references to external resources (denoted with "See:") refers to
//! "AMD64 Architecture Programmer’s Manual Volume 2: System Programming"
//! Revision 3.40 (January 2023) at
//! <https://developer.amd.com/resources/developer-guides-manuals/> unless
//! otherwise stated.

use super::{
    GuestRegisters, IoQualification, NestedPagingStructureEntryFlags,
    NestedPagingStructureEntryType, SegReg, SegmentState, TaskSwitchQualification,
    TaskSwitchSource, VmExitReason,
};
use crate::{
    hardware_vt::{self, ExceptionQualification, GuestException, NestedPageFaultQualification},
    x86_instructions::{rdmsr, wrmsr},
};
use alloc::boxed::Box;
use core::{
    arch::global_asm,
    ptr::{addr_of, addr_of_mut},
};
use x86::irq;

/// SVM-specific data to represent a guest.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub(crate) struct Svm {
    vmcb: Box<Vmcb>,
    #[derivative(Debug = "ignore")]
    host_state: Box<HostStateArea>,
    registers: GuestRegisters,
}

impl hardware_vt::HardwareVt for Svm {
    /// Enables SVM on the current processor.
    fn enable(&mut self) {
        const EFER_SVME: u64 = 1 << 12;

        // Enable SVM. We assume the processor is compatible with this.
        // See: 15.4 Enabling SVM
        wrmsr(x86::msr::IA32_EFER, rdmsr(x86::msr::IA32_EFER) | EFER_SVME);
    }

    /// Whether this processor advertises nested paging (NPT), CPUID
    /// `0x8000_000A` EDX bit 0.
    /// See: 15.25.1 Enabling Nested Paging
    fn supports_nested_paging(&self) -> bool {
        const CPUID_SVM_FEATURES_NP_FLAG: u32 = 1 << 0;
        x86::cpuid::cpuid!(0x8000_000a).edx & CPUID_SVM_FEATURES_NP_FLAG != 0
    }

    /// Configures SVM. We intercept #BP, #UD, #PF, external interrupt, the
    /// PAUSE instruction, shutdown, and enable nested paging when
    /// `nested_pml4_addr` is `Some`. When `None` (hardware lacks NPT, or the
    /// vCPU was deliberately placed on the shadow-paging fallback), nested
    /// paging is left disabled and the guest's `CR3` loads directly into the
    /// real hardware register; the caller is responsible for seeding it with
    /// a shadow root (see `vcpu::VCpu::new`).
    fn initialize(&mut self, nested_pml4_addr: Option<u64>) {
        const SVM_INTERCEPT_MISC1_CPUID: u32 = 1 << 18;
        const SVM_INTERCEPT_MISC1_INVLPG: u32 = 1 << 14;
        const SVM_INTERCEPT_MISC1_IOIO: u32 = 1 << 27;
        const SVM_INTERCEPT_MISC1_MSR: u32 = 1 << 28;
        const SVM_INTERCEPT_MISC1_INTR: u32 = 1 << 0;
        const SVM_INTERCEPT_MISC1_PAUSE: u32 = 1 << 23;
        const SVM_INTERCEPT_MISC1_SHUTDOWN: u32 = 1 << 31;
        const SVM_INTERCEPT_MISC2_VMRUN: u32 = 1 << 0;
        const SVM_INTERCEPT_MISC2_VMMCALL: u32 = 1 << 1;
        const SVM_INTERCEPT_MISC2_XSETBV: u32 = 1 << 2;
        const SVM_NP_ENABLE_NP_ENABLE: u64 = 1 << 0;
        const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;
        const CR_BIT0: u16 = 1 << 0;
        const CR_BIT3: u16 = 1 << 3;
        const CR_BIT4: u16 = 1 << 4;

        // Need to specify the address of the host state-save area before executing
        // the VMRUN instruction. The host state-save area is where the processor
        // saves the host (ie, current) register values on execution of `VMRUN`.
        //
        // "The VMRUN instruction saves some host processor state information in
        //  the host state-save area in main memory at the physical address
        //  specified in the VM_HSAVE_PA MSR".
        // See: 15.5.1 Basic Operation
        wrmsr(SVM_MSR_VM_HSAVE_PA, addr_of!(*self.host_state) as u64);

        // Intercept external interrupts, the PAUSE instruction and shutdown.
        // Additionally, intercept the VMRUN instruction which is a HW requirement.
        //
        // We intercept external interrupts and PAUSE as an attempt to gain control
        // even if the guest is in an infinite loop, although this is not a perfect
        // solution. PAUSE causes #VMEXIT when it is executed u16::MAX times.
        //
        // We also intercept shutdown to prevent the guest from causing system
        // reset. We want to abort the guest instead. Note that, on Intel, event
        // that would normally cause system reset, eg, triple fault, are
        // intercepted by default.
        //
        // See: 15.13.1 INTR Intercept
        // See: 15.14.3 Shutdown Intercept
        // See: 15.14.4 Pause Intercept Filtering
        self.vmcb.control_area.intercept_misc1 = SVM_INTERCEPT_MISC1_INTR
            | SVM_INTERCEPT_MISC1_PAUSE
            | SVM_INTERCEPT_MISC1_SHUTDOWN
            | SVM_INTERCEPT_MISC1_CPUID
            | SVM_INTERCEPT_MISC1_INVLPG
            | SVM_INTERCEPT_MISC1_IOIO
            | SVM_INTERCEPT_MISC1_MSR;
        self.vmcb.control_area.intercept_misc2 =
            SVM_INTERCEPT_MISC2_VMRUN | SVM_INTERCEPT_MISC2_VMMCALL | SVM_INTERCEPT_MISC2_XSETBV;
        self.vmcb.control_area.intercept_cr_write = CR_BIT0 | CR_BIT3 | CR_BIT4;
        self.vmcb.control_area.pause_filter_count = u16::MAX;

        // Address Space Identifier (ASID) is useful when the given logical processor
        // runs more than one guests. We do not but still need to set non-zero value.
        // See: 15.16 TLB Control
        self.vmcb.control_area.guest_asid = 1;

        // Enable nested paging. This is done by:
        // - Setting the NP_ENABLE bit in VMCB, and
        // - Setting the base address of the nested PML4
        //
        // See: 15.25.3 Enabling Nested Paging
        //
        // Left unset (NP_ENABLE = 0, NCR3 = 0) for the shadow-paging
        // fallback; guest CR3 writes then load the real hardware register
        // directly, which is why that path seeds it with a shadow root
        // instead of a guest-controlled value.
        if let Some(nested_pml4_addr) = nested_pml4_addr {
            self.vmcb.control_area.np_enable = SVM_NP_ENABLE_NP_ENABLE;
            self.vmcb.control_area.ncr3 = nested_pml4_addr;
        }

        // Intercept #BP, #UD, #PF.
        // See: 15.12 Exception Intercepts
        self.vmcb.control_area.intercept_exception = (1u32 << irq::BREAKPOINT_VECTOR)
            | (1u32 << irq::INVALID_OPCODE_VECTOR)
            | (1u32 << irq::PAGE_FAULT_VECTOR);
    }

    /// Loads the fixed real-mode MBR entry state into the VMCB state-save
    /// area. Unlike VT-x, SVM needs no special enablement to run a guest in
    /// real mode under nested paging.
    fn load_initial_guest_state(&mut self, drive: u8) {
        const MBR_ENTRY_IP: u64 = 0x7c00;
        const REAL_MODE_CODE_ATTRIB: u16 = 0x9b;
        const REAL_MODE_DATA_ATTRIB: u16 = 0x93;
        const REAL_MODE_SEGMENT_LIMIT: u32 = 0xFFFF;

        self.vmcb.state_save_area.es_selector = 0;
        self.vmcb.state_save_area.cs_selector = 0;
        self.vmcb.state_save_area.ss_selector = 0;
        self.vmcb.state_save_area.ds_selector = 0;
        self.vmcb.state_save_area.fs_selector = 0;
        self.vmcb.state_save_area.gs_selector = 0;
        self.vmcb.state_save_area.tr_selector = 0;
        self.vmcb.state_save_area.ldtr_selector = 0;
        self.vmcb.state_save_area.cs_attrib = REAL_MODE_CODE_ATTRIB;
        self.vmcb.state_save_area.es_attrib = REAL_MODE_DATA_ATTRIB;
        self.vmcb.state_save_area.ss_attrib = REAL_MODE_DATA_ATTRIB;
        self.vmcb.state_save_area.ds_attrib = REAL_MODE_DATA_ATTRIB;
        self.vmcb.state_save_area.fs_attrib = REAL_MODE_DATA_ATTRIB;
        self.vmcb.state_save_area.gs_attrib = REAL_MODE_DATA_ATTRIB;
        self.vmcb.state_save_area.tr_attrib = 0;
        self.vmcb.state_save_area.ldtr_attrib = 0;
        self.vmcb.state_save_area.es_limit = REAL_MODE_SEGMENT_LIMIT;
        self.vmcb.state_save_area.cs_limit = REAL_MODE_SEGMENT_LIMIT;
        self.vmcb.state_save_area.ss_limit = REAL_MODE_SEGMENT_LIMIT;
        self.vmcb.state_save_area.ds_limit = REAL_MODE_SEGMENT_LIMIT;
        self.vmcb.state_save_area.fs_limit = REAL_MODE_SEGMENT_LIMIT;
        self.vmcb.state_save_area.gs_limit = REAL_MODE_SEGMENT_LIMIT;
        self.vmcb.state_save_area.tr_limit = 0;
        self.vmcb.state_save_area.ldtr_limit = 0;
        self.vmcb.state_save_area.fs_base = 0;
        self.vmcb.state_save_area.gs_base = 0;
        self.vmcb.state_save_area.tr_base = 0;
        self.vmcb.state_save_area.ldtr_base = 0;
        self.vmcb.state_save_area.gdtr_base = 0;
        self.vmcb.state_save_area.gdtr_limit = 0;
        self.vmcb.state_save_area.idtr_base = 0;
        self.vmcb.state_save_area.idtr_limit = 0x3ff; // real-mode IVT
        self.vmcb.state_save_area.sysenter_cs = 0;
        self.vmcb.state_save_area.sysenter_esp = 0;
        self.vmcb.state_save_area.sysenter_eip = 0;
        self.vmcb.state_save_area.efer = 0;
        self.vmcb.state_save_area.cr0 = 0x10; // ET set, PE/PG clear: real mode
        self.vmcb.state_save_area.cr3 = 0;
        self.vmcb.state_save_area.cr4 = 0;
        self.vmcb.state_save_area.rip = MBR_ENTRY_IP;
        self.vmcb.state_save_area.rsp = MBR_ENTRY_IP;
        self.vmcb.state_save_area.rflags = 0x2; // reserved bit 1, IF clear
        self.vmcb.state_save_area.rax = 0;
        self.vmcb.state_save_area.gpat = rdmsr(x86::msr::IA32_PAT);

        self.registers = GuestRegisters {
            rdx: u64::from(drive),
            rip: MBR_ENTRY_IP,
            rsp: MBR_ENTRY_IP,
            rflags: 0x2,
            ..GuestRegisters::default()
        };
    }

    /// Executes the guest until it triggers #VMEXIT.
    fn run(&mut self) -> VmExitReason {
        const VMEXIT_EXCP0: u64 = 0x40;
        const VMEXIT_EXCP31: u64 = 0x5f;
        const VMEXIT_INTR: u64 = 0x60;
        const VMEXIT_PAUSE: u64 = 0x77;
        const VMEXIT_RESET: u64 = 0x7f;
        const VMEXIT_NPF: u64 = 0x400;
        const VMEXIT_CR0_WRITE: u64 = 0x10;
        const VMEXIT_CR3_WRITE: u64 = 0x13;
        const VMEXIT_CR4_WRITE: u64 = 0x14;
        const VMEXIT_INVLPG: u64 = 0x4e;
        const VMEXIT_CPUID: u64 = 0x72;
        const VMEXIT_MSR: u64 = 0x7c;
        const VMEXIT_IOIO: u64 = 0x7b;
        const VMEXIT_VMMCALL: u64 = 0x81;
        const VMEXIT_TASK_SWITCH: u64 = 0x43;
        const VMEXIT_XSETBV: u64 = 0x8d;

        // VMRUN loads every other GPR from the real register file (the asm
        // trampoline sets those from `self.registers` directly), but RAX is
        // special: the instruction's own operand is the VMCB's physical
        // address, so the guest's RAX has to travel through the state-save
        // area instead. Keep it in sync before entry; the symmetric read is
        // below, after #VMEXIT.
        self.vmcb.state_save_area.rax = self.registers.rax;

        // Run the VM until the #VMEXIT occurs.
        unsafe { run_vm_svm(&mut self.registers, addr_of_mut!(*self.vmcb)) };

        // #VMEXIT occurred. Copy the guest register values from VMCB so that
        // `self.registers` is complete and up to date.
        self.registers.rax = self.vmcb.state_save_area.rax;
        self.registers.rip = self.vmcb.state_save_area.rip;
        self.registers.rsp = self.vmcb.state_save_area.rsp;
        self.registers.rflags = self.vmcb.state_save_area.rflags;

        // We might have requested flushing TLB. Clear the request.
        self.vmcb.control_area.tlb_control = 0;

        // Handle #VMEXIT by translating it to the `VmExitReason` type.
        //
        // "On #VMEXIT, the processor:
        //  (...)
        //  - Saves the reason for exiting the guest in the VMCB's EXITCODE field."
        // See: 15.6 #VMEXIT
        //
        // For the list of possible exit codes,
        // See: Appendix C SVM Intercept Exit Codes
        match self.vmcb.control_area.exit_code {
            // See: 15.12 Exception Intercepts
            VMEXIT_EXCP0..=VMEXIT_EXCP31 => VmExitReason::Exception(ExceptionQualification {
                rip: self.registers.rip,
                exception_code: GuestException::try_from(
                    (self.vmcb.control_area.exit_code - VMEXIT_EXCP0) as u8,
                )
                .unwrap(),
            }),
            // See: 15.25.6 Nested versus Guest Page Faults, Fault Ordering
            VMEXIT_NPF => VmExitReason::NestedPageFault(NestedPageFaultQualification {
                rip: self.registers.rip,
                gpa: self.vmcb.control_area.exit_info2,
                missing_translation: (self.vmcb.control_area.exit_info1 & 0b1) == 0,
                write_access: (self.vmcb.control_area.exit_info1 & 0b10) != 0,
            }),
            // See: 15.13.1 INTR Intercept
            // See: 15.14.4 Pause Intercept Filtering
            VMEXIT_INTR | VMEXIT_PAUSE => VmExitReason::ExternalInterruptOrPause,
            // See: 15.14.3 Shutdown Intercept
            VMEXIT_RESET => VmExitReason::Shutdown(self.vmcb.control_area.exit_code),
            VMEXIT_CR0_WRITE => VmExitReason::MovToCr(0),
            VMEXIT_CR3_WRITE => VmExitReason::MovToCr(3),
            VMEXIT_CR4_WRITE => VmExitReason::MovToCr(4),
            VMEXIT_INVLPG => VmExitReason::Invlpg,
            VMEXIT_CPUID => VmExitReason::Cpuid,
            VMEXIT_MSR => VmExitReason::Msr {
                write: self.vmcb.control_area.exit_info1 != 0,
            },
            // See: Table 15-8. IOIO_INFO Field
            VMEXIT_IOIO => {
                let info = self.vmcb.control_area.exit_info1;
                let size = if info & (1 << 4) != 0 {
                    1
                } else if info & (1 << 5) != 0 {
                    2
                } else {
                    4
                };
                VmExitReason::Io(IoQualification {
                    port: (info >> 16) as u16,
                    size,
                    is_in: (info & 0b1) != 0,
                    string: (info & (1 << 2)) != 0,
                    rep: (info & (1 << 3)) != 0,
                })
            }
            VMEXIT_VMMCALL => VmExitReason::Hypercall,
            // See: Table 15-7. EXITINFO2 for Task Switch Intercept
            VMEXIT_TASK_SWITCH => {
                let info2 = self.vmcb.control_area.exit_info2;
                let source = if (info2 >> 38) & 1 != 0 {
                    TaskSwitchSource::Jump
                } else if (info2 >> 36) & 1 != 0 {
                    TaskSwitchSource::Iret
                } else {
                    TaskSwitchSource::CallOrInterrupt
                };
                VmExitReason::TaskSwitch(TaskSwitchQualification {
                    to_selector: (self.vmcb.control_area.exit_info1 & 0xFFFF) as u16,
                    source,
                    has_error_code: (info2 >> 44) & 1 != 0,
                })
            }
            VMEXIT_XSETBV => VmExitReason::Xsetbv,
            // Anything else.
            _ => VmExitReason::Unexpected(self.vmcb.control_area.exit_code),
        }
    }

    /// Invalidates caches of the nested paging structures.
    fn invalidate_caches(&mut self) {
        // Flushes this guest's TLB entries.
        // See: Table 15-9. TLB Control Byte Encodings
        self.vmcb.control_area.tlb_control = 0b11;
    }

    /// Gets a flag value to be set to nested paging structure entries for the
    /// given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        // SVM uses the exact same layout as the standard paging structure entries
        // for nested paging structure entries. We also assume leaving the PWT, PCD, and
        // PAT bits zero in the entry results in the write-back memory type. Thus,
        // `NestedPagingStructureEntryType::Wb*` types results in the same permission
        // bits as `NestedPagingStructureEntryType::*` types.
        match entry_type {
            // Valid, Writeable, User
            NestedPagingStructureEntryType::Rwx | NestedPagingStructureEntryType::RwxWriteBack => {
                NestedPagingStructureEntryFlags {
                    permission: 0b111,
                    memory_type: 0,
                }
            }
            // Valid, NON writable, User
            NestedPagingStructureEntryType::RxWriteBack => NestedPagingStructureEntryFlags {
                permission: 0b101,
                memory_type: 0,
            },
        }
    }

    fn general_reg(&self, reg: super::GpReg) -> u64 {
        use super::GpReg;
        match reg {
            GpReg::Rax => self.registers.rax,
            GpReg::Rcx => self.registers.rcx,
            GpReg::Rdx => self.registers.rdx,
            GpReg::Rbx => self.registers.rbx,
            GpReg::Rsp => self.registers.rsp,
            GpReg::Rbp => self.registers.rbp,
            GpReg::Rsi => self.registers.rsi,
            GpReg::Rdi => self.registers.rdi,
            GpReg::R8 => self.registers.r8,
            GpReg::R9 => self.registers.r9,
            GpReg::R10 => self.registers.r10,
            GpReg::R11 => self.registers.r11,
            GpReg::R12 => self.registers.r12,
            GpReg::R13 => self.registers.r13,
            GpReg::R14 => self.registers.r14,
            GpReg::R15 => self.registers.r15,
        }
    }

    fn set_general_reg(&mut self, reg: super::GpReg, value: u64) {
        use super::GpReg;
        let slot = match reg {
            GpReg::Rax => &mut self.registers.rax,
            GpReg::Rcx => &mut self.registers.rcx,
            GpReg::Rdx => &mut self.registers.rdx,
            GpReg::Rbx => &mut self.registers.rbx,
            GpReg::Rsp => &mut self.registers.rsp,
            GpReg::Rbp => &mut self.registers.rbp,
            GpReg::Rsi => &mut self.registers.rsi,
            GpReg::Rdi => &mut self.registers.rdi,
            GpReg::R8 => &mut self.registers.r8,
            GpReg::R9 => &mut self.registers.r9,
            GpReg::R10 => &mut self.registers.r10,
            GpReg::R11 => &mut self.registers.r11,
            GpReg::R12 => &mut self.registers.r12,
            GpReg::R13 => &mut self.registers.r13,
            GpReg::R14 => &mut self.registers.r14,
            GpReg::R15 => &mut self.registers.r15,
        };
        *slot = value;
    }

    fn ip(&self) -> u64 {
        self.registers.rip
    }

    fn set_ip(&mut self, value: u64) {
        self.registers.rip = value;
        self.vmcb.state_save_area.rip = value;
    }

    // Only meaningful when the processor supports `NRIP_SAVE` (advertised via
    // CPUID 8000_000A:EDX); `nrip` reads 0 otherwise and the caller must fall
    // back to decoding the trapping instruction itself.
    fn instruction_len(&self) -> u64 {
        let nrip = self.vmcb.control_area.nrip;
        if nrip == 0 {
            0
        } else {
            nrip.saturating_sub(self.registers.rip)
        }
    }

    fn flags(&self) -> u64 {
        self.registers.rflags
    }

    fn set_flags(&mut self, value: u64) {
        self.registers.rflags = value;
        self.vmcb.state_save_area.rflags = value;
    }

    fn guest_cr(&self, n: u8) -> u64 {
        match n {
            0 => self.vmcb.state_save_area.cr0,
            3 => self.vmcb.state_save_area.cr3,
            4 => self.vmcb.state_save_area.cr4,
            _ => unreachable!("only CR0/CR3/CR4 are intercepted"),
        }
    }

    fn set_guest_cr(&mut self, n: u8, value: u64) {
        match n {
            0 => self.vmcb.state_save_area.cr0 = value,
            3 => self.vmcb.state_save_area.cr3 = value,
            4 => self.vmcb.state_save_area.cr4 = value,
            _ => unreachable!("only CR0/CR3/CR4 are intercepted"),
        }
    }

    /// The VMCB's `*_attrib` fields already use the packed
    /// type/S/DPL/P/AVL/L/D-B/G layout [`SegmentState::attr`] documents, so
    /// this is a direct field copy with no bit rearrangement.
    fn segment(&self, seg: SegReg) -> SegmentState {
        let ssa = &self.vmcb.state_save_area;
        match seg {
            SegReg::Es => SegmentState { selector: ssa.es_selector, base: ssa.es_base, limit: ssa.es_limit, attr: ssa.es_attrib },
            SegReg::Cs => SegmentState { selector: ssa.cs_selector, base: ssa.cs_base, limit: ssa.cs_limit, attr: ssa.cs_attrib },
            SegReg::Ss => SegmentState { selector: ssa.ss_selector, base: ssa.ss_base, limit: ssa.ss_limit, attr: ssa.ss_attrib },
            SegReg::Ds => SegmentState { selector: ssa.ds_selector, base: ssa.ds_base, limit: ssa.ds_limit, attr: ssa.ds_attrib },
            SegReg::Fs => SegmentState { selector: ssa.fs_selector, base: ssa.fs_base, limit: ssa.fs_limit, attr: ssa.fs_attrib },
            SegReg::Gs => SegmentState { selector: ssa.gs_selector, base: ssa.gs_base, limit: ssa.gs_limit, attr: ssa.gs_attrib },
            SegReg::Tr => SegmentState { selector: ssa.tr_selector, base: ssa.tr_base, limit: ssa.tr_limit, attr: ssa.tr_attrib },
            SegReg::Ldtr => SegmentState { selector: ssa.ldtr_selector, base: ssa.ldtr_base, limit: ssa.ldtr_limit, attr: ssa.ldtr_attrib },
        }
    }

    fn set_segment(&mut self, seg: SegReg, value: SegmentState) {
        let ssa = &mut self.vmcb.state_save_area;
        match seg {
            SegReg::Es => {
                ssa.es_selector = value.selector;
                ssa.es_base = value.base;
                ssa.es_limit = value.limit;
                ssa.es_attrib = value.attr;
            }
            SegReg::Cs => {
                ssa.cs_selector = value.selector;
                ssa.cs_base = value.base;
                ssa.cs_limit = value.limit;
                ssa.cs_attrib = value.attr;
            }
            SegReg::Ss => {
                ssa.ss_selector = value.selector;
                ssa.ss_base = value.base;
                ssa.ss_limit = value.limit;
                ssa.ss_attrib = value.attr;
            }
            SegReg::Ds => {
                ssa.ds_selector = value.selector;
                ssa.ds_base = value.base;
                ssa.ds_limit = value.limit;
                ssa.ds_attrib = value.attr;
            }
            SegReg::Fs => {
                ssa.fs_selector = value.selector;
                ssa.fs_base = value.base;
                ssa.fs_limit = value.limit;
                ssa.fs_attrib = value.attr;
            }
            SegReg::Gs => {
                ssa.gs_selector = value.selector;
                ssa.gs_base = value.base;
                ssa.gs_limit = value.limit;
                ssa.gs_attrib = value.attr;
            }
            SegReg::Tr => {
                ssa.tr_selector = value.selector;
                ssa.tr_base = value.base;
                ssa.tr_limit = value.limit;
                ssa.tr_attrib = value.attr;
            }
            SegReg::Ldtr => {
                ssa.ldtr_selector = value.selector;
                ssa.ldtr_base = value.base;
                ssa.ldtr_limit = value.limit;
                ssa.ldtr_attrib = value.attr;
            }
        }
    }

    fn gdtr(&self) -> (u64, u32) {
        (self.vmcb.state_save_area.gdtr_base, self.vmcb.state_save_area.gdtr_limit)
    }

    /// Queues an injection via the VMCB `EVENTINJ` field.
    /// See: 15.20 Event Injection
    fn inject_event(&mut self, event: super::PendingEvent) {
        const VALID: u64 = 1 << 31;
        const TYPE_EXTERNAL_INTERRUPT: u64 = 0 << 8;
        const TYPE_NMI: u64 = 2 << 8;
        const TYPE_HARDWARE_EXCEPTION: u64 = 3 << 8;
        const TYPE_SOFTWARE_INTERRUPT: u64 = 4 << 8;
        const DELIVER_ERROR_CODE: u64 = 1 << 11;

        let kind_bits = match event.kind {
            super::PendingEventKind::ExternalInterrupt => TYPE_EXTERNAL_INTERRUPT,
            super::PendingEventKind::NonMaskableInterrupt => TYPE_NMI,
            super::PendingEventKind::HardwareException => TYPE_HARDWARE_EXCEPTION,
            super::PendingEventKind::SoftwareInterrupt => TYPE_SOFTWARE_INTERRUPT,
        };
        let mut event_inj = VALID | kind_bits | u64::from(event.vector);
        if let Some(error_code) = event.error_code {
            event_inj |= DELIVER_ERROR_CODE | (u64::from(error_code) << 32);
        }
        self.vmcb.control_area.event_inj = event_inj;
    }
}

impl Svm {
    pub(crate) fn new() -> Self {
        let vmcb = unsafe { Box::<Vmcb>::new_zeroed().assume_init() };
        let host_state = unsafe { Box::<HostStateArea>::new_zeroed().assume_init() };
        Self {
            vmcb,
            host_state,
            ..Default::default()
        }
    }
}

/// The virtual machine control block (VMCB), which describes a virtual machine
/// (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
struct Vmcb {
    control_area: ControlArea,
    state_save_area: StateSaveArea,
}
const _: () = assert!(size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where we can specify what operations to intercept and
/// can read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct ControlArea {
    intercept_cr_read: u16,   // +0x000
    intercept_cr_write: u16,  // +0x002
    intercept_dr_read: u16,   // +0x004
    intercept_dr_write: u16,  // +0x006
    intercept_exception: u32, // +0x008
    intercept_misc1: u32,     // +0x00c
    intercept_misc2: u32,     // +0x010
    intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pause_filter_threshold: u16, // +0x03c
    pause_filter_count: u16,  // +0x03e
    iopm_base_pa: u64,        // +0x040
    msrpm_base_pa: u64,       // +0x048
    tsc_offset: u64,          // +0x050
    guest_asid: u32,          // +0x058
    tlb_control: u32,         // +0x05c
    vintr: u64,               // +0x060
    interrupt_shadow: u64,    // +0x068
    exit_code: u64,           // +0x070
    exit_info1: u64,          // +0x078
    exit_info2: u64,          // +0x080
    exit_int_info: u64,       // +0x088
    np_enable: u64,           // +0x090
    avic_apic_bar: u64,       // +0x098
    guest_pa_pf_ghcb: u64,    // +0x0a0
    event_inj: u64,           // +0x0a8
    ncr3: u64,                // +0x0b0
    lbr_virtualization_enable: u64, // +0x0b8
    vmcb_clean: u64,          // +0x0c0
    nrip: u64,                // +0x0c8
    num_of_bytes_fetched: u8, // +0x0d0
    guest_instruction_bytes: [u8; 15], // +0x0d1
    avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    _padding2: u64, // +0x0e8
    avic_logical_table_pointer: u64, // +0x0f0
    avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    _padding3: u64, // +0x100
    vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(size_of::<ControlArea>() == 0x400);

/// The ares to specify and read guest register values.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct StateSaveArea {
    es_selector: u16,   // +0x000
    es_attrib: u16,     // +0x002
    es_limit: u32,      // +0x004
    es_base: u64,       // +0x008
    cs_selector: u16,   // +0x010
    cs_attrib: u16,     // +0x012
    cs_limit: u32,      // +0x014
    cs_base: u64,       // +0x018
    ss_selector: u16,   // +0x020
    ss_attrib: u16,     // +0x022
    ss_limit: u32,      // +0x024
    ss_base: u64,       // +0x028
    ds_selector: u16,   // +0x030
    ds_attrib: u16,     // +0x032
    ds_limit: u32,      // +0x034
    ds_base: u64,       // +0x038
    fs_selector: u16,   // +0x040
    fs_attrib: u16,     // +0x042
    fs_limit: u32,      // +0x044
    fs_base: u64,       // +0x048
    gs_selector: u16,   // +0x050
    gs_attrib: u16,     // +0x052
    gs_limit: u32,      // +0x054
    gs_base: u64,       // +0x058
    gdtr_selector: u16, // +0x060
    gdtr_attrib: u16,   // +0x062
    gdtr_limit: u32,    // +0x064
    gdtr_base: u64,     // +0x068
    ldtr_selector: u16, // +0x070
    ldtr_attrib: u16,   // +0x072
    ldtr_limit: u32,    // +0x074
    ldtr_base: u64,     // +0x078
    idtr_selector: u16, // +0x080
    idtr_attrib: u16,   // +0x082
    idtr_limit: u32,    // +0x084
    idtr_base: u64,     // +0x088
    tr_selector: u16,   // +0x090
    tr_attrib: u16,     // +0x092
    tr_limit: u32,      // +0x094
    tr_base: u64,       // +0x098
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    cpl: u8,            // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32, // +0x0cc
    efer: u64,          // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    cr4: u64,           // +0x148
    cr3: u64,           // +0x150
    cr0: u64,           // +0x158
    dr7: u64,           // +0x160
    dr6: u64,           // +0x168
    rflags: u64,        // +0x170
    rip: u64,           // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    rsp: u64,           // +0x1d8
    s_cet: u64,         // +0x1e0
    ssp: u64,           // +0x1e8
    isst_addr: u64,     // +0x1f0
    rax: u64,           // +0x1f8
    star: u64,          // +0x200
    lstar: u64,         // +0x208
    cstar: u64,         // +0x210
    sf_mask: u64,       // +0x218
    kernel_gs_base: u64, // +0x220
    sysenter_cs: u64,   // +0x228
    sysenter_esp: u64,  // +0x230
    sysenter_eip: u64,  // +0x238
    cr2: u64,           // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    gpat: u64,          // +0x268
    dbg_ctl: u64,       // +0x270
    br_from: u64,       // +0x278
    br_to: u64,         // +0x280
    last_excep_from: u64, // +0x288
    last_excep_to: u64, // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298], // +0x298
    spec_ctl: u64,      // +0x2e0
}
const _: () = assert!(size_of::<StateSaveArea>() == 0x2e8);

/// 4KB block of memory where the host state is saved to on VMRUN and loaded
/// from on #VMEXIT.
///
/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
// doc_markdown: clippy confused with "VM_HSAVE_PA"
#[allow(clippy::doc_markdown)]
#[repr(C, align(4096))]
struct HostStateArea([u8; 0x1000]);
const _: () = assert!(size_of::<HostStateArea>() == 0x1000);

impl Default for HostStateArea {
    fn default() -> Self {
        Self([0; 4096])
    }
}

extern "efiapi" {
    /// Runs the guest until #VMEXIT occurs.
    fn run_vm_svm(registers: &mut GuestRegisters, guest_vmcb_pa: *mut Vmcb);
}
global_asm!(include_str!("svm_run_vm.S"));
