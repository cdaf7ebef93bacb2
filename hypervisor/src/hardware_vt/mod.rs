//! The module containing vendor agnostic representation of HW VT
//! (hardware-assisted virtualization technology) related definitions.

pub(crate) mod svm;
pub(crate) mod vmx;

use bitfield::bitfield;
use core::fmt;
use x86::{
    current::paging::{BASE_PAGE_SHIFT, PAGE_SIZE_ENTRIES},
    irq,
};

/// This trait represents an interface to enable HW VT, setup and run a single
/// virtual machine instance on the current processor.
pub(crate) trait HardwareVt: fmt::Debug {
    /// Enables HW VT on the current processor. It has to be called exactly once
    /// before calling any other method.
    fn enable(&mut self);

    /// Configures HW VT such as enabling nested paging and exception
    /// interception. `nested_pml4_addr` is `None` on hardware that lacks
    /// nested paging (checked via [`Self::supports_nested_paging`]); such a
    /// vCPU runs without hardware second-level translation and relies on
    /// software shadow page tables instead (see `paging::shadow`).
    fn initialize(&mut self, nested_pml4_addr: Option<u64>);

    /// Whether this processor's VT implementation supports hardware nested
    /// paging (EPT on VT-x, NPT on SVM). Checked once per vCPU, before
    /// [`Self::initialize`], to decide between hardware nested paging and
    /// the software shadow-paging fallback.
    fn supports_nested_paging(&self) -> bool;

    /// Loads the fixed initial architectural state a freshly created vCPU
    /// resumes into: real mode, paging disabled, `CS:IP = 0000:7C00` (the
    /// standard MBR load point), `DL` set to `drive` (the BIOS boot-drive
    /// convention). Guest-physical memory at and around the entry point is
    /// populated by whatever booted this hypervisor, not by this call.
    fn load_initial_guest_state(&mut self, drive: u8);

    /// Executes the guest until it triggers VM exit.
    fn run(&mut self) -> VmExitReason;

    /// Invalidates caches of the nested paging structures.
    fn invalidate_caches(&mut self);

    /// Gets a flag value to be set to nested paging structure entries for the
    /// given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags;

    /// Reads a general-purpose register out of the last-exited guest state.
    fn general_reg(&self, reg: GpReg) -> u64;

    /// Writes a general-purpose register, observed on the next VM-entry.
    fn set_general_reg(&mut self, reg: GpReg, value: u64);

    /// The guest instruction pointer at the last VM-exit.
    fn ip(&self) -> u64;

    /// Sets the instruction pointer the next VM-entry resumes at; used by
    /// the interpreter to skip over an emulated instruction.
    fn set_ip(&mut self, value: u64);

    /// The length, in bytes, of the instruction that caused the last
    /// VM-exit, when the hardware reports it directly (VT-x always does;
    /// SVM only when `NRIP_SAVE` is supported, reporting 0 otherwise). A
    /// dispatcher that needs to advance past the trapping instruction on a
    /// platform reporting 0 must decode it itself.
    fn instruction_len(&self) -> u64;

    /// The guest RFLAGS at the last VM-exit.
    fn flags(&self) -> u64;

    /// Sets RFLAGS, observed on the next VM-entry.
    fn set_flags(&mut self, value: u64);

    /// Queues `event` for injection on the next VM-entry. Only one event
    /// may be pending at a time; the caller is responsible for the
    /// re-queue-on-aborted-entry rule.
    fn inject_event(&mut self, event: PendingEvent);

    /// Reads guest `CR0`, `CR3`, or `CR4` (`n` is 0, 3, or 4).
    fn guest_cr(&self, n: u8) -> u64;

    /// Writes guest `CR0`, `CR3`, or `CR4`, observed on the next VM-entry.
    fn set_guest_cr(&mut self, n: u8, value: u64);

    /// Reads one of the eight addressable segment registers plus `TR`/`LDTR`.
    fn segment(&self, seg: SegReg) -> SegmentState;

    /// Reloads a segment register's descriptor cache directly, bypassing
    /// the GDT walk a real segment-register load performs; used by task
    /// switch emulation, which has already done that walk itself.
    fn set_segment(&mut self, seg: SegReg, value: SegmentState);

    /// The guest `GDTR`: `(base, limit)`.
    fn gdtr(&self) -> (u64, u32);
}

/// The eight addressable segment registers plus `TR`/`LDTR`, as a unit task
/// switch emulation and descriptor-table work read and reload together.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Tr,
    Ldtr,
}

/// A segment register's descriptor-cache contents: the selector visible to
/// the guest, plus the base/limit/access-rights a real segment load would
/// fetch from the GDT/LDT. `attr` is packed the way a raw segment descriptor
/// and SVM's VMCB `*_attrib` fields already are - bits 0-7 hold
/// type/S/DPL/P, bits 8-11 hold AVL/L/D-B/G - so SVM stores it unconverted;
/// VT-x's access-rights field reorders the top nibble and is converted at
/// the call site in `vmx.rs`.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SegmentState {
    pub(crate) selector: u16,
    pub(crate) base: u64,
    pub(crate) limit: u32,
    pub(crate) attr: u16,
}

/// Which direction caused a task switch: a plain `CALL`/software interrupt
/// nests the outgoing task (sets `NT`, links back to it); `IRET`/a direct
/// `JMP` does not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TaskSwitchSource {
    CallOrInterrupt,
    Iret,
    Jump,
}

/// Details of an SVM task-switch VM exit, decoded from `EXITINFO1`/
/// `EXITINFO2` (VT-x completes task switches itself and never exits for
/// one).
#[derive(Clone, Copy, Debug)]
pub(crate) struct TaskSwitchQualification {
    pub(crate) to_selector: u16,
    pub(crate) source: TaskSwitchSource,
    /// Set when the processor also pushed a hardware error code for the
    /// exception that caused this switch; emulating that case needs the
    /// error-code-aware incoming-TSS layout this dispatcher does not build.
    pub(crate) has_error_code: bool,
}

/// The general-purpose registers addressable by the `ModRM`/opcode decode,
/// in the order the x86 `reg` field encodes them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum GpReg {
    Rax,
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
}

/// The kind of event a [`PendingEvent`] carries, mirroring the VMCS
/// "VM-entry interruption-information field" / VMCB `EVENTINJ` taxonomy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PendingEventKind {
    ExternalInterrupt,
    NonMaskableInterrupt,
    HardwareException,
    SoftwareInterrupt,
}

/// A single queued injection (spec §3 "Pending event"). At most one may be
/// pending per vCPU; re-queued whole if the VM-entry that would have
/// delivered it is itself aborted.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingEvent {
    pub(crate) vector: u8,
    pub(crate) kind: PendingEventKind,
    pub(crate) error_code: Option<u32>,
}

/// Reasons of VM exit.
pub(crate) enum VmExitReason {
    /// An address translation failure with nested paging. Contains a guest
    /// physical address that failed translation and whether the access was
    /// write access.
    NestedPageFault(NestedPageFaultQualification),

    /// An exception happened. Contains an exception code.
    Exception(ExceptionQualification),

    /// An external interrupt occurred, or `PAUSE` was executed more than
    /// certain times.
    ExternalInterruptOrPause,

    /// The guest ran long enough to use up its time slice.
    TimerExpiration,

    /// The logical processor entered the shutdown state, eg, triple fault.
    Shutdown(u64),

    /// The guest executed `CPUID`.
    Cpuid,

    /// The guest executed `RDMSR`/`WRMSR`. `write` distinguishes the two.
    Msr { write: bool },

    /// The guest executed an `IN`/`OUT` family instruction.
    Io(IoQualification),

    /// The guest executed `VMMCALL`/`VMCALL` (the hypercall ABI).
    Hypercall,

    /// The guest executed `INVLPG`.
    Invlpg,

    /// The guest wrote `CR0`, `CR3`, or `CR4`. Contains which one.
    MovToCr(u8),

    /// The guest executed `XSETBV`.
    Xsetbv,

    /// The guest attempted a task switch that hardware does not complete on
    /// its own (SVM only; VT completes these without an exit).
    TaskSwitch(TaskSwitchQualification),

    /// An unhandled VM exit happened. Contains a vendor specific VM exit code.
    Unexpected(u64),
}

/// Details of the cause of nested page fault.
#[derive(Debug)]
pub(crate) struct NestedPageFaultQualification {
    #[allow(unused)]
    pub(crate) rip: u64,
    pub(crate) gpa: u64,
    pub(crate) missing_translation: bool,
    pub(crate) write_access: bool,
}

pub(crate) struct ExceptionQualification {
    pub(crate) rip: u64,
    pub(crate) exception_code: GuestException,
}

/// Details of an `IN`/`OUT` VM exit, decoded from the vendor-specific exit
/// qualification (VMX `EXIT_QUALIFICATION`, SVM `EXITINFO1`) so the
/// dispatcher's I/O emulation stays vendor agnostic.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IoQualification {
    pub(crate) port: u16,
    /// Operand width in bytes: 1, 2, or 4.
    pub(crate) size: u8,
    pub(crate) is_in: bool,
    pub(crate) string: bool,
    pub(crate) rep: bool,
}

/// The cause of guest exception.
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum GuestException {
    BreakPoint,
    InvalidOpcode,
    PageFault,
}

impl TryFrom<u8> for GuestException {
    type Error = &'static str;

    fn try_from(vector: u8) -> Result<Self, Self::Error> {
        match vector {
            irq::BREAKPOINT_VECTOR => Ok(GuestException::BreakPoint),
            irq::INVALID_OPCODE_VECTOR => Ok(GuestException::InvalidOpcode),
            irq::PAGE_FAULT_VECTOR => Ok(GuestException::PageFault),
            _ => Err("Vector of the exception that is not intercepted"),
        }
    }
}

/// Permissions and memory types to be specified for nested paging structure
/// entries.
pub(crate) enum NestedPagingStructureEntryType {
    /// Readable, writable, executable.
    Rwx,

    /// Readable, writable, executable, with the write-back memory type.
    RwxWriteBack,

    /// Readable, NON writable, executable, with the write-back memory type.
    RxWriteBack,
}

/// The values used to initialize [`NestedPagingStructureEntry`].
#[derive(Clone, Copy)]
pub(crate) struct NestedPagingStructureEntryFlags {
    pub(crate) permission: u8,
    pub(crate) memory_type: u8,
}

/// The collection of the guest general purpose register values.
#[derive(Debug, Default)]
#[repr(C)]
struct GuestRegisters {
    pub(crate) rax: u64,
    pub(crate) rbx: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) rdi: u64,
    pub(crate) rsi: u64,
    pub(crate) rbp: u64,
    pub(crate) r8: u64,
    pub(crate) r9: u64,
    pub(crate) r10: u64,
    pub(crate) r11: u64,
    pub(crate) r12: u64,
    pub(crate) r13: u64,
    pub(crate) r14: u64,
    pub(crate) r15: u64,
    pub(crate) rip: u64,
    pub(crate) rsp: u64,
    pub(crate) rflags: u64,
}

/// A single nested paging structure.
///
/// This is a extended page table on Intel and a nested page table on AMD. The
/// details of the layout are not represented in this structure so that it may
/// be used for any the structures (PML4, PDPT, PD and PT) across platforms.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(4096))]
pub(crate) struct NestedPagingStructure {
    /// An array of extended page table entry (8 bytes, 512 entries)
    pub(crate) entries: [NestedPagingStructureEntry; PAGE_SIZE_ENTRIES],
}
const _: () = assert!(size_of::<NestedPagingStructure>() == 0x1000);

bitfield! {
    /// Platform independent representation of a nested paging structure entry.
    ///
    /// Because it is platform independent, the layout is not exactly correct.
    /// For example, bit 5:3 `memory_type` exists only on Intel. On AMD, those are
    /// other bits and we set zeros.
    /*
         66665 5     1 110000 000 000
         32109 8.....2 109876 543 210
        +-----+-------+------+---+---+
        |xxxxx|  PFN  |xxxxxx| M | P |
        +-----+-------+------+---+---+
    */
    #[derive(Clone, Copy)]
    pub struct NestedPagingStructureEntry(u64);
    impl Debug;
    permission, set_permission: 2, 0;
    memory_type, set_memory_type: 5, 3;
    flags1, _: 11, 6;
    pub pfn, set_pfn: 58, 12;
    flags2, _: 63, 59;
}

impl NestedPagingStructureEntry {
    /// Returns the next nested paging structures.
    pub(crate) fn next_table_mut(&mut self) -> &mut NestedPagingStructure {
        let next_table_addr = self.pfn() << BASE_PAGE_SHIFT;
        assert!(next_table_addr != 0);
        let next_table_ptr = next_table_addr as *mut NestedPagingStructure;
        unsafe { next_table_ptr.as_mut() }.unwrap()
    }

    /// Sets the address to the next nested paging structure or final physical
    /// address with permissions specified by `flags`.
    pub(crate) fn set_translation(&mut self, pa: u64, flags: NestedPagingStructureEntryFlags) {
        self.set_pfn(pa >> BASE_PAGE_SHIFT);
        self.set_permission(u64::from(flags.permission));
        self.set_memory_type(u64::from(flags.memory_type));
    }
}
