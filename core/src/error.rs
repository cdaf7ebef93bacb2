//! The module containing [`VmmError`], the closed error taxonomy used by every
//! fallible guest-facing operation in this crate.
//!
//! `uefi::Error` is used only at the UEFI boundary (image load, protocol
//! lookups, MP-services calls before `ExitBootServices`). Anything that walks
//! guest-controlled state - page tables, segment descriptors, instruction
//! bytes - returns [`VmmError`] instead, so a malformed guest can never
//! surface a host-specific error type to code that has to decide whether to
//! inject a fault or abort the VM.

use core::fmt;

/// The result type used throughout the guest-facing portions of the VMM.
pub type VmmResult<T> = Result<T, VmmError>;

/// Everything that can go wrong while interpreting guest-physical memory,
/// guest page tables, guest segments or guest instruction streams.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmmError {
    /// A paging-structure entry walked during a guest-physical or
    /// guest-linear translation had its present bit clear.
    PageNotPresent,

    /// The walk reached a page whose access rights do not permit the
    /// requested operation (for example, a write to a read-only page).
    PageNotAccessible,

    /// A paging-structure entry had a reserved bit set that the processor
    /// requires to be zero.
    PageBadReservedBit,

    /// An instruction fetch targeted a page mapped without the execute
    /// right.
    PageNotExecutable,

    /// A segment register pointed at a descriptor whose present bit was
    /// clear.
    GuestSegNotPresent,

    /// A segment register held a selector or the descriptor it points to
    /// was malformed for the requested access.
    InvalidGuestSeg,

    /// Decoding an instruction walked past the 15-byte limit without
    /// terminating, which means the guest instruction stream is corrupt or
    /// does not start on an instruction boundary.
    InstructionTooLong,

    /// The decoder recognized the instruction's length but this crate has
    /// no emulation for its semantics.
    UnsupportedOpcode,

    /// The decoder reached a byte sequence it does not recognize at all.
    UnimplementedOpcode,

    /// An MSR read or write raised `#GP` because the guest addressed an MSR
    /// outside of what the current pass-through policy permits.
    MsrFault,

    /// An allocation from a bounded pool (nested-paging tables, dirty-page
    /// slots, MMIO hook slots) failed because the pool is exhausted.
    NoMem,

    /// A placeholder variant matched in exhaustive `match` arms that are
    /// otherwise unreachable, kept so refactors that add new reachable
    /// variants are forced to revisit those arms instead of silently
    /// compiling against a wildcard.
    AvoidCompilerWarning,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::PageNotPresent => "paging-structure entry not present",
            Self::PageNotAccessible => "page not accessible for the requested operation",
            Self::PageBadReservedBit => "paging-structure entry has a reserved bit set",
            Self::PageNotExecutable => "page not mapped executable",
            Self::GuestSegNotPresent => "guest segment descriptor not present",
            Self::InvalidGuestSeg => "guest segment selector or descriptor invalid",
            Self::InstructionTooLong => "instruction exceeds the 15-byte limit",
            Self::UnsupportedOpcode => "opcode decoded but not emulated",
            Self::UnimplementedOpcode => "opcode not recognized by the decoder",
            Self::MsrFault => "MSR access rejected by pass-through policy",
            Self::NoMem => "bounded pool exhausted",
            Self::AvoidCompilerWarning => "unreachable",
        };
        f.write_str(msg)
    }
}

impl VmmError {
    /// Whether this error corresponds to a condition the guest itself
    /// caused and that should be reflected back as a guest fault, as
    /// opposed to one that should abort the VM outright.
    pub const fn is_guest_fault(self) -> bool {
        matches!(
            self,
            Self::PageNotPresent
                | Self::PageNotAccessible
                | Self::PageBadReservedBit
                | Self::PageNotExecutable
                | Self::GuestSegNotPresent
                | Self::InvalidGuestSeg
        )
    }
}
