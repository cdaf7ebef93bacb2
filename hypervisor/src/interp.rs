//! The binary-side half of the instruction interpreter (C7): instruction
//! fetch from guest `CS:IP` plus the handful of decodes the VM-exit
//! dispatcher needs that the hardware does not already hand it as an exit
//! qualification.
//!
//! [`passvisor_core::interp`] owns the pure shape tables (operand/address
//! size, `ModR/M` layout); this module only supplies the fetch step and
//! wires the shape tables to a concrete decode.

use crate::{
    cache::GuestCacheState,
    guest_mem::{read_gphys, GuestPhysicalMapper},
    hardware_vt::GpReg,
};
use passvisor_core::{mmio::MmioRegistry, VmmError, VmmResult};

/// Reads up to `N` bytes starting at a flat guest-linear address. Assumes a
/// zero code-segment base, true whenever the trapping access happens in
/// real mode or a flat-model protected/long-mode guest; a guest running
/// with a non-zero `CS.base` needs the full segment-aware fetch this
/// simplification does not attempt.
fn fetch<const N: usize>(
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    linear: u64,
) -> VmmResult<[u8; N]> {
    read_gphys::<N>(mapper, mmio, cache, linear)
}

/// The outcome of decoding a `MOV CRn, r64` (the only direction VT-x/SVM
/// ever trap - `MOV r64, CRn` never exits on either platform). Gives the
/// dispatcher the general-purpose register the new value came from and how
/// many bytes to advance `RIP` by.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MovToCrDecode {
    pub(crate) source: GpReg,
    pub(crate) instruction_len: u64,
}

/// Decodes the `0F 22 /r` form at guest `RIP`, skipping an optional `REX`
/// prefix. `REX.R` would select a CR8 alias this dispatcher never needs
/// (only CR0/3/4 reach [`crate::hardware_vt::VmExitReason::MovToCr`]); only
/// `REX.B` is consulted, to extend the source register past `r7`.
pub(crate) fn decode_mov_to_cr(
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    rip: u64,
) -> VmmResult<MovToCrDecode> {
    let bytes = fetch::<4>(mapper, mmio, cache, rip)?;

    let (rex_b, opcode_offset) = if (0x40..=0x4F).contains(&bytes[0]) {
        (bytes[0] & 0b0001 != 0, 1)
    } else {
        (false, 0)
    };

    if bytes[opcode_offset] != 0x0F || bytes[opcode_offset + 1] != 0x22 {
        return Err(VmmError::UnsupportedOpcode);
    }

    let modrm = passvisor_core::interp::ModRm::decode(bytes[opcode_offset + 2]);
    if !modrm.is_register_operand() {
        // `MOV CRn, r/m` only ever addresses a register in practice; a
        // memory operand here would be an encoding no known guest emits.
        return Err(VmmError::UnimplementedOpcode);
    }

    let rm = modrm.rm | (u8::from(rex_b) << 3);
    let source = gp_reg_from_index(rm);
    let instruction_len = (opcode_offset + 3) as u64;

    Ok(MovToCrDecode { source, instruction_len })
}

/// The outcome of decoding a memory-operand `MOV` at a faulting MMIO
/// address: which general-purpose register is the other operand, how wide
/// the access is, which direction it goes, and how many bytes to advance
/// `RIP` by. The second-level fault already hands the dispatcher the
/// faulting guest-physical address as the exit qualification, so this
/// decode only needs to identify the instruction, not recompute the
/// address from `ModR/M`+`SIB`+displacement.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MmioAccessDecode {
    pub(crate) reg: GpReg,
    /// Access width in bytes: 1, 2, 4, or 8.
    pub(crate) width: usize,
    /// `true` for `MOV [mem], reg` (guest stores into the device); `false`
    /// for `MOV reg, [mem]` (guest loads from the device).
    pub(crate) store: bool,
    pub(crate) instruction_len: u64,
}

/// Decodes the four general-register `MOV` forms that move between a
/// memory operand and a GPR (`0x88`/`0x89` store, `0x8A`/`0x8B` load),
/// skipping an optional `0x66` operand-size-override prefix and an
/// optional `REX` prefix. Assumes a flat 32/64-bit guest: address size is
/// always resolved as if in long mode (see [`passvisor_core::interp::modrm_group_len`],
/// which treats 32-bit and 64-bit addressing identically), and operand
/// size defaults to 32 bits unless overridden by `0x66` or widened to 64
/// bits by `REX.W` - the real-mode window this design's guest ever runs
/// in is the fixed MBR entry point, which does not perform MMIO accesses
/// before enabling protected mode.
///
/// Only a register `ModR/M` encodes a memory operand that has no `SIB`
/// byte and a direct base register; this decoder does not resolve the
/// addressing-mode bytes (index/scale/base/displacement) since the
/// faulting guest-physical address is already known from the exit
/// qualification, but it still has to walk past them correctly to find
/// `instruction_len`.
pub(crate) fn decode_mmio_access(
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    rip: u64,
) -> VmmResult<MmioAccessDecode> {
    use passvisor_core::interp::{
        effective_operand_size, modrm_group_len, AddressSize, CpuMode, ModRm, OperandSize,
    };

    let bytes = fetch::<16>(mapper, mmio, cache, rip)?;
    let mut offset = 0usize;

    let opsize_override = bytes[offset] == 0x66;
    if opsize_override {
        offset += 1;
    }

    let rex = (0x40..=0x4F).contains(&bytes[offset]);
    let (rex_w, rex_r) = if rex {
        let b = bytes[offset];
        offset += 1;
        (b & 0b1000 != 0, b & 0b0100 != 0)
    } else {
        (false, false)
    };

    let opcode = bytes[offset];
    let (store, byte_sized) = match opcode {
        0x88 => (true, true),
        0x89 => (true, false),
        0x8A => (false, true),
        0x8B => (false, false),
        _ => return Err(VmmError::UnsupportedOpcode),
    };
    offset += 1;

    let modrm = ModRm::decode(bytes[offset]);
    if modrm.is_register_operand() {
        // A register-direct ModR/M cannot be the memory operand that
        // faulted into the MMIO handler in the first place.
        return Err(VmmError::UnimplementedOpcode);
    }
    let sib = if modrm.has_sib() { bytes[offset + 1] } else { 0 };
    let group_len = modrm_group_len(bytes[offset], sib, AddressSize::Bits64);

    let width = if byte_sized {
        1
    } else {
        match effective_operand_size(CpuMode::Long64, opsize_override, rex_w) {
            OperandSize::Bits16 => 2,
            OperandSize::Bits32 => 4,
            OperandSize::Bits64 => 8,
        }
    };

    let reg = gp_reg_from_index(modrm.reg | (u8::from(rex_r) << 3));
    let instruction_len = (offset + group_len) as u64;

    Ok(MmioAccessDecode { reg, width, store, instruction_len })
}

fn gp_reg_from_index(index: u8) -> GpReg {
    match index {
        0 => GpReg::Rax,
        1 => GpReg::Rcx,
        2 => GpReg::Rdx,
        3 => GpReg::Rbx,
        4 => GpReg::Rsp,
        5 => GpReg::Rbp,
        6 => GpReg::Rsi,
        7 => GpReg::Rdi,
        8 => GpReg::R8,
        9 => GpReg::R9,
        10 => GpReg::R10,
        11 => GpReg::R11,
        12 => GpReg::R12,
        13 => GpReg::R13,
        14 => GpReg::R14,
        _ => GpReg::R15,
    }
}

// `decode_mov_to_cr`'s register-index mapping (`gp_reg_from_index`) mirrors
// the pure, host-testable shape tables in `passvisor_core::interp`; it is
// not itself re-tested here since exercising it needs a live
// `GuestPhysicalMapper`/`MmioRegistry`, which this crate's `forced-target`
// build never runs under `cargo test`.
