//! Instruction decoding tables shared by the interpreter.
//!
//! This module only computes *shape*: effective operand/address size, mode
//! selection, and the byte-length of the ModR/M + SIB + displacement
//! portion of an instruction. It never touches guest memory or registers -
//! the `hypervisor` binary crate's interpreter feeds it bytes already read
//! from `CS:IP` and combines the shape this module computes with the actual
//! register/ALU emulation.

/// The longest an x86 instruction is architecturally permitted to be.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// The effective operand size of an instruction, derived from the current
/// execution mode, `REX.W`, and the 0x66 operand-size-override prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandSize {
    /// 16-bit operands.
    Bits16,
    /// 32-bit operands.
    Bits32,
    /// 64-bit operands (only reachable in long mode with `REX.W`).
    Bits64,
}

impl OperandSize {
    /// Size in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Bits16 => 2,
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

/// The effective address size used to compute ModR/M and SIB displacement
/// widths.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressSize {
    /// 16-bit addressing (real mode or a 0x67 override in a 32-bit
    /// segment).
    Bits16,
    /// 32-bit addressing.
    Bits32,
    /// 64-bit addressing (long mode).
    Bits64,
}

/// Execution mode, derived from guest `CR0.PE`, `EFER.LMA`, and the code
/// segment's `L`/`D` bits, needed to pick the mode-appropriate default
/// operand and address sizes before prefixes are applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuMode {
    /// `CR0.PE == 0`: real mode, 16-bit defaults.
    Real,
    /// Protected mode with `CS.D == 0`: 16-bit defaults.
    Protected16,
    /// Protected mode with `CS.D == 1`: 32-bit defaults.
    Protected32,
    /// `EFER.LMA == 1` and `CS.L == 1`: 64-bit long mode.
    Long64,
    /// `EFER.LMA == 1` and `CS.L == 0`: compatibility mode, 32-bit
    /// defaults.
    Compatibility32,
}

/// Selects the [`CpuMode`] from the guest control bits that determine it.
#[must_use]
pub const fn select_mode(cr0_pe: bool, efer_lma: bool, cs_l: bool, cs_d: bool) -> CpuMode {
    if !cr0_pe {
        return CpuMode::Real;
    }
    if efer_lma {
        return if cs_l { CpuMode::Long64 } else { CpuMode::Compatibility32 };
    }
    if cs_d {
        CpuMode::Protected32
    } else {
        CpuMode::Protected16
    }
}

/// The default operand size implied by a [`CpuMode`], before any
/// instruction-level override prefix is applied.
#[must_use]
pub const fn default_operand_size(mode: CpuMode) -> OperandSize {
    match mode {
        CpuMode::Real | CpuMode::Protected16 => OperandSize::Bits16,
        CpuMode::Protected32 | CpuMode::Compatibility32 => OperandSize::Bits32,
        CpuMode::Long64 => OperandSize::Bits32,
    }
}

/// The default address size implied by a [`CpuMode`].
#[must_use]
pub const fn default_address_size(mode: CpuMode) -> AddressSize {
    match mode {
        CpuMode::Real => AddressSize::Bits16,
        CpuMode::Protected16 | CpuMode::Protected32 | CpuMode::Compatibility32 => {
            AddressSize::Bits32
        }
        CpuMode::Long64 => AddressSize::Bits64,
    }
}

/// Applies the 0x66 operand-size-override and (in long mode) `REX.W` on top
/// of the mode default, per the SDM's precedence: `REX.W` wins over the
/// 0x66 prefix, which wins over the mode default.
#[must_use]
pub const fn effective_operand_size(
    mode: CpuMode,
    opsize_override: bool,
    rex_w: bool,
) -> OperandSize {
    if matches!(mode, CpuMode::Long64) && rex_w {
        return OperandSize::Bits64;
    }
    let default = default_operand_size(mode);
    if opsize_override {
        match default {
            OperandSize::Bits16 => OperandSize::Bits32,
            OperandSize::Bits32 | OperandSize::Bits64 => OperandSize::Bits16,
        }
    } else {
        default
    }
}

/// Applies the 0x67 address-size-override prefix on top of the mode
/// default.
#[must_use]
pub const fn effective_address_size(mode: CpuMode, addrsize_override: bool) -> AddressSize {
    let default = default_address_size(mode);
    if !addrsize_override {
        return default;
    }
    match default {
        AddressSize::Bits16 => AddressSize::Bits32,
        AddressSize::Bits32 => AddressSize::Bits16,
        AddressSize::Bits64 => AddressSize::Bits32,
    }
}

/// The class of operand an opcode table entry describes, following the
/// interpreter's abstracted operand model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdataOperand {
    /// A memory operand addressed through ModR/M.
    Mem,
    /// A register operand addressed through ModR/M's reg field.
    Reg,
    /// The accumulator (AL/AX/EAX/RAX), implied by the opcode.
    Accum,
    /// An immediate encoded after the instruction's other bytes.
    Imm,
    /// The implicit constant 1 (shift/rotate-by-one forms).
    Const1,
    /// The CL register, implied by the opcode (shift/rotate-by-CL forms).
    ClReg,
}

/// A decoded ModR/M byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ModRm {
    /// The two-bit mod field; `0b11` means the rm field addresses a
    /// register rather than memory.
    pub modbits: u8,
    /// The three-bit reg field (extended by `REX.R` by the caller).
    pub reg: u8,
    /// The three-bit rm field (extended by `REX.B` by the caller).
    pub rm: u8,
}

impl ModRm {
    /// Decodes a raw ModR/M byte.
    #[must_use]
    pub const fn decode(byte: u8) -> Self {
        Self {
            modbits: (byte >> 6) & 0b11,
            reg: (byte >> 3) & 0b111,
            rm: byte & 0b111,
        }
    }

    /// Whether this ModR/M addresses a register directly (`mod == 0b11`).
    #[must_use]
    pub const fn is_register_operand(self) -> bool {
        self.modbits == 0b11
    }

    /// Whether decoding this ModR/M (under 32/64-bit addressing) requires a
    /// following SIB byte: `mod != 0b11` and `rm == 0b100`.
    #[must_use]
    pub const fn has_sib(self) -> bool {
        !self.is_register_operand() && self.rm == 0b100
    }

    /// The number of bytes of displacement this ModR/M (plus, if present,
    /// SIB base field) carries, under the given address size. `sib_base`
    /// is the SIB byte's base field, needed because `base == 0b101` with
    /// `mod == 0` means a disp32 with no base register rather than `[EBP]`.
    #[must_use]
    pub const fn displacement_len(self, address_size: AddressSize, sib_base: u8) -> usize {
        if matches!(address_size, AddressSize::Bits16) {
            return match (self.modbits, self.rm) {
                (0b00, 0b110) => 2,
                (0b00, _) => 0,
                (0b01, _) => 1,
                (0b10, _) => 2,
                _ => 0,
            };
        }
        match self.modbits {
            0b00 => {
                if self.rm == 0b101 || (self.has_sib() && sib_base == 0b101) {
                    4
                } else {
                    0
                }
            }
            0b01 => 1,
            0b10 => 4,
            _ => 0,
        }
    }
}

/// Computes the byte length of the ModR/M + SIB + displacement portion of
/// an instruction that has already consumed its prefixes and opcode.
/// `modrm` and (if [`ModRm::has_sib`]) `sib` must be the next bytes in the
/// stream so their displacement-length dependency on the SIB base field can
/// be resolved.
#[must_use]
pub const fn modrm_group_len(modrm: u8, sib: u8, address_size: AddressSize) -> usize {
    if matches!(address_size, AddressSize::Bits16) {
        let decoded = ModRm::decode(modrm);
        return 1 + decoded.displacement_len(address_size, 0);
    }
    let decoded = ModRm::decode(modrm);
    let sib_len = usize::from(decoded.has_sib());
    let sib_base = sib & 0b111;
    1 + sib_len + decoded.displacement_len(address_size, sib_base)
}

#[cfg(test)]
mod tests {
    use super::{
        effective_address_size, effective_operand_size, modrm_group_len, select_mode, AddressSize,
        CpuMode, ModRm, OperandSize,
    };

    #[test]
    fn mode_selection_prefers_long_mode_when_lma_and_l_set() {
        assert_eq!(select_mode(true, true, true, false), CpuMode::Long64);
        assert_eq!(select_mode(true, true, false, false), CpuMode::Compatibility32);
        assert_eq!(select_mode(true, false, false, true), CpuMode::Protected32);
        assert_eq!(select_mode(true, false, false, false), CpuMode::Protected16);
        assert_eq!(select_mode(false, false, false, false), CpuMode::Real);
    }

    #[test]
    fn rex_w_wins_over_0x66_override_in_long_mode() {
        let size = effective_operand_size(CpuMode::Long64, true, true);
        assert_eq!(size, OperandSize::Bits64);
    }

    #[test]
    fn operand_size_override_flips_mode_default() {
        assert_eq!(
            effective_operand_size(CpuMode::Protected32, true, false),
            OperandSize::Bits16
        );
        assert_eq!(
            effective_operand_size(CpuMode::Real, true, false),
            OperandSize::Bits32
        );
    }

    #[test]
    fn address_size_override_flips_mode_default() {
        assert_eq!(
            effective_address_size(CpuMode::Long64, true),
            AddressSize::Bits32
        );
        assert_eq!(
            effective_address_size(CpuMode::Protected32, false),
            AddressSize::Bits32
        );
    }

    #[test]
    fn modrm_register_operand_has_no_displacement() {
        // mod=11, reg=000, rm=000 -> register direct, no SIB, no disp.
        let len = modrm_group_len(0b1100_0000, 0, AddressSize::Bits32);
        assert_eq!(len, 1);
    }

    #[test]
    fn modrm_disp32_no_base_requires_sib_base_check() {
        // mod=00, rm=100 (SIB follows), SIB base=101 -> disp32, no base reg.
        let modrm = 0b0000_0100;
        let sib = 0b00_000_101;
        let len = modrm_group_len(modrm, sib, AddressSize::Bits32);
        assert_eq!(len, 1 + 1 + 4);
    }

    #[test]
    fn modrm_disp8_adds_one_byte() {
        // mod=01, rm=000 -> [EAX+disp8], no SIB.
        let len = modrm_group_len(0b0100_0000, 0, AddressSize::Bits32);
        assert_eq!(len, 1 + 1);
    }

    #[test]
    fn modrm_16bit_addressing_bp_disp0_is_disp16() {
        // mod=00, rm=110 -> disp16 with no base/index in 16-bit addressing.
        let decoded = ModRm::decode(0b0000_0110);
        assert_eq!(decoded.displacement_len(AddressSize::Bits16, 0), 2);
    }
}
