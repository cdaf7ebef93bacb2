//! SVM task-switch emulation (C8): when the guest executes a far `CALL`/
//! `JMP`, `IRET`, or takes an interrupt through a task gate that targets a
//! busy/available 32-bit TSS, VT-x completes the switch in hardware but SVM
//! traps out (`VmExitReason::TaskSwitch`) and leaves saving the outgoing
//! task's state, validating the incoming one, and reloading every segment
//! to software.
//!
//! Scope, matching this design's flat-segmentation guest model: only the
//! 32-bit TSS form is handled (a 16-bit TSS, like virtual-8086 mode, is
//! rejected rather than emulated - the same two cases the original routine
//! this is ported from gives up on). GDT/TSS reads go through the
//! guest-physical accessor directly rather than a full guest-linear walk
//! (`guest_mem::translate_linear` has no caller wired up anywhere in this
//! crate yet); a guest that enables paging before it hits a task gate is out
//! of scope. The outgoing task's saved `EIP` is always advanced by the
//! hardware-reported instruction length (`HardwareVt::instruction_len`)
//! rather than by decoding the triggering instruction, which only matters
//! for task switches reached through a task gate rather than directly
//! executed by the guest - interrupt delivery through task gates is not a
//! case this VMM's interrupt model (pass-through or soft injection only)
//! produces.

use crate::{
    cache::GuestCacheState,
    guest_mem::{read_gphys, write_gphys, GuestPhysicalMapper},
    hardware_vt::{
        GpReg, HardwareVt, SegReg, SegmentState, TaskSwitchQualification, TaskSwitchSource,
    },
};
use passvisor_core::{mmio::MmioRegistry, VmmError, VmmResult};

const CR0_TS: u64 = 1 << 3;
const RFLAGS_NT: u64 = 1 << 14;
const RFLAGS_ALWAYS_1: u64 = 1 << 1;

const SEGDESC_TYPE_16BIT_TSS_AVAILABLE: u8 = 0x1;
const SEGDESC_TYPE_16BIT_TSS_BUSY: u8 = 0x3;
const SEGDESC_TYPE_32BIT_TSS_AVAILABLE: u8 = 0x9;
const SEGDESC_TYPE_32BIT_TSS_BUSY: u8 = 0xB;
const TSS_BUSY_BIT: u8 = 0b0010;

/// A selector's Table Indicator bit (GDT/LDT) plus its two RPL bits, masked
/// off when the selector is used as a descriptor-table byte offset.
const SEL_TABLE_OFFSET_MASK: u16 = !0b111;
const SEL_LDT_BIT: u16 = 0b100;

/// Emulates one SVM task-switch VM exit: saves the outgoing task's
/// architectural state into its TSS, validates and loads the incoming
/// task's TSS, and reloads every segment register from the new GDT/LDT.
pub(crate) fn emulate(
    vt: &mut dyn HardwareVt,
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    q: TaskSwitchQualification,
) -> VmmResult<()> {
    if q.has_error_code {
        // The incoming TSS would need the hardware-pushed error code
        // written below its return address; not built here.
        return Err(VmmError::UnsupportedOpcode);
    }

    let (gdtr_base, gdtr_limit) = vt.gdtr();
    let from_selector = vt.segment(SegReg::Tr).selector;
    let to_selector = q.to_selector;

    let mut from_desc = read_descriptor(mapper, mmio, cache, gdtr_base, gdtr_limit, from_selector)?;
    let mut to_desc = read_descriptor(mapper, mmio, cache, gdtr_base, gdtr_limit, to_selector)?;

    if from_desc.ty == SEGDESC_TYPE_16BIT_TSS_BUSY {
        return Err(VmmError::UnsupportedOpcode);
    }
    if from_desc.ty != SEGDESC_TYPE_32BIT_TSS_BUSY {
        return Err(VmmError::InvalidGuestSeg);
    }

    let closing_outgoing = matches!(q.source, TaskSwitchSource::Iret | TaskSwitchSource::Jump);
    if closing_outgoing {
        from_desc.ty = SEGDESC_TYPE_32BIT_TSS_AVAILABLE;
    }

    match q.source {
        TaskSwitchSource::Iret => {
            if to_desc.ty == SEGDESC_TYPE_16BIT_TSS_BUSY {
                return Err(VmmError::UnsupportedOpcode);
            }
            if to_desc.ty != SEGDESC_TYPE_32BIT_TSS_BUSY {
                return Err(VmmError::InvalidGuestSeg);
            }
        }
        TaskSwitchSource::Jump | TaskSwitchSource::CallOrInterrupt => {
            if to_desc.ty == SEGDESC_TYPE_16BIT_TSS_AVAILABLE {
                return Err(VmmError::UnsupportedOpcode);
            }
            if to_desc.ty != SEGDESC_TYPE_32BIT_TSS_AVAILABLE {
                return Err(VmmError::InvalidGuestSeg);
            }
            to_desc.ty |= TSS_BUSY_BIT;
        }
    }

    if from_desc.limit < (Tss32::SIZE - 1) as u32 || to_desc.limit < (Tss32::SIZE - 1) as u32 {
        return Err(VmmError::InvalidGuestSeg);
    }

    let mut from_raw = read_gphys::<{ Tss32::SIZE }>(mapper, mmio, cache, from_desc.base)?;
    let mut to_raw = read_gphys::<{ Tss32::SIZE }>(mapper, mmio, cache, to_desc.base)?;
    let mut from_tss = Tss32::from_bytes(&from_raw);
    let mut to_tss = Tss32::from_bytes(&to_raw);

    // Save the outgoing task's state.
    let mut saved_flags = vt.flags();
    if matches!(q.source, TaskSwitchSource::Iret) {
        saved_flags &= !RFLAGS_NT;
    }
    from_tss.eax = vt.general_reg(GpReg::Rax) as u32;
    from_tss.ecx = vt.general_reg(GpReg::Rcx) as u32;
    from_tss.edx = vt.general_reg(GpReg::Rdx) as u32;
    from_tss.ebx = vt.general_reg(GpReg::Rbx) as u32;
    from_tss.esp = vt.general_reg(GpReg::Rsp) as u32;
    from_tss.ebp = vt.general_reg(GpReg::Rbp) as u32;
    from_tss.esi = vt.general_reg(GpReg::Rsi) as u32;
    from_tss.edi = vt.general_reg(GpReg::Rdi) as u32;
    from_tss.es = vt.segment(SegReg::Es).selector;
    from_tss.cs = vt.segment(SegReg::Cs).selector;
    from_tss.ss = vt.segment(SegReg::Ss).selector;
    from_tss.ds = vt.segment(SegReg::Ds).selector;
    from_tss.fs = vt.segment(SegReg::Fs).selector;
    from_tss.gs = vt.segment(SegReg::Gs).selector;
    from_tss.eflags = saved_flags as u32;
    from_tss.eip = (vt.ip() + vt.instruction_len()) as u32;

    write_descriptor(mapper, mmio, cache, gdtr_base, from_selector, from_desc)?;
    from_tss.patch_into(&mut from_raw);
    write_gphys(mapper, mmio, from_desc.base, &mut from_raw)?;

    // Load the incoming task's state.
    let mut new_flags = u64::from(to_tss.eflags);
    if matches!(q.source, TaskSwitchSource::CallOrInterrupt) {
        new_flags |= RFLAGS_NT;
        to_tss.link = from_selector;
    }
    new_flags |= RFLAGS_ALWAYS_1;

    vt.set_general_reg(GpReg::Rax, u64::from(to_tss.eax));
    vt.set_general_reg(GpReg::Rcx, u64::from(to_tss.ecx));
    vt.set_general_reg(GpReg::Rdx, u64::from(to_tss.edx));
    vt.set_general_reg(GpReg::Rbx, u64::from(to_tss.ebx));
    vt.set_general_reg(GpReg::Rsp, u64::from(to_tss.esp));
    vt.set_general_reg(GpReg::Rbp, u64::from(to_tss.ebp));
    vt.set_general_reg(GpReg::Rsi, u64::from(to_tss.esi));
    vt.set_general_reg(GpReg::Rdi, u64::from(to_tss.edi));

    // Selectors land now; base/limit/attr are filled in by the descriptor
    // reload pass below (or left unusable for a null selector).
    vt.set_segment(SegReg::Es, SegmentState { selector: to_tss.es, ..Default::default() });
    vt.set_segment(SegReg::Cs, SegmentState { selector: to_tss.cs, ..Default::default() });
    vt.set_segment(SegReg::Ss, SegmentState { selector: to_tss.ss, ..Default::default() });
    vt.set_segment(SegReg::Ds, SegmentState { selector: to_tss.ds, ..Default::default() });
    vt.set_segment(SegReg::Fs, SegmentState { selector: to_tss.fs, ..Default::default() });
    vt.set_segment(SegReg::Gs, SegmentState { selector: to_tss.gs, ..Default::default() });
    vt.set_segment(SegReg::Tr, SegmentState { selector: to_selector, ..Default::default() });
    vt.set_segment(SegReg::Ldtr, SegmentState { selector: to_tss.ldt, ..Default::default() });

    vt.set_flags(new_flags);
    vt.set_ip(u64::from(to_tss.eip));
    vt.set_guest_cr(3, u64::from(to_tss.cr3));

    write_descriptor(mapper, mmio, cache, gdtr_base, to_selector, to_desc)?;
    to_tss.patch_into(&mut to_raw);
    write_gphys(mapper, mmio, to_desc.base, &mut to_raw)?;

    // Reload every segment's descriptor cache from the new GDT/LDT. TR and
    // LDTR go first: ES..GS may be LDT-relative selectors, which needs the
    // just-reloaded LDTR base/limit.
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Tr, to_selector)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Ldtr, to_tss.ldt)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Es, to_tss.es)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Cs, to_tss.cs)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Ss, to_tss.ss)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Ds, to_tss.ds)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Fs, to_tss.fs)?;
    load_segment(vt, mapper, mmio, cache, gdtr_base, gdtr_limit, SegReg::Gs, to_tss.gs)?;

    vt.set_guest_cr(0, vt.guest_cr(0) | CR0_TS);
    Ok(())
}

/// The fields this module needs out of a GDT/LDT descriptor quadword.
#[derive(Clone, Copy, Debug)]
struct Descriptor {
    base: u64,
    limit: u32,
    ty: u8,
    code_or_data: bool,
}

fn decode_descriptor(raw: u64) -> Descriptor {
    let limit_low = raw & 0xFFFF;
    let limit_high = (raw >> 48) & 0xF;
    let granularity = (raw >> 55) & 1 != 0;
    let base_low = (raw >> 16) & 0xFF_FFFF;
    let base_high = (raw >> 56) & 0xFF;
    let limit_raw = (limit_low | (limit_high << 16)) as u32;
    Descriptor {
        base: base_low | (base_high << 24),
        limit: if granularity { (limit_raw << 12) | 0xFFF } else { limit_raw },
        ty: ((raw >> 40) & 0xF) as u8,
        code_or_data: (raw >> 44) & 1 != 0,
    }
}

fn encode_descriptor_type(raw: u64, ty: u8) -> u64 {
    (raw & !(0xFu64 << 40)) | (u64::from(ty) << 40)
}

/// Reads the GDT descriptor a TSS selector points at. Mirrors the selector
/// indexing the original routine this is ported from uses: the selector is
/// taken as the byte offset into the GDT directly, unmasked, since a TSS
/// selector's RPL and TI bits are conventionally zero already.
fn read_descriptor(
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    gdtr_base: u64,
    gdtr_limit: u32,
    selector: u16,
) -> VmmResult<Descriptor> {
    if u32::from(selector) + 7 > gdtr_limit {
        return Err(VmmError::InvalidGuestSeg);
    }
    let raw = u64::from_le_bytes(read_gphys::<8>(mapper, mmio, cache, gdtr_base + u64::from(selector))?);
    Ok(decode_descriptor(raw))
}

fn write_descriptor(
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    gdtr_base: u64,
    selector: u16,
    desc: Descriptor,
) -> VmmResult<()> {
    // Only the type field (busy/available) is ever mutated by this module,
    // so re-derive the raw quadword from the last read instead of carrying
    // every descriptor bit back through `Descriptor`.
    let addr = gdtr_base + u64::from(selector);
    let raw = u64::from_le_bytes(read_gphys::<8>(mapper, mmio, cache, addr)?);
    let raw = encode_descriptor_type(raw, desc.ty);
    write_gphys(mapper, mmio, addr, &mut raw.to_le_bytes())
}

/// Reloads one segment register's descriptor cache from `selector`,
/// mirroring the hardware semantics a real segment-register load would
/// perform: a null selector leaves the cache as-is (already zeroed by the
/// caller), otherwise the descriptor is fetched from the GDT or the current
/// LDTR and the accessed bit is forced on for code/data descriptors, the way
/// a real segment load marks the descriptor it just used - except the
/// in-memory GDT/LDT entry itself is left unmodified, same as the routine
/// this is ported from.
fn load_segment(
    vt: &mut dyn HardwareVt,
    mapper: &impl GuestPhysicalMapper,
    mmio: &MmioRegistry,
    cache: &GuestCacheState,
    gdtr_base: u64,
    gdtr_limit: u32,
    seg: SegReg,
    selector: u16,
) -> VmmResult<()> {
    if selector == 0 {
        return Ok(());
    }

    let (table_base, table_limit) = if selector & SEL_LDT_BIT != 0 {
        let ldtr = vt.segment(SegReg::Ldtr);
        if ldtr.attr & 0x80 == 0 {
            return Err(VmmError::GuestSegNotPresent);
        }
        (ldtr.base, ldtr.limit)
    } else {
        (gdtr_base, gdtr_limit)
    };

    let offset = selector & SEL_TABLE_OFFSET_MASK;
    if u32::from(offset) + 7 > table_limit {
        return Err(VmmError::InvalidGuestSeg);
    }

    let raw = u64::from_le_bytes(read_gphys::<8>(mapper, mmio, cache, table_base + u64::from(offset))?);
    let desc = decode_descriptor(raw);

    // Bits 0-7: type/S/DPL/P, straight from descriptor bits 40-47, with the
    // accessed bit forced on for code/data descriptors (bit 44 `S`), the way
    // a real segment load marks the descriptor it just used. Bits 8-11:
    // AVL/L/D-B/G, from descriptor bits 52-55.
    let mut attr_low = ((raw >> 40) & 0xFF) as u8;
    if desc.code_or_data {
        attr_low |= 1;
    }
    let attr_high = ((raw >> 52) & 0xF) as u16;
    let attr = u16::from(attr_low) | (attr_high << 8);

    vt.set_segment(seg, SegmentState { selector, base: desc.base, limit: desc.limit, attr });
    Ok(())
}

/// A 32-bit Task State Segment, as laid out by the processor (see Intel SDM
/// Vol. 3A, Figure 8-4). Only the fields this module reads or writes are
/// named; the privilege-level stack pointers and I/O-permission bitmap are
/// skipped over by offset instead.
#[derive(Clone, Copy, Debug, Default)]
struct Tss32 {
    link: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    cs: u16,
    ss: u16,
    ds: u16,
    fs: u16,
    gs: u16,
    ldt: u16,
}

impl Tss32 {
    const SIZE: usize = 104;

    fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([b[o], b[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        Self {
            link: u16_at(0x00),
            cr3: u32_at(0x1C),
            eip: u32_at(0x20),
            eflags: u32_at(0x24),
            eax: u32_at(0x28),
            ecx: u32_at(0x2C),
            edx: u32_at(0x30),
            ebx: u32_at(0x34),
            esp: u32_at(0x38),
            ebp: u32_at(0x3C),
            esi: u32_at(0x40),
            edi: u32_at(0x44),
            es: u16_at(0x48),
            cs: u16_at(0x4C),
            ss: u16_at(0x50),
            ds: u16_at(0x54),
            fs: u16_at(0x58),
            gs: u16_at(0x5C),
            ldt: u16_at(0x60),
        }
    }

    /// Writes the fields this module models back into `b`, leaving every
    /// byte it doesn't track (the privilege-level stack pointers, debug
    /// trap flag, I/O-permission bitmap offset) exactly as read.
    fn patch_into(self, b: &mut [u8; Self::SIZE]) {
        b[0x00..0x02].copy_from_slice(&self.link.to_le_bytes());
        b[0x1C..0x20].copy_from_slice(&self.cr3.to_le_bytes());
        b[0x20..0x24].copy_from_slice(&self.eip.to_le_bytes());
        b[0x24..0x28].copy_from_slice(&self.eflags.to_le_bytes());
        b[0x28..0x2C].copy_from_slice(&self.eax.to_le_bytes());
        b[0x2C..0x30].copy_from_slice(&self.ecx.to_le_bytes());
        b[0x30..0x34].copy_from_slice(&self.edx.to_le_bytes());
        b[0x34..0x38].copy_from_slice(&self.ebx.to_le_bytes());
        b[0x38..0x3C].copy_from_slice(&self.esp.to_le_bytes());
        b[0x3C..0x40].copy_from_slice(&self.ebp.to_le_bytes());
        b[0x40..0x44].copy_from_slice(&self.esi.to_le_bytes());
        b[0x44..0x48].copy_from_slice(&self.edi.to_le_bytes());
        b[0x48..0x4A].copy_from_slice(&self.es.to_le_bytes());
        b[0x4C..0x4E].copy_from_slice(&self.cs.to_le_bytes());
        b[0x50..0x52].copy_from_slice(&self.ss.to_le_bytes());
        b[0x54..0x56].copy_from_slice(&self.ds.to_le_bytes());
        b[0x58..0x5A].copy_from_slice(&self.fs.to_le_bytes());
        b[0x5C..0x5E].copy_from_slice(&self.gs.to_le_bytes());
        b[0x60..0x62].copy_from_slice(&self.ldt.to_le_bytes());
    }
}
