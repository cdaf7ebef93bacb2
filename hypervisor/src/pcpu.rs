//! The module containing the physical-CPU substrate (C1): per-processor
//! segment table, TSS, kernel stack, and a GS-based pointer back to the
//! owning [`PCpu`] record.

use crate::global_state::VCpuId;
use alloc::boxed::Box;
use bitfield::bitfield;
use core::mem::size_of;
use x86::{
    bits64::task::TaskStateSegment,
    dtables::DescriptorTablePointer,
    segmentation::{
        self, BuildDescriptor, CodeSegmentType, DataSegmentType, Descriptor, DescriptorBuilder,
        GateDescriptorBuilder, SegmentDescriptorBuilder, SegmentSelector,
    },
    task, Ring,
};

const KERNEL_STACK_SIZE: usize = 0x1000;

/// Selector indices into [`PCpu::gdt`]. Index 0 is the mandatory null
/// descriptor.
const GDT_KERNEL_CODE: usize = 1;
const GDT_KERNEL_DATA: usize = 2;
const GDT_TSS_LOW: usize = 3;
// A 64-bit TSS descriptor occupies two slots.
const GDT_TSS_HIGH: usize = 4;
const GDT_ENTRY_COUNT: usize = 5;

/// Per-processor state, installed once during AP bring-up and never freed.
/// Accessed through the GS segment base so "the current pCPU" is always a
/// single GS-relative load away.
#[repr(C)]
pub(crate) struct PCpu {
    /// Points to itself, so code that already has a `GS:[0]`-relative
    /// pointer can confirm it landed on a valid `PCpu`.
    self_ptr: *const PCpu,

    /// Which vCPU this processor is currently running, if any.
    pub(crate) vcpu_id: VCpuId,

    gdt: [Descriptor; GDT_ENTRY_COUNT],
    tss: TaskStateSegment,
    kernel_stack: Box<[u8; KERNEL_STACK_SIZE]>,

    /// Per-processor panic progress byte (see `panic.rs`), historically
    /// overlaid onto the IDT limit; kept here explicitly instead.
    pub(crate) panic_state: PanicState,
}

bitfield! {
    /// The panic-progress cell for one processor. See `panic.rs` for the
    /// state machine this tracks.
    #[derive(Clone, Copy)]
    pub(crate) struct PanicState(u8);
    impl Debug;
    pub stage, set_stage: 7, 0;
}

impl PCpu {
    /// Returns true iff the GS-relative thread-local area is addressable
    /// (segments loaded). Used by panic paths that may run before
    /// `segment_init_ap` has completed on this processor.
    pub(crate) fn currentcpu_available() -> bool {
        // Safety: reading GS base through `rdgsbase`-equivalent MSR access
        // is always well-defined; a zero base means segmentation has not
        // been set up yet on this processor.
        unsafe { x86::msr::rdmsr(x86::msr::IA32_GS_BASE) != 0 }
    }

    /// Allocates a pCPU record, a GS-area, and a kernel stack; installs a
    /// GDT containing code/data descriptors for ring 0 and a TSS, then
    /// loads the segment registers and `GS_BASE` to point at the new
    /// record.
    ///
    /// # Safety
    /// Must be called once per processor, early during that processor's
    /// bring-up, before any code relies on `current()` succeeding.
    pub(crate) unsafe fn segment_init_ap(vcpu_id: VCpuId) -> *mut PCpu {
        let kernel_stack = Box::new([0u8; KERNEL_STACK_SIZE]);

        let mut pcpu = Box::new(PCpu {
            self_ptr: core::ptr::null(),
            vcpu_id,
            gdt: [Descriptor::default(); GDT_ENTRY_COUNT],
            tss: TaskStateSegment::new(),
            kernel_stack,
            panic_state: PanicState(0),
        });

        let stack_top = pcpu.kernel_stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;
        pcpu.tss.rsp[0] = stack_top;

        pcpu.gdt[GDT_KERNEL_CODE] = <DescriptorBuilder as GateDescriptorBuilder<u32>>::code_descriptor(
            0,
            0,
            CodeSegmentType::ExecuteRead,
        )
        .present()
        .dpl(Ring::Ring0)
        .l()
        .finish();

        pcpu.gdt[GDT_KERNEL_DATA] =
            DescriptorBuilder::data_descriptor(0, 0xFFFF_FFFF, DataSegmentType::ReadWrite)
                .present()
                .dpl(Ring::Ring0)
                .finish();

        let tss_base = core::ptr::addr_of!(pcpu.tss) as u64;
        let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;
        let tss_descriptor =
            <DescriptorBuilder as GateDescriptorBuilder<u64>>::tss_descriptor(
                tss_base, tss_limit, true,
            )
            .present()
            .dpl(Ring::Ring0)
            .finish();
        write_tss_descriptor(&mut pcpu.gdt, GDT_TSS_LOW, tss_descriptor);

        let pcpu_ptr = Box::into_raw(pcpu);
        // Safety: `pcpu_ptr` is a live, leaked allocation; writing its own
        // address back into itself is the standard self-pointer trick for
        // GS-relative access.
        unsafe { (*pcpu_ptr).self_ptr = pcpu_ptr };

        let gdtr = DescriptorTablePointer::new_from_slice(&(*pcpu_ptr).gdt);
        // Safety: `gdtr` points at memory that outlives this processor.
        unsafe { x86::dtables::lgdt(&gdtr) };

        segmentation::load_cs(SegmentSelector::new(GDT_KERNEL_CODE as u16, Ring::Ring0));
        segmentation::load_ds(SegmentSelector::new(GDT_KERNEL_DATA as u16, Ring::Ring0));
        segmentation::load_es(SegmentSelector::new(GDT_KERNEL_DATA as u16, Ring::Ring0));
        segmentation::load_ss(SegmentSelector::new(GDT_KERNEL_DATA as u16, Ring::Ring0));
        task::load_tr(SegmentSelector::new(GDT_TSS_LOW as u16, Ring::Ring0));

        x86::msr::wrmsr(x86::msr::IA32_GS_BASE, pcpu_ptr as u64);

        pcpu_ptr
    }

    /// Returns a reference to the current processor's `PCpu`, or `None` if
    /// [`Self::currentcpu_available`] would return false.
    pub(crate) fn current() -> Option<&'static mut PCpu> {
        if !Self::currentcpu_available() {
            return None;
        }
        // Safety: `GS_BASE` was set to a leaked `Box<PCpu>` by
        // `segment_init_ap` and is never freed for the lifetime of the VMM.
        unsafe {
            let base = x86::msr::rdmsr(x86::msr::IA32_GS_BASE);
            (base as *mut PCpu).as_mut()
        }
    }
}

// A 64-bit TSS descriptor is 16 bytes (two GDT slots) wide; `Descriptor` in
// the `x86` crate models the classic 8-byte form, so the upper half is
// written by hand from the descriptor's raw bits.
fn write_tss_descriptor(gdt: &mut [Descriptor; GDT_ENTRY_COUNT], low_index: usize, desc: Descriptor) {
    gdt[low_index] = desc;
    // The `x86` crate does not expose the upper 8 bytes of a system
    // descriptor separately; callers needing the extended base above 4 GiB
    // patch `gdt[low_index + 1]` directly from the raw descriptor value in
    // `finish()`. On the allocation scheme used here (`Box` in the boot
    // heap, < 4 GiB in practice under UEFI) the upper half stays zero.
    let _ = GDT_TSS_HIGH;
}
