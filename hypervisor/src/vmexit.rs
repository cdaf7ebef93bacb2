//! The VM-exit dispatch loop (C8): drives one vCPU through VM-entry/VM-exit
//! rounds, routing each [`VmExitReason`] to the subsystem that owns it.

use crate::{
    global_state::GlobalState,
    guest_mem::{self, GuestPhysicalMapper},
    hardware_vt::{
        GpReg, GuestException, HardwareVt, IoQualification, PendingEvent, PendingEventKind,
        TaskSwitchQualification, VmExitReason,
    },
    hypercall,
    interp,
    paging::{gfn_is_mmio, nested::decide_fill, FaultContext},
    passthrough,
    task_switch,
    vcpu::VCpu,
    x86_instructions,
};
use log::{trace, warn};
use x86::irq;

/// What the caller of [`run_vcpu`]'s inner loop should do after one VM exit
/// has been handled.
enum ExitAction {
    Continue,
    /// The guest can no longer run; carries a vendor-specific or
    /// diagnostic code for the panic/log path.
    Shutdown(u64),
}

/// Runs `vcpu` until it reaches an unrecoverable state, returning the
/// shutdown code that ended it.
pub(crate) fn run_vcpu(vcpu: &mut VCpu, global: &GlobalState) -> u64 {
    loop {
        let reason = vcpu.vt.run();
        match handle_vm_exit(vcpu, global, reason) {
            ExitAction::Continue => {}
            ExitAction::Shutdown(code) => return code,
        }
    }
}

fn handle_vm_exit(vcpu: &mut VCpu, global: &GlobalState, reason: VmExitReason) -> ExitAction {
    match reason {
        VmExitReason::NestedPageFault(q) => handle_nested_page_fault(vcpu, global, q.gpa),

        VmExitReason::Exception(q) => match q.exception_code {
            GuestException::BreakPoint => {
                vcpu.vt.inject_event(PendingEvent {
                    vector: irq::BREAKPOINT_VECTOR,
                    kind: PendingEventKind::SoftwareInterrupt,
                    error_code: None,
                });
                ExitAction::Continue
            }
            GuestException::InvalidOpcode => {
                warn!(
                    "vcpu {}: unemulated invalid opcode at guest rip {:#x}",
                    vcpu.id.0, q.rip
                );
                ExitAction::Shutdown(0)
            }
            GuestException::PageFault => {
                // CR2 is left holding the faulting linear address by the
                // processor itself (page faults are not virtualized). On a
                // shadow-paging vcpu this IS the second-level fault the
                // hardware nested-paging path would otherwise have reported
                // as NestedPageFault, so try to service it from the shadow
                // tables first; only reinject as a guest exception when
                // that fails (real guest fault).
                if !vcpu.uses_nested_paging() {
                    let gpa = x86_instructions::cr2() as u64;
                    if gfn_is_mmio(global.mmio(), gpa) {
                        return handle_mmio_access(vcpu, global, gpa);
                    }
                    if vcpu.handle_shadow_page_fault(global.mmio(), gpa) {
                        return ExitAction::Continue;
                    }
                }
                // Re-injecting the exception lets the guest's own IDT
                // handler read CR2 back out on redelivery.
                vcpu.vt.inject_event(PendingEvent {
                    vector: irq::PAGE_FAULT_VECTOR,
                    kind: PendingEventKind::HardwareException,
                    error_code: Some(0),
                });
                ExitAction::Continue
            }
        },

        VmExitReason::ExternalInterruptOrPause => {
            // The host's own IDT already services the physical interrupt
            // that caused this exit, since interrupts stay enabled on the
            // host whenever the guest runs. `should_reinject_external_interrupt`
            // governs whether a virtual device model would re-queue an
            // interrupt here; this pass-through design has no virtual
            // device model, so there is nothing further to do.
            let guest_if = vcpu.vt.flags() & RFLAGS_IF != 0;
            if passthrough::should_reinject_external_interrupt(guest_if) {
                trace!("vcpu {}: external interrupt/pause, guest IF set", vcpu.id.0);
            }
            ExitAction::Continue
        }

        VmExitReason::TimerExpiration => ExitAction::Continue,

        VmExitReason::Shutdown(code) => ExitAction::Shutdown(code),

        VmExitReason::Cpuid => {
            let leaf = vcpu.vt.general_reg(GpReg::Rax) as u32;
            let subleaf = vcpu.vt.general_reg(GpReg::Rcx) as u32;
            // Safety: CPUID is always available in 64-bit mode.
            let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
            let (mut eax, mut ebx, mut ecx, mut edx) =
                (result.eax, result.ebx, result.ecx, result.edx);
            passthrough::cpuid_pass(leaf, subleaf, &mut eax, &mut ebx, &mut ecx, &mut edx);
            vcpu.vt.set_general_reg(GpReg::Rax, u64::from(eax));
            vcpu.vt.set_general_reg(GpReg::Rbx, u64::from(ebx));
            vcpu.vt.set_general_reg(GpReg::Rcx, u64::from(ecx));
            vcpu.vt.set_general_reg(GpReg::Rdx, u64::from(edx));
            advance_ip(vcpu.vt.as_mut(), 2);
            ExitAction::Continue
        }

        VmExitReason::Msr { write } => {
            handle_msr(vcpu, global, write);
            ExitAction::Continue
        }

        VmExitReason::Io(q) => {
            if q.string {
                // REP-prefixed string I/O needs an operand-address/count
                // decode this pass does not build out.
                warn!("vcpu {}: unemulated string I/O on port {:#x}", vcpu.id.0, q.port);
                return ExitAction::Shutdown(u64::from(q.port));
            }
            handle_scalar_io(vcpu, &q);
            advance_ip(vcpu.vt.as_mut(), 2);
            ExitAction::Continue
        }

        VmExitReason::Hypercall => {
            handle_hypercall(vcpu, global);
            advance_ip(vcpu.vt.as_mut(), 3);
            ExitAction::Continue
        }

        VmExitReason::Invlpg => {
            // A precise INVLPG needs the full memory-operand decode
            // (ModRM + SIB + displacement); conservatively flush the whole
            // TLB instead of just the one entry it would have invalidated.
            // INVLPG exiting is configured unconditionally by both vendor
            // back ends, but a flush is only meaningful on a shadow-paging
            // vcpu, where the real hardware TLB backs the flat identity map
            // this pass installs. A nested-paging vcpu's guest-linear TLB
            // is managed by the guest's own paging, untouched by this exit.
            if !vcpu.uses_nested_paging() {
                x86_instructions::flush_tlb();
            }
            advance_ip(vcpu.vt.as_mut(), 3);
            ExitAction::Continue
        }

        VmExitReason::MovToCr(n) => handle_mov_to_cr(vcpu, global, n),

        VmExitReason::Xsetbv => {
            let xcr_num = vcpu.vt.general_reg(GpReg::Rcx) as u32;
            let value = combine_edx_eax(vcpu.vt.general_reg(GpReg::Rdx), vcpu.vt.general_reg(GpReg::Rax));
            if passthrough::xsetbv_pass(xcr_num, value) {
                advance_ip(vcpu.vt.as_mut(), 3);
            } else {
                inject_gp(vcpu.vt.as_mut());
            }
            ExitAction::Continue
        }

        VmExitReason::TaskSwitch(q) => handle_task_switch(vcpu, global, q),

        VmExitReason::Unexpected(code) => {
            warn!("vcpu {}: unexpected VM exit, code {code:#x}", vcpu.id.0);
            ExitAction::Shutdown(code)
        }
    }
}

const RFLAGS_IF: u64 = 1 << 9;

fn combine_edx_eax(rdx: u64, rax: u64) -> u64 {
    ((rdx as u32 as u64) << 32) | (rax as u32 as u64)
}

fn advance_ip(vt: &mut dyn HardwareVt, fallback_len: u64) {
    let len = vt.instruction_len();
    let len = if len == 0 { fallback_len } else { len };
    vt.set_ip(vt.ip() + len);
}

fn inject_gp(vt: &mut dyn HardwareVt) {
    vt.inject_event(PendingEvent {
        vector: irq::GENERAL_PROTECTION_FAULT_VECTOR,
        kind: PendingEventKind::HardwareException,
        error_code: Some(0),
    });
}

fn handle_nested_page_fault(vcpu: &mut VCpu, global: &GlobalState, gpa: u64) -> ExitAction {
    if gfn_is_mmio(global.mmio(), gpa) {
        return handle_mmio_access(vcpu, global, gpa);
    }

    let ctx = FaultContext { mmio: global.mmio(), cache: &vcpu.cache };
    let mapper = &vcpu.mapper;
    let decision = decide_fill(
        &ctx,
        gpa,
        |g| mapper.gp2hp(g).map(|m| (m.host_phys, m.fake_rom)),
        true,
    );
    match decision {
        Some(decision) => {
            vcpu.install_nested_page(decision);
            ExitAction::Continue
        }
        None => ExitAction::Shutdown(gpa),
    }
}

fn handle_msr(vcpu: &mut VCpu, global: &GlobalState, write: bool) {
    let num = vcpu.vt.general_reg(GpReg::Rcx) as u32;
    let conceal = global.config().conceal_hw_feedback;
    if write {
        let value = combine_edx_eax(vcpu.vt.general_reg(GpReg::Rdx), vcpu.vt.general_reg(GpReg::Rax));
        match passthrough::msr_write_pass(num, value) {
            Ok(()) => advance_ip(vcpu.vt.as_mut(), 2),
            Err(_) => inject_gp(vcpu.vt.as_mut()),
        }
    } else {
        match passthrough::msr_read_pass(num, conceal) {
            Ok(value) => {
                vcpu.vt.set_general_reg(GpReg::Rax, value & 0xFFFF_FFFF);
                vcpu.vt.set_general_reg(GpReg::Rdx, value >> 32);
                advance_ip(vcpu.vt.as_mut(), 2);
            }
            Err(_) => inject_gp(vcpu.vt.as_mut()),
        }
    }
}

fn handle_scalar_io(vcpu: &mut VCpu, q: &IoQualification) {
    let mask = match q.size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    };
    if q.is_in {
        let value: u64 = match q.size {
            1 => u64::from(x86_instructions::inb(q.port)),
            2 => u64::from(x86_instructions::inw(q.port)),
            _ => u64::from(x86_instructions::inl(q.port)),
        };
        let rax = vcpu.vt.general_reg(GpReg::Rax);
        vcpu.vt.set_general_reg(GpReg::Rax, (rax & !mask) | (value & mask));
    } else {
        let rax = vcpu.vt.general_reg(GpReg::Rax);
        match q.size {
            1 => x86_instructions::outb(q.port, rax as u8),
            2 => x86_instructions::outw(q.port, rax as u16),
            _ => x86_instructions::outl(q.port, rax as u32),
        }
    }
}

fn handle_hypercall(vcpu: &mut VCpu, global: &GlobalState) {
    // ABI: RCX holds a guest-physical pointer to a NUL-terminated
    // hypercall name (at most `MAX_HYPERCALL_NAME_LEN` bytes), RDX holds a
    // single scalar argument, and RAX receives the result. Unregistered
    // names and unreadable/non-UTF-8 name buffers return `u64::MAX`.
    let name_gphys = vcpu.vt.general_reg(GpReg::Rcx);
    let arg = vcpu.vt.general_reg(GpReg::Rdx);

    let name_bytes = guest_mem::read_gphys::<{ hypercall::MAX_HYPERCALL_NAME_LEN }>(
        &vcpu.mapper,
        global.mmio(),
        &vcpu.cache,
        name_gphys,
    );

    let result = match name_bytes {
        Ok(bytes) => {
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            match core::str::from_utf8(&bytes[..len]) {
                Ok(name) => global.hypercalls().dispatch(name, arg),
                Err(_) => None,
            }
        }
        Err(_) => None,
    };

    vcpu.vt.set_general_reg(GpReg::Rax, result.unwrap_or(u64::MAX));
}

/// Services a second-level (or, on a shadow-paging vcpu, `#PF`) fault that
/// landed on a registered MMIO gfn: decodes the faulting `MOV` at the
/// guest's current `RIP` and dispatches it through the registry instead of
/// real memory.
fn handle_mmio_access(vcpu: &mut VCpu, global: &GlobalState, gpa: u64) -> ExitAction {
    let rip = vcpu.vt.ip();
    let decode = match interp::decode_mmio_access(&vcpu.mapper, global.mmio(), &vcpu.cache, rip) {
        Ok(decode) => decode,
        Err(err) => {
            warn!(
                "vcpu {}: failed to decode MMIO access at rip {rip:#x} (gpa {gpa:#x}): {err:?}",
                vcpu.id.0
            );
            return ExitAction::Shutdown(gpa);
        }
    };

    let mut buf = [0u8; 8];
    if decode.store {
        let value = vcpu.vt.general_reg(decode.reg).to_le_bytes();
        buf[..decode.width].copy_from_slice(&value[..decode.width]);
        if !global.mmio().access_memory(gpa, true, &mut buf[..decode.width]) {
            warn!("vcpu {}: MMIO store at gpa {gpa:#x} not fully handled", vcpu.id.0);
            return ExitAction::Shutdown(gpa);
        }
    } else {
        if !global.mmio().access_memory(gpa, false, &mut buf[..decode.width]) {
            warn!("vcpu {}: MMIO load at gpa {gpa:#x} not fully handled", vcpu.id.0);
            return ExitAction::Shutdown(gpa);
        }
        let mut widened = [0u8; 8];
        widened[..decode.width].copy_from_slice(&buf[..decode.width]);
        vcpu.vt.set_general_reg(decode.reg, u64::from_le_bytes(widened));
    }

    vcpu.vt.set_ip(rip + decode.instruction_len);
    ExitAction::Continue
}

fn handle_mov_to_cr(vcpu: &mut VCpu, global: &GlobalState, n: u8) -> ExitAction {
    let rip = vcpu.vt.ip();
    match interp::decode_mov_to_cr(&vcpu.mapper, global.mmio(), &vcpu.cache, rip) {
        Ok(decode) => {
            let value = vcpu.vt.general_reg(decode.source);
            // A guest CR3 write on a shadow-paging vcpu means "new address
            // space"; load the flat shadow root instead of the guest's own
            // value (which is not a valid host CR3 - it addresses guest,
            // not host, physical memory) and drop every existing mapping.
            if n == 3 && !vcpu.uses_nested_paging() {
                vcpu.invalidate_shadow_on_cr3_write();
            } else {
                vcpu.vt.set_guest_cr(n, value);
            }
            vcpu.vt.set_ip(rip + decode.instruction_len);
            ExitAction::Continue
        }
        Err(err) => {
            warn!("vcpu {}: failed to decode MOV-to-CR{n}: {err:?}", vcpu.id.0);
            ExitAction::Shutdown(u64::from(n))
        }
    }
}

fn handle_task_switch(vcpu: &mut VCpu, global: &GlobalState, q: TaskSwitchQualification) -> ExitAction {
    match task_switch::emulate(vcpu.vt.as_mut(), &vcpu.mapper, global.mmio(), &vcpu.cache, q) {
        Ok(()) => ExitAction::Continue,
        Err(err) => {
            warn!("vcpu {}: failed to emulate task switch to selector {:#x}: {err:?}", vcpu.id.0, q.to_selector);
            ExitAction::Shutdown(0)
        }
    }
}
