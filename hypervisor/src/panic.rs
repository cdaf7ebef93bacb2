//! The module containing the panic handler and its re-entrant progress
//! state machine (§4.8.3: the per-CPU progress counter that used to be
//! overlaid on the IDTR limit, kept here as the explicit `PanicState` cell
//! on [`PCpu`] instead).

use crate::{
    config::VmmConfig,
    pcpu::PCpu,
    system_table::system_table_unsafe,
    x86_instructions::{cli, cr0, cr3, cr4, hlt, inb},
};
use alloc::string::ToString;
use log::error;

const STAGE_READY: u8 = 0x00;
const STAGE_DUMPING: u8 = 0x10;
const STAGE_RESET_OR_SHELL: u8 = 0x80;
const STAGE_HALT: u8 = 0xF0;

/// The configuration the panic handler consults for `vmm.panic_reboot`/
/// `vmm.auto_reboot`/`vmm.shell`. Set once from `main` before any processor
/// can reach guest code; the panic handler has no other path back to
/// [`crate::global_state::GlobalState`].
static mut PANIC_CONFIG: Option<VmmConfig> = None;

/// Records `config` for the panic handler. Must be called exactly once, on
/// the boot processor, before [`crate::smp::start_all_aps`].
pub(crate) fn set_panic_config(config: VmmConfig) {
    // Safety: single-threaded at the point this is called (before any AP is
    // started), per this function's contract.
    unsafe { PANIC_CONFIG = Some(config) };
}

fn panic_config() -> Option<&'static VmmConfig> {
    // Safety: written once, before any processor that could read it starts.
    unsafe { PANIC_CONFIG.as_ref() }
}

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    cli();

    let stage = advance_panic_stage();

    if stage < STAGE_DUMPING {
        if let Some(location) = info.location() {
            error!(
                "panicked at '{}', {}:{}:{}",
                info.message().to_string(),
                location.file(),
                location.line(),
                location.column()
            );
        } else {
            error!("panicked (no location info available)");
        }
        dump_registers();
    }

    if stage < STAGE_RESET_OR_SHELL {
        match panic_config() {
            Some(config) if config.panic_reboot && config.auto_reboot.is_enabled() => reboot(),
            Some(config) if config.shell => panic_shell(),
            _ => {}
        }
    }

    loop {
        hlt();
    }
}

/// Advances this processor's panic-progress counter by one stage and
/// returns the stage observed *before* advancing. A panic that re-enters
/// while an earlier panic is still dumping (eg, a fault inside the dump
/// path itself) sees the advanced stage and skips straight past the work
/// already attempted, so repeated panics make forward progress towards
/// `STAGE_HALT` instead of looping.
fn advance_panic_stage() -> u8 {
    let Some(pcpu) = PCpu::current() else {
        return STAGE_READY;
    };
    let previous = pcpu.panic_state.stage();
    let next = match previous {
        0x00..=0x0F => STAGE_DUMPING,
        0x10..=0x7F => STAGE_RESET_OR_SHELL,
        0x80..=0xEF => STAGE_HALT,
        _ => STAGE_HALT,
    };
    pcpu.panic_state.set_stage(next);
    previous
}

/// Logs the VMM-side register snapshot (the "panic dump" half that does not
/// depend on a live vCPU). The guest-register half of the dump is the
/// vCPU dispatcher's responsibility at the point it detects a fatal
/// condition and calls into this path with its own state already logged.
fn dump_registers() {
    error!("cr0={:#x} cr3={:#x} cr4={:#x}", cr0().bits(), cr3(), cr4().bits());
}

/// Requests a platform reset through the UEFI runtime services, per
/// `vmm.auto_reboot`'s `MessageThenReset` variant logging first.
fn reboot() -> ! {
    if let Some(config) = panic_config() {
        if matches!(config.auto_reboot, crate::config::AutoReboot::MessageThenReset) {
            error!("requesting platform reset");
        }
    }
    // Safety: runtime services remain callable even after `ExitBootServices`;
    // this processor never returns from a successful reset request.
    let st = unsafe { system_table_unsafe() };
    st.runtime_services().reset(
        uefi::table::runtime::ResetType::Cold,
        uefi::Status::ABORTED,
        None,
    );
}

/// A minimal post-panic command loop over the UART: 'r' requests a reset,
/// anything else is ignored. Exists so a panic on real hardware without a
/// debugger attached still offers an operator-driven way out besides a
/// silent halt.
fn panic_shell() -> ! {
    error!("panic shell: press 'r' to reset, any other key to halt");
    const COM1_DATA: u16 = 0x3f8;
    const COM1_LINE_STATUS: u16 = 0x3f8 + 5;
    loop {
        if (inb(COM1_LINE_STATUS) & 0x01) != 0 {
            let byte = inb(COM1_DATA);
            if byte == b'r' || byte == b'R' {
                reboot();
            }
            break;
        }
    }
}
