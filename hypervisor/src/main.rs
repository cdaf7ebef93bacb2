#![doc = include_str!("../README.md")]
#![no_main]
#![no_std]
#![feature(core_intrinsics)]
#![feature(new_uninit)]
#![feature(panic_info_message)]
#![warn(
    // groups: https://doc.rust-lang.org/rustc/lints/groups.html
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    unused,

    // warnings that are not enabled by default or covered by groups
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    noop_method_call,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,

    // https://github.com/rust-lang/rust-clippy/blob/master/README.md
    clippy::pedantic,
    clippy::cargo,

    // https://doc.rust-lang.org/rustdoc/lints.html
    rustdoc::missing_crate_level_docs,
    rustdoc::private_doc_tests,
    rustdoc::invalid_html_tags,
)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

mod allocator;
mod cache;
mod config;
mod global_state;
mod guest_mem;
mod hardware_vt;
mod hypercall;
mod interp;
mod logger;
mod paging;
mod panic;
mod passthrough;
mod pcpu;
mod shell;
mod smp;
mod system_table;
mod task_switch;
mod vcpu;
mod vmexit;
mod x86_instructions;

use crate::{
    config::VmmConfig,
    global_state::{GlobalState, VCpuId},
    logger::init_uart_logger,
    pcpu::PCpu,
    system_table::{init_system_table, system_table, system_table_unsafe},
};
use alloc::boxed::Box;
use core::{
    ffi::c_void,
    sync::atomic::{AtomicU32, Ordering},
};
use log::{debug, info};
use uefi::{
    prelude::*,
    proto::{loaded_image::LoadedImage, pi::mp::MpServices},
    table::boot::{OpenProtocolAttributes, OpenProtocolParams},
};
use x86::current::paging::BASE_PAGE_SHIFT;

/// The entry point of the program.
#[no_mangle]
extern "efiapi" fn efi_main(image: Handle, system_table: SystemTable<Boot>) -> Status {
    init_uart_logger();
    info!("passvisor loaded");

    init_system_table(system_table, image);
    print_image_info();

    let args = shell::get_args();
    debug!("Parameters: {args:?}");
    let config = VmmConfig::from_args(args.iter().skip(1));
    info!("boundary configuration: {config}");
    panic::set_panic_config(config);

    let number_of_cores = discover_core_count();
    let global: &'static GlobalState = Box::leak(Box::new(GlobalState::new(config, number_of_cores)));

    start_hypervisor_on_all_processors(global)
}

/// Discovers how many logical processors are present via `MpServices`, the
/// one UEFI boot service this VMM depends on past this point: reading the
/// topology is a legitimate boundary use before `ExitBootServices`, unlike
/// depending on UEFI to schedule guest code afterwards.
fn discover_core_count() -> u32 {
    // Safety: code is single threaded at this point, before any AP starts.
    let st = unsafe { system_table_unsafe() };
    let bs = st.boot_services();
    let Ok(mp) = (unsafe {
        bs.open_protocol::<MpServices>(
            OpenProtocolParams {
                handle: bs.image_handle(),
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
    }) else {
        return 1;
    };
    mp.get_number_of_processors().map_or(1, |info| info.enabled as u32)
}

/// Assigns the boot processor vCPU id 0 and brings every other logical
/// processor up through `MpServices::startup_all_aps`, each running
/// [`start_core`] with a freshly assigned id. `smp::start_all_aps` sends the
/// real INIT-SIPI-SIPI sequence and is preferred once
/// `hardware_vt::ap_trampoline_code` exists; until then this stays on the
/// UEFI path, which needs no real-mode trampoline of its own.
fn start_hypervisor_on_all_processors(global: &'static GlobalState) -> ! {
    if global.number_of_cores() == 1 {
        start_core(VCpuId(0), global)
    } else {
        // Safety: code is single threaded at this point, before any AP starts.
        let st = unsafe { system_table_unsafe() };
        let bs = st.boot_services();
        let mp = unsafe {
            bs.open_protocol::<MpServices>(
                OpenProtocolParams {
                    handle: bs.image_handle(),
                    agent: bs.image_handle(),
                    controller: None,
                },
                OpenProtocolAttributes::GetProtocol,
            )
        }
        .unwrap();

        let procedure_argument = core::ptr::from_ref(global).cast::<c_void>().cast_mut();
        mp.startup_all_aps(false, start_hypervisor_on_ap, procedure_argument, None)
            .unwrap();
        start_core(VCpuId(0), global)
    }
}

/// Next vCPU id to hand out to an arriving AP; the boot processor always
/// takes 0.
static NEXT_AP_VCPU_ID: AtomicU32 = AtomicU32::new(1);

/// Wraps [`start_core`] for `MpServices::startup_all_aps`'s procedure
/// signature.
extern "efiapi" fn start_hypervisor_on_ap(context: *mut c_void) {
    // Safety: `context` is the `GlobalState` leaked for the VMM's lifetime in
    // `efi_main`; `startup_all_aps` hands it back unchanged to every AP.
    let global = unsafe { context.cast::<GlobalState>().as_ref().unwrap() };
    let vcpu_id = VCpuId(NEXT_AP_VCPU_ID.fetch_add(1, Ordering::Relaxed));
    start_core(vcpu_id, global);
}

/// Brings one logical processor fully online: installs its `PCpu` (GDT, TSS,
/// kernel stack), waits at the sync barrier for every other processor to
/// reach the same point, then builds and drives its vCPU until shutdown.
fn start_core(vcpu_id: VCpuId, global: &GlobalState) -> ! {
    // Safety: called exactly once per processor, before anything on this
    // processor depends on `PCpu::current()`.
    let _pcpu = unsafe { PCpu::segment_init_ap(vcpu_id) };

    info!("vcpu {}: online", vcpu_id.0);
    global.sync_barrier().wait();

    let mut vcpu = vcpu::VCpu::new(vcpu_id, global);
    let shutdown_code = vmexit::run_vcpu(&mut vcpu, global);
    panic!("vcpu {}: shut down, code={shutdown_code:#x}", vcpu_id.0);
}

/// Debug prints the address of this module.
fn print_image_info() {
    let st = system_table();
    let bs = st.boot_services();
    // Safety: The protocol and handle remain valid indefinitely.
    let loaded_image = unsafe {
        bs.open_protocol::<LoadedImage>(
            OpenProtocolParams {
                handle: bs.image_handle(),
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
        .unwrap()
    };
    let (image_base, image_size) = loaded_image.info();
    info!(
        "passvisor image range {:#x} - {:#x}",
        image_base as u64,
        image_base as u64 + image_size
    );
}

/// Computes how many pages are needed for the given bytes.
fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}
