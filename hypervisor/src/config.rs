//! The module containing various constants and boundary switches that may be
//! modified by developers or overridden from the command line via
//! [`crate::shell::get_args`].
//!
//! The parsed `vmm.*` fields themselves ([`VmmConfig`]) live in
//! `passvisor-core`, since parsing them touches no hardware and is
//! host-testable; this module only keeps the compiled-in constants that
//! never come from the command line.

pub(crate) use passvisor_core::config::{AutoReboot, VmmConfig};

/// The logging level.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// Once in how many guest exits periodic bookkeeping (cache-sync retries,
/// sync-barrier health) should be logged to the serial output. Ignored when
/// [`LOGGING_LEVEL`] is `Trace`.
pub(crate) const SERIAL_OUTPUT_INTERVAL: u64 = 500;

/// How long the AP bring-up sequence waits, in milliseconds, between the INIT
/// IPI and the first SIPI, and again between the first and second SIPI.
pub(crate) const AP_STARTUP_DELAY_MS: u64 = 200;
