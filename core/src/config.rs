//! Boundary configuration (spec §6.1): the `vmm.*` fields consumed from the
//! EFI shell command line, with no on-disk persistence format imposed.
//!
//! Parsing stays here, rather than in the binary crate, because it is pure
//! string-to-value logic with no platform dependency - exactly the kind of
//! thing this crate exists to host so it can run under `cargo test`.

use core::fmt;

/// `vmm.auto_reboot`'s three states: the original source distinguishes "send
/// a reboot message to a supervisory process, then platform-reset" (`1`)
/// from "platform-reset directly" (any other nonzero value); modeled here
/// as a closed three-way choice rather than a bare integer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AutoReboot {
    /// `0`: do not reboot automatically after a panic or INIT-to-BSP.
    Off,
    /// `1`: notify the reboot coordinator message port, then reset.
    MessageThenReset,
    /// `2`: reset the platform directly.
    ResetOnly,
}

impl AutoReboot {
    const fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::MessageThenReset,
            0 => Self::Off,
            _ => Self::ResetOnly,
        }
    }

    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Boundary configuration for this VMM instance. Values default to the
/// compiled-in constants in the binary crate's `config` module and may be
/// overridden by passing `key=value` pairs on the EFI shell command line.
#[derive(Clone, Copy, Debug)]
pub struct VmmConfig {
    /// Drop into the minimal post-panic debug shell instead of halting or
    /// resetting immediately.
    pub shell: bool,

    /// Reset the platform after a panic has finished dumping diagnostics.
    pub panic_reboot: bool,

    /// Reboot behavior on an INIT signal delivered to the boot processor.
    pub auto_reboot: AutoReboot,

    /// Scrub CPU-identifying and timing values the guest can observe
    /// (CPUID hypervisor-presence bit, TSC offsetting) so the guest cannot
    /// easily detect it is running under this VMM.
    pub conceal_hw_feedback: bool,

    /// Intercept the local APIC MSRs/MMIO window instead of letting the
    /// guest access it directly; required on platforms whose firmware
    /// relocates the APIC base out from under a flat pass-through mapping.
    pub localapic_intercept: bool,

    /// Disable interception of external interrupts entirely. Only safe on
    /// platforms that guarantee the guest never needs the VMM to
    /// re-arbitrate interrupt delivery.
    pub no_intr_intercept: bool,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            shell: true,
            panic_reboot: false,
            auto_reboot: AutoReboot::Off,
            conceal_hw_feedback: true,
            localapic_intercept: cfg!(feature = "localapic_intercept"),
            no_intr_intercept: cfg!(feature = "no_intr_intercept"),
        }
    }
}

impl VmmConfig {
    /// Builds the configuration by applying `key=value` command line
    /// arguments on top of the compiled-in defaults. Unrecognized keys and
    /// malformed values are ignored; this is a best-effort override layer,
    /// not a validated configuration format.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            match key {
                "vmm.shell" => {
                    if let Some(enabled) = parse_bool(value) {
                        config.shell = enabled;
                    }
                }
                "vmm.panic_reboot" => {
                    if let Some(enabled) = parse_bool(value) {
                        config.panic_reboot = enabled;
                    }
                }
                "vmm.auto_reboot" => {
                    if let Ok(raw) = value.parse::<u8>() {
                        config.auto_reboot = AutoReboot::from_raw(raw);
                    }
                }
                "vmm.conceal_hw_feedback" => {
                    if let Some(enabled) = parse_bool(value) {
                        config.conceal_hw_feedback = enabled;
                    }
                }
                "vmm.localapic_intercept" => {
                    if let Some(enabled) = parse_bool(value) {
                        config.localapic_intercept = enabled;
                    }
                }
                "vmm.no_intr_intercept" => {
                    if let Some(enabled) = parse_bool(value) {
                        config.no_intr_intercept = enabled;
                    }
                }
                _ => {}
            }
        }
        config
    }
}

impl fmt::Display for VmmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shell={} panic_reboot={} auto_reboot={:?} conceal_hw_feedback={} localapic_intercept={} no_intr_intercept={}",
            self.shell,
            self.panic_reboot,
            self.auto_reboot,
            self.conceal_hw_feedback,
            self.localapic_intercept,
            self.no_intr_intercept
        )
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{AutoReboot, VmmConfig};
    use alloc::vec;

    #[test]
    fn defaults_are_conservative() {
        let config = VmmConfig::default();
        assert!(config.shell);
        assert!(!config.panic_reboot);
        assert_eq!(config.auto_reboot, AutoReboot::Off);
    }

    #[test]
    fn unknown_key_is_ignored() {
        let config = VmmConfig::from_args(vec!["vmm.bogus=1"]);
        assert_eq!(config.shell, VmmConfig::default().shell);
    }

    #[test]
    fn recognized_key_overrides_default() {
        let config = VmmConfig::from_args(vec!["vmm.panic_reboot=true"]);
        assert!(config.panic_reboot);
        let config = VmmConfig::from_args(vec!["vmm.shell=off"]);
        assert!(!config.shell);
    }

    #[test]
    fn auto_reboot_distinguishes_message_from_reset_only() {
        let config = VmmConfig::from_args(vec!["vmm.auto_reboot=1"]);
        assert_eq!(config.auto_reboot, AutoReboot::MessageThenReset);
        let config = VmmConfig::from_args(vec!["vmm.auto_reboot=2"]);
        assert_eq!(config.auto_reboot, AutoReboot::ResetOnly);
        assert!(config.auto_reboot.is_enabled());
    }
}
