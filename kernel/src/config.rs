//! Boot-time configuration parsed from the Multiboot2 kernel command line.
//!
//! The bootloader config (GRUB, QEMU's `-append`) hands the kernel a single
//! whitespace-separated string; this module turns `key=value` tokens in it
//! into a small [`Config`] the rest of boot reads once and for all, rather
//! than every subsystem re-parsing `cmdline_str()` itself.

use crate::log_service::LogLevel;
use crate::sync::GlobalState;

/// Parsed command-line configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Minimum severity `log_service::klog` records; messages below this
    /// are dropped. Set with `loglevel=<error|warn|info|debug|trace>`.
    pub log_level: LogLevel,
    /// Caps the usable physical memory reported by the Multiboot2 memory
    /// map, mainly for exercising OOM paths under QEMU. Set with
    /// `memlimit=<bytes>`.
    pub mem_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LogLevel::Info,
            mem_limit: None,
        }
    }
}

static CONFIG: GlobalState<Config> = GlobalState::new();

/// Parse `cmdline` and record the result as the global configuration.
///
/// Unrecognized tokens are ignored rather than rejected, so a stray
/// GRUB-supplied flag never stops the kernel from booting. Call once,
/// from `kernel_main`, before any subsystem consults [`get`].
pub fn init(cmdline: &str) {
    let mut config = Config::default();

    for token in cmdline.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "loglevel" => {
                if let Some(level) = parse_log_level(value) {
                    config.log_level = level;
                }
            }
            "memlimit" => {
                if let Ok(bytes) = value.parse::<u64>() {
                    config.mem_limit = Some(bytes);
                }
            }
            _ => {}
        }
    }

    let _ = CONFIG.init(config);
}

fn parse_log_level(s: &str) -> Option<LogLevel> {
    match s {
        "error" => Some(LogLevel::Error),
        "warn" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        "trace" => Some(LogLevel::Trace),
        _ => None,
    }
}

/// The active configuration, or the default if [`init`] has not run yet
/// (e.g. in a host-side unit test that never boots through `kernel_main`).
pub fn get() -> Config {
    CONFIG.with(|c| *c).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut config = Config::default();
        for token in "quiet root=/dev/sda1 loglevel=debug".split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                if key == "loglevel" {
                    config.log_level = parse_log_level(value).unwrap();
                }
            }
        }
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn memlimit_parses_as_bytes() {
        assert_eq!("memlimit=67108864".split_once('='), Some(("memlimit", "67108864")));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        assert!(parse_log_level("verbose").is_none());
    }
}
