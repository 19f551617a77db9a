use crate::protocol::codec::MAX_FRAME_LEN;
use std::path::PathBuf;

/// Default per-message transfer chunk: 8 MiB, same ceiling the device
/// process applies on its side of the channel.
pub const DEFAULT_PACKET_SIZE: u64 = 0x0080_0000;

/// Largest usable chunk. A data chunk travels inside one frame together
/// with the call name and addressing fields, so the configured packet
/// size must leave headroom under the frame ceiling.
pub const MAX_PACKET_SIZE: u64 = MAX_FRAME_LEN as u64 - 64;

/// Runtime options recognized from the process environment.
///
/// The snapshot is taken once when a device is opened; later changes to the
/// environment do not affect an open device.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transfer chunk size in bytes (`SWEMU_PACKET_SIZE`).
    pub packet_size: u64,
    /// Skip launching the device process; an in-process loopback peer is
    /// used instead (`SWEMU_DONT_RUN`).
    pub dont_run: bool,
    /// Keep the per-device working directory after close
    /// (`SWEMU_KEEP_RUNDIR`).
    pub keep_rundir: bool,
    /// Launch the device process with debug arguments when the loaded
    /// binary carries a debug-data section (`SWEMU_KERNEL_DEBUG`).
    pub kernel_debug: bool,
    /// Path of the simulator executable (`SWEMU_SIMULATOR`).
    pub simulator: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            dont_run: false,
            keep_rundir: false,
            kernel_debug: false,
            simulator: None,
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let packet_size = lookup("SWEMU_PACKET_SIZE")
            .and_then(|v| parse_size(&v))
            .filter(|&v| v > 0)
            .map(|v| {
                if v > MAX_PACKET_SIZE {
                    log::warn!("SWEMU_PACKET_SIZE {v} exceeds the frame ceiling; clamping");
                }
                v.min(MAX_PACKET_SIZE)
            })
            .unwrap_or(DEFAULT_PACKET_SIZE);

        Self {
            packet_size,
            dont_run: flag(lookup("SWEMU_DONT_RUN")),
            keep_rundir: flag(lookup("SWEMU_KEEP_RUNDIR")),
            kernel_debug: flag(lookup("SWEMU_KERNEL_DEBUG")),
            simulator: lookup("SWEMU_SIMULATOR").map(PathBuf::from),
        }
    }
}

fn flag(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1" | "true" | "TRUE"))
}

/// Accepts plain decimal or `0x`-prefixed hexadecimal.
fn parse_size(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.packet_size, DEFAULT_PACKET_SIZE);
        assert!(!cfg.dont_run);
        assert!(!cfg.keep_rundir);
        assert!(!cfg.kernel_debug);
        assert!(cfg.simulator.is_none());
    }

    #[test]
    fn packet_size_accepts_hex_and_decimal() {
        let cfg = Config::from_lookup(lookup_from(&[("SWEMU_PACKET_SIZE", "0x1000")]));
        assert_eq!(cfg.packet_size, 0x1000);

        let cfg = Config::from_lookup(lookup_from(&[("SWEMU_PACKET_SIZE", "65536")]));
        assert_eq!(cfg.packet_size, 65536);
    }

    #[test]
    fn zero_or_garbage_packet_size_falls_back_to_default() {
        let cfg = Config::from_lookup(lookup_from(&[("SWEMU_PACKET_SIZE", "0")]));
        assert_eq!(cfg.packet_size, DEFAULT_PACKET_SIZE);

        let cfg = Config::from_lookup(lookup_from(&[("SWEMU_PACKET_SIZE", "banana")]));
        assert_eq!(cfg.packet_size, DEFAULT_PACKET_SIZE);
    }

    #[test]
    fn oversized_packet_size_is_clamped_to_the_frame_ceiling() {
        let cfg = Config::from_lookup(lookup_from(&[("SWEMU_PACKET_SIZE", "0x40000000")]));
        assert_eq!(cfg.packet_size, MAX_PACKET_SIZE);
        assert!(cfg.packet_size < u64::from(MAX_FRAME_LEN));
    }

    #[test]
    fn flags_recognize_true_and_one() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("SWEMU_DONT_RUN", "true"),
            ("SWEMU_KEEP_RUNDIR", "1"),
            ("SWEMU_KERNEL_DEBUG", "yes"),
        ]));
        assert!(cfg.dont_run);
        assert!(cfg.keep_rundir);
        assert!(!cfg.kernel_debug);
    }
}
