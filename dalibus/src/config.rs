//! Per-bus configuration.
//!
//! These are pass-through knobs: the engine forwards them to the bridge or
//! consults them at classification time, it does not interpret the electrical
//! values itself.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bridge address: `tcp:host:port`, `tcp:host` (with `default_port`) or
    /// `unix:/path/to/socket`.
    pub connection: String,

    /// Port used when the tcp bridge address does not carry one.
    pub default_port: u16,

    /// Close the bridge connection after this many seconds of idleness;
    /// `None` keeps it open forever.
    pub close_after_idle_secs: Option<u64>,

    /// Delay for the going-inactive edge of the sending signal, in 1/256th
    /// DALI bit time units. Passed to the bridge verbatim.
    pub send_edge_adjust: u8,

    /// Delay (or advance, negative) of the receive sample point, in 1/256th
    /// DALI bit time units. Passed to the bridge verbatim.
    pub sample_point_adjust: i8,

    /// Accept identity checksums bearing the historical firmware bug's
    /// signature, so installations configured before the fix keep their
    /// device identities.
    pub legacy_checksum_compat: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            connection: String::new(),
            default_port: 2101,
            close_after_idle_secs: None,
            send_edge_adjust: 0,
            sample_point_adjust: 0,
            legacy_checksum_compat: false,
        }
    }
}

impl BusConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "invalid bus config");
            std::io::Error::new(std::io::ErrorKind::InvalidData, e).into()
        })
    }

    pub fn close_after_idle(&self) -> Option<Duration> {
        self.close_after_idle_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let c = BusConfig::default();
        assert!(!c.legacy_checksum_compat);
        assert_eq!(c.send_edge_adjust, 0);
        assert!(c.close_after_idle().is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: BusConfig =
            serde_json::from_str(r#"{"connection":"tcp:bridge.local","legacy_checksum_compat":true}"#)
                .unwrap();
        assert_eq!(c.connection, "tcp:bridge.local");
        assert!(c.legacy_checksum_compat);
        assert_eq!(c.default_port, 2101);
    }
}
