//! Transaction engine and bridge protocol for a DALI lighting bus.
//!
//! This crate bridges a DALI bus into a host process through a small serial
//! bridge adapter. The hard part it solves is the **bus transaction engine**:
//! a single-threaded, event-driven command queue that serializes requests
//! onto a shared, unreliable, half-duplex byte channel, enforces per-request
//! timeouts and sequencing, and layers the request/response bus protocol
//! (addressed commands, paired queries, device discovery, collision and
//! identity reconciliation) on top of it.
//!
//! # Layers
//!
//! - [`sansio`] - the I/O-free engine: [`sansio::Transaction`] /
//!   [`sansio::TransactionQueue`] plus pure framing and conversion
//!   functions. Testable without hardware.
//! - [`comm`] - [`comm::DaliComm`], the bus protocol operations: addressed
//!   commands, three-valued queries, config double-sends, 16-bit paired
//!   reads/writes, memory and identity reads, scans.
//! - [`discovery`] / [`device`] - collection passes producing
//!   [`device::DaliBusDevice`] and [`device::DaliBusDeviceGroup`] records
//!   with reconciled stable identifiers.
//! - [`connection`] / [`stream`] - the actual byte transport to the bridge
//!   (`tcp:` or `unix:` addresses).
//!
//! # Driving the engine
//!
//! All state transitions happen inside the calling thread; there are no
//! locks and no background tasks. The caller owns a small event loop:
//!
//! ```no_run
//! use dalibus::{comm::DaliComm, config::BusConfig};
//! use std::time::Duration;
//!
//! let mut config = BusConfig::default();
//! config.connection = "tcp:dali-bridge.local".into();
//! let (mut comm, mut connection) = DaliComm::open(&config, "dali1")?;
//!
//! comm.probe_scan(|_, result| println!("bus state: {}", result.unwrap()));
//! loop {
//!     // feed inbound bytes and tick lazy timeouts
//!     connection.pump(Duration::from_millis(50), comm.queue_mut())?;
//!     if comm.queue_mut().is_empty() {
//!         break;
//!     }
//! }
//! # Ok::<(), dalibus::error::Error>(())
//! ```

pub mod cache;
pub mod comm;
pub mod config;
pub mod connection;
pub mod defs;
pub mod device;
pub mod discovery;
pub mod error;
pub mod sansio;
mod scan;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::comm::DaliComm;
pub use crate::config::BusConfig;
pub use crate::connection::BridgeConnection;
pub use crate::error::{Error, Result};
pub use crate::sansio::{QueryOutcome, ScanResult, Transaction, TransactionQueue};

/// A bus address in one of its three disjoint forms.
///
/// The single-byte encoding is a bijection over these forms: short
/// addresses use the low 6 bits, group addresses set the high bit with the
/// group in the low 4 bits, broadcast is all bits set. No other bit pattern
/// is a valid input to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaliAddress {
    /// One device, 0..=63.
    Short(u8),
    /// A group of devices, 0..=15.
    Group(u8),
    /// All devices on the bus.
    Broadcast,
}

impl DaliAddress {
    pub fn to_byte(self) -> u8 {
        match self {
            DaliAddress::Short(a) => a & 0x3F,
            DaliAddress::Group(g) => 0x80 | (g & 0x0F),
            DaliAddress::Broadcast => 0xFF,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0xFF => Ok(DaliAddress::Broadcast),
            b if b & 0x80 == 0 => {
                if b < 0x40 {
                    Ok(DaliAddress::Short(b))
                } else {
                    Err(Error::InvalidAddress(b))
                }
            }
            b => {
                if b & 0x70 == 0 {
                    Ok(DaliAddress::Group(b & 0x0F))
                } else {
                    Err(Error::InvalidAddress(b))
                }
            }
        }
    }
}

impl std::fmt::Display for DaliAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaliAddress::Short(a) => write!(f, "device {}", a),
            DaliAddress::Group(g) => write!(f, "group {}", g),
            DaliAddress::Broadcast => write!(f, "broadcast"),
        }
    }
}
