use thiserror::Error;

/// Everything that can go wrong between the transaction queue and the bus.
///
/// Queue-level failures (`Timeout`, `Aborted`, `TransmitFailure`) always
/// surface to the caller of the affected operation. Identity-read anomalies
/// (`MissingData`, `BadChecksum`, `BadDeviceInfo`) are recoverable: the
/// collection path classifies them into a device-info status and continues
/// with a weaker, address-derived identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Deadline exceeded while waiting for a transaction to complete.
    #[error("transaction timed out")]
    Timeout,

    /// Transaction aborted explicitly, e.g. on connection teardown.
    #[error("transaction aborted")]
    Aborted,

    /// The underlying write did not accept all bytes.
    #[error("transmit failure: wrote {written} of {len} bytes")]
    TransmitFailure { written: usize, len: usize },

    /// A scan or discovery procedure is already running on this bus.
    #[error("bus procedure already running")]
    Busy,

    /// Malformed or ambiguous backward frame, usually a collision of two
    /// devices answering simultaneously.
    #[error("DALI frame error")]
    BusFrame,

    /// The bridge rejected the request as invalid.
    #[error("bridge rejected command")]
    BridgeCommand,

    /// The bridge reported a bus overload condition.
    #[error("bus overload")]
    BusOverload,

    /// The bridge answered with something outside its protocol.
    #[error("unexpected bridge response {0:#04x}")]
    InvalidAnswer(u8),

    /// Device info memory bank absent or too short.
    #[error("device info missing")]
    MissingData,

    /// Device info checksum did not validate.
    #[error("device info checksum invalid")]
    BadChecksum,

    /// Device info present but implausible (garbage GTIN or serial).
    #[error("device info implausible")]
    BadDeviceInfo,

    /// A short address is used by more than one device.
    #[error("short address collision at {0}")]
    AddressCollision(u8),

    /// Devices remain on the bus that could not be given a short address.
    #[error("devices without short address remain")]
    AddressesMissing,

    /// Programming a short address onto a device failed verification.
    #[error("short address assignment failed for {0}")]
    SetShortAddressFailed(u8),

    /// Self test found no devices at all.
    #[error("device search found no devices")]
    DeviceSearchFailed,

    /// R/W self test read back a value that differs from what was written.
    #[error("bus data unreliable")]
    DataUnreliable,

    /// A byte that is not a valid bus address in any of the three forms.
    #[error("invalid bus address byte {0:#04x}")]
    InvalidAddress(u8),

    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.kind())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
