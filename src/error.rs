use std::array::TryFromSliceError;

use crate::crtp::Packet;

/// [Result] alias for return types of the crate API
pub type Result<T> = std::result::Result<T, Error>;

/// Error enum type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Protocol version not supported, you need to update the Crazyflie firmware.
    ///
    /// see [the crate documentation](crate#compatibility) for more information.
    #[error("Protocol version not supported")]
    ProtocolVersionNotSupported,
    /// Unexpected protocol error. The String contains the reason.
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// Parameter subsystem error. The String contains the reason.
    #[error("Param error: {0}")]
    ParamError(String),
    /// Log Subsystem error. The String contains the reason.
    #[error("Log error: {0}")]
    LogError(String),
    /// [Value](crate::Value) conversion error. The String contains the reason.
    #[error("Conversion error: {0}")]
    ConversionError(String),
    /// Radio link error, returned by the [crazyflie-link](crazyflie_link) crate.
    #[error("Link error: {0}")]
    LinkError(#[from] crazyflie_link::Error),
    /// USB transport error.
    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),
    /// I/O error, for example when writing a capture file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// The link URI is malformed or no link supports it.
    #[error("Invalid link URI: {0}")]
    InvalidUri(String),
    /// CRTP packets carry at most [MAX_PAYLOAD](crate::crtp::MAX_PAYLOAD) bytes of data.
    #[error("CRTP payload too large: {0} bytes")]
    PacketTooLarge(usize),
    /// The Crazyflie object is currently disconnected.
    #[error("Disconnected")]
    Disconnected,
    /// Variable not found in TOC.
    #[error("Variable not found")]
    VariableNotFound,
    /// Error with the async runtime.
    #[error("System error: {0}")]
    SystemError(String),
    /// Operation timed out waiting for response.
    #[error("Timeout")]
    Timeout,
    /// The synchronous wrapper already holds an open link.
    #[error("Link already open")]
    LinkAlreadyOpen,
    /// TOC cache content could not be decoded.
    #[error("TOC cache error: {0}")]
    CacheError(String),
}

impl From<TryFromSliceError> for Error {
    fn from(e: TryFromSliceError) -> Self {
        Self::ConversionError(format!("{:?}", e))
    }
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        self::Error::Disconnected
    }
}

impl From<flume::SendError<Packet>> for Error {
    fn from(_: flume::SendError<Packet>) -> Self {
        self::Error::Disconnected
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::CacheError(format!("{}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::SystemError(format!("{}", e))
    }
}
