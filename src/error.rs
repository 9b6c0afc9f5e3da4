//! Error types for device matching, connection management and config

use std::path::PathBuf;

use hidlink_transport::{DeviceId, TransportError};
use thiserror::Error;

/// Why no device could be selected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// Enumeration returned nothing
    #[error("No device found matching {vendor_id:04X}:{product_id:04X}")]
    NoDeviceFound { vendor_id: u16, product_id: u16 },

    /// Several devices matched and no preference was given
    #[error("{count} devices match; multiple devices are not supported without a target id")]
    AmbiguousMatch { count: usize },

    /// The requested device is not among the matches
    #[error("Target device {0} not found among matching devices")]
    TargetNotFound(DeviceId),

    /// The enumeration query itself failed
    #[error("Enumeration failed: {0}")]
    Enumerate(#[source] TransportError),
}

/// Errors from connection manager operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Match(#[from] MatchError),

    /// The transport refused to open the selected device
    #[error("Transport failed to connect device {device_id}: {source}")]
    TransportConnectFailed {
        device_id: DeviceId,
        #[source]
        source: TransportError,
    },

    /// Disconnect requested for a device that is not the current connection
    #[error("Don't recognize device {0}; it is not the connected device")]
    UnrecognizedDevice(DeviceId),

    /// Operation needs a live connection
    #[error("No device connected")]
    NotConnected,

    /// Transport error on an established connection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Flat error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoDeviceFound,
    AmbiguousMatch,
    TargetNotFound,
    TransportConnectFailed,
    UnrecognizedDevice,
    NotConnected,
    Transport,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Match(MatchError::NoDeviceFound { .. }) => ErrorKind::NoDeviceFound,
            SessionError::Match(MatchError::AmbiguousMatch { .. }) => ErrorKind::AmbiguousMatch,
            SessionError::Match(MatchError::TargetNotFound(_)) => ErrorKind::TargetNotFound,
            SessionError::Match(MatchError::Enumerate(_)) => ErrorKind::Transport,
            SessionError::TransportConnectFailed { .. } => ErrorKind::TransportConnectFailed,
            SessionError::UnrecognizedDevice(_) => ErrorKind::UnrecognizedDevice,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::Transport(_) => ErrorKind::Transport,
        }
    }
}

/// Configuration load/validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
