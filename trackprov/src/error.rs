//! Error types for trackprov.

use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Main error type for trackprov operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Serial transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Transcript and pattern errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Provisioning session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Port registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Transport layer errors (opening, reading and writing the serial port).
#[derive(Error, Debug)]
pub enum TransportError {
    /// No port was passed in and the registry has no selection
    #[error("no channel selected")]
    NoChannelSelected,

    /// The platform reported the port as already open
    #[error("serial port {port} is already open")]
    AlreadyOpen { port: String },

    /// The port is open elsewhere and could not be adopted
    #[error("serial port {port} is busy: close other serial monitors (Arduino IDE, PlatformIO) and try again")]
    Busy { port: String },

    /// Opening the port failed for another reason
    #[error("failed to open serial port {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// The handle was closed
    #[error("serial channel closed")]
    Closed,

    /// The device side went away (EOF on the read half)
    #[error("serial device disconnected")]
    Disconnected,

    /// The background read loop failed
    #[error("serial read failed: {0}")]
    ReadFailed(String),

    /// Writing to the port failed
    #[error("serial write failed: {0}")]
    Write(#[source] io::Error),
}

/// Channel layer errors (pattern compilation).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Provisioning session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A previous attempt has not been reset yet
    #[error("session is busy ({state}); reset it before starting another attempt")]
    Busy { state: String },

    /// The provisioning request failed validation
    #[error("invalid provisioning request: {message}")]
    InvalidRequest { message: String },

    /// Invalid configuration in the session builder
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Neither boot signature appeared
    #[error("device did not report its boot state within {0:?}; press the reset button on the tracker and retry")]
    BootTimeout(Duration),

    /// The device is already provisioned under another identifier
    #[error("device is already provisioned as '{found}', not '{expected}'; send RESET from a serial monitor to erase it, then retry")]
    IdentityMismatch { expected: String, found: String },

    /// Neither the direct confirmation nor the INFO fallback matched
    #[error("device did not confirm provisioning; verify firmware and retry")]
    ConfirmationTimeout,

    /// The channel was closed by the operator mid-attempt
    #[error("provisioning cancelled")]
    Cancelled,
}

/// Port registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Enumerating system ports failed
    #[error("failed to enumerate serial ports: {0}")]
    Scan(#[source] tokio_serial::Error),

    /// A grant was requested but no picker is installed
    #[error("no port picker configured")]
    NoPicker,

    /// Selection index out of range
    #[error("port index {index} out of range ({len} granted)")]
    InvalidIndex { index: usize, len: usize },
}

/// Coarse classification of every error a provisioning attempt can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// No port, declined grant, or an open conflict adoption could not resolve.
    ChannelUnavailable,
    /// No boot signature in time.
    BootTimeout,
    /// Already provisioned with a different identifier. Never retried automatically.
    IdentityMismatch,
    /// The device never confirmed the credentials.
    ConfirmationTimeout,
    /// Read or write failure mid-session.
    TransportIo,
    /// Bad request, bad config, or a session that is still busy.
    InvalidRequest,
    /// Operator closed the channel.
    Cancelled,
}

impl Error {
    /// The layer's own message, without the layer prefix.
    ///
    /// This is what operators see in a session outcome.
    pub fn message(&self) -> String {
        match self {
            Error::Transport(e) => e.to_string(),
            Error::Channel(e) => e.to_string(),
            Error::Session(e) => e.to_string(),
            Error::Registry(e) => e.to_string(),
        }
    }

    /// Map this error onto the provisioning error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(e) => match e {
                TransportError::NoChannelSelected
                | TransportError::AlreadyOpen { .. }
                | TransportError::Busy { .. }
                | TransportError::OpenFailed { .. } => ErrorKind::ChannelUnavailable,
                TransportError::Closed
                | TransportError::Disconnected
                | TransportError::ReadFailed(_)
                | TransportError::Write(_) => ErrorKind::TransportIo,
            },
            Error::Channel(_) => ErrorKind::InvalidRequest,
            Error::Session(e) => match e {
                SessionError::Busy { .. }
                | SessionError::InvalidRequest { .. }
                | SessionError::InvalidConfig { .. } => ErrorKind::InvalidRequest,
                SessionError::BootTimeout(_) => ErrorKind::BootTimeout,
                SessionError::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
                SessionError::ConfirmationTimeout => ErrorKind::ConfirmationTimeout,
                SessionError::Cancelled => ErrorKind::Cancelled,
            },
            Error::Registry(_) => ErrorKind::ChannelUnavailable,
        }
    }
}

/// Result type alias using trackprov's Error.
pub type Result<T> = std::result::Result<T, Error>;
