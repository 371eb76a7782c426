//! Session states and the outcome the UI observes.

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::ErrorKind;

/// States of a provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    WaitingForBoot,
    VerifyingExisting,
    SendingCredentials,
    AwaitingConfirmation,
    Success,
    Error,
}

impl SessionState {
    /// `Success` and `Error` end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Success | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::WaitingForBoot => "waiting for boot",
            SessionState::VerifyingExisting => "verifying existing",
            SessionState::SendingCredentials => "sending credentials",
            SessionState::AwaitingConfirmation => "awaiting confirmation",
            SessionState::Success => "success",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the UI sees of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningOutcome {
    /// Current state.
    pub status: SessionState,

    /// Human-readable status line.
    pub message: String,

    /// Whether the device holds the requested credentials.
    pub success: bool,

    /// Error classification, on `Error`.
    pub error: Option<ErrorKind>,

    /// Transcript tail for troubleshooting, on `Error`.
    pub diagnostic: Option<String>,
}

impl ProvisioningOutcome {
    /// The outcome of a fresh session.
    pub fn idle() -> Self {
        Self::progress(SessionState::Idle, "")
    }

    /// A non-terminal status update.
    pub fn progress(status: SessionState, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            success: false,
            error: None,
            diagnostic: None,
        }
    }

    /// The device holds the requested credentials.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: SessionState::Success,
            message: message.into(),
            success: true,
            error: None,
            diagnostic: None,
        }
    }

    /// The attempt failed.
    pub fn failed(kind: ErrorKind, message: impl Into<String>, diagnostic: Option<String>) -> Self {
        Self {
            status: SessionState::Error,
            message: message.into(),
            success: false,
            error: Some(kind),
            diagnostic,
        }
    }
}

impl Default for ProvisioningOutcome {
    fn default() -> Self {
        Self::idle()
    }
}

impl fmt::Display for ProvisioningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

/// One recorded state change within an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: SessionState,
    pub message: String,
    pub at: Instant,
}
