//! Session timing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{DEFAULT_CAPACITY, DEFAULT_POLL_INTERVAL};
use crate::error::SessionError;

/// Shortest inter-command gap the firmware tolerates.
pub const MIN_COMMAND_GAP: Duration = Duration::from_millis(300);

/// Shortest pause after `PROVISION` before the firmware answers reliably.
pub const MIN_FINAL_SETTLE: Duration = Duration::from_millis(500);

/// Timeouts and pacing for a provisioning session.
///
/// The defaults match what the stock tracker firmware needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for either boot signature.
    pub boot_timeout: Duration,

    /// Pause before and after the `INFO` query on an already provisioned device.
    pub verify_settle: Duration,

    /// How long to wait for the `device_id=` reply.
    pub identity_timeout: Duration,

    /// Pause between the boot signature and the first credential command.
    pub pre_send_delay: Duration,

    /// Minimum spacing between credential commands.
    pub command_gap: Duration,

    /// Minimum pause after `PROVISION` before waiting for confirmation.
    pub final_settle: Duration,

    /// How long to wait for the direct "stored successfully" confirmation.
    pub confirm_timeout: Duration,

    /// How long to wait for `provisioned=yes` after the fallback `INFO`.
    pub info_confirm_timeout: Duration,

    /// Pattern polling cadence.
    pub poll_interval: Duration,

    /// Transcript retention cap in bytes.
    pub transcript_capacity: usize,

    /// How much transcript tail an error outcome carries.
    pub diagnostic_tail: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(10),
            verify_settle: Duration::from_secs(1),
            identity_timeout: Duration::from_secs(3),
            pre_send_delay: Duration::from_millis(500),
            command_gap: MIN_COMMAND_GAP,
            final_settle: MIN_FINAL_SETTLE,
            confirm_timeout: Duration::from_secs(8),
            info_confirm_timeout: Duration::from_secs(4),
            poll_interval: DEFAULT_POLL_INTERVAL,
            transcript_capacity: DEFAULT_CAPACITY,
            diagnostic_tail: 2048,
        }
    }
}

impl SessionConfig {
    /// Reject settings that would break the firmware's command handling.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.command_gap < MIN_COMMAND_GAP {
            return Err(SessionError::InvalidConfig {
                message: format!(
                    "command gap {:?} is below the firmware minimum of {:?}",
                    self.command_gap, MIN_COMMAND_GAP
                ),
            });
        }
        if self.final_settle < MIN_FINAL_SETTLE {
            return Err(SessionError::InvalidConfig {
                message: format!(
                    "final settle {:?} is below the firmware minimum of {:?}",
                    self.final_settle, MIN_FINAL_SETTLE
                ),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(SessionError::InvalidConfig {
                message: "poll interval must be non-zero".to_string(),
            });
        }
        if self.transcript_capacity < 1024 {
            return Err(SessionError::InvalidConfig {
                message: format!(
                    "transcript capacity {} is too small to hold a boot log",
                    self.transcript_capacity
                ),
            });
        }
        Ok(())
    }

    /// Upper bound on the whole confirmation phase.
    pub(crate) fn confirmation_window(&self) -> Duration {
        self.confirm_timeout + self.info_confirm_timeout + self.verify_settle
    }
}
