//! Builder for provisioning sessions.

use std::sync::Arc;
use std::time::Duration;

use super::config::SessionConfig;
use super::provisioning::ProvisioningSession;
use crate::channel::DevicePatterns;
use crate::error::Result;
use crate::registry::ChannelRegistry;
use crate::transport::{PortOpener, SerialChannel, SerialConfig, SystemOpener};

/// Builder for [`ProvisioningSession`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use trackprov::{ChannelRegistry, SessionBuilder};
///
/// # fn example() -> Result<(), trackprov::Error> {
/// let registry = Arc::new(ChannelRegistry::system());
/// let session = SessionBuilder::new(registry)
///     .baud_rate(115_200)
///     .boot_timeout(Duration::from_secs(15))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    registry: Arc<ChannelRegistry>,
    opener: Option<Arc<dyn PortOpener>>,
    serial: SerialConfig,
    config: SessionConfig,
    patterns: Option<DevicePatterns>,
}

impl SessionBuilder {
    /// Create a builder whose sessions open ports granted in `registry`.
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            opener: None,
            serial: SerialConfig::default(),
            config: SessionConfig::default(),
            patterns: None,
        }
    }

    /// Open ports with `opener` instead of the operating system.
    pub fn opener(mut self, opener: impl PortOpener + 'static) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    /// Set all serial line parameters.
    pub fn serial_config(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    /// Set the baud rate (default: 115200).
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.serial.baud_rate = baud_rate;
        self
    }

    /// Set all session timings.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long to wait for the device to boot.
    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.config.boot_timeout = timeout;
        self
    }

    /// Set the spacing between credential commands.
    pub fn command_gap(mut self, gap: Duration) -> Self {
        self.config.command_gap = gap;
        self
    }

    /// Set how long to wait for the direct confirmation.
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.config.confirm_timeout = timeout;
        self
    }

    /// Set the pattern polling cadence.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Use custom firmware signatures.
    pub fn patterns(mut self, patterns: DevicePatterns) -> Self {
        self.patterns = Some(patterns);
        self
    }

    /// Build the session.
    ///
    /// No port is opened until [`ProvisioningSession::run`].
    pub fn build(self) -> Result<ProvisioningSession> {
        self.config.validate()?;

        let patterns = match self.patterns {
            Some(patterns) => patterns,
            None => DevicePatterns::new()?,
        };
        let opener = self
            .opener
            .unwrap_or_else(|| Arc::new(SystemOpener) as Arc<dyn PortOpener>);

        let channel = SerialChannel::new(
            self.registry,
            opener,
            self.serial,
            self.config.transcript_capacity,
        );
        Ok(ProvisioningSession::new(channel, self.config, patterns))
    }
}
