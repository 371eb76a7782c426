//! The (identifier, token) pair a session delivers.

use secrecy::{ExposeSecret, SecretString};

use crate::error::SessionError;
use crate::transport::config::DEFAULT_BAUD_RATE;

/// Immutable provisioning input, issued by the registry backend.
///
/// The token is held as a secret and never shows up in `Debug` output.
#[derive(Debug)]
pub struct ProvisioningRequest {
    device_id: String,
    token: SecretString,
}

impl ProvisioningRequest {
    /// Validate and wrap an issued pair.
    ///
    /// The identifier goes on a `KEY=value` line, so it cannot be empty or
    /// contain whitespace or `=`. The token cannot be empty or span lines.
    pub fn new(
        device_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let device_id = device_id.into();
        let token = SecretString::from(token.into());

        if device_id.is_empty() {
            return Err(invalid("device identifier is empty"));
        }
        if device_id.chars().any(|c| c.is_whitespace() || c == '=') {
            return Err(invalid("device identifier contains whitespace or '='"));
        }
        let raw = token.expose_secret();
        if raw.is_empty() {
            return Err(invalid("token is empty"));
        }
        if raw.contains(['\r', '\n']) {
            return Err(invalid("token contains a line break"));
        }

        Ok(Self { device_id, token })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// The lines an operator types into a serial monitor when no serial
    /// access is available, in order.
    pub fn manual_commands(&self) -> [String; 3] {
        [
            format!("DEVICE_ID={}", self.device_id),
            format!("TOKEN={}", self.token.expose_secret()),
            "PROVISION".to_string(),
        ]
    }

    /// Operator instructions for provisioning by hand.
    pub fn manual_instructions(&self) -> String {
        let mut text = format!(
            "Send these commands one by one in a serial monitor ({} baud, newline line ending):\n",
            DEFAULT_BAUD_RATE
        );
        for line in self.manual_commands() {
            text.push_str("  ");
            text.push_str(&line);
            text.push('\n');
        }
        text
    }
}

fn invalid(message: &str) -> SessionError {
    SessionError::InvalidRequest {
        message: message.to_string(),
    }
}
