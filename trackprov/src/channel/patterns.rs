//! Patterns the tracker firmware prints, and helpers to compile them.
//!
//! All matching is case-insensitive and unanchored: the device interleaves
//! these messages with arbitrary log output.

use regex::{Regex, RegexBuilder};

use crate::error::ChannelError;

/// Boot: the device has no credentials and is waiting for them.
pub const NEEDS_PROVISIONING: &str = r"Waiting for provisioning commands";

/// Boot: the device already holds credentials.
pub const ALREADY_PROVISIONED: &str = r"Device provisioned successfully";

/// Direct confirmation after `PROVISION`.
pub const CREDENTIALS_STORED: &str =
    r"Credentials stored successfully|Configuration saved successfully";

/// `INFO` reply confirming a stored credential.
pub const INFO_PROVISIONED: &str = r"provisioned=yes";

/// The device rebooted, which it only does after accepting credentials.
pub const REBOOT: &str = r"Stored token.*Rebooting|rst:0x[0-9a-f]+|ESP32 Tracker boot";

/// Compile a pattern with case-insensitive matching.
pub fn compile(pattern: &str) -> Result<Regex, ChannelError> {
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}

/// Characters the firmware allows in a stored identifier.
const IDENTIFIER_CHARS: &str = r"A-Za-z0-9_.\-";

/// Pattern for the `INFO` reply carrying exactly this identifier.
///
/// The identifier is escaped and must be followed by a character that
/// cannot belong to an identifier, so `TRK-0099` does not match a stored
/// `TRK-00990` but does match `device_id=TRK-0099,provisioned=yes`. The end
/// of the transcript does not count: the rest of the line may still be in
/// flight.
pub fn identity(device_id: &str) -> Result<Regex, ChannelError> {
    compile(&format!(
        r"device_id={}[^{}]",
        regex::escape(device_id),
        IDENTIFIER_CHARS
    ))
}

/// Pull the stored identifier out of an `INFO` reply, if one is visible.
///
/// The last reported value wins.
pub fn stored_identity(text: &str) -> Option<String> {
    let pattern = compile(&format!(r"device_id=([{}]+)", IDENTIFIER_CHARS)).ok()?;
    pattern
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// The compiled set of device patterns a session waits on.
#[derive(Debug, Clone)]
pub struct DevicePatterns {
    pub needs_provisioning: Regex,
    pub already_provisioned: Regex,
    pub credentials_stored: Regex,
    pub info_provisioned: Regex,
    pub reboot: Regex,
}

impl DevicePatterns {
    /// Compile the patterns the stock tracker firmware prints.
    pub fn new() -> Result<Self, ChannelError> {
        Ok(Self {
            needs_provisioning: compile(NEEDS_PROVISIONING)?,
            already_provisioned: compile(ALREADY_PROVISIONED)?,
            credentials_stored: compile(CREDENTIALS_STORED)?,
            info_provisioned: compile(INFO_PROVISIONED)?,
            reboot: compile(REBOOT)?,
        })
    }
}
