//! # trackprov
//!
//! Async serial provisioning for GPS tracker firmware.
//!
//! A tracker boots, prints either "Waiting for provisioning commands" or
//! "Device provisioned successfully", and accepts `KEY=value` lines over a
//! 115200 baud serial link. trackprov opens the port, waits for the boot
//! signature, sends the device identifier and token with the pacing the
//! firmware needs, and confirms the device stored them.
//!
//! ## Features
//!
//! - Serial ports via tokio-serial, with adoption of ports that are already open
//! - ANSI-stripped, bounded transcript of everything the device prints
//! - Bounded-time regex waits that never hang on a closed channel
//! - Confirmation by message, by `INFO` query, or by post-provisioning reboot
//! - Tokens kept in `secrecy` wrappers and masked in logs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackprov::{ChannelRegistry, PortFilter, ProvisioningRequest, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trackprov::Error> {
//!     let registry = Arc::new(ChannelRegistry::system());
//!     registry.discover(&PortFilter::default()).await?;
//!     registry.select(0)?;
//!
//!     let mut session = SessionBuilder::new(registry).build()?;
//!     let request = ProvisioningRequest::new("TRK-0099", "tok_abc123")?;
//!
//!     let outcome = session.run(&request, None).await?;
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use channel::{DevicePatterns, Transcript};
pub use error::{Error, ErrorKind};
pub use registry::{ChannelRegistry, GrantOutcome, PortDescriptor, PortFilter, PortInfo, PortPicker};
pub use session::{
    ProvisioningOutcome, ProvisioningRequest, ProvisioningSession, SessionBuilder, SessionConfig,
    SessionHandle, SessionState,
};
pub use transport::{ChannelHandle, SerialConfig};
