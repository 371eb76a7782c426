//! Provisioning sessions.
//!
//! A session drives one tracker from boot to a confirmed credential store:
//!
//! ```text
//! Idle -> Connecting -> WaitingForBoot -+-> SendingCredentials -> AwaitingConfirmation -> Success
//!                                       +-> VerifyingExisting ----------------------------> Success
//!                     (any step) -> Error
//! ```
//!
//! Closing the channel from a [`SessionHandle`] while an attempt is running
//! sends the session back to `Idle`.

mod builder;
pub mod config;
mod outcome;
mod provisioning;
mod request;

pub use builder::SessionBuilder;
pub use config::{MIN_COMMAND_GAP, MIN_FINAL_SETTLE, SessionConfig};
pub use outcome::{ProvisioningOutcome, SessionState, Transition};
pub use provisioning::{ProvisioningSession, SessionHandle};
pub use request::ProvisioningRequest;
