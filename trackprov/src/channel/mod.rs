//! Channel layer: transcript, pattern waits and paced command writes.
//!
//! Everything here sits on top of an open [`ChannelHandle`](crate::transport::ChannelHandle)
//! and treats the device's output as an unstructured log rather than framed
//! replies.

pub mod patterns;
mod transcript;
mod waiter;
mod writer;

pub use patterns::DevicePatterns;
pub use transcript::{BaselineGuard, DEFAULT_CAPACITY, Transcript};
pub use waiter::{DEFAULT_POLL_INTERVAL, MatchScope, PatternWaiter};
pub use writer::{Command, CommandWriter};
