//! Serial transport layer wrapping tokio-serial.
//!
//! This module owns port handles: opening (or adopting) a port, decoding
//! what the device prints, writing bytes, and closing.

pub mod config;
pub mod decoder;
mod serial;

pub use config::{FlowControl, Parity, SerialConfig};
pub use decoder::{TextDecoder, read_chunks};
pub use serial::{
    BoxedStream, ChannelHandle, DeviceStream, LinkState, PortOpener, SerialChannel, SystemOpener,
};
