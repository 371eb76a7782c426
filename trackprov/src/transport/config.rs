//! Serial line configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Baud rate spoken by the tracker firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Parity bit setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Hardware or software flow control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial port configuration.
///
/// Defaults to 115200 8N1 without flow control, which is what the tracker
/// firmware expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed.
    pub baud_rate: u32,

    /// Data bits per character (5 to 8).
    pub data_bits: u8,

    /// Parity bit.
    pub parity: Parity,

    /// Stop bits (1 or 2).
    pub stop_bits: u8,

    /// Flow control mode.
    pub flow_control: FlowControl,

    /// Timeout applied by the OS driver to blocking operations.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            timeout: Duration::from_millis(500),
        }
    }
}

impl SerialConfig {
    /// Build a `tokio_serial` port builder for the given path.
    pub(crate) fn port_builder(&self, path: &str) -> tokio_serial::SerialPortBuilder {
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match self.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        tokio_serial::new(path, self.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(self.timeout)
    }
}
