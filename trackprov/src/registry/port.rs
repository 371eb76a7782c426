//! Port descriptors, identities and discovery.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_serial::SerialPortType;

use crate::error::RegistryError;

/// Silicon Labs CP210x.
pub const VID_SILICON_LABS: u16 = 0x10c4;
/// WCH CH34x.
pub const VID_WCH: u16 = 0x1a86;
/// FTDI.
pub const VID_FTDI: u16 = 0x0403;
/// Espressif native USB.
pub const VID_ESPRESSIF: u16 = 0x303a;

/// System path of a serial port, e.g. `/dev/ttyUSB0` or `COM3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortDescriptor(String);

impl PortDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable identity of the device behind a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortIdentity {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortIdentity {
    /// USB identity with just vendor and product IDs.
    pub fn usb(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Self::default()
        }
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(f, "{:04x}", vid)?,
            None => f.write_str("????")?,
        }
        match self.product_id {
            Some(pid) => write!(f, ":{:04x}", pid)?,
            None => f.write_str(":????")?,
        }
        if let Some(product) = &self.product {
            write!(f, " ({})", product)?;
        }
        Ok(())
    }
}

/// A port together with its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub descriptor: PortDescriptor,
    pub identity: PortIdentity,
}

impl PortInfo {
    pub fn new(path: impl Into<String>, identity: PortIdentity) -> Self {
        Self {
            descriptor: PortDescriptor::new(path),
            identity,
        }
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.descriptor, self.identity)
    }
}

/// Hints narrowing which ports are offered for a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFilter {
    /// Accepted USB vendor IDs. Empty accepts every port.
    pub vendor_ids: Vec<u16>,
}

impl PortFilter {
    /// Accept every port.
    pub fn any() -> Self {
        Self {
            vendor_ids: Vec::new(),
        }
    }

    pub fn matches(&self, port: &PortInfo) -> bool {
        self.vendor_ids.is_empty()
            || port
                .identity
                .vendor_id
                .is_some_and(|vid| self.vendor_ids.contains(&vid))
    }
}

impl Default for PortFilter {
    /// The USB-UART bridges trackers ship with.
    fn default() -> Self {
        Self {
            vendor_ids: vec![VID_SILICON_LABS, VID_WCH, VID_FTDI, VID_ESPRESSIF],
        }
    }
}

/// Enumerates ports present on the system.
pub trait PortScanner: Send + Sync {
    fn scan(&self) -> Result<Vec<PortInfo>, RegistryError>;
}

/// Enumerates ports with `serialport` (through `tokio-serial`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScanner;

impl PortScanner for SystemScanner {
    fn scan(&self) -> Result<Vec<PortInfo>, RegistryError> {
        let ports = tokio_serial::available_ports().map_err(RegistryError::Scan)?;
        Ok(ports
            .into_iter()
            .map(|port| {
                let identity = match port.port_type {
                    SerialPortType::UsbPort(usb) => PortIdentity {
                        vendor_id: Some(usb.vid),
                        product_id: Some(usb.pid),
                        serial_number: usb.serial_number,
                        manufacturer: usb.manufacturer,
                        product: usb.product,
                    },
                    _ => PortIdentity::default(),
                };
                PortInfo::new(port.port_name, identity)
            })
            .collect())
    }
}

/// A fixed list of ports, for hosts without enumeration support.
#[derive(Debug, Default, Clone)]
pub struct StaticScanner(pub Vec<PortInfo>);

impl PortScanner for StaticScanner {
    fn scan(&self) -> Result<Vec<PortInfo>, RegistryError> {
        Ok(self.0.clone())
    }
}
