pub mod interface;
pub mod protocol;
pub mod unified;

pub use interface::{BoxedLink, Connector, DeviceLocator, LinkIo, LocatedPort, PortSnapshot, SerialConnector};
pub use protocol::{Command, FrameDecoder, FrameError, Method, Packet, Request, Response};

use serde::{Deserialize, Serialize};

/// One serial port as reported by the OS enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Human readable description, built the way pyserial builds it:
    /// manufacturer and product joined, empty when neither is known.
    pub fn description(&self) -> String {
        match (self.manufacturer.as_deref(), self.product.as_deref()) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (Some(m), None) => m.to_string(),
            (None, Some(p)) => p.to_string(),
            (None, None) => String::new(),
        }
    }
}

impl From<serialport::SerialPortInfo> for SerialDeviceInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let info = SerialDeviceInfo::new(port.port_name);
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => SerialDeviceInfo {
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
                ..info
            },
            _ => info,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("No ACE device found on any known path")]
    NoDevice,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
