use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::{Result, SerialDeviceInfo, SerialError};
use crate::config::SerialSelector;

// Stable udev names of the unit, most specific first
pub const BY_ID_DIR: &str = "/dev/serial/by-id";
pub const ACE_BY_ID_PATTERNS: &[&str] = &["usb-ANYCUBIC_ACE_1-if", "usb-ANYCUBIC"];

// STM32 CDC and the CH340 bridge used on some revisions
pub const ACE_USB_IDS: &[(u16, u16)] = &[(0x0483, 0x5740), (0x1A86, 0x7523)];
pub const ACE_DESCRIPTIONS: &[&str] = &["ANYCUBIC ACE", "BunnyAce", "DuckAce"];

pub const CONVENTIONAL_PREFIXES: &[&str] = &["/dev/ttyACM", "/dev/ttyUSB"];

/// Which rule of the fallback chain produced a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateStrategy {
    ById,
    UsbIds,
    Description,
    ConventionalPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedPort {
    pub path: String,
    pub strategy: LocateStrategy,
}

/// An entry of `/dev/serial/by-id` with its symlink already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByIdEntry {
    pub name: String,
    pub target: PathBuf,
}

/// Everything the locator looks at, captured in one go so that `locate`
/// itself stays pure.
#[derive(Debug, Clone, Default)]
pub struct PortSnapshot {
    pub by_id: Vec<ByIdEntry>,
    pub ports: Vec<SerialDeviceInfo>,
    pub dev_nodes: Vec<String>,
}

impl PortSnapshot {
    /// Read the by-id directory, the OS port enumeration and `/dev`
    pub fn capture() -> Self {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(SerialDeviceInfo::from).collect(),
            Err(e) => {
                log::warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        };

        Self {
            by_id: read_by_id(Path::new(BY_ID_DIR)),
            ports,
            dev_nodes: read_dev_nodes(Path::new("/dev")),
        }
    }
}

fn read_by_id(dir: &Path) -> Vec<ByIdEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            // realpath of the symlink; a dangling link is skipped
            let target = std::fs::canonicalize(entry.path()).ok()?;
            Some(ByIdEntry { name, target })
        })
        .collect()
}

fn read_dev_nodes(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .filter(|path| CONVENTIONAL_PREFIXES.iter().any(|prefix| path.starts_with(prefix)))
        .collect()
}

/// Resolves the device node of an ACE unit
#[derive(Debug, Clone)]
pub struct DeviceLocator {
    by_id_patterns: Vec<String>,
    usb_ids: Vec<(u16, u16)>,
    descriptions: Vec<String>,
    path_prefixes: Vec<String>,
}

impl DeviceLocator {
    pub fn new() -> Self {
        Self {
            by_id_patterns: ACE_BY_ID_PATTERNS.iter().map(|s| s.to_string()).collect(),
            usb_ids: ACE_USB_IDS.to_vec(),
            descriptions: ACE_DESCRIPTIONS.iter().map(|s| s.to_string()).collect(),
            path_prefixes: CONVENTIONAL_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Run the fallback chain against a snapshot.
    ///
    /// Order: by-id name, then USB VID/PID, then description substring
    /// (case-insensitive), then the first conventional device node. By-id
    /// always wins over VID/PID even when both match different ports.
    pub fn locate(&self, snapshot: &PortSnapshot) -> Option<LocatedPort> {
        self.by_id(snapshot)
            .map(|path| (path, LocateStrategy::ById))
            .or_else(|| self.by_usb_ids(snapshot).map(|path| (path, LocateStrategy::UsbIds)))
            .or_else(|| self.by_description(snapshot).map(|path| (path, LocateStrategy::Description)))
            .or_else(|| self.by_conventional_path(snapshot).map(|path| (path, LocateStrategy::ConventionalPath)))
            .map(|(path, strategy)| {
                log::info!("Found ACE device at {} ({:?})", path, strategy);
                LocatedPort { path, strategy }
            })
    }

    /// Capture a fresh snapshot and locate against it
    pub fn locate_now(&self) -> Option<LocatedPort> {
        let found = self.locate(&PortSnapshot::capture());
        if found.is_none() {
            log::warn!("No ACE device found");
        }
        found
    }

    fn by_id(&self, snapshot: &PortSnapshot) -> Option<String> {
        self.by_id_patterns.iter().find_map(|pattern| {
            let mut matches: Vec<&ByIdEntry> = snapshot
                .by_id
                .iter()
                .filter(|entry| entry.name.starts_with(pattern.as_str()))
                .collect();
            matches.sort_by(|a, b| a.name.cmp(&b.name));
            matches
                .first()
                .map(|entry| entry.target.to_string_lossy().into_owned())
        })
    }

    fn by_usb_ids(&self, snapshot: &PortSnapshot) -> Option<String> {
        snapshot
            .ports
            .iter()
            .find(|port| match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => self.usb_ids.contains(&(vid, pid)),
                _ => false,
            })
            .map(|port| port.port_name.clone())
    }

    fn by_description(&self, snapshot: &PortSnapshot) -> Option<String> {
        snapshot
            .ports
            .iter()
            .find(|port| {
                let description = port.description().to_uppercase();
                !description.is_empty()
                    && self
                        .descriptions
                        .iter()
                        .any(|name| description.contains(&name.to_uppercase()))
            })
            .map(|port| port.port_name.clone())
    }

    fn by_conventional_path(&self, snapshot: &PortSnapshot) -> Option<String> {
        self.path_prefixes.iter().find_map(|prefix| {
            let mut nodes: Vec<&String> = snapshot
                .dev_nodes
                .iter()
                .filter(|node| node.starts_with(prefix.as_str()))
                .collect();
            nodes.sort();
            nodes.first().map(|node| node.to_string())
        })
    }
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte stream the reader and writer tasks run over
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkIo for T {}

pub type BoxedLink = Box<dyn LinkIo>;

/// Opens links to the unit. The real implementation talks to a serial
/// port; tests plug in an in-memory duplex.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve the port path for the next connection attempt
    async fn resolve(&self) -> Result<String>;

    async fn open(&self, path: &str, baud: u32) -> Result<BoxedLink>;
}

pub struct SerialConnector {
    selector: SerialSelector,
    locator: DeviceLocator,
}

impl SerialConnector {
    pub fn new(selector: SerialSelector) -> Self {
        Self {
            selector,
            locator: DeviceLocator::new(),
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn resolve(&self) -> Result<String> {
        match &self.selector {
            SerialSelector::Path(path) => Ok(path.clone()),
            SerialSelector::Auto => {
                let locator = self.locator.clone();
                // enumeration touches sysfs and can block
                let found = tokio::task::spawn_blocking(move || locator.locate_now())
                    .await
                    .map_err(|e| SerialError::ConnectionFailed(format!("Port discovery aborted: {}", e)))?;
                found.map(|port| port.path).ok_or(SerialError::NoDevice)
            }
        }
    }

    async fn open(&self, path: &str, baud: u32) -> Result<BoxedLink> {
        if !Path::new(path).exists() {
            return Err(SerialError::PortNotFound(path.to_string()));
        }

        let stream = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", path, e)))?;

        log::info!("Opened serial port {} at {} baud", path, baud);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_id(name: &str, target: &str) -> ByIdEntry {
        ByIdEntry {
            name: name.to_string(),
            target: PathBuf::from(target),
        }
    }

    #[test]
    fn by_id_takes_precedence_over_usb_ids() {
        let snapshot = PortSnapshot {
            by_id: vec![by_id("usb-ANYCUBIC_ACE_1-if00", "/dev/ttyACM3")],
            ports: vec![SerialDeviceInfo::new("/dev/ttyACM0").with_usb_ids(0x0483, 0x5740)],
            dev_nodes: vec!["/dev/ttyACM0".into(), "/dev/ttyACM3".into()],
        };

        let found = DeviceLocator::new().locate(&snapshot).unwrap();
        assert_eq!(found.path, "/dev/ttyACM3");
        assert_eq!(found.strategy, LocateStrategy::ById);
    }

    #[test]
    fn by_id_accepts_any_interface_suffix_and_sorts() {
        let snapshot = PortSnapshot {
            by_id: vec![
                by_id("usb-ANYCUBIC_ACE_1-if02", "/dev/ttyACM5"),
                by_id("usb-ANYCUBIC_ACE_1-if00", "/dev/ttyACM4"),
            ],
            ..Default::default()
        };

        assert_eq!(DeviceLocator::new().locate(&snapshot).unwrap().path, "/dev/ttyACM4");
    }

    #[test]
    fn vendor_fallback_pattern_used_when_exact_name_missing() {
        let snapshot = PortSnapshot {
            by_id: vec![
                by_id("usb-1a86_USB_Serial-if00-port0", "/dev/ttyUSB0"),
                by_id("usb-ANYCUBIC_Other_Board-if00", "/dev/ttyACM2"),
            ],
            ..Default::default()
        };

        let found = DeviceLocator::new().locate(&snapshot).unwrap();
        assert_eq!(found.path, "/dev/ttyACM2");
        assert_eq!(found.strategy, LocateStrategy::ById);
    }

    #[test]
    fn usb_ids_before_description() {
        let snapshot = PortSnapshot {
            ports: vec![
                SerialDeviceInfo::new("/dev/ttyACM1").with_product("DuckAce"),
                SerialDeviceInfo::new("/dev/ttyUSB7").with_usb_ids(0x1A86, 0x7523),
            ],
            ..Default::default()
        };

        let found = DeviceLocator::new().locate(&snapshot).unwrap();
        assert_eq!(found.path, "/dev/ttyUSB7");
        assert_eq!(found.strategy, LocateStrategy::UsbIds);
    }

    #[test]
    fn description_match_is_case_insensitive() {
        let snapshot = PortSnapshot {
            ports: vec![
                SerialDeviceInfo::new("/dev/ttyACM0").with_product("Some Printer"),
                SerialDeviceInfo::new("/dev/ttyACM1")
                    .with_manufacturer("Anycubic")
                    .with_product("Ace Pro"),
            ],
            ..Default::default()
        };

        let found = DeviceLocator::new().locate(&snapshot).unwrap();
        assert_eq!(found.path, "/dev/ttyACM1");
        assert_eq!(found.strategy, LocateStrategy::Description);
    }

    #[test]
    fn conventional_path_prefers_acm_then_usb() {
        let snapshot = PortSnapshot {
            dev_nodes: vec!["/dev/ttyUSB0".into(), "/dev/ttyACM1".into(), "/dev/ttyACM0".into()],
            ..Default::default()
        };

        let found = DeviceLocator::new().locate(&snapshot).unwrap();
        assert_eq!(found.path, "/dev/ttyACM0");
        assert_eq!(found.strategy, LocateStrategy::ConventionalPath);
    }

    #[test]
    fn nothing_found_on_empty_snapshot() {
        let snapshot = PortSnapshot {
            ports: vec![SerialDeviceInfo::new("/dev/ttyS0")],
            ..Default::default()
        };
        assert!(DeviceLocator::new().locate(&snapshot).is_none());
    }

    #[tokio::test]
    async fn explicit_path_skips_discovery() {
        let connector = SerialConnector::new(SerialSelector::Path("/dev/ttyACM9".into()));
        assert_eq!(connector.resolve().await.unwrap(), "/dev/ttyACM9");
    }

    #[tokio::test]
    async fn opening_missing_path_reports_port_not_found() {
        let connector = SerialConnector::new(SerialSelector::Auto);
        match connector.open("/dev/definitely-not-an-ace", 115200).await {
            Err(SerialError::PortNotFound(path)) => assert_eq!(path, "/dev/definitely-not-an-ace"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a missing port"),
        }
    }
}
