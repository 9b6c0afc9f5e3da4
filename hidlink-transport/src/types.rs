//! Common types for the transport layer

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default vendor ID matched when nothing else is configured
pub const DEFAULT_VENDOR_ID: u16 = 4617;

/// Default product ID matched when nothing else is configured
pub const DEFAULT_PRODUCT_ID: u16 = 1;

/// Vendor/product pair that selects candidate devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Criteria {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl Criteria {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check whether a descriptor belongs to this matching universe
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        device.vendor_id == self.vendor_id && device.product_id == self.product_id
    }
}

impl Default for Criteria {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID)
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Transport-assigned identity of an attached device
///
/// Stable while the device stays attached. A device that is unplugged and
/// plugged back in receives a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque token for an open device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// HID top-level collection exposed by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub usage_page: u16,
    pub usage: u16,
    /// USB interface number (-1 when the platform does not report one)
    pub interface_number: i32,
}

/// Device identification produced by enumeration
///
/// Two descriptors refer to the same device instance iff their `device_id`s
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Platform device path
    pub path: String,
    /// Product name if available
    pub product_name: Option<String>,
    /// Serial number if available
    pub serial: Option<String>,
    /// Top-level collections, in enumeration order
    pub collections: Vec<Collection>,
}

impl DeviceDescriptor {
    /// Minimal descriptor, mostly useful for tests and the mock backend
    pub fn new(device_id: DeviceId, vendor_id: u16, product_id: u16) -> Self {
        Self {
            device_id,
            vendor_id,
            product_id,
            path: format!("mock:{}", device_id),
            product_name: None,
            serial: None,
            collections: Vec::new(),
        }
    }

    pub fn criteria(&self) -> Criteria {
        Criteria::new(self.vendor_id, self.product_id)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {} ({:04X}:{:04X}",
            self.device_id, self.vendor_id, self.product_id
        )?;
        if let Some(name) = &self.product_name {
            write!(f, " {name}")?;
        }
        write!(f, ")")
    }
}

/// A single input report read from the device's interrupt pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputReport {
    /// Report ID (0 for devices without numbered reports)
    pub report_id: u8,
    pub data: Vec<u8>,
}

impl InputReport {
    pub fn new(report_id: u8, data: Vec<u8>) -> Self {
        Self { report_id, data }
    }

    /// Build a report from raw read bytes
    ///
    /// With `numbered` set the first byte is the report ID, as hidapi
    /// returns it for devices that use numbered reports.
    pub fn from_raw(raw: &[u8], numbered: bool) -> Self {
        match raw.split_first() {
            Some((&id, rest)) if numbered => Self::new(id, rest.to_vec()),
            _ => Self::new(0, raw.to_vec()),
        }
    }

    /// Limit the payload to `max_len` bytes
    pub fn truncate(&mut self, max_len: usize) {
        self.data.truncate(max_len);
    }
}

/// Hot-plug notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device was attached
    Added(DeviceDescriptor),
    /// A device was removed
    Removed(DeviceId),
}

/// Tunables for the hidapi-backed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Split the first byte of every read off as the report ID
    pub numbered_reports: bool,
    /// Read timeout per blocking read attempt (ms); bounds how long a
    /// released handle keeps its reader busy
    pub read_timeout_ms: i32,
    /// Rescan period used when no udev monitor is available (ms)
    pub rescan_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            numbered_reports: false,
            read_timeout_ms: 50,
            rescan_interval_ms: 1000,
        }
    }
}
