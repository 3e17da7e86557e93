//! USB transport boundary.
//!
//! Defines the `UsbDevice` handle and `DeviceProvider` enumeration traits,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;

use super::disconnect::DisconnectHub;
use crate::descriptor::ConfigurationDescriptor;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device is not open")]
    NotOpen,

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to select configuration {value}: {message}")]
    ConfigurationFailed { value: u8, message: String },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Failed to select alternate setting {alternate} on interface {interface}: {message}")]
    AlternateFailed {
        interface: u8,
        alternate: u8,
        message: String,
    },

    #[error("Control transfer stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Control transfer failed: {0}")]
    TransferFailed(String),

    #[error("Reset failed: {0}")]
    ResetFailed(String),
}

/// Message fragments reported by backends when the device already left the bus.
const DEVICE_GONE_PATTERNS: &[&str] = &[
    "unable to reset",
    "device unavailable",
    "disconnected",
    "not found",
    "network error",
    "no such device",
];

impl TransportError {
    /// Whether the failure only says the device is no longer there.
    pub fn is_device_gone(&self) -> bool {
        if matches!(self, TransportError::Disconnected) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        DEVICE_GONE_PATTERNS.iter().any(|p| message.contains(p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet fields of a control transfer (direction is implied by the call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Abstract USB device handle.
///
/// Methods take `&self`; implementations keep their open/claimed state
/// behind interior mutability so a handle can be shared with observers.
pub trait UsbDevice: Send + Sync {
    /// Stable identity of one enumeration of the device.
    type Key: Clone + Eq + Hash + Debug + Send + 'static;

    fn key(&self) -> Self::Key;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    fn product_name(&self) -> Option<String>;

    fn serial_number(&self) -> Option<String>;

    /// Configuration descriptors, fully parsed.
    fn configurations(&self) -> Result<Vec<ConfigurationDescriptor>, TransportError>;

    fn is_open(&self) -> bool;

    fn open(&self) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;

    /// `bConfigurationValue` of the active configuration, if known.
    fn active_configuration(&self) -> Option<u8>;

    fn select_configuration(&self, value: u8) -> Result<(), TransportError>;

    fn is_claimed(&self, interface: u8) -> bool;

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn current_alternate(&self, interface: u8) -> Option<u8>;

    fn select_alternate(&self, interface: u8, alternate: u8) -> Result<(), TransportError>;

    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError>;

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransportError>;

    fn reset(&self) -> Result<(), TransportError>;
}

/// Device selection filter for authorization requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub serial_number: Option<String>,
}

impl DeviceFilter {
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            serial_number: None,
        }
    }

    pub fn with_serial(vendor_id: u16, serial: Option<String>) -> Self {
        Self {
            vendor_id,
            serial_number: serial.filter(|s| !s.is_empty()),
        }
    }

    pub fn matches<D: UsbDevice + ?Sized>(&self, device: &D) -> bool {
        device.vendor_id() == self.vendor_id
            && self
                .serial_number
                .as_ref()
                .is_none_or(|s| device.serial_number().as_deref() == Some(s.as_str()))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("No device selected")]
    Cancelled,

    #[error("No matching device found")]
    NoMatchingDevice,

    #[error("Access denied: {0}")]
    Blocked(String),

    #[error("{0}")]
    Other(String),
}

/// Enumeration and authorization of devices.
pub trait DeviceProvider: Send + Sync {
    type Device: UsbDevice;

    /// Devices the user already granted access to.
    fn authorized_devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    /// Ask the user to grant access to a device matching `filter`.
    fn request_device(&self, filter: &DeviceFilter) -> Result<Self::Device, RequestError>;

    /// Disconnect notifications for every device this provider hands out.
    fn disconnects(&self) -> Arc<DisconnectHub<<Self::Device as UsbDevice>::Key>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_gone_classification() {
        assert!(TransportError::Disconnected.is_device_gone());
        assert!(TransportError::ResetFailed("Unable to reset the device.".into()).is_device_gone());
        assert!(TransportError::TransferFailed("Device unavailable".into()).is_device_gone());
        assert!(TransportError::TransferFailed("NetworkError: A network error occurred".into()).is_device_gone());
        assert!(!TransportError::Stall.is_device_gone());
        assert!(!TransportError::ResetFailed("Access denied".into()).is_device_gone());
    }

    #[test]
    fn test_filter_ignores_empty_serial() {
        let filter = DeviceFilter::with_serial(0x2FE3, Some(String::new()));
        assert_eq!(filter.serial_number, None);
    }
}
