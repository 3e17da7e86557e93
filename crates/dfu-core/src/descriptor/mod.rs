//! USB descriptor records.
//!
//! Decoded values are immutable snapshots of the bytes the device returned.
//! Each record can be encoded back with `to_bytes`, which is how fixtures
//! for the mock transport are built.

mod discovery;
mod parse;

pub use discovery::{DfuMode, InterfaceSettings, find_dfu_interfaces};
pub use parse::{
    parse_configuration, parse_device, parse_functional, parse_language_ids, parse_string,
    parse_sub_descriptors,
};

use thiserror::Error;

use crate::protocol::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Descriptor too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Unexpected descriptor type: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedType { expected: u8, actual: u8 },
}

/// Standard device descriptor (18 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// `bcdUSB`
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEVICE_DESC_LEN);
        buf.push(DEVICE_DESC_LEN as u8);
        buf.push(DESC_TYPE_DEVICE);
        buf.extend_from_slice(&self.usb_version.to_le_bytes());
        buf.push(self.device_class);
        buf.push(self.device_subclass);
        buf.push(self.device_protocol);
        buf.push(self.max_packet_size);
        buf.extend_from_slice(&self.vendor_id.to_le_bytes());
        buf.extend_from_slice(&self.product_id.to_le_bytes());
        buf.extend_from_slice(&self.device_version.to_le_bytes());
        buf.push(self.manufacturer_index);
        buf.push(self.product_index);
        buf.push(self.serial_index);
        buf.push(self.num_configurations);
        buf
    }
}

/// Configuration descriptor with everything that followed its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// `wTotalLength` as reported by the device.
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    /// Interfaces and top-level descriptors in wire order.
    pub descriptors: Vec<Descriptor>,
}

impl ConfigurationDescriptor {
    /// Build a configuration from sub-descriptors; lengths are computed.
    pub fn new(configuration_value: u8, descriptors: Vec<Descriptor>) -> Self {
        let num_interfaces = descriptors
            .iter()
            .filter_map(|d| match d {
                Descriptor::Interface(intf) if intf.alternate_setting == 0 => Some(()),
                _ => None,
            })
            .count() as u8;
        let mut config = Self {
            length: CONFIG_DESC_LEN as u8,
            descriptor_type: DESC_TYPE_CONFIGURATION,
            total_length: 0,
            num_interfaces,
            configuration_value,
            configuration_index: 0,
            attributes: 0x80,
            max_power: 50,
            descriptors,
        };
        config.total_length = config.encoded_len() as u16;
        config
    }

    fn encoded_len(&self) -> usize {
        CONFIG_DESC_LEN + self.descriptors.iter().map(Descriptor::encoded_len).sum::<usize>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let total = self.encoded_len();
        let mut buf = Vec::with_capacity(total);
        buf.push(CONFIG_DESC_LEN as u8);
        buf.push(DESC_TYPE_CONFIGURATION);
        buf.extend_from_slice(&(total as u16).to_le_bytes());
        buf.push(self.num_interfaces);
        buf.push(self.configuration_value);
        buf.push(self.configuration_index);
        buf.push(self.attributes);
        buf.push(self.max_power);
        for desc in &self.descriptors {
            desc.write_to(&mut buf);
        }
        buf
    }

    /// All interface records (one per alternate setting).
    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.descriptors.iter().filter_map(|d| match d {
            Descriptor::Interface(intf) => Some(intf),
            _ => None,
        })
    }

    /// First DFU functional descriptor, preferring the given interface.
    pub fn functional_descriptor(
        &self,
        interface_number: u8,
        alternate_setting: u8,
    ) -> Option<&DfuFunctionalDescriptor> {
        self.interfaces()
            .find(|i| {
                i.interface_number == interface_number && i.alternate_setting == alternate_setting
            })
            .and_then(InterfaceDescriptor::functional)
            .or_else(|| self.interfaces().find_map(InterfaceDescriptor::functional))
    }
}

/// Sub-descriptor found after a configuration header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    Functional(DfuFunctionalDescriptor),
    Other(RawDescriptor),
}

impl Descriptor {
    fn encoded_len(&self) -> usize {
        match self {
            Descriptor::Interface(intf) => {
                intf.header_len() + intf.descriptors.iter().map(Self::encoded_len).sum::<usize>()
            }
            Descriptor::Functional(_) => DFU_FUNCTIONAL_DESC_LEN,
            Descriptor::Other(raw) => raw.data.len(),
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Descriptor::Interface(intf) => {
                intf.write_header(buf);
                for desc in &intf.descriptors {
                    desc.write_to(buf);
                }
            }
            Descriptor::Functional(func) => buf.extend_from_slice(&func.to_bytes()),
            Descriptor::Other(raw) => buf.extend_from_slice(&raw.data),
        }
    }
}

/// Interface descriptor for one alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// `iInterface` string index (0 = none).
    pub interface_index: u8,
    /// Vendor bytes past the standard nine when `bLength` is larger.
    pub extra: Vec<u8>,
    /// Descriptors that followed this interface (functional, endpoints, ...).
    pub descriptors: Vec<Descriptor>,
}

impl InterfaceDescriptor {
    /// DFU interface record with an attached functional descriptor.
    pub fn dfu(
        interface_number: u8,
        alternate_setting: u8,
        protocol: u8,
        interface_index: u8,
        functional: Option<DfuFunctionalDescriptor>,
    ) -> Self {
        Self {
            length: INTERFACE_DESC_LEN as u8,
            descriptor_type: DESC_TYPE_INTERFACE,
            interface_number,
            alternate_setting,
            num_endpoints: 0,
            interface_class: DFU_INTERFACE_CLASS,
            interface_subclass: DFU_INTERFACE_SUBCLASS,
            interface_protocol: protocol,
            interface_index,
            extra: Vec::new(),
            descriptors: functional.into_iter().map(Descriptor::Functional).collect(),
        }
    }

    /// Class 0xFE / subclass 0x01.
    pub fn is_dfu(&self) -> bool {
        self.interface_class == DFU_INTERFACE_CLASS
            && self.interface_subclass == DFU_INTERFACE_SUBCLASS
    }

    pub fn functional(&self) -> Option<&DfuFunctionalDescriptor> {
        self.descriptors.iter().find_map(|d| match d {
            Descriptor::Functional(func) => Some(func),
            _ => None,
        })
    }

    fn header_len(&self) -> usize {
        INTERFACE_DESC_LEN + self.extra.len()
    }

    fn write_header(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[
            self.header_len() as u8,
            DESC_TYPE_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.interface_index,
        ]);
        buf.extend_from_slice(&self.extra);
    }
}

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3
/// of the DFU 1.1 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuFunctionalDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// `bmAttributes`
    pub attributes: u8,
    /// `wDetachTimeOut` in milliseconds.
    pub detach_timeout: u16,
    /// `wTransferSize`
    pub transfer_size: u16,
    /// `bcdDFUVersion`
    pub dfu_version: u16,
}

impl DfuFunctionalDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub fn new(attributes: u8, detach_timeout: u16, transfer_size: u16, dfu_version: u16) -> Self {
        Self {
            length: DFU_FUNCTIONAL_DESC_LEN as u8,
            descriptor_type: DESC_TYPE_DFU_FUNCTIONAL,
            attributes,
            detach_timeout,
            transfer_size,
            dfu_version,
        }
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after the Manifestation phase
    /// (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device performs a bus detach-attach sequence on `DFU_DETACH`
    /// (`bitWillDetach`). The host must not issue a USB reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    pub fn to_bytes(&self) -> [u8; DFU_FUNCTIONAL_DESC_LEN] {
        let mut buf = [0u8; DFU_FUNCTIONAL_DESC_LEN];
        buf[0] = DFU_FUNCTIONAL_DESC_LEN as u8;
        buf[1] = DESC_TYPE_DFU_FUNCTIONAL;
        buf[2] = self.attributes;
        buf[3..5].copy_from_slice(&self.detach_timeout.to_le_bytes());
        buf[5..7].copy_from_slice(&self.transfer_size.to_le_bytes());
        buf[7..9].copy_from_slice(&self.dfu_version.to_le_bytes());
        buf
    }
}

/// Descriptor kept as raw bytes (endpoints, class-specific, vendor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Full descriptor including the two header bytes.
    pub data: Vec<u8>,
}

/// Encode a string descriptor (UCS-2 LE).
pub fn encode_string(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut buf = Vec::with_capacity(2 + units.len() * 2);
    buf.push((2 + units.len() * 2) as u8);
    buf.push(DESC_TYPE_STRING);
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

/// Encode the language-ID list (string descriptor 0).
pub fn encode_language_ids(ids: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + ids.len() * 2);
    buf.push((2 + ids.len() * 2) as u8);
    buf.push(DESC_TYPE_STRING);
    for id in ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}
