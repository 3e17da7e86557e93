//! Binary descriptor decoding.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::{
    ConfigurationDescriptor, Descriptor, DescriptorError, DeviceDescriptor,
    DfuFunctionalDescriptor, InterfaceDescriptor, RawDescriptor,
};
use crate::protocol::constants::*;

fn ensure_len(data: &[u8], expected: usize) -> Result<(), DescriptorError> {
    if data.len() < expected {
        return Err(DescriptorError::TooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode a standard device descriptor.
pub fn parse_device(data: &[u8]) -> Result<DeviceDescriptor, DescriptorError> {
    ensure_len(data, DEVICE_DESC_LEN)?;
    Ok(DeviceDescriptor {
        length: data[0],
        descriptor_type: data[1],
        usb_version: LittleEndian::read_u16(&data[2..4]),
        device_class: data[4],
        device_subclass: data[5],
        device_protocol: data[6],
        max_packet_size: data[7],
        vendor_id: LittleEndian::read_u16(&data[8..10]),
        product_id: LittleEndian::read_u16(&data[10..12]),
        device_version: LittleEndian::read_u16(&data[12..14]),
        manufacturer_index: data[14],
        product_index: data[15],
        serial_index: data[16],
        num_configurations: data[17],
    })
}

/// Decode a configuration descriptor and everything following its header.
///
/// The sub-descriptor area is bounded by `wTotalLength` when that is
/// smaller than the buffer.
pub fn parse_configuration(data: &[u8]) -> Result<ConfigurationDescriptor, DescriptorError> {
    ensure_len(data, CONFIG_DESC_LEN)?;
    let total_length = LittleEndian::read_u16(&data[2..4]);
    let end = (total_length as usize).clamp(CONFIG_DESC_LEN, data.len());
    let start = (data[0] as usize).clamp(CONFIG_DESC_LEN, end);

    Ok(ConfigurationDescriptor {
        length: data[0],
        descriptor_type: data[1],
        total_length,
        num_interfaces: data[4],
        configuration_value: data[5],
        configuration_index: data[6],
        attributes: data[7],
        max_power: data[8],
        descriptors: parse_sub_descriptors(&data[start..end]),
    })
}

fn interface_from(raw: &[u8]) -> InterfaceDescriptor {
    InterfaceDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        interface_number: raw[2],
        alternate_setting: raw[3],
        num_endpoints: raw[4],
        interface_class: raw[5],
        interface_subclass: raw[6],
        interface_protocol: raw[7],
        interface_index: raw[8],
        extra: raw[INTERFACE_DESC_LEN..].to_vec(),
        descriptors: Vec::new(),
    }
}

/// Walk the descriptors following a configuration header.
///
/// Functional descriptors are attached to the open interface only when it
/// is DFU capable. Anything else becomes an opaque record on the open
/// interface, or at the top level before the first interface. Scanning
/// stops at the first malformed length.
pub fn parse_sub_descriptors(data: &[u8]) -> Vec<Descriptor> {
    let mut top = Vec::new();
    let mut current: Option<InterfaceDescriptor> = None;
    let mut remaining = data;

    while remaining.len() >= 2 {
        let length = remaining[0] as usize;
        let descriptor_type = remaining[1];
        if length < 2 || length > remaining.len() {
            debug!(
                length,
                available = remaining.len(),
                "Truncated descriptor, stopping scan"
            );
            break;
        }
        let (raw, rest) = remaining.split_at(length);
        remaining = rest;

        match descriptor_type {
            DESC_TYPE_INTERFACE if length >= INTERFACE_DESC_LEN => {
                if let Some(done) = current.replace(interface_from(raw)) {
                    top.push(Descriptor::Interface(done));
                }
            }
            DESC_TYPE_DFU_FUNCTIONAL if length >= DFU_FUNCTIONAL_DESC_LEN => match current.as_mut() {
                Some(intf) if intf.is_dfu() => {
                    intf.descriptors
                        .push(Descriptor::Functional(functional_from(raw)));
                }
                Some(intf) => intf.descriptors.push(opaque(raw)),
                None => top.push(opaque(raw)),
            },
            _ => match current.as_mut() {
                Some(intf) => intf.descriptors.push(opaque(raw)),
                None => top.push(opaque(raw)),
            },
        }
    }

    if let Some(done) = current {
        top.push(Descriptor::Interface(done));
    }
    top
}

fn opaque(raw: &[u8]) -> Descriptor {
    Descriptor::Other(RawDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        data: raw.to_vec(),
    })
}

fn functional_from(raw: &[u8]) -> DfuFunctionalDescriptor {
    DfuFunctionalDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        attributes: raw[2],
        detach_timeout: LittleEndian::read_u16(&raw[3..5]),
        transfer_size: LittleEndian::read_u16(&raw[5..7]),
        dfu_version: LittleEndian::read_u16(&raw[7..9]),
    }
}

/// Decode a DFU functional descriptor (9 bytes).
pub fn parse_functional(data: &[u8]) -> Result<DfuFunctionalDescriptor, DescriptorError> {
    ensure_len(data, DFU_FUNCTIONAL_DESC_LEN)?;
    Ok(functional_from(data))
}

fn utf16_units(data: &[u8]) -> Vec<u16> {
    let end = (data[0] as usize).clamp(2, data.len());
    data[2..end]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect()
}

/// Decode a string descriptor (UCS-2 LE).
pub fn parse_string(data: &[u8]) -> Result<String, DescriptorError> {
    ensure_len(data, 2)?;
    if data[1] != DESC_TYPE_STRING {
        return Err(DescriptorError::UnexpectedType {
            expected: DESC_TYPE_STRING,
            actual: data[1],
        });
    }
    Ok(String::from_utf16_lossy(&utf16_units(data)))
}

/// Decode string descriptor 0, the list of supported language IDs.
pub fn parse_language_ids(data: &[u8]) -> Result<Vec<u16>, DescriptorError> {
    ensure_len(data, 2)?;
    Ok(utf16_units(data))
}
