//! Typed DFU and standard requests over a raw device handle.

use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::traits::{ControlSetup, Recipient, RequestType, TransportError, UsbDevice};
use crate::descriptor::{
    ConfigurationDescriptor, DeviceDescriptor, parse_configuration, parse_device,
    parse_language_ids, parse_string,
};
use crate::error::DfuError;
use crate::events::{FlashEvent, FlashObserver, PacketDirection};
use crate::protocol::constants::*;

/// A device handle bound to one interface number.
pub struct DfuTransport<D> {
    device: D,
    interface: u8,
    observer: Arc<dyn FlashObserver>,
}

impl<D: UsbDevice> DfuTransport<D> {
    pub fn new(device: D, interface: u8, observer: Arc<dyn FlashObserver>) -> Self {
        Self {
            device,
            interface,
            observer,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn interface_number(&self) -> u8 {
        self.interface
    }

    fn class_setup(&self, request: u8, value: u16) -> ControlSetup {
        ControlSetup {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: self.interface as u16,
        }
    }

    fn packet(&self, direction: PacketDirection, request: u8, value: u16, length: usize) {
        self.observer.on_event(&FlashEvent::Packet {
            direction,
            request,
            value,
            length,
        });
    }

    /// Class request to the interface, host to device.
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub fn control_out(&self, request: u8, data: &[u8], value: u16) -> Result<usize, TransportError> {
        let written = self
            .device
            .control_out(self.class_setup(request, value), data)?;
        self.packet(PacketDirection::Tx, request, value, written);
        Ok(written)
    }

    /// Class request to the interface, device to host.
    #[instrument(level = "trace", skip(self))]
    pub fn control_in(&self, request: u8, length: u16, value: u16) -> Result<Vec<u8>, TransportError> {
        let data = self
            .device
            .control_in(self.class_setup(request, value), length)?;
        self.packet(PacketDirection::Rx, request, value, data.len());
        Ok(data)
    }

    fn get_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        lang_id: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let value = ((descriptor_type as u16) << 8) | index as u16;
        let setup = ControlSetup {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: USB_REQ_GET_DESCRIPTOR,
            value,
            index: lang_id,
        };
        let data = self.device.control_in(setup, length)?;
        self.packet(PacketDirection::Rx, USB_REQ_GET_DESCRIPTOR, value, data.len());
        Ok(data)
    }

    pub fn read_device_descriptor(&self) -> Result<DeviceDescriptor, DfuError> {
        let data = self.get_descriptor(DESC_TYPE_DEVICE, 0, 0, DEVICE_DESC_LEN as u16)?;
        Ok(parse_device(&data)?)
    }

    /// Header first to learn `wTotalLength`, then the whole descriptor.
    pub fn read_configuration_descriptor(
        &self,
        index: u8,
    ) -> Result<ConfigurationDescriptor, DfuError> {
        let header =
            self.get_descriptor(DESC_TYPE_CONFIGURATION, index, 0, CONFIG_DESC_LEN as u16)?;
        let header = parse_configuration(&header)?;
        let total = header.total_length.max(CONFIG_DESC_LEN as u16);
        debug!(index, total, "Reading configuration descriptor");
        let data = self.get_descriptor(DESC_TYPE_CONFIGURATION, index, 0, total)?;
        Ok(parse_configuration(&data)?)
    }

    fn read_string_raw(&self, index: u8, lang_id: u16) -> Result<Vec<u8>, DfuError> {
        let head = self.get_descriptor(DESC_TYPE_STRING, index, lang_id, 1)?;
        let Some(&length) = head.first() else {
            return Err(TransportError::TransferFailed("empty string descriptor".into()).into());
        };
        trace!(index, length, "String descriptor length");
        Ok(self.get_descriptor(DESC_TYPE_STRING, index, lang_id, length as u16)?)
    }

    /// Text of string descriptor `index` in language `lang_id`.
    pub fn read_string_descriptor(&self, index: u8, lang_id: u16) -> Result<String, DfuError> {
        let data = self.read_string_raw(index, lang_id)?;
        Ok(parse_string(&data)?)
    }

    /// Language IDs from string descriptor 0.
    pub fn read_language_ids(&self) -> Result<Vec<u16>, DfuError> {
        let data = self.read_string_raw(0, 0)?;
        Ok(parse_language_ids(&data)?)
    }
}
