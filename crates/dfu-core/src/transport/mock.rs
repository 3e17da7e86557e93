//! Mock USB backend for testing.
//!
//! `MockDevice` simulates the DFU-mode state machine closely enough for the
//! download/upload workflows to run against it, and lets tests script
//! GETSTATUS replies, stall requests and pull the device off the bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::disconnect::DisconnectHub;
use super::traits::{
    ControlSetup, DeviceFilter, DeviceProvider, RequestError, RequestType, TransportError,
    UsbDevice,
};
use crate::descriptor::{
    ConfigurationDescriptor, Descriptor, DeviceDescriptor, DfuFunctionalDescriptor,
    InterfaceDescriptor, encode_language_ids, encode_string,
};
use crate::events::PacketDirection;
use crate::protocol::constants::*;
use crate::protocol::{DfuState, DfuStatus};

static NEXT_KEY: AtomicU32 = AtomicU32::new(1);

/// One captured control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub direction: PacketDirection,
    pub setup: ControlSetup,
    /// Requested length for IN transfers, payload length for OUT.
    pub length: u16,
    pub data: Vec<u8>,
}

struct MockState {
    open: bool,
    active_config: Option<u8>,
    claimed: HashSet<u8>,
    alternates: HashMap<u8, u8>,
    dfu_state: DfuState,
    status: u8,
    poll_timeout: u32,
    status_script: VecDeque<Result<Vec<u8>, TransportError>>,
    stalled: HashSet<u8>,
    control_log: Vec<ControlRecord>,
    blocks: Vec<(u16, usize)>,
    downloaded: Vec<u8>,
    upload_data: Vec<u8>,
    upload_offset: usize,
    disconnected: bool,
    disconnect_on_detach: bool,
    disconnect_on_reset: bool,
    reset_error: Option<TransportError>,
    reset_count: u32,
    open_error: Option<String>,
}

/// Simulated device handle. Clones share state.
#[derive(Clone)]
pub struct MockDevice {
    key: u32,
    vendor_id: u16,
    product_id: u16,
    product: Option<String>,
    serial: Option<String>,
    device_descriptor: DeviceDescriptor,
    configurations: Vec<ConfigurationDescriptor>,
    strings: Arc<HashMap<u8, String>>,
    manifestation_tolerant: bool,
    state: Arc<Mutex<MockState>>,
    hub: Arc<DisconnectHub<u32>>,
}

/// Builder for `MockDevice`.
pub struct MockDeviceBuilder {
    vendor_id: u16,
    product_id: u16,
    product: Option<String>,
    serial: Option<String>,
    interface_number: u8,
    protocol: u8,
    dfu_class: bool,
    functional: Option<DfuFunctionalDescriptor>,
    interface_name: Option<String>,
    strings: HashMap<u8, String>,
    initial_state: DfuState,
    disconnect_on_detach: bool,
    disconnect_on_reset: bool,
    hub: Option<Arc<DisconnectHub<u32>>>,
}

const INTERFACE_STRING_INDEX: u8 = 4;

impl MockDeviceBuilder {
    pub fn new() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: 0x0100,
            product: Some("DFU Device".into()),
            serial: Some("0001".into()),
            interface_number: 0,
            protocol: DFU_PROTOCOL_DFU_MODE,
            dfu_class: true,
            functional: Some(DfuFunctionalDescriptor::new(0x0D, 0, 1024, 0x0110)),
            interface_name: None,
            strings: HashMap::new(),
            initial_state: DfuState::DfuIdle,
            disconnect_on_detach: false,
            disconnect_on_reset: false,
            hub: None,
        }
    }

    pub fn vendor_id(mut self, vid: u16) -> Self {
        self.vendor_id = vid;
        self
    }

    pub fn product_id(mut self, pid: u16) -> Self {
        self.product_id = pid;
        self
    }

    pub fn product(mut self, name: &str) -> Self {
        self.product = Some(name.into());
        self
    }

    pub fn serial(mut self, serial: Option<&str>) -> Self {
        self.serial = serial.map(str::to_string);
        self
    }

    pub fn interface_number(mut self, number: u8) -> Self {
        self.interface_number = number;
        self
    }

    /// Device running its application (protocol 0x01, appIDLE).
    pub fn runtime(mut self) -> Self {
        self.protocol = DFU_PROTOCOL_RUNTIME;
        self.initial_state = DfuState::AppIdle;
        self
    }

    /// Interface with a non-DFU class.
    pub fn without_dfu(mut self) -> Self {
        self.dfu_class = false;
        self
    }

    pub fn functional(mut self, functional: Option<DfuFunctionalDescriptor>) -> Self {
        self.functional = functional;
        self
    }

    pub fn interface_name(mut self, name: &str) -> Self {
        self.interface_name = Some(name.into());
        self
    }

    pub fn string(mut self, index: u8, text: &str) -> Self {
        self.strings.insert(index, text.into());
        self
    }

    pub fn state(mut self, state: DfuState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn disconnect_on_detach(mut self, yes: bool) -> Self {
        self.disconnect_on_detach = yes;
        self
    }

    pub fn disconnect_on_reset(mut self, yes: bool) -> Self {
        self.disconnect_on_reset = yes;
        self
    }

    pub fn hub(mut self, hub: Arc<DisconnectHub<u32>>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> MockDevice {
        let mut strings = self.strings;
        if let Some(p) = &self.product {
            strings.insert(2, p.clone());
        }
        if let Some(s) = &self.serial {
            strings.insert(3, s.clone());
        }
        let name_index = match &self.interface_name {
            Some(name) => {
                strings.insert(INTERFACE_STRING_INDEX, name.clone());
                INTERFACE_STRING_INDEX
            }
            None => 0,
        };

        let mut intf = InterfaceDescriptor::dfu(
            self.interface_number,
            0,
            self.protocol,
            name_index,
            self.functional,
        );
        if !self.dfu_class {
            intf.interface_class = 0xFF;
        }
        let configurations = vec![ConfigurationDescriptor::new(
            1,
            vec![Descriptor::Interface(intf)],
        )];

        let device_descriptor = DeviceDescriptor {
            length: DEVICE_DESC_LEN as u8,
            descriptor_type: DESC_TYPE_DEVICE,
            usb_version: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size: 64,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_version: 0x0100,
            manufacturer_index: 0,
            product_index: if self.product.is_some() { 2 } else { 0 },
            serial_index: if self.serial.is_some() { 3 } else { 0 },
            num_configurations: configurations.len() as u8,
        };

        MockDevice {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            product: self.product,
            serial: self.serial,
            device_descriptor,
            configurations,
            strings: Arc::new(strings),
            manifestation_tolerant: self
                .functional
                .is_none_or(|f| f.manifestation_tolerant()),
            state: Arc::new(Mutex::new(MockState {
                open: false,
                active_config: None,
                claimed: HashSet::new(),
                alternates: HashMap::new(),
                dfu_state: self.initial_state,
                status: STATUS_OK,
                poll_timeout: 0,
                status_script: VecDeque::new(),
                stalled: HashSet::new(),
                control_log: Vec::new(),
                blocks: Vec::new(),
                downloaded: Vec::new(),
                upload_data: Vec::new(),
                upload_offset: 0,
                disconnected: false,
                disconnect_on_detach: self.disconnect_on_detach,
                disconnect_on_reset: self.disconnect_on_reset,
                reset_error: None,
                reset_count: 0,
                open_error: None,
            })),
            hub: self.hub.unwrap_or_default(),
        }
    }
}

impl Default for MockDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// All captured control transfers.
    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state.lock().unwrap().control_log.clone()
    }

    /// Captured class requests with the given request code.
    pub fn class_requests(&self, request: u8) -> Vec<ControlRecord> {
        self.control_log()
            .into_iter()
            .filter(|c| c.setup.request_type == RequestType::Class && c.setup.request == request)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().control_log.clear();
    }

    /// `(block number, payload length)` of every DNLOAD, sentinel included.
    pub fn download_blocks(&self) -> Vec<(u16, usize)> {
        self.state.lock().unwrap().blocks.clone()
    }

    pub fn downloaded(&self) -> Vec<u8> {
        self.state.lock().unwrap().downloaded.clone()
    }

    pub fn set_upload_data(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.upload_data = data.to_vec();
        state.upload_offset = 0;
    }

    /// Force the simulated state and status.
    pub fn set_state(&self, dfu_state: DfuState, status: u8) {
        let mut state = self.state.lock().unwrap();
        state.dfu_state = dfu_state;
        state.status = status;
    }

    pub fn dfu_state(&self) -> DfuState {
        self.state.lock().unwrap().dfu_state
    }

    pub fn set_poll_timeout(&self, ms: u32) {
        self.state.lock().unwrap().poll_timeout = ms;
    }

    /// Queue a GETSTATUS reply; scripted replies win over the simulation.
    pub fn push_status(&self, status: u8, dfu_state: DfuState) {
        let bytes = DfuStatus {
            status,
            poll_timeout: 0,
            state: dfu_state,
            string_index: 0,
        }
        .to_bytes()
        .to_vec();
        self.push_raw_status(bytes);
    }

    pub fn push_raw_status(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().status_script.push_back(Ok(bytes));
    }

    pub fn push_status_error(&self, error: TransportError) {
        self.state.lock().unwrap().status_script.push_back(Err(error));
    }

    /// Make every future request with this code stall.
    pub fn stall(&self, request: u8) {
        self.state.lock().unwrap().stalled.insert(request);
    }

    pub fn set_reset_error(&self, error: Option<TransportError>) {
        self.state.lock().unwrap().reset_error = error;
    }

    pub fn set_open_error(&self, message: Option<&str>) {
        self.state.lock().unwrap().open_error = message.map(str::to_string);
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().unwrap().reset_count
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().unwrap().disconnected
    }

    /// Simulate the device leaving the bus.
    pub fn unplug(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.disconnected = true;
            state.open = false;
            state.claimed.clear();
        }
        self.hub.notify(&self.key);
    }

    fn check_ready(state: &MockState) -> Result<(), TransportError> {
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        Ok(())
    }

    fn standard_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        if setup.request != USB_REQ_GET_DESCRIPTOR {
            return Err(TransportError::Stall);
        }
        let index = (setup.value & 0xFF) as u8;
        let mut data = match (setup.value >> 8) as u8 {
            DESC_TYPE_DEVICE => self.device_descriptor.to_bytes(),
            DESC_TYPE_CONFIGURATION => self
                .configurations
                .get(index as usize)
                .map(ConfigurationDescriptor::to_bytes)
                .ok_or(TransportError::Stall)?,
            DESC_TYPE_STRING if index == 0 => encode_language_ids(&[0x0409]),
            DESC_TYPE_STRING => self
                .strings
                .get(&index)
                .map(|s| encode_string(s))
                .ok_or(TransportError::Stall)?,
            _ => return Err(TransportError::Stall),
        };
        data.truncate(length as usize);
        Ok(data)
    }
}

impl UsbDevice for MockDevice {
    type Key = u32;

    fn key(&self) -> u32 {
        self.key
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn product_name(&self) -> Option<String> {
        self.product.clone()
    }

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }

    fn configurations(&self) -> Result<Vec<ConfigurationDescriptor>, TransportError> {
        Ok(self.configurations.clone())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn open(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if let Some(message) = &state.open_error {
            return Err(TransportError::OpenFailed(message.clone()));
        }
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.claimed.clear();
        Ok(())
    }

    fn active_configuration(&self) -> Option<u8> {
        self.state.lock().unwrap().active_config
    }

    fn select_configuration(&self, value: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_ready(&state)?;
        if !self
            .configurations
            .iter()
            .any(|c| c.configuration_value == value)
        {
            return Err(TransportError::ConfigurationFailed {
                value,
                message: "no such configuration".into(),
            });
        }
        state.active_config = Some(value);
        Ok(())
    }

    fn is_claimed(&self, interface: u8) -> bool {
        self.state.lock().unwrap().claimed.contains(&interface)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_ready(&state)?;
        state.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_ready(&state)?;
        state.claimed.remove(&interface);
        Ok(())
    }

    fn current_alternate(&self, interface: u8) -> Option<u8> {
        self.state.lock().unwrap().alternates.get(&interface).copied()
    }

    fn select_alternate(&self, interface: u8, alternate: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_ready(&state)?;
        if !state.claimed.contains(&interface) {
            return Err(TransportError::AlternateFailed {
                interface,
                alternate,
                message: "interface not claimed".into(),
            });
        }
        state.alternates.insert(interface, alternate);
        Ok(())
    }

    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_ready(&state)?;
        state.control_log.push(ControlRecord {
            direction: PacketDirection::Rx,
            setup,
            length,
            data: Vec::new(),
        });

        if setup.request_type == RequestType::Standard {
            drop(state);
            return self.standard_in(setup, length);
        }
        if state.stalled.contains(&setup.request) {
            return Err(TransportError::Stall);
        }

        match setup.request {
            DFU_GETSTATUS => {
                if let Some(reply) = state.status_script.pop_front() {
                    let bytes = reply?;
                    if let Some(status) = DfuStatus::from_bytes(&bytes) {
                        state.dfu_state = status.state;
                        state.status = status.status;
                    }
                    return Ok(bytes);
                }
                Ok(DfuStatus {
                    status: state.status,
                    poll_timeout: state.poll_timeout,
                    state: state.dfu_state,
                    string_index: 0,
                }
                .to_bytes()
                .to_vec())
            }
            DFU_GETSTATE => Ok(vec![state.dfu_state.as_u8()]),
            DFU_UPLOAD => {
                let start = state.upload_offset.min(state.upload_data.len());
                let end = (start + length as usize).min(state.upload_data.len());
                let chunk = state.upload_data[start..end].to_vec();
                state.upload_offset = end;
                state.dfu_state = if chunk.len() < length as usize {
                    DfuState::DfuIdle
                } else {
                    DfuState::UploadIdle
                };
                Ok(chunk)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_ready(&state)?;
        state.control_log.push(ControlRecord {
            direction: PacketDirection::Tx,
            setup,
            length: data.len() as u16,
            data: data.to_vec(),
        });
        if setup.request_type != RequestType::Class || state.stalled.contains(&setup.request) {
            return Err(TransportError::Stall);
        }

        match setup.request {
            DFU_DETACH => {
                if state.disconnect_on_detach {
                    drop(state);
                    self.unplug();
                } else {
                    state.dfu_state = DfuState::AppDetach;
                }
            }
            DFU_DNLOAD => {
                state.blocks.push((setup.value, data.len()));
                if data.is_empty() {
                    state.dfu_state = if self.manifestation_tolerant {
                        DfuState::DfuIdle
                    } else {
                        DfuState::ManifestWaitReset
                    };
                } else {
                    state.downloaded.extend_from_slice(data);
                    state.dfu_state = DfuState::DnloadIdle;
                }
            }
            DFU_CLRSTATUS => {
                state.status = STATUS_OK;
                if state.dfu_state == DfuState::DfuError {
                    state.dfu_state = DfuState::DfuIdle;
                }
            }
            DFU_ABORT => {
                if state.dfu_state != DfuState::DfuError {
                    state.dfu_state = DfuState::DfuIdle;
                }
            }
            _ => return Err(TransportError::Stall),
        }
        Ok(data.len())
    }

    fn reset(&self) -> Result<(), TransportError> {
        let (error, unplug) = {
            let mut state = self.state.lock().unwrap();
            state.reset_count += 1;
            (state.reset_error.clone(), state.disconnect_on_reset)
        };
        if unplug {
            self.unplug();
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct ProviderState {
    authorized: Vec<MockDevice>,
    offered: Vec<MockDevice>,
    request_error: Option<RequestError>,
    enumerate_error: Option<TransportError>,
    request_calls: u32,
    enumerate_calls: u32,
}

/// Simulated permission model: granted devices plus a chooser.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<ProviderState>>,
    hub: Arc<DisconnectHub<u32>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder wired to this provider's disconnect hub.
    pub fn builder(&self) -> MockDeviceBuilder {
        MockDeviceBuilder::new().hub(Arc::clone(&self.hub))
    }

    /// Grant access to `device` (as if chosen in an earlier run).
    pub fn authorize(&self, device: &MockDevice) {
        self.state.lock().unwrap().authorized.push(device.clone());
    }

    /// Make `device` selectable in the chooser.
    pub fn offer(&self, device: &MockDevice) {
        self.state.lock().unwrap().offered.push(device.clone());
    }

    /// Forget every grant, as when permissions do not survive a reload.
    pub fn revoke_all(&self) {
        self.state.lock().unwrap().authorized.clear();
    }

    /// Unplug `device` and drop it from every list.
    pub fn remove(&self, device: &MockDevice) {
        {
            let mut state = self.state.lock().unwrap();
            state.authorized.retain(|d| d.key != device.key);
            state.offered.retain(|d| d.key != device.key);
        }
        device.unplug();
    }

    /// Make the chooser fail with `error` until cleared.
    pub fn fail_requests(&self, error: Option<RequestError>) {
        self.state.lock().unwrap().request_error = error;
    }

    pub fn fail_enumeration(&self, error: Option<TransportError>) {
        self.state.lock().unwrap().enumerate_error = error;
    }

    pub fn request_calls(&self) -> u32 {
        self.state.lock().unwrap().request_calls
    }

    pub fn enumerate_calls(&self) -> u32 {
        self.state.lock().unwrap().enumerate_calls
    }
}

impl DeviceProvider for MockProvider {
    type Device = MockDevice;

    fn authorized_devices(&self) -> Result<Vec<MockDevice>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.enumerate_calls += 1;
        if let Some(e) = &state.enumerate_error {
            return Err(e.clone());
        }
        Ok(state
            .authorized
            .iter()
            .filter(|d| !d.is_disconnected())
            .cloned()
            .collect())
    }

    fn request_device(&self, filter: &DeviceFilter) -> Result<MockDevice, RequestError> {
        let mut state = self.state.lock().unwrap();
        state.request_calls += 1;
        if let Some(e) = &state.request_error {
            return Err(e.clone());
        }
        let chosen = state
            .offered
            .iter()
            .chain(state.authorized.iter())
            .find(|d| !d.is_disconnected() && filter.matches(*d))
            .cloned()
            .ok_or(RequestError::NoMatchingDevice)?;
        if !state.authorized.iter().any(|d| d.key == chosen.key) {
            state.authorized.push(chosen.clone());
        }
        Ok(chosen)
    }

    fn disconnects(&self) -> Arc<DisconnectHub<u32>> {
        Arc::clone(&self.hub)
    }
}
