//! nusb-based USB backend.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, TransferError};
use nusb::{DeviceId, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::disconnect::DisconnectHub;
use super::grants::GrantList;
use super::traits::{
    ControlSetup, DeviceFilter, DeviceProvider, Recipient, RequestError, RequestType,
    TransportError, UsbDevice,
};
use crate::descriptor::{ConfigurationDescriptor, parse_configuration, parse_device};
use crate::error::StoreError;
use crate::protocol::constants::*;

/// Interval of the presence poll feeding the disconnect hub.
const PRESENCE_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn map_transfer(e: TransferError) -> TransportError {
    match e {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::TransferFailed(other.to_string()),
    }
}

fn control_type(t: RequestType) -> ControlType {
    match t {
        RequestType::Standard => ControlType::Standard,
        RequestType::Class => ControlType::Class,
        RequestType::Vendor => ControlType::Vendor,
    }
}

fn recipient(r: Recipient) -> nusb::transfer::Recipient {
    match r {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

/// Whether the device exposes an interface with the DFU class/subclass.
pub fn is_dfu_device(info: &DeviceInfo) -> bool {
    info.interfaces().any(|i| {
        i.class() == DFU_INTERFACE_CLASS && i.subclass() == DFU_INTERFACE_SUBCLASS
    })
}

struct OpenDevice {
    device: nusb::Device,
    interfaces: HashMap<u8, Interface>,
    alternates: HashMap<u8, u8>,
    active_config: Option<u8>,
}

/// Device handle backed by nusb.
pub struct NusbDevice {
    info: DeviceInfo,
    handle: Mutex<Option<OpenDevice>>,
    configurations: Mutex<Option<Vec<ConfigurationDescriptor>>>,
}

impl NusbDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            handle: Mutex::new(None),
            configurations: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn with_open<R>(
        &self,
        f: impl FnOnce(&mut OpenDevice) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut handle = lock(&self.handle);
        let open = handle.as_mut().ok_or(TransportError::NotOpen)?;
        f(open)
    }

    fn get_descriptor(
        device: &nusb::Device,
        descriptor_type: u8,
        index: u8,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        device
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: nusb::transfer::Recipient::Device,
                    request: USB_REQ_GET_DESCRIPTOR,
                    value: ((descriptor_type as u16) << 8) | index as u16,
                    index: 0,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(map_transfer)
    }

    fn read_configurations(
        device: &nusb::Device,
    ) -> Result<Vec<ConfigurationDescriptor>, TransportError> {
        let raw = Self::get_descriptor(device, DESC_TYPE_DEVICE, 0, DEVICE_DESC_LEN as u16)?;
        let desc = parse_device(&raw).map_err(|e| TransportError::TransferFailed(e.to_string()))?;

        let mut configs = Vec::with_capacity(desc.num_configurations as usize);
        for index in 0..desc.num_configurations {
            let header =
                Self::get_descriptor(device, DESC_TYPE_CONFIGURATION, index, CONFIG_DESC_LEN as u16)?;
            let total = parse_configuration(&header)
                .map_err(|e| TransportError::TransferFailed(e.to_string()))?
                .total_length;
            let full = Self::get_descriptor(device, DESC_TYPE_CONFIGURATION, index, total)?;
            configs.push(
                parse_configuration(&full)
                    .map_err(|e| TransportError::TransferFailed(e.to_string()))?,
            );
        }
        Ok(configs)
    }
}

impl fmt::Debug for NusbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NusbDevice")
            .field("vid", &format_args!("{:04X}", self.info.vendor_id()))
            .field("pid", &format_args!("{:04X}", self.info.product_id()))
            .field("serial", &self.info.serial_number())
            .finish()
    }
}

impl UsbDevice for NusbDevice {
    type Key = DeviceId;

    fn key(&self) -> DeviceId {
        self.info.id()
    }

    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    fn product_name(&self) -> Option<String> {
        self.info.product_string().map(str::to_string)
    }

    fn serial_number(&self) -> Option<String> {
        self.info.serial_number().map(str::to_string)
    }

    #[instrument(level = "debug", skip(self))]
    fn configurations(&self) -> Result<Vec<ConfigurationDescriptor>, TransportError> {
        if let Some(cached) = lock(&self.configurations).as_ref() {
            return Ok(cached.clone());
        }
        let configs = {
            let handle = lock(&self.handle);
            match handle.as_ref() {
                Some(open) => Self::read_configurations(&open.device)?,
                None => {
                    let device = self
                        .info
                        .open()
                        .wait()
                        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
                    Self::read_configurations(&device)?
                }
            }
        };
        *lock(&self.configurations) = Some(configs.clone());
        Ok(configs)
    }

    fn is_open(&self) -> bool {
        lock(&self.handle).is_some()
    }

    #[instrument(level = "info", skip(self), fields(vid = %format!("{:04X}", self.info.vendor_id()), pid = %format!("{:04X}", self.info.product_id())))]
    fn open(&self) -> Result<(), TransportError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }
        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let active_config = device
            .active_configuration()
            .ok()
            .map(|c| c.configuration_value());
        info!(?active_config, "Device opened");
        *handle = Some(OpenDevice {
            device,
            interfaces: HashMap::new(),
            alternates: HashMap::new(),
            active_config,
        });
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        // Dropping the interfaces releases them; dropping the device closes it.
        if lock(&self.handle).take().is_some() {
            debug!("Device closed");
        }
        Ok(())
    }

    fn active_configuration(&self) -> Option<u8> {
        lock(&self.handle).as_ref().and_then(|o| o.active_config)
    }

    fn select_configuration(&self, value: u8) -> Result<(), TransportError> {
        self.with_open(|open| {
            open.device
                .set_configuration(value)
                .wait()
                .map_err(|e| TransportError::ConfigurationFailed {
                    value,
                    message: e.to_string(),
                })?;
            open.active_config = Some(value);
            Ok(())
        })
    }

    fn is_claimed(&self, interface: u8) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|o| o.interfaces.contains_key(&interface))
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        self.with_open(|open| {
            let claimed = open.device.claim_interface(interface).wait().map_err(|e| {
                TransportError::ClaimInterfaceFailed {
                    interface,
                    message: e.to_string(),
                }
            })?;
            open.interfaces.insert(interface, claimed);
            Ok(())
        })
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        self.with_open(|open| {
            open.interfaces.remove(&interface);
            open.alternates.remove(&interface);
            Ok(())
        })
    }

    fn current_alternate(&self, interface: u8) -> Option<u8> {
        lock(&self.handle)
            .as_ref()
            .and_then(|o| o.alternates.get(&interface).copied())
    }

    fn select_alternate(&self, interface: u8, alternate: u8) -> Result<(), TransportError> {
        self.with_open(|open| {
            let intf = open.interfaces.get(&interface).ok_or_else(|| {
                TransportError::AlternateFailed {
                    interface,
                    alternate,
                    message: "interface not claimed".into(),
                }
            })?;
            intf.set_alt_setting(alternate)
                .wait()
                .map_err(|e| TransportError::AlternateFailed {
                    interface,
                    alternate,
                    message: e.to_string(),
                })?;
            open.alternates.insert(interface, alternate);
            Ok(())
        })
    }

    #[instrument(level = "trace", skip(self))]
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        let request = ControlIn {
            control_type: control_type(setup.request_type),
            recipient: recipient(setup.recipient),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
        };
        self.with_open(|open| {
            let claimed = match setup.recipient {
                Recipient::Interface => open.interfaces.get(&(setup.index as u8)),
                _ => None,
            };
            let data = match claimed {
                Some(intf) => intf.control_in(request, CONTROL_TIMEOUT).wait(),
                None => open.device.control_in(request, CONTROL_TIMEOUT).wait(),
            }
            .map_err(map_transfer)?;
            Ok(data)
        })
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransportError> {
        let request = ControlOut {
            control_type: control_type(setup.request_type),
            recipient: recipient(setup.recipient),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            data,
        };
        self.with_open(|open| {
            let claimed = match setup.recipient {
                Recipient::Interface => open.interfaces.get(&(setup.index as u8)),
                _ => None,
            };
            match claimed {
                Some(intf) => intf.control_out(request, CONTROL_TIMEOUT).wait(),
                None => open.device.control_out(request, CONTROL_TIMEOUT).wait(),
            }
            .map_err(map_transfer)?;
            Ok(data.len())
        })
    }

    #[instrument(level = "info", skip(self))]
    fn reset(&self) -> Result<(), TransportError> {
        let open = lock(&self.handle)
            .take()
            .ok_or(TransportError::NotOpen)?;
        open.device
            .reset()
            .wait()
            .map_err(|e| TransportError::ResetFailed(e.to_string()))
    }
}

/// Device shown to the user in the chooser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceSummary {
    fn from_info(info: &DeviceInfo) -> Self {
        Self {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            product: info.product_string().map(str::to_string),
            serial: info.serial_number().map(str::to_string),
        }
    }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} {}",
            self.vendor_id,
            self.product_id,
            self.product.as_deref().unwrap_or("Unknown device")
        )?;
        if let Some(serial) = &self.serial {
            write!(f, " (serial {serial})")?;
        }
        Ok(())
    }
}

/// Interactive selection of one device among candidates.
pub trait DeviceChooser: Send + Sync {
    /// Index of the chosen candidate, `None` when the user declined.
    fn choose(&self, candidates: &[DeviceSummary]) -> Result<Option<usize>, String>;
}

/// Desktop provider: grants persisted in a TOML file, chooser for new devices.
pub struct NusbProvider {
    grants: Mutex<GrantList>,
    grants_path: Option<PathBuf>,
    chooser: Box<dyn DeviceChooser>,
    hub: Arc<DisconnectHub<DeviceId>>,
}

impl NusbProvider {
    pub fn new(
        chooser: Box<dyn DeviceChooser>,
        grants_path: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let grants = match &grants_path {
            Some(path) => GrantList::load(path)?,
            None => GrantList::default(),
        };
        let hub = Arc::new(DisconnectHub::new());
        spawn_presence_watcher(Arc::downgrade(&hub));
        Ok(Self {
            grants: Mutex::new(grants),
            grants_path,
            chooser,
            hub,
        })
    }

    /// All attached DFU-capable devices, optionally filtered by vendor.
    pub fn list_dfu_devices(vendor_id: Option<u16>) -> Result<Vec<NusbDevice>, TransportError> {
        Ok(list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| vendor_id.is_none_or(|vid| d.vendor_id() == vid))
            .filter(is_dfu_device)
            .map(NusbDevice::new)
            .collect())
    }

    /// Drop every stored grant.
    pub fn forget_grants(&self) -> Result<(), StoreError> {
        let mut grants = lock(&self.grants);
        grants.revoke_all();
        match &self.grants_path {
            Some(path) => grants.save(path),
            None => Ok(()),
        }
    }

    fn record_grant(&self, vendor_id: u16, serial: Option<String>) {
        let mut grants = lock(&self.grants);
        if !grants.grant(vendor_id, serial) {
            return;
        }
        if let Some(path) = &self.grants_path {
            if let Err(e) = grants.save(path) {
                warn!(error = %e, "Failed to persist device grant");
            }
        }
    }
}

impl DeviceProvider for NusbProvider {
    type Device = NusbDevice;

    fn authorized_devices(&self) -> Result<Vec<NusbDevice>, TransportError> {
        let grants = lock(&self.grants).clone();
        Ok(list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| grants.allows(d.vendor_id(), d.serial_number()))
            .map(NusbDevice::new)
            .collect())
    }

    #[instrument(level = "info", skip(self), fields(vid = %format!("{:04X}", filter.vendor_id)))]
    fn request_device(&self, filter: &DeviceFilter) -> Result<NusbDevice, RequestError> {
        let candidates: Vec<DeviceInfo> = list_devices()
            .wait()
            .map_err(|e| RequestError::Other(e.to_string()))?
            .filter(|d| d.vendor_id() == filter.vendor_id)
            .filter(is_dfu_device)
            .collect();
        if candidates.is_empty() {
            return Err(RequestError::NoMatchingDevice);
        }

        let summaries: Vec<DeviceSummary> =
            candidates.iter().map(DeviceSummary::from_info).collect();
        let index = self
            .chooser
            .choose(&summaries)
            .map_err(RequestError::Other)?
            .ok_or(RequestError::Cancelled)?;
        let info = candidates
            .into_iter()
            .nth(index)
            .ok_or(RequestError::Cancelled)?;

        // Probe access now so permission problems surface as such.
        if let Err(e) = info.open().wait() {
            let message = e.to_string();
            let lower = message.to_lowercase();
            if lower.contains("permission") || lower.contains("access") {
                return Err(RequestError::Blocked(message));
            }
            return Err(RequestError::Other(message));
        }

        self.record_grant(info.vendor_id(), info.serial_number().map(str::to_string));
        self.hub.reconnected(&info.id());
        Ok(NusbDevice::new(info))
    }

    fn disconnects(&self) -> Arc<DisconnectHub<DeviceId>> {
        Arc::clone(&self.hub)
    }
}

fn present_ids() -> Option<HashSet<DeviceId>> {
    match list_devices().wait() {
        Ok(list) => Some(list.map(|d| d.id()).collect()),
        Err(e) => {
            debug!(error = %e, "Device enumeration failed");
            None
        }
    }
}

/// Poll the bus and publish removals until the hub is dropped.
fn spawn_presence_watcher(hub: Weak<DisconnectHub<DeviceId>>) {
    let spawned = thread::Builder::new()
        .name("usb-presence".into())
        .spawn(move || {
            let mut present = present_ids().unwrap_or_default();
            loop {
                thread::sleep(PRESENCE_POLL_INTERVAL);
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let Some(now) = present_ids() else {
                    continue;
                };
                for gone in present.difference(&now) {
                    hub.notify(gone);
                }
                for back in now.difference(&present) {
                    hub.reconnected(back);
                }
                present = now;
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start device presence watcher");
    }
}
