//! Transport layer module.

pub mod adapter;
pub mod disconnect;
pub mod grants;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use adapter::DfuTransport;
pub use disconnect::{DisconnectHub, Subscription};
pub use grants::{Grant, GrantList};
pub use mock::{ControlRecord, MockDevice, MockDeviceBuilder, MockProvider};
pub use nusb::{DeviceChooser, DeviceSummary, NusbDevice, NusbProvider};
pub use traits::{
    ControlSetup, DeviceFilter, DeviceProvider, Recipient, RequestError, RequestType,
    TransportError, UsbDevice,
};
