//! DFU-Core: USB Device Firmware Upgrade flashing in Rust.
//!
//! This crate implements the DFU 1.1 class protocol and a flash session
//! that carries an update across a two-stage bootloader, where the device
//! re-enumerates (and the flasher restarts) twice before the firmware is
//! written.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Descriptor**: USB device/configuration/DFU functional descriptor codec
//! - **Transport**: USB communication abstraction (nusb, mock) and the
//!   disconnect hub
//! - **DFU**: request primitives, status polling, download/upload workflows
//! - **Connection**: finding or requesting a device and binding it
//! - **State**: flash state machine, persistence and handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dfu_core::{
//!     FlashSession, HandleResult, MemoryStore, MockProvider, SessionConfig, StaticFirmware,
//!     TracingObserver,
//! };
//!
//! let mut session = FlashSession::new(
//!     SessionConfig::default(),
//!     MockProvider::new(),
//!     MemoryStore::new(),
//!     Box::new(StaticFirmware::new("app.bin", vec![0u8; 4096])),
//!     Arc::new(TracingObserver),
//! );
//! let mut result = session.click().expect("stage 1 failed");
//! while result == HandleResult::AwaitReload {
//!     result = session.reload().expect("reload failed");
//! }
//! ```

pub mod connection;
pub mod descriptor;
pub mod dfu;
pub mod error;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use connection::{ConnectOutcome, Connector};
pub use descriptor::{DescriptorError, InterfaceSettings, find_dfu_interfaces};
pub use dfu::{DfuDevice, DfuVariant, FunctionalProperties};
pub use error::{ConnectError, DfuError, FirmwareError, StoreError};
pub use events::{
    FlashEvent, FlashObserver, LogLevel, NullObserver, RecordingObserver, TracingObserver,
};
pub use firmware::{FileFirmware, FirmwareSource, StaticFirmware};
pub use protocol::{DfuState, DfuStatus};
pub use session::{FlashSession, SessionConfig};
pub use state::{FileStore, FlashState, HandleResult, MemoryStore, SessionStore};
pub use transport::{DeviceProvider, MockProvider, NusbProvider, TransportError, UsbDevice};
