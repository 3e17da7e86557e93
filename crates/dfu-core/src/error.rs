//! Error types for the DFU engine, connection and session layers.

use std::path::PathBuf;

use thiserror::Error;

use crate::descriptor::DescriptorError;
use crate::protocol::{DfuState, describe_status};
use crate::transport::TransportError;

fn status_text(status: &u8) -> &'static str {
    describe_status(*status)
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Malformed descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("GETSTATUS returned {0} bytes, expected 6")]
    StatusLength(usize),

    #[error("DFU error status {status}: {}", status_text(.status))]
    ErrorStatus { status: u8 },

    #[error("DFU download failed: state={state}, status={status}")]
    DownloadFailed { state: DfuState, status: u8 },

    #[error("DFU manifestation failed: state={state}, status={status}")]
    ManifestFailed { state: DfuState, status: u8 },

    #[error("Failed to return to idle state after abort: state={state}")]
    AbortFailed { state: DfuState },

    #[error("Timed out after {timeout_ms}ms waiting for the device to disconnect")]
    DisconnectTimeout { timeout_ms: u64 },

    #[error("Device did not reach the expected state within {timeout_ms}ms")]
    PollTimeout { timeout_ms: u64 },
}

impl DfuError {
    /// Transport failure that only says the device has left the bus.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, DfuError::Transport(e) if e.is_device_gone())
    }

    pub fn is_stall(&self) -> bool {
        matches!(self, DfuError::Transport(TransportError::Stall))
    }
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Maximum connection attempts ({max}) exceeded")]
    MaxAttemptsExceeded { max: u32 },

    #[error("No device selected")]
    UserCancelled,

    #[error("No matching device found")]
    NoMatchingDevice,

    #[error("Access to the device was blocked: {0}")]
    SecurityBlocked(String),

    #[error("Device exposes no DFU interface")]
    NotDfuCapable,

    #[error("Connection failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Dfu(#[from] DfuError),
}

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Firmware file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read firmware {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Firmware is empty: {0}")]
    Empty(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid session file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to encode session file: {0}")]
    Encode(#[from] toml::ser::Error),
}
