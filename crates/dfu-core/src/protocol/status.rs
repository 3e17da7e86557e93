//! DFU state and status decoding.
//!
//! DFU_GETSTATUS returns a fixed 6-byte record; this module provides
//! type-safe access to it.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;

/// Device state (`bState`) as defined by DFU 1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    DfuError,
    /// State code outside the specification.
    Unknown(u8),
}

impl DfuState {
    pub const fn from_u8(code: u8) -> Self {
        match code {
            STATE_APP_IDLE => Self::AppIdle,
            STATE_APP_DETACH => Self::AppDetach,
            STATE_DFU_IDLE => Self::DfuIdle,
            STATE_DFU_DNLOAD_SYNC => Self::DnloadSync,
            STATE_DFU_DNBUSY => Self::DnBusy,
            STATE_DFU_DNLOAD_IDLE => Self::DnloadIdle,
            STATE_DFU_MANIFEST_SYNC => Self::ManifestSync,
            STATE_DFU_MANIFEST => Self::Manifest,
            STATE_DFU_MANIFEST_WAIT_RESET => Self::ManifestWaitReset,
            STATE_DFU_UPLOAD_IDLE => Self::UploadIdle,
            STATE_DFU_ERROR => Self::DfuError,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::AppIdle => STATE_APP_IDLE,
            Self::AppDetach => STATE_APP_DETACH,
            Self::DfuIdle => STATE_DFU_IDLE,
            Self::DnloadSync => STATE_DFU_DNLOAD_SYNC,
            Self::DnBusy => STATE_DFU_DNBUSY,
            Self::DnloadIdle => STATE_DFU_DNLOAD_IDLE,
            Self::ManifestSync => STATE_DFU_MANIFEST_SYNC,
            Self::Manifest => STATE_DFU_MANIFEST,
            Self::ManifestWaitReset => STATE_DFU_MANIFEST_WAIT_RESET,
            Self::UploadIdle => STATE_DFU_UPLOAD_IDLE,
            Self::DfuError => STATE_DFU_ERROR,
            Self::Unknown(code) => code,
        }
    }

    /// Whether the device is running its application (Run-Time mode).
    pub fn is_runtime(self) -> bool {
        matches!(self, Self::AppIdle | Self::AppDetach)
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::DfuError => write!(f, "dfuERROR"),
            DfuState::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// Human-readable description of a `bStatus` code.
pub fn describe_status(status: u8) -> &'static str {
    match status {
        STATUS_OK => "No error condition is present",
        STATUS_ERR_TARGET => "File is not targeted for use by this device",
        STATUS_ERR_FILE => "File fails vendor-specific verification",
        STATUS_ERR_WRITE => "Device is unable to write memory",
        STATUS_ERR_ERASE => "Memory erase function failed",
        STATUS_ERR_CHECK_ERASED => "Memory erase check failed",
        STATUS_ERR_PROG => "Program memory function failed",
        STATUS_ERR_VERIFY => "Programmed memory failed verification",
        STATUS_ERR_ADDRESS => "Received address is out of range",
        STATUS_ERR_NOTDONE => "Received zero-length DNLOAD before all data",
        STATUS_ERR_FIRMWARE => "Device firmware is corrupt",
        STATUS_ERR_VENDOR => "Vendor-specific error",
        STATUS_ERR_USBR => "Unexpected USB reset signaling",
        STATUS_ERR_POR => "Unexpected power on reset",
        STATUS_ERR_UNKNOWN => "Unknown failure",
        STATUS_ERR_STALLEDPKT => "Device stalled an unexpected request",
        _ => "Unrecognized status code",
    }
}

/// Parsed DFU_GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    /// `bStatus`.
    pub status: u8,
    /// `bwPollTimeout` in milliseconds (24-bit).
    pub poll_timeout: u32,
    /// `bState`.
    pub state: DfuState,
    /// `iString`.
    pub string_index: u8,
}

impl DfuStatus {
    /// Decode a GETSTATUS payload. Returns `None` unless exactly 6 bytes.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != DFU_STATUS_LEN as usize {
            return None;
        }
        Some(Self {
            status: data[0],
            poll_timeout: LittleEndian::read_u24(&data[1..4]),
            state: DfuState::from_u8(data[4]),
            string_index: data[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0] = self.status;
        LittleEndian::write_u24(&mut buf[1..4], self.poll_timeout & 0x00FF_FFFF);
        buf[4] = self.state.as_u8();
        buf[5] = self.string_index;
        buf
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Sleep before the next poll, clamped to `[5, 5000]` ms.
    pub fn poll_interval_ms(&self) -> u32 {
        self.poll_timeout
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} status={} ({}) poll={}ms",
            self.state,
            self.status,
            describe_status(self.status),
            self.poll_timeout
        )
    }
}
