//! Protocol constants from the USB DFU 1.1 class specification.
//!
//! Request codes, state codes and descriptor identifiers are bit-exact with
//! the specification; timing constants are the values the flash workflow
//! relies on.

use std::time::Duration;

// ============================================================================
// Class Identification
// ============================================================================

/// Application-specific interface class.
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
/// DFU interface subclass.
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// Interface protocol while the device runs its application.
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
/// Interface protocol while the device is in DFU mode.
pub const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

/// `bcdDFUVersion` reported by STMicroelectronics DfuSe devices.
pub const DFUSE_VERSION_NUMBER: u16 = 0x011A;
/// `bcdDFUVersion` assumed when the functional descriptor is missing.
pub const DFU_VERSION_1_0: u16 = 0x0100;

// ============================================================================
// Descriptor Types
// ============================================================================

pub const DESC_TYPE_DEVICE: u8 = 0x01;
pub const DESC_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESC_TYPE_STRING: u8 = 0x03;
pub const DESC_TYPE_INTERFACE: u8 = 0x04;
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;
/// DFU functional descriptor.
pub const DESC_TYPE_DFU_FUNCTIONAL: u8 = 0x21;

pub const DEVICE_DESC_LEN: usize = 18;
pub const CONFIG_DESC_LEN: usize = 9;
pub const INTERFACE_DESC_LEN: usize = 9;
pub const DFU_FUNCTIONAL_DESC_LEN: usize = 9;

/// Standard GET_DESCRIPTOR request.
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;

// ============================================================================
// DFU Class Requests (Host -> Device)
// ============================================================================

pub const DFU_DETACH: u8 = 0x00;
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;

/// Length of a DFU_GETSTATUS response.
pub const DFU_STATUS_LEN: u16 = 6;

/// `wValue` sent with DFU_DETACH (milliseconds).
pub const DETACH_TIMEOUT_MS: u16 = 1000;

// ============================================================================
// DFU States (bState)
// ============================================================================

pub const STATE_APP_IDLE: u8 = 0x00;
pub const STATE_APP_DETACH: u8 = 0x01;
pub const STATE_DFU_IDLE: u8 = 0x02;
pub const STATE_DFU_DNLOAD_SYNC: u8 = 0x03;
pub const STATE_DFU_DNBUSY: u8 = 0x04;
pub const STATE_DFU_DNLOAD_IDLE: u8 = 0x05;
pub const STATE_DFU_MANIFEST_SYNC: u8 = 0x06;
pub const STATE_DFU_MANIFEST: u8 = 0x07;
pub const STATE_DFU_MANIFEST_WAIT_RESET: u8 = 0x08;
pub const STATE_DFU_UPLOAD_IDLE: u8 = 0x09;
pub const STATE_DFU_ERROR: u8 = 0x0A;

// ============================================================================
// DFU Status Codes (bStatus)
// ============================================================================

/// No error condition is present.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_TARGET: u8 = 0x01;
pub const STATUS_ERR_FILE: u8 = 0x02;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_CHECK_ERASED: u8 = 0x05;
pub const STATUS_ERR_PROG: u8 = 0x06;
pub const STATUS_ERR_VERIFY: u8 = 0x07;
pub const STATUS_ERR_ADDRESS: u8 = 0x08;
pub const STATUS_ERR_NOTDONE: u8 = 0x09;
pub const STATUS_ERR_FIRMWARE: u8 = 0x0A;
pub const STATUS_ERR_VENDOR: u8 = 0x0B;
pub const STATUS_ERR_USBR: u8 = 0x0C;
pub const STATUS_ERR_POR: u8 = 0x0D;
pub const STATUS_ERR_UNKNOWN: u8 = 0x0E;
pub const STATUS_ERR_STALLEDPKT: u8 = 0x0F;

// ============================================================================
// Timing
// ============================================================================

/// Timeout applied to every control transfer.
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Lower bound of the sleep between two GETSTATUS polls.
pub const MIN_POLL_INTERVAL_MS: u32 = 5;
/// Upper bound of the sleep between two GETSTATUS polls.
pub const MAX_POLL_INTERVAL_MS: u32 = 5000;
/// Overall deadline of a single `poll_until` call.
pub const POLL_DEADLINE: Duration = Duration::from_secs(60);

/// Transfer size used when the functional descriptor is unavailable.
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024;

/// Connection attempts allowed per flash session.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Vendor ID of the stage-1/stage-2 bootloaders flashed by default.
pub const DEFAULT_VENDOR_ID: u16 = 0x2FE3;
/// Product string reported by the stage-1 bootloader.
pub const STAGE1_PRODUCT_NAME: &str = "MCUBOOT";
