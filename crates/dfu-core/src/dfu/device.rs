//! DFU device state machine.
//!
//! `DfuDevice` owns one device handle bound to one DFU interface and runs
//! the DFU 1.1 request sequences against it: detach, block transfers,
//! status polling and the full download/upload workflows.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::dfuse::DfuVariant;
use super::properties::FunctionalProperties;
use crate::descriptor::InterfaceSettings;
use crate::error::DfuError;
use crate::events::{FlashEvent, FlashObserver, LogLevel};
use crate::protocol::constants::*;
use crate::protocol::{DfuState, DfuStatus};
use crate::transport::{DfuTransport, DisconnectHub, TransportError, UsbDevice};

/// Language used when the device does not list any.
const FALLBACK_LANGUAGE_ID: u16 = 0x0409;

pub struct DfuDevice<D: UsbDevice> {
    transport: DfuTransport<D>,
    settings: InterfaceSettings,
    properties: FunctionalProperties,
    variant: DfuVariant,
    hub: Arc<DisconnectHub<D::Key>>,
    disconnected: AtomicBool,
    observer: Arc<dyn FlashObserver>,
    poll_deadline: Duration,
}

impl<D: UsbDevice> DfuDevice<D> {
    pub fn new(
        device: D,
        settings: InterfaceSettings,
        hub: Arc<DisconnectHub<D::Key>>,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        let transport = DfuTransport::new(device, settings.interface_number(), Arc::clone(&observer));
        Self {
            transport,
            settings,
            properties: FunctionalProperties::default(),
            variant: DfuVariant::Standard,
            hub,
            disconnected: AtomicBool::new(false),
            observer,
            poll_deadline: POLL_DEADLINE,
        }
    }

    pub fn with_poll_deadline(mut self, deadline: Duration) -> Self {
        self.poll_deadline = deadline;
        self
    }

    pub fn device(&self) -> &D {
        self.transport.device()
    }

    pub fn transport(&self) -> &DfuTransport<D> {
        &self.transport
    }

    pub fn settings(&self) -> &InterfaceSettings {
        &self.settings
    }

    pub fn properties(&self) -> &FunctionalProperties {
        &self.properties
    }

    pub fn variant(&self) -> &DfuVariant {
        &self.variant
    }

    pub fn key(&self) -> D::Key {
        self.device().key()
    }

    pub fn serial_number(&self) -> Option<String> {
        self.device().serial_number()
    }

    pub fn product_name(&self) -> Option<String> {
        self.device().product_name()
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn progress(&self, done: usize, total: Option<usize>) {
        self.observer.on_event(&FlashEvent::Progress {
            done: done as u64,
            total: total.map(|t| t as u64),
        });
    }

    /// Open the handle and bind the interface. Steps already done are skipped.
    #[instrument(level = "debug", skip(self), fields(intf = %self.settings))]
    pub fn open(&self) -> Result<(), DfuError> {
        let dev = self.device();
        if !dev.is_open() {
            dev.open()?;
        }

        let config = self.settings.configuration_value;
        if dev.active_configuration() != Some(config) {
            debug!(config, "Selecting configuration");
            dev.select_configuration(config)?;
        }

        let intf = self.settings.interface_number();
        if !dev.is_claimed(intf) {
            debug!(intf, "Claiming interface");
            dev.claim_interface(intf)?;
        }

        let alt = self.settings.alternate_setting();
        if dev.current_alternate(intf) != Some(alt) {
            debug!(intf, alt, "Selecting alternate setting");
            dev.select_alternate(intf, alt)?;
        }
        Ok(())
    }

    /// Release the interface and close the handle. Never fails.
    pub fn close(&self) {
        let dev = self.device();
        let intf = self.settings.interface_number();
        if dev.is_claimed(intf) {
            if let Err(e) = dev.release_interface(intf) {
                debug!(error = %e, "Release failed during close");
            }
        }
        if let Err(e) = dev.close() {
            debug!(error = %e, "Close failed");
        }
    }

    /// Resolve the interface name from its string descriptor. Best effort.
    pub fn resolve_interface_name(&mut self) {
        let index = self.settings.interface.interface_index;
        if self.settings.name.is_some() || index == 0 {
            return;
        }
        let lang_id = self
            .transport
            .read_language_ids()
            .ok()
            .and_then(|ids| ids.first().copied())
            .unwrap_or(FALLBACK_LANGUAGE_ID);
        match self.transport.read_string_descriptor(index, lang_id) {
            Ok(name) => {
                debug!(name = %name, "Resolved interface name");
                self.settings.name = Some(name);
            }
            Err(e) => debug!(error = %e, index, "Could not read interface name"),
        }
    }

    /// Read the functional descriptor of the bound configuration, falling
    /// back to defaults, and decide the protocol variant.
    pub fn load_properties(&mut self) -> &FunctionalProperties {
        self.properties = match self.transport.read_configuration_descriptor(0) {
            Ok(config) => match FunctionalProperties::from_configuration(&config, &self.settings) {
                Some(props) => props,
                None => {
                    warn!("DFU functional descriptor not found, using defaults");
                    FunctionalProperties::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to read configuration descriptor, using defaults");
                FunctionalProperties::default()
            }
        };
        self.variant = DfuVariant::detect(&self.properties, self.settings.name.as_deref());
        debug!(properties = ?self.properties, variant = ?self.variant, "DFU properties");
        &self.properties
    }

    pub fn set_properties(&mut self, properties: FunctionalProperties) {
        self.variant = DfuVariant::detect(&properties, self.settings.name.as_deref());
        self.properties = properties;
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Ask a Run-Time device to re-enumerate in DFU mode.
    pub fn detach(&self) -> Result<(), DfuError> {
        self.transport
            .control_out(DFU_DETACH, &[], DETACH_TIMEOUT_MS)?;
        Ok(())
    }

    pub fn download(&self, data: &[u8], block: u16) -> Result<usize, DfuError> {
        Ok(self.transport.control_out(DFU_DNLOAD, data, block)?)
    }

    pub fn upload(&self, length: u16, block: u16) -> Result<Vec<u8>, DfuError> {
        Ok(self.transport.control_in(DFU_UPLOAD, length, block)?)
    }

    pub fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self.transport.control_in(DFU_GETSTATUS, DFU_STATUS_LEN, 0)?;
        DfuStatus::from_bytes(&data).ok_or(DfuError::StatusLength(data.len()))
    }

    pub fn get_state(&self) -> Result<DfuState, DfuError> {
        let data = self.transport.control_in(DFU_GETSTATE, 1, 0)?;
        match data.first() {
            Some(&code) => Ok(DfuState::from_u8(code)),
            None => Err(TransportError::TransferFailed("empty GETSTATE response".into()).into()),
        }
    }

    pub fn clear_status(&self) -> Result<(), DfuError> {
        self.transport.control_out(DFU_CLRSTATUS, &[], 0)?;
        Ok(())
    }

    pub fn abort(&self) -> Result<(), DfuError> {
        self.transport.control_out(DFU_ABORT, &[], 0)?;
        Ok(())
    }

    /// ABORT, clearing an error state once, and require dfuIDLE afterwards.
    pub fn abort_to_idle(&self) -> Result<(), DfuError> {
        self.abort()?;
        let mut state = self.get_state()?;
        if state == DfuState::DfuError {
            self.clear_status()?;
            state = self.get_state()?;
        }
        if state != DfuState::DfuIdle {
            return Err(DfuError::AbortFailed { state });
        }
        Ok(())
    }

    /// Poll GETSTATUS until `predicate` accepts the state.
    ///
    /// dfuERROR ends the loop; one CLRSTATUS and one re-poll are attempted
    /// before giving up with `ErrorStatus`.
    pub fn poll_until(&self, predicate: impl Fn(DfuState) -> bool) -> Result<DfuStatus, DfuError> {
        let start = Instant::now();
        let mut status = self.get_status()?;

        while !predicate(status.state) && status.state != DfuState::DfuError {
            if start.elapsed() >= self.poll_deadline {
                return Err(DfuError::PollTimeout {
                    timeout_ms: self.poll_deadline.as_millis() as u64,
                });
            }
            thread::sleep(Duration::from_millis(status.poll_interval_ms() as u64));
            status = self.get_status()?;
        }

        if status.state == DfuState::DfuError && !predicate(status.state) {
            warn!(status = %status, "Device entered dfuERROR, clearing status");
            self.clear_status()?;
            status = self.get_status()?;
            if status.state == DfuState::DfuError || !predicate(status.state) {
                return Err(DfuError::ErrorStatus {
                    status: status.status,
                });
            }
        }
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    /// Write `firmware` in `transfer_size` blocks, then manifest and reset.
    #[instrument(level = "info", skip(self, firmware), fields(size = firmware.len()))]
    pub fn do_download(
        &self,
        transfer_size: u16,
        firmware: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<(), DfuError> {
        let transfer_size = if transfer_size == 0 {
            DEFAULT_TRANSFER_SIZE
        } else {
            transfer_size
        } as usize;

        let mut status = self.get_status()?;
        if status.state == DfuState::DfuError {
            self.log(LogLevel::Warning, "Device in dfuERROR, clearing status");
            self.clear_status()?;
            status = self.get_status()?;
            if status.state == DfuState::DfuError {
                return Err(DfuError::ErrorStatus {
                    status: status.status,
                });
            }
        }
        if !matches!(status.state, DfuState::DfuIdle | DfuState::DnloadIdle) {
            self.log(
                LogLevel::Warning,
                format!("Device not idle ({}), aborting to idle", status.state),
            );
            self.abort_to_idle()?;
        }

        let total = firmware.len();
        let mut sent = 0usize;
        let mut block: u16 = 0;
        self.log(LogLevel::Info, "Copying data from host to DFU device");
        self.progress(0, Some(total));

        for chunk in firmware.chunks(transfer_size) {
            debug!(block, len = chunk.len(), "DNLOAD");
            self.download(chunk, block)?;
            let status = self.poll_until(|s| s == DfuState::DnloadIdle)?;
            if !status.is_ok() {
                return Err(DfuError::DownloadFailed {
                    state: status.state,
                    status: status.status,
                });
            }
            block = block.wrapping_add(1);
            sent += chunk.len();
            self.progress(sent, Some(total));
        }

        debug!(block, "Sending end-of-data block");
        self.download(&[], block)?;

        let manifest = if manifestation_tolerant {
            self.poll_until(|s| {
                matches!(
                    s,
                    DfuState::DfuIdle | DfuState::ManifestWaitReset | DfuState::ManifestSync
                )
            })
        } else {
            self.poll_until(|s| matches!(s, DfuState::ManifestSync | DfuState::ManifestWaitReset))
        };
        match manifest {
            Ok(status) if !status.is_ok() => {
                return Err(DfuError::ManifestFailed {
                    state: status.state,
                    status: status.status,
                });
            }
            Ok(status) => debug!(state = %status.state, "Manifestation reached"),
            Err(e) if !manifestation_tolerant && e.is_device_gone() => {
                self.log(
                    LogLevel::Warning,
                    "Unable to poll final manifestation status",
                );
            }
            Err(e) => return Err(e),
        }

        self.log(LogLevel::Success, format!("Wrote {sent} bytes"));
        self.log(LogLevel::Info, "Manifesting new firmware");

        match self.device().reset() {
            Ok(()) => info!("Device reset"),
            Err(e) if e.is_device_gone() => {
                debug!(error = %e, "Device already gone during reset");
            }
            Err(e) => {
                self.log(LogLevel::Warning, format!("Unexpected error during reset: {e}"));
            }
        }
        Ok(())
    }

    /// Read blocks starting at `first_block` until a short read or `max_size`.
    #[instrument(level = "info", skip(self))]
    pub fn do_upload(
        &self,
        transfer_size: u16,
        max_size: Option<usize>,
        first_block: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let transfer_size = if transfer_size == 0 {
            DEFAULT_TRANSFER_SIZE
        } else {
            transfer_size
        } as usize;
        let mut block = first_block;
        let mut data = Vec::new();

        self.log(LogLevel::Info, "Copying data from DFU device to host");
        loop {
            let wanted = max_size.map_or(transfer_size, |m| (m - data.len()).min(transfer_size));
            let chunk = self.upload(wanted as u16, block)?;
            block = block.wrapping_add(1);
            let short = chunk.len() < wanted;
            data.extend_from_slice(&chunk);
            self.progress(data.len(), max_size);

            if short || max_size.is_some_and(|m| data.len() >= m) {
                break;
            }
        }

        if max_size == Some(data.len()) {
            self.abort_to_idle()?;
        }
        self.log(LogLevel::Info, format!("Read {} bytes", data.len()));
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Disconnects
    // ------------------------------------------------------------------

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Set the disconnected flag. Returns true only for the first call.
    pub fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::SeqCst)
    }

    /// Block until this device leaves the bus. A zero timeout waits forever.
    pub fn wait_disconnected(&self, timeout: Duration) -> Result<(), DfuError> {
        if self.is_disconnected() {
            return Ok(());
        }
        let subscription = self.hub.subscribe(self.key());
        let limit = (!timeout.is_zero()).then_some(timeout);
        match subscription.wait(limit) {
            Some(_) => {
                self.mark_disconnected();
                Ok(())
            }
            None => Err(DfuError::DisconnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::find_dfu_interfaces;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::transport::{DeviceProvider, MockDevice, MockDeviceBuilder, MockProvider};

    fn dfu_device(mock: &MockDevice) -> DfuDevice<MockDevice> {
        let settings = find_dfu_interfaces(&mock.configurations().unwrap()).remove(0);
        let hub = Arc::new(DisconnectHub::new());
        let device = DfuDevice::new(mock.clone(), settings, hub, Arc::new(NullObserver));
        device.open().unwrap();
        device
    }

    #[test]
    fn test_open_is_idempotent() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        device.open().unwrap();
        assert!(mock.is_open());
        assert!(mock.is_claimed(0));
        assert_eq!(mock.active_configuration(), Some(1));
        assert_eq!(mock.current_alternate(0), Some(0));

        device.close();
        assert!(!mock.is_open());
        // A vanished device must not make close fail.
        mock.unplug();
        device.close();
    }

    #[test]
    fn test_get_status_rejects_short_reply() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_raw_status(vec![0, 0, 0, 0, 2]);
        assert!(matches!(device.get_status(), Err(DfuError::StatusLength(5))));
    }

    #[test]
    fn test_poll_until_returns_target() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_status(STATUS_OK, DfuState::DnBusy);
        mock.push_status(STATUS_OK, DfuState::DnBusy);
        mock.push_status(STATUS_OK, DfuState::DnloadIdle);

        let status = device.poll_until(|s| s == DfuState::DnloadIdle).unwrap();
        assert_eq!(status.state, DfuState::DnloadIdle);
        assert_eq!(mock.class_requests(DFU_GETSTATUS).len(), 3);
    }

    #[test]
    fn test_poll_until_recovers_from_error_once() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_status(STATUS_ERR_UNKNOWN, DfuState::DfuError);
        mock.push_status(STATUS_OK, DfuState::DnloadIdle);

        let status = device.poll_until(|s| s == DfuState::DnloadIdle).unwrap();
        assert_eq!(status.state, DfuState::DnloadIdle);
        assert_eq!(mock.class_requests(DFU_CLRSTATUS).len(), 1);
        assert_eq!(mock.class_requests(DFU_GETSTATUS).len(), 2);
    }

    #[test]
    fn test_poll_until_fails_when_error_persists() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_status(STATUS_ERR_WRITE, DfuState::DfuError);
        mock.push_status(STATUS_ERR_WRITE, DfuState::DfuError);
        mock.push_status(STATUS_OK, DfuState::DnloadIdle);

        let err = device.poll_until(|s| s == DfuState::DnloadIdle).unwrap_err();
        assert!(matches!(err, DfuError::ErrorStatus { status: STATUS_ERR_WRITE }));
        assert_eq!(mock.class_requests(DFU_CLRSTATUS).len(), 1);
        assert_eq!(mock.class_requests(DFU_GETSTATUS).len(), 2);
    }

    #[test]
    fn test_poll_until_deadline() {
        let mock = MockDeviceBuilder::new().state(DfuState::DnBusy).build();
        let device = dfu_device(&mock).with_poll_deadline(Duration::from_millis(30));
        let err = device.poll_until(|s| s == DfuState::DnloadIdle).unwrap_err();
        assert!(matches!(err, DfuError::PollTimeout { timeout_ms: 30 }));
    }

    #[test]
    fn test_abort_to_idle() {
        let mock = MockDeviceBuilder::new().state(DfuState::UploadIdle).build();
        let device = dfu_device(&mock);
        device.abort_to_idle().unwrap();
        assert_eq!(mock.dfu_state(), DfuState::DfuIdle);

        mock.set_state(DfuState::DfuError, STATUS_ERR_FILE);
        device.abort_to_idle().unwrap();
        assert_eq!(mock.class_requests(DFU_CLRSTATUS).len(), 1);

        mock.stall(DFU_CLRSTATUS);
        mock.set_state(DfuState::DfuError, STATUS_ERR_FILE);
        assert!(device.abort_to_idle().is_err());
    }

    #[test]
    fn test_download_chunks_and_sentinel() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        let firmware: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();

        device.do_download(1024, &firmware, true).unwrap();

        assert_eq!(
            mock.download_blocks(),
            vec![(0, 1024), (1, 1024), (2, 952), (3, 0)]
        );
        assert_eq!(mock.downloaded(), firmware);
        assert_eq!(mock.reset_count(), 1);
    }

    #[test]
    fn test_download_aborts_busy_device_first() {
        let mock = MockDeviceBuilder::new().state(DfuState::UploadIdle).build();
        let device = dfu_device(&mock);
        device.do_download(64, &[0xAA; 10], true).unwrap();
        let log = mock.control_log();
        let first_abort = log.iter().position(|c| c.setup.request == DFU_ABORT).unwrap();
        let first_dnload = log
            .iter()
            .position(|c| c.setup.request == DFU_DNLOAD)
            .unwrap();
        assert!(first_abort < first_dnload);
    }

    #[test]
    fn test_download_block_failure() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_status(STATUS_OK, DfuState::DfuIdle);
        mock.push_status(STATUS_ERR_PROG, DfuState::DnloadIdle);

        let err = device.do_download(16, &[1; 40], true).unwrap_err();
        assert!(matches!(
            err,
            DfuError::DownloadFailed {
                state: DfuState::DnloadIdle,
                status: STATUS_ERR_PROG
            }
        ));
        assert_eq!(mock.download_blocks().len(), 1);
    }

    #[test]
    fn test_download_manifest_failure() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_status(STATUS_OK, DfuState::DfuIdle);
        mock.push_status(STATUS_OK, DfuState::DnloadIdle);
        mock.push_status(STATUS_ERR_VERIFY, DfuState::ManifestWaitReset);

        let err = device.do_download(16, &[1; 8], true).unwrap_err();
        assert!(matches!(err, DfuError::ManifestFailed { .. }));
        assert_eq!(mock.reset_count(), 0);
    }

    #[test]
    fn test_download_non_tolerant_device_vanishing() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.push_status(STATUS_OK, DfuState::DfuIdle);
        mock.push_status(STATUS_OK, DfuState::DnloadIdle);
        mock.push_status_error(TransportError::TransferFailed(
            "NotFoundError: Device unavailable.".into(),
        ));

        device.do_download(16, &[1; 8], false).unwrap();
        assert_eq!(mock.reset_count(), 1);
    }

    #[test]
    fn test_download_reset_errors_are_not_fatal() {
        let mock = MockDeviceBuilder::new().build();
        let observer = Arc::new(RecordingObserver::new());
        let settings = find_dfu_interfaces(&mock.configurations().unwrap()).remove(0);
        let device = DfuDevice::new(
            mock.clone(),
            settings,
            Arc::new(DisconnectHub::new()),
            observer.clone(),
        );
        device.open().unwrap();

        mock.set_reset_error(Some(TransportError::ResetFailed("Unable to reset the device.".into())));
        device.do_download(16, &[1; 8], true).unwrap();
        assert!(observer.messages(LogLevel::Warning).is_empty());

        mock.set_reset_error(Some(TransportError::ResetFailed("Access denied".into())));
        device.do_download(16, &[1; 8], true).unwrap();
        assert_eq!(observer.messages(LogLevel::Warning).len(), 1);
    }

    #[test]
    fn test_upload_stops_on_short_read() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        let image: Vec<u8> = (0..100u8).collect();
        mock.set_upload_data(&image);

        let data = device.do_upload(32, None, 0).unwrap();
        assert_eq!(data, image);
        let blocks: Vec<u16> = mock
            .class_requests(DFU_UPLOAD)
            .iter()
            .map(|c| c.setup.value)
            .collect();
        assert_eq!(blocks, vec![0, 1, 2, 3]);
        assert!(mock.class_requests(DFU_ABORT).is_empty());
    }

    #[test]
    fn test_upload_max_size_aborts() {
        let mock = MockDeviceBuilder::new().build();
        let device = dfu_device(&mock);
        mock.set_upload_data(&[7; 100]);

        let data = device.do_upload(32, Some(64), 2).unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(mock.class_requests(DFU_UPLOAD)[0].setup.value, 2);
        assert_eq!(mock.class_requests(DFU_ABORT).len(), 1);
    }

    #[test]
    fn test_wait_disconnected() {
        let provider = MockProvider::new();
        let mock = provider.builder().build();
        let settings = find_dfu_interfaces(&mock.configurations().unwrap()).remove(0);
        let device = DfuDevice::new(
            mock.clone(),
            settings,
            provider.disconnects(),
            Arc::new(NullObserver),
        );

        let err = device.wait_disconnected(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DfuError::DisconnectTimeout { timeout_ms: 10 }));

        let unplugger = mock.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            unplugger.unplug();
        });
        device.wait_disconnected(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert!(device.is_disconnected());
        assert!(!device.mark_disconnected());
        device.wait_disconnected(Duration::from_millis(1)).unwrap();
    }
}
