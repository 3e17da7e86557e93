//! Device lookup, authorization and binding.
//!
//! `Connector::attempt` first looks at devices the user already granted,
//! then (only when allowed) asks for a new grant. The attempt counter
//! bounds how often a session can go through this before giving up.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::descriptor::find_dfu_interfaces;
use crate::dfu::DfuDevice;
use crate::error::{ConnectError, DfuError};
use crate::events::{FlashEvent, FlashObserver, LogLevel};
use crate::protocol::constants::MAX_CONNECT_ATTEMPTS;
use crate::transport::{DeviceFilter, DeviceProvider, DisconnectHub, RequestError, UsbDevice};

/// Result of one connection attempt.
pub enum ConnectOutcome<D: UsbDevice> {
    Connected(DfuDevice<D>),
    /// No granted device matched and prompting was not allowed.
    NeedsGesture,
    Failed(ConnectError),
}

impl<D: UsbDevice> ConnectOutcome<D> {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected(_))
    }

    /// Collapse into a `Result`, treating `NeedsGesture` as a failure.
    pub fn into_result(self) -> Result<DfuDevice<D>, ConnectError> {
        match self {
            ConnectOutcome::Connected(device) => Ok(device),
            ConnectOutcome::NeedsGesture => Err(ConnectError::Failed(
                "device permission required, user interaction needed".into(),
            )),
            ConnectOutcome::Failed(e) => Err(e),
        }
    }
}

impl From<RequestError> for ConnectError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Cancelled => ConnectError::UserCancelled,
            RequestError::NoMatchingDevice => ConnectError::NoMatchingDevice,
            RequestError::Blocked(message) => ConnectError::SecurityBlocked(message),
            RequestError::Other(message) => ConnectError::Failed(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connector {
    attempts: u32,
    max_attempts: u32,
    open_delay: Duration,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(MAX_CONNECT_ATTEMPTS, Duration::from_millis(200))
    }
}

impl Connector {
    pub fn new(max_attempts: u32, open_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            open_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    fn log(observer: &dyn FlashObserver, level: LogLevel, message: impl Into<String>) {
        observer.on_event(&FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Find or request a device matching `filter` and bind it.
    #[instrument(level = "info", skip(self, provider, observer), fields(attempt = self.attempts + 1))]
    pub fn attempt<P: DeviceProvider>(
        &mut self,
        provider: &P,
        filter: &DeviceFilter,
        allow_prompt: bool,
        observer: &Arc<dyn FlashObserver>,
    ) -> ConnectOutcome<P::Device> {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            warn!(max = self.max_attempts, "Connection attempt ceiling reached");
            return ConnectOutcome::Failed(ConnectError::MaxAttemptsExceeded {
                max: self.max_attempts,
            });
        }

        Self::log(
            observer.as_ref(),
            LogLevel::Info,
            format!(
                "Connection attempt {}: VID=0x{:04x}, Serial={}, PromptAllowed={}",
                self.attempts,
                filter.vendor_id,
                filter.serial_number.as_deref().unwrap_or("any"),
                allow_prompt
            ),
        );

        match self.find_authorized(provider, filter, observer) {
            Ok(Some(device)) => {
                self.reset();
                Self::log(observer.as_ref(), LogLevel::Success, "Connected to permitted device");
                return ConnectOutcome::Connected(device);
            }
            Ok(None) => {
                Self::log(observer.as_ref(), LogLevel::Info, "No matching permitted device found");
            }
            Err(e) => {
                Self::log(
                    observer.as_ref(),
                    LogLevel::Warning,
                    format!("Error checking permitted devices: {e}"),
                );
            }
        }

        if !allow_prompt {
            Self::log(
                observer.as_ref(),
                LogLevel::Warning,
                "Device permission required, but cannot prompt in this state",
            );
            return ConnectOutcome::NeedsGesture;
        }

        Self::log(observer.as_ref(), LogLevel::Info, "Requesting device permission from user...");
        let chosen = match provider.request_device(&DeviceFilter::vendor(filter.vendor_id)) {
            Ok(device) => device,
            Err(e) => {
                info!(error = %e, "Authorization request failed");
                return ConnectOutcome::Failed(e.into());
            }
        };
        Self::log(
            observer.as_ref(),
            LogLevel::Info,
            format!(
                "User selected device: {} (VID: 0x{:04x}, Serial: {})",
                chosen.product_name().as_deref().unwrap_or("Unknown"),
                chosen.vendor_id(),
                chosen.serial_number().as_deref().unwrap_or("N/A")
            ),
        );

        match self.connect(chosen, provider.disconnects(), Arc::clone(observer)) {
            Ok(device) => {
                self.reset();
                Self::log(observer.as_ref(), LogLevel::Success, "Connected to user-selected device");
                ConnectOutcome::Connected(device)
            }
            Err(e) => ConnectOutcome::Failed(ConnectError::Failed(format!(
                "Error connecting selected device: {e}"
            ))),
        }
    }

    fn find_authorized<P: DeviceProvider>(
        &self,
        provider: &P,
        filter: &DeviceFilter,
        observer: &Arc<dyn FlashObserver>,
    ) -> Result<Option<DfuDevice<P::Device>>, ConnectError> {
        let devices = provider.authorized_devices().map_err(DfuError::from)?;
        debug!(count = devices.len(), "Permitted devices");

        let matching = devices.into_iter().find(|d| {
            filter.matches(d)
                && d.configurations()
                    .map(|configs| !find_dfu_interfaces(&configs).is_empty())
                    .unwrap_or(false)
        });
        let Some(device) = matching else {
            return Ok(None);
        };
        Self::log(
            observer.as_ref(),
            LogLevel::Info,
            format!(
                "Found permitted matching device: {} (Serial: {})",
                device.product_name().as_deref().unwrap_or("Unknown"),
                device.serial_number().as_deref().unwrap_or("N/A")
            ),
        );
        self.connect(device, provider.disconnects(), Arc::clone(observer))
            .map(Some)
    }

    /// Bind `device`: pick its first DFU interface, open it and read its
    /// capabilities.
    pub fn connect<D: UsbDevice>(
        &self,
        device: D,
        hub: Arc<DisconnectHub<D::Key>>,
        observer: Arc<dyn FlashObserver>,
    ) -> Result<DfuDevice<D>, ConnectError> {
        let configurations = device.configurations().map_err(DfuError::from)?;
        let settings = find_dfu_interfaces(&configurations)
            .into_iter()
            .next()
            .ok_or(ConnectError::NotDfuCapable)?;

        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }

        let event = FlashEvent::DeviceConnected {
            vid: device.vendor_id(),
            pid: device.product_id(),
            serial: device.serial_number(),
        };
        let mut dfu = DfuDevice::new(device, settings, hub, Arc::clone(&observer));
        if let Err(e) = dfu.open() {
            dfu.close();
            return Err(e.into());
        }
        dfu.resolve_interface_name();
        dfu.load_properties();
        info!(interface = %dfu.settings(), "Bound DFU interface");
        observer.on_event(&event);
        Ok(dfu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::protocol::constants::DEFAULT_VENDOR_ID;
    use crate::transport::{MockProvider, TransportError};

    fn connector() -> Connector {
        Connector::new(MAX_CONNECT_ATTEMPTS, Duration::ZERO)
    }

    fn null() -> Arc<dyn FlashObserver> {
        Arc::new(NullObserver)
    }

    #[test]
    fn test_authorized_device_matches_serial() {
        let provider = MockProvider::new();
        let other = provider.builder().serial(Some("AAAA")).build();
        let wanted = provider.builder().serial(Some("BBBB")).build();
        provider.authorize(&other);
        provider.authorize(&wanted);

        let filter = DeviceFilter::with_serial(DEFAULT_VENDOR_ID, Some("BBBB".into()));
        let outcome = connector().attempt(&provider, &filter, false, &null());
        let ConnectOutcome::Connected(device) = outcome else {
            panic!("expected a connection");
        };
        assert_eq!(device.serial_number().as_deref(), Some("BBBB"));
        assert!(wanted.is_open());
        assert_eq!(provider.request_calls(), 0);
    }

    #[test]
    fn test_no_prompt_needs_gesture() {
        let provider = MockProvider::new();
        let device = provider.builder().build();
        provider.offer(&device);

        let outcome = connector().attempt(
            &provider,
            &DeviceFilter::vendor(DEFAULT_VENDOR_ID),
            false,
            &null(),
        );
        assert!(matches!(outcome, ConnectOutcome::NeedsGesture));
        assert_eq!(provider.request_calls(), 0);
    }

    #[test]
    fn test_non_dfu_devices_are_skipped() {
        let provider = MockProvider::new();
        let plain = provider.builder().without_dfu().build();
        provider.authorize(&plain);

        let outcome = connector().attempt(
            &provider,
            &DeviceFilter::vendor(DEFAULT_VENDOR_ID),
            false,
            &null(),
        );
        assert!(matches!(outcome, ConnectOutcome::NeedsGesture));
        assert!(!plain.is_open());
    }

    #[test]
    fn test_prompt_uses_vendor_filter_only() {
        let provider = MockProvider::new();
        let device = provider.builder().serial(Some("NEW")).build();
        provider.offer(&device);

        let filter = DeviceFilter::with_serial(DEFAULT_VENDOR_ID, Some("OLD".into()));
        let outcome = connector().attempt(&provider, &filter, true, &null());
        let ConnectOutcome::Connected(dfu) = outcome else {
            panic!("expected a connection");
        };
        assert_eq!(dfu.serial_number().as_deref(), Some("NEW"));
        assert_eq!(provider.request_calls(), 1);
    }

    #[test]
    fn test_request_errors_are_mapped() {
        let provider = MockProvider::new();
        let filter = DeviceFilter::vendor(DEFAULT_VENDOR_ID);
        let mut connector = connector();

        let outcome = connector.attempt(&provider, &filter, true, &null());
        assert!(matches!(
            outcome,
            ConnectOutcome::Failed(ConnectError::NoMatchingDevice)
        ));

        provider.fail_requests(Some(RequestError::Cancelled));
        let outcome = connector.attempt(&provider, &filter, true, &null());
        assert!(matches!(outcome, ConnectOutcome::Failed(ConnectError::UserCancelled)));

        provider.fail_requests(Some(RequestError::Blocked("insecure context".into())));
        let outcome = connector.attempt(&provider, &filter, true, &null());
        assert!(matches!(
            outcome,
            ConnectOutcome::Failed(ConnectError::SecurityBlocked(_))
        ));
    }

    #[test]
    fn test_enumeration_errors_fall_through() {
        let provider = MockProvider::new();
        let device = provider.builder().build();
        provider.offer(&device);
        provider.fail_enumeration(Some(TransportError::TransferFailed("busy".into())));
        let observer = Arc::new(RecordingObserver::new());
        let dyn_observer: Arc<dyn FlashObserver> = observer.clone();

        let outcome = connector().attempt(
            &provider,
            &DeviceFilter::vendor(DEFAULT_VENDOR_ID),
            true,
            &dyn_observer,
        );
        assert!(outcome.is_connected());
        assert_eq!(observer.messages(LogLevel::Warning).len(), 1);
    }

    #[test]
    fn test_sixth_attempt_fails_before_io() {
        let provider = MockProvider::new();
        let filter = DeviceFilter::vendor(DEFAULT_VENDOR_ID);
        let mut connector = connector();

        for _ in 0..5 {
            let outcome = connector.attempt(&provider, &filter, false, &null());
            assert!(matches!(outcome, ConnectOutcome::NeedsGesture));
        }
        let calls = provider.enumerate_calls();
        let outcome = connector.attempt(&provider, &filter, true, &null());
        assert!(matches!(
            outcome,
            ConnectOutcome::Failed(ConnectError::MaxAttemptsExceeded { max: 5 })
        ));
        assert_eq!(provider.enumerate_calls(), calls);
        assert_eq!(provider.request_calls(), 0);
    }

    #[test]
    fn test_success_resets_counter() {
        let provider = MockProvider::new();
        let filter = DeviceFilter::vendor(DEFAULT_VENDOR_ID);
        let mut connector = connector();
        for _ in 0..4 {
            connector.attempt(&provider, &filter, false, &null());
        }
        let device = provider.builder().build();
        provider.authorize(&device);
        assert!(connector.attempt(&provider, &filter, false, &null()).is_connected());
        assert_eq!(connector.attempts(), 0);
    }

    #[test]
    fn test_connect_reads_properties_and_name() {
        let provider = MockProvider::new();
        let device = provider
            .builder()
            .interface_name("@Internal Flash  /0x08000000/04*016Kg")
            .functional(Some(crate::descriptor::DfuFunctionalDescriptor::new(
                0x0B, 255, 2048, 0x011A,
            )))
            .build();

        let dfu = connector()
            .connect(device.clone(), provider.disconnects(), null())
            .unwrap();
        assert_eq!(
            dfu.settings().name.as_deref(),
            Some("@Internal Flash  /0x08000000/04*016Kg")
        );
        assert_eq!(dfu.properties().transfer_size, 2048);
        assert!(!dfu.properties().manifestation_tolerant);
        assert_eq!(dfu.variant().start_address(), Some(0x0800_0000));
    }

    #[test]
    fn test_connect_without_functional_uses_defaults() {
        let provider = MockProvider::new();
        let device = provider.builder().functional(None).build();
        let dfu = connector()
            .connect(device, provider.disconnects(), null())
            .unwrap();
        assert_eq!(*dfu.properties(), crate::dfu::FunctionalProperties::default());
    }

    #[test]
    fn test_connect_rejects_non_dfu() {
        let provider = MockProvider::new();
        let device = provider.builder().without_dfu().build();
        let Err(err) = connector().connect(device, provider.disconnects(), null()) else {
            panic!("non-DFU device was bound");
        };
        assert!(matches!(err, ConnectError::NotDfuCapable));
    }
}
