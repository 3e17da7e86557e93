//! Flash Session - orchestrates the two-restart update flow.
//!
//! A `FlashSession` lives for one run of the flasher. Between runs only the
//! `(state, serial)` pair in the `SessionStore` survives; constructing a new
//! session (or calling `reload`) picks the flow up from there.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::connection::Connector;
use crate::dfu::DfuDevice;
use crate::events::{FlashEvent, FlashObserver, LogLevel};
use crate::firmware::FirmwareSource;
use crate::protocol::constants::{DEFAULT_VENDOR_ID, MAX_CONNECT_ATTEMPTS, STAGE1_PRODUCT_NAME};
use crate::state::handlers::{
    HandleResult, HandlerContext, handle_click, handle_complete, handle_disconnect,
    handle_failure, handle_reset, handle_resume,
};
use crate::state::machine::{FlashState, SessionContext};
use crate::state::store::{self, SessionStore};
use crate::transport::{DeviceFilter, DeviceProvider, Subscription, UsbDevice};

/// Configuration for a flash session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor id of the target in every stage.
    pub vendor_id: u16,
    /// Product string the stage-1 bootloader reports.
    pub stage1_product: String,
    /// Firmware image written in the final stage.
    pub firmware_path: Option<PathBuf>,
    /// Pause between binding stage 1 and sending DETACH.
    pub detach_delay_ms: u64,
    /// Pause after a restart before connecting automatically.
    pub connect_delay_ms: u64,
    /// Settle time after the stage-2 connection.
    pub stabilize_delay_ms: u64,
    /// How long the completion message stays before returning to idle.
    pub complete_delay_ms: u64,
    /// Pause between picking a device and opening it.
    pub open_delay_ms: u64,
    /// How long to wait for the stage-1 device to leave after DETACH.
    pub disconnect_timeout_ms: u64,
    /// Connection attempts allowed before the session gives up.
    pub max_connect_attempts: u32,
    /// Check on restore that the stored device is still granted.
    pub verify_on_restore: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            stage1_product: STAGE1_PRODUCT_NAME.to_string(),
            firmware_path: None,
            detach_delay_ms: 300,
            connect_delay_ms: 500,
            stabilize_delay_ms: 1500,
            complete_delay_ms: 6000,
            open_delay_ms: 200,
            disconnect_timeout_ms: 5000,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
            verify_on_restore: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// One run of the flasher.
pub struct FlashSession<P: DeviceProvider, S: SessionStore> {
    config: SessionConfig,
    provider: P,
    store: S,
    firmware: Box<dyn FirmwareSource>,
    observer: Arc<dyn FlashObserver>,
    connector: Connector,
    context: SessionContext<P::Device>,
    disconnects: Subscription<<P::Device as UsbDevice>::Key>,
    completed_at: Option<Instant>,
}

impl<P: DeviceProvider, S: SessionStore> FlashSession<P, S> {
    /// Start a run, restoring whatever the store says about the previous one.
    pub fn new(
        config: SessionConfig,
        provider: P,
        store: S,
        firmware: Box<dyn FirmwareSource>,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        let disconnects = provider.disconnects().subscribe_all();
        let connector = Connector::new(
            config.max_connect_attempts,
            Duration::from_millis(config.open_delay_ms),
        );
        let mut session = Self {
            config,
            provider,
            store,
            firmware,
            observer,
            connector,
            context: SessionContext::new(FlashState::Idle, String::new()),
            disconnects,
            completed_at: None,
        };
        session.restore();
        session
    }

    pub fn state(&self) -> FlashState {
        self.context.state
    }

    /// Serial of the device in flight (empty when none).
    pub fn serial(&self) -> &str {
        &self.context.serial
    }

    pub fn device(&self) -> Option<&DfuDevice<P::Device>> {
        self.context.device.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connector.attempts()
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn handler_context(&mut self) -> HandlerContext<'_, P> {
        HandlerContext {
            provider: &self.provider,
            observer: &self.observer,
            store: &mut self.store,
            connector: &mut self.connector,
            config: &self.config,
            firmware: self.firmware.as_ref(),
            session: &mut self.context,
        }
    }

    /// Load the persisted state and move it to its restart checkpoint.
    fn restore(&mut self) {
        let (loaded, serial) = store::load_state(&mut self.store);
        let mut state = loaded.restore_checkpoint();
        if state != loaded {
            info!(stored = %loaded, resumed = %state, "Resuming from checkpoint");
        }

        if state == FlashState::Idle {
            self.context = SessionContext::new(FlashState::Idle, String::new());
            if loaded != FlashState::Idle {
                self.persist_clear();
            }
            return;
        }

        if state.awaits_reload() && self.config.verify_on_restore && !self.device_granted(&serial) {
            let fallback = if state == FlashState::PromptRefresh1 {
                FlashState::PromptConnectStage2
            } else {
                FlashState::PromptConnectFlash
            };
            warn!(state = %state, fallback = %fallback, "Stored device is no longer granted");
            self.log(
                LogLevel::Warning,
                format!("Device {serial} is no longer permitted. Connect it manually to continue"),
            );
            state = fallback;
        }

        if state != loaded {
            if let Err(e) = store::save_state(&mut self.store, state, &serial) {
                warn!(error = %e, "Failed to persist restored state");
            }
        }
        debug!(state = %state, serial = %serial, "Session restored");
        self.context = SessionContext::new(state, serial);
    }

    fn persist_clear(&mut self) {
        if let Err(e) = store::clear_state(&mut self.store) {
            warn!(error = %e, "Failed to clear session store");
        }
    }

    /// Whether a granted device with the stored vendor and serial exists.
    fn device_granted(&self, serial: &str) -> bool {
        let filter = DeviceFilter::with_serial(self.config.vendor_id, Some(serial.to_string()));
        match self.provider.authorized_devices() {
            Ok(devices) => devices.iter().any(|d| filter.matches(d)),
            Err(e) => {
                warn!(error = %e, "Couldn't enumerate permitted devices");
                false
            }
        }
    }

    /// The user pressed "connect".
    #[instrument(skip(self), fields(state = %self.context.state))]
    pub fn click(&mut self) -> Result<HandleResult> {
        let result = handle_click(&mut self.handler_context())?;
        self.note(result);
        Ok(result)
    }

    /// Continue after a restart (automatic connection where possible).
    #[instrument(skip(self), fields(state = %self.context.state))]
    pub fn resume(&mut self) -> Result<HandleResult> {
        if self.context.state.awaits_reload() {
            thread::sleep(Duration::from_millis(self.config.connect_delay_ms));
        }
        let result = handle_resume(&mut self.handler_context())?;
        self.note(result);
        Ok(result)
    }

    /// Simulate a restart of the flasher without leaving the process.
    pub fn reload(&mut self) -> Result<HandleResult> {
        info!(state = %self.context.state, "Reloading session");
        if let Some(device) = self.context.device.take() {
            device.close();
        }
        while self.disconnects.try_next().is_some() {}
        self.connector.reset();
        self.completed_at = None;
        self.restore();
        self.resume()
    }

    /// Abandon the flow and return to idle.
    pub fn reset(&mut self) -> Result<HandleResult> {
        self.completed_at = None;
        handle_reset(&mut self.handler_context())
    }

    /// Process pending disconnects and the post-completion timeout.
    pub fn tick(&mut self) -> Result<HandleResult> {
        let mut result = HandleResult::Ignored;
        while let Some(key) = self.disconnects.try_next() {
            let handled = handle_disconnect(&mut self.handler_context(), &key)?;
            if handled != HandleResult::Ignored {
                result = handled;
            }
        }

        if self.context.state == FlashState::FlashComplete {
            let due = self.completed_at.is_none_or(|at| at.elapsed() >= self.complete_delay());
            if due {
                self.completed_at = None;
                result = handle_complete(&mut self.handler_context())?;
            }
        }
        Ok(result)
    }

    /// Wait out the completion message, then return to idle.
    pub fn finish(&mut self) -> Result<HandleResult> {
        if let Some(at) = self.completed_at {
            let remaining = self.complete_delay().saturating_sub(at.elapsed());
            if !remaining.is_zero() {
                thread::sleep(remaining);
            }
        }
        self.tick()
    }

    fn complete_delay(&self) -> Duration {
        Duration::from_millis(self.config.complete_delay_ms)
    }

    fn note(&mut self, result: HandleResult) {
        if result == HandleResult::Complete {
            self.completed_at = Some(Instant::now());
        }
    }

    /// Report an error the way the handlers do and park in `Error`.
    pub fn fail(&mut self, err: &anyhow::Error) -> Result<HandleResult> {
        handle_failure(&mut self.handler_context(), err)
    }
}

impl<P: DeviceProvider, S: SessionStore> Drop for FlashSession<P, S> {
    fn drop(&mut self) {
        if let Some(device) = self.context.device.take() {
            device.close();
        }
    }
}
