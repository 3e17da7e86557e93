//! Session handlers - what a user action or a restart does in each state.
//!
//! This module is split into submodules by stage:
//! - `stage1`: connect the stage-1 bootloader and detach it
//! - `stage2`: reconnect after the first restart and let it settle
//! - `flash`: reconnect after the second restart and write the firmware
//! - `control`: failures, resets and disconnects

mod control;
mod flash;
mod stage1;
mod stage2;

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::connection::Connector;
use crate::events::{FlashEvent, FlashObserver, LogLevel};
use crate::firmware::FirmwareSource;
use crate::session::SessionConfig;
use crate::state::machine::{FlashState, SessionContext};
use crate::state::store::{self, SessionStore};
use crate::transport::{DeviceProvider, UsbDevice};

pub use control::{handle_complete, handle_disconnect, handle_failure, handle_reset};

/// Outcome of handling an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Waiting for a user action.
    AwaitUser,
    /// Waiting for the flasher to be restarted.
    AwaitReload,
    /// Firmware written; the session returns to idle after a delay.
    Complete,
    /// Back in idle.
    Idle,
    /// Parked in the error state.
    Failed,
    /// Nothing to do in the current state.
    Ignored,
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, P: DeviceProvider> {
    pub provider: &'a P,
    pub observer: &'a Arc<dyn FlashObserver>,
    pub store: &'a mut dyn SessionStore,
    pub connector: &'a mut Connector,
    pub config: &'a SessionConfig,
    pub firmware: &'a dyn FirmwareSource,
    pub session: &'a mut SessionContext<P::Device>,
}

impl<P: DeviceProvider> HandlerContext<'_, P> {
    pub(crate) fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn status(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FlashEvent::Status {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn state(&self) -> FlashState {
        self.session.state
    }

    /// Move to `to`, persist it and announce it.
    pub(crate) fn goto(&mut self, to: FlashState) -> Result<()> {
        let from = self.session.state;
        if !from.can_transition_to(to) {
            bail!("Illegal state transition {from} -> {to}");
        }
        self.session.goto_state(to);
        store::save_state(self.store, to, &self.session.serial)?;
        self.emit(FlashEvent::StateChanged { from, to });
        self.announce();
        Ok(())
    }

    /// Forget everything and return to idle, whatever the current state.
    pub(crate) fn clear(&mut self) -> Result<()> {
        let from = self.session.state;
        self.release_device();
        self.session.goto_state(FlashState::Idle);
        self.session.serial.clear();
        self.connector.reset();
        store::clear_state(self.store)?;
        if from != FlashState::Idle {
            self.emit(FlashEvent::StateChanged {
                from,
                to: FlashState::Idle,
            });
        }
        self.announce();
        Ok(())
    }

    /// Status line for states that speak for themselves.
    fn announce(&self) {
        let state = self.session.state;
        let level = match state {
            FlashState::Error => return,
            FlashState::FlashComplete => LogLevel::Success,
            s if s.awaits_reload() || (s.is_interactive() && s != FlashState::Idle) => {
                LogLevel::Warning
            }
            _ => LogLevel::Info,
        };
        self.status(level, state.prompt());
    }

    /// Close and drop the current device, if any.
    pub(crate) fn release_device(&mut self) {
        if let Some(device) = self.session.device.take() {
            debug!(key = ?device.key(), "Releasing device");
            device.close();
        }
    }

    pub(crate) fn device(&self) -> Result<&crate::dfu::DfuDevice<P::Device>> {
        match self.session.device.as_ref() {
            Some(device) => Ok(device),
            None => bail!("Device not connected"),
        }
    }
}

/// React to a user action (the "connect" button).
pub fn handle_click<P: DeviceProvider>(ctx: &mut HandlerContext<'_, P>) -> Result<HandleResult> {
    let result = match ctx.state() {
        FlashState::Error => return handle_reset(ctx),
        FlashState::Idle => stage1::handle_start(ctx),
        FlashState::PromptConnectStage2 => stage2::handle_connect(ctx, true),
        FlashState::PromptConnectFlash => flash::handle_connect(ctx, true),
        state => {
            warn!(state = %state, "User action in non-interactive state, ignoring");
            return Ok(HandleResult::Ignored);
        }
    };
    result.or_else(|e| handle_failure(ctx, &e))
}

/// Continue automatically after a restart.
pub fn handle_resume<P: DeviceProvider>(ctx: &mut HandlerContext<'_, P>) -> Result<HandleResult> {
    let state = ctx.state();
    if state.requires_serial() && ctx.session.serial.is_empty() {
        ctx.log(LogLevel::Warning, "Inconsistent state detected on load. Process reset.");
        ctx.clear()?;
        return Ok(HandleResult::Idle);
    }

    let result = match state {
        FlashState::PromptRefresh1 => {
            ctx.log(
                LogLevel::Info,
                "Detected first restart. Attempting automatic stage 2 connection...",
            );
            stage2::handle_connect(ctx, false)
        }
        FlashState::PromptRefresh2 => {
            ctx.log(
                LogLevel::Info,
                "Detected second restart. Attempting automatic flash connection...",
            );
            flash::handle_connect(ctx, false)
        }
        state => {
            debug!(state = %state, "No automatic action for state");
            ctx.announce();
            return Ok(match state {
                FlashState::Idle => HandleResult::Idle,
                FlashState::Error => HandleResult::Failed,
                _ => HandleResult::AwaitUser,
            });
        }
    };
    result.or_else(|e| handle_failure(ctx, &e))
}

/// Bound the serial filter to what was stored for the device in flight.
pub(crate) fn serial_filter<D: UsbDevice>(session: &SessionContext<D>) -> Option<String> {
    Some(session.serial.clone()).filter(|s| !s.is_empty())
}
