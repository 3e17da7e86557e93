//! Stage 1: connect the stage-1 bootloader and switch it into stage 2.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use super::{HandleResult, HandlerContext};
use crate::connection::ConnectOutcome;
use crate::error::{ConnectError, DfuError};
use crate::events::LogLevel;
use crate::state::machine::FlashState;
use crate::transport::{DeviceFilter, DeviceProvider};

/// Idle + user action: connect, check identity, detach, wait for the drop.
pub fn handle_start<P: DeviceProvider>(ctx: &mut HandlerContext<'_, P>) -> Result<HandleResult> {
    if let Err(e) = ctx.firmware.load() {
        ctx.status(LogLevel::Error, format!("Firmware not available: {e}"));
        return Ok(HandleResult::Idle);
    }

    ctx.connector.reset();
    ctx.session.serial.clear();
    ctx.goto(FlashState::ConnectingStage1)?;
    ctx.log(LogLevel::Info, "Starting stage 1 connection...");

    let filter = DeviceFilter::vendor(ctx.config.vendor_id);
    let device = match ctx
        .connector
        .attempt(ctx.provider, &filter, true, ctx.observer)
    {
        ConnectOutcome::Connected(device) => device,
        ConnectOutcome::NeedsGesture => {
            ctx.log(LogLevel::Warning, "User gesture needed unexpectedly during stage 1");
            ctx.clear()?;
            return Ok(HandleResult::Idle);
        }
        ConnectOutcome::Failed(e @ (ConnectError::UserCancelled | ConnectError::NoMatchingDevice)) => {
            ctx.log(LogLevel::Warning, format!("Device selection cancelled: {e}"));
            ctx.clear()?;
            return Ok(HandleResult::Idle);
        }
        ConnectOutcome::Failed(e) => {
            return Err(anyhow!(e)).context("Connection failed (Stage 1)");
        }
    };

    let product = device.product_name();
    if product.as_deref() != Some(ctx.config.stage1_product.as_str()) {
        let found = product.as_deref().unwrap_or("Unknown");
        ctx.log(
            LogLevel::Error,
            format!(
                "Incorrect device connected: {found}. Expected '{}'",
                ctx.config.stage1_product
            ),
        );
        device.close();
        ctx.clear()?;
        ctx.status(
            LogLevel::Error,
            "Wrong mode! Put the device in DFU mode and try again",
        );
        return Ok(HandleResult::Idle);
    }

    let serial = device.serial_number().unwrap_or_default();
    ctx.log(
        LogLevel::Success,
        format!(
            "Connected to {} (Stage 1). Serial: {}",
            ctx.config.stage1_product,
            if serial.is_empty() { "N/A" } else { serial.as_str() }
        ),
    );
    ctx.session.serial = serial;
    ctx.session.device = Some(device);

    ctx.log(LogLevel::Info, "Waiting briefly before detaching for mode switch...");
    thread::sleep(Duration::from_millis(ctx.config.detach_delay_ms));

    ctx.goto(FlashState::WaitingDisconnect)?;
    detach_and_wait(ctx)?;

    ctx.release_device();
    if ctx.state() == FlashState::WaitingDisconnect {
        ctx.goto(FlashState::PromptRefresh1)?;
        ctx.log(LogLevel::Success, "Ready for first restart");
    }
    Ok(HandleResult::AwaitReload)
}

fn detach_and_wait<P: DeviceProvider>(ctx: &HandlerContext<'_, P>) -> Result<()> {
    let device = ctx.device()?;
    match device.detach() {
        Ok(()) => {}
        Err(e) if e.is_stall() => {
            return Err(anyhow!(e)).context("Device stalled. Please reconnect and try again");
        }
        // Some bootloaders drop off the bus before acknowledging DETACH.
        Err(e) if e.is_device_gone() => debug!(error = %e, "Device left during detach"),
        Err(e) => return Err(anyhow!(e)).context("Connection failed (Stage 1)"),
    }
    ctx.log(LogLevel::Info, "Detach command sent. Waiting for device disconnect...");

    let timeout = Duration::from_millis(ctx.config.disconnect_timeout_ms);
    match device.wait_disconnected(timeout) {
        Ok(()) => {
            info!("Stage 1 device disconnected");
            ctx.log(LogLevel::Info, "Device disconnected as expected after detach");
        }
        Err(DfuError::DisconnectTimeout { timeout_ms }) => {
            ctx.log(
                LogLevel::Warning,
                format!(
                    "Device did not disconnect within {timeout_ms}ms after detach, proceeding anyway"
                ),
            );
        }
        Err(e) => return Err(anyhow!(e)).context("Connection failed (Stage 1)"),
    }
    Ok(())
}
