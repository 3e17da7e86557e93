//! Stage 2: reconnect the re-enumerated device and let it settle.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use super::{HandleResult, HandlerContext, serial_filter};
use crate::connection::ConnectOutcome;
use crate::error::ConnectError;
use crate::events::LogLevel;
use crate::protocol::DfuState;
use crate::state::machine::FlashState;
use crate::transport::{DeviceFilter, DeviceProvider};

/// Connect stage 2. Without `allow_prompt` a missing grant falls back to
/// `PromptConnectStage2`.
pub fn handle_connect<P: DeviceProvider>(
    ctx: &mut HandlerContext<'_, P>,
    allow_prompt: bool,
) -> Result<HandleResult> {
    ctx.goto(FlashState::ConnectingStage2)?;

    let filter = DeviceFilter::with_serial(ctx.config.vendor_id, serial_filter(ctx.session));
    let device = match ctx
        .connector
        .attempt(ctx.provider, &filter, allow_prompt, ctx.observer)
    {
        ConnectOutcome::Connected(device) => device,
        ConnectOutcome::NeedsGesture => {
            ctx.log(
                LogLevel::Warning,
                "Permissions needed for stage 2. Waiting for user action",
            );
            ctx.goto(FlashState::PromptConnectStage2)?;
            return Ok(HandleResult::AwaitUser);
        }
        ConnectOutcome::Failed(e @ (ConnectError::UserCancelled | ConnectError::NoMatchingDevice)) => {
            ctx.log(LogLevel::Warning, format!("Device selection failed: {e}"));
            ctx.goto(FlashState::PromptConnectStage2)?;
            return Ok(HandleResult::AwaitUser);
        }
        ConnectOutcome::Failed(e) => {
            let what = if allow_prompt {
                "Connection failed (Stage 2)"
            } else {
                "Automatic connection failed (Stage 2)"
            };
            return Err(anyhow!(e)).context(what);
        }
    };

    if let Some(serial) = device.serial_number().filter(|s| !s.is_empty()) {
        ctx.session.serial = serial;
    }
    ctx.log(
        LogLevel::Success,
        format!(
            "Reconnected to {} (Stage 2). Serial: {}",
            device.product_name().as_deref().unwrap_or("Unknown"),
            ctx.session.serial
        ),
    );
    ctx.session.device = Some(device);

    ctx.goto(FlashState::WaitingStable)?;
    thread::sleep(Duration::from_millis(ctx.config.stabilize_delay_ms));
    clear_lingering_error(ctx);

    ctx.goto(FlashState::PromptRefresh2)?;
    ctx.log(LogLevel::Success, "Ready for final restart");
    Ok(HandleResult::AwaitReload)
}

/// Best effort: a device left in dfuERROR by the mode switch is cleared.
fn clear_lingering_error<P: DeviceProvider>(ctx: &HandlerContext<'_, P>) {
    let Ok(device) = ctx.device() else {
        return;
    };
    ctx.log(LogLevel::Info, "Checking DFU status...");
    match device.get_status() {
        Ok(status) => {
            ctx.log(
                LogLevel::Info,
                format!("DFU Status: State={}, Status={}", status.state, status.status),
            );
            if status.state == DfuState::DfuError {
                ctx.log(LogLevel::Warning, "Device in DFU error state, attempting to clear...");
                match device.clear_status() {
                    Ok(()) => ctx.log(LogLevel::Info, "Cleared DFU error state"),
                    Err(e) => ctx.log(LogLevel::Warning, format!("Couldn't clear DFU status: {e}")),
                }
            }
        }
        Err(e) => ctx.log(LogLevel::Warning, format!("Couldn't check DFU status: {e}")),
    }
}
