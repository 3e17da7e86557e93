//! Final stage: reconnect after the second restart and write the firmware.

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::{HandleResult, HandlerContext, serial_filter};
use crate::connection::ConnectOutcome;
use crate::dfu::DfuVariant;
use crate::error::ConnectError;
use crate::events::{FlashEvent, LogLevel};
use crate::state::machine::FlashState;
use crate::transport::{DeviceFilter, DeviceProvider};

/// Connect for flashing and run the download. Without `allow_prompt` a
/// missing grant falls back to `PromptConnectFlash`.
pub fn handle_connect<P: DeviceProvider>(
    ctx: &mut HandlerContext<'_, P>,
    allow_prompt: bool,
) -> Result<HandleResult> {
    ctx.goto(FlashState::ConnectingFlash)?;

    let filter = DeviceFilter::with_serial(ctx.config.vendor_id, serial_filter(ctx.session));
    let device = match ctx
        .connector
        .attempt(ctx.provider, &filter, allow_prompt, ctx.observer)
    {
        ConnectOutcome::Connected(device) => device,
        ConnectOutcome::NeedsGesture => {
            ctx.log(
                LogLevel::Warning,
                "Permissions needed for flashing. Waiting for user action",
            );
            ctx.goto(FlashState::PromptConnectFlash)?;
            return Ok(HandleResult::AwaitUser);
        }
        ConnectOutcome::Failed(e @ (ConnectError::UserCancelled | ConnectError::NoMatchingDevice)) => {
            ctx.log(LogLevel::Warning, format!("Device selection failed: {e}"));
            ctx.goto(FlashState::PromptConnectFlash)?;
            return Ok(HandleResult::AwaitUser);
        }
        ConnectOutcome::Failed(e) => {
            let what = if allow_prompt {
                "Connection failed (Final Flash)"
            } else {
                "Automatic connection failed (Final Flash)"
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
            "Reconnected to {} (Ready to Flash!). Serial: {}",
            device.product_name().as_deref().unwrap_or("Unknown"),
            ctx.session.serial
        ),
    );
    ctx.session.device = Some(device);

    ctx.goto(FlashState::Flashing)?;
    run_flash(ctx)
}

/// Flashing: write the firmware to the bound device.
fn run_flash<P: DeviceProvider>(ctx: &mut HandlerContext<'_, P>) -> Result<HandleResult> {
    let firmware = ctx.firmware.load().context("Firmware file is missing")?;
    let device = ctx.device()?;
    let properties = *device.properties();
    let transfer_size = properties.effective_transfer_size();

    ctx.log(
        LogLevel::Info,
        format!("Starting firmware flash... (Size: {} bytes)", firmware.len()),
    );
    ctx.log(
        LogLevel::Info,
        format!(
            "Using TransferSize: {}, ManifestationTolerant: {}",
            transfer_size, properties.manifestation_tolerant
        ),
    );
    if let DfuVariant::DfuSe { layout } = device.variant() {
        match layout.as_ref().and_then(|l| l.start_address()) {
            Some(addr) => ctx.log(
                LogLevel::Info,
                format!("DfuSe device, first segment at 0x{addr:08x}"),
            ),
            None => ctx.log(LogLevel::Warning, "DfuSe device without a memory layout"),
        }
    }

    device
        .do_download(transfer_size, &firmware, properties.manifestation_tolerant)
        .context("Flashing process failed")?;
    info!(size = firmware.len(), "Firmware written");
    ctx.log(LogLevel::Success, "Firmware download process completed successfully");

    // The device resets itself after manifestation.
    ctx.release_device();
    ctx.goto(FlashState::FlashComplete)?;
    ctx.emit(FlashEvent::Complete);
    Ok(HandleResult::Complete)
}
