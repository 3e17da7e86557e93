//! Terminal front end: progress bar, log lines and the device chooser.

use dfu_core::events::{FlashEvent, FlashObserver, LogLevel};
use dfu_core::transport::{DeviceChooser, DeviceSummary};
use dialoguer::{Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Prints session messages and drives a byte progress bar.
pub struct TerminalObserver {
    bar: ProgressBar,
    verbose: bool,
}

impl TerminalObserver {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_draw_target(ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar, verbose }
    }

    fn print(&self, level: LogLevel, message: &str) {
        let tag = match level {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "ok",
        };
        self.bar.suspend(|| eprintln!("[{tag:>5}] {message}"));
    }
}

impl FlashObserver for TerminalObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Log { level, message } => {
                if *level != LogLevel::Debug || self.verbose {
                    self.print(*level, message);
                }
            }
            FlashEvent::Status { level, message } => {
                self.bar.set_message(message.clone());
                if matches!(level, LogLevel::Warning | LogLevel::Error | LogLevel::Success) {
                    self.print(*level, message);
                }
            }
            FlashEvent::Progress { done, total } => {
                if let Some(total) = total {
                    if self.bar.length() != Some(*total) {
                        self.bar.reset();
                        self.bar.set_length(*total);
                    }
                }
                self.bar.set_position(*done);
                if total.is_some_and(|t| *done >= t) {
                    self.bar.finish();
                }
            }
            FlashEvent::DeviceConnected { vid, pid, serial } => {
                self.print(
                    LogLevel::Info,
                    &format!(
                        "Device {vid:04X}:{pid:04X} connected (serial {})",
                        serial.as_deref().unwrap_or("N/A")
                    ),
                );
            }
            FlashEvent::DeviceDisconnected => {
                self.print(LogLevel::Warning, "Device disconnected");
            }
            FlashEvent::StateChanged { from, to } => {
                if self.verbose {
                    self.print(LogLevel::Debug, &format!("{from} -> {to}"));
                }
            }
            FlashEvent::Packet { .. } => {}
            FlashEvent::Complete => {
                self.bar.finish_and_clear();
            }
        }
    }
}

/// Interactive chooser. With `assume_yes` a single candidate is taken as is.
pub struct PromptChooser {
    pub assume_yes: bool,
}

impl DeviceChooser for PromptChooser {
    fn choose(&self, candidates: &[DeviceSummary]) -> Result<Option<usize>, String> {
        if self.assume_yes && candidates.len() == 1 {
            return Ok(Some(0));
        }
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select the DFU device to grant access to")
            .items(candidates)
            .default(0)
            .interact_opt()
            .map_err(|e| e.to_string())
    }
}
