//! Event system for UI decoupling.
//!
//! The flash session and the DFU device report everything a front end
//! needs through `FlashObserver`; the core owns no rendering logic.

use std::fmt;

use crate::state::FlashState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Positive outcome worth highlighting to the user.
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Success => write!(f, "success"),
        }
    }
}

/// Events emitted during a flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Session state changed.
    StateChanged { from: FlashState, to: FlashState },
    /// Device bound to the session.
    DeviceConnected {
        vid: u16,
        pid: u16,
        serial: Option<String>,
    },
    /// Current device left the bus.
    DeviceDisconnected,
    /// Byte progress of a download or upload.
    Progress { done: u64, total: Option<u64> },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// One-line status for the user (replaces the previous one).
    Status { level: LogLevel, message: String },
    /// Control transfer sent/received.
    Packet {
        direction: PacketDirection,
        request: u8,
        value: u16,
        length: usize,
    },
    /// Firmware written and manifested.
    Complete,
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            FlashEvent::DeviceConnected { vid, pid, serial } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    serial = serial.as_deref().unwrap_or("-"),
                    "Device connected"
                );
            }
            FlashEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            FlashEvent::Progress { done, total } => match total {
                Some(total) if *total > 0 => {
                    tracing::debug!(progress = %format!("{}%", done * 100 / total), "Progress");
                }
                _ => tracing::debug!(bytes = done, "Progress"),
            },
            FlashEvent::Log { level, message } | FlashEvent::Status { level, message } => {
                match level {
                    LogLevel::Debug => tracing::debug!("{}", message),
                    LogLevel::Info | LogLevel::Success => tracing::info!("{}", message),
                    LogLevel::Warning => tracing::warn!("{}", message),
                    LogLevel::Error => tracing::error!("{}", message),
                }
            }
            FlashEvent::Packet {
                direction,
                request,
                value,
                length,
            } => {
                tracing::trace!(
                    dir = %direction,
                    request = %format!("0x{:02X}", request),
                    value,
                    len = length,
                    "Control transfer"
                );
            }
            FlashEvent::Complete => {
                tracing::info!("Flash complete");
            }
        }
    }
}

/// Observer that records every event; handy in tests and embedders.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<FlashEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Messages logged at `level`, in order.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Log { level: l, message } if l == level => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Last status line shown to the user.
    pub fn last_status(&self) -> Option<(LogLevel, String)> {
        self.events().into_iter().rev().find_map(|e| match e {
            FlashEvent::Status { level, message } => Some((level, message)),
            _ => None,
        })
    }
}

impl FlashObserver for RecordingObserver {
    fn on_event(&self, event: &FlashEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
