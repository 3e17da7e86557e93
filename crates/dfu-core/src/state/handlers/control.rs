//! Control flow handlers (failure, reset, disconnect, completion).

use anyhow::Result;
use tracing::{debug, error, info};

use super::{HandleResult, HandlerContext};
use crate::events::{FlashEvent, LogLevel};
use crate::state::machine::FlashState;
use crate::transport::{DeviceProvider, UsbDevice};

/// Report `err` and park the session in `Error`.
pub fn handle_failure<P: DeviceProvider>(
    ctx: &mut HandlerContext<'_, P>,
    err: &anyhow::Error,
) -> Result<HandleResult> {
    error!(state = %ctx.state(), error = %format!("{err:#}"), "Flash session failed");
    ctx.log(LogLevel::Error, format!("Error: {err:#}"));
    ctx.status(LogLevel::Error, format!("{err:#}"));
    ctx.release_device();
    if ctx.state() != FlashState::Error {
        ctx.goto(FlashState::Error)?;
    }
    Ok(HandleResult::Failed)
}

/// Error + user action: start over.
pub fn handle_reset<P: DeviceProvider>(ctx: &mut HandlerContext<'_, P>) -> Result<HandleResult> {
    info!("Resetting flash session");
    ctx.clear()?;
    ctx.log(LogLevel::Info, "State reset. Please try the connection process again.");
    Ok(HandleResult::Idle)
}

/// A device left the bus. Only the bound device matters.
pub fn handle_disconnect<P: DeviceProvider>(
    ctx: &mut HandlerContext<'_, P>,
    key: &<P::Device as UsbDevice>::Key,
) -> Result<HandleResult> {
    let is_current = ctx
        .session
        .device
        .as_ref()
        .is_some_and(|d| d.key() == *key);
    if !is_current {
        debug!(?key, "Disconnect of a device not bound to the session");
        return Ok(HandleResult::Ignored);
    }

    if let Some(device) = ctx.session.device.take() {
        device.mark_disconnected();
        device.close();
    }
    ctx.emit(FlashEvent::DeviceDisconnected);

    let state = ctx.state();
    if !state.tolerates_disconnect() {
        return handle_failure(ctx, &anyhow::anyhow!("Device disconnected unexpectedly"));
    }
    if state == FlashState::WaitingDisconnect {
        ctx.log(LogLevel::Info, "Device disconnected as expected after detach");
    } else {
        ctx.log(
            LogLevel::Info,
            format!("Device disconnected during non-critical state: {state}"),
        );
    }
    Ok(HandleResult::Ignored)
}

/// FlashComplete: the completion message has been shown long enough.
pub fn handle_complete<P: DeviceProvider>(ctx: &mut HandlerContext<'_, P>) -> Result<HandleResult> {
    if ctx.state() != FlashState::FlashComplete {
        return Ok(HandleResult::Ignored);
    }
    ctx.log(LogLevel::Info, "Flash complete. Returning to idle");
    ctx.clear()?;
    Ok(HandleResult::Idle)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::connection::Connector;
    use crate::events::{FlashObserver, RecordingObserver};
    use crate::firmware::StaticFirmware;
    use crate::session::SessionConfig;
    use crate::state::machine::SessionContext;
    use crate::state::store::{MemoryStore, STATE_KEY, SessionStore};
    use crate::transport::{MockDevice, MockProvider};

    struct Rig {
        provider: MockProvider,
        mock: MockDevice,
        recorder: Arc<RecordingObserver>,
        observer: Arc<dyn FlashObserver>,
        store: MemoryStore,
        connector: Connector,
        config: SessionConfig,
        firmware: StaticFirmware,
        session: SessionContext<MockDevice>,
    }

    fn rig(state: FlashState) -> Rig {
        let provider = MockProvider::new();
        let mock = provider.builder().build();
        let recorder = Arc::new(RecordingObserver::new());
        let observer: Arc<dyn FlashObserver> = recorder.clone();
        let connector = Connector::new(5, Duration::ZERO);
        let device = connector
            .connect(mock.clone(), provider.disconnects(), Arc::clone(&observer))
            .unwrap();
        let mut session = SessionContext::new(state, "0001".into());
        session.device = Some(device);
        Rig {
            provider,
            mock,
            recorder,
            observer,
            store: MemoryStore::new(),
            connector,
            config: SessionConfig::default(),
            firmware: StaticFirmware::new("fw", vec![1, 2, 3]),
            session,
        }
    }

    impl Rig {
        fn ctx(&mut self) -> HandlerContext<'_, MockProvider> {
            HandlerContext {
                provider: &self.provider,
                observer: &self.observer,
                store: &mut self.store,
                connector: &mut self.connector,
                config: &self.config,
                firmware: &self.firmware,
                session: &mut self.session,
            }
        }
    }

    #[test]
    fn test_disconnect_while_flashing_fails() {
        let mut rig = rig(FlashState::Flashing);
        let key = rig.mock.key();

        assert_eq!(handle_disconnect(&mut rig.ctx(), &key).unwrap(), HandleResult::Failed);
        assert_eq!(rig.session.state, FlashState::Error);
        assert!(rig.session.device.is_none());
        assert_eq!(rig.store.get(STATE_KEY).as_deref(), Some("error"));
        let (level, message) = rig.recorder.last_status().unwrap();
        assert_eq!(level, LogLevel::Error);
        assert_eq!(message, "Device disconnected unexpectedly");
    }

    #[test]
    fn test_disconnect_of_other_device_ignored() {
        let mut rig = rig(FlashState::Flashing);
        let key = rig.mock.key() + 1000;

        assert_eq!(handle_disconnect(&mut rig.ctx(), &key).unwrap(), HandleResult::Ignored);
        assert_eq!(rig.session.state, FlashState::Flashing);
        assert!(rig.session.device.is_some());
    }

    #[test]
    fn test_failure_releases_device_once() {
        let mut rig = rig(FlashState::ConnectingFlash);
        let err = anyhow::anyhow!("boom");

        assert_eq!(handle_failure(&mut rig.ctx(), &err).unwrap(), HandleResult::Failed);
        assert!(!rig.mock.is_open());
        // Failing again from Error stays in Error.
        assert_eq!(handle_failure(&mut rig.ctx(), &err).unwrap(), HandleResult::Failed);
        assert_eq!(rig.session.state, FlashState::Error);
        assert_eq!(rig.recorder.messages(LogLevel::Error), vec!["Error: boom"; 2]);
    }

    #[test]
    fn test_complete_returns_to_idle() {
        let mut rig = rig(FlashState::FlashComplete);
        rig.session.device = None;

        assert_eq!(handle_complete(&mut rig.ctx()).unwrap(), HandleResult::Idle);
        assert_eq!(rig.session.state, FlashState::Idle);
        assert!(rig.session.serial.is_empty());
        assert_eq!(handle_complete(&mut rig.ctx()).unwrap(), HandleResult::Ignored);
    }
}
