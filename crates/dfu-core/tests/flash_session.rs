//! End-to-end flash sessions against the mock backend.

use std::sync::Arc;

use dfu_core::events::{FlashEvent, FlashObserver, LogLevel, RecordingObserver};
use dfu_core::firmware::{FileFirmware, StaticFirmware};
use dfu_core::protocol::constants::{DFU_CLRSTATUS, DFU_DETACH, STATUS_ERR_WRITE, STATUS_OK};
use dfu_core::protocol::DfuState;
use dfu_core::session::{FlashSession, SessionConfig};
use dfu_core::state::store::{SERIAL_KEY, STATE_KEY};
use dfu_core::state::{FileStore, FlashState, HandleResult, MemoryStore, SessionStore};
use dfu_core::transport::{MockDevice, MockProvider, RequestError, TransportError};

const SERIAL: &str = "SN-42";

fn config() -> SessionConfig {
    SessionConfig {
        detach_delay_ms: 0,
        connect_delay_ms: 0,
        stabilize_delay_ms: 0,
        complete_delay_ms: 0,
        open_delay_ms: 0,
        disconnect_timeout_ms: 200,
        ..Default::default()
    }
}

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn open_session<S: SessionStore>(
    provider: &MockProvider,
    store: S,
    config: SessionConfig,
    image: Vec<u8>,
    observer: &Arc<RecordingObserver>,
) -> FlashSession<MockProvider, S> {
    let observer: Arc<dyn FlashObserver> = observer.clone();
    FlashSession::new(
        config,
        provider.clone(),
        store,
        Box::new(StaticFirmware::new("app.bin", image)),
        observer,
    )
}

fn stage1_device(provider: &MockProvider) -> MockDevice {
    provider
        .builder()
        .product("MCUBOOT")
        .serial(Some(SERIAL))
        .disconnect_on_detach(true)
        .build()
}

fn stage2_device(provider: &MockProvider) -> MockDevice {
    provider
        .builder()
        .product("MCUBOOT Stage 2")
        .serial(Some(SERIAL))
        .build()
}

fn app_device(provider: &MockProvider) -> MockDevice {
    provider
        .builder()
        .product("Application DFU")
        .serial(Some(SERIAL))
        .build()
}

#[test]
fn test_stage1_detaches_and_waits_for_reload() {
    let provider = MockProvider::new();
    let stage1 = stage1_device(&provider);
    provider.offer(&stage1);
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, MemoryStore::new(), config(), firmware(64), &observer);

    assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);
    assert_eq!(session.state(), FlashState::PromptRefresh1);
    assert_eq!(session.serial(), SERIAL);
    assert!(session.device().is_none());

    assert_eq!(stage1.class_requests(DFU_DETACH).len(), 1);
    assert!(stage1.is_disconnected());
    assert_eq!(provider.request_calls(), 1);
    assert_eq!(
        session.store().get(STATE_KEY).as_deref(),
        Some("prompt_refresh_1")
    );
    assert_eq!(session.store().get(SERIAL_KEY).as_deref(), Some(SERIAL));
    assert_eq!(
        observer.last_status(),
        Some((LogLevel::Warning, FlashState::PromptRefresh1.prompt().to_string()))
    );
}

#[test]
fn test_resume_without_grant_needs_gesture() {
    let provider = MockProvider::new();
    let stage2 = stage2_device(&provider);
    provider.offer(&stage2);
    let mut store = MemoryStore::new();
    store.set(STATE_KEY, "prompt_refresh_1").unwrap();
    store.set(SERIAL_KEY, SERIAL).unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let config = SessionConfig {
        verify_on_restore: false,
        ..config()
    };
    let mut session = open_session(&provider, store, config, firmware(64), &observer);

    assert_eq!(session.resume().unwrap(), HandleResult::AwaitUser);
    assert_eq!(session.state(), FlashState::PromptConnectStage2);
    assert_eq!(provider.request_calls(), 0);

    // The user grants the device explicitly.
    assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);
    assert_eq!(session.state(), FlashState::PromptRefresh2);
    assert_eq!(provider.request_calls(), 1);
}

#[test]
fn test_full_flash_across_two_reloads() {
    let provider = MockProvider::new();
    let stage1 = stage1_device(&provider);
    provider.offer(&stage1);
    let image = firmware(2500);
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, MemoryStore::new(), config(), image.clone(), &observer);

    assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);

    let stage2 = stage2_device(&provider);
    provider.authorize(&stage2);
    assert_eq!(session.reload().unwrap(), HandleResult::AwaitReload);
    assert_eq!(session.state(), FlashState::PromptRefresh2);
    assert!(session.device().is_some());

    provider.remove(&stage2);
    let app = app_device(&provider);
    provider.authorize(&app);
    assert_eq!(session.reload().unwrap(), HandleResult::Complete);
    assert_eq!(session.state(), FlashState::FlashComplete);

    assert_eq!(
        app.download_blocks(),
        vec![(0, 1024), (1, 1024), (2, 452), (3, 0)]
    );
    assert_eq!(app.downloaded(), image);
    assert_eq!(app.reset_count(), 1);
    assert_eq!(provider.request_calls(), 1);
    assert!(
        observer
            .events()
            .iter()
            .any(|e| matches!(e, FlashEvent::Complete))
    );

    assert_eq!(session.finish().unwrap(), HandleResult::Idle);
    assert_eq!(session.state(), FlashState::Idle);
    assert_eq!(session.serial(), "");
    assert_eq!(session.store().get(STATE_KEY), None);
}

#[test]
fn test_flash_error_is_cleared_once() {
    let provider = MockProvider::new();
    let app = app_device(&provider);
    provider.authorize(&app);
    // Precheck, then two dfuERROR replies around a single CLRSTATUS.
    app.push_status(STATUS_OK, DfuState::DfuIdle);
    app.push_status(STATUS_ERR_WRITE, DfuState::DfuError);
    app.push_status(STATUS_ERR_WRITE, DfuState::DfuError);

    let mut store = MemoryStore::new();
    store.set(STATE_KEY, "prompt_refresh_2").unwrap();
    store.set(SERIAL_KEY, SERIAL).unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, store, config(), firmware(100), &observer);

    assert_eq!(session.resume().unwrap(), HandleResult::Failed);
    assert_eq!(session.state(), FlashState::Error);
    assert_eq!(app.class_requests(DFU_CLRSTATUS).len(), 1);
    assert!(session.device().is_none());
    let (level, message) = observer.last_status().unwrap();
    assert_eq!(level, LogLevel::Error);
    assert!(message.starts_with("Flashing process failed"), "{message}");

    // The next user action resets the session.
    assert_eq!(session.click().unwrap(), HandleResult::Idle);
    assert_eq!(session.state(), FlashState::Idle);
    assert_eq!(session.store().get(STATE_KEY), None);
}

#[test]
fn test_attempt_ceiling_parks_in_error() {
    let provider = MockProvider::new();
    provider.fail_requests(Some(RequestError::Cancelled));
    let mut store = MemoryStore::new();
    store.set(STATE_KEY, "prompt_connect_stage2").unwrap();
    store.set(SERIAL_KEY, SERIAL).unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, store, config(), firmware(64), &observer);

    for _ in 0..5 {
        assert_eq!(session.click().unwrap(), HandleResult::AwaitUser);
        assert_eq!(session.state(), FlashState::PromptConnectStage2);
    }
    assert_eq!(provider.request_calls(), 5);
    let enumerations = provider.enumerate_calls();

    assert_eq!(session.click().unwrap(), HandleResult::Failed);
    assert_eq!(session.state(), FlashState::Error);
    assert_eq!(provider.request_calls(), 5);
    assert_eq!(provider.enumerate_calls(), enumerations);
    let (_, message) = observer.last_status().unwrap();
    assert!(message.contains("Maximum connection attempts (5) exceeded"), "{message}");
}

#[test]
fn test_serial_less_state_loads_idle() {
    let provider = MockProvider::new();
    let mut store = MemoryStore::new();
    store.set(STATE_KEY, "waiting_stable").unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let session = open_session(&provider, store, config(), firmware(64), &observer);

    assert_eq!(session.state(), FlashState::Idle);
    assert_eq!(session.store().get(STATE_KEY), None);
}

#[test]
fn test_revoked_grant_falls_back_to_prompt() {
    let provider = MockProvider::new();
    let stage1 = stage1_device(&provider);
    provider.offer(&stage1);
    let observer = Arc::new(RecordingObserver::new());
    let config = SessionConfig {
        verify_on_restore: false,
        ..config()
    };
    let mut session = open_session(&provider, MemoryStore::new(), config, firmware(64), &observer);
    assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);

    // Grants do not survive the restart on this host.
    provider.revoke_all();
    let stage2 = stage2_device(&provider);
    provider.offer(&stage2);
    assert_eq!(session.reload().unwrap(), HandleResult::AwaitUser);
    assert_eq!(session.state(), FlashState::PromptConnectStage2);
    assert_eq!(provider.request_calls(), 1);

    assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);
    assert_eq!(session.state(), FlashState::PromptRefresh2);
    assert_eq!(session.serial(), SERIAL);
}

#[test]
fn test_verification_downgrades_restored_state() {
    let provider = MockProvider::new();
    let stage1 = stage1_device(&provider);
    provider.offer(&stage1);
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, MemoryStore::new(), config(), firmware(64), &observer);
    assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);

    provider.revoke_all();
    assert_eq!(session.reload().unwrap(), HandleResult::AwaitUser);
    assert_eq!(session.state(), FlashState::PromptConnectStage2);
    assert_eq!(
        session.store().get(STATE_KEY).as_deref(),
        Some("prompt_connect_stage2")
    );
    assert!(
        observer
            .messages(LogLevel::Warning)
            .iter()
            .any(|m| m.contains("no longer permitted"))
    );
}

#[test]
fn test_wrong_stage1_identity_resets() {
    let provider = MockProvider::new();
    let app = app_device(&provider);
    provider.offer(&app);
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, MemoryStore::new(), config(), firmware(64), &observer);

    assert_eq!(session.click().unwrap(), HandleResult::Idle);
    assert_eq!(session.state(), FlashState::Idle);
    assert!(session.device().is_none());
    assert!(app.class_requests(DFU_DETACH).is_empty());
    assert_eq!(session.store().get(STATE_KEY), None);
    let (level, message) = observer.last_status().unwrap();
    assert_eq!(level, LogLevel::Error);
    assert!(message.starts_with("Wrong mode!"));
}

#[test]
fn test_cancelled_stage1_returns_to_idle() {
    let provider = MockProvider::new();
    provider.fail_requests(Some(RequestError::Cancelled));
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, MemoryStore::new(), config(), firmware(64), &observer);

    assert_eq!(session.click().unwrap(), HandleResult::Idle);
    assert_eq!(session.state(), FlashState::Idle);
    assert!(
        observer
            .messages(LogLevel::Warning)
            .iter()
            .any(|m| m.contains("No device selected"))
    );
}

#[test]
fn test_missing_firmware_blocks_start() {
    let provider = MockProvider::new();
    let stage1 = stage1_device(&provider);
    provider.offer(&stage1);
    let observer = Arc::new(RecordingObserver::new());
    let dir = tempfile::tempdir().unwrap();
    let dyn_observer: Arc<dyn FlashObserver> = observer.clone();
    let mut session = FlashSession::new(
        config(),
        provider.clone(),
        MemoryStore::new(),
        Box::new(FileFirmware::new(dir.path().join("missing.bin"))),
        dyn_observer,
    );

    assert_eq!(session.click().unwrap(), HandleResult::Idle);
    assert_eq!(session.state(), FlashState::Idle);
    assert_eq!(provider.request_calls(), 0);
    let (level, message) = observer.last_status().unwrap();
    assert_eq!(level, LogLevel::Error);
    assert!(message.starts_with("Firmware not available"));
}

#[test]
fn test_device_lost_while_flashing() {
    let provider = MockProvider::new();
    let app = app_device(&provider);
    provider.authorize(&app);
    app.push_status(STATUS_OK, DfuState::DfuIdle);
    app.push_status_error(TransportError::Disconnected);

    let mut store = MemoryStore::new();
    store.set(STATE_KEY, "flashing").unwrap();
    store.set(SERIAL_KEY, SERIAL).unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, store, config(), firmware(2048), &observer);
    assert_eq!(session.state(), FlashState::PromptRefresh2);

    assert_eq!(session.resume().unwrap(), HandleResult::Failed);
    assert_eq!(session.state(), FlashState::Error);
    assert_eq!(app.download_blocks(), vec![(0, 1024)]);

    assert_eq!(session.reset().unwrap(), HandleResult::Idle);
    assert_eq!(session.state(), FlashState::Idle);
}

#[test]
fn test_unplug_of_bound_device_is_tolerated_while_waiting() {
    let provider = MockProvider::new();
    let stage2 = stage2_device(&provider);
    provider.authorize(&stage2);
    let mut store = MemoryStore::new();
    store.set(STATE_KEY, "prompt_refresh_1").unwrap();
    store.set(SERIAL_KEY, SERIAL).unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let mut session = open_session(&provider, store, config(), firmware(64), &observer);

    assert_eq!(session.resume().unwrap(), HandleResult::AwaitReload);
    assert!(session.device().is_some());

    let unrelated = provider.builder().serial(Some("OTHER")).build();
    unrelated.unplug();
    assert_eq!(session.tick().unwrap(), HandleResult::Ignored);
    assert!(session.device().is_some());

    stage2.unplug();
    assert_eq!(session.tick().unwrap(), HandleResult::Ignored);
    assert!(session.device().is_none());
    assert_eq!(session.state(), FlashState::PromptRefresh2);
    assert!(
        observer
            .events()
            .iter()
            .any(|e| matches!(e, FlashEvent::DeviceDisconnected))
    );
}

#[test]
fn test_state_survives_a_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.toml");
    let provider = MockProvider::new();
    let stage1 = stage1_device(&provider);
    provider.offer(&stage1);
    let observer = Arc::new(RecordingObserver::new());

    {
        let store = FileStore::open(&path).unwrap();
        let mut session = open_session(&provider, store, config(), firmware(64), &observer);
        assert_eq!(session.click().unwrap(), HandleResult::AwaitReload);
    }

    let stage2 = stage2_device(&provider);
    provider.authorize(&stage2);
    let store = FileStore::open(&path).unwrap();
    let mut session = open_session(&provider, store, config(), firmware(64), &observer);
    assert_eq!(session.state(), FlashState::PromptRefresh1);
    assert_eq!(session.serial(), SERIAL);
    assert_eq!(session.resume().unwrap(), HandleResult::AwaitReload);
    assert_eq!(session.state(), FlashState::PromptRefresh2);
}
