mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dfu_core::connection::Connector;
use dfu_core::descriptor::find_dfu_interfaces;
use dfu_core::dfu::DfuDevice;
use dfu_core::events::FlashObserver;
use dfu_core::firmware::{FileFirmware, FirmwareSource};
use dfu_core::session::{FlashSession, SessionConfig};
use dfu_core::state::store::{self, SERIAL_KEY, STATE_KEY};
use dfu_core::state::{FileStore, FlashState, HandleResult, SessionStore};
use dfu_core::transport::{DeviceFilter, NusbDevice, NusbProvider, UsbDevice};
use dfu_core::DfuError;
use directories::ProjectDirs;
use tracing::{error, info, warn};

use crate::ui::{PromptChooser, TerminalObserver};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB DFU flasher for two-stage bootloaders (Pure Rust)", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the session state and device grants
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// USB vendor id of the target (hex with 0x prefix, or decimal)
    #[arg(long, global = true, value_parser = parse_u16)]
    vendor_id: Option<u16>,

    /// Pick the only matching device without asking
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or continue) the two-stage flash flow
    Flash {
        /// Firmware image written in the final stage
        #[arg(short, long)]
        firmware: Option<PathBuf>,

        /// Stop at each restart prompt instead of continuing in-process
        #[arg(long)]
        no_reload: bool,

        /// Trust the stored state without checking the device grant
        #[arg(long)]
        no_verify: bool,
    },
    /// Show the stored session state
    Status,
    /// Forget the stored session state
    Reset {
        /// Also forget every device grant
        #[arg(long)]
        grants: bool,
    },
    /// List attached DFU devices
    List,
    /// Send DETACH to a device and wait for it to leave the bus
    Detach {
        #[arg(long)]
        serial: Option<String>,
    },
    /// Plain DFU download to one device, without the staged flow
    Download {
        firmware: PathBuf,
        #[arg(long)]
        serial: Option<String>,
    },
    /// Read the device memory into a file
    Upload {
        output: PathBuf,
        /// Stop after this many bytes
        #[arg(long)]
        size: Option<usize>,
        #[arg(long)]
        serial: Option<String>,
    },
    /// Print the effective configuration, optionally saving it
    Config {
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id '{s}': {e}"))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let dirs = StateDirs::resolve(args.state_dir.as_deref())?;
    let mut config = load_config(args.config.as_deref(), &dirs)?;
    if let Some(vid) = args.vendor_id {
        config.vendor_id = vid;
    }
    let observer: Arc<dyn FlashObserver> = Arc::new(TerminalObserver::new(args.verbose));

    match args.command {
        Command::Flash {
            firmware,
            no_reload,
            no_verify,
        } => {
            if firmware.is_some() {
                config.firmware_path = firmware;
            }
            if no_verify {
                config.verify_on_restore = false;
            }
            cmd_flash(config, &dirs, args.yes, no_reload, observer)
        }
        Command::Status => cmd_status(&dirs),
        Command::Reset { grants } => cmd_reset(&dirs, grants),
        Command::List => cmd_list(config.vendor_id),
        Command::Detach { serial } => {
            let provider = provider(&dirs, args.yes)?;
            let device = pick_device(&provider, &config, serial, &observer)?;
            cmd_detach(&device, &config)
        }
        Command::Download { firmware, serial } => {
            let provider = provider(&dirs, args.yes)?;
            let device = pick_device(&provider, &config, serial, &observer)?;
            cmd_download(&device, &FileFirmware::new(firmware))
        }
        Command::Upload {
            output,
            size,
            serial,
        } => {
            let provider = provider(&dirs, args.yes)?;
            let device = pick_device(&provider, &config, serial, &observer)?;
            cmd_upload(&device, &output, size)
        }
        Command::Config { save } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if let Some(path) = save {
                config.save_to_file(&path)?;
                info!(path = %path.display(), "Configuration saved");
            }
            Ok(())
        }
    }
}

/// Where state survives between runs.
struct StateDirs {
    config: PathBuf,
    session: PathBuf,
    grants: PathBuf,
}

impl StateDirs {
    fn resolve(state_dir: Option<&Path>) -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "dfu-flash");
        let data = match (state_dir, &dirs) {
            (Some(dir), _) => dir.to_path_buf(),
            (None, Some(dirs)) => dirs.data_dir().to_path_buf(),
            (None, None) => bail!("No home directory found; pass --state-dir"),
        };
        let config = match &dirs {
            Some(dirs) => dirs.config_dir().join("config.toml"),
            None => data.join("config.toml"),
        };
        Ok(Self {
            config,
            session: data.join("session.toml"),
            grants: data.join("grants.toml"),
        })
    }
}

fn load_config(path: Option<&Path>, dirs: &StateDirs) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load_from_file(path),
        None if dirs.config.exists() => SessionConfig::load_from_file(&dirs.config),
        None => Ok(SessionConfig::default()),
    }
}

fn provider(dirs: &StateDirs, assume_yes: bool) -> Result<NusbProvider> {
    NusbProvider::new(
        Box::new(PromptChooser { assume_yes }),
        Some(dirs.grants.clone()),
    )
    .context("Failed to load device grants")
}

fn cmd_flash(
    config: SessionConfig,
    dirs: &StateDirs,
    assume_yes: bool,
    no_reload: bool,
    observer: Arc<dyn FlashObserver>,
) -> Result<()> {
    let firmware_path = config
        .firmware_path
        .clone()
        .ok_or_else(|| anyhow!("No firmware given; pass --firmware or set firmware_path"))?;
    let provider = provider(dirs, assume_yes)?;
    let store = FileStore::open(&dirs.session).context("Failed to open session state")?;
    let firmware: Box<dyn FirmwareSource> = Box::new(FileFirmware::new(firmware_path));
    info!(firmware = %firmware.describe(), "Starting flash session");

    let mut session = FlashSession::new(config, provider, store, firmware, observer);
    if session.state() == FlashState::Error {
        session.reset()?;
    }
    let mut result = if session.state().awaits_reload() {
        session.resume()?
    } else {
        session.click()?
    };

    loop {
        session.tick()?;
        result = match result {
            HandleResult::AwaitReload if no_reload => {
                eprintln!("{}", session.state().prompt());
                eprintln!("Run `dfu-flash flash` again once the device has restarted.");
                return Ok(());
            }
            HandleResult::AwaitReload => session.reload()?,
            HandleResult::AwaitUser => session.click()?,
            HandleResult::Complete => {
                session.finish()?;
                eprintln!("Update complete.");
                return Ok(());
            }
            HandleResult::Failed => bail!("Flashing failed; run `dfu-flash flash` again to retry"),
            HandleResult::Idle | HandleResult::Ignored => {
                warn!(state = %session.state(), "Flash flow stopped");
                return Ok(());
            }
        };
    }
}

fn cmd_status(dirs: &StateDirs) -> Result<()> {
    let store = FileStore::open(&dirs.session).context("Failed to open session state")?;
    let state = match store.get(STATE_KEY) {
        Some(tag) => tag.parse::<FlashState>()?,
        None => FlashState::Idle,
    };
    println!("State:  {state}");
    println!("Serial: {}", store.get(SERIAL_KEY).unwrap_or_else(|| "-".into()));
    println!("        {}", state.prompt());
    Ok(())
}

fn cmd_reset(dirs: &StateDirs, grants: bool) -> Result<()> {
    let mut store = FileStore::open(&dirs.session).context("Failed to open session state")?;
    store::clear_state(&mut store)?;
    if grants {
        NusbProvider::new(Box::new(PromptChooser { assume_yes: true }), Some(dirs.grants.clone()))?
            .forget_grants()?;
    }
    eprintln!("Session state cleared.");
    Ok(())
}

fn cmd_list(vendor_id: u16) -> Result<()> {
    let devices = NusbProvider::list_dfu_devices(Some(vendor_id))?;
    if devices.is_empty() {
        eprintln!("No DFU devices with vendor id {vendor_id:04X} found.");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:04X}:{:04X} {} (serial {})",
            device.vendor_id(),
            device.product_id(),
            device.product_name().as_deref().unwrap_or("Unknown"),
            device.serial_number().as_deref().unwrap_or("N/A")
        );
        match device.configurations() {
            Ok(configs) => {
                for settings in find_dfu_interfaces(&configs) {
                    println!("    {settings}");
                }
            }
            Err(e) => println!("    (descriptors unavailable: {e})"),
        }
    }
    Ok(())
}

fn pick_device(
    provider: &NusbProvider,
    config: &SessionConfig,
    serial: Option<String>,
    observer: &Arc<dyn FlashObserver>,
) -> Result<DfuDevice<NusbDevice>> {
    let filter = DeviceFilter::with_serial(config.vendor_id, serial);
    let mut connector = Connector::new(1, Duration::from_millis(config.open_delay_ms));
    connector
        .attempt(provider, &filter, true, observer)
        .into_result()
        .context("Could not connect to a DFU device")
}

fn cmd_detach(device: &DfuDevice<NusbDevice>, config: &SessionConfig) -> Result<()> {
    match device.detach() {
        Ok(()) => {}
        Err(e) if e.is_device_gone() => {}
        Err(e) => return Err(e).context("DETACH failed"),
    }
    match device.wait_disconnected(Duration::from_millis(config.disconnect_timeout_ms)) {
        Ok(()) => eprintln!("Device detached."),
        Err(DfuError::DisconnectTimeout { timeout_ms }) => {
            warn!(timeout_ms, "Device did not disconnect after DETACH");
            eprintln!("Device still present after {timeout_ms}ms.");
        }
        Err(e) => return Err(e.into()),
    }
    device.close();
    Ok(())
}

fn cmd_download(device: &DfuDevice<NusbDevice>, firmware: &FileFirmware) -> Result<()> {
    let data = firmware.load()?;
    let properties = *device.properties();
    if !properties.can_download {
        warn!("Device does not advertise download support, trying anyway");
    }
    device
        .do_download(
            properties.effective_transfer_size(),
            &data,
            properties.manifestation_tolerant,
        )
        .with_context(|| format!("Download of {} failed", firmware.describe()))?;
    device.close();
    eprintln!("Wrote {} bytes.", data.len());
    Ok(())
}

fn cmd_upload(device: &DfuDevice<NusbDevice>, output: &Path, size: Option<usize>) -> Result<()> {
    let properties = *device.properties();
    if !properties.can_upload {
        bail!("Device does not support upload");
    }
    let first_block = if device.variant().is_dfuse() { 2 } else { 0 };
    let data = device.do_upload(properties.effective_transfer_size(), size, first_block)?;
    device.close();
    std::fs::write(output, &data)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    eprintln!("Read {} bytes into {}.", data.len(), output.display());
    Ok(())
}
