mod config;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dvb_device::upload::image_info;
use dvb_device::{DeviceEvent, DeviceSession, InboundMessage, UploadOutcome};
use dvb_transport_ble::BtleplugGatt;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

type Session = DeviceSession<BtleplugGatt>;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "DVB_CLI_CONFIG")]
    config: Option<PathBuf>,
    /// Advertised name prefix to connect to
    #[arg(long)]
    prefix: Option<String>,
    /// Connect to this address instead of the strongest matching name
    #[arg(long)]
    address: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby units
    Scan,
    /// Print version and hash from a local image header
    ImageInfo { image: PathBuf },
    #[command(flatten)]
    Session(SessionCommand),
}

/// Commands that run against a connected unit.
#[derive(Subcommand)]
enum SessionCommand {
    /// Print device information
    Info,
    /// List stored files
    List,
    /// Download a stored file
    Download {
        name: String,
        /// Output path, defaults to the file name
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Upload a firmware image
    Upload {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        slot: u32,
    },
    /// Query image slots
    ImageState,
    /// Send an echo request
    Echo { message: String },
    /// Reboot the unit
    Reset,
    /// Erase the standby image slot
    Erase,
    /// Mark an image for a test boot
    Test { hash: String },
    /// Mark an image as permanent
    Confirm { hash: String },
    /// Run the registration challenge
    Verify,
    /// Start accelerometer calibration
    CalibrateAccel,
    /// Start magnetometer calibration
    CalibrateMagn,
    /// Run the on-device hardware test
    TestHardware,
    /// Erase all stored files
    Format,
    /// Change the short name
    SetName { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut cfg = CliConfig::new(cli.config).context("loading configuration")?;
    if let Some(prefix) = cli.prefix {
        cfg.name_prefix = prefix;
    }
    if let Some(address) = cli.address {
        cfg.address = Some(address);
    }

    match cli.command {
        Commands::ImageInfo { image } => print_image_info(&image).await,
        Commands::Scan => scan(&cfg).await,
        Commands::Session(command) => run(&cfg, command).await,
    }
}

async fn print_image_info(path: &Path) -> Result<()> {
    let image = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let info = image_info(&image)?;
    println!("version: {}", info.version);
    println!("hash:    {}", info.hash_hex());
    Ok(())
}

async fn scan(cfg: &CliConfig) -> Result<()> {
    let gatt = BtleplugGatt::new(cfg.transport_config()).await?;
    let devices = gatt.discover(&cfg.target()).await?;
    if devices.is_empty() {
        println!("no units found");
    }
    for device in devices {
        println!(
            "{}  {:<20}  {}",
            device.address,
            device.name.as_deref().unwrap_or("-"),
            device
                .rssi
                .map_or_else(|| "-".to_string(), |rssi| format!("{rssi} dBm"))
        );
    }
    Ok(())
}

async fn run(cfg: &CliConfig, command: SessionCommand) -> Result<()> {
    let gatt = BtleplugGatt::new(cfg.transport_config()).await?;
    let session = DeviceSession::new(gatt, cfg.target(), cfg.device_config()?);
    let printer = tokio::spawn(print_events(session.subscribe()));

    session.connect().await.context("connecting to unit")?;
    let result = execute(&session, cfg, command).await;
    if let Err(err) = session.disconnect().await {
        warn!(error = %err, "disconnect failed");
    }
    printer.abort();
    result
}

async fn execute(session: &Session, cfg: &CliConfig, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::Info => {
            session.set_device_info().await;
            let info = session.device_info();
            let manufacturer = session.read_manufacturer_serial().await.ok();
            print_field("name", session.device_name());
            print_field("short name", info.short_name);
            print_field("serial", info.serial_number);
            print_field("manufacturer serial", manufacturer);
            print_field("hardware", info.hardware_version);
            print_field("firmware", info.firmware_version);
            print_field("device uid", info.device_uid);
            println!("files: {}", session.file_list().len());
        }
        SessionCommand::List => {
            for entry in session.list_files().await {
                println!("{:<32} {:>10}", entry.name, entry.length);
            }
        }
        SessionCommand::Download { name, output } => {
            session.list_files().await;
            let data = session
                .download_file(&name, |pct| eprint!("\rdownloading {name}: {pct:3}%"))
                .await?;
            eprintln!();
            let path = output.unwrap_or_else(|| PathBuf::from(&name));
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{} bytes written to {}", data.len(), path.display());
        }
        SessionCommand::Upload { image, slot } => upload(session, image, slot).await?,
        SessionCommand::ImageState => {
            smp_round_trip(session, cfg, |s| s.query_image_state()).await?
        }
        SessionCommand::Echo { message } => {
            smp_round_trip(session, cfg, |s| s.echo(message.clone())).await?
        }
        SessionCommand::Reset => session.reset_device().await?,
        SessionCommand::Erase => smp_round_trip(session, cfg, |s| s.erase_image()).await?,
        SessionCommand::Test { hash } => {
            let hash = hex::decode(hash.trim()).context("hash must be hex")?;
            smp_round_trip(session, cfg, |s| s.test_image(&hash)).await?
        }
        SessionCommand::Confirm { hash } => {
            let hash = hex::decode(hash.trim()).context("hash must be hex")?;
            smp_round_trip(session, cfg, |s| s.confirm_image(&hash)).await?
        }
        SessionCommand::Verify => {
            if !session.verify_device().await? {
                bail!("unit failed registration verification");
            }
            println!("unit verified");
        }
        SessionCommand::CalibrateAccel => session.calibrate_accelerometer().await?,
        SessionCommand::CalibrateMagn => session.calibrate_magnetometer().await?,
        SessionCommand::TestHardware => session.test_hardware().await?,
        SessionCommand::Format => session.format_storage().await?,
        SessionCommand::SetName { name } => session.write_short_name(&name).await?,
    }
    Ok(())
}

fn print_field(label: &str, value: Option<String>) {
    println!("{label:>20}: {}", value.as_deref().unwrap_or("-"));
}

/// Sends an SMP request and waits for the first forwarded reply.
async fn smp_round_trip<'a, F, Fut>(session: &'a Session, cfg: &CliConfig, send: F) -> Result<()>
where
    F: FnOnce(&'a Session) -> Fut,
    Fut: std::future::Future<Output = Result<(), dvb_device::DeviceError>>,
{
    let mut events = session.subscribe();
    send(session).await?;
    match tokio::time::timeout(cfg.response_timeout, next_message(&mut events)).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => bail!("event stream closed before a reply arrived"),
        Err(_) => bail!("no reply within {:?}", cfg.response_timeout),
    }
}

async fn next_message(events: &mut broadcast::Receiver<DeviceEvent>) -> Option<InboundMessage> {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Message(message)) => return Some(message),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn upload(session: &Session, path: PathBuf, slot: u32) -> Result<()> {
    let image = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    match image_info(&image) {
        Ok(info) => info!(version = %info.version, hash = %info.hash_hex(), "image header"),
        Err(err) => warn!(error = %err, "image header unreadable"),
    }

    let mut events = session.subscribe();
    session.start_upload(image, slot).await?;
    loop {
        match events.recv().await {
            Ok(DeviceEvent::UploadFinished(outcome)) => {
                eprintln!();
                return match outcome {
                    UploadOutcome::Completed => {
                        println!("upload complete");
                        Ok(())
                    }
                    UploadOutcome::Rejected { rc } => bail!("unit rejected upload (rc {rc})"),
                    UploadOutcome::Failed(reason) => bail!("upload failed: {reason}"),
                };
            }
            Ok(DeviceEvent::UploadProgress { percentage }) => {
                eprint!("\ruploading: {percentage:3}%");
            }
            Ok(DeviceEvent::Disconnected) => bail!("unit disconnected during upload"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Message(message)) => print_message(&message),
            Ok(DeviceEvent::Connected) => info!("connected"),
            Ok(DeviceEvent::Disconnected) => info!("disconnected"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_message(message: &InboundMessage) {
    println!(
        "op={} group={} id={} seq={} len={}",
        message.op, message.group, message.id, message.seq, message.length
    );
    if let Some(body) = &message.body {
        println!("{body:#?}");
    }
}
