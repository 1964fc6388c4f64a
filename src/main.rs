//! Command line companion for the AR glasses.
//!
//! Connects over BLE, then uploads files, pulls camera frames, sends
//! commands or runs headless (idle poll, device-requested processing and
//! backend command relay) until Ctrl-C.

use anyhow::Context;
use ar_glass_companion::application::collaborators::{
    DirectoryBackend, PassthroughEnhancer, UnconfiguredAnalyzer, WholeFrameSplitter,
};
use ar_glass_companion::application::{Collaborators, OrchestratorConfig, TransferOrchestrator};
use ar_glass_companion::domain::models::{AppEvent, FileKind, MessageSeverity};
use ar_glass_companion::domain::prompts::PromptBook;
use ar_glass_companion::domain::settings::SettingsService;
use ar_glass_companion::infrastructure::bluetooth::acquisition::Acquired;
use ar_glass_companion::infrastructure::bluetooth::command::PendingCommand;
use ar_glass_companion::infrastructure::bluetooth::platform::BtleplugTransport;
use ar_glass_companion::infrastructure::bluetooth::scanner::{self, BleScanner};
use ar_glass_companion::infrastructure::bluetooth::{LinkConfig, LinkHandle, LinkService};
use ar_glass_companion::infrastructure::logging::init_logger;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "ar-glass")]
#[command(about = "BLE companion for the AR glasses")]
struct Cli {
    /// Device name or address (defaults to the last connected device)
    #[arg(short, long, global = true)]
    device: Option<String>,
    /// Settings file to use instead of the one in the config directory
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for glasses
    Scan {
        /// Scan duration in seconds
        #[arg(short = 't', long, default_value = "5")]
        duration: u64,
        /// List every BLE device in range
        #[arg(long)]
        all: bool,
    },
    /// Upload a music or novel file
    Upload {
        file: PathBuf,
        /// Storage area on the glasses (guessed from the extension when omitted)
        #[arg(short, long)]
        kind: Option<KindArg>,
        /// Full destination path, overrides --kind
        #[arg(long)]
        dest: Option<String>,
    },
    /// Take a picture with the glasses camera and save it
    Capture {
        #[arg(short, long, default_value = "capture.jpg")]
        out: PathBuf,
    },
    /// Send a command, e.g. `play_mp3 /music/a.mp3`
    Command {
        name: String,
        argument: Option<String>,
    },
    /// Read the battery level
    Battery,
    /// Capture a frame and run a processing job on it
    Process {
        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Stay connected and serve the glasses until Ctrl-C
    Run {
        /// Subject used for jobs the glasses request
        #[arg(short, long)]
        subject: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Music,
    Novel,
}

impl From<KindArg> for FileKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Music => FileKind::Music,
            KindArg::Novel => FileKind::Novel,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => SettingsService::load_or_default(path.clone()),
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Settings: {}", settings.path().display());

    if let Commands::Scan { duration, all } = cli.command {
        return scan(&settings, duration, all).await;
    }

    let (event_sender, events) = mpsc::unbounded_channel();
    let printer = tokio::spawn(log_events(events));

    let ble = settings.get().ble.clone();
    let config = LinkConfig::from_settings(settings.get())?;
    let transport = BtleplugTransport::new(
        Duration::from_millis(ble.scan_timeout_ms),
        ble.assumed_mtu,
        Some(event_sender.clone()),
    )
    .await?;
    let (link_sender, link_events) = mpsc::unbounded_channel();
    let (link, link_task) = LinkService::spawn(transport, config, link_sender);

    let device = cli
        .device
        .clone()
        .or_else(|| settings.get().last_connected_device.clone())
        .unwrap_or_else(|| ble.device_name.clone());
    info!("Connecting to {}", device);

    // `run` hands link events to the orchestrator, everything else just prints them
    let (mut link_events, relay) = if matches!(cli.command, Commands::Run { .. }) {
        (Some(link_events), None)
    } else {
        let relay = tokio::spawn(relay_events(link_events, event_sender.clone()));
        (None, Some(relay))
    };

    link.connect(&device)
        .await
        .with_context(|| format!("Could not connect to {}", device))?;
    if let Err(e) = settings.remember_device(&device) {
        warn!("Could not save settings: {:#}", e);
    }

    let result = match cli.command {
        Commands::Scan { .. } => Ok(()),
        Commands::Upload { file, kind, dest } => upload(&link, &file, kind, dest).await,
        Commands::Capture { out } => capture(&link, &out).await,
        Commands::Command { name, argument } => command(&link, name, argument).await,
        Commands::Battery => {
            let level = link.battery().await?;
            println!("Battery: {}%", level);
            Ok(())
        }
        Commands::Process { subject } => {
            let subject = subject.unwrap_or_else(|| settings.get().companion.default_subject.clone());
            let mut orchestrator = orchestrator(&settings, link.clone(), event_sender.clone(), None)?;
            let report = orchestrator.process(&subject).await?;
            println!(
                "{} image(s), {} region(s), {} analyzed, {} uploaded",
                report.images, report.regions, report.analyzed, report.uploaded
            );
            Ok(())
        }
        Commands::Run { subject } => {
            let orchestrator = orchestrator(&settings, link.clone(), event_sender.clone(), subject)?;
            match link_events.take() {
                Some(link_events) => {
                    info!("Serving the glasses, Ctrl-C to stop");
                    tokio::select! {
                        _ = orchestrator.run(link_events) => warn!("Link service ended"),
                        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                    }
                }
                None => error!("Link events already taken"),
            }
            Ok(())
        }
    };

    link.disconnect().await;
    drop(link);
    let _ = link_task.await;
    if let Some(relay) = relay {
        let _ = relay.await;
    }
    drop(event_sender);
    let _ = printer.await;

    result
}

async fn scan(settings: &SettingsService, duration: u64, all: bool) -> anyhow::Result<()> {
    let ble = &settings.get().ble;
    let adapter = scanner::default_adapter().await?;
    let (event_sender, events) = mpsc::unbounded_channel();
    let printer = tokio::spawn(log_events(events));
    let scanner = BleScanner::new(adapter, Some(event_sender));
    let devices = scanner
        .scan(
            Duration::from_secs(duration),
            &ble.device_name,
            all || ble.debug_show_all_devices,
        )
        .await;
    drop(scanner);
    let _ = printer.await;
    let devices = devices?;

    println!("Found {} device(s):", devices.len());
    for device in devices {
        let rssi = device
            .signal_strength
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", device.name, device.address, rssi);
    }
    Ok(())
}

async fn upload(
    link: &LinkHandle,
    file: &Path,
    kind: Option<KindArg>,
    dest: Option<String>,
) -> anyhow::Result<()> {
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("File name is not valid UTF-8")?;
    let destination = match (dest, kind) {
        (Some(dest), _) => dest,
        (None, Some(kind)) => FileKind::from(kind).destination(file_name),
        (None, None) => file
            .extension()
            .and_then(|e| e.to_str())
            .and_then(FileKind::from_extension)
            .map(|kind| kind.destination(file_name))
            .context("Cannot tell where to store this file, pass --kind or --dest")?,
    };

    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let report = link.upload(&destination, payload).await?;
    println!(
        "Uploaded {} bytes to {} in {} chunk(s)",
        report.bytes, report.destination, report.chunks
    );
    Ok(())
}

async fn capture(link: &LinkHandle, out: &Path) -> anyhow::Result<()> {
    match link.acquire_image().await? {
        Acquired::Image(image) => {
            tokio::fs::write(out, &image.data)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            if !image.jpeg_valid {
                warn!("The frame does not look like a complete JPEG");
            }
            println!("Saved {} bytes to {}", image.data.len(), out.display());
        }
        Acquired::Empty => println!("The glasses have no image"),
    }
    Ok(())
}

async fn command(link: &LinkHandle, name: String, argument: Option<String>) -> anyhow::Result<()> {
    let command = PendingCommand::raw(name, argument);
    if !command.is_known() {
        warn!("{} is not a known command, sending it anyway", command.name);
    }
    link.send_command(command.clone()).await?;
    println!("Sent {}", command.name);
    Ok(())
}

fn orchestrator(
    settings: &SettingsService,
    link: LinkHandle,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    subject: Option<String>,
) -> anyhow::Result<TransferOrchestrator> {
    let companion = &settings.get().companion;
    let mut config = OrchestratorConfig::from_settings(companion);
    if let Some(subject) = subject {
        config.default_subject = subject;
    }

    let results_dir = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ArGlassCompanion")
        .join("results");
    let collaborators = Collaborators {
        enhancer: Arc::new(PassthroughEnhancer),
        splitter: Arc::new(WholeFrameSplitter),
        analyzer: Arc::new(UnconfiguredAnalyzer),
        backend: Arc::new(DirectoryBackend::new(results_dir)?),
    };
    let prompts = PromptBook::load_or_builtin(companion.prompts_file.as_deref().map(Path::new));

    Ok(TransferOrchestrator::new(
        link,
        collaborators,
        prompts,
        config,
        event_sender,
    ))
}

async fn relay_events(
    mut link_events: mpsc::UnboundedReceiver<AppEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
) {
    while let Some(event) = link_events.recv().await {
        if event_sender.send(event).is_err() {
            break;
        }
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::LogMessage(message) => match message.severity {
                MessageSeverity::Error => error!("{}", message.message),
                MessageSeverity::Warning => warn!("{}", message.message),
                MessageSeverity::Info | MessageSeverity::Success => info!("{}", message.message),
            },
            AppEvent::ConnectionStatus(status) => info!("Link: {:?}", status),
            AppEvent::UploadProgress(progress) => debug!(
                "{}: {}/{} bytes",
                progress.destination, progress.sent, progress.total
            ),
            AppEvent::ImageReceived(summary) => info!(
                "Image received: {} bytes (jpeg {})",
                summary.size, summary.jpeg_valid
            ),
            AppEvent::DeviceStatus(status) => info!("Glasses: {}", status.as_str()),
            AppEvent::DeviceFound(device) => info!("Found {} ({})", device.name, device.address),
        }
    }
}
