use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

use keepkey_core::session::{PinState, RecoveryAction, RecoveryState};
use keepkey_core::usb_monitor::{DeviceEnumerator, RusbEnumerator, WatcherMessage};
use keepkey_core::{CoreConfig, KeepKeyService, SessionKind};

#[derive(Parser)]
#[command(name = "kkq", version, about = "Inspect and drive KeepKey devices through the device queue")]
struct Cli {
    /// JSON config file; defaults plus KEEPKEY_* overrides otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected KeepKeys with their firmware state
    List,
    /// Print the features snapshot of one device as JSON
    Features { device_id: String },
    /// Follow connect/disconnect and queue events until Ctrl-C
    Watch,
    /// Show the command queue of one device
    Status { device_id: String },
    /// Unlock with the scrambled PIN matrix, reading positions from stdin
    Unlock { device_id: String },
    /// Check a recovery sentence against the device, reading characters from stdin
    VerifySeed {
        device_id: String,
        #[arg(long, default_value_t = 12)]
        words: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::from_env()?,
    };

    match cli.command {
        Commands::Watch => watch(config).await,
        Commands::List => list(&connect(config).await?).await,
        Commands::Features { device_id } => features(&connect(config).await?, &device_id).await,
        Commands::Status { device_id } => status(&connect(config).await?, &device_id),
        Commands::Unlock { device_id } => unlock(&connect(config).await?, &device_id).await,
        Commands::VerifySeed { device_id, words } => {
            verify_seed(&connect(config).await?, &device_id, words).await
        }
    }
}

/// Build the service and register whatever is plugged in right now.
/// One-shot commands fetch features themselves.
async fn connect(mut config: CoreConfig) -> Result<KeepKeyService> {
    config.watcher.fetch_features_on_connect = false;
    let service = KeepKeyService::usb(config)?;
    let devices = tokio::task::spawn_blocking(|| RusbEnumerator.enumerate()).await??;
    for device in devices {
        service
            .registry()
            .apply_watcher_message(WatcherMessage::Arrived(device));
    }
    Ok(service)
}

async fn list(service: &KeepKeyService) -> Result<()> {
    let devices = service.list_connected_devices();
    if devices.is_empty() {
        println!("No KeepKey devices found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Device ID", "Bus:Address", "Product", "FW Version", "Bootloader", "State"]);

    for device in devices {
        let id = device.unique_id.to_string();
        let (version, bootloader, state) = match service.refresh_features(&id).await {
            Ok(features) => {
                let state = match service.highest_priority_action(&id) {
                    Some(action) => action.message,
                    None if features.needs_pin() => "Locked".to_string(),
                    None => "Ready".to_string(),
                };
                let bootloader = if features.bootloader_mode { "Yes" } else { "No" };
                (features.version, bootloader.to_string(), state)
            }
            Err(e) => ("<n/a>".to_string(), "?".to_string(), format!("Err: {}", e)),
        };
        table.add_row([
            id,
            format!("{}:{}", device.bus, device.address),
            device.product.unwrap_or_else(|| "KeepKey".to_string()),
            version,
            bootloader,
            state,
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn features(service: &KeepKeyService, device_id: &str) -> Result<()> {
    let features = service.get_device_features_by_id(device_id).await?;
    println!("{}", serde_json::to_string_pretty(&features)?);
    Ok(())
}

fn status(service: &KeepKeyService, device_id: &str) -> Result<()> {
    let status = service.get_queue_status(device_id)?;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Device ID", "Queued", "Processing", "Last response", "Avg wait (ms)", "Avg RTT (ms)"]);
    let last = status
        .last_response
        .as_ref()
        .map(|r| format!("{} -> {} ({} ms)", r.operation, r.outcome, r.elapsed_ms))
        .unwrap_or_else(|| "-".to_string());
    let ms = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
    table.add_row([
        status.device_id.clone(),
        status.queue_length.to_string(),
        status.processing.to_string(),
        last,
        ms(status.avg_queue_wait_ms),
        ms(status.avg_device_rtt_ms),
    ]);
    println!("{table}");
    Ok(())
}

async fn watch(config: CoreConfig) -> Result<()> {
    let service = KeepKeyService::usb(config)?;
    let mut events = service.subscribe();
    service.start_usb_monitor();
    println!("Watching for KeepKey devices (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    eprintln!("(missed {missed} events)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    service.stop();
    Ok(())
}

type Input = Lines<BufReader<Stdin>>;

async fn prompt(input: &mut Input, text: &str) -> Result<String> {
    eprint!("{text}");
    input
        .next_line()
        .await?
        .map(|line| line.trim().to_string())
        .ok_or_else(|| anyhow!("stdin closed"))
}

/// Positions as shown on the device: 7 8 9 / 4 5 6 / 1 2 3.
fn parse_positions(line: &str) -> Vec<u8> {
    line.chars()
        .filter_map(|c| c.to_digit(10))
        .map(|d| d as u8)
        .collect()
}

async fn unlock(service: &KeepKeyService, device_id: &str) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let started = service.start_pin_unlock(device_id).await?;
    let mut next_step = started.next_step;

    if started.state == PinState::AwaitingPositions {
        loop {
            let line = prompt(&mut input, "PIN positions (matrix as shown on device): ").await?;
            match service.send_pin_unlock_response(started.session_id, &parse_positions(&line)).await {
                Ok(result) if result.success => {
                    next_step = result.next_step;
                    break;
                }
                Ok(result) => eprintln!("PIN rejected: {}", result.error.unwrap_or_default()),
                Err(e) if e.is_recoverable() => eprintln!("{e}"),
                Err(e) => {
                    service.cancel_pin_unlock(started.session_id).await?;
                    return Err(e.into());
                }
            }
        }
    }

    if next_step == Some(SessionKind::Passphrase) {
        let session = service.start_passphrase(device_id).await?;
        let passphrase = prompt(&mut input, "Passphrase: ").await?;
        let result = service.send_passphrase(session.session_id, &passphrase).await?;
        if !result.success {
            bail!("passphrase rejected: {}", result.error.unwrap_or_default());
        }
    }

    println!("{device_id} unlocked");
    Ok(())
}

async fn verify_seed(service: &KeepKeyService, device_id: &str, words: u32) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let started = service
        .start_seed_verification(device_id, words)
        .await
        .context("starting seed verification")?;
    let session_id = started.session_id;

    if started.state == RecoveryState::AwaitingPin {
        let line = prompt(&mut input, "PIN positions: ").await?;
        let progress = service.send_verification_pin(session_id, &parse_positions(&line)).await?;
        if progress.is_complete {
            bail!("PIN rejected: {}", progress.error.unwrap_or_default());
        }
    }

    eprintln!("Type the letter the device shows for each position; 'space', 'delete' or 'done' for controls");
    loop {
        let line = prompt(&mut input, "> ").await?;
        let (character, action) = match line.to_lowercase().as_str() {
            "space" | " " => (None, Some(RecoveryAction::Space)),
            "delete" | "del" => (None, Some(RecoveryAction::Delete)),
            "done" => (None, Some(RecoveryAction::Done)),
            _ => (Some(line.clone()), None),
        };

        let progress = match service
            .send_verification_character(session_id, character.as_deref(), action)
            .await
        {
            Ok(progress) => progress,
            Err(e) if e.is_recoverable() => {
                eprintln!("{e}");
                continue;
            }
            Err(e) => {
                service.cancel_seed_verification(session_id).await?;
                return Err(e.into());
            }
        };

        if progress.is_complete {
            return match progress.state {
                RecoveryState::Verified => {
                    println!("Recovery sentence matches the device");
                    Ok(())
                }
                _ => bail!("verification failed: {}", progress.error.unwrap_or_default()),
            };
        }
        eprintln!(
            "word {} char {}{}",
            progress.word_pos + 1,
            progress.character_pos + 1,
            if progress.auto_completed { " (auto-completed)" } else { "" }
        );
    }
}
