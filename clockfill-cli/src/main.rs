//! Clockfill CLI
//!
//! Drives the attendance auto-filler through the browser extension bridge.
//!
//! Usage from workspace root:
//!   cargo run --bin clockfill -- run --clock-in 09:00 --clock-out 17:30
//!   cargo run --bin clockfill -- run --randomize 10 --break-start 12:00
//!   cargo run --bin clockfill -- serve       # Answer popup requests relayed by the extension
//!   cargo run --bin clockfill -- settings    # Show the effective settings

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clockfill::automation::{ProgressState, RunResult};
use clockfill::extension_bridge::ExtensionBridge;
use clockfill::messages::RelayMessage;
use clockfill::platforms::BridgeEngine;
use clockfill::{AutomationController, Page, Settings};
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "clockfill")]
#[command(about = "⏱️ Clockfill - fills missing clock-in/clock-out entries")]
#[command(
    long_about = "Clockfill walks the attendance grid of the page open in the browser, opens every row flagged with a missing-entry warning, fills in the shift times and saves it."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct SettingsArgs {
    /// Settings file (defaults to <config dir>/clockfill/settings.json)
    #[clap(long, short = 's', env = "CLOCKFILL_SETTINGS")]
    settings: Option<PathBuf>,

    /// Address the extension bridge listens on
    #[clap(long, env = "CLOCKFILL_ADDR")]
    addr: Option<String>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: SettingsArgs,

    /// Clock-in time, HH:MM
    #[clap(long)]
    clock_in: Option<String>,

    /// Clock-out time, HH:MM
    #[clap(long)]
    clock_out: Option<String>,

    /// Shift both times by up to this many minutes per row
    #[clap(long, value_name = "MINUTES")]
    randomize: Option<u32>,

    /// Split each day around a break starting at HH:MM
    #[clap(long)]
    break_start: Option<String>,

    /// Break length in minutes (used with --break-start or a stored break)
    #[clap(long, value_name = "MINUTES")]
    break_minutes: Option<u32>,

    /// Seed for the randomizer, for reproducible runs
    #[clap(long)]
    seed: Option<u64>,

    /// Seconds to wait for the extension to connect
    #[clap(long, default_value_t = 30)]
    connect_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill every flagged row once, then exit
    Run(RunArgs),
    /// Serve run and cancel requests coming from the extension popup
    Serve(SettingsArgs),
    /// Print the effective settings as JSON
    Settings(SettingsArgs),
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_settings(args: &SettingsArgs) -> Result<Settings> {
    let mut settings = Settings::load(args.settings.as_deref()).context("Failed to load settings")?;
    if let Some(addr) = &args.addr {
        settings.bridge_addr = addr.clone();
    }
    Ok(settings)
}

fn apply_overrides(settings: &mut Settings, args: &RunArgs) {
    if let Some(clock_in) = &args.clock_in {
        settings.clock_in = clock_in.clone();
    }
    if let Some(clock_out) = &args.clock_out {
        settings.clock_out = clock_out.clone();
    }
    if let Some(minutes) = args.randomize {
        settings.randomize_enabled = minutes > 0;
        settings.randomize_minutes = minutes;
    }
    if let Some(start) = &args.break_start {
        settings.break_enabled = true;
        settings.break_start = start.clone();
    }
    if let Some(minutes) = args.break_minutes {
        settings.break_duration_minutes = minutes;
    }
}

fn print_progress(state: &ProgressState) {
    println!(
        "   {} {}/{} rows ({} saved)",
        "•".cyan(),
        state.completed,
        state.total,
        state.saved
    );
}

async fn run(args: RunArgs) -> Result<()> {
    let mut settings = load_settings(&args.common)?;
    apply_overrides(&mut settings, &args);
    let shift = settings
        .to_run_payload()
        .into_shift_settings()
        .context("Invalid shift settings")?;

    let bridge = Arc::new(
        ExtensionBridge::start(&settings.bridge_addr)
            .await
            .context("Failed to start extension bridge")?,
    );
    println!(
        "🔌 Waiting for the extension on {}...",
        bridge.local_addr().to_string().bold()
    );
    let page = Page::connect(bridge, Duration::from_secs(args.connect_timeout)).await?;

    let mut session = page.session(shift);
    if let Some(seed) = args.seed {
        session = session.with_seed(seed);
    }

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping after the current row");
            token.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressState>();
    let printer = tokio::spawn(async move {
        while let Some(state) = progress_rx.recv().await {
            print_progress(&state);
        }
    });

    println!("🚀 Filling attendance rows...");
    let outcome = session.run(&progress_tx).await;
    drop(progress_tx);
    let _ = printer.await;

    let result = outcome.context("Automation failed")?;
    let icon = if result.cancelled {
        "⏹️".yellow()
    } else {
        "✅".green()
    };
    println!("{icon} {}", summary(&result, &session.progress()));
    Ok(())
}

/// Rows attempted come from progress; the result only counts saved rows.
fn summary(result: &RunResult, progress: &ProgressState) -> String {
    if result.cancelled {
        format!(
            "Cancelled after {} rows ({} saved)",
            progress.completed, result.processed_count
        )
    } else {
        format!(
            "Done: {} rows attempted, {} saved",
            progress.completed, result.processed_count
        )
    }
}

async fn serve(args: SettingsArgs) -> Result<()> {
    let settings = load_settings(&args)?;
    let bridge = Arc::new(
        ExtensionBridge::start(&settings.bridge_addr)
            .await
            .context("Failed to start extension bridge")?,
    );
    let mut requests = bridge
        .take_requests()
        .await
        .context("Request queue already taken")?;
    let controller = AutomationController::new(Arc::new(BridgeEngine::new(bridge.clone())));

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<RelayMessage>();
    let forwarder = tokio::spawn({
        let bridge = bridge.clone();
        async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = bridge.broadcast(&message).await {
                    warn!(error = %e, "Failed to relay message to the extension");
                }
            }
        }
    });

    println!(
        "🛰️ Serving popup requests on {} (Ctrl-C to stop)",
        bridge.local_addr().to_string().bold()
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    warn!("Request queue closed");
                    break;
                };
                info!(request_id = %request.request_id(), "Relay request received");
                // Off the loop, so a cancel can reach an active run.
                let controller = controller.clone();
                let outgoing = outgoing_tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = controller.handle(request, outgoing.clone()).await {
                        let _ = outgoing.send(reply.into());
                    }
                });
            }
        }
    }

    drop(outgoing_tx);
    forwarder.abort();
    Ok(())
}

fn show_settings(args: SettingsArgs) -> Result<()> {
    let settings = load_settings(&args)?;
    match args.settings.clone().or_else(Settings::default_path) {
        Some(path) => eprintln!("📄 {}", path.display()),
        None => eprintln!("📄 (no settings location on this platform)"),
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Serve(args) => serve(args).await,
        Commands::Settings(args) => show_settings(args),
    }
}
