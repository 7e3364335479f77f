use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use hebrew_doll::audio::{self, AlsaBackend};
use hebrew_doll::config::Config;
use hebrew_doll::controller::SessionController;
use hebrew_doll::net_link::{self, GeminiConnector, SessionSetup};
use hebrew_doll::persona::{self, Persona};

/// Real-time Hebrew speech-to-speech doll on the Gemini Live API
#[derive(Parser, Debug)]
#[command(name = "hebrew-doll", version, about)]
struct Cli {
    /// Configuration file (default: ./config.toml if present)
    #[arg(short, long, env = "HEBREW_DOLL_CONFIG")]
    config: Option<PathBuf>,

    /// Personality preset (see --list-personas)
    #[arg(short, long)]
    persona: Option<String>,

    /// Custom system instruction, overrides the persona
    #[arg(long, conflicts_with = "persona")]
    instruction: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// List ALSA PCM devices and exit
    #[arg(long)]
    list_devices: bool,

    /// List personality presets and exit
    #[arg(long)]
    list_personas: bool,

    /// Check the API key and connection (and list audio devices), then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration is needed before logging to honour app.debug.
    let config = Config::load(cli.config.as_deref());
    let debug = config.as_ref().map(|c| c.app.debug).unwrap_or(false);

    let filter = match cli.verbose + u8::from(debug) {
        0 => "info,hebrew_doll=info",
        1 => "info,hebrew_doll=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("✗ Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    if cli.list_personas {
        for p in persona::ALL {
            println!("{:<10} {}", p.name, p.title);
        }
        return Ok(());
    }

    if cli.list_devices {
        for dev in audio::list_devices().context("failed to enumerate audio devices")? {
            let kind = match (dev.capture, dev.playback) {
                (true, true) => "INPUT & OUTPUT",
                (true, false) => "INPUT",
                _ => "OUTPUT",
            };
            println!("{:<40} [{}] {}", dev.name, kind, dev.description);
        }
        return Ok(());
    }

    config.require_api_key()?;

    let instruction = match (cli.instruction, config.app.system_instruction.clone()) {
        (Some(text), _) => text,
        (None, Some(text)) if cli.persona.is_none() => text,
        _ => {
            let name = cli.persona.as_deref().unwrap_or(&config.app.persona);
            let preset = Persona::by_name(name)?;
            tracing::info!("Loading {} personality", preset.title);
            preset.instruction.to_string()
        }
    };

    tracing::info!("{}", "=".repeat(60));
    tracing::info!("🤖 Hebrew Doll - Gemini Live API ({})", config.api.model);
    tracing::info!("{}", "=".repeat(60));
    tracing::debug!("Audio config: {:?}", config.audio);
    tracing::debug!("API config: {:?}", config.api);

    let opening_turn = config
        .app
        .greet_on_connect
        .then(|| config.app.greeting.clone());
    let connector = GeminiConnector::new(config.api.clone())
        .with_transcription(config.app.show_transcription)
        .with_opening_turn(opening_turn);

    if cli.check {
        return check(&config, &connector, &instruction).await;
    }

    let controller = SessionController::new(
        config.session.clone(),
        Arc::new(connector),
        Arc::new(AlsaBackend),
    )
    .with_transcription(config.app.show_transcription);

    tracing::info!("💬 {}", config.app.greeting);
    tracing::info!("⚠️  Press Ctrl+C to exit");

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            // Without a signal handler the session runs until it fails.
            std::future::pending::<()>().await;
        }
    };

    controller
        .run(&instruction, &config.audio, shutdown)
        .await
        .context("session ended")?;

    tracing::info!("✓ Cleanup complete");
    Ok(())
}

/// Self-test: audio devices are listed for information, the connection must
/// complete its setup.
async fn check(
    config: &Config,
    connector: &GeminiConnector,
    instruction: &str,
) -> anyhow::Result<()> {
    tracing::info!("✓ API key found");

    match audio::list_devices() {
        Ok(devices) => {
            tracing::info!("✓ {} audio devices found", devices.len());
            let configured = |name: &str| {
                name == config.audio.input_device || name == config.audio.output_device
            };
            for dev in devices.iter().filter(|d| configured(&d.name)) {
                tracing::info!("  {} ({})", dev.name, dev.description);
            }
        }
        Err(e) => tracing::warn!("✗ Could not enumerate audio devices: {}", e),
    }

    let setup = SessionSetup::new(instruction, &config.audio);
    let id = net_link::check_connection(connector, &setup)
        .await
        .context("connection check failed")?;
    tracing::info!(connection_id = %id, "✓ Connected to {} and setup completed", config.api.model);
    Ok(())
}
