//! Terminal front-end for a Marta live voice session.

use clap::{Parser, Subcommand};
use marta_live::audio::CpalBackend;
use marta_live::audio::capture::CpalMicrophone;
use marta_live::audio::playback::CpalOutput;
use marta_live::transport::WebSocketConnector;
use marta_live::{
    LiveConfig, LiveError, SessionBackends, SessionController, SessionState, VolumeSample,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Marta Live: talk to the assistant in real time.
#[derive(Parser)]
#[command(name = "marta-live", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a live voice session (default).
    Talk,

    /// List available audio devices.
    Devices,

    /// Write the default configuration file and exit.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the meter on stdout stays readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("marta_live=info,tungstenite=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(LiveConfig::default_config_path);

    match cli.command.unwrap_or(Command::Talk) {
        Command::Talk => {
            let config = if config_path.exists() {
                LiveConfig::from_file(&config_path)?
            } else {
                LiveConfig::default()
            };
            run_talk(config).await
        }
        Command::Devices => list_devices(),
        Command::InitConfig => {
            LiveConfig::default().save_to_file(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
    }
}

async fn run_talk(config: LiveConfig) -> anyhow::Result<()> {
    println!("Marta Live v{}", env!("CARGO_PKG_VERSION"));

    let backends = SessionBackends {
        audio: Arc::new(CpalBackend),
        connector: Arc::new(WebSocketConnector),
    };
    let session = SessionController::new(config, backends)?;

    let closer = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, closing session...");
            closer.close().await;
        }
    });

    let mut status = session.status();
    let mut volume = session.volume();
    let display = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = status.borrow_and_update().clone();
                    print!("\r{:<40}\r", "");
                    println!("[{state}]");
                    if state.is_terminal() {
                        break;
                    }
                }
                changed = volume.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let level = *volume.borrow_and_update();
                    print!("\r{}", meter(level));
                    let _ = std::io::stdout().flush();
                }
            }
        }
    });

    match session.start().await {
        Ok(()) => {}
        // Ctrl-C while connecting.
        Err(LiveError::SessionClosed) => {
            let _ = display.await;
            return Ok(());
        }
        Err(e) => {
            let _ = display.await;
            anyhow::bail!("could not start session: {e}");
        }
    }
    println!("\nConnected. Speak into your microphone. Press Ctrl+C to stop.\n");

    let terminal = session
        .status()
        .wait_for(SessionState::is_terminal)
        .await
        .map(|s| s.clone())
        .unwrap_or(SessionState::Closed);
    let _ = display.await;

    match terminal {
        SessionState::Failed(reason) => anyhow::bail!("session ended: {reason}"),
        _ => Ok(()),
    }
}

/// Render a loudness bar such as `mic [#####.....]`.
fn meter(level: VolumeSample) -> String {
    const WIDTH: usize = 30;
    let filled = (level.value() * WIDTH as f32).round() as usize;
    format!(
        "mic [{}{}]",
        "#".repeat(filled.min(WIDTH)),
        ".".repeat(WIDTH - filled.min(WIDTH))
    )
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
