//! Sluice: local proxy client
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! loads settings and runs one session until Ctrl-C.
//!
//! Usage: `sluice [settings.toml] [server-index] [mode-index]`

use anyhow::{bail, Context, Result};
use sluice_control::{ControlEvent, EventBus, MainController, Platform, Settings};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_SETTINGS: &str = "settings.toml";

struct Args {
    settings: PathBuf,
    server: usize,
    mode: usize,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let settings = args
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS));
        let server = index(args.next(), "server")?;
        let mode = index(args.next(), "mode")?;

        Ok(Self {
            settings,
            server,
            mode,
        })
    }
}

fn index(arg: Option<String>, what: &str) -> Result<usize> {
    match arg {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("Invalid {what} index: {arg}")),
        None => Ok(0),
    }
}

/// Print events until the bus closes
fn spawn_event_printer(events: &EventBus) {
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ControlEvent::Notice(notice)) => error!("{}", notice),
                Ok(ControlEvent::Status(text)) => info!("{}", text),
                Ok(ControlEvent::Log(line)) => debug!("{}", line),
                Ok(ControlEvent::StateChanged { controller, state }) => {
                    debug!("{} is {}", controller, state)
                }
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse()?;
    let settings = Settings::from_toml_file(&args.settings)
        .with_context(|| format!("Failed to load {}", args.settings.display()))?;

    let Some(server) = settings.servers.get(args.server).cloned() else {
        bail!("No server at index {}", args.server);
    };
    let Some(mode) = settings.modes.get(args.mode).cloned() else {
        bail!("No mode at index {}", args.mode);
    };

    info!("Sluice starting...");

    let events = EventBus::default();
    spawn_event_printer(&events);

    // Probing the OS version shells out on Windows.
    let mut controller = tokio::task::spawn_blocking(move || {
        MainController::new(settings, Platform::system(), events)
    })
    .await?;

    if !controller.start(&server, &mode).await {
        bail!("Failed to start {} with {}", server, mode);
    }
    info!("Running {} with {}, press Ctrl-C to stop", server, mode);

    tokio::signal::ctrl_c().await?;

    info!("Stopping...");
    controller.stop().await;
    info!("Sluice shutting down");
    Ok(())
}
