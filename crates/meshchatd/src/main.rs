//! meshchatd - encrypted peer-to-peer chat overlay node
//!
//! Hosts a new network or joins an existing one, then prints incoming
//! messages until interrupted.

use anyhow::Context;
use clap::Parser;
use meshchatd::{Config, KeyStore, Overlay, OverlayEvent};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    if let Err(e) = init_logging(&config) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "meshchatd v{} - encrypted chat overlay",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let level = if config.verbose { "debug" } else { "info" };
    let mut filter =
        EnvFilter::from_default_env().add_directive(format!("meshchatd={}", level).parse()?);
    if config.verbose {
        filter = filter.add_directive("meshchat_net=debug".parse()?);
    }

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let store = KeyStore::open(&config.key_dir)
        .with_context(|| format!("opening key directory {}", config.key_dir.display()))?;
    let identity = if config.create_identity {
        store.create_identity()?
    } else {
        store.load_identity()?
    };
    let trusted = store.read_trusted_keys()?;
    info!(
        "identity {} ({}), {} trusted keys",
        identity.peer_id(),
        identity.peer_id().fingerprint(),
        trusted.len()
    );

    let (overlay, mut events) = Overlay::new(config.overlay(), identity, trusted);

    match config.join {
        Some(addr) => overlay
            .join(addr)
            .await
            .with_context(|| format!("joining network via {}", addr))?,
        None => {
            let local = overlay.start_listening()?;
            info!("hosting a new network on {}", local);
            let networks = overlay.known_networks()?;
            if !networks.is_empty() {
                info!("known networks: {}", networks.join(", "));
            }
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => on_event(&overlay, event),
                None => break,
            },
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    overlay.stop().await;
    Ok(())
}

fn on_event(overlay: &Overlay, event: OverlayEvent) {
    info!("{}", event);

    if let OverlayEvent::Connected(peer) | OverlayEvent::PeerConnected(peer) = event {
        let from = peer.addr;
        let printer = move |text: &str| println!("[{}] {}", from, text);
        if let Err(e) = overlay.set_dispatcher(from, printer) {
            warn!("{}: cannot attach dispatcher: {}", from, e);
        }
    }
}
