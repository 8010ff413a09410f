mod commands;
mod config;
mod permissions;
mod persistence;
mod world;

use std::sync::Arc;
use std::time::Duration;

use commands::Console;
use config::ServerConfig;
use mc_rs_invsee::Engine;
use permissions::{Permissions, PERMISSIONS_FILE};
use persistence::JsonPlayerStore;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use world::ConsoleWorld;

#[tokio::main]
async fn main() {
    let config = match ServerConfig::load("server.toml") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load server.toml: {e}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        "MC-RS invsee server v{} starting (storage: {}, persistence: {:?})",
        env!("CARGO_PKG_VERSION"),
        config.storage.directory,
        config.engine.persistence
    );

    let store = match JsonPlayerStore::open(&config.storage.directory) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to open player storage {}: {e}", config.storage.directory);
            std::process::exit(1);
        }
    };
    let permissions = Permissions::load(PERMISSIONS_FILE);
    let engine = Engine::new(config.engine.clone(), store.clone());
    let world = ConsoleWorld::new(config.titles.clone());
    let mut console = Console::new(engine, world, store, permissions);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    // Handle Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Console REPL: read lines from stdin
    let (console_tx, mut console_rx) = tokio::sync::mpsc::channel::<String>(32);
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    info!("Ready. Type 'help' for a list of commands.");
    let mut tick_interval = tokio::time::interval(Duration::from_millis(config.tick_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                for message in console.tick() {
                    info!("{message}");
                }
            }
            Some(line) = console_rx.recv() => {
                let result = console.execute(&line);
                for message in &result.messages {
                    if result.success {
                        info!("{message}");
                    } else {
                        warn!("{message}");
                    }
                }
                if result.should_stop {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Saving players before shutdown...");
    console.shutdown();
    info!("Server shut down.");
}
