//! chromakd - Entry Point
//!
//! Initializes logging and configuration, loads the profile store, and
//! runs the device discovery loop until the process is asked to stop.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chromakd::core::{config::Config, events};
use chromakd::devnode::DevFs;
use chromakd::input::InputRegistry;
use chromakd::profile::store::ProfileStore;
use chromakd::usb::{DeviceEnv, DeviceManager};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!("chromakd starting");

    let store = Arc::new(ProfileStore::new());
    let store_path = config.store.store_path()?;
    match store.load(&store_path) {
        Ok(0) => {}
        Ok(count) => info!("loaded {} stored profile(s)", count),
        Err(err) => warn!("profile store unavailable: {:#}", err),
    }

    let (event_tx, mut event_rx) = events::channel();
    let env = Arc::new(DeviceEnv {
        nodes: Box::new(DevFs::new(&config.usb.devnode_root)),
        input: Box::new(InputRegistry::new()),
        store: Arc::clone(&store),
        events: event_tx,
        feature_mask: config.usb.feature_mask(),
        timings: config.timing.timings(),
    });

    let manager = Arc::new(DeviceManager::new(env, config.usb.scan_interval())?);
    let scan = Arc::clone(&manager).run();

    // Surface session notifications in the log until a client bus exists.
    let events_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!("daemon event: {:?}", event);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    manager.shutdown();
    if scan.join().is_err() {
        warn!("scan thread panicked during shutdown");
    }
    events_task.abort();

    if let Err(err) = store.save(&store_path) {
        warn!("failed to save profile store: {:#}", err);
    }
    Ok(())
}
