//! Lightbox control plane for Linux hosts.
//!
//! Boot sequence: load the configuration, provision WiFi credentials if
//! none are stored, join the network, then hand the process to the task
//! scheduler. A fatal error is written to the crash log before exiting.
//!
//! Environment:
//! - `LIGHTBOX_CONFIG`: JSON config file (default `lightbox.json`, optional)
//! - `LIGHTBOX_STATION_IP`: address reported as the station address
//! - `RUST_LOG`: tracing filter
//!
//! `--factory-reset` restores the factory setup and exits.

mod host;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lightbox_core::{
    ensure_cipher_key, ConfigStore, ConfigStoreExt, ControlFlags, CredentialVault, Duty,
    EventCounter, FileConfigStore, HeadlessDisplay, WifiCredentials, XorCipher, DEFAULT_HOSTNAME,
};
use lightbox_server::{
    factory_reset, AppConfig, ControlServer, CrashLog, ProvisioningServer, ServerContext,
    StationConnector, TaskScheduler,
};

use host::{HostRadio, LoggingUpdater, MeminfoProbe};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lightbox_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    let crash_log = CrashLog::new(config.storage.crash_log_path());

    if let Err(e) = run(config).await {
        tracing::error!("Fatal: {:#}", e);
        if let Err(log_err) = crash_log.record(&format!("{:#}", e)) {
            tracing::warn!("Could not write crash log: {}", log_err);
        }
        std::process::exit(1);
    }
}

fn load_config() -> anyhow::Result<AppConfig> {
    let path = PathBuf::from(
        std::env::var("LIGHTBOX_CONFIG").unwrap_or_else(|_| "lightbox.json".into()),
    );
    if !path.exists() {
        tracing::info!("{} not found, using defaults", path.display());
        return Ok(AppConfig::default());
    }
    let config = AppConfig::from_file(&path)?;
    tracing::info!("Configuration loaded from {}", path.display());
    Ok(config)
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(&config.storage.data_dir));
    let vault = CredentialVault::new(config.storage.credentials_path(), Arc::new(XorCipher));

    if std::env::args().any(|arg| arg == "--factory-reset") {
        let removed = factory_reset(
            store.as_ref(),
            &vault,
            &config.server.upload_dir,
            &config.server.upload_extension,
        )
        .context("factory reset")?;
        tracing::info!("Factory reset complete ({} images removed)", removed);
        return Ok(());
    }

    let station_ip: IpAddr = match std::env::var("LIGHTBOX_STATION_IP") {
        Ok(raw) => raw.parse().context("LIGHTBOX_STATION_IP")?,
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    let radio = Arc::new(HostRadio::new(station_ip));
    let display = Arc::new(HeadlessDisplay::new(EventCounter::new(
        config.counter,
        config.counter.min,
    )));
    let updater = Arc::new(LoggingUpdater);

    let key = ensure_cipher_key(store.as_ref()).context("credential key")?;
    let credentials = match vault.load(key.as_bytes())? {
        Some(credentials) if credentials.is_configured() => credentials,
        _ => {
            tracing::info!("No WiFi credentials stored, starting provisioning");
            provision(&config, radio.clone(), display.clone(), store.clone(), vault).await?
        }
    };

    let hostname = store
        .load_setup()
        .map(|setup| setup.hostname)
        .unwrap_or_else(|_| DEFAULT_HOSTNAME.to_string());
    let mut station = StationConnector::new(radio, config.station.poll_interval());
    loop {
        match station
            .connect(
                &credentials.ssid,
                &credentials.password,
                &hostname,
                config.station.max_wait(),
            )
            .await
        {
            Ok(_) => break,
            Err(e) => {
                tracing::warn!("WiFi not connected: {}", e);
                tokio::time::sleep(config.station.retry_delay()).await;
            }
        }
    }

    let ctx = ServerContext {
        config: config.server.clone(),
        store,
        display,
        updater: updater.clone(),
    };
    // The first iteration refreshes system data before serving.
    let flags = Arc::new(ControlFlags::new(Duty::Update));
    let server = ControlServer::new(ctx, station, flags);
    let mut scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        server,
        updater,
        Arc::new(MeminfoProbe),
    );
    let timer = scheduler.spawn_preemption_timer();

    tracing::info!("Lightbox control plane ready");
    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
    }
    timer.abort();
    Ok(())
}

async fn provision(
    config: &AppConfig,
    radio: Arc<HostRadio>,
    display: Arc<HeadlessDisplay>,
    store: Arc<dyn ConfigStore>,
    vault: CredentialVault,
) -> anyhow::Result<WifiCredentials> {
    let mut server = ProvisioningServer::new(config.provisioning.clone(), radio, display, store, vault);
    let credentials = server.run().await.context("provisioning")?;
    tracing::info!("Credentials received for '{}'", credentials.ssid);
    Ok(credentials)
}
