use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::{error, info, warn, LevelFilter};
use mac_oui::Oui;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;

mod db;
mod events;
mod hardware;
mod presence;
mod resolver;
mod scan;
mod service;

use crate::events::EventBus;
use crate::hardware::HardwarePoller;
use crate::presence::{PresenceScanner, ScanSettings};
use crate::resolver::LinkSettings;
use crate::service::ServiceManager;

use homesense_migration::{Migrator, MigratorTrait};

#[derive(Debug, Parser)]
#[command(name = "homesense", version, about = "LAN presence and hardware monitor")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "homesense.toml")]
    config: String,

    /// Override the configured database URL
    #[arg(short, long)]
    database: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct Config {
    database_url: String,
    log_level: String,
    /// Events are POSTed here as JSON when set.
    webhook_url: Option<String>,
    hardware_poll_ms: u64,
    scan: ScanSettings,
    link: LinkSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite://homesense.db?mode=rwc".to_string(),
            log_level: "info".to_string(),
            webhook_url: None,
            hardware_poll_ms: 250,
            scan: ScanSettings::default(),
            link: LinkSettings::default(),
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    // Defaults, overridden by the toml file, overridden by the environment.
    Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HOMESENSE_"))
        .extract()
        .context("invalid configuration")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("fatal: {:#}", e);
        eprintln!("homesense failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)?;
    if let Some(database) = cli.database.clone() {
        config.database_url = database;
    }

    let level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("logger setup failed")?;

    info!("homesense {} starting", env!("CARGO_PKG_VERSION"));
    let db = db::connection(&config.database_url).await?.clone();
    Migrator::up(&db, None).await.context("migrations failed")?;

    let oui_db = match Oui::default() {
        Ok(oui_db) => Some(Arc::new(oui_db)),
        Err(e) => {
            warn!("OUI database unavailable ({}), vendor lookups disabled", e);
            None
        }
    };

    let bus = EventBus::new(config.webhook_url.clone());

    let scanner = PresenceScanner::new(
        db.clone(),
        oui_db,
        config.scan.clone(),
        config.link.clone(),
        bus.clone(),
    );
    let scan_settings = scanner.settings_handle();

    let poller = HardwarePoller::new(
        db.clone(),
        bus.clone(),
        Duration::from_millis(config.hardware_poll_ms.max(50)),
    );
    let reloader = poller.clone();

    let mut manager = ServiceManager::new();
    manager.spawn(scanner).await?;
    manager.spawn(poller).await?;

    let mut hangup = signal(SignalKind::hangup()).context("signal handler setup failed")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("ctrl-c handler failed")?;
                info!("shutdown requested");
                break;
            }
            _ = hangup.recv() => {
                match reload(&cli.config, &scan_settings, &reloader).await {
                    Ok(()) => info!("configuration reloaded"),
                    Err(e) => warn!("reload failed, keeping previous configuration: {:#}", e),
                }
            }
        }
    }

    for health in manager.health() {
        if health.stale {
            warn!("{} had no recent successful cycle", health.name);
        }
    }
    manager.stop_all().await;
    info!("homesense stopped");
    Ok(())
}

/// SIGHUP: re-read the config file and apply what can change at runtime,
/// scan parameters and the hardware set. The database URL and cycle
/// intervals stay as started.
async fn reload(
    config_path: &str,
    scan_settings: &Arc<Mutex<ScanSettings>>,
    poller: &HardwarePoller,
) -> Result<()> {
    let config = load_config(config_path)?;
    *scan_settings.lock().await = config.scan;
    poller.reload_config().await?;
    Ok(())
}
