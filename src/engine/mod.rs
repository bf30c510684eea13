//! Process wiring: opens the stores in the right order and drives status recomputation until
//! shutdown.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    events::EventBus,
    service::CoreService,
    settings::store::{SettingsStore, SystemHooks},
    status::{
        icon::{AssetProbe, IconResolver},
        resolver::{SessionCue, SessionStatusResolver},
    },
    store::{
        migration::MigrationOutcome,
        record_log::{LogPaths, RecordLog},
        screenshots::ScreenshotMaterializer,
    },
    utils::clock::Clock,
};

pub mod shutdown;
pub mod ticker;

/// The log is shared so hosts can flush it independently of the service.
pub type Core = CoreService<Arc<RecordLog>>;

pub const SETTINGS_FILE: &str = "settings.json";
pub const SCREENSHOTS_DIR: &str = "screenshots";

/// Where the core keeps its files.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dir: PathBuf,
    pub asset_dir: PathBuf,
}

impl EngineConfig {
    /// Assets default to `<dir>/assets`.
    pub fn new(dir: PathBuf, asset_dir: Option<PathBuf>) -> Self {
        let asset_dir = asset_dir.unwrap_or_else(|| dir.join("assets"));
        Self { dir, asset_dir }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.dir.join(SCREENSHOTS_DIR)
    }
}

/// Effects the core delegates to whoever hosts it.
pub struct Collaborators {
    pub hooks: Arc<dyn SystemHooks>,
    pub cue: Arc<dyn SessionCue>,
    pub probe: Box<dyn AssetProbe>,
}

/// Opens the record log (migrating legacy data first) and the settings.
pub async fn open_core(
    config: &EngineConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
) -> Result<Core> {
    tokio::fs::create_dir_all(&config.dir).await?;

    let records = Arc::new(RecordLog::spawn(LogPaths::in_dir(&config.dir)));
    log_migration(&config.dir, records.migrate_legacy_if_needed().await);

    let bus = EventBus::default();
    let settings = SettingsStore::load(
        config.settings_path(),
        collaborators.hooks,
        bus.clone(),
        clock.clone(),
    )
    .await;

    Ok(CoreService::new(
        records,
        settings,
        ScreenshotMaterializer::new(config.screenshots_dir()),
        SessionStatusResolver::new(collaborators.cue),
        IconResolver::new(config.asset_dir.clone(), collaborators.probe),
        bus,
        clock,
    ))
}

/// Pushes pending settings and record writes to disk.
pub async fn close_core(core: &Core) {
    core.settings().flush_now().await;
    core.records().flush().await;
    info!("Core flushed");
}

/// Keeps the status fresh until `shutdown_token` is cancelled or a signal arrives, then flushes.
pub async fn run_engine(
    core: Arc<Core>,
    clock: Arc<dyn Clock>,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let ticker = ticker::StatusTicker::new(core.clone(), clock, shutdown_token.clone());

    let (_, ticker_result) =
        tokio::join!(shutdown::detect_shutdown(shutdown_token), ticker.run());

    if let Err(e) = &ticker_result {
        error!("Status ticker got an error {e:?}");
    }
    close_core(&core).await;
    ticker_result
}

fn log_migration(dir: &Path, outcome: MigrationOutcome) {
    match outcome {
        MigrationOutcome::Migrated { records } => {
            info!("Migrated {records} legacy records in {dir:?}")
        }
        MigrationOutcome::Failed => warn!("Legacy migration in {dir:?} failed, keeping prior state"),
        MigrationOutcome::NoLegacyData | MigrationOutcome::AlreadyMigrated => (),
    }
}
