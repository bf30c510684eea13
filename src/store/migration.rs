//! One-time conversion from the legacy single-array file to the line-delimited log.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::fs::operations::{file_size, write_atomically};

use super::{entities::Record, record_log::LogPaths, record_log::serialize_log};

/// Legacy files at most this big are never considered evidence of a truncated log.
const SUSPICIOUS_LEGACY_SIZE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Neither the legacy file nor its backup exists.
    NoLegacyData,
    /// The current log is present and plausibly complete.
    AlreadyMigrated,
    Migrated { records: usize },
    /// Something went wrong; the previous files are untouched.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacySource {
    Legacy,
    Backup,
}

/// Runs the migration when no log exists yet, or when the log is much smaller than the legacy
/// data (legacy > 1000 bytes and log < half of it), which points to an earlier truncation.
/// Never fails: problems are logged and reported as [MigrationOutcome::Failed].
pub async fn migrate_legacy_if_needed(paths: &LogPaths) -> MigrationOutcome {
    match try_migrate(paths).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Legacy record migration failed: {e:?}");
            MigrationOutcome::Failed
        }
    }
}

async fn try_migrate(paths: &LogPaths) -> Result<MigrationOutcome> {
    let (source, source_path, legacy_size) = match file_size(&paths.legacy).await? {
        Some(size) => (LegacySource::Legacy, paths.legacy.as_path(), size),
        None => match file_size(&paths.legacy_backup).await? {
            Some(size) => (LegacySource::Backup, paths.legacy_backup.as_path(), size),
            None => return Ok(MigrationOutcome::NoLegacyData),
        },
    };

    let log_size = file_size(&paths.log).await?;
    if !should_migrate(legacy_size, log_size) {
        return Ok(MigrationOutcome::AlreadyMigrated);
    }

    match log_size {
        Some(log_size) => warn!(
            "Record log is {log_size} bytes while legacy data is {legacy_size} bytes, restoring from {source_path:?}"
        ),
        None => info!("Migrating legacy records from {source_path:?}"),
    }

    let records = read_legacy(source_path).await?;
    write_atomically(&paths.log, serialize_log(&records).as_bytes())
        .await
        .with_context(|| format!("Failed to write {:?}", paths.log))?;

    if source == LegacySource::Legacy {
        tokio::fs::rename(&paths.legacy, &paths.legacy_backup)
            .await
            .with_context(|| format!("Failed to move {:?} aside", paths.legacy))?;
    }

    info!("Migrated {} legacy records", records.len());
    Ok(MigrationOutcome::Migrated {
        records: records.len(),
    })
}

fn should_migrate(legacy_size: u64, log_size: Option<u64>) -> bool {
    match log_size {
        None => true,
        Some(log_size) => legacy_size > SUSPICIOUS_LEGACY_SIZE && log_size < legacy_size / 2,
    }
}

async fn read_legacy(path: &Path) -> Result<Vec<Record>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {path:?}"))?;
    let values: Vec<Value> =
        serde_json::from_str(&content).with_context(|| format!("{path:?} is not a JSON array"))?;
    let mut records: Vec<Record> = values.into_iter().filter_map(Record::from_value).collect();
    records.sort_by_key(|r| r.id);
    Ok(records)
}
