use std::{
    collections::HashSet,
    future::Future,
    io::ErrorKind,
    ops::Deref,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use fs4::tokio::AsyncFileExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    fs::File,
    io::AsyncReadExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, warn};

use crate::fs::operations::{read_last_line, write_atomically};

use super::{
    entities::Record,
    migration::{migrate_legacy_if_needed, MigrationOutcome},
    writer::{LogWriter, WriteOp},
};

/// Interface the command layer uses to reach persisted records.
pub trait RecordStore {
    /// Every record, oldest first. Loads from disk on first use.
    fn load(&self) -> impl Future<Output = Vec<Record>> + Send;

    /// Adds the newest record. Returns once the cache is updated, the disk write happens later.
    fn append(&self, record: Record) -> impl Future<Output = ()> + Send;

    /// Replaces every record. Needed whenever anything but the newest record changes.
    fn rewrite_all(&self, records: Vec<Record>) -> impl Future<Output = ()> + Send;

    /// Record with the greatest id, without loading the whole log when avoidable.
    fn last_record(&self) -> impl Future<Output = Option<Record>> + Send;
}

impl<T: Deref + Sync> RecordStore for T
where
    T::Target: RecordStore,
{
    fn load(&self) -> impl Future<Output = Vec<Record>> + Send {
        self.deref().load()
    }

    fn append(&self, record: Record) -> impl Future<Output = ()> + Send {
        self.deref().append(record)
    }

    fn rewrite_all(&self, records: Vec<Record>) -> impl Future<Output = ()> + Send {
        self.deref().rewrite_all(records)
    }

    fn last_record(&self) -> impl Future<Output = Option<Record>> + Send {
        self.deref().last_record()
    }
}

/// File locations used by the record log.
#[derive(Debug, Clone)]
pub struct LogPaths {
    /// Current line-delimited log.
    pub log: PathBuf,
    /// Legacy single JSON array file.
    pub legacy: PathBuf,
    /// Where the legacy file is moved after migration.
    pub legacy_backup: PathBuf,
}

impl LogPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            log: dir.join("records.jsonl"),
            legacy: dir.join("records.json"),
            legacy_backup: dir.join("records.json.bak"),
        }
    }
}

/// Append-only record store with an in-memory mirror.
///
/// The cache is the source of truth for reads and is updated synchronously; disk writes are
/// queued to a [LogWriter] and complete in the background.
pub struct RecordLog {
    paths: LogPaths,
    cache: Mutex<Option<Vec<Record>>>,
    last: Mutex<Option<Record>>,
    /// Appends accepted while the log couldn't be loaded. Merged into the cache once a load
    /// succeeds.
    pending: Mutex<Vec<Record>>,
    /// Set when the log exists but couldn't be read. Rewriting from an empty cache would destroy
    /// it, so rewrites are refused until a load succeeds.
    unreadable: AtomicBool,
    load_guard: tokio::sync::Mutex<()>,
    writer: mpsc::UnboundedSender<WriteOp>,
}

impl RecordLog {
    /// Creates the log and the writer that must be driven for anything to reach the disk.
    pub fn new(paths: LogPaths) -> (Self, LogWriter) {
        let (writer, receiver) = mpsc::unbounded_channel();
        let log_writer = LogWriter::new(paths.log.clone(), receiver);
        let log = Self {
            paths,
            cache: Mutex::new(None),
            last: Mutex::new(None),
            pending: Mutex::new(vec![]),
            unreadable: AtomicBool::new(false),
            load_guard: tokio::sync::Mutex::new(()),
            writer,
        };
        (log, log_writer)
    }

    /// Creates the log and spawns its writer on the current runtime.
    pub fn spawn(paths: LogPaths) -> Self {
        let (log, writer) = Self::new(paths);
        tokio::spawn(writer.run());
        log
    }

    /// One-time conversion of the legacy array file. Must run before the first load.
    pub async fn migrate_legacy_if_needed(&self) -> MigrationOutcome {
        migrate_legacy_if_needed(&self.paths).await
    }

    /// Resolves once every write queued so far has reached the disk (or failed).
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.writer.send(WriteOp::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }

    async fn ensure_loaded(&self) {
        if self.cache.lock().is_some() {
            return;
        }
        let _guard = self.load_guard.lock().await;
        if self.cache.lock().is_some() {
            return;
        }

        match self.read_from_disk().await {
            Ok(mut records) => {
                info!("Loaded {} records from {:?}", records.len(), self.paths.log);
                merge_pending(&mut records, std::mem::take(&mut *self.pending.lock()));
                self.unreadable.store(false, Ordering::SeqCst);
                *self.last.lock() = records.iter().max_by_key(|r| r.id).cloned();
                *self.cache.lock() = Some(records);
            }
            Err(e) => {
                // Not cached so the next call retries.
                error!("Failed to load records from {:?}: {e:?}", self.paths.log);
                self.unreadable.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn read_from_disk(&self) -> Result<Vec<Record>> {
        let bytes = match read_shared(&self.paths.log).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => Err(e)?,
        };
        let content = decode_lines(&bytes, &self.paths.log);

        let parsed = parse_log(&content, &self.paths.log);
        if parsed.whole_array {
            warn!(
                "{:?} holds a single JSON array, rewriting it line by line",
                self.paths.log
            );
            if let Err(e) =
                write_atomically(&self.paths.log, serialize_log(&parsed.records).as_bytes()).await
            {
                error!("Failed to canonicalize {:?}: {e:?}", self.paths.log);
            }
        }
        Ok(parsed.records)
    }

    fn send(&self, op: WriteOp) {
        if self.writer.send(op).is_err() {
            error!("Record writer is gone, dropping write to {:?}", self.paths.log);
        }
    }
}

impl RecordStore for RecordLog {
    async fn load(&self) -> Vec<Record> {
        self.ensure_loaded().await;
        match self.cache.lock().as_ref() {
            Some(records) => records.clone(),
            None => {
                let mut pending = self.pending.lock().clone();
                pending.sort_by_key(|r| r.id);
                pending
            }
        }
    }

    async fn append(&self, mut record: Record) {
        record.normalize();
        self.ensure_loaded().await;

        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize record {}: {e}", record.id);
                return;
            }
        };

        {
            let mut last = self.last.lock();
            if last.as_ref().map_or(true, |l| l.id <= record.id) {
                *last = Some(record.clone());
            }
        }
        match self.cache.lock().as_mut() {
            Some(records) => records.push(record),
            None => {
                warn!(
                    "Record {} kept aside until {:?} can be loaded",
                    record.id, self.paths.log
                );
                self.pending.lock().push(record);
            }
        }
        self.send(WriteOp::Append(line));
    }

    async fn rewrite_all(&self, mut records: Vec<Record>) {
        self.ensure_loaded().await;
        if self.unreadable.load(Ordering::SeqCst) {
            error!(
                "Refusing to rewrite {:?}, its current content could not be read",
                self.paths.log
            );
            return;
        }

        records.iter_mut().for_each(Record::normalize);
        records.sort_by_key(|r| r.id);
        let content = serialize_log(&records);

        *self.last.lock() = records.last().cloned();
        *self.cache.lock() = Some(records);
        self.send(WriteOp::Rewrite(content));
    }

    async fn last_record(&self) -> Option<Record> {
        if let Some(last) = self.last.lock().clone() {
            return Some(last);
        }
        if let Some(records) = self.cache.lock().as_ref() {
            return records.iter().max_by_key(|r| r.id).cloned();
        }

        // Cold start: the newest record is normally the final line.
        match read_last_line(&self.paths.log).await {
            Ok(Some(line)) => {
                let newest = parse_line(&line)
                    .into_iter()
                    .max_by_key(|r| r.id);
                if let Some(record) = &newest {
                    debug!("Primed last record {} from the log tail", record.id);
                    *self.last.lock() = newest.clone();
                    return newest;
                }
            }
            Ok(None) => return None,
            Err(e) => warn!("Failed to read the tail of {:?}: {e:?}", self.paths.log),
        }

        self.ensure_loaded().await;
        self.last.lock().clone()
    }
}

struct ParsedLog {
    records: Vec<Record>,
    whole_array: bool,
}

/// Parses log content. A file that is one JSON array is accepted as a whole; otherwise every line
/// is parsed on its own, array lines are flattened and broken lines are skipped.
fn parse_log(content: &str, path: &Path) -> ParsedLog {
    let trimmed = content.trim();
    if trimmed.starts_with('[') {
        if let Ok(values) = serde_json::from_str::<Vec<Value>>(trimmed) {
            let mut records: Vec<Record> = values.into_iter().filter_map(Record::from_value).collect();
            records.sort_by_key(|r| r.id);
            return ParsedLog {
                records,
                whole_array: true,
            };
        }
    }

    let mut records = vec![];
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.extend(records_from_value(value)),
            Err(e) => {
                // ignore illegal values. Might happen after a crash mid-write
                warn!(
                    "Skipping line {} of {:?}, found illegal json string {}: {e}",
                    index + 1,
                    path,
                    line
                )
            }
        }
    }
    records.sort_by_key(|r| r.id);
    ParsedLog {
        records,
        whole_array: false,
    }
}

fn parse_line(line: &str) -> Vec<Record> {
    serde_json::from_str::<Value>(line)
        .map(records_from_value)
        .unwrap_or_default()
}

fn records_from_value(value: Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(Record::from_value).collect(),
        value => Record::from_value(value).into_iter().collect(),
    }
}

/// Canonical on-disk form: one JSON object per line, every line terminated by `\n`.
pub(crate) fn serialize_log(records: &[Record]) -> String {
    let mut content = String::new();
    for record in records {
        match serde_json::to_string(record) {
            Ok(line) => {
                content.push_str(&line);
                content.push('\n');
            }
            Err(e) => error!("Failed to serialize record {}: {e}", record.id),
        }
    }
    content
}

/// Keeps every line that is valid UTF-8. A crash mid-append can cut a multibyte character in
/// half, which must only cost that one line.
fn decode_lines(bytes: &[u8], path: &Path) -> String {
    let mut content = String::with_capacity(bytes.len());
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        match std::str::from_utf8(line) {
            Ok(line) => {
                content.push_str(line);
                content.push('\n');
            }
            Err(e) => warn!("Skipping line {} of {:?}, not valid UTF-8: {e}", index + 1, path),
        }
    }
    content
}

/// Adds appends made before the first successful load. The disk copy may already hold them, in
/// which case the appended version wins.
fn merge_pending(records: &mut Vec<Record>, pending: Vec<Record>) {
    if pending.is_empty() {
        return;
    }
    let ids: HashSet<i64> = pending.iter().map(|r| r.id).collect();
    records.retain(|r| !ids.contains(&r.id));
    records.extend(pending);
    records.sort_by_key(|r| r.id);
}

async fn read_shared(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let mut file = File::open(path).await?;
    file.lock_shared()?;
    let mut content = vec![];
    let result = file.read_to_end(&mut content).await;
    file.unlock_async().await?;
    result.map(|_| content)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use anyhow::Result;
    use tempfile::tempdir;

    use crate::{
        store::{
            duration::Seconds,
            entities::{RawDuration, Record},
        },
        utils::logging::TEST_LOGGING,
    };

    use super::{LogPaths, RecordLog, RecordStore};

    const BASE_ID: i64 = 1_740_000_000_000;

    fn sample(offset_minutes: i64) -> Record {
        Record::new(BASE_ID + offset_minutes * 60_000)
            .with_task(format!("task {offset_minutes}"))
            .with_tags(["工作"])
            .with_duration(RawDuration::from(600))
    }

    fn by_id(records: &[Record]) -> BTreeMap<i64, Record> {
        records.iter().map(|r| (r.id, r.clone())).collect()
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let log = RecordLog::spawn(LogPaths::in_dir(dir.path()));
        assert!(log.load().await.is_empty());
        assert!(log.last_record().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_append_then_reload() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        let log = RecordLog::spawn(paths.clone());
        let record = sample(0).with_duration(RawDuration::new(12.5));

        log.append(record.clone()).await;
        assert_eq!(log.load().await, vec![record.clone()]);
        log.flush().await;

        let reopened = RecordLog::spawn(paths.clone());
        let loaded = reopened.load().await;
        assert_eq!(loaded, vec![record.clone()]);
        assert_eq!(Seconds::of(&loaded[0]), Seconds::of(&record));

        let content = std::fs::read_to_string(&paths.log)?;
        assert!(content.ends_with('\n'));
        assert_eq!(content.lines().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite_all_then_reload() -> Result<()> {
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        let log = RecordLog::spawn(paths.clone());
        log.append(sample(0)).await;
        log.append(sample(1)).await;

        let replacement = vec![sample(5), sample(3), sample(4)];
        log.rewrite_all(replacement.clone()).await;
        log.flush().await;

        let reopened = RecordLog::spawn(paths);
        assert_eq!(by_id(&reopened.load().await), by_id(&replacement));
        assert_eq!(reopened.last_record().await.map(|r| r.id), Some(sample(5).id));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_line_is_skipped() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        let first = serde_json::to_string(&sample(0))?;
        let third = serde_json::to_string(&sample(2))?;
        std::fs::write(
            &paths.log,
            format!("{first}\n{{\"id\": 17400000, \"task\": \"broken\n{third}\n"),
        )?;

        let log = RecordLog::spawn(paths);
        let loaded = log.load().await;
        assert_eq!(
            loaded.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![sample(0).id, sample(2).id]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_torn_multibyte_line_is_skipped() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        let mut content = serde_json::to_string(&sample(0))?.into_bytes();
        content.push(b'\n');
        content.extend_from_slice(format!("{{\"id\":{},\"tags\":[\"", BASE_ID + 1).as_bytes());
        // First two bytes of 学.
        content.extend_from_slice(&[0xE5, 0xAD]);
        content.push(b'\n');
        content.extend_from_slice(serde_json::to_string(&sample(2))?.as_bytes());
        content.push(b'\n');
        std::fs::write(&paths.log, content)?;

        let log = RecordLog::spawn(paths);
        let ids: Vec<_> = log.load().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![sample(0).id, sample(2).id]);

        log.append(sample(3)).await;
        assert_eq!(log.load().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_mistyped_fields_survive_rewrite() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        std::fs::write(
            &paths.log,
            format!(
                "{}\n{{\"id\":{},\"task\":42,\"tags\":\"学习\",\"isFocus\":\"true\",\"duration\":300}}\n{}\n",
                serde_json::to_string(&sample(0))?,
                BASE_ID + 60_000,
                serde_json::to_string(&sample(2))?
            ),
        )?;

        let log = RecordLog::spawn(paths.clone());
        let loaded = log.load().await;
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].duration, RawDuration::from(300));

        log.rewrite_all(loaded).await;
        log.flush().await;

        let reopened = RecordLog::spawn(paths);
        let ids: Vec<_> = reopened.load().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![sample(0).id, BASE_ID + 60_000, sample(2).id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_after_failed_load_keeps_history() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        // A directory in place of the log makes every read fail.
        std::fs::create_dir(&paths.log)?;

        let log = RecordLog::spawn(paths.clone());
        assert!(log.load().await.is_empty());
        log.append(sample(5)).await;
        assert_eq!(log.load().await, vec![sample(5)]);

        log.rewrite_all(vec![]).await;
        log.flush().await;
        assert!(paths.log.is_dir());
        assert!(log.cache.lock().is_none());

        std::fs::remove_dir(&paths.log)?;
        std::fs::write(
            &paths.log,
            format!(
                "{}\n{}\n",
                serde_json::to_string(&sample(0))?,
                serde_json::to_string(&sample(1))?
            ),
        )?;

        let ids: Vec<_> = log.load().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![sample(0).id, sample(1).id, sample(5).id]);
        assert_eq!(log.last_record().await.map(|r| r.id), Some(sample(5).id));
        Ok(())
    }

    #[tokio::test]
    async fn test_array_lines_are_flattened_and_id_less_entries_dropped() -> Result<()> {
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        std::fs::write(
            &paths.log,
            format!(
                "[{}, {{\"task\": \"no id\"}}]\n{}\n",
                serde_json::to_string(&sample(0))?,
                serde_json::to_string(&sample(1))?
            ),
        )?;

        let log = RecordLog::spawn(paths);
        assert_eq!(log.load().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_whole_array_file_is_canonicalized() -> Result<()> {
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        std::fs::write(
            &paths.log,
            format!(
                "[\n  {{\"id\": {}, \"task\": \"a\", \"duration\": 5}},\n  {{\"id\": {}, \"task\": \"b\"}}\n]",
                BASE_ID + 1000,
                BASE_ID
            ),
        )?;

        let log = RecordLog::spawn(paths.clone());
        let loaded = log.load().await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, BASE_ID);
        assert!(!loaded[0].timestamp.is_empty());

        let content = std::fs::read_to_string(&paths.log)?;
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            assert!(line.starts_with('{'));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_visible_after_reload() -> Result<()> {
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        let log = RecordLog::spawn(paths.clone());
        for offset in 0..3 {
            log.append(sample(offset)).await;
        }

        let remaining: Vec<_> = log
            .load()
            .await
            .into_iter()
            .filter(|r| r.id != sample(1).id)
            .collect();
        log.rewrite_all(remaining).await;
        log.flush().await;

        let reopened = RecordLog::spawn(paths);
        let ids: Vec<_> = reopened.load().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![sample(0).id, sample(2).id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_last_record_from_tail_without_full_load() -> Result<()> {
        let dir = tempdir()?;
        let paths = LogPaths::in_dir(dir.path());
        std::fs::write(
            &paths.log,
            format!(
                "not even json\n{}\n",
                serde_json::to_string(&sample(9))?
            ),
        )?;

        let log = RecordLog::spawn(paths);
        assert_eq!(log.last_record().await.map(|r| r.id), Some(sample(9).id));
        assert!(log.cache.lock().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_handles_see_the_same_log() -> Result<()> {
        let dir = tempdir()?;
        let log = Arc::new(RecordLog::spawn(LogPaths::in_dir(dir.path())));
        let other = log.clone();

        log.append(sample(0)).await;
        other.append(sample(1)).await;
        assert_eq!(log.load().await.len(), 2);
        assert_eq!(other.last_record().await.map(|r| r.id), Some(sample(1).id));

        other.rewrite_all(vec![sample(0)]).await;
        assert_eq!(log.load().await, vec![sample(0)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_last_record_tracks_appends_and_rewrites() -> Result<()> {
        let dir = tempdir()?;
        let log = RecordLog::spawn(LogPaths::in_dir(dir.path()));
        log.append(sample(2)).await;
        log.append(sample(1)).await;
        assert_eq!(log.last_record().await.map(|r| r.id), Some(sample(2).id));

        log.rewrite_all(vec![sample(1)]).await;
        assert_eq!(log.last_record().await.map(|r| r.id), Some(sample(1).id));

        log.rewrite_all(vec![]).await;
        assert!(log.last_record().await.is_none());
        Ok(())
    }
}
