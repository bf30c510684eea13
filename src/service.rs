//! Commands the UI collaborator issues against the core. Every mutation goes through here so
//! screenshots are materialized first and subscribers hear about the change afterwards.

use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::{
    error::{CoreError, CoreResult},
    events::{CoreEvent, EventBus},
    settings::{store::SettingsStore, Settings},
    status::{
        icon::IconResolver,
        resolver::{closing_duration, stopped_duration, SessionStatusResolver},
        StatusSnapshot,
    },
    store::{
        entities::{Record, RecordPatch},
        record_log::RecordStore,
        screenshots::ScreenshotMaterializer,
    },
    utils::clock::Clock,
};

pub struct CoreService<S: RecordStore> {
    records: S,
    settings: SettingsStore,
    screenshots: ScreenshotMaterializer,
    status: SessionStatusResolver,
    icons: IconResolver,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write sequences on the record log.
    mutation: tokio::sync::Mutex<()>,
    published: Mutex<Option<StatusSnapshot>>,
}

impl<S: RecordStore + Sync> CoreService<S> {
    pub fn new(
        records: S,
        settings: SettingsStore,
        screenshots: ScreenshotMaterializer,
        status: SessionStatusResolver,
        icons: IconResolver,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records,
            settings,
            screenshots,
            status,
            icons,
            bus,
            clock,
            mutation: tokio::sync::Mutex::new(()),
            published: Mutex::new(None),
        }
    }

    pub fn records(&self) -> &S {
        &self.records
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn get_records(&self) -> Vec<Record> {
        self.records.load().await
    }

    /// Persists a new session. An open-ended session that started earlier is closed at the new
    /// session's start.
    #[instrument(skip_all, fields(id = record.id))]
    pub async fn save_record(&self, record: Record) -> Record {
        let record = self.screenshots.materialize(record).await.into_record();
        let _guard = self.mutation.lock().await;

        let last = self.records.last_record().await;
        let closing = last
            .as_ref()
            .and_then(|prev| closing_duration(prev, record.id).map(|d| (prev.id, d)));

        match (last, closing) {
            (_, Some((previous_id, duration))) => {
                info!("Closing open-ended record {previous_id}");
                let mut all = self.records.load().await;
                if let Some(previous) = all.iter_mut().find(|r| r.id == previous_id) {
                    previous.duration = duration;
                }
                upsert(&mut all, record.clone());
                self.records.rewrite_all(all).await;
            }
            (Some(last), None) if last.id >= record.id => {
                debug!("Record is not the newest, rewriting the log");
                let mut all = self.records.load().await;
                upsert(&mut all, record.clone());
                self.records.rewrite_all(all).await;
            }
            _ => self.records.append(record.clone()).await,
        }

        self.bus.publish(CoreEvent::RecordsChanged);
        record
    }

    /// Replaces the stored record carrying the same id.
    #[instrument(skip_all, fields(id = record.id))]
    pub async fn update_record(&self, record: Record) -> CoreResult<Record> {
        let record = self.screenshots.materialize(record).await.into_record();
        let _guard = self.mutation.lock().await;

        let mut all = self.records.load().await;
        let slot = all
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(CoreError::RecordNotFound(record.id))?;
        *slot = record.clone();
        self.records.rewrite_all(all).await;

        self.bus.publish(CoreEvent::RecordsChanged);
        Ok(record)
    }

    /// Applies the fields present in `patch` to record `id`.
    #[instrument(skip(self, patch))]
    pub async fn update_record_parts(&self, id: i64, patch: RecordPatch) -> CoreResult<Record> {
        let _guard = self.mutation.lock().await;
        let mut all = self.records.load().await;
        let index = all
            .iter()
            .position(|r| r.id == id)
            .ok_or(CoreError::RecordNotFound(id))?;
        if patch.is_empty() {
            return Ok(all[index].clone());
        }

        let materialize = patch.touches_screenshots();
        let mut updated = all[index].clone();
        patch.apply_to(&mut updated);
        if materialize {
            updated = self.screenshots.materialize(updated).await.into_record();
        }
        all[index] = updated.clone();
        self.records.rewrite_all(all).await;

        self.bus.publish(CoreEvent::RecordsChanged);
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete_record(&self, id: i64) -> CoreResult<()> {
        let _guard = self.mutation.lock().await;
        let mut all = self.records.load().await;
        let before = all.len();
        all.retain(|r| r.id != id);
        if all.len() == before {
            return Err(CoreError::RecordNotFound(id));
        }
        self.records.rewrite_all(all).await;

        self.bus.publish(CoreEvent::RecordsChanged);
        Ok(())
    }

    /// Ends the running session now. Returns the stopped record, or `None` when nothing runs.
    pub async fn stop_current_record(&self) -> Option<Record> {
        let _guard = self.mutation.lock().await;
        let last = self.records.last_record().await?;
        let Some(duration) = stopped_duration(&last, self.clock.millis()) else {
            debug!("Record {} already ended, nothing to stop", last.id);
            return None;
        };

        let mut all = self.records.load().await;
        let stopped = all.iter_mut().find(|r| r.id == last.id).map(|r| {
            r.duration = duration;
            r.clone()
        })?;
        info!("Stopped record {}", stopped.id);
        self.records.rewrite_all(all).await;

        self.bus.publish(CoreEvent::RecordsChanged);
        Some(stopped)
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn save_settings(&self, patch: Value) -> CoreResult<Settings> {
        self.settings.save(patch)
    }

    /// Current status and icon. May fire the end-of-session cue.
    pub async fn status(&self) -> StatusSnapshot {
        let last = self.records.last_record().await;
        let settings = self.settings.get();
        let status = self
            .status
            .resolve(last.as_ref(), self.clock.millis(), &settings);
        let icon = self.icons.resolve(&status, &settings);
        StatusSnapshot { status, icon }
    }

    /// Recomputes the status and always broadcasts it.
    pub async fn sync_icon(&self) -> StatusSnapshot {
        let snapshot = self.status().await;
        *self.published.lock() = Some(snapshot.clone());
        self.bus.publish(CoreEvent::IconChanged(snapshot.clone()));
        snapshot
    }

    /// Recomputes the status and broadcasts it only when it differs from the last broadcast.
    pub async fn refresh(&self) -> StatusSnapshot {
        let snapshot = self.status().await;
        let changed = {
            let mut published = self.published.lock();
            let changed = published.as_ref() != Some(&snapshot);
            if changed {
                *published = Some(snapshot.clone());
            }
            changed
        };
        if changed {
            self.bus.publish(CoreEvent::IconChanged(snapshot.clone()));
        }
        snapshot
    }

    pub async fn save_manual_capture(&self, data_uri: &str) -> CoreResult<String> {
        self.screenshots
            .save_manual_capture(data_uri, self.clock.time())
            .await
    }

    pub fn resolve_screenshot(&self, reference: &str) -> Option<PathBuf> {
        self.screenshots.resolve_reference(reference)
    }
}

fn upsert(records: &mut Vec<Record>, record: Record) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}
