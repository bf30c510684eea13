use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{CoreError, CoreResult},
    events::{CoreEvent, EventBus},
    fs::operations::write_atomically,
    utils::clock::Clock,
};

use super::Settings;

/// Quiet period after the last patch before settings reach the disk.
pub const SETTINGS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Expensive OS-level operations owned by the UI collaborator.
#[cfg_attr(test, mockall::automock)]
pub trait SystemHooks: Send + Sync {
    fn register_shortcut(&self, shortcut: &str) -> anyhow::Result<()>;

    fn set_autostart(&self, enabled: bool) -> anyhow::Result<()>;
}

struct SharedSettings {
    path: PathBuf,
    current: RwLock<Settings>,
    dirty: AtomicBool,
}

impl SharedSettings {
    async fn persist(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let content = match serde_json::to_string_pretty(&*self.current.read()) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to serialize settings: {e}");
                return;
            }
        };
        match write_atomically(&self.path, content.as_bytes()).await {
            Ok(()) => debug!("Settings written to {:?}", self.path),
            Err(e) => error!("Failed to write settings to {:?}: {e:?}", self.path),
        }
    }
}

/// Cancellable delayed job. Arming again before the delay elapses replaces the pending job.
struct Debouncer {
    delay: Duration,
    clock: Arc<dyn Clock>,
    pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
    fn new(delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            delay,
            clock,
            pending: Mutex::new(None),
        }
    }

    fn arm<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending.lock().replace(token.clone()) {
            previous.cancel();
        }
        let clock = self.clock.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => (),
                _ = clock.sleep(delay) => job.await,
            }
        });
    }

    fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.cancel();
        }
    }
}

/// Owner of the settings file. Reads are served from memory, writes are coalesced.
pub struct SettingsStore {
    shared: Arc<SharedSettings>,
    hooks: Arc<dyn SystemHooks>,
    bus: EventBus,
    flush: Debouncer,
}

impl SettingsStore {
    /// Reads `path`, falling back to defaults when it's missing or unreadable.
    pub async fn load(
        path: PathBuf,
        hooks: Arc<dyn SystemHooks>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = read_settings(&path).await;
        Self {
            shared: Arc::new(SharedSettings {
                path,
                current: RwLock::new(settings),
                dirty: AtomicBool::new(false),
            }),
            hooks,
            bus,
            flush: Debouncer::new(SETTINGS_DEBOUNCE, clock),
        }
    }

    pub fn get(&self) -> Settings {
        self.shared.current.read().clone()
    }

    /// Merges the top-level fields of `patch` into the current settings, then broadcasts the
    /// result and schedules a write. A patch that doesn't fit leaves the settings untouched.
    pub fn save(&self, patch: Value) -> CoreResult<Settings> {
        let Value::Object(patch) = patch else {
            return Err(CoreError::SettingsPatchNotObject);
        };

        let updated = {
            let mut current = self.shared.current.write();
            let updated = merge(&current, &patch)?;
            *current = updated.clone();
            updated
        };
        self.shared.dirty.store(true, Ordering::SeqCst);

        self.apply_side_effects(&patch, &updated);
        self.bus.publish(CoreEvent::SettingsChanged(updated.clone()));

        let shared = self.shared.clone();
        self.flush.arm(async move { shared.persist().await });
        Ok(updated)
    }

    /// Writes pending changes right away. Used before the process exits.
    pub async fn flush_now(&self) {
        self.flush.cancel();
        self.shared.persist().await;
    }

    fn apply_side_effects(&self, patch: &Map<String, Value>, settings: &Settings) {
        if patch.contains_key("shortcut") {
            info!("Re-registering shortcut {}", settings.shortcut);
            if let Err(e) = self.hooks.register_shortcut(&settings.shortcut) {
                warn!("Failed to register shortcut {}: {e:?}", settings.shortcut);
            }
        }
        if patch.contains_key("autoStart") {
            info!("Setting autostart to {}", settings.auto_start);
            if let Err(e) = self.hooks.set_autostart(settings.auto_start) {
                warn!("Failed to toggle autostart: {e:?}");
            }
        }
    }
}

fn merge(current: &Settings, patch: &Map<String, Value>) -> CoreResult<Settings> {
    let mut merged = serde_json::to_value(current).map_err(CoreError::InvalidSettings)?;
    if let Value::Object(fields) = &mut merged {
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(merged).map_err(CoreError::InvalidSettings)
}

async fn read_settings(path: &Path) -> Settings {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("No settings at {path:?}, using defaults");
            return Settings::default();
        }
        Err(e) => {
            warn!("Failed to read settings from {path:?}, using defaults: {e}");
            return Settings::default();
        }
    };
    let fields = match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            warn!("Settings at {path:?} are not an object, using defaults: {other}");
            return Settings::default();
        }
        Err(e) => {
            warn!("Settings at {path:?} are malformed, using defaults: {e}");
            return Settings::default();
        }
    };

    // Merged key by key so a single bad value only resets itself.
    let mut settings = Settings::default();
    for (key, value) in fields {
        let single = Map::from_iter([(key.clone(), value)]);
        match merge(&settings, &single) {
            Ok(merged) => settings = merged,
            Err(e) => warn!("Ignoring setting {key} from {path:?}: {e}"),
        }
    }
    settings
}
