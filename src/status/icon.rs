use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::settings::{Settings, DEFAULT_PRESET, IDLE_KEY};

use super::{builtin_tag, prioritized_tags, SessionStatus};

/// Idle assets shipped with the app. A legacy idle path pointing at one of them carries no user
/// choice.
pub const BUILTIN_IDLE_ASSETS: [&str; 2] = ["idle.png", "idle_pixel.png"];

const DEFAULT_IDLE_ASSET: &str = BUILTIN_IDLE_ASSETS[0];

#[cfg_attr(test, mockall::automock)]
pub trait AssetProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

pub struct FsAssetProbe;

impl AssetProbe for FsAssetProbe {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Picks the avatar image for a status. Never fails: every candidate is probed and a missing
/// file moves on to the next one.
pub struct IconResolver {
    asset_dir: PathBuf,
    probe: Box<dyn AssetProbe>,
}

impl IconResolver {
    pub fn new(asset_dir: PathBuf, probe: Box<dyn AssetProbe>) -> Self {
        Self { asset_dir, probe }
    }

    pub fn resolve(&self, status: &SessionStatus, settings: &Settings) -> PathBuf {
        let suffix = preset_suffix(&settings.icon_preset);
        let resolved = match status {
            SessionStatus::Idle => self.idle_icon(settings, &suffix),
            SessionStatus::Active { tags, .. } => self
                .tag_icon(tags, settings, &suffix)
                .or_else(|| self.base_idle(&suffix)),
        };
        resolved.unwrap_or_else(|| {
            warn!("No icon asset found, falling back to {DEFAULT_IDLE_ASSET}");
            self.asset_dir.join(DEFAULT_IDLE_ASSET)
        })
    }

    fn idle_icon(&self, settings: &Settings, suffix: &str) -> Option<PathBuf> {
        let preset = settings
            .preset_overrides()
            .and_then(|overrides| overrides.get(IDLE_KEY))
            .and_then(|p| self.candidate(p));
        let legacy = || {
            settings
                .current_idle_path
                .as_deref()
                .filter(|p| !is_builtin_idle(p))
                .and_then(|p| self.candidate(p))
        };
        preset.or_else(legacy).or_else(|| self.base_idle(suffix))
    }

    fn tag_icon(&self, tags: &[String], settings: &Settings, suffix: &str) -> Option<PathBuf> {
        prioritized_tags(tags, settings)
            .into_iter()
            .find_map(|tag| self.icon_for_tag(tag, settings, suffix))
    }

    fn icon_for_tag(&self, tag: &str, settings: &Settings, suffix: &str) -> Option<PathBuf> {
        let preset = settings
            .preset_overrides()
            .and_then(|overrides| overrides.get(tag));
        let legacy = settings.tag_icons.get(tag);
        let custom = settings.tag(tag).and_then(|t| t.icon.as_ref());
        let stem = builtin_tag(tag).map_or(tag, |b| b.slug);
        let convention = format!("{stem}{suffix}.png");

        [preset, legacy, custom]
            .into_iter()
            .flatten()
            .find_map(|p| self.candidate(p))
            .or_else(|| self.candidate(&convention))
    }

    fn base_idle(&self, suffix: &str) -> Option<PathBuf> {
        self.candidate(&format!("idle{suffix}.png"))
    }

    fn candidate(&self, raw: &str) -> Option<PathBuf> {
        if raw.is_empty() {
            return None;
        }
        let path = Path::new(raw);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.asset_dir.join(path)
        };
        if self.probe.exists(&path) {
            Some(path)
        } else {
            debug!("Icon {path:?} is missing");
            None
        }
    }
}

fn preset_suffix(preset: &str) -> String {
    if preset.is_empty() || preset == DEFAULT_PRESET {
        String::new()
    } else {
        format!("_{preset}")
    }
}

fn is_builtin_idle(raw: &str) -> bool {
    Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| BUILTIN_IDLE_ASSETS.contains(&name))
}
