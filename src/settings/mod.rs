//! User configuration shared by the status and icon resolvers.

pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the idle entry inside a preset's override map.
pub const IDLE_KEY: &str = "Idle";

pub const DEFAULT_PRESET: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDefinition {
    pub name: String,
    #[serde(default)]
    pub color: String,
    /// Path of the icon shown while a session carries this tag.
    #[serde(default)]
    pub icon: Option<String>,
}

impl TagDefinition {
    fn builtin(name: &str, color: &str) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            icon: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowPosition {
    pub x: f64,
    pub y: f64,
}

/// Process-wide settings. Persisted values are merged over [Settings::default]; fields this
/// version doesn't know about are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub shortcut: String,
    pub auto_start: bool,
    pub ai_model: String,
    pub ai_api_key: String,
    pub tags: Vec<TagDefinition>,
    /// Active icon preset.
    pub icon_preset: String,
    /// preset -> tag name (or [IDLE_KEY]) -> icon path.
    pub preset_icons: BTreeMap<String, BTreeMap<String, String>>,
    /// Idle icon chosen before presets existed.
    pub current_idle_path: Option<String>,
    /// Per-tag icons chosen before presets existed.
    pub tag_icons: BTreeMap<String, String>,
    pub input_window_position: Option<WindowPosition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shortcut: "CommandOrControl+Shift+Space".into(),
            auto_start: false,
            ai_model: String::new(),
            ai_api_key: String::new(),
            tags: vec![
                TagDefinition::builtin("学习", "#4caf50"),
                TagDefinition::builtin("工作", "#2196f3"),
                TagDefinition::builtin("休息", "#ff9800"),
                TagDefinition::builtin("摸鱼", "#9e9e9e"),
            ],
            icon_preset: DEFAULT_PRESET.into(),
            preset_icons: BTreeMap::new(),
            current_idle_path: None,
            tag_icons: BTreeMap::new(),
            input_window_position: None,
            extra: Map::new(),
        }
    }
}

impl Settings {
    pub fn tag(&self, name: &str) -> Option<&TagDefinition> {
        self.tags.iter().find(|t| t.name == name)
    }

    /// Override map of the active preset.
    pub fn preset_overrides(&self) -> Option<&BTreeMap<String, String>> {
        self.preset_icons.get(&self.icon_preset)
    }
}
