//! Derived session state. Nothing here is persisted: status and icon are recomputed from the
//! newest record, the current time and the settings whenever someone asks.

pub mod icon;
pub mod resolver;

use std::path::PathBuf;

use serde::Serialize;

use crate::settings::Settings;

/// Tag that has a dedicated activity, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinTag {
    pub name: &'static str,
    /// Stem of the convention-based icon file.
    pub slug: &'static str,
    pub activity: Activity,
}

/// When a record carries several of these, the earlier entry wins regardless of the order of the
/// record's own tags.
pub const BUILTIN_TAGS: [BuiltinTag; 4] = [
    BuiltinTag {
        name: "学习",
        slug: "study",
        activity: Activity::Studying,
    },
    BuiltinTag {
        name: "工作",
        slug: "work",
        activity: Activity::Working,
    },
    BuiltinTag {
        name: "休息",
        slug: "rest",
        activity: Activity::Resting,
    },
    BuiltinTag {
        name: "摸鱼",
        slug: "slack",
        activity: Activity::Slacking,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Activity {
    Studying,
    Working,
    Resting,
    Slacking,
    /// A user-defined tag from the settings.
    Custom,
    Untagged,
}

pub fn builtin_tag(name: &str) -> Option<&'static BuiltinTag> {
    BUILTIN_TAGS.iter().find(|t| t.name == name)
}

/// Recognized tags of a record in precedence order: built-in tags by their fixed priority, then
/// tags configured in the settings in the record's own order. Unknown tags are ignored.
pub fn prioritized_tags<'a>(tags: &'a [String], settings: &Settings) -> Vec<&'a str> {
    let builtin = BUILTIN_TAGS
        .iter()
        .filter_map(|b| tags.iter().find(|t| *t == b.name))
        .map(String::as_str);
    let custom = tags
        .iter()
        .filter(|t| builtin_tag(t).is_none() && settings.tag(t).is_some())
        .map(String::as_str);
    let mut ordered: Vec<&str> = builtin.chain(custom).collect();
    ordered.dedup();
    ordered
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum SessionStatus {
    Idle,
    #[serde(rename_all = "camelCase")]
    Active {
        record_id: i64,
        activity: Activity,
        /// Tag the activity was chosen from.
        tag: Option<String>,
        /// All tags of the record, for icon resolution.
        tags: Vec<String>,
        elapsed_seconds: u64,
        /// `None` for open-ended sessions.
        remaining_seconds: Option<u64>,
        focus: bool,
    },
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active { .. })
    }
}

/// What the UI needs to redraw the avatar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub icon: PathBuf,
}
