use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::utils::time::iso_from_millis;

/// One tracked activity, stored as a single JSON line.
///
/// `id` is the session start in epoch milliseconds and doubles as the primary and sort key.
/// `duration` keeps whatever number was stored; use
/// [Seconds::of](super::duration::Seconds::of) to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(deserialize_with = "record_id")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient")]
    pub task: String,
    #[serde(default, deserialize_with = "lenient")]
    pub desc: String,
    #[serde(default, deserialize_with = "lenient")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub duration: RawDuration,
    #[serde(default, deserialize_with = "lenient")]
    pub screenshots: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub is_focus: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub ai_summary: bool,
    /// Fields written by other collaborators. Kept so rewrites don't drop them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Creates an empty open-ended record starting at `id`.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            timestamp: iso_from_millis(id),
            task: String::new(),
            desc: String::new(),
            tags: vec![],
            duration: RawDuration::OPEN_ENDED,
            screenshots: vec![],
            is_focus: false,
            ai_summary: false,
            extra: Map::new(),
        }
    }

    pub fn with_task(self, task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..self
        }
    }

    pub fn with_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_duration(self, duration: RawDuration) -> Self {
        Self { duration, ..self }
    }

    pub fn with_focus(self, is_focus: bool) -> Self {
        Self { is_focus, ..self }
    }

    pub fn is_open_ended(&self) -> bool {
        self.duration.is_open_ended()
    }

    /// Fills in the derived `timestamp` when a stored entry lacks it.
    pub fn normalize(&mut self) {
        if self.timestamp.is_empty() {
            self.timestamp = iso_from_millis(self.id);
        }
    }

    /// Converts a parsed JSON value into a record. Entries without a usable `id` are discarded,
    /// other shape problems are logged and discarded as well.
    pub fn from_value(value: Value) -> Option<Record> {
        let has_id = value
            .get("id")
            .is_some_and(|id| parse_id(id).is_some());
        if !has_id {
            debug!("Discarding entry without id {value}");
            return None;
        }
        match serde_json::from_value::<Record>(value) {
            Ok(mut record) => {
                record.normalize();
                Some(record)
            }
            Err(e) => {
                warn!("Discarding malformed record: {e}");
                None
            }
        }
    }
}

/// Stored duration exactly as found on disk. The unit depends on when the record was written,
/// so the only way to read it is through [Seconds](super::duration::Seconds).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct RawDuration(f64);

impl RawDuration {
    /// Runs until an explicit stop. Only a stored `0` means this; a stored `1` is read as one
    /// unit of time because stopping always writes at least that much.
    pub const OPEN_ENDED: RawDuration = RawDuration(0.);

    pub fn new(value: f64) -> Self {
        if value.is_finite() {
            Self(value)
        } else {
            Self::OPEN_ENDED
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_open_ended(self) -> bool {
        self.0 == 0.
    }
}

impl From<u64> for RawDuration {
    fn from(value: u64) -> Self {
        Self(value as f64)
    }
}

impl Serialize for RawDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.0.fract() == 0. && self.0.abs() < i64::MAX as f64 {
            serializer.serialize_i64(self.0 as i64)
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for RawDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Anything that isn't a number (null, garbage strings) reads as 0.
        let value = Value::deserialize(deserializer)?;
        let number = match &value {
            Value::Number(n) => n.as_f64().unwrap_or_default(),
            Value::String(s) => s.trim().parse::<f64>().unwrap_or_default(),
            _ => 0.,
        };
        Ok(RawDuration::new(number))
    }
}

/// Partial update for an existing record. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    pub task: Option<String>,
    pub desc: Option<String>,
    pub tags: Option<Vec<String>>,
    pub duration: Option<RawDuration>,
    pub screenshots: Option<Vec<String>>,
    pub is_focus: Option<bool>,
    pub ai_summary: Option<bool>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        *self == RecordPatch::default()
    }

    pub fn touches_screenshots(&self) -> bool {
        self.screenshots.is_some()
    }

    pub fn apply_to(self, record: &mut Record) {
        let RecordPatch {
            task,
            desc,
            tags,
            duration,
            screenshots,
            is_focus,
            ai_summary,
        } = self;
        if let Some(task) = task {
            record.task = task;
        }
        if let Some(desc) = desc {
            record.desc = desc;
        }
        if let Some(tags) = tags {
            record.tags = tags;
        }
        if let Some(duration) = duration {
            record.duration = duration;
        }
        if let Some(screenshots) = screenshots {
            record.screenshots = screenshots;
        }
        if let Some(is_focus) = is_focus {
            record.is_focus = is_focus;
        }
        if let Some(ai_summary) = ai_summary {
            record.ai_summary = ai_summary;
        }
    }
}

fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn record_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_id(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid record id {value}")))
}

/// Treats `null` or a value of the wrong type the same as a missing field, so one bad field
/// never costs the whole record.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value.clone()).unwrap_or_else(|e| {
        warn!("Ignoring field value {value}: {e}");
        T::default()
    }))
}
