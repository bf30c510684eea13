use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    settings::Settings,
    store::{
        duration::Seconds,
        entities::{RawDuration, Record},
    },
};

use super::{builtin_tag, prioritized_tags, Activity, SessionStatus};

/// A focus session that ended longer ago than this is marked as handled without a cue, so
/// starting the app after a countdown expired stays silent.
const CUE_STALENESS_MS: i64 = 60_000;

/// End-of-session effect, e.g. a sound. Owned by the UI collaborator.
#[cfg_attr(test, mockall::automock)]
pub trait SessionCue: Send + Sync {
    fn session_finished(&self, record: &Record);
}

/// Epoch milliseconds at which `record` stops being active, `None` for open-ended sessions.
pub fn end_millis(record: &Record) -> Option<i64> {
    if record.is_open_ended() {
        return None;
    }
    Some(record.id.saturating_add(Seconds::of(record).as_millis()))
}

/// Whether `record` is still running at `now_ms`. The session ends exactly at its end instant.
pub fn is_active_at(record: &Record, now_ms: i64) -> bool {
    end_millis(record).map_or(true, |end| now_ms < end)
}

/// Duration to store when `record` is stopped at `now_ms`, or `None` when it already ended.
pub fn stopped_duration(record: &Record, now_ms: i64) -> Option<RawDuration> {
    is_active_at(record, now_ms)
        .then(|| Seconds::elapsed_between(record.id, now_ms).encode_for(record.id))
}

/// Duration that closes an open-ended `previous` record when a session starting at `next_id`
/// begins. `None` when `previous` isn't open-ended or doesn't start earlier.
pub fn closing_duration(previous: &Record, next_id: i64) -> Option<RawDuration> {
    (previous.is_open_ended() && next_id > previous.id)
        .then(|| Seconds::elapsed_between(previous.id, next_id).encode_for(previous.id))
}

/// Derives Idle/Active from the newest record and fires the end-of-session cue once per focus
/// record.
pub struct SessionStatusResolver {
    cue: Arc<dyn SessionCue>,
    cued: Mutex<HashSet<i64>>,
}

impl SessionStatusResolver {
    pub fn new(cue: Arc<dyn SessionCue>) -> Self {
        Self {
            cue,
            cued: Mutex::new(HashSet::new()),
        }
    }

    /// Side-effect free part of [SessionStatusResolver::resolve].
    pub fn evaluate(record: Option<&Record>, now_ms: i64, settings: &Settings) -> SessionStatus {
        let Some(record) = record else {
            return SessionStatus::Idle;
        };
        if !is_active_at(record, now_ms) {
            return SessionStatus::Idle;
        }

        let tag = prioritized_tags(&record.tags, settings)
            .first()
            .map(|t| t.to_string());
        let activity = match tag.as_deref() {
            Some(name) => builtin_tag(name).map_or(Activity::Custom, |b| b.activity),
            None => Activity::Untagged,
        };
        let elapsed_seconds = (now_ms.saturating_sub(record.id).max(0) / 1000) as u64;
        let remaining_seconds =
            end_millis(record).map(|end| (end.saturating_sub(now_ms).max(0) as u64).div_ceil(1000));

        SessionStatus::Active {
            record_id: record.id,
            activity,
            tag,
            tags: record.tags.clone(),
            elapsed_seconds,
            remaining_seconds,
            focus: record.is_focus,
        }
    }

    pub fn resolve(&self, record: Option<&Record>, now_ms: i64, settings: &Settings) -> SessionStatus {
        let status = Self::evaluate(record, now_ms, settings);
        if let (SessionStatus::Idle, Some(record)) = (&status, record) {
            self.cue_if_finished(record, now_ms);
        }
        status
    }

    fn cue_if_finished(&self, record: &Record, now_ms: i64) {
        if !record.is_focus {
            return;
        }
        let Some(end) = end_millis(record) else {
            return;
        };
        if !self.cued.lock().insert(record.id) {
            return;
        }
        if now_ms.saturating_sub(end) > CUE_STALENESS_MS {
            debug!("Focus session {} ended long ago, skipping the cue", record.id);
            return;
        }
        info!("Focus session {} finished", record.id);
        self.cue.session_finished(record);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        settings::{Settings, TagDefinition},
        status::{Activity, SessionStatus},
        store::{duration::Seconds, entities::Record},
    };

    use super::{closing_duration, stopped_duration, MockSessionCue, SessionStatusResolver};

    const START: i64 = 1_740_000_000_000;

    fn silent() -> SessionStatusResolver {
        let mut cue = MockSessionCue::new();
        cue.expect_session_finished().never();
        SessionStatusResolver::new(Arc::new(cue))
    }

    fn timed(seconds: u64) -> Record {
        Record::new(START).with_duration(Seconds::new(seconds).encode_for(START))
    }

    #[test]
    fn test_no_record_is_idle() {
        assert_eq!(
            silent().resolve(None, START, &Settings::default()),
            SessionStatus::Idle
        );
    }

    #[test]
    fn test_open_ended_is_active_forever() {
        let record = Record::new(START).with_tags(["工作"]);
        let years_later = START + 3 * 365 * 86_400_000;
        let status = silent().resolve(Some(&record), years_later, &Settings::default());
        match status {
            SessionStatus::Active {
                activity,
                remaining_seconds,
                ..
            } => {
                assert_eq!(activity, Activity::Working);
                assert_eq!(remaining_seconds, None);
            }
            SessionStatus::Idle => panic!("open-ended session must stay active"),
        }
    }

    #[test]
    fn test_timed_session_ends_exactly_at_end() {
        let record = timed(60);
        let settings = Settings::default();
        let resolver = silent();
        assert!(resolver.resolve(Some(&record), START + 59_999, &settings).is_active());
        assert_eq!(
            resolver.resolve(Some(&record), START + 60_000, &settings),
            SessionStatus::Idle
        );
    }

    #[test]
    fn test_remaining_and_elapsed() {
        let record = timed(1500).with_tags(["学习"]);
        let status =
            SessionStatusResolver::evaluate(Some(&record), START + 100_500, &Settings::default());
        assert_eq!(
            status,
            SessionStatus::Active {
                record_id: START,
                activity: Activity::Studying,
                tag: Some("学习".into()),
                tags: vec!["学习".into()],
                elapsed_seconds: 100,
                remaining_seconds: Some(1400),
                focus: false,
            }
        );
    }

    #[test]
    fn test_activity_uses_fixed_precedence() {
        let record = Record::new(START).with_tags(["摸鱼", "休息"]);
        match SessionStatusResolver::evaluate(Some(&record), START, &Settings::default()) {
            SessionStatus::Active { activity, .. } => assert_eq!(activity, Activity::Resting),
            SessionStatus::Idle => panic!("expected active"),
        }
    }

    #[test]
    fn test_custom_and_untagged_activities() {
        let mut settings = Settings::default();
        settings.tags.push(TagDefinition {
            name: "阅读".into(),
            color: "#123456".into(),
            icon: None,
        });

        let custom = Record::new(START).with_tags(["unknown", "阅读"]);
        match SessionStatusResolver::evaluate(Some(&custom), START, &settings) {
            SessionStatus::Active { activity, tag, .. } => {
                assert_eq!(activity, Activity::Custom);
                assert_eq!(tag.as_deref(), Some("阅读"));
            }
            SessionStatus::Idle => panic!("expected active"),
        }

        let untagged = Record::new(START).with_tags(["unknown"]);
        match SessionStatusResolver::evaluate(Some(&untagged), START, &settings) {
            SessionStatus::Active { activity, tag, .. } => {
                assert_eq!(activity, Activity::Untagged);
                assert_eq!(tag, None);
            }
            SessionStatus::Idle => panic!("expected active"),
        }
    }

    #[test]
    fn test_focus_cue_fires_once() {
        let record = timed(25 * 60).with_focus(true);
        let mut cue = MockSessionCue::new();
        cue.expect_session_finished()
            .withf(|finished| finished.id == START)
            .times(1)
            .return_const(());
        let resolver = SessionStatusResolver::new(Arc::new(cue));
        let settings = Settings::default();
        let end = START + 25 * 60_000;

        resolver.resolve(Some(&record), end - 1_000, &settings);
        for tick in 0..5 {
            resolver.resolve(Some(&record), end + tick * 1_000, &settings);
        }
    }

    #[test]
    fn test_stale_focus_session_is_silent() {
        let record = timed(60).with_focus(true);
        let resolver = silent();
        let settings = Settings::default();
        resolver.resolve(Some(&record), START + 86_400_000, &settings);
        resolver.resolve(Some(&record), START + 86_401_000, &settings);
    }

    #[test]
    fn test_non_focus_session_is_silent() {
        let record = timed(60);
        silent().resolve(Some(&record), START + 61_000, &Settings::default());
    }

    #[test]
    fn test_stop_sets_elapsed_with_floor_of_one() {
        let open = Record::new(START);
        let raw = stopped_duration(&open, START + 90_700).unwrap();
        assert_eq!(Seconds::decode(START, raw).get(), 90);

        let raw = stopped_duration(&open, START + 200).unwrap();
        assert_eq!(Seconds::decode(START, raw).get(), 1);
        assert!(!raw.is_open_ended());

        let running = timed(600);
        let raw = stopped_duration(&running, START + 30_000).unwrap();
        assert_eq!(Seconds::decode(START, raw).get(), 30);

        assert_eq!(stopped_duration(&running, START + 600_000), None);
    }

    #[test]
    fn test_closing_previous_open_ended_record() {
        let previous = Record::new(START);
        let raw = closing_duration(&previous, START + 125_999).unwrap();
        assert_eq!(Seconds::decode(START, raw).get(), 125);

        assert_eq!(closing_duration(&previous, START), None);
        assert_eq!(closing_duration(&timed(60), START + 120_000), None);
        assert_eq!(
            closing_duration(&previous, START + 10),
            Some(Seconds::new(1).encode_for(START))
        );
        assert_eq!(closing_duration(&previous, START - 1), None);
    }
}
