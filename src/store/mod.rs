//! Persistence of tracked activities.
//!
//!  - Records live in one line-delimited JSON log ([record_log::RecordLog]).
//!  - Stored durations are unit-ambiguous and are only read through [duration::Seconds].
//!  - The legacy single-array file is converted once at startup ([migration]).
//!  - Inline screenshots are moved into date-bucketed files before a record is persisted
//!    ([screenshots]).

pub mod duration;
pub mod entities;
pub mod migration;
pub mod record_log;
pub mod screenshots;
pub mod writer;
