//! Record store and session-status engine behind a desktop time-tracking pet.
//! Sessions are kept in a line-delimited JSON log; the current status and the avatar icon are
//! derived from the newest session, the clock and the settings.
//!

pub mod cli;
pub mod engine;
pub mod error;
pub mod events;
pub mod fs;
pub mod service;
pub mod settings;
pub mod status;
pub mod store;
pub mod utils;
