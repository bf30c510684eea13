use std::io::Write;

use tracing::info;

use crate::{
    settings::store::SystemHooks,
    status::resolver::SessionCue,
    store::entities::Record,
};

/// A terminal can't own a global shortcut or a login item. The request is logged so the desktop
/// shell reading the same settings file can pick it up.
pub struct LoggedHooks;

impl SystemHooks for LoggedHooks {
    fn register_shortcut(&self, shortcut: &str) -> anyhow::Result<()> {
        info!("Shortcut {shortcut} requested, registration is left to the desktop shell");
        Ok(())
    }

    fn set_autostart(&self, enabled: bool) -> anyhow::Result<()> {
        info!("Autostart {enabled} requested, registration is left to the desktop shell");
        Ok(())
    }
}

/// Rings the terminal bell when a focus session ends.
pub struct TerminalBell;

impl SessionCue for TerminalBell {
    fn session_finished(&self, record: &Record) {
        let mut stdout = std::io::stdout().lock();
        let label = if record.task.is_empty() {
            "Focus session"
        } else {
            record.task.as_str()
        };
        let _ = writeln!(stdout, "\x07{label} finished");
        let _ = stdout.flush();
    }
}
